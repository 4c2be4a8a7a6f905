//! Bridge configuration and worker launch parameters.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Fully-qualified entry point of the SCIFIO pipe worker.
pub const SCIFIO_ENTRY_POINT: &str = "loci.formats.itk.ITKBridgePipes";

/// Worker mode argument: serve commands from stdin until it closes.
pub const WAIT_FOR_INPUT: &str = "waitForInput";

const DEFAULT_JAVA_HEAP: &str = "256m";

/// Largest slice of a plane written before waiting for an acknowledgement.
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Line terminator used by the worker in its responses.
///
/// Decided once per bridge; every response parser goes through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
}

impl LineEnding {
    /// CRLF on Windows (the JVM's `println` convention there), LF elsewhere.
    pub fn platform_default() -> Self {
        if cfg!(windows) { Self::CrLf } else { Self::Lf }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lf => "\n",
            Self::CrLf => "\r\n",
        }
    }

    /// Sentinel closing every response: an empty line.
    pub fn terminator(self) -> &'static [u8] {
        match self {
            Self::Lf => b"\n\n",
            Self::CrLf => b"\r\n\r\n",
        }
    }
}

impl Default for LineEnding {
    fn default() -> Self {
        Self::platform_default()
    }
}

/// Opaque launch parameters for the worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Build the SCIFIO worker command line from `SCIFIO_PATH`, `JAVA_HOME`
    /// and `SCIFIO_JAVA_HEAP`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let scifio_path = non_empty("SCIFIO_PATH").ok_or(ConfigError::MissingVar {
            name: "SCIFIO_PATH",
            hint: "it must point to the directory containing the SCIFIO JAR files",
        })?;
        let classpath = format!("{scifio_path}/*");

        let java = match non_empty("JAVA_HOME") {
            Some(home) => PathBuf::from(home)
                .join("bin")
                .join("java")
                .to_string_lossy()
                .into_owned(),
            None => {
                tracing::warn!("JAVA_HOME not set; assuming java is on the PATH");
                "java".to_string()
            }
        };

        let heap = non_empty("SCIFIO_JAVA_HEAP").unwrap_or_else(|| DEFAULT_JAVA_HEAP.to_string());
        if !is_java_memory_size(&heap) {
            return Err(ConfigError::InvalidVar {
                name: "SCIFIO_JAVA_HEAP",
                reason: format!("{heap:?} is not a JVM memory size such as 256m or 2g"),
            });
        }

        let command = Self::new(java).args([
            format!("-Xmx{heap}"),
            "-Djava.awt.headless=true".to_string(),
            "-cp".to_string(),
            classpath,
            SCIFIO_ENTRY_POINT.to_string(),
            WAIT_FOR_INPUT.to_string(),
        ]);

        tracing::debug!(program = %command.program, args = ?command.args, "Worker command");
        Ok(command)
    }
}

fn is_java_memory_size(value: &str) -> bool {
    let digits = value.trim_end_matches(['k', 'K', 'm', 'M', 'g', 'G']);
    let suffix_len = value.len() - digits.len();
    suffix_len <= 1 && !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Configuration for a [`Bridge`](crate::Bridge).
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub worker: WorkerCommand,
    pub line_ending: LineEnding,
    pub chunk_size: usize,
    /// Upper bound on a single wait for worker output. `None` waits forever.
    pub response_timeout: Option<Duration>,
    /// How long a freshly spawned worker must survive before it counts as running.
    pub startup_grace: Duration,
    /// How long `kill` waits after SIGTERM before force-killing.
    pub kill_grace: Duration,
    pub read_buffer_size: usize,
}

impl BridgeConfig {
    pub fn new(worker: WorkerCommand) -> Self {
        Self {
            worker,
            line_ending: LineEnding::platform_default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            response_timeout: None,
            startup_grace: Duration::ZERO,
            kill_grace: DEFAULT_KILL_GRACE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    /// SCIFIO worker from the environment, plus optional overrides from
    /// `SCIBRIDGE_CHUNK_SIZE` and `SCIBRIDGE_RESPONSE_TIMEOUT` (seconds).
    pub fn from_env() -> Result<Self, ConfigError> {
        let lookup = |name: &str| std::env::var(name).ok();
        let mut config = Self::new(WorkerCommand::from_lookup(lookup)?);

        if let Some(raw) = lookup("SCIBRIDGE_CHUNK_SIZE") {
            let chunk_size = raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ConfigError::InvalidVar {
                    name: "SCIBRIDGE_CHUNK_SIZE",
                    reason: format!("{raw:?} is not a positive integer"),
                })?;
            config.chunk_size = chunk_size;
        }

        if let Some(raw) = lookup("SCIBRIDGE_RESPONSE_TIMEOUT") {
            let secs = raw.parse::<f64>().ok().filter(|s| *s > 0.0).ok_or_else(|| {
                ConfigError::InvalidVar {
                    name: "SCIBRIDGE_RESPONSE_TIMEOUT",
                    reason: format!("{raw:?} is not a positive number of seconds"),
                }
            })?;
            config.response_timeout = Some(Duration::from_secs_f64(secs));
        }

        Ok(config)
    }

    pub fn with_line_ending(mut self, line_ending: LineEnding) -> Self {
        self.line_ending = line_ending;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn terminator_is_doubled_line_ending() {
        assert_eq!(LineEnding::Lf.terminator(), b"\n\n");
        assert_eq!(LineEnding::CrLf.terminator(), b"\r\n\r\n");
    }

    #[test]
    fn scifio_command_from_env() {
        let command = WorkerCommand::from_lookup(lookup(&[
            ("SCIFIO_PATH", "/opt/scifio/jars"),
            ("JAVA_HOME", "/usr/lib/jvm/java-8"),
        ]))
        .unwrap();

        assert_eq!(command.program, "/usr/lib/jvm/java-8/bin/java");
        assert_eq!(
            command.args,
            vec![
                "-Xmx256m",
                "-Djava.awt.headless=true",
                "-cp",
                "/opt/scifio/jars/*",
                "loci.formats.itk.ITKBridgePipes",
                "waitForInput",
            ]
        );
    }

    #[test]
    fn java_from_path_without_java_home() {
        let command = WorkerCommand::from_lookup(lookup(&[
            ("SCIFIO_PATH", "/jars"),
            ("SCIFIO_JAVA_HEAP", "2g"),
        ]))
        .unwrap();
        assert_eq!(command.program, "java");
        assert_eq!(command.args[0], "-Xmx2g");
    }

    #[test]
    fn missing_scifio_path_is_an_error() {
        let err = WorkerCommand::from_lookup(lookup(&[("SCIFIO_PATH", "")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingVar {
                name: "SCIFIO_PATH",
                ..
            }
        ));
    }

    #[test]
    fn rejects_malformed_heap() {
        let err = WorkerCommand::from_lookup(lookup(&[
            ("SCIFIO_PATH", "/jars"),
            ("SCIFIO_JAVA_HEAP", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidVar {
                name: "SCIFIO_JAVA_HEAP",
                ..
            }
        ));
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = BridgeConfig::new(WorkerCommand::new("worker"))
            .with_line_ending(LineEnding::CrLf)
            .with_chunk_size(0)
            .with_response_timeout(Some(Duration::from_secs(5)));

        assert_eq!(config.line_ending, LineEnding::CrLf);
        assert_eq!(config.chunk_size, 1);
        assert_eq!(config.response_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.kill_grace, DEFAULT_KILL_GRACE);
    }
}
