//! Error types for bridge operations.
//!
//! Every error is fatal to the operation that raised it. Transport errors also
//! tear the worker down so the next operation starts from a fresh process.

use crate::supervisor::WorkerState;

/// The worker could not be started or did not reach the running state.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to launch worker `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker is {state} right after launch{}", diagnostics_suffix(.diagnostics))]
    NotRunning {
        state: WorkerState,
        diagnostics: String,
    },
}

/// Lookup failures on the metadata dictionary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("{0} is not in the metadata dictionary")]
    MissingKey(String),
    #[error("metadata {key} = {value:?} is not a valid {expected}")]
    Parse {
        key: String,
        value: String,
        expected: &'static str,
    },
}

/// Invalid or missing environment configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is not set; {hint}")]
    MissingVar {
        name: &'static str,
        hint: &'static str,
    },
    #[error("invalid value for {name}: {reason}")]
    InvalidVar { name: &'static str, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// Worker pipes closed or the worker left the running state mid-exchange.
    #[error("'{operation}' exited abnormally (worker {state}){}", diagnostics_suffix(.diagnostics))]
    Transport {
        operation: &'static str,
        state: WorkerState,
        diagnostics: String,
    },

    /// The worker answered, but not in the expected shape.
    #[error("'{operation}' protocol error: {message}{}", diagnostics_suffix(.diagnostics))]
    Protocol {
        operation: &'static str,
        message: String,
        diagnostics: String,
    },

    #[error("{0} is not in the metadata dictionary")]
    MissingKey(String),

    #[error("metadata {key} = {value:?} is not a valid {expected}")]
    Parse {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("buffer holds {actual} bytes but {expected} are required")]
    BufferSize { expected: usize, actual: usize },

    #[error("invalid region: {0}")]
    InvalidRegion(String),

    /// An argument cannot be expressed on the line protocol.
    #[error("cannot send '{operation}': {message}")]
    InvalidCommand {
        operation: &'static str,
        message: String,
    },
}

impl BridgeError {
    pub(crate) fn transport(
        operation: &'static str,
        state: WorkerState,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self::Transport {
            operation,
            state,
            diagnostics: diagnostics.into(),
        }
    }

    pub(crate) fn protocol(
        operation: &'static str,
        message: impl Into<String>,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self::Protocol {
            operation,
            message: message.into(),
            diagnostics: diagnostics.into(),
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Captured worker stderr attached to this error, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::Transport { diagnostics, .. }
            | Self::Protocol { diagnostics, .. }
            | Self::Spawn(SpawnError::NotRunning { diagnostics, .. }) => Some(diagnostics),
            _ => None,
        }
    }
}

impl From<MetadataError> for BridgeError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::MissingKey(key) => Self::MissingKey(key),
            MetadataError::Parse {
                key,
                value,
                expected,
            } => Self::Parse {
                key,
                value,
                expected,
            },
        }
    }
}

fn diagnostics_suffix(diagnostics: &str) -> String {
    let trimmed = diagnostics.trim_end();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}
