//! scibridge CLI - inspect and convert images through a SCIFIO pipe worker
//!
//! Usage:
//!   scibridge can-read <path>
//!   scibridge info <path> [--metadata]
//!   scibridge read <path> --output <raw-file>
//!   scibridge can-write <path>
//!   scibridge convert <source> <destination>
//!
//! The worker is configured from SCIFIO_PATH, JAVA_HOME and SCIFIO_JAVA_HEAP.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use scibridge::{Bridge, BridgeConfig, IoRegion, LineEnding, region_len};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "scibridge")]
#[command(about = "Read, inspect and convert microscopy images through a SCIFIO worker")]
#[command(version)]
struct Cli {
    /// Largest slice of a plane sent before waiting for an acknowledgement
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    /// Give up when the worker stays silent for this many seconds
    #[arg(long, global = true)]
    timeout: Option<f64>,

    /// Expect CRLF line endings from the worker
    #[arg(long, global = true)]
    crlf: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check whether the worker can read a file
    CanRead { path: String },

    /// Print the image description as JSON
    Info {
        path: String,

        /// Include the full metadata dictionary
        #[arg(long)]
        metadata: bool,
    },

    /// Dump all pixels of an image as raw bytes
    Read {
        path: String,

        /// Destination for the raw pixel data
        #[arg(short, long)]
        output: String,
    },

    /// Check whether the worker can write a file
    CanWrite { path: String },

    /// Read an image and write it back out in the format implied by the destination
    Convert { source: String, destination: String },
}

impl Cli {
    fn bridge_config(&self) -> anyhow::Result<BridgeConfig> {
        let mut config = BridgeConfig::from_env().context("failed to configure the worker")?;
        if let Some(chunk_size) = self.chunk_size {
            config = config.with_chunk_size(chunk_size);
        }
        if let Some(secs) = self.timeout {
            if !(secs > 0.0 && secs.is_finite()) {
                bail!("--timeout must be a positive number of seconds");
            }
            config = config.with_response_timeout(Some(Duration::from_secs_f64(secs)));
        }
        if self.crlf {
            config = config.with_line_ending(LineEnding::CrLf);
        }
        Ok(config)
    }
}

/// Log to stderr. `RUST_LOG` wins; otherwise `SCIBRIDGE_LOG` picks the level
/// for scibridge targets. `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("SCIBRIDGE_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!("scibridge={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.bridge_config()?;
    tracing::debug!(
        program = %config.worker.program,
        chunk_size = config.chunk_size,
        "Starting bridge"
    );
    let mut bridge = Bridge::new(config);

    let result = match cli.command {
        Commands::CanRead { path } => cmd_can_read(&mut bridge, &path).await,
        Commands::Info { path, metadata } => cmd_info(&mut bridge, &path, metadata).await,
        Commands::Read { path, output } => cmd_read(&mut bridge, &path, &output).await,
        Commands::CanWrite { path } => cmd_can_write(&mut bridge, &path).await,
        Commands::Convert {
            source,
            destination,
        } => cmd_convert(&mut bridge, &source, &destination).await,
    };

    bridge.reset().await;
    result
}

async fn cmd_can_read(bridge: &mut Bridge, path: &str) -> anyhow::Result<()> {
    let readable = bridge
        .can_read_file(path)
        .await
        .with_context(|| format!("canRead {path}"))?;
    println!("{readable}");
    Ok(())
}

async fn cmd_can_write(bridge: &mut Bridge, path: &str) -> anyhow::Result<()> {
    let writable = bridge
        .can_write_file(path)
        .await
        .with_context(|| format!("canWrite {path}"))?;
    println!("{writable}");
    Ok(())
}

async fn cmd_info(bridge: &mut Bridge, path: &str, with_metadata: bool) -> anyhow::Result<()> {
    let info = bridge
        .read_image_information(path)
        .await
        .with_context(|| format!("failed to read image information from {path}"))?;

    let json = if with_metadata {
        serde_json::json!({ "info": info, "metadata": bridge.metadata() })
    } else {
        serde_json::to_value(&info)?
    };
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

async fn cmd_read(bridge: &mut Bridge, path: &str, output: &str) -> anyhow::Result<()> {
    let info = bridge
        .read_image_information(path)
        .await
        .with_context(|| format!("failed to read image information from {path}"))?;
    let region = IoRegion::full(&info);
    let mut pixels = vec![0u8; region_len(&info, &region)?];

    bridge
        .read(path, &info, &region, &mut pixels)
        .await
        .with_context(|| format!("failed to read pixels from {path}"))?;

    tokio::fs::write(output, &pixels)
        .await
        .with_context(|| format!("failed to write {output}"))?;
    tracing::info!(path, output, bytes = pixels.len(), "Pixels written");
    Ok(())
}

async fn cmd_convert(bridge: &mut Bridge, source: &str, destination: &str) -> anyhow::Result<()> {
    if !bridge.can_write_file(destination).await? {
        bail!("no writer available for {destination}");
    }

    let info = bridge
        .read_image_information(source)
        .await
        .with_context(|| format!("failed to read image information from {source}"))?;
    let region = IoRegion::full(&info);
    let mut pixels = vec![0u8; region_len(&info, &region)?];
    bridge
        .read(source, &info, &region, &mut pixels)
        .await
        .with_context(|| format!("failed to read pixels from {source}"))?;

    let stats = bridge
        .write(destination, &info, &region, &pixels)
        .await
        .with_context(|| format!("failed to write {destination}"))?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "scibridge",
            "convert",
            "/in.lsm",
            "/out.ome.tif",
            "--chunk-size",
            "4096",
            "--crlf",
        ])
        .unwrap();

        assert_eq!(cli.chunk_size, Some(4096));
        assert!(cli.crlf);
        assert!(matches!(
            cli.command,
            Commands::Convert { ref source, ref destination }
                if source == "/in.lsm" && destination == "/out.ome.tif"
        ));
    }

    #[test]
    fn read_requires_output() {
        assert!(Cli::try_parse_from(["scibridge", "read", "/in.tif"]).is_err());
    }
}
