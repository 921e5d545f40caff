//! carouseld — the Carousel daemon.
//!
//! Single binary that assembles every Carousel subsystem:
//! - Container runtime client + lifecycle manager
//! - Health checker and background monitor
//! - Proxy reconfigurer
//! - Rotation telemetry (redb-backed when configured)
//! - Rotation controller + jittered timer
//! - Admin API
//!
//! # Usage
//!
//! ```text
//! carouseld run --config /etc/carousel/carousel.toml
//! carouseld check-config --config /etc/carousel/carousel.toml
//! ```

mod daemon;

use std::path::PathBuf;

use carousel_core::OrchestratorConfig;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "carouseld", about = "Carousel rotation daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator until Ctrl-C.
    Run {
        /// Path to carousel.toml.
        #[arg(long, env = "CAROUSEL_CONFIG", default_value = "/etc/carousel/carousel.toml")]
        config: PathBuf,

        /// Log output format.
        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,
    },
    /// Parse and validate a configuration file, then exit.
    CheckConfig {
        #[arg(long, env = "CAROUSEL_CONFIG", default_value = "/etc/carousel/carousel.toml")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,carouseld=debug,carousel_rotation=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, log_format } => {
            init_tracing(log_format);
            let config = OrchestratorConfig::from_file(&config)?;
            daemon::run(config).await
        }
        Command::CheckConfig { config: path } => {
            let config = OrchestratorConfig::from_file(&path)?;
            println!(
                "{}: ok ({} instances, {} active, min_healthy {}, interval {:?}..{:?})",
                path.display(),
                config.instances.len(),
                config.rotation.active_count,
                config.rotation.min_healthy,
                config.rotation.interval_min,
                config.rotation.interval_max,
            );
            Ok(())
        }
    }
}
