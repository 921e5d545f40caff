use clap::{Parser, Subcommand, ValueEnum};

mod client;
mod commands;

use client::ApiClient;

#[derive(Parser)]
#[command(
    name = "carouselctl",
    about = "Carousel: inspect and steer container rotation",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Admin API base URL
    #[arg(long, global = true, env = "CAROUSEL_ENDPOINT", default_value = "http://127.0.0.1:9090")]
    endpoint: String,
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    format: Format,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Instances, roles, health and the current plan
    Status,
    /// Rotation metrics over the retention window
    Telemetry,
    /// Most recent rotation plans, newest first
    History {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Ask for a rotation now
    Rotate,
    /// Return a quarantined instance to standby
    Unquarantine {
        /// Instance name, e.g. web2
        name: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let client = ApiClient::new(&cli.endpoint)?;

    match cli.command {
        Commands::Status => commands::status(&client, cli.format).await,
        Commands::Telemetry => commands::telemetry(&client, cli.format).await,
        Commands::History { limit } => commands::history(&client, cli.format, limit).await,
        Commands::Rotate => commands::rotate(&client, cli.format).await,
        Commands::Unquarantine { name } => commands::unquarantine(&client, cli.format, &name).await,
    }
}
