// Foreman task controller
// Main entry point for the foreman binary

use clap::Parser;
use foreman_engine::cli::{Cli, Command};
use foreman_engine::config::Config;
use foreman_engine::handlers::{handle_history, handle_run, handle_status, OutputFormat};
use foreman_engine::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log > RUST_LOG > configured log_level
    init_telemetry(cli.log.as_deref(), &config.core.log_level);

    tracing::info!("Foreman v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Run { intent, approve } => handle_run(intent, approve, &config, format).await,
        Command::Status => handle_status(&config, format),
        Command::History { limit } => handle_history(limit, &config, format),
    }
}
