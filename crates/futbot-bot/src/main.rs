//! Futures exit bot - Entry Point
//!
//! With `paper.replay_file` set the bot replays the file and reports;
//! otherwise it monitors the paper position until Ctrl-C.

use anyhow::Result;
use clap::Parser;
use futbot_core::{Clock, ClockService};
use tracing::info;

/// Futures exit bot
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via FUTBOT_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    /// Replay file, overrides `paper.replay_file`
    #[arg(short, long)]
    replay: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    futbot_telemetry::init_logging()?;

    info!("Starting futbot v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > FUTBOT_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("FUTBOT_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");
    let config = futbot_bot::AppConfig::from_file(&config_path)?;
    info!(exit_mode = ?config.paper.exit_mode, "Configuration loaded");

    match args.replay.or_else(|| config.paper.replay_file.clone()) {
        Some(replay_path) => {
            let start_ms = ClockService::new().now_ms();
            let mut app = futbot_bot::Application::with_manual_clock(config, start_ms)?;
            app.open_paper_position()?;
            let summary = app.replay_file(&replay_path).await?;
            app.report(Some(&summary))?;
        }
        None => {
            let mut app = futbot_bot::Application::new(config)?;
            app.open_paper_position()?;
            app.run_until_shutdown().await?;
        }
    }

    Ok(())
}
