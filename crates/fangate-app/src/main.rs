//! fangate - market-data fan-out gateway entry point.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Market-data fan-out gateway.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via FANGATE_CONFIG).
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    fangate_telemetry::init_logging()?;

    info!("Starting fangate v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.or_else(|| std::env::var("FANGATE_CONFIG").ok());
    let config = fangate_app::AppConfig::load(config_path.as_deref())?;
    info!(port = config.server.port, "Configuration loaded");

    let app = fangate_app::Application::new(config);
    app.run().await?;

    Ok(())
}
