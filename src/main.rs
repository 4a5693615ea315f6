// =============================================================================
// krx-engine: the resident scheduler daemon
// =============================================================================
//
// Ticks on the configured cadence (default 10 minutes): refreshes the daily
// universe from 07:00, and inside [08:50, 15:20] on weekdays publishes a
// score snapshot and runs every enabled user against it. SIGINT/SIGTERM
// finishes the in-flight tick and removes the PID file before exiting.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use krx_engine::clock::SystemClock;
use krx_engine::journal::TradeJournal;
use krx_engine::marketdata::FileProvider;
use krx_engine::{Engine, EngineConfig};

#[derive(Debug, Parser)]
#[command(name = "krx-engine", about = "KRX intraday auto-trading engine daemon")]
struct Args {
    /// Engine config file (JSON).
    #[arg(long, default_value = "engine.json")]
    config: String,

    /// Market-data drop directory.
    #[arg(long, env = "KRX_MARKET_DATA_DIR", default_value = "marketdata")]
    market_data: String,

    /// Journal every decision but place no orders.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = EngineConfig::load(&args.config).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load engine config, using defaults");
        EngineConfig::default()
    });

    info!(
        tick_interval_minutes = config.tick_interval_minutes,
        db = %config.db_path.display(),
        dry_run = args.dry_run,
        "krx-engine starting"
    );

    let journal =
        TradeJournal::open(&config.db_path).context("failed to open trade journal")?;
    let provider = Arc::new(FileProvider::new(&args.market_data));
    let clock = Arc::new(SystemClock);

    let engine = Arc::new(Engine::new(config, journal, provider, clock, args.dry_run));

    engine
        .run_daemon()
        .await
        .context("scheduler daemon failed")?;

    info!("krx-engine shut down complete");
    Ok(())
}
