// =============================================================================
// score-recorder: universe job and one-shot snapshot tick
// =============================================================================
//
//   score-recorder --filter                 pre-open universe job
//   score-recorder                          one snapshot tick
//   score-recorder --call-auto-trader       tick, then run all users
//   score-recorder --dry-run                tick without persisting orders
//
// Exit codes: 0 success, 1 argument error, 2 snapshot stale / universe
// missing, 3 broker auth failure, 4 partial completion.
// =============================================================================

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use krx_engine::clock::{Clock, SystemClock};
use krx_engine::journal::TradeJournal;
use krx_engine::marketdata::FileProvider;
use krx_engine::{Engine, EngineConfig, EngineError};

#[derive(Debug, Parser)]
#[command(name = "score-recorder", about = "Per-tick score snapshot recorder")]
struct Args {
    /// Pre-open mode: filter the listing into the daily universe file.
    #[arg(long)]
    filter: bool,

    /// Attach broker-side flow data (conclusion strength, investor flow).
    #[arg(long)]
    kis: bool,

    /// After publishing the snapshot, run every enabled user against it.
    #[arg(long)]
    call_auto_trader: bool,

    /// Compute and report, but do not let users place real orders.
    #[arg(long)]
    dry_run: bool,

    #[arg(long, default_value = "engine.json")]
    config: String,

    #[arg(long, env = "KRX_MARKET_DATA_DIR", default_value = "marketdata")]
    market_data: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "score-recorder failed");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode, EngineError> {
    let config = EngineConfig::load(&args.config).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load engine config, using defaults");
        EngineConfig::default()
    });

    let journal = TradeJournal::open(&config.db_path)?;
    let provider = Arc::new(FileProvider::new(&args.market_data));
    let clock = Arc::new(SystemClock);

    let engine = Engine::new(config, journal, provider, clock.clone(), args.dry_run);

    // --- Pre-open universe job ----------------------------------------------
    if args.filter {
        let count = engine.refresh_universe().await?;
        info!(count, "universe filtered and written");
        return Ok(ExitCode::SUCCESS);
    }

    // --- One snapshot tick ---------------------------------------------------
    if args.kis {
        // Flow enrichment needs per-user broker credentials; the resident
        // daemon wires it, the one-shot recorder proceeds without it.
        warn!("--kis flow enrichment not wired in one-shot mode; columns stay 0");
    }

    let outcome = engine.write_snapshot().await?;
    info!(
        path = %outcome.path.display(),
        rows = outcome.row_count,
        degraded = outcome.degraded,
        reused = outcome.reused,
        "snapshot tick done"
    );

    // --- Optional user fan-out ----------------------------------------------
    if args.call_auto_trader {
        if !clock.is_market_hours() {
            info!("outside market hours, skipping auto-trader chain");
            return Ok(ExitCode::SUCCESS);
        }
        let snapshot = Arc::new(engine.load_snapshot()?);
        let summary = engine.run_users(snapshot, None).await?;
        if summary.is_partial_failure() {
            return Ok(ExitCode::from(4));
        }
        if summary.failed > 0 {
            return Ok(ExitCode::from(3));
        }
    }

    Ok(ExitCode::SUCCESS)
}
