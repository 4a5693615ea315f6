// =============================================================================
// auto-trader: per-user trading ticks against the latest snapshot
// =============================================================================
//
//   auto-trader --all [--dry-run]           every enabled user
//   auto-trader --user-id 3 [--intraday]    one user
//
// Exit codes: 0 success, 1 argument error, 2 snapshot stale/missing,
// 3 broker auth failure, 4 partial completion (some users failed).
// =============================================================================

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use krx_engine::clock::SystemClock;
use krx_engine::journal::TradeJournal;
use krx_engine::marketdata::FileProvider;
use krx_engine::trader::TickStatus;
use krx_engine::{Engine, EngineConfig, EngineError};

#[derive(Debug, Parser)]
#[command(name = "auto-trader", about = "Run user trading ticks against the latest snapshot")]
struct Args {
    /// Process every enabled user.
    #[arg(long, conflicts_with = "user_id")]
    all: bool,

    /// Process a single user.
    #[arg(long)]
    user_id: Option<i64>,

    /// Intraday mode (the default; kept for compatibility with cron lines).
    #[arg(long)]
    intraday: bool,

    /// Journal every decision but place no orders.
    #[arg(long)]
    dry_run: bool,

    /// Fallback minimum buy score when the user has no DSL configured.
    #[arg(long, default_value_t = 75)]
    min_score: i32,

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

    if !args.all && args.user_id.is_none() {
        eprintln!("one of --all or --user-id is required");
        return ExitCode::from(1);
    }

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "auto-trader failed");
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

    let engine = Engine::new(config, journal.clone(), provider, clock, args.dry_run);

    // The tick consumes the snapshot the recorder published; stale or
    // missing aborts with exit code 2 rather than re-screening inline.
    let snapshot = Arc::new(engine.load_snapshot()?);
    info!(
        path = %snapshot.path.display(),
        rows = snapshot.rows.len(),
        degraded = snapshot.degraded,
        "snapshot loaded"
    );

    if let Some(user_id) = args.user_id {
        // Single user: check they exist and are enabled, then run.
        let users = journal.enabled_users()?;
        if !users.iter().any(|u| u.user_id == user_id) {
            error!(user_id, "user not found or not enabled");
            return Ok(ExitCode::from(1));
        }
        let summary = engine.run_users(snapshot, Some(user_id)).await?;
        let outcome = summary.outcomes.iter().find(|o| o.user_id == user_id);
        return Ok(match outcome {
            Some(o) => {
                info!(
                    user_id,
                    sells = o.sell_count,
                    buys = o.buy_count,
                    suggestions = o.suggestion_count,
                    status = ?o.status,
                    "user tick finished"
                );
                ExitCode::SUCCESS
            }
            None => ExitCode::from(3),
        });
    }

    // --all
    let summary = engine.run_users(snapshot, None).await?;
    for outcome in &summary.outcomes {
        let status = match &outcome.status {
            TickStatus::Completed => "completed".to_string(),
            TickStatus::Skipped(reason) => format!("skipped ({reason})"),
        };
        info!(
            user_id = outcome.user_id,
            sells = outcome.sell_count,
            buys = outcome.buy_count,
            suggestions = outcome.suggestion_count,
            status,
            "user result"
        );
    }

    if summary.is_partial_failure() {
        return Ok(ExitCode::from(4));
    }
    if summary.failed > 0 {
        return Ok(ExitCode::from(3));
    }
    Ok(ExitCode::SUCCESS)
}
