// =============================================================================
// Engine scheduler
// =============================================================================
//
// The market-day loop: on every tick inside [08:50, 15:20] on a weekday,
// publish a fresh score snapshot, then fan the per-user controllers out
// under an outer parallelism cap with a hard per-user deadline. A second
// pass inside the same minute is a no-op (the snapshot file name and the
// daily blacklist make it so).
//
// A user whose broker answers with a permanent error is latched off for the
// rest of the day without touching their stored settings.
// =============================================================================

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, Timelike};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::broker::kis::KisClient;
use crate::broker::paper::{PaperBroker, ProviderPrices};
use crate::broker::BrokerClient;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::indicators::IndicatorCache;
use crate::journal::{TradeJournal, UserRecord};
use crate::marketdata::{MarketDataProvider, MarketIndex};
use crate::plugin::DecisionPlugin;
use crate::scoring::ScorerRegistry;
use crate::snapshot::{load_latest_snapshot, Snapshot, SnapshotOutcome, SnapshotWriter};
use crate::trader::{TickStatus, UserController, UserTickOutcome};
use crate::universe;

/// Aggregate result of one user fan-out.
#[derive(Debug, Clone, Default)]
pub struct TickSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outcomes: Vec<UserTickOutcome>,
}

impl TickSummary {
    pub fn is_partial_failure(&self) -> bool {
        self.failed > 0 && self.completed + self.skipped > 0
    }
}

pub struct Engine {
    pub config: EngineConfig,
    pub journal: TradeJournal,
    pub provider: Arc<dyn MarketDataProvider>,
    pub registry: Arc<ScorerRegistry>,
    pub cache: Arc<IndicatorCache>,
    pub clock: Arc<dyn Clock>,
    pub dry_run: bool,
    pub plugin: Option<Arc<dyn DecisionPlugin>>,
    /// Users latched off for the day after a permanent broker failure.
    disabled_today: Mutex<HashSet<(i64, NaiveDate)>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        journal: TradeJournal,
        provider: Arc<dyn MarketDataProvider>,
        clock: Arc<dyn Clock>,
        dry_run: bool,
    ) -> Self {
        let cache = Arc::new(IndicatorCache::with_default_ttl(
            config.indicator_cache_size,
        ));

        // Rule-file strategies in <data_dir>/scoring sit next to (or
        // override) the built-in versions.
        let mut registry = ScorerRegistry::with_defaults();
        let rule_dir = config.data_dir.join("scoring");
        let loaded = registry.register_rule_dir(&rule_dir);
        if loaded > 0 {
            info!(count = loaded, dir = %rule_dir.display(), "rule-file scorers registered");
        }

        Self {
            config,
            journal,
            provider,
            registry: Arc::new(registry),
            cache,
            clock,
            dry_run,
            plugin: None,
            disabled_today: Mutex::new(HashSet::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Pre-open universe job
    // -------------------------------------------------------------------------

    pub async fn refresh_universe(&self) -> EngineResult<usize> {
        let listing = self.provider.listing().await?;
        let filtered = universe::filter_listing(&listing, &self.config);
        let path = self.config.universe_path(self.clock.today());
        universe::write_universe(&path, &filtered)?;
        Ok(filtered.len())
    }

    // -------------------------------------------------------------------------
    // Snapshot tick
    // -------------------------------------------------------------------------

    pub async fn write_snapshot(&self) -> EngineResult<SnapshotOutcome> {
        let stocks = universe::load_universe(&self.config, self.clock.today())?;
        let mut writer = SnapshotWriter::new(
            self.config.clone(),
            self.provider.clone(),
            self.registry.clone(),
            self.cache.clone(),
            self.clock.clone(),
        );

        // The leader-follower reference is refreshed offline; without it
        // every v10 column stays 0.
        let reference_path = self.config.data_dir.join("v10_reference.json");
        if reference_path.exists() {
            match crate::scoring::v10::LeaderFollowerReference::load(&reference_path) {
                Ok(reference) => writer = writer.with_v10_reference(reference),
                Err(e) => warn!(error = %e, "v10 reference unreadable, scoring without it"),
            }
        }

        writer.write(&stocks).await
    }

    pub fn load_snapshot(&self) -> EngineResult<Snapshot> {
        load_latest_snapshot(&self.config, self.clock.as_ref())
    }

    // -------------------------------------------------------------------------
    // User fan-out
    // -------------------------------------------------------------------------

    fn build_broker(&self, user: &UserRecord) -> EngineResult<Arc<dyn BrokerClient>> {
        let keys = self
            .journal
            .api_keys(user.user_id)?
            .ok_or_else(|| EngineError::Config("missing broker credentials".to_string()))?;

        if user.is_paper {
            let prices = Arc::new(ProviderPrices::new(self.provider.clone()));
            let broker = PaperBroker::new(
                self.journal.clone(),
                user.user_id,
                self.config.virtual_initial_cash,
                self.config.fees,
                prices,
                self.clock.clone(),
            )?;
            Ok(Arc::new(broker))
        } else {
            if keys.app_key.is_empty() || keys.app_secret.is_empty() {
                return Err(EngineError::Config("empty broker credentials".to_string()));
            }
            Ok(Arc::new(KisClient::new(
                keys.app_key,
                keys.app_secret,
                keys.account_number,
                false,
                Duration::from_secs(self.config.broker_timeout_secs),
            )))
        }
    }

    fn build_controller(
        &self,
        user: &UserRecord,
        nasdaq: Option<f64>,
    ) -> EngineResult<UserController> {
        Ok(UserController {
            user_id: user.user_id,
            journal: self.journal.clone(),
            broker: self.build_broker(user)?,
            provider: self.provider.clone(),
            cache: self.cache.clone(),
            registry: self.registry.clone(),
            clock: self.clock.clone(),
            dry_run: self.dry_run,
            is_paper: user.is_paper,
            fees: self.config.fees,
            suggestion_expire_hours: self.config.suggestion_expire_hours,
            nasdaq_prev_change: nasdaq,
            plugin: self.plugin.clone(),
        })
    }

    /// Run enabled users against `snapshot`, bounded by the outer
    /// parallelism cap and the per-user deadline. `only_user` narrows the
    /// fan-out to a single user (the CLI's --user-id path).
    pub async fn run_users(
        &self,
        snapshot: Arc<Snapshot>,
        only_user: Option<i64>,
    ) -> EngineResult<TickSummary> {
        let mut users = self.journal.enabled_users()?;
        if let Some(user_id) = only_user {
            users.retain(|u| u.user_id == user_id);
        }
        let today = self.clock.today();

        // The macro input is shared by every user of the tick.
        let nasdaq = match self.provider.index_prev_change(MarketIndex::Nasdaq).await {
            Ok(change) => Some(change),
            Err(e) => {
                warn!(error = %e, "NASDAQ change unavailable, multiplier stays 1.0");
                None
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.config.user_parallelism.max(1)));
        let deadline = Duration::from_secs(self.config.user_tick_deadline_secs);

        let mut handles = Vec::new();
        for user in users {
            if self.disabled_today.lock().contains(&(user.user_id, today)) {
                info!(user_id = user.user_id, "latched off for today, skipping");
                continue;
            }

            let controller = match self.build_controller(&user, nasdaq) {
                Ok(controller) => controller,
                Err(e) => {
                    warn!(user_id = user.user_id, error = %e, "controller build failed");
                    let _ = self.journal.record_alert(
                        user.user_id,
                        "",
                        "",
                        "ALERT_CONFIG",
                        &e.to_string(),
                        self.clock.now(),
                    );
                    continue;
                }
            };

            let semaphore = semaphore.clone();
            let snapshot = snapshot.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let user_id = controller.user_id;
                let result =
                    tokio::time::timeout(deadline, controller.run_tick(&snapshot)).await;
                (user_id, result)
            }));
        }

        let mut summary = TickSummary::default();
        for handle in handles {
            let Ok((user_id, result)) = handle.await else {
                summary.failed += 1;
                continue;
            };
            match result {
                Ok(Ok(outcome)) => {
                    match outcome.status {
                        TickStatus::Completed => summary.completed += 1,
                        TickStatus::Skipped(_) => summary.skipped += 1,
                    }
                    summary.outcomes.push(outcome);
                }
                Ok(Err(e)) => {
                    summary.failed += 1;
                    if matches!(e, EngineError::BrokerPermanent(_)) {
                        warn!(user_id, error = %e, "permanent broker failure, latching user off");
                        self.disabled_today.lock().insert((user_id, today));
                    } else {
                        error!(user_id, error = %e, "user tick failed");
                    }
                }
                Err(_) => {
                    summary.failed += 1;
                    error!(user_id, "user tick exceeded the deadline");
                    let _ = self.journal.record_alert(
                        user_id,
                        "",
                        "",
                        "ALERT_INTERNAL",
                        "user tick deadline exceeded",
                        self.clock.now(),
                    );
                }
            }
        }

        info!(
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            "user fan-out finished"
        );
        Ok(summary)
    }

    /// One full tick: snapshot, then users.
    pub async fn run_tick(&self) -> EngineResult<TickSummary> {
        self.write_snapshot().await?;
        let snapshot = Arc::new(self.load_snapshot()?);
        self.run_users(snapshot, None).await
    }

    // -------------------------------------------------------------------------
    // Daemon loop
    // -------------------------------------------------------------------------

    fn pid_path(&self) -> PathBuf {
        self.config.data_dir.join("krx-engine.pid")
    }

    /// Inside the scheduler window: weekday 08:50..=15:20.
    fn in_schedule_window(&self) -> bool {
        let now = self.clock.now();
        if now.weekday().number_from_monday() >= 6 {
            return false;
        }
        let mins = now.hour() * 60 + now.minute();
        (8 * 60 + 50..=15 * 60 + 20).contains(&mins)
    }

    /// Resident loop. Ticks until SIGINT/SIGTERM; an in-flight tick always
    /// finishes before the process exits, and the PID file is removed.
    pub async fn run_daemon(self: Arc<Self>) -> EngineResult<()> {
        std::fs::create_dir_all(&self.config.data_dir)?;
        std::fs::write(self.pid_path(), std::process::id().to_string())?;
        info!(pid = std::process::id(), "scheduler daemon started");

        let mut interval = tokio::time::interval(Duration::from_secs(
            self.config.tick_interval_minutes * 60,
        ));
        let mut shutdown = std::pin::pin!(shutdown_signal());
        let mut universe_date: Option<NaiveDate> = None;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let today = self.clock.today();
                    let now = self.clock.now();

                    // Pre-open universe job: once per day from 07:00.
                    if now.hour() >= 7 && universe_date != Some(today) {
                        match self.refresh_universe().await {
                            Ok(count) => {
                                universe_date = Some(today);
                                info!(count, "pre-open universe refreshed");
                            }
                            Err(e) => warn!(error = %e, "universe refresh failed"),
                        }
                    }

                    if !self.in_schedule_window() {
                        continue;
                    }

                    match self.run_tick().await {
                        Ok(summary) => info!(
                            completed = summary.completed,
                            skipped = summary.skipped,
                            failed = summary.failed,
                            "tick done"
                        ),
                        Err(e) => warn!(error = %e, "tick failed"),
                    }
                }
                _ = &mut shutdown => {
                    info!("shutdown signal received, finishing up");
                    break;
                }
            }
        }

        let _ = std::fs::remove_file(self.pid_path());
        info!("scheduler daemon stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::journal::ApiKeySettings;
    use crate::marketdata::FileProvider;
    use crate::policy::UserPolicy;
    use crate::types::TradeMode;

    /// Full end-to-end: universe job, snapshot tick, one paper user buying.
    #[tokio::test]
    async fn end_to_end_tick_with_paper_user() {
        let dir = tempfile::tempdir().unwrap();

        // --- market data fixture ---------------------------------------------
        std::fs::create_dir_all(dir.path().join("ohlcv")).unwrap();
        let mut csv = String::from("Date,Open,High,Low,Close,Volume\n");
        for i in 0..90 {
            let date = chrono::NaiveDate::from_ymd_opt(2025, 10, 1).unwrap()
                + chrono::Duration::days(i);
            let close = 10_000.0 + i as f64 * 40.0;
            csv.push_str(&format!(
                "{},{},{},{},{},{}\n",
                date,
                close - 50.0,
                close + 100.0,
                close - 150.0,
                close,
                500_000
            ));
        }
        std::fs::write(dir.path().join("ohlcv/005930.csv"), &csv).unwrap();
        std::fs::write(
            dir.path().join("listing.csv"),
            "Code,Name,Market,Marcap,Amount,Stocks\n\
             005930,GoodStock,KOSDAQ,100000000000,8000000000,10000000\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("indices.json"), r#"{"nasdaq": 0.5}"#).unwrap();

        // --- engine ----------------------------------------------------------
        let mut config = EngineConfig::default();
        config.data_dir = dir.path().join("output");

        let journal = TradeJournal::open_in_memory().unwrap();
        journal
            .upsert_user(
                1,
                &UserPolicy {
                    enabled: true,
                    mode: TradeMode::Auto,
                    min_buy_score: 1,
                    per_ticker_budget: 2_000_000,
                    ..Default::default()
                },
                &ApiKeySettings {
                    app_key: "k".into(),
                    app_secret: "s".into(),
                    account_number: "1-01".into(),
                    is_paper: true,
                },
            )
            .unwrap();

        let clock = Arc::new(FixedClock::at("2026-03-02 10:00:00"));
        let engine = Engine::new(
            config,
            journal.clone(),
            Arc::new(FileProvider::new(dir.path())),
            clock,
            false,
        );

        // universe
        let count = engine.refresh_universe().await.unwrap();
        assert_eq!(count, 1);

        // snapshot + users
        let summary = engine.run_tick().await.unwrap();
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.completed, 1);

        // the paper user now holds the stock if any score cleared the bar
        let outcome = &summary.outcomes[0];
        if outcome.buy_count > 0 {
            assert!(!journal.holdings(1).unwrap().is_empty());
        }

        // re-running the tick reuses the snapshot and buys nothing new
        let second = engine.run_tick().await.unwrap();
        assert_eq!(second.failed, 0);
        let buys: usize = second.outcomes.iter().map(|o| o.buy_count).sum();
        assert_eq!(buys, 0);
    }

    #[test]
    fn schedule_window_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.data_dir = dir.path().to_path_buf();
        let journal = TradeJournal::open_in_memory().unwrap();
        let provider = Arc::new(FileProvider::new(dir.path()));

        let at = |s: &str| {
            Engine::new(
                config.clone(),
                journal.clone(),
                provider.clone(),
                Arc::new(FixedClock::at(s)),
                false,
            )
        };

        assert!(at("2026-03-02 08:50:00").in_schedule_window());
        assert!(at("2026-03-02 15:20:00").in_schedule_window());
        assert!(!at("2026-03-02 08:49:00").in_schedule_window());
        assert!(!at("2026-03-02 15:21:00").in_schedule_window());
        // Saturday
        assert!(!at("2026-03-07 10:00:00").in_schedule_window());
    }
}
