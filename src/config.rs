// =============================================================================
// Engine configuration with atomic save
// =============================================================================
//
// Deployment-level settings for the engine. Per-user policy lives in the
// journal (user_settings); this file holds everything the scheduler and the
// snapshot writer need before any user is touched.
//
// Persistence uses the atomic tmp + rename pattern. All fields carry
// `#[serde(default)]` so adding new fields never breaks loading an older
// config file.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_data_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("trading.db")
}

fn default_min_market_cap() -> i64 {
    30_000_000_000
}

fn default_max_market_cap() -> Option<i64> {
    Some(1_000_000_000_000)
}

fn default_min_trading_amount() -> i64 {
    3_000_000_000
}

fn default_tick_interval_minutes() -> u64 {
    10
}

fn default_snapshot_workers() -> usize {
    40
}

fn default_user_parallelism() -> usize {
    4
}

fn default_snapshot_max_age_minutes() -> i64 {
    15
}

fn default_user_tick_deadline_secs() -> u64 {
    300
}

fn default_indicator_cache_size() -> usize {
    500
}

fn default_virtual_initial_cash() -> i64 {
    100_000_000
}

fn default_suggestion_expire_hours() -> i64 {
    24
}

fn default_history_bars() -> usize {
    120
}

fn default_commission_rate() -> f64 {
    0.00015
}

fn default_tax_rate() -> f64 {
    0.0018
}

fn default_broker_timeout_secs() -> u64 {
    10
}

fn default_market_data_timeout_secs() -> u64 {
    30
}

// =============================================================================
// FeeSchedule
// =============================================================================

/// Commission and transfer-tax rates applied by the paper executor so that
/// simulated P/L matches live accounting. Tax is market dependent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeSchedule {
    #[serde(default = "default_commission_rate")]
    pub commission_rate: f64,
    #[serde(default = "default_tax_rate")]
    pub tax_rate_kospi: f64,
    #[serde(default = "default_tax_rate")]
    pub tax_rate_kosdaq: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            commission_rate: default_commission_rate(),
            tax_rate_kospi: default_tax_rate(),
            tax_rate_kosdaq: default_tax_rate(),
        }
    }
}

impl FeeSchedule {
    pub fn tax_rate(&self, market: crate::types::Market) -> f64 {
        match market {
            crate::types::Market::Kospi => self.tax_rate_kospi,
            crate::types::Market::Kosdaq => self.tax_rate_kosdaq,
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Paths ---------------------------------------------------------------
    /// Root for universe files and the intraday_scores directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// SQLite journal file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    // --- Universe filters ----------------------------------------------------
    /// Minimum market cap to enter the tradable universe (KRW).
    #[serde(default = "default_min_market_cap")]
    pub min_market_cap: i64,

    /// Optional market-cap ceiling. `None` disables the large-cap exclusion.
    #[serde(default = "default_max_market_cap")]
    pub max_market_cap: Option<i64>,

    /// Minimum prior-day traded value (KRW). Also the snapshot liquidity floor.
    #[serde(default = "default_min_trading_amount")]
    pub min_trading_amount: i64,

    // --- Cadence & pools -----------------------------------------------------
    #[serde(default = "default_tick_interval_minutes")]
    pub tick_interval_minutes: u64,

    /// Snapshot fan-out worker pool size.
    #[serde(default = "default_snapshot_workers")]
    pub snapshot_workers: usize,

    /// Outer cap on concurrently processed users.
    #[serde(default = "default_user_parallelism")]
    pub user_parallelism: usize,

    /// Snapshot files older than this are stale for user ticks.
    #[serde(default = "default_snapshot_max_age_minutes")]
    pub snapshot_max_age_minutes: i64,

    /// Per-user tick deadline. Exceeding it marks the tick failed.
    #[serde(default = "default_user_tick_deadline_secs")]
    pub user_tick_deadline_secs: u64,

    // --- Scoring -------------------------------------------------------------
    #[serde(default = "default_indicator_cache_size")]
    pub indicator_cache_size: usize,

    /// Bars of history fetched per ticker for scoring.
    #[serde(default = "default_history_bars")]
    pub history_bars: usize,

    // --- Accounts ------------------------------------------------------------
    #[serde(default = "default_virtual_initial_cash")]
    pub virtual_initial_cash: i64,

    #[serde(default)]
    pub fees: FeeSchedule,

    #[serde(default = "default_suggestion_expire_hours")]
    pub suggestion_expire_hours: i64,

    // --- External call budgets ----------------------------------------------
    #[serde(default = "default_broker_timeout_secs")]
    pub broker_timeout_secs: u64,

    #[serde(default = "default_market_data_timeout_secs")]
    pub market_data_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_path: default_db_path(),
            min_market_cap: default_min_market_cap(),
            max_market_cap: default_max_market_cap(),
            min_trading_amount: default_min_trading_amount(),
            tick_interval_minutes: default_tick_interval_minutes(),
            snapshot_workers: default_snapshot_workers(),
            user_parallelism: default_user_parallelism(),
            snapshot_max_age_minutes: default_snapshot_max_age_minutes(),
            user_tick_deadline_secs: default_user_tick_deadline_secs(),
            indicator_cache_size: default_indicator_cache_size(),
            history_bars: default_history_bars(),
            virtual_initial_cash: default_virtual_initial_cash(),
            fees: FeeSchedule::default(),
            suggestion_expire_hours: default_suggestion_expire_hours(),
            broker_timeout_secs: default_broker_timeout_secs(),
            market_data_timeout_secs: default_market_data_timeout_secs(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            db = %config.db_path.display(),
            tick_interval_minutes = config.tick_interval_minutes,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist to `path` atomically (write `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Directory holding the per-tick score snapshots.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("intraday_scores")
    }

    /// Path of the daily filtered-universe file.
    pub fn universe_path(&self, date: chrono::NaiveDate) -> PathBuf {
        self.data_dir
            .join(format!("filtered_stocks_{}.csv", date.format("%Y%m%d")))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.min_market_cap, 30_000_000_000);
        assert_eq!(cfg.max_market_cap, Some(1_000_000_000_000));
        assert_eq!(cfg.min_trading_amount, 3_000_000_000);
        assert_eq!(cfg.tick_interval_minutes, 10);
        assert_eq!(cfg.snapshot_workers, 40);
        assert_eq!(cfg.snapshot_max_age_minutes, 15);
        assert_eq!(cfg.virtual_initial_cash, 100_000_000);
        assert!((cfg.fees.commission_rate - 0.00015).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.tick_interval_minutes, 10);
        assert_eq!(cfg.user_parallelism, 4);
        assert_eq!(cfg.history_bars, 120);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "tick_interval_minutes": 5, "max_market_cap": null }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.tick_interval_minutes, 5);
        assert_eq!(cfg.max_market_cap, None);
        assert_eq!(cfg.snapshot_workers, 40);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.min_market_cap, cfg2.min_market_cap);
        assert_eq!(cfg.db_path, cfg2.db_path);
    }

    #[test]
    fn atomic_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let cfg = EngineConfig::default();
        cfg.save(&path).unwrap();
        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.tick_interval_minutes, cfg.tick_interval_minutes);
        // No tmp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn snapshot_and_universe_paths() {
        let cfg = EngineConfig::default();
        assert!(cfg.snapshot_dir().ends_with("intraday_scores"));
        let date = "2026-03-02".parse().unwrap();
        assert!(cfg
            .universe_path(date)
            .to_string_lossy()
            .ends_with("filtered_stocks_20260302.csv"));
    }

    #[test]
    fn tax_rate_by_market() {
        let fees = FeeSchedule::default();
        assert!((fees.tax_rate(crate::types::Market::Kospi) - 0.0018).abs() < f64::EPSILON);
        assert!((fees.tax_rate(crate::types::Market::Kosdaq) - 0.0018).abs() < f64::EPSILON);
    }
}
