// =============================================================================
// Score snapshot writer and reader
// =============================================================================
//
// Once per tick the writer fans scoring out across the filtered universe and
// publishes one CSV under intraday_scores/<yyyymmdd>_<hhmm>.csv. The file is
// written to a tmp sibling and renamed, so a reader can never observe a
// partial snapshot. Every user tick of the same timestamp consumes the same
// file; files older than the configured age are stale and abort the tick.
//
// Degraded mode: a latency probe runs before the full fan-out. If the
// estimated fetch time would eat more than half the tick interval, the
// universe shrinks to the top-liquidity subset (5x the floor) and a
// .degraded marker is published next to the CSV.
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::indicators::IndicatorCache;
use crate::marketdata::MarketDataProvider;
use crate::scoring::v10::{score_v10, LeaderFollowerReference};
use crate::scoring::{ScoreExtras, ScorerRegistry};
use crate::universe::UniverseStock;

/// Tickers probed to estimate fetch latency before the full fan-out.
const LATENCY_PROBE_COUNT: usize = 8;

// =============================================================================
// Row shape
// =============================================================================

/// One snapshot row. Field order is the CSV column contract; score columns
/// all default to 0 so files from older versions still load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub code: String,
    pub name: String,
    pub market: String,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub close: i64,
    pub prev_close: i64,
    pub change_pct: f64,
    pub volume: i64,
    /// Today's volume over the prior 5-day average.
    #[serde(default)]
    pub volume_ratio: f64,
    /// Previous-day traded value (KRW).
    #[serde(default)]
    pub prev_amount: i64,
    /// Previous-day market cap (KRW).
    #[serde(default)]
    pub prev_marcap: i64,
    #[serde(default)]
    pub buy_strength: f64,
    #[serde(default)]
    pub foreign_net: i64,
    #[serde(default)]
    pub inst_net: i64,
    #[serde(default)]
    pub rel_strength: f64,
    #[serde(default)]
    pub v1: i32,
    #[serde(default)]
    pub v2: i32,
    #[serde(rename = "v3.5", default)]
    pub v3_5: i32,
    #[serde(default)]
    pub v4: i32,
    #[serde(default)]
    pub v5: i32,
    #[serde(default)]
    pub v6: i32,
    #[serde(default)]
    pub v7: i32,
    #[serde(default)]
    pub v8: i32,
    /// Gap-probability model output; filled by the external model when wired.
    #[serde(default)]
    pub v9_prob: f64,
    #[serde(default)]
    pub v10: i32,
    #[serde(default)]
    pub signals: String,
}

impl SnapshotRow {
    /// Score by version string; unknown versions read as 0.
    pub fn score(&self, version: &str) -> i32 {
        match version {
            "v1" => self.v1,
            "v2" => self.v2,
            "v3.5" => self.v3_5,
            "v4" => self.v4,
            "v5" => self.v5,
            "v6" => self.v6,
            "v7" => self.v7,
            "v8" => self.v8,
            "v10" => self.v10,
            _ => 0,
        }
    }

    /// All scores keyed by version, for DSL evaluation.
    pub fn scores(&self) -> BTreeMap<String, i32> {
        BTreeMap::from([
            ("v1".to_string(), self.v1),
            ("v2".to_string(), self.v2),
            ("v3.5".to_string(), self.v3_5),
            ("v4".to_string(), self.v4),
            ("v5".to_string(), self.v5),
            ("v6".to_string(), self.v6),
            ("v7".to_string(), self.v7),
            ("v8".to_string(), self.v8),
            ("v10".to_string(), self.v10),
        ])
    }
}

/// A published snapshot plus its provenance.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub rows: Vec<SnapshotRow>,
    pub path: PathBuf,
    pub taken_at: NaiveDateTime,
    pub degraded: bool,
}

impl Snapshot {
    pub fn row(&self, code: &str) -> Option<&SnapshotRow> {
        self.rows.iter().find(|r| r.code == code)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.row(code).is_some()
    }
}

// =============================================================================
// Optional broker-side flow feed (conclusion strength, investor net flow)
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct FlowData {
    pub buy_strength: f64,
    pub foreign_net: i64,
    pub inst_net: i64,
}

#[async_trait]
pub trait FlowFeed: Send + Sync {
    async fn flow(&self, code: &str) -> Option<FlowData>;
    /// Previous change of the market index backing `market` (percent).
    async fn index_change(&self, market: &str) -> Option<f64>;
}

// =============================================================================
// Writer
// =============================================================================

pub struct SnapshotWriter {
    config: EngineConfig,
    provider: Arc<dyn MarketDataProvider>,
    registry: Arc<ScorerRegistry>,
    cache: Arc<IndicatorCache>,
    clock: Arc<dyn Clock>,
    flow_feed: Option<Arc<dyn FlowFeed>>,
    v10_reference: Option<LeaderFollowerReference>,
}

#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub path: PathBuf,
    pub row_count: usize,
    pub degraded: bool,
    /// True when the tick's file already existed and nothing was rewritten.
    pub reused: bool,
}

impl SnapshotWriter {
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn MarketDataProvider>,
        registry: Arc<ScorerRegistry>,
        cache: Arc<IndicatorCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            provider,
            registry,
            cache,
            clock,
            flow_feed: None,
            v10_reference: None,
        }
    }

    pub fn with_flow_feed(mut self, feed: Arc<dyn FlowFeed>) -> Self {
        self.flow_feed = Some(feed);
        self
    }

    pub fn with_v10_reference(mut self, reference: LeaderFollowerReference) -> Self {
        self.v10_reference = Some(reference);
        self
    }

    /// Path for the tick at `now`.
    pub fn path_for(&self, now: NaiveDateTime) -> PathBuf {
        self.config
            .snapshot_dir()
            .join(format!("{}.csv", now.format("%Y%m%d_%H%M")))
    }

    /// Produce the snapshot for the current tick. A second call within the
    /// same minute finds the file already present and is a no-op.
    pub async fn write(&self, universe: &[UniverseStock]) -> EngineResult<SnapshotOutcome> {
        let now = self.clock.now();
        let path = self.path_for(now);

        if path.exists() {
            debug!(path = %path.display(), "snapshot already exists for this tick");
            return Ok(SnapshotOutcome {
                path,
                row_count: 0,
                degraded: false,
                reused: true,
            });
        }

        // --- Latency probe -> possibly degrade the universe ------------------
        let (mut rows, degraded, remaining) = self.probe_and_select(universe).await;

        // --- Full fan-out -----------------------------------------------------
        let semaphore = Arc::new(Semaphore::new(self.config.snapshot_workers.max(1)));
        let mut tasks = Vec::with_capacity(remaining.len());
        for stock in remaining {
            let semaphore = semaphore.clone();
            let this = self.clone_refs();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                this.process_one(&stock).await
            }));
        }
        for task in join_all(tasks).await {
            if let Ok(Some(row)) = task {
                rows.push(row);
            }
        }

        if rows.is_empty() {
            return Err(EngineError::Internal(
                "snapshot produced no rows".to_string(),
            ));
        }

        // --- v10 pass over the whole day's change map ------------------------
        if let Some(reference) = &self.v10_reference {
            let changes: BTreeMap<String, f64> = rows
                .iter()
                .map(|r| (r.code.clone(), r.change_pct))
                .collect();
            let v10 = score_v10(&changes, reference);
            for row in &mut rows {
                row.v10 = v10.get(&row.code).copied().unwrap_or(0);
            }
        }

        // Highest v2 first, prior traded value breaking ties.
        rows.sort_by(|a, b| (b.v2, b.prev_amount).cmp(&(a.v2, a.prev_amount)));

        write_rows(&path, &rows)?;
        if degraded {
            std::fs::write(degraded_marker(&path), b"")?;
        }

        info!(
            path = %path.display(),
            rows = rows.len(),
            degraded,
            "snapshot published"
        );

        Ok(SnapshotOutcome {
            path,
            row_count: rows.len(),
            degraded,
            reused: false,
        })
    }

    fn clone_refs(&self) -> SnapshotTask {
        SnapshotTask {
            config: self.config.clone(),
            provider: self.provider.clone(),
            registry: self.registry.clone(),
            cache: self.cache.clone(),
            clock: self.clock.clone(),
            flow_feed: self.flow_feed.clone(),
        }
    }

    /// Run the probe batch, decide whether to degrade, and return the probe
    /// rows plus the remaining universe to process.
    async fn probe_and_select(
        &self,
        universe: &[UniverseStock],
    ) -> (Vec<SnapshotRow>, bool, Vec<UniverseStock>) {
        let probe_count = LATENCY_PROBE_COUNT.min(universe.len());
        let task = self.clone_refs();

        let started = Instant::now();
        let mut probe_rows = Vec::new();
        for stock in &universe[..probe_count] {
            if let Some(row) = task.process_one(stock).await {
                probe_rows.push(row);
            }
        }
        let elapsed = started.elapsed();

        let mut degraded = false;
        let rest: Vec<UniverseStock> = universe[probe_count..].to_vec();

        if probe_count > 0 {
            let per_fetch = elapsed / probe_count as u32;
            let workers = self.config.snapshot_workers.max(1) as u32;
            let estimated = per_fetch * (rest.len().max(1) as u32) / workers;
            let budget =
                Duration::from_secs(self.config.tick_interval_minutes * 60) / 2;
            if estimated > budget {
                degraded = true;
                warn!(
                    per_fetch_ms = per_fetch.as_millis() as u64,
                    estimated_secs = estimated.as_secs(),
                    budget_secs = budget.as_secs(),
                    "market data too slow, degrading snapshot to top-liquidity subset"
                );
            }
        }

        if degraded {
            let liquidity_bar = self.config.min_trading_amount * 5;
            probe_rows.retain(|r| r.prev_amount >= liquidity_bar);
            let rest = rest
                .into_iter()
                .filter(|s| s.amount >= liquidity_bar)
                .collect();
            (probe_rows, true, rest)
        } else {
            (probe_rows, false, rest)
        }
    }
}

/// The per-ticker working set moved into spawned tasks.
struct SnapshotTask {
    config: EngineConfig,
    provider: Arc<dyn MarketDataProvider>,
    registry: Arc<ScorerRegistry>,
    cache: Arc<IndicatorCache>,
    clock: Arc<dyn Clock>,
    flow_feed: Option<Arc<dyn FlowFeed>>,
}

impl SnapshotTask {
    async fn process_one(&self, stock: &UniverseStock) -> Option<SnapshotRow> {
        let timeout = Duration::from_secs(self.config.market_data_timeout_secs);
        let series = match tokio::time::timeout(
            timeout,
            self.provider.daily_bars(&stock.code, self.config.history_bars),
        )
        .await
        {
            Ok(Ok(series)) => series,
            Ok(Err(e)) => {
                debug!(code = %stock.code, error = %e, "bars unavailable, skipping");
                return None;
            }
            Err(_) => {
                warn!(code = %stock.code, "market data fetch timed out");
                return None;
            }
        };

        // Skip rules: short history, dead tape, sub-floor liquidity.
        if series.len() < 60 {
            return None;
        }
        let n = series.len();
        let latest = series.bars[n - 1];
        let prev = series.bars[n - 2];
        if prev.volume <= 0.0 {
            return None;
        }
        let prev_amount = prev.trading_value() as i64;
        if prev_amount < self.config.min_trading_amount {
            return None;
        }

        let frame = self.cache.get_or_compute(&series);

        let prev_marcap = if stock.stocks > 0 {
            (prev.close * stock.stocks as f64) as i64
        } else {
            0
        };

        // Flow data, when the broker feed is wired in.
        let flow = match &self.flow_feed {
            Some(feed) => feed.flow(&stock.code).await.unwrap_or_default(),
            None => FlowData::default(),
        };

        let extras = ScoreExtras {
            market_cap: (prev_marcap > 0).then_some(prev_marcap as f64),
            prev_trading_value: Some(prev_amount as f64),
            minutes_into_session: self.clock.minutes_into_session(),
            investor: None,
            holding_disclosure: false,
        };

        // Per-version isolation: a panicking strategy scores 0 for this
        // ticker and the rest still publish.
        let mut scores: BTreeMap<String, i32> = BTreeMap::new();
        let mut v2_signals = String::new();
        for version in self.registry.versions() {
            let scorer = self.registry.get(&version)?;
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                crate::scoring::run_scorer(scorer, &frame, &extras)
            }));
            match outcome {
                Ok(Some(result)) => {
                    if version == "v2" {
                        v2_signals = result
                            .signals
                            .iter()
                            .take(5)
                            .cloned()
                            .collect::<Vec<_>>()
                            .join(",");
                    }
                    scores.insert(version, result.score);
                }
                Ok(None) => {
                    scores.insert(version, 0);
                }
                Err(_) => {
                    warn!(code = %stock.code, version = %version, "scorer panicked, recording 0");
                    scores.insert(version, 0);
                }
            }
        }

        let prev_close = prev.close as i64;
        let change_pct = if prev.close > 0.0 {
            (latest.close - prev.close) / prev.close * 100.0
        } else {
            0.0
        };

        // Today's volume against the prior 5-day average (today excluded).
        let avg_5d: f64 = series.bars[n - 6..n - 1]
            .iter()
            .map(|b| b.volume)
            .sum::<f64>()
            / 5.0;
        let volume_ratio = if avg_5d > 0.0 {
            (latest.volume / avg_5d * 100.0).round() / 100.0
        } else {
            1.0
        };

        let rel_strength = match &self.flow_feed {
            Some(feed) => {
                let index_change = feed.index_change(&stock.market).await.unwrap_or(0.0);
                ((change_pct - index_change) * 100.0).round() / 100.0
            }
            None => 0.0,
        };

        Some(SnapshotRow {
            code: stock.code.clone(),
            name: stock.name.clone(),
            market: stock.market.clone(),
            open: latest.open as i64,
            high: latest.high as i64,
            low: latest.low as i64,
            close: latest.close as i64,
            prev_close,
            change_pct: (change_pct * 100.0).round() / 100.0,
            volume: latest.volume as i64,
            volume_ratio,
            prev_amount,
            prev_marcap,
            buy_strength: flow.buy_strength,
            foreign_net: flow.foreign_net,
            inst_net: flow.inst_net,
            rel_strength,
            v1: scores.get("v1").copied().unwrap_or(0),
            v2: scores.get("v2").copied().unwrap_or(0),
            v3_5: scores.get("v3.5").copied().unwrap_or(0),
            v4: scores.get("v4").copied().unwrap_or(0),
            v5: scores.get("v5").copied().unwrap_or(0),
            v6: scores.get("v6").copied().unwrap_or(0),
            v7: scores.get("v7").copied().unwrap_or(0),
            v8: scores.get("v8").copied().unwrap_or(0),
            v9_prob: 0.0,
            v10: 0,
            signals: v2_signals,
        })
    }
}

fn write_rows(path: &Path, rows: &[SnapshotRow]) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("csv.tmp");
    {
        let mut writer = csv::Writer::from_path(&tmp)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn degraded_marker(path: &Path) -> PathBuf {
    path.with_extension("csv.degraded")
}

// =============================================================================
// Reader
// =============================================================================

/// Load the newest snapshot of the clock's current day, enforcing the
/// max-age window.
pub fn load_latest_snapshot(config: &EngineConfig, clock: &dyn Clock) -> EngineResult<Snapshot> {
    let now = clock.now();
    let dir = config.snapshot_dir();
    let today_prefix = now.format("%Y%m%d").to_string();

    let mut candidates: Vec<PathBuf> = std::fs::read_dir(&dir)
        .map_err(|_| {
            EngineError::StaleSnapshot(format!("snapshot directory missing: {}", dir.display()))
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension().map_or(false, |ext| ext == "csv")
                && p.file_stem()
                    .and_then(|s| s.to_str())
                    .map_or(false, |s| s.starts_with(&today_prefix))
        })
        .collect();
    candidates.sort();

    let latest = candidates
        .pop()
        .ok_or_else(|| EngineError::StaleSnapshot("no snapshot for today".to_string()))?;

    let stem = latest
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    let taken_at = NaiveDateTime::parse_from_str(&stem, "%Y%m%d_%H%M")
        .map_err(|_| EngineError::StaleSnapshot(format!("unparseable snapshot name: {stem}")))?;

    let age_minutes = (now - taken_at).num_minutes();
    if age_minutes > config.snapshot_max_age_minutes {
        return Err(EngineError::StaleSnapshot(format!(
            "snapshot {stem} is {age_minutes} minutes old"
        )));
    }

    let rows = read_rows(&latest)?;
    let degraded = degraded_marker(&latest).exists();

    debug!(
        path = %latest.display(),
        rows = rows.len(),
        age_minutes,
        degraded,
        "snapshot loaded"
    );

    Ok(Snapshot {
        rows,
        path: latest,
        taken_at,
        degraded,
    })
}

pub fn read_rows(path: &Path) -> EngineResult<Vec<SnapshotRow>> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize::<SnapshotRow>() {
        let mut row = row?;
        row.code = format!("{:0>6}", row.code);
        rows.push(row);
    }
    Ok(rows)
}
