// =============================================================================
// Scoring engine: versioned strategies behind one template
// =============================================================================
//
// A scorer supplies only its disqualifiers and group rules; `run_scorer`
// enforces the shared pipeline:
//
//   1. length validation (None below the scorer's minimum bars)
//   2. disqualifier check, short-circuiting to score 0
//   3. per-group scoring
//   4. final scaling / clamp to [0, 100]
//   5. base-indicator attachment
//
// ScoreResult uses ordered collections so that identical frames serialise
// byte-identically.
// =============================================================================

pub mod patterns;
pub mod rules;
pub mod v1;
pub mod v10;
pub mod v2;
pub mod v3;
pub mod v3_5;
pub mod v4;
pub mod v5;
pub mod v6;
pub mod v7;
pub mod v8;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::indicators::IndicatorFrame;

/// Exit plan embedded by the swing strategies (v6/v7/v8).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitPlan {
    pub entry: f64,
    pub target_price: f64,
    pub stop_price: f64,
    /// Once reached, the stop ratchets to break-even. Not set by v6.
    pub trailing_trigger: Option<f64>,
    pub max_hold_days: u32,
    pub atr: f64,
}

/// Side inputs that are not derivable from the price series alone.
#[derive(Debug, Clone, Default)]
pub struct ScoreExtras {
    /// Previous-day market cap (KRW), for turnover scoring.
    pub market_cap: Option<f64>,
    /// Previous-day traded value (KRW), used before 10:00.
    pub prev_trading_value: Option<f64>,
    /// Minutes since the open; None outside market hours. Injected by the
    /// caller's clock so scoring itself stays pure.
    pub minutes_into_session: Option<u32>,
    /// Foreign / institutional net flow, when the broker feed provides it.
    pub investor: Option<InvestorFlow>,
    /// A 5%+ large-holding disclosure was filed recently (v3.5 confirmation).
    pub holding_disclosure: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InvestorFlow {
    /// 5-day net foreign buy quantity.
    pub foreign_net: i64,
    /// 5-day net institutional buy quantity.
    pub institution_net: i64,
    pub foreign_consecutive_days: u32,
    pub institution_consecutive_days: u32,
}

/// Outcome of one scorer run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreResult {
    pub version: String,
    pub score: i32,
    pub group_scores: BTreeMap<String, i32>,
    pub signals: BTreeSet<String>,
    pub patterns: BTreeSet<String>,
    pub warnings: BTreeSet<String>,
    pub indicators: BTreeMap<String, f64>,
    pub exit_plan: Option<ExitPlan>,
    pub disqualified: bool,
    pub reason: Option<String>,
}

impl ScoreResult {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            score: 0,
            group_scores: BTreeMap::new(),
            signals: BTreeSet::new(),
            patterns: BTreeSet::new(),
            warnings: BTreeSet::new(),
            indicators: BTreeMap::new(),
            exit_plan: None,
            disqualified: false,
            reason: None,
        }
    }

    pub fn signal(&mut self, name: &str) {
        self.signals.insert(name.to_string());
    }

    pub fn pattern(&mut self, name: &str) {
        self.patterns.insert(name.to_string());
    }

    pub fn warning(&mut self, name: &str) {
        self.warnings.insert(name.to_string());
    }

    pub fn group(&mut self, name: &str, score: i32) {
        self.group_scores.insert(name.to_string(), score);
    }

    pub fn indicator(&mut self, name: &str, value: f64) {
        if value.is_finite() {
            self.indicators.insert(name.to_string(), value);
        }
    }
}

/// Disqualifier outcome: a reason plus an optional signal to surface.
#[derive(Debug, Clone)]
pub struct Disqualification {
    pub reason: String,
    pub signal: Option<&'static str>,
}

impl Disqualification {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            signal: None,
        }
    }

    pub fn with_signal(reason: impl Into<String>, signal: &'static str) -> Self {
        Self {
            reason: reason.into(),
            signal: Some(signal),
        }
    }
}

/// One versioned scoring strategy.
pub trait Scorer: Send + Sync {
    fn version(&self) -> &str;

    fn min_data_bars(&self) -> usize {
        60
    }

    /// Return Some to zero the score before any group runs.
    fn check_disqualifiers(
        &self,
        frame: &IndicatorFrame,
        extras: &ScoreExtras,
    ) -> Option<Disqualification>;

    /// Populate group scores, signals, patterns, warnings, exit plan.
    fn score_groups(&self, frame: &IndicatorFrame, extras: &ScoreExtras, out: &mut ScoreResult);

    /// Map the summed group scores to the final score. The default clamps;
    /// breadth strategies (v1, v5) override with their piecewise scaling.
    fn finalize(&self, raw: i32) -> i32 {
        raw.clamp(0, 100)
    }

    /// Runs after the final score is known. Swing strategies attach their
    /// exit plan here; the default does nothing.
    fn attach_exit_plan(&self, _frame: &IndicatorFrame, _score: i32, _out: &mut ScoreResult) {}
}

/// Template method shared by every scorer.
pub fn run_scorer(
    scorer: &dyn Scorer,
    frame: &IndicatorFrame,
    extras: &ScoreExtras,
) -> Option<ScoreResult> {
    if frame.len() < scorer.min_data_bars() {
        return None;
    }

    let mut result = ScoreResult::new(scorer.version());

    if let Some(dq) = scorer.check_disqualifiers(frame, extras) {
        result.disqualified = true;
        result.score = 0;
        if let Some(sig) = dq.signal {
            result.signal(sig);
        }
        result.reason = Some(dq.reason);
        attach_base_indicators(&mut result, frame);
        return Some(result);
    }

    scorer.score_groups(frame, extras, &mut result);

    let raw: i32 = result.group_scores.values().sum();
    result.score = scorer.finalize(raw).clamp(0, 100);

    let score = result.score;
    scorer.attach_exit_plan(frame, score, &mut result);

    attach_base_indicators(&mut result, frame);
    Some(result)
}

fn attach_base_indicators(result: &mut ScoreResult, frame: &IndicatorFrame) {
    let bar = frame.last_bar();
    result.indicator("close", bar.close);
    result.indicator("change_pct", frame.change_pct());
    result.indicator("volume", bar.volume);
    result.indicator("trading_value", bar.trading_value());
}

// =============================================================================
// Registry
// =============================================================================

/// Version string -> scorer. Adding a new version is implement + register;
/// YAML rule files register through the same door.
pub struct ScorerRegistry {
    scorers: BTreeMap<String, Box<dyn Scorer>>,
}

impl ScorerRegistry {
    pub fn new() -> Self {
        Self {
            scorers: BTreeMap::new(),
        }
    }

    /// All built-in strategies.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register(Box::new(v1::ScorerV1));
        reg.register(Box::new(v2::ScorerV2));
        reg.register(Box::new(v3::ScorerV3));
        reg.register(Box::new(v3_5::ScorerV35));
        reg.register(Box::new(v4::ScorerV4));
        reg.register(Box::new(v5::ScorerV5));
        reg.register(Box::new(v6::ScorerV6));
        reg.register(Box::new(v7::ScorerV7));
        reg.register(Box::new(v8::ScorerV8));
        reg
    }

    pub fn register(&mut self, scorer: Box<dyn Scorer>) {
        self.scorers.insert(scorer.version().to_string(), scorer);
    }

    /// Register every `<version>_config.yaml` rule file found in `dir`.
    /// A rule-file version overrides the built-in of the same name.
    pub fn register_rule_dir(&mut self, dir: &std::path::Path) -> usize {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return 0;
        };
        let mut count = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with("_config.yaml") {
                continue;
            }
            match rules::RuleFile::load(&path) {
                Ok(file) => {
                    self.register(Box::new(rules::RuleScorer::new(file)));
                    count += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "bad rule file");
                }
            }
        }
        count
    }

    pub fn get(&self, version: &str) -> Option<&dyn Scorer> {
        self.scorers.get(version).map(|b| b.as_ref())
    }

    pub fn versions(&self) -> Vec<String> {
        self.scorers.keys().cloned().collect()
    }

    /// Run every registered scorer against one frame. A scorer that returns
    /// None (insufficient bars) is simply absent from the output.
    pub fn score_all(
        &self,
        frame: &IndicatorFrame,
        extras: &ScoreExtras,
    ) -> BTreeMap<String, ScoreResult> {
        let mut out = BTreeMap::new();
        for (version, scorer) in &self.scorers {
            if let Some(result) = run_scorer(scorer.as_ref(), frame, extras) {
                out.insert((*version).to_string(), result);
            }
        }
        out
    }
}

impl Default for ScorerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod testutil {
    use crate::types::{PriceBar, PriceSeries};

    /// Bars synthesised from closes: mild intrabar range, steady volume
    /// unless a volume override is given.
    pub fn frame_from_closes(closes: &[f64]) -> crate::indicators::IndicatorFrame {
        frame_from_closes_vols(closes, &vec![100_000.0; closes.len()])
    }

    pub fn frame_from_closes_vols(
        closes: &[f64],
        vols: &[f64],
    ) -> crate::indicators::IndicatorFrame {
        let bars: Vec<PriceBar> = closes
            .iter()
            .zip(vols)
            .enumerate()
            .map(|(i, (&c, &v))| PriceBar {
                ts: chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
                    + chrono::Duration::days(i as i64),
                open: c * 0.995,
                high: c * 1.01,
                low: c * 0.985,
                close: c,
                volume: v,
            })
            .collect();
        crate::indicators::IndicatorFrame::compute(&PriceSeries::new("005930", bars).unwrap())
    }

    pub fn frame_from_bars(bars: Vec<PriceBar>) -> crate::indicators::IndicatorFrame {
        crate::indicators::IndicatorFrame::compute(&PriceSeries::new("005930", bars).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::frame_from_closes;
    use super::*;

    struct FixedScorer(i32);

    impl Scorer for FixedScorer {
        fn version(&self) -> &str {
            "vtest"
        }
        fn check_disqualifiers(
            &self,
            _frame: &IndicatorFrame,
            _extras: &ScoreExtras,
        ) -> Option<Disqualification> {
            None
        }
        fn score_groups(
            &self,
            _frame: &IndicatorFrame,
            _extras: &ScoreExtras,
            out: &mut ScoreResult,
        ) {
            out.group("only", self.0);
        }
    }

    struct AlwaysDisqualified;

    impl Scorer for AlwaysDisqualified {
        fn version(&self) -> &str {
            "vdq"
        }
        fn check_disqualifiers(
            &self,
            _frame: &IndicatorFrame,
            _extras: &ScoreExtras,
        ) -> Option<Disqualification> {
            Some(Disqualification::with_signal("nope", "NOPE_SIGNAL"))
        }
        fn score_groups(
            &self,
            _frame: &IndicatorFrame,
            _extras: &ScoreExtras,
            _out: &mut ScoreResult,
        ) {
        }
    }

    fn closes(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + (i % 9) as f64).collect()
    }

    #[test]
    fn template_returns_none_below_min_bars() {
        let frame = frame_from_closes(&closes(59));
        assert!(run_scorer(&FixedScorer(50), &frame, &ScoreExtras::default()).is_none());
    }

    #[test]
    fn template_scores_at_exactly_min_bars() {
        let frame = frame_from_closes(&closes(60));
        let r = run_scorer(&FixedScorer(50), &frame, &ScoreExtras::default()).unwrap();
        assert_eq!(r.score, 50);
        assert!(r.indicators.contains_key("close"));
    }

    #[test]
    fn template_clamps_to_bounds() {
        let frame = frame_from_closes(&closes(60));
        let hi = run_scorer(&FixedScorer(250), &frame, &ScoreExtras::default()).unwrap();
        assert_eq!(hi.score, 100);
        let lo = run_scorer(&FixedScorer(-50), &frame, &ScoreExtras::default()).unwrap();
        assert_eq!(lo.score, 0);
    }

    #[test]
    fn disqualified_short_circuits_to_zero() {
        let frame = frame_from_closes(&closes(60));
        let r = run_scorer(&AlwaysDisqualified, &frame, &ScoreExtras::default()).unwrap();
        assert!(r.disqualified);
        assert_eq!(r.score, 0);
        assert!(r.signals.contains("NOPE_SIGNAL"));
        assert_eq!(r.reason.as_deref(), Some("nope"));
        assert!(r.group_scores.is_empty());
    }

    #[test]
    fn determinism_byte_identical_serialisation() {
        let frame = frame_from_closes(&closes(80));
        let a = run_scorer(&FixedScorer(40), &frame, &ScoreExtras::default()).unwrap();
        let b = run_scorer(&FixedScorer(40), &frame, &ScoreExtras::default()).unwrap();
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn registry_defaults_cover_all_versions() {
        let reg = ScorerRegistry::with_defaults();
        for v in ["v1", "v2", "v3", "v3.5", "v4", "v5", "v6", "v7", "v8"] {
            assert!(reg.get(v).is_some(), "missing scorer {v}");
        }
        assert!(reg.get("v99").is_none());
    }

    #[test]
    fn score_all_skips_short_histories() {
        let reg = ScorerRegistry::with_defaults();
        let frame = frame_from_closes(&closes(30));
        assert!(reg
            .score_all(&frame, &ScoreExtras::default())
            .is_empty());
    }

    #[test]
    fn score_all_bounds_invariant() {
        let reg = ScorerRegistry::with_defaults();
        let frame = frame_from_closes(&closes(130));
        for (v, r) in reg.score_all(&frame, &ScoreExtras::default()) {
            assert!((0..=100).contains(&r.score), "{v} score {} out of range", r.score);
            if r.disqualified {
                assert_eq!(r.score, 0, "{v} disqualified but non-zero");
            }
        }
    }
}
