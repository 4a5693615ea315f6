// =============================================================================
// Per-user policy: condition DSL and hard buy filters
// =============================================================================
//
// Users express entries as score conditions over the snapshot row, e.g.
// "V1>=60 AND V5>=50 AND V4>40". Connectors are left-associative with equal
// precedence, evaluated strictly left to right. An empty DSL falls back to
// a single-score threshold against the user's score_version.
//
// Hard filters run in order and short-circuit: market hours, enabled flag,
// gap limit, the hour-scaled volume-ratio floor, slot count, the daily
// blacklist, already-held. Survivors are ranked score-first with prior-day
// traded value breaking ties.
// =============================================================================

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::snapshot::SnapshotRow;
use crate::types::TradeMode;

// =============================================================================
// UserPolicy
// =============================================================================

fn default_score_version() -> String {
    "v2".to_string()
}

fn default_min_buy_score() -> i32 {
    70
}

fn default_sell_score() -> i32 {
    40
}

fn default_stop_loss_rate() -> f64 {
    7.0
}

fn default_take_profit_rate() -> f64 {
    20.0
}

fn default_max_holdings() -> usize {
    5
}

fn default_max_daily_trades() -> u32 {
    10
}

fn default_max_hold_days() -> i64 {
    5
}

fn default_per_ticker_budget() -> i64 {
    1_000_000
}

fn default_gap_limit_pct() -> f64 {
    15.0
}

/// One user's trading policy, read at tick entry and never mutated mid-tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: TradeMode,
    #[serde(default = "default_score_version")]
    pub score_version: String,
    #[serde(default)]
    pub buy_conditions: String,
    #[serde(default)]
    pub sell_conditions: String,
    #[serde(default = "default_min_buy_score")]
    pub min_buy_score: i32,
    #[serde(default = "default_sell_score")]
    pub sell_score: i32,
    /// Positive percent; a holding down this much is cut.
    #[serde(default = "default_stop_loss_rate")]
    pub stop_loss_rate: f64,
    #[serde(default = "default_take_profit_rate")]
    pub take_profit_rate: f64,
    #[serde(default = "default_max_holdings")]
    pub max_holdings: usize,
    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,
    #[serde(default = "default_max_hold_days")]
    pub max_hold_days: i64,
    /// Per-ticker budget cap (KRW) before macro adjustment.
    #[serde(default = "default_per_ticker_budget")]
    pub per_ticker_budget: i64,
    #[serde(default)]
    pub min_volume_ratio: f64,
    #[serde(default = "default_gap_limit_pct")]
    pub gap_limit_pct: f64,
}

impl Default for UserPolicy {
    fn default() -> Self {
        serde_json::from_str("{}").expect("all fields have defaults")
    }
}

// =============================================================================
// Condition DSL
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Ge,
    Le,
    Gt,
    Lt,
    Eq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Lowercased score key, e.g. "v1" or "v3.5".
    pub score_key: String,
    pub op: CmpOp,
    pub value: i32,
    /// Connector joining this condition to the previous one.
    pub connector: Connector,
}

/// Parse a buy/sell condition string. An empty string parses to an empty
/// list (the caller falls back to the score-version threshold); anything
/// else malformed is a config error that skips the user for the day.
pub fn parse_conditions(input: &str) -> EngineResult<Vec<Condition>> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(Vec::new());
    }

    let mut conditions = Vec::new();
    let mut connector = Connector::And;

    for word in input.split_whitespace() {
        match word.to_uppercase().as_str() {
            "AND" => connector = Connector::And,
            "OR" => connector = Connector::Or,
            _ => {
                let cond = parse_term(word, connector)
                    .ok_or_else(|| EngineError::Config(format!("bad condition term: {word}")))?;
                conditions.push(cond);
            }
        }
    }

    if conditions.is_empty() {
        return Err(EngineError::Config(format!("no conditions in: {input}")));
    }
    Ok(conditions)
}

fn parse_term(term: &str, connector: Connector) -> Option<Condition> {
    let ops = [
        (">=", CmpOp::Ge),
        ("<=", CmpOp::Le),
        (">", CmpOp::Gt),
        ("<", CmpOp::Lt),
        ("=", CmpOp::Eq),
    ];
    for (text, op) in ops {
        if let Some(idx) = term.find(text) {
            let key = term[..idx].trim().to_lowercase();
            let value: i32 = term[idx + text.len()..].trim().parse().ok()?;
            if !key.starts_with('v') || key.len() < 2 {
                return None;
            }
            // The tail must be digits with at most one dot (v1, v3.5, v10).
            if !key[1..].chars().all(|c| c.is_ascii_digit() || c == '.') {
                return None;
            }
            return Some(Condition {
                score_key: key,
                op,
                value,
                connector,
            });
        }
    }
    None
}

/// Left-to-right evaluation with equal AND/OR precedence. Missing score
/// keys read as 0. Empty condition lists are false; callers use the
/// threshold fallback instead.
pub fn evaluate_conditions(conditions: &[Condition], scores: &BTreeMap<String, i32>) -> bool {
    if conditions.is_empty() {
        return false;
    }

    let mut result = eval_one(&conditions[0], scores);
    for cond in &conditions[1..] {
        let value = eval_one(cond, scores);
        result = match cond.connector {
            Connector::And => result && value,
            Connector::Or => result || value,
        };
    }
    result
}

fn eval_one(cond: &Condition, scores: &BTreeMap<String, i32>) -> bool {
    let score = scores.get(&cond.score_key).copied().unwrap_or(0);
    match cond.op {
        CmpOp::Ge => score >= cond.value,
        CmpOp::Le => score <= cond.value,
        CmpOp::Gt => score > cond.value,
        CmpOp::Lt => score < cond.value,
        CmpOp::Eq => score == cond.value,
    }
}

// =============================================================================
// Hard filters
// =============================================================================

/// Session-hour floor on the 5-day volume ratio: early hours tolerate thin
/// prints, the close does not.
pub fn volume_ratio_floor(hour: u32) -> f64 {
    match hour {
        h if h < 10 => 0.10,
        h if h < 11 => 0.30,
        h if h < 12 => 0.50,
        h if h < 14 => 0.70,
        _ => 1.00,
    }
}

/// A candidate that survived every buy filter.
#[derive(Debug, Clone)]
pub struct BuyCandidate {
    pub code: String,
    pub name: String,
    pub market: String,
    /// Ranking score: the DSL's first score key, or the score_version score.
    pub score: i32,
    pub scores: BTreeMap<String, i32>,
    pub close: i64,
    pub change_pct: f64,
    pub prev_amount: i64,
    pub volume_ratio: f64,
    pub signals: String,
}

/// Why a row was rejected; used for logs and the journal, never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    BelowScore,
    GapOverLimit,
    VolumeRatioLow,
    AlreadyHeld,
    Blacklisted,
    PendingOrder,
}

/// Evaluate the full buy filter chain over a snapshot. The caller has
/// already verified market hours and the enabled flag; slots are applied
/// here as the final truncation.
#[allow(clippy::too_many_arguments)]
pub fn select_candidates(
    rows: &[SnapshotRow],
    policy: &UserPolicy,
    buy_conditions: &[Condition],
    clock: &dyn Clock,
    held: &HashSet<String>,
    blacklist: &HashSet<String>,
    pending_buys: &HashSet<String>,
    free_slots: usize,
) -> Vec<BuyCandidate> {
    let hour = chrono::Timelike::hour(&clock.now());
    let floor = volume_ratio_floor(hour).max(policy.min_volume_ratio);

    // 14:50..15:00 tightens the fallback threshold.
    let min_score = if clock.is_pre_closing() {
        policy.min_buy_score + 5
    } else {
        policy.min_buy_score
    };

    let mut candidates = Vec::new();
    for row in rows {
        let scores = row.scores();

        let score = if buy_conditions.is_empty() {
            let s = row.score(&policy.score_version);
            if s < min_score {
                continue;
            }
            s
        } else {
            if !evaluate_conditions(buy_conditions, &scores) {
                continue;
            }
            scores
                .get(&buy_conditions[0].score_key)
                .copied()
                .unwrap_or(0)
        };

        if row.change_pct >= policy.gap_limit_pct {
            continue;
        }
        if row.volume_ratio < floor {
            continue;
        }
        if held.contains(&row.code) {
            continue;
        }
        if blacklist.contains(&row.code) {
            continue;
        }
        if pending_buys.contains(&row.code) {
            continue;
        }

        candidates.push(BuyCandidate {
            code: row.code.clone(),
            name: row.name.clone(),
            market: row.market.clone(),
            score,
            scores,
            close: row.close,
            change_pct: row.change_pct,
            prev_amount: row.prev_amount,
            volume_ratio: row.volume_ratio,
            signals: row.signals.clone(),
        });
    }

    candidates.sort_by(|a, b| (b.score, b.prev_amount).cmp(&(a.score, a.prev_amount)));
    candidates.truncate(free_slots);
    candidates
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    fn scores(pairs: &[(&str, i32)]) -> BTreeMap<String, i32> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn parses_the_reference_expression() {
        let conds = parse_conditions("V1>=60 AND V5>=50 AND V4>40").unwrap();
        assert_eq!(conds.len(), 3);
        assert_eq!(conds[0].score_key, "v1");
        assert_eq!(conds[0].op, CmpOp::Ge);
        assert_eq!(conds[0].value, 60);
        assert_eq!(conds[2].op, CmpOp::Gt);
        assert_eq!(conds[2].connector, Connector::And);
    }

    #[test]
    fn empty_dsl_parses_empty() {
        assert!(parse_conditions("").unwrap().is_empty());
        assert!(parse_conditions("   ").unwrap().is_empty());
    }

    #[test]
    fn malformed_dsl_is_config_error() {
        assert!(parse_conditions("X1>=60").is_err());
        assert!(parse_conditions("V1 ?? 60").is_err());
        assert!(parse_conditions("AND AND").is_err());
    }

    #[test]
    fn v3_5_token_accepted() {
        let conds = parse_conditions("V3.5>=40").unwrap();
        assert_eq!(conds[0].score_key, "v3.5");
    }

    #[test]
    fn evaluation_is_left_to_right() {
        // false AND true OR true => (false AND true) OR true => true
        let conds = parse_conditions("V1>=90 AND V2>=10 OR V4>=10").unwrap();
        let s = scores(&[("v1", 50), ("v2", 50), ("v4", 50)]);
        assert!(evaluate_conditions(&conds, &s));

        // false OR true AND false => (false OR true) AND false => false
        let conds = parse_conditions("V1>=90 OR V2>=10 AND V4>=90").unwrap();
        assert!(!evaluate_conditions(&conds, &s));
    }

    #[test]
    fn missing_scores_read_as_zero() {
        let conds = parse_conditions("V7>=1").unwrap();
        assert!(!evaluate_conditions(&conds, &scores(&[("v1", 99)])));
        let conds = parse_conditions("V7<=0").unwrap();
        assert!(evaluate_conditions(&conds, &scores(&[("v1", 99)])));
    }

    #[test]
    fn hour_floor_table() {
        assert!((volume_ratio_floor(9) - 0.10).abs() < 1e-12);
        assert!((volume_ratio_floor(10) - 0.30).abs() < 1e-12);
        assert!((volume_ratio_floor(11) - 0.50).abs() < 1e-12);
        assert!((volume_ratio_floor(12) - 0.70).abs() < 1e-12);
        assert!((volume_ratio_floor(13) - 0.70).abs() < 1e-12);
        assert!((volume_ratio_floor(14) - 1.00).abs() < 1e-12);
        assert!((volume_ratio_floor(15) - 1.00).abs() < 1e-12);
    }

    // ---- candidate selection ------------------------------------------------

    fn row(code: &str, v2: i32, change_pct: f64, vol_ratio: f64, amount: i64) -> SnapshotRow {
        SnapshotRow {
            code: code.to_string(),
            name: format!("Name{code}"),
            market: "KOSDAQ".to_string(),
            open: 10_000,
            high: 10_500,
            low: 9_900,
            close: 10_200,
            prev_close: 10_000,
            change_pct,
            volume: 100_000,
            volume_ratio: vol_ratio,
            prev_amount: amount,
            prev_marcap: 50_000_000_000,
            buy_strength: 0.0,
            foreign_net: 0,
            inst_net: 0,
            rel_strength: 0.0,
            v1: 50,
            v2,
            v3_5: 0,
            v4: 45,
            v5: 55,
            v6: 0,
            v7: 0,
            v8: 0,
            v9_prob: 0.0,
            v10: 0,
            signals: String::new(),
        }
    }

    fn policy() -> UserPolicy {
        UserPolicy {
            enabled: true,
            min_buy_score: 70,
            ..Default::default()
        }
    }

    fn empty() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn threshold_fallback_and_sorting() {
        let rows = vec![
            row("000001", 80, 2.0, 2.0, 1_000_000_000),
            row("000002", 90, 2.0, 2.0, 1_000_000_000),
            row("000003", 60, 2.0, 2.0, 1_000_000_000),
            // same score as 000001 but more liquid: ranks ahead of it
            row("000004", 80, 2.0, 2.0, 9_000_000_000),
        ];
        let clock = FixedClock::at("2026-03-02 10:30:00");
        let picked = select_candidates(
            &rows,
            &policy(),
            &[],
            &clock,
            &empty(),
            &empty(),
            &empty(),
            10,
        );
        let codes: Vec<&str> = picked.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(codes, vec!["000002", "000004", "000001"]);
    }

    #[test]
    fn gap_boundary_at_fifteen_percent() {
        let rows = vec![
            row("000001", 95, 14.9, 2.0, 1_000_000_000),
            row("000002", 95, 15.0, 2.0, 1_000_000_000),
            row("000003", 95, 16.2, 2.0, 1_000_000_000),
        ];
        let clock = FixedClock::at("2026-03-02 10:30:00");
        let picked = select_candidates(
            &rows,
            &policy(),
            &[],
            &clock,
            &empty(),
            &empty(),
            &empty(),
            10,
        );
        let codes: Vec<&str> = picked.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(codes, vec!["000001"]);
    }

    #[test]
    fn volume_floor_scales_with_hour() {
        let rows = vec![row("000001", 95, 2.0, 0.2, 1_000_000_000)];
        // 09:30: floor 0.10, passes
        let early = select_candidates(
            &rows,
            &policy(),
            &[],
            &FixedClock::at("2026-03-02 09:30:00"),
            &empty(),
            &empty(),
            &empty(),
            10,
        );
        assert_eq!(early.len(), 1);
        // 14:10: floor 1.0, fails
        let late = select_candidates(
            &rows,
            &policy(),
            &[],
            &FixedClock::at("2026-03-02 14:10:00"),
            &empty(),
            &empty(),
            &empty(),
            10,
        );
        assert!(late.is_empty());
    }

    #[test]
    fn held_blacklisted_and_pending_excluded() {
        let rows = vec![
            row("000001", 95, 2.0, 2.0, 1_000_000_000),
            row("000002", 95, 2.0, 2.0, 1_000_000_000),
            row("000003", 95, 2.0, 2.0, 1_000_000_000),
        ];
        let clock = FixedClock::at("2026-03-02 10:30:00");
        let held: HashSet<String> = ["000001".to_string()].into();
        let blacklist: HashSet<String> = ["000002".to_string()].into();
        let pending: HashSet<String> = ["000003".to_string()].into();
        let picked =
            select_candidates(&rows, &policy(), &[], &clock, &held, &blacklist, &pending, 10);
        assert!(picked.is_empty());
    }

    #[test]
    fn slots_truncate_after_sorting() {
        let rows = vec![
            row("000001", 80, 2.0, 2.0, 1_000_000_000),
            row("000002", 90, 2.0, 2.0, 1_000_000_000),
        ];
        let clock = FixedClock::at("2026-03-02 10:30:00");
        let picked = select_candidates(
            &rows,
            &policy(),
            &[],
            &clock,
            &empty(),
            &empty(),
            &empty(),
            1,
        );
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].code, "000002");
    }

    #[test]
    fn custom_dsl_ranks_by_first_key() {
        let conds = parse_conditions("V1>=40 AND V5>=50").unwrap();
        let rows = vec![
            row("000001", 10, 2.0, 2.0, 1_000_000_000), // v1=50, v5=55: passes
        ];
        let clock = FixedClock::at("2026-03-02 10:30:00");
        let picked = select_candidates(
            &rows,
            &policy(),
            &conds,
            &clock,
            &empty(),
            &empty(),
            &empty(),
            10,
        );
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].score, 50); // the v1 score, not v2
    }

    #[test]
    fn pre_closing_tightens_fallback_threshold() {
        let rows = vec![row("000001", 72, 2.0, 2.0, 1_000_000_000)];
        // normal hours: 72 >= 70 passes
        let normal = select_candidates(
            &rows,
            &policy(),
            &[],
            &FixedClock::at("2026-03-02 11:00:00"),
            &empty(),
            &empty(),
            &empty(),
            10,
        );
        assert_eq!(normal.len(), 1);
        // 14:55: threshold is 75, fails
        let tightened = select_candidates(
            &rows,
            &policy(),
            &[],
            &FixedClock::at("2026-03-02 14:55:00"),
            &empty(),
            &empty(),
            &empty(),
            10,
        );
        assert!(tightened.is_empty());
    }
}
