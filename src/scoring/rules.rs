// =============================================================================
// YAML-backed scoring rules
// =============================================================================
//
// A strategy can be expressed as data instead of code: a YAML file listing
// disqualifiers and scoring groups, each rule carrying a condition string.
//
// Condition grammar:
//   - variable lookup (missing variables read as 0)
//   - numeric literals
//   - comparators  <  <=  ==  !=  >=  >
//   - AND / OR (split at the top level; AND = all, OR = any)
//   - chained variable ranges:   SMA_5 < SMA_20 < SMA_60
//   - numeric ranges:            60 <= RSI <= 75
//   - `_prev` suffix for the previous bar's value of a variable
//
// Inside a group, rules sharing an `exclusive_group` tag are first-match-
// wins. Group totals clip to [min_score, max_score].
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

pub type IndicatorMap = BTreeMap<String, f64>;

// =============================================================================
// Config file shape
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RuleFile {
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_min_data_days")]
    pub min_data_days: usize,
    #[serde(default = "default_max_score")]
    pub max_score: i32,
    #[serde(default)]
    pub disqualifiers: Vec<DisqualifierRule>,
    #[serde(default)]
    pub scoring_groups: BTreeMap<String, ScoringGroup>,
}

fn default_min_data_days() -> usize {
    60
}

fn default_max_score() -> i32 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisqualifierRule {
    pub name: String,
    pub condition: String,
    #[serde(default)]
    pub signal: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoringGroup {
    #[serde(default = "default_max_score")]
    pub max_score: i32,
    #[serde(default)]
    pub min_score: i32,
    #[serde(default)]
    pub rules: Vec<ScoringRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoringRule {
    pub name: String,
    pub condition: String,
    pub score: i32,
    #[serde(default)]
    pub signal: String,
    #[serde(default)]
    pub exclusive_group: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RuleOutcome {
    pub score: i32,
    pub groups: BTreeMap<String, i32>,
    pub signals: Vec<String>,
    pub disqualified: bool,
    pub disqualify_reason: Option<String>,
}

impl RuleFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read rule file {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("failed to parse scoring rule yaml")
    }

    /// Evaluate disqualifiers then every group against `indicators`.
    pub fn evaluate(&self, indicators: &IndicatorMap) -> RuleOutcome {
        let mut out = RuleOutcome::default();

        for dq in &self.disqualifiers {
            if evaluate_condition(&dq.condition, indicators) {
                out.disqualified = true;
                out.disqualify_reason = Some(dq.name.clone());
                if !dq.signal.is_empty() {
                    out.signals.push(dq.signal.clone());
                }
                return out;
            }
        }

        let mut total = 0i32;
        for (group_name, group) in &self.scoring_groups {
            let mut group_score = 0i32;
            let mut taken_exclusive: Vec<&str> = Vec::new();

            for rule in &group.rules {
                if let Some(tag) = &rule.exclusive_group {
                    if taken_exclusive.contains(&tag.as_str()) {
                        continue;
                    }
                }
                if evaluate_condition(&rule.condition, indicators) {
                    group_score += rule.score;
                    if !rule.signal.is_empty() {
                        out.signals.push(rule.signal.clone());
                    }
                    if let Some(tag) = &rule.exclusive_group {
                        taken_exclusive.push(tag.as_str());
                    }
                }
            }

            let clipped = group_score.clamp(group.min_score, group.max_score);
            out.groups.insert(format!("{group_name}_score"), clipped);
            total += clipped;
        }

        out.score = total.clamp(0, self.max_score);
        out
    }
}

// =============================================================================
// RuleScorer: a rule file behaving as a registered strategy
// =============================================================================

use crate::indicators::{last, prev, IndicatorFrame};

use super::{Disqualification, ScoreExtras, ScoreResult, Scorer};

/// Adapter that lets a YAML rule file sit in the scorer registry next to
/// the coded strategies. The frame's last-bar values are flattened into the
/// indicator map the conditions reference, with `_prev` entries for the
/// previous bar.
pub struct RuleScorer {
    file: RuleFile,
}

impl RuleScorer {
    pub fn new(file: RuleFile) -> Self {
        Self { file }
    }

    fn indicator_map(frame: &IndicatorFrame) -> IndicatorMap {
        let bar = frame.last_bar();
        let mut map = IndicatorMap::new();

        let mut put = |key: &str, value: f64| {
            if value.is_finite() {
                map.insert(key.to_string(), value);
            }
        };

        put("CLOSE", bar.close);
        put("OPEN", bar.open);
        put("HIGH", bar.high);
        put("LOW", bar.low);
        put("VOLUME", bar.volume);
        put("CHANGE_PCT", frame.change_pct());
        put("TRADING_VALUE", bar.trading_value());

        let columns: &[(&str, &Vec<f64>)] = &[
            ("SMA_5", &frame.sma5),
            ("SMA_10", &frame.sma10),
            ("SMA_20", &frame.sma20),
            ("SMA_60", &frame.sma60),
            ("SMA_120", &frame.sma120),
            ("SMA20_SLOPE", &frame.sma20_slope),
            ("RSI", &frame.rsi),
            ("MACD", &frame.macd),
            ("MACDs", &frame.macd_signal),
            ("MACDh", &frame.macd_hist),
            ("BB_WIDTH", &frame.bb_width),
            ("BB_POSITION", &frame.bb_position),
            ("VOL_RATIO", &frame.vol_ratio),
            ("OBV", &frame.obv),
            ("OBV_MA", &frame.obv_ma20),
            ("ATR", &frame.atr),
            ("STOCH_K", &frame.stoch_k),
            ("STOCH_D", &frame.stoch_d),
        ];
        for (key, column) in columns {
            put(key, last(column));
            put(&format!("{key}_prev"), prev(column, 1));
        }

        put("HIGH_60D", frame.high_n(60));

        map
    }
}

impl Scorer for RuleScorer {
    fn version(&self) -> &str {
        &self.file.version
    }

    fn min_data_bars(&self) -> usize {
        self.file.min_data_days
    }

    fn check_disqualifiers(
        &self,
        frame: &IndicatorFrame,
        _extras: &ScoreExtras,
    ) -> Option<Disqualification> {
        let map = Self::indicator_map(frame);
        for dq in &self.file.disqualifiers {
            if evaluate_condition(&dq.condition, &map) {
                let mut out = Disqualification::new(dq.name.clone());
                // Signals are owned strings in the file; surface through
                // the reason, the template attaches no static signal here.
                if !dq.signal.is_empty() {
                    out.reason = format!("{} ({})", dq.name, dq.signal);
                }
                return Some(out);
            }
        }
        None
    }

    fn score_groups(&self, frame: &IndicatorFrame, _extras: &ScoreExtras, out: &mut ScoreResult) {
        let map = Self::indicator_map(frame);
        let outcome = self.file.evaluate(&map);
        for (group, score) in outcome.groups {
            let name = group.trim_end_matches("_score").to_string();
            out.group(&name, score);
        }
        for signal in outcome.signals {
            out.signal(&signal);
        }
    }
}

// =============================================================================
// Condition evaluation
// =============================================================================

/// Evaluate one condition string. Unparseable conditions are false (and
/// warned once per evaluation), matching a data-driven file's failure mode.
pub fn evaluate_condition(condition: &str, indicators: &IndicatorMap) -> bool {
    let condition = condition.trim();
    if condition.is_empty() {
        return false;
    }

    // AND / OR split at the top level (equal precedence, short-circuit
    // through all/any like the chained evaluation it replaces).
    if let Some(parts) = split_connector(condition, " AND ") {
        return parts.iter().all(|p| evaluate_condition(p, indicators));
    }
    if let Some(parts) = split_connector(condition, " OR ") {
        return parts.iter().any(|p| evaluate_condition(p, indicators));
    }

    // Chained range: three operands, two comparators from {<, <=}.
    if let Some((a, op1, b, op2, c)) = parse_chain(condition) {
        let av = resolve(&a, indicators);
        let bv = resolve(&b, indicators);
        let cv = resolve(&c, indicators);
        return compare(av, &op1, bv) && compare(bv, &op2, cv);
    }

    // Single comparison.
    if let Some((left, op, right)) = parse_compare(condition) {
        let lv = resolve(&left, indicators);
        let rv = resolve(&right, indicators);
        return compare(lv, &op, rv);
    }

    warn!(condition, "unparseable scoring condition");
    false
}

fn split_connector<'a>(s: &'a str, connector: &str) -> Option<Vec<&'a str>> {
    if s.contains(connector) {
        Some(s.split(connector).map(str::trim).collect())
    } else {
        None
    }
}

/// Tokenize into operand/operator alternation; returns (a, op1, b, op2, c)
/// when the string is a two-comparator chain.
fn parse_chain(s: &str) -> Option<(String, String, String, String, String)> {
    let tokens = tokenize(s)?;
    if tokens.len() == 5
        && is_operator(&tokens[1])
        && is_operator(&tokens[3])
        && matches!(tokens[1].as_str(), "<" | "<=")
        && matches!(tokens[3].as_str(), "<" | "<=")
    {
        return Some((
            tokens[0].clone(),
            tokens[1].clone(),
            tokens[2].clone(),
            tokens[3].clone(),
            tokens[4].clone(),
        ));
    }
    None
}

fn parse_compare(s: &str) -> Option<(String, String, String)> {
    let tokens = tokenize(s)?;
    if tokens.len() == 3 && is_operator(&tokens[1]) {
        return Some((tokens[0].clone(), tokens[1].clone(), tokens[2].clone()));
    }
    None
}

fn is_operator(t: &str) -> bool {
    matches!(t, "<" | "<=" | "==" | "!=" | ">=" | ">")
}

/// Split into operands and comparison operators.
fn tokenize(s: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '<' || c == '>' || c == '=' || c == '!' {
            if !current.trim().is_empty() {
                tokens.push(current.trim().to_string());
            }
            current = String::new();

            let mut op = String::from(c);
            if i + 1 < chars.len() && chars[i + 1] == '=' {
                op.push('=');
                i += 1;
            }
            // bare '=' reads as equality
            if op == "=" {
                op = "==".to_string();
            }
            if !is_operator(&op) {
                return None;
            }
            tokens.push(op);
        } else {
            current.push(c);
        }
        i += 1;
    }
    if !current.trim().is_empty() {
        tokens.push(current.trim().to_string());
    }

    if tokens.is_empty() {
        None
    } else {
        Some(tokens)
    }
}

/// Numeric literal, `_prev`-suffixed variable, or plain variable (0 when
/// absent).
fn resolve(expr: &str, indicators: &IndicatorMap) -> f64 {
    let expr = expr.trim();
    if let Ok(v) = expr.parse::<f64>() {
        return v;
    }
    if let Some(base) = expr.strip_suffix("_prev") {
        if let Some(v) = indicators.get(expr) {
            return *v;
        }
        return indicators.get(base).copied().unwrap_or(0.0);
    }
    indicators.get(expr).copied().unwrap_or(0.0)
}

fn compare(left: f64, op: &str, right: f64) -> bool {
    match op {
        "<" => left < right,
        "<=" => left <= right,
        ">" => left > right,
        ">=" => left >= right,
        "==" => left == right,
        "!=" => left != right,
        _ => false,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn ind(pairs: &[(&str, f64)]) -> IndicatorMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn simple_comparisons() {
        let m = ind(&[("RSI", 65.0)]);
        assert!(evaluate_condition("RSI >= 60", &m));
        assert!(evaluate_condition("RSI < 70", &m));
        assert!(!evaluate_condition("RSI > 70", &m));
        assert!(evaluate_condition("RSI == 65", &m));
        assert!(evaluate_condition("RSI != 64", &m));
    }

    #[test]
    fn missing_variables_read_as_zero() {
        let m = ind(&[]);
        assert!(evaluate_condition("UNKNOWN <= 0", &m));
        assert!(!evaluate_condition("UNKNOWN > 0", &m));
    }

    #[test]
    fn and_or_connectors() {
        let m = ind(&[("RSI", 65.0), ("VOL_RATIO", 3.0)]);
        assert!(evaluate_condition("RSI >= 60 AND VOL_RATIO >= 2", &m));
        assert!(!evaluate_condition("RSI >= 70 AND VOL_RATIO >= 2", &m));
        assert!(evaluate_condition("RSI >= 70 OR VOL_RATIO >= 2", &m));
    }

    #[test]
    fn chained_variable_range() {
        let m = ind(&[("SMA_5", 90.0), ("SMA_20", 95.0), ("SMA_60", 100.0)]);
        assert!(evaluate_condition("SMA_5 < SMA_20 < SMA_60", &m));
        assert!(!evaluate_condition("SMA_60 < SMA_20 < SMA_5", &m));
    }

    #[test]
    fn numeric_range() {
        let m = ind(&[("RSI", 65.0)]);
        assert!(evaluate_condition("60 <= RSI <= 75", &m));
        assert!(!evaluate_condition("70 <= RSI <= 75", &m));
    }

    #[test]
    fn prev_suffix_resolution() {
        // explicit _prev entry wins; otherwise fall back to the current value
        let m = ind(&[("RSI", 65.0), ("RSI_prev", 40.0)]);
        assert!(evaluate_condition("RSI_prev <= 45", &m));
        let fallback = ind(&[("MACD", 1.5)]);
        assert!(evaluate_condition("MACD_prev >= 1", &fallback));
    }

    #[test]
    fn garbage_is_false() {
        let m = ind(&[]);
        assert!(!evaluate_condition("what is this", &m));
        assert!(!evaluate_condition("", &m));
    }

    const SAMPLE: &str = r#"
version: v2
name: trend-follow
min_data_days: 60
max_score: 100
disqualifiers:
  - name: reverse_alignment
    condition: "SMA_5 < SMA_20 < SMA_60"
    signal: MA_REVERSE_ALIGNED
scoring_groups:
  trend:
    max_score: 30
    rules:
      - name: aligned
        condition: "SMA_5 > SMA_20 AND SMA_20 > SMA_60"
        score: 5
        signal: MA_ALIGNED
      - name: slope_very_steep
        condition: "SMA20_SLOPE >= 3"
        score: 15
        signal: MA_20_VERY_STEEP
        exclusive_group: slope
      - name: slope_steep
        condition: "SMA20_SLOPE >= 1.5"
        score: 10
        signal: MA_20_STEEP
        exclusive_group: slope
  momentum:
    max_score: 35
    min_score: -10
    rules:
      - name: rsi_sweet_spot
        condition: "60 <= RSI <= 75"
        score: 15
        signal: RSI_SWEET_SPOT
"#;

    #[test]
    fn rule_file_end_to_end() {
        let file = RuleFile::parse(SAMPLE).unwrap();
        assert_eq!(file.version, "v2");

        // disqualified
        let m = ind(&[("SMA_5", 90.0), ("SMA_20", 95.0), ("SMA_60", 100.0)]);
        let out = file.evaluate(&m);
        assert!(out.disqualified);
        assert_eq!(out.score, 0);
        assert_eq!(out.signals, vec!["MA_REVERSE_ALIGNED"]);

        // exclusive group: only the first matching slope rule applies
        let m = ind(&[
            ("SMA_5", 110.0),
            ("SMA_20", 105.0),
            ("SMA_60", 100.0),
            ("SMA20_SLOPE", 4.0),
            ("RSI", 65.0),
        ]);
        let out = file.evaluate(&m);
        assert!(!out.disqualified);
        // trend: 5 + 15 (steep rule skipped) = 20; momentum: 15
        assert_eq!(out.groups.get("trend_score"), Some(&20));
        assert_eq!(out.groups.get("momentum_score"), Some(&15));
        assert_eq!(out.score, 35);
        assert!(out.signals.contains(&"MA_20_VERY_STEEP".to_string()));
        assert!(!out.signals.contains(&"MA_20_STEEP".to_string()));
    }

    #[test]
    fn rule_scorer_registers_and_scores() {
        use crate::scoring::{run_scorer, ScoreExtras, ScorerRegistry};

        let yaml = r#"
version: v11
name: experimental
min_data_days: 60
scoring_groups:
  trend:
    max_score: 40
    rules:
      - name: aligned
        condition: "SMA_5 > SMA_20 AND SMA_20 > SMA_60"
        score: 20
        signal: MA_ALIGNED
      - name: above_close
        condition: "CLOSE > SMA_20"
        score: 10
        signal: ABOVE_MA20
"#;
        let mut registry = ScorerRegistry::with_defaults();
        registry.register(Box::new(RuleScorer::new(RuleFile::parse(yaml).unwrap())));
        assert!(registry.get("v11").is_some());

        let closes: Vec<f64> = (0..80).map(|i| 100.0 + i as f64 * 2.0).collect();
        let frame = crate::scoring::testutil::frame_from_closes(&closes);
        let scorer = registry.get("v11").unwrap();
        let r = run_scorer(scorer, &frame, &ScoreExtras::default()).unwrap();
        assert_eq!(r.version, "v11");
        assert_eq!(r.score, 30);
        assert!(r.signals.contains("MA_ALIGNED"));
        assert!(r.signals.contains("ABOVE_MA20"));
    }

    #[test]
    fn rule_scorer_disqualifies_from_yaml() {
        let yaml = r#"
version: v11
disqualifiers:
  - name: reverse_alignment
    condition: "SMA_5 < SMA_20 < SMA_60"
    signal: MA_REVERSE_ALIGNED
scoring_groups: {}
"#;
        let scorer = RuleScorer::new(RuleFile::parse(yaml).unwrap());
        let closes: Vec<f64> = (0..80).map(|i| 300.0 - i as f64 * 2.0).collect();
        let frame = crate::scoring::testutil::frame_from_closes(&closes);
        let r =
            crate::scoring::run_scorer(&scorer, &frame, &crate::scoring::ScoreExtras::default())
                .unwrap();
        assert!(r.disqualified);
        assert_eq!(r.score, 0);
        assert!(r.reason.unwrap().contains("reverse_alignment"));
    }

    #[test]
    fn group_clipping() {
        let yaml = r#"
version: vtest
scoring_groups:
  g:
    max_score: 10
    rules:
      - name: a
        condition: "X > 0"
        score: 8
      - name: b
        condition: "X > 0"
        score: 8
"#;
        let file = RuleFile::parse(yaml).unwrap();
        let out = file.evaluate(&ind(&[("X", 1.0)]));
        assert_eq!(out.groups.get("g_score"), Some(&10));
    }
}
