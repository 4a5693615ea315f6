// =============================================================================
// v10: leader-follower catch-up
// =============================================================================
//
// Correlated pairs inside a theme move together, but the follower lags the
// leader. When the leader has already moved today and the follower has not,
// the follower is scored on how strong the leader's move is, how tight the
// historical correlation is, and how wide the catch-up gap sits.
//
// Unlike v1..v8 this is not a per-frame strategy: it runs once per snapshot
// over the whole day's change map, against a precomputed reference of
// follower -> [(leader, correlation)] pairs.
//
//   base 50
//   + leader move:  >= 5% +35, >= 3% +25, else +15
//   + correlation:  >= 0.85 +25, >= 0.75 +20, >= 0.65 +15, else +10
//   + catch-up gap: >= 4 +25, >= 3 +20, >= 2 +15, else +10
//   best leader wins, clamped to 100
//
// A follower only activates when its leader is up at least 2% and the gap
// exceeds 1%. Without a reference map every ticker scores 0.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderRef {
    pub leader_code: String,
    pub correlation: f64,
}

/// Precomputed follower -> leaders mapping, refreshed offline from pairwise
/// return correlations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaderFollowerReference {
    #[serde(default)]
    pub follower_to_leaders: BTreeMap<String, Vec<LeaderRef>>,
}

impl LeaderFollowerReference {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read v10 reference from {}", path.display()))?;
        let reference: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse v10 reference from {}", path.display()))?;
        info!(
            path = %path.display(),
            followers = reference.follower_to_leaders.len(),
            "v10 leader-follower reference loaded"
        );
        Ok(reference)
    }

    pub fn is_empty(&self) -> bool {
        self.follower_to_leaders.is_empty()
    }
}

/// Score every follower in `today_changes` (ticker -> day change %).
/// Tickers without a leader mapping score 0.
pub fn score_v10(
    today_changes: &BTreeMap<String, f64>,
    reference: &LeaderFollowerReference,
) -> BTreeMap<String, i32> {
    let mut out = BTreeMap::new();

    for (code, &follower_change) in today_changes {
        let Some(leaders) = reference.follower_to_leaders.get(code) else {
            out.insert(code.clone(), 0);
            continue;
        };

        let mut best = 0i32;
        for leader in leaders {
            let leader_change = today_changes
                .get(&leader.leader_code)
                .copied()
                .unwrap_or(0.0);
            let gap = leader_change - follower_change;

            if leader_change < 2.0 || gap <= 1.0 {
                continue;
            }

            let mut score = 50;

            score += if leader_change >= 5.0 {
                35
            } else if leader_change >= 3.0 {
                25
            } else {
                15
            };

            score += if leader.correlation >= 0.85 {
                25
            } else if leader.correlation >= 0.75 {
                20
            } else if leader.correlation >= 0.65 {
                15
            } else {
                10
            };

            score += if gap >= 4.0 {
                25
            } else if gap >= 3.0 {
                20
            } else if gap >= 2.0 {
                15
            } else {
                10
            };

            best = best.max(score);
        }

        out.insert(code.clone(), best.min(100));
    }

    out
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn reference(corr: f64) -> LeaderFollowerReference {
        let mut map = BTreeMap::new();
        map.insert(
            "000100".to_string(),
            vec![LeaderRef {
                leader_code: "000200".to_string(),
                correlation: corr,
            }],
        );
        LeaderFollowerReference {
            follower_to_leaders: map,
        }
    }

    fn changes(leader: f64, follower: f64) -> BTreeMap<String, f64> {
        let mut m = BTreeMap::new();
        m.insert("000100".to_string(), follower);
        m.insert("000200".to_string(), leader);
        m
    }

    #[test]
    fn no_reference_scores_zero() {
        let scores = score_v10(&changes(5.0, 0.5), &LeaderFollowerReference::default());
        assert_eq!(scores.get("000100"), Some(&0));
    }

    #[test]
    fn leader_must_be_up_two_percent() {
        let scores = score_v10(&changes(1.9, 0.0), &reference(0.9));
        assert_eq!(scores.get("000100"), Some(&0));
    }

    #[test]
    fn gap_must_exceed_one_percent() {
        let scores = score_v10(&changes(3.0, 2.5), &reference(0.9));
        assert_eq!(scores.get("000100"), Some(&0));
    }

    #[test]
    fn strong_leader_and_tight_correlation_max_out() {
        // leader +6%, follower +0.5%: gap 5.5, correlation 0.9
        // 50 + 35 + 25 + 25 = 135 -> clamped 100
        let scores = score_v10(&changes(6.0, 0.5), &reference(0.9));
        assert_eq!(scores.get("000100"), Some(&100));
    }

    #[test]
    fn tier_arithmetic() {
        // leader +2.5%, follower +0.8%: gap 1.7
        // 50 + 15 + 20 (corr 0.8) + 10 = 95
        let scores = score_v10(&changes(2.5, 0.8), &reference(0.8));
        assert_eq!(scores.get("000100"), Some(&95));
    }

    #[test]
    fn leaders_themselves_score_zero_without_mapping() {
        let scores = score_v10(&changes(6.0, 0.5), &reference(0.9));
        assert_eq!(scores.get("000200"), Some(&0));
    }

    #[test]
    fn best_leader_wins() {
        let mut map = BTreeMap::new();
        map.insert(
            "000100".to_string(),
            vec![
                LeaderRef {
                    leader_code: "000200".to_string(),
                    correlation: 0.6,
                },
                LeaderRef {
                    leader_code: "000300".to_string(),
                    correlation: 0.9,
                },
            ],
        );
        let reference = LeaderFollowerReference {
            follower_to_leaders: map,
        };
        let mut changes = BTreeMap::new();
        changes.insert("000100".to_string(), 0.0);
        changes.insert("000200".to_string(), 2.5);
        changes.insert("000300".to_string(), 5.5);
        let scores = score_v10(&changes, &reference);
        // strongest pair: 50 + 35 + 25 + 25 = 135 -> 100
        assert_eq!(scores.get("000100"), Some(&100));
    }
}
