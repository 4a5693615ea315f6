// =============================================================================
// v3: silent accumulation
// =============================================================================
//
// "Price can lie, volume cannot." Hunts the footprints of quiet accumulation:
// OBV divergence, the supply-test candle, the spring, the VCP coil, and
// pullbacks where volume disappears.
//
//   Trend        (max 25): alignment, SMA20 slope
//   Accumulation (max 40): OBV divergence +12, accumulation candle +10,
//                          spring +10, VCP +8
//   Volume       (max 20): pullback dry-up +8, 3x/2x spikes
//   Momentum     (max 15): RSI band, 60-day high proximity
//
// Reverse alignment disqualifies, as in v2.
// =============================================================================

use crate::indicators::{last, IndicatorFrame};

use super::patterns;
use super::{Disqualification, ScoreExtras, ScoreResult, Scorer};

pub struct ScorerV3;

impl Scorer for ScorerV3 {
    fn version(&self) -> &str {
        "v3"
    }

    fn check_disqualifiers(
        &self,
        frame: &IndicatorFrame,
        _extras: &ScoreExtras,
    ) -> Option<Disqualification> {
        if frame.is_reverse_aligned() {
            return Some(Disqualification::with_signal(
                "reverse alignment (SMA5 < SMA20 < SMA60)",
                "MA_REVERSE_ALIGNED",
            ));
        }
        None
    }

    fn score_groups(&self, frame: &IndicatorFrame, _extras: &ScoreExtras, out: &mut ScoreResult) {
        let bar = frame.last_bar();

        // ---- Trend (max 25) -------------------------------------------------
        let mut trend = 0i32;

        if frame.is_aligned() {
            trend += 5;
            out.signal("MA_ALIGNED");
        }

        let slope = last(&frame.sma20_slope);
        if slope.is_finite() {
            out.indicator("sma20_slope", slope);
            if slope >= 1.5 {
                trend += 15;
                out.signal("SLOPE_STEEP");
            } else if slope >= 0.5 {
                trend += 10;
                out.signal("SLOPE_RISING");
            } else if slope >= 0.0 {
                trend += 5;
                out.signal("SLOPE_FLAT_UP");
            }
        }

        out.group("trend", trend.min(25));

        // ---- Accumulation (max 40) -----------------------------------------
        let mut accumulation = 0i32;

        let div = patterns::obv_divergence(frame, 30);
        if div.bullish {
            accumulation += 12;
            out.signal("OBV_BULLISH_DIV");
            out.pattern("OBV_DIV");
            out.indicator("obv_div_strength", div.strength);
            out.indicator("obv_div_days", div.days as f64);
        }

        let candle = patterns::accumulation_candle(frame);
        if candle.detected {
            accumulation += 10;
            out.signal("ACCUMULATION_CANDLE");
            out.pattern("ACCUM_CANDLE");
            out.indicator("accum_vol_ratio", candle.volume_ratio);
            out.indicator("upper_wick_pct", candle.upper_wick_pct);
        }

        let spring = patterns::spring(frame);
        if spring.detected {
            accumulation += 10;
            out.signal("SPRING_PATTERN");
            out.pattern("SPRING");
            out.indicator("spring_recovery", spring.recovery_pct);
            if spring.volume_spike {
                out.signal("SPRING_VOLUME_SPIKE");
            }
        }

        let vcp = patterns::vcp(frame);
        if vcp.detected {
            accumulation += 8;
            out.signal("VCP_PATTERN");
            out.pattern("VCP");
            out.indicator("vcp_contraction", vcp.contraction_pct);
            if vcp.vol_contraction {
                out.signal("VCP_VOL_DRYUP");
            }
        }

        out.group("accumulation", accumulation.min(40));

        // ---- Volume (max 20) -----------------------------------------------
        let mut volume = 0i32;

        let dryup = patterns::pullback_dryup(frame);
        if dryup.detected {
            volume += 8;
            out.signal("PULLBACK_VOL_DRYUP");
            out.indicator("pullback_pct", dryup.pullback_pct);
            out.indicator("pullback_vol_ratio", dryup.vol_ratio);
        }

        let vol_ratio = last(&frame.vol_ratio);
        if vol_ratio.is_finite() {
            out.indicator("volume_ratio", vol_ratio);
            if vol_ratio >= 3.0 {
                volume += 12;
                out.signal("VOLUME_3X");
            } else if vol_ratio >= 2.0 {
                volume += 6;
                out.signal("VOLUME_2X");
            }
        }

        out.group("volume", volume.min(20));

        // ---- Momentum (max 15) ---------------------------------------------
        let mut momentum = 0i32;

        let rsi = last(&frame.rsi);
        if rsi.is_finite() {
            out.indicator("rsi", rsi);
            if (50.0..=70.0).contains(&rsi) {
                momentum += 8;
                out.signal("RSI_HEALTHY");
            } else if (40.0..50.0).contains(&rsi) {
                momentum += 4;
                out.signal("RSI_RECOVERING");
            }
        }

        let high_60d = frame.high_n(60);
        let high_pct = (bar.close / high_60d - 1.0) * 100.0;
        out.indicator("high_60d", high_60d);
        out.indicator("high_60d_pct", high_pct);
        if high_pct >= -5.0 {
            momentum += 7;
            out.signal("NEAR_60D_HIGH");
        } else if high_pct >= -10.0 {
            momentum += 3;
            out.signal("CLOSE_TO_60D");
        }

        out.group("momentum", momentum.min(15));
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::testutil::frame_from_closes_vols;
    use crate::scoring::{run_scorer, ScoreExtras};

    #[test]
    fn reverse_alignment_disqualifies() {
        let closes: Vec<f64> = (0..80).map(|i| 10_000.0 - i as f64 * 25.0).collect();
        let frame = frame_from_closes_vols(&closes, &vec![100_000.0; 80]);
        let r = run_scorer(&ScorerV3, &frame, &ScoreExtras::default()).unwrap();
        assert!(r.disqualified);
        assert_eq!(r.score, 0);
    }

    #[test]
    fn quiet_uptrend_collects_trend_and_momentum() {
        let closes: Vec<f64> = (0..80).map(|i| 10_000.0 + i as f64 * 40.0).collect();
        let frame = frame_from_closes_vols(&closes, &vec![100_000.0; 80]);
        let r = run_scorer(&ScorerV3, &frame, &ScoreExtras::default()).unwrap();
        assert!(!r.disqualified);
        assert!(*r.group_scores.get("trend").unwrap() > 0);
        assert!(r.signals.contains("NEAR_60D_HIGH"));
        assert!((0..=100).contains(&r.score));
    }

    #[test]
    fn group_caps_hold() {
        // upward drift plus chop, so the reverse-alignment gate stays open
        let closes: Vec<f64> = (0..80)
            .map(|i| 10_000.0 + i as f64 * 20.0 + (i as f64 * 17.0) % 300.0)
            .collect();
        let frame = frame_from_closes_vols(&closes, &vec![150_000.0; 80]);
        let r = run_scorer(&ScorerV3, &frame, &ScoreExtras::default()).unwrap();
        assert!(*r.group_scores.get("trend").unwrap() <= 25);
        assert!(*r.group_scores.get("accumulation").unwrap() <= 40);
        assert!(*r.group_scores.get("volume").unwrap() <= 20);
        assert!(*r.group_scores.get("momentum").unwrap() <= 15);
    }
}
