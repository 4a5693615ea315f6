// =============================================================================
// v3.5: accumulation with disclosure confirmation
// =============================================================================
//
// v3's accumulation read, hardened with three filters the plain version
// lacks:
//
//   - Wyckoff phase   (max 20): where inside the trading range the
//     accumulation is happening; a spring inside the lower half of the
//     range reads as phase C (the final shakeout)
//   - Disclosure      (max 15): a recent 5%+ large-holding filing confirms
//     the accumulation hypothesis externally
//   - Short-cover filter: price rising while OBV falls looks like covering,
//     not accumulation; the volume-side groups are zeroed
//   - High-zone filter: accumulation signals at 95%+ of the 60-day high are
//     distribution in disguise; the accumulation group is zeroed
//
//   Accumulation (max 25), Volume (max 15), Trend/Momentum (max 25)
//   round out the 100.
// =============================================================================

use crate::indicators::{last, IndicatorFrame};

use super::patterns;
use super::{Disqualification, ScoreExtras, ScoreResult, Scorer};

pub struct ScorerV35;

impl Scorer for ScorerV35 {
    fn version(&self) -> &str {
        "v3.5"
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

    fn score_groups(&self, frame: &IndicatorFrame, extras: &ScoreExtras, out: &mut ScoreResult) {
        let bar = frame.last_bar();
        let high_60d = frame.high_n(60);
        let in_high_zone = bar.close >= high_60d * 0.95;
        if in_high_zone {
            out.signal("HIGH_ZONE");
        }

        // Short-cover read: 10-bar price gain on falling OBV.
        let (price_change, obv_change) = patterns::obv_endpoint_divergence(frame, 10);
        let short_cover_suspect = price_change > 3.0 && obv_change < 0.0;
        if short_cover_suspect {
            out.signal("SHORT_COVER_SUSPECT");
        }

        // ---- Disclosure (max 15) -------------------------------------------
        let disclosure = if extras.holding_disclosure {
            out.signal("HOLDING_DISCLOSURE_5PCT");
            15
        } else {
            0
        };
        out.group("disclosure", disclosure);

        // ---- Wyckoff phase (max 20) ----------------------------------------
        let mut wyckoff = 0i32;
        let pos = last(&frame.pos_in_range);
        let spring = patterns::spring(frame);
        let exhaustion = patterns::selling_exhaustion(frame, 5);
        if spring.detected && pos.is_finite() && pos < 0.5 {
            wyckoff = 20;
            out.signal("WYCKOFF_PHASE_C");
            out.pattern("WYCKOFF_SPRING");
        } else if pos.is_finite() && (0.2..=0.6).contains(&pos) {
            let range_pct = {
                let hi = last(&frame.high_20d);
                let lo = last(&frame.low_20d);
                if lo > 0.0 {
                    (hi - lo) / lo * 100.0
                } else {
                    f64::MAX
                }
            };
            if range_pct < 15.0 {
                wyckoff = 10;
                out.signal("WYCKOFF_PHASE_B");
            }
        } else if exhaustion.exhausted {
            wyckoff = 5;
            out.signal("WYCKOFF_PHASE_A");
        }
        out.group("wyckoff", wyckoff.min(20));

        // ---- Accumulation (max 25, zeroed in the high zone) ----------------
        let mut accumulation = 0i32;
        if !in_high_zone {
            let div = patterns::obv_divergence(frame, 30);
            if div.bullish {
                accumulation += 10;
                out.signal("OBV_BULLISH_DIV");
                out.pattern("OBV_DIV");
            }
            let candle = patterns::accumulation_candle(frame);
            if candle.detected {
                accumulation += 8;
                out.signal("ACCUMULATION_CANDLE");
                out.pattern("ACCUM_CANDLE");
            }
            let vcp = patterns::vcp(frame);
            if vcp.detected {
                accumulation += 7;
                out.signal("VCP_PATTERN");
                out.pattern("VCP");
            }
        }
        out.group("accumulation", accumulation.min(25));

        // ---- Volume (max 15, zeroed on short-cover suspicion) --------------
        let mut volume = 0i32;
        if !short_cover_suspect {
            let dryup = patterns::pullback_dryup(frame);
            if dryup.detected {
                volume += 8;
                out.signal("PULLBACK_VOL_DRYUP");
            }
            let vol_ratio = last(&frame.vol_ratio);
            if vol_ratio.is_finite() {
                out.indicator("volume_ratio", vol_ratio);
                if vol_ratio >= 3.0 {
                    volume += 7;
                    out.signal("VOLUME_3X");
                } else if vol_ratio >= 2.0 {
                    volume += 4;
                    out.signal("VOLUME_2X");
                }
            }
        }
        out.group("volume", volume.min(15));

        // ---- Trend / momentum (max 25) -------------------------------------
        let mut trend = 0i32;

        if frame.is_aligned() {
            trend += 5;
            out.signal("MA_ALIGNED");
        }
        let slope = last(&frame.sma20_slope);
        if slope.is_finite() {
            out.indicator("sma20_slope", slope);
            if slope >= 1.5 {
                trend += 10;
                out.signal("SLOPE_STEEP");
            } else if slope >= 0.5 {
                trend += 6;
                out.signal("SLOPE_RISING");
            } else if slope >= 0.0 {
                trend += 3;
                out.signal("SLOPE_FLAT_UP");
            }
        }
        let rsi = last(&frame.rsi);
        if rsi.is_finite() {
            out.indicator("rsi", rsi);
            if (50.0..=70.0).contains(&rsi) {
                trend += 10;
                out.signal("RSI_HEALTHY");
            } else if (40.0..50.0).contains(&rsi) {
                trend += 5;
                out.signal("RSI_RECOVERING");
            }
        }

        out.group("trend", trend.min(25));

        // Confirmed-accumulation combination bonus.
        let inst_buying = extras
            .investor
            .as_ref()
            .map_or(false, |f| f.institution_net > 0);
        if extras.holding_disclosure && wyckoff >= 20 && inst_buying {
            out.group("confirmation_bonus", 15);
            out.signal("CONFIRMED_ACCUMULATION");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::testutil::frame_from_closes_vols;
    use crate::scoring::{run_scorer, InvestorFlow, ScoreExtras};

    fn base_frame() -> crate::indicators::IndicatorFrame {
        // drifting upward with chop: never reverse aligned
        let closes: Vec<f64> = (0..80)
            .map(|i| 10_000.0 + i as f64 * 15.0 + (i as f64 * 13.0) % 40.0)
            .collect();
        frame_from_closes_vols(&closes, &vec![120_000.0; 80])
    }

    #[test]
    fn reverse_alignment_disqualifies() {
        let closes: Vec<f64> = (0..80).map(|i| 10_000.0 - i as f64 * 25.0).collect();
        let frame = frame_from_closes_vols(&closes, &vec![100_000.0; 80]);
        let r = run_scorer(&ScorerV35, &frame, &ScoreExtras::default()).unwrap();
        assert!(r.disqualified);
        assert_eq!(r.score, 0);
    }

    #[test]
    fn disclosure_adds_its_group() {
        let frame = base_frame();
        let without = run_scorer(&ScorerV35, &frame, &ScoreExtras::default()).unwrap();
        let with = run_scorer(
            &ScorerV35,
            &frame,
            &ScoreExtras {
                holding_disclosure: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(*with.group_scores.get("disclosure").unwrap(), 15);
        assert!(with.score >= without.score);
        assert!(with.signals.contains("HOLDING_DISCLOSURE_5PCT"));
    }

    #[test]
    fn high_zone_zeroes_accumulation() {
        // steady climb ending at the 60-day high
        let closes: Vec<f64> = (0..80).map(|i| 10_000.0 + i as f64 * 50.0).collect();
        let frame = frame_from_closes_vols(&closes, &vec![120_000.0; 80]);
        let r = run_scorer(&ScorerV35, &frame, &ScoreExtras::default()).unwrap();
        assert!(r.signals.contains("HIGH_ZONE"));
        assert_eq!(*r.group_scores.get("accumulation").unwrap(), 0);
    }

    #[test]
    fn investor_confirmation_requires_all_three() {
        let frame = base_frame();
        let extras = ScoreExtras {
            holding_disclosure: true,
            investor: Some(InvestorFlow {
                institution_net: 1_000,
                ..Default::default()
            }),
            ..Default::default()
        };
        let r = run_scorer(&ScorerV35, &frame, &extras).unwrap();
        // the bonus only appears alongside a phase-C read
        if r.group_scores.contains_key("confirmation_bonus") {
            assert!(r.signals.contains("WYCKOFF_PHASE_C"));
        }
    }
}
