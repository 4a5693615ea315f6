// =============================================================================
// v4: hybrid sniper
// =============================================================================
//
// Precision entries on accumulation evidence plus investor-flow
// confirmation. Reverse alignment disqualifies.
//
//   Trend    (max 30, floor -5): alignment, SMA20 slope, above the trend
//            line, MACD rising / bearish divergence penalty
//   Supply   (max 30, floor -8): volume tiers, trading-value tiers,
//            foreign + institutional 5-day net flow
//   Pattern  (max 20): VCP with volume contraction +12, OBV divergence +8
//   Momentum (max 20, floor -10): RSI band, StochRSI cross, 60-day
//            breakout, shooting-star penalty
// =============================================================================

use crate::indicators::{last, prev, IndicatorFrame};

use super::patterns;
use super::{Disqualification, ScoreExtras, ScoreResult, Scorer};

pub struct ScorerV4;

impl Scorer for ScorerV4 {
    fn version(&self) -> &str {
        "v4"
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

        // ---- Trend (max 30, floor -5) --------------------------------------
        let mut trend = 0i32;

        if frame.is_aligned() {
            trend += 5;
            out.signal("MA_ALIGNED");
        }

        let slope = last(&frame.sma20_slope);
        if slope.is_finite() {
            out.indicator("sma20_slope", slope);
            if slope >= 1.0 {
                trend += 15;
                out.signal("SLOPE_VERY_STEEP");
            } else if slope >= 0.5 {
                trend += 10;
                out.signal("SLOPE_STEEP");
            } else if slope >= 0.0 {
                trend += 5;
                out.signal("SLOPE_RISING");
            }
        }

        let st_dir = frame.supertrend_dir.last().copied().unwrap_or(0);
        let st_line = last(&frame.supertrend_line);
        if st_dir == 1 && st_line.is_finite() && bar.close > st_line {
            trend += 5;
            out.signal("ABOVE_TREND_LINE");
        }

        let macd = last(&frame.macd);
        let prev_macd = prev(&frame.macd, 1);
        let hist = last(&frame.macd_hist);
        let prev_hist = prev(&frame.macd_hist, 1);
        if macd.is_finite() {
            out.indicator("macd", macd);
            out.indicator("macd_hist", hist);
            if macd > 0.0 && hist > prev_hist {
                trend += 5;
                out.signal("MACD_RISING");
            } else if macd < prev_macd && bar.close > frame.prev_bar().close {
                trend -= 5;
                out.signal("MACD_BEARISH_DIV");
            }
        }

        out.group("trend", trend.clamp(-5, 30));

        // ---- Pattern (max 20) ----------------------------------------------
        let mut pattern = 0i32;

        let vcp = patterns::vcp(frame);
        if vcp.detected && vcp.vol_contraction {
            pattern += 12;
            out.signal("VCP_PATTERN");
            out.pattern("VCP");
            out.indicator("vcp_contraction", vcp.contraction_pct);
        }

        let div = patterns::obv_divergence(frame, 30);
        if div.bullish {
            pattern += 8;
            out.signal("OBV_BULLISH_DIV");
            out.pattern("OBV_DIV");
            out.indicator("obv_divergence_days", div.days as f64);
        }

        out.group("pattern", pattern.min(20));

        // ---- Momentum (max 20, floor -10) ----------------------------------
        let mut momentum = 0i32;

        let rsi = last(&frame.rsi);
        if rsi.is_finite() {
            out.indicator("rsi", rsi);
            if (60.0..=75.0).contains(&rsi) {
                momentum += 8;
                out.signal("RSI_SWEET_SPOT");
            } else if (50.0..60.0).contains(&rsi) {
                momentum += 4;
                out.signal("RSI_HEALTHY");
            } else if rsi > 85.0 {
                momentum -= 5;
                out.signal("RSI_EXTREME");
            }
        }

        let k = last(&frame.stochrsi_k);
        let d = last(&frame.stochrsi_d);
        let pk = prev(&frame.stochrsi_k, 1);
        let pd = prev(&frame.stochrsi_d, 1);
        if k.is_finite() && d.is_finite() {
            out.indicator("stoch_rsi_k", k);
            out.indicator("stoch_rsi_d", d);
            if pk < pd && k > d && k < 30.0 {
                momentum += 7;
                out.signal("STOCH_RSI_GOLDEN");
            } else if k > d && k < 80.0 {
                momentum += 4;
                out.signal("STOCH_RSI_BULLISH");
            }
        }

        let high_60d = frame.high_n(60);
        out.indicator("high_60d", high_60d);
        if bar.close >= high_60d {
            momentum += 5;
            out.signal("BREAKOUT_60D");
        }

        // Shooting star near the 60-day high: long upper wick, bearish body.
        let body = (bar.close - bar.open).abs();
        let upper = bar.high - bar.open.max(bar.close);
        let lower = bar.open.min(bar.close) - bar.low;
        if bar.high > bar.low
            && upper >= body * 2.0
            && lower < body
            && bar.close < bar.open
            && bar.close >= high_60d * 0.95
        {
            momentum -= 5;
            out.signal("SHOOTING_STAR");
            out.pattern("SHOOTING_STAR");
        }

        out.group("momentum", momentum.clamp(-10, 20));

        // ---- Supply (max 30, floor -8) -------------------------------------
        let mut supply = 0i32;

        let vol_ratio = last(&frame.vol_ratio);
        if vol_ratio.is_finite() {
            out.indicator("volume_ratio", vol_ratio);
            if vol_ratio >= 2.5 {
                supply += 12;
                out.signal("VOLUME_2.5X");
            } else if vol_ratio >= 2.0 {
                supply += 8;
                out.signal("VOLUME_2X");
            } else if vol_ratio >= 1.5 {
                supply += 4;
                out.signal("VOLUME_1.5X");
            }
        }

        let trading_value = bar.trading_value();
        if trading_value >= 50_000_000_000.0 {
            supply += 10;
            out.signal("VALUE_500B");
        } else if trading_value >= 10_000_000_000.0 {
            supply += 6;
            out.signal("VALUE_100B");
        } else if trading_value >= 3_000_000_000.0 {
            supply += 3;
            out.signal("VALUE_30B");
        } else if trading_value < 1_000_000_000.0 {
            supply -= 5;
            out.signal("LOW_LIQUIDITY");
        }

        if let Some(flow) = &extras.investor {
            out.indicator("foreign_net_5d", flow.foreign_net as f64);
            out.indicator("institution_net_5d", flow.institution_net as f64);

            let total = flow.foreign_net + flow.institution_net;
            if total > 0 {
                supply += 5;
                out.signal("INST_FOREIGN_BUY");
            } else if total < 0 {
                supply -= 3;
                out.signal("INST_FOREIGN_SELL");
            }

            if flow.foreign_consecutive_days >= 3 {
                supply += 3;
                out.signal("FOREIGN_CONSECUTIVE_BUY");
            }
        }

        out.group("supply", supply.clamp(-8, 30));

        let atr = last(&frame.atr);
        if atr.is_finite() && bar.close > 0.0 {
            out.indicator("atr", atr);
            out.indicator("atr_pct", atr / bar.close * 100.0);
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

    #[test]
    fn reverse_alignment_disqualifies() {
        let closes: Vec<f64> = (0..80).map(|i| 10_000.0 - i as f64 * 25.0).collect();
        let frame = frame_from_closes_vols(&closes, &vec![100_000.0; 80]);
        let r = run_scorer(&ScorerV4, &frame, &ScoreExtras::default()).unwrap();
        assert!(r.disqualified);
        assert_eq!(r.score, 0);
    }

    #[test]
    fn investor_flow_moves_the_supply_group() {
        let closes: Vec<f64> = (0..80).map(|i| 10_000.0 + i as f64 * 30.0).collect();
        let frame = frame_from_closes_vols(&closes, &vec![300_000.0; 80]);

        let neutral = run_scorer(&ScorerV4, &frame, &ScoreExtras::default()).unwrap();
        let buying = run_scorer(
            &ScorerV4,
            &frame,
            &ScoreExtras {
                investor: Some(InvestorFlow {
                    foreign_net: 10_000,
                    institution_net: 5_000,
                    foreign_consecutive_days: 4,
                    institution_consecutive_days: 0,
                }),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(
            buying.group_scores.get("supply").unwrap()
                >= neutral.group_scores.get("supply").unwrap()
        );
        assert!(buying.signals.contains("INST_FOREIGN_BUY"));
        assert!(buying.signals.contains("FOREIGN_CONSECUTIVE_BUY"));
    }

    #[test]
    fn group_floors_and_caps() {
        // drifting upward with chop, illiquid tape
        let closes: Vec<f64> = (0..80)
            .map(|i| 5_000.0 + i as f64 * 10.0 + (i as f64 * 7.0) % 100.0)
            .collect();
        let frame = frame_from_closes_vols(&closes, &vec![10.0; 80]);
        let r = run_scorer(&ScorerV4, &frame, &ScoreExtras::default()).unwrap();
        assert!(*r.group_scores.get("trend").unwrap() >= -5);
        assert!(*r.group_scores.get("supply").unwrap() >= -8);
        assert!(*r.group_scores.get("momentum").unwrap() >= -10);
        assert!((0..=100).contains(&r.score));
        // illiquid name takes the penalty
        assert!(r.signals.contains("LOW_LIQUIDITY"));
    }
}
