// =============================================================================
// v7: trend momentum with strict filters
// =============================================================================
//
// The hardened successor of v6: counter-trend entries, near resistance, and
// illiquid names are disqualified outright instead of merely warned, the
// targets come in and the stops tighten.
//
// Disqualifiers, in order: below MA60 (close under 98% of it), strong
// reverse alignment (close under 95% of MA20 with 5 < 10 < 20), RSI above
// 85, climax top, -5% day, resistance inside the +5% target zone, four
// consecutive down candles, trading value under 1B KRW.
//
//   Trend    (max 25): full / partial alignment, above MA20 / MA60
//   Momentum (max 30): MACD cross ladder, RSI exits, stochastic, volume bull
//   Energy   (max 25): BB squeeze, ATR contraction, VCP
//   Support  (max 20): OBV slope, MA support, investor flow
//
// Exit plan: tighter multiples plus a trailing trigger at ATR x 0.5.
// =============================================================================

use crate::indicators::{last, obv::obv_slope_pct, prev, IndicatorFrame};

use super::patterns;
use super::{Disqualification, ExitPlan, ScoreExtras, ScoreResult, Scorer};

pub struct ScorerV7;

impl Scorer for ScorerV7 {
    fn version(&self) -> &str {
        "v7"
    }

    fn check_disqualifiers(
        &self,
        frame: &IndicatorFrame,
        _extras: &ScoreExtras,
    ) -> Option<Disqualification> {
        let bar = frame.last_bar();
        let (s5, s10, s20, s60) = (
            last(&frame.sma5),
            last(&frame.sma10),
            last(&frame.sma20),
            last(&frame.sma60),
        );

        if s60.is_finite() && bar.close < s60 * 0.98 {
            return Some(Disqualification::with_signal(
                "close below MA60",
                "BELOW_MA60",
            ));
        }

        if s20.is_finite() && bar.close < s20 * 0.95 && s5 < s10 && s10 < s20 {
            return Some(Disqualification::with_signal(
                "strong reverse alignment",
                "STRONG_REVERSE_ALIGNMENT",
            ));
        }

        let rsi = last(&frame.rsi);
        if rsi.is_finite() && rsi > 85.0 {
            return Some(Disqualification::with_signal(
                "RSI above 85",
                "RSI_EXTREME_OVERBOUGHT",
            ));
        }

        if last(&frame.bb_position) > 1.1 && last(&frame.vol_ratio) > 3.0 {
            return Some(Disqualification::with_signal(
                "possible climax top",
                "POSSIBLE_CLIMAX_TOP",
            ));
        }

        if frame.change_pct() < -5.0 {
            return Some(Disqualification::with_signal(
                "sharp single-day decline",
                "SHARP_DECLINE",
            ));
        }

        let resistance = patterns::resistance_nearby(frame);
        if resistance.exists {
            if let Some(level) = resistance.level {
                if level <= bar.close * 1.05 {
                    return Some(Disqualification::with_signal(
                        "resistance inside the target zone",
                        "RESISTANCE_IN_TARGET_ZONE",
                    ));
                }
            }
        }

        if frame.down_days(5) >= 4 {
            return Some(Disqualification::with_signal(
                "four consecutive down candles",
                "CONSECUTIVE_DOWN_4DAYS",
            ));
        }

        if bar.trading_value() < 1_000_000_000.0 {
            return Some(Disqualification::with_signal(
                "trading value below 1B KRW",
                "SEVERE_LOW_LIQUIDITY",
            ));
        }

        None
    }

    fn score_groups(&self, frame: &IndicatorFrame, extras: &ScoreExtras, out: &mut ScoreResult) {
        let bar = frame.last_bar();
        let (s5, s10, s20, s60) = (
            last(&frame.sma5),
            last(&frame.sma10),
            last(&frame.sma20),
            last(&frame.sma60),
        );

        // ---- Trend confirmation (max 25) -----------------------------------
        let mut trend = 0i32;

        let full_alignment =
            s5.is_finite() && s60.is_finite() && s5 > s10 && s10 > s20 && s20 > s60;
        let partial_alignment =
            s20.is_finite() && s60.is_finite() && bar.close > s20 && s20 > s60;

        if full_alignment {
            trend += 15;
            out.signal("FULL_ALIGNMENT");
        } else if partial_alignment {
            trend += 10;
            out.signal("PARTIAL_ALIGNMENT");
        }

        if s20.is_finite() && bar.close > s20 {
            trend += 5;
            out.signal("ABOVE_MA20");
        }
        if s60.is_finite() && bar.close > s60 {
            trend += 5;
            out.signal("ABOVE_MA60");
        }

        out.group("trend", trend.min(25));

        // ---- Momentum reversal (max 30) ------------------------------------
        let mut momentum = 0i32;

        let macd = last(&frame.macd);
        let macd_sig = last(&frame.macd_signal);
        let p_macd = prev(&frame.macd, 1);
        let p_sig = prev(&frame.macd_signal, 1);
        let hist = last(&frame.macd_hist);
        let p_hist = prev(&frame.macd_hist, 1);
        let pp_hist = prev(&frame.macd_hist, 2);

        if macd.is_finite() && p_macd.is_finite() && macd > macd_sig && p_macd <= p_sig {
            momentum += 10;
            out.signal("MACD_GOLDEN_CROSS");
        } else if hist.is_finite() && p_hist.is_finite() && hist > 0.0 && p_hist <= 0.0 {
            momentum += 6;
            out.signal("MACD_HIST_CROSS_UP");
        } else if hist.is_finite() && hist > p_hist && p_hist > pp_hist {
            momentum += 3;
            out.signal("MACD_HIST_RISING");
        }

        let rsi = last(&frame.rsi);
        let p_rsi = prev(&frame.rsi, 1);
        if rsi.is_finite() && p_rsi.is_finite() {
            out.indicator("rsi", rsi);
            if rsi > 30.0 && p_rsi <= 30.0 {
                momentum += 8;
                out.signal("RSI_OVERSOLD_EXIT");
            } else if (30.0..50.0).contains(&rsi) && rsi > p_rsi {
                momentum += 4;
                out.signal("RSI_TURNING_UP");
            }
        }

        let k = last(&frame.stoch_k);
        let d = last(&frame.stoch_d);
        let pk = prev(&frame.stoch_k, 1);
        let pd = prev(&frame.stoch_d, 1);
        let cross = k.is_finite() && pk.is_finite() && k > d && pk <= pd;
        if cross && k < 30.0 {
            momentum += 7;
            out.signal("STOCH_GOLDEN_OVERSOLD");
        } else if cross && k < 50.0 {
            momentum += 4;
            out.signal("STOCH_GOLDEN");
        }

        if bar.close > bar.open
            && last(&frame.vol_ratio) > 2.0
            && bar.close > frame.prev_bar().close
        {
            momentum += 5;
            out.signal("VOLUME_SURGE_BULLISH");
        }

        out.group("momentum", momentum.min(30));

        // ---- Energy accumulation (max 25) ----------------------------------
        let mut energy = 0i32;

        let width = last(&frame.bb_width);
        let width_ma = last(&frame.bb_width_ma);
        let squeeze_ratio = if width_ma.is_finite() && width_ma > 0.0 {
            width / width_ma
        } else {
            1.0
        };
        if squeeze_ratio < 0.6 {
            energy += 10;
            out.signal("BB_EXTREME_SQUEEZE");
            out.pattern("ENERGY_SQUEEZE");
        } else if squeeze_ratio < 0.75 {
            energy += 6;
            out.signal("BB_STRONG_SQUEEZE");
        } else if squeeze_ratio < 0.9 {
            energy += 3;
            out.signal("BB_SQUEEZE");
        }

        let atr = last(&frame.atr);
        let atr_ma = last(&frame.atr_ma);
        let atr_ratio = if atr_ma.is_finite() && atr_ma > 0.0 {
            atr / atr_ma
        } else {
            1.0
        };
        if atr_ratio < 0.7 {
            energy += 8;
            out.signal("ATR_CONTRACTION");
        } else if atr_ratio < 0.85 {
            energy += 4;
            out.signal("ATR_SHRINKING");
        }

        if patterns::vcp(frame).detected {
            energy += 7;
            out.signal("VCP_PATTERN");
            out.pattern("VCP");
        }

        out.group("energy", energy.min(25));

        // ---- Support / supply (max 20) -------------------------------------
        let mut support = 0i32;

        let volumes: Vec<f64> = frame.bars.iter().map(|b| b.volume).collect();
        let slope = obv_slope_pct(&frame.obv, &volumes, 10);
        out.indicator("obv_slope", slope);
        if slope > 5.0 {
            support += 8;
            out.signal("OBV_STRONG_RISING");
        } else if slope > 0.0 {
            support += 4;
            out.signal("OBV_RISING");
        }

        let ma = patterns::ma_support(frame);
        if ma.ma20 {
            support += 4;
            out.signal("MA20_SUPPORT");
        }
        if ma.ma60 {
            support += 3;
            out.signal("MA60_SUPPORT");
        }

        if let Some(flow) = &extras.investor {
            if flow.foreign_net > 0 && flow.institution_net > 0 {
                support += 5;
                out.signal("INST_FOREIGN_BOTH_BUY");
            } else if flow.foreign_net > 0 || flow.institution_net > 0 {
                support += 3;
                out.signal("INST_OR_FOREIGN_BUY");
            }
        }

        out.group("support", support.min(20));

        // ---- Warnings -------------------------------------------------------
        let trading_value = bar.trading_value();
        if (1_000_000_000.0..2_000_000_000.0).contains(&trading_value) {
            out.warning("MODERATE_LOW_LIQUIDITY");
        }
        let n = frame.len();
        if n >= 20 {
            let base = frame.bars[n - 20].close;
            if base > 0.0 && (bar.close - base) / base * 100.0 > 30.0 {
                out.warning("OVEREXTENDED_20D");
            }
        }
        if frame.down_days(5) == 3 {
            out.warning("CONSECUTIVE_DOWN_3DAYS");
        }
    }

    fn attach_exit_plan(&self, frame: &IndicatorFrame, score: i32, out: &mut ScoreResult) {
        let close = frame.last_bar().close;
        let atr = last(&frame.atr);
        if !atr.is_finite() || close <= 0.0 {
            return;
        }

        let (target_mult, stop_mult, hold_days) = match score {
            s if s >= 80 => (1.8, 0.9, 4),
            s if s >= 70 => (1.5, 0.8, 3),
            s if s >= 60 => (1.3, 0.7, 3),
            _ => (1.0, 0.6, 2),
        };

        out.exit_plan = Some(ExitPlan {
            entry: close,
            target_price: close + atr * target_mult,
            stop_price: close - atr * stop_mult,
            trailing_trigger: Some(close + atr * 0.5),
            max_hold_days: hold_days,
            atr,
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::testutil::{frame_from_bars, frame_from_closes_vols};
    use crate::scoring::{run_scorer, ScoreExtras};
    use crate::types::PriceBar;

    fn bar(i: usize, o: f64, h: f64, l: f64, c: f64, v: f64) -> PriceBar {
        PriceBar {
            ts: chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
                + chrono::Duration::days(i as i64),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
        }
    }

    #[test]
    fn below_ma60_disqualifies() {
        let mut closes: Vec<f64> = (0..70).map(|_| 10_000.0).collect();
        closes.push(9_500.0); // 5% below the flat MA60
        let frame = frame_from_closes_vols(&closes, &vec![500_000.0; 71]);
        let r = run_scorer(&ScorerV7, &frame, &ScoreExtras::default()).unwrap();
        assert!(r.disqualified);
        assert!(r.signals.contains("BELOW_MA60"));
    }

    #[test]
    fn thin_names_disqualify() {
        // healthy zigzag uptrend (RSI stays moderate), but trading value far
        // below 1B KRW
        let mut closes = Vec::new();
        let mut c = 1_000.0;
        for i in 0..70 {
            c += if i % 2 == 0 { 6.0 } else { -3.8 };
            closes.push(c);
        }
        let frame = frame_from_closes_vols(&closes, &vec![100.0; 70]);
        let r = run_scorer(&ScorerV7, &frame, &ScoreExtras::default()).unwrap();
        assert!(r.disqualified, "reason {:?}", r.reason);
        assert!(r.signals.contains("SEVERE_LOW_LIQUIDITY"), "{:?}", r.signals);
    }

    #[test]
    fn clean_uptrend_gets_trend_points_and_trailing_plan() {
        // zigzag advance keeps RSI off the 85 disqualifier
        let mut bars: Vec<PriceBar> = Vec::new();
        let mut c = 10_000.0;
        for i in 0..80 {
            c += if i % 2 == 0 { 80.0 } else { -40.0 };
            bars.push(bar(i, c - 30.0, c + 40.0, c - 60.0, c, 500_000.0));
        }
        let frame = frame_from_bars(bars);
        let r = run_scorer(&ScorerV7, &frame, &ScoreExtras::default()).unwrap();
        assert!(!r.disqualified, "reason {:?}", r.reason);
        assert!(*r.group_scores.get("trend").unwrap() >= 10);
        let plan = r.exit_plan.expect("exit plan");
        assert!(plan.trailing_trigger.is_some());
        assert!(plan.max_hold_days <= 4);
    }

    #[test]
    fn four_down_candles_disqualify() {
        let mut bars: Vec<PriceBar> = (0..70)
            .map(|i| bar(i, 10_000.0, 10_100.0, 9_950.0, 10_050.0, 500_000.0))
            .collect();
        for i in 0..4 {
            let c = 10_040.0 - i as f64 * 10.0;
            bars.push(bar(70 + i, c + 20.0, c + 30.0, c - 10.0, c, 500_000.0));
        }
        let frame = frame_from_bars(bars);
        let r = run_scorer(&ScorerV7, &frame, &ScoreExtras::default()).unwrap();
        assert!(r.disqualified);
        assert!(r.signals.contains("CONSECUTIVE_DOWN_4DAYS"));
    }
}
