// =============================================================================
// v8: contrarian bounce
// =============================================================================
//
// The complement of v7: weak-trend names with strong reversal signals,
// hunting the short bounce. A trend that is already strong disqualifies, as
// do a falling-knife day, sub-0.5B liquidity, and five straight down
// candles.
//
//   Bounce (max 40): MACD reversal ladder, RSI exits, deep stochastic
//          crosses, the bounce candle itself
//   Energy (max 25): BB squeeze, ATR contraction, VCP
//   Bottom (max 20): BB lower-band bounce, 20-day range position, higher low
//   Supply (max 15): endpoint OBV divergence, OBV slope, investor flow
//
// Exit plan mirrors v7's tighter multiples with the ATR x 0.5 trailing arm.
// =============================================================================

use crate::indicators::{last, obv::obv_slope_pct, prev, IndicatorFrame};

use super::patterns;
use super::{Disqualification, ExitPlan, ScoreExtras, ScoreResult, Scorer};

pub struct ScorerV8;

impl Scorer for ScorerV8 {
    fn version(&self) -> &str {
        "v8"
    }

    fn check_disqualifiers(
        &self,
        frame: &IndicatorFrame,
        _extras: &ScoreExtras,
    ) -> Option<Disqualification> {
        let bar = frame.last_bar();
        let rsi = last(&frame.rsi);

        let (s5, s10, s20, s60) = (
            last(&frame.sma5),
            last(&frame.sma10),
            last(&frame.sma20),
            last(&frame.sma60),
        );
        let full_alignment =
            s5.is_finite() && s60.is_finite() && s5 > s10 && s10 > s20 && s20 > s60;
        if full_alignment && rsi.is_finite() && rsi > 75.0 {
            return Some(Disqualification::with_signal(
                "trend already too strong for a bounce entry",
                "TOO_STRONG_TREND",
            ));
        }

        if rsi.is_finite() && rsi > 80.0 {
            return Some(Disqualification::with_signal(
                "RSI above 80",
                "RSI_EXTREME_OVERBOUGHT",
            ));
        }

        if frame.change_pct() < -7.0 {
            return Some(Disqualification::with_signal(
                "falling knife",
                "FALLING_KNIFE",
            ));
        }

        if bar.trading_value() < 500_000_000.0 {
            return Some(Disqualification::with_signal(
                "trading value below 0.5B KRW",
                "LOW_LIQUIDITY",
            ));
        }

        if frame.down_days(5) >= 5 {
            return Some(Disqualification::with_signal(
                "five consecutive down candles",
                "CONSECUTIVE_DOWN_5DAYS",
            ));
        }

        None
    }

    fn score_groups(&self, frame: &IndicatorFrame, extras: &ScoreExtras, out: &mut ScoreResult) {
        let bar = frame.last_bar();
        let prev_bar = frame.prev_bar();

        // ---- Bounce signals (max 40) ---------------------------------------
        let mut bounce = 0i32;

        let macd = last(&frame.macd);
        let macd_sig = last(&frame.macd_signal);
        let p_macd = prev(&frame.macd, 1);
        let p_sig = prev(&frame.macd_signal, 1);
        let hist = last(&frame.macd_hist);
        let p_hist = prev(&frame.macd_hist, 1);
        let pp_hist = prev(&frame.macd_hist, 2);

        if macd.is_finite() && p_macd.is_finite() && macd > macd_sig && p_macd <= p_sig {
            bounce += 12;
            out.signal("MACD_GOLDEN_CROSS");
        } else if hist.is_finite() && p_hist.is_finite() && hist > 0.0 && p_hist <= 0.0 {
            bounce += 8;
            out.signal("MACD_HIST_CROSS_UP");
        } else if hist.is_finite() && hist > p_hist && p_hist > pp_hist {
            bounce += 4;
            out.signal("MACD_HIST_RISING");
        }

        let rsi = last(&frame.rsi);
        let p_rsi = prev(&frame.rsi, 1);
        if rsi.is_finite() && p_rsi.is_finite() {
            out.indicator("rsi", rsi);
            if rsi > 30.0 && p_rsi <= 30.0 {
                bounce += 10;
                out.signal("RSI_OVERSOLD_EXIT");
            } else if rsi > 35.0 && p_rsi <= 35.0 && rsi < 50.0 {
                bounce += 6;
                out.signal("RSI_RECOVERY");
            } else if (25.0..45.0).contains(&rsi) && rsi > p_rsi {
                bounce += 3;
                out.signal("RSI_TURNING_UP");
            }
        }

        let k = last(&frame.stoch_k);
        let d = last(&frame.stoch_d);
        let pk = prev(&frame.stoch_k, 1);
        let pd = prev(&frame.stoch_d, 1);
        let cross = k.is_finite() && pk.is_finite() && k > d && pk <= pd;
        if cross && k < 20.0 {
            bounce += 10;
            out.signal("STOCH_GOLDEN_DEEP_OVERSOLD");
        } else if cross && k < 30.0 {
            bounce += 7;
            out.signal("STOCH_GOLDEN_OVERSOLD");
        } else if cross && k < 50.0 {
            bounce += 4;
            out.signal("STOCH_GOLDEN");
        }

        let is_bullish = bar.close > bar.open;
        let body_pct = if bar.open > 0.0 {
            (bar.close - bar.open).abs() / bar.open * 100.0
        } else {
            0.0
        };
        let vol_ratio = last(&frame.vol_ratio);
        if is_bullish && body_pct > 3.0 && vol_ratio > 1.5 {
            bounce += 8;
            out.signal("STRONG_BOUNCE_CANDLE");
        } else if is_bullish && body_pct > 2.0 && vol_ratio > 1.2 {
            bounce += 5;
            out.signal("BOUNCE_CANDLE");
        } else if is_bullish && bar.close > prev_bar.close {
            bounce += 2;
            out.signal("UP_DAY");
        }

        out.group("bounce", bounce.min(40));

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
            out.signal("ATR_EXTREME_CONTRACTION");
        } else if atr_ratio < 0.85 {
            energy += 4;
            out.signal("ATR_CONTRACTION");
        }

        if patterns::vcp(frame).detected {
            energy += 7;
            out.signal("VCP_PATTERN");
            out.pattern("VCP");
        }

        out.group("energy", energy.min(25));

        // ---- Bottom confirmation (max 20) ----------------------------------
        let mut bottom = 0i32;

        let position = last(&frame.bb_position);
        let p_position = prev(&frame.bb_position, 1);
        if p_position.is_finite() && p_position < 0.1 && position > 0.15 {
            bottom += 8;
            out.signal("BB_LOWER_BOUNCE");
        } else if position.is_finite() && position < 0.2 && bar.close > prev_bar.close {
            bottom += 4;
            out.signal("NEAR_BB_LOWER");
        }

        let pos_in_range = last(&frame.pos_in_range);
        if pos_in_range.is_finite() {
            if pos_in_range < 0.15 && bar.close > prev_bar.close {
                bottom += 6;
                out.signal("NEAR_20D_LOW_BOUNCE");
            } else if pos_in_range < 0.25 {
                bottom += 3;
                out.signal("NEAR_20D_LOW");
            }
        }

        // Higher low: the newest lows sit above the 10-bar minimum made at
        // least five bars back.
        let n = frame.len();
        if n >= 10 {
            let lows: Vec<f64> = frame.bars[n - 10..].iter().map(|b| b.low).collect();
            let min_idx = lows
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .map(|(i, _)| i)
                .unwrap_or(0);
            if min_idx > 3 {
                let recent_low = lows[lows.len() - 3..].iter().cloned().fold(f64::MAX, f64::min);
                let old_low = lows[..=min_idx].iter().cloned().fold(f64::MAX, f64::min);
                if recent_low > old_low {
                    bottom += 6;
                    out.signal("HIGHER_LOW");
                }
            }
        }

        out.group("bottom", bottom.min(20));

        // ---- Supply (max 15) ------------------------------------------------
        let mut supply = 0i32;

        let (price_change, obv_change) = patterns::obv_endpoint_divergence(frame, 20);
        if price_change < -5.0 && obv_change > 0.0 {
            supply += 8;
            out.signal("OBV_BULLISH_DIVERGENCE");
        } else if price_change < 0.0 && obv_change > 0.0 {
            supply += 4;
            out.signal("OBV_MILD_DIVERGENCE");
        }

        let volumes: Vec<f64> = frame.bars.iter().map(|b| b.volume).collect();
        let slope = obv_slope_pct(&frame.obv, &volumes, 10);
        if slope > 3.0 {
            supply += 4;
            out.signal("OBV_RISING");
        } else if slope > 0.0 {
            supply += 2;
            out.signal("OBV_POSITIVE");
        }

        if let Some(flow) = &extras.investor {
            if flow.foreign_net > 0 || flow.institution_net > 0 {
                supply += 3;
                out.signal("INST_OR_FOREIGN_BUY");
            }
        }

        out.group("supply", supply.min(15));

        // ---- Warnings -------------------------------------------------------
        let trading_value = bar.trading_value();
        if (500_000_000.0..1_000_000_000.0).contains(&trading_value) {
            out.warning("MODERATE_LIQUIDITY");
        }
        let down = frame.down_days(5);
        if (3..=4).contains(&down) {
            out.warning("CONSECUTIVE_DOWN_DAYS");
        }
        let s60 = last(&frame.sma60);
        if s60.is_finite() && bar.close < s60 * 0.9 {
            out.warning("FAR_BELOW_MA60");
        }
    }

    fn attach_exit_plan(&self, frame: &IndicatorFrame, score: i32, out: &mut ScoreResult) {
        let close = frame.last_bar().close;
        let atr = last(&frame.atr);
        if !atr.is_finite() || close <= 0.0 {
            return;
        }

        let (target_mult, stop_mult, hold_days) = match score {
            s if s >= 70 => (1.8, 0.9, 4),
            s if s >= 55 => (1.5, 0.8, 3),
            s if s >= 45 => (1.3, 0.7, 3),
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
    fn falling_knife_disqualifies() {
        let mut bars: Vec<PriceBar> = (0..70)
            .map(|i| bar(i, 10_000.0, 10_100.0, 9_900.0, 10_000.0, 500_000.0))
            .collect();
        bars.push(bar(70, 9_900.0, 9_950.0, 9_100.0, 9_200.0, 800_000.0));
        let frame = frame_from_bars(bars);
        let r = run_scorer(&ScorerV8, &frame, &ScoreExtras::default()).unwrap();
        assert!(r.disqualified);
        assert!(r.signals.contains("FALLING_KNIFE"));
    }

    #[test]
    fn weak_liquidity_floor_is_half_a_billion() {
        // ~0.4B trading value: below v8's floor
        let closes: Vec<f64> = (0..70).map(|_| 4_000.0).collect();
        let frame = frame_from_closes_vols(&closes, &vec![100_000.0; 70]);
        let r = run_scorer(&ScorerV8, &frame, &ScoreExtras::default()).unwrap();
        assert!(r.disqualified);
        assert!(r.signals.contains("LOW_LIQUIDITY"));
    }

    #[test]
    fn bounce_candle_after_decline_scores() {
        let mut bars: Vec<PriceBar> = Vec::new();
        // drift down from 12000 to ~10200
        for i in 0..68 {
            let c = 12_000.0 - i as f64 * 26.0;
            bars.push(bar(i, c + 15.0, c + 40.0, c - 30.0, c, 300_000.0));
        }
        // strong bullish reversal candle on expanded volume
        bars.push(bar(68, 10_210.0, 10_270.0, 10_150.0, 10_240.0, 280_000.0));
        bars.push(bar(69, 10_240.0, 10_720.0, 10_220.0, 10_680.0, 700_000.0));
        let frame = frame_from_bars(bars);
        let r = run_scorer(&ScorerV8, &frame, &ScoreExtras::default()).unwrap();
        assert!(!r.disqualified, "reason {:?}", r.reason);
        assert!(
            r.signals.contains("STRONG_BOUNCE_CANDLE") || r.signals.contains("BOUNCE_CANDLE"),
            "signals {:?}",
            r.signals
        );
        assert!(r.exit_plan.is_some());
    }

    #[test]
    fn group_caps_hold() {
        let closes: Vec<f64> = (0..80)
            .map(|i| 10_000.0 - ((i * 19) % 37) as f64 * 8.0)
            .collect();
        let frame = frame_from_closes_vols(&closes, &vec![400_000.0; 80]);
        let r = run_scorer(&ScorerV8, &frame, &ScoreExtras::default()).unwrap();
        if !r.disqualified {
            assert!(*r.group_scores.get("bounce").unwrap() <= 40);
            assert!(*r.group_scores.get("energy").unwrap() <= 25);
            assert!(*r.group_scores.get("bottom").unwrap() <= 20);
            assert!(*r.group_scores.get("supply").unwrap() <= 15);
        }
    }
}
