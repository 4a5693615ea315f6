// =============================================================================
// v5: long-bullish-candle setup
// =============================================================================
//
// Looks for the N-shaped continuation: a +7% candle on doubled volume, then
// a quiet pullback into Fibonacci support while the coil tightens. No
// disqualifier; seven groups sum to a raw score of at most 145, compressed
// piecewise onto 0..100:
//
//   raw <= 50  -> raw * 0.8
//   raw <= 90  -> 40 + (raw - 50)
//   raw  > 90  -> 80 + (raw - 90) * 0.4
// =============================================================================

use crate::indicators::{last, prev, IndicatorFrame};

use super::patterns;
use super::{Disqualification, ScoreExtras, ScoreResult, Scorer};

pub struct ScorerV5;

/// A recent long bullish candle and its retracement levels.
struct BullishEvent {
    fib_38: f64,
    fib_50: f64,
    fib_62: f64,
}

impl Scorer for ScorerV5 {
    fn version(&self) -> &str {
        "v5"
    }

    fn check_disqualifiers(
        &self,
        _frame: &IndicatorFrame,
        _extras: &ScoreExtras,
    ) -> Option<Disqualification> {
        None
    }

    fn score_groups(&self, frame: &IndicatorFrame, _extras: &ScoreExtras, out: &mut ScoreResult) {
        let bar = frame.last_bar();
        let n = frame.len();

        let obv_trend = last(&frame.obv) > last(&frame.obv_ma20);

        // ---- Pullback after a long bullish candle (max 30) -----------------
        let mut pullback = 0i32;
        let events = recent_long_bullish(frame, 5);
        if !events.is_empty() {
            let mut best = 0i32;
            let mut best_signals: Vec<&'static str> = Vec::new();
            for event in &events {
                let mut score = 0i32;
                let mut signals = Vec::new();

                if last(&frame.vol_ratio) < 0.8 {
                    score += 8;
                    signals.push("VOL_SHRINK_PULLBACK");
                }
                if last(&frame.candle_body_pct).abs() < 3.0 {
                    score += 7;
                    signals.push("SMALL_CANDLE");
                }
                if bar.close >= event.fib_38 {
                    score += 10;
                    signals.push("FIB_38_SUPPORT");
                } else if bar.close >= event.fib_50 {
                    score += 8;
                    signals.push("FIB_50_SUPPORT");
                } else if bar.close >= event.fib_62 {
                    score += 5;
                    signals.push("FIB_62_SUPPORT");
                }
                if obv_trend {
                    score += 5;
                    signals.push("OBV_RISING_PULLBACK");
                }

                if score > best {
                    best = score;
                    best_signals = signals;
                }
            }
            pullback = best.min(30);
            for sig in best_signals {
                out.signal(sig);
            }
            if pullback >= 15 {
                out.pattern("PULLBACK_PATTERN");
            }
        }
        out.group("pullback", pullback);

        // ---- Bollinger squeeze (max 25) ------------------------------------
        let mut bollinger = 0i32;
        let width = last(&frame.bb_width);
        let width_ma = last(&frame.bb_width_ma);
        let position = last(&frame.bb_position);
        let squeeze = width.is_finite() && width_ma.is_finite() && width < width_ma;

        if width.is_finite() && width_ma.is_finite() {
            out.indicator("bb_width", width);
            out.indicator("bb_position", position);
            if width < width_ma * 0.7 {
                bollinger += 10;
                out.signal("BB_EXTREME_SQUEEZE");
            } else if squeeze {
                bollinger += 6;
                out.signal("BB_SQUEEZE");
            }
        }
        if position.is_finite() {
            if position > 0.8 {
                bollinger += 8;
                out.signal("BB_UPPER_ZONE");
            } else if position > 0.7 {
                bollinger += 5;
                out.signal("BB_HIGH_ZONE");
            }
        }
        if squeeze && position > 0.7 {
            bollinger += 7;
            out.signal("BB_BREAKOUT_READY");
            out.pattern("BB_BREAKOUT_READY");
        }
        out.group("bollinger", bollinger.min(25));

        // ---- Moving-average convergence (max 25) ---------------------------
        let mut ma_group = 0i32;
        let (s5, s10, s20, s60) = (
            last(&frame.sma5),
            last(&frame.sma10),
            last(&frame.sma20),
            last(&frame.sma60),
        );
        let short_aligned =
            s5.is_finite() && s10.is_finite() && s20.is_finite() && s5 > s10 && s10 > s20;

        if short_aligned {
            ma_group += 8;
            out.signal("MA_ALIGNED");
        }

        if s5.is_finite() && s10.is_finite() && s20.is_finite() && bar.close > 0.0 {
            let mean = (s5 + s10 + s20) / 3.0;
            let var = ((s5 - mean).powi(2) + (s10 - mean).powi(2) + (s20 - mean).powi(2)) / 2.0;
            let convergence = var.sqrt() / bar.close * 100.0;
            out.indicator("ma_convergence", convergence);
            if convergence < 2.0 {
                ma_group += 7;
                out.signal("MA_TIGHT");
                if short_aligned {
                    out.pattern("MA_TIGHT_ALIGNED");
                }
            }
        }

        let (p5, p10, p20) = (
            prev(&frame.sma5, 1),
            prev(&frame.sma10, 1),
            prev(&frame.sma20, 1),
        );
        if p5.is_finite() && p10.is_finite() && p5 <= p10 && s5 > s10 {
            ma_group += 5;
            out.signal("GOLDEN_CROSS_5_10");
        }
        if p5.is_finite() && p20.is_finite() && p5 <= p20 && s5 > s20 {
            ma_group += 5;
            out.signal("GOLDEN_CROSS_5_20");
        }
        if s20.is_finite() && bar.close > s20 {
            ma_group += 2;
        }
        if s60.is_finite() && bar.close > s60 {
            ma_group += 1;
        }
        out.group("ma", ma_group.min(25));

        // ---- OBV accumulation (max 20) -------------------------------------
        let mut obv_group = 0i32;
        let (price_change, obv_change) = patterns::obv_endpoint_divergence(frame, 10);
        if price_change < -3.0 && obv_change > 0.0 {
            obv_group += 12;
            out.signal("OBV_STRONG_DIV");
            out.pattern("OBV_ACCUMULATION");
        } else if price_change <= 0.0 && obv_change > 0.0 {
            obv_group += 8;
            out.signal("OBV_DIVERGENCE");
            out.pattern("OBV_ACCUMULATION");
        }
        if obv_trend {
            obv_group += 5;
            out.signal("OBV_UPTREND");
        }
        if n >= 5 {
            let obv_now = last(&frame.obv);
            let obv_5 = frame.obv[n - 5];
            if obv_5 != 0.0 && obv_now > obv_5 * 1.1 {
                obv_group += 3;
                out.signal("OBV_SURGE");
            }
        }
        out.group("obv", obv_group.min(20));

        // ---- Momentum (max 25) ---------------------------------------------
        let mut momentum = 0i32;
        let rsi = last(&frame.rsi);
        let prev_rsi = prev(&frame.rsi, 1);
        if rsi.is_finite() {
            out.indicator("rsi", rsi);
            if prev_rsi.is_finite() && rsi > 30.0 && prev_rsi <= 30.0 {
                momentum += 8;
                out.signal("RSI_OVERSOLD_EXIT");
            } else if (40.0..=60.0).contains(&rsi) {
                momentum += 3;
                out.signal("RSI_NEUTRAL");
            }
        }

        let macd = last(&frame.macd);
        let macd_sig = last(&frame.macd_signal);
        let p_macd = prev(&frame.macd, 1);
        let p_sig = prev(&frame.macd_signal, 1);
        if macd.is_finite() && p_macd.is_finite() && macd > macd_sig && p_macd <= p_sig {
            momentum += 8;
            out.signal("MACD_GOLDEN_CROSS");
        }
        let hist = last(&frame.macd_hist);
        let p_hist = prev(&frame.macd_hist, 1);
        if hist.is_finite() && p_hist.is_finite() && hist > 0.0 && p_hist <= 0.0 {
            momentum += 5;
            out.signal("MACD_HIST_POSITIVE");
        }

        let k = last(&frame.stoch_k);
        let d = last(&frame.stoch_d);
        let pk = prev(&frame.stoch_k, 1);
        let pd = prev(&frame.stoch_d, 1);
        if k.is_finite() && pk.is_finite() {
            if k > d && pk <= pd {
                momentum += 5;
                out.signal("STOCH_GOLDEN_CROSS");
            }
            if k > 20.0 && pk <= 20.0 {
                momentum += 3;
                out.signal("STOCH_OVERSOLD_EXIT");
            }
        }
        out.group("momentum", momentum.min(25));

        // ---- Overhead supply (max 10) --------------------------------------
        let mut resistance = 0i32;
        let res = patterns::resistance_nearby(frame);
        if !res.exists {
            resistance += 6;
            out.signal("NO_RESISTANCE");
        }
        let high_60 = frame.high_n(60);
        let distance = (high_60 - bar.close) / bar.close * 100.0;
        if distance < 5.0 {
            resistance += 4;
            out.signal("NEAR_HIGH");
        } else if distance < 10.0 {
            resistance += 2;
        }
        out.group("resistance", resistance.min(10));

        // ---- Trend (max 10) ------------------------------------------------
        let mut trend = 0i32;
        let uptrend = s20.is_finite() && bar.close > s20;
        let strong = uptrend && s60.is_finite() && s20 > s60;
        if strong {
            trend += 6;
            out.signal("STRONG_UPTREND");
        } else if uptrend {
            trend += 4;
            out.signal("UPTREND");
        }
        let slope = last(&frame.sma20_slope);
        if slope.is_finite() {
            if slope > 1.0 {
                trend += 4;
                out.signal("SMA20_RISING");
            } else if slope > 0.0 {
                trend += 2;
            }
        }
        out.group("trend", trend.min(10));

        // ---- Warnings -------------------------------------------------------
        if s20.is_finite() && bar.close < s20 {
            out.warning("DOWNTREND_WARNING");
        }
        if n >= 20 {
            let base = frame.bars[n - 20].close;
            if base > 0.0 {
                let change_20d = (bar.close - base) / base * 100.0;
                if change_20d > 15.0 {
                    out.warning("OVERHEATED_20D");
                } else if change_20d < -10.0 {
                    out.warning("OVERSOLD_20D");
                }
            }
        }
    }

    fn finalize(&self, raw: i32) -> i32 {
        let scaled = if raw <= 50 {
            (raw as f64 * 0.8) as i32
        } else if raw <= 90 {
            40 + (raw - 50)
        } else {
            80 + ((raw - 90) as f64 * 0.4) as i32
        };
        scaled.clamp(0, 100)
    }
}

/// Long bullish candles (+7% body on 2x volume) in the `days` bars before
/// today, with the fib retracement anchors of each.
fn recent_long_bullish(frame: &IndicatorFrame, days: usize) -> Vec<BullishEvent> {
    let n = frame.len();
    if n < days + 1 {
        return Vec::new();
    }

    let mut events = Vec::new();
    for i in (n - 1 - days)..(n - 1) {
        let b = &frame.bars[i];
        let body = b.close - b.open;
        let body_pct = if b.open > 0.0 {
            body / b.open * 100.0
        } else {
            0.0
        };
        if body_pct >= 7.0 && body > 0.0 && frame.vol_ratio[i] >= 2.0 {
            events.push(BullishEvent {
                fib_38: b.close - body * 0.382,
                fib_50: (b.open + b.close) / 2.0,
                fib_62: b.close - body * 0.618,
            });
        }
    }
    events
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::testutil::{frame_from_bars, frame_from_closes};
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
    fn scaling_breakpoints() {
        let s = ScorerV5;
        assert_eq!(s.finalize(0), 0);
        assert_eq!(s.finalize(50), 40);
        assert_eq!(s.finalize(90), 80);
        assert_eq!(s.finalize(145), 100);
    }

    #[test]
    fn pullback_after_long_bullish_candle_scores() {
        let mut bars: Vec<PriceBar> = (0..60)
            .map(|i| bar(i, 100.0, 101.5, 99.0, 100.5, 100_000.0))
            .collect();
        // the long bullish candle: +8% body on 3x volume
        bars.push(bar(60, 100.0, 109.5, 99.5, 108.0, 300_000.0));
        // quiet pullback holding above the 38.2% retracement
        bars.push(bar(61, 107.0, 107.5, 105.5, 106.2, 60_000.0));
        let frame = frame_from_bars(bars);
        let r = run_scorer(&ScorerV5, &frame, &ScoreExtras::default()).unwrap();
        assert!(
            r.signals.contains("FIB_38_SUPPORT"),
            "signals: {:?}",
            r.signals
        );
        assert!(*r.group_scores.get("pullback").unwrap() >= 15);
        assert!(r.patterns.contains("PULLBACK_PATTERN"));
    }

    #[test]
    fn overheated_run_warns() {
        let closes: Vec<f64> = (0..70).map(|i| 100.0 + i as f64 * 2.0).collect();
        let frame = frame_from_closes(&closes);
        let r = run_scorer(&ScorerV5, &frame, &ScoreExtras::default()).unwrap();
        assert!(r.warnings.contains("OVERHEATED_20D"));
        assert!(!r.disqualified);
    }

    #[test]
    fn caps_hold_and_score_bounded() {
        let closes: Vec<f64> = (0..80)
            .map(|i| 100.0 + ((i * 7) % 13) as f64)
            .collect();
        let frame = frame_from_closes(&closes);
        let r = run_scorer(&ScorerV5, &frame, &ScoreExtras::default()).unwrap();
        for (name, cap) in [
            ("pullback", 30),
            ("bollinger", 25),
            ("ma", 25),
            ("obv", 20),
            ("momentum", 25),
            ("resistance", 10),
            ("trend", 10),
        ] {
            assert!(
                *r.group_scores.get(name).unwrap() <= cap,
                "group {name} over cap"
            );
        }
        assert!((0..=100).contains(&r.score));
    }
}
