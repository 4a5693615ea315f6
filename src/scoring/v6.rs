// =============================================================================
// v6: swing predictor with embedded exit plan
// =============================================================================
//
// Estimates the odds of a 2-5 day advance from leading evidence: coiled
// volatility, smart-money accumulation, proximity to support, and early
// momentum reversal. Every result carries an exit plan sized by score tier.
//
//   Energy      (max 35): BB squeeze, ATR contraction, VCP, volume coil
//   Smart money (max 30): OBV leadership, selling exhaustion, investor flow
//   Support     (max 20): MA touches, Fibonacci levels, BB lower zone
//   Momentum    (max 15): MACD histogram, RSI reversal, stochastic cross
//
// Disqualifiers: strong reverse alignment (MA20 over 5% below MA60 with
// 5 < 10 < 20), RSI above 85, a climactic top (BB position above 1.1 on
// tripled volume), and a -5% day.
// =============================================================================

use crate::indicators::{last, prev, IndicatorFrame};

use super::patterns;
use super::{Disqualification, ExitPlan, ScoreExtras, ScoreResult, Scorer};

pub struct ScorerV6;

impl Scorer for ScorerV6 {
    fn version(&self) -> &str {
        "v6"
    }

    fn check_disqualifiers(
        &self,
        frame: &IndicatorFrame,
        _extras: &ScoreExtras,
    ) -> Option<Disqualification> {
        let (s5, s10, s20, s60) = (
            last(&frame.sma5),
            last(&frame.sma10),
            last(&frame.sma20),
            last(&frame.sma60),
        );
        if s5.is_finite() && s10.is_finite() && s20.is_finite() && s5 < s10 && s10 < s20 {
            if s60.is_finite() && s60 > 0.0 {
                let gap = (s20 - s60) / s60 * 100.0;
                if gap < -5.0 {
                    return Some(Disqualification::with_signal(
                        "strong reverse alignment",
                        "STRONG_REVERSE_ALIGNMENT",
                    ));
                }
            }
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

        None
    }

    fn score_groups(&self, frame: &IndicatorFrame, extras: &ScoreExtras, out: &mut ScoreResult) {
        let bar = frame.last_bar();

        // ---- Energy accumulation (max 35) ----------------------------------
        let mut energy = 0i32;

        let width = last(&frame.bb_width);
        let width_ma = last(&frame.bb_width_ma);
        let squeeze_ratio = if width_ma.is_finite() && width_ma > 0.0 {
            width / width_ma
        } else {
            1.0
        };
        if squeeze_ratio < 0.6 {
            energy += 12;
            out.signal("BB_EXTREME_SQUEEZE");
            out.pattern("ENERGY_SQUEEZE");
        } else if squeeze_ratio < 0.75 {
            energy += 8;
            out.signal("BB_STRONG_SQUEEZE");
        } else if squeeze_ratio < 0.9 {
            energy += 4;
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
            energy += 5;
            out.signal("ATR_SHRINKING");
        }

        let vcp = patterns::vcp(frame);
        if vcp.detected {
            energy += 10;
            out.signal("VCP_PATTERN");
            out.pattern("VCP");
            if vcp.tight {
                energy += 2;
                out.signal("VCP_TIGHT");
            }
        }

        let coil = patterns::volume_contraction(frame, 10);
        if coil.contraction && coil.higher_lows {
            energy += 5;
            out.signal("VOL_CONTRACTION_HIGHER_LOWS");
            out.pattern("COILING");
        } else if coil.contraction {
            energy += 3;
            out.signal("VOL_CONTRACTION");
        }

        out.group("energy", energy.min(35));

        // ---- Smart-money accumulation (max 30) -----------------------------
        let mut accumulation = 0i32;

        let div = patterns::obv_divergence(frame, 30);
        if div.bullish && div.strength >= 20.0 {
            accumulation += 12;
            out.signal("OBV_STRONG_LEADING");
            out.pattern("SMART_MONEY_ACCUMULATION");
        } else if div.bullish {
            accumulation += 8;
            out.signal("OBV_LEADING");
        } else if last(&frame.obv) > last(&frame.obv_ma20) {
            accumulation += 4;
            out.signal("OBV_RISING");
        }

        let exhaustion = patterns::selling_exhaustion(frame, 5);
        if exhaustion.exhausted {
            accumulation += 8;
            out.signal("SELLING_EXHAUSTED");
            out.pattern("DRY_UP");
        } else if exhaustion.low_volume_decline {
            accumulation += 5;
            out.signal("LOW_VOL_DECLINE");
        }

        if let Some(flow) = &extras.investor {
            if flow.foreign_net > 0 && flow.institution_net > 0 {
                accumulation += 6;
                out.signal("INST_FOREIGN_BOTH_BUY");
            } else if flow.foreign_net > 0 || flow.institution_net > 0 {
                accumulation += 3;
                out.signal("INST_OR_FOREIGN_BUY");
            }

            let max_days = flow
                .foreign_consecutive_days
                .max(flow.institution_consecutive_days);
            if max_days >= 5 {
                accumulation += 4;
                out.signal("CONSECUTIVE_BUY_5D");
            } else if max_days >= 3 {
                accumulation += 2;
                out.signal("CONSECUTIVE_BUY_3D");
            }
        }

        out.group("accumulation", accumulation.min(30));

        // ---- Technical support (max 20) ------------------------------------
        let mut support = 0i32;

        let ma = patterns::ma_support(frame);
        if ma.ma20 {
            support += 5;
            out.signal("MA20_SUPPORT");
        }
        if ma.ma60 {
            support += 3;
            out.signal("MA60_SUPPORT");
        }
        if ma.ma120 {
            support += 2;
            out.signal("MA120_SUPPORT");
        }

        match patterns::fibonacci_support(frame) {
            Some("38.2%") => {
                support += 6;
                out.signal("FIB_38.2%_SUPPORT");
            }
            Some("50%") => {
                support += 6;
                out.signal("FIB_50%_SUPPORT");
            }
            Some("61.8%") => {
                support += 4;
                out.signal("FIB_61.8%_SUPPORT");
            }
            _ => {}
        }

        let position = last(&frame.bb_position);
        if position.is_finite() && position < 0.2 {
            if bar.close > frame.prev_bar().close {
                support += 4;
                out.signal("BB_LOWER_BOUNCE");
            } else {
                support += 2;
                out.signal("BB_LOWER_ZONE");
            }
        }

        out.group("support", support.min(20));

        // ---- Momentum reversal (max 15) ------------------------------------
        let mut momentum = 0i32;

        let hist = last(&frame.macd_hist);
        let p_hist = prev(&frame.macd_hist, 1);
        let pp_hist = prev(&frame.macd_hist, 2);
        if hist.is_finite() && p_hist.is_finite() {
            if hist > 0.0 && p_hist <= 0.0 {
                momentum += 5;
                out.signal("MACD_HIST_CROSS_UP");
            } else if hist < 0.0 && hist > p_hist && p_hist > pp_hist {
                momentum += 3;
                out.signal("MACD_HIST_RISING");
            }
        }

        let rsi_sig = patterns::rsi_signal(frame);
        if rsi_sig.bullish_div {
            momentum += 5;
            out.signal("RSI_BULLISH_DIV");
        } else if rsi_sig.oversold_exit {
            momentum += 4;
            out.signal("RSI_OVERSOLD_EXIT");
        } else if rsi_sig.oversold {
            momentum += 2;
            out.signal("RSI_OVERSOLD");
        }

        let k = last(&frame.stoch_k);
        let d = last(&frame.stoch_d);
        let pk = prev(&frame.stoch_k, 1);
        let pd = prev(&frame.stoch_d, 1);
        let cross = k.is_finite() && pk.is_finite() && k > d && pk <= pd;
        if cross && k < 30.0 {
            momentum += 5;
            out.signal("STOCH_GOLDEN_OVERSOLD");
        } else if cross && k < 50.0 {
            momentum += 3;
            out.signal("STOCH_GOLDEN");
        } else if k.is_finite() && k < 20.0 {
            momentum += 2;
            out.signal("STOCH_OVERSOLD");
        }

        out.group("momentum", momentum.min(15));

        // ---- Warnings -------------------------------------------------------
        if bar.trading_value() < 1_000_000_000.0 {
            out.warning("LOW_LIQUIDITY");
        }
        let n = frame.len();
        if n >= 20 {
            let base = frame.bars[n - 20].close;
            if base > 0.0 && (bar.close - base) / base * 100.0 > 30.0 {
                out.warning("OVEREXTENDED_20D");
            }
        }
        if patterns::resistance_nearby(frame).exists {
            out.warning("RESISTANCE_NEARBY");
        }
        if frame.down_days(5) >= 4 {
            out.warning("CONSECUTIVE_DOWN_DAYS");
        }

        out.indicator("atr", atr);
        if bar.close > 0.0 {
            out.indicator("atr_pct", atr / bar.close * 100.0);
        }
    }

    fn attach_exit_plan(&self, frame: &IndicatorFrame, score: i32, out: &mut ScoreResult) {
        let close = frame.last_bar().close;
        let atr = last(&frame.atr);
        if !atr.is_finite() || close <= 0.0 {
            return;
        }

        let (target_mult, stop_mult, hold_days) = match score {
            s if s >= 85 => (2.5, 1.0, 5),
            s if s >= 75 => (2.0, 1.0, 4),
            s if s >= 65 => (1.5, 1.0, 3),
            _ => (1.2, 0.8, 2),
        };

        out.exit_plan = Some(ExitPlan {
            entry: close,
            target_price: close + atr * target_mult,
            stop_price: close - atr * stop_mult,
            trailing_trigger: None,
            max_hold_days: hold_days,
            atr,
        });
    }
}
