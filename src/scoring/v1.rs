// =============================================================================
// v1: breadth composite
// =============================================================================
//
// Every indicator gets a vote and the raw sum is compressed onto 0..100.
// Oversold readings are buying opportunities here (the contrarian read),
// so there is no disqualifier; reverse alignment only subtracts.
//
// Raw-to-final scaling:
//   raw <= 60   -> raw * 0.9
//   raw <= 100  -> 54 + (raw - 60) * 0.65
//   raw  > 100  -> 80 + (raw - 100) * 0.4
//
// The broad oscillators this strategy alone consumes (ADX, CCI, Williams %R,
// MFI, ROC, CMF, PSAR, Ichimoku, candle patterns) are computed locally; the
// shared frame carries only the columns every strategy reads.
// =============================================================================

use crate::indicators::{last, prev, IndicatorFrame};

use super::{Disqualification, ScoreExtras, ScoreResult, Scorer};

pub struct ScorerV1;

impl Scorer for ScorerV1 {
    fn version(&self) -> &str {
        "v1"
    }

    fn check_disqualifiers(
        &self,
        _frame: &IndicatorFrame,
        _extras: &ScoreExtras,
    ) -> Option<Disqualification> {
        None
    }

    fn score_groups(&self, frame: &IndicatorFrame, _extras: &ScoreExtras, out: &mut ScoreResult) {
        let mut raw = 0i32;
        let bar = frame.last_bar();

        // --- Moving averages -------------------------------------------------
        let (s5, s20, s60) = (last(&frame.sma5), last(&frame.sma20), last(&frame.sma60));
        let (p5, p20, p60) = (
            prev(&frame.sma5, 1),
            prev(&frame.sma20, 1),
            prev(&frame.sma60, 1),
        );

        if frame.is_aligned() {
            raw += 15;
            out.signal("MA_ALIGNED");
        }
        if p5.is_finite() && p20.is_finite() && p5 < p20 && s5 > s20 {
            raw += 20;
            out.signal("GOLDEN_CROSS_5_20");
        }
        if p20.is_finite() && p60.is_finite() && p20 < p60 && s20 > s60 {
            raw += 25;
            out.signal("GOLDEN_CROSS_20_60");
        }
        if p5.is_finite() && p20.is_finite() && p5 > p20 && s5 < s20 {
            raw -= 15;
            out.signal("DEAD_CROSS_5_20");
        }
        if frame.is_reverse_aligned() {
            raw -= 10;
            out.signal("MA_REVERSE_ALIGNED");
        }

        // --- RSI -------------------------------------------------------------
        let rsi = last(&frame.rsi);
        if rsi.is_finite() {
            out.indicator("rsi", rsi);
            if rsi < 30.0 {
                raw += 15;
                out.signal("RSI_OVERSOLD");
            } else if rsi < 50.0 {
                raw += 5;
                out.signal("RSI_RECOVERING");
            } else if rsi > 70.0 {
                raw -= 10;
                out.signal("RSI_OVERBOUGHT");
            }
        }

        // --- MACD ------------------------------------------------------------
        let macd = last(&frame.macd);
        let macd_sig = last(&frame.macd_signal);
        let hist = last(&frame.macd_hist);
        let prev_macd = prev(&frame.macd, 1);
        let prev_sig = prev(&frame.macd_signal, 1);
        let prev_hist = prev(&frame.macd_hist, 1);
        if macd.is_finite() {
            out.indicator("macd", macd);
            if prev_macd < prev_sig && macd > macd_sig {
                raw += 20;
                out.signal("MACD_GOLDEN_CROSS");
            }
            if prev_hist < 0.0 && hist > 0.0 {
                raw += 10;
                out.signal("MACD_HIST_POSITIVE");
            } else if prev_hist < hist && hist < 0.0 {
                raw += 5;
                out.signal("MACD_HIST_RISING");
            }
        }

        // --- Bollinger -------------------------------------------------------
        let bb_upper = last(&frame.bb_upper);
        let bb_lower = last(&frame.bb_lower);
        let prev_close = frame.prev_bar().close;
        let prev_lower = prev(&frame.bb_lower, 1);
        if bb_lower.is_finite() {
            if prev_lower.is_finite() && prev_close <= prev_lower && bar.close > bb_lower {
                raw += 15;
                out.signal("BB_LOWER_BOUNCE");
            } else if bar.close < bb_lower {
                raw += 10;
                out.signal("BB_LOWER_TOUCH");
            }
            if bb_upper.is_finite() && bar.close > bb_upper {
                raw -= 5;
                out.signal("BB_UPPER_BREAK");
            }
        }

        // --- Stochastic ------------------------------------------------------
        let k = last(&frame.stoch_k);
        let d = last(&frame.stoch_d);
        let pk = prev(&frame.stoch_k, 1);
        let pd = prev(&frame.stoch_d, 1);
        if k.is_finite() && d.is_finite() {
            out.indicator("stoch_k", k);
            if pk < pd && k > d && k < 30.0 {
                raw += 20;
                out.signal("STOCH_GOLDEN_OVERSOLD");
            } else if pk < pd && k > d {
                raw += 10;
                out.signal("STOCH_GOLDEN_CROSS");
            }
            if k < 20.0 {
                raw += 5;
                out.signal("STOCH_OVERSOLD");
            }
        }

        // --- ADX -------------------------------------------------------------
        if let Some((adx, dmp, dmn)) = adx14(frame) {
            out.indicator("adx", adx);
            if adx > 25.0 && dmp > dmn {
                raw += 15;
                out.signal("ADX_STRONG_UPTREND");
            } else if adx > 20.0 && dmp > dmn {
                raw += 10;
                out.signal("ADX_UPTREND");
            }
        }

        // --- CCI -------------------------------------------------------------
        if let Some(cci) = cci20(frame) {
            out.indicator("cci", cci);
            if cci < -100.0 {
                raw += 10;
                out.signal("CCI_OVERSOLD");
            } else if cci > 100.0 {
                raw -= 5;
                out.signal("CCI_OVERBOUGHT");
            }
        }

        // --- Williams %R -----------------------------------------------------
        if let Some(wr) = willr14(frame) {
            out.indicator("williams_r", wr);
            if wr < -80.0 {
                raw += 10;
                out.signal("WILLR_OVERSOLD");
            } else if wr > -20.0 {
                raw -= 5;
                out.signal("WILLR_OVERBOUGHT");
            }
        }

        // --- OBV -------------------------------------------------------------
        let obv = last(&frame.obv);
        let obv_ma = last(&frame.obv_ma20);
        if obv_ma.is_finite() && obv > obv_ma {
            raw += 10;
            out.signal("OBV_ABOVE_MA");
        }
        let obv_5d = prev(&frame.obv, 5);
        if obv_5d.is_finite() && obv > obv_5d * 1.05 {
            raw += 5;
            out.signal("OBV_RISING");
        }

        // --- MFI -------------------------------------------------------------
        if let Some(mfi) = mfi14(frame) {
            out.indicator("mfi", mfi);
            if mfi < 20.0 {
                raw += 15;
                out.signal("MFI_OVERSOLD");
            } else if mfi < 40.0 {
                raw += 5;
                out.signal("MFI_LOW");
            } else if mfi > 80.0 {
                raw -= 10;
                out.signal("MFI_OVERBOUGHT");
            }
        }

        // --- Volume ----------------------------------------------------------
        let vol_ratio = last(&frame.vol_ratio);
        if vol_ratio.is_finite() {
            out.indicator("volume_ratio", vol_ratio);
            if vol_ratio >= 2.0 {
                raw += 15;
                out.signal("VOLUME_SURGE");
            } else if vol_ratio >= 1.5 {
                raw += 10;
                out.signal("VOLUME_HIGH");
            } else if vol_ratio >= 1.2 {
                raw += 5;
                out.signal("VOLUME_ABOVE_AVG");
            }
        }

        // --- Supertrend ------------------------------------------------------
        let st_dir = frame.supertrend_dir.last().copied().unwrap_or(0);
        let st_prev = if frame.supertrend_dir.len() > 1 {
            frame.supertrend_dir[frame.supertrend_dir.len() - 2]
        } else {
            0
        };
        if st_prev == -1 && st_dir == 1 {
            raw += 20;
            out.signal("SUPERTREND_BUY");
        } else if st_dir == 1 {
            raw += 5;
            out.signal("SUPERTREND_UPTREND");
        }

        // --- PSAR ------------------------------------------------------------
        if let Some(flip_to_long) = psar_flip(frame) {
            if flip_to_long {
                raw += 15;
                out.signal("PSAR_BUY_SIGNAL");
            }
        }

        // --- ROC -------------------------------------------------------------
        if let Some((roc, prev_roc)) = roc10(frame) {
            out.indicator("roc", roc);
            if prev_roc < 0.0 && roc > 0.0 {
                raw += 10;
                out.signal("ROC_POSITIVE_CROSS");
            } else if roc > 5.0 {
                raw += 5;
                out.signal("ROC_STRONG_MOMENTUM");
            }
        }

        // --- Ichimoku --------------------------------------------------------
        if let Some(ich) = ichimoku(frame) {
            if ich.golden_cross {
                raw += 15;
                out.signal("ICHIMOKU_GOLDEN_CROSS");
            }
            if ich.above_cloud {
                raw += 10;
                out.signal("ICHIMOKU_ABOVE_CLOUD");
            }
        }

        // --- CMF -------------------------------------------------------------
        if let Some(cmf) = cmf20(frame) {
            out.indicator("cmf", cmf);
            if cmf > 0.2 {
                raw += 10;
                out.signal("CMF_STRONG_INFLOW");
            } else if cmf > 0.0 {
                raw += 5;
                out.signal("CMF_POSITIVE");
            } else if cmf < -0.2 {
                raw -= 10;
                out.signal("CMF_STRONG_OUTFLOW");
            }
        }

        // --- 52-week extremes ------------------------------------------------
        if frame.len() >= 252 {
            let high_52w = frame.high_n(252);
            let low_52w = frame.low_n(252);
            out.indicator("high_52w", high_52w);
            out.indicator("low_52w", low_52w);
            if bar.close >= high_52w * 0.98 {
                raw += 15;
                out.signal("NEW_HIGH_52W");
                if bar.close >= high_52w {
                    raw += 5;
                    out.signal("BREAKOUT_52W_HIGH");
                }
            }
            if bar.close <= low_52w * 1.02 {
                raw -= 10;
                out.signal("NEW_LOW_52W");
            }
        }

        // --- Candle patterns -------------------------------------------------
        if is_hammer(frame) {
            raw += 10;
            out.pattern("HAMMER");
        }
        match engulfing(frame) {
            1 => {
                raw += 15;
                out.pattern("BULLISH_ENGULFING");
            }
            -1 => {
                raw -= 10;
                out.pattern("BEARISH_ENGULFING");
            }
            _ => {}
        }
        if is_morning_star(frame) {
            raw += 20;
            out.pattern("MORNING_STAR");
        }
        if is_evening_star(frame) {
            raw -= 15;
            out.pattern("EVENING_STAR");
        }

        out.group("raw", raw);
        out.indicator("raw_score", raw as f64);
    }

    fn finalize(&self, raw: i32) -> i32 {
        let scaled = if raw <= 60 {
            (raw as f64 * 0.9) as i32
        } else if raw <= 100 {
            54 + ((raw - 60) as f64 * 0.65) as i32
        } else {
            80 + ((raw - 100) as f64 * 0.4) as i32
        };
        scaled.clamp(0, 100)
    }
}

// =============================================================================
// Local oscillators (only v1 reads these)
// =============================================================================

fn adx14(frame: &IndicatorFrame) -> Option<(f64, f64, f64)> {
    let period = 14;
    let bars = &frame.bars;
    if bars.len() < period * 2 {
        return None;
    }

    let mut plus_dm = Vec::with_capacity(bars.len() - 1);
    let mut minus_dm = Vec::with_capacity(bars.len() - 1);
    let mut tr = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        let up = bars[i].high - bars[i - 1].high;
        let down = bars[i - 1].low - bars[i].low;
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
        let range = (bars[i].high - bars[i].low)
            .max((bars[i].high - bars[i - 1].close).abs())
            .max((bars[i].low - bars[i - 1].close).abs());
        tr.push(range);
    }

    // Wilder smoothing of DM and TR, then DX -> ADX.
    let smooth = |v: &[f64]| -> Vec<f64> {
        let mut out = Vec::with_capacity(v.len());
        let mut acc: f64 = v[..period].iter().sum();
        out.resize(period - 1, f64::NAN);
        out.push(acc);
        for &x in &v[period..] {
            acc = acc - acc / period as f64 + x;
            out.push(acc);
        }
        out
    };

    let s_plus = smooth(&plus_dm);
    let s_minus = smooth(&minus_dm);
    let s_tr = smooth(&tr);

    let mut dx = Vec::with_capacity(s_tr.len());
    let mut di = Vec::with_capacity(s_tr.len());
    for i in 0..s_tr.len() {
        if !s_tr[i].is_finite() || s_tr[i] == 0.0 {
            dx.push(f64::NAN);
            di.push((f64::NAN, f64::NAN));
            continue;
        }
        let p = 100.0 * s_plus[i] / s_tr[i];
        let m = 100.0 * s_minus[i] / s_tr[i];
        di.push((p, m));
        let sum = p + m;
        dx.push(if sum > 0.0 {
            100.0 * (p - m).abs() / sum
        } else {
            0.0
        });
    }

    let finite: Vec<f64> = dx.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.len() < period {
        return None;
    }
    let adx = finite.iter().rev().take(period).sum::<f64>() / period as f64;
    let (dmp, dmn) = *di.last()?;
    if !dmp.is_finite() {
        return None;
    }
    Some((adx, dmp, dmn))
}

fn cci20(frame: &IndicatorFrame) -> Option<f64> {
    let period = 20;
    let bars = &frame.bars;
    if bars.len() < period {
        return None;
    }
    let tp: Vec<f64> = bars[bars.len() - period..]
        .iter()
        .map(|b| (b.high + b.low + b.close) / 3.0)
        .collect();
    let mean = tp.iter().sum::<f64>() / period as f64;
    let mad = tp.iter().map(|v| (v - mean).abs()).sum::<f64>() / period as f64;
    if mad == 0.0 {
        return Some(0.0);
    }
    Some((tp[period - 1] - mean) / (0.015 * mad))
}

fn willr14(frame: &IndicatorFrame) -> Option<f64> {
    let period = 14;
    if frame.len() < period {
        return None;
    }
    let hh = frame.high_n(period);
    let ll = frame.low_n(period);
    if hh <= ll {
        return Some(-50.0);
    }
    Some((hh - frame.last_bar().close) / (hh - ll) * -100.0)
}

fn mfi14(frame: &IndicatorFrame) -> Option<f64> {
    let period = 14;
    let bars = &frame.bars;
    if bars.len() < period + 1 {
        return None;
    }
    let mut pos = 0.0;
    let mut neg = 0.0;
    for i in bars.len() - period..bars.len() {
        let tp = (bars[i].high + bars[i].low + bars[i].close) / 3.0;
        let prev_tp = (bars[i - 1].high + bars[i - 1].low + bars[i - 1].close) / 3.0;
        let flow = tp * bars[i].volume;
        if tp > prev_tp {
            pos += flow;
        } else if tp < prev_tp {
            neg += flow;
        }
    }
    if pos + neg == 0.0 {
        return Some(50.0);
    }
    if neg == 0.0 {
        return Some(100.0);
    }
    Some(100.0 - 100.0 / (1.0 + pos / neg))
}

fn roc10(frame: &IndicatorFrame) -> Option<(f64, f64)> {
    let period = 10;
    let bars = &frame.bars;
    if bars.len() < period + 2 {
        return None;
    }
    let n = bars.len();
    let roc = |i: usize| {
        let base = bars[i - period].close;
        if base > 0.0 {
            (bars[i].close - base) / base * 100.0
        } else {
            0.0
        }
    };
    Some((roc(n - 1), roc(n - 2)))
}

fn cmf20(frame: &IndicatorFrame) -> Option<f64> {
    let period = 20;
    let bars = &frame.bars;
    if bars.len() < period {
        return None;
    }
    let mut mfv = 0.0;
    let mut vol = 0.0;
    for b in &bars[bars.len() - period..] {
        let range = b.high - b.low;
        if range > 0.0 {
            let mult = ((b.close - b.low) - (b.high - b.close)) / range;
            mfv += mult * b.volume;
        }
        vol += b.volume;
    }
    if vol == 0.0 {
        return Some(0.0);
    }
    Some(mfv / vol)
}

/// Parabolic SAR with the standard 0.02/0.2 acceleration. Returns
/// `Some(true)` when the last bar flipped from short to long.
fn psar_flip(frame: &IndicatorFrame) -> Option<bool> {
    let bars = &frame.bars;
    if bars.len() < 5 {
        return None;
    }

    let mut long = bars[1].close > bars[0].close;
    let mut af = 0.02;
    let mut ep = if long { bars[0].high } else { bars[0].low };
    let mut sar = if long { bars[0].low } else { bars[0].high };
    let mut prev_long = long;

    for i in 1..bars.len() {
        sar += af * (ep - sar);
        prev_long = long;

        if long {
            if bars[i].low < sar {
                long = false;
                sar = ep;
                ep = bars[i].low;
                af = 0.02;
            } else if bars[i].high > ep {
                ep = bars[i].high;
                af = (af + 0.02).min(0.2);
            }
        } else if bars[i].high > sar {
            long = true;
            sar = ep;
            ep = bars[i].high;
            af = 0.02;
        } else if bars[i].low < ep {
            ep = bars[i].low;
            af = (af + 0.02).min(0.2);
        }
    }

    Some(!prev_long && long)
}

struct Ichimoku {
    golden_cross: bool,
    above_cloud: bool,
}

fn ichimoku(frame: &IndicatorFrame) -> Option<Ichimoku> {
    let bars = &frame.bars;
    // The displaced span B needs 52 bars ending 26 bars back.
    if bars.len() < 79 {
        return None;
    }
    let n = bars.len();

    let mid = |end: usize, period: usize| {
        let slice = &bars[end + 1 - period..=end];
        let hi = slice.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let lo = slice.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        (hi + lo) / 2.0
    };

    let tenkan = mid(n - 1, 9);
    let kijun = mid(n - 1, 26);
    let prev_tenkan = mid(n - 2, 9);
    let prev_kijun = mid(n - 2, 26);

    // Cloud plotted 26 bars ahead; today's cloud comes from 26 bars ago.
    let base = n - 1 - 26;
    let span_a = (mid(base, 9) + mid(base, 26)) / 2.0;
    let span_b = mid(base, 52);
    let cloud_top = span_a.max(span_b);

    Some(Ichimoku {
        golden_cross: prev_tenkan < prev_kijun && tenkan > kijun,
        above_cloud: bars[n - 1].close > cloud_top,
    })
}

// --- Candle patterns --------------------------------------------------------

fn is_hammer(frame: &IndicatorFrame) -> bool {
    let b = frame.last_bar();
    let body = (b.close - b.open).abs();
    let lower = b.open.min(b.close) - b.low;
    let upper = b.high - b.open.max(b.close);
    let range = b.high - b.low;
    range > 0.0 && body > 0.0 && lower >= body * 2.0 && upper <= body * 0.5
}

/// +1 bullish engulfing, -1 bearish engulfing, 0 otherwise.
fn engulfing(frame: &IndicatorFrame) -> i32 {
    if frame.len() < 2 {
        return 0;
    }
    let prev = frame.prev_bar();
    let curr = frame.last_bar();
    let prev_bear = prev.close < prev.open;
    let prev_bull = prev.close > prev.open;
    if prev_bear && curr.close > curr.open && curr.open <= prev.close && curr.close >= prev.open {
        1
    } else if prev_bull
        && curr.close < curr.open
        && curr.open >= prev.close
        && curr.close <= prev.open
    {
        -1
    } else {
        0
    }
}

fn is_morning_star(frame: &IndicatorFrame) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let n = frame.len();
    let a = &frame.bars[n - 3];
    let b = &frame.bars[n - 2];
    let c = &frame.bars[n - 1];
    let a_body = a.open - a.close;
    let b_body = (b.close - b.open).abs();
    let c_body = c.close - c.open;
    a_body > 0.0
        && b_body < a_body * 0.3
        && c_body > 0.0
        && c.close > (a.open + a.close) / 2.0
}

fn is_evening_star(frame: &IndicatorFrame) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let n = frame.len();
    let a = &frame.bars[n - 3];
    let b = &frame.bars[n - 2];
    let c = &frame.bars[n - 1];
    let a_body = a.close - a.open;
    let b_body = (b.close - b.open).abs();
    let c_body = c.open - c.close;
    a_body > 0.0
        && b_body < a_body * 0.3
        && c_body > 0.0
        && c.close < (a.open + a.close) / 2.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::testutil::frame_from_closes;
    use crate::scoring::{run_scorer, ScoreExtras};

    #[test]
    fn scaling_breakpoints() {
        let s = ScorerV1;
        assert_eq!(s.finalize(0), 0);
        assert_eq!(s.finalize(60), 54);
        assert_eq!(s.finalize(100), 80);
        assert_eq!(s.finalize(150), 100);
        assert_eq!(s.finalize(-20), 0);
    }

    #[test]
    fn none_below_sixty_bars() {
        let closes: Vec<f64> = (0..59).map(|i| 100.0 + i as f64).collect();
        let frame = frame_from_closes(&closes);
        assert!(run_scorer(&ScorerV1, &frame, &ScoreExtras::default()).is_none());
    }

    #[test]
    fn uptrend_scores_above_downtrend() {
        let up: Vec<f64> = (0..90).map(|i| 100.0 + i as f64 * 1.5).collect();
        let down: Vec<f64> = (0..90).map(|i| 300.0 - i as f64 * 1.5).collect();
        let extras = ScoreExtras::default();
        let up_score = run_scorer(&ScorerV1, &frame_from_closes(&up), &extras)
            .unwrap()
            .score;
        let down_res = run_scorer(&ScorerV1, &frame_from_closes(&down), &extras).unwrap();
        // a pure downtrend is oversold-friendly here, but alignment and
        // momentum still dominate
        assert!(up_score >= down_res.score || down_res.signals.contains("RSI_OVERSOLD"));
        assert!((0..=100).contains(&up_score));
    }

    #[test]
    fn never_disqualifies() {
        let down: Vec<f64> = (0..90).map(|i| 300.0 - i as f64 * 2.0).collect();
        let r = run_scorer(&ScorerV1, &frame_from_closes(&down), &ScoreExtras::default()).unwrap();
        assert!(!r.disqualified);
        assert!(r.signals.contains("MA_REVERSE_ALIGNED"));
    }

    #[test]
    fn flat_series_is_deterministic_and_midish() {
        let flat = vec![10_000.0; 90];
        let extras = ScoreExtras::default();
        let a = run_scorer(&ScorerV1, &frame_from_closes(&flat), &extras).unwrap();
        let b = run_scorer(&ScorerV1, &frame_from_closes(&flat), &extras).unwrap();
        assert_eq!(a, b);
        assert!((0..=100).contains(&a.score));
    }
}
