// =============================================================================
// Shared pattern detectors used by the accumulation / swing strategies
// =============================================================================
//
// All detectors read the IndicatorFrame only. Window arithmetic mirrors the
// screening conventions: local extrema need two neighbours on each side,
// VCP slices the last 40 bars into four 10-bar windows.
// =============================================================================

use crate::indicators::{last, IndicatorFrame};

// ---------------------------------------------------------------------------
// OBV divergence (local-extrema form)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ObvDivergence {
    /// Price made a lower low while OBV made a higher low.
    pub bullish: bool,
    /// Price made a higher high while OBV made a lower high.
    pub bearish: bool,
    /// Bars between the two extrema.
    pub days: usize,
    /// Price decline plus OBV rise, capped at 100.
    pub strength: f64,
}

/// Find price lows/highs with two lower (higher) neighbours on each side in
/// the last `lookback` bars and compare the OBV at the two most recent ones.
pub fn obv_divergence(frame: &IndicatorFrame, lookback: usize) -> ObvDivergence {
    let mut out = ObvDivergence::default();
    let n = frame.len();
    if n < lookback || lookback < 5 {
        return out;
    }
    let start = n - lookback;

    let mut lows: Vec<(usize, f64, f64)> = Vec::new();
    let mut highs: Vec<(usize, f64, f64)> = Vec::new();

    for i in (start + 2)..(n - 2) {
        let low = frame.bars[i].low;
        if low <= frame.bars[i - 1].low
            && low <= frame.bars[i - 2].low
            && low <= frame.bars[i + 1].low
            && low <= frame.bars[i + 2].low
        {
            lows.push((i, low, frame.obv[i]));
        }
        let high = frame.bars[i].high;
        if high >= frame.bars[i - 1].high
            && high >= frame.bars[i - 2].high
            && high >= frame.bars[i + 1].high
            && high >= frame.bars[i + 2].high
        {
            highs.push((i, high, frame.obv[i]));
        }
    }

    if lows.len() >= 2 {
        let (pi, pp, po) = lows[lows.len() - 2];
        let (ci, cp, co) = lows[lows.len() - 1];
        if cp < pp && co > po {
            out.bullish = true;
            out.days = ci - pi;
            let price_decline = (pp - cp) / pp * 100.0;
            let obv_rise = if po != 0.0 {
                (co - po) / po.abs() * 100.0
            } else {
                0.0
            };
            out.strength = (price_decline + obv_rise).min(100.0);
        }
    }

    if highs.len() >= 2 {
        let (pi, pp, po) = highs[highs.len() - 2];
        let (ci, cp, co) = highs[highs.len() - 1];
        if cp > pp && co < po {
            out.bearish = true;
            if !out.bullish {
                out.days = ci - pi;
            }
        }
    }

    out
}

/// Endpoint OBV divergence over the last `lookback` bars: price change %
/// versus OBV change. The accumulation read is "price down, OBV up".
pub fn obv_endpoint_divergence(frame: &IndicatorFrame, lookback: usize) -> (f64, f64) {
    let n = frame.len();
    if n < lookback + 1 {
        return (0.0, 0.0);
    }
    let base = &frame.bars[n - lookback];
    let price_change = if base.close > 0.0 {
        (frame.last_bar().close - base.close) / base.close * 100.0
    } else {
        0.0
    };
    let obv_change = frame.obv[n - 1] - frame.obv[n - lookback];
    (price_change, obv_change)
}

// ---------------------------------------------------------------------------
// VCP (Volatility Contraction Pattern)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Vcp {
    /// Range contracted below 70% of the first window and lows are rising.
    pub detected: bool,
    pub contraction_pct: f64,
    /// Third window's volume below 70% of the first window's.
    pub vol_contraction: bool,
    /// Final window's volume above the third's (breakout fuel).
    pub vol_expansion: bool,
    /// Contraction beyond 50%.
    pub tight: bool,
}

/// Four 10-bar windows over the last 40 bars.
pub fn vcp(frame: &IndicatorFrame) -> Vcp {
    let mut out = Vcp::default();
    let n = frame.len();
    if n < 40 {
        return out;
    }
    let start = n - 40;

    let mut range = [0.0f64; 4];
    let mut low = [0.0f64; 4];
    let mut vol = [0.0f64; 4];

    for w in 0..4 {
        let s = start + w * 10;
        let bars = &frame.bars[s..s + 10];
        let hi = bars.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let lo = bars.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        range[w] = hi - lo;
        low[w] = lo;
        vol[w] = bars.iter().map(|b| b.volume).sum::<f64>() / 10.0;
    }

    let range_contraction = range[3] < range[0] * 0.7;
    let lows_rising = low[3] > low[0];
    out.vol_contraction = vol[2] < vol[0] * 0.7;
    out.vol_expansion = vol[3] > vol[2];

    if range_contraction && lows_rising {
        out.detected = true;
        if range[0] > 0.0 {
            out.contraction_pct = (1.0 - range[3] / range[0]) * 100.0;
        }
        out.tight = out.contraction_pct > 50.0;
    }

    out
}

// ---------------------------------------------------------------------------
// Accumulation candle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct AccumulationCandle {
    pub detected: bool,
    pub volume_ratio: f64,
    pub upper_wick_pct: f64,
}

/// Bottom-zone candle with a long upper wick on heavy volume: the classic
/// supply-test bar. Requires: within 5% of the 20-day low, upper wick at
/// least 40% of the bar's range, volume at least 1.5x the 20-day average,
/// and a non-bearish body.
pub fn accumulation_candle(frame: &IndicatorFrame) -> AccumulationCandle {
    let mut out = AccumulationCandle::default();
    if frame.len() < 20 {
        return out;
    }

    let bar = frame.last_bar();
    let total_range = bar.high - bar.low;
    if total_range <= 0.0 {
        return out;
    }

    let low_20 = last(&frame.low_20d);
    let near_bottom = bar.low <= low_20 * 1.05;
    let upper_wick_ratio = last(&frame.upper_shadow) / total_range;
    let vol_ratio = last(&frame.vol_ratio);
    let bullish_or_doji = bar.close >= bar.open;

    if near_bottom && upper_wick_ratio >= 0.4 && vol_ratio >= 1.5 && bullish_or_doji {
        out.detected = true;
        out.volume_ratio = vol_ratio;
        out.upper_wick_pct = upper_wick_ratio * 100.0;
    }

    out
}

// ---------------------------------------------------------------------------
// Spring (bear trap)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Spring {
    pub detected: bool,
    pub recovery_pct: f64,
    pub volume_spike: bool,
}

/// Support break inside the last 10 bars followed by a recovery of at least
/// 3% back above the support (the bottom decile of the 20-day lows).
pub fn spring(frame: &IndicatorFrame) -> Spring {
    let mut out = Spring::default();
    let n = frame.len();
    if n < 20 {
        return out;
    }

    let mut lows: Vec<f64> = frame.bars[n - 20..].iter().map(|b| b.low).collect();
    lows.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let support = lows[1]; // ~10th percentile of 20 samples

    let recent = &frame.bars[n - 10..];
    let breakdown_low = recent
        .iter()
        .take(recent.len() - 1)
        .map(|b| b.low)
        .filter(|&l| l < support)
        .fold(f64::MAX, f64::min);
    if breakdown_low == f64::MAX {
        return out;
    }

    let close = frame.last_bar().close;
    if close > support && breakdown_low > 0.0 {
        out.recovery_pct = (close - breakdown_low) / breakdown_low * 100.0;
        out.volume_spike = last(&frame.vol_ratio) > 1.5;
        out.detected = out.recovery_pct >= 3.0;
    }

    out
}

// ---------------------------------------------------------------------------
// Pullback volume dry-up
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct PullbackDryup {
    pub detected: bool,
    pub pullback_pct: f64,
    pub vol_ratio: f64,
}

/// In the last 5 bars, down-day volume below 60% of the preceding 15-bar
/// average while the 5-bar swing is a meaningful (>= 2%) pullback.
pub fn pullback_dryup(frame: &IndicatorFrame) -> PullbackDryup {
    let mut out = PullbackDryup::default();
    let n = frame.len();
    if n < 20 {
        return out;
    }

    let recent = &frame.bars[n - 5..];
    let prior = &frame.bars[n - 20..n - 5];

    let down: Vec<&crate::types::PriceBar> =
        recent.iter().filter(|b| b.close < b.open).collect();
    if down.is_empty() {
        return out;
    }
    let down_vol = down.iter().map(|b| b.volume).sum::<f64>() / down.len() as f64;
    let prior_vol = prior.iter().map(|b| b.volume).sum::<f64>() / prior.len() as f64;
    if prior_vol <= 0.0 {
        return out;
    }

    out.vol_ratio = down_vol / prior_vol;
    let high5 = recent.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let low5 = recent.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    if high5 > 0.0 {
        out.pullback_pct = (high5 - low5) / high5 * 100.0;
    }
    out.detected = out.vol_ratio < 0.6 && out.pullback_pct >= 2.0;

    out
}

// ---------------------------------------------------------------------------
// Overhead resistance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Resistance {
    pub exists: bool,
    /// The lowest heavy-volume high inside the zone, if any.
    pub level: Option<f64>,
}

/// A heavy-volume (ratio > 1.5) bar in the last 60 whose high sits within
/// 5% above the current close marks unabsorbed supply.
pub fn resistance_nearby(frame: &IndicatorFrame) -> Resistance {
    let mut out = Resistance::default();
    let n = frame.len();
    if n < 2 {
        return out;
    }
    let close = frame.last_bar().close;
    let zone_top = close * 1.05;
    let start = n.saturating_sub(60);

    let mut level = f64::MAX;
    for i in start..n {
        if frame.vol_ratio[i] > 1.5 {
            let high = frame.bars[i].high;
            if high > close && high <= zone_top && high < level {
                level = high;
            }
        }
    }
    if level < f64::MAX {
        out.exists = true;
        out.level = Some(level);
    }

    out
}

// ---------------------------------------------------------------------------
// Moving-average support
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MaSupport {
    pub ma20: bool,
    pub ma60: bool,
    pub ma120: bool,
}

/// A support touch: the bar dipped to within 2% of the average and the close
/// held at or above 98% of it.
pub fn ma_support(frame: &IndicatorFrame) -> MaSupport {
    let bar = frame.last_bar();
    let touched = |ma: f64| {
        ma.is_finite() && ma > 0.0 && bar.low <= ma * 1.02 && bar.close >= ma * 0.98
    };
    MaSupport {
        ma20: touched(last(&frame.sma20)),
        ma60: touched(last(&frame.sma60)),
        ma120: touched(last(&frame.sma120)),
    }
}

// ---------------------------------------------------------------------------
// Fibonacci retracement support
// ---------------------------------------------------------------------------

/// Retracement levels from the 60-bar swing. Returns the deepest level the
/// close sits on (within 2% above it): "38.2%", "50%" or "61.8%".
pub fn fibonacci_support(frame: &IndicatorFrame) -> Option<&'static str> {
    if frame.len() < 60 {
        return None;
    }
    let swing_high = frame.high_n(60);
    let swing_low = frame.low_n(60);
    let range = swing_high - swing_low;
    if range <= 0.0 {
        return None;
    }
    let close = frame.last_bar().close;

    let levels = [
        (swing_low + range * 0.618, "38.2%"),
        (swing_low + range * 0.500, "50%"),
        (swing_low + range * 0.382, "61.8%"),
    ];
    for (level, name) in levels {
        if close >= level && close <= level * 1.02 {
            return Some(name);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Selling exhaustion / volume contraction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SellingExhaustion {
    pub exhausted: bool,
    pub low_volume_decline: bool,
}

/// Declining closes on vanishing volume: sellers are done.
pub fn selling_exhaustion(frame: &IndicatorFrame, window: usize) -> SellingExhaustion {
    let mut out = SellingExhaustion::default();
    let n = frame.len();
    if n < window + 1 || window == 0 {
        return out;
    }

    let recent = &frame.bars[n - window..];
    let declining = recent.last().unwrap().close < recent.first().unwrap().close;
    if !declining {
        return out;
    }

    let vol_ma = last(&frame.vol_ma20);
    if !vol_ma.is_finite() || vol_ma <= 0.0 {
        return out;
    }
    let recent_vol = recent.iter().map(|b| b.volume).sum::<f64>() / window as f64;

    out.low_volume_decline = recent_vol < vol_ma * 0.7;
    out.exhausted = recent_vol < vol_ma * 0.5;
    out
}

#[derive(Debug, Clone, Default)]
pub struct VolumeContraction {
    pub contraction: bool,
    pub higher_lows: bool,
}

/// Recent `window` bars versus the preceding `window`: volume shrinking
/// below 70% while the price low rises.
pub fn volume_contraction(frame: &IndicatorFrame, window: usize) -> VolumeContraction {
    let mut out = VolumeContraction::default();
    let n = frame.len();
    if n < window * 2 || window == 0 {
        return out;
    }

    let recent = &frame.bars[n - window..];
    let prior = &frame.bars[n - window * 2..n - window];

    let recent_vol = recent.iter().map(|b| b.volume).sum::<f64>() / window as f64;
    let prior_vol = prior.iter().map(|b| b.volume).sum::<f64>() / window as f64;
    out.contraction = prior_vol > 0.0 && recent_vol < prior_vol * 0.7;

    let recent_low = recent.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    let prior_low = prior.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    out.higher_lows = recent_low > prior_low;

    out
}

// ---------------------------------------------------------------------------
// RSI reversal reads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RsiSignal {
    pub bullish_div: bool,
    pub oversold_exit: bool,
    pub oversold: bool,
}

pub fn rsi_signal(frame: &IndicatorFrame) -> RsiSignal {
    let mut out = RsiSignal::default();
    let n = frame.len();
    let curr = last(&frame.rsi);
    let prev = crate::indicators::prev(&frame.rsi, 1);
    if !curr.is_finite() {
        return out;
    }

    out.oversold = curr < 30.0;
    out.oversold_exit = prev.is_finite() && curr > 30.0 && prev <= 30.0;

    // Endpoint divergence over 10 bars: price lower, RSI higher, still weak.
    if n > 10 {
        let close = frame.last_bar().close;
        let close_ago = frame.bars[n - 11].close;
        let rsi_ago = frame.rsi[n - 11];
        if rsi_ago.is_finite() && close < close_ago && curr > rsi_ago && curr < 45.0 {
            out.bullish_div = true;
        }
    }

    out
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::testutil::{frame_from_bars, frame_from_closes};
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
    fn vcp_detects_contracting_range_with_rising_lows() {
        // Four windows with shrinking range and rising lows, volume drying up.
        let mut bars = Vec::new();
        let windows = [(100.0, 130.0, 200_000.0), (108.0, 126.0, 150_000.0),
                       (112.0, 122.0, 100_000.0), (114.0, 120.0, 120_000.0)];
        for (w, (lo, hi, vol)) in windows.iter().enumerate() {
            for i in 0..10 {
                let mid = (lo + hi) / 2.0;
                bars.push(bar(w * 10 + i, mid, *hi, *lo, mid, *vol));
            }
        }
        let frame = frame_from_bars(bars);
        let v = vcp(&frame);
        assert!(v.detected);
        assert!(v.vol_contraction);
        assert!(v.vol_expansion);
        assert!(v.contraction_pct > 50.0);
    }

    #[test]
    fn vcp_short_history_is_negative() {
        let frame = frame_from_closes(&vec![100.0; 30]);
        assert!(!vcp(&frame).detected);
    }

    #[test]
    fn accumulation_candle_needs_wick_volume_and_bottom() {
        let mut bars: Vec<PriceBar> = (0..25)
            .map(|i| bar(i, 100.0, 101.0, 99.0, 100.0, 100_000.0))
            .collect();
        // bottom-zone bar: long upper wick, heavy volume, bullish close
        bars.push(bar(25, 99.0, 108.0, 98.5, 100.0, 300_000.0));
        let frame = frame_from_bars(bars);
        let a = accumulation_candle(&frame);
        assert!(a.detected, "wick={} vol={}", a.upper_wick_pct, a.volume_ratio);
    }

    #[test]
    fn spring_detects_breakdown_and_recovery() {
        let mut bars: Vec<PriceBar> = (0..20)
            .map(|i| bar(i, 100.0, 102.0, 98.0, 100.0, 100_000.0))
            .collect();
        // breakdown below the 98 support zone, then a strong recovery
        bars.push(bar(20, 98.0, 99.0, 90.0, 92.0, 120_000.0));
        bars.push(bar(21, 92.0, 103.0, 91.0, 102.0, 250_000.0));
        let frame = frame_from_bars(bars);
        let s = spring(&frame);
        assert!(s.detected, "recovery={}", s.recovery_pct);
        assert!(s.volume_spike);
    }

    #[test]
    fn pullback_dryup_on_quiet_down_days() {
        let mut bars: Vec<PriceBar> = (0..15)
            .map(|i| bar(i, 100.0, 104.0, 99.0, 103.0, 200_000.0))
            .collect();
        // five quiet down days pulling back ~4%
        for i in 0..5 {
            let c = 103.0 - (i as f64 + 1.0) * 0.8;
            bars.push(bar(15 + i, c + 0.5, c + 1.0, c - 0.5, c, 50_000.0));
        }
        let frame = frame_from_bars(bars);
        let p = pullback_dryup(&frame);
        assert!(p.detected, "ratio={} pullback={}", p.vol_ratio, p.pullback_pct);
    }

    #[test]
    fn resistance_found_only_in_zone() {
        let mut bars: Vec<PriceBar> = (0..59)
            .map(|i| bar(i, 100.0, 101.0, 99.0, 100.0, 100_000.0))
            .collect();
        // heavy-volume bar with a high 3% above the final close
        bars.insert(40, bar(40, 100.0, 103.0, 99.0, 100.0, 400_000.0));
        let bars: Vec<PriceBar> = bars
            .into_iter()
            .enumerate()
            .map(|(i, b)| bar(i, b.open, b.high, b.low, b.close, b.volume))
            .collect();
        let frame = frame_from_bars(bars);
        let r = resistance_nearby(&frame);
        assert!(r.exists);
        assert!(r.level.unwrap() <= 105.0);
    }

    #[test]
    fn obv_endpoint_divergence_reads_accumulation() {
        // up closes on huge volume, down closes on tiny volume: price drifts
        // lower while on-balance volume climbs
        let mut bars = Vec::new();
        let mut c = 110.0;
        for i in 0..40 {
            let vol = if i % 2 == 0 {
                c += 2.0;
                300_000.0
            } else {
                c -= 2.6;
                10_000.0
            };
            bars.push(bar(i, c, c + 3.0, c - 3.0, c, vol));
        }
        let frame = frame_from_bars(bars);
        let (price_change, obv_change) = obv_endpoint_divergence(&frame, 20);
        assert!(price_change < 0.0, "price change {price_change}");
        assert!(obv_change > 0.0, "obv change {obv_change}");
    }

    #[test]
    fn ma_support_requires_touch_and_hold() {
        // flat tape: every average sits at the close, so a bar that dips to
        // within 2% and closes back on the level reads as a touch-and-hold
        let mut bars: Vec<PriceBar> = (0..70)
            .map(|i| bar(i, 100.0, 100.5, 99.5, 100.0, 100_000.0))
            .collect();
        bars.push(bar(70, 100.0, 100.5, 98.5, 100.0, 100_000.0));
        let frame = frame_from_bars(bars);
        let support = ma_support(&frame);
        assert!(support.ma20);
        assert!(support.ma60);
        // only 71 bars: SMA120 has no value yet
        assert!(!support.ma120);
    }

    #[test]
    fn rsi_oversold_exit_flags_cross() {
        // long decline, then a sharp two-day rally
        let mut closes: Vec<f64> = (0..60).map(|i| 200.0 - i as f64 * 2.0).collect();
        closes.push(90.0);
        closes.push(102.0);
        let frame = frame_from_closes(&closes);
        let sig = rsi_signal(&frame);
        // after a pure downtrend the RSI starts near zero, so any strong
        // bounce must at least mark oversold or the exit
        assert!(sig.oversold || sig.oversold_exit);
    }
}
