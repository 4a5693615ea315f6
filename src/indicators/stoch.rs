// =============================================================================
// Stochastic oscillator and Stochastic RSI
// =============================================================================
//
// %K = 100 * (close - lowest_low(k)) / (highest_high(k) - lowest_low(k))
// %D = SMA(%K, d)
// A tiny epsilon keeps the denominator alive on flat windows.
//
// StochRSI applies the same %K/%D construction to the RSI series instead of
// price, normalised to 0..100.
// =============================================================================

use crate::types::PriceBar;

use super::rsi::rsi;
use super::sma::{rolling_max, rolling_min, sma_min1};

#[derive(Debug, Clone)]
pub struct StochSeries {
    pub k: Vec<f64>,
    pub d: Vec<f64>,
}

pub fn stoch(bars: &[PriceBar], k_period: usize, d_period: usize) -> StochSeries {
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    let hh = rolling_max(&highs, k_period);
    let ll = rolling_min(&lows, k_period);

    let k: Vec<f64> = closes
        .iter()
        .enumerate()
        .map(|(i, c)| 100.0 * (c - ll[i]) / (hh[i] - ll[i] + 1e-4))
        .collect();
    let d = sma_min1(&k, d_period);

    StochSeries { k, d }
}

/// StochRSI(14, 14, 3, 3): stochastic of the RSI series, 0..100.
pub fn stoch_rsi(
    closes: &[f64],
    rsi_period: usize,
    stoch_period: usize,
    k_smooth: usize,
    d_smooth: usize,
) -> StochSeries {
    let rsi_series = rsi(closes, rsi_period);

    let n = rsi_series.len();
    let mut raw = vec![f64::NAN; n];
    for i in 0..n {
        if !rsi_series[i].is_finite() {
            continue;
        }
        let start = i.saturating_sub(stoch_period - 1);
        let window: Vec<f64> = rsi_series[start..=i]
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .collect();
        if window.is_empty() {
            continue;
        }
        let hi = window.iter().cloned().fold(f64::MIN, f64::max);
        let lo = window.iter().cloned().fold(f64::MAX, f64::min);
        raw[i] = if hi > lo {
            100.0 * (rsi_series[i] - lo) / (hi - lo)
        } else {
            50.0
        };
    }

    // Smooth NaN-free tail only; the warmup prefix stays NaN.
    let first_finite = raw.iter().position(|v| v.is_finite()).unwrap_or(n);
    let mut k = vec![f64::NAN; n];
    let mut d = vec![f64::NAN; n];
    if first_finite < n {
        let tail_k = sma_min1(&raw[first_finite..], k_smooth);
        for (i, v) in tail_k.iter().enumerate() {
            k[first_finite + i] = *v;
        }
        let tail_d = sma_min1(&k[first_finite..], d_smooth);
        for (i, v) in tail_d.iter().enumerate() {
            d[first_finite + i] = *v;
        }
    }

    StochSeries { k, d }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars_from_closes(closes: &[f64]) -> Vec<PriceBar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| PriceBar {
                ts: chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
                    + chrono::Duration::days(i as i64),
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 1000.0,
            })
            .collect()
    }

    #[test]
    fn stoch_top_of_range_near_100() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64 * 10.0).collect();
        let s = stoch(&bars_from_closes(&closes), 14, 3);
        let k = *s.k.last().unwrap();
        assert!(k > 90.0, "expected near-100 %K, got {k}");
    }

    #[test]
    fn stoch_bottom_of_range_near_0() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64 * 10.0).collect();
        let s = stoch(&bars_from_closes(&closes), 14, 3);
        let k = *s.k.last().unwrap();
        assert!(k < 10.0, "expected near-0 %K, got {k}");
    }

    #[test]
    fn stoch_rsi_bounded() {
        let closes: Vec<f64> = (0..80)
            .map(|i| 100.0 + ((i % 7) as f64) - ((i % 3) as f64) * 2.0)
            .collect();
        let s = stoch_rsi(&closes, 14, 14, 3, 3);
        for v in s.k.iter().chain(s.d.iter()).filter(|v| v.is_finite()) {
            assert!((0.0..=100.0).contains(v), "stochrsi {v} out of range");
        }
    }
}
