// =============================================================================
// Average True Range
// =============================================================================
//
// True range = max(high - low, |high - prev_close|, |low - prev_close|).
// ATR here is the rolling mean of TR with a minimum window of one sample,
// so it warms up immediately (the exit-plan strategies depend on that).
// =============================================================================

use crate::types::PriceBar;

use super::sma::sma_min1;

/// True-range series aligned with the bars. The first bar has no previous
/// close, so its TR is simply high - low.
pub fn true_range(bars: &[PriceBar]) -> Vec<f64> {
    bars.iter()
        .enumerate()
        .map(|(i, b)| {
            if i == 0 {
                b.high - b.low
            } else {
                let prev_close = bars[i - 1].close;
                (b.high - b.low)
                    .max((b.high - prev_close).abs())
                    .max((b.low - prev_close).abs())
            }
        })
        .collect()
}

/// ATR series (rolling mean of TR, min window 1).
pub fn atr(bars: &[PriceBar], period: usize) -> Vec<f64> {
    sma_min1(&true_range(bars), period)
}
