// =============================================================================
// Supertrend (10, 3)
// =============================================================================
//
// Basic bands: (high + low) / 2 +/- multiplier * ATR.
// Final bands ratchet: the lower band only rises while price stays above it,
// the upper band only falls while price stays below it. Direction flips when
// the close crosses the active band.
// =============================================================================

use crate::types::PriceBar;

use super::atr::atr;

#[derive(Debug, Clone)]
pub struct SupertrendSeries {
    /// The active band value (support in an uptrend, resistance in a downtrend).
    pub line: Vec<f64>,
    /// +1 uptrend, -1 downtrend.
    pub direction: Vec<i8>,
}

pub fn supertrend(bars: &[PriceBar], period: usize, multiplier: f64) -> SupertrendSeries {
    let n = bars.len();
    let mut line = vec![f64::NAN; n];
    let mut direction = vec![0i8; n];
    if n == 0 {
        return SupertrendSeries { line, direction };
    }

    let atr_series = atr(bars, period);

    let mut final_upper = f64::NAN;
    let mut final_lower = f64::NAN;
    let mut dir: i8 = 1;

    for i in 0..n {
        let mid = (bars[i].high + bars[i].low) / 2.0;
        let band = multiplier * atr_series[i];
        let basic_upper = mid + band;
        let basic_lower = mid - band;

        if i == 0 {
            final_upper = basic_upper;
            final_lower = basic_lower;
        } else {
            let prev_close = bars[i - 1].close;
            final_upper = if basic_upper < final_upper || prev_close > final_upper {
                basic_upper
            } else {
                final_upper
            };
            final_lower = if basic_lower > final_lower || prev_close < final_lower {
                basic_lower
            } else {
                final_lower
            };

            dir = if bars[i].close > final_upper {
                1
            } else if bars[i].close < final_lower {
                -1
            } else {
                dir
            };
        }

        direction[i] = dir;
        line[i] = if dir == 1 { final_lower } else { final_upper };
    }

    SupertrendSeries { line, direction }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars(closes: &[f64]) -> Vec<PriceBar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| PriceBar {
                ts: chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
                    + chrono::Duration::days(i as i64),
                open: c,
                high: c + 2.0,
                low: c - 2.0,
                close: c,
                volume: 1000.0,
            })
            .collect()
    }

    #[test]
    fn strong_uptrend_stays_up() {
        let closes: Vec<f64> = (1..=40).map(|x| 100.0 + x as f64 * 3.0).collect();
        let st = supertrend(&bars(&closes), 10, 3.0);
        assert_eq!(*st.direction.last().unwrap(), 1);
    }

    #[test]
    fn collapse_flips_down() {
        let mut closes: Vec<f64> = (1..=30).map(|x| 100.0 + x as f64 * 3.0).collect();
        for i in 0..10 {
            closes.push(190.0 - i as f64 * 20.0);
        }
        let st = supertrend(&bars(&closes), 10, 3.0);
        assert_eq!(*st.direction.last().unwrap(), -1);
    }

    #[test]
    fn empty_input() {
        let st = supertrend(&[], 10, 3.0);
        assert!(st.line.is_empty());
        assert!(st.direction.is_empty());
    }
}
