// =============================================================================
// MACD (Moving Average Convergence Divergence)
// =============================================================================
//
// macd      = EMA(fast) - EMA(slow)
// signal    = EMA(macd, signal_span)
// histogram = macd - signal
// =============================================================================

use super::ema::ema;

#[derive(Debug, Clone)]
pub struct MacdSeries {
    pub macd: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

/// Standard MACD(12, 26, 9) unless other spans are given.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal_span: usize) -> MacdSeries {
    let fast_ema = ema(closes, fast);
    let slow_ema = ema(closes, slow);

    let line: Vec<f64> = fast_ema
        .iter()
        .zip(&slow_ema)
        .map(|(f, s)| f - s)
        .collect();
    let signal = ema(&line, signal_span);
    let histogram: Vec<f64> = line.iter().zip(&signal).map(|(m, s)| m - s).collect();

    MacdSeries {
        macd: line,
        signal,
        histogram,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_series_produces_zero_macd() {
        let closes = vec![100.0; 40];
        let m = macd(&closes, 12, 26, 9);
        assert!(m.macd.iter().all(|v| v.abs() < 1e-9));
        assert!(m.histogram.iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn rising_series_has_positive_macd() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        let m = macd(&closes, 12, 26, 9);
        assert!(*m.macd.last().unwrap() > 0.0);
        assert_eq!(m.macd.len(), closes.len());
        assert_eq!(m.histogram.len(), closes.len());
    }
}
