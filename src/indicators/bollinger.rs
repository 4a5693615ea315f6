// =============================================================================
// Bollinger Bands (20, 2) plus width and band position
// =============================================================================

use super::sma::{rolling_std, sma_min1};

#[derive(Debug, Clone)]
pub struct BollingerSeries {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
    /// Band width as a percentage of the middle band.
    pub width: Vec<f64>,
    /// Close position inside the band: 0 = lower band, 1 = upper band.
    /// 0.5 when the band has zero range.
    pub position: Vec<f64>,
}

pub fn bollinger(closes: &[f64], period: usize, std_mult: f64) -> BollingerSeries {
    let middle = sma_min1(closes, period);
    let std = rolling_std(closes, period);

    let n = closes.len();
    let mut upper = vec![f64::NAN; n];
    let mut lower = vec![f64::NAN; n];
    let mut width = vec![f64::NAN; n];
    let mut position = vec![f64::NAN; n];

    for i in 0..n {
        if !middle[i].is_finite() || !std[i].is_finite() {
            continue;
        }
        upper[i] = middle[i] + std[i] * std_mult;
        lower[i] = middle[i] - std[i] * std_mult;

        if middle[i] != 0.0 {
            width[i] = (upper[i] - lower[i]) / middle[i] * 100.0;
        }

        let range = upper[i] - lower[i];
        position[i] = if range > 0.0 {
            (closes[i] - lower[i]) / range
        } else {
            0.5
        };
    }

    BollingerSeries {
        upper,
        middle,
        lower,
        width,
        position,
    }
}
