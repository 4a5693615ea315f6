// =============================================================================
// Relative Strength Index (RSI) with Wilder's smoothing
// =============================================================================
//
// Step 1: deltas of consecutive closes.
// Step 2: seed average gain / loss with the SMA of the first `period` deltas.
// Step 3: Wilder smoothing
//           avg_gain = (prev_avg_gain * (period - 1) + gain) / period
// Step 4: RS = avg_gain / avg_loss, RSI = 100 - 100 / (1 + RS)
// =============================================================================

/// Full RSI series aligned with `closes` (NaN for the first `period` slots).
///
/// # Edge cases
/// - `period == 0` or fewer than `period + 1` closes => all NaN
/// - flat market (no gains, no losses) => 50.0
/// - no losses => 100.0, no gains => 0.0
pub fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; closes.len()];
    if period == 0 || closes.len() < period + 1 {
        return out;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    out[period] = rsi_from_averages(avg_gain, avg_loss);

    for (i, &delta) in deltas.iter().enumerate().skip(period) {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        out[i + 1] = rsi_from_averages(avg_gain, avg_loss);
    }

    out
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}
