// =============================================================================
// IndicatorFrame: every derived series for one ticker, typed columns
// =============================================================================
//
// A pure function of the PriceSeries. Every column has the same length as
// the bar vector, with NaN during warmup. Scorers read columns through the
// `last`/`prev` helpers and never recompute indicators themselves.
// =============================================================================

use crate::types::{PriceBar, PriceSeries};

use super::atr::atr;
use super::bollinger::bollinger;
use super::macd::macd;
use super::obv::obv;
use super::rsi::rsi;
use super::sma::{rolling_max, rolling_min, sma, sma_min1};
use super::stoch::{stoch, stoch_rsi};
use super::supertrend::supertrend;

/// Last finite-or-NaN value of a column.
pub fn last(v: &[f64]) -> f64 {
    v.last().copied().unwrap_or(f64::NAN)
}

/// Value `back` bars before the last (back = 1 is the previous bar).
pub fn prev(v: &[f64], back: usize) -> f64 {
    if v.len() > back {
        v[v.len() - 1 - back]
    } else {
        f64::NAN
    }
}

#[derive(Debug, Clone)]
pub struct IndicatorFrame {
    pub ticker: String,
    pub bars: Vec<PriceBar>,

    // Moving averages
    pub sma5: Vec<f64>,
    pub sma10: Vec<f64>,
    pub sma20: Vec<f64>,
    pub sma60: Vec<f64>,
    pub sma120: Vec<f64>,
    /// 5-bar percentage slope of SMA20.
    pub sma20_slope: Vec<f64>,

    // Oscillators
    pub rsi: Vec<f64>,
    pub macd: Vec<f64>,
    pub macd_signal: Vec<f64>,
    pub macd_hist: Vec<f64>,
    pub stoch_k: Vec<f64>,
    pub stoch_d: Vec<f64>,
    pub stochrsi_k: Vec<f64>,
    pub stochrsi_d: Vec<f64>,

    // Bands / volatility
    pub bb_upper: Vec<f64>,
    pub bb_middle: Vec<f64>,
    pub bb_lower: Vec<f64>,
    pub bb_width: Vec<f64>,
    pub bb_width_ma: Vec<f64>,
    pub bb_position: Vec<f64>,
    pub atr: Vec<f64>,
    pub atr_ma: Vec<f64>,
    pub supertrend_line: Vec<f64>,
    /// +1 uptrend, -1 downtrend.
    pub supertrend_dir: Vec<i8>,

    // Volume
    pub vol_ma5: Vec<f64>,
    pub vol_ma20: Vec<f64>,
    /// volume / vol_ma20, 1.0 by convention when the average is zero.
    pub vol_ratio: Vec<f64>,
    pub obv: Vec<f64>,
    pub obv_ma20: Vec<f64>,
    pub trading_value: Vec<f64>,

    // Candle geometry
    pub candle_body: Vec<f64>,
    pub candle_body_pct: Vec<f64>,
    pub candle_range: Vec<f64>,
    pub upper_shadow: Vec<f64>,
    pub lower_shadow: Vec<f64>,

    // 20-day range
    pub low_20d: Vec<f64>,
    pub high_20d: Vec<f64>,
    /// Close position inside the 20-day range, 0 = at the low.
    pub pos_in_range: Vec<f64>,
}

impl IndicatorFrame {
    /// Compute every column. Pure and deterministic: the same series always
    /// produces the same frame.
    pub fn compute(series: &PriceSeries) -> Self {
        let bars = series.bars.clone();
        let closes = series.closes();
        let volumes = series.volumes();
        let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
        let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
        let n = bars.len();

        let sma5 = sma(&closes, 5);
        let sma10 = sma(&closes, 10);
        let sma20 = sma(&closes, 20);
        let sma60 = sma(&closes, 60);
        let sma120 = sma(&closes, 120);

        let mut sma20_slope = vec![f64::NAN; n];
        for i in 5..n {
            let ago = sma20[i - 5];
            if ago.is_finite() && ago > 0.0 && sma20[i].is_finite() {
                sma20_slope[i] = (sma20[i] - ago) / ago * 100.0;
            }
        }

        let rsi_series = rsi(&closes, 14);
        let macd_series = macd(&closes, 12, 26, 9);
        let bb = bollinger(&closes, 20, 2.0);
        let bb_width_ma = sma_min1(&bb.width, 20);

        let atr_series = atr(&bars, 14);
        let atr_ma = sma_min1(&atr_series, 20);
        let st = supertrend(&bars, 10, 3.0);

        let vol_ma5 = sma_min1(&volumes, 5);
        let vol_ma20 = sma_min1(&volumes, 20);
        let vol_ratio: Vec<f64> = volumes
            .iter()
            .enumerate()
            .map(|(i, v)| {
                if vol_ma20[i].is_finite() && vol_ma20[i] > 0.0 {
                    v / vol_ma20[i]
                } else {
                    1.0
                }
            })
            .collect();

        let obv_series = obv(&closes, &volumes);
        let obv_ma20 = sma_min1(&obv_series, 20);

        let trading_value: Vec<f64> = bars.iter().map(|b| b.trading_value()).collect();

        let mut candle_body = vec![0.0; n];
        let mut candle_body_pct = vec![0.0; n];
        let mut candle_range = vec![0.0; n];
        let mut upper_shadow = vec![0.0; n];
        let mut lower_shadow = vec![0.0; n];
        for (i, b) in bars.iter().enumerate() {
            candle_body[i] = b.close - b.open;
            candle_body_pct[i] = if b.open > 0.0 {
                (b.close - b.open) / b.open * 100.0
            } else {
                0.0
            };
            candle_range[i] = b.high - b.low;
            upper_shadow[i] = b.high - b.open.max(b.close);
            lower_shadow[i] = b.open.min(b.close) - b.low;
        }

        let low_20d = rolling_min(&lows, 20);
        let high_20d = rolling_max(&highs, 20);
        let pos_in_range: Vec<f64> = closes
            .iter()
            .enumerate()
            .map(|(i, c)| (c - low_20d[i]) / (high_20d[i] - low_20d[i] + 1e-4))
            .collect();

        let stoch_series = stoch(&bars, 14, 3);
        let stochrsi_series = stoch_rsi(&closes, 14, 14, 3, 3);

        Self {
            ticker: series.ticker.clone(),
            bars,
            sma5,
            sma10,
            sma20,
            sma60,
            sma120,
            sma20_slope,
            rsi: rsi_series,
            macd: macd_series.macd,
            macd_signal: macd_series.signal,
            macd_hist: macd_series.histogram,
            stoch_k: stoch_series.k,
            stoch_d: stoch_series.d,
            stochrsi_k: stochrsi_series.k,
            stochrsi_d: stochrsi_series.d,
            bb_upper: bb.upper,
            bb_middle: bb.middle,
            bb_lower: bb.lower,
            bb_width: bb.width,
            bb_width_ma,
            bb_position: bb.position,
            atr: atr_series,
            atr_ma,
            supertrend_line: st.line,
            supertrend_dir: st.direction,
            vol_ma5,
            vol_ma20,
            vol_ratio,
            obv: obv_series,
            obv_ma20,
            trading_value,
            candle_body,
            candle_body_pct,
            candle_range,
            upper_shadow,
            lower_shadow,
            low_20d,
            high_20d,
            pos_in_range,
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last_bar(&self) -> &PriceBar {
        self.bars.last().expect("frame is never built empty")
    }

    pub fn prev_bar(&self) -> &PriceBar {
        if self.bars.len() > 1 {
            &self.bars[self.bars.len() - 2]
        } else {
            self.last_bar()
        }
    }

    /// Day-over-day change of the last close, percent.
    pub fn change_pct(&self) -> f64 {
        let prev_close = self.prev_bar().close;
        if prev_close > 0.0 {
            (self.last_bar().close - prev_close) / prev_close * 100.0
        } else {
            0.0
        }
    }

    /// Highest high over the last `n` bars.
    pub fn high_n(&self, n: usize) -> f64 {
        self.bars
            .iter()
            .rev()
            .take(n)
            .map(|b| b.high)
            .fold(f64::MIN, f64::max)
    }

    /// Lowest low over the last `n` bars.
    pub fn low_n(&self, n: usize) -> f64 {
        self.bars
            .iter()
            .rev()
            .take(n)
            .map(|b| b.low)
            .fold(f64::MAX, f64::min)
    }

    /// 5 > 20 > 60 alignment on the last bar.
    pub fn is_aligned(&self) -> bool {
        let (s5, s20, s60) = (last(&self.sma5), last(&self.sma20), last(&self.sma60));
        s5.is_finite() && s20.is_finite() && s60.is_finite() && s5 > s20 && s20 > s60
    }

    /// 5 < 20 < 60 reverse alignment on the last bar.
    pub fn is_reverse_aligned(&self) -> bool {
        let (s5, s20, s60) = (last(&self.sma5), last(&self.sma20), last(&self.sma60));
        s5.is_finite() && s20.is_finite() && s60.is_finite() && s5 < s20 && s20 < s60
    }

    /// Number of bearish candles among the last `n` bars.
    pub fn down_days(&self, n: usize) -> usize {
        self.bars
            .iter()
            .rev()
            .take(n)
            .filter(|b| b.close < b.open)
            .count()
    }
}
