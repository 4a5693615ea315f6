// =============================================================================
// v2: trend following with volume confirmation
// =============================================================================
//
// The core intraday strategy. Oversold is a falling knife here, so reverse
// alignment (5 < 20 < 60) disqualifies outright.
//
//   Trend    (max 30): alignment +5, SMA20 slope up to +15, MACD +3,
//                      Supertrend flip +7
//   Momentum (max 35, floor -10): RSI sweet spot, 60-day high proximity
//   Supply   (max 35, floor -10): projected volume ratio, turnover
//                      (trading value / market cap) or trading-value tiers
//
// Intraday the day's partial volume is projected to the close; before 10:00
// the previous day's trading value substitutes when it is larger.
// =============================================================================

use crate::indicators::{last, prev, project_volume, IndicatorFrame};

use super::{Disqualification, ScoreExtras, ScoreResult, Scorer};

pub struct ScorerV2;

impl Scorer for ScorerV2 {
    fn version(&self) -> &str {
        "v2"
    }

    fn check_disqualifiers(
        &self,
        frame: &IndicatorFrame,
        _extras: &ScoreExtras,
    ) -> Option<Disqualification> {
        if frame.is_reverse_aligned() {
            return Some(Disqualification::with_signal(
                "reverse alignment (SMA5 < SMA20 < SMA60)",
                "MA_REVERSE_ALIGNED",
            ));
        }
        None
    }

    fn score_groups(&self, frame: &IndicatorFrame, extras: &ScoreExtras, out: &mut ScoreResult) {
        let bar = frame.last_bar();

        // ---- Trend (max 30) -------------------------------------------------
        let mut trend = 0i32;

        if frame.is_aligned() {
            trend += 5;
            out.signal("MA_ALIGNED");
        }

        let slope = last(&frame.sma20_slope);
        if slope.is_finite() {
            out.indicator("sma20_slope", slope);
            if slope >= 3.0 {
                trend += 15;
                out.signal("MA_20_VERY_STEEP");
            } else if slope >= 1.5 {
                trend += 10;
                out.signal("MA_20_STEEP");
            } else if slope >= 0.5 {
                trend += 3;
                out.signal("MA_20_RISING");
            }
        }

        let macd = last(&frame.macd);
        if macd.is_finite() {
            out.indicator("macd", macd);
            if macd > 0.0 {
                trend += 3;
                out.signal("MACD_BULL");
            }
        }

        let n = frame.supertrend_dir.len();
        if n >= 2 && frame.supertrend_dir[n - 2] == -1 && frame.supertrend_dir[n - 1] == 1 {
            trend += 7;
            out.signal("SUPERTREND_BUY");
        }

        out.group("trend", trend.min(30));

        // ---- Momentum (max 35, floor -10) ----------------------------------
        let mut momentum = 0i32;

        let rsi = last(&frame.rsi);
        let prev_rsi = prev(&frame.rsi, 1);
        if rsi.is_finite() {
            out.indicator("rsi", rsi);
            if (60.0..=75.0).contains(&rsi) {
                momentum += 15;
                out.signal("RSI_SWEET_SPOT");
            } else if (50.0..60.0).contains(&rsi) {
                momentum += 5;
                out.signal("RSI_HEALTHY");
            } else if rsi > 80.0 {
                if prev_rsi.is_finite() && rsi > prev_rsi {
                    momentum += 10;
                    out.signal("RSI_POWER_BULL");
                } else {
                    momentum -= 5;
                    out.signal("RSI_PEAK_OUT");
                }
            } else if rsi < 30.0 {
                momentum -= 10;
                out.signal("RSI_FALLING_KNIFE");
            }
        }

        let high_60d = frame.high_n(60);
        out.indicator("high_60d", high_60d);
        out.indicator("high_60d_pct", (bar.close / high_60d - 1.0) * 100.0);
        if bar.close >= high_60d {
            momentum += 15;
            out.signal("BREAKOUT_60D_HIGH");
        } else if bar.close >= high_60d * 0.97 {
            momentum += 7;
            out.signal("NEAR_60D_HIGH");
        } else if bar.close >= high_60d * 0.95 {
            momentum += 3;
            out.signal("CLOSE_TO_60D_HIGH");
        }

        out.group("momentum", momentum.clamp(-10, 35));

        // ---- Supply (max 35, floor -10) ------------------------------------
        let mut supply = 0i32;

        let projected = project_volume(
            bar.volume,
            last(&frame.vol_ma20),
            extras.minutes_into_session,
        );
        let vol_ratio = projected.projected_ratio;
        out.indicator("volume_ratio", vol_ratio);
        out.indicator("projected_volume", projected.projected);

        if vol_ratio >= 5.0 {
            supply += 20;
            out.signal("VOLUME_EXPLOSION");
        } else if vol_ratio >= 3.0 {
            supply += 12;
            out.signal("VOLUME_SURGE_3X");
        } else if vol_ratio >= 2.0 {
            supply += 5;
            out.signal("VOLUME_HIGH");
        }

        // Projected trading value; early session falls back to yesterday's
        // when the projection is still smaller.
        let projected_value = bar.close * projected.projected;
        let before_10 = extras.minutes_into_session.map_or(false, |m| m < 60);
        let trading_value = match extras.prev_trading_value {
            Some(prev_value) if before_10 && projected_value < prev_value => prev_value,
            _ => projected_value,
        };
        out.indicator("trading_value_used", trading_value);

        match extras.market_cap {
            Some(cap) if cap > 0.0 => {
                let turnover = trading_value / cap * 100.0;
                out.indicator("turnover", turnover);
                if turnover >= 5.0 {
                    supply += 15;
                    out.signal("TURNOVER_HIGH_5PCT");
                } else if turnover >= 2.0 {
                    supply += 10;
                    out.signal("TURNOVER_MID_2PCT");
                } else if turnover >= 1.0 {
                    supply += 3;
                    out.signal("TURNOVER_LOW_1PCT");
                } else if turnover < 0.2 {
                    supply -= 5;
                    out.signal("TURNOVER_VERY_LOW");
                }
            }
            _ => {
                if trading_value >= 50_000_000_000.0 {
                    supply += 15;
                    out.signal("TRADING_VALUE_500B");
                } else if trading_value >= 10_000_000_000.0 {
                    supply += 10;
                    out.signal("TRADING_VALUE_100B");
                } else if trading_value >= 3_000_000_000.0 {
                    supply += 3;
                    out.signal("TRADING_VALUE_30B");
                } else if trading_value < 1_000_000_000.0 {
                    supply -= 5;
                    out.signal("LOW_LIQUIDITY");
                }
            }
        }

        out.group("supply", supply.clamp(-10, 35));
    }
}
