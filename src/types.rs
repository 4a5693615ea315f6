// =============================================================================
// Shared types used across the KRX trading engine
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Listing market of a ticker. Transfer tax differs per market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Market {
    Kospi,
    Kosdaq,
}

impl Default for Market {
    fn default() -> Self {
        Self::Kosdaq
    }
}

impl Market {
    /// Parse the market string found in listing / snapshot files.
    /// Anything that is not recognisably KOSPI is treated as KOSDAQ.
    pub fn parse(s: &str) -> Self {
        if s.to_uppercase().contains("KOSPI") {
            Self::Kospi
        } else {
            Self::Kosdaq
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kospi => "KOSPI",
            Self::Kosdaq => "KOSDAQ",
        }
    }
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-user trading mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    /// No automated orders at all.
    Manual,
    /// Candidates become suggestions awaiting user approval.
    Semi,
    /// Fully automated buys and sells.
    Auto,
    /// Decision-plugin driven mode, paper accounts only.
    Greenlight,
}

impl Default for TradeMode {
    fn default() -> Self {
        Self::Manual
    }
}

impl TradeMode {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "semi" => Self::Semi,
            "auto" => Self::Auto,
            "greenlight" => Self::Greenlight,
            _ => Self::Manual,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Semi => "semi",
            Self::Auto => "auto",
            Self::Greenlight => "greenlight",
        }
    }
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a journaled order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Executed,
    Cancelled,
    /// Accepted by the engine, refused by the broker. Still blacklists the
    /// ticker for the day so the same order is not retried every tick.
    Rejected,
    DryRun,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executed => "executed",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
            Self::DryRun => "dry_run",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "cancelled" => Self::Cancelled,
            "rejected" => Self::Rejected,
            "dry_run" => Self::DryRun,
            _ => Self::Executed,
        }
    }
}

/// One daily OHLCV observation. Immutable once collected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub ts: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl PriceBar {
    /// `high >= max(open, close) >= min(open, close) >= low`, volume >= 0.
    pub fn is_valid(&self) -> bool {
        let body_hi = self.open.max(self.close);
        let body_lo = self.open.min(self.close);
        self.high >= body_hi && body_lo >= self.low && self.volume >= 0.0
    }

    pub fn trading_value(&self) -> f64 {
        self.close * self.volume
    }
}

/// Ordered daily bars for one ticker, strictly increasing timestamps.
#[derive(Debug, Clone, Default)]
pub struct PriceSeries {
    pub ticker: String,
    pub bars: Vec<PriceBar>,
}

impl PriceSeries {
    /// Build a series, rejecting invalid bars and non-increasing timestamps.
    pub fn new(ticker: impl Into<String>, bars: Vec<PriceBar>) -> Result<Self, String> {
        for (i, bar) in bars.iter().enumerate() {
            if !bar.is_valid() {
                return Err(format!("invalid bar at index {i}: {bar:?}"));
            }
            if i > 0 && bar.ts <= bars[i - 1].ts {
                return Err(format!("non-increasing timestamp at index {i}"));
            }
        }
        Ok(Self {
            ticker: ticker.into(),
            bars,
        })
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&PriceBar> {
        self.bars.last()
    }

    /// Timestamp of the newest bar, used as part of the indicator cache key.
    pub fn last_ts(&self) -> Option<NaiveDate> {
        self.bars.last().map(|b| b.ts)
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.volume).collect()
    }
}

/// One position as reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldingInfo {
    pub ticker: String,
    #[serde(default)]
    pub name: String,
    pub quantity: i64,
    pub avg_price: i64,
    pub current_price: i64,
    #[serde(default)]
    pub profit_rate: f64,
    #[serde(default)]
    pub market: Market,
}

/// Account-level summary as reported by the broker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSummary {
    /// D+2 settled cash.
    #[serde(default)]
    pub d2_cash: i64,
    /// Orderable amount (excludes open orders).
    #[serde(default)]
    pub max_buy_amount: i64,
    #[serde(default)]
    pub total_eval_amount: i64,
    #[serde(default)]
    pub total_profit_loss: i64,
}

/// Broker balance response: positions plus the account summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountBalance {
    pub holdings: Vec<HoldingInfo>,
    pub summary: AccountSummary,
}

impl AccountBalance {
    pub fn total_assets(&self) -> i64 {
        self.summary.total_eval_amount + self.summary.d2_cash
    }
}

/// An order resting at the broker, not yet filled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub ticker: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub price: i64,
}

/// KRX tick size by price band.
pub fn tick_size(price: i64) -> i64 {
    match price {
        p if p < 1_000 => 1,
        p if p < 5_000 => 5,
        p if p < 10_000 => 10,
        p if p < 50_000 => 50,
        p if p < 100_000 => 100,
        p if p < 500_000 => 500,
        _ => 1_000,
    }
}

/// Round a price down (or up) to the nearest valid tick.
pub fn round_to_tick(price: i64, round_down: bool) -> i64 {
    let tick = tick_size(price);
    if round_down {
        (price / tick) * tick
    } else {
        ((price + tick - 1) / tick) * tick
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts: &str, o: f64, h: f64, l: f64, c: f64, v: f64) -> PriceBar {
        PriceBar {
            ts: ts.parse().unwrap(),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
        }
    }

    #[test]
    fn bar_validity() {
        assert!(bar("2026-01-05", 100.0, 110.0, 95.0, 105.0, 1000.0).is_valid());
        // high below close
        assert!(!bar("2026-01-05", 100.0, 101.0, 95.0, 105.0, 1000.0).is_valid());
        // negative volume
        assert!(!bar("2026-01-05", 100.0, 110.0, 95.0, 105.0, -1.0).is_valid());
    }

    #[test]
    fn series_rejects_unsorted_bars() {
        let bars = vec![
            bar("2026-01-06", 100.0, 110.0, 95.0, 105.0, 1000.0),
            bar("2026-01-05", 100.0, 110.0, 95.0, 105.0, 1000.0),
        ];
        assert!(PriceSeries::new("005930", bars).is_err());
    }

    #[test]
    fn series_accepts_sorted_bars() {
        let bars = vec![
            bar("2026-01-05", 100.0, 110.0, 95.0, 105.0, 1000.0),
            bar("2026-01-06", 105.0, 112.0, 101.0, 110.0, 1200.0),
        ];
        let s = PriceSeries::new("005930", bars).unwrap();
        assert_eq!(s.len(), 2);
        assert_eq!(s.last_ts().unwrap(), "2026-01-06".parse().unwrap());
    }

    #[test]
    fn tick_sizes_by_band() {
        assert_eq!(tick_size(900), 1);
        assert_eq!(tick_size(4_990), 5);
        assert_eq!(tick_size(9_990), 10);
        assert_eq!(tick_size(49_950), 50);
        assert_eq!(tick_size(99_900), 100);
        assert_eq!(tick_size(499_500), 500);
        assert_eq!(tick_size(600_000), 1_000);
    }

    #[test]
    fn round_to_tick_down_and_up() {
        assert_eq!(round_to_tick(2_201, true), 2_200);
        assert_eq!(round_to_tick(2_201, false), 2_205);
        assert_eq!(round_to_tick(2_200, true), 2_200);
    }

    #[test]
    fn mode_and_market_parse() {
        assert_eq!(TradeMode::parse("SEMI"), TradeMode::Semi);
        assert_eq!(TradeMode::parse("unknown"), TradeMode::Manual);
        assert_eq!(Market::parse("KOSPI"), Market::Kospi);
        assert_eq!(Market::parse("KOSDAQ GLOBAL"), Market::Kosdaq);
    }
}
