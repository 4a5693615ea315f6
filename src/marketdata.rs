// =============================================================================
// Market data provider seam
// =============================================================================
//
// The collector that actually talks to exchanges is an external service; the
// engine only needs three reads, all behind a trait so every consumer is
// testable without the network:
//
//   - daily OHLCV history per ticker
//   - the KRX listing (code, name, market, market cap, traded value, shares)
//   - an index's previous-day change (the macro multiplier input)
//
// `FileProvider` reads the collector's drop directory:
//   <root>/ohlcv/<code>.csv        Date,Open,High,Low,Close,Volume
//   <root>/listing.csv             Code,Name,Market,Marcap,Amount,Stocks
//   <root>/indices.json            {"nasdaq": -1.2, "kospi": 0.4, ...}
// =============================================================================

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{EngineError, EngineResult};
use crate::types::{PriceBar, PriceSeries};

/// Index identifiers the engine consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketIndex {
    Nasdaq,
    Kospi,
    Kosdaq,
}

impl MarketIndex {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Nasdaq => "nasdaq",
            Self::Kospi => "kospi",
            Self::Kosdaq => "kosdaq",
        }
    }
}

/// One row of the exchange listing.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingRow {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Market")]
    pub market: String,
    /// Previous-day market cap (KRW).
    #[serde(rename = "Marcap", default)]
    pub marcap: i64,
    /// Previous-day traded value (KRW).
    #[serde(rename = "Amount", default)]
    pub amount: i64,
    /// Listed share count.
    #[serde(rename = "Stocks", default)]
    pub stocks: i64,
}

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Most recent `n` daily bars, oldest first, including today's partial
    /// bar during the session.
    async fn daily_bars(&self, ticker: &str, n: usize) -> EngineResult<PriceSeries>;

    /// The full exchange listing as of the previous close.
    async fn listing(&self) -> EngineResult<Vec<ListingRow>>;

    /// Previous-day change of an index, percent.
    async fn index_prev_change(&self, index: MarketIndex) -> EngineResult<f64>;
}

// =============================================================================
// FileProvider
// =============================================================================

pub struct FileProvider {
    root: PathBuf,
}

#[derive(Debug, Deserialize)]
struct OhlcvRow {
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Open")]
    open: f64,
    #[serde(rename = "High")]
    high: f64,
    #[serde(rename = "Low")]
    low: f64,
    #[serde(rename = "Close")]
    close: f64,
    #[serde(rename = "Volume")]
    volume: f64,
}

impl FileProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl MarketDataProvider for FileProvider {
    async fn daily_bars(&self, ticker: &str, n: usize) -> EngineResult<PriceSeries> {
        let path = self.root.join("ohlcv").join(format!("{ticker}.csv"));
        let mut reader = csv::Reader::from_path(&path).map_err(|e| {
            EngineError::Internal(format!("no bars for {ticker}: {e}"))
        })?;

        let mut bars = Vec::new();
        for row in reader.deserialize::<OhlcvRow>() {
            let row = row?;
            let ts = row
                .date
                .parse()
                .map_err(|e| EngineError::Internal(format!("bad date in {ticker}: {e}")))?;
            bars.push(PriceBar {
                ts,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            });
        }

        if bars.len() > n {
            bars.drain(..bars.len() - n);
        }

        PriceSeries::new(ticker, bars).map_err(EngineError::Internal)
    }

    async fn listing(&self) -> EngineResult<Vec<ListingRow>> {
        let path = self.root.join("listing.csv");
        let mut reader = csv::Reader::from_path(&path)
            .map_err(|e| EngineError::Internal(format!("no listing file: {e}")))?;

        let mut rows = Vec::new();
        for row in reader.deserialize::<ListingRow>() {
            let mut row = row?;
            row.code = format!("{:0>6}", row.code);
            rows.push(row);
        }
        Ok(rows)
    }

    async fn index_prev_change(&self, index: MarketIndex) -> EngineResult<f64> {
        let path = self.root.join("indices.json");
        let content = std::fs::read_to_string(&path)?;
        let map: BTreeMap<String, f64> = serde_json::from_str(&content)
            .map_err(|e| EngineError::Internal(format!("bad indices.json: {e}")))?;
        map.get(index.key())
            .copied()
            .ok_or_else(|| EngineError::Internal(format!("index {} missing", index.key())))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn write_fixture(dir: &std::path::Path) {
        std::fs::create_dir_all(dir.join("ohlcv")).unwrap();
        std::fs::write(
            dir.join("ohlcv/005930.csv"),
            "Date,Open,High,Low,Close,Volume\n\
             2026-01-05,100,110,95,105,1000\n\
             2026-01-06,105,112,101,110,1200\n\
             2026-01-07,110,115,108,112,900\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("listing.csv"),
            "Code,Name,Market,Marcap,Amount,Stocks\n\
             5930,SamsungElec,KOSPI,400000000000000,800000000000,5969782550\n\
             068270,Celltrion,KOSPI,40000000000000,90000000000,218000000\n",
        )
        .unwrap();
        std::fs::write(dir.join("indices.json"), r#"{"nasdaq": -2.4, "kospi": 0.3}"#).unwrap();
    }

    #[tokio::test]
    async fn reads_bars_with_tail_limit() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let provider = FileProvider::new(dir.path());

        let series = provider.daily_bars("005930", 2).await.unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.last().unwrap().close, 112.0);
    }

    #[tokio::test]
    async fn listing_zero_pads_codes() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let provider = FileProvider::new(dir.path());

        let rows = provider.listing().await.unwrap();
        assert_eq!(rows[0].code, "005930");
        assert_eq!(rows[1].code, "068270");
    }

    #[tokio::test]
    async fn index_lookup() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let provider = FileProvider::new(dir.path());

        let change = provider.index_prev_change(MarketIndex::Nasdaq).await.unwrap();
        assert!((change + 2.4).abs() < 1e-9);
        assert!(provider
            .index_prev_change(MarketIndex::Kosdaq)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn missing_ticker_errors() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let provider = FileProvider::new(dir.path());
        assert!(provider.daily_bars("999999", 10).await.is_err());
    }
}
