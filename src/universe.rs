// =============================================================================
// Daily tradable-universe filter
// =============================================================================
//
// The pre-market job: take the full exchange listing (previous close data),
// keep the names worth scoring, persist them as filtered_stocks_<date>.csv.
// Intraday ticks only ever load that file; if it is missing the tick aborts
// rather than re-enumerating the exchange mid-session.
//
// Hard filters: market cap floor (and optional ceiling), prior-day traded
// value floor, common share class only (code ends in '0'), and a name
// blocklist for SPACs, ETF/ETN wrappers, leverage/inverse products,
// numbered funds, and administrative-issue flags.
// =============================================================================

use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::marketdata::ListingRow;

/// Substrings that exclude a name from the universe.
const EXCLUDED_NAME_PARTS: &[&str] = &[
    "스팩",
    "SPAC",
    "리츠",
    "REIT",
    "ETF",
    "ETN",
    "인버스",
    "레버리지",
    "관리종목",
    "정리매매",
    "투자주의",
    "투자경고",
    "투자위험",
    "합병",
];

/// One universe row, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UniverseStock {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Market")]
    pub market: String,
    #[serde(rename = "Marcap")]
    pub marcap: i64,
    #[serde(rename = "Amount")]
    pub amount: i64,
    #[serde(rename = "Stocks")]
    pub stocks: i64,
}

/// Numbered-fund names: anything ending in 1호..10호 (or the same with a
/// trailing index inside the name).
fn is_numbered_fund(name: &str) -> bool {
    for i in 1..=10 {
        if name.contains(&format!("{i}호")) {
            return true;
        }
    }
    false
}

fn name_excluded(name: &str) -> bool {
    let upper = name.to_uppercase();
    EXCLUDED_NAME_PARTS
        .iter()
        .any(|kw| upper.contains(&kw.to_uppercase()))
        || is_numbered_fund(name)
}

/// Apply the hard filters to a raw listing.
pub fn filter_listing(listing: &[ListingRow], config: &EngineConfig) -> Vec<UniverseStock> {
    listing
        .iter()
        .filter(|row| row.marcap >= config.min_market_cap)
        .filter(|row| match config.max_market_cap {
            Some(cap) => row.marcap <= cap,
            None => true,
        })
        .filter(|row| row.amount >= config.min_trading_amount)
        .filter(|row| row.code.ends_with('0'))
        .filter(|row| !name_excluded(&row.name))
        .map(|row| UniverseStock {
            code: format!("{:0>6}", row.code),
            name: row.name.clone(),
            market: row.market.clone(),
            marcap: row.marcap,
            amount: row.amount,
            stocks: row.stocks,
        })
        .collect()
}

/// Write the daily universe file (atomic tmp + rename).
pub fn write_universe(path: &Path, stocks: &[UniverseStock]) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("csv.tmp");
    {
        let mut writer = csv::Writer::from_path(&tmp)?;
        for stock in stocks {
            writer.serialize(stock)?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)?;

    info!(path = %path.display(), count = stocks.len(), "universe file written");
    Ok(())
}

/// Load the universe for `date`. Missing file means the pre-market job did
/// not run; the caller aborts the tick.
pub fn load_universe(config: &EngineConfig, date: NaiveDate) -> EngineResult<Vec<UniverseStock>> {
    let path = config.universe_path(date);
    if !path.exists() {
        return Err(EngineError::StaleSnapshot(format!(
            "universe file missing: {}",
            path.display()
        )));
    }

    let mut reader = csv::Reader::from_path(&path)?;
    let mut stocks = Vec::new();
    for row in reader.deserialize::<UniverseStock>() {
        let mut stock = row?;
        stock.code = format!("{:0>6}", stock.code);
        stocks.push(stock);
    }

    info!(path = %path.display(), count = stocks.len(), "universe file loaded");
    Ok(stocks)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn row(code: &str, name: &str, marcap: i64, amount: i64) -> ListingRow {
        ListingRow {
            code: code.to_string(),
            name: name.to_string(),
            market: "KOSDAQ".to_string(),
            marcap,
            amount,
            stocks: 10_000_000,
        }
    }

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn floors_exclude_small_and_illiquid() {
        let listing = vec![
            row("005930", "SamsungElec", 100_000_000_000, 10_000_000_000),
            row("000010", "TinyCap", 10_000_000_000, 10_000_000_000),
            row("000020", "NoVolume", 100_000_000_000, 1_000_000_000),
        ];
        let filtered = filter_listing(&listing, &config());
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].code, "005930");
    }

    #[test]
    fn cap_ceiling_is_optional() {
        let listing = vec![row("005930", "MegaCap", 2_000_000_000_000, 10_000_000_000)];
        assert!(filter_listing(&listing, &config()).is_empty());

        let mut open_cap = config();
        open_cap.max_market_cap = None;
        assert_eq!(filter_listing(&listing, &open_cap).len(), 1);
    }

    #[test]
    fn preferred_shares_excluded_by_code_suffix() {
        let listing = vec![
            row("005935", "SamsungElec(1P)", 100_000_000_000, 10_000_000_000),
            row("005930", "SamsungElec", 100_000_000_000, 10_000_000_000),
        ];
        let filtered = filter_listing(&listing, &config());
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].code, "005930");
    }

    #[test]
    fn special_names_excluded() {
        for bad in [
            "하나금융25호스팩",
            "KODEX 레버리지",
            "TIGER 인버스",
            "SomeREIT",
            "교보15호",  // numbered fund style name would need 1..10; use 5호
            "신한제5호",
            "사조산업 관리종목",
        ] {
            let listing = vec![row("123450", bad, 100_000_000_000, 10_000_000_000)];
            let kept = filter_listing(&listing, &config());
            // 교보15호 contains "5호" so it is also dropped
            assert!(kept.is_empty(), "{bad} should be excluded");
        }
    }

    #[test]
    fn write_and_load_roundtrip_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.data_dir = dir.path().to_path_buf();
        let date: NaiveDate = "2026-03-02".parse().unwrap();

        let stocks = vec![UniverseStock {
            code: "005930".to_string(),
            name: "SamsungElec".to_string(),
            market: "KOSPI".to_string(),
            marcap: 100_000_000_000,
            amount: 10_000_000_000,
            stocks: 5_000_000,
        }];
        write_universe(&cfg.universe_path(date), &stocks).unwrap();

        let a = load_universe(&cfg, date).unwrap();
        let b = load_universe(&cfg, date).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, stocks);
        // No tmp residue.
        assert!(!cfg.universe_path(date).with_extension("csv.tmp").exists());
    }

    #[test]
    fn missing_file_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.data_dir = dir.path().to_path_buf();
        let err = load_universe(&cfg, "2026-03-02".parse().unwrap()).unwrap_err();
        assert!(matches!(err, EngineError::StaleSnapshot(_)));
    }
}
