// =============================================================================
// Indicator cache
// =============================================================================
//
// LRU cache keyed by (ticker, last bar timestamp) with a TTL. Because the
// key carries the newest bar's timestamp, a frame computed before a new bar
// arrived can never be served for the new bar: the key simply differs.
// The TTL bounds staleness for repeated hits within one tick window.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use parking_lot::RwLock;

use crate::types::PriceSeries;

use super::frame::IndicatorFrame;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub ticker: String,
    pub as_of: NaiveDate,
}

struct Entry {
    frame: Arc<IndicatorFrame>,
    computed_at: Instant,
    last_used: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub maxsize: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Inner {
    entries: HashMap<CacheKey, Entry>,
    hits: u64,
    misses: u64,
    tick: u64,
}

pub struct IndicatorCache {
    inner: RwLock<Inner>,
    maxsize: usize,
    ttl: Duration,
}

impl IndicatorCache {
    pub fn new(maxsize: usize, ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                tick: 0,
            }),
            maxsize: maxsize.max(1),
            ttl,
        }
    }

    /// Default sizing: 500 entries, 5 minute TTL.
    pub fn with_default_ttl(maxsize: usize) -> Self {
        Self::new(maxsize, Duration::from_secs(300))
    }

    /// Fetch the frame for `series`, computing (and caching) on a miss or
    /// an expired entry.
    pub fn get_or_compute(&self, series: &PriceSeries) -> Arc<IndicatorFrame> {
        let Some(as_of) = series.last_ts() else {
            // An empty series is never cached.
            return Arc::new(IndicatorFrame::compute(series));
        };
        let key = CacheKey {
            ticker: series.ticker.clone(),
            as_of,
        };

        {
            let mut inner = self.inner.write();
            inner.tick += 1;
            let tick = inner.tick;
            if let Some(entry) = inner.entries.get_mut(&key) {
                if entry.computed_at.elapsed() <= self.ttl {
                    entry.last_used = tick;
                    let frame = entry.frame.clone();
                    inner.hits += 1;
                    return frame;
                }
            }
        }

        let frame = Arc::new(IndicatorFrame::compute(series));

        let mut inner = self.inner.write();
        inner.misses += 1;
        let tick = inner.tick;
        inner.entries.insert(
            key,
            Entry {
                frame: frame.clone(),
                computed_at: Instant::now(),
                last_used: tick,
            },
        );

        // LRU eviction once over capacity.
        while inner.entries.len() > self.maxsize {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest);
            } else {
                break;
            }
        }

        frame
    }

    pub fn invalidate(&self, ticker: &str) {
        let mut inner = self.inner.write();
        inner.entries.retain(|k, _| k.ticker != ticker);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        CacheStats {
            size: inner.entries.len(),
            maxsize: self.maxsize,
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriceBar;

    fn series(ticker: &str, n: usize, base: f64) -> PriceSeries {
        let bars: Vec<PriceBar> = (0..n)
            .map(|i| PriceBar {
                ts: chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
                    + chrono::Duration::days(i as i64),
                open: base,
                high: base * 1.01,
                low: base * 0.99,
                close: base,
                volume: 1000.0,
            })
            .collect();
        PriceSeries::new(ticker, bars).unwrap()
    }

    #[test]
    fn second_fetch_hits() {
        let cache = IndicatorCache::with_default_ttl(10);
        let s = series("005930", 70, 100.0);
        let a = cache.get_or_compute(&s);
        let b = cache.get_or_compute(&s);
        assert!(Arc::ptr_eq(&a, &b));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn newer_bar_changes_the_key() {
        let cache = IndicatorCache::with_default_ttl(10);
        let s1 = series("005930", 70, 100.0);
        let s2 = series("005930", 71, 100.0);
        cache.get_or_compute(&s1);
        cache.get_or_compute(&s2);
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.size, 2);
    }

    #[test]
    fn eviction_keeps_size_bounded() {
        let cache = IndicatorCache::with_default_ttl(3);
        for i in 0..6 {
            let s = series(&format!("{:06}", i), 70, 100.0);
            cache.get_or_compute(&s);
        }
        assert!(cache.stats().size <= 3);
    }

    #[test]
    fn expired_entry_recomputes() {
        let cache = IndicatorCache::new(10, Duration::from_millis(0));
        let s = series("005930", 70, 100.0);
        cache.get_or_compute(&s);
        cache.get_or_compute(&s);
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn invalidate_removes_all_entries_for_ticker() {
        let cache = IndicatorCache::with_default_ttl(10);
        cache.get_or_compute(&series("005930", 70, 100.0));
        cache.get_or_compute(&series("035720", 70, 100.0));
        cache.invalidate("005930");
        assert_eq!(cache.stats().size, 1);
    }
}
