// =============================================================================
// Injectable clock
// =============================================================================
//
// All market-hour decisions (buy window, pre-close window, projected-volume
// weighting, blacklist day boundary) go through this trait so that ticks can
// be replayed at a fixed instant in tests.
// =============================================================================

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, Timelike};

pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }

    /// Minutes elapsed since the 09:00 open, clamped to the 390-minute
    /// session. `None` outside 09:00..15:30.
    fn minutes_into_session(&self) -> Option<u32> {
        let now = self.now();
        let mins = now.hour() * 60 + now.minute();
        let open = 9 * 60;
        let close = 15 * 60 + 30;
        if mins < open || mins >= close {
            None
        } else {
            Some(mins - open)
        }
    }

    /// Weekday and inside the 09:00..=15:20 trading window.
    fn is_market_hours(&self) -> bool {
        let now = self.now();
        if now.weekday().number_from_monday() >= 6 {
            return false;
        }
        let mins = now.hour() * 60 + now.minute();
        (9 * 60..=15 * 60 + 20).contains(&mins)
    }

    /// New buys stop at 15:00; only sells run in the pre-close window.
    fn is_closing_window(&self) -> bool {
        self.now().hour() >= 15
    }

    /// 14:50..15:00, where the fallback buy threshold is tightened.
    fn is_pre_closing(&self) -> bool {
        let now = self.now();
        now.hour() == 14 && now.minute() >= 50
    }
}

/// Wall-clock implementation used by the binaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        let now: DateTime<Local> = Local::now();
        now.naive_local()
    }
}

/// Fixed clock for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl FixedClock {
    pub fn at(s: &str) -> Self {
        Self(NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").expect("valid datetime"))
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_minutes() {
        // 2026-03-02 is a Monday.
        assert_eq!(
            FixedClock::at("2026-03-02 09:00:00").minutes_into_session(),
            Some(0)
        );
        assert_eq!(
            FixedClock::at("2026-03-02 10:30:00").minutes_into_session(),
            Some(90)
        );
        assert_eq!(
            FixedClock::at("2026-03-02 15:30:00").minutes_into_session(),
            None
        );
        assert_eq!(
            FixedClock::at("2026-03-02 08:59:00").minutes_into_session(),
            None
        );
    }

    #[test]
    fn market_hours_window() {
        assert!(FixedClock::at("2026-03-02 09:00:00").is_market_hours());
        assert!(FixedClock::at("2026-03-02 15:20:00").is_market_hours());
        assert!(!FixedClock::at("2026-03-02 15:21:00").is_market_hours());
        // Saturday
        assert!(!FixedClock::at("2026-03-07 10:00:00").is_market_hours());
    }

    #[test]
    fn closing_windows() {
        assert!(FixedClock::at("2026-03-02 15:05:00").is_closing_window());
        assert!(!FixedClock::at("2026-03-02 14:55:00").is_closing_window());
        assert!(FixedClock::at("2026-03-02 14:55:00").is_pre_closing());
        assert!(!FixedClock::at("2026-03-02 14:45:00").is_pre_closing());
    }
}
