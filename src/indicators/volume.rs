// =============================================================================
// Projected intraday volume
// =============================================================================
//
// During the session the partial day's volume is extrapolated to the close
// by elapsed-minute weighting over the 390-minute session. The first hour
// front-loads turnover, so a 0.7 dampener applies there. The caller injects
// minutes-into-session from its Clock, which keeps this module pure.
// =============================================================================

/// Minutes in a full 09:00..15:30 session.
pub const SESSION_MINUTES: f64 = 390.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectedVolume {
    pub raw: f64,
    pub projected: f64,
    /// raw volume / 20-day average.
    pub raw_ratio: f64,
    /// projected volume / 20-day average.
    pub projected_ratio: f64,
}

/// Extrapolate the current day's partial volume.
///
/// `minutes_into_session = None` means outside market hours: no projection,
/// the raw volume is used as-is. A zero average yields ratio 1.0.
pub fn project_volume(
    raw_volume: f64,
    vol_ma20: f64,
    minutes_into_session: Option<u32>,
) -> ProjectedVolume {
    let projected = match minutes_into_session {
        Some(mins) => {
            let elapsed = (mins as f64).max(1.0);
            let factor = if elapsed < 60.0 {
                (SESSION_MINUTES / elapsed) * 0.7
            } else {
                SESSION_MINUTES / elapsed
            };
            raw_volume * factor
        }
        None => raw_volume,
    };

    let ratio = |v: f64| {
        if vol_ma20 > 0.0 {
            v / vol_ma20
        } else {
            1.0
        }
    };

    ProjectedVolume {
        raw: raw_volume,
        projected,
        raw_ratio: ratio(raw_volume),
        projected_ratio: ratio(projected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outside_market_hours_is_identity() {
        let p = project_volume(1_000.0, 2_000.0, None);
        assert_eq!(p.projected, 1_000.0);
        assert!((p.projected_ratio - 0.5).abs() < 1e-12);
    }

    #[test]
    fn first_hour_applies_dampener() {
        // 30 minutes in: factor = (390 / 30) * 0.7 = 9.1
        let p = project_volume(1_000.0, 1_000.0, Some(30));
        assert!((p.projected - 9_100.0).abs() < 1e-9);
    }

    #[test]
    fn after_first_hour_no_dampener() {
        // 195 minutes in: factor = 2.0
        let p = project_volume(1_000.0, 1_000.0, Some(195));
        assert!((p.projected - 2_000.0).abs() < 1e-9);
        assert!((p.projected_ratio - 2.0).abs() < 1e-9);
    }

    #[test]
    fn zero_minutes_clamps_to_one() {
        let p = project_volume(100.0, 1_000.0, Some(0));
        // factor = (390 / 1) * 0.7 = 273
        assert!((p.projected - 27_300.0).abs() < 1e-9);
    }

    #[test]
    fn zero_average_gives_unit_ratio() {
        let p = project_volume(1_000.0, 0.0, Some(120));
        assert!((p.raw_ratio - 1.0).abs() < 1e-12);
        assert!((p.projected_ratio - 1.0).abs() < 1e-12);
    }
}
