//! Julian day helpers

use chrono::{DateTime, Utc};

/// Julian day of the J2000.0 epoch (2000-01-01 12:00 TT).
pub const J2000_JD: f64 = 2_451_545.0;

/// Julian day of the Unix epoch.
const UNIX_EPOCH_JD: f64 = 2_440_587.5;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Julian day number (with fraction) for a UTC instant.
pub fn julian_day(when: DateTime<Utc>) -> f64 {
    when.timestamp_millis() as f64 / MILLIS_PER_DAY + UNIX_EPOCH_JD
}

/// Julian centuries elapsed since J2000.0.
pub fn centuries_since_j2000(jd: f64) -> f64 {
    (jd - J2000_JD) / 36_525.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    #[test]
    fn test_j2000_epoch() {
        let noon = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert_relative_eq!(julian_day(noon), J2000_JD, epsilon = 1e-9);
        assert_relative_eq!(centuries_since_j2000(julian_day(noon)), 0.0);
    }

    #[test]
    fn test_known_date() {
        // 1987 April 10, 19:21:00 UT
        let when = Utc.with_ymd_and_hms(1987, 4, 10, 19, 21, 0).unwrap();
        assert_relative_eq!(julian_day(when), 2_446_896.306_25, epsilon = 1e-6);
    }
}
