//! ---
//! rampart_section: "01-core-functionality"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Wall-clock and duration helpers."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Current wall-clock time used for reported timestamps.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Convert a duration into whole milliseconds, saturating at `u64::MAX`.
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Express a duration as fractional milliseconds for averages and reports.
pub fn duration_to_millis_f64(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}

/// Convert a day count into a `chrono` duration, clamping absurd retention windows.
pub fn retention_window(days: u32) -> chrono::Duration {
    chrono::Duration::days(i64::from(days.min(36_500)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_conversion_saturates() {
        assert_eq!(duration_to_millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(duration_to_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn fractional_millis() {
        let value = duration_to_millis_f64(Duration::from_micros(2_500));
        assert!((value - 2.5).abs() < f64::EPSILON);
    }
}
