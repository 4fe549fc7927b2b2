//! Session identifier rules
//!
//! Session identifiers are opaque, case-sensitive strings supplied by the
//! client. The single exception is the satellite-derived form, whose shape
//! is a contract with the satellite firmware: a satellite with no declared
//! session gets `satellite-<device-id>-<calendar-date>` so its session rolls
//! over daily.

use chrono::{NaiveDate, Utc};

/// Build the auto-generated session identifier for a satellite device.
pub fn satellite_session_id(device_id: &str, date: NaiveDate) -> String {
    format!("satellite-{}-{}", device_id, date.format("%Y-%m-%d"))
}

/// Today's satellite session identifier.
pub fn satellite_session_id_today(device_id: &str) -> String {
    satellite_session_id(device_id, Utc::now().date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_satellite_session_format() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        assert_eq!(
            satellite_session_id("sat-1", date),
            "satellite-sat-1-2025-01-15"
        );
    }

    #[test]
    fn test_rollover_changes_id() {
        let d1 = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let d2 = d1.succ_opt().unwrap();
        assert_ne!(
            satellite_session_id("sat-1", d1),
            satellite_session_id("sat-1", d2)
        );
    }
}
