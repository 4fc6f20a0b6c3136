// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Shared helpers for date/time arithmetic and formatting.

use chrono::{
    DateTime, Duration as ChronoDuration, NaiveDate, SecondsFormat, TimeZone, Timelike, Utc,
};
use std::time::Duration;

/// Format a UTC timestamp as RFC3339 using a `Z` suffix.
pub fn format_utc_rfc3339(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Time left until the next `HH:00:00` boundary after `now`.
///
/// Exactly on the hour this is a full hour, never zero.
pub fn until_next_hour<Tz: TimeZone>(now: &DateTime<Tz>) -> Duration {
    let into_hour = u64::from(now.minute()) * 60 + u64::from(now.second());
    let elapsed = Duration::from_secs(into_hour)
        + Duration::from_nanos(u64::from(now.nanosecond() % 1_000_000_000));
    Duration::from_secs(3600).saturating_sub(elapsed)
}

/// Render seconds as `mm:ss` (minutes are not wrapped at 60).
pub fn format_mmss(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

/// Wall-clock `HH:MM:SS` of `now + wait`.
pub fn format_deadline(now: DateTime<Utc>, wait: Duration) -> String {
    let target = now + ChronoDuration::from_std(wait).unwrap_or_else(|_| ChronoDuration::zero());
    target.format("%H:%M:%S").to_string()
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

/// Yesterday in UTC: the most recent day whose data is complete.
pub fn yesterday() -> NaiveDate {
    (Utc::now() - ChronoDuration::days(1)).date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_until_next_hour_mid_hour() {
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 14, 37, 10).unwrap();
        assert_eq!(until_next_hour(&now), Duration::from_secs(22 * 60 + 50));
    }

    #[test]
    fn test_until_next_hour_on_the_hour() {
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 9, 0, 0).unwrap();
        assert_eq!(until_next_hour(&now), Duration::from_secs(3600));
    }

    #[test]
    fn test_format_mmss() {
        assert_eq!(format_mmss(0), "00:00");
        assert_eq!(format_mmss(1370), "22:50");
        assert_eq!(format_mmss(3605), "60:05");
    }

    #[test]
    fn test_format_deadline() {
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 14, 37, 10).unwrap();
        assert_eq!(format_deadline(now, Duration::from_secs(1375)), "15:00:05");
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(parse_date("2024-02-29"), NaiveDate::from_ymd_opt(2024, 2, 29));
        assert_eq!(parse_date("29/02/2024"), None);
    }
}
