//! Timestamp parsing and formatting shared by the stores and the checker.
//!
//! All timestamps are naive UTC. Inputs carrying an offset are normalized.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike, Utc};

const FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

pub fn parse(input: &str) -> Option<NaiveDateTime> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.naive_utc());
    }
    for fmt in FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(input, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// ISO-8601 without offset; the fractional part is omitted when zero.
pub fn format(ts: &NaiveDateTime) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

/// Parse an HTTP `Last-Modified` value (RFC 2822 / IMF-fixdate).
pub fn parse_http_date(input: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc2822(input.trim())
        .ok()
        .map(|dt| dt.naive_utc())
}

/// Whether `at` lies less than `window` before `now`.
///
/// A zero window is never satisfied. A time ahead of `now` (clock skew
/// between machines sharing a registry) counts as recent.
pub fn is_within(at: NaiveDateTime, now: NaiveDateTime, window: Duration) -> bool {
    if window.is_zero() {
        return false;
    }
    match now.signed_duration_since(at).to_std() {
        Ok(age) => age < window,
        Err(_) => true,
    }
}

/// Current time, second precision.
pub fn now() -> NaiveDateTime {
    let now = Utc::now().naive_utc();
    now.with_nanosecond(0).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_naive_iso() {
        let ts = parse("2023-03-15T14:30:22").unwrap();
        assert_eq!(format(&ts), "2023-03-15T14:30:22");
    }

    #[test]
    fn normalizes_offsets_to_utc() {
        let ts = parse("2023-03-15T16:30:22+02:00").unwrap();
        assert_eq!(format(&ts), "2023-03-15T14:30:22");
    }

    #[test]
    fn keeps_fractional_seconds() {
        let ts = parse("2023-03-15T14:30:22.250").unwrap();
        assert_eq!(format(&ts), "2023-03-15T14:30:22.250");
    }

    #[test]
    fn accepts_bare_dates_and_rejects_garbage() {
        assert_eq!(
            format(&parse("2024-01-02").unwrap()),
            "2024-01-02T00:00:00"
        );
        assert!(parse("yesterday").is_none());
    }

    #[test]
    fn parses_last_modified_header() {
        let ts = parse_http_date("Sat, 22 Jul 2023 10:15:45 GMT").unwrap();
        assert_eq!(format(&ts), "2023-07-22T10:15:45");
    }

    #[test]
    fn is_within_window() {
        let now = parse("2026-10-18T12:00:00").unwrap();
        let day = Duration::from_secs(24 * 3600);
        assert!(is_within(parse("2026-10-18T00:00:00").unwrap(), now, day));
        assert!(!is_within(parse("2026-10-17T12:00:00").unwrap(), now, day));
        assert!(is_within(parse("2026-10-19T00:00:00").unwrap(), now, day));
        assert!(!is_within(now, now, Duration::ZERO));
    }
}
