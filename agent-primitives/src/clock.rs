//! ISO-8601 timestamps as they appear on the wire.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Naive UTC with microseconds, e.g. `2025-01-31T09:15:02.318220`.
const WIRE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Returns the current UTC time rendered in the wire format.
#[must_use]
pub fn now_iso8601() -> String {
    Utc::now().format(WIRE_FORMAT).to_string()
}

/// Parses a wire timestamp.
///
/// Accepts RFC 3339 values with an offset as well as naive values, which are
/// interpreted as UTC.
#[must_use]
pub fn parse_iso8601(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_own_output() {
        let now = now_iso8601();
        assert!(parse_iso8601(&now).is_some(), "{now}");
    }

    #[test]
    fn parses_offset_and_naive_forms() {
        let with_offset = parse_iso8601("2025-03-01T10:00:00+02:00").unwrap();
        let naive = parse_iso8601("2025-03-01T08:00:00").unwrap();
        assert_eq!(with_offset, naive);
        assert!(parse_iso8601("yesterday").is_none());
    }
}
