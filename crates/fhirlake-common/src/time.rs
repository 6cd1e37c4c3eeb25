//! FHIR instant helpers
//!
//! FHIR search parameters and `meta.lastUpdated` use RFC 3339 instants. The
//! pipeline works at millisecond granularity: it is the smallest interval the
//! splitter will ever try to divide.

use crate::error::{LakeError, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeDelta, Utc};

/// Smallest interval the splitter divides
pub const MIN_GRANULARITY_MS: i64 = 1;

/// One step of [`MIN_GRANULARITY_MS`]
pub fn granularity() -> TimeDelta {
    TimeDelta::milliseconds(MIN_GRANULARITY_MS)
}

/// Render an instant as `2024-01-01T00:00:00.000Z`
pub fn format_instant(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 instant or a bare `YYYY-MM-DD` date (midnight UTC)
pub fn parse_instant(value: &str) -> Result<DateTime<Utc>> {
    let trimmed = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }

    let date = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").map_err(|e| {
        LakeError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        }
    })?;
    date.and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| LakeError::InvalidTimestamp {
            value: value.to_string(),
            reason: "date out of range".to_string(),
        })
}

/// Whole milliseconds between two instants
pub fn span_millis(from: &DateTime<Utc>, to: &DateTime<Utc>) -> i64 {
    (*to - *from).num_milliseconds()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_instant_uses_millis_and_z() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(format_instant(&ts), "2024-03-01T12:30:05.000Z");
    }

    #[test]
    fn test_parse_instant_with_offset() {
        let ts = parse_instant("2024-03-01T14:30:05.250+02:00").unwrap();
        assert_eq!(format_instant(&ts), "2024-03-01T12:30:05.250Z");
    }

    #[test]
    fn test_parse_bare_date() {
        let ts = parse_instant("2023-12-31").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2023, 12, 31, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_garbage_is_rejected() {
        assert!(matches!(
            parse_instant("yesterday"),
            Err(LakeError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn test_span_millis() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = from + granularity() * 7;
        assert_eq!(span_millis(&from, &to), 7);
    }
}
