//! Watermark codec
//!
//! Watermarks are written as RFC 3339 UTC with second precision. Reading also
//! accepts ISO 8601 without offset (taken as UTC) and the US culture format
//! older deployments wrote, e.g. `1/1/2024 2:00:00 AM`.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use crmtrail_core::error::{CrmTrailError, Result};
use crmtrail_core::value::parse_backend_timestamp;

const LEGACY_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M:%S",
];

/// Serialize a watermark
pub fn format_watermark(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a stored watermark
pub fn parse_watermark(text: &str) -> Result<DateTime<Utc>> {
    let text = text.trim();

    if let Some(timestamp) = parse_backend_timestamp(text) {
        return Ok(timestamp);
    }

    LEGACY_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| CrmTrailError::Config(format!("Unreadable watermark '{}'", text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();
        assert_eq!(format_watermark(&ts), "2024-01-01T02:00:00Z");
    }

    #[test]
    fn test_parse_accepted_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();

        for text in [
            "2024-01-01T02:00:00Z",
            "2024-01-01T03:00:00+01:00",
            "2024-01-01T02:00:00",
            "2024-01-01T02:00:00.000",
            "2024-01-01 02:00:00",
            "1/1/2024 2:00:00 AM",
            "01/01/2024 02:00:00",
            "  2024-01-01T02:00:00Z\n",
        ] {
            assert_eq!(parse_watermark(text).unwrap(), expected, "format {:?}", text);
        }

        let afternoon = Utc.with_ymd_and_hms(2024, 3, 15, 14, 5, 9).unwrap();
        assert_eq!(parse_watermark("3/15/2024 2:05:09 PM").unwrap(), afternoon);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for text in ["", "yesterday", "2024-13-01T00:00:00", "15/15/2024 2:00:00 AM"] {
            assert!(matches!(parse_watermark(text), Err(CrmTrailError::Config(_))), "{:?}", text);
        }
    }
}
