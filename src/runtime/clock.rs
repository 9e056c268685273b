//! Wall-clock helpers for persisted timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub fn wall_time_iso_utc() -> String {
    iso_from_unix_ms(now_unix_ms())
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

pub fn iso_from_unix_ms(ms: u64) -> String {
    let nanos = i128::from(ms) * 1_000_000;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string())
}

/// Unparsable timestamps yield `None`; callers decide how to treat them.
pub fn parse_iso_ms(raw: &str) -> Option<u64> {
    let dt = OffsetDateTime::parse(raw, &Rfc3339).ok()?;
    let ms = dt.unix_timestamp_nanos() / 1_000_000;
    u64::try_from(ms).ok()
}

/// Compact UTC stamp for file names, e.g. `20260102T030405Z`.
pub fn file_stamp_utc(ms: u64) -> String {
    let nanos = i128::from(ms) * 1_000_000;
    match OffsetDateTime::from_unix_timestamp_nanos(nanos) {
        Ok(dt) => format!(
            "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
            dt.year(),
            u8::from(dt.month()),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second()
        ),
        Err(_) => "19700101T000000Z".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_round_trips_through_millis() {
        let iso = iso_from_unix_ms(1_767_323_045_123);
        assert_eq!(parse_iso_ms(&iso), Some(1_767_323_045_123));
        assert_eq!(file_stamp_utc(1_767_323_045_123), "20260102T030405Z");
        assert_eq!(parse_iso_ms("not a time"), None);
    }
}
