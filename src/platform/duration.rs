//! Human duration values shared by CLI flags and `surfwright.toml` (e.g. "250ms", "30s", "1h30m", "7d").

use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{SurfError, SurfResult};

const UNITS: [(&str, u64); 5] = [
    ("d", 86_400_000),
    ("h", 3_600_000),
    ("m", 60_000),
    ("s", 1_000),
    ("ms", 1),
];

/// A duration written as one or more `<integer><unit>` segments. Serialized in the same form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SurfDuration(pub Duration);

impl SurfDuration {
    pub const fn from_hours(hours: u64) -> Self {
        Self(Duration::from_secs(hours * 3_600))
    }

    pub fn as_millis_u64(self) -> u64 {
        self.0.as_millis().min(u128::from(u64::MAX)) as u64
    }
}

impl From<SurfDuration> for Duration {
    fn from(value: SurfDuration) -> Self {
        value.0
    }
}

impl FromStr for SurfDuration {
    type Err = SurfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(Self)
    }
}

impl TryFrom<String> for SurfDuration {
    type Error = SurfError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SurfDuration> for String {
    fn from(value: SurfDuration) -> Self {
        value.to_string()
    }
}

/// Largest units first, zero segments omitted: 90 minutes prints as `1h30m`.
impl fmt::Display for SurfDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rest = self.as_millis_u64();
        if rest == 0 {
            return f.write_str("0ms");
        }
        for (unit, ms) in UNITS {
            let n = rest / ms;
            if n > 0 {
                write!(f, "{n}{unit}")?;
                rest %= ms;
            }
        }
        Ok(())
    }
}

pub fn parse_duration(input: &str) -> SurfResult<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(SurfError::query("empty duration"));
    }

    let mut total_ms: u64 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            return Err(SurfError::query(format!(
                "invalid duration {input:?}: expected a number at {rest:?}"
            )));
        }
        let (num, after) = rest.split_at(digits);
        let letters = after.len() - after.trim_start_matches(|c: char| c.is_ascii_alphabetic()).len();
        let (unit, next) = after.split_at(letters);
        if unit.is_empty() {
            return Err(SurfError::query(format!(
                "invalid duration {input:?}: missing unit after {num} (expected ms|s|m|h|d)"
            )));
        }
        let scale = UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, ms)| *ms)
            .ok_or_else(|| {
                SurfError::query(format!(
                    "invalid duration unit {unit:?} in {input:?} (expected ms|s|m|h|d)"
                ))
            })?;
        let value: u64 = num
            .parse()
            .map_err(|_| SurfError::query(format!("invalid duration number {num} in {input:?}")))?;
        total_ms = total_ms.saturating_add(value.saturating_mul(scale));
        rest = next;
    }

    Ok(Duration::from_millis(total_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_and_compound_forms() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration(" 30s ").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("168h").unwrap(), Duration::from_secs(168 * 3600));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86_400));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5_400));
        assert_eq!(parse_duration("1m500ms").unwrap(), Duration::from_millis(60_500));
    }

    #[test]
    fn malformed_values_are_query_errors() {
        for bad in ["", "30", "h", "5x", "1h30", "1.5h", "-3s"] {
            let err = parse_duration(bad).unwrap_err();
            assert_eq!(err.code(), "E_QUERY_INVALID", "{bad}");
        }
    }

    #[test]
    fn display_uses_the_largest_units() {
        assert_eq!(SurfDuration(Duration::from_secs(5_400)).to_string(), "1h30m");
        assert_eq!(SurfDuration::from_hours(168).to_string(), "7d");
        assert_eq!(SurfDuration(Duration::from_millis(1_250)).to_string(), "1s250ms");
        assert_eq!(SurfDuration(Duration::ZERO).to_string(), "0ms");
    }

    #[test]
    fn serde_goes_through_the_text_form() {
        #[derive(Deserialize, Serialize)]
        struct Doc {
            age: SurfDuration,
        }
        let doc: Doc = toml::from_str("age = \"90m\"").expect("parse");
        assert_eq!(doc.age.0, Duration::from_secs(5_400));
        assert_eq!(serde_json::to_value(&doc).expect("json"), serde_json::json!({"age": "1h30m"}));
        assert!(toml::from_str::<Doc>("age = \"soon\"").is_err());
    }
}
