use crate::error::{FleetError, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Tag value written for resources that never expire
pub const ZERO_EXPIRY: &str = "0001-01-01T00:00:00Z";

/// Timestamps earlier than this are treated as "never" by the expiry sweep
const EXPIRY_EPOCH_FLOOR: i64 = 483_580_800; // 1985-04-29T00:00:00Z

/// Absolute expiry of a node or volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Expiry {
    #[default]
    Never,
    At(DateTime<Utc>),
}

impl Expiry {
    /// `now + ttl`, or never for a zero ttl
    pub fn after(ttl: Duration, now: DateTime<Utc>) -> Self {
        if ttl <= Duration::zero() {
            Expiry::Never
        } else {
            Expiry::At(now + ttl)
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Expiry::Never => None,
            Expiry::At(at) => Some(*at),
        }
    }

    pub fn is_never(&self) -> bool {
        matches!(self, Expiry::Never)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self, Expiry::At(at) if *at <= now)
    }

    /// RFC3339 form stored in provider tags
    pub fn to_tag(&self) -> String {
        match self {
            Expiry::Never => ZERO_EXPIRY.to_string(),
            Expiry::At(at) => at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        }
    }

    /// Unix-seconds form for label stores that reject `:`
    pub fn to_label(&self) -> String {
        match self {
            Expiry::Never => "0".to_string(),
            Expiry::At(at) => at.timestamp().to_string(),
        }
    }

    /// Parses either tag form. Empty, `0` and the zero sentinel mean never.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() || value == "0" || value == ZERO_EXPIRY {
            return Ok(Expiry::Never);
        }

        let at = if value.bytes().all(|b| b.is_ascii_digit()) {
            let secs: i64 = value
                .parse()
                .map_err(|_| FleetError::validation(format!("invalid expiry '{}'", value)))?;
            Utc.timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| FleetError::validation(format!("invalid expiry '{}'", value)))?
        } else {
            DateTime::parse_from_rfc3339(value)
                .map_err(|e| FleetError::validation(format!("invalid expiry '{}': {}", value, e)))?
                .with_timezone(&Utc)
        };

        if at.timestamp() < EXPIRY_EPOCH_FLOOR {
            Ok(Expiry::Never)
        } else {
            Ok(Expiry::At(at))
        }
    }
}

impl fmt::Display for Expiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expiry::Never => write!(f, "never"),
            Expiry::At(at) => write!(f, "{}", at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        }
    }
}

impl Serialize for Expiry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_tag())
    }
}

impl<'de> Deserialize<'de> for Expiry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Expiry::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Parses a ttl such as `30h`, `1h30m`, `2d` or `0`.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let invalid = || FleetError::validation(format!("invalid duration '{}'", value));

    if value == "0" {
        return Ok(Duration::zero());
    }
    if value.is_empty() {
        return Err(invalid());
    }

    let mut total: i64 = 0;
    let mut digits = String::new();
    for c in value.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let amount: i64 = digits.parse().map_err(|_| invalid())?;
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            _ => return Err(invalid()),
        };
        total = amount
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(invalid());
    }

    Duration::try_seconds(total).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_parse_never_forms() {
        for raw in ["", "0", ZERO_EXPIRY, "1970-01-01T00:00:00Z", "86400"] {
            assert_eq!(Expiry::parse(raw).unwrap(), Expiry::Never, "{raw}");
        }
    }

    #[test]
    fn test_parse_rfc3339_and_unix() {
        let expected = at("2026-03-01T12:00:00Z");
        assert_eq!(
            Expiry::parse("2026-03-01T12:00:00Z").unwrap(),
            Expiry::At(expected)
        );
        assert_eq!(
            Expiry::parse("2026-03-01T13:00:00+01:00").unwrap(),
            Expiry::At(expected)
        );
        assert_eq!(
            Expiry::parse(&expected.timestamp().to_string()).unwrap(),
            Expiry::At(expected)
        );
        assert!(Expiry::parse("tomorrow").is_err());
    }

    #[test]
    fn test_tag_and_label_forms() {
        let expiry = Expiry::At(at("2026-03-01T12:00:00Z"));
        assert_eq!(expiry.to_tag(), "2026-03-01T12:00:00Z");
        assert_eq!(Expiry::parse(&expiry.to_label()).unwrap(), expiry);
        assert_eq!(Expiry::Never.to_tag(), ZERO_EXPIRY);
        assert_eq!(Expiry::Never.to_label(), "0");
    }

    #[test]
    fn test_after_and_expired() {
        let now = at("2026-03-01T12:00:00Z");
        assert_eq!(Expiry::after(Duration::zero(), now), Expiry::Never);
        let expiry = Expiry::after(Duration::hours(30), now);
        assert_eq!(expiry.timestamp(), Some(at("2026-03-02T18:00:00Z")));
        assert!(!expiry.is_expired(now));
        assert!(expiry.is_expired(at("2026-03-03T00:00:00Z")));
        assert!(!Expiry::Never.is_expired(at("2999-01-01T00:00:00Z")));
    }

    #[test]
    fn test_serde_uses_tag_form() {
        let json = serde_json::to_string(&Expiry::Never).unwrap();
        assert_eq!(json, format!("\"{}\"", ZERO_EXPIRY));
        let back: Expiry = serde_json::from_str("\"2026-03-01T12:00:00Z\"").unwrap();
        assert_eq!(back, Expiry::At(at("2026-03-01T12:00:00Z")));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30h").unwrap(), Duration::hours(30));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::minutes(90));
        assert_eq!(parse_duration("2d").unwrap(), Duration::days(2));
        assert_eq!(parse_duration("45s").unwrap(), Duration::seconds(45));
        assert_eq!(parse_duration("0").unwrap(), Duration::zero());
        for bad in ["", "h", "30", "3x", "-1h"] {
            assert!(parse_duration(bad).is_err(), "{bad}");
        }
    }
}
