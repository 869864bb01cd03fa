//! Duration type with human-readable parsing support.
//!
//! Supports parsing from:
//! - Numbers (interpreted as milliseconds): `5000`
//! - Strings with suffixes: `"100us"`, `"5ms"`, `"5s"`, `"5m"`, `"1h"`, `"1d"`
//!
//! A value of zero means "disabled" for every timeout that accepts it.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Duration stored in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Duration(pub u64);

impl Duration {
    pub const fn from_micros(us: u64) -> Self {
        Duration(us)
    }

    pub const fn from_millis(ms: u64) -> Self {
        Duration(ms * 1000)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Duration(secs * 1_000_000)
    }

    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    pub const fn as_millis(&self) -> u64 {
        self.0 / 1000
    }

    pub const fn as_secs(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Zero disables the timeout it configures.
    pub const fn is_disabled(&self) -> bool {
        self.0 == 0
    }

    /// Convert to std::time::Duration for use with tokio and std APIs.
    pub const fn as_std(&self) -> std::time::Duration {
        std::time::Duration::from_micros(self.0)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        std::time::Duration::from_micros(d.0)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.as_millis())
    }
}

fn parse_duration_str(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (number, multiplier_us) = if let Some(v) = s.strip_suffix("us") {
        (v, 1f64)
    } else if let Some(v) = s.strip_suffix("ms") {
        (v, 1_000f64)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1_000_000f64)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60f64 * 1_000_000f64)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3600f64 * 1_000_000f64)
    } else if let Some(v) = s.strip_suffix('d') {
        (v, 86400f64 * 1_000_000f64)
    } else {
        // Bare number in a string: milliseconds.
        (s, 1_000f64)
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    if value < 0.0 {
        return Err("duration cannot be negative".into());
    }
    Ok(Duration((value * multiplier_us) as u64))
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl de::Visitor<'_> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration like '5s', '100ms', '1h' or a number in milliseconds")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_millis(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                if v < 0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                Ok(Duration::from_millis(v as u64))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                if v < 0.0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                Ok(Duration::from_micros((v * 1000.0) as u64))
            }

            fn visit_str<E>(self, v: &str) -> Result<Duration, E>
            where
                E: de::Error,
            {
                parse_duration_str(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

impl Serialize for Duration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixes() {
        assert_eq!(parse_duration_str("100us").unwrap(), Duration(100));
        assert_eq!(parse_duration_str("5ms").unwrap(), Duration(5_000));
        assert_eq!(parse_duration_str("5s").unwrap(), Duration(5_000_000));
        assert_eq!(parse_duration_str("2m").unwrap(), Duration(120_000_000));
        assert_eq!(parse_duration_str("1h").unwrap(), Duration(3_600_000_000));
        assert_eq!(parse_duration_str("0.5s").unwrap(), Duration(500_000));
    }

    #[test]
    fn bare_number_is_milliseconds() {
        assert_eq!(parse_duration_str("250").unwrap(), Duration(250_000));
    }

    #[test]
    fn negative_is_rejected() {
        assert!(parse_duration_str("-5s").is_err());
    }

    #[test]
    fn zero_is_disabled() {
        assert!(Duration::from_millis(0).is_disabled());
        assert!(!Duration::from_millis(1).is_disabled());
    }
}
