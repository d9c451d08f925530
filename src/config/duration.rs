//! Human-readable duration strings (`"300ms"`, `"5s"`, `"1h30m"`).

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Parse a compound duration string. Bare numbers are seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::config("empty duration"));
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut unit = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        if !c.is_ascii_alphabetic() {
            return Err(Error::config(format!("invalid duration: {:?}", s)));
        }
        unit.push(c);
        // Units may be two letters (ms, us, ns).
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphabetic() {
                unit.push(next);
                chars.next();
            } else {
                break;
            }
        }
        let value: f64 = number
            .parse()
            .map_err(|_| Error::config(format!("invalid duration: {:?}", s)))?;
        let unit_duration = match unit.as_str() {
            "ns" => Duration::from_nanos(1),
            "us" => Duration::from_micros(1),
            "ms" => Duration::from_millis(1),
            "s" => Duration::from_secs(1),
            "m" => Duration::from_secs(60),
            "h" => Duration::from_secs(3600),
            "d" => Duration::from_secs(24 * 3600),
            other => {
                return Err(Error::config(format!(
                    "unknown duration unit {:?} in {:?}",
                    other, s
                )))
            }
        };
        total += unit_duration.mul_f64(value);
        number.clear();
        unit.clear();
    }
    if !number.is_empty() {
        return Err(Error::config(format!(
            "duration missing unit: {:?}",
            s
        )));
    }
    Ok(total)
}

fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }
    let mut secs = d.as_secs();
    let mut out = String::new();
    for (unit, name) in [(3600, "h"), (60, "m")] {
        if secs >= unit {
            out.push_str(&format!("{}{}", secs / unit, name));
            secs %= unit;
        }
    }
    if secs > 0 || out.is_empty() {
        out.push_str(&format!("{}s", secs));
    }
    out
}

/// A `Duration` that serializes as a duration string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct DurationOption(pub Duration);

impl DurationOption {
    pub fn get(&self) -> Duration {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Duration> for DurationOption {
    fn from(d: Duration) -> Self {
        DurationOption(d)
    }
}

impl Serialize for DurationOption {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(self.0))
    }
}

impl<'de> Deserialize<'de> for DurationOption {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw)
            .map(DurationOption)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("s5").is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let d = DurationOption(Duration::from_secs(5400));
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, "\"1h30m\"");
        let back: DurationOption = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);

        let ms: DurationOption = serde_json::from_str("\"250ms\"").unwrap();
        assert_eq!(ms.get(), Duration::from_millis(250));
    }
}
