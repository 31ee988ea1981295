use std::time::Duration;

use crate::error::{ProxyError, Result};

/// Parse a duration string of the form `"30s"`, `"500ms"`, `"2m"`, `"1h"`.
///
/// An empty string or `"0"` means no timeout and yields `Duration::ZERO`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() || s == "0" {
        return Ok(Duration::ZERO);
    }

    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };

    let n: u64 = value
        .parse()
        .map_err(|_| ProxyError::Config(format!("invalid duration: {s}")))?;

    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(ProxyError::Config(format!("invalid duration unit: {s}"))),
    }
}

/// Parse an optional duration field, falling back to `default` when the
/// field is missing or malformed.
pub fn parse_duration_or(s: Option<&str>, default: Duration) -> Duration {
    match s {
        Some(v) => parse_duration(v).unwrap_or(default),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn empty_means_no_timeout() {
        assert_eq!(parse_duration("").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn bare_number_defaults_to_seconds() {
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("5 parsecs").is_err());
    }
}
