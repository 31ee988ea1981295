use serde::Serialize;
use std::fmt;

use crate::error::{ProxyError, Result};

/// Upstream host and port
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Target {
    pub host: String,
    pub port: String,
}

impl Target {
    /// Full dialable address, `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-backend counters. Owned by the scheduler; callers only ever see
/// snapshot copies.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStats {
    pub live: bool,
    pub total_connections: u64,
    pub active_connections: u64,
    pub refused_connections: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Bytes per second over the last completed stats tick
    pub rx_second: u64,
    pub tx_second: u64,
}

impl Default for BackendStats {
    fn default() -> Self {
        Self {
            live: true,
            total_connections: 0,
            active_connections: 0,
            refused_connections: 0,
            rx_bytes: 0,
            tx_bytes: 0,
            rx_second: 0,
            tx_second: 0,
        }
    }
}

/// An upstream server with its routing metadata and counters
#[derive(Debug, Clone, Serialize)]
pub struct Backend {
    pub target: Target,
    pub priority: u32,
    pub weight: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    pub stats: BackendStats,
}

impl Backend {
    pub fn address(&self) -> String {
        self.target.address()
    }

    /// Backend identity is target identity
    pub fn same_target(&self, other: &Backend) -> bool {
        self.target == other.target
    }

    /// Take over routing metadata from a freshly parsed backend while
    /// keeping accumulated stats.
    pub fn merge_from(&mut self, other: &Backend) {
        self.priority = other.priority;
        self.weight = other.weight;
        self.sni = other.sni.clone();
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} weight={} priority={}",
            self.target, self.weight, self.priority
        )?;
        if let Some(sni) = &self.sni {
            write!(f, " sni={sni}")?;
        }
        Ok(())
    }
}

/// Parse one upstream entry: `HOST:PORT [weight=N] [priority=N] [sni=NAME]`.
///
/// Optional tokens appear in that fixed order. Missing weight and priority
/// default to 1.
pub fn parse_backend(line: &str) -> Result<Backend> {
    let err = || ProxyError::Parse(line.to_string());

    let mut tokens = line.split_whitespace();
    let addr = tokens.next().ok_or_else(err)?;
    let (host, port) = addr.rsplit_once(':').ok_or_else(err)?;
    if host.is_empty() || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(err());
    }

    let mut weight: u32 = 1;
    let mut priority: u32 = 1;
    let mut sni: Option<String> = None;

    // each optional key may appear at most once, in declaration order
    let mut stage = 0;
    for token in tokens {
        if stage < 1 {
            if let Some(v) = token.strip_prefix("weight=") {
                weight = v.parse().map_err(|_| err())?;
                stage = 1;
                continue;
            }
        }
        if stage < 2 {
            if let Some(v) = token.strip_prefix("priority=") {
                priority = v.parse().map_err(|_| err())?;
                stage = 2;
                continue;
            }
        }
        if stage < 3 {
            if let Some(v) = token.strip_prefix("sni=") {
                if v.is_empty() {
                    return Err(err());
                }
                sni = Some(v.to_string());
                stage = 3;
                continue;
            }
        }
        return Err(err());
    }

    if weight == 0 || priority == 0 {
        return Err(err());
    }

    Ok(Backend {
        target: Target { host: host.to_string(), port: port.to_string() },
        priority,
        weight,
        sni,
        stats: BackendStats::default(),
    })
}

/// Byte counts observed by one copy direction since the previous tick
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadWriteCount {
    pub read: u64,
    pub written: u64,
}

impl ReadWriteCount {
    pub fn is_zero(&self) -> bool {
        self.read == 0 && self.written == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_address() {
        let b = parse_backend("10.0.0.1:8080").unwrap();
        assert_eq!(b.target.host, "10.0.0.1");
        assert_eq!(b.target.port, "8080");
        assert_eq!(b.weight, 1);
        assert_eq!(b.priority, 1);
        assert!(b.sni.is_none());
        assert!(b.stats.live);
    }

    #[test]
    fn parses_all_tokens() {
        let b = parse_backend("backend.internal:443 weight=3 priority=2 sni=a.example").unwrap();
        assert_eq!(b.weight, 3);
        assert_eq!(b.priority, 2);
        assert_eq!(b.sni.as_deref(), Some("a.example"));
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let b = parse_backend("  10.0.0.1:80 weight=2  ").unwrap();
        assert_eq!(b.weight, 2);
    }

    #[test]
    fn rejects_out_of_order_tokens() {
        assert!(parse_backend("10.0.0.1:80 priority=2 weight=3").is_err());
    }

    #[test]
    fn rejects_malformed_lines() {
        for line in ["", "nohost", "host:", ":80", "10.0.0.1:80 weight=x", "10.0.0.1:abc"] {
            assert!(parse_backend(line).is_err(), "accepted {line:?}");
        }
    }

    #[test]
    fn rejects_zero_weight() {
        assert!(parse_backend("10.0.0.1:80 weight=0").is_err());
    }

    #[test]
    fn display_round_trips() {
        for line in [
            "10.0.0.1:8080",
            "10.0.0.1:8080 weight=5",
            "b.example:443 weight=2 priority=3 sni=b.example",
        ] {
            let parsed = parse_backend(line).unwrap();
            let reparsed = parse_backend(&parsed.to_string()).unwrap();
            assert_eq!(parsed.target, reparsed.target);
            assert_eq!(parsed.weight, reparsed.weight);
            assert_eq!(parsed.priority, reparsed.priority);
            assert_eq!(parsed.sni, reparsed.sni);
        }
    }

    #[test]
    fn ipv6_host_keeps_last_colon_as_port_separator() {
        let b = parse_backend("::1:9000").unwrap();
        assert_eq!(b.target.host, "::1");
        assert_eq!(b.target.port, "9000");
    }
}
