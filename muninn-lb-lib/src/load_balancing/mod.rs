//! Backend election. A balancer is a pure selection over a snapshot of live
//! backends; the round-robin cursor is the only piece of state and it is
//! owned by the scheduler that drives the balancer.

use ahash::AHashMap;
use rand::Rng;
use regex::Regex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

use crate::config::{Balance, MatchingStrategy, SniConfig, UnexpectedHostnameStrategy};
use crate::error::{ProxyError, Result};
use crate::upstream::Backend;

/// Request context handed to an election
#[derive(Debug, Clone)]
pub struct ElectContext {
    pub client: SocketAddr,
    /// Sniffed SNI hostname, when the listener sniffs one
    pub hostname: Option<String>,
}

impl ElectContext {
    pub fn new(client: SocketAddr) -> Self {
        Self { client, hostname: None }
    }

    pub fn with_hostname(client: SocketAddr, hostname: Option<String>) -> Self {
        Self { client, hostname }
    }
}

/// Listener-scoped rotating cursor
#[derive(Debug, Default)]
pub struct RoundRobin {
    index: AtomicUsize,
}

impl RoundRobin {
    /// Advance the cursor and return the slot it covered, wrapping at `len`
    pub fn next(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let cursor = self.index.fetch_add(1, Ordering::Relaxed);
        cursor % len
    }
}

pub struct Balancer {
    strategy: Balance,
    sni: Option<SniConfig>,
    rr: RoundRobin,
    // compiled backend sni patterns, keyed by pattern source
    regex_cache: AHashMap<String, Option<Regex>>,
}

impl Balancer {
    pub fn new(strategy: Balance, sni: Option<SniConfig>) -> Self {
        Self { strategy, sni, rr: RoundRobin::default(), regex_cache: AHashMap::new() }
    }

    /// Elect one backend for the given context, or `NoBackend` when the
    /// eligible set is empty.
    pub fn elect(&mut self, ctx: &ElectContext, backends: &[Backend]) -> Result<Backend> {
        let live: Vec<&Backend> = backends.iter().filter(|b| b.stats.live).collect();
        if live.is_empty() {
            return Err(ProxyError::NoBackend);
        }

        let restriction = match (&self.sni, ctx.hostname.as_deref()) {
            (Some(sni_cfg), Some(hostname)) if !hostname.is_empty() => Some((
                sni_cfg.hostname_matching_strategy,
                sni_cfg.unexpected_hostname_strategy,
                hostname,
            )),
            _ => None,
        };

        let pool: Vec<&Backend> = match restriction {
            Some((strategy, unexpected, hostname)) => {
                let cache = &mut self.regex_cache;
                let matched: Vec<&Backend> = live
                    .iter()
                    .copied()
                    .filter(|b| {
                        b.sni
                            .as_deref()
                            .is_some_and(|p| hostname_matches(cache, p, hostname, strategy))
                    })
                    .collect();
                if matched.is_empty() {
                    match unexpected {
                        UnexpectedHostnameStrategy::Default => live,
                        UnexpectedHostnameStrategy::Reject => return Err(ProxyError::NoBackend),
                        UnexpectedHostnameStrategy::Any => {
                            let idx = rand::rng().random_range(0..live.len());
                            return Ok(live[idx].clone());
                        }
                    }
                } else {
                    matched
                }
            }
            None => live,
        };

        let chosen = match self.strategy {
            Balance::Weight => {
                let sum: u64 = pool.iter().map(|b| u64::from(b.weight)).sum();
                let draw = rand::rng().random_range(0..sum);
                let mut acc = 0u64;
                pool.iter()
                    .find(|b| {
                        acc += u64::from(b.weight);
                        draw < acc
                    })
                    .copied()
                    .unwrap_or(pool[0])
            }
            Balance::Roundrobin => pool[self.rr.next(pool.len())],
            Balance::Leastconn => pool
                .iter()
                .copied()
                .min_by_key(|b| b.stats.active_connections)
                .unwrap_or(pool[0]),
            Balance::Leastbandwidth => pool
                .iter()
                .copied()
                .min_by_key(|b| b.stats.rx_second + b.stats.tx_second)
                .unwrap_or(pool[0]),
            Balance::Iphash => {
                let hash = fnv1a_32(ctx.client.ip().to_string().as_bytes());
                pool[hash as usize % pool.len()]
            }
        };

        Ok(chosen.clone())
    }
}

fn hostname_matches(
    cache: &mut AHashMap<String, Option<Regex>>,
    pattern: &str,
    hostname: &str,
    strategy: MatchingStrategy,
) -> bool {
    match strategy {
        MatchingStrategy::Exact => pattern == hostname,
        MatchingStrategy::Regexp => {
            let compiled = cache
                .entry(pattern.to_string())
                .or_insert_with(|| match Regex::new(pattern) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(pattern, error = %e, "invalid backend sni pattern");
                        None
                    }
                });
            compiled.as_ref().is_some_and(|re| re.is_match(hostname))
        }
    }
}

/// FNV-1a, 32 bit
fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
