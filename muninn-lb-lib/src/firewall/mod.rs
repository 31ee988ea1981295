//! Process-wide address reputation store.
//!
//! Maps an address string to an allow/deny verdict with a TTL. Entries are
//! written through to a TSV file so reputation survives restarts. Absence
//! or expiry means allow.

use ahash::AHashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

pub const FIREWALL_FILE: &str = "firewall.tsv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

impl Verdict {
    fn as_str(self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Verdict::Allow),
            "deny" => Some(Verdict::Deny),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    verdict: Verdict,
    /// Absolute expiry, seconds since the unix epoch
    deadline: u64,
}

impl Entry {
    fn expired(&self, now: u64) -> bool {
        self.deadline <= now
    }
}

pub struct Firewall {
    entries: RwLock<AHashMap<String, Entry>>,
    path: PathBuf,
}

impl Firewall {
    /// Open the store backed by `path`, loading any persisted unexpired
    /// entries. A missing or unreadable file starts the store empty.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut entries = AHashMap::new();
        let now = now_unix();
        if let Ok(data) = std::fs::read_to_string(&path) {
            for line in data.lines() {
                let mut fields = line.split('\t');
                let (Some(addr), Some(value), Some(deadline)) =
                    (fields.next(), fields.next(), fields.next())
                else {
                    continue;
                };
                let (Some(verdict), Ok(deadline)) = (Verdict::parse(value), deadline.parse())
                else {
                    continue;
                };
                let entry = Entry { verdict, deadline };
                if !entry.expired(now) {
                    entries.insert(addr.to_string(), entry);
                }
            }
        }
        Self { entries: RwLock::new(entries), path }
    }

    pub fn set_allow(&self, addr: &str, ttl_secs: u64) {
        self.set(addr, Verdict::Allow, ttl_secs);
    }

    pub fn set_deny(&self, addr: &str, ttl_secs: u64) {
        self.set(addr, Verdict::Deny, ttl_secs);
    }

    /// Remove the entry only if its current value is allow.
    pub fn clear_allow(&self, addr: &str) {
        self.clear(addr, Verdict::Allow);
    }

    /// Remove the entry only if its current value is deny.
    pub fn clear_deny(&self, addr: &str) {
        self.clear(addr, Verdict::Deny);
    }

    /// Returns false iff an unexpired deny entry exists for `addr`.
    pub fn allows(&self, addr: &str) -> bool {
        let now = now_unix();
        let verdict = {
            let entries = self.entries.read().expect("firewall lock poisoned");
            match entries.get(addr) {
                Some(e) if !e.expired(now) => Some(e.verdict),
                Some(_) => None,
                None => return true,
            }
        };
        match verdict {
            Some(Verdict::Deny) => false,
            Some(Verdict::Allow) => true,
            None => {
                // lazy eviction of the expired entry
                let mut entries = self.entries.write().expect("firewall lock poisoned");
                if entries.get(addr).is_some_and(|e| e.expired(now_unix())) {
                    entries.remove(addr);
                }
                true
            }
        }
    }

    /// Extract the host portion of the peer address and consult [`allows`].
    ///
    /// [`allows`]: Firewall::allows
    pub fn allows_client(&self, peer: &SocketAddr) -> bool {
        self.allows(&peer.ip().to_string())
    }

    fn set(&self, addr: &str, verdict: Verdict, ttl_secs: u64) {
        let deadline = now_unix().saturating_add(ttl_secs);
        let mut entries = self.entries.write().expect("firewall lock poisoned");
        entries.insert(addr.to_string(), Entry { verdict, deadline });
        self.persist(&mut entries);
    }

    fn clear(&self, addr: &str, expected: Verdict) {
        let mut entries = self.entries.write().expect("firewall lock poisoned");
        if entries.get(addr).is_some_and(|e| e.verdict == expected) {
            entries.remove(addr);
            self.persist(&mut entries);
        }
    }

    /// Rewrite the backing file; expired entries are pruned on each write
    /// cycle. Caller holds the write lock.
    fn persist(&self, entries: &mut AHashMap<String, Entry>) {
        let now = now_unix();
        entries.retain(|_, e| !e.expired(now));
        let mut out = String::new();
        for (addr, e) in entries.iter() {
            out.push_str(addr);
            out.push('\t');
            out.push_str(e.verdict.as_str());
            out.push('\t');
            out.push_str(&e.deadline.to_string());
            out.push('\n');
        }
        if let Err(e) = std::fs::write(&self.path, out) {
            warn!(path = %self.path.display(), error = %e, "failed to persist firewall state");
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
