use ahash::AHashSet;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::config::ServerConfig;
use crate::error::{ProxyError, Result};

/// Rejects connects once the listener-wide active count reaches the
/// configured maximum.
pub struct MaxConnectionFilter {
    max: u64,
    clients: Mutex<AHashSet<SocketAddr>>,
}

impl MaxConnectionFilter {
    pub fn from_config(cfg: &ServerConfig) -> Option<Self> {
        let max = cfg.options.max_connections.filter(|m| *m > 0)?;
        Some(Self { max, clients: Mutex::new(AHashSet::new()) })
    }

    pub fn on_connect(&self, peer: SocketAddr) -> Result<()> {
        let mut clients = self.clients.lock().expect("filter lock poisoned");
        if clients.len() as u64 >= self.max {
            return Err(ProxyError::FilterDeny(format!(
                "too many connections, more than {}",
                self.max
            )));
        }
        clients.insert(peer);
        Ok(())
    }

    pub fn on_disconnect(&self, peer: SocketAddr) {
        self.clients.lock().expect("filter lock poisoned").remove(&peer);
    }
}
