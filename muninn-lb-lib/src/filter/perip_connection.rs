use ahash::AHashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

use crate::config::ServerConfig;
use crate::error::{ProxyError, Result};

/// Rejects connects once a single source IP holds the configured number of
/// active connections.
pub struct PerIpConnectionFilter {
    max: u64,
    clients: Mutex<AHashMap<IpAddr, u64>>,
}

impl PerIpConnectionFilter {
    pub fn from_config(cfg: &ServerConfig) -> Option<Self> {
        let max = cfg.perip_connections.filter(|m| *m > 0)?;
        Some(Self { max, clients: Mutex::new(AHashMap::new()) })
    }

    pub fn on_connect(&self, peer: SocketAddr) -> Result<()> {
        let ip = peer.ip();
        let mut clients = self.clients.lock().expect("filter lock poisoned");
        let count = clients.entry(ip).or_insert(0);
        if *count >= self.max {
            return Err(ProxyError::FilterDeny(format!(
                "per ip connections {ip}, limit {}",
                self.max
            )));
        }
        *count += 1;
        Ok(())
    }

    pub fn on_disconnect(&self, peer: SocketAddr) {
        let ip = peer.ip();
        let mut clients = self.clients.lock().expect("filter lock poisoned");
        if let Some(count) = clients.get_mut(&ip) {
            if *count > 1 {
                *count -= 1;
            } else {
                clients.remove(&ip);
            }
        }
    }
}
