use ahash::AHashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::warn;

use crate::config::{parse_duration_or, ServerConfig};
use crate::filter::DENY_TTL_SECS;
use crate::firewall::Firewall;
use crate::upstream::ReadWriteCount;

/// Accumulates per-IP relay bytes inside a window; an IP that exceeds the
/// configured read or write budget is pushed to the firewall as deny.
pub struct PerIpRateFilter {
    read_bytes: u64,
    write_bytes: u64,
    window: Duration,
    clients: Arc<Mutex<AHashMap<IpAddr, ReadWriteCount>>>,
    firewall: Arc<Firewall>,
    tick: Mutex<Option<JoinHandle<()>>>,
}

impl PerIpRateFilter {
    pub fn from_config(cfg: &ServerConfig, firewall: Arc<Firewall>) -> Option<Self> {
        let rate = cfg.limit_perip_rate.as_ref()?;
        let mut window = parse_duration_or(Some(&rate.interval), Duration::from_secs(2));
        if window.is_zero() {
            window = Duration::from_secs(2);
        }
        Some(Self {
            read_bytes: rate.read_bytes,
            write_bytes: rate.write_bytes,
            window,
            clients: Arc::new(Mutex::new(AHashMap::new())),
            firewall,
            tick: Mutex::new(None),
        })
    }

    pub fn start(&self) {
        let clients = Arc::clone(&self.clients);
        let window = self.window;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(window);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                clients.lock().expect("filter lock poisoned").clear();
            }
        });
        *self.tick.lock().expect("filter lock poisoned") = Some(handle);
    }

    pub fn on_read(&self, peer: SocketAddr, rwc: ReadWriteCount) {
        let ip = peer.ip();
        let mut clients = self.clients.lock().expect("filter lock poisoned");
        let acc = clients.entry(ip).or_default();
        acc.read += rwc.read;
        if self.read_bytes != 0 && acc.read > self.read_bytes {
            warn!(%ip, limit = self.read_bytes, "per-ip read rate exceeded, denying");
            self.firewall.set_deny(&ip.to_string(), DENY_TTL_SECS);
        }
    }

    pub fn on_write(&self, peer: SocketAddr, rwc: ReadWriteCount) {
        let ip = peer.ip();
        let mut clients = self.clients.lock().expect("filter lock poisoned");
        let acc = clients.entry(ip).or_default();
        acc.written += rwc.written;
        if self.write_bytes != 0 && acc.written > self.write_bytes {
            warn!(%ip, limit = self.write_bytes, "per-ip write rate exceeded, denying");
            self.firewall.set_deny(&ip.to_string(), DENY_TTL_SECS);
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self.tick.lock().expect("filter lock poisoned").take() {
            handle.abort();
        }
    }
}
