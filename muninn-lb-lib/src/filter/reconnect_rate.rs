use ahash::AHashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::{parse_duration_or, ServerConfig};
use crate::error::{ProxyError, Result};

/// Counts disconnects per source IP inside a sliding window; a connect is
/// rejected once the count exceeds the configured threshold. The window is
/// reset wholesale by a periodic tick.
pub struct ReconnectRateFilter {
    reconnects: u64,
    window: Duration,
    clients: Arc<Mutex<AHashMap<IpAddr, u64>>>,
    tick: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectRateFilter {
    pub fn from_config(cfg: &ServerConfig) -> Option<Self> {
        let rate = cfg.limit_reconnect_rate.as_ref()?;
        let mut window = parse_duration_or(Some(&rate.interval), Duration::from_secs(2));
        if window.is_zero() {
            window = Duration::from_secs(2);
        }
        Some(Self {
            reconnects: rate.reconnects,
            window,
            clients: Arc::new(Mutex::new(AHashMap::new())),
            tick: Mutex::new(None),
        })
    }

    pub fn start(&self) {
        let clients = Arc::clone(&self.clients);
        let window = self.window;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(window);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                clients.lock().expect("filter lock poisoned").clear();
            }
        });
        *self.tick.lock().expect("filter lock poisoned") = Some(handle);
    }

    pub fn on_connect(&self, peer: SocketAddr) -> Result<()> {
        let clients = self.clients.lock().expect("filter lock poisoned");
        if clients.get(&peer.ip()).copied().unwrap_or(0) > self.reconnects {
            return Err(ProxyError::FilterDeny(format!(
                "reconnect rate for {}, limit {}",
                peer.ip(),
                self.reconnects
            )));
        }
        Ok(())
    }

    pub fn on_disconnect(&self, peer: SocketAddr) {
        *self
            .clients
            .lock()
            .expect("filter lock poisoned")
            .entry(peer.ip())
            .or_insert(0) += 1;
    }

    pub fn stop(&self) {
        if let Some(handle) = self.tick.lock().expect("filter lock poisoned").take() {
            handle.abort();
        }
    }
}
