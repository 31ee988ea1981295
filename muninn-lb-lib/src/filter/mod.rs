//! Admission and observation filters. The built-in set is closed, so
//! dispatch is a tagged enum; every hook a filter does not care about is a
//! no-op arm.

pub mod china_access;
pub mod max_connection;
pub mod perip_connection;
pub mod perip_rate;
pub mod reconnect_rate;
pub mod request_content;

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

pub use china_access::ChinaAccessFilter;
pub use max_connection::MaxConnectionFilter;
pub use perip_connection::PerIpConnectionFilter;
pub use perip_rate::PerIpRateFilter;
pub use reconnect_rate::ReconnectRateFilter;
pub use request_content::RequestContentFilter;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::firewall::Firewall;
use crate::geo::GeoDb;
use crate::upstream::ReadWriteCount;

/// How long a connect-time deny keeps the source address in the firewall
pub const DENY_TTL_SECS: u64 = 3600;

pub enum Filter {
    MaxConnection(MaxConnectionFilter),
    PerIpConnection(PerIpConnectionFilter),
    ReconnectRate(ReconnectRateFilter),
    PerIpRate(PerIpRateFilter),
    ChinaAccess(ChinaAccessFilter),
    RequestContent(RequestContentFilter),
}

impl Filter {
    fn name(&self) -> &'static str {
        match self {
            Filter::MaxConnection(_) => "limit_max_connection",
            Filter::PerIpConnection(_) => "limit_perip_connection",
            Filter::ReconnectRate(_) => "limit_reconnect_rate",
            Filter::PerIpRate(_) => "limit_perip_rate",
            Filter::ChinaAccess(_) => "limit_china_access",
            Filter::RequestContent(_) => "filter_request_content",
        }
    }

    fn start(&self) {
        match self {
            Filter::ReconnectRate(f) => f.start(),
            Filter::PerIpRate(f) => f.start(),
            _ => {}
        }
    }

    fn on_connect(&self, peer: SocketAddr) -> Result<()> {
        match self {
            Filter::MaxConnection(f) => f.on_connect(peer),
            Filter::PerIpConnection(f) => f.on_connect(peer),
            Filter::ReconnectRate(f) => f.on_connect(peer),
            Filter::ChinaAccess(f) => f.on_connect(peer),
            _ => Ok(()),
        }
    }

    fn on_disconnect(&self, peer: SocketAddr) {
        match self {
            Filter::MaxConnection(f) => f.on_disconnect(peer),
            Filter::PerIpConnection(f) => f.on_disconnect(peer),
            Filter::ReconnectRate(f) => f.on_disconnect(peer),
            _ => {}
        }
    }

    fn on_request(&self, chunk: &[u8]) -> Result<()> {
        match self {
            Filter::RequestContent(f) => f.on_request(chunk),
            _ => Ok(()),
        }
    }

    fn on_read(&self, peer: SocketAddr, rwc: ReadWriteCount) {
        if let Filter::PerIpRate(f) = self {
            f.on_read(peer, rwc);
        }
    }

    fn on_write(&self, peer: SocketAddr, rwc: ReadWriteCount) {
        if let Filter::PerIpRate(f) = self {
            f.on_write(peer, rwc);
        }
    }

    fn stop(&self) {
        match self {
            Filter::ReconnectRate(f) => f.stop(),
            Filter::PerIpRate(f) => f.stop(),
            _ => {}
        }
    }
}

/// Ordered set of enrolled filters for one listener.
pub struct FilterChain {
    filters: Vec<Filter>,
    firewall: Arc<Firewall>,
}

impl FilterChain {
    /// Enroll every filter whose configuration is present, in the fixed
    /// chain order.
    pub fn from_config(
        cfg: &ServerConfig,
        firewall: Arc<Firewall>,
        geo: Option<Arc<GeoDb>>,
    ) -> Self {
        let mut filters = Vec::new();
        if let Some(f) = MaxConnectionFilter::from_config(cfg) {
            filters.push(Filter::MaxConnection(f));
        }
        if let Some(f) = PerIpConnectionFilter::from_config(cfg) {
            filters.push(Filter::PerIpConnection(f));
        }
        if let Some(f) = ReconnectRateFilter::from_config(cfg) {
            filters.push(Filter::ReconnectRate(f));
        }
        if let Some(f) = PerIpRateFilter::from_config(cfg, Arc::clone(&firewall)) {
            filters.push(Filter::PerIpRate(f));
        }
        if let Some(f) = ChinaAccessFilter::from_config(cfg, geo) {
            filters.push(Filter::ChinaAccess(f));
        }
        if let Some(f) = RequestContentFilter::from_config(cfg) {
            filters.push(Filter::RequestContent(f));
        }
        for filter in &filters {
            debug!(filter = filter.name(), "filter enrolled");
        }
        Self { filters, firewall }
    }

    pub fn start(&self) {
        for filter in &self.filters {
            filter.start();
        }
    }

    /// Run connect hooks in order. The first deny stops the chain, rolls
    /// back the filters that already admitted the client, and records the
    /// source in the firewall.
    pub fn on_connect(&self, peer: SocketAddr) -> Result<()> {
        for (idx, filter) in self.filters.iter().enumerate() {
            if let Err(e) = filter.on_connect(peer) {
                for admitted in &self.filters[..idx] {
                    admitted.on_disconnect(peer);
                }
                self.firewall.set_deny(&peer.ip().to_string(), DENY_TTL_SECS);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn on_disconnect(&self, peer: SocketAddr) {
        for filter in &self.filters {
            filter.on_disconnect(peer);
        }
    }

    /// Inspect one client-to-backend chunk before it is forwarded.
    pub fn on_request(&self, chunk: &[u8]) -> Result<()> {
        for filter in &self.filters {
            filter.on_request(chunk)?;
        }
        Ok(())
    }

    pub fn on_read(&self, peer: SocketAddr, rwc: ReadWriteCount) {
        for filter in &self.filters {
            filter.on_read(peer, rwc);
        }
    }

    pub fn on_write(&self, peer: SocketAddr, rwc: ReadWriteCount) {
        for filter in &self.filters {
            filter.on_write(peer, rwc);
        }
    }

    pub fn stop(&self) {
        for filter in &self.filters {
            filter.stop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
