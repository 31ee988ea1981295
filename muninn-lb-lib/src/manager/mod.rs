//! Listener lifecycle. The manager owns the name-keyed listener set;
//! creation validates the configuration, merges defaults, and only inserts
//! a listener that actually started.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::config::{
    parse_duration, Config, ConnectionOptions, Protocol, ServerConfig,
};
use crate::error::{ProxyError, Result};
use crate::firewall::Firewall;
use crate::geo::GeoDb;
use crate::scheduler::Scheduler;
use crate::tcp::TcpServer;
use crate::udp::UdpServer;

pub enum Listener {
    Tcp(TcpServer),
    Udp(UdpServer),
}

impl Listener {
    pub fn cfg(&self) -> &ServerConfig {
        match self {
            Listener::Tcp(s) => s.cfg(),
            Listener::Udp(s) => s.cfg(),
        }
    }

    async fn start(&mut self) -> Result<()> {
        match self {
            Listener::Tcp(s) => s.start().await,
            Listener::Udp(s) => s.start().await,
        }
    }

    fn stop(&mut self) {
        match self {
            Listener::Tcp(s) => s.stop(),
            Listener::Udp(s) => s.stop(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(s) => s.local_addr(),
            Listener::Udp(s) => s.local_addr(),
        }
    }

    pub fn scheduler(&self) -> Option<Scheduler> {
        match self {
            Listener::Tcp(s) => s.scheduler(),
            Listener::Udp(s) => s.scheduler(),
        }
    }
}

pub struct Manager {
    defaults: ConnectionOptions,
    firewall: Arc<Firewall>,
    geo: Option<Arc<GeoDb>>,
    servers: Mutex<BTreeMap<String, Listener>>,
}

impl Manager {
    pub fn new(
        defaults: ConnectionOptions,
        firewall: Arc<Firewall>,
        geo: Option<Arc<GeoDb>>,
    ) -> Self {
        Self {
            defaults,
            firewall,
            geo,
            servers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create and start every listener of the loaded configuration.
    pub async fn initialize(&self, servers: BTreeMap<String, ServerConfig>) -> Result<()> {
        info!("initializing listeners");
        for (name, cfg) in servers {
            self.create(&name, cfg).await?;
        }
        info!("initialized");
        Ok(())
    }

    /// Validate, construct, start, insert. A listener that fails to start
    /// leaves no entry behind.
    pub async fn create(&self, name: &str, cfg: ServerConfig) -> Result<()> {
        let mut servers = self.servers.lock().await;
        if servers.contains_key(name) {
            return Err(ProxyError::Config(format!(
                "server with this name already exists: {name}"
            )));
        }

        let cfg = prepare_config(name, cfg, &self.defaults)?;
        let mut listener = match cfg.protocol {
            Protocol::Tcp | Protocol::Tls => Listener::Tcp(TcpServer::new(
                name.to_string(),
                cfg,
                Arc::clone(&self.firewall),
                self.geo.clone(),
            )),
            Protocol::Udp => Listener::Udp(UdpServer::new(
                name.to_string(),
                cfg,
                Arc::clone(&self.firewall),
            )),
        };
        listener.start().await?;
        servers.insert(name.to_string(), listener);
        Ok(())
    }

    /// Stop a listener and drop it.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let mut servers = self.servers.lock().await;
        let mut listener = servers
            .remove(name)
            .ok_or_else(|| ProxyError::Config(format!("server not found: {name}")))?;
        listener.stop();
        Ok(())
    }

    /// Snapshot of live listener configurations
    pub async fn list(&self) -> BTreeMap<String, ServerConfig> {
        let servers = self.servers.lock().await;
        servers
            .iter()
            .map(|(name, listener)| (name.clone(), listener.cfg().clone()))
            .collect()
    }

    /// Serialize the original configuration with the live `servers` overlay.
    pub async fn dump(&self, original: &Config, format: &str) -> Result<String> {
        let mut cfg = original.clone();
        cfg.servers = self.list().await;
        match format {
            "toml" => toml::to_string_pretty(&cfg)
                .map_err(|e| ProxyError::Config(format!("cannot encode config: {e}"))),
            "json" => serde_json::to_string_pretty(&cfg)
                .map_err(|e| ProxyError::Config(format!("cannot encode config: {e}"))),
            other => Err(ProxyError::Config(format!("unsupported format: {other}"))),
        }
    }

    pub async fn stop_all(&self) {
        let mut servers = self.servers.lock().await;
        for (_, listener) in servers.iter_mut() {
            listener.stop();
        }
        servers.clear();
    }

    /// Bound address of a running listener (binding port 0 is common in
    /// tests)
    pub async fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.servers.lock().await.get(name).and_then(Listener::local_addr)
    }

    /// Scheduler handle of a running listener
    pub async fn scheduler(&self, name: &str) -> Option<Scheduler> {
        self.servers.lock().await.get(name).and_then(Listener::scheduler)
    }
}

/// Merge defaults and validate one listener configuration.
pub fn prepare_config(
    name: &str,
    mut server: ServerConfig,
    defaults: &ConnectionOptions,
) -> Result<ServerConfig> {
    if server.bind.is_empty() {
        return Err(ProxyError::Config(format!("server {name}: no bind specified")));
    }

    if server.protocol == Protocol::Tls && server.tls.is_none() {
        return Err(ProxyError::Config(format!(
            "server {name}: need tls section for tls protocol"
        )));
    }

    if let Some(hc) = &server.healthcheck {
        if hc.kind != "ping" {
            return Err(ProxyError::Config(format!(
                "server {name}: unsupported healthcheck kind {:?}",
                hc.kind
            )));
        }
    }

    if let Some(sni) = &server.sni {
        parse_duration(&sni.read_timeout).map_err(|_| {
            ProxyError::Config(format!(
                "server {name}: invalid sni read_timeout {:?}",
                sni.read_timeout
            ))
        })?;
    }

    // listener fields win over defaults
    let options = &mut server.options;
    if options.max_connections.is_none() {
        options.max_connections = defaults.max_connections;
    }
    if options.client_idle_timeout.is_none() {
        options.client_idle_timeout = defaults.client_idle_timeout.clone();
    }
    if options.backend_idle_timeout.is_none() {
        options.backend_idle_timeout = defaults.backend_idle_timeout.clone();
    }
    if options.backend_connection_timeout.is_none() {
        options.backend_connection_timeout = defaults.backend_connection_timeout.clone();
    }

    for (field, value) in [
        ("client_idle_timeout", &options.client_idle_timeout),
        ("backend_idle_timeout", &options.backend_idle_timeout),
        ("backend_connection_timeout", &options.backend_connection_timeout),
    ] {
        if let Some(value) = value {
            parse_duration(value).map_err(|_| {
                ProxyError::Config(format!("server {name}: invalid {field} {value:?}"))
            })?;
        }
    }

    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Balance, SniConfig, TlsServerConfig};

    #[test]
    fn rejects_empty_bind() {
        let err = prepare_config("web", ServerConfig::default(), &ConnectionOptions::default())
            .unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn tls_protocol_requires_tls_section() {
        let cfg = ServerConfig {
            bind: "127.0.0.1:0".into(),
            protocol: Protocol::Tls,
            ..Default::default()
        };
        assert!(prepare_config("web", cfg, &ConnectionOptions::default()).is_err());

        let cfg = ServerConfig {
            bind: "127.0.0.1:0".into(),
            protocol: Protocol::Tls,
            tls: Some(TlsServerConfig {
                cert_path: "cert.pem".into(),
                key_path: "key.pem".into(),
            }),
            ..Default::default()
        };
        assert!(prepare_config("web", cfg, &ConnectionOptions::default()).is_ok());
    }

    #[test]
    fn defaults_merge_without_clobbering() {
        let defaults = ConnectionOptions {
            max_connections: Some(100),
            client_idle_timeout: Some("30s".into()),
            backend_idle_timeout: Some("40s".into()),
            backend_connection_timeout: Some("5s".into()),
            china_ipdb_path: None,
        };
        let cfg = ServerConfig {
            bind: "127.0.0.1:0".into(),
            options: ConnectionOptions {
                client_idle_timeout: Some("1s".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let merged = prepare_config("web", cfg, &defaults).unwrap();
        assert_eq!(merged.options.client_idle_timeout.as_deref(), Some("1s"));
        assert_eq!(merged.options.backend_idle_timeout.as_deref(), Some("40s"));
        assert_eq!(merged.options.max_connections, Some(100));
    }

    #[test]
    fn invalid_timeout_is_config_error() {
        let cfg = ServerConfig {
            bind: "127.0.0.1:0".into(),
            options: ConnectionOptions {
                client_idle_timeout: Some("soon".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(prepare_config("web", cfg, &ConnectionOptions::default()).is_err());
    }

    #[test]
    fn sni_defaults_come_from_serde() {
        let cfg: ServerConfig = toml::from_str(
            r#"
bind = "127.0.0.1:0"
balance = "iphash"
upstream = []

[sni]
"#,
        )
        .unwrap();
        let merged = prepare_config("web", cfg, &ConnectionOptions::default()).unwrap();
        let sni = merged.sni.unwrap();
        assert_eq!(sni.read_timeout, "2s");
        assert_eq!(sni, SniConfig { read_timeout: "2s".into(), ..Default::default() });
        assert_eq!(merged.balance, Balance::Iphash);
    }
}
