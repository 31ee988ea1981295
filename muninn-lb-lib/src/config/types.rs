use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Listener protocol
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Tls,
    Udp,
}

/// Backend selection strategy
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Balance {
    /// Weighted random draw (default)
    #[default]
    Weight,
    /// Backend with the fewest active connections
    Leastconn,
    /// Listener-scoped rotating cursor
    Roundrobin,
    /// Backend with the lowest rx+tx rate
    Leastbandwidth,
    /// FNV-1a hash of the client IP, stable for a given live set
    Iphash,
}

/// How a sniffed SNI hostname is matched against backend `sni` fields
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchingStrategy {
    #[default]
    Exact,
    Regexp,
}

/// What to do when no backend matches the sniffed hostname
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnexpectedHostnameStrategy {
    /// Fall back to the unrestricted live set
    #[default]
    Default,
    /// Close the connection without dialing a backend
    Reject,
    /// Pick arbitrarily from the unrestricted live set
    Any,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    #[default]
    Allow,
    Deny,
}

/// Payload comparison mode for `filter_request_content` rules
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentMatchMode {
    /// Substring match over the raw chunk bytes
    #[default]
    Raw,
    /// Substring match over the hex-encoded chunk
    Hex,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    /// Can be overridden at runtime via RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "stdout", "stderr", or a file path
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), output: default_log_output() }
    }
}

/// Management API configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_api_bind")]
    pub bind: String,
    /// Permissive CORS (methods GET,POST,PUT,DELETE,OPTIONS; headers Origin,Authorization)
    #[serde(default)]
    pub cors: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ApiTlsConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BasicAuthConfig {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiTlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

/// Connection options; the `[defaults]` section carries the fallbacks that
/// are merged into each listener when its own fields are unset.
///
/// Durations are strings like "5s" or "500ms"; an empty string means no
/// timeout.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct ConnectionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_idle_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_idle_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_connection_timeout: Option<String>,
    /// Path to the China geolocation database (only read from `[defaults]`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub china_ipdb_path: Option<String>,
}

/// SNI sniffing and hostname routing options
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SniConfig {
    #[serde(default = "default_sni_read_timeout")]
    pub read_timeout: String,
    #[serde(default)]
    pub hostname_matching_strategy: MatchingStrategy,
    #[serde(default)]
    pub unexpected_hostname_strategy: UnexpectedHostnameStrategy,
}

impl Default for SniConfig {
    fn default() -> Self {
        Self {
            read_timeout: default_sni_read_timeout(),
            hostname_matching_strategy: MatchingStrategy::default(),
            unexpected_hostname_strategy: UnexpectedHostnameStrategy::default(),
        }
    }
}

/// TLS termination for `protocol = "tls"`
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TlsServerConfig {
    /// PEM certificate chain; must exist and be readable at startup
    pub cert_path: String,
    /// PEM private key; must exist and be readable at startup
    pub key_path: String,
}

/// TLS re-encryption towards backends
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct BackendsTlsConfig {
    /// PEM bundle of roots trusted for backend connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_ca_path: Option<String>,
    /// Server name presented to backends that carry no `sni` field of their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
}

/// Options for `protocol = "udp"`
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct UdpConfig {
    /// Session ends after this many client datagrams (0 = unlimited)
    #[serde(default)]
    pub max_requests: u64,
    /// Session ends after this many backend datagrams (0 = unlimited)
    #[serde(default)]
    pub max_responses: u64,
}

/// Periodic backend liveness probing
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HealthcheckConfig {
    #[serde(default = "default_healthcheck_kind")]
    pub kind: String,
    #[serde(default = "default_healthcheck_interval")]
    pub interval: String,
    #[serde(default = "default_healthcheck_timeout")]
    pub timeout: String,
    /// Consecutive successes before a dead backend goes live
    #[serde(default = "default_one")]
    pub passes: u32,
    /// Consecutive failures before a live backend goes dead
    #[serde(default = "default_one")]
    pub fails: u32,
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            kind: default_healthcheck_kind(),
            interval: default_healthcheck_interval(),
            timeout: default_healthcheck_timeout(),
            passes: default_one(),
            fails: default_one(),
        }
    }
}

/// `limit_reconnect_rate` filter block.
///
/// Counts disconnects per source IP inside a sliding window; a connect is
/// rejected once the count exceeds `reconnects`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ReconnectRateConfig {
    pub reconnects: u64,
    #[serde(default = "default_filter_interval")]
    pub interval: String,
}

/// `limit_perip_rate` filter block
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PeripRateConfig {
    /// Client-to-backend bytes allowed per window (0 = unlimited)
    #[serde(default)]
    pub read_bytes: u64,
    /// Backend-to-client bytes allowed per window (0 = unlimited)
    #[serde(default)]
    pub write_bytes: u64,
    #[serde(default = "default_filter_interval")]
    pub interval: String,
}

/// `limit_china_access` filter block
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct ChinaAccessConfig {
    #[serde(default)]
    pub default: Access,
    #[serde(default)]
    pub rules: Vec<ChinaAccessRule>,
}

/// Empty fields are wildcards; rule specificity is the number of non-empty
/// fields and the most specific matching rule wins.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ChinaAccessRule {
    #[serde(default)]
    pub area: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub isp: String,
    pub access: Access,
}

/// `filter_request_content` filter block
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct RequestContentConfig {
    #[serde(default)]
    pub default: Access,
    #[serde(default)]
    pub rules: Vec<RequestContentRule>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RequestContentRule {
    #[serde(default)]
    pub mode: ContentMatchMode,
    pub content: String,
    pub access: Access,
}

/// One `[servers.<name>]` section
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct ServerConfig {
    /// Address to listen on, e.g. "0.0.0.0:3000"
    #[serde(default)]
    pub bind: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub balance: Balance,
    #[serde(flatten)]
    pub options: ConnectionOptions,
    /// Per-source-IP connection cap (enables `limit_perip_connection`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perip_connections: Option<u64>,
    /// Upstream entries: `HOST:PORT [weight=N] [priority=N] [sni=NAME]`
    #[serde(default)]
    pub upstream: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<SniConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsServerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backends_tls: Option<BackendsTlsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_reconnect_rate: Option<ReconnectRateConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_perip_rate: Option<PeripRateConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_china_access: Option<ChinaAccessConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_request_content: Option<RequestContentConfig>,
}

/// Config file top-level object
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub defaults: ConnectionOptions,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

/// Listener timeouts resolved from merged configuration. Zero means no
/// timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timeouts {
    pub client_idle: std::time::Duration,
    pub backend_idle: std::time::Duration,
    pub backend_connect: std::time::Duration,
}

impl Timeouts {
    pub fn from_options(options: &ConnectionOptions) -> Self {
        use crate::config::duration::parse_duration_or;
        let zero = std::time::Duration::ZERO;
        Self {
            client_idle: parse_duration_or(options.client_idle_timeout.as_deref(), zero),
            backend_idle: parse_duration_or(options.backend_idle_timeout.as_deref(), zero),
            backend_connect: parse_duration_or(options.backend_connection_timeout.as_deref(), zero),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

fn default_api_bind() -> String {
    "0.0.0.0:8888".to_string()
}

fn default_sni_read_timeout() -> String {
    "2s".to_string()
}

fn default_healthcheck_kind() -> String {
    "ping".to_string()
}

fn default_healthcheck_interval() -> String {
    "10s".to_string()
}

fn default_healthcheck_timeout() -> String {
    "2s".to_string()
}

fn default_filter_interval() -> String {
    "2s".to_string()
}

fn default_one() -> u32 {
    1
}
