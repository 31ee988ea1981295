#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod error;
pub mod filter;
pub mod firewall;
pub mod geo;
pub mod healthcheck;
pub mod load_balancing;
pub mod manager;
pub mod scheduler;
pub mod sni;
pub mod tcp;
pub mod tls;
pub mod udp;
pub mod upstream;

pub use config::{load_from_path, Config, ServerConfig};
pub use error::{ProxyError, Result};
pub use firewall::Firewall;
pub use geo::GeoDb;
pub use load_balancing::{Balancer, ElectContext, RoundRobin};
pub use manager::Manager;
pub use scheduler::Scheduler;
pub use upstream::{parse_backend, Backend, Target};
