use thiserror::Error;

/// Errors that can occur in the balancer
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot parse upstream entry: {0}")]
    Parse(String),

    #[error("No backend available")]
    NoBackend,

    #[error("Backend dial failed: {0}")]
    Dial(String),

    #[error("Rejected by filter: {0}")]
    FilterDeny(String),

    #[error("Short write to peer")]
    ShortWrite,

    #[error("SNI sniff failed: {0}")]
    Sniff(String),

    #[error("Listener error: {0}")]
    Listener(String),

    #[error("No private key found in key file")]
    NoPrivateKey,
}

pub type Result<T> = std::result::Result<T, ProxyError>;
