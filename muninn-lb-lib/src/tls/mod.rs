use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::sync::Arc;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::{BackendsTlsConfig, TlsServerConfig};
use crate::error::{ProxyError, Result};

/// Builds a TLS acceptor from listener configuration
pub fn build_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(format!("Failed to build TLS config: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(server)))
}

pub fn acceptor_from_config(cfg: &TlsServerConfig) -> Result<TlsAcceptor> {
    build_acceptor(&cfg.cert_path, &cfg.key_path)
}

/// Builds the connector used to re-encrypt towards backends
pub fn build_connector(cfg: &BackendsTlsConfig) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    if let Some(ca_path) = &cfg.root_ca_path {
        for cert in load_certs(ca_path)? {
            roots
                .add(cert)
                .map_err(|e| ProxyError::Tls(format!("Failed to add root certificate: {e}")))?;
        }
    }

    let client = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(client)))
}

/// Server name presented to a backend: the backend's own `sni` field wins,
/// then the listener-wide override, then the dialed host.
pub fn backend_server_name(
    backend_sni: Option<&str>,
    cfg: &BackendsTlsConfig,
    host: &str,
) -> Result<ServerName<'static>> {
    let name = backend_sni
        .or(cfg.sni.as_deref())
        .unwrap_or(host)
        .to_string();
    ServerName::try_from(name).map_err(|e| ProxyError::Tls(format!("invalid server name: {e}")))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let bytes = std::fs::read(path)
        .map_err(|e| ProxyError::Tls(format!("Failed to read certificate: {e}")))?;
    let certs = CertificateDer::pem_slice_iter(&bytes)
        .collect::<std::result::Result<Vec<_>, rustls_pki_types::pem::Error>>()
        .map_err(|e| ProxyError::Tls(format!("Failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls(format!("no certificates found in {path}")));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let bytes =
        std::fs::read(path).map_err(|e| ProxyError::Tls(format!("Failed to read key: {e}")))?;
    let mut keys: Vec<PrivateKeyDer<'_>> = PrivateKeyDer::pem_slice_iter(&bytes)
        .collect::<std::result::Result<Vec<_>, rustls_pki_types::pem::Error>>()
        .map_err(|e| ProxyError::Tls(format!("Failed to parse private key: {e}")))?;
    keys.pop().ok_or(ProxyError::NoPrivateKey)
}
