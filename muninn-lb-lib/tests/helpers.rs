//! Shared helpers for integration tests
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use muninn_lb_lib::config::{ConnectionOptions, ServerConfig};
use muninn_lb_lib::firewall::{Firewall, FIREWALL_FILE};
use muninn_lb_lib::manager::Manager;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::sleep;

pub type TestResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Reserve an address for a listener under test
pub fn pick_free_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr
}

/// An address that is guaranteed closed (bound once, then released)
pub fn closed_port() -> SocketAddr {
    pick_free_port()
}

/// TCP backend that echoes the first read back and waits for EOF
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// TCP backend that records everything each connection sent, delivered once
/// the connection closes
pub async fn spawn_recording_server() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind recorder");
    let addr = listener.local_addr().expect("local addr");
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut data = Vec::new();
                let _ = stream.read_to_end(&mut data).await;
                let _ = tx.send(data);
            });
        }
    });
    (addr, rx)
}

/// TCP backend that only counts accepted connections and drains them
pub async fn spawn_counting_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind counter");
    let addr = listener.local_addr().expect("local addr");
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });
    (addr, count)
}

/// UDP backend that echoes datagrams back to the sender
pub async fn spawn_udp_echo() -> SocketAddr {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind udp echo");
    let addr = socket.local_addr().expect("local addr");
    tokio::spawn(async move {
        let mut buf = [0u8; 65536];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    addr
}

/// Minimal listener configuration for tests
pub fn base_server_cfg(upstream: Vec<String>) -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1:0".to_string(),
        upstream,
        ..Default::default()
    }
}

/// Manager with its own firewall in a temp directory
pub fn new_manager(defaults: ConnectionOptions) -> (Arc<Manager>, Arc<Firewall>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let firewall = Arc::new(Firewall::open(dir.path().join(FIREWALL_FILE)));
    let manager = Arc::new(Manager::new(defaults, Arc::clone(&firewall), None));
    (manager, firewall, dir)
}

/// Minimal TLS ClientHello record carrying the given SNI hostname
pub fn client_hello(sni: Option<&str>) -> Vec<u8> {
    let mut extensions = Vec::new();
    if let Some(name) = sni {
        let name = name.as_bytes();
        extensions.extend_from_slice(&0u16.to_be_bytes()); // server_name
        let list_len = (name.len() + 3) as u16;
        extensions.extend_from_slice(&(list_len + 2).to_be_bytes());
        extensions.extend_from_slice(&list_len.to_be_bytes());
        extensions.push(0); // host_name
        extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
        extensions.extend_from_slice(name);
    }

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // version
    body.extend_from_slice(&[0u8; 32]); // random
    body.push(0); // empty session id
    body.extend_from_slice(&2u16.to_be_bytes()); // one cipher suite
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1); // one compression method
    body.push(0);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut hello = Vec::new();
    hello.push(0x01); // ClientHello
    hello.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    hello.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(hello.len() as u16).to_be_bytes());
    record.extend_from_slice(&hello);
    record
}

/// Self-signed certificate for the given names, written to temp PEM files
pub fn make_self_signed_cert(
    names: &[&str],
) -> TestResult<(
    tempfile::NamedTempFile,
    tempfile::NamedTempFile,
    rustls_pki_types::CertificateDer<'static>,
)> {
    use std::io::Write as _;

    let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
    let rcgen::CertifiedKey { cert, signing_key } = rcgen::generate_simple_self_signed(names)?;

    let mut cert_file = tempfile::NamedTempFile::new()?;
    cert_file.write_all(cert.pem().as_bytes())?;
    let mut key_file = tempfile::NamedTempFile::new()?;
    key_file.write_all(signing_key.serialize_pem().as_bytes())?;

    let cert_der = rustls_pki_types::CertificateDer::from(cert.der().to_vec());
    Ok((cert_file, key_file, cert_der))
}

/// Give freshly started listeners a moment to receive their upstream set
pub async fn settle() {
    sleep(Duration::from_millis(50)).await;
}

/// Wait until `predicate` holds or the deadline passes
pub async fn wait_for<F, Fut>(mut predicate: F, deadline: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = tokio::time::Instant::now();
    while started.elapsed() < deadline {
        if predicate().await {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    false
}
