//! ClientHello SNI extraction. The socket is peeked, never read, so the
//! full handshake stays in the kernel buffer for whoever processes the
//! connection next (TLS acceptor or raw relay).

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout_at, Instant};

use crate::error::{ProxyError, Result};

const PEEK_BUF: usize = 4096;
const PEEK_RETRY: Duration = Duration::from_millis(10);

enum Parse {
    Found(String),
    Absent,
    /// Not enough bytes buffered yet to finish walking the hello
    Incomplete,
}

/// Peek the ClientHello and extract the SNI hostname, waiting at most
/// `read_timeout` for enough bytes to arrive. A hello without a server_name
/// extension yields `Ok(None)`; a non-TLS or truncated stream is a sniff
/// error.
pub async fn sniff(stream: &TcpStream, read_timeout: Duration) -> Result<Option<String>> {
    let deadline = Instant::now() + read_timeout;
    let mut buf = [0u8; PEEK_BUF];
    let mut seen = 0usize;

    loop {
        let n = timeout_at(deadline, stream.peek(&mut buf))
            .await
            .map_err(|_| ProxyError::Sniff("timed out waiting for ClientHello".to_string()))??;
        if n == 0 {
            return Err(ProxyError::Sniff("connection closed during handshake".to_string()));
        }

        match parse_client_hello(&buf[..n]) {
            Parse::Found(host) => return Ok(Some(host)),
            Parse::Absent => return Ok(None),
            Parse::Incomplete if n == PEEK_BUF => {
                // hello larger than our window and still no SNI
                return Ok(None);
            }
            Parse::Incomplete => {
                if n == seen {
                    sleep(PEEK_RETRY).await;
                }
                seen = n;
            }
        }
    }
}

/// Walk a TLS ClientHello to the server_name extension.
fn parse_client_hello(buf: &[u8]) -> Parse {
    // TLS record header: content type 0x16 = handshake
    if !buf.is_empty() && buf[0] != 0x16 {
        return Parse::Absent;
    }
    if buf.len() < 5 {
        return Parse::Incomplete;
    }

    let mut pos = 5;

    // handshake type (1) + length (3); type 1 = ClientHello
    if buf.len() < pos + 4 {
        return Parse::Incomplete;
    }
    if buf[pos] != 0x01 {
        return Parse::Absent;
    }
    pos += 4;

    // client version (2) + random (32)
    pos += 34;
    if buf.len() < pos + 1 {
        return Parse::Incomplete;
    }

    // session id
    let session_id_len = buf[pos] as usize;
    pos += 1 + session_id_len;
    if buf.len() < pos + 2 {
        return Parse::Incomplete;
    }

    // cipher suites
    let cipher_len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
    pos += 2 + cipher_len;
    if buf.len() < pos + 1 {
        return Parse::Incomplete;
    }

    // compression methods
    let compression_len = buf[pos] as usize;
    pos += 1 + compression_len;
    if buf.len() < pos + 2 {
        return Parse::Incomplete;
    }

    // extensions
    let extensions_len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
    pos += 2;
    let extensions_end = pos + extensions_len;
    if buf.len() < extensions_end {
        return walk_extensions(&buf[pos..], extensions_len, true);
    }
    walk_extensions(&buf[pos..extensions_end], extensions_len, false)
}

fn walk_extensions(buf: &[u8], declared_len: usize, truncated: bool) -> Parse {
    let mut pos = 0;
    while pos + 4 <= buf.len() {
        let ext_type = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let ext_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
        pos += 4;

        if buf.len() < pos + ext_len {
            return if truncated { Parse::Incomplete } else { Parse::Absent };
        }

        // extension 0 = server_name
        if ext_type == 0 {
            return parse_server_name(&buf[pos..pos + ext_len]);
        }
        pos += ext_len;
    }
    if truncated && pos < declared_len {
        return Parse::Incomplete;
    }
    Parse::Absent
}

fn parse_server_name(ext: &[u8]) -> Parse {
    // server_name_list length (2), then entries of name_type (1) + length (2)
    if ext.len() < 5 {
        return Parse::Absent;
    }
    let mut pos = 2;
    // name type 0 = host_name
    if ext[pos] != 0 {
        return Parse::Absent;
    }
    pos += 1;
    let name_len = u16::from_be_bytes([ext[pos], ext[pos + 1]]) as usize;
    pos += 2;
    if ext.len() < pos + name_len {
        return Parse::Absent;
    }
    match std::str::from_utf8(&ext[pos..pos + name_len]) {
        Ok(name) => Parse::Found(name.to_string()),
        Err(_) => Parse::Absent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal ClientHello record carrying the given SNI
    fn client_hello(sni: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(name) = sni {
            let name = name.as_bytes();
            let mut ext = Vec::new();
            ext.extend_from_slice(&0u16.to_be_bytes()); // server_name
            let list_len = (name.len() + 3) as u16;
            let ext_len = list_len + 2;
            ext.extend_from_slice(&ext_len.to_be_bytes());
            ext.extend_from_slice(&list_len.to_be_bytes());
            ext.push(0); // host_name
            ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
            ext.extend_from_slice(name);
            extensions.extend_from_slice(&ext);
        }

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
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

    #[test]
    fn extracts_hostname() {
        let record = client_hello(Some("a.example"));
        assert!(matches!(
            parse_client_hello(&record),
            Parse::Found(host) if host == "a.example"
        ));
    }

    #[test]
    fn hello_without_sni_is_absent() {
        let record = client_hello(None);
        assert!(matches!(parse_client_hello(&record), Parse::Absent));
    }

    #[test]
    fn non_tls_bytes_are_absent() {
        assert!(matches!(parse_client_hello(b"GET / HTTP/1.1\r\n"), Parse::Absent));
    }

    #[test]
    fn truncated_hello_is_incomplete() {
        let record = client_hello(Some("a.example"));
        assert!(matches!(parse_client_hello(&record[..20]), Parse::Incomplete));
    }

    #[tokio::test]
    async fn sniffs_over_a_real_socket() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(&client_hello(Some("b.example"))).await.unwrap();
            stream
        });

        let (server, _) = listener.accept().await.unwrap();
        let host = sniff(&server, Duration::from_secs(2)).await.unwrap();
        assert_eq!(host.as_deref(), Some("b.example"));
        let _ = client.await.unwrap();
    }

    #[tokio::test]
    async fn sniff_times_out_on_silent_client() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();

        let (server, _) = listener.accept().await.unwrap();
        let err = sniff(&server, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, ProxyError::Sniff(_)));
        drop(client);
    }
}
