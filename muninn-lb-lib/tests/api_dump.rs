//! Management API behavior

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::*;
use muninn_lb_lib::api::{self, ApiState};
use muninn_lb_lib::config::{ApiConfig, BasicAuthConfig, Config, ConnectionOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

async fn http_get(addr: std::net::SocketAddr, path: &str, auth: Option<&str>) -> TestResult<(u16, String)> {
    let mut stream = TcpStream::connect(addr).await?;
    let mut request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    if let Some(auth) = auth {
        request.push_str(&format!("Authorization: {auth}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response)).await??;
    let response = String::from_utf8(response)?;
    let (head, body) = response.split_once("\r\n\r\n").ok_or("malformed response")?;
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .ok_or("missing status")?
        .parse()?;
    Ok((status, body.to_string()))
}

async fn start_api(
    manager: Arc<muninn_lb_lib::Manager>,
    config: Config,
    api_cfg: ApiConfig,
) -> TestResult<std::net::SocketAddr> {
    let addr = pick_free_port();
    let mut api_cfg = api_cfg;
    api_cfg.bind = addr.to_string();
    let state = Arc::new(ApiState::new(&api_cfg, manager, config, "test"));
    tokio::spawn(async move {
        let _ = api::serve(api_cfg, state).await;
    });
    sleep(Duration::from_millis(100)).await;
    Ok(addr)
}

#[tokio::test]
async fn dump_round_trips_the_live_server_set() -> TestResult<()> {
    let backend_a = spawn_echo_server().await;
    let backend_b = spawn_echo_server().await;
    let (manager, _firewall, _dir) = new_manager(ConnectionOptions {
        client_idle_timeout: Some("30s".to_string()),
        ..Default::default()
    });
    manager
        .create("alpha", base_server_cfg(vec![backend_a.to_string()]))
        .await?;
    manager
        .create("beta", base_server_cfg(vec![format!("{backend_b} weight=2")]))
        .await?;

    let config = Config::default();
    let addr = start_api(Arc::clone(&manager), config, ApiConfig::default()).await?;

    let (status, body) = http_get(addr, "/dump?format=toml", None).await?;
    assert_eq!(status, 200);

    let parsed: Config = toml::from_str(&body)?;
    assert_eq!(parsed.servers, manager.list().await);
    // defaults were applied before the listener started
    assert_eq!(
        parsed.servers["alpha"].options.client_idle_timeout.as_deref(),
        Some("30s")
    );

    let (status, body) = http_get(addr, "/dump?format=json", None).await?;
    assert_eq!(status, 200);
    let parsed: Config = serde_json::from_str(&body)?;
    assert_eq!(parsed.servers.len(), 2);

    let (status, _) = http_get(addr, "/dump?format=yaml", None).await?;
    assert_eq!(status, 500);

    manager.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn root_reports_process_info() -> TestResult<()> {
    let (manager, _firewall, _dir) = new_manager(ConnectionOptions::default());
    let addr = start_api(Arc::clone(&manager), Config::default(), ApiConfig::default()).await?;

    let (status, body) = http_get(addr, "/", None).await?;
    assert_eq!(status, 200);
    let info: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(info["pid"], std::process::id());
    assert_eq!(info["version"], "test");
    assert!(info["configuration"].is_object());

    let (status, _) = http_get(addr, "/nope", None).await?;
    assert_eq!(status, 404);
    Ok(())
}

#[tokio::test]
async fn servers_endpoint_lists_configurations() -> TestResult<()> {
    let backend = spawn_echo_server().await;
    let (manager, _firewall, _dir) = new_manager(ConnectionOptions::default());
    manager
        .create("alpha", base_server_cfg(vec![backend.to_string()]))
        .await?;
    let addr = start_api(Arc::clone(&manager), Config::default(), ApiConfig::default()).await?;

    let (status, body) = http_get(addr, "/servers", None).await?;
    assert_eq!(status, 200);
    let servers: serde_json::Value = serde_json::from_str(&body)?;
    assert!(servers.get("alpha").is_some());

    manager.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn basic_auth_guards_every_route() -> TestResult<()> {
    let (manager, _firewall, _dir) = new_manager(ConnectionOptions::default());
    let api_cfg = ApiConfig {
        basic_auth: Some(BasicAuthConfig {
            login: "admin".to_string(),
            password: "secret".to_string(),
        }),
        ..Default::default()
    };
    let addr = start_api(Arc::clone(&manager), Config::default(), api_cfg).await?;

    let (status, _) = http_get(addr, "/", None).await?;
    assert_eq!(status, 401);

    // base64("admin:secret")
    let (status, _) = http_get(addr, "/", Some("Basic YWRtaW46c2VjcmV0")).await?;
    assert_eq!(status, 200);

    let (status, _) = http_get(addr, "/", Some("Basic d3Jvbmc6d3Jvbmc=")).await?;
    assert_eq!(status, 401);
    Ok(())
}
