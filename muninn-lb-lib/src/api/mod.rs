//! Read-only management HTTP API: process info, configuration dump with the
//! live servers overlay, and the listener list. Optional basic auth, TLS,
//! and permissive CORS.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use serde_json::json;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::{ApiConfig, Config};
use crate::error::{ProxyError, Result};
use crate::manager::Manager;
use crate::tls;

type Body = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub struct ApiState {
    pub manager: Arc<Manager>,
    pub config: Config,
    pub version: &'static str,
    started_at: SystemTime,
    started_instant: Instant,
    cors: bool,
    auth: Option<String>,
}

impl ApiState {
    pub fn new(cfg: &ApiConfig, manager: Arc<Manager>, config: Config, version: &'static str) -> Self {
        let auth = cfg
            .basic_auth
            .as_ref()
            .map(|auth| format!("Basic {}", BASE64.encode(format!("{}:{}", auth.login, auth.password))));
        Self {
            manager,
            config,
            version,
            started_at: SystemTime::now(),
            started_instant: Instant::now(),
            cors: cfg.cors,
            auth,
        }
    }
}

/// Run the API server until the process exits.
pub async fn serve(cfg: ApiConfig, state: Arc<ApiState>) -> Result<()> {
    let listener = TcpListener::bind(&cfg.bind)
        .await
        .map_err(|e| ProxyError::Listener(format!("api cannot bind {}: {e}", cfg.bind)))?;
    let acceptor = cfg
        .tls
        .as_ref()
        .map(|t| tls::build_acceptor(&t.cert_path, &t.key_path))
        .transpose()?;

    info!(bind = %cfg.bind, tls = acceptor.is_some(), cors = cfg.cors, "api server running");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "api accept failed");
                continue;
            }
        };

        let state = Arc::clone(&state);
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
                let state = Arc::clone(&state);
                async move { Ok::<_, hyper::Error>(route(req, &state).await) }
            });

            let builder = ConnBuilder::new(TokioExecutor::new());
            let served = match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => builder.serve_connection(TokioIo::new(tls_stream), svc).await,
                    Err(e) => {
                        warn!(%peer, error = %e, "api tls handshake failed");
                        return;
                    }
                },
                None => builder.serve_connection(TokioIo::new(stream), svc).await,
            };
            if let Err(e) = served {
                warn!(%peer, error = %e, "api connection error");
            }
        });
    }
}

async fn route(req: Request<Incoming>, state: &ApiState) -> Response<Body> {
    if state.cors && req.method() == Method::OPTIONS {
        return decorate(respond(StatusCode::NO_CONTENT, "", "text/plain"), state);
    }

    if let Some(expected) = &state.auth {
        let presented = req
            .headers()
            .get(hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            let mut resp = respond(StatusCode::UNAUTHORIZED, "Unauthorized\n", "text/plain");
            resp.headers_mut().insert(
                hyper::header::WWW_AUTHENTICATE,
                hyper::header::HeaderValue::from_static("Basic realm=\"muninn-lb\""),
            );
            return decorate(resp, state);
        }
    }

    let resp = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => root(state),
        (&Method::GET, "/dump") => {
            let format = query_param(req.uri().query(), "format").unwrap_or_else(|| "toml".into());
            match state.manager.dump(&state.config, &format).await {
                Ok(body) => respond(StatusCode::OK, body, "text/plain"),
                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "text/plain"),
            }
        }
        (&Method::GET, "/servers") => {
            let servers = state.manager.list().await;
            match serde_json::to_string_pretty(&servers) {
                Ok(body) => respond(StatusCode::OK, body, "application/json"),
                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "text/plain"),
            }
        }
        _ => respond(StatusCode::NOT_FOUND, "Not Found\n", "text/plain"),
    };
    decorate(resp, state)
}

fn root(state: &ApiState) -> Response<Body> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let started = state
        .started_at
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let body = json!({
        "pid": std::process::id(),
        "time": now,
        "startTime": started,
        "uptime": format!("{}s", state.started_instant.elapsed().as_secs()),
        "version": state.version,
        "configuration": state.config,
    });
    match serde_json::to_string_pretty(&body) {
        Ok(body) => respond(StatusCode::OK, body, "application/json"),
        Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "text/plain"),
    }
}

fn respond(status: StatusCode, body: impl Into<Bytes>, content_type: &str) -> Response<Body> {
    let body = Full::new(body.into()).map_err(|never| match never {}).boxed();
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    if let Ok(value) = hyper::header::HeaderValue::from_str(content_type) {
        resp.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    resp
}

fn decorate(mut resp: Response<Body>, state: &ApiState) -> Response<Body> {
    if state.cors {
        let headers = resp.headers_mut();
        headers.insert(
            "access-control-allow-origin",
            hyper::header::HeaderValue::from_static("*"),
        );
        headers.insert(
            "access-control-allow-credentials",
            hyper::header::HeaderValue::from_static("true"),
        );
        headers.insert(
            "access-control-allow-methods",
            hyper::header::HeaderValue::from_static("GET,POST,PUT,DELETE,OPTIONS"),
        );
        headers.insert(
            "access-control-allow-headers",
            hyper::header::HeaderValue::from_static("Origin,Authorization"),
        );
    }
    resp
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}
