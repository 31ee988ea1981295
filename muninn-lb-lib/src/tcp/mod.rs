//! TCP / TLS listener. One supervisor task per listener owns the clients
//! map; accept, per-connection handling, and per-direction copying run as
//! independent tasks joined by channels.

pub mod proxy;

use ahash::AHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_rustls::server::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{
    parse_duration_or, BackendsTlsConfig, ServerConfig, SniConfig, Timeouts,
};
use crate::error::{ProxyError, Result};
use crate::filter::FilterChain;
use crate::firewall::Firewall;
use crate::geo::GeoDb;
use crate::healthcheck::Healthcheck;
use crate::load_balancing::{Balancer, ElectContext};
use crate::scheduler::Scheduler;
use crate::sni;
use crate::tls;
use crate::upstream::{Backend, Upstream};

const REPUTATION_RECHECK: Duration = Duration::from_secs(1);

trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}
type BoxedIo = Box<dyn IoStream>;

/// A client connection, optionally TLS-terminated
pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// An accepted connection on its way to the supervisor
pub struct TcpContext {
    pub peer: SocketAddr,
    /// Sniffed SNI hostname, when the listener sniffs one
    pub hostname: Option<String>,
    pub stream: ClientStream,
}

enum ServerMsg {
    Connect(TcpContext),
    Disconnect(SocketAddr),
    Stop,
}

struct Inner {
    name: String,
    sni_cfg: Option<SniConfig>,
    backends_tls: Option<BackendsTlsConfig>,
    acceptor: Option<TlsAcceptor>,
    connector: Option<TlsConnector>,
    timeouts: Timeouts,
    scheduler: Scheduler,
    chain: Arc<FilterChain>,
    firewall: Arc<Firewall>,
    msg_tx: mpsc::UnboundedSender<ServerMsg>,
}

struct Runtime {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
    healthcheck: Option<Healthcheck>,
    local_addr: SocketAddr,
}

pub struct TcpServer {
    name: String,
    cfg: ServerConfig,
    firewall: Arc<Firewall>,
    geo: Option<Arc<GeoDb>>,
    runtime: Option<Runtime>,
}

impl TcpServer {
    pub fn new(
        name: String,
        cfg: ServerConfig,
        firewall: Arc<Firewall>,
        geo: Option<Arc<GeoDb>>,
    ) -> Self {
        info!(name, bind = %cfg.bind, balance = ?cfg.balance, "creating tcp listener");
        Self { name, cfg, firewall, geo, runtime: None }
    }

    pub fn cfg(&self) -> &ServerConfig {
        &self.cfg
    }

    /// Bound address once running; useful when binding port 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.as_ref().map(|rt| rt.local_addr)
    }

    pub fn scheduler(&self) -> Option<Scheduler> {
        self.runtime.as_ref().map(|rt| rt.inner.scheduler.clone())
    }

    pub async fn start(&mut self) -> Result<()> {
        let acceptor = self
            .cfg
            .tls
            .as_ref()
            .map(tls::acceptor_from_config)
            .transpose()?;
        let connector = self
            .cfg
            .backends_tls
            .as_ref()
            .map(tls::build_connector)
            .transpose()?;

        let listener = TcpListener::bind(&self.cfg.bind)
            .await
            .map_err(|e| ProxyError::Listener(format!("cannot bind {}: {e}", self.cfg.bind)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ProxyError::Listener(e.to_string()))?;

        let upstream_rx = Upstream::new(self.cfg.upstream.clone()).start();
        let balancer = Balancer::new(self.cfg.balance, self.cfg.sni.clone());
        let scheduler = Scheduler::spawn(balancer, upstream_rx);

        let chain = Arc::new(FilterChain::from_config(
            &self.cfg,
            Arc::clone(&self.firewall),
            self.geo.clone(),
        ));
        chain.start();

        let healthcheck = self
            .cfg
            .healthcheck
            .as_ref()
            .map(|hc| Healthcheck::start(hc, scheduler.clone()));

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let inner = Arc::new(Inner {
            name: self.name.clone(),
            sni_cfg: self.cfg.sni.clone(),
            backends_tls: self.cfg.backends_tls.clone(),
            acceptor,
            connector,
            timeouts: Timeouts::from_options(&self.cfg.options),
            scheduler,
            chain,
            firewall: Arc::clone(&self.firewall),
            msg_tx,
        });

        tokio::spawn(supervise(msg_rx, Arc::clone(&inner), shutdown.clone()));
        tokio::spawn(accept_loop(listener, Arc::clone(&inner), shutdown.clone()));

        info!(name = self.name, %local_addr, "tcp listener running");
        self.runtime = Some(Runtime { inner, shutdown, healthcheck, local_addr });
        Ok(())
    }

    /// Stop accepting, drop in-flight connections, stop scheduler and
    /// filters. Safe to call more than once.
    pub fn stop(&mut self) {
        let Some(mut rt) = self.runtime.take() else {
            return;
        };
        info!(name = self.name, "stopping tcp listener");
        rt.shutdown.cancel();
        let _ = rt.inner.msg_tx.send(ServerMsg::Stop);
        rt.inner.scheduler.stop();
        rt.inner.chain.stop();
        if let Some(hc) = rt.healthcheck.as_mut() {
            hc.stop();
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(listener: TcpListener, inner: Arc<Inner>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => res,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(name = inner.name, error = %e, "failed to accept connection");
                continue;
            }
        };
        if !inner.firewall.allows_client(&peer) {
            debug!(%peer, "rejected by firewall");
            continue;
        }
        tokio::spawn(wrap(stream, peer, Arc::clone(&inner)));
    }
    debug!(name = inner.name, "accept loop stopped");
}

/// Sniff and TLS-wrap an accepted socket, then hand it to the supervisor.
async fn wrap(stream: TcpStream, peer: SocketAddr, inner: Arc<Inner>) {
    let hostname = match &inner.sni_cfg {
        Some(sni_cfg) => {
            let read_timeout =
                parse_duration_or(Some(&sni_cfg.read_timeout), Duration::from_secs(2));
            match sni::sniff(&stream, read_timeout).await {
                Ok(hostname) => hostname,
                Err(e) => {
                    warn!(%peer, error = %e, "failed to read ClientHello");
                    return;
                }
            }
        }
        None => None,
    };

    let stream = match &inner.acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => ClientStream::Tls(Box::new(tls_stream)),
            Err(e) => {
                warn!(%peer, error = %e, "tls handshake failed");
                return;
            }
        },
        None => ClientStream::Plain(stream),
    };

    let _ = inner
        .msg_tx
        .send(ServerMsg::Connect(TcpContext { peer, hostname, stream }));
}

/// Supervisor: the only task that touches the clients map.
async fn supervise(
    mut msg_rx: mpsc::UnboundedReceiver<ServerMsg>,
    inner: Arc<Inner>,
    shutdown: CancellationToken,
) {
    let mut clients: AHashMap<SocketAddr, CancellationToken> = AHashMap::new();
    while let Some(msg) = msg_rx.recv().await {
        match msg {
            ServerMsg::Connect(ctx) => {
                let token = shutdown.child_token();
                clients.insert(ctx.peer, token.clone());
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    let peer = ctx.peer;
                    handle(ctx, Arc::clone(&inner), token).await;
                    let _ = inner.msg_tx.send(ServerMsg::Disconnect(peer));
                });
            }
            ServerMsg::Disconnect(peer) => {
                clients.remove(&peer);
            }
            ServerMsg::Stop => {
                for (_, token) in clients.drain() {
                    token.cancel();
                }
                break;
            }
        }
    }
    debug!(name = inner.name, "supervisor stopped");
}

/// Relay one accepted connection to an elected backend.
async fn handle(ctx: TcpContext, inner: Arc<Inner>, token: CancellationToken) {
    let peer = ctx.peer;
    debug!(%peer, name = inner.name, "accepted");

    if let Err(e) = inner.chain.on_connect(peer) {
        warn!(%peer, error = %e, "connection denied");
        return;
    }

    let elect = ElectContext::with_hostname(peer, ctx.hostname);
    let backend = match inner.scheduler.take_backend(elect).await {
        Ok(backend) => backend,
        Err(e) => {
            warn!(%peer, error = %e, "closing connection");
            inner.chain.on_disconnect(peer);
            return;
        }
    };
    let target = backend.target.clone();

    let backend_stream = match dial(&inner, &backend).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%peer, backend = %target, error = %e, "backend dial failed");
            inner.scheduler.increment_refused(&target);
            inner.chain.on_disconnect(peer);
            return;
        }
    };
    inner.scheduler.increment_connection(&target);
    debug!(%peer, backend = %target, "relay started");

    let client: BoxedIo = match ctx.stream {
        ClientStream::Plain(s) => Box::new(s),
        ClientStream::Tls(s) => s,
    };
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend_stream);

    // backend -> client carries the backend idle deadline; client -> backend
    // carries the client idle deadline and the request filter
    let mut rx_stats = proxy::proxy(
        client_write,
        backend_read,
        inner.timeouts.backend_idle,
        None,
        token.clone(),
    );
    let mut tx_stats = proxy::proxy(
        backend_write,
        client_read,
        inner.timeouts.client_idle,
        Some(Arc::clone(&inner.chain)),
        token.clone(),
    );

    let mut rx_done = false;
    let mut tx_done = false;
    let mut recheck = interval(REPUTATION_RECHECK);
    recheck.set_missed_tick_behavior(MissedTickBehavior::Delay);
    recheck.tick().await;

    while !(rx_done && tx_done) {
        tokio::select! {
            record = rx_stats.recv(), if !rx_done => match record {
                Some(rwc) => {
                    inner.scheduler.increment_rx(&target, rwc.written);
                    inner.chain.on_write(peer, rwc);
                }
                None => rx_done = true,
            },
            record = tx_stats.recv(), if !tx_done => match record {
                Some(rwc) => {
                    inner.scheduler.increment_tx(&target, rwc.written);
                    inner.chain.on_read(peer, rwc);
                }
                None => tx_done = true,
            },
            _ = recheck.tick() => {
                if !inner.firewall.allows_client(&peer) {
                    warn!(%peer, "reputation revoked, dropping connection");
                    token.cancel();
                }
            }
        }
    }

    inner.scheduler.decrement_connection(&target);
    inner.chain.on_disconnect(peer);
    debug!(%peer, backend = %target, "relay finished");
}

/// Dial the backend, optionally re-encrypting with the listener's backend
/// TLS configuration.
async fn dial(inner: &Inner, backend: &Backend) -> Result<BoxedIo> {
    let addr = backend.address();
    let connect = TcpStream::connect(addr.clone());
    let stream = if inner.timeouts.backend_connect.is_zero() {
        connect.await
    } else {
        timeout(inner.timeouts.backend_connect, connect)
            .await
            .map_err(|_| ProxyError::Dial(format!("connect timeout to {addr}")))?
    }
    .map_err(|e| ProxyError::Dial(format!("{addr}: {e}")))?;

    match (&inner.connector, &inner.backends_tls) {
        (Some(connector), Some(backends_tls)) => {
            let name = tls::backend_server_name(
                backend.sni.as_deref(),
                backends_tls,
                &backend.target.host,
            )?;
            let tls_stream = connector
                .connect(name, stream)
                .await
                .map_err(|e| ProxyError::Dial(format!("tls to {addr}: {e}")))?;
            Ok(Box::new(tls_stream))
        }
        _ => Ok(Box::new(stream)),
    }
}
