//! UDP listener. Each client address gets a pseudo-session with a sticky
//! backend; the session owns a connected socket towards the backend and
//! relays both directions until idle timeout, a datagram cap, or stop.

use ahash::AHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ServerConfig, Timeouts, UdpConfig};
use crate::error::{ProxyError, Result};
use crate::firewall::Firewall;
use crate::healthcheck::Healthcheck;
use crate::load_balancing::{Balancer, ElectContext};
use crate::scheduler::Scheduler;
use crate::upstream::{Target, Upstream};

/// Read buffer for the listener socket; datagrams keep their wire length
const DATAGRAM_BUF: usize = 64 * 1024;

enum SessionMsg {
    Datagram { peer: SocketAddr, payload: Vec<u8> },
    Remove(SocketAddr),
    Stop,
}

struct SessionHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    token: CancellationToken,
}

struct Inner {
    name: String,
    socket: Arc<UdpSocket>,
    scheduler: Scheduler,
    firewall: Arc<Firewall>,
    timeouts: Timeouts,
    udp_cfg: UdpConfig,
    msg_tx: mpsc::UnboundedSender<SessionMsg>,
}

struct Runtime {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
    healthcheck: Option<Healthcheck>,
    local_addr: SocketAddr,
}

pub struct UdpServer {
    name: String,
    cfg: ServerConfig,
    firewall: Arc<Firewall>,
    runtime: Option<Runtime>,
}

impl UdpServer {
    pub fn new(name: String, cfg: ServerConfig, firewall: Arc<Firewall>) -> Self {
        info!(name, bind = %cfg.bind, balance = ?cfg.balance, "creating udp listener");
        Self { name, cfg, firewall, runtime: None }
    }

    pub fn cfg(&self) -> &ServerConfig {
        &self.cfg
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.as_ref().map(|rt| rt.local_addr)
    }

    pub fn scheduler(&self) -> Option<Scheduler> {
        self.runtime.as_ref().map(|rt| rt.inner.scheduler.clone())
    }

    pub async fn start(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(&self.cfg.bind)
            .await
            .map_err(|e| ProxyError::Listener(format!("cannot bind {}: {e}", self.cfg.bind)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| ProxyError::Listener(e.to_string()))?;
        let socket = Arc::new(socket);

        let upstream_rx = Upstream::new(self.cfg.upstream.clone()).start();
        let balancer = Balancer::new(self.cfg.balance, None);
        let scheduler = Scheduler::spawn(balancer, upstream_rx);

        let healthcheck = self
            .cfg
            .healthcheck
            .as_ref()
            .map(|hc| Healthcheck::start(hc, scheduler.clone()));

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let inner = Arc::new(Inner {
            name: self.name.clone(),
            socket: Arc::clone(&socket),
            scheduler,
            firewall: Arc::clone(&self.firewall),
            timeouts: Timeouts::from_options(&self.cfg.options),
            udp_cfg: self.cfg.udp.clone().unwrap_or_default(),
            msg_tx,
        });

        tokio::spawn(supervise(msg_rx, Arc::clone(&inner), shutdown.clone()));
        tokio::spawn(read_loop(socket, Arc::clone(&inner), shutdown.clone()));

        info!(name = self.name, %local_addr, "udp listener running");
        self.runtime = Some(Runtime { inner, shutdown, healthcheck, local_addr });
        Ok(())
    }

    /// Stop the listener and all sessions. Safe to call more than once; the
    /// scheduler sees exactly one stop.
    pub fn stop(&mut self) {
        let Some(mut rt) = self.runtime.take() else {
            return;
        };
        info!(name = self.name, "stopping udp listener");
        rt.shutdown.cancel();
        let _ = rt.inner.msg_tx.send(SessionMsg::Stop);
        rt.inner.scheduler.stop();
        if let Some(hc) = rt.healthcheck.as_mut() {
            hc.stop();
        }
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn read_loop(socket: Arc<UdpSocket>, inner: Arc<Inner>, shutdown: CancellationToken) {
    let mut buf = vec![0u8; DATAGRAM_BUF];
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = socket.recv_from(&mut buf) => res,
        };
        match received {
            Ok((n, peer)) => {
                let _ = inner.msg_tx.send(SessionMsg::Datagram {
                    peer,
                    payload: buf[..n].to_vec(),
                });
            }
            Err(e) => {
                warn!(name = inner.name, error = %e, "udp receive failed");
            }
        }
    }
    debug!(name = inner.name, "udp read loop stopped");
}

/// Supervisor: the only task that touches the session map.
async fn supervise(
    mut msg_rx: mpsc::UnboundedReceiver<SessionMsg>,
    inner: Arc<Inner>,
    shutdown: CancellationToken,
) {
    let mut sessions: AHashMap<SocketAddr, SessionHandle> = AHashMap::new();
    while let Some(msg) = msg_rx.recv().await {
        match msg {
            SessionMsg::Datagram { peer, payload } => {
                if let Some(handle) = sessions.get(&peer) {
                    let _ = handle.tx.send(payload);
                    continue;
                }
                if !inner.firewall.allows_client(&peer) {
                    debug!(%peer, "rejected by firewall");
                    continue;
                }
                match open_session(&inner, peer, shutdown.child_token()).await {
                    Ok(handle) => {
                        let _ = handle.tx.send(payload);
                        sessions.insert(peer, handle);
                    }
                    Err(e) => warn!(%peer, error = %e, "cannot open session"),
                }
            }
            SessionMsg::Remove(peer) => {
                if let Some(handle) = sessions.remove(&peer) {
                    handle.token.cancel();
                }
            }
            SessionMsg::Stop => {
                for (_, handle) in sessions.drain() {
                    handle.token.cancel();
                }
                break;
            }
        }
    }
    debug!(name = inner.name, "udp supervisor stopped");
}

/// Elect a backend for a fresh client address and start the session task.
/// The backend binding is sticky for the session's lifetime.
async fn open_session(
    inner: &Arc<Inner>,
    peer: SocketAddr,
    token: CancellationToken,
) -> Result<SessionHandle> {
    let backend = inner.scheduler.take_backend(ElectContext::new(peer)).await?;
    let target = backend.target.clone();

    let backend_socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| ProxyError::Dial(e.to_string()))?;
    if let Err(e) = backend_socket.connect(backend.address()).await {
        inner.scheduler.increment_refused(&target);
        return Err(ProxyError::Dial(format!("{}: {e}", backend.address())));
    }

    let (tx, rx) = mpsc::unbounded_channel();
    debug!(%peer, backend = %target, "udp session created");
    tokio::spawn(run_session(
        Arc::clone(inner),
        peer,
        target,
        backend_socket,
        rx,
        token.clone(),
    ));
    Ok(SessionHandle { tx, token })
}

async fn run_session(
    inner: Arc<Inner>,
    peer: SocketAddr,
    target: Target,
    backend_socket: UdpSocket,
    mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    token: CancellationToken,
) {
    inner.scheduler.increment_connection(&target);

    let mut requests: u64 = 0;
    let mut responses: u64 = 0;
    let mut buf = vec![0u8; DATAGRAM_BUF];
    let mut client_deadline = arm(inner.timeouts.client_idle);
    let mut backend_deadline = arm(inner.timeouts.backend_idle);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            datagram = inbound.recv() => match datagram {
                Some(payload) => {
                    if let Err(e) = backend_socket.send(&payload).await {
                        warn!(%peer, backend = %target, error = %e, "udp forward failed");
                        continue;
                    }
                    inner.scheduler.increment_tx(&target, payload.len() as u64);
                    client_deadline = arm(inner.timeouts.client_idle);
                    requests += 1;
                    if inner.udp_cfg.max_requests != 0 && requests >= inner.udp_cfg.max_requests {
                        debug!(%peer, "udp session request cap reached");
                        break;
                    }
                }
                None => break,
            },
            received = backend_socket.recv(&mut buf) => match received {
                Ok(n) => {
                    if let Err(e) = inner.socket.send_to(&buf[..n], peer).await {
                        warn!(%peer, error = %e, "udp reply failed");
                        continue;
                    }
                    inner.scheduler.increment_rx(&target, n as u64);
                    backend_deadline = arm(inner.timeouts.backend_idle);
                    responses += 1;
                    if inner.udp_cfg.max_responses != 0 && responses >= inner.udp_cfg.max_responses {
                        debug!(%peer, "udp session response cap reached");
                        break;
                    }
                }
                Err(e) => {
                    warn!(%peer, backend = %target, error = %e, "udp backend receive failed");
                    break;
                }
            },
            _ = sleep_until(client_deadline.unwrap_or_else(far_future)), if client_deadline.is_some() => {
                debug!(%peer, "udp session client idle");
                break;
            }
            _ = sleep_until(backend_deadline.unwrap_or_else(far_future)), if backend_deadline.is_some() => {
                debug!(%peer, "udp session backend idle");
                break;
            }
        }
    }

    inner.scheduler.decrement_connection(&target);
    let _ = inner.msg_tx.send(SessionMsg::Remove(peer));
    debug!(%peer, backend = %target, "udp session closed");
}

fn arm(idle: Duration) -> Option<Instant> {
    (!idle.is_zero()).then(|| Instant::now() + idle)
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}
