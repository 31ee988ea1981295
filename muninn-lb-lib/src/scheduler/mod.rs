//! Per-listener scheduler. One supervisor task owns the backend list and
//! every counter; elections and counter updates arrive as messages, so all
//! mutations are serialized and every election sees a consistent snapshot.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::load_balancing::{Balancer, ElectContext};
use crate::upstream::{Backend, Target};

const STATS_TICK: Duration = Duration::from_secs(1);

enum SchedulerMsg {
    Elect {
        ctx: ElectContext,
        reply: oneshot::Sender<Result<Backend>>,
    },
    IncrementConnection(Target),
    DecrementConnection(Target),
    IncrementRefused(Target),
    IncrementRx(Target, u64),
    IncrementTx(Target, u64),
    SetLive(Target, bool),
    Targets(oneshot::Sender<Vec<Target>>),
    Backends(oneshot::Sender<Vec<Backend>>),
    Stop,
}

/// Cloneable handle to a scheduler supervisor. All methods are safe to call
/// after stop; they become no-ops (or yield `NoBackend` for elections).
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<SchedulerMsg>,
}

impl Scheduler {
    /// Spawn the supervisor, subscribed to `upstream_rx` for backend set
    /// updates.
    pub fn spawn(balancer: Balancer, upstream_rx: mpsc::Receiver<Vec<Backend>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, upstream_rx, balancer));
        Self { tx }
    }

    /// Ask the supervisor to elect a backend for this context.
    pub async fn take_backend(&self, ctx: ElectContext) -> Result<Backend> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SchedulerMsg::Elect { ctx, reply: reply_tx })
            .map_err(|_| ProxyError::NoBackend)?;
        reply_rx.await.unwrap_or(Err(ProxyError::NoBackend))
    }

    pub fn increment_connection(&self, target: &Target) {
        let _ = self.tx.send(SchedulerMsg::IncrementConnection(target.clone()));
    }

    pub fn decrement_connection(&self, target: &Target) {
        let _ = self.tx.send(SchedulerMsg::DecrementConnection(target.clone()));
    }

    pub fn increment_refused(&self, target: &Target) {
        let _ = self.tx.send(SchedulerMsg::IncrementRefused(target.clone()));
    }

    pub fn increment_rx(&self, target: &Target, bytes: u64) {
        let _ = self.tx.send(SchedulerMsg::IncrementRx(target.clone(), bytes));
    }

    pub fn increment_tx(&self, target: &Target, bytes: u64) {
        let _ = self.tx.send(SchedulerMsg::IncrementTx(target.clone(), bytes));
    }

    pub fn set_live(&self, target: &Target, live: bool) {
        let _ = self.tx.send(SchedulerMsg::SetLive(target.clone(), live));
    }

    /// Current targets (healthcheck probing)
    pub async fn targets(&self) -> Vec<Target> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(SchedulerMsg::Targets(reply_tx)).is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Snapshot of the backend set with counters
    pub async fn backends(&self) -> Vec<Backend> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(SchedulerMsg::Backends(reply_tx)).is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Stop the supervisor. Idempotent; pending elections drain with
    /// `NoBackend`.
    pub fn stop(&self) {
        let _ = self.tx.send(SchedulerMsg::Stop);
    }
}

struct Slot {
    backend: Backend,
    /// Bytes accumulated since the previous stats tick
    tick_rx: u64,
    tick_tx: u64,
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<SchedulerMsg>,
    mut upstream_rx: mpsc::Receiver<Vec<Backend>>,
    mut balancer: Balancer,
) {
    let mut slots: Vec<Slot> = Vec::new();
    let mut upstream_open = true;
    let mut ticker = interval(STATS_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // upstream updates first, so an election queued behind an update
        // observes the merged set
        tokio::select! {
            biased;
            update = upstream_rx.recv(), if upstream_open => match update {
                Some(backends) => {
                    debug!(count = backends.len(), "upstream update");
                    merge(&mut slots, backends);
                }
                None => upstream_open = false,
            },
            _ = ticker.tick() => {
                for slot in &mut slots {
                    slot.backend.stats.rx_second = slot.tick_rx;
                    slot.backend.stats.tx_second = slot.tick_tx;
                    slot.tick_rx = 0;
                    slot.tick_tx = 0;
                }
            }
            msg = rx.recv() => match msg {
                Some(SchedulerMsg::Elect { ctx, reply }) => {
                    let snapshot: Vec<Backend> =
                        slots.iter().map(|s| s.backend.clone()).collect();
                    let _ = reply.send(balancer.elect(&ctx, &snapshot));
                }
                Some(SchedulerMsg::IncrementConnection(target)) => {
                    if let Some(slot) = find(&mut slots, &target) {
                        slot.backend.stats.active_connections += 1;
                        slot.backend.stats.total_connections += 1;
                    }
                }
                Some(SchedulerMsg::DecrementConnection(target)) => {
                    if let Some(slot) = find(&mut slots, &target) {
                        // unbalanced pairs are a programmer error; clamp anyway
                        slot.backend.stats.active_connections =
                            slot.backend.stats.active_connections.saturating_sub(1);
                    }
                }
                Some(SchedulerMsg::IncrementRefused(target)) => {
                    if let Some(slot) = find(&mut slots, &target) {
                        slot.backend.stats.refused_connections += 1;
                    }
                }
                Some(SchedulerMsg::IncrementRx(target, bytes)) => {
                    if let Some(slot) = find(&mut slots, &target) {
                        slot.backend.stats.rx_bytes += bytes;
                        slot.tick_rx += bytes;
                    }
                }
                Some(SchedulerMsg::IncrementTx(target, bytes)) => {
                    if let Some(slot) = find(&mut slots, &target) {
                        slot.backend.stats.tx_bytes += bytes;
                        slot.tick_tx += bytes;
                    }
                }
                Some(SchedulerMsg::SetLive(target, live)) => {
                    if let Some(slot) = find(&mut slots, &target) {
                        slot.backend.stats.live = live;
                    }
                }
                Some(SchedulerMsg::Targets(reply)) => {
                    let _ = reply.send(
                        slots.iter().map(|s| s.backend.target.clone()).collect(),
                    );
                }
                Some(SchedulerMsg::Backends(reply)) => {
                    let _ = reply.send(slots.iter().map(|s| s.backend.clone()).collect());
                }
                Some(SchedulerMsg::Stop) | None => break,
            }
        }
    }

    // refuse whatever was still queued behind the stop
    rx.close();
    while let Ok(msg) = rx.try_recv() {
        if let SchedulerMsg::Elect { reply, .. } = msg {
            let _ = reply.send(Err(ProxyError::NoBackend));
        }
    }
}

fn find<'a>(slots: &'a mut [Slot], target: &Target) -> Option<&'a mut Slot> {
    slots.iter_mut().find(|s| &s.backend.target == target)
}

/// Merge a fresh upstream set into the live one: matching targets keep their
/// stats and tick accumulators, new targets start fresh, missing targets are
/// dropped.
fn merge(slots: &mut Vec<Slot>, update: Vec<Backend>) {
    let mut next = Vec::with_capacity(update.len());
    for incoming in update {
        if let Some(pos) = slots
            .iter()
            .position(|s| s.backend.target == incoming.target)
        {
            let mut slot = slots.remove(pos);
            slot.backend.merge_from(&incoming);
            next.push(slot);
        } else {
            next.push(Slot { backend: incoming, tick_rx: 0, tick_tx: 0 });
        }
    }
    *slots = next;
}
