//! Upstream provider: turns the configured entry list into backend sets on
//! a channel. The static provider emits once and terminates; pull-based
//! providers can be substituted behind the same channel without touching
//! the scheduler.

pub mod backend;

pub use backend::{parse_backend, Backend, BackendStats, ReadWriteCount, Target};

use tokio::sync::mpsc;
use tracing::warn;

pub struct Upstream {
    entries: Vec<String>,
}

impl Upstream {
    pub fn new(entries: Vec<String>) -> Self {
        Self { entries }
    }

    /// Parse the configured entries and emit them once. Unparseable lines
    /// are skipped with a warning; if nothing parses an empty set is still
    /// emitted so consumers can tell "empty" from "not yet known".
    pub fn start(&self) -> mpsc::Receiver<Vec<Backend>> {
        let (tx, rx) = mpsc::channel(1);
        let entries = self.entries.clone();
        tokio::spawn(async move {
            let mut backends = Vec::new();
            for line in &entries {
                match parse_backend(line) {
                    Ok(b) => backends.push(b),
                    Err(e) => warn!(error = %e, "skipping upstream entry"),
                }
            }
            let _ = tx.send(backends).await;
        });
        rx
    }
}
