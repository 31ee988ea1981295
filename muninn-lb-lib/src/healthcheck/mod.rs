//! Ping healthcheck: periodically dial each backend target over TCP and
//! flip its live flag after the configured number of consecutive passes or
//! fails.

use ahash::AHashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::{parse_duration_or, HealthcheckConfig};
use crate::scheduler::Scheduler;
use crate::upstream::Target;

pub struct Healthcheck {
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Streaks {
    passes: u32,
    fails: u32,
}

impl Healthcheck {
    pub fn start(cfg: &HealthcheckConfig, scheduler: Scheduler) -> Self {
        let mut probe_interval = parse_duration_or(Some(&cfg.interval), Duration::from_secs(10));
        if probe_interval.is_zero() {
            probe_interval = Duration::from_secs(10);
        }
        let mut probe_timeout = parse_duration_or(Some(&cfg.timeout), Duration::from_secs(2));
        if probe_timeout.is_zero() {
            probe_timeout = Duration::from_secs(2);
        }
        let passes = cfg.passes.max(1);
        let fails = cfg.fails.max(1);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut streaks: AHashMap<Target, Streaks> = AHashMap::new();

            loop {
                ticker.tick().await;
                let targets = scheduler.targets().await;
                streaks.retain(|t, _| targets.contains(t));

                for target in targets {
                    let healthy = ping(&target, probe_timeout).await;
                    let entry = streaks.entry(target.clone()).or_default();
                    if healthy {
                        entry.passes = entry.passes.saturating_add(1);
                        entry.fails = 0;
                        if entry.passes == passes {
                            debug!(%target, "backend healthy");
                            scheduler.set_live(&target, true);
                        }
                    } else {
                        entry.fails = entry.fails.saturating_add(1);
                        entry.passes = 0;
                        if entry.fails == fails {
                            warn!(%target, "backend unhealthy");
                            scheduler.set_live(&target, false);
                        }
                    }
                }
            }
        });

        Self { handle: Some(handle) }
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Healthcheck {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn ping(target: &Target, probe_timeout: Duration) -> bool {
    matches!(
        timeout(probe_timeout, TcpStream::connect(target.address())).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Balance;
    use crate::load_balancing::Balancer;
    use crate::upstream::parse_backend;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn marks_unreachable_backend_dead() {
        // a bound-then-dropped listener guarantees a closed port
        let closed = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };

        let (feed, feed_rx) = mpsc::channel(1);
        let scheduler = Scheduler::spawn(Balancer::new(Balance::Weight, None), feed_rx);
        feed.send(vec![parse_backend(&closed.to_string()).unwrap()])
            .await
            .unwrap();

        let cfg = HealthcheckConfig {
            kind: "ping".into(),
            interval: "50ms".into(),
            timeout: "100ms".into(),
            passes: 1,
            fails: 1,
        };
        let mut check = Healthcheck::start(&cfg, scheduler.clone());

        // wait for at least one probe round
        tokio::time::sleep(Duration::from_millis(400)).await;
        let backends = scheduler.backends().await;
        assert!(!backends[0].stats.live);

        check.stop();
        scheduler.stop();
    }

    #[tokio::test]
    async fn reachable_backend_stays_live() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let (feed, feed_rx) = mpsc::channel(1);
        let scheduler = Scheduler::spawn(Balancer::new(Balance::Weight, None), feed_rx);
        feed.send(vec![parse_backend(&addr.to_string()).unwrap()])
            .await
            .unwrap();

        let cfg = HealthcheckConfig {
            kind: "ping".into(),
            interval: "50ms".into(),
            timeout: "500ms".into(),
            passes: 1,
            fails: 1,
        };
        let mut check = Healthcheck::start(&cfg, scheduler.clone());

        tokio::time::sleep(Duration::from_millis(400)).await;
        let backends = scheduler.backends().await;
        assert!(backends[0].stats.live);

        check.stop();
        scheduler.stop();
    }
}
