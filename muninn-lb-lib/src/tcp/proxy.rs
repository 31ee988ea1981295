//! One-directional copy engine with idle timeout, request filtering, and a
//! stats side-channel that aggregates per-chunk counts into one record per
//! second.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::filter::FilterChain;
use crate::upstream::ReadWriteCount;

/// Buffer size for relay reads
pub const BUFFER_SIZE: usize = 16 * 1024;

/// Interval of pushing aggregated read/write stats
const STATS_PUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Start copying `from` into `to` until EOF, error, idle timeout, or
/// cancellation. Returns the aggregated stats channel; it closes only after
/// the final counts have been flushed, so the consumer can use channel
/// closure as the direction's completion signal.
///
/// When a chain is given, every chunk passes `on_request` before the write
/// (the client-to-backend direction).
pub fn proxy<R, W>(
    to: W,
    from: R,
    idle_timeout: Duration,
    chain: Option<Arc<FilterChain>>,
    cancel: CancellationToken,
) -> mpsc::UnboundedReceiver<ReadWriteCount>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    tokio::spawn(aggregate(chunk_rx, out_tx));
    tokio::spawn(async move {
        if let Err(e) = copy(to, from, idle_timeout, chain, &cancel, chunk_tx).await {
            debug!(error = %e, "relay direction terminated");
        }
        // stop the peer direction as well
        cancel.cancel();
    });

    out_rx
}

async fn copy<R, W>(
    mut to: W,
    mut from: R,
    idle_timeout: Duration,
    chain: Option<Arc<FilterChain>>,
    cancel: &CancellationToken,
    chunk_tx: mpsc::UnboundedSender<ReadWriteCount>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = read_with_idle(&mut from, &mut buf, idle_timeout) => read?,
        };
        if n == 0 {
            return Ok(());
        }

        if let Some(chain) = &chain {
            chain.on_request(&buf[..n])?;
        }

        to.write_all(&buf[..n]).await.map_err(|e| {
            if e.kind() == io::ErrorKind::WriteZero {
                ProxyError::ShortWrite
            } else {
                ProxyError::Io(e)
            }
        })?;
        let _ = chunk_tx.send(ReadWriteCount { read: n as u64, written: n as u64 });
    }
}

/// Read with the direction's idle deadline; a zero timeout disables the
/// deadline. The deadline restarts on every read, successful or not.
async fn read_with_idle<R>(from: &mut R, buf: &mut [u8], idle_timeout: Duration) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    if idle_timeout.is_zero() {
        return Ok(from.read(buf).await?);
    }
    match timeout(idle_timeout, from.read(buf)).await {
        Ok(read) => Ok(read?),
        Err(_) => Err(ProxyError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "idle timeout",
        ))),
    }
}

/// Collapse per-chunk counts into at most one record per tick. The sender
/// side closes strictly after the last record is flushed.
async fn aggregate(
    mut chunk_rx: mpsc::UnboundedReceiver<ReadWriteCount>,
    out_tx: mpsc::UnboundedSender<ReadWriteCount>,
) {
    let mut acc = ReadWriteCount::default();
    let mut ticker = interval(STATS_PUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !acc.is_zero() {
                    if out_tx.send(acc).is_err() {
                        break;
                    }
                    acc = ReadWriteCount::default();
                }
            }
            chunk = chunk_rx.recv() => match chunk {
                Some(c) => {
                    acc.read += c.read;
                    acc.written += c.written;
                }
                None => {
                    if !acc.is_zero() {
                        let _ = out_tx.send(acc);
                    }
                    break;
                }
            }
        }
    }
}
