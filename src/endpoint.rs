//! Endpoint Link: duplex binary framing over a persistent TCP stream to
//! the hardware endpoint.
//!
//! Structured the same way the rest of this codebase's network links
//! are: a supervisor task owns the connection and reconnects with
//! exponential backoff and jitter on failure; a latest-only slot carries
//! telemetry to the Tick Loop (older unread frames are simply
//! overwritten, never queued); dispatch frames go out over an mpsc
//! channel to a writer that blocks only on the socket write itself.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::wire::{self, DispatchFrame, TelemetryFrame};

const RECONNECT_BASE: Duration = Duration::from_millis(250);
const RECONNECT_MAX: Duration = Duration::from_secs(5);
const READ_BUF_SIZE: usize = 4096;

#[derive(Debug, Default)]
pub struct EndpointStats {
    pub reconnects: AtomicU64,
    pub resyncs: AtomicU64,
    pub frames_decoded: AtomicU64,
    pub frames_rejected: AtomicU64,
}

pub struct EndpointLink {
    telemetry_slot: Arc<ArcSwapOption<TelemetryFrame>>,
    dispatch_tx: mpsc::Sender<Vec<u8>>,
    link_down: Arc<AtomicBool>,
    stats: Arc<EndpointStats>,
}

impl EndpointLink {
    /// Spawn the supervisor task and return a handle. `addr` is
    /// `host:port` of the hardware endpoint.
    pub fn spawn(addr: String) -> Self {
        let telemetry_slot: Arc<ArcSwapOption<TelemetryFrame>> = Arc::new(ArcSwapOption::from(None));
        let link_down = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(EndpointStats::default());
        let (dispatch_tx, dispatch_rx) = mpsc::channel::<Vec<u8>>(8);

        tokio::spawn(supervisor_loop(
            addr,
            telemetry_slot.clone(),
            link_down.clone(),
            stats.clone(),
            dispatch_rx,
        ));

        Self {
            telemetry_slot,
            dispatch_tx,
            link_down,
            stats,
        }
    }

    /// Take the latest telemetry frame, if any has arrived since the
    /// last call. Older unread frames are dropped, never queued.
    pub fn take_latest_telemetry(&self) -> Option<TelemetryFrame> {
        self.telemetry_slot.swap(None).map(|arc| (*arc).clone())
    }

    pub fn is_link_down(&self) -> bool {
        self.link_down.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    /// Enqueue a dispatch frame for transmission. Non-blocking from the
    /// Tick Loop's perspective; the writer task does the actual blocking
    /// socket write. Silently dropped while disconnected.
    pub fn send_dispatch(&self, frame: &DispatchFrame) {
        let mut buf = vec![0u8; frame.encoded_len()];
        match frame.encode(&mut buf) {
            Ok(len) => {
                buf.truncate(len);
                if self.dispatch_tx.try_send(buf).is_err() {
                    debug!("dispatch channel full or link down, frame dropped");
                }
            }
            Err(e) => warn!("failed to encode dispatch frame: {e}"),
        }
    }
}

async fn supervisor_loop(
    addr: String,
    telemetry_slot: Arc<ArcSwapOption<TelemetryFrame>>,
    link_down: Arc<AtomicBool>,
    stats: Arc<EndpointStats>,
    mut dispatch_rx: mpsc::Receiver<Vec<u8>>,
) {
    let mut backoff = RECONNECT_BASE;

    loop {
        info!("connecting to endpoint at {addr}");
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                link_down.store(false, Ordering::Release);
                backoff = RECONNECT_BASE;
                metrics::counter!(crate::metrics::ENDPOINT_RECONNECTS_TOTAL).increment(1);

                let (mut read_half, mut write_half) = stream.into_split();
                let reader_stats = stats.clone();
                let reader_slot = telemetry_slot.clone();
                let mut reader = tokio::spawn(async move {
                    reader_loop(&mut read_half, &reader_slot, &reader_stats).await
                });

                // Drain the dispatch channel into blocking socket writes
                // until either the connection or the reader dies.
                loop {
                    tokio::select! {
                        frame = dispatch_rx.recv() => {
                            match frame {
                                Some(bytes) => {
                                    if let Err(e) = write_half.write_all(&bytes).await {
                                        warn!("endpoint write failed: {e}");
                                        break;
                                    }
                                }
                                None => {
                                    info!("dispatch channel closed, shutting down endpoint link");
                                    reader.abort();
                                    return;
                                }
                            }
                        }
                        result = &mut reader => {
                            let _ = result;
                            break;
                        }
                    }
                }
                reader.abort();
            }
            Err(e) => {
                warn!("endpoint connection failed: {e}");
            }
        }

        link_down.store(true, Ordering::Release);
        let jittered = jittered_backoff(backoff);
        debug!("reconnecting to endpoint in {:?}", jittered);
        tokio::time::sleep(jittered).await;
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

async fn reader_loop(
    stream: &mut (impl AsyncReadExt + Unpin),
    telemetry_slot: &Arc<ArcSwapOption<TelemetryFrame>>,
    stats: &Arc<EndpointStats>,
) {
    let mut buf = Vec::with_capacity(READ_BUF_SIZE);
    let mut scratch = [0u8; READ_BUF_SIZE];

    loop {
        let n = match stream.read(&mut scratch).await {
            Ok(0) => {
                info!("endpoint closed the connection");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("endpoint read error: {e}");
                return;
            }
        };
        buf.extend_from_slice(&scratch[..n]);

        loop {
            match TelemetryFrame::decode(&buf) {
                Ok(frame) => {
                    let consumed = frame.encoded_len();
                    buf.drain(..consumed);
                    telemetry_slot.store(Some(Arc::new(frame)));
                    stats.frames_decoded.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(crate::metrics::FRAMES_DECODED_TOTAL).increment(1);
                }
                Err(wire::WireError::TruncatedFrame) => break,
                Err(e) => {
                    stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(crate::metrics::FRAMES_REJECTED_TOTAL).increment(1);
                    debug!("bad frame ({e}), resynchronizing");
                    match wire::find_next_magic(&buf) {
                        Some(offset) if offset > 0 => {
                            buf.drain(..offset);
                            stats.resyncs.fetch_add(1, Ordering::Relaxed);
                            metrics::counter!(crate::metrics::ENDPOINT_RESYNCS_TOTAL).increment(1);
                        }
                        Some(_) => {
                            // Magic found at offset 0 but decode still failed
                            // (e.g. TooManyNodes/OutOfRangeSupply on an
                            // otherwise-valid-looking header): drop just the
                            // magic word so the scan makes forward progress.
                            buf.drain(..4);
                        }
                        None => {
                            buf.clear();
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn jittered_backoff(base: Duration) -> Duration {
    let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
    let millis = base.as_millis() as f64 * (1.0 + jitter_frac);
    Duration::from_millis(millis.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jittered_backoff_stays_within_twenty_percent() {
        for _ in 0..100 {
            let base = Duration::from_millis(1000);
            let out = jittered_backoff(base);
            assert!(out.as_millis() >= 800 && out.as_millis() <= 1200);
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut b = RECONNECT_BASE;
        for _ in 0..10 {
            b = (b * 2).min(RECONNECT_MAX);
        }
        assert_eq!(b, RECONNECT_MAX);
    }
}
