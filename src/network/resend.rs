//! Resend buffer for sequenced frames
//!
//! Holds every frame that still waits for an acknowledgement and
//! retransmits it from a background task. Acknowledgement and
//! retransmission take the same lock, so a frame is never resent while it
//! is being removed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn, Instrument};

use super::error::NetworkError;
use super::transport::UdpTransport;

/// Number of unacknowledged frames kept
pub const RESEND_BUFFER_SIZE: usize = 16;

/// Time after which an unacknowledged frame is sent again
pub const RESEND_TIMEOUT: Duration = Duration::from_millis(400);

/// Interval at which the resend task checks the buffer
pub const RESEND_WAKEUP: Duration = Duration::from_millis(200);

/// Transmissions after which the peer is considered unresponsive
pub const RESEND_MAX_TRIES: u32 = 10;

#[derive(Debug)]
struct Entry {
    seq: u16,
    data: Bytes,
    last_sent: Instant,
    tries: u32,
}

/// Outcome of one pass over the buffer
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ResendPass {
    pub resent: Vec<u16>,
    /// First frame that ran out of tries, if any
    pub exhausted: Option<u16>,
}

/// Bounded window of unacknowledged frames
#[derive(Debug)]
pub struct ResendBuffer {
    entries: Mutex<VecDeque<Entry>>,
    capacity: usize,
    notify: Notify,
    peer_unresponsive: AtomicBool,
}

impl ResendBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            peer_unresponsive: AtomicBool::new(false),
        }
    }

    /// Register a frame that was just transmitted.
    ///
    /// When the window is full the oldest frame is evicted to make room and
    /// the eviction is reported as `SendBufferFull`; the new frame is kept.
    pub async fn push(&self, seq: u16, data: Bytes) -> Result<(), NetworkError> {
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.seq == seq) {
            return Err(NetworkError::DuplicateSequence(seq));
        }

        let evicted = if entries.len() >= self.capacity {
            entries.pop_front().map(|e| e.seq)
        } else {
            None
        };

        entries.push_back(Entry {
            seq,
            data,
            last_sent: Instant::now(),
            tries: 1,
        });
        drop(entries);
        self.notify.notify_one();

        match evicted {
            Some(evicted) => {
                warn!("Resend buffer full, evicted unacknowledged frame {}", evicted);
                Err(NetworkError::SendBufferFull { evicted })
            }
            None => Ok(()),
        }
    }

    /// Remove the frame acknowledged by `seq`, and only that frame.
    /// Returns the counters that were removed.
    pub async fn ack(&self, seq: u16) -> Vec<u16> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.seq != seq);
        if entries.len() == before {
            trace!("Ack for {} matches nothing pending", seq);
            Vec::new()
        } else {
            trace!("Frame {} acknowledged", seq);
            vec![seq]
        }
    }

    /// Counters still waiting for an acknowledgement, oldest first
    pub async fn pending(&self) -> Vec<u16> {
        self.entries.lock().await.iter().map(|e| e.seq).collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub fn peer_unresponsive(&self) -> bool {
        self.peer_unresponsive.load(Ordering::Acquire)
    }

    /// Retransmit every frame whose last transmission is older than
    /// `RESEND_TIMEOUT` at `now`. The lock is held across the sends.
    pub async fn resend_due(
        &self,
        transport: &UdpTransport,
        now: Instant,
    ) -> Result<ResendPass, NetworkError> {
        let mut pass = ResendPass::default();
        let mut entries = self.entries.lock().await;
        for entry in entries.iter_mut() {
            if now.saturating_duration_since(entry.last_sent) < RESEND_TIMEOUT {
                continue;
            }
            if entry.tries >= RESEND_MAX_TRIES {
                if pass.exhausted.is_none() {
                    pass.exhausted = Some(entry.seq);
                }
                continue;
            }
            transport.send(&entry.data).await?;
            entry.last_sent = now;
            entry.tries += 1;
            pass.resent.push(entry.seq);
        }
        drop(entries);

        if !pass.resent.is_empty() {
            debug!("Resent frames {:?}", pass.resent);
        }
        if pass.exhausted.is_some() {
            self.peer_unresponsive.store(true, Ordering::Release);
        }
        Ok(pass)
    }

    /// Spawn the background resend task. It sleeps on the buffer's notify
    /// while empty and stops when `cancel` fires. Running out of tries or a
    /// socket error cancels `cancel` so the owning transport closes.
    pub fn spawn(
        self: Arc<Self>,
        transport: Arc<UdpTransport>,
        cancel: CancellationToken,
        span: tracing::Span,
    ) -> JoinHandle<()> {
        tokio::spawn(
            async move {
                loop {
                    if self.is_empty().await {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = self.notify.notified() => {}
                        }
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RESEND_WAKEUP) => {}
                    }

                    match self.resend_due(&transport, Instant::now()).await {
                        Ok(ResendPass {
                            exhausted: Some(seq),
                            ..
                        }) => {
                            error!(
                                "Frame {} unacknowledged after {} tries, peer unresponsive",
                                seq, RESEND_MAX_TRIES
                            );
                            cancel.cancel();
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("Resend failed: {}", e);
                            cancel.cancel();
                            break;
                        }
                    }
                }
                debug!("Resend task stopped");
            }
            .instrument(span),
        )
    }
}
