//! Controller feedback sender
//!
//! Sends the host's controller state to the console: within 10 ms of a
//! change and at least every 200 ms otherwise. The active flag and the
//! send share one lock so deactivating never races a send in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

use super::av::RawPath;
use super::error::NetworkError;
use super::rudp::Rudp;
use crate::protocol::av::feedback_datagram;
use crate::protocol::{ControllerState, CtrlMessage, TakionMessage};

/// Minimum spacing between two state packets
pub const FEEDBACK_MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Longest time without a state packet
pub const FEEDBACK_MAX_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct Gate {
    active: bool,
    sequence: u16,
    key_pos: u32,
}

pub struct FeedbackSender {
    rudp: Arc<Rudp>,
    path: RawPath,
    state: watch::Receiver<ControllerState>,
    ps5: bool,
    enable_dualsense: bool,
    gate: Mutex<Gate>,
    muted: AtomicBool,
    cancel: CancellationToken,
}

impl FeedbackSender {
    pub fn new(
        rudp: Arc<Rudp>,
        path: RawPath,
        state: watch::Receiver<ControllerState>,
        ps5: bool,
        enable_dualsense: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            rudp,
            path,
            state,
            ps5,
            enable_dualsense,
            gate: Mutex::new(Gate {
                active: true,
                sequence: 0,
                key_pos: 0,
            }),
            muted: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        })
    }

    pub async fn set_active(&self, active: bool) {
        let mut gate = self.gate.lock().await;
        if gate.active != active {
            debug!("Feedback sender {}", if active { "enabled" } else { "disabled" });
        }
        gate.active = active;
    }

    pub async fn is_active(&self) -> bool {
        self.gate.lock().await.active
    }

    /// Encrypt and send one state snapshot. Returns false if inactive.
    pub async fn send_state(&self, state: &ControllerState) -> Result<bool, NetworkError> {
        let mut gate = self.gate.lock().await;
        if !gate.active {
            return Ok(false);
        }
        let keys = self.rudp.keys().ok_or(NetworkError::KeysMissing)?;

        let mut buf = state.encode(self.ps5, self.enable_dualsense);
        keys.local.encrypt(u64::from(gate.key_pos), &mut buf)?;
        let datagram = feedback_datagram(gate.sequence, gate.key_pos, &buf);
        self.path.send(&datagram).await?;

        trace!("Feedback state {} sent", gate.sequence);
        gate.sequence = gate.sequence.wrapping_add(1);
        gate.key_pos = gate.key_pos.wrapping_add(buf.len() as u32);
        Ok(true)
    }

    /// Flip the microphone mute state and tell the console. Returns the new
    /// state.
    pub async fn toggle_mute(&self) -> Result<bool, NetworkError> {
        let muted = !self.muted.load(Ordering::Acquire);
        match self
            .rudp
            .send_ctrl(&CtrlMessage::mic_toggle(muted).to_bytes())
            .await
        {
            Ok(_) => {}
            // The toggle went out; only its retransmission is in doubt
            Err(e) if !e.is_fatal() => warn!("Mute toggle sent with a full resend buffer: {}", e),
            Err(e) => return Err(e),
        }
        self.muted.store(muted, Ordering::Release);
        info!("Microphone {}", if muted { "muted" } else { "unmuted" });
        Ok(muted)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Report a range of video frames that could not be decoded
    pub async fn report_corrupt_frame(&self, start: u32, end: u32) -> Result<(), NetworkError> {
        let body = TakionMessage::CorruptFrame { start, end }.to_body()?;
        self.rudp.send_session(&body).await?;
        debug!("Reported corrupt frames {}..={}", start, end);
        Ok(())
    }

    /// Ask the console for a fresh key frame
    pub async fn request_idr(&self) -> Result<(), NetworkError> {
        let body = TakionMessage::IdrRequest.to_body()?;
        self.rudp.send_session(&body).await?;
        debug!("Requested IDR frame");
        Ok(())
    }

    /// Spawn the periodic sender
    pub fn spawn(self: &Arc<Self>, span: tracing::Span) -> JoinHandle<()> {
        let sender = self.clone();
        tokio::spawn(async move { sender.run().await }.instrument(span))
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn run(&self) {
        let mut state = self.state.clone();
        let mut last_sent = Instant::now();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let since = last_sent.elapsed();
                    if since < FEEDBACK_MIN_INTERVAL {
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = sleep(FEEDBACK_MIN_INTERVAL - since) => {}
                        }
                    }
                }
                _ = sleep_until(last_sent + FEEDBACK_MAX_INTERVAL) => {}
            }

            let snapshot = *state.borrow_and_update();
            match self.send_state(&snapshot).await {
                Ok(_) => {}
                Err(NetworkError::KeysMissing) => trace!("Feedback before key exchange skipped"),
                Err(e) if e.is_fatal() => {
                    warn!("Feedback sender stopping: {}", e);
                    break;
                }
                Err(e) => warn!("Feedback send: {}", e),
            }
            last_sent = Instant::now();
        }
        debug!("Feedback sender stopped");
    }
}

impl Drop for FeedbackSender {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
