//! Reliable transport over a connected UDP socket
//!
//! `Rudp` assigns local counters, keeps sequenced frames in the resend
//! buffer until the console acknowledges them, acknowledges the console's
//! session and control frames, and hands every other frame to the owner
//! through `receive`. Datagrams that start with an AV marker bypass the
//! frame parser and go to the AV channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};

use super::crypto::StreamKeys;
use super::error::NetworkError;
use super::resend::{ResendBuffer, RESEND_BUFFER_SIZE};
use super::transport::UdpTransport;
use crate::protocol::av::av_datagram;
use crate::protocol::{RudpMessage, RudpType};

/// Frames buffered between the receive loop and `receive`
const INBOUND_QUEUE: usize = 64;

/// Counters remembered to drop retransmitted duplicates
const RECENT_WINDOW: usize = 64;

/// Range the first local counter is drawn from
const COUNTER_START_MIN: u16 = 0x01F4;
const COUNTER_START_MAX: u16 = 0x5FF4;

/// Result of a `receive` call that did not fail
#[derive(Debug)]
pub enum Received {
    Message(RudpMessage),
    Timeout,
}

/// Acknowledged message channel to one console
pub struct Rudp {
    transport: Arc<UdpTransport>,
    /// Next local counter; the lock also serializes all sends
    counter: tokio::sync::Mutex<u16>,
    /// Last local counter seen from the console
    remote_counter: AtomicU16,
    resend: Arc<ResendBuffer>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<RudpMessage>>,
    inbound_tx: mpsc::Sender<RudpMessage>,
    recent: Mutex<VecDeque<u16>>,
    av_tx: Option<mpsc::Sender<Bytes>>,
    av_dropped: AtomicU64,
    keys: OnceLock<StreamKeys>,
    last_send: Mutex<Instant>,
    cancel: CancellationToken,
    closing: AtomicBool,
    close_reason: Mutex<Option<String>>,
    span: tracing::Span,
}

impl std::fmt::Debug for Rudp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rudp")
            .field("local_addr", &self.transport.local_addr())
            .field("peer_addr", &self.transport.peer_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Rudp {
    /// Bind a reliable transport to an already connected socket and start
    /// its receive and resend tasks. AV datagrams are forwarded to `av_tx`
    /// when given, and dropped otherwise.
    pub fn open(
        transport: Arc<UdpTransport>,
        av_tx: Option<mpsc::Sender<Bytes>>,
        span: tracing::Span,
    ) -> Result<Arc<Self>, NetworkError> {
        let peer = transport.peer_addr().ok_or_else(|| {
            NetworkError::InvalidSocket(format!(
                "socket {} is not connected to a peer",
                transport.local_addr()
            ))
        })?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let start = rand::thread_rng().gen_range(COUNTER_START_MIN..COUNTER_START_MAX);
        let cancel = CancellationToken::new();
        let resend = Arc::new(ResendBuffer::new(RESEND_BUFFER_SIZE));

        let rudp = Arc::new(Self {
            transport: transport.clone(),
            counter: tokio::sync::Mutex::new(start),
            remote_counter: AtomicU16::new(0),
            resend: resend.clone(),
            inbound: tokio::sync::Mutex::new(inbound_rx),
            inbound_tx,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_WINDOW)),
            av_tx,
            av_dropped: AtomicU64::new(0),
            keys: OnceLock::new(),
            last_send: Mutex::new(Instant::now()),
            cancel: cancel.clone(),
            closing: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            span: span.clone(),
        });

        resend.spawn(transport.clone(), cancel.clone(), span.clone());
        tokio::spawn(receive_loop(Arc::downgrade(&rudp), transport, cancel).instrument(span));

        info!("Reliable transport opened to {}", peer);
        Ok(rudp)
    }

    pub fn transport(&self) -> &Arc<UdpTransport> {
        &self.transport
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Time of the most recent outbound frame
    pub fn last_send(&self) -> Instant {
        *self.last_send.lock()
    }

    /// AV datagrams dropped because the AV channel was full or absent
    pub fn av_dropped(&self) -> u64 {
        self.av_dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Counters still waiting for an acknowledgement
    pub async fn pending(&self) -> Vec<u16> {
        self.resend.pending().await
    }

    /// Install the stream keys once the key exchange has succeeded
    pub fn install_keys(&self, keys: StreamKeys) -> Result<(), NetworkError> {
        self.keys
            .set(keys)
            .map_err(|_| NetworkError::KeysAlreadyInstalled)
    }

    pub fn keys(&self) -> Option<&StreamKeys> {
        self.keys.get()
    }

    pub async fn send_init(&self, tag: u32) -> Result<u16, NetworkError> {
        self.send_sequenced(RudpType::InitRequest, &tag.to_be_bytes())
            .await
    }

    pub async fn send_cookie(&self, cookie: &[u8]) -> Result<u16, NetworkError> {
        self.send_sequenced(RudpType::CookieRequest, cookie).await
    }

    pub async fn send_session(&self, body: &[u8]) -> Result<u16, NetworkError> {
        self.send_sequenced(RudpType::SessionMessage, body).await
    }

    pub async fn send_ctrl(&self, body: &[u8]) -> Result<u16, NetworkError> {
        self.send_sequenced(RudpType::CtrlMessage, body).await
    }

    /// Send `payload` verbatim. Consumes a counter but is never resent.
    pub async fn send_raw(&self, payload: &[u8]) -> Result<u16, NetworkError> {
        self.ensure_open()?;
        let mut counter = self.counter.lock().await;
        let local = *counter;
        self.transmit(payload).await?;
        *counter = counter.wrapping_add(1);
        Ok(local)
    }

    /// Acknowledge `remote_counter`. With `resend`, the ack carries our own
    /// counter and stays in the resend buffer until the console acks it.
    pub async fn send_ack(&self, remote_counter: u16, resend: bool) -> Result<u16, NetworkError> {
        self.ensure_open()?;
        let mut counter = self.counter.lock().await;
        let local = *counter;

        let msg = if resend {
            RudpMessage::new(
                RudpType::Ack,
                Bytes::copy_from_slice(&local.to_be_bytes()),
                remote_counter,
            )
        } else {
            RudpMessage::ack(remote_counter)
        };
        let bytes = msg.to_bytes()?;
        self.transmit(&bytes).await?;
        *counter = counter.wrapping_add(1);

        if resend {
            self.resend.push(local, bytes).await?;
        }
        trace!("Acked remote counter {}", remote_counter);
        Ok(local)
    }

    /// Mark the frame `counter` as delivered. Returns the counters removed
    /// from the resend buffer.
    pub async fn ack_incoming(&self, counter: u16) -> Vec<u16> {
        self.resend.ack(counter).await
    }

    /// Wait for the next frame, the timeout, or the transport closing
    pub async fn receive(&self, timeout: Duration) -> Result<Received, NetworkError> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            message = inbound.recv() => match message {
                Some(message) => Ok(Received::Message(message)),
                None => Err(self.closed_error()),
            },
            _ = self.cancel.cancelled() => Err(self.closed_error()),
            _ = tokio::time::sleep(timeout) => Ok(Received::Timeout),
        }
    }

    /// Run the INIT / COOKIE exchange that opens the connection
    pub async fn connect(&self, timeout: Duration) -> Result<(), NetworkError> {
        let deadline = Instant::now() + timeout;

        let tag: u32 = rand::random();
        self.send_init(tag).await?;
        let init_response = self.wait_for(RudpType::InitResponse, deadline).await?;
        let body = init_response.body();
        if body.len() < 4 {
            return Err(NetworkError::InvalidPacket(
                crate::protocol::ProtocolError::Truncated {
                    needed: 4,
                    remaining: body.len(),
                },
            ));
        }
        let cookie = body.slice(4..);
        debug!("INIT_RESPONSE with {} byte cookie", cookie.len());

        self.send_cookie(&cookie).await?;
        self.wait_for(RudpType::CookieResponse, deadline).await?;

        info!("Transport connected to {:?}", self.transport.peer_addr());
        Ok(())
    }

    async fn wait_for(
        &self,
        kind: RudpType,
        deadline: Instant,
    ) -> Result<RudpMessage, NetworkError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(NetworkError::ConnectionTimeout);
            }
            match self.receive(remaining).await? {
                Received::Message(msg) if msg.kind == kind => return Ok(msg),
                Received::Message(msg) if msg.kind == RudpType::Finish => {
                    warn!("Console finished the connection during connect");
                    return Err(NetworkError::ConnectionRefused);
                }
                Received::Message(msg) => {
                    debug!("Ignoring {:?} while waiting for {:?}", msg.kind, kind);
                }
                Received::Timeout => return Err(NetworkError::ConnectionTimeout),
            }
        }
    }

    /// Stop the background tasks and release the socket. Safe to call more
    /// than once.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        info!("Reliable transport closed");
    }

    async fn send_sequenced(&self, kind: RudpType, body: &[u8]) -> Result<u16, NetworkError> {
        self.ensure_open()?;
        let mut counter = self.counter.lock().await;
        let local = *counter;

        let msg = RudpMessage::sequenced(kind, local, body, self.remote_counter.load(Ordering::Acquire));
        let bytes = msg.to_bytes()?;
        self.transmit(&bytes).await?;
        *counter = counter.wrapping_add(1);

        trace!("Sent {:?} with counter {}", kind, local);
        self.resend.push(local, bytes).await?;
        Ok(local)
    }

    async fn transmit(&self, data: &[u8]) -> Result<(), NetworkError> {
        if let Err(e) = self.transport.send(data).await {
            self.fail(format!("send failed: {}", e));
            return Err(e);
        }
        *self.last_send.lock() = Instant::now();
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), NetworkError> {
        if self.is_closed() {
            Err(self.closed_error())
        } else {
            Ok(())
        }
    }

    /// Close because of a fatal condition, keeping the first reason
    fn fail(&self, reason: String) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                error!("Reliable transport failed: {}", reason);
                *slot = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    fn closed_error(&self) -> NetworkError {
        if let Some(reason) = self.close_reason.lock().clone() {
            return NetworkError::TransportClosed(reason);
        }
        if self.resend.peer_unresponsive() {
            return NetworkError::TransportClosed("peer unresponsive".to_string());
        }
        if self.closing.load(Ordering::Acquire) {
            NetworkError::Stopped
        } else {
            NetworkError::TransportClosed("closed".to_string())
        }
    }

    async fn handle_datagram(&self, data: Bytes) {
        let is_av = match av_datagram(&data) {
            Ok(is_av) => is_av,
            Err(e) => {
                debug!("Dropping short AV datagram: {}", e);
                self.av_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if is_av {
            let forwarded = match &self.av_tx {
                Some(tx) => tx.try_send(data).is_ok(),
                None => false,
            };
            if !forwarded {
                self.av_dropped.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        let message = match RudpMessage::from_bytes(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed frame ({} bytes): {}", data.len(), e);
                return;
            }
        };

        let mut frame = Some(message);
        while let Some(mut current) = frame {
            frame = current.sub_message.take().map(|sub| *sub);
            self.handle_frame(current).await;
        }
    }

    async fn handle_frame(&self, frame: RudpMessage) {
        if frame.kind.acknowledges() {
            self.ack_incoming(frame.remote_counter).await;
        }
        if frame.kind == RudpType::Ack {
            // A resendable ack carries the console's counter and wants one back
            if frame.payload.len() >= 2 {
                let counter = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
                if let Err(e) = self.send_ack(counter, false).await {
                    debug!("Could not ack console ack {}: {}", counter, e);
                }
            }
            return;
        }

        if let Some(counter) = frame.local_counter() {
            self.remote_counter.store(counter, Ordering::Release);

            if matches!(frame.kind, RudpType::SessionMessage | RudpType::CtrlMessage) {
                if let Err(e) = self.send_ack(counter, false).await {
                    debug!("Could not ack counter {}: {}", counter, e);
                }
                if !self.remember(counter) {
                    trace!("Duplicate {:?} {}, not delivered again", frame.kind, counter);
                    return;
                }
            }
        }

        if self.inbound_tx.send(frame).await.is_err() {
            trace!("Inbound queue closed");
        }
    }

    /// Record a delivered counter. False if it was already delivered.
    fn remember(&self, counter: u16) -> bool {
        let mut recent = self.recent.lock();
        if recent.contains(&counter) {
            return false;
        }
        if recent.len() >= RECENT_WINDOW {
            recent.pop_front();
        }
        recent.push_back(counter);
        true
    }
}

impl Drop for Rudp {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn receive_loop(rudp: Weak<Rudp>, transport: Arc<UdpTransport>, cancel: CancellationToken) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = transport.recv() => result,
        };
        let Some(rudp) = rudp.upgrade() else {
            break;
        };
        match result {
            Ok(data) => rudp.handle_datagram(data).await,
            Err(e) => {
                rudp.fail(format!("receive failed: {}", e));
                break;
            }
        }
    }
    debug!("Receive loop stopped");
}

/// Build a sequenced frame body with a leading 32-bit tag, as used by the
/// console's INIT_RESPONSE
pub fn init_response_body(tag: u32, cookie: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(4 + cookie.len());
    body.put_u32(tag);
    body.put_slice(cookie);
    body.freeze()
}
