//! AV packet path
//!
//! Inbound video, audio and haptics datagrams are decrypted with the
//! remote keystream and handed to the host as `AvFrame`s. Outbound raw
//! datagrams (feedback, congestion reports) leave through `RawPath`: the
//! control transport on a LAN, the separate data socket after a holepunch.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument};

use super::congestion::PacketStats;
use super::error::NetworkError;
use super::rudp::Rudp;
use super::transport::UdpTransport;
use crate::protocol::{AvKind, AvPacket};

/// Decrypted AV payload for the decoder collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvFrame {
    pub kind: AvKind,
    pub packet_index: u16,
    pub frame_index: u16,
    pub payload: Bytes,
}

/// Where raw datagrams are sent
#[derive(Debug, Clone)]
pub enum RawPath {
    Control(Arc<Rudp>),
    Data(Arc<UdpTransport>),
}

impl RawPath {
    pub async fn send(&self, data: &[u8]) -> Result<(), NetworkError> {
        match self {
            RawPath::Control(rudp) => rudp.send_raw(data).await.map(|_| ()),
            RawPath::Data(transport) => transport.send(data).await,
        }
    }
}

/// Decrypt one inbound datagram. Returns `None` for datagrams that are
/// not AV packets, could not be parsed, or arrived before the keys.
pub fn open_av_datagram(rudp: &Rudp, stats: &PacketStats, data: &Bytes) -> Option<AvFrame> {
    let packet = match AvPacket::parse(data) {
        Ok(packet) => packet,
        Err(e) => {
            trace!("Ignoring non-AV datagram: {}", e);
            return None;
        }
    };

    let Some(keys) = rudp.keys() else {
        stats.record_undecryptable();
        trace!("AV packet before key exchange dropped");
        return None;
    };

    let mut payload = BytesMut::from(&packet.payload[..]);
    if let Err(e) = keys.remote.decrypt(packet.decrypt_position(), &mut payload) {
        warn!("Failed to decrypt AV packet {}: {}", packet.packet_index, e);
        return None;
    }
    stats.record(packet.kind, packet.packet_index);

    Some(AvFrame {
        kind: packet.kind,
        packet_index: packet.packet_index,
        frame_index: packet.frame_index,
        payload: payload.freeze(),
    })
}

/// Spawn the task turning raw AV datagrams into frames for the host
pub fn spawn_av_receiver(
    rudp: Arc<Rudp>,
    mut datagrams: mpsc::Receiver<Bytes>,
    stats: Arc<PacketStats>,
    frames: Option<mpsc::Sender<AvFrame>>,
    cancel: CancellationToken,
    span: tracing::Span,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                let data = tokio::select! {
                    _ = cancel.cancelled() => break,
                    data = datagrams.recv() => match data {
                        Some(data) => data,
                        None => break,
                    },
                };
                let Some(frame) = open_av_datagram(&rudp, &stats, &data) else {
                    continue;
                };
                if let Some(frames) = &frames {
                    if frames.try_send(frame).is_err() {
                        trace!("AV frame dropped, host not keeping up");
                    }
                }
            }
            debug!("AV receiver stopped");
        }
        .instrument(span),
    )
}

/// Spawn the receive loop of a holepunched data socket. Its datagrams join
/// the same AV channel the control transport feeds on a LAN.
pub fn spawn_data_socket_loop(
    transport: Arc<UdpTransport>,
    datagrams: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    span: tracing::Span,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = transport.recv() => result,
                };
                match result {
                    Ok(data) => {
                        if datagrams.try_send(data).is_err() {
                            trace!("Data socket datagram dropped");
                        }
                    }
                    Err(e) => {
                        warn!("Data socket receive failed: {}", e);
                        break;
                    }
                }
            }
            debug!("Data socket loop stopped");
        }
        .instrument(span),
    )
}
