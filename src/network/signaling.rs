//! Relay signaling channel for internet-mode holepunching
//!
//! The relay registers a remote-play session, tells us when members join
//! and forwards session messages (offers, results, accepts) between us and
//! the console. The websocket is owned by a background task; the
//! holepunch coordinator only sees a pair of channels, which tests replace
//! with an in-memory relay.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};
use uuid::Uuid;

use super::error::HolepunchError;

/// Scopes the access token must grant
pub const REQUIRED_SCOPES: &[&str] = &[
    "psn:clientapp",
    "referenceDataService:countryConfig.read",
    "pushNotification:webSocket.desktop.connect",
    "sessionManager:remotePlaySession.system.update",
];

/// OAuth access token handed in by the login collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub scopes: Vec<String>,
}

impl AccessToken {
    /// Build from the token and its space separated scope string
    pub fn new(value: impl Into<String>, scope: &str) -> Self {
        Self {
            value: value.into(),
            scopes: scope.split_whitespace().map(str::to_string).collect(),
        }
    }

    /// Fails with the first required scope the token lacks
    pub fn check_scopes(&self) -> Result<(), HolepunchError> {
        match REQUIRED_SCOPES
            .iter()
            .find(|required| !self.scopes.iter().any(|s| s == *required))
        {
            Some(missing) => Err(HolepunchError::MissingScope(missing.to_string())),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CandidateKind {
    Static,
    Local,
}

/// Address a peer offers to be reached on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(rename = "type")]
    pub kind: CandidateKind,
    pub addr: IpAddr,
    pub mapped_addr: IpAddr,
    pub port: u16,
    pub mapped_port: u16,
}

impl Candidate {
    pub fn new(kind: CandidateKind, addr: IpAddr, port: u16) -> Self {
        Self {
            kind,
            addr,
            mapped_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            mapped_port: 0,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

/// Connection parameters attached to offers and accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub sid: u32,
    pub peer_sid: u32,
    #[serde(with = "base64_array")]
    pub skey: [u8; 16],
    pub nat_type: u8,
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub default_route_mac: String,
    #[serde(with = "base64_array")]
    pub local_hashed_id: [u8; 20],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionAction {
    Offer,
    Result,
    Accept,
    Terminate,
}

/// Message exchanged with the console through the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub action: SessionAction,
    pub req_id: u32,
    #[serde(default)]
    pub error: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_request: Option<ConnectionRequest>,
}

impl SessionMessage {
    /// Acknowledge the console's message `req_id`
    pub fn result(req_id: u32) -> Self {
        Self {
            action: SessionAction::Result,
            req_id,
            error: 0,
            conn_request: None,
        }
    }
}

/// Relay protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RelayMessage {
    // Client -> Relay
    CreateSession {
        push_context_id: Uuid,
        client_duid: String,
    },
    StartSession {
        session_id: String,
        console_duid: String,
        console_type: u8,
    },
    SendMessage {
        session_id: String,
        message: SessionMessage,
    },
    DeleteSession {
        session_id: String,
    },

    // Relay -> Client
    SessionCreated {
        session_id: String,
    },
    MemberJoined {
        device_unique_id: String,
    },
    CustomData1 {
        #[serde(with = "base64_array")]
        data: [u8; 16],
    },
    MessageReceived {
        message: SessionMessage,
    },
    MemberDeleted,
    Error {
        code: u32,
        reason: String,
    },
}

/// Channels to the relay. `stop` ends the background task owning the
/// websocket, if there is one.
#[derive(Debug)]
pub struct SignalingChannel {
    pub outbound: mpsc::UnboundedSender<RelayMessage>,
    pub inbound: mpsc::UnboundedReceiver<RelayMessage>,
    pub stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Relay side of an in-memory channel
#[derive(Debug)]
pub struct RelayEnd {
    pub to_client: mpsc::UnboundedSender<RelayMessage>,
    pub from_client: mpsc::UnboundedReceiver<RelayMessage>,
}

impl SignalingChannel {
    /// Open the relay websocket and spawn the task that owns it
    pub async fn connect(
        url: &str,
        token: &AccessToken,
        span: tracing::Span,
    ) -> Result<Self, HolepunchError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| HolepunchError::Signaling(format!("Invalid relay URL: {}", e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token.value))
            .map_err(|e| HolepunchError::Signaling(format!("Invalid token: {}", e)))?;
        request.headers_mut().insert("Authorization", bearer);

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| HolepunchError::Signaling(format!("Connect failed: {}", e)))?;
        info!("Connected to relay {}", url);

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<RelayMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let task_stop = stop.clone();
        let task = tokio::spawn(
            async move {
                let (mut write, mut read) = ws_stream.split();
                loop {
                    tokio::select! {
                        _ = task_stop.cancelled() => break,
                        msg = outbound_rx.recv() => {
                            let Some(msg) = msg else { break };
                            let json = match serde_json::to_string(&msg) {
                                Ok(json) => json,
                                Err(e) => {
                                    warn!("Failed to serialize relay message: {}", e);
                                    continue;
                                }
                            };
                            trace!("Relay <- {}", json);
                            if let Err(e) = write.send(Message::Text(json)).await {
                                warn!("Relay send failed: {}", e);
                                break;
                            }
                        }
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                trace!("Relay -> {}", text);
                                match serde_json::from_str::<RelayMessage>(&text) {
                                    Ok(msg) => {
                                        if inbound_tx.send(msg).is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => warn!("Invalid relay message: {}", e),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!("Relay closed the connection");
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("Relay websocket error: {}", e);
                                break;
                            }
                            _ => {}
                        }
                    }
                }
                let _ = write.send(Message::Close(None)).await;
                debug!("Signaling task stopped");
            }
            .instrument(span),
        );

        Ok(Self {
            outbound: outbound_tx,
            inbound: inbound_rx,
            stop,
            task: Some(task),
        })
    }

    /// Channel pair without a websocket behind it
    pub fn in_memory() -> (Self, RelayEnd) {
        let (to_relay, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        (
            Self {
                outbound: to_relay,
                inbound,
                stop: CancellationToken::new(),
                task: None,
            },
            RelayEnd {
                to_client,
                from_client,
            },
        )
    }

    /// Take the websocket task handle, if one was spawned
    pub fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }
}

mod base64_array {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let decoded = STANDARD.decode(encoded).map_err(D::Error::custom)?;
        decoded.try_into().map_err(|v: Vec<u8>| {
            D::Error::custom(format!("expected {} bytes, got {}", N, v.len()))
        })
    }
}
