//! Holepunch coordinator for internet-mode sessions
//!
//! Registers a session with the relay, binds it to a console, then runs two
//! punch rounds (control socket, then data socket). Each round exchanges
//! offers with the console through the relay and checks every candidate
//! the console advertised with 88-byte request/response datagrams.
//!
//! `cancel` may be called from any task: every wait selects on the cancel
//! token and the state lives outside the relay receiver lock.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{HolepunchError, NetworkError};
use super::signaling::{
    AccessToken, Candidate, CandidateKind, ConnectionRequest, RelayMessage, SessionAction,
    SessionMessage, SignalingChannel,
};
use super::stun;
use super::transport::UdpTransport;

/// Prefix of the device id we register with
pub const CLIENT_DUID_PREFIX: &str = "0000000700410080";

const MSG_TYPE_REQ: u32 = 0x0600_0000;
const MSG_TYPE_RESP: u32 = 0x0700_0000;
const CHECK_MSG_SIZE: usize = 88;
const OFFSET_LOCAL_HASHED_ID: usize = 0x04;
const OFFSET_CONSOLE_HASHED_ID: usize = 0x24;
const OFFSET_SID_LOCAL: usize = 0x44;
const OFFSET_SID_CONSOLE: usize = 0x46;
const OFFSET_REQUEST_ID: usize = 0x4b;
const REQUEST_ID_SIZE: usize = 5;
const OFFSET_CONFIRM_ADDR: usize = 0x51;
const OFFSET_CONFIRM_PORT: usize = 0x55;

const NAT_TYPE_LOCAL: u8 = 0;
const NAT_TYPE_STATIC: u8 = 2;

/// Interface attributes, one directory per network interface
const SYSFS_NET: &str = "/sys/class/net";

/// Interval between repeated candidate requests
const CHECK_REPEAT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HolepunchState {
    Init,
    Created,
    Started,
    CtrlPunched,
    DataPunched,
    Finished,
    Failed,
}

impl HolepunchState {
    pub fn name(self) -> &'static str {
        match self {
            HolepunchState::Init => "Init",
            HolepunchState::Created => "Created",
            HolepunchState::Started => "Started",
            HolepunchState::CtrlPunched => "CtrlPunched",
            HolepunchState::DataPunched => "DataPunched",
            HolepunchState::Finished => "Finished",
            HolepunchState::Failed => "Failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, HolepunchState::Finished | HolepunchState::Failed)
    }
}

/// Console family. The value is what the relay expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleType {
    Ps4 = 0,
    Ps5 = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Control,
    Data,
}

/// Waits of the holepunch sequence
#[derive(Debug, Clone)]
pub struct HolepunchConfig {
    pub create_timeout: Duration,
    pub start_timeout: Duration,
    pub candidate_timeout: Duration,
    pub delete_timeout: Duration,
    pub stun_servers: Vec<String>,
}

impl Default for HolepunchConfig {
    fn default() -> Self {
        Self {
            create_timeout: Duration::from_secs(30),
            start_timeout: Duration::from_secs(30),
            candidate_timeout: Duration::from_secs(10),
            delete_timeout: Duration::from_secs(30),
            stun_servers: stun::DEFAULT_STUN_SERVERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Default)]
struct Peer {
    session_id: Option<String>,
    console_duid: Option<String>,
    console_type: Option<ConsoleType>,
    console_hashed_id: [u8; 20],
    sid_console: u16,
    custom_data1: Option<[u8; 16]>,
    local_req_id: u32,
    local_addr: Option<IpAddr>,
    mapped_addr: Option<IpAddr>,
    default_route_mac: Option<[u8; 6]>,
    ctrl_addr: Option<SocketAddr>,
    data_addr: Option<SocketAddr>,
}

/// Internet-mode holepunch session
pub struct HolepunchSession {
    state: watch::Sender<HolepunchState>,
    peer: Mutex<Peer>,
    outbound: mpsc::UnboundedSender<RelayMessage>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<RelayMessage>>,
    signaling_stop: CancellationToken,
    cancel: CancellationToken,
    config: HolepunchConfig,
    client_duid: String,
    push_context_id: Uuid,
    sid_local: u16,
    hashed_id_local: [u8; 20],
}

impl HolepunchSession {
    /// Check the token and open the relay websocket
    pub async fn init(
        token: &AccessToken,
        relay_url: &str,
        config: HolepunchConfig,
        span: tracing::Span,
    ) -> Result<Self, HolepunchError> {
        token.check_scopes()?;
        let channel = SignalingChannel::connect(relay_url, token, span).await?;
        Ok(Self::with_channel(channel, config))
    }

    /// Coordinator over an already opened relay channel
    pub fn with_channel(channel: SignalingChannel, config: HolepunchConfig) -> Self {
        let (state, _) = watch::channel(HolepunchState::Init);
        let duid_suffix: [u8; 16] = rand::random();
        Self {
            state,
            peer: Mutex::new(Peer {
                local_req_id: 1,
                ..Peer::default()
            }),
            outbound: channel.outbound,
            inbound: tokio::sync::Mutex::new(channel.inbound),
            signaling_stop: channel.stop,
            cancel: CancellationToken::new(),
            config,
            client_duid: format!("{}{}", CLIENT_DUID_PREFIX, hex::encode(duid_suffix)),
            push_context_id: Uuid::new_v4(),
            sid_local: rand::random(),
            hashed_id_local: rand::random(),
        }
    }

    pub fn state(&self) -> HolepunchState {
        *self.state.borrow()
    }

    /// Follow state changes, e.g. for progress reporting
    pub fn subscribe(&self) -> watch::Receiver<HolepunchState> {
        self.state.subscribe()
    }

    pub fn client_duid(&self) -> &str {
        &self.client_duid
    }

    pub fn session_id(&self) -> Option<String> {
        self.peer.lock().session_id.clone()
    }

    /// Opaque 16 bytes the console publishes when it joins
    pub fn custom_data1(&self) -> Option<[u8; 16]> {
        self.peer.lock().custom_data1
    }

    /// Console addresses selected by the punch rounds
    pub fn punched_addrs(&self) -> (Option<SocketAddr>, Option<SocketAddr>) {
        let peer = self.peer.lock();
        (peer.ctrl_addr, peer.data_addr)
    }

    /// Register a new session with the relay and wait until it exists and
    /// we are a member of it
    pub async fn create(&self) -> Result<(), HolepunchError> {
        self.expect_state(HolepunchState::Init)?;
        let result = self.create_inner().await;
        self.settle(result, HolepunchState::Created)
    }

    async fn create_inner(&self) -> Result<(), HolepunchError> {
        self.send(RelayMessage::CreateSession {
            push_context_id: self.push_context_id,
            client_duid: self.client_duid.clone(),
        })?;
        debug!("Sent session creation request");

        let deadline = Instant::now() + self.config.create_timeout;
        let mut session_id = None;
        let mut joined = false;
        while session_id.is_none() || !joined {
            match self.next_message(deadline, "session creation", true).await? {
                RelayMessage::SessionCreated { session_id: id } => {
                    info!("Holepunch session {} created", id);
                    session_id = Some(id);
                }
                RelayMessage::MemberJoined { device_unique_id }
                    if device_unique_id.eq_ignore_ascii_case(&self.client_duid) =>
                {
                    debug!("Client joined the session");
                    joined = true;
                }
                other => debug!("Ignoring relay message during creation: {:?}", other),
            }
        }
        self.peer.lock().session_id = session_id;
        Ok(())
    }

    /// Best-effort discovery of our LAN address and public mapping. Missing
    /// addresses only shrink the candidate set. Returns how many were found.
    pub async fn discover_local_candidates(&self) -> usize {
        let local_addr = match local_ip_address::local_ip() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!("No local interface address: {}", e);
                None
            }
        };

        let mapped_addr = match UdpTransport::bind_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))) {
            Ok(socket) => self.stun_mapping(&socket).await.map(|addr| addr.ip()),
            Err(e) => {
                warn!("Could not bind STUN socket: {}", e);
                None
            }
        };

        let default_route_mac = local_addr.and_then(interface_mac);
        if default_route_mac.is_none() {
            debug!("No hardware address for {:?}", local_addr);
        }

        let mut peer = self.peer.lock();
        peer.local_addr = local_addr;
        peer.mapped_addr = mapped_addr;
        peer.default_route_mac = default_route_mac;
        info!(
            "Local candidates: local {:?}, mapped {:?}",
            local_addr, mapped_addr
        );
        usize::from(local_addr.is_some()) + usize::from(mapped_addr.is_some())
    }

    /// Bind the session to a console and wait for it to join
    pub async fn start(
        &self,
        console_duid: &[u8; 32],
        console_type: ConsoleType,
    ) -> Result<(), HolepunchError> {
        self.expect_state(HolepunchState::Created)?;
        let result = self.start_inner(console_duid, console_type).await;
        self.settle(result, HolepunchState::Started)
    }

    async fn start_inner(
        &self,
        console_duid: &[u8; 32],
        console_type: ConsoleType,
    ) -> Result<(), HolepunchError> {
        let duid = hex::encode(console_duid);
        let session_id = self.require_session_id()?;
        {
            let mut peer = self.peer.lock();
            peer.console_duid = Some(duid.clone());
            peer.console_type = Some(console_type);
        }
        info!("Starting session {} for console {}", session_id, duid);
        self.send(RelayMessage::StartSession {
            session_id,
            console_duid: duid.clone(),
            console_type: console_type as u8,
        })?;

        let deadline = Instant::now() + self.config.start_timeout;
        let mut console_joined = false;
        let mut custom_data1 = None;
        while !console_joined || custom_data1.is_none() {
            match self.next_message(deadline, "session start", true).await? {
                RelayMessage::MemberJoined { device_unique_id } => {
                    if device_unique_id.eq_ignore_ascii_case(&duid) {
                        console_joined = true;
                    } else if !device_unique_id.eq_ignore_ascii_case(&self.client_duid) {
                        return Err(HolepunchError::Signaling(format!(
                            "unexpected member {} joined",
                            device_unique_id
                        )));
                    }
                }
                RelayMessage::CustomData1 { data } => custom_data1 = Some(data),
                other => debug!("Ignoring relay message during start: {:?}", other),
            }
        }
        self.peer.lock().custom_data1 = custom_data1;
        Ok(())
    }

    /// Run one punch round and return a socket connected to the console.
    /// `Data` fails fast unless `Control` already succeeded.
    pub async fn punch(&self, kind: PortKind) -> Result<Arc<UdpTransport>, HolepunchError> {
        let (required, next) = match kind {
            PortKind::Control => (HolepunchState::Started, HolepunchState::CtrlPunched),
            PortKind::Data => (HolepunchState::CtrlPunched, HolepunchState::DataPunched),
        };
        let state = self.state();
        if kind == PortKind::Data && state < HolepunchState::CtrlPunched {
            return Err(HolepunchError::DataBeforeControl);
        }
        self.expect_state(required)?;

        info!("Punching {:?} port", kind);
        let result = self.punch_round().await;
        let transport = match result {
            Ok(transport) => transport,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        let addr = transport.peer_addr();
        {
            let mut peer = self.peer.lock();
            match kind {
                PortKind::Control => peer.ctrl_addr = addr,
                PortKind::Data => peer.data_addr = addr,
            }
        }
        self.set_state(next);
        info!("{:?} port punched, console at {:?}", kind, addr);
        Ok(transport)
    }

    /// Abort any wait in progress. Safe from any task at any time.
    pub fn cancel(&self, stop_signaling: bool) {
        debug!("Holepunch cancelled (stop signaling: {})", stop_signaling);
        self.cancel.cancel();
        if stop_signaling {
            self.signaling_stop.cancel();
        }
    }

    /// Delete the remote session and stop the relay task. Idempotent.
    pub async fn fini(&self) -> Result<(), HolepunchError> {
        if self.state() == HolepunchState::Finished {
            return Ok(());
        }

        let session_id = self.peer.lock().session_id.take();
        if let Some(session_id) = session_id {
            if !self.signaling_stop.is_cancelled() {
                self.send(RelayMessage::DeleteSession {
                    session_id: session_id.clone(),
                })?;
                let deadline = Instant::now() + self.config.delete_timeout;
                loop {
                    match self.next_message(deadline, "session deletion", false).await {
                        Ok(RelayMessage::MemberDeleted) => {
                            debug!("Session {} deleted", session_id);
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            warn!("Session {} deletion unconfirmed: {}", session_id, e);
                            break;
                        }
                    }
                }
            }
        }

        self.signaling_stop.cancel();
        self.set_state(HolepunchState::Finished);
        Ok(())
    }

    async fn punch_round(&self) -> Result<Arc<UdpTransport>, HolepunchError> {
        let session_id = self.require_session_id()?;

        // Wait for the console's offer
        let deadline = Instant::now() + self.config.start_timeout;
        let offer = loop {
            let msg = self.next_session_message(deadline, "console offer").await?;
            match (msg.action, msg.conn_request) {
                (SessionAction::Offer, Some(request)) => break (msg.req_id, request),
                (action, _) => debug!("Ignoring {:?} while waiting for offer", action),
            }
        };
        let (console_req_id, console_request) = offer;
        {
            let mut peer = self.peer.lock();
            peer.console_hashed_id = console_request.local_hashed_id;
            peer.sid_console = console_request.sid as u16;
        }
        self.send_message(&session_id, SessionMessage::result(console_req_id))?;

        // Answer with our own offer on a fresh port
        let listener =
            UdpTransport::bind_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        let local_port = listener.local_addr().port();
        let local_candidates = self.gather_candidates(&listener, local_port).await;
        drop(listener);

        let offer_req_id = self.next_req_id();
        self.send_message(
            &session_id,
            SessionMessage {
                action: SessionAction::Offer,
                req_id: offer_req_id,
                error: 0,
                conn_request: Some(self.connection_request(NAT_TYPE_STATIC, local_candidates.clone())),
            },
        )?;
        self.wait_for_result(offer_req_id, deadline).await?;

        let (transport, selected) = self
            .check_candidates(&console_request.candidates, &local_candidates, local_port)
            .await?;

        let nat_type = if selected.kind == CandidateKind::Local {
            NAT_TYPE_LOCAL
        } else {
            NAT_TYPE_STATIC
        };
        self.send_message(
            &session_id,
            SessionMessage {
                action: SessionAction::Accept,
                req_id: self.next_req_id(),
                error: 0,
                conn_request: Some(self.connection_request(nat_type, vec![selected])),
            },
        )?;

        let deadline = Instant::now() + self.config.start_timeout;
        loop {
            let msg = self.next_session_message(deadline, "console accept").await?;
            match msg.action {
                SessionAction::Accept => break,
                SessionAction::Result => {}
                action => debug!("Ignoring {:?} while waiting for accept", action),
            }
        }
        Ok(Arc::new(transport))
    }

    async fn gather_candidates(&self, listener: &UdpTransport, port: u16) -> Vec<Candidate> {
        let (local_addr, known_mapping) = {
            let peer = self.peer.lock();
            (peer.local_addr, peer.mapped_addr)
        };
        let mapped = match self.stun_mapping(listener).await {
            Some(addr) => Some(addr.ip()),
            None => known_mapping,
        };

        let local = local_addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        vec![
            Candidate::new(CandidateKind::Local, local, port),
            Candidate::new(CandidateKind::Static, mapped.unwrap_or(local), port),
        ]
    }

    async fn stun_mapping(&self, socket: &UdpTransport) -> Option<SocketAddr> {
        if self.config.stun_servers.is_empty() {
            return None;
        }
        match stun::discover_mapped_address(socket, &self.config.stun_servers, stun::STUN_TIMEOUT)
            .await
        {
            Ok(result) => Some(result.mapped_address),
            Err(e) => {
                warn!("STUN discovery failed: {}", e);
                None
            }
        }
    }

    /// Check every console candidate from our punch port and keep the
    /// first socket that gets a matching response
    async fn check_candidates(
        &self,
        console_candidates: &[Candidate],
        local_candidates: &[Candidate],
        local_port: u16,
    ) -> Result<(UdpTransport, Candidate), HolepunchError> {
        let request_id: [u8; REQUEST_ID_SIZE] = rand::random();
        let request = self.check_message(MSG_TYPE_REQ, &request_id);

        let mut sockets = Vec::new();
        for candidate in console_candidates {
            if candidate.addr.is_unspecified() || candidate.port == 0 {
                continue;
            }
            let socket = UdpTransport::bind_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port)))?;
            socket.connect(candidate.socket_addr()).await?;
            if let Err(e) = socket.send(&request).await {
                debug!("Candidate {} request failed: {}", candidate.socket_addr(), e);
            }
            sockets.push((socket, candidate.clone()));
        }
        if sockets.is_empty() {
            return Err(HolepunchError::Unreachable);
        }

        let deadline = Instant::now() + self.config.candidate_timeout;
        let (index, early_request) = {
            let mut pending: FuturesUnordered<_> = sockets
                .iter()
                .enumerate()
                .map(|(i, (socket, _))| await_response(i, socket, request_id))
                .collect();
            let mut repeat = interval(CHECK_REPEAT_INTERVAL);
            repeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            repeat.tick().await;

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(HolepunchError::Cancelled),
                    _ = sleep_until(deadline) => return Err(HolepunchError::Unreachable),
                    _ = repeat.tick() => {
                        for (socket, _) in &sockets {
                            let _ = socket.send(&request).await;
                        }
                    }
                    answered = pending.next() => match answered {
                        Some(Ok(found)) => break found,
                        Some(Err(e)) => debug!("Candidate check failed: {}", e),
                        None => return Err(HolepunchError::Unreachable),
                    },
                }
            }
        };

        let (socket, selected) = sockets.swap_remove(index);
        drop(sockets);
        info!("Console answered on candidate {}", selected.socket_addr());

        let followup = match early_request {
            Some(req) => req,
            None => loop {
                let data = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(HolepunchError::Cancelled),
                    _ = sleep_until(deadline) => return Err(HolepunchError::Timeout("console candidate request")),
                    data = socket.recv() => data?,
                };
                if is_check_message(&data, MSG_TYPE_REQ) {
                    break data;
                }
            },
        };

        let mut followup_id = [0u8; REQUEST_ID_SIZE];
        followup_id.copy_from_slice(&followup[OFFSET_REQUEST_ID..OFFSET_REQUEST_ID + REQUEST_ID_SIZE]);
        let ours = local_candidates
            .iter()
            .find(|c| {
                (selected.kind == CandidateKind::Local) == (c.kind == CandidateKind::Local)
            })
            .or_else(|| local_candidates.first());
        let confirm = self.confirm_message(&followup_id, ours);
        socket.send(&confirm).await?;

        Ok((socket, selected))
    }

    fn check_message(&self, kind: u32, request_id: &[u8; REQUEST_ID_SIZE]) -> Vec<u8> {
        let peer = self.peer.lock();
        let mut buf = vec![0u8; CHECK_MSG_SIZE];
        buf[..4].copy_from_slice(&kind.to_be_bytes());
        buf[OFFSET_LOCAL_HASHED_ID..OFFSET_LOCAL_HASHED_ID + 20].copy_from_slice(&self.hashed_id_local);
        buf[OFFSET_CONSOLE_HASHED_ID..OFFSET_CONSOLE_HASHED_ID + 20]
            .copy_from_slice(&peer.console_hashed_id);
        buf[OFFSET_SID_LOCAL..OFFSET_SID_LOCAL + 2].copy_from_slice(&self.sid_local.to_be_bytes());
        buf[OFFSET_SID_CONSOLE..OFFSET_SID_CONSOLE + 2]
            .copy_from_slice(&peer.sid_console.to_be_bytes());
        buf[OFFSET_REQUEST_ID..OFFSET_REQUEST_ID + REQUEST_ID_SIZE].copy_from_slice(request_id);
        buf
    }

    /// Response to the console's request: its request id echoed, then our
    /// sids with the chosen candidate's address and port xored in
    fn confirm_message(
        &self,
        request_id: &[u8; REQUEST_ID_SIZE],
        candidate: Option<&Candidate>,
    ) -> Vec<u8> {
        let mut buf = self.check_message(MSG_TYPE_RESP, request_id);
        let sid_console = self.peer.lock().sid_console;
        buf[OFFSET_CONFIRM_ADDR..OFFSET_CONFIRM_ADDR + 2].copy_from_slice(&self.sid_local.to_be_bytes());
        buf[OFFSET_CONFIRM_ADDR + 2..OFFSET_CONFIRM_ADDR + 4].copy_from_slice(&sid_console.to_be_bytes());
        buf[OFFSET_CONFIRM_PORT..OFFSET_CONFIRM_PORT + 2].copy_from_slice(&self.sid_local.to_be_bytes());

        if let Some(candidate) = candidate {
            if let IpAddr::V4(v4) = candidate.addr {
                for (b, a) in buf[OFFSET_CONFIRM_ADDR..OFFSET_CONFIRM_ADDR + 4]
                    .iter_mut()
                    .zip(v4.octets())
                {
                    *b ^= a;
                }
            }
            for (b, p) in buf[OFFSET_CONFIRM_PORT..OFFSET_CONFIRM_PORT + 2]
                .iter_mut()
                .zip(candidate.port.to_be_bytes())
            {
                *b ^= p;
            }
        }
        buf
    }

    fn connection_request(&self, nat_type: u8, candidates: Vec<Candidate>) -> ConnectionRequest {
        let (sid_console, mac) = {
            let peer = self.peer.lock();
            (peer.sid_console, peer.default_route_mac)
        };
        ConnectionRequest {
            sid: u32::from(self.sid_local),
            peer_sid: u32::from(sid_console),
            skey: [0; 16],
            nat_type,
            candidates,
            default_route_mac: mac.as_ref().map(format_mac).unwrap_or_default(),
            local_hashed_id: self.hashed_id_local,
        }
    }

    async fn wait_for_result(&self, req_id: u32, deadline: Instant) -> Result<(), HolepunchError> {
        loop {
            let msg = self.next_session_message(deadline, "offer result").await?;
            if msg.action == SessionAction::Result && msg.req_id == req_id {
                if msg.error != 0 {
                    return Err(HolepunchError::Rejected(msg.error));
                }
                return Ok(());
            }
            debug!("Ignoring {:?} {} while waiting for result {}", msg.action, msg.req_id, req_id);
        }
    }

    async fn next_session_message(
        &self,
        deadline: Instant,
        what: &'static str,
    ) -> Result<SessionMessage, HolepunchError> {
        loop {
            match self.next_message(deadline, what, true).await? {
                RelayMessage::MessageReceived { message } => {
                    if message.action == SessionAction::Terminate {
                        return Err(HolepunchError::Rejected(message.error));
                    }
                    return Ok(message);
                }
                other => debug!("Ignoring relay message while waiting for {}: {:?}", what, other),
            }
        }
    }

    async fn next_message(
        &self,
        deadline: Instant,
        what: &'static str,
        cancellable: bool,
    ) -> Result<RelayMessage, HolepunchError> {
        let mut inbound = self.inbound.lock().await;
        let msg = tokio::select! {
            _ = self.cancel.cancelled(), if cancellable => return Err(HolepunchError::Cancelled),
            _ = sleep_until(deadline) => return Err(HolepunchError::Timeout(what)),
            msg = inbound.recv() => msg,
        };
        match msg {
            Some(RelayMessage::Error { code, reason }) => Err(HolepunchError::Signaling(format!(
                "relay error {}: {}",
                code, reason
            ))),
            Some(msg) => Ok(msg),
            None => Err(HolepunchError::Signaling("relay channel closed".to_string())),
        }
    }

    fn send(&self, msg: RelayMessage) -> Result<(), HolepunchError> {
        self.outbound
            .send(msg)
            .map_err(|_| HolepunchError::Signaling("relay channel closed".to_string()))
    }

    fn send_message(&self, session_id: &str, message: SessionMessage) -> Result<(), HolepunchError> {
        debug!("Sending {:?} {}", message.action, message.req_id);
        self.send(RelayMessage::SendMessage {
            session_id: session_id.to_string(),
            message,
        })
    }

    fn next_req_id(&self) -> u32 {
        let mut peer = self.peer.lock();
        let id = peer.local_req_id;
        peer.local_req_id = peer.local_req_id.wrapping_add(1);
        id
    }

    fn require_session_id(&self) -> Result<String, HolepunchError> {
        self.peer
            .lock()
            .session_id
            .clone()
            .ok_or(HolepunchError::InvalidState {
                expected: HolepunchState::Created.name(),
                actual: self.state().name(),
            })
    }

    fn expect_state(&self, expected: HolepunchState) -> Result<(), HolepunchError> {
        let actual = self.state();
        if actual != expected {
            return Err(HolepunchError::InvalidState {
                expected: expected.name(),
                actual: actual.name(),
            });
        }
        Ok(())
    }

    fn set_state(&self, state: HolepunchState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Holepunch state {} -> {}", previous.name(), state.name());
        }
    }

    fn fail(&self, e: &HolepunchError) {
        warn!("Holepunch failed: {}", e);
        if !self.state().is_terminal() {
            self.set_state(HolepunchState::Failed);
        }
    }

    fn settle(&self, result: Result<(), HolepunchError>, next: HolepunchState) -> Result<(), HolepunchError> {
        match result {
            Ok(()) => {
                self.set_state(next);
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }
}

/// Wait on one candidate socket for a response carrying `request_id`.
/// A console request seen first is kept for the confirmation step.
async fn await_response(
    index: usize,
    socket: &UdpTransport,
    request_id: [u8; REQUEST_ID_SIZE],
) -> Result<(usize, Option<Bytes>), NetworkError> {
    let mut early_request = None;
    loop {
        let data = socket.recv().await?;
        if is_check_message(&data, MSG_TYPE_RESP)
            && data[OFFSET_REQUEST_ID..OFFSET_REQUEST_ID + REQUEST_ID_SIZE] == request_id
        {
            return Ok((index, early_request));
        }
        if is_check_message(&data, MSG_TYPE_REQ) {
            early_request = Some(data);
        }
    }
}

fn is_check_message(data: &[u8], kind: u32) -> bool {
    data.len() == CHECK_MSG_SIZE && data[..4] == kind.to_be_bytes()
}

/// Hardware address of the interface carrying `addr`. Only Linux exposes
/// it through sysfs; elsewhere the offer goes out without one.
fn interface_mac(addr: IpAddr) -> Option<[u8; 6]> {
    let interfaces = local_ip_address::list_afinet_netifas().ok()?;
    let (name, _) = interfaces.into_iter().find(|(_, ip)| *ip == addr)?;
    let text = std::fs::read_to_string(Path::new(SYSFS_NET).join(name).join("address")).ok()?;
    parse_mac(&text)
}

/// `aa:bb:cc:dd:ee:ff`; all-zero addresses count as missing
fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let text = text.trim();
    if text.len() != 17 {
        return None;
    }
    let mac: [u8; 6] = hex::decode(text.replace(':', "")).ok()?.try_into().ok()?;
    (mac != [0; 6]).then_some(mac)
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| hex::encode([*b]))
        .collect::<Vec<_>>()
        .join(":")
}
