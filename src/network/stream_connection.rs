//! Stream connection state machine
//!
//! Runs the handshake over the reliable transport (connect, BIG/BANG key
//! exchange, stream parameters) and then the live session: heartbeats,
//! control messages, quality reports and controller feedback. All state
//! changes go through `transition`, which only allows the forward path
//! plus the exits to `Disconnecting`/`Failed`.
//!
//! Punched sockets first ask the console to switch the control socket
//! over to the stream connection and wait for its ack.
//!
//! The console may send STREAMINFO before its BANG reply has been
//! handled. Such a message is kept verbatim and replayed once the keys
//! are installed.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::{Arc, OnceLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::av::{spawn_av_receiver, spawn_data_socket_loop, AvFrame, RawPath};
use super::congestion::{spawn_congestion_reporter, PacketStats, QualityAverage, QualityMonitor};
use super::crypto::{derive_secret, launch_spec_keystream, KeyPair, StreamKeys};
use super::error::{NetworkError, StreamError};
use super::events::{Event, EventSender};
use super::feedback::FeedbackSender;
use super::rudp::{Received, Rudp};
use super::transport::UdpTransport;
use crate::protocol::takion::{
    decode_data, microphone_audio_header, AUDIO_HEADER_SIZE, CLIENT_DISCONNECT_REASON,
};
use crate::protocol::{
    BangPayload, BigPayload, ControllerState, ControllerType, CtrlMessage, CtrlType, DataType,
    LaunchParams, LaunchSpec, LoginState, PadInfo, PadState, ProtocolError, Rumble, RudpMessage,
    RudpType, StreamInfo, TakionMessage, TriggerEffects, HANDSHAKE_KEY_SIZE,
};

/// Wait for each handshake stage
pub const EXPECT_TIMEOUT: Duration = Duration::from_secs(5);

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

pub const PROTOCOL_VERSION_PS5: u32 = 12;
pub const PROTOCOL_VERSION_PS4: u32 = 9;

/// Raw AV datagrams queued for decryption
const AV_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Pre-shared registration key
    pub morning: [u8; 16],
    /// Session key sent in the handshake-open message
    pub session_id: String,
    pub launch: LaunchParams,
    pub enable_dualsense: bool,
    pub packet_loss_max: f64,
    pub expect_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl StreamConfig {
    pub fn ps5(&self) -> bool {
        self.launch.ps5
    }

    pub fn protocol_version(&self) -> u32 {
        if self.ps5() {
            PROTOCOL_VERSION_PS5
        } else {
            PROTOCOL_VERSION_PS4
        }
    }
}

/// Sockets a stream connection runs on
#[derive(Debug)]
pub enum StreamSocket {
    /// LAN: connect to the console's stream port
    Direct(SocketAddr),
    /// Internet: sockets produced by the two holepunch rounds
    Punched {
        control: Arc<UdpTransport>,
        data: Arc<UdpTransport>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    AwaitingKeyExchange,
    AwaitingStreamInfo,
    Running,
    Disconnecting,
    Closed,
    Failed,
}

impl StreamState {
    pub fn name(self) -> &'static str {
        match self {
            StreamState::Idle => "Idle",
            StreamState::Connecting => "Connecting",
            StreamState::AwaitingKeyExchange => "AwaitingKeyExchange",
            StreamState::AwaitingStreamInfo => "AwaitingStreamInfo",
            StreamState::Running => "Running",
            StreamState::Disconnecting => "Disconnecting",
            StreamState::Closed => "Closed",
            StreamState::Failed => "Failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Failed)
    }

    pub fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::*;
        match (self, next) {
            (Idle, Connecting)
            | (Connecting, AwaitingKeyExchange)
            | (AwaitingKeyExchange, AwaitingStreamInfo)
            | (AwaitingStreamInfo, Running)
            | (Connecting | AwaitingKeyExchange | AwaitingStreamInfo | Running, Disconnecting)
            | (Disconnecting, Closed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// How a connection that did not fail ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Stopped,
    RemoteDisconnected(String),
}

/// Session-channel message seen during the handshake
enum Handshake {
    Message(TakionMessage, Bytes),
    Ended(StreamOutcome),
}

pub struct StreamConnection {
    config: StreamConfig,
    state: Mutex<StreamState>,
    stop: CancellationToken,
    tasks: CancellationToken,
    events: EventSender,
    rudp: OnceLock<Arc<Rudp>>,
    feedback: Mutex<Option<Arc<FeedbackSender>>>,
    controller: watch::Receiver<ControllerState>,
    frames: Option<mpsc::Sender<AvFrame>>,
    stats: Arc<PacketStats>,
    quality: QualityMonitor,
    pad: Mutex<PadState>,
    stream_info: Mutex<Option<StreamInfo>>,
    console_session_id: Mutex<Option<String>>,
    span: tracing::Span,
}

impl StreamConnection {
    pub fn new(
        config: StreamConfig,
        events: EventSender,
        controller: watch::Receiver<ControllerState>,
        frames: Option<mpsc::Sender<AvFrame>>,
        span: tracing::Span,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(StreamState::Idle),
            stop: CancellationToken::new(),
            tasks: CancellationToken::new(),
            events,
            rudp: OnceLock::new(),
            feedback: Mutex::new(None),
            controller,
            frames,
            stats: Arc::new(PacketStats::new()),
            quality: QualityMonitor::new(),
            pad: Mutex::new(PadState::default()),
            stream_info: Mutex::new(None),
            console_session_id: Mutex::new(None),
            span,
        })
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    /// Whether the directional keystreams exist yet
    pub fn keys_installed(&self) -> bool {
        self.rudp.get().is_some_and(|rudp| rudp.keys().is_some())
    }

    /// Smoothed quality over the console's recent reports
    pub fn quality(&self) -> Option<QualityAverage> {
        self.quality.average()
    }

    pub fn packet_stats(&self) -> &Arc<PacketStats> {
        &self.stats
    }

    pub fn stream_info(&self) -> Option<StreamInfo> {
        self.stream_info.lock().clone()
    }

    /// Session id assigned by the console over the control channel
    pub fn console_session_id(&self) -> Option<String> {
        self.console_session_id.lock().clone()
    }

    /// Ask the connection to end. Safe to call any number of times.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!("Stream connection stop requested");
        }
        self.stop.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub async fn set_login_pin(&self, pin: &str) -> Result<(), StreamError> {
        self.send_ctrl(self.rudp()?, &CtrlMessage::login_pin(pin)).await
    }

    pub async fn go_home(&self) -> Result<(), StreamError> {
        self.send_ctrl(self.rudp()?, &CtrlMessage::go_home()).await
    }

    pub async fn go_to_bed(&self) -> Result<(), StreamError> {
        self.send_ctrl(self.rudp()?, &CtrlMessage::goto_bed()).await
    }

    /// Flip the microphone mute. Returns the new muted state.
    pub async fn toggle_mute(&self) -> Result<bool, StreamError> {
        Ok(self.feedback()?.toggle_mute().await?)
    }

    pub async fn request_idr(&self) -> Result<(), StreamError> {
        Ok(self.feedback()?.request_idr().await?)
    }

    pub async fn report_corrupt_frame(&self, start: u32, end: u32) -> Result<(), StreamError> {
        Ok(self.feedback()?.report_corrupt_frame(start, end).await?)
    }

    /// Drive the connection from `Idle` to its end. Teardown always runs
    /// once before this returns.
    pub async fn run(&self, socket: StreamSocket) -> Result<StreamOutcome, StreamError> {
        self.transition(StreamState::Connecting)?;
        let result = self.run_inner(socket).await;
        match &result {
            Ok(outcome) => info!("Stream connection ended: {:?}", outcome),
            Err(e) => warn!("Stream connection failed: {}", e),
        }
        self.teardown(result.is_ok()).await;
        result
    }

    async fn run_inner(&self, socket: StreamSocket) -> Result<StreamOutcome, StreamError> {
        if self.stop.is_cancelled() {
            return Ok(StreamOutcome::Stopped);
        }

        let punched = matches!(socket, StreamSocket::Punched { .. });
        let (control, data) = match socket {
            StreamSocket::Direct(addr) => {
                let transport = UdpTransport::bind_for(addr).map_err(StreamError::Socket)?;
                transport
                    .connect(addr)
                    .await
                    .map_err(StreamError::Socket)?;
                (Arc::new(transport), None)
            }
            StreamSocket::Punched { control, data } => (control, Some(data)),
        };

        let (av_tx, av_rx) = mpsc::channel(AV_QUEUE);
        let rudp = Rudp::open(control, Some(av_tx.clone()), self.span.clone())
            .map_err(StreamError::Socket)?;
        let _ = self.rudp.set(rudp.clone());

        let path = match data {
            Some(data) => {
                spawn_data_socket_loop(data.clone(), av_tx, self.tasks.child_token(), self.span.clone());
                RawPath::Data(data)
            }
            None => RawPath::Control(rudp.clone()),
        };
        spawn_av_receiver(
            rudp.clone(),
            av_rx,
            self.stats.clone(),
            self.frames.clone(),
            self.tasks.child_token(),
            self.span.clone(),
        );

        tokio::select! {
            biased;
            _ = self.stop.cancelled() => return Ok(StreamOutcome::Stopped),
            connected = rudp.connect(self.config.expect_timeout) => match connected {
                Ok(()) => {}
                Err(NetworkError::ConnectionTimeout) => return Err(StreamError::ConnectTimeout),
                Err(e) => return Err(e.into()),
            },
        }
        if punched {
            if let ControlFlow::Break(outcome) = self.switch_to_stream_connection(&rudp).await? {
                return Ok(outcome);
            }
        }
        spawn_congestion_reporter(
            path.clone(),
            self.stats.clone(),
            self.config.packet_loss_max,
            self.tasks.child_token(),
            self.span.clone(),
        );

        self.transition(StreamState::AwaitingKeyExchange)?;
        let early_stream_info = match self.key_exchange(&rudp).await? {
            ControlFlow::Continue(early) => early,
            ControlFlow::Break(outcome) => return Ok(outcome),
        };

        self.transition(StreamState::AwaitingStreamInfo)?;
        if let ControlFlow::Break(outcome) = self.await_stream_info(&rudp, early_stream_info).await? {
            return Ok(outcome);
        }

        let feedback = FeedbackSender::new(
            rudp.clone(),
            path,
            self.controller.clone(),
            self.config.ps5(),
            self.config.enable_dualsense,
        );
        feedback.spawn(self.span.clone());
        *self.feedback.lock() = Some(feedback);

        self.transition(StreamState::Running)?;
        info!("Stream connection running");
        self.emit(Event::Connected);

        self.run_loop(&rudp).await
    }

    /// Ask the console to carry the stream over the punched control socket.
    /// The ack is either a TAKION_SWITCH_ACK frame or the echoed control
    /// message.
    async fn switch_to_stream_connection(
        &self,
        rudp: &Rudp,
    ) -> Result<ControlFlow<StreamOutcome>, StreamError> {
        self.send_ctrl(rudp, &CtrlMessage::switch_to_stream_connection())
            .await?;
        let deadline = Instant::now() + self.config.expect_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StreamError::SwitchTimeout);
            }
            let frame = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(ControlFlow::Break(StreamOutcome::Stopped)),
                received = rudp.receive(remaining) => match received? {
                    Received::Message(frame) => frame,
                    Received::Timeout => return Err(StreamError::SwitchTimeout),
                },
            };

            match frame.kind {
                RudpType::TakionSwitchAck => break,
                RudpType::CtrlMessage => match CtrlMessage::from_bytes(&frame.body()) {
                    Ok(ctrl) if ctrl.kind() == Some(CtrlType::SwitchToStreamConnection) => {
                        if !ctrl.payload.is_empty() {
                            warn!("Stream connection switch ack with {} payload bytes", ctrl.payload.len());
                        }
                        break;
                    }
                    _ => self.handle_ctrl(rudp, &frame).await,
                },
                RudpType::Finish => {
                    return Ok(ControlFlow::Break(
                        self.remote_disconnect("connection finished".to_string()),
                    ))
                }
                kind => trace!("Ignoring {:?} before the stream connection switch", kind),
            }
        }
        info!("Console acknowledged the switch to the stream connection");
        Ok(ControlFlow::Continue(()))
    }

    /// Send BIG and wait for BANG. Returns a STREAMINFO body that arrived
    /// early, if any.
    async fn key_exchange(
        &self,
        rudp: &Arc<Rudp>,
    ) -> Result<ControlFlow<StreamOutcome, Option<Bytes>>, StreamError> {
        let keypair = KeyPair::generate();
        let handshake_key: [u8; HANDSHAKE_KEY_SIZE] = rand::random();
        let big = self.build_big(&keypair, &handshake_key)?;
        self.send_session(rudp, &TakionMessage::Big(big)).await?;
        debug!("BIG sent, awaiting BANG");

        let deadline = Instant::now() + self.config.expect_timeout;
        let mut early = None;
        loop {
            let (message, body) = match self
                .next_handshake_message(rudp, deadline, StreamError::KeyExchangeTimeout)
                .await?
            {
                Handshake::Message(message, body) => (message, body),
                Handshake::Ended(outcome) => return Ok(ControlFlow::Break(outcome)),
            };
            match message {
                TakionMessage::Bang(bang) => {
                    self.accept_bang(rudp, &keypair, &handshake_key, bang)?;
                    return Ok(ControlFlow::Continue(early));
                }
                TakionMessage::StreamInfo(_) if early.is_none() => {
                    info!("STREAMINFO arrived before BANG, buffering it");
                    early = Some(body);
                }
                other => debug!("Dropping {} while awaiting BANG", other.name()),
            }
        }
    }

    fn build_big(
        &self,
        keypair: &KeyPair,
        handshake_key: &[u8; HANDSHAKE_KEY_SIZE],
    ) -> Result<BigPayload, StreamError> {
        let mut launch_spec = LaunchSpec::new(&self.config.launch, handshake_key).to_json()?;
        launch_spec_keystream(&self.config.morning, &self.config.session_id)?
            .encrypt(0, &mut launch_spec)?;

        Ok(BigPayload {
            client_version: self.config.protocol_version(),
            session_key: self.config.session_id.clone(),
            launch_spec: BASE64.encode(&launch_spec),
            encrypted_key: vec![0; 4],
            ecdh_pub_key: keypair.public_key_bytes().to_vec(),
            ecdh_sig: keypair.signature(handshake_key)?,
        })
    }

    /// Validate the console's reply. Keystreams are only built once the
    /// signature has been verified and the secret derived.
    fn accept_bang(
        &self,
        rudp: &Rudp,
        keypair: &KeyPair,
        handshake_key: &[u8; HANDSHAKE_KEY_SIZE],
        bang: BangPayload,
    ) -> Result<(), StreamError> {
        if !bang.version_accepted {
            return Err(StreamError::VersionRejected);
        }
        if !bang.encrypted_key_accepted {
            return Err(StreamError::KeyRejected);
        }
        let secret = derive_secret(keypair, &bang.ecdh_pub_key, &bang.ecdh_sig, handshake_key)?;
        rudp.install_keys(StreamKeys::new(&secret, handshake_key)?)?;
        info!("Key exchange complete");
        Ok(())
    }

    async fn await_stream_info(
        &self,
        rudp: &Arc<Rudp>,
        early: Option<Bytes>,
    ) -> Result<ControlFlow<StreamOutcome>, StreamError> {
        if let Some(body) = early {
            debug!("Replaying buffered STREAMINFO");
            if let Some(TakionMessage::StreamInfo(info)) = decode_protobuf(&body)? {
                self.accept_stream_info(rudp, info).await?;
                return Ok(ControlFlow::Continue(()));
            }
        }

        let deadline = Instant::now() + self.config.expect_timeout;
        loop {
            match self
                .next_handshake_message(rudp, deadline, StreamError::StreamInfoTimeout)
                .await?
            {
                Handshake::Message(TakionMessage::StreamInfo(info), _) => {
                    self.accept_stream_info(rudp, info).await?;
                    return Ok(ControlFlow::Continue(()));
                }
                Handshake::Message(other, _) => {
                    debug!("Dropping {} while awaiting STREAMINFO", other.name())
                }
                Handshake::Ended(outcome) => return Ok(ControlFlow::Break(outcome)),
            }
        }
    }

    /// Acknowledge the stream parameters, announce the controller and open
    /// the microphone path
    async fn accept_stream_info(&self, rudp: &Rudp, info: StreamInfo) -> Result<(), StreamError> {
        if info.audio_header.len() != AUDIO_HEADER_SIZE {
            return Err(ProtocolError::InvalidField("audio header size").into());
        }
        if info.resolutions.is_empty() {
            return Err(ProtocolError::MissingField("resolutions").into());
        }
        info!(
            "Stream parameters: {}",
            info.resolutions
                .iter()
                .map(|r| format!("{}x{}", r.width, r.height))
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.send_session(rudp, &TakionMessage::StreamInfoAck).await?;
        let controller_type = if self.config.ps5() && self.config.enable_dualsense {
            ControllerType::DualSense
        } else {
            ControllerType::DualShock4
        };
        self.send_session(
            rudp,
            &TakionMessage::ControllerConnection {
                connected: true,
                controller_type,
            },
        )
        .await?;
        self.send_session(
            rudp,
            &TakionMessage::StreamInfo(StreamInfo {
                audio_header: microphone_audio_header(),
                resolutions: Vec::new(),
            }),
        )
        .await?;
        self.send_ctrl(rudp, &CtrlMessage::mic_connect()).await?;

        *self.stream_info.lock() = Some(info);
        Ok(())
    }

    /// Next protobuf message on the session channel. Control frames are
    /// handled along the way. A malformed session message is fatal here.
    async fn next_handshake_message(
        &self,
        rudp: &Rudp,
        deadline: Instant,
        timeout_error: StreamError,
    ) -> Result<Handshake, StreamError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timeout_error);
            }
            let frame = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(Handshake::Ended(StreamOutcome::Stopped)),
                received = rudp.receive(remaining) => match received? {
                    Received::Message(frame) => frame,
                    Received::Timeout => return Err(timeout_error),
                },
            };

            match frame.kind {
                RudpType::SessionMessage => {
                    let body = frame.body();
                    match decode_protobuf(&body)? {
                        Some(TakionMessage::Disconnect { reason }) => {
                            return Ok(Handshake::Ended(self.remote_disconnect(reason)))
                        }
                        Some(message) => return Ok(Handshake::Message(message, body)),
                        None => debug!("Dropping raw session data during handshake"),
                    }
                }
                RudpType::CtrlMessage => self.handle_ctrl(rudp, &frame).await,
                RudpType::Finish => {
                    return Ok(Handshake::Ended(
                        self.remote_disconnect("connection finished".to_string()),
                    ))
                }
                kind => trace!("Ignoring {:?} during handshake", kind),
            }
        }
    }

    async fn run_loop(&self, rudp: &Arc<Rudp>) -> Result<StreamOutcome, StreamError> {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(StreamOutcome::Stopped),
                _ = heartbeat.tick() => {
                    self.send_session(rudp, &TakionMessage::Heartbeat).await?;
                    trace!("Heartbeat sent");
                }
                received = rudp.receive(period) => {
                    let Received::Message(frame) = received? else {
                        continue;
                    };
                    match frame.kind {
                        RudpType::SessionMessage => {
                            if let Some(outcome) = self.handle_running_body(&frame.body()) {
                                return Ok(outcome);
                            }
                        }
                        RudpType::CtrlMessage => self.handle_ctrl(rudp, &frame).await,
                        RudpType::Finish => {
                            return Ok(self.remote_disconnect("connection finished".to_string()))
                        }
                        kind => trace!("Ignoring {:?} while running", kind),
                    }
                }
            }
        }
    }

    /// Session-channel traffic while running. Malformed or unexpected
    /// messages are dropped.
    fn handle_running_body(&self, body: &[u8]) -> Option<StreamOutcome> {
        let (data_type, record) = match decode_data(body) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Dropping malformed session message: {}", e);
                return None;
            }
        };

        match data_type {
            DataType::Protobuf => match TakionMessage::decode(record) {
                Ok(TakionMessage::Disconnect { reason }) => {
                    return Some(self.remote_disconnect(reason));
                }
                Ok(TakionMessage::ConnectionQuality(quality)) => self.quality.push(quality),
                Ok(TakionMessage::CorruptFrame { start, end }) => {
                    warn!("Console reported corrupt frames {}..={}", start, end)
                }
                Ok(TakionMessage::Heartbeat) => trace!("Heartbeat from console"),
                Ok(other) => debug!("Dropping unexpected {} while running", other.name()),
                Err(e) => warn!("Dropping malformed session message: {}", e),
            },
            DataType::Rumble => match Rumble::parse(record) {
                Ok(rumble) => self.emit(Event::Rumble(rumble)),
                Err(e) => warn!("Dropping malformed rumble: {}", e),
            },
            DataType::PadInfo => match PadInfo::parse(record) {
                Ok(info) => self.apply_pad_info(&info),
                Err(e) => warn!("Dropping malformed pad info: {}", e),
            },
            DataType::TriggerEffects => match TriggerEffects::parse(record) {
                Ok(effects) => self.emit(Event::TriggerEffects(effects)),
                Err(e) => warn!("Dropping malformed trigger effects: {}", e),
            },
        }
        None
    }

    fn apply_pad_info(&self, info: &PadInfo) {
        let changes = self.pad.lock().apply(info);
        if let Some(index) = changes.player_index {
            self.emit(Event::PlayerIndex(index));
        }
        if let Some(led) = changes.led {
            self.emit(Event::LedColor(led));
        }
        if changes.motion_reset {
            self.emit(Event::MotionReset);
        }
        if let Some(intensity) = changes.haptic_intensity {
            self.emit(Event::HapticIntensity(intensity));
        }
        if let Some(intensity) = changes.trigger_intensity {
            self.emit(Event::TriggerIntensity(intensity));
        }
    }

    async fn handle_ctrl(&self, rudp: &Rudp, frame: &RudpMessage) {
        let ctrl = match CtrlMessage::from_bytes(&frame.body()) {
            Ok(ctrl) => ctrl,
            Err(e) => {
                warn!("Dropping malformed control message: {}", e);
                return;
            }
        };

        match ctrl.kind() {
            Some(CtrlType::HeartbeatRequest) => {
                if let Err(e) = self.send_ctrl(rudp, &CtrlMessage::heartbeat_reply()).await {
                    warn!("Failed to answer control heartbeat: {}", e);
                }
            }
            Some(CtrlType::SessionId) => match ctrl.session_id() {
                Ok(session_id) => {
                    info!("Console session id {}", session_id);
                    *self.console_session_id.lock() = Some(session_id.clone());
                    self.emit(Event::RegistrationFinished { session_id });
                }
                Err(e) => warn!("Invalid session id: {}", e),
            },
            Some(CtrlType::LoginPinRequest) => {
                info!("Console requested the login PIN");
                self.emit(Event::LoginPinRequested {
                    pin_incorrect: false,
                });
            }
            Some(CtrlType::Login) => match ctrl.login_state() {
                Ok(LoginState::Success) => info!("Login successful"),
                Ok(LoginState::PinIncorrect) => {
                    warn!("Login PIN incorrect");
                    self.emit(Event::LoginPinRequested {
                        pin_incorrect: true,
                    });
                }
                Ok(LoginState::Other(state)) => warn!("Unknown login state {}", state),
                Err(e) => warn!("Invalid login message: {}", e),
            },
            Some(CtrlType::Nickname) => match ctrl.nickname() {
                Ok(nickname) => self.emit(Event::NicknameReceived(nickname)),
                Err(e) => warn!("Invalid nickname: {}", e),
            },
            Some(CtrlType::SwitchToStreamConnection) => {
                debug!("Extra stream connection switch ack, ignoring")
            }
            Some(kind) => debug!("Unhandled control message {:?}", kind),
            None => debug!("Unknown control message type 0x{:x}", ctrl.raw_type),
        }
    }

    async fn teardown(&self, graceful: bool) {
        let feedback = self.feedback.lock().take();
        if let Some(feedback) = feedback {
            feedback.set_active(false).await;
            feedback.stop();
        }

        if graceful {
            let _ = self.transition(StreamState::Disconnecting);
        }
        if let Some(rudp) = self.rudp.get() {
            if !rudp.is_closed() {
                let disconnect = TakionMessage::Disconnect {
                    reason: CLIENT_DISCONNECT_REASON.to_string(),
                };
                match self.send_session(rudp, &disconnect).await {
                    Ok(()) => debug!("Disconnect sent"),
                    Err(e) => debug!("Could not send disconnect: {}", e),
                }
            }
            rudp.close();
        }
        self.tasks.cancel();

        let terminal = if graceful {
            StreamState::Closed
        } else {
            StreamState::Failed
        };
        if let Err(e) = self.transition(terminal) {
            debug!("Teardown: {}", e);
        }
    }

    fn transition(&self, next: StreamState) -> Result<StreamState, StreamError> {
        let mut state = self.state.lock();
        let previous = *state;
        if !previous.can_transition_to(next) {
            return Err(StreamError::InvalidTransition {
                from: previous.name(),
                to: next.name(),
            });
        }
        *state = next;
        debug!("Stream state {} -> {}", previous.name(), next.name());
        Ok(previous)
    }

    fn remote_disconnect(&self, reason: String) -> StreamOutcome {
        info!("Console disconnected: {}", reason);
        StreamOutcome::RemoteDisconnected(reason)
    }

    async fn send_session(&self, rudp: &Rudp, message: &TakionMessage) -> Result<(), StreamError> {
        match rudp.send_session(&message.to_body()?).await {
            Ok(_) => Ok(()),
            Err(e) if !e.is_fatal() => {
                warn!("{} sent with warning: {}", message.name(), e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn send_ctrl(&self, rudp: &Rudp, message: &CtrlMessage) -> Result<(), StreamError> {
        match rudp.send_ctrl(&message.to_bytes()).await {
            Ok(_) => Ok(()),
            Err(e) if !e.is_fatal() => {
                warn!("Control message sent with warning: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn rudp(&self) -> Result<&Arc<Rudp>, StreamError> {
        self.rudp
            .get()
            .filter(|rudp| !rudp.is_closed())
            .ok_or(StreamError::NotConnected)
    }

    fn feedback(&self) -> Result<Arc<FeedbackSender>, StreamError> {
        self.feedback.lock().clone().ok_or(StreamError::NotConnected)
    }

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            trace!("Event receiver dropped");
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.stop.cancel();
        self.tasks.cancel();
    }
}

/// Protobuf message of a session body, `None` for raw data types
fn decode_protobuf(body: &[u8]) -> Result<Option<TakionMessage>, ProtocolError> {
    let (data_type, record) = decode_data(body)?;
    if data_type != DataType::Protobuf {
        return Ok(None);
    }
    TakionMessage::decode(record).map(Some)
}
