//! Host-facing remote play session
//!
//! A `Session` owns one attempt to stream from a console: the session
//! request on a LAN or the holepunch for internet mode, the stream connection, a single retry of a
//! timed out handshake, and the final `Event::Quit`. The host drives it
//! through `start`/`stop` and the command methods and reads everything
//! else from the event channel.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::av::AvFrame;
use super::congestion::QualityAverage;
use super::error::{HolepunchError, SessionError, StreamError};
use super::events::{self, Event, EventReceiver, EventSender, QuitReason};
use super::holepunch::{ConsoleType, HolepunchSession, HolepunchState, PortKind};
use super::session_request::{request_session, NONCE_SIZE};
use super::stream_connection::{
    StreamConfig, StreamConnection, StreamOutcome, StreamSocket, StreamState,
};
use super::transport::UdpTransport;
use crate::config::{random_session_id, HolepunchSettings, SessionConfig};
use crate::protocol::ControllerState;

type Quit = (QuitReason, Option<String>);

/// Components the host may reach while the session task runs
#[derive(Default)]
struct Shared {
    stop: CancellationToken,
    stream: Mutex<Option<Arc<StreamConnection>>>,
    holepunch: Mutex<Option<Arc<HolepunchSession>>>,
    nonce: Mutex<Option<[u8; NONCE_SIZE]>>,
}

pub struct Session {
    config: SessionConfig,
    session_id: String,
    events: EventSender,
    controller: watch::Sender<ControllerState>,
    frames: Option<mpsc::Sender<AvFrame>>,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    started: Mutex<bool>,
    span: tracing::Span,
}

impl Session {
    pub fn new(config: SessionConfig) -> (Self, EventReceiver) {
        let (events, receiver) = events::channel();
        let (controller, _) = watch::channel(ControllerState::default());
        let session_id = config.session_id.clone().unwrap_or_else(random_session_id);
        let span = info_span!("session", id = %session_id, console = %config.target());

        let session = Self {
            config,
            session_id,
            events,
            controller,
            frames: None,
            shared: Arc::new(Shared::default()),
            task: Mutex::new(None),
            started: Mutex::new(false),
            span,
        };
        (session, receiver)
    }

    /// Deliver decrypted AV frames to `frames`
    pub fn with_av_frames(mut self, frames: mpsc::Sender<AvFrame>) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Spawn the session task. A session can only be started once.
    pub fn start(&self) -> Result<(), SessionError> {
        let mut started = self.started.lock();
        if *started {
            return Err(SessionError::AlreadyStarted);
        }
        self.config.validate()?;
        let stream_config = self.config.stream_config(&self.session_id)?;
        *started = true;

        let runner = Runner {
            config: self.config.clone(),
            stream_config,
            shared: self.shared.clone(),
            events: self.events.clone(),
            controller: self.controller.subscribe(),
            frames: self.frames.clone(),
            span: self.span.clone(),
        };
        info!(parent: &self.span, "Starting session ({})", if self.config.is_remote() { "internet" } else { "LAN" });
        *self.task.lock() = Some(tokio::spawn(runner.run().instrument(self.span.clone())));
        Ok(())
    }

    /// Ask the session to end. Safe to call any number of times.
    pub fn stop(&self) {
        if self.shared.stop.is_cancelled() {
            return;
        }
        info!(parent: &self.span, "Session stop requested");
        self.shared.stop.cancel();
        if let Some(holepunch) = self.shared.holepunch.lock().as_ref() {
            holepunch.cancel(false);
        }
        if let Some(stream) = self.shared.stream.lock().as_ref() {
            stream.stop();
        }
    }

    /// Wait for the session task to finish
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(parent: &self.span, "Session task ended abnormally: {}", e);
            }
        }
    }

    pub async fn set_login_pin(&self, pin: &str) -> Result<(), SessionError> {
        Ok(self.stream()?.set_login_pin(pin).await?)
    }

    /// Returns the new muted state
    pub async fn toggle_mute(&self) -> Result<bool, SessionError> {
        Ok(self.stream()?.toggle_mute().await?)
    }

    pub async fn go_home(&self) -> Result<(), SessionError> {
        Ok(self.stream()?.go_home().await?)
    }

    pub async fn go_to_bed(&self) -> Result<(), SessionError> {
        Ok(self.stream()?.go_to_bed().await?)
    }

    pub async fn request_idr(&self) -> Result<(), SessionError> {
        Ok(self.stream()?.request_idr().await?)
    }

    /// Handle the host writes the local controller state into
    pub fn controller_state(&self) -> watch::Sender<ControllerState> {
        self.controller.clone()
    }

    /// Nonce from the console's answer to the LAN session request
    pub fn session_nonce(&self) -> Option<[u8; NONCE_SIZE]> {
        *self.shared.nonce.lock()
    }

    pub fn stream_state(&self) -> Option<StreamState> {
        self.shared.stream.lock().as_ref().map(|stream| stream.state())
    }

    pub fn quality(&self) -> Option<QualityAverage> {
        self.shared.stream.lock().as_ref().and_then(|stream| stream.quality())
    }

    fn stream(&self) -> Result<Arc<StreamConnection>, SessionError> {
        self.shared
            .stream
            .lock()
            .clone()
            .ok_or(SessionError::Stream(StreamError::NotConnected))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved into the session task
struct Runner {
    config: SessionConfig,
    stream_config: StreamConfig,
    shared: Arc<Shared>,
    events: EventSender,
    controller: watch::Receiver<ControllerState>,
    frames: Option<mpsc::Sender<AvFrame>>,
    span: tracing::Span,
}

impl Runner {
    async fn run(self) {
        let (reason, message) = if self.shared.stop.is_cancelled() {
            (QuitReason::Stopped, None)
        } else {
            match self.config.holepunch.clone() {
                Some(settings) => self.run_remote(&settings).await,
                None => self.run_lan().await,
            }
        };

        if reason.is_error() {
            warn!("Session quit: {} ({})", reason, message.as_deref().unwrap_or("-"));
        } else {
            info!("Session quit: {} ({})", reason, message.as_deref().unwrap_or("-"));
        }
        let _ = self.events.send(Event::Quit { reason, message });
    }

    async fn run_lan(&self) -> Quit {
        let Some(target) = self.config.stream_target() else {
            return (QuitReason::InvalidConfig, Some("no console host".to_string()));
        };
        let addr = match tokio::net::lookup_host(&target).await.map(|mut addrs| addrs.next()) {
            Ok(Some(addr)) => addr,
            Ok(None) => {
                return (QuitReason::InvalidConfig, Some(format!("{} did not resolve", target)))
            }
            Err(e) => {
                return (
                    QuitReason::InvalidConfig,
                    Some(format!("cannot resolve {}: {}", target, e)),
                )
            }
        };

        if let Err(quit) = self.request_session(addr).await {
            return quit;
        }

        let started = Instant::now();
        let mut retried = false;
        loop {
            let stream = self.new_stream();
            let result = stream.run(StreamSocket::Direct(addr)).await;
            match result {
                // Handshake timeouts only happen before Running
                Err(e)
                    if e.is_timeout()
                        && !retried
                        && started.elapsed() < self.config.retry_window()
                        && !self.shared.stop.is_cancelled() =>
                {
                    warn!("Handshake failed ({}), retrying once", e);
                    retried = true;
                }
                result => return quit_from_stream(result),
            }
        }
    }

    /// Ask the console for a session on its session port, next to the
    /// stream address
    async fn request_session(&self, stream_addr: SocketAddr) -> Result<(), Quit> {
        let regist_key = self
            .config
            .regist_key_bytes()
            .map_err(|e| (QuitReason::InvalidConfig, Some(e.to_string())))?;
        let addr = SocketAddr::new(stream_addr.ip(), self.config.session_port);

        let granted = tokio::select! {
            _ = self.shared.stop.cancelled() => return Err((QuitReason::Stopped, None)),
            granted = request_session(
                addr,
                &regist_key,
                self.config.ps5,
                self.stream_config.expect_timeout,
            ) => granted,
        };
        match granted {
            Ok(grant) => {
                debug!("Session nonce received");
                *self.shared.nonce.lock() = Some(grant.nonce);
                Ok(())
            }
            Err(e) => Err((
                QuitReason::from_session_request_error(&e),
                Some(e.to_string()),
            )),
        }
    }

    async fn run_remote(&self, settings: &HolepunchSettings) -> Quit {
        let duid = match settings.duid_bytes() {
            Ok(duid) => duid,
            Err(e) => return (QuitReason::InvalidConfig, Some(e.to_string())),
        };
        let holepunch = match HolepunchSession::init(
            &settings.token(),
            &settings.relay_url,
            settings.holepunch_config(),
            self.span.clone(),
        )
        .await
        {
            Ok(holepunch) => Arc::new(holepunch),
            Err(e) => return quit_from_holepunch(&e),
        };
        *self.shared.holepunch.lock() = Some(holepunch.clone());
        if self.shared.stop.is_cancelled() {
            holepunch.cancel(false);
        }

        let mut progress = Progress::default();
        let console_type = if self.config.ps5 {
            ConsoleType::Ps5
        } else {
            ConsoleType::Ps4
        };
        let punched = self
            .punch(&holepunch, &duid, console_type, &mut progress)
            .await;
        progress.report(&holepunch, &self.events);

        let quit = match punched {
            Ok((control, data)) => {
                let stream = self.new_stream();
                quit_from_stream(stream.run(StreamSocket::Punched { control, data }).await)
            }
            Err(e) => quit_from_holepunch(&e),
        };

        if let Err(e) = holepunch.fini().await {
            warn!("Holepunch cleanup failed: {}", e);
        }
        progress.report(&holepunch, &self.events);
        quit
    }

    async fn punch(
        &self,
        holepunch: &HolepunchSession,
        duid: &[u8; 32],
        console_type: ConsoleType,
        progress: &mut Progress,
    ) -> Result<(Arc<UdpTransport>, Arc<UdpTransport>), HolepunchError> {
        holepunch.create().await?;
        progress.report(holepunch, &self.events);

        let found = holepunch.discover_local_candidates().await;
        info!("{} local candidate address(es)", found);

        holepunch.start(duid, console_type).await?;
        progress.report(holepunch, &self.events);

        let control = holepunch.punch(PortKind::Control).await?;
        progress.report(holepunch, &self.events);

        let data = holepunch.punch(PortKind::Data).await?;
        progress.report(holepunch, &self.events);
        Ok((control, data))
    }

    /// Fresh stream connection, reachable by `Session::stop`
    fn new_stream(&self) -> Arc<StreamConnection> {
        let stream = StreamConnection::new(
            self.stream_config.clone(),
            self.events.clone(),
            self.controller.clone(),
            self.frames.clone(),
            self.span.clone(),
        );
        *self.shared.stream.lock() = Some(stream.clone());
        if self.shared.stop.is_cancelled() {
            stream.stop();
        }
        stream
    }
}

/// Emits holepunch progress once per state
#[derive(Default)]
struct Progress {
    last: Option<HolepunchState>,
}

impl Progress {
    fn report(&mut self, holepunch: &HolepunchSession, events: &EventSender) {
        let state = holepunch.state();
        if self.last != Some(state) {
            self.last = Some(state);
            let _ = events.send(Event::HolepunchProgress(state));
        }
    }
}

fn quit_from_stream(result: Result<StreamOutcome, StreamError>) -> Quit {
    match result {
        Ok(StreamOutcome::Stopped) => (QuitReason::Stopped, None),
        Ok(StreamOutcome::RemoteDisconnected(reason)) => {
            (QuitReason::from_remote_reason(&reason), Some(reason))
        }
        Err(e) => (QuitReason::from_stream_error(&e), Some(e.to_string())),
    }
}

fn quit_from_holepunch(e: &HolepunchError) -> Quit {
    let message = match e {
        HolepunchError::Cancelled => None,
        other => Some(other.to_string()),
    };
    (QuitReason::from_holepunch_error(e), message)
}
