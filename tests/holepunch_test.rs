//! Holepunch tests with an in-memory relay and loopback console sockets
//!
//! The relay side is scripted: it confirms session creation, forwards the
//! console's offers and accepts, and answers the client's offers. The
//! console side answers candidate checks on real UDP sockets.

mod common;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use common::{FakeConsole, MORNING};
use remoteplay::config::SessionConfig;
use remoteplay::network::{
    Candidate, CandidateKind, ConnectionRequest, ConsoleType, HolepunchConfig, HolepunchError,
    HolepunchSession, HolepunchState, PortKind, RelayEnd, RelayMessage, SessionAction,
    SessionMessage, SignalingChannel, StreamConnection, StreamError, StreamOutcome, StreamSocket,
    StreamState, UdpTransport,
};
use remoteplay::protocol::{AvKind, ControllerState, CtrlMessage};

const CONSOLE_DUID: [u8; 32] = [0x42; 32];
const CHECK_MSG_SIZE: usize = 88;
const REQ: [u8; 4] = [0x06, 0, 0, 0];
const RESP: [u8; 4] = [0x07, 0, 0, 0];
const REQUEST_ID: std::ops::Range<usize> = 0x4b..0x50;

fn test_config() -> HolepunchConfig {
    HolepunchConfig {
        create_timeout: Duration::from_secs(2),
        start_timeout: Duration::from_secs(2),
        candidate_timeout: Duration::from_secs(2),
        delete_timeout: Duration::from_millis(500),
        stun_servers: Vec::new(),
    }
}

fn console_offer(req_id: u32, port: u16) -> RelayMessage {
    RelayMessage::MessageReceived {
        message: SessionMessage {
            action: SessionAction::Offer,
            req_id,
            error: 0,
            conn_request: Some(ConnectionRequest {
                sid: 0x0102,
                peer_sid: 0,
                skey: [0; 16],
                nat_type: 0,
                candidates: vec![Candidate::new(
                    CandidateKind::Local,
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                    port,
                )],
                default_route_mac: String::new(),
                local_hashed_id: [0x24; 20],
            }),
        },
    }
}

async fn next_client_message(relay: &mut RelayEnd) -> SessionMessage {
    loop {
        let msg = timeout(Duration::from_secs(3), relay.from_client.recv())
            .await
            .expect("Timed out waiting for the client")
            .expect("Relay channel closed");
        if let RelayMessage::SendMessage { message, .. } = msg {
            return message;
        }
    }
}

/// Relay side of one punch round
async fn relay_round(relay: &mut RelayEnd, console_req_id: u32, console_port: u16) -> Candidate {
    relay
        .to_client
        .send(console_offer(console_req_id, console_port))
        .expect("Failed to send offer");

    let result = next_client_message(relay).await;
    assert_eq!(result.action, SessionAction::Result);
    assert_eq!(result.req_id, console_req_id);

    let offer = next_client_message(relay).await;
    assert_eq!(offer.action, SessionAction::Offer);
    let candidates = offer.conn_request.expect("Offer without request").candidates;
    assert_eq!(candidates.len(), 2);
    relay
        .to_client
        .send(RelayMessage::MessageReceived {
            message: SessionMessage::result(offer.req_id),
        })
        .expect("Failed to send result");

    let accept = next_client_message(relay).await;
    assert_eq!(accept.action, SessionAction::Accept);
    relay
        .to_client
        .send(RelayMessage::MessageReceived {
            message: SessionMessage {
                action: SessionAction::Accept,
                req_id: console_req_id + 1,
                error: 0,
                conn_request: None,
            },
        })
        .expect("Failed to send accept");

    let mut selected = accept
        .conn_request
        .expect("Accept without request")
        .candidates;
    assert_eq!(selected.len(), 1);
    selected.remove(0)
}

/// Console side of one candidate check: answer the client's request, send
/// our own and wait for its confirmation. Returns the client's address.
async fn answer_checks(socket: &UdpTransport) -> SocketAddr {
    let console_request_id = [9u8, 8, 7, 6, 5];
    let mut answered = None;
    loop {
        let (data, from) = timeout(Duration::from_secs(3), socket.recv_from())
            .await
            .expect("Timed out waiting for a check message")
            .expect("Failed to receive");
        assert_eq!(data.len(), CHECK_MSG_SIZE);

        if data[..4] == REQ && answered.is_none() {
            let mut response = data.to_vec();
            response[..4].copy_from_slice(&RESP);
            socket
                .send_to(&response, from)
                .await
                .expect("Failed to send response");

            let mut request = vec![0u8; CHECK_MSG_SIZE];
            request[..4].copy_from_slice(&REQ);
            request[REQUEST_ID].copy_from_slice(&console_request_id);
            socket
                .send_to(&request, from)
                .await
                .expect("Failed to send request");
            answered = Some(from);
        } else if data[..4] == RESP && data[REQUEST_ID] == console_request_id {
            assert_eq!(Some(from), answered);
            return from;
        }
    }
}

/// Bring a fresh coordinator to `Started`
async fn started_session() -> (Arc<HolepunchSession>, RelayEnd) {
    let (channel, mut relay) = SignalingChannel::in_memory();
    let session = Arc::new(HolepunchSession::with_channel(channel, test_config()));

    relay
        .to_client
        .send(RelayMessage::SessionCreated {
            session_id: "rp-session".to_string(),
        })
        .expect("Failed to send creation");
    relay
        .to_client
        .send(RelayMessage::MemberJoined {
            device_unique_id: session.client_duid().to_uppercase(),
        })
        .expect("Failed to send join");
    session.create().await.expect("Failed to create session");

    relay
        .to_client
        .send(RelayMessage::MemberJoined {
            device_unique_id: hex::encode(CONSOLE_DUID),
        })
        .expect("Failed to send console join");
    relay
        .to_client
        .send(RelayMessage::CustomData1 { data: [7; 16] })
        .expect("Failed to send custom data");
    session
        .start(&CONSOLE_DUID, ConsoleType::Ps5)
        .await
        .expect("Failed to start session");

    (session, relay)
}

async fn punch_round(
    session: &HolepunchSession,
    relay: &mut RelayEnd,
    kind: PortKind,
    console_req_id: u32,
) -> (Arc<UdpTransport>, UdpTransport) {
    let console = UdpTransport::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind console socket");
    let port = console.local_addr().port();

    let (punched, selected, client) = tokio::join!(
        session.punch(kind),
        relay_round(relay, console_req_id, port),
        answer_checks(&console),
    );
    let punched = punched.expect("Punch round failed");
    assert_eq!(selected.port, port);
    assert_eq!(selected.kind, CandidateKind::Local);

    console
        .connect(client)
        .await
        .expect("Failed to connect console socket");
    (punched, console)
}

/// Test: Both punch rounds
/// Given a relay session with a console that answers candidate checks
/// When the control and data ports are punched
/// Then both sockets reach the console and the state advances in order
#[tokio::test]
async fn test_punch_control_then_data() {
    let (session, mut relay) = started_session().await;
    let mut progress = session.subscribe();
    assert_eq!(*progress.borrow_and_update(), HolepunchState::Started);
    assert_eq!(session.custom_data1(), Some([7; 16]));

    let (control, control_console) = punch_round(&session, &mut relay, PortKind::Control, 100).await;
    assert_eq!(session.state(), HolepunchState::CtrlPunched);
    let (data, data_console) = punch_round(&session, &mut relay, PortKind::Data, 200).await;
    assert_eq!(session.state(), HolepunchState::DataPunched);

    let (ctrl_addr, data_addr) = session.punched_addrs();
    assert_eq!(ctrl_addr, Some(control_console.local_addr()));
    assert_eq!(data_addr, Some(data_console.local_addr()));
    assert_eq!(control.peer_addr(), Some(control_console.local_addr()));
    assert_eq!(data.peer_addr(), Some(data_console.local_addr()));

    relay
        .to_client
        .send(RelayMessage::MemberDeleted)
        .expect("Failed to send deletion");
    session.fini().await.expect("Failed to finish session");
    assert_eq!(session.state(), HolepunchState::Finished);
}

/// Test: Data port first
/// Given a started relay session
/// When the data port is punched before the control port
/// Then the call fails fast and the session stays usable
#[tokio::test]
async fn test_data_port_requires_control() {
    let (session, _relay) = started_session().await;
    assert!(matches!(
        session.punch(PortKind::Data).await,
        Err(HolepunchError::DataBeforeControl)
    ));
    assert_eq!(session.state(), HolepunchState::Started);
}

/// Test: Silent console
/// Given a console offer whose candidate never answers
/// When the control port is punched
/// Then the round fails as unreachable
#[tokio::test]
async fn test_unanswered_candidates_are_unreachable() {
    let (session, mut relay) = started_session().await;
    let silent = UdpTransport::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind silent socket");
    let port = silent.local_addr().port();

    relay
        .to_client
        .send(console_offer(1, port))
        .expect("Failed to send offer");
    let relay_task = async {
        let _ = next_client_message(&mut relay).await;
        let offer = next_client_message(&mut relay).await;
        relay
            .to_client
            .send(RelayMessage::MessageReceived {
                message: SessionMessage::result(offer.req_id),
            })
            .expect("Failed to send result");
    };

    let (result, ()) = tokio::join!(session.punch(PortKind::Control), relay_task);
    assert!(matches!(result, Err(HolepunchError::Unreachable)));
    assert_eq!(session.state(), HolepunchState::Failed);
}

/// Test: Cancel while candidates are checked
/// Given a punch round waiting on a console candidate that never answers
/// When another task cancels the coordinator
/// Then the round ends promptly as cancelled and its candidate sockets close
#[tokio::test]
async fn test_cancel_during_candidate_check() {
    let (session, mut relay) = started_session().await;
    let silent = UdpTransport::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind silent socket");
    let port = silent.local_addr().port();

    relay
        .to_client
        .send(console_offer(1, port))
        .expect("Failed to send offer");
    let relay_task = async {
        let _ = next_client_message(&mut relay).await;
        let offer = next_client_message(&mut relay).await;
        relay
            .to_client
            .send(RelayMessage::MessageReceived {
                message: SessionMessage::result(offer.req_id),
            })
            .expect("Failed to send result");
    };
    let cancel_task = async {
        // First candidate request: the round is now waiting on the console
        let (_, from) = timeout(Duration::from_secs(3), silent.recv_from())
            .await
            .expect("Timed out waiting for a candidate request")
            .expect("Failed to receive");
        session.cancel(false);
        (from, tokio::time::Instant::now())
    };

    let (result, (from, cancelled_at), ()) =
        tokio::join!(session.punch(PortKind::Control), cancel_task, relay_task);
    assert!(matches!(result, Err(HolepunchError::Cancelled)));
    assert!(cancelled_at.elapsed() < Duration::from_millis(500));
    assert_eq!(session.state(), HolepunchState::Failed);

    // A plain bind of the punch port only succeeds once every candidate
    // socket on it is gone
    let rebound = std::net::UdpSocket::bind(("0.0.0.0", from.port()));
    assert!(rebound.is_ok(), "Candidate sockets still bound: {:?}", rebound.err());
}

/// Test: Streaming over punched sockets
/// Given control and data sockets from the punch rounds
/// When the stream handshake runs over them
/// Then the control socket is switched over, the session connects and
/// video arrives on the data socket
#[tokio::test]
async fn test_stream_over_punched_sockets() {
    let (session, mut relay) = started_session().await;
    let (control, control_console) = punch_round(&session, &mut relay, PortKind::Control, 100).await;
    let (data, data_console) = punch_round(&session, &mut relay, PortKind::Data, 200).await;

    let config = SessionConfig {
        morning: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, MORNING),
        ..SessionConfig::default()
    }
    .stream_config("PunchedStreamSession0001")
    .expect("Failed to build stream config");
    let (events, _events_rx) = mpsc::unbounded_channel();
    let (_controller, controller_rx) = watch::channel(ControllerState::default());
    let (frames_tx, mut frames) = mpsc::channel(16);
    let stream = StreamConnection::new(
        config,
        events,
        controller_rx,
        Some(frames_tx),
        tracing::Span::none(),
    );

    let runner = stream.clone();
    let task = tokio::spawn(async move {
        runner
            .run(StreamSocket::Punched { control, data })
            .await
    });

    let mut console = FakeConsole::from_transport(control_console);
    console.accept_connect().await;
    console.accept_switch(true).await;
    console.finish_handshake().await;

    let packet = console.video_packet(3, 0x80, b"punched video");
    data_console
        .send(&packet)
        .await
        .expect("Failed to send video");
    let frame = timeout(Duration::from_secs(3), frames.recv())
        .await
        .expect("Timed out waiting for a frame")
        .expect("Frame channel closed");
    assert_eq!(frame.kind, AvKind::Video);
    assert_eq!(&frame.payload[..], b"punched video");

    stream.stop();
    let outcome = task
        .await
        .expect("Stream task panicked")
        .expect("Stream failed");
    assert_eq!(outcome, StreamOutcome::Stopped);
}

/// Connected control and data socket pairs, client side first
async fn socket_pairs() -> ((Arc<UdpTransport>, UdpTransport), (Arc<UdpTransport>, UdpTransport)) {
    let mut pairs = Vec::new();
    for _ in 0..2 {
        let client = UdpTransport::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind client socket");
        let console = UdpTransport::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind console socket");
        client
            .connect(console.local_addr())
            .await
            .expect("Failed to connect client socket");
        console
            .connect(client.local_addr())
            .await
            .expect("Failed to connect console socket");
        pairs.push((Arc::new(client), console));
    }
    let data = pairs.pop().expect("Missing data pair");
    let control = pairs.pop().expect("Missing control pair");
    (control, data)
}

fn punched_stream(expect_timeout: Duration) -> Arc<StreamConnection> {
    let mut config = SessionConfig {
        morning: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, MORNING),
        ..SessionConfig::default()
    }
    .stream_config("SwitchStreamSession00001")
    .expect("Failed to build stream config");
    config.expect_timeout = expect_timeout;
    let (events, _events_rx) = mpsc::unbounded_channel();
    let (_controller, controller_rx) = watch::channel(ControllerState::default());
    StreamConnection::new(config, events, controller_rx, None, tracing::Span::none())
}

/// Test: Switch acked by echo
/// Given punched sockets and a console that echoes the switch message
/// When the stream handshake runs
/// Then the handshake continues to STREAMINFO and the stream runs
#[tokio::test]
async fn test_switch_acked_by_control_echo() {
    let ((control, control_console), (data, _data_console)) = socket_pairs().await;
    let stream = punched_stream(Duration::from_secs(5));
    let runner = stream.clone();
    let task = tokio::spawn(async move {
        runner
            .run(StreamSocket::Punched { control, data })
            .await
    });

    let mut console = FakeConsole::from_transport(control_console);
    console.accept_connect().await;
    console.accept_switch(false).await;
    console.finish_handshake().await;
    for _ in 0..100 {
        if stream.state() == StreamState::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stream.state(), StreamState::Running);

    stream.stop();
    let outcome = task
        .await
        .expect("Stream task panicked")
        .expect("Stream failed");
    assert_eq!(outcome, StreamOutcome::Stopped);
}

/// Test: Switch never acked
/// Given punched sockets and a console that ignores the switch message
/// When the expect timeout passes
/// Then the stream fails with a switch timeout before any key exchange
#[tokio::test]
async fn test_unacked_switch_times_out() {
    let ((control, control_console), (data, _data_console)) = socket_pairs().await;
    let stream = punched_stream(Duration::from_millis(300));
    let runner = stream.clone();
    let task = tokio::spawn(async move {
        runner
            .run(StreamSocket::Punched { control, data })
            .await
    });

    let mut console = FakeConsole::from_transport(control_console);
    console.accept_connect().await;
    assert_eq!(
        console.recv_ctrl().await,
        CtrlMessage::switch_to_stream_connection()
    );

    let result = timeout(Duration::from_secs(3), task)
        .await
        .expect("Stream did not give up")
        .expect("Stream task panicked");
    assert!(matches!(result, Err(StreamError::SwitchTimeout)));
    assert_eq!(stream.state(), StreamState::Failed);
    assert!(console.drain_session(Duration::from_millis(100)).await.is_empty());
}
