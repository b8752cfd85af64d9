//! Session tests against a scripted console on loopback
//!
//! Covers the LAN handshake, key exchange failures, peer disconnects,
//! early stream parameters and teardown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use common::{stream_info, FakeConsole, SessionPort, MORNING, NONCE};
use remoteplay::config::SessionConfig;
use remoteplay::network::{
    CryptoError, Event, EventReceiver, QuitReason, Session, StreamConnection, StreamError,
    StreamSocket, StreamState,
};
use remoteplay::protocol::takion::CLIENT_DISCONNECT_REASON;
use remoteplay::protocol::{
    AvKind, BangPayload, ControllerState, CtrlMessage, CtrlType, TakionMessage,
};

fn lan_config(console: &FakeConsole) -> SessionConfig {
    SessionConfig {
        host: Some(console.addr().to_string()),
        session_port: console.session_port(),
        regist_key: "a1b2c3d4".to_string(),
        morning: BASE64.encode(MORNING),
        expect_timeout_ms: 1000,
        ..SessionConfig::default()
    }
}

async fn next_event(events: &mut EventReceiver) -> Event {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("Timed out waiting for an event")
        .expect("Event channel closed")
}

/// Skip events until one matches
async fn wait_for(events: &mut EventReceiver, matches: impl Fn(&Event) -> bool) -> Event {
    loop {
        let event = next_event(events).await;
        if matches(&event) {
            return event;
        }
    }
}

async fn wait_for_quit(events: &mut EventReceiver) -> (QuitReason, Option<String>) {
    match wait_for(events, |e| matches!(e, Event::Quit { .. })).await {
        Event::Quit { reason, message } => (reason, message),
        _ => unreachable!(),
    }
}

async fn connected_session() -> (FakeConsole, Session, EventReceiver) {
    let mut console = FakeConsole::bind().await;
    let (session, mut events) = Session::new(lan_config(&console));
    session.start().expect("Failed to start session");
    console.complete_handshake().await;
    wait_for(&mut events, |e| *e == Event::Connected).await;
    (console, session, events)
}

/// Test: LAN handshake
/// Given a console on the LAN and a valid registration secret
/// When the session starts
/// Then the handshake completes and the connected event fires
#[tokio::test]
async fn test_lan_handshake_connects() {
    let mut console = FakeConsole::bind().await;
    let (session, mut events) = Session::new(lan_config(&console));
    session.start().expect("Failed to start session");

    console.accept_connect().await;
    let big = console.recv_big().await;
    assert_eq!(big.client_version, 12, "PS5 protocol version");
    assert_eq!(big.session_key, session.session_id());
    assert_eq!(big.ecdh_pub_key.len(), 32);
    assert_eq!(big.encrypted_key, vec![0; 4]);

    let bang = console.bang(&big, true);
    console.send_session(&bang).await;
    console.send_session(&stream_info()).await;
    console.expect_stream_info_ack().await;

    // Controller announced, microphone stream opened
    match console.recv_session().await {
        TakionMessage::ControllerConnection { connected, .. } => assert!(connected),
        other => panic!("Expected controller connection, got {:?}", other),
    }
    match console.recv_session().await {
        TakionMessage::StreamInfo(info) => assert!(info.resolutions.is_empty()),
        other => panic!("Expected microphone stream info, got {:?}", other),
    }
    assert_eq!(console.recv_ctrl().await.kind(), Some(CtrlType::MicConnect));

    wait_for(&mut events, |e| *e == Event::Connected).await;
    assert_eq!(session.stream_state(), Some(StreamState::Running));

    // The session request went first, with the registration key
    let request = console.session_request().await;
    assert!(request.starts_with("GET /sie/ps5/rp/sess/init HTTP/1.1\r\n"));
    assert!(request.contains("RP-Registkey: a1b2c3d4\r\n"));
    assert_eq!(session.session_nonce(), Some(NONCE));

    session.stop();
    assert_eq!(wait_for_quit(&mut events).await, (QuitReason::Stopped, None));
    session.join().await;
}

/// Test: Forged key exchange reply
/// Given a console whose reply carries a public key with an invalid signature
/// When the handshake processes the reply
/// Then it fails with a cryptographic failure and no keystream exists
#[tokio::test]
async fn test_invalid_signature_fails_closed() {
    let mut console = FakeConsole::bind().await;
    let config = lan_config(&console)
        .stream_config("SignatureTestSession0001")
        .expect("Failed to build stream config");
    let (events, _receiver) = mpsc::unbounded_channel();
    let (_controller, controller_rx) = watch::channel(ControllerState::default());
    let stream = StreamConnection::new(config, events, controller_rx, None, tracing::Span::none());

    let addr = console.addr();
    let runner = Arc::clone(&stream);
    let task = tokio::spawn(async move { runner.run(StreamSocket::Direct(addr)).await });

    console.accept_connect().await;
    let big = console.recv_big().await;
    let bang = console.bang(&big, false);
    console.send_session(&bang).await;

    let result = task.await.expect("Stream task panicked");
    let error = result.expect_err("Handshake should fail");
    assert!(matches!(
        error,
        StreamError::Crypto(CryptoError::SignatureMismatch)
    ));
    assert_eq!(
        QuitReason::from_stream_error(&error),
        QuitReason::CryptoFailure
    );
    assert!(!stream.keys_installed(), "No keystream after a bad signature");
    assert_eq!(stream.state(), StreamState::Failed);
}

/// Test: Forged key exchange reply through the session
/// Given a console that signs its key with the wrong handshake key
/// When the session runs
/// Then the quit event carries an error reason and no connected event fires
#[tokio::test]
async fn test_invalid_signature_quits_session() {
    let mut console = FakeConsole::bind().await;
    let (session, mut events) = Session::new(lan_config(&console));
    session.start().expect("Failed to start session");

    console.accept_connect().await;
    let big = console.recv_big().await;
    let bang = console.bang(&big, false);
    console.send_session(&bang).await;

    let event = next_event(&mut events).await;
    match event {
        Event::Quit { reason, message } => {
            assert_eq!(reason, QuitReason::CryptoFailure);
            assert!(reason.is_error());
            assert!(message.is_some());
        }
        other => panic!("Expected quit, got {:?}", other),
    }
    session.join().await;
}

/// Test: Version rejected
/// Given a console that refuses our protocol version
/// When the reply arrives
/// Then the session quits with a version mismatch
#[tokio::test]
async fn test_version_rejected() {
    let mut console = FakeConsole::bind().await;
    let (session, mut events) = Session::new(lan_config(&console));
    session.start().expect("Failed to start session");

    console.accept_connect().await;
    let _ = console.recv_big().await;
    console
        .send_session(&TakionMessage::Bang(BangPayload {
            version_accepted: false,
            ..BangPayload::default()
        }))
        .await;

    let (reason, _) = wait_for_quit(&mut events).await;
    assert_eq!(reason, QuitReason::VersionMismatch);
    session.join().await;
}

/// Test: Console goes to sleep
/// Given a running session
/// When the console disconnects with "console going to sleep"
/// Then the session closes with that reason and a non-error quit code
#[tokio::test]
async fn test_remote_disconnect_reason() {
    let (mut console, session, mut events) = connected_session().await;

    console
        .send_session(&TakionMessage::Disconnect {
            reason: "console going to sleep".to_string(),
        })
        .await;

    let (reason, message) = wait_for_quit(&mut events).await;
    assert_eq!(reason, QuitReason::RemoteDisconnected);
    assert!(!reason.is_error());
    assert_eq!(message.as_deref(), Some("console going to sleep"));

    session.join().await;
    assert_eq!(session.stream_state(), Some(StreamState::Closed));

    // Our own disconnect notice still goes out
    loop {
        if let TakionMessage::Disconnect { reason } = console.recv_session().await {
            assert_eq!(reason, CLIENT_DISCONNECT_REASON);
            break;
        }
    }
}

/// Test: Stream parameters before the key exchange reply
/// Given a console that sends STREAMINFO before BANG
/// When the key exchange completes
/// Then the buffered parameters are processed exactly once
#[tokio::test]
async fn test_early_stream_info_processed_once() {
    let mut console = FakeConsole::bind().await;
    let (session, mut events) = Session::new(lan_config(&console));
    session.start().expect("Failed to start session");

    console.accept_connect().await;
    let big = console.recv_big().await;
    let bang = console.bang(&big, true);
    console.send_session(&stream_info()).await;
    console.send_session(&bang).await;

    console.expect_stream_info_ack().await;
    wait_for(&mut events, |e| *e == Event::Connected).await;

    let later = console.drain_session(Duration::from_millis(300)).await;
    assert!(
        !later.contains(&TakionMessage::StreamInfoAck),
        "STREAMINFO acknowledged twice"
    );

    session.stop();
    wait_for_quit(&mut events).await;
    session.join().await;
}

/// Test: Stop twice
/// Given a running session
/// When stop is called twice
/// Then exactly one quit event and one disconnect notice are produced
#[tokio::test]
async fn test_stop_is_idempotent() {
    let (mut console, session, mut events) = connected_session().await;

    session.stop();
    session.stop();
    assert_eq!(wait_for_quit(&mut events).await, (QuitReason::Stopped, None));
    session.join().await;
    session.stop();

    let messages = console.drain_session(Duration::from_millis(500)).await;
    let disconnects = messages
        .iter()
        .filter(|m| matches!(m, TakionMessage::Disconnect { .. }))
        .count();
    assert_eq!(disconnects, 1);
    assert!(events.try_recv().is_err(), "Only one quit event");
    assert_eq!(session.stream_state(), Some(StreamState::Closed));
}

/// Test: Control channel
/// Given a running session
/// When the console assigns a session id and asks for a PIN
/// Then the host is told and the PIN reaches the console
#[tokio::test]
async fn test_control_messages_reach_host() {
    let (mut console, session, mut events) = connected_session().await;

    let mut session_id = vec![24u8];
    session_id.extend_from_slice(b"ConsoleSession0123456789");
    console
        .send_ctrl(&CtrlMessage::new(CtrlType::SessionId, session_id))
        .await;
    console
        .send_ctrl(&CtrlMessage::new(CtrlType::LoginPinRequest, Vec::new()))
        .await;

    let event = wait_for(&mut events, |e| {
        matches!(e, Event::RegistrationFinished { .. })
    })
    .await;
    assert_eq!(
        event,
        Event::RegistrationFinished {
            session_id: "ConsoleSession0123456789".to_string()
        }
    );
    let event = wait_for(&mut events, |e| matches!(e, Event::LoginPinRequested { .. })).await;
    assert_eq!(event, Event::LoginPinRequested { pin_incorrect: false });

    session
        .set_login_pin("1234")
        .await
        .expect("Failed to send PIN");
    loop {
        let ctrl = console.recv_ctrl().await;
        if ctrl.kind() == Some(CtrlType::LoginPinReply) {
            assert_eq!(&ctrl.payload[..], b"1234");
            break;
        }
    }

    // Microphone starts muted
    assert!(!session.toggle_mute().await.expect("Failed to toggle mute"));
    session.go_home().await.expect("Failed to send home");

    session.stop();
    wait_for_quit(&mut events).await;
    session.join().await;
}

/// Test: Heartbeats while idle
/// Given a running session with no traffic
/// When a few heartbeat intervals pass
/// Then the client sends heartbeats
#[tokio::test]
async fn test_heartbeat_while_idle() {
    let (mut console, session, mut events) = connected_session().await;

    let messages = console.drain_session(Duration::from_millis(2500)).await;
    let heartbeats = messages
        .iter()
        .filter(|m| **m == TakionMessage::Heartbeat)
        .count();
    assert!(heartbeats >= 1, "Expected heartbeats, got {:?}", messages);

    session.stop();
    wait_for_quit(&mut events).await;
    session.join().await;
}

/// Test: Rumble and quality
/// Given a running session
/// When the console sends a quality report and a rumble record
/// Then the quality average updates and a rumble event fires
#[tokio::test]
async fn test_rumble_and_quality() {
    let (mut console, session, mut events) = connected_session().await;

    console
        .send_session(&TakionMessage::ConnectionQuality(
            remoteplay::protocol::ConnectionQuality {
                target_bitrate: 9000,
                rtt: 15.0,
                ..Default::default()
            },
        ))
        .await;
    let rumble = remoteplay::protocol::takion::encode_data(
        remoteplay::protocol::DataType::Rumble,
        &[0, 40, 80],
    )
    .expect("Failed to encode rumble");
    console.send_raw_body(rumble).await;

    let event = wait_for(&mut events, |e| matches!(e, Event::Rumble(_))).await;
    match event {
        Event::Rumble(rumble) => {
            assert_eq!(rumble.left, 40);
            assert_eq!(rumble.right, 80);
        }
        _ => unreachable!(),
    }
    let quality = session.quality().expect("No quality sample");
    assert_eq!(quality.samples, 1);
    assert_eq!(quality.target_bitrate, 9000.0);

    session.stop();
    wait_for_quit(&mut events).await;
    session.join().await;
}

/// Test: Video delivery
/// Given a running session with a frame consumer attached
/// When the console sends an encrypted video packet
/// Then the consumer receives the decrypted payload
#[tokio::test]
async fn test_video_packet_decrypted() {
    let mut console = FakeConsole::bind().await;
    let (frames_tx, mut frames) = mpsc::channel(16);
    let (session, mut events) = Session::new(lan_config(&console));
    let session = session.with_av_frames(frames_tx);
    session.start().expect("Failed to start session");
    console.complete_handshake().await;
    wait_for(&mut events, |e| *e == Event::Connected).await;

    let packet = console.video_packet(7, 0x40, b"video frame slice");
    console.send_datagram(&packet).await;

    let frame = timeout(Duration::from_secs(3), frames.recv())
        .await
        .expect("Timed out waiting for a frame")
        .expect("Frame channel closed");
    assert_eq!(frame.kind, AvKind::Video);
    assert_eq!(frame.packet_index, 7);
    assert_eq!(&frame.payload[..], b"video frame slice");

    session.stop();
    wait_for_quit(&mut events).await;
    session.join().await;
}

/// Test: Console already in use
/// Given a console whose session port reports remote play in use
/// When the session starts
/// Then it quits with the in-use reason before any stream traffic
#[tokio::test]
async fn test_console_in_use_quits_before_streaming() {
    let mut console = FakeConsole::bind().await;
    let mut busy = SessionPort::replying(
        "HTTP/1.1 403 Forbidden\r\nRP-Application-Reason: 0x80108b10\r\n\r\n".to_string(),
    )
    .await;
    let config = SessionConfig {
        session_port: busy.port,
        ..lan_config(&console)
    };
    let (session, mut events) = Session::new(config);
    session.start().expect("Failed to start session");

    let (reason, message) = wait_for_quit(&mut events).await;
    assert_eq!(reason, QuitReason::SessionRequestInUse);
    assert!(message.is_some());
    assert!(busy.requests.recv().await.is_some());
    assert!(session.session_nonce().is_none());
    assert!(session.stream_state().is_none());
    session.join().await;

    // The granting port of the scripted console was never asked
    assert!(timeout(Duration::from_millis(50), console.session_request())
        .await
        .is_err());
}
