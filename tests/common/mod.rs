//! Scripted console for integration tests
//!
//! Speaks the console side of the reliable transport over loopback UDP:
//! answers INIT/COOKIE, acknowledges every sequenced frame, decodes the
//! handshake-open message and replies with its own key exchange. A LAN
//! console also answers session requests on a loopback TCP port.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use remoteplay::network::{
    derive_secret, init_response_body, launch_spec_keystream, KeyPair, StreamKeys, UdpTransport,
};
use remoteplay::protocol::av::is_av_datagram;
use remoteplay::protocol::takion::{decode_data, AUDIO_HEADER_SIZE};
use remoteplay::protocol::{
    AvKind, AvPacket, BangPayload, BigPayload, CtrlMessage, DataType, LaunchSpec, Resolution,
    RudpMessage, RudpType, StreamInfo, TakionMessage,
};

pub const MORNING: [u8; 16] = [0x5a; 16];

pub const NONCE: [u8; 16] = [0x6e; 16];

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Scripted session port: answers every request with one reply and hands
/// the request headers to the test
pub struct SessionPort {
    pub port: u16,
    pub requests: mpsc::UnboundedReceiver<String>,
}

impl SessionPort {
    pub async fn granting() -> Self {
        Self::replying(format!(
            "HTTP/1.1 200 OK\r\nRP-Nonce: {}\r\nRP-Version: 1.0\r\n\r\n",
            BASE64.encode(NONCE)
        ))
        .await
    }

    pub async fn replying(reply: String) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind session port");
        let port = listener
            .local_addr()
            .expect("Failed to read session port")
            .port();
        let (tx, requests) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 512];
                while !request.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = tx.send(String::from_utf8_lossy(&request).into_owned());
                let _ = stream.write_all(reply.as_bytes()).await;
            }
        });
        Self { port, requests }
    }
}

pub struct FakeConsole {
    socket: UdpTransport,
    session: Option<SessionPort>,
    client: Option<SocketAddr>,
    counter: u16,
    client_counter: u16,
    seen: HashSet<(RudpType, u16)>,
    pub keys: Option<StreamKeys>,
    pub big: Option<BigPayload>,
}

impl FakeConsole {
    pub async fn bind() -> Self {
        let socket = UdpTransport::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind console socket");
        let mut console = Self::from_transport(socket);
        console.session = Some(SessionPort::granting().await);
        console
    }

    /// Console on a socket that may already be connected to the client
    pub fn from_transport(socket: UdpTransport) -> Self {
        let client = socket.peer_addr();
        Self {
            socket,
            session: None,
            client,
            counter: 0x1000,
            client_counter: 0,
            seen: HashSet::new(),
            keys: None,
            big: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// TCP port answering session requests, 0 for punched consoles
    pub fn session_port(&self) -> u16 {
        self.session.as_ref().map_or(0, |session| session.port)
    }

    /// Next session request header the console answered
    pub async fn session_request(&mut self) -> String {
        let session = self.session.as_mut().expect("Console has no session port");
        timeout(RECV_TIMEOUT, session.requests.recv())
            .await
            .expect("Timed out waiting for a session request")
            .expect("Session port closed")
    }

    async fn send_frame(&mut self, frame: RudpMessage) {
        let bytes = frame.to_bytes().expect("Failed to encode frame");
        let client = self.client.expect("Client address not known yet");
        self.socket
            .send_to(&bytes, client)
            .await
            .expect("Failed to send frame");
    }

    fn next_counter(&mut self) -> u16 {
        let counter = self.counter;
        self.counter = self.counter.wrapping_add(1);
        counter
    }

    /// Next new frame from the client, skipping AV datagrams, acks and
    /// retransmissions. Sequenced session and control frames are acked.
    pub async fn recv_frame(&mut self) -> RudpMessage {
        loop {
            let (data, from) = timeout(RECV_TIMEOUT, self.socket.recv_from())
                .await
                .expect("Timed out waiting for the client")
                .expect("Failed to receive");
            self.client.get_or_insert(from);
            if is_av_datagram(&data) {
                continue;
            }
            let Ok(frame) = RudpMessage::from_bytes(&data) else {
                continue;
            };
            if frame.kind == RudpType::Ack {
                continue;
            }
            if let Some(counter) = frame.local_counter() {
                if matches!(frame.kind, RudpType::SessionMessage | RudpType::CtrlMessage) {
                    self.send_frame(RudpMessage::ack(counter)).await;
                }
                self.client_counter = counter;
                if !self.seen.insert((frame.kind, counter)) {
                    continue;
                }
            }
            return frame;
        }
    }

    /// Next session-channel protobuf message
    pub async fn recv_session(&mut self) -> TakionMessage {
        loop {
            let frame = self.recv_frame().await;
            if frame.kind != RudpType::SessionMessage {
                continue;
            }
            let body = frame.body();
            let (data_type, record) = decode_data(&body).expect("Failed to decode session body");
            if data_type == DataType::Protobuf {
                return TakionMessage::decode(record).expect("Failed to decode message");
            }
        }
    }

    /// Next control-channel message
    pub async fn recv_ctrl(&mut self) -> CtrlMessage {
        loop {
            let frame = self.recv_frame().await;
            if frame.kind == RudpType::CtrlMessage {
                return CtrlMessage::from_bytes(&frame.body()).expect("Failed to decode ctrl");
            }
        }
    }

    /// Session messages received within `window`
    pub async fn drain_session(&mut self, window: Duration) -> Vec<TakionMessage> {
        let mut messages = Vec::new();
        let _ = timeout(window, async {
            loop {
                messages.push(self.recv_session().await);
            }
        })
        .await;
        messages
    }

    pub async fn send_session(&mut self, message: &TakionMessage) {
        let body = message.to_body().expect("Failed to encode message");
        let counter = self.next_counter();
        let frame = RudpMessage::sequenced(RudpType::SessionMessage, counter, &body, self.client_counter);
        self.send_frame(frame).await;
    }

    pub async fn send_ctrl(&mut self, message: &CtrlMessage) {
        let counter = self.next_counter();
        let frame = RudpMessage::sequenced(
            RudpType::CtrlMessage,
            counter,
            &message.to_bytes(),
            self.client_counter,
        );
        self.send_frame(frame).await;
    }

    pub async fn send_raw_body(&mut self, body: Bytes) {
        let counter = self.next_counter();
        let frame = RudpMessage::sequenced(RudpType::SessionMessage, counter, &body, self.client_counter);
        self.send_frame(frame).await;
    }

    /// Answer INIT and COOKIE
    pub async fn accept_connect(&mut self) {
        let init = self.recv_frame().await;
        assert_eq!(init.kind, RudpType::InitRequest);
        let counter = self.next_counter();
        let reply = RudpMessage::sequenced(
            RudpType::InitResponse,
            counter,
            &init_response_body(0x0bad_cafe, b"console-cookie"),
            init.local_counter().expect("INIT without counter"),
        );
        self.send_frame(reply).await;

        let cookie = self.recv_frame().await;
        assert_eq!(cookie.kind, RudpType::CookieRequest);
        assert_eq!(&cookie.body()[..], b"console-cookie");
        let counter = self.next_counter();
        let reply = RudpMessage::sequenced(
            RudpType::CookieResponse,
            counter,
            &[],
            cookie.local_counter().expect("COOKIE without counter"),
        );
        self.send_frame(reply).await;
    }

    /// Wait for the handshake-open message and keep it
    pub async fn recv_big(&mut self) -> BigPayload {
        match self.recv_session().await {
            TakionMessage::Big(big) => {
                self.big = Some(big.clone());
                big
            }
            other => panic!("Expected BIG, got {:?}", other),
        }
    }

    /// Build the key exchange reply. With `valid_signature` false the
    /// public key is signed with the wrong handshake key.
    pub fn bang(&mut self, big: &BigPayload, valid_signature: bool) -> TakionMessage {
        let mut spec = BASE64
            .decode(&big.launch_spec)
            .expect("Launch spec is not base64");
        launch_spec_keystream(&MORNING, &big.session_key)
            .expect("Failed to build launch spec keystream")
            .decrypt(0, &mut spec)
            .expect("Failed to decrypt launch spec");
        let handshake_key = LaunchSpec::from_json(&spec)
            .expect("Launch spec is not JSON")
            .handshake_key()
            .expect("Launch spec without handshake key");

        let keypair = KeyPair::generate();
        let secret = derive_secret(&keypair, &big.ecdh_pub_key, &big.ecdh_sig, &handshake_key)
            .expect("Client signature did not verify");
        self.keys = Some(StreamKeys::new(&secret, &handshake_key).expect("Failed to build keys"));

        let signing_key = if valid_signature {
            handshake_key
        } else {
            [0xee; 16]
        };
        TakionMessage::Bang(BangPayload {
            version_accepted: true,
            encrypted_key_accepted: true,
            ecdh_pub_key: keypair.public_key_bytes().to_vec(),
            ecdh_sig: keypair.signature(&signing_key).expect("Failed to sign"),
        })
    }

    /// Connect, exchange keys and send stream parameters. Returns once the
    /// client acknowledged them.
    pub async fn complete_handshake(&mut self) {
        self.accept_connect().await;
        self.finish_handshake().await;
    }

    /// Wait for the stream connection switch on a punched socket. Acks with
    /// a TAKION_SWITCH_ACK frame, or by echoing the control message.
    pub async fn accept_switch(&mut self, ack_frame: bool) {
        let ctrl = self.recv_ctrl().await;
        assert_eq!(ctrl, CtrlMessage::switch_to_stream_connection());
        if ack_frame {
            let counter = self.next_counter();
            let ack = RudpMessage::sequenced(RudpType::TakionSwitchAck, counter, &[], self.client_counter);
            self.send_frame(ack).await;
        } else {
            self.send_ctrl(&CtrlMessage::switch_to_stream_connection()).await;
        }
    }

    /// Key exchange and stream parameters, after the transport connected
    pub async fn finish_handshake(&mut self) {
        let big = self.recv_big().await;
        let bang = self.bang(&big, true);
        self.send_session(&bang).await;
        self.send_session(&stream_info()).await;
        self.expect_stream_info_ack().await;
    }

    pub async fn expect_stream_info_ack(&mut self) {
        loop {
            match self.recv_session().await {
                TakionMessage::StreamInfoAck => return,
                TakionMessage::Heartbeat => continue,
                other => panic!("Expected STREAMINFOACK, got {:?}", other),
            }
        }
    }

    /// Encrypted video packet as the console sends it
    pub fn video_packet(&self, packet_index: u16, key_pos: u32, plaintext: &[u8]) -> Bytes {
        let keys = self.keys.as_ref().expect("Keys not negotiated");
        let packet = AvPacket {
            kind: AvKind::Video,
            packet_index,
            frame_index: 1,
            key_pos,
            payload: Bytes::new(),
        };
        let mut payload = plaintext.to_vec();
        keys.remote
            .encrypt(packet.decrypt_position(), &mut payload)
            .expect("Failed to encrypt");
        AvPacket {
            payload: Bytes::from(payload),
            ..packet
        }
        .to_bytes()
    }

    pub async fn send_datagram(&self, data: &[u8]) {
        let client = self.client.expect("Client address not known yet");
        self.socket
            .send_to(data, client)
            .await
            .expect("Failed to send datagram");
    }
}

pub fn stream_info() -> TakionMessage {
    TakionMessage::StreamInfo(StreamInfo {
        audio_header: vec![0x02; AUDIO_HEADER_SIZE],
        resolutions: vec![Resolution {
            width: 1280,
            height: 720,
            video_header: vec![0, 0, 0, 1, 0x67],
        }],
    })
}
