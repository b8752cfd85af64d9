//! STUN binding requests for holepunch candidate discovery
//!
//! RFC 5389 binding request on the socket that will later be punched, so
//! the mapped address matches the NAT binding the console must reach.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use super::error::NetworkError;
use super::transport::UdpTransport;
use crate::protocol::wire::ByteReader;
use crate::protocol::ProtocolError;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

const MAPPED_ADDRESS: u16 = 0x0001;
const XOR_MAPPED_ADDRESS: u16 = 0x0020;

const MAGIC_COOKIE: u32 = 0x2112A442;

const FAMILY_IPV4: u8 = 0x01;

/// Servers tried in order when the configuration names none
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

/// Default wait for one server's answer
pub const STUN_TIMEOUT: Duration = Duration::from_millis(3000);

/// Mapped address reported by a STUN server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunResult {
    pub mapped_address: SocketAddr,
    pub server: String,
}

/// Ask each server in turn until one reports our mapped address
pub async fn discover_mapped_address(
    transport: &UdpTransport,
    servers: &[String],
    wait: Duration,
) -> Result<StunResult, NetworkError> {
    for server in servers {
        match binding_request(transport, server, wait).await {
            Ok(result) => return Ok(result),
            Err(e) => warn!("STUN request to {} failed: {}", server, e),
        }
    }
    Err(NetworkError::StunFailed("all STUN servers failed".to_string()))
}

/// Send one binding request from `transport` to `server`
pub async fn binding_request(
    transport: &UdpTransport,
    server: &str,
    wait: Duration,
) -> Result<StunResult, NetworkError> {
    let server_addr = tokio::net::lookup_host(server)
        .await
        .map_err(|e| NetworkError::StunFailed(format!("DNS lookup failed: {}", e)))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| NetworkError::StunFailed("no IPv4 address".to_string()))?;

    debug!("Sending STUN binding request to {}", server_addr);
    let transaction_id: [u8; 12] = rand::random();
    transport
        .send_to(&build_binding_request(&transaction_id), server_addr)
        .await?;

    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let (data, from) = timeout(
            deadline.saturating_duration_since(tokio::time::Instant::now()),
            transport.recv_from(),
        )
        .await
        .map_err(|_| NetworkError::StunFailed("timeout".to_string()))??;
        if from != server_addr {
            debug!("Ignoring datagram from {} during STUN", from);
            continue;
        }
        let mapped_address = parse_binding_response(&data, &transaction_id)?;
        info!("STUN mapped address {} via {}", mapped_address, server);
        return Ok(StunResult {
            mapped_address,
            server: server.to_string(),
        });
    }
}

fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(20);
    msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(transaction_id);
    msg
}

fn stun_error(reason: &str) -> NetworkError {
    NetworkError::StunFailed(reason.to_string())
}

fn parse_binding_response(
    data: &[u8],
    expected_txn_id: &[u8; 12],
) -> Result<SocketAddr, NetworkError> {
    let mut r = ByteReader::new(data);
    let (msg_type, msg_len, cookie, txn_id) =
        read_header(&mut r).map_err(|_| stun_error("response too short"))?;

    if msg_type != BINDING_RESPONSE {
        return Err(NetworkError::StunFailed(format!(
            "unexpected message type 0x{:04x}",
            msg_type
        )));
    }
    if cookie != MAGIC_COOKIE {
        return Err(stun_error("invalid magic cookie"));
    }
    if &txn_id != expected_txn_id {
        return Err(stun_error("transaction id mismatch"));
    }

    let attrs = r
        .read_bytes(msg_len as usize)
        .map_err(|_| stun_error("message truncated"))?;
    let mut attrs = ByteReader::new(attrs);
    while attrs.remaining() >= 4 {
        let (attr_type, attr_len) = match (attrs.read_u16(), attrs.read_u16()) {
            (Ok(t), Ok(l)) => (t, l as usize),
            _ => break,
        };
        let Ok(value) = attrs.read_bytes(attr_len) else {
            break;
        };
        match attr_type {
            XOR_MAPPED_ADDRESS => return parse_address(value, true),
            MAPPED_ADDRESS => return parse_address(value, false),
            _ => {}
        }
        // Attributes are padded to 4 bytes
        let padding = (4 - attr_len % 4) % 4;
        if attrs.skip(padding).is_err() {
            break;
        }
    }
    Err(stun_error("no mapped address in response"))
}

fn read_header(r: &mut ByteReader<'_>) -> Result<(u16, u16, u32, [u8; 12]), ProtocolError> {
    Ok((r.read_u16()?, r.read_u16()?, r.read_u32()?, r.read_array::<12>()?))
}

fn parse_address(value: &[u8], xor: bool) -> Result<SocketAddr, NetworkError> {
    if value.len() < 8 {
        return Err(stun_error("mapped address too short"));
    }
    if value[1] != FAMILY_IPV4 {
        return Err(NetworkError::StunFailed(format!(
            "unsupported address family {}",
            value[1]
        )));
    }
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let mut addr = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
        addr ^= MAGIC_COOKIE;
    }
    Ok(SocketAddr::new(Ipv4Addr::from(addr).into(), port))
}
