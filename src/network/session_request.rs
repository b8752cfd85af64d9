//! LAN session request
//!
//! Before the stream handshake the console expects one HTTP/1.1 GET on its
//! session port carrying the registration key. A granted request answers
//! with `RP-Nonce`; a refusal carries `RP-Application-Reason`.

use std::net::SocketAddr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::error::SessionRequestError;

/// Largest response header accepted
const MAX_HEADER_SIZE: usize = 4096;

pub const NONCE_SIZE: usize = 16;

const REASON_IN_USE: u32 = 0x8010_8b10;
const REASON_RP_VERSION: u32 = 0x8010_8b11;
const REASON_CRASH: u32 = 0x8010_8b15;
const REASON_UNKNOWN: u32 = 0x8010_8bff;

/// A granted session request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    pub nonce: [u8; NONCE_SIZE],
    /// Protocol version the console reported, if any
    pub rp_version: Option<String>,
}

/// Protocol version we announce
pub fn rp_version(ps5: bool) -> &'static str {
    if ps5 {
        "1.0"
    } else {
        "10.0"
    }
}

fn request_path(ps5: bool) -> &'static str {
    if ps5 {
        "/sie/ps5/rp/sess/init"
    } else {
        "/sie/ps4/rp/sess/init"
    }
}

/// The key is sent up to its first zero byte
fn format_request(addr: SocketAddr, regist_key: &[u8], ps5: bool) -> String {
    let key_len = regist_key
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(regist_key.len());
    format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         User-Agent: remoteplay Windows\r\n\
         Connection: close\r\n\
         Content-Length: 0\r\n\
         RP-Registkey: {}\r\n\
         Rp-Version: {}\r\n\
         \r\n",
        request_path(ps5),
        addr,
        hex::encode(&regist_key[..key_len]),
        rp_version(ps5)
    )
}

/// Ask the console at `addr` for a session. `timeout` bounds the connect
/// and the wait for the response header separately.
pub async fn request_session(
    addr: SocketAddr,
    regist_key: &[u8],
    ps5: bool,
    timeout: Duration,
) -> Result<SessionGrant, SessionRequestError> {
    info!("Requesting session from {}", addr);
    let mut stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Err(_) => return Err(SessionRequestError::Timeout),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            return Err(SessionRequestError::ConnectionRefused)
        }
        Ok(result) => result?,
    };

    stream
        .write_all(format_request(addr, regist_key, ps5).as_bytes())
        .await?;
    let header = tokio::time::timeout(timeout, read_header(&mut stream))
        .await
        .map_err(|_| SessionRequestError::Timeout)??;
    debug!("Session response header:\n{}", header);

    let grant = SessionResponse::parse(&header)?.into_grant(rp_version(ps5))?;
    info!(
        "Session granted (console RP-Version {})",
        grant.rp_version.as_deref().unwrap_or("-")
    );
    Ok(grant)
}

/// Read up to the blank line ending an HTTP header, without the terminator
async fn read_header(stream: &mut TcpStream) -> Result<String, SessionRequestError> {
    let mut buf = BytesMut::with_capacity(512);
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            buf.truncate(end);
            return String::from_utf8(buf.to_vec())
                .map_err(|_| SessionRequestError::Malformed("header is not UTF-8".to_string()));
        }
        if buf.len() >= MAX_HEADER_SIZE {
            return Err(SessionRequestError::Malformed("header too large".to_string()));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(SessionRequestError::Malformed(
                "connection closed inside the header".to_string(),
            ));
        }
    }
}

#[derive(Debug, Default, PartialEq)]
struct SessionResponse {
    code: u16,
    nonce: Option<String>,
    rp_version: Option<String>,
    reason: Option<u32>,
}

impl SessionResponse {
    fn parse(header: &str) -> Result<Self, SessionRequestError> {
        let mut lines = header.split("\r\n");
        let status = lines.next().unwrap_or_default();
        let code = status
            .strip_prefix("HTTP/")
            .and_then(|rest| rest.split_whitespace().nth(1))
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| SessionRequestError::Malformed(format!("status line {:?}", status)))?;

        let mut response = Self {
            code,
            ..Self::default()
        };
        for line in lines {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "RP-Nonce" => response.nonce = Some(value.to_string()),
                "RP-Application-Reason" => {
                    response.reason = u32::from_str_radix(value.trim_start_matches("0x"), 16).ok()
                }
                key if key.eq_ignore_ascii_case("RP-Version") => {
                    response.rp_version = Some(value.to_string())
                }
                _ => {}
            }
        }
        Ok(response)
    }

    fn into_grant(self, ours: &str) -> Result<SessionGrant, SessionRequestError> {
        if self.code == 200 {
            let nonce = self
                .nonce
                .as_deref()
                .and_then(|nonce| BASE64.decode(nonce).ok())
                .and_then(|nonce| <[u8; NONCE_SIZE]>::try_from(nonce).ok())
                .ok_or_else(|| SessionRequestError::Malformed("missing or invalid RP-Nonce".to_string()))?;
            return Ok(SessionGrant {
                nonce,
                rp_version: self.rp_version,
            });
        }

        let reason = self.reason.unwrap_or(REASON_UNKNOWN);
        warn!("Session request refused: HTTP {}, reason {:#x}", self.code, reason);
        match reason {
            REASON_IN_USE => Err(SessionRequestError::InUse),
            REASON_CRASH => Err(SessionRequestError::Crashed),
            REASON_RP_VERSION => Err(SessionRequestError::VersionMismatch(self.rp_version)),
            REASON_UNKNOWN if self.rp_version.as_deref().is_some_and(|v| v != ours) => {
                Err(SessionRequestError::VersionMismatch(self.rp_version))
            }
            other => Err(SessionRequestError::Rejected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    const TIMEOUT: Duration = Duration::from_secs(2);

    /// Console that answers one request with `reply` and returns the
    /// request header it saw
    async fn console(reply: String) -> (SocketAddr, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_header(&mut stream).await.unwrap();
            stream.write_all(reply.as_bytes()).await.unwrap();
            request
        });
        (addr, handle)
    }

    /// Test: Granted session
    /// Given a console that accepts the registration key
    /// When the session is requested
    /// Then the request names the key and version and the nonce is returned
    #[tokio::test]
    async fn test_granted_request() {
        let reply = format!(
            "HTTP/1.1 200 OK\r\nRP-Nonce: {}\r\nRP-Version: 1.0\r\n\r\n",
            BASE64.encode([0x11; NONCE_SIZE])
        );
        let (addr, console) = console(reply).await;

        let grant = request_session(addr, &[0xa1, 0xb2, 0xc3, 0xd4], true, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(grant.nonce, [0x11; NONCE_SIZE]);
        assert_eq!(grant.rp_version.as_deref(), Some("1.0"));

        let request = console.await.unwrap();
        assert!(request.starts_with("GET /sie/ps5/rp/sess/init HTTP/1.1\r\n"));
        assert!(request.contains(&format!("Host: {}\r\n", addr)));
        assert!(request.contains("RP-Registkey: a1b2c3d4\r\n"));
        assert!(request.ends_with("Rp-Version: 1.0"));
    }

    #[test]
    fn test_ps4_request_and_key_cut_at_zero() {
        let addr: SocketAddr = "192.168.1.20:9295".parse().unwrap();
        let request = format_request(addr, &[0xa1, 0xb2, 0, 0x42], false);
        assert!(request.starts_with("GET /sie/ps4/rp/sess/init HTTP/1.1\r\n"));
        assert!(request.contains("RP-Registkey: a1b2\r\n"));
        assert!(request.contains("Rp-Version: 10.0\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_console_in_use() {
        let (addr, _console) =
            console("HTTP/1.1 403 Forbidden\r\nRP-Application-Reason: 0x80108b10\r\n\r\n".to_string())
                .await;
        assert!(matches!(
            request_session(addr, &[1], true, TIMEOUT).await,
            Err(SessionRequestError::InUse)
        ));
    }

    #[tokio::test]
    async fn test_version_mismatch_reports_console_version() {
        let (addr, _console) = console(
            "HTTP/1.1 403 Forbidden\r\nRP-Application-Reason: 80108b11\r\nRP-Version: 9.0\r\n\r\n"
                .to_string(),
        )
        .await;
        match request_session(addr, &[1], false, TIMEOUT).await {
            Err(SessionRequestError::VersionMismatch(version)) => {
                assert_eq!(version.as_deref(), Some("9.0"))
            }
            other => panic!("Expected a version mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_grant_without_nonce_is_malformed() {
        let (addr, _console) = console("HTTP/1.1 200 OK\r\nRP-Version: 1.0\r\n\r\n".to_string()).await;
        assert!(matches!(
            request_session(addr, &[1], true, TIMEOUT).await,
            Err(SessionRequestError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_port_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(matches!(
            request_session(addr, &[1], true, TIMEOUT).await,
            Err(SessionRequestError::ConnectionRefused)
        ));
    }

    #[tokio::test]
    async fn test_silent_console_times_out() {
        // Connections complete from the backlog but nobody answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(matches!(
            request_session(addr, &[1], true, Duration::from_millis(100)).await,
            Err(SessionRequestError::Timeout)
        ));
        drop(listener);
    }

    #[test]
    fn test_bad_status_line_rejected() {
        assert!(matches!(
            SessionResponse::parse("SSH-2.0-OpenSSH\r\nRP-Nonce: x"),
            Err(SessionRequestError::Malformed(_))
        ));
        let response = SessionResponse::parse("HTTP/1.1 200 OK\r\nrp-version: 10.0").unwrap();
        assert_eq!(response.code, 200);
        assert_eq!(response.rp_version.as_deref(), Some("10.0"));
    }
}
