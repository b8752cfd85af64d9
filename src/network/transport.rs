//! UDP transport layer

use std::net::SocketAddr;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{info, trace};

use super::error::NetworkError;

/// Largest datagram accepted from the network
const MAX_DATAGRAM_SIZE: usize = 2048;

/// UDP socket, optionally connected to a single peer
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind to a local address with SO_REUSEADDR enabled
    pub async fn bind(addr: &str) -> Result<Self, NetworkError> {
        let parsed_addr: SocketAddr = addr.parse()?;
        Self::bind_addr(parsed_addr)
    }

    /// Bind with SO_REUSEADDR. The candidate sockets of a punch round all
    /// sit on the same local port while they wait for the console.
    pub fn bind_addr(addr: SocketAddr) -> Result<Self, NetworkError> {
        Self::open(addr, true)
    }

    /// Bind an ephemeral port in the address family of `peer`. The port is
    /// not shared with any other socket.
    pub fn bind_for(peer: SocketAddr) -> Result<Self, NetworkError> {
        let any: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        Self::open(any, false)
    }

    fn open(addr: SocketAddr, reuse_address: bool) -> Result<Self, NetworkError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        socket.set_reuse_address(reuse_address)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;

        info!(
            "UDP transport bound to {} (SO_REUSEADDR {})",
            local_addr,
            if reuse_address { "enabled" } else { "disabled" }
        );

        Ok(Self { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connected peer, if any
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr().ok()
    }

    /// Restrict the socket to a single peer
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), NetworkError> {
        self.socket.connect(addr).await?;
        info!("UDP transport {} connected to {}", self.local_addr, addr);
        Ok(())
    }

    /// Send to the connected peer
    pub async fn send(&self, data: &[u8]) -> Result<(), NetworkError> {
        self.socket.send(data).await?;
        trace!("Sent {} bytes", data.len());
        Ok(())
    }

    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), NetworkError> {
        self.socket.send_to(data, addr).await?;
        trace!("Sent {} bytes to {}", data.len(), addr);
        Ok(())
    }

    /// Receive one datagram from the connected peer
    pub async fn recv(&self) -> Result<Bytes, NetworkError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let len = self.socket.recv(&mut buf).await?;
        buf.truncate(len);
        trace!("Received {} bytes", len);
        Ok(Bytes::from(buf))
    }

    /// Receive raw bytes with the sender address
    pub async fn recv_from(&self) -> Result<(Bytes, SocketAddr), NetworkError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, addr) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        trace!("Received {} raw bytes from {}", len, addr);
        Ok((Bytes::from(buf), addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_bind() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        assert!(transport.local_addr().port() > 0);
        assert!(transport.peer_addr().is_none());
    }

    #[tokio::test]
    async fn test_connected_send_receive() {
        let a = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr()).await.unwrap();
        b.connect(a.local_addr()).await.unwrap();

        a.send(&[1, 2, 3, 4]).await.unwrap();
        let received = b.recv().await.unwrap();
        assert_eq!(&received[..], &[1, 2, 3, 4]);
        assert_eq!(a.peer_addr(), Some(b.local_addr()));
    }

    /// Test SO_REUSEADDR allows rebinding to same port after drop
    #[tokio::test]
    async fn test_transport_port_reuse() {
        let transport1 = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let port = transport1.local_addr().port();
        let addr = format!("127.0.0.1:{}", port);
        drop(transport1);

        let transport2 = UdpTransport::bind(&addr).await;
        assert!(
            transport2.is_ok(),
            "Should be able to rebind to same port with SO_REUSEADDR"
        );
        assert_eq!(transport2.unwrap().local_addr().port(), port);
    }

    #[tokio::test]
    async fn test_candidate_sockets_share_a_port() {
        let first = UdpTransport::bind_addr(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let port = first.local_addr().port();
        let second = UdpTransport::bind_addr(SocketAddr::from(([127, 0, 0, 1], port)));
        assert!(second.is_ok(), "Reusable sockets should share a port");
    }

    /// Test: Stream socket port is exclusive
    /// Given a stream socket from `bind_for`
    /// When another socket tries to bind the same port, even with SO_REUSEADDR
    /// Then the bind fails
    #[tokio::test]
    async fn test_stream_socket_port_is_exclusive() {
        let stream = UdpTransport::bind_for(SocketAddr::from(([127, 0, 0, 1], 9296))).unwrap();
        let port = stream.local_addr().port();
        assert!(stream.local_addr().ip().is_unspecified());

        let shared = UdpTransport::bind_addr(SocketAddr::from(([0, 0, 0, 0], port)));
        assert!(matches!(shared, Err(NetworkError::Io(_))));
    }
}
