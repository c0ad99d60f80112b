//! UDP datagram transport.
//!
//! Each datagram carries one complete V1 request or response; there is no
//! per-peer connection state and no descriptor passing, so the datagram
//! service rejects FD_PASS and SPLICE modes with `INVALID_MODE`.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use crate::transport::{TransportCaps, TransportResult};

/// Capability flags of the UDP transport
pub const CAPS: TransportCaps = TransportCaps {
    supports_fd_passing: false,
    is_stream: false,
    is_connection_oriented: false,
};

/// Largest datagram the service will send or accept
pub const MAX_DATAGRAM: usize = 65_507;

/// A bound UDP socket serving the datagram path
pub struct DatagramTransport {
    socket: UdpSocket,
}

impl DatagramTransport {
    /// Bind the service socket
    pub fn bind<A: ToSocketAddrs>(addr: A) -> TransportResult<Self> {
        let socket = UdpSocket::bind(addr)?;
        log::info!(
            "Listening on udp {}",
            socket
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".into())
        );
        Ok(Self { socket })
    }

    /// Capability flags (constant for UDP)
    pub fn caps(&self) -> TransportCaps {
        CAPS
    }

    /// Local address the socket is bound to
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive one datagram; returns the payload and the sender
    pub fn recv(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf)?)
    }

    /// Send one datagram back to a peer
    pub fn send_to(&self, payload: &[u8], peer: SocketAddr) -> TransportResult<()> {
        self.socket.send_to(payload, peer)?;
        Ok(())
    }

    /// Set a receive timeout so the service loop can observe shutdown
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> TransportResult<()> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_round_trip() {
        let server = DatagramTransport::bind("127.0.0.1:0").unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = DatagramTransport::bind("127.0.0.1:0").unwrap();

        client.send_to(b"probe", server_addr).unwrap();
        let mut buf = [0u8; 64];
        let (len, peer) = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"probe");
        server.send_to(b"reply", peer).unwrap();

        let (len, _) = client.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"reply");
    }
}
