//! TCP stream transport.
//!
//! Wire framing is identical to the Unix transport; descriptor passing is
//! unavailable, so the session layer downgrades FD_PASS requests to COPY
//! at session start.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};

use crate::transport::{Transport, TransportCaps, TransportResult};

/// Capability flags of the TCP transport
pub const CAPS: TransportCaps = TransportCaps {
    supports_fd_passing: false,
    is_stream: true,
    is_connection_oriented: true,
};

/// A connected TCP socket
pub struct TcpTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    /// Wrap an accepted stream with its known peer address
    pub fn with_peer(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer: Some(peer),
        }
    }

    /// Connect to a remote server
    pub fn connect<A: ToSocketAddrs>(addr: A) -> TransportResult<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        Ok(Self { stream, peer })
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TcpTransport {
    fn caps(&self) -> TransportCaps {
        CAPS
    }

    fn peer(&self) -> String {
        match self.peer {
            Some(addr) => format!("tcp:{addr}"),
            None => "tcp:<unknown>".into(),
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn shutdown(&mut self) -> TransportResult<()> {
        self.stream.shutdown(std::net::Shutdown::Both)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}
