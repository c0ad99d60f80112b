//! # Transport Abstraction
//!
//! One surface over the three supported transports:
//! - **Unix domain stream** — the only transport that can carry open file
//!   descriptors, as `SCM_RIGHTS` ancillary data
//! - **TCP stream** — byte-identical framing, no descriptor passing
//! - **UDP datagram** — one V1 request per datagram, served by a single
//!   shared worker
//!
//! Stream transports implement [`Transport`] (blocking `Read`/`Write`
//! plus descriptor passing); the datagram path uses
//! [`DatagramTransport`] directly since it has no per-connection stream.
//! Capability flags tell the session layer what it may rely on.

use std::io::{Read, Write};
use std::os::fd::{OwnedFd, RawFd};

use thiserror::Error;

pub mod tcp;
pub mod udp;
pub mod unix;

pub use tcp::TcpTransport;
pub use udp::DatagramTransport;
pub use unix::UnixTransport;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Underlying socket I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Descriptor passing requested on a transport that cannot carry it
    #[error("Transport '{0}' does not support descriptor passing")]
    FdPassingUnsupported(&'static str),

    /// Peer closed the connection mid-message
    #[error("Connection closed by peer")]
    Closed,

    /// An ancillary message arrived without the expected descriptor
    #[error("Expected an ancillary descriptor, none was attached")]
    MissingDescriptor,
}

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

impl From<nix::Error> for TransportError {
    fn from(err: nix::Error) -> Self {
        TransportError::Io(std::io::Error::from_raw_os_error(err as i32))
    }
}

/// What a transport can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCaps {
    /// Can carry open descriptors as ancillary data
    pub supports_fd_passing: bool,

    /// Byte-stream semantics (framing may span packets)
    pub is_stream: bool,

    /// Has per-peer connection state
    pub is_connection_oriented: bool,
}

/// A connected, stream-oriented transport endpoint
pub trait Transport: Read + Write + Send {
    /// Capability flags for this transport
    fn caps(&self) -> TransportCaps;

    /// Peer description for logging
    fn peer(&self) -> String;

    /// Raw socket descriptor, used for kernel-side splice delivery
    fn raw_fd(&self) -> RawFd;

    /// Send one descriptor as ancillary data attached to a one-byte
    /// carrier message
    fn send_fd(&mut self, fd: RawFd) -> TransportResult<()> {
        let _ = fd;
        Err(TransportError::FdPassingUnsupported(self.name()))
    }

    /// Receive one ancillary descriptor (consumes the one-byte carrier)
    fn recv_fd(&mut self) -> TransportResult<OwnedFd> {
        Err(TransportError::FdPassingUnsupported(self.name()))
    }

    /// Shut down both directions
    fn shutdown(&mut self) -> TransportResult<()>;

    /// Short transport name for diagnostics
    fn name(&self) -> &'static str;
}

/// Listening socket for the stream transports
pub enum TransportListener {
    /// Unix domain stream listener
    Unix(std::os::unix::net::UnixListener),
    /// TCP listener
    Tcp(std::net::TcpListener),
}

impl TransportListener {
    /// Bind a Unix stream listener, replacing a stale socket file
    pub fn bind_unix(path: &std::path::Path) -> TransportResult<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = std::os::unix::net::UnixListener::bind(path)?;
        log::info!("Listening on unix socket {}", path.display());
        Ok(TransportListener::Unix(listener))
    }

    /// Bind a TCP listener
    pub fn bind_tcp(host: &str, port: u16) -> TransportResult<Self> {
        let listener = std::net::TcpListener::bind((host, port))?;
        log::info!("Listening on tcp {host}:{port}");
        Ok(TransportListener::Tcp(listener))
    }

    /// Accept one connection, boxed behind the transport trait
    pub fn accept(&self) -> TransportResult<Box<dyn Transport>> {
        match self {
            TransportListener::Unix(listener) => {
                let (stream, _addr) = listener.accept()?;
                Ok(Box::new(UnixTransport::new(stream)))
            }
            TransportListener::Tcp(listener) => {
                let (stream, addr) = listener.accept()?;
                stream.set_nodelay(true)?;
                Ok(Box::new(TcpTransport::with_peer(stream, addr)))
            }
        }
    }
}
