//! Unix domain stream transport with `SCM_RIGHTS` descriptor passing.
//!
//! Descriptors ride as ancillary data attached to a one-byte carrier
//! message, so the byte stream stays in lockstep with the descriptor
//! stream: the receiver consumes the carrier byte exactly where the
//! sender attached the descriptor.

use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

use crate::transport::{Transport, TransportCaps, TransportError, TransportResult};

/// Capability flags of the Unix stream transport
pub const CAPS: TransportCaps = TransportCaps {
    supports_fd_passing: true,
    is_stream: true,
    is_connection_oriented: true,
};

/// A connected Unix domain stream socket
pub struct UnixTransport {
    stream: UnixStream,
}

impl UnixTransport {
    /// Wrap an accepted stream
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Connect to a listening socket
    pub fn connect<P: AsRef<Path>>(path: P) -> TransportResult<Self> {
        Ok(Self {
            stream: UnixStream::connect(path)?,
        })
    }
}

impl Read for UnixTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for UnixTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for UnixTransport {
    fn caps(&self) -> TransportCaps {
        CAPS
    }

    fn peer(&self) -> String {
        match self.stream.peer_addr() {
            Ok(addr) => format!("unix:{addr:?}"),
            Err(_) => "unix:<unknown>".into(),
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn send_fd(&mut self, fd: RawFd) -> TransportResult<()> {
        let carrier = [0u8];
        let iov = [IoSlice::new(&carrier)];
        let fds = [fd];
        let cmsgs = [ControlMessage::ScmRights(&fds)];
        sendmsg::<()>(
            self.stream.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            None,
        )?;
        Ok(())
    }

    fn recv_fd(&mut self) -> TransportResult<OwnedFd> {
        let mut carrier = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut carrier)];
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; 2]);

        let msg = recvmsg::<()>(
            self.stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        )?;
        if msg.bytes == 0 {
            return Err(TransportError::Closed);
        }
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(&fd) = fds.first() {
                    // The kernel installed a fresh descriptor in our table;
                    // we own it from here.
                    return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
        }
        Err(TransportError::MissingDescriptor)
    }

    fn shutdown(&mut self) -> TransportResult<()> {
        self.stream.shutdown(std::net::Shutdown::Both)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "unix"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    #[test]
    fn test_fd_passing_round_trip() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sender = UnixTransport::new(a);
        let mut receiver = UnixTransport::new(b);

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"descriptor payload").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        sender.send_fd(file.as_raw_fd()).unwrap();
        let received = receiver.recv_fd().unwrap();

        let mut clone = std::fs::File::from(received);
        let mut contents = String::new();
        clone.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "descriptor payload");
    }

    #[test]
    fn test_bytes_and_fd_interleave_in_order() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sender = UnixTransport::new(a);
        let mut receiver = UnixTransport::new(b);

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"x").unwrap();

        sender.write_all(b"header").unwrap();
        sender.send_fd(file.as_raw_fd()).unwrap();
        sender.write_all(b"trailer").unwrap();

        let mut header = [0u8; 6];
        receiver.read_exact(&mut header).unwrap();
        assert_eq!(&header, b"header");

        let _fd = receiver.recv_fd().unwrap();

        let mut trailer = [0u8; 7];
        receiver.read_exact(&mut trailer).unwrap();
        assert_eq!(&trailer, b"trailer");
    }
}
