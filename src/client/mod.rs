//! # Client Connection
//!
//! The client side of the wire protocol, used by the integration tests
//! and local tooling. A [`Connection`] speaks V1 directly or negotiates
//! V2 with [`handshake`](Connection::handshake); V2 requests are assigned
//! monotonically increasing ids, and a pending-response map sized by the
//! negotiated pipeline depth lets [`recv_response_for`]
//! (Connection::recv_response_for) consume replies out of order.
//! Segmented responses are reassembled into a contiguous body, honouring
//! `REUSE_FD`.

use std::collections::HashMap;
use std::io::Read;
use std::os::fd::OwnedFd;
use std::path::Path;

use thiserror::Error;

use crate::protocol::metadata::{self, MetadataEntry};
use crate::protocol::v2::request_flags;
use crate::protocol::{
    Close, CloseAck, CloseReason, DeliveryMode, FrameTag, Hello, HelloAck, ProtocolError,
    RequestOp, Status, V1Request, V1ResponseHeader, V2Request, V2ResponseHeader,
    V2SegmentedHeader, PROTOCOL_VERSION,
};
use crate::transport::{TcpTransport, Transport, TransportError, UnixTransport};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// Frame decode or encode failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Connection used in the wrong state
    #[error("Client state error: {0}")]
    State(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for client operations
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// One decoded response
#[derive(Debug)]
pub struct Response {
    /// Response status
    pub status: Status,

    /// Echoed request id (zero on V1)
    pub request_id: u32,

    /// Decoded metadata entries
    pub metadata: Vec<MetadataEntry>,

    /// Inline or reassembled body bytes
    pub body: Vec<u8>,

    /// Passed descriptor for FD_PASS responses
    pub fd: Option<OwnedFd>,

    /// How many descriptors the response carried
    pub fds_received: usize,
}

impl Response {
    /// The SIZE metadata entry, if present
    pub fn size(&self) -> Option<u64> {
        metadata::find_size(&self.metadata)
    }

    /// The error-message metadata entry, if present
    pub fn error_message(&self) -> Option<&str> {
        metadata::find_error(&self.metadata)
    }
}

/// A client connection over any stream transport
pub struct Connection {
    transport: Box<dyn Transport>,
    negotiated: Option<HelloAck>,
    next_request_id: u32,
    sent_modes: HashMap<u32, DeliveryMode>,
    pending: HashMap<u32, Response>,
}

impl Connection {
    /// Wrap an already connected transport
    pub fn from_transport(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            negotiated: None,
            next_request_id: 1,
            sent_modes: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Connect over a Unix stream socket
    pub fn connect_unix<P: AsRef<Path>>(path: P) -> ClientResult<Self> {
        Ok(Self::from_transport(Box::new(UnixTransport::connect(path)?)))
    }

    /// Connect over TCP
    pub fn connect_tcp<A: std::net::ToSocketAddrs>(addr: A) -> ClientResult<Self> {
        Ok(Self::from_transport(Box::new(TcpTransport::connect(addr)?)))
    }

    /// Whether this transport can receive descriptors
    pub fn supports_fd_passing(&self) -> bool {
        self.transport.caps().supports_fd_passing
    }

    /// Negotiated parameters after a successful handshake
    pub fn negotiated(&self) -> Option<&HelloAck> {
        self.negotiated.as_ref()
    }

    // ---- V2 ------------------------------------------------------------

    /// Run the HELLO/HELLO_ACK handshake
    pub fn handshake(&mut self, capabilities: u16, max_pipeline: u16) -> ClientResult<HelloAck> {
        if self.negotiated.is_some() {
            return Err(ClientError::State("handshake already completed".into()));
        }
        let hello = Hello {
            version: PROTOCOL_VERSION,
            capabilities,
            max_pipeline,
        };
        self.transport.write_all(&hello.encode())?;
        self.transport.flush()?;
        let ack = HelloAck::read_from(&mut self.transport)?;
        log::debug!(
            "Negotiated caps 0x{:04x}, pipeline {}",
            ack.capabilities,
            ack.max_pipeline
        );
        self.negotiated = Some(ack);
        Ok(ack)
    }

    /// Send one V2 request, returning its assigned id
    pub fn send_request(
        &mut self,
        op: RequestOp,
        mode: DeliveryMode,
        uri: &str,
        body: Vec<u8>,
        flags: u8,
    ) -> ClientResult<u32> {
        let ack = self
            .negotiated
            .ok_or_else(|| ClientError::State("handshake required before V2 requests".into()))?;
        if self.sent_modes.len() >= usize::from(ack.max_pipeline) {
            return Err(ClientError::State(format!(
                "pipeline full at {} requests",
                ack.max_pipeline
            )));
        }
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);

        let request = V2Request {
            op,
            mode,
            flags,
            request_id,
            uri: uri.to_string(),
            content_len: body.len() as u64,
            body,
        };
        self.transport.write_all(&request.encode()?)?;
        self.transport.flush()?;
        self.sent_modes.insert(request_id, mode);
        Ok(request_id)
    }

    /// Read the next response off the wire, whatever its id
    pub fn recv_response(&mut self) -> ClientResult<Response> {
        let tag = self.read_tag()?;
        match tag {
            FrameTag::Response => self.read_plain_response(),
            FrameTag::SegmentedResponse => self.read_segmented_response(),
            other => Err(ClientError::State(format!(
                "unexpected frame {other:?} while waiting for a response"
            ))),
        }
    }

    /// Return the response for `request_id`, stashing any other response
    /// that arrives first (out-of-order replies)
    pub fn recv_response_for(&mut self, request_id: u32) -> ClientResult<Response> {
        if let Some(stashed) = self.pending.remove(&request_id) {
            return Ok(stashed);
        }
        loop {
            let response = self.recv_response()?;
            if response.request_id == request_id {
                return Ok(response);
            }
            let max = self
                .negotiated
                .map(|a| usize::from(a.max_pipeline))
                .unwrap_or(1);
            if self.pending.len() >= max {
                return Err(ClientError::State(format!(
                    "pending-response map overflow at {max} entries"
                )));
            }
            self.pending.insert(response.request_id, response);
        }
    }

    /// GET convenience: send and wait for the matching response
    pub fn get(&mut self, uri: &str, mode: DeliveryMode) -> ClientResult<Response> {
        let id = self.send_request(RequestOp::Get, mode, uri, Vec::new(), 0)?;
        self.recv_response_for(id)
    }

    /// PUT convenience
    pub fn put(&mut self, uri: &str, body: Vec<u8>, ephemeral: bool) -> ClientResult<Response> {
        let flags = if ephemeral {
            request_flags::EPHEMERAL
        } else {
            0
        };
        let id = self.send_request(RequestOp::Put, DeliveryMode::Copy, uri, body, flags)?;
        self.recv_response_for(id)
    }

    /// DELETE convenience
    pub fn delete(&mut self, uri: &str) -> ClientResult<Response> {
        let id = self.send_request(RequestOp::Delete, DeliveryMode::Copy, uri, Vec::new(), 0)?;
        self.recv_response_for(id)
    }

    /// STAT convenience
    pub fn stat(&mut self, uri: &str) -> ClientResult<Response> {
        let id = self.send_request(RequestOp::Stat, DeliveryMode::Copy, uri, Vec::new(), 0)?;
        self.recv_response_for(id)
    }

    /// Drain the connection: send CLOSE, stash responses that were still
    /// in flight, and return the CLOSE_ACK
    pub fn close(&mut self) -> ClientResult<CloseAck> {
        let close = Close {
            reason: CloseReason::Normal,
        };
        self.transport.write_all(&close.encode())?;
        self.transport.flush()?;
        loop {
            let tag = self.read_tag()?;
            match tag {
                FrameTag::CloseAck => {
                    return Ok(CloseAck::read_after_tag(&mut self.transport)?);
                }
                FrameTag::Response => {
                    let response = self.read_plain_response()?;
                    self.pending.insert(response.request_id, response);
                }
                FrameTag::SegmentedResponse => {
                    let response = self.read_segmented_response()?;
                    self.pending.insert(response.request_id, response);
                }
                other => {
                    return Err(ClientError::State(format!(
                        "unexpected frame {other:?} while draining"
                    )))
                }
            }
        }
    }

    // ---- V1 ------------------------------------------------------------

    /// One V1 request/response exchange (no handshake, no ids)
    pub fn request_v1(&mut self, mode: DeliveryMode, uri: &str) -> ClientResult<Response> {
        let request = V1Request {
            mode,
            uri: uri.to_string(),
        };
        self.transport.write_all(&request.encode()?)?;
        self.transport.flush()?;

        let header = V1ResponseHeader::read_from(&mut self.transport)?;
        let metadata = metadata::decode(&header.metadata)?;
        let mut body = Vec::new();
        let mut fd = None;
        let mut fds_received = 0;

        if header.status == Status::Ok
            && mode == DeliveryMode::FdPass
            && header.content_len == 0
            && self.transport.caps().supports_fd_passing
        {
            fd = Some(self.transport.recv_fd()?);
            fds_received = 1;
        } else if header.content_len > 0 {
            body = self.read_exact_vec(header.content_len as usize)?;
        }
        Ok(Response {
            status: header.status,
            request_id: 0,
            metadata,
            body,
            fd,
            fds_received,
        })
    }

    // ---- frame readers --------------------------------------------------

    fn read_tag(&mut self) -> ClientResult<FrameTag> {
        let mut byte = [0u8; 1];
        self.transport.read_exact(&mut byte)?;
        Ok(FrameTag::from_u8(byte[0])?)
    }

    fn read_plain_response(&mut self) -> ClientResult<Response> {
        let header = V2ResponseHeader::read_after_tag(&mut self.transport)?;
        let metadata = metadata::decode(&header.metadata)?;
        let mode = self
            .sent_modes
            .remove(&header.request_id)
            .unwrap_or(DeliveryMode::Copy);

        let mut body = Vec::new();
        let mut fd = None;
        let mut fds_received = 0;

        if header.status == Status::Ok
            && mode == DeliveryMode::FdPass
            && header.content_len == 0
            && self.transport.caps().supports_fd_passing
        {
            fd = Some(self.transport.recv_fd()?);
            fds_received = 1;
        } else if header.content_len > 0 {
            body = self.read_exact_vec(header.content_len as usize)?;
        }
        Ok(Response {
            status: header.status,
            request_id: header.request_id,
            metadata,
            body,
            fd,
            fds_received,
        })
    }

    /// Consume a segmented response: table, inline payloads in declared
    /// order, descriptors in declared order, then reassemble the body
    fn read_segmented_response(&mut self) -> ClientResult<Response> {
        let header = V2SegmentedHeader::read_after_tag(&mut self.transport)?;
        self.sent_modes.remove(&header.request_id);
        let metadata = metadata::decode(&header.metadata)?;

        let mut inline_payloads: Vec<Option<Vec<u8>>> = Vec::with_capacity(header.segments.len());
        for segment in &header.segments {
            if segment.seg_type == crate::protocol::SegmentType::Inline {
                inline_payloads.push(Some(self.read_exact_vec(segment.copy_length as usize)?));
            } else {
                inline_payloads.push(None);
            }
        }

        // Descriptors arrive in declared order; REUSE_FD points at the
        // most recently received one.
        let mut fds: Vec<OwnedFd> = Vec::new();
        let mut segment_fd: Vec<Option<usize>> = vec![None; header.segments.len()];
        for (i, segment) in header.segments.iter().enumerate() {
            if !segment.seg_type.is_fd_backed() {
                continue;
            }
            if segment.flags.reuse_fd {
                let last = fds.len().checked_sub(1).ok_or_else(|| {
                    ClientError::State("REUSE_FD with no received descriptor".into())
                })?;
                segment_fd[i] = Some(last);
            } else {
                fds.push(self.transport.recv_fd()?);
                segment_fd[i] = Some(fds.len() - 1);
            }
        }

        let mut body = Vec::new();
        for (i, segment) in header.segments.iter().enumerate() {
            match inline_payloads[i].take() {
                Some(bytes) => body.extend_from_slice(&bytes),
                None => {
                    let fd = &fds[segment_fd[i].ok_or_else(|| {
                        ClientError::State("descriptor segment without descriptor".into())
                    })?];
                    read_from_fd(
                        fd,
                        segment.storage_offset,
                        segment.logical_length,
                        &mut body,
                    )?;
                }
            }
        }

        Ok(Response {
            status: header.status,
            request_id: header.request_id,
            metadata,
            body,
            fd: None,
            fds_received: fds.len(),
        })
    }

    fn read_exact_vec(&mut self, len: usize) -> ClientResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.transport.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Append `len` bytes read from `fd` starting at `offset`
fn read_from_fd(fd: &OwnedFd, offset: u64, len: u64, out: &mut Vec<u8>) -> ClientResult<()> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut read_at = offset;
    let end = offset + len;
    while read_at < end {
        let chunk = ((end - read_at) as usize).min(buf.len());
        let n = nix::sys::uio::pread(fd, &mut buf[..chunk], read_at as nix::libc::off_t)
            .map_err(|e| ClientError::State(format!("descriptor read failed: {e}")))?;
        if n == 0 {
            return Err(ClientError::State(format!(
                "descriptor truncated at {read_at} of {end} bytes"
            )));
        }
        out.extend_from_slice(&buf[..n]);
        read_at += n as u64;
    }
    Ok(())
}
