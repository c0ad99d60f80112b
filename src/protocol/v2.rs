//! V2 negotiated framing.
//!
//! A V2 connection opens with `HELLO`/`HELLO_ACK`; the negotiated
//! capability set is the bitwise AND of both sides. Every request carries
//! a 32-bit id assigned monotonically by the client and echoed by the
//! matching response, which is what makes out-of-order replies and
//! pipelining possible. `CLOSE`/`CLOSE_ACK` drain a connection without
//! dropping in-flight responses.

use std::io::{Read, Write};

use crate::protocol::rw::{read_u16_be, read_u32_be, read_u64_be, read_u8, read_vec, write_all};
use crate::protocol::segment::{validate_table, SegmentHeader, SEGMENT_HEADER_LEN};
use crate::protocol::{
    CloseReason, DeliveryMode, FrameTag, ProtocolError, ProtocolResult, RequestOp, Status, MAGIC,
    MAX_INLINE_BODY, MAX_METADATA_LEN, MAX_URI_LEN, PROTOCOL_VERSION,
};

/// Client handshake frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    /// Requested protocol version
    pub version: u8,

    /// Capabilities the client offers
    pub capabilities: u16,

    /// Depth of the client's pending-response window
    pub max_pipeline: u16,
}

impl Hello {
    /// Encode into wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9);
        out.extend_from_slice(MAGIC);
        out.push(self.version);
        out.extend_from_slice(&self.capabilities.to_be_bytes());
        out.extend_from_slice(&self.max_pipeline.to_be_bytes());
        out
    }

    /// Finish reading a HELLO whose first magic byte was already consumed
    /// by version sniffing.
    pub fn read_after_first_byte<R: Read>(r: &mut R) -> ProtocolResult<Self> {
        let rest = read_vec(r, 3)?;
        if rest != MAGIC[1..] {
            return Err(ProtocolError::Handshake("bad HELLO magic".into()));
        }
        let version = read_u8(r)?;
        let capabilities = read_u16_be(r)?;
        let max_pipeline = read_u16_be(r)?;
        Ok(Self {
            version,
            capabilities,
            max_pipeline,
        })
    }
}

/// Server handshake reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloAck {
    /// Accepted protocol version
    pub version: u8,

    /// Negotiated capabilities (client ∧ server)
    pub capabilities: u16,

    /// Pipeline depth the server will honour
    pub max_pipeline: u16,

    /// Backend-side parallelism hint
    pub backend_parallelism: u8,
}

impl HelloAck {
    /// Encode into wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10);
        out.extend_from_slice(MAGIC);
        out.push(self.version);
        out.extend_from_slice(&self.capabilities.to_be_bytes());
        out.extend_from_slice(&self.max_pipeline.to_be_bytes());
        out.push(self.backend_parallelism);
        out
    }

    /// Read a full HELLO_ACK from a stream
    pub fn read_from<R: Read>(r: &mut R) -> ProtocolResult<Self> {
        let magic = read_vec(r, 4)?;
        if magic != MAGIC {
            return Err(ProtocolError::Handshake("bad HELLO_ACK magic".into()));
        }
        let version = read_u8(r)?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::Handshake(format!(
                "server answered with unsupported version {version}"
            )));
        }
        let capabilities = read_u16_be(r)?;
        let max_pipeline = read_u16_be(r)?;
        let backend_parallelism = read_u8(r)?;
        Ok(Self {
            version,
            capabilities,
            max_pipeline,
            backend_parallelism,
        })
    }
}

/// Request flag bits
pub mod request_flags {
    /// PUT creates the object in the ephemeral tier
    pub const EPHEMERAL: u8 = 0x01;
}

/// One V2 request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V2Request {
    /// Requested operation
    pub op: RequestOp,

    /// Requested delivery mode
    pub mode: DeliveryMode,

    /// Flag bits, see [`request_flags`]
    pub flags: u8,

    /// Client-assigned id echoed by the response
    pub request_id: u32,

    /// Object URI
    pub uri: String,

    /// Declared inline body length (PUT only)
    pub content_len: u64,

    /// Inline body; empty when `content_len` exceeds the inline maximum,
    /// in which case the bytes were drained off the wire
    pub body: Vec<u8>,
}

impl V2Request {
    /// Encode into wire bytes
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        if self.uri.len() > MAX_URI_LEN {
            return Err(ProtocolError::UriTooLong(self.uri.len()));
        }
        if self.body.len() as u64 != self.content_len {
            return Err(ProtocolError::Malformed(format!(
                "declared body length {} != actual {}",
                self.content_len,
                self.body.len()
            )));
        }
        let mut out = Vec::with_capacity(18 + self.uri.len() + self.body.len());
        out.push(FrameTag::Request as u8);
        out.push(self.op as u8);
        out.push(self.mode as u8);
        out.push(self.flags);
        out.extend_from_slice(&self.request_id.to_be_bytes());
        out.extend_from_slice(&self.content_len.to_be_bytes());
        out.extend_from_slice(&(self.uri.len() as u16).to_be_bytes());
        out.extend_from_slice(self.uri.as_bytes());
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Finish reading a request whose tag byte was already consumed.
    /// Bodies above [`MAX_INLINE_BODY`] are drained and left empty so the
    /// session can answer with a status instead of failing the connection.
    pub fn read_after_tag<R: Read>(r: &mut R) -> ProtocolResult<Self> {
        let op = RequestOp::from_u8(read_u8(r)?)?;
        let mode = DeliveryMode::from_u8(read_u8(r)?)?;
        let flags = read_u8(r)?;
        let request_id = read_u32_be(r)?;
        let content_len = read_u64_be(r)?;
        let uri_len = read_u16_be(r)? as usize;
        let uri_bytes = read_vec(r, uri_len)?;
        let uri = String::from_utf8(uri_bytes)
            .map_err(|_| ProtocolError::Malformed("URI is not valid UTF-8".into()))?;

        let body = if content_len <= MAX_INLINE_BODY {
            read_vec(r, content_len as usize)?
        } else {
            drain(r, content_len)?;
            Vec::new()
        };
        Ok(Self {
            op,
            mode,
            flags,
            request_id,
            uri,
            content_len,
            body,
        })
    }
}

/// Header of one plain V2 response; the body follows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V2ResponseHeader {
    /// Response status
    pub status: Status,

    /// Echoed request id
    pub request_id: u32,

    /// Inline body length; zero for descriptor-passed bodies
    pub content_len: u64,

    /// Raw metadata TLV block
    pub metadata: Vec<u8>,
}

impl V2ResponseHeader {
    /// Encode into wire bytes
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        if self.metadata.len() > MAX_METADATA_LEN {
            return Err(ProtocolError::Malformed(format!(
                "metadata block of {} bytes exceeds maximum {MAX_METADATA_LEN}",
                self.metadata.len()
            )));
        }
        let mut out = Vec::with_capacity(18 + self.metadata.len());
        out.push(FrameTag::Response as u8);
        out.push(self.status as u8);
        out.extend_from_slice(&[0u8; 2]);
        out.extend_from_slice(&self.request_id.to_be_bytes());
        out.extend_from_slice(&self.content_len.to_be_bytes());
        out.extend_from_slice(&(self.metadata.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.metadata);
        Ok(out)
    }

    /// Write the header to a stream
    pub fn write_to<W: Write>(&self, w: &mut W) -> ProtocolResult<()> {
        let bytes = self.encode()?;
        write_all(w, &bytes)
    }

    /// Finish reading a response header whose tag byte was already consumed
    pub fn read_after_tag<R: Read>(r: &mut R) -> ProtocolResult<Self> {
        let status = Status::from_u8(read_u8(r)?)?;
        let mut pad = [0u8; 2];
        r.read_exact(&mut pad)?;
        let request_id = read_u32_be(r)?;
        let content_len = read_u64_be(r)?;
        let metadata_len = read_u16_be(r)? as usize;
        let metadata = read_vec(r, metadata_len)?;
        Ok(Self {
            status,
            request_id,
            content_len,
            metadata,
        })
    }
}

/// Header of one segmented V2 response: status, id, metadata, and the
/// full segment table. Inline payloads and descriptors follow on the wire
/// in the order the table declares.
#[derive(Debug, Clone, PartialEq)]
pub struct V2SegmentedHeader {
    /// Response status
    pub status: Status,

    /// Echoed request id
    pub request_id: u32,

    /// Raw metadata TLV block
    pub metadata: Vec<u8>,

    /// Ordered segment table
    pub segments: Vec<SegmentHeader>,
}

impl V2SegmentedHeader {
    /// Encode into wire bytes, validating the table first
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        validate_table(&self.segments)?;
        if self.metadata.len() > MAX_METADATA_LEN {
            return Err(ProtocolError::Malformed(format!(
                "metadata block of {} bytes exceeds maximum {MAX_METADATA_LEN}",
                self.metadata.len()
            )));
        }
        let mut out = Vec::with_capacity(
            10 + self.metadata.len() + self.segments.len() * SEGMENT_HEADER_LEN,
        );
        out.push(FrameTag::SegmentedResponse as u8);
        out.push(self.status as u8);
        out.extend_from_slice(&(self.segments.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.request_id.to_be_bytes());
        out.extend_from_slice(&(self.metadata.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.metadata);
        for segment in &self.segments {
            out.extend_from_slice(&segment.encode());
        }
        Ok(out)
    }

    /// Finish reading a segmented header whose tag byte was already
    /// consumed, validating the table
    pub fn read_after_tag<R: Read>(r: &mut R) -> ProtocolResult<Self> {
        let status = Status::from_u8(read_u8(r)?)?;
        let segment_count = read_u16_be(r)? as usize;
        let request_id = read_u32_be(r)?;
        let metadata_len = read_u16_be(r)? as usize;
        let metadata = read_vec(r, metadata_len)?;
        let mut segments = Vec::with_capacity(segment_count.min(64));
        for _ in 0..segment_count {
            let mut raw = [0u8; SEGMENT_HEADER_LEN];
            r.read_exact(&mut raw)?;
            segments.push(SegmentHeader::decode(&raw)?);
        }
        validate_table(&segments)?;
        Ok(Self {
            status,
            request_id,
            metadata,
            segments,
        })
    }
}

/// CLOSE frame: start draining the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Close {
    /// Why the peer is closing
    pub reason: CloseReason,
}

impl Close {
    /// Encode into wire bytes
    pub fn encode(&self) -> Vec<u8> {
        vec![FrameTag::Close as u8, self.reason as u8]
    }

    /// Finish reading a CLOSE whose tag byte was already consumed
    pub fn read_after_tag<R: Read>(r: &mut R) -> ProtocolResult<Self> {
        let reason = CloseReason::from_u8(read_u8(r)?);
        Ok(Self { reason })
    }
}

/// CLOSE_ACK frame: drain finished, with the count of responses that were
/// still outstanding when CLOSE arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseAck {
    /// In-flight responses at drain start
    pub outstanding: u32,
}

impl CloseAck {
    /// Encode into wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6);
        out.push(FrameTag::CloseAck as u8);
        out.push(0);
        out.extend_from_slice(&self.outstanding.to_be_bytes());
        out
    }

    /// Finish reading a CLOSE_ACK whose tag byte was already consumed
    pub fn read_after_tag<R: Read>(r: &mut R) -> ProtocolResult<Self> {
        let _pad = read_u8(r)?;
        let outstanding = read_u32_be(r)?;
        Ok(Self { outstanding })
    }
}

fn drain<R: Read>(r: &mut R, mut remaining: u64) -> ProtocolResult<()> {
    let mut scratch = [0u8; 65536];
    while remaining > 0 {
        let chunk = remaining.min(scratch.len() as u64) as usize;
        r.read_exact(&mut scratch[..chunk])?;
        remaining -= chunk as u64;
    }
    Ok(())
}
