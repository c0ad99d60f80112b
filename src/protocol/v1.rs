//! V1 legacy framing.
//!
//! V1 is version-less: no handshake, no request ids, responses strictly in
//! request order. A request is `mode(1) | uri_len(2) | uri`; a response is
//! `status(1) | content_len(8) | metadata_len(2) | metadata | body`. When
//! the mode is FD_PASS and `content_len` is zero, the body is a single
//! ancillary descriptor message instead of inline bytes.

use std::io::{Read, Write};

use crate::protocol::rw::{read_u16_be, read_u64_be, read_u8, read_vec, write_all};
use crate::protocol::{
    DeliveryMode, ProtocolError, ProtocolResult, Status, MAX_METADATA_LEN, MAX_URI_LEN,
};

/// One V1 request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V1Request {
    /// Requested delivery mode
    pub mode: DeliveryMode,

    /// Object URI
    pub uri: String,
}

impl V1Request {
    /// Encode into wire bytes
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        if self.uri.len() > MAX_URI_LEN {
            return Err(ProtocolError::UriTooLong(self.uri.len()));
        }
        let mut out = Vec::with_capacity(3 + self.uri.len());
        out.push(self.mode as u8);
        out.extend_from_slice(&(self.uri.len() as u16).to_be_bytes());
        out.extend_from_slice(self.uri.as_bytes());
        Ok(out)
    }

    /// Finish reading a request whose mode byte was already consumed by
    /// version sniffing. Over-long URIs are NOT rejected here; the session
    /// answers them with `URI_TOO_LONG` after reading the full frame.
    pub fn read_after_mode<R: Read>(mode_byte: u8, r: &mut R) -> ProtocolResult<Self> {
        let mode = DeliveryMode::from_u8(mode_byte)?;
        let uri = read_uri(r)?;
        Ok(Self { mode, uri })
    }
}

/// Read the `uri_len | uri` tail of a V1 request. Split out so a server
/// can consume the full frame before rejecting an unknown mode byte with
/// `INVALID_MODE` instead of dropping the connection.
pub fn read_uri<R: Read>(r: &mut R) -> ProtocolResult<String> {
    let uri_len = read_u16_be(r)? as usize;
    let uri_bytes = read_vec(r, uri_len)?;
    String::from_utf8(uri_bytes)
        .map_err(|_| ProtocolError::Malformed("URI is not valid UTF-8".into()))
}

/// Header of one V1 response; the body (or ancillary descriptor) follows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V1ResponseHeader {
    /// Response status
    pub status: Status,

    /// Inline body length; zero for descriptor-passed bodies
    pub content_len: u64,

    /// Raw metadata TLV block
    pub metadata: Vec<u8>,
}

impl V1ResponseHeader {
    /// Encode into wire bytes
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        if self.metadata.len() > MAX_METADATA_LEN {
            return Err(ProtocolError::Malformed(format!(
                "metadata block of {} bytes exceeds maximum {MAX_METADATA_LEN}",
                self.metadata.len()
            )));
        }
        let mut out = Vec::with_capacity(11 + self.metadata.len());
        out.push(self.status as u8);
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

    /// Read a header from a stream
    pub fn read_from<R: Read>(r: &mut R) -> ProtocolResult<Self> {
        let status = Status::from_u8(read_u8(r)?)?;
        let content_len = read_u64_be(r)?;
        let metadata_len = read_u16_be(r)? as usize;
        let metadata = read_vec(r, metadata_len)?;
        Ok(Self {
            status,
            content_len,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_request_round_trip() {
        let request = V1Request {
            mode: DeliveryMode::FdPass,
            uri: "/test1.txt".into(),
        };
        let bytes = request.encode().unwrap();
        let mut cursor = Cursor::new(&bytes[1..]);
        let decoded = V1Request::read_after_mode(bytes[0], &mut cursor).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_encode_rejects_oversized_uri() {
        let request = V1Request {
            mode: DeliveryMode::Copy,
            uri: "x".repeat(MAX_URI_LEN + 1),
        };
        assert!(matches!(
            request.encode(),
            Err(ProtocolError::UriTooLong(_))
        ));

        let at_limit = V1Request {
            mode: DeliveryMode::Copy,
            uri: "x".repeat(MAX_URI_LEN),
        };
        assert!(at_limit.encode().is_ok());
    }

    #[test]
    fn test_response_header_round_trip() {
        let header = V1ResponseHeader {
            status: Status::Ok,
            content_len: 64,
            metadata: vec![0x01, 0x00, 0x01, 0x2A],
        };
        let bytes = header.encode().unwrap();
        let decoded = V1ResponseHeader::read_from(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, header);
    }
}
