//! # Framed Wire Protocol
//!
//! Two protocol versions share one socket:
//! - **V1 (legacy)**: version-less request/response framing with no
//!   handshake, no request ids, and a single delivery mode per request.
//! - **V2 (negotiated)**: `HELLO`/`HELLO_ACK` capability negotiation,
//!   tagged frames, 32-bit request ids for out-of-order replies,
//!   segmented multi-buffer delivery, and `CLOSE`/`CLOSE_ACK` draining.
//!
//! The server sniffs the first byte of a connection: `0x4F` (the `'O'` of
//! the `"OBJM"` magic) selects V2, anything else is a V1 delivery mode.
//!
//! All multi-byte protocol integers are big-endian. The packed payload
//! descriptor carried in the `PAYLOAD` metadata TLV is the one exception:
//! it uses little-endian fixed-size fields so it can be mapped directly
//! from the on-disk descriptor (see [`crate::index::payload`]).

use thiserror::Error;

pub mod metadata;
mod rw;
pub mod segment;
pub mod v1;
pub mod v2;

pub use metadata::MetadataEntry;
pub use segment::{SegmentFlags, SegmentHeader, SegmentType};
pub use v1::{V1Request, V1ResponseHeader};
pub use v2::{Close, CloseAck, Hello, HelloAck, V2Request, V2ResponseHeader, V2SegmentedHeader};

/// Protocol magic, first bytes of every V2 HELLO / HELLO_ACK
pub const MAGIC: &[u8; 4] = b"OBJM";

/// Current V2 protocol version
pub const PROTOCOL_VERSION: u8 = 2;

/// Maximum accepted URI length in bytes
pub const MAX_URI_LEN: usize = 4096;

/// Maximum metadata block length in bytes
pub const MAX_METADATA_LEN: usize = 65_535;

/// Maximum number of segments in one segmented response
pub const MAX_SEGMENTS: usize = 16;

/// Maximum inline body accepted for a PUT request
pub const MAX_INLINE_BODY: u64 = 16 * 1024 * 1024;

/// Negotiable capability bits (client ∧ server)
pub mod caps {
    /// Responses may arrive in any order, matched by request id
    pub const OOO_REPLIES: u16 = 0x0001;
    /// Client may send further requests before responses arrive
    pub const PIPELINING: u16 = 0x0002;
    /// Alternate-encoding variants may be selected for delivery
    pub const COMPRESSION: u16 = 0x0004;
    /// Multiple logical streams over one connection
    pub const MULTIPLEXING: u16 = 0x0008;
    /// Responses may use the segmented multi-buffer layout
    pub const SEGMENTED_DELIVERY: u16 = 0x0010;
}

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame field failed validation
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// HELLO carried a bad magic or unsupported version
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Unknown frame tag, mode, op, or status byte
    #[error("Unknown discriminant {value} for {what}")]
    UnknownDiscriminant {
        /// Field being decoded
        what: &'static str,
        /// Offending byte
        value: u8,
    },

    /// Segment table violated the layout constraints
    #[error("Segment table error: {0}")]
    SegmentTable(String),

    /// URI exceeded [`MAX_URI_LEN`]
    #[error("URI length {0} exceeds maximum {MAX_URI_LEN}")]
    UriTooLong(usize),

    /// I/O error while reading or writing a frame
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Protocol-level status codes carried in every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum Status {
    /// Request completed
    Ok = 0,
    /// URI not present in the global index
    NotFound = 1,
    /// Request failed field validation
    InvalidRequest = 2,
    /// Delivery mode unknown or not allowed on this transport
    InvalidMode = 3,
    /// URI exceeded the protocol maximum
    UriTooLong = 4,
    /// Operation not supported by this server or protocol version
    UnsupportedOp = 5,
    /// Unexpected server-side failure
    InternalError = 6,
    /// Backend storage operation failed
    StorageError = 7,
    /// Allocation failure
    OutOfMemory = 8,
    /// Operation timed out
    Timeout = 9,
    /// Server is not accepting work
    Unavailable = 10,
    /// Peer violated the protocol
    ProtocolError = 11,
    /// Peer requested an unsupported protocol version
    VersionMismatch = 12,
    /// Operation requires a capability that was not negotiated
    CapabilityError = 13,
}

impl Status {
    /// Decode a status byte
    pub fn from_u8(value: u8) -> ProtocolResult<Self> {
        Ok(match value {
            0 => Status::Ok,
            1 => Status::NotFound,
            2 => Status::InvalidRequest,
            3 => Status::InvalidMode,
            4 => Status::UriTooLong,
            5 => Status::UnsupportedOp,
            6 => Status::InternalError,
            7 => Status::StorageError,
            8 => Status::OutOfMemory,
            9 => Status::Timeout,
            10 => Status::Unavailable,
            11 => Status::ProtocolError,
            12 => Status::VersionMismatch,
            13 => Status::CapabilityError,
            other => {
                return Err(ProtocolError::UnknownDiscriminant {
                    what: "status",
                    value: other,
                })
            }
        })
    }

    /// True for `Status::Ok`
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

/// How a response body reaches the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum DeliveryMode {
    /// Pass the backing object's open descriptor as ancillary data
    FdPass = 1,
    /// Copy the body inline through the server
    Copy = 2,
    /// Kernel-to-kernel copy into the socket (wire-identical to Copy)
    Splice = 3,
    /// Segmented multi-buffer response (V2, negotiated)
    Segmented = 4,
}

impl DeliveryMode {
    /// Decode a mode byte
    pub fn from_u8(value: u8) -> ProtocolResult<Self> {
        Ok(match value {
            1 => DeliveryMode::FdPass,
            2 => DeliveryMode::Copy,
            3 => DeliveryMode::Splice,
            4 => DeliveryMode::Segmented,
            other => {
                return Err(ProtocolError::UnknownDiscriminant {
                    what: "delivery mode",
                    value: other,
                })
            }
        })
    }
}

/// V2 request operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestOp {
    /// Deliver an object body
    Get = 1,
    /// Create or replace an object from an inline body
    Put = 2,
    /// Remove an object
    Delete = 3,
    /// Fetch metadata only
    Stat = 4,
}

impl RequestOp {
    /// Decode an op byte
    pub fn from_u8(value: u8) -> ProtocolResult<Self> {
        Ok(match value {
            1 => RequestOp::Get,
            2 => RequestOp::Put,
            3 => RequestOp::Delete,
            4 => RequestOp::Stat,
            other => {
                return Err(ProtocolError::UnknownDiscriminant {
                    what: "request op",
                    value: other,
                })
            }
        })
    }
}

/// V2 frame tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
    /// Client request
    Request = 0x01,
    /// Plain response
    Response = 0x02,
    /// Segmented response
    SegmentedResponse = 0x03,
    /// Connection drain request
    Close = 0x04,
    /// Drain acknowledgement
    CloseAck = 0x05,
}

impl FrameTag {
    /// Decode a frame tag byte
    pub fn from_u8(value: u8) -> ProtocolResult<Self> {
        Ok(match value {
            0x01 => FrameTag::Request,
            0x02 => FrameTag::Response,
            0x03 => FrameTag::SegmentedResponse,
            0x04 => FrameTag::Close,
            0x05 => FrameTag::CloseAck,
            other => {
                return Err(ProtocolError::UnknownDiscriminant {
                    what: "frame tag",
                    value: other,
                })
            }
        })
    }
}

/// Reasons carried in a CLOSE frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseReason {
    /// Orderly close
    Normal = 0,
    /// Peer observed an error
    Error = 1,
    /// Peer is shutting down
    Shutdown = 2,
}

impl CloseReason {
    /// Decode a close reason byte; unknown reasons map to `Error`
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => CloseReason::Normal,
            2 => CloseReason::Shutdown,
            _ => CloseReason::Error,
        }
    }
}
