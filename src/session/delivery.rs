//! Delivery engine: moving an object body onto the wire.
//!
//! Four paths share one entry borrow:
//! - **FdPass** — header with zero content length, then the backing
//!   descriptor as ancillary data (Unix transports only)
//! - **Copy** — header, then the bytes read and written through userspace
//! - **Splice** — wire-identical to Copy; on Linux the bytes go
//!   kernel-to-kernel via `sendfile` into the socket
//! - **Segmented** — V2 only: a segment table, then inline payloads and
//!   descriptors in declared order

use std::os::fd::BorrowedFd;
use std::sync::Arc;

use crate::index::{FdRef, IndexEntry};
use crate::protocol::metadata::{self, MetadataEntry};
use crate::protocol::segment::SegmentHeader;
use crate::protocol::v1::V1ResponseHeader;
use crate::protocol::v2::{V2ResponseHeader, V2SegmentedHeader};
use crate::protocol::{DeliveryMode, ProtocolResult, Status, MAX_SEGMENTS};
use crate::session::{SessionError, SessionResult};
use crate::transport::Transport;

/// Preferred inline-segment size the server composes
const SEGMENT_CHUNK: u64 = 64 * 1024;

/// Which response framing a session speaks
#[derive(Debug, Clone, Copy)]
pub(crate) enum ResponseFraming {
    /// Version-less V1 framing
    V1,
    /// V2 framing echoing this request id
    V2 {
        /// Id to echo
        request_id: u32,
    },
}

/// Standard metadata TLVs for one entry
pub(crate) fn entry_metadata(entry: &Arc<IndexEntry>) -> ProtocolResult<Vec<u8>> {
    let mut entries = vec![
        MetadataEntry::Size(entry.size()),
        MetadataEntry::Mtime(entry.mtime()),
        MetadataEntry::Backend(entry.backend_id()),
    ];
    if let Some(descriptor) = entry.payload() {
        entries.push(MetadataEntry::Payload(descriptor));
    }
    metadata::encode(&entries)
}

/// Metadata block carrying a single error message TLV
pub(crate) fn error_metadata(message: &str) -> Vec<u8> {
    metadata::encode(&[MetadataEntry::Error(message.to_string())]).unwrap_or_default()
}

/// Write a non-OK response with a `0xFF` message TLV and no body
pub(crate) fn write_error(
    transport: &mut dyn Transport,
    framing: ResponseFraming,
    status: Status,
    message: &str,
) -> SessionResult<()> {
    let metadata = error_metadata(message);
    let bytes = match framing {
        ResponseFraming::V1 => V1ResponseHeader {
            status,
            content_len: 0,
            metadata,
        }
        .encode()?,
        ResponseFraming::V2 { request_id } => V2ResponseHeader {
            status,
            request_id,
            content_len: 0,
            metadata,
        }
        .encode()?,
    };
    transport.write_all(&bytes)?;
    transport.flush().map_err(SessionError::from)?;
    Ok(())
}

/// Write an OK response with metadata only (PUT/DELETE/STAT replies)
pub(crate) fn write_ok(
    transport: &mut dyn Transport,
    framing: ResponseFraming,
    metadata: Vec<u8>,
) -> SessionResult<()> {
    let bytes = match framing {
        ResponseFraming::V1 => V1ResponseHeader {
            status: Status::Ok,
            content_len: 0,
            metadata,
        }
        .encode()?,
        ResponseFraming::V2 { request_id } => V2ResponseHeader {
            status: Status::Ok,
            request_id,
            content_len: 0,
            metadata,
        }
        .encode()?,
    };
    transport.write_all(&bytes)?;
    transport.flush().map_err(SessionError::from)?;
    Ok(())
}

/// Deliver an object body in the requested mode
pub(crate) fn send_body(
    transport: &mut dyn Transport,
    framing: ResponseFraming,
    fd_ref: &FdRef,
    mode: DeliveryMode,
) -> SessionResult<()> {
    let entry = fd_ref.entry();
    let size = entry.size();
    let metadata = entry_metadata(entry)?;

    match mode {
        DeliveryMode::FdPass => {
            write_header(transport, framing, 0, metadata)?;
            transport.send_fd(fd_ref.raw_fd())?;
        }
        DeliveryMode::Copy => {
            write_header(transport, framing, size, metadata)?;
            copy_through(transport, fd_ref, 0, size)?;
        }
        DeliveryMode::Splice => {
            write_header(transport, framing, size, metadata)?;
            splice_into_socket(transport, fd_ref, size)?;
        }
        DeliveryMode::Segmented => {
            let request_id = match framing {
                ResponseFraming::V2 { request_id } => request_id,
                ResponseFraming::V1 => {
                    return Err(SessionError::Violation(
                        "segmented delivery requires the V2 protocol".into(),
                    ))
                }
            };
            send_segmented(transport, request_id, fd_ref, metadata)?;
        }
    }
    transport.flush().map_err(SessionError::from)?;
    Ok(())
}

fn write_header(
    transport: &mut dyn Transport,
    framing: ResponseFraming,
    content_len: u64,
    metadata: Vec<u8>,
) -> SessionResult<()> {
    let bytes = match framing {
        ResponseFraming::V1 => V1ResponseHeader {
            status: Status::Ok,
            content_len,
            metadata,
        }
        .encode()?,
        ResponseFraming::V2 { request_id } => V2ResponseHeader {
            status: Status::Ok,
            request_id,
            content_len,
            metadata,
        }
        .encode()?,
    };
    transport.write_all(&bytes)?;
    Ok(())
}

/// Compose and send a segmented response. On descriptor-capable
/// transports the whole body is one FD segment; otherwise it is split
/// into inline segments.
fn send_segmented(
    transport: &mut dyn Transport,
    request_id: u32,
    fd_ref: &FdRef,
    metadata: Vec<u8>,
) -> SessionResult<()> {
    let size = fd_ref.entry().size();

    if transport.caps().supports_fd_passing {
        let header = V2SegmentedHeader {
            status: Status::Ok,
            request_id,
            metadata,
            segments: vec![SegmentHeader::fd(size, 0, size, true, false)],
        };
        transport.write_all(&header.encode()?)?;
        transport.send_fd(fd_ref.raw_fd())?;
        return Ok(());
    }

    // Inline segmentation: even chunks, capped at the table maximum.
    let chunk = SEGMENT_CHUNK.max(size.div_ceil(MAX_SEGMENTS as u64));
    let mut segments = Vec::new();
    let mut remaining = size;
    loop {
        let this = remaining.min(chunk);
        remaining -= this;
        segments.push(SegmentHeader::inline(this as u32, remaining == 0));
        if remaining == 0 {
            break;
        }
    }

    let header = V2SegmentedHeader {
        status: Status::Ok,
        request_id,
        metadata,
        segments: segments.clone(),
    };
    transport.write_all(&header.encode()?)?;

    let mut offset = 0u64;
    for segment in &segments {
        copy_through(transport, fd_ref, offset, segment.logical_length)?;
        offset += segment.logical_length;
    }
    Ok(())
}

/// Userspace copy: pread from the borrowed descriptor, write to the wire
fn copy_through(
    transport: &mut dyn Transport,
    fd_ref: &FdRef,
    start: u64,
    len: u64,
) -> SessionResult<()> {
    let fd = unsafe { BorrowedFd::borrow_raw(fd_ref.raw_fd()) };
    let mut buf = vec![0u8; 64 * 1024];
    let mut offset = start;
    let end = start + len;
    while offset < end {
        let chunk = ((end - offset) as usize).min(buf.len());
        let read = nix::sys::uio::pread(fd, &mut buf[..chunk], offset as nix::libc::off_t)
            .map_err(|e| SessionError::Violation(format!("object read failed: {e}")))?;
        if read == 0 {
            return Err(SessionError::Violation(format!(
                "object truncated at {offset} of {end} bytes"
            )));
        }
        transport.write_all(&buf[..read])?;
        offset += read as u64;
    }
    Ok(())
}

/// Kernel-to-kernel copy into the socket on Linux
#[cfg(target_os = "linux")]
fn splice_into_socket(
    transport: &mut dyn Transport,
    fd_ref: &FdRef,
    len: u64,
) -> SessionResult<()> {
    let socket = unsafe { BorrowedFd::borrow_raw(transport.raw_fd()) };
    let file = unsafe { BorrowedFd::borrow_raw(fd_ref.raw_fd()) };
    let mut offset: nix::libc::off_t = 0;
    let mut sent = 0u64;
    while sent < len {
        let chunk = (len - sent).min(1 << 30) as usize;
        let n = nix::sys::sendfile::sendfile(socket, file, Some(&mut offset), chunk)
            .map_err(|e| SessionError::Violation(format!("sendfile failed: {e}")))?;
        if n == 0 {
            return Err(SessionError::Violation(format!(
                "object truncated at {sent} of {len} bytes"
            )));
        }
        sent += n as u64;
    }
    Ok(())
}

/// Portable fallback: plain copy
#[cfg(not(target_os = "linux"))]
fn splice_into_socket(
    transport: &mut dyn Transport,
    fd_ref: &FdRef,
    len: u64,
) -> SessionResult<()> {
    copy_through(transport, fd_ref, 0, len)
}
