//! Segmented-delivery segment tables.
//!
//! A segmented response describes its body as an ordered run of up to
//! [`MAX_SEGMENTS`](crate::protocol::MAX_SEGMENTS) segments. The wire
//! carries the fixed-size segment headers first, then every inline payload
//! in declared order, then every non-reused descriptor in declared order.

use crate::protocol::{ProtocolError, ProtocolResult, MAX_SEGMENTS};

/// Packed size of one segment header in bytes
pub const SEGMENT_HEADER_LEN: usize = 32;

/// Segment payload source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentType {
    /// Bytes follow the table inline
    Inline = 1,
    /// Bytes are read from a passed descriptor
    Fd = 2,
    /// Bytes are spliced from a passed descriptor
    Splice = 3,
}

impl SegmentType {
    /// Decode a segment type byte
    pub fn from_u8(value: u8) -> ProtocolResult<Self> {
        Ok(match value {
            1 => SegmentType::Inline,
            2 => SegmentType::Fd,
            3 => SegmentType::Splice,
            other => {
                return Err(ProtocolError::UnknownDiscriminant {
                    what: "segment type",
                    value: other,
                })
            }
        })
    }

    /// True when the segment references a descriptor
    pub fn is_fd_backed(self) -> bool {
        matches!(self, SegmentType::Fd | SegmentType::Splice)
    }
}

/// Segment flag bits
pub mod seg_flags {
    /// Last segment of the response
    pub const FIN: u8 = 0x01;
    /// Reuse the previously received descriptor instead of receiving one
    pub const REUSE_FD: u8 = 0x02;
    /// All defined bits
    pub const ALL: u8 = FIN | REUSE_FD;
}

/// Decoded segment flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentFlags {
    /// FIN bit
    pub fin: bool,
    /// REUSE_FD bit
    pub reuse_fd: bool,
}

impl SegmentFlags {
    fn from_u8(value: u8) -> ProtocolResult<Self> {
        if value & !seg_flags::ALL != 0 {
            return Err(ProtocolError::SegmentTable(format!(
                "unknown segment flag bits 0x{value:02x}"
            )));
        }
        Ok(Self {
            fin: value & seg_flags::FIN != 0,
            reuse_fd: value & seg_flags::REUSE_FD != 0,
        })
    }

    fn as_u8(self) -> u8 {
        let mut bits = 0;
        if self.fin {
            bits |= seg_flags::FIN;
        }
        if self.reuse_fd {
            bits |= seg_flags::REUSE_FD;
        }
        bits
    }
}

/// One fixed-size segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Payload source
    pub seg_type: SegmentType,

    /// FIN / REUSE_FD bits
    pub flags: SegmentFlags,

    /// Inline byte count; zero for descriptor-backed segments
    pub copy_length: u32,

    /// Bytes this segment contributes to the reassembled body
    pub logical_length: u64,

    /// Read offset within the referenced descriptor
    pub storage_offset: u64,

    /// Readable length behind the descriptor (≥ logical)
    pub storage_length: u64,
}

impl SegmentHeader {
    /// Build an inline segment over `data.len()` bytes
    pub fn inline(length: u32, fin: bool) -> Self {
        Self {
            seg_type: SegmentType::Inline,
            flags: SegmentFlags {
                fin,
                reuse_fd: false,
            },
            copy_length: length,
            logical_length: u64::from(length),
            storage_offset: 0,
            storage_length: u64::from(length),
        }
    }

    /// Build a descriptor-backed segment
    pub fn fd(logical: u64, offset: u64, storage: u64, fin: bool, reuse_fd: bool) -> Self {
        Self {
            seg_type: SegmentType::Fd,
            flags: SegmentFlags { fin, reuse_fd },
            copy_length: 0,
            logical_length: logical,
            storage_offset: offset,
            storage_length: storage,
        }
    }

    /// Encode into the 32-byte wire layout (big-endian)
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_LEN] {
        let mut out = [0u8; SEGMENT_HEADER_LEN];
        out[0] = self.seg_type as u8;
        out[1] = self.flags.as_u8();
        out[4..8].copy_from_slice(&self.copy_length.to_be_bytes());
        out[8..16].copy_from_slice(&self.logical_length.to_be_bytes());
        out[16..24].copy_from_slice(&self.storage_offset.to_be_bytes());
        out[24..32].copy_from_slice(&self.storage_length.to_be_bytes());
        out
    }

    /// Decode from the 32-byte wire layout
    pub fn decode(bytes: &[u8; SEGMENT_HEADER_LEN]) -> ProtocolResult<Self> {
        Ok(Self {
            seg_type: SegmentType::from_u8(bytes[0])?,
            flags: SegmentFlags::from_u8(bytes[1])?,
            copy_length: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            logical_length: u64::from_be_bytes(bytes[8..16].try_into().unwrap()),
            storage_offset: u64::from_be_bytes(bytes[16..24].try_into().unwrap()),
            storage_length: u64::from_be_bytes(bytes[24..32].try_into().unwrap()),
        })
    }
}

/// Check a full segment table against the layout constraints
pub fn validate_table(segments: &[SegmentHeader]) -> ProtocolResult<()> {
    if segments.is_empty() || segments.len() > MAX_SEGMENTS {
        return Err(ProtocolError::SegmentTable(format!(
            "segment count {} outside [1, {MAX_SEGMENTS}]",
            segments.len()
        )));
    }
    let mut fd_seen = false;
    let last = segments.len() - 1;
    for (i, segment) in segments.iter().enumerate() {
        if segment.flags.fin != (i == last) {
            return Err(ProtocolError::SegmentTable(if i == last {
                "last segment is missing FIN".into()
            } else {
                format!("segment {i} carries FIN before the last segment")
            }));
        }
        match segment.seg_type {
            SegmentType::Inline => {
                if segment.flags.reuse_fd {
                    return Err(ProtocolError::SegmentTable(format!(
                        "inline segment {i} carries REUSE_FD"
                    )));
                }
                if u64::from(segment.copy_length) != segment.logical_length {
                    return Err(ProtocolError::SegmentTable(format!(
                        "inline segment {i}: copy length {} != logical length {}",
                        segment.copy_length, segment.logical_length
                    )));
                }
            }
            SegmentType::Fd | SegmentType::Splice => {
                if segment.copy_length != 0 {
                    return Err(ProtocolError::SegmentTable(format!(
                        "descriptor segment {i} has non-zero copy length"
                    )));
                }
                if segment.storage_length < segment.logical_length {
                    return Err(ProtocolError::SegmentTable(format!(
                        "descriptor segment {i}: storage length {} below logical length {}",
                        segment.storage_length, segment.logical_length
                    )));
                }
                if segment.flags.reuse_fd && !fd_seen {
                    return Err(ProtocolError::SegmentTable(format!(
                        "segment {i} reuses a descriptor but none was received"
                    )));
                }
                fd_seen = true;
            }
        }
    }
    Ok(())
}

/// Number of descriptors the wire carries for this table
pub fn fd_count(segments: &[SegmentHeader]) -> usize {
    segments
        .iter()
        .filter(|s| s.seg_type.is_fd_backed() && !s.flags.reuse_fd)
        .count()
}

/// Total reassembled body length of this table
pub fn body_length(segments: &[SegmentHeader]) -> u64 {
    segments.iter().map(|s| s.logical_length).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = SegmentHeader::fd(4096, 128, 8192, false, false);
        let decoded = SegmentHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);

        let inline = SegmentHeader::inline(16, true);
        assert_eq!(SegmentHeader::decode(&inline.encode()).unwrap(), inline);
    }

    #[test]
    fn test_trailer_shaped_table_validates() {
        // The FD + inline-trailer + reused-FD shape used for zero-copy
        // delivery with appended metadata.
        let table = [
            SegmentHeader::fd(4096, 0, 4096, false, false),
            SegmentHeader::inline(16, false),
            SegmentHeader::fd(0, 0, 0, true, true),
        ];
        validate_table(&table).unwrap();
        assert_eq!(fd_count(&table), 1);
        assert_eq!(body_length(&table), 4112);
    }

    #[test]
    fn test_fin_placement_enforced() {
        let missing_fin = [SegmentHeader::inline(4, false)];
        assert!(validate_table(&missing_fin).is_err());

        let early_fin = [
            SegmentHeader::inline(4, true),
            SegmentHeader::inline(4, true),
        ];
        assert!(validate_table(&early_fin).is_err());
    }

    #[test]
    fn test_reuse_without_prior_fd_rejected() {
        let table = [SegmentHeader::fd(10, 0, 10, true, true)];
        assert!(validate_table(&table).is_err());
    }

    #[test]
    fn test_descriptor_constraints() {
        let mut bad_copy = SegmentHeader::fd(10, 0, 10, true, false);
        bad_copy.copy_length = 10;
        assert!(validate_table(&[bad_copy]).is_err());

        let short_storage = SegmentHeader::fd(100, 0, 50, true, false);
        assert!(validate_table(&[short_storage]).is_err());
    }

    #[test]
    fn test_count_bounds() {
        assert!(validate_table(&[]).is_err());
        let mut long = vec![SegmentHeader::inline(1, false); MAX_SEGMENTS + 1];
        long.last_mut().unwrap().flags.fin = true;
        assert!(validate_table(&long).is_err());
    }
}
