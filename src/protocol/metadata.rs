//! Metadata TLV codec.
//!
//! Response metadata is a flat list of `{type(1) | length(2 BE) | value}`
//! entries. Unknown types are preserved so older peers can carry newer
//! metadata through unchanged.

use crate::index::payload::PayloadDescriptor;
use crate::protocol::{ProtocolError, ProtocolResult, MAX_METADATA_LEN};

/// TLV type byte for the object size (u64 BE)
pub const TLV_SIZE: u8 = 0x01;
/// TLV type byte for the modification time in seconds (u64 BE)
pub const TLV_MTIME: u8 = 0x02;
/// TLV type byte for the owning backend id (u8)
pub const TLV_BACKEND: u8 = 0x03;
/// TLV type byte for the packed payload descriptor (little-endian fields)
pub const TLV_PAYLOAD: u8 = 0x04;
/// TLV type byte for free-form error messages (UTF-8)
pub const TLV_ERROR: u8 = 0xFF;

/// One decoded metadata entry
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataEntry {
    /// Object size in bytes
    Size(u64),
    /// Modification time, seconds since the epoch
    Mtime(u64),
    /// Owning backend id
    Backend(u8),
    /// Packed payload descriptor
    Payload(PayloadDescriptor),
    /// Human-readable error message
    Error(String),
    /// Unrecognised entry, carried through verbatim
    Unknown {
        /// Original type byte
        tlv_type: u8,
        /// Original value bytes
        value: Vec<u8>,
    },
}

impl MetadataEntry {
    fn value_bytes(&self) -> Vec<u8> {
        match self {
            MetadataEntry::Size(v) | MetadataEntry::Mtime(v) => v.to_be_bytes().to_vec(),
            MetadataEntry::Backend(id) => vec![*id],
            MetadataEntry::Payload(descriptor) => descriptor.pack(),
            MetadataEntry::Error(message) => message.as_bytes().to_vec(),
            MetadataEntry::Unknown { value, .. } => value.clone(),
        }
    }

    fn type_byte(&self) -> u8 {
        match self {
            MetadataEntry::Size(_) => TLV_SIZE,
            MetadataEntry::Mtime(_) => TLV_MTIME,
            MetadataEntry::Backend(_) => TLV_BACKEND,
            MetadataEntry::Payload(_) => TLV_PAYLOAD,
            MetadataEntry::Error(_) => TLV_ERROR,
            MetadataEntry::Unknown { tlv_type, .. } => *tlv_type,
        }
    }
}

/// Encode a metadata list into its wire block
pub fn encode(entries: &[MetadataEntry]) -> ProtocolResult<Vec<u8>> {
    let mut out = Vec::new();
    for entry in entries {
        let value = entry.value_bytes();
        if value.len() > u16::MAX as usize {
            return Err(ProtocolError::Malformed(format!(
                "metadata value of {} bytes exceeds TLV length field",
                value.len()
            )));
        }
        out.push(entry.type_byte());
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(&value);
    }
    if out.len() > MAX_METADATA_LEN {
        return Err(ProtocolError::Malformed(format!(
            "metadata block of {} bytes exceeds maximum {MAX_METADATA_LEN}",
            out.len()
        )));
    }
    Ok(out)
}

/// Decode a wire metadata block into entries
pub fn decode(mut block: &[u8]) -> ProtocolResult<Vec<MetadataEntry>> {
    let mut entries = Vec::new();
    while !block.is_empty() {
        if block.len() < 3 {
            return Err(ProtocolError::Malformed(
                "truncated metadata TLV header".into(),
            ));
        }
        let tlv_type = block[0];
        let length = u16::from_be_bytes([block[1], block[2]]) as usize;
        block = &block[3..];
        if block.len() < length {
            return Err(ProtocolError::Malformed(format!(
                "metadata TLV claims {length} bytes, {} remain",
                block.len()
            )));
        }
        let (value, rest) = block.split_at(length);
        block = rest;

        let entry = match tlv_type {
            TLV_SIZE | TLV_MTIME => {
                if value.len() != 8 {
                    return Err(ProtocolError::Malformed(format!(
                        "metadata TLV 0x{tlv_type:02x} has length {length}, expected 8"
                    )));
                }
                let v = u64::from_be_bytes(value.try_into().unwrap());
                if tlv_type == TLV_SIZE {
                    MetadataEntry::Size(v)
                } else {
                    MetadataEntry::Mtime(v)
                }
            }
            TLV_BACKEND => {
                if value.len() != 1 {
                    return Err(ProtocolError::Malformed(format!(
                        "backend TLV has length {length}, expected 1"
                    )));
                }
                MetadataEntry::Backend(value[0])
            }
            TLV_PAYLOAD => MetadataEntry::Payload(
                PayloadDescriptor::unpack(value)
                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?,
            ),
            TLV_ERROR => MetadataEntry::Error(String::from_utf8_lossy(value).into_owned()),
            other => MetadataEntry::Unknown {
                tlv_type: other,
                value: value.to_vec(),
            },
        };
        entries.push(entry);
    }
    Ok(entries)
}

/// Pull the object size out of a decoded metadata list
pub fn find_size(entries: &[MetadataEntry]) -> Option<u64> {
    entries.iter().find_map(|e| match e {
        MetadataEntry::Size(v) => Some(*v),
        _ => None,
    })
}

/// Pull the error message out of a decoded metadata list
pub fn find_error(entries: &[MetadataEntry]) -> Option<&str> {
    entries.iter().find_map(|e| match e {
        MetadataEntry::Error(message) => Some(message.as_str()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_types() {
        let entries = vec![
            MetadataEntry::Size(64),
            MetadataEntry::Mtime(1_700_000_000),
            MetadataEntry::Backend(3),
            MetadataEntry::Payload(PayloadDescriptor::identity_only(64)),
            MetadataEntry::Error("object store offline".into()),
            MetadataEntry::Unknown {
                tlv_type: 0x77,
                value: vec![1, 2, 3],
            },
        ];
        let block = encode(&entries).unwrap();
        let decoded = decode(&block).unwrap();
        assert_eq!(decoded, entries);
        assert_eq!(find_size(&decoded), Some(64));
        assert_eq!(find_error(&decoded), Some("object store offline"));
    }

    #[test]
    fn test_truncated_block_rejected() {
        let block = encode(&[MetadataEntry::Size(1)]).unwrap();
        assert!(decode(&block[..block.len() - 1]).is_err());
        assert!(decode(&block[..2]).is_err());
    }

    #[test]
    fn test_bad_fixed_width_rejected() {
        // SIZE with a 4-byte value is malformed.
        let block = [TLV_SIZE, 0, 4, 1, 2, 3, 4];
        assert!(decode(&block).is_err());
    }
}
