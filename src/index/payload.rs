//! Payload descriptors: the available body variants of a stored object.
//!
//! A descriptor enumerates up to [`MAX_VARIANTS`] encodings of one object
//! body together with per-variant delivery capabilities. The packed form
//! uses little-endian fixed-size fields so the on-disk descriptor can be
//! carried verbatim in the `PAYLOAD` metadata TLV and in persisted index
//! records.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed descriptor schema version; readers reject anything else
pub const PAYLOAD_SCHEMA_VERSION: u16 = 1;

/// Maximum number of variants in one descriptor
pub const MAX_VARIANTS: usize = 8;

/// Packed size of the descriptor header in bytes
pub const PACKED_HEADER_LEN: usize = 8;

/// Packed size of one variant record in bytes
pub const PACKED_VARIANT_LEN: usize = 32;

/// Per-variant capability bits
pub mod payload_caps {
    /// Variant is the identity (uncompressed) encoding
    pub const IDENTITY: u32 = 0x01;
    /// Variant is gzip-encoded
    pub const GZIP: u32 = 0x02;
    /// Variant is brotli-encoded
    pub const BROTLI: u32 = 0x04;
    /// Variant is zstd-encoded
    pub const ZSTD: u32 = 0x08;
    /// Variant supports aligned range reads
    pub const RANGE_READY: u32 = 0x10;
    /// Variant may be delivered without a userspace copy
    pub const ZERO_COPY: u32 = 0x20;
    /// Variant is laid out for TLS offload
    pub const TLS_OFFLOAD: u32 = 0x40;
}

/// Payload descriptor errors
#[derive(Error, Debug)]
pub enum PayloadError {
    /// Descriptor failed an invariant check
    #[error("Invalid payload descriptor: {0}")]
    Invalid(String),

    /// Packed bytes were truncated or mis-sized
    #[error("Packed descriptor has bad length {actual}, expected {expected}")]
    BadLength {
        /// Observed byte count
        actual: usize,
        /// Required byte count
        expected: usize,
    },

    /// Packed bytes carried an unknown schema version
    #[error("Unsupported descriptor schema version {0}")]
    SchemaVersion(u16),
}

/// Result type for payload descriptor operations
pub type PayloadResult<T> = std::result::Result<T, PayloadError>;

/// Body encoding of one variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Encoding {
    /// Stored bytes equal logical bytes
    Identity = 0,
    /// gzip
    Gzip = 1,
    /// brotli
    Brotli = 2,
    /// zstd
    Zstd = 3,
}

impl Encoding {
    fn from_u8(value: u8) -> PayloadResult<Self> {
        Ok(match value {
            0 => Encoding::Identity,
            1 => Encoding::Gzip,
            2 => Encoding::Brotli,
            3 => Encoding::Zstd,
            other => return Err(PayloadError::Invalid(format!("unknown encoding {other}"))),
        })
    }
}

/// One deliverable variant of an object body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantDescriptor {
    /// Stable variant identifier, unique within the descriptor
    pub variant_id: u32,

    /// Body encoding
    pub encoding: Encoding,

    /// Exactly one variant per descriptor carries this
    pub is_primary: bool,

    /// Decoded body length in bytes
    pub logical_length: u64,

    /// Stored length in bytes (≥ logical for identity)
    pub storage_length: u64,

    /// Range-read alignment; required non-zero when RANGE_READY is set
    pub range_granularity: u32,

    /// Capability bits, see [`payload_caps`]
    pub capabilities: u32,
}

impl VariantDescriptor {
    /// Build the identity variant seeded by `update_size`
    pub fn identity(length: u64) -> Self {
        Self {
            variant_id: 0,
            encoding: Encoding::Identity,
            is_primary: true,
            logical_length: length,
            storage_length: length,
            range_granularity: 0,
            capabilities: payload_caps::IDENTITY | payload_caps::ZERO_COPY,
        }
    }

    fn validate(&self) -> PayloadResult<()> {
        let identity_cap = self.capabilities & payload_caps::IDENTITY != 0;
        if identity_cap != (self.encoding == Encoding::Identity) {
            return Err(PayloadError::Invalid(format!(
                "variant {}: IDENTITY capability must match identity encoding",
                self.variant_id
            )));
        }
        let gzip_cap = self.capabilities & payload_caps::GZIP != 0;
        if gzip_cap != (self.encoding == Encoding::Gzip) {
            return Err(PayloadError::Invalid(format!(
                "variant {}: GZIP capability must match gzip encoding",
                self.variant_id
            )));
        }
        if self.capabilities & payload_caps::RANGE_READY != 0 && self.range_granularity == 0 {
            return Err(PayloadError::Invalid(format!(
                "variant {}: RANGE_READY requires a non-zero range granularity",
                self.variant_id
            )));
        }
        if self.encoding == Encoding::Identity && self.storage_length < self.logical_length {
            return Err(PayloadError::Invalid(format!(
                "variant {}: identity storage length {} below logical length {}",
                self.variant_id, self.storage_length, self.logical_length
            )));
        }
        Ok(())
    }

    fn pack_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.variant_id.to_le_bytes());
        out.push(self.encoding as u8);
        out.push(self.is_primary as u8);
        out.extend_from_slice(&[0u8; 2]);
        out.extend_from_slice(&self.logical_length.to_le_bytes());
        out.extend_from_slice(&self.storage_length.to_le_bytes());
        out.extend_from_slice(&self.range_granularity.to_le_bytes());
        out.extend_from_slice(&self.capabilities.to_le_bytes());
    }

    fn unpack(record: &[u8]) -> PayloadResult<Self> {
        debug_assert_eq!(record.len(), PACKED_VARIANT_LEN);
        Ok(Self {
            variant_id: u32::from_le_bytes(record[0..4].try_into().unwrap()),
            encoding: Encoding::from_u8(record[4])?,
            is_primary: record[5] != 0,
            logical_length: u64::from_le_bytes(record[8..16].try_into().unwrap()),
            storage_length: u64::from_le_bytes(record[16..24].try_into().unwrap()),
            range_granularity: u32::from_le_bytes(record[24..28].try_into().unwrap()),
            capabilities: u32::from_le_bytes(record[28..32].try_into().unwrap()),
        })
    }
}

/// The variant set of one stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadDescriptor {
    /// Available variants, at least one, exactly one primary
    pub variants: Vec<VariantDescriptor>,
}

impl PayloadDescriptor {
    /// Build a descriptor holding only the identity variant
    pub fn identity_only(length: u64) -> Self {
        Self {
            variants: vec![VariantDescriptor::identity(length)],
        }
    }

    /// Number of variants
    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }

    /// The variant flagged primary
    pub fn primary(&self) -> Option<&VariantDescriptor> {
        self.variants.iter().find(|v| v.is_primary)
    }

    /// Check the full descriptor invariant set
    pub fn validate(&self) -> PayloadResult<()> {
        if self.variants.is_empty() || self.variants.len() > MAX_VARIANTS {
            return Err(PayloadError::Invalid(format!(
                "variant count {} outside [1, {MAX_VARIANTS}]",
                self.variants.len()
            )));
        }
        let primaries = self.variants.iter().filter(|v| v.is_primary).count();
        if primaries != 1 {
            return Err(PayloadError::Invalid(format!(
                "descriptor carries {primaries} primary variants, expected exactly one"
            )));
        }
        for variant in &self.variants {
            variant.validate()?;
        }
        Ok(())
    }

    /// Packed byte length of this descriptor
    pub fn packed_len(&self) -> usize {
        PACKED_HEADER_LEN + self.variants.len() * PACKED_VARIANT_LEN
    }

    /// Pack into the little-endian wire/disk layout
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.packed_len());
        out.extend_from_slice(&PAYLOAD_SCHEMA_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.variants.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        for variant in &self.variants {
            variant.pack_into(&mut out);
        }
        out
    }

    /// Unpack from the little-endian layout, rejecting schema mismatches
    pub fn unpack(bytes: &[u8]) -> PayloadResult<Self> {
        if bytes.len() < PACKED_HEADER_LEN {
            return Err(PayloadError::BadLength {
                actual: bytes.len(),
                expected: PACKED_HEADER_LEN,
            });
        }
        let schema = u16::from_le_bytes(bytes[0..2].try_into().unwrap());
        if schema != PAYLOAD_SCHEMA_VERSION {
            return Err(PayloadError::SchemaVersion(schema));
        }
        let count = u16::from_le_bytes(bytes[2..4].try_into().unwrap()) as usize;
        let expected = PACKED_HEADER_LEN + count * PACKED_VARIANT_LEN;
        if bytes.len() != expected {
            return Err(PayloadError::BadLength {
                actual: bytes.len(),
                expected,
            });
        }
        let mut variants = Vec::with_capacity(count);
        for i in 0..count {
            let start = PACKED_HEADER_LEN + i * PACKED_VARIANT_LEN;
            variants.push(VariantDescriptor::unpack(
                &bytes[start..start + PACKED_VARIANT_LEN],
            )?);
        }
        Ok(Self { variants })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gzip_variant(id: u32) -> VariantDescriptor {
        VariantDescriptor {
            variant_id: id,
            encoding: Encoding::Gzip,
            is_primary: false,
            logical_length: 1000,
            storage_length: 400,
            range_granularity: 0,
            capabilities: payload_caps::GZIP,
        }
    }

    #[test]
    fn test_identity_descriptor_validates() {
        let descriptor = PayloadDescriptor::identity_only(64);
        assert!(descriptor.validate().is_ok());
        assert_eq!(descriptor.primary().unwrap().logical_length, 64);
    }

    #[test]
    fn test_exactly_one_primary() {
        let mut descriptor = PayloadDescriptor::identity_only(64);
        descriptor.variants.push(VariantDescriptor {
            is_primary: true,
            ..gzip_variant(1)
        });
        assert!(descriptor.validate().is_err());

        let no_primary = PayloadDescriptor {
            variants: vec![gzip_variant(1)],
        };
        assert!(no_primary.validate().is_err());
    }

    #[test]
    fn test_variant_count_bounds() {
        let empty = PayloadDescriptor { variants: vec![] };
        assert!(empty.validate().is_err());

        let mut max = PayloadDescriptor::identity_only(10);
        for id in 1..MAX_VARIANTS as u32 {
            max.variants.push(gzip_variant(id));
        }
        assert_eq!(max.variant_count(), MAX_VARIANTS);
        assert!(max.validate().is_ok());

        max.variants.push(gzip_variant(99));
        assert!(max.validate().is_err());
    }

    #[test]
    fn test_capability_encoding_coupling() {
        let mut descriptor = PayloadDescriptor::identity_only(64);
        // Identity variant claiming the GZIP capability must fail.
        descriptor.variants[0].capabilities |= payload_caps::GZIP;
        assert!(descriptor.validate().is_err());

        let mut ranged = PayloadDescriptor::identity_only(64);
        ranged.variants[0].capabilities |= payload_caps::RANGE_READY;
        assert!(ranged.validate().is_err());
        ranged.variants[0].range_granularity = 4096;
        assert!(ranged.validate().is_ok());
    }

    #[test]
    fn test_identity_storage_length_floor() {
        let mut descriptor = PayloadDescriptor::identity_only(64);
        descriptor.variants[0].storage_length = 32;
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_pack_unpack_round_trip() {
        let mut descriptor = PayloadDescriptor::identity_only(4096);
        descriptor.variants[0].range_granularity = 512;
        descriptor.variants[0].capabilities |= payload_caps::RANGE_READY;
        descriptor.variants.push(gzip_variant(7));

        let packed = descriptor.pack();
        assert_eq!(packed.len(), descriptor.packed_len());
        let unpacked = PayloadDescriptor::unpack(&packed).unwrap();
        assert_eq!(unpacked, descriptor);
    }

    #[test]
    fn test_unpack_rejects_schema_mismatch() {
        let mut packed = PayloadDescriptor::identity_only(1).pack();
        packed[0] = 0xEE;
        assert!(matches!(
            PayloadDescriptor::unpack(&packed),
            Err(PayloadError::SchemaVersion(_))
        ));
    }
}
