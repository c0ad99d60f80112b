//! Byte-level helpers shared by the frame codecs.

use std::io::{Read, Write};

use crate::protocol::ProtocolResult;

pub(crate) fn read_u8<R: Read>(r: &mut R) -> ProtocolResult<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub(crate) fn read_u16_be<R: Read>(r: &mut R) -> ProtocolResult<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

pub(crate) fn read_u32_be<R: Read>(r: &mut R) -> ProtocolResult<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn read_u64_be<R: Read>(r: &mut R) -> ProtocolResult<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

pub(crate) fn read_vec<R: Read>(r: &mut R, len: usize) -> ProtocolResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub(crate) fn write_all<W: Write>(w: &mut W, bytes: &[u8]) -> ProtocolResult<()> {
    w.write_all(bytes)?;
    Ok(())
}
