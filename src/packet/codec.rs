//! Primitive encoders and decoders shared by every control packet
//!
//! Remaining-length varints, length-prefixed strings and binary fields,
//! and bounds-checked big-endian integers.

use super::PacketError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest value representable by the four-byte remaining length field
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Decode a remaining-length varint from the start of `buf`
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the decoded value
/// and the number of bytes the varint occupied.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, PacketError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for (index, byte) in buf.iter().enumerate() {
        if index == 4 {
            return Err(PacketError::MalformedRemainingLength);
        }
        value += (*byte as usize & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
        multiplier *= 128;
    }

    if buf.len() >= 4 {
        return Err(PacketError::MalformedRemainingLength);
    }
    Ok(None)
}

/// Append a remaining-length varint to `buf`
pub fn encode_remaining_length(mut len: usize, buf: &mut BytesMut) -> Result<(), PacketError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(PacketError::PayloadTooLarge(len));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

pub fn write_string(buf: &mut BytesMut, value: &str) {
    write_binary(buf, value.as_bytes());
}

pub fn write_binary(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

pub fn read_u8(buf: &mut Bytes) -> Result<u8, PacketError> {
    if buf.remaining() < 1 {
        return Err(PacketError::Malformed("truncated byte field".to_string()));
    }
    Ok(buf.get_u8())
}

pub fn read_u16(buf: &mut Bytes) -> Result<u16, PacketError> {
    if buf.remaining() < 2 {
        return Err(PacketError::Malformed("truncated u16 field".to_string()));
    }
    Ok(buf.get_u16())
}

pub fn read_binary(buf: &mut Bytes) -> Result<Bytes, PacketError> {
    let len = read_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(PacketError::Malformed(format!(
            "length prefix {len} exceeds {} remaining bytes",
            buf.remaining()
        )));
    }
    Ok(buf.split_to(len))
}

pub fn read_string(buf: &mut Bytes) -> Result<String, PacketError> {
    let raw = read_binary(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| PacketError::InvalidUtf8)
}
