//! MQTT v3.1.1 Packet Codec
//!
//! Wire format: every packet starts with one control byte (type nibble +
//! flags nibble) and a variable-length body size (1-4 bytes, 7 value bits
//! per byte, high bit set while more bytes follow). Strings and binary
//! fields inside the body carry a big-endian u16 length prefix.

mod decode;
mod encode;


pub use decode::Decoder;
pub use encode::Encoder;

use crate::protocol::{DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};

/// Largest body size the 4-byte length field can carry (268,435,455)
pub const MAX_REMAINING_LENGTH: usize = (1 << 28) - 1;

/// Decode the body-size field. The bytes are base-128 digits, least
/// significant first. Returns (size, bytes consumed).
#[inline]
pub fn decode_length(input: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut size: u32 = 0;
    for (i, &byte) in input.iter().enumerate() {
        if i == 4 {
            return Err(DecodeError::InvalidRemainingLength);
        }
        size |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((size, i + 1));
        }
    }
    Err(DecodeError::InsufficientData)
}

/// Encode a body size as 1-4 base-128 digits
#[inline]
pub fn encode_length(buf: &mut BytesMut, size: usize) -> Result<(), EncodeError> {
    if size > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }

    let mut rest = size as u32;
    loop {
        let digit = (rest & 0x7F) as u8;
        rest >>= 7;
        if rest == 0 {
            buf.put_u8(digit);
            return Ok(());
        }
        buf.put_u8(digit | 0x80);
    }
}

/// Take a u16-length-prefixed binary field off the front of `input`.
/// Returns (field, bytes consumed).
#[inline]
pub fn take_bytes(input: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    if input.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    let len = u16::from_be_bytes([input[0], input[1]]) as usize;
    let field = input
        .get(2..2 + len)
        .ok_or(DecodeError::InsufficientData)?;
    Ok((field, 2 + len))
}

/// Take a u16-length-prefixed UTF-8 string off the front of `input`.
/// MQTT additionally forbids U+0000 inside strings.
#[inline]
pub fn take_str(input: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (raw, consumed) = take_bytes(input)?;
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
    if text.bytes().any(|b| b == 0) {
        return Err(DecodeError::MalformedPacket("string contains U+0000"));
    }
    Ok((text, consumed))
}

/// Append a u16-length-prefixed binary field
#[inline]
pub fn put_bytes(buf: &mut BytesMut, field: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(field.len()).map_err(|_| EncodeError::StringTooLong)?;
    buf.put_u16(len);
    buf.put_slice(field);
    Ok(())
}

/// Append a u16-length-prefixed UTF-8 string
#[inline]
pub fn put_str(buf: &mut BytesMut, text: &str) -> Result<(), EncodeError> {
    put_bytes(buf, text.as_bytes())
}
