//! MQTT fixture packet codec
//!
//! Pure, deterministic encode/decode for the packet shapes the harness
//! needs as test fixtures (CONNECT and CONNACK, MQTT v3.1.1). No state,
//! no I/O; malformed specs fail with an error rather than panicking.

mod decode;
mod encode;


pub use decode::{decode_connack, decode_connect};
pub use encode::{connack_bytes, connect_bytes, encode_connack, encode_connect};

use bytes::{BufMut, BytesMut};

use crate::protocol::{DecodeError, EncodeError};

/// Maximum remaining length encodable in a 4-byte variable integer
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Write a Variable Byte Integer to the buffer
#[inline]
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<(), EncodeError> {
    if value as usize > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }

    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            return Ok(());
        }
    }
}

/// Read a Variable Byte Integer from the buffer.
/// Returns (value, bytes_consumed).
#[inline]
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut multiplier: u32 = 1;
    let mut value: u32 = 0;
    let mut pos = 0;

    loop {
        if pos >= buf.len() {
            return Err(DecodeError::InsufficientData);
        }
        if pos >= 4 {
            return Err(DecodeError::InvalidRemainingLength);
        }

        let byte = buf[pos];
        value += ((byte & 0x7F) as u32) * multiplier;
        pos += 1;

        if (byte & 0x80) == 0 {
            return Ok((value, pos));
        }

        multiplier *= 128;
    }
}

/// Write a length-prefixed UTF-8 string
#[inline]
pub fn write_string(
    buf: &mut BytesMut,
    s: &str,
    field: &'static str,
) -> Result<(), EncodeError> {
    if s.len() > u16::MAX as usize {
        return Err(EncodeError::FieldTooLong(field));
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Write length-prefixed binary data
#[inline]
pub fn write_binary(
    buf: &mut BytesMut,
    data: &[u8],
    field: &'static str,
) -> Result<(), EncodeError> {
    if data.len() > u16::MAX as usize {
        return Err(EncodeError::FieldTooLong(field));
    }
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
    Ok(())
}

/// Read a length-prefixed UTF-8 string.
/// Returns (string, bytes_consumed).
#[inline]
pub fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (data, consumed) = read_binary(buf)?;
    let s = std::str::from_utf8(data).map_err(|_| DecodeError::InvalidUtf8)?;
    Ok((s, consumed))
}

/// Read length-prefixed binary data.
/// Returns (data, bytes_consumed).
#[inline]
pub fn read_binary(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }

    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let total = 2 + len;

    if buf.len() < total {
        return Err(DecodeError::InsufficientData);
    }

    Ok((&buf[2..total], total))
}
