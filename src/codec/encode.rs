//! Fixture packet encoder
//!
//! Produces wire-exact MQTT v3.1.1 CONNECT and CONNACK packets from
//! their typed specs.

use bytes::{BufMut, Bytes, BytesMut};

use super::{write_binary, write_string, write_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{ConnAckSpec, ConnectSpec, EncodeError, PROTOCOL_LEVEL, PROTOCOL_NAME};

/// Encoded size of a length-prefixed field, checked against the
/// two-byte length prefix.
fn prefixed_len(len: usize, field: &'static str) -> Result<usize, EncodeError> {
    if len > u16::MAX as usize {
        return Err(EncodeError::FieldTooLong(field));
    }
    Ok(2 + len)
}

/// Encode a CONNECT packet into the buffer.
///
/// All field lengths are validated before any byte is emitted, so the
/// buffer is left untouched on error.
pub fn encode_connect(spec: &ConnectSpec, buf: &mut BytesMut) -> Result<(), EncodeError> {
    // Variable header: protocol name (2 + 4), level, connect flags, keepalive
    let mut remaining_length = 6 + 1 + 1 + 2;

    remaining_length += prefixed_len(spec.client_id.len(), "client identifier")?;

    if let Some(ref will) = spec.will {
        remaining_length += prefixed_len(will.topic.len(), "will topic")?;
        remaining_length += prefixed_len(will.payload.len(), "will payload")?;
    }

    if let Some(ref credentials) = spec.credentials {
        remaining_length += prefixed_len(credentials.username.len(), "username")?;
        if let Some(ref password) = credentials.password {
            remaining_length += prefixed_len(password.len(), "password")?;
        }
    }

    if remaining_length > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }

    // Fixed header: CONNECT type nibble, reserved flags zero
    buf.put_u8(0x10);
    write_variable_int(buf, remaining_length as u32)?;

    write_string(buf, PROTOCOL_NAME, "protocol name")?;
    buf.put_u8(PROTOCOL_LEVEL);

    let mut connect_flags: u8 = 0;
    if spec.clean_session {
        connect_flags |= 0x02;
    }
    if let Some(ref will) = spec.will {
        connect_flags |= 0x04;
        connect_flags |= (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 0x20;
        }
    }
    if let Some(ref credentials) = spec.credentials {
        connect_flags |= 0x80;
        if credentials.password.is_some() {
            connect_flags |= 0x40;
        }
    }
    buf.put_u8(connect_flags);

    buf.put_u16(spec.keep_alive);

    write_string(buf, &spec.client_id, "client identifier")?;

    if let Some(ref will) = spec.will {
        write_string(buf, &will.topic, "will topic")?;
        write_binary(buf, &will.payload, "will payload")?;
    }

    if let Some(ref credentials) = spec.credentials {
        write_string(buf, &credentials.username, "username")?;
        if let Some(ref password) = credentials.password {
            write_binary(buf, password, "password")?;
        }
    }

    Ok(())
}

/// Encode a CONNACK packet into the buffer.
/// Always exactly 4 bytes.
pub fn encode_connack(spec: &ConnAckSpec, buf: &mut BytesMut) {
    buf.put_u8(0x20); // CONNACK type nibble, reserved flags zero
    buf.put_u8(0x02); // remaining length
    buf.put_u8(if spec.session_present { 0x01 } else { 0x00 });
    buf.put_u8(spec.return_code as u8);
}

/// Convenience wrapper returning the CONNECT wire bytes
pub fn connect_bytes(spec: &ConnectSpec) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::new();
    encode_connect(spec, &mut buf)?;
    Ok(buf.freeze())
}

/// Convenience wrapper returning the CONNACK wire bytes
pub fn connack_bytes(spec: &ConnAckSpec) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    encode_connack(spec, &mut buf);
    buf.freeze()
}
