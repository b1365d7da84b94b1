//! Fixture packet decoder
//!
//! The conforming decoder side of the codec: recovers CONNECT and
//! CONNACK specs from wire bytes, validating the framing the broker is
//! expected to validate (protocol name and level, reserved bits, flag
//! and payload consistency, remaining length).

use bytes::Bytes;

use super::{read_binary, read_string, read_variable_int};
use crate::protocol::{
    ConnAckSpec, ConnectReturnCode, ConnectSpec, Credentials, DecodeError, QoS, WillSpec,
    PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// Decode a CONNECT packet
pub fn decode_connect(buf: &[u8]) -> Result<ConnectSpec, DecodeError> {
    if buf.is_empty() {
        return Err(DecodeError::InsufficientData);
    }
    if buf[0] != 0x10 {
        return Err(DecodeError::UnexpectedPacketType(buf[0] >> 4));
    }

    let (remaining_length, header_len) = read_variable_int(&buf[1..])?;
    let body = &buf[1 + header_len..];
    if body.len() != remaining_length as usize {
        return Err(DecodeError::LengthMismatch);
    }

    let mut pos = 0;

    let (name, consumed) = read_string(&body[pos..])?;
    if name != PROTOCOL_NAME {
        return Err(DecodeError::InvalidProtocolName);
    }
    pos += consumed;

    if body.len() < pos + 4 {
        return Err(DecodeError::InsufficientData);
    }

    let level = body[pos];
    if level != PROTOCOL_LEVEL {
        return Err(DecodeError::InvalidProtocolLevel(level));
    }
    pos += 1;

    let flags = body[pos];
    pos += 1;
    if flags & 0x01 != 0 {
        return Err(DecodeError::MalformedPacket("reserved connect flag set"));
    }

    let clean_session = flags & 0x02 != 0;
    let will_flag = flags & 0x04 != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = flags & 0x20 != 0;
    let password_flag = flags & 0x40 != 0;
    let username_flag = flags & 0x80 != 0;

    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(DecodeError::MalformedPacket("will bits set without will flag"));
    }
    if password_flag && !username_flag {
        return Err(DecodeError::MalformedPacket("password flag without username flag"));
    }

    let keep_alive = u16::from_be_bytes([body[pos], body[pos + 1]]);
    pos += 2;

    let (client_id, consumed) = read_string(&body[pos..])?;
    let client_id = client_id.to_string();
    pos += consumed;

    let will = if will_flag {
        let (topic, consumed) = read_string(&body[pos..])?;
        let topic = topic.to_string();
        pos += consumed;
        let (payload, consumed) = read_binary(&body[pos..])?;
        let payload = Bytes::copy_from_slice(payload);
        pos += consumed;
        Some(WillSpec {
            topic,
            payload,
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let credentials = if username_flag {
        let (username, consumed) = read_string(&body[pos..])?;
        let username = username.to_string();
        pos += consumed;
        let password = if password_flag {
            let (password, consumed) = read_binary(&body[pos..])?;
            pos += consumed;
            Some(Bytes::copy_from_slice(password))
        } else {
            None
        };
        Some(Credentials { username, password })
    } else {
        None
    };

    if pos != body.len() {
        return Err(DecodeError::MalformedPacket("trailing bytes after payload"));
    }

    Ok(ConnectSpec {
        client_id,
        keep_alive,
        clean_session,
        will,
        credentials,
    })
}

/// Decode a CONNACK packet
pub fn decode_connack(buf: &[u8]) -> Result<ConnAckSpec, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::InsufficientData);
    }
    if buf[0] != 0x20 {
        return Err(DecodeError::UnexpectedPacketType(buf[0] >> 4));
    }
    if buf[1] != 0x02 || buf.len() != 4 {
        return Err(DecodeError::LengthMismatch);
    }
    if buf[2] & 0xFE != 0 {
        return Err(DecodeError::MalformedPacket("reserved acknowledge flags set"));
    }

    Ok(ConnAckSpec {
        session_present: buf[2] & 0x01 != 0,
        return_code: ConnectReturnCode::try_from(buf[3])?,
    })
}
