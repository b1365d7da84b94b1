//! MQTT v3.1.1 fixture packet definitions
//!
//! Typed specifications for the packets the harness builds as test
//! fixtures: CONNECT (client -> broker) and CONNACK (broker -> client).
//! The codec module turns these into byte-exact wire packets.

use bytes::Bytes;

mod error;

pub use error::{DecodeError, EncodeError};

/// Protocol name carried in the CONNECT variable header
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for MQTT v3.1.1
pub const PROTOCOL_LEVEL: u8 = 4;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery (fire and forget)
    #[default]
    AtMostOnce = 0,
    /// At least once delivery (acknowledged)
    AtLeastOnce = 1,
    /// Exactly once delivery (assured)
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            q => Err(DecodeError::InvalidQoS(q)),
        }
    }
}

/// CONNACK return codes (MQTT v3.1.1, table 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnectReturnCode {
    /// Connection accepted
    #[default]
    Accepted = 0x00,
    /// Refused: unacceptable protocol version
    RefusedProtocolVersion = 0x01,
    /// Refused: client identifier rejected
    RefusedIdentifierRejected = 0x02,
    /// Refused: server unavailable
    RefusedServerUnavailable = 0x03,
    /// Refused: bad user name or password
    RefusedBadCredentials = 0x04,
    /// Refused: not authorized
    RefusedNotAuthorized = 0x05,
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0x00 => Ok(Self::Accepted),
            0x01 => Ok(Self::RefusedProtocolVersion),
            0x02 => Ok(Self::RefusedIdentifierRejected),
            0x03 => Ok(Self::RefusedServerUnavailable),
            0x04 => Ok(Self::RefusedBadCredentials),
            0x05 => Ok(Self::RefusedNotAuthorized),
            c => Err(DecodeError::InvalidReturnCode(c)),
        }
    }
}

/// Will message carried in a CONNECT fixture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillSpec {
    /// Will topic
    pub topic: String,
    /// Will payload
    pub payload: Bytes,
    /// Will QoS
    pub qos: QoS,
    /// Will retain flag
    pub retain: bool,
}

/// Username/password carried in a CONNECT fixture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name
    pub username: String,
    /// Password (optional; the flag bit requires the username bit)
    pub password: Option<Bytes>,
}

/// Specification for a CONNECT fixture packet
///
/// Immutable once built; consumed by the codec to produce wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSpec {
    /// Client identifier
    pub client_id: String,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    /// Clean session flag
    pub clean_session: bool,
    /// Will message (optional)
    pub will: Option<WillSpec>,
    /// Username/password (optional)
    pub credentials: Option<Credentials>,
}

impl ConnectSpec {
    /// New spec with the defaults the scenario family uses:
    /// clean session, no will, no credentials, 60 second keepalive.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            keep_alive: 60,
            clean_session: true,
            will: None,
            credentials: None,
        }
    }

    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn will(mut self, will: WillSpec) -> Self {
        self.will = Some(will);
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

/// Specification for a CONNACK fixture packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnAckSpec {
    /// Session present flag (bit 0 of the acknowledge flags byte)
    pub session_present: bool,
    /// Connect return code
    pub return_code: ConnectReturnCode,
}

impl ConnAckSpec {
    pub fn new(return_code: ConnectReturnCode) -> Self {
        Self {
            session_present: false,
            return_code,
        }
    }
}
