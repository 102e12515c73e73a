//! MQTT Protocol definitions and types
//!
//! Defines the MQTT v3.1.1 control packets and the small value types shared
//! by the codec, the protocol engine and the session layer.

mod error;
mod packet;

pub use error::{DecodeError, EncodeError};
pub use packet::*;

use std::fmt;

/// Protocol level sent in CONNECT (MQTT v3.1.1)
pub const PROTOCOL_LEVEL: u8 = 4;

/// Protocol name sent in CONNECT
pub const PROTOCOL_NAME: &str = "MQTT";

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// MQTT Packet Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            5 => Some(PacketType::PubRec),
            6 => Some(PacketType::PubRel),
            7 => Some(PacketType::PubComp),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }
}

/// CONNACK return code (MQTT v3.1.1 section 3.2.2.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectReturnCode {
    /// Connection accepted
    Accepted = 0,
    /// The server does not support the requested protocol level
    RefusedProtocolVersion = 1,
    /// The client identifier is not allowed by the server
    RefusedIdentifierRejected = 2,
    /// The MQTT service is unavailable
    RefusedServerUnavailable = 3,
    /// Malformed username or password
    RefusedBadCredentials = 4,
    /// The client is not authorized to connect
    RefusedNotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ConnectReturnCode::Accepted),
            1 => Some(ConnectReturnCode::RefusedProtocolVersion),
            2 => Some(ConnectReturnCode::RefusedIdentifierRejected),
            3 => Some(ConnectReturnCode::RefusedServerUnavailable),
            4 => Some(ConnectReturnCode::RefusedBadCredentials),
            5 => Some(ConnectReturnCode::RefusedNotAuthorized),
            _ => None,
        }
    }

    pub fn is_accepted(self) -> bool {
        self == ConnectReturnCode::Accepted
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "connection accepted"),
            Self::RefusedProtocolVersion => write!(f, "unacceptable protocol version"),
            Self::RefusedIdentifierRejected => write!(f, "identifier rejected"),
            Self::RefusedServerUnavailable => write!(f, "server unavailable"),
            Self::RefusedBadCredentials => write!(f, "bad user name or password"),
            Self::RefusedNotAuthorized => write!(f, "not authorized"),
        }
    }
}
