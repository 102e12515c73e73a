//! Codec failures
//!
//! `DecodeError::InsufficientData` is not a protocol violation: the decoder
//! maps it to `Ok(None)` so the caller reads more bytes. Every other decode
//! variant means the peer sent something this client will not accept.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    InsufficientData,
    /// Packet type nibble outside 1..=14
    InvalidPacketType(u8),
    /// Variable byte integer longer than four bytes
    InvalidRemainingLength,
    InvalidProtocolName,
    InvalidProtocolVersion(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    /// Fixed-header flag bits that v3.1.1 reserves
    InvalidFlags,
    MalformedPacket(&'static str),
    /// Larger than the configured inbound limit
    PacketTooLarge,
    /// CONNACK or SUBACK code this protocol level does not define
    InvalidReturnCode(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use DecodeError::*;
        match self {
            InsufficientData => f.write_str("incomplete packet"),
            InvalidPacketType(t) => write!(f, "unknown packet type {}", t),
            InvalidRemainingLength => f.write_str("remaining length exceeds four bytes"),
            InvalidProtocolName => f.write_str("protocol name is not MQTT"),
            InvalidProtocolVersion(v) => write!(f, "unsupported protocol level {}", v),
            InvalidQoS(q) => write!(f, "QoS {} out of range", q),
            InvalidUtf8 => f.write_str("string is not valid UTF-8"),
            InvalidFlags => f.write_str("reserved header flags set"),
            MalformedPacket(why) => write!(f, "malformed packet: {}", why),
            PacketTooLarge => f.write_str("packet exceeds size limit"),
            InvalidReturnCode(r) => write!(f, "unknown return code {:#04x}", r),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length beyond what four length bytes can express
    PacketTooLarge,
    /// String or binary field longer than its u16 prefix allows
    StringTooLong,
    /// QoS 1 or 2 PUBLISH without a packet identifier
    MissingPacketId,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EncodeError::PacketTooLarge => "packet exceeds maximum remaining length",
            EncodeError::StringTooLong => "field exceeds 65535 bytes",
            EncodeError::MissingPacketId => "QoS > 0 publish needs a packet identifier",
        })
    }
}

impl std::error::Error for EncodeError {}
