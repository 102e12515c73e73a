//! MQTT Packet Decoder
//!
//! Decodes MQTT v3.1.1 packets from an accumulating read buffer.

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, Publish, QoS, SubAck,
    SubAckReturnCode, Subscribe, Unsubscribe, Will, PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// MQTT Packet Decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    /// Maximum remaining length accepted
    max_packet_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode a packet from the buffer
    /// Returns (packet, bytes_consumed), or `None` while the packet is incomplete
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => self.decode_connect(flags, body)?,
            2 => self.decode_connack(flags, body)?,
            3 => self.decode_publish(flags, body)?,
            4 => Packet::PubAck(Self::decode_ack(flags, 0x00, body)?),
            5 => Packet::PubRec(Self::decode_ack(flags, 0x00, body)?),
            6 => Packet::PubRel(Self::decode_ack(flags, 0x02, body)?),
            7 => Packet::PubComp(Self::decode_ack(flags, 0x00, body)?),
            8 => self.decode_subscribe(flags, body)?,
            9 => self.decode_suback(flags, body)?,
            10 => self.decode_unsubscribe(flags, body)?,
            11 => Packet::UnsubAck(Self::decode_ack(flags, 0x00, body)?),
            12 => {
                Self::expect_empty(flags, body)?;
                Packet::PingReq
            }
            13 => {
                Self::expect_empty(flags, body)?;
                Packet::PingResp
            }
            14 => {
                Self::expect_empty(flags, body)?;
                Packet::Disconnect
            }
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }

    fn expect_empty(flags: u8, body: &[u8]) -> Result<(), DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if !body.is_empty() {
            return Err(DecodeError::MalformedPacket("unexpected packet body"));
        }
        Ok(())
    }

    fn decode_ack(flags: u8, expected_flags: u8, body: &[u8]) -> Result<u16, DecodeError> {
        if flags != expected_flags {
            return Err(DecodeError::InvalidFlags);
        }
        if body.len() != 2 {
            return Err(DecodeError::MalformedPacket("acknowledgement must be 2 bytes"));
        }
        read_u16(body)
    }

    fn decode_connect(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let mut fields = Fields::new(body);
        if fields.string()? != PROTOCOL_NAME {
            return Err(DecodeError::InvalidProtocolName);
        }
        let level = fields.byte()?;
        if level != PROTOCOL_LEVEL {
            return Err(DecodeError::InvalidProtocolVersion(level));
        }
        let bits = fields.byte()?;
        let keep_alive = fields.u16()?;

        let has = |mask: u8| bits & mask != 0;
        let will_qos_bits = (bits >> 3) & 0x03;
        // reserved bit, password without username, will qos/retain without will
        let stray_will_bits = !has(0x04) && (will_qos_bits != 0 || has(0x20));
        if has(0x01) || (has(0x40) && !has(0x80)) || stray_will_bits {
            return Err(DecodeError::InvalidFlags);
        }
        let will_qos = QoS::from_u8(will_qos_bits).ok_or(DecodeError::InvalidQoS(will_qos_bits))?;

        let client_id = fields.string()?.to_string();
        let will = if has(0x04) {
            Some(Will {
                topic: fields.string()?.to_string(),
                payload: Bytes::copy_from_slice(fields.binary()?),
                qos: will_qos,
                retain: has(0x20),
            })
        } else {
            None
        };
        let username = if has(0x80) {
            Some(fields.string()?.to_string())
        } else {
            None
        };
        let password = if has(0x40) {
            Some(Bytes::copy_from_slice(fields.binary()?))
        } else {
            None
        };

        Ok(Packet::Connect(Box::new(Connect {
            client_id,
            clean_session: has(0x02),
            keep_alive,
            username,
            password,
            will,
        })))
    }

    fn decode_connack(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if body.len() != 2 {
            return Err(DecodeError::MalformedPacket("CONNACK must be 2 bytes"));
        }

        let acknowledge_flags = body[0];
        if (acknowledge_flags & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let return_code =
            ConnectReturnCode::from_u8(body[1]).ok_or(DecodeError::InvalidReturnCode(body[1]))?;

        Ok(Packet::ConnAck(ConnAck {
            session_present: (acknowledge_flags & 0x01) != 0,
            return_code,
        }))
    }

    fn decode_publish(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let mut fields = Fields::new(body);
        let topic = fields.string()?;
        if topic.contains(['+', '#']) {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => match fields.u16()? {
                0 => return Err(DecodeError::MalformedPacket("packet id cannot be 0")),
                id => Some(id),
            },
        };

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(fields.rest()),
        }))
    }

    fn decode_subscribe(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }
        let mut fields = Fields::new(body);
        let packet_id = fields.u16()?;

        let mut filters = Vec::new();
        while !fields.is_empty() {
            let filter = fields.string()?.to_string();
            let qos_byte = fields.byte()?;
            let qos = QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?;
            filters.push((filter, qos));
        }
        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket("SUBSCRIBE without filters"));
        }

        Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
    }

    fn decode_suback(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if body.len() < 3 {
            return Err(DecodeError::InsufficientData);
        }

        let packet_id = read_u16(body)?;
        let return_codes = body[2..]
            .iter()
            .map(|&code| SubAckReturnCode::from_u8(code).ok_or(DecodeError::InvalidReturnCode(code)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Packet::SubAck(SubAck {
            packet_id,
            return_codes,
        }))
    }

    fn decode_unsubscribe(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }
        let mut fields = Fields::new(body);
        let packet_id = fields.u16()?;

        let mut filters = Vec::new();
        while !fields.is_empty() {
            filters.push(fields.string()?.to_string());
        }
        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket("UNSUBSCRIBE without filters"));
        }

        Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
    }
}

/// Forward-only view over a packet body
struct Fields<'a> {
    buf: &'a [u8],
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn byte(&mut self) -> Result<u8, DecodeError> {
        let (&first, rest) = self.buf.split_first().ok_or(DecodeError::InsufficientData)?;
        self.buf = rest;
        Ok(first)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let value = read_u16(self.buf)?;
        self.buf = &self.buf[2..];
        Ok(value)
    }

    fn string(&mut self) -> Result<&'a str, DecodeError> {
        let (s, consumed) = read_string(self.buf)?;
        self.buf = &self.buf[consumed..];
        Ok(s)
    }

    fn binary(&mut self) -> Result<&'a [u8], DecodeError> {
        let (data, consumed) = read_binary(self.buf)?;
        self.buf = &self.buf[consumed..];
        Ok(data)
    }

    fn rest(self) -> &'a [u8] {
        self.buf
    }
}
