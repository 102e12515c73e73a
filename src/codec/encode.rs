//! MQTT Packet Encoder
//!
//! Encodes MQTT v3.1.1 packets. Remaining lengths are computed up front so
//! each packet is written into the buffer in a single pass.

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, Publish, QoS, SubAck, Subscribe, Unsubscribe,
    PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// MQTT Packet Encoder
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::ConnAck(p) => self.encode_connack(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(id) => Self::encode_ack(0x40, *id, buf),
            Packet::PubRec(id) => Self::encode_ack(0x50, *id, buf),
            // PUBREL carries the mandatory 0010 flags
            Packet::PubRel(id) => Self::encode_ack(0x62, *id, buf),
            Packet::PubComp(id) => Self::encode_ack(0x70, *id, buf),
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::SubAck(p) => self.encode_suback(p, buf),
            Packet::Unsubscribe(p) => self.encode_unsubscribe(p, buf),
            Packet::UnsubAck(id) => Self::encode_ack(0xB0, *id, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::PingResp => {
                buf.put_u8(0xD0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_u8(0xE0);
                buf.put_u8(0x00);
                Ok(())
            }
        }
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let will = packet.will.as_ref();
        let payload_fields = [
            Some(packet.client_id.as_bytes()),
            will.map(|w| w.topic.as_bytes()),
            will.map(|w| &w.payload[..]),
            packet.username.as_deref().map(str::as_bytes),
            packet.password.as_deref(),
        ];
        // variable header is fixed at 10 bytes for level 4
        let remaining_length = 2 + PROTOCOL_NAME.len()
            + 4
            + payload_fields
                .iter()
                .flatten()
                .map(|field| 2 + field.len())
                .sum::<usize>();

        buf.put_u8(0x10);
        write_variable_int(buf, remaining_length as u32)?;
        write_string(buf, PROTOCOL_NAME)?;
        buf.put_u8(PROTOCOL_LEVEL);
        buf.put_u8(connect_flags(packet));
        buf.put_u16(packet.keep_alive);

        // client id, will topic, will message, username, password, in that order
        for field in payload_fields.into_iter().flatten() {
            write_binary(buf, field)?;
        }
        Ok(())
    }

    fn encode_connack(&self, packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x20);
        buf.put_u8(0x02);
        buf.put_u8(u8::from(packet.session_present));
        buf.put_u8(packet.return_code as u8);
        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining_length = 2 + packet.topic.len();
        let packet_id = match (packet.qos, packet.packet_id) {
            (QoS::AtMostOnce, _) => None,
            (_, Some(id)) => Some(id),
            (_, None) => return Err(EncodeError::MissingPacketId),
        };
        if packet_id.is_some() {
            remaining_length += 2;
        }
        remaining_length += packet.payload.len();

        let mut first_byte: u8 = 0x30;
        if packet.dup {
            first_byte |= 0x08;
        }
        first_byte |= (packet.qos as u8) << 1;
        if packet.retain {
            first_byte |= 0x01;
        }
        buf.put_u8(first_byte);
        write_variable_int(buf, remaining_length as u32)?;

        write_string(buf, &packet.topic)?;
        if let Some(id) = packet_id {
            buf.put_u16(id);
        }
        buf.put_slice(&packet.payload);

        Ok(())
    }

    /// Two-byte acknowledgement packets (PUBACK, PUBREC, PUBREL, PUBCOMP, UNSUBACK)
    fn encode_ack(first_byte: u8, packet_id: u16, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(first_byte);
        buf.put_u8(0x02);
        buf.put_u16(packet_id);
        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let remaining_length = 2 + packet
            .filters
            .iter()
            .map(|(filter, _)| 2 + filter.len() + 1)
            .sum::<usize>();

        // SUBSCRIBE carries the mandatory 0010 flags
        buf.put_u8(0x82);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        for (filter, qos) in &packet.filters {
            write_string(buf, filter)?;
            buf.put_u8(*qos as u8);
        }
        Ok(())
    }

    fn encode_suback(&self, packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let remaining_length = 2 + packet.return_codes.len();
        buf.put_u8(0x90);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        for code in &packet.return_codes {
            buf.put_u8(code.to_u8());
        }
        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let remaining_length = 2 + packet
            .filters
            .iter()
            .map(|filter| 2 + filter.len())
            .sum::<usize>();

        buf.put_u8(0xA2);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        for filter in &packet.filters {
            write_string(buf, filter)?;
        }
        Ok(())
    }
}

fn connect_flags(packet: &Connect) -> u8 {
    let will_bits = packet.will.as_ref().map_or(0, |will| {
        0x04 | (will.qos as u8) << 3 | if will.retain { 0x20 } else { 0 }
    });
    let clean = if packet.clean_session { 0x02 } else { 0 };
    let username = if packet.username.is_some() { 0x80 } else { 0 };
    let password = if packet.password.is_some() { 0x40 } else { 0 };
    clean | will_bits | password | username
}
