//! MQTT Packet Codec
//!
//! Encoding and decoding of MQTT v3.1.1 control packets. Decoding works on
//! an accumulating buffer and reports how many bytes a complete packet
//! consumed, so a partially received packet simply yields `Ok(None)`.

mod decode;
mod encode;


pub use decode::Decoder;
pub use encode::Encoder;

use crate::protocol::{DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};

/// Largest value a variable byte integer can carry (~256 MB)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Inbound packet size limit unless configured otherwise
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Decode a variable byte integer, returning `(value, bytes_consumed)`
pub(crate) fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value: u32 = 0;

    for (i, byte) in buf.iter().take(4).enumerate() {
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }

    if buf.len() >= 4 {
        // a fifth length byte is never valid
        Err(DecodeError::InvalidRemainingLength)
    } else {
        Err(DecodeError::InsufficientData)
    }
}

/// Encode a variable byte integer, returning the number of bytes written
pub(crate) fn write_variable_int(buf: &mut BytesMut, value: u32) -> Result<usize, EncodeError> {
    if value as usize > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }

    let mut rest = value;
    let mut written = 0;
    loop {
        let digit = (rest & 0x7F) as u8;
        rest >>= 7;
        written += 1;
        if rest == 0 {
            buf.put_u8(digit);
            return Ok(written);
        }
        buf.put_u8(digit | 0x80);
    }
}

pub(crate) fn read_u16(buf: &[u8]) -> Result<u16, DecodeError> {
    match buf {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(DecodeError::InsufficientData),
    }
}

/// Length-prefixed byte field, returning `(data, bytes_consumed)`
pub(crate) fn read_binary(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    let len = usize::from(read_u16(buf)?);
    let data = buf.get(2..2 + len).ok_or(DecodeError::InsufficientData)?;
    Ok((data, 2 + len))
}

/// Length-prefixed UTF-8 string; U+0000 is rejected
pub(crate) fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (data, consumed) = read_binary(buf)?;
    let s = std::str::from_utf8(data).map_err(|_| DecodeError::InvalidUtf8)?;
    if s.contains('\0') {
        return Err(DecodeError::MalformedPacket("string contains null character"));
    }
    Ok((s, consumed))
}

pub(crate) fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::StringTooLong)?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

pub(crate) fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_binary(buf, s.as_bytes())
}
