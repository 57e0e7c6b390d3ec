//! Low-level encoding and decoding of wire primitives.
//!
//! Readers take a slice that holds at most the current frame and never look
//! past its end. Writers append to a [`BytesMut`].

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::types::{FixedHeader, PacketType, QoS};

/// Largest value the remaining length field can carry (128^4 - 1).
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Maximum number of bytes in a remaining length field.
const MAX_VARINT_BYTES: usize = 4;

/// Read a variable-length integer (remaining length encoding).
///
/// Returns `(value, bytes_consumed)`. A sequence that is still open at the end
/// of `buf` is [`Error::Incomplete`]; four continuation bytes are malformed.
pub fn read_variable_int(buf: &[u8]) -> Result<(usize, usize)> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().take(MAX_VARINT_BYTES).enumerate() {
        value += (byte & 0x7F) as usize * multiplier;

        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }

        multiplier *= 128;
    }

    if buf.len() >= MAX_VARINT_BYTES {
        return Err(Error::malformed("remaining length exceeds 4 bytes"));
    }

    Err(Error::Incomplete { needed: 1 })
}

/// Write a variable-length integer.
///
/// Returns the number of bytes written.
pub fn write_variable_int(buf: &mut BytesMut, mut value: usize) -> Result<usize> {
    if value > MAX_REMAINING_LENGTH {
        return Err(Error::invalid_argument("remaining length too large"));
    }

    let mut written = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;

        if value > 0 {
            byte |= 0x80;
        }

        buf.put_u8(byte);
        written += 1;

        if value == 0 {
            return Ok(written);
        }
    }
}

/// Calculate the number of bytes needed for a variable-length integer.
pub const fn variable_int_len(value: usize) -> usize {
    if value < 128 {
        1
    } else if value < 128 * 128 {
        2
    } else if value < 128 * 128 * 128 {
        3
    } else {
        4
    }
}

/// Read a 2-byte big-endian u16.
pub fn read_u16(buf: &[u8]) -> Result<u16> {
    match buf {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(Error::malformed("truncated 16-bit field")),
    }
}

/// Read a single byte.
pub fn read_u8(buf: &[u8]) -> Result<u8> {
    buf.first()
        .copied()
        .ok_or_else(|| Error::malformed("truncated 8-bit field"))
}

/// Read a length-prefixed UTF-8 string as a slice.
///
/// Returns `(string, bytes_consumed)`.
pub fn read_string(buf: &[u8]) -> Result<(&str, usize)> {
    let len = read_u16(buf)? as usize;

    let data = buf
        .get(2..2 + len)
        .ok_or_else(|| Error::malformed(format!("string of {len} bytes overruns frame")))?;

    let s = std::str::from_utf8(data).map_err(|_| Error::malformed("string is not valid UTF-8"))?;

    Ok((s, 2 + len))
}

/// Write a length-prefixed UTF-8 string.
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| Error::invalid_argument(format!("string too long: {} bytes", s.len())))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Encoded size of a length-prefixed string.
pub fn string_len(s: &str) -> usize {
    2 + s.len()
}

/// Compose the low nibble of the first header byte.
///
/// QoS bits are only emitted for types that declare QoS support.
pub fn header_flags(packet_type: PacketType, dup: bool, qos: QoS, retain: bool) -> u8 {
    let mut flags = 0;
    if dup {
        flags |= 0x08;
    }
    if packet_type.supports_qos() {
        flags |= (qos as u8) << 1;
    }
    if retain {
        flags |= 0x01;
    }
    flags
}

/// Parse a fixed header from buffer.
pub fn read_fixed_header(buf: &[u8]) -> Result<FixedHeader> {
    let first_byte = *buf.first().ok_or(Error::Incomplete { needed: 1 })?;
    let type_code = first_byte >> 4;

    let packet_type = PacketType::from_u8(type_code)
        .ok_or_else(|| Error::malformed(format!("unknown packet type {type_code}")))?;

    let (remaining_length, var_len) = read_variable_int(&buf[1..])?;

    Ok(FixedHeader {
        packet_type,
        flags: first_byte & 0x0F,
        remaining_length,
        header_length: 1 + var_len,
    })
}

/// Write a fixed header to buffer.
///
/// Returns the number of bytes written.
pub fn write_fixed_header(
    buf: &mut BytesMut,
    packet_type: PacketType,
    flags: u8,
    remaining_length: usize,
) -> Result<usize> {
    if remaining_length > MAX_REMAINING_LENGTH {
        return Err(Error::invalid_argument("remaining length too large"));
    }
    buf.put_u8(((packet_type as u8) << 4) | (flags & 0x0F));
    let var_len = write_variable_int(buf, remaining_length)?;
    Ok(1 + var_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_int_boundaries() {
        for (value, expected_len) in [
            (0, 1),
            (127, 1),
            (128, 2),
            (16383, 2),
            (16384, 3),
            (2097151, 3),
            (2097152, 4),
            (MAX_REMAINING_LENGTH, 4),
        ] {
            let mut buf = BytesMut::new();
            let written = write_variable_int(&mut buf, value).unwrap();
            assert_eq!(written, expected_len, "length of {value}");
            assert_eq!(written, variable_int_len(value));

            let (decoded, consumed) = read_variable_int(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, written);
        }
    }

    #[test]
    fn test_variable_int_known_bytes() {
        let mut buf = BytesMut::new();
        write_variable_int(&mut buf, 321).unwrap();
        assert_eq!(&buf[..], &[0xC1, 0x02]);
    }

    #[test]
    fn test_variable_int_too_large() {
        let mut buf = BytesMut::new();
        let err = write_variable_int(&mut buf, MAX_REMAINING_LENGTH + 1).unwrap_err();
        match err {
            Error::InvalidArgument(msg) => assert_eq!(msg, "remaining length too large"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_variable_int_unterminated() {
        let err = read_variable_int(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]).unwrap_err();
        assert!(matches!(err, Error::InvalidMessageFormat(_)));

        let err = read_variable_int(&[0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, Error::Incomplete { .. }));
    }

    #[test]
    fn test_u16() {
        assert_eq!(read_u16(&[0x12, 0x34]).unwrap(), 0x1234);
        assert!(matches!(read_u16(&[0x12]), Err(Error::InvalidMessageFormat(_))));
    }

    #[test]
    fn test_string() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "hello").unwrap();
        assert_eq!(buf.len(), 7);

        let (s, consumed) = read_string(&buf).unwrap();
        assert_eq!(s, "hello");
        assert_eq!(consumed, 7);
    }

    #[test]
    fn test_string_overrun() {
        // Declares 5 bytes, carries 2.
        let err = read_string(&[0x00, 0x05, b'h', b'i']).unwrap_err();
        assert!(matches!(err, Error::InvalidMessageFormat(_)));
    }

    #[test]
    fn test_header_flags() {
        assert_eq!(header_flags(PacketType::Publish, true, QoS::AtLeastOnce, true), 0x0B);
        assert_eq!(header_flags(PacketType::Subscribe, false, QoS::ExactlyOnce, false), 0x04);
        // QoS bits are dropped for types without QoS support.
        assert_eq!(header_flags(PacketType::PubAck, false, QoS::AtLeastOnce, false), 0x00);
    }

    #[test]
    fn test_fixed_header() {
        let mut buf = BytesMut::new();
        let written = write_fixed_header(&mut buf, PacketType::Publish, 0x02, 200).unwrap();
        assert_eq!(written, 3);
        assert_eq!(buf[0], 0x32);

        let header = read_fixed_header(&buf).unwrap();
        assert_eq!(header.packet_type, PacketType::Publish);
        assert_eq!(header.flags, 0x02);
        assert_eq!(header.remaining_length, 200);
        assert_eq!(header.header_length, 3);
    }

    #[test]
    fn test_fixed_header_reserved_type() {
        let err = read_fixed_header(&[0xF0, 0x00]).unwrap_err();
        assert!(matches!(err, Error::InvalidMessageFormat(_)));

        let err = read_fixed_header(&[0x00, 0x00]).unwrap_err();
        assert!(matches!(err, Error::InvalidMessageFormat(_)));
    }

    #[test]
    fn test_fixed_header_incomplete() {
        assert!(matches!(read_fixed_header(&[]), Err(Error::Incomplete { .. })));
        assert!(matches!(read_fixed_header(&[0x30]), Err(Error::Incomplete { .. })));
    }
}
