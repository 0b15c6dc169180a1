//! Plain binary encoding: fixed-width little-endian integers and
//! length-prefixed strings. Together with the varint codecs this is the
//! foundation every persistent record composes from.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};

use super::{DecodeError, DecodeResult};

pub fn encode_u8(value: u8, buf: &mut Vec<u8>) {
    buf.push(value);
}

pub fn encode_u16(value: u16, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn encode_u32(value: u32, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn encode_u64(value: u64, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn encode_i64(value: i64, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn encode_f64(value: f64, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn encode_binary(data: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(data);
}

/// Tiny string: single-byte length prefix, up to 255 bytes.
pub fn encode_tiny_string(value: &str, buf: &mut Vec<u8>) -> Result<(), DecodeError> {
    if value.len() > u8::MAX as usize {
        return Err(DecodeError::CorruptData);
    }
    buf.push(value.len() as u8);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Short string: two-byte length prefix, up to 65535 bytes.
pub fn encode_short_string(value: &str, buf: &mut Vec<u8>) -> Result<(), DecodeError> {
    if value.len() > u16::MAX as usize {
        return Err(DecodeError::CorruptData);
    }
    encode_u16(value.len() as u16, buf);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Long string: four-byte length prefix.
pub fn encode_long_string(value: &str, buf: &mut Vec<u8>) {
    encode_u32(value.len() as u32, buf);
    buf.extend_from_slice(value.as_bytes());
}

fn eof_to_need_more(err: std::io::Error) -> DecodeError {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof => DecodeError::NeedMoreData,
        _ => DecodeError::CorruptData,
    }
}

pub fn decode_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8, DecodeError> {
    cursor.read_u8().map_err(eof_to_need_more)
}

pub fn decode_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16, DecodeError> {
    cursor.read_u16::<LittleEndian>().map_err(eof_to_need_more)
}

pub fn decode_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, DecodeError> {
    cursor.read_u32::<LittleEndian>().map_err(eof_to_need_more)
}

pub fn decode_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64, DecodeError> {
    cursor.read_u64::<LittleEndian>().map_err(eof_to_need_more)
}

pub fn decode_i64(cursor: &mut Cursor<&[u8]>) -> Result<i64, DecodeError> {
    cursor.read_i64::<LittleEndian>().map_err(eof_to_need_more)
}

pub fn decode_f64(cursor: &mut Cursor<&[u8]>) -> Result<f64, DecodeError> {
    cursor.read_f64::<LittleEndian>().map_err(eof_to_need_more)
}

pub fn decode_binary(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>, DecodeError> {
    let mut data = vec![0u8; len];
    cursor.read_exact(&mut data).map_err(eof_to_need_more)?;
    Ok(data)
}

fn decode_string_body(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<String, DecodeError> {
    let data = decode_binary(cursor, len)?;
    String::from_utf8(data).map_err(|_| DecodeError::CorruptData)
}

pub fn decode_tiny_string(cursor: &mut Cursor<&[u8]>) -> Result<String, DecodeError> {
    let len = decode_u8(cursor)? as usize;
    decode_string_body(cursor, len)
}

pub fn decode_short_string(cursor: &mut Cursor<&[u8]>) -> Result<String, DecodeError> {
    let len = decode_u16(cursor)? as usize;
    decode_string_body(cursor, len)
}

pub fn decode_long_string(cursor: &mut Cursor<&[u8]>) -> Result<String, DecodeError> {
    let len = decode_u32(cursor)? as usize;
    decode_string_body(cursor, len)
}

/// Decodes a varint from the cursor position, advancing it.
pub fn decode_var_uint64(cursor: &mut Cursor<&[u8]>) -> Result<u64, DecodeError> {
    let pos = cursor.position() as usize;
    let (value, consumed): (u64, usize) = cursor_varint(cursor, pos)?;
    cursor.set_position((pos + consumed) as u64);
    Ok(value)
}

fn cursor_varint(cursor: &Cursor<&[u8]>, pos: usize) -> DecodeResult<u64> {
    let data = *cursor.get_ref();
    if pos > data.len() {
        return Err(DecodeError::NeedMoreData);
    }
    super::varint::decode_var_uint64(&data[pos..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_roundtrip() {
        let mut buf = Vec::new();
        encode_u8(0xab, &mut buf);
        encode_u16(0xbeef, &mut buf);
        encode_u32(0xdeadbeef, &mut buf);
        encode_u64(0x0123456789abcdef, &mut buf);
        encode_i64(-42, &mut buf);
        encode_f64(1.25, &mut buf);

        // The stream is byte-stable regardless of the host endianness.
        assert_eq!(&buf[1..3], &[0xef, 0xbe]);

        let mut cursor = Cursor::new(buf.as_slice());
        assert_eq!(decode_u8(&mut cursor).unwrap(), 0xab);
        assert_eq!(decode_u16(&mut cursor).unwrap(), 0xbeef);
        assert_eq!(decode_u32(&mut cursor).unwrap(), 0xdeadbeef);
        assert_eq!(decode_u64(&mut cursor).unwrap(), 0x0123456789abcdef);
        assert_eq!(decode_i64(&mut cursor).unwrap(), -42);
        assert_eq!(decode_f64(&mut cursor).unwrap(), 1.25);
        assert_eq!(decode_u8(&mut cursor), Err(DecodeError::NeedMoreData));
    }

    #[test]
    fn string_prefixes() {
        let mut buf = Vec::new();
        encode_tiny_string("ab", &mut buf).unwrap();
        encode_short_string("cde", &mut buf).unwrap();
        encode_long_string("fg", &mut buf);

        let mut cursor = Cursor::new(buf.as_slice());
        assert_eq!(decode_tiny_string(&mut cursor).unwrap(), "ab");
        assert_eq!(decode_short_string(&mut cursor).unwrap(), "cde");
        assert_eq!(decode_long_string(&mut cursor).unwrap(), "fg");

        let long = "x".repeat(300);
        let mut buf = Vec::new();
        assert_eq!(encode_tiny_string(&long, &mut buf), Err(DecodeError::CorruptData));
    }
}
