//! Base-128 variant encoding of integers.
//!
//! Unsigned values are emitted little-endian, 7 bits per byte, with the high
//! bit set on every byte except the last. Signed variants apply the ZigZag
//! transform first so that small negative numbers stay short. The produced
//! byte stream is identical on little- and big-endian hosts.

use super::{DecodeError, DecodeResult};

/// Maximum encoded size of a `u16`.
pub const MAX_VAR_UINT16_SIZE: usize = 3;
/// Maximum encoded size of a `u32`.
pub const MAX_VAR_UINT32_SIZE: usize = 5;
/// Maximum encoded size of a `u64`.
pub const MAX_VAR_UINT64_SIZE: usize = 10;

/// Returns the encoded size of a value without encoding it.
pub fn var_uint64_size(value: u64) -> usize {
    let mut value = value;
    let mut length = 1;
    while value >= 0x80 {
        length += 1;
        value >>= 7;
    }
    length
}

pub fn var_uint32_size(value: u32) -> usize {
    var_uint64_size(value as u64)
}

pub fn var_uint16_size(value: u16) -> usize {
    var_uint64_size(value as u64)
}

pub fn var_int64_size(value: i64) -> usize {
    var_uint64_size(zigzag_encode64(value))
}

pub fn encode_var_uint64(value: u64, buf: &mut Vec<u8>) {
    let mut value = value;
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

pub fn encode_var_uint32(value: u32, buf: &mut Vec<u8>) {
    encode_var_uint64(value as u64, buf);
}

pub fn encode_var_uint16(value: u16, buf: &mut Vec<u8>) {
    encode_var_uint64(value as u64, buf);
}

pub fn encode_var_int64(value: i64, buf: &mut Vec<u8>) {
    encode_var_uint64(zigzag_encode64(value), buf);
}

pub fn encode_var_int32(value: i32, buf: &mut Vec<u8>) {
    encode_var_uint32(zigzag_encode32(value), buf);
}

fn decode_var_uint(src: &[u8], max_size: usize) -> DecodeResult<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in src.iter().enumerate().take(max_size) {
        // Bits beyond the target width are discarded on the final shift,
        // matching the reference decoder.
        result |= ((b & 0x7f) as u64).wrapping_shl(shift);
        if b & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
    }
    if src.len() >= max_size {
        // Consumed the width-specific maximum without a terminator.
        Err(DecodeError::CorruptData)
    } else {
        Err(DecodeError::NeedMoreData)
    }
}

pub fn decode_var_uint64(src: &[u8]) -> DecodeResult<u64> {
    decode_var_uint(src, MAX_VAR_UINT64_SIZE)
}

pub fn decode_var_uint32(src: &[u8]) -> DecodeResult<u32> {
    let (v, n) = decode_var_uint(src, MAX_VAR_UINT32_SIZE)?;
    Ok((v as u32, n))
}

pub fn decode_var_uint16(src: &[u8]) -> DecodeResult<u16> {
    let (v, n) = decode_var_uint(src, MAX_VAR_UINT16_SIZE)?;
    Ok((v as u16, n))
}

pub fn decode_var_int64(src: &[u8]) -> DecodeResult<i64> {
    let (v, n) = decode_var_uint64(src)?;
    Ok((zigzag_decode64(v), n))
}

pub fn decode_var_int32(src: &[u8]) -> DecodeResult<i32> {
    let (v, n) = decode_var_uint32(src)?;
    Ok((zigzag_decode32(v), n))
}

pub fn zigzag_encode64(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode64(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

pub fn zigzag_encode32(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

pub fn zigzag_decode32(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

/// Appends a varint length prefix followed by the raw bytes.
/// This is the framing used for strings and blobs embedded in records.
pub fn encode_length_prefixed(data: &[u8], buf: &mut Vec<u8>) {
    encode_var_uint64(data.len() as u64, buf);
    buf.extend_from_slice(data);
}

/// Inverse of [`encode_length_prefixed`].
pub fn decode_length_prefixed(src: &[u8]) -> DecodeResult<Vec<u8>> {
    let (len, consumed) = decode_var_uint64(src)?;
    let len = len as usize;
    if src.len() - consumed < len {
        return Err(DecodeError::NeedMoreData);
    }
    Ok((src[consumed..consumed + len].to_vec(), consumed + len))
}
