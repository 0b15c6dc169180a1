//! Dynamically typed column values.
//!
//! `Variant` is a closed enum over the supported SQL types plus `Null` and
//! `Binary`. Comparisons follow "compatible equality": values of the same
//! numeric family are widened before comparing; there is no implicit
//! cross-family equality.

use std::fmt;
use std::io::Cursor;

use serde::ser::{Serialize, Serializer};

use crate::encoding::varint::{encode_var_int64, encode_var_uint64, encode_length_prefixed};
use crate::encoding::{pbe, DecodeError};
use crate::error::{CResult, Error};

/// Declared type of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnDataType {
    Bool = 1,
    Int64 = 2,
    UInt64 = 3,
    Double = 4,
    Text = 5,
    Binary = 6,
}

impl ColumnDataType {
    pub fn name(&self) -> &'static str {
        match self {
            ColumnDataType::Bool => "BOOLEAN",
            ColumnDataType::Int64 => "BIGINT",
            ColumnDataType::UInt64 => "BIGUINT",
            ColumnDataType::Double => "DOUBLE",
            ColumnDataType::Text => "TEXT",
            ColumnDataType::Binary => "BINARY",
        }
    }
}

impl TryFrom<u8> for ColumnDataType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(ColumnDataType::Bool),
            2 => Ok(ColumnDataType::Int64),
            3 => Ok(ColumnDataType::UInt64),
            4 => Ok(ColumnDataType::Double),
            5 => Ok(ColumnDataType::Text),
            6 => Ok(ColumnDataType::Binary),
            other => Err(other),
        }
    }
}

impl fmt::Display for ColumnDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A dynamically typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Null,
    Bool(bool),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Text(String),
    Binary(Vec<u8>),
}

/// Storage type tags. `Null` is a value of its own so that any column can
/// hold it.
const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT64: u8 = 2;
const TAG_UINT64: u8 = 3;
const TAG_DOUBLE: u8 = 4;
const TAG_TEXT: u8 = 5;
const TAG_BINARY: u8 = 6;

impl Variant {
    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Variant::Null => "NULL",
            Variant::Bool(_) => "BOOLEAN",
            Variant::Int64(_) => "BIGINT",
            Variant::UInt64(_) => "BIGUINT",
            Variant::Double(_) => "DOUBLE",
            Variant::Text(_) => "TEXT",
            Variant::Binary(_) => "BINARY",
        }
    }

    /// Encodes the value for column storage: a type tag plus the payload.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Variant::Null => buf.push(TAG_NULL),
            Variant::Bool(v) => {
                buf.push(TAG_BOOL);
                buf.push(*v as u8);
            }
            Variant::Int64(v) => {
                buf.push(TAG_INT64);
                encode_var_int64(*v, buf);
            }
            Variant::UInt64(v) => {
                buf.push(TAG_UINT64);
                encode_var_uint64(*v, buf);
            }
            Variant::Double(v) => {
                buf.push(TAG_DOUBLE);
                pbe::encode_f64(*v, buf);
            }
            Variant::Text(v) => {
                buf.push(TAG_TEXT);
                encode_length_prefixed(v.as_bytes(), buf);
            }
            Variant::Binary(v) => {
                buf.push(TAG_BINARY);
                encode_length_prefixed(v, buf);
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    pub fn decode(data: &[u8]) -> CResult<Self> {
        let mut cursor = Cursor::new(data);
        let value = Self::decode_from(&mut cursor)?;
        Ok(value)
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self, DecodeError> {
        let tag = pbe::decode_u8(cursor)?;
        match tag {
            TAG_NULL => Ok(Variant::Null),
            TAG_BOOL => Ok(Variant::Bool(pbe::decode_u8(cursor)? != 0)),
            TAG_INT64 => {
                let raw = pbe::decode_var_uint64(cursor)?;
                Ok(Variant::Int64(crate::encoding::varint::zigzag_decode64(raw)))
            }
            TAG_UINT64 => Ok(Variant::UInt64(pbe::decode_var_uint64(cursor)?)),
            TAG_DOUBLE => Ok(Variant::Double(pbe::decode_f64(cursor)?)),
            TAG_TEXT => {
                let len = pbe::decode_var_uint64(cursor)? as usize;
                let data = pbe::decode_binary(cursor, len)?;
                String::from_utf8(data).map(Variant::Text).map_err(|_| DecodeError::CorruptData)
            }
            TAG_BINARY => {
                let len = pbe::decode_var_uint64(cursor)? as usize;
                Ok(Variant::Binary(pbe::decode_binary(cursor, len)?))
            }
            _ => Err(DecodeError::CorruptData),
        }
    }

    /// Checks and widens the value for a column of `data_type`. `Null` is
    /// accepted everywhere; integers widen within the numeric family.
    pub fn coerce_to(self, data_type: ColumnDataType) -> CResult<Variant> {
        let mismatch = |value: &Variant| {
            Err(Error::InvalidArgument(format!(
                "value of type {} is not compatible with column type {}",
                value.type_name(),
                data_type
            )))
        };
        match (data_type, self) {
            (_, Variant::Null) => Ok(Variant::Null),
            (ColumnDataType::Bool, v @ Variant::Bool(_)) => Ok(v),
            (ColumnDataType::Int64, v @ Variant::Int64(_)) => Ok(v),
            (ColumnDataType::Int64, Variant::UInt64(u)) if u <= i64::MAX as u64 => {
                Ok(Variant::Int64(u as i64))
            }
            (ColumnDataType::UInt64, v @ Variant::UInt64(_)) => Ok(v),
            (ColumnDataType::UInt64, Variant::Int64(i)) if i >= 0 => Ok(Variant::UInt64(i as u64)),
            (ColumnDataType::Double, v @ Variant::Double(_)) => Ok(v),
            (ColumnDataType::Double, Variant::Int64(i)) => Ok(Variant::Double(i as f64)),
            (ColumnDataType::Double, Variant::UInt64(u)) => Ok(Variant::Double(u as f64)),
            (ColumnDataType::Text, v @ Variant::Text(_)) => Ok(v),
            (ColumnDataType::Binary, v @ Variant::Binary(_)) => Ok(v),
            (_, v) => mismatch(&v),
        }
    }

    /// Compatible equality: numeric values are widened before comparison,
    /// `Null` equals nothing (not even `Null`), and there is no implicit
    /// cross-family comparison.
    pub fn compatible_eq(&self, other: &Variant) -> bool {
        match (self, other) {
            (Variant::Null, _) | (_, Variant::Null) => false,
            (Variant::Bool(a), Variant::Bool(b)) => a == b,
            (Variant::Int64(a), Variant::Int64(b)) => a == b,
            (Variant::UInt64(a), Variant::UInt64(b)) => a == b,
            (Variant::Int64(a), Variant::UInt64(b)) => *a >= 0 && *a as u64 == *b,
            (Variant::UInt64(a), Variant::Int64(b)) => *b >= 0 && *b as u64 == *a,
            (Variant::Double(a), Variant::Double(b)) => a == b,
            (Variant::Int64(a), Variant::Double(b)) | (Variant::Double(b), Variant::Int64(a)) => {
                *a as f64 == *b
            }
            (Variant::UInt64(a), Variant::Double(b)) | (Variant::Double(b), Variant::UInt64(a)) => {
                *a as f64 == *b
            }
            (Variant::Text(a), Variant::Text(b)) => a == b,
            (Variant::Binary(a), Variant::Binary(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Null => write!(f, "NULL"),
            Variant::Bool(v) => write!(f, "{}", v),
            Variant::Int64(v) => write!(f, "{}", v),
            Variant::UInt64(v) => write!(f, "{}", v),
            Variant::Double(v) => write!(f, "{}", v),
            Variant::Text(v) => write!(f, "'{}'", v),
            Variant::Binary(v) => write!(f, "x'{}'", hex::encode(v)),
        }
    }
}

impl Serialize for Variant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Variant::Null => serializer.serialize_unit(),
            Variant::Bool(v) => serializer.serialize_bool(*v),
            Variant::Int64(v) => serializer.serialize_i64(*v),
            Variant::UInt64(v) => serializer.serialize_u64(*v),
            Variant::Double(v) => serializer.serialize_f64(*v),
            Variant::Text(v) => serializer.serialize_str(v),
            Variant::Binary(v) => serializer.serialize_str(&hex::encode(v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_roundtrip() {
        let values = vec![
            Variant::Null,
            Variant::Bool(true),
            Variant::Int64(-42),
            Variant::UInt64(u64::MAX),
            Variant::Double(2.5),
            Variant::Text("hello".into()),
            Variant::Binary(vec![0, 1, 2, 255]),
        ];
        for value in values {
            let bytes = value.to_bytes();
            assert_eq!(Variant::decode(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn compatible_equality_widens_numerics() {
        assert!(Variant::Int64(42).compatible_eq(&Variant::UInt64(42)));
        assert!(Variant::Int64(42).compatible_eq(&Variant::Double(42.0)));
        assert!(Variant::UInt64(7).compatible_eq(&Variant::Double(7.0)));
        assert!(!Variant::Int64(-1).compatible_eq(&Variant::UInt64(u64::MAX)));
    }

    #[test]
    fn no_cross_family_equality() {
        assert!(!Variant::Text("42".into()).compatible_eq(&Variant::Int64(42)));
        assert!(!Variant::Bool(true).compatible_eq(&Variant::Int64(1)));
        assert!(!Variant::Binary(vec![1]).compatible_eq(&Variant::Text("\u{1}".into())));
        // NULL equals nothing, including NULL.
        assert!(!Variant::Null.compatible_eq(&Variant::Null));
    }

    #[test]
    fn coercion_checks_types() {
        assert_eq!(
            Variant::Int64(7).coerce_to(ColumnDataType::UInt64).unwrap(),
            Variant::UInt64(7)
        );
        assert_eq!(
            Variant::UInt64(7).coerce_to(ColumnDataType::Double).unwrap(),
            Variant::Double(7.0)
        );
        assert_eq!(Variant::Null.coerce_to(ColumnDataType::Text).unwrap(), Variant::Null);
        assert!(Variant::Int64(-1).coerce_to(ColumnDataType::UInt64).is_err());
        assert!(Variant::Text("x".into()).coerce_to(ColumnDataType::Int64).is_err());
    }
}
