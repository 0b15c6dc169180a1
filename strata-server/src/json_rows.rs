//! Row payloads for REST POST/PATCH: a JSON array of row objects is
//! streamed through a serde visitor that builds `(column, value)` lists,
//! enforcing the duplicate-column invariant and the configured row-count
//! and payload-size caps without materializing a DOM.

use std::fmt;

use serde::de::{DeserializeSeed, Deserializer, Error as DeError, MapAccess, SeqAccess, Visitor};

use strata::error::{CResult, Error};
use strata::row::Variant;
use strata::util::is_valid_object_name;

const DUPLICATE_COLUMN_MARKER: &str = "duplicate column ";

/// Parses a JSON row array into per-row `(column_name, value)` lists.
/// Column names are validated and uppercased.
pub fn parse_row_payload(
    payload: &[u8],
    max_rows: usize,
    max_payload: usize,
) -> CResult<Vec<Vec<(String, Variant)>>> {
    if max_rows == 0 {
        return Err(Error::InvalidArgument("row count limit must be nonzero".into()));
    }
    if payload.len() > max_payload {
        return Err(Error::InvalidArgument(format!(
            "row payload of {} bytes exceeds the {} byte limit",
            payload.len(),
            max_payload
        )));
    }
    let mut deserializer = serde_json::Deserializer::from_slice(payload);
    let rows = RowArraySeed { max_rows }
        .deserialize(&mut deserializer)
        .map_err(map_json_error)?;
    deserializer.end().map_err(map_json_error)?;
    Ok(rows)
}

fn map_json_error(err: serde_json::Error) -> Error {
    let message = err.to_string();
    if message.contains(DUPLICATE_COLUMN_MARKER) {
        Error::Conflict(message)
    } else {
        Error::InvalidArgument(format!("invalid row payload: {}", message))
    }
}

struct RowArraySeed {
    max_rows: usize,
}

impl<'de> DeserializeSeed<'de> for RowArraySeed {
    type Value = Vec<Vec<(String, Variant)>>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for RowArraySeed {
    type Value = Vec<Vec<(String, Variant)>>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an array of row objects")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut rows = Vec::new();
        while let Some(row) = seq.next_element_seed(RowSeed)? {
            if rows.len() >= self.max_rows {
                return Err(A::Error::custom(format!(
                    "row payload exceeds the limit of {} rows",
                    self.max_rows
                )));
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

struct RowSeed;

impl<'de> DeserializeSeed<'de> for RowSeed {
    type Value = Vec<(String, Variant)>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for RowSeed {
    type Value = Vec<(String, Variant)>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a row object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut row: Vec<(String, Variant)> = Vec::new();
        while let Some(name) = map.next_key::<String>()? {
            let name = name.to_ascii_uppercase();
            if !is_valid_object_name(&name) {
                return Err(A::Error::custom(format!("invalid column name: {}", name)));
            }
            if row.iter().any(|(existing, _)| *existing == name) {
                return Err(A::Error::custom(format!("{}{}", DUPLICATE_COLUMN_MARKER, name)));
            }
            let value = map.next_value_seed(ValueSeed)?;
            row.push((name, value));
        }
        Ok(row)
    }
}

struct ValueSeed;

impl<'de> DeserializeSeed<'de> for ValueSeed {
    type Value = Variant;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for ValueSeed {
    type Value = Variant;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a scalar column value")
    }

    fn visit_bool<E: DeError>(self, v: bool) -> Result<Variant, E> {
        Ok(Variant::Bool(v))
    }

    fn visit_i64<E: DeError>(self, v: i64) -> Result<Variant, E> {
        Ok(Variant::Int64(v))
    }

    fn visit_u64<E: DeError>(self, v: u64) -> Result<Variant, E> {
        Ok(Variant::UInt64(v))
    }

    fn visit_f64<E: DeError>(self, v: f64) -> Result<Variant, E> {
        Ok(Variant::Double(v))
    }

    fn visit_str<E: DeError>(self, v: &str) -> Result<Variant, E> {
        Ok(Variant::Text(v.to_string()))
    }

    fn visit_string<E: DeError>(self, v: String) -> Result<Variant, E> {
        Ok(Variant::Text(v))
    }

    fn visit_unit<E: DeError>(self) -> Result<Variant, E> {
        Ok(Variant::Null)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, _seq: A) -> Result<Variant, A::Error> {
        Err(A::Error::custom("nested arrays are not supported in row values"))
    }

    fn visit_map<A: MapAccess<'de>>(self, _map: A) -> Result<Variant, A::Error> {
        Err(A::Error::custom("nested objects are not supported in row values"))
    }
}
