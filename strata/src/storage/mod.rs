//! Column block storage: fixed-size append blocks, the per-column block
//! registry, and the column/table layers on top of them.

use std::fmt;
use std::io::Cursor;

use crate::encoding::varint::{
    decode_var_uint32, decode_var_uint64, encode_var_uint32, encode_var_uint64, var_uint32_size,
    var_uint64_size,
};
use crate::encoding::DecodeError;

pub mod block;
pub mod column;
pub mod registry;
pub mod table;

pub use block::{ColumnDataBlock, ColumnDataBlockHeader};
pub use column::Column;
pub use registry::BlockRegistry;
pub use table::{ColumnDefinition, Table};

/// Offset of the data area inside a block file. The header lives below it.
pub const DATA_FILE_HEADER_SIZE: u32 = 4096;

/// Default size of a block's data area when the instance does not override it.
pub const DEFAULT_DATA_AREA_SIZE: u32 = 256 * 1024;

/// Lifecycle states of a column data block. The zero byte is reserved as the
/// "no such block" marker in the block registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnDataBlockState {
    Creating = 1,
    Current = 2,
    Closing = 3,
    Closed = 4,
    /// Eligible to become the current write target but not currently held.
    Available = 5,
}

impl TryFrom<u8> for ColumnDataBlockState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(ColumnDataBlockState::Creating),
            2 => Ok(ColumnDataBlockState::Current),
            3 => Ok(ColumnDataBlockState::Closing),
            4 => Ok(ColumnDataBlockState::Closed),
            5 => Ok(ColumnDataBlockState::Available),
            other => Err(other),
        }
    }
}

/// Stable pointer to a stored value: block id plus the offset inside that
/// block's data area. `(0, 0)` is the null address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnDataAddress {
    pub block_id: u64,
    pub offset: u32,
}

impl ColumnDataAddress {
    pub const NULL: ColumnDataAddress = ColumnDataAddress { block_id: 0, offset: 0 };

    pub fn new(block_id: u64, offset: u32) -> Self {
        ColumnDataAddress { block_id, offset }
    }

    pub fn is_null(&self) -> bool {
        self.block_id == 0 && self.offset == 0
    }

    pub fn serialized_size(&self) -> usize {
        var_uint64_size(self.block_id) + var_uint32_size(self.offset)
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        encode_var_uint64(self.block_id, buf);
        encode_var_uint32(self.offset, buf);
    }

    pub fn deserialize(cursor: &mut Cursor<&[u8]>) -> Result<Self, DecodeError> {
        let pos = cursor.position() as usize;
        let data = &cursor.get_ref()[pos..];
        let (block_id, n1) = decode_var_uint64(data)?;
        let (offset, n2) = decode_var_uint32(&data[n1..])?;
        cursor.set_position((pos + n1 + n2) as u64);
        Ok(ColumnDataAddress { block_id, offset })
    }
}

impl fmt::Display for ColumnDataAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.block_id, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_roundtrip() {
        for addr in [
            ColumnDataAddress::NULL,
            ColumnDataAddress::new(1, 0),
            ColumnDataAddress::new(u64::MAX, u32::MAX),
        ] {
            let mut buf = Vec::new();
            addr.serialize(&mut buf);
            assert_eq!(buf.len(), addr.serialized_size());
            let mut cursor = Cursor::new(buf.as_slice());
            assert_eq!(ColumnDataAddress::deserialize(&mut cursor).unwrap(), addr);
        }
        assert!(ColumnDataAddress::NULL.is_null());
        assert!(!ColumnDataAddress::new(0, 1).is_null());
    }

    #[test]
    fn block_state_byte_mapping() {
        assert_eq!(ColumnDataBlockState::try_from(2), Ok(ColumnDataBlockState::Current));
        assert_eq!(ColumnDataBlockState::try_from(0), Err(0));
        assert_eq!(ColumnDataBlockState::Closed as u8, 4);
    }
}
