//! Row versioning via Master Column Records.
//!
//! Every row version is described by one MCR stored in the table's master
//! column: the operation that produced it, per-column value addresses, and
//! a link to the previous version. The latest non-DELETE record of a TRID
//! is the visible version; a DELETE record tombstones the row.

use std::fmt;
use std::io::Cursor;

use crate::encoding::varint::{
    encode_var_uint32, encode_var_uint64, var_uint32_size, var_uint64_size,
};
use crate::encoding::{pbe, DecodeError};
use crate::error::{CResult, Error};
use crate::storage::ColumnDataAddress;

/// Maximum serialized MCR body size (32 KiB).
pub const MAX_MCR_SERIALIZED_SIZE: usize = 0x8000;

/// DML operation recorded in an MCR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DmlOperationType {
    Insert = 0,
    Update = 1,
    Delete = 2,
}

impl TryFrom<u8> for DmlOperationType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(DmlOperationType::Insert),
            1 => Ok(DmlOperationType::Update),
            2 => Ok(DmlOperationType::Delete),
            other => Err(other),
        }
    }
}

impl fmt::Display for DmlOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmlOperationType::Insert => write!(f, "INSERT"),
            DmlOperationType::Update => write!(f, "UPDATE"),
            DmlOperationType::Delete => write!(f, "DELETE"),
        }
    }
}

/// Address and timestamps of one column value referenced by an MCR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDataRecord {
    pub address: ColumnDataAddress,
    pub create_timestamp: u64,
    pub update_timestamp: u64,
}

impl ColumnDataRecord {
    pub fn new(address: ColumnDataAddress, create_timestamp: u64, update_timestamp: u64) -> Self {
        ColumnDataRecord { address, create_timestamp, update_timestamp }
    }

    pub fn serialized_size(&self) -> usize {
        self.address.serialized_size()
            + var_uint64_size(self.create_timestamp)
            + var_uint64_size(self.update_timestamp)
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        self.address.serialize(buf);
        encode_var_uint64(self.create_timestamp, buf);
        encode_var_uint64(self.update_timestamp, buf);
    }

    pub fn deserialize(cursor: &mut Cursor<&[u8]>) -> Result<Self, DecodeError> {
        let address = ColumnDataAddress::deserialize(cursor)?;
        let create_timestamp = pbe::decode_var_uint64(cursor)?;
        let update_timestamp = pbe::decode_var_uint64(cursor)?;
        Ok(ColumnDataRecord { address, create_timestamp, update_timestamp })
    }
}

/// One row-version descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterColumnRecord {
    pub table_row_id: u64,
    pub transaction_id: u64,
    pub create_timestamp: u64,
    pub update_timestamp: u64,
    pub version: u64,
    pub operation_id: u64,
    pub operation_type: DmlOperationType,
    pub user_id: u32,
    pub column_set_id: u64,
    pub private_data_expiration_timestamp: u64,
    pub column_records: Vec<ColumnDataRecord>,
    /// Null address means this is the first version.
    pub previous_version_address: ColumnDataAddress,
}

impl MasterColumnRecord {
    pub fn serialized_size(&self) -> usize {
        var_uint64_size(self.table_row_id)
            + var_uint64_size(self.transaction_id)
            + var_uint64_size(self.create_timestamp)
            + var_uint64_size(self.update_timestamp)
            + var_uint64_size(self.version)
            + var_uint64_size(self.operation_id)
            + 1 // operation type is always one byte
            + var_uint32_size(self.user_id)
            + var_uint64_size(self.column_set_id)
            + var_uint64_size(self.private_data_expiration_timestamp)
            + var_uint32_size(self.column_records.len() as u32)
            + self.column_records.iter().map(|r| r.serialized_size()).sum::<usize>()
            + self.previous_version_address.serialized_size()
    }

    /// Serializes the record body; the enclosing storage adds the varuint16
    /// size tag as the value length prefix. Bodies above 32 KiB are refused.
    pub fn serialize(&self) -> CResult<Vec<u8>> {
        let size = self.serialized_size();
        if size > MAX_MCR_SERIALIZED_SIZE {
            return Err(Error::InvalidArgument(format!(
                "master column record of {} bytes exceeds the {} byte limit",
                size, MAX_MCR_SERIALIZED_SIZE
            )));
        }
        let mut buf = Vec::with_capacity(size);
        encode_var_uint64(self.table_row_id, &mut buf);
        encode_var_uint64(self.transaction_id, &mut buf);
        encode_var_uint64(self.create_timestamp, &mut buf);
        encode_var_uint64(self.update_timestamp, &mut buf);
        encode_var_uint64(self.version, &mut buf);
        encode_var_uint64(self.operation_id, &mut buf);
        buf.push(self.operation_type as u8);
        encode_var_uint32(self.user_id, &mut buf);
        encode_var_uint64(self.column_set_id, &mut buf);
        encode_var_uint64(self.private_data_expiration_timestamp, &mut buf);
        encode_var_uint32(self.column_records.len() as u32, &mut buf);
        for record in &self.column_records {
            record.serialize(&mut buf);
        }
        self.previous_version_address.serialize(&mut buf);
        debug_assert_eq!(buf.len(), size);
        Ok(buf)
    }

    pub fn deserialize(data: &[u8]) -> CResult<Self> {
        if data.len() > MAX_MCR_SERIALIZED_SIZE {
            return Err(Error::Corrupt(format!(
                "master column record of {} bytes exceeds the {} byte limit",
                data.len(),
                MAX_MCR_SERIALIZED_SIZE
            )));
        }
        let mut cursor = Cursor::new(data);
        let table_row_id = pbe::decode_var_uint64(&mut cursor)?;
        let transaction_id = pbe::decode_var_uint64(&mut cursor)?;
        let create_timestamp = pbe::decode_var_uint64(&mut cursor)?;
        let update_timestamp = pbe::decode_var_uint64(&mut cursor)?;
        let version = pbe::decode_var_uint64(&mut cursor)?;
        let operation_id = pbe::decode_var_uint64(&mut cursor)?;
        let op_byte = pbe::decode_u8(&mut cursor)?;
        let operation_type = DmlOperationType::try_from(op_byte)
            .map_err(|b| Error::Corrupt(format!("invalid DML operation type {}", b)))?;
        let user_id = pbe::decode_var_uint64(&mut cursor)? as u32;
        let column_set_id = pbe::decode_var_uint64(&mut cursor)?;
        let private_data_expiration_timestamp = pbe::decode_var_uint64(&mut cursor)?;
        let column_count = pbe::decode_var_uint64(&mut cursor)? as usize;
        if column_count > MAX_MCR_SERIALIZED_SIZE {
            return Err(Error::Corrupt(format!("implausible column count {}", column_count)));
        }
        let mut column_records = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            column_records.push(ColumnDataRecord::deserialize(&mut cursor)?);
        }
        let previous_version_address = ColumnDataAddress::deserialize(&mut cursor)?;
        Ok(MasterColumnRecord {
            table_row_id,
            transaction_id,
            create_timestamp,
            update_timestamp,
            version,
            operation_id,
            operation_type,
            user_id,
            column_set_id,
            private_data_expiration_timestamp,
            column_records,
            previous_version_address,
        })
    }
}

impl fmt::Display for MasterColumnRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TRID: {}, txnid: {}, opid: {}, op: {}, version: {}, user_id: {}, columns: [",
            self.table_row_id,
            self.transaction_id,
            self.operation_id,
            self.operation_type,
            self.version,
            self.user_id
        )?;
        for (i, record) in self.column_records.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", record.address)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mcr() -> MasterColumnRecord {
        MasterColumnRecord {
            table_row_id: 17,
            transaction_id: 5,
            create_timestamp: 1_700_000_000_000_000,
            update_timestamp: 1_700_000_000_000_123,
            version: 2,
            operation_id: 9,
            operation_type: DmlOperationType::Update,
            user_id: 1,
            column_set_id: 3,
            private_data_expiration_timestamp: 0,
            column_records: vec![
                ColumnDataRecord::new(ColumnDataAddress::new(1, 0), 10, 10),
                ColumnDataRecord::new(ColumnDataAddress::new(2, 512), 10, 20),
            ],
            previous_version_address: ColumnDataAddress::new(1, 128),
        }
    }

    #[test]
    fn mcr_roundtrip() {
        let mcr = sample_mcr();
        let bytes = mcr.serialize().unwrap();
        assert_eq!(bytes.len(), mcr.serialized_size());
        assert_eq!(MasterColumnRecord::deserialize(&bytes).unwrap(), mcr);
    }

    #[test]
    fn oversized_mcr_is_rejected() {
        let mut mcr = sample_mcr();
        // Enough column records to cross the 32 KiB cap.
        mcr.column_records = (0..8192)
            .map(|i| {
                ColumnDataRecord::new(
                    ColumnDataAddress::new(u64::MAX - i, u32::MAX),
                    u64::MAX,
                    u64::MAX,
                )
            })
            .collect();
        assert!(matches!(mcr.serialize(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn truncated_mcr_is_corrupt() {
        let bytes = sample_mcr().serialize().unwrap();
        assert!(MasterColumnRecord::deserialize(&bytes[..bytes.len() - 2]).is_err());
        assert!(matches!(
            MasterColumnRecord::deserialize(&[0xff; 4]),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn operation_type_bytes() {
        assert_eq!(DmlOperationType::try_from(0), Ok(DmlOperationType::Insert));
        assert_eq!(DmlOperationType::try_from(2), Ok(DmlOperationType::Delete));
        assert_eq!(DmlOperationType::try_from(7), Err(7));
    }
}
