//! A table: a master column holding the row-version records plus one data
//! column per user column, with a persistent monotonic TRID generator.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::crypto::CipherContext;
use crate::error::{CResult, Error};
use crate::io::EncryptedFile;
use crate::mvcc::{
    ColumnDataRecord, DmlOperationType, MasterColumnRecord, MAX_MCR_SERIALIZED_SIZE,
};
use crate::row::{ColumnDataType, Variant};
use crate::util::now_micros;

use super::{Column, ColumnDataAddress};

/// Name of the master column holding the row-version records.
pub const MASTER_COLUMN_NAME: &str = "MC";

const TRID_FILE_NAME: &str = "trid.dat";

/// Declaration of one user column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub id: u64,
    pub name: String,
    pub data_type: ColumnDataType,
}

/// Result of a successful INSERT.
#[derive(Debug, Clone)]
pub struct InsertRowResult {
    pub table_row_id: u64,
    pub mcr_address: ColumnDataAddress,
    /// Current write-target block of every column, master column last,
    /// so the caller may pipeline subsequent writes.
    pub available_blocks: Vec<u64>,
}

pub struct Table {
    database_uuid: Uuid,
    id: u32,
    name: String,
    data_dir: PathBuf,
    master_column: Column,
    columns: Vec<Column>,
    column_set_id: u64,
    last_trid: u64,
    trid_file: EncryptedFile,
    next_operation_id: u64,
    /// TRID of every visible row mapped to its latest MCR address.
    /// Tombstoned rows are absent.
    mcr_index: BTreeMap<u64, ColumnDataAddress>,
}

impl Table {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        database_dir: &Path,
        database_uuid: Uuid,
        id: u32,
        name: String,
        master_column_id: u64,
        column_defs: &[ColumnDefinition],
        column_set_id: u64,
        data_area_size: u32,
        enc: Arc<dyn CipherContext>,
        dec: Arc<dyn CipherContext>,
    ) -> CResult<Self> {
        let data_dir = database_dir.join(id.to_string());
        fs::create_dir_all(&data_dir)?;
        let master_column = Column::create(
            &data_dir,
            database_uuid,
            id,
            master_column_id,
            MASTER_COLUMN_NAME.into(),
            ColumnDataType::Binary,
            data_area_size,
            enc.clone(),
            dec.clone(),
        )?;
        let mut columns = Vec::with_capacity(column_defs.len());
        for def in column_defs {
            columns.push(Column::create(
                &data_dir,
                database_uuid,
                id,
                def.id,
                def.name.clone(),
                def.data_type,
                data_area_size,
                enc.clone(),
                dec.clone(),
            )?);
        }
        let mut trid_file =
            EncryptedFile::create(&data_dir.join(TRID_FILE_NAME), 0, enc, dec)?;
        trid_file.write_at(&0u64.to_le_bytes(), 0)?;
        log::debug!("created table {} ({}) in {}", name, id, data_dir.display());
        Ok(Table {
            database_uuid,
            id,
            name,
            data_dir,
            master_column,
            columns,
            column_set_id,
            last_trid: 0,
            trid_file,
            next_operation_id: 1,
            mcr_index: BTreeMap::new(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn open(
        database_dir: &Path,
        database_uuid: Uuid,
        id: u32,
        name: String,
        master_column_id: u64,
        column_defs: &[ColumnDefinition],
        column_set_id: u64,
        data_area_size: u32,
        enc: Arc<dyn CipherContext>,
        dec: Arc<dyn CipherContext>,
    ) -> CResult<Self> {
        let data_dir = database_dir.join(id.to_string());
        let master_column = Column::open(
            &data_dir,
            database_uuid,
            id,
            master_column_id,
            MASTER_COLUMN_NAME.into(),
            ColumnDataType::Binary,
            data_area_size,
            enc.clone(),
            dec.clone(),
        )?;
        let mut columns = Vec::with_capacity(column_defs.len());
        for def in column_defs {
            columns.push(Column::open(
                &data_dir,
                database_uuid,
                id,
                def.id,
                def.name.clone(),
                def.data_type,
                data_area_size,
                enc.clone(),
                dec.clone(),
            )?);
        }
        let trid_file = EncryptedFile::open(&data_dir.join(TRID_FILE_NAME), enc, dec)?;
        let mut trid_bytes = [0u8; 8];
        trid_file.read_exact_at(&mut trid_bytes, 0)?;
        let last_trid = u64::from_le_bytes(trid_bytes);

        let mut table = Table {
            database_uuid,
            id,
            name,
            data_dir,
            master_column,
            columns,
            column_set_id,
            last_trid,
            trid_file,
            next_operation_id: 1,
            mcr_index: BTreeMap::new(),
        };
        table.rebuild_mcr_index()?;
        Ok(table)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> CResult<usize> {
        self.columns
            .iter()
            .position(|c| c.name() == name)
            .ok_or_else(|| {
                Error::NotFound(format!("column {} does not exist in table {}", name, self.name))
            })
    }

    pub fn last_trid(&self) -> u64 {
        self.last_trid
    }

    /// Visible row count.
    pub fn row_count(&self) -> usize {
        self.mcr_index.len()
    }

    pub fn visible_trids(&self) -> Vec<u64> {
        self.mcr_index.keys().copied().collect()
    }

    /// Generates the next TRID and persists the generator state.
    pub fn generate_next_trid(&mut self) -> CResult<u64> {
        let trid = self.last_trid + 1;
        self.persist_last_trid(trid)?;
        Ok(trid)
    }

    /// Moves the generator forward. Only values above the last used TRID
    /// are accepted.
    pub fn set_next_trid(&mut self, next: u64) -> CResult<()> {
        if next <= self.last_trid {
            return Err(Error::Conflict(format!(
                "next TRID {} is not above the last used TRID {} of table {}",
                next, self.last_trid, self.name
            )));
        }
        self.persist_last_trid(next - 1)
    }

    /// Inserts a row; one value per user column, in declaration order.
    pub fn insert_row(
        &mut self,
        values: Vec<Variant>,
        user_id: u32,
        transaction_id: u64,
    ) -> CResult<InsertRowResult> {
        if values.len() != self.columns.len() {
            return Err(Error::InvalidArgument(format!(
                "table {} has {} columns but {} values were supplied",
                self.name,
                self.columns.len(),
                values.len()
            )));
        }
        let mut coerced = Vec::with_capacity(values.len());
        for (value, column) in values.into_iter().zip(self.columns.iter()) {
            coerced.push(value.coerce_to(column.data_type())?);
        }

        let trid = self.generate_next_trid()?;
        let timestamp = now_micros();
        let result = self.try_insert_row(trid, coerced, user_id, transaction_id, timestamp);
        if result.is_err() {
            self.rollback_uncommitted();
        }
        result
    }

    fn try_insert_row(
        &mut self,
        trid: u64,
        values: Vec<Variant>,
        user_id: u32,
        transaction_id: u64,
        timestamp: u64,
    ) -> CResult<InsertRowResult> {
        let mut column_records = Vec::with_capacity(values.len());
        for (value, column) in values.iter().zip(self.columns.iter_mut()) {
            let address = column.append_value(&value.to_bytes())?;
            column_records.push(ColumnDataRecord::new(address, timestamp, timestamp));
        }
        let mcr = MasterColumnRecord {
            table_row_id: trid,
            transaction_id,
            create_timestamp: timestamp,
            update_timestamp: timestamp,
            version: 1,
            operation_id: self.next_operation_id,
            operation_type: DmlOperationType::Insert,
            user_id,
            column_set_id: self.column_set_id,
            private_data_expiration_timestamp: 0,
            column_records,
            previous_version_address: ColumnDataAddress::NULL,
        };
        let mcr_address = self.append_mcr(&mcr)?;
        self.commit_all()?;
        self.next_operation_id += 1;
        self.mcr_index.insert(trid, mcr_address);

        let mut available_blocks: Vec<u64> =
            self.columns.iter().filter_map(|c| c.current_block_id()).collect();
        available_blocks.extend(self.master_column.current_block_id());
        Ok(InsertRowResult { table_row_id: trid, mcr_address, available_blocks })
    }

    /// Updates the named columns of an existing row; unchanged columns keep
    /// their prior addresses in the new version.
    pub fn update_row(
        &mut self,
        trid: u64,
        updates: Vec<(usize, Variant)>,
        user_id: u32,
        transaction_id: u64,
    ) -> CResult<ColumnDataAddress> {
        let old_address = self.latest_version_address(trid)?;
        let old_mcr = self.read_mcr(old_address)?;
        let timestamp = now_micros();

        let mut seen = std::collections::HashSet::new();
        for (index, _) in &updates {
            if *index >= self.columns.len() {
                return Err(Error::InvalidArgument(format!(
                    "column index {} is out of range for table {}",
                    index, self.name
                )));
            }
            if !seen.insert(*index) {
                return Err(Error::Conflict(format!(
                    "duplicate column {} in update of table {}",
                    self.columns[*index].name(),
                    self.name
                )));
            }
        }

        let result = self.try_update_row(
            trid,
            old_address,
            &old_mcr,
            updates,
            user_id,
            transaction_id,
            timestamp,
        );
        if result.is_err() {
            self.rollback_uncommitted();
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn try_update_row(
        &mut self,
        trid: u64,
        old_address: ColumnDataAddress,
        old_mcr: &MasterColumnRecord,
        updates: Vec<(usize, Variant)>,
        user_id: u32,
        transaction_id: u64,
        timestamp: u64,
    ) -> CResult<ColumnDataAddress> {
        let mut column_records = old_mcr.column_records.clone();
        for (index, value) in updates {
            let column = &mut self.columns[index];
            let coerced = value.coerce_to(column.data_type())?;
            let address = column.append_value(&coerced.to_bytes())?;
            let create_timestamp =
                column_records.get(index).map(|r| r.create_timestamp).unwrap_or(timestamp);
            column_records[index] = ColumnDataRecord::new(address, create_timestamp, timestamp);
        }
        let mcr = MasterColumnRecord {
            table_row_id: trid,
            transaction_id,
            create_timestamp: old_mcr.create_timestamp,
            update_timestamp: timestamp,
            version: old_mcr.version + 1,
            operation_id: self.next_operation_id,
            operation_type: DmlOperationType::Update,
            user_id,
            column_set_id: self.column_set_id,
            private_data_expiration_timestamp: old_mcr.private_data_expiration_timestamp,
            column_records,
            previous_version_address: old_address,
        };
        let mcr_address = self.append_mcr(&mcr)?;
        self.commit_all()?;
        self.next_operation_id += 1;
        self.mcr_index.insert(trid, mcr_address);
        Ok(mcr_address)
    }

    /// Tombstones a row: a DELETE record with an empty column list pointing
    /// at the prior version.
    pub fn delete_row(&mut self, trid: u64, user_id: u32, transaction_id: u64) -> CResult<()> {
        let old_address = self.latest_version_address(trid)?;
        let old_mcr = self.read_mcr(old_address)?;
        let timestamp = now_micros();
        let mcr = MasterColumnRecord {
            table_row_id: trid,
            transaction_id,
            create_timestamp: old_mcr.create_timestamp,
            update_timestamp: timestamp,
            version: old_mcr.version + 1,
            operation_id: self.next_operation_id,
            operation_type: DmlOperationType::Delete,
            user_id,
            column_set_id: self.column_set_id,
            private_data_expiration_timestamp: old_mcr.private_data_expiration_timestamp,
            column_records: Vec::new(),
            previous_version_address: old_address,
        };
        let result = (|| {
            self.append_mcr(&mcr)?;
            self.master_column.commit()
        })();
        if result.is_err() {
            self.rollback_uncommitted();
            return result;
        }
        self.next_operation_id += 1;
        self.mcr_index.remove(&trid);
        Ok(())
    }

    /// Reads the visible version of a row. Tombstoned and never-existing
    /// rows read as `None`.
    pub fn read_row(&mut self, trid: u64) -> CResult<Option<(MasterColumnRecord, Vec<Variant>)>> {
        let address = match self.mcr_index.get(&trid) {
            Some(address) => *address,
            None => return Ok(None),
        };
        let mcr = self.read_mcr(address)?;
        let mut values = Vec::with_capacity(mcr.column_records.len());
        for (index, record) in mcr.column_records.iter().enumerate() {
            let column = self.columns.get_mut(index).ok_or_else(|| {
                Error::Corrupt(format!(
                    "master record of row {} references column index {} beyond the table arity",
                    trid, index
                ))
            })?;
            let bytes = column.read_value(record.address)?;
            values.push(Variant::decode(&bytes)?);
        }
        Ok(Some((mcr, values)))
    }

    /// Reads the MCR stored at `address` in the master column.
    pub fn read_mcr(&mut self, address: ColumnDataAddress) -> CResult<MasterColumnRecord> {
        let body = self.master_column.read_value(address)?;
        MasterColumnRecord::deserialize(&body)
    }

    pub fn latest_version_address(&self, trid: u64) -> CResult<ColumnDataAddress> {
        self.mcr_index.get(&trid).copied().ok_or_else(|| {
            Error::NotFound(format!("row {} does not exist in table {}", trid, self.name))
        })
    }

    pub fn flush(&mut self) -> CResult<()> {
        for column in &mut self.columns {
            column.flush()?;
        }
        self.master_column.flush()?;
        self.trid_file.flush()
    }

    // --- internals ---

    fn append_mcr(&mut self, mcr: &MasterColumnRecord) -> CResult<ColumnDataAddress> {
        let body = mcr.serialize()?;
        debug_assert!(body.len() <= MAX_MCR_SERIALIZED_SIZE);
        self.master_column.append_value(&body)
    }

    fn commit_all(&mut self) -> CResult<()> {
        for column in &mut self.columns {
            column.commit()?;
        }
        self.master_column.commit()
    }

    fn rollback_uncommitted(&mut self) {
        for column in &mut self.columns {
            if let Err(err) = column.rollback() {
                log::error!("table {}: rollback of column {} failed: {}", self.name, column.name(), err);
            }
        }
        if let Err(err) = self.master_column.rollback() {
            log::error!("table {}: rollback of the master column failed: {}", self.name, err);
        }
    }

    fn persist_last_trid(&mut self, last: u64) -> CResult<()> {
        self.trid_file.write_at(&last.to_le_bytes(), 0)?;
        self.last_trid = last;
        Ok(())
    }

    /// Replays the master column, applying each operation in commit order.
    fn rebuild_mcr_index(&mut self) -> CResult<()> {
        let mut index = BTreeMap::new();
        let mut max_operation_id = 0u64;
        self.master_column.scan_committed(|address, body| {
            let mcr = MasterColumnRecord::deserialize(&body)?;
            max_operation_id = max_operation_id.max(mcr.operation_id);
            match mcr.operation_type {
                DmlOperationType::Insert | DmlOperationType::Update => {
                    index.insert(mcr.table_row_id, address);
                }
                DmlOperationType::Delete => {
                    index.remove(&mcr.table_row_id);
                }
            }
            Ok(())
        })?;
        self.next_operation_id = max_operation_id + 1;
        self.mcr_index = index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherRegistry;
    use crate::storage::DEFAULT_DATA_AREA_SIZE;

    fn contexts() -> (Arc<dyn CipherContext>, Arc<dyn CipherContext>) {
        let registry = CipherRegistry::with_builtin_ciphers();
        let cipher = registry.get_cipher("aes128").unwrap();
        let key = [5u8; 16];
        (
            cipher.create_encryption_context(&key).unwrap(),
            cipher.create_decryption_context(&key).unwrap(),
        )
    }

    fn defs() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition { id: 2, name: "C1".into(), data_type: ColumnDataType::Text },
            ColumnDefinition { id: 3, name: "C2".into(), data_type: ColumnDataType::Int64 },
        ]
    }

    fn new_table(dir: &Path) -> Table {
        let (enc, dec) = contexts();
        Table::create(
            dir,
            Uuid::nil(),
            256,
            "T1".into(),
            1,
            &defs(),
            1,
            DEFAULT_DATA_AREA_SIZE,
            enc,
            dec,
        )
        .unwrap()
    }

    fn reopen_table(dir: &Path) -> Table {
        let (enc, dec) = contexts();
        Table::open(
            dir,
            Uuid::nil(),
            256,
            "T1".into(),
            1,
            &defs(),
            1,
            DEFAULT_DATA_AREA_SIZE,
            enc,
            dec,
        )
        .unwrap()
    }

    #[test]
    fn insert_then_update_links_versions() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let mut table = new_table(dir.path());

        let inserted = table
            .insert_row(vec![Variant::Text("hello".into()), Variant::Int64(42)], 1, 1)?;
        assert_eq!(inserted.table_row_id, 1);
        assert!(!inserted.available_blocks.is_empty());

        let c2 = table.column_index("C2")?;
        let new_address =
            table.update_row(inserted.table_row_id, vec![(c2, Variant::Int64(43))], 1, 2)?;

        let (mcr, values) = table.read_row(inserted.table_row_id)?.unwrap();
        assert_eq!(values, vec![Variant::Text("hello".into()), Variant::Int64(43)]);
        assert_eq!(mcr.version, 2);
        assert_eq!(mcr.operation_type, DmlOperationType::Update);
        assert_eq!(mcr.previous_version_address, inserted.mcr_address);
        assert_ne!(new_address, inserted.mcr_address);

        // The previous version is still reachable through the chain.
        let old_mcr = table.read_mcr(mcr.previous_version_address)?;
        assert_eq!(old_mcr.version, 1);
        assert_eq!(old_mcr.operation_type, DmlOperationType::Insert);
        assert!(old_mcr.previous_version_address.is_null());
        // The unchanged column keeps its prior address.
        assert_eq!(old_mcr.column_records[0].address, mcr.column_records[0].address);
        Ok(())
    }

    #[test]
    fn delete_tombstones_the_row() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let mut table = new_table(dir.path());
        let inserted =
            table.insert_row(vec![Variant::Text("x".into()), Variant::Int64(1)], 1, 1)?;

        table.delete_row(inserted.table_row_id, 1, 2)?;
        assert!(table.read_row(inserted.table_row_id)?.is_none());
        assert!(matches!(
            table.delete_row(inserted.table_row_id, 1, 3),
            Err(Error::NotFound(_))
        ));

        // The tombstone is the latest record on the master column and links
        // to the prior version.
        drop(table);
        let mut table = reopen_table(dir.path());
        assert!(table.read_row(inserted.table_row_id)?.is_none());
        assert_eq!(table.row_count(), 0);
        Ok(())
    }

    #[test]
    fn reopen_rebuilds_visibility() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        {
            let mut table = new_table(dir.path());
            table.insert_row(vec![Variant::Text("a".into()), Variant::Int64(1)], 1, 1)?;
            let second =
                table.insert_row(vec![Variant::Text("b".into()), Variant::Int64(2)], 1, 2)?;
            table.insert_row(vec![Variant::Text("c".into()), Variant::Int64(3)], 1, 3)?;
            table.delete_row(second.table_row_id, 1, 4)?;
        }
        let mut table = reopen_table(dir.path());
        assert_eq!(table.visible_trids(), vec![1, 3]);
        assert_eq!(table.last_trid(), 3);
        let (_, values) = table.read_row(3)?.unwrap();
        assert_eq!(values[0], Variant::Text("c".into()));
        // New TRIDs continue after the persisted generator state.
        let next = table.insert_row(vec![Variant::Text("d".into()), Variant::Int64(4)], 1, 5)?;
        assert_eq!(next.table_row_id, 4);
        Ok(())
    }

    #[test]
    fn trid_generator_is_monotonic() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let mut table = new_table(dir.path());
        assert_eq!(table.generate_next_trid()?, 1);
        assert_eq!(table.generate_next_trid()?, 2);
        assert!(matches!(table.set_next_trid(2), Err(Error::Conflict(_))));
        table.set_next_trid(100)?;
        assert_eq!(table.generate_next_trid()?, 100);
        Ok(())
    }

    #[test]
    fn arity_and_type_mismatches_are_rejected() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let mut table = new_table(dir.path());
        assert!(matches!(
            table.insert_row(vec![Variant::Int64(1)], 1, 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            table.insert_row(vec![Variant::Int64(1), Variant::Text("x".into())], 1, 1),
            Err(Error::InvalidArgument(_))
        ));
        // A failed insert leaves no visible row behind.
        assert_eq!(table.row_count(), 0);
        let ok = table.insert_row(vec![Variant::Text("y".into()), Variant::Int64(9)], 1, 1)?;
        let (_, values) = table.read_row(ok.table_row_id)?.unwrap();
        assert_eq!(values[1], Variant::Int64(9));
        Ok(())
    }

    #[test]
    fn duplicate_update_column_conflicts() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let mut table = new_table(dir.path());
        let inserted =
            table.insert_row(vec![Variant::Text("x".into()), Variant::Int64(1)], 1, 1)?;
        let c2 = table.column_index("C2")?;
        assert!(matches!(
            table.update_row(
                inserted.table_row_id,
                vec![(c2, Variant::Int64(2)), (c2, Variant::Int64(3))],
                1,
                2
            ),
            Err(Error::Conflict(_))
        ));
        Ok(())
    }
}
