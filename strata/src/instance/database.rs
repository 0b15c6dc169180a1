//! A database: a set of tables plus the catalog tables that persist them.
//!
//! Every database carries two catalog tables with well-known ids:
//! `SYS_TABLES` (row TRID = table id) and `SYS_COLUMNS` (row TRID = column
//! id). User tables are recorded there and rediscovered from there on open;
//! the catalog tables themselves are bootstrapped from fixed schemas and
//! never self-described.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::crypto::CipherContext;
use crate::error::{CResult, Error};
use crate::row::{ColumnDataType, Variant};
use crate::storage::{ColumnDefinition, Table};
use crate::util::{is_valid_object_name, now_micros};

/// Well-known id of the `SYS_TABLES` catalog table.
pub const SYS_TABLES_TABLE_ID: u32 = 1;
/// Well-known id of the `SYS_COLUMNS` catalog table.
pub const SYS_COLUMNS_TABLE_ID: u32 = 2;
/// First table id handed out to regular tables.
pub const FIRST_USER_TABLE_ID: u32 = 256;

pub const SYS_TABLES_NAME: &str = "SYS_TABLES";
pub const SYS_COLUMNS_NAME: &str = "SYS_COLUMNS";

/// Master column id used by the catalog tables themselves.
const CATALOG_MASTER_COLUMN_ID: u64 = 1;

/// Default column set id; column-set evolution is a per-table counter.
const DEFAULT_COLUMN_SET_ID: u64 = 1;

fn sys_tables_defs() -> Vec<ColumnDefinition> {
    vec![
        ColumnDefinition { id: 2, name: "NAME".into(), data_type: ColumnDataType::Text },
        ColumnDefinition { id: 3, name: "DESCRIPTION".into(), data_type: ColumnDataType::Text },
    ]
}

fn sys_columns_defs() -> Vec<ColumnDefinition> {
    vec![
        ColumnDefinition { id: 2, name: "TABLE_ID".into(), data_type: ColumnDataType::UInt64 },
        ColumnDefinition { id: 3, name: "NAME".into(), data_type: ColumnDataType::Text },
        ColumnDefinition { id: 4, name: "DATA_TYPE".into(), data_type: ColumnDataType::UInt64 },
        ColumnDefinition { id: 5, name: "POSITION".into(), data_type: ColumnDataType::UInt64 },
    ]
}

pub struct Database {
    id: u32,
    uuid: Uuid,
    name: String,
    description: Option<String>,
    cipher_id: String,
    data_dir: PathBuf,
    data_area_size: u32,
    enc: Arc<dyn CipherContext>,
    dec: Arc<dyn CipherContext>,
    sys_tables: Table,
    sys_columns: Table,
    tables: HashMap<u32, Table>,
    table_ids_by_name: HashMap<String, u32>,
    next_transaction_id: u64,
}

impl Database {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        id: u32,
        uuid: Uuid,
        name: String,
        description: Option<String>,
        cipher_id: String,
        data_dir: PathBuf,
        data_area_size: u32,
        enc: Arc<dyn CipherContext>,
        dec: Arc<dyn CipherContext>,
    ) -> CResult<Self> {
        fs::create_dir_all(&data_dir)?;
        let mut sys_tables = Table::create(
            &data_dir,
            uuid,
            SYS_TABLES_TABLE_ID,
            SYS_TABLES_NAME.into(),
            CATALOG_MASTER_COLUMN_ID,
            &sys_tables_defs(),
            DEFAULT_COLUMN_SET_ID,
            data_area_size,
            enc.clone(),
            dec.clone(),
        )?;
        let sys_columns = Table::create(
            &data_dir,
            uuid,
            SYS_COLUMNS_TABLE_ID,
            SYS_COLUMNS_NAME.into(),
            CATALOG_MASTER_COLUMN_ID,
            &sys_columns_defs(),
            DEFAULT_COLUMN_SET_ID,
            data_area_size,
            enc.clone(),
            dec.clone(),
        )?;
        // Regular tables get ids from the catalog TRID generator, starting
        // above the reserved range.
        sys_tables.set_next_trid(FIRST_USER_TABLE_ID as u64)?;
        log::info!("created database {} ({}) in {}", name, id, data_dir.display());
        Ok(Database {
            id,
            uuid,
            name,
            description,
            cipher_id,
            data_dir,
            data_area_size,
            enc,
            dec,
            sys_tables,
            sys_columns,
            tables: HashMap::new(),
            table_ids_by_name: HashMap::new(),
            next_transaction_id: now_micros(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn open(
        id: u32,
        uuid: Uuid,
        name: String,
        description: Option<String>,
        cipher_id: String,
        data_dir: PathBuf,
        data_area_size: u32,
        enc: Arc<dyn CipherContext>,
        dec: Arc<dyn CipherContext>,
    ) -> CResult<Self> {
        let mut sys_tables = Table::open(
            &data_dir,
            uuid,
            SYS_TABLES_TABLE_ID,
            SYS_TABLES_NAME.into(),
            CATALOG_MASTER_COLUMN_ID,
            &sys_tables_defs(),
            DEFAULT_COLUMN_SET_ID,
            data_area_size,
            enc.clone(),
            dec.clone(),
        )?;
        let mut sys_columns = Table::open(
            &data_dir,
            uuid,
            SYS_COLUMNS_TABLE_ID,
            SYS_COLUMNS_NAME.into(),
            CATALOG_MASTER_COLUMN_ID,
            &sys_columns_defs(),
            DEFAULT_COLUMN_SET_ID,
            data_area_size,
            enc.clone(),
            dec.clone(),
        )?;

        // Column declarations per table id, ordered by position. Position 0
        // is the master column.
        let mut columns_by_table: HashMap<u32, Vec<(u64, u64, String, ColumnDataType)>> =
            HashMap::new();
        for trid in sys_columns.visible_trids() {
            let (_, row) = sys_columns.read_row(trid)?.ok_or_else(|| {
                Error::Corrupt(format!("catalog column row {} vanished during open", trid))
            })?;
            let table_id = match &row[0] {
                Variant::UInt64(v) => *v as u32,
                other => {
                    return Err(Error::Corrupt(format!(
                        "catalog column row {} has table id of type {}",
                        trid,
                        other.type_name()
                    )))
                }
            };
            let column_name = match &row[1] {
                Variant::Text(v) => v.clone(),
                other => {
                    return Err(Error::Corrupt(format!(
                        "catalog column row {} has name of type {}",
                        trid,
                        other.type_name()
                    )))
                }
            };
            let data_type = match &row[2] {
                Variant::UInt64(v) => ColumnDataType::try_from(*v as u8).map_err(|b| {
                    Error::Corrupt(format!("catalog column row {} has data type {}", trid, b))
                })?,
                other => {
                    return Err(Error::Corrupt(format!(
                        "catalog column row {} has data type of type {}",
                        trid,
                        other.type_name()
                    )))
                }
            };
            let position = match &row[3] {
                Variant::UInt64(v) => *v,
                other => {
                    return Err(Error::Corrupt(format!(
                        "catalog column row {} has position of type {}",
                        trid,
                        other.type_name()
                    )))
                }
            };
            columns_by_table.entry(table_id).or_default().push((
                position,
                trid,
                column_name,
                data_type,
            ));
        }

        let mut tables = HashMap::new();
        let mut table_ids_by_name = HashMap::new();
        for trid in sys_tables.visible_trids() {
            let table_id = trid as u32;
            let (_, row) = sys_tables.read_row(trid)?.ok_or_else(|| {
                Error::Corrupt(format!("catalog table row {} vanished during open", trid))
            })?;
            let table_name = match &row[0] {
                Variant::Text(v) => v.clone(),
                other => {
                    return Err(Error::Corrupt(format!(
                        "catalog table row {} has name of type {}",
                        trid,
                        other.type_name()
                    )))
                }
            };
            let mut columns = columns_by_table.remove(&table_id).ok_or_else(|| {
                Error::Corrupt(format!("table {} has no catalog columns", table_name))
            })?;
            columns.sort_by_key(|(position, _, _, _)| *position);
            if columns[0].0 != 0 {
                return Err(Error::Corrupt(format!(
                    "table {} has no master column record",
                    table_name
                )));
            }
            let master_column_id = columns[0].1;
            let defs: Vec<ColumnDefinition> = columns[1..]
                .iter()
                .map(|(_, id, name, data_type)| ColumnDefinition {
                    id: *id,
                    name: name.clone(),
                    data_type: *data_type,
                })
                .collect();
            let table = Table::open(
                &data_dir,
                uuid,
                table_id,
                table_name.clone(),
                master_column_id,
                &defs,
                DEFAULT_COLUMN_SET_ID,
                data_area_size,
                enc.clone(),
                dec.clone(),
            )?;
            table_ids_by_name.insert(table_name, table_id);
            tables.insert(table_id, table);
        }

        log::info!(
            "opened database {} ({}) with {} user tables",
            name,
            id,
            tables.len()
        );
        Ok(Database {
            id,
            uuid,
            name,
            description,
            cipher_id,
            data_dir,
            data_area_size,
            enc,
            dec,
            sys_tables,
            sys_columns,
            tables,
            table_ids_by_name,
            next_transaction_id: now_micros(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn cipher_id(&self) -> &str {
        &self.cipher_id
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Monotonic per-database transaction id.
    pub fn next_transaction_id(&mut self) -> u64 {
        self.next_transaction_id += 1;
        self.next_transaction_id
    }

    /// Names of all user tables, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table_ids_by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn table_id_by_name(&self, name: &str) -> Option<u32> {
        self.table_ids_by_name.get(name).copied()
    }

    pub fn find_table_mut(&mut self, name: &str) -> CResult<&mut Table> {
        let id = self.table_ids_by_name.get(name).copied().ok_or_else(|| {
            Error::NotFound(format!("table {} does not exist in database {}", name, self.name))
        })?;
        Ok(self.tables.get_mut(&id).expect("catalog maps out of sync"))
    }

    pub fn find_table(&self, name: &str) -> CResult<&Table> {
        let id = self.table_ids_by_name.get(name).copied().ok_or_else(|| {
            Error::NotFound(format!("table {} does not exist in database {}", name, self.name))
        })?;
        Ok(self.tables.get(&id).expect("catalog maps out of sync"))
    }

    /// Creates a user table and records it in the catalog tables.
    pub fn create_table(
        &mut self,
        name: &str,
        columns: &[(String, ColumnDataType)],
        user_id: u32,
    ) -> CResult<u32> {
        if !is_valid_object_name(name) {
            return Err(Error::InvalidArgument(format!("invalid table name '{}'", name)));
        }
        if columns.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "table {} must have at least one column",
                name
            )));
        }
        if self.table_ids_by_name.contains_key(name)
            || name == SYS_TABLES_NAME
            || name == SYS_COLUMNS_NAME
        {
            return Err(Error::AlreadyExists(format!(
                "table {} already exists in database {}",
                name, self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for (column_name, _) in columns {
            if !is_valid_object_name(column_name) {
                return Err(Error::InvalidArgument(format!(
                    "invalid column name '{}'",
                    column_name
                )));
            }
            if !seen.insert(column_name.clone()) {
                return Err(Error::Conflict(format!(
                    "duplicate column {} in table {}",
                    column_name, name
                )));
            }
        }

        let transaction_id = self.next_transaction_id();
        let inserted = self.sys_tables.insert_row(
            vec![Variant::Text(name.to_string()), Variant::Null],
            user_id,
            transaction_id,
        )?;
        let table_id = inserted.table_row_id as u32;

        // The master column occupies position 0 of the column set.
        let master_column_id = self
            .sys_columns
            .insert_row(
                vec![
                    Variant::UInt64(table_id as u64),
                    Variant::Text(crate::storage::table::MASTER_COLUMN_NAME.into()),
                    Variant::UInt64(ColumnDataType::Binary as u8 as u64),
                    Variant::UInt64(0),
                ],
                user_id,
                transaction_id,
            )?
            .table_row_id;
        let mut defs = Vec::with_capacity(columns.len());
        for (position, (column_name, data_type)) in columns.iter().enumerate() {
            let column_id = self
                .sys_columns
                .insert_row(
                    vec![
                        Variant::UInt64(table_id as u64),
                        Variant::Text(column_name.clone()),
                        Variant::UInt64(*data_type as u8 as u64),
                        Variant::UInt64(position as u64 + 1),
                    ],
                    user_id,
                    transaction_id,
                )?
                .table_row_id;
            defs.push(ColumnDefinition {
                id: column_id,
                name: column_name.clone(),
                data_type: *data_type,
            });
        }

        let table = Table::create(
            &self.data_dir,
            self.uuid,
            table_id,
            name.to_string(),
            master_column_id,
            &defs,
            DEFAULT_COLUMN_SET_ID,
            self.data_area_size,
            self.enc.clone(),
            self.dec.clone(),
        )?;
        self.table_ids_by_name.insert(name.to_string(), table_id);
        self.tables.insert(table_id, table);
        Ok(table_id)
    }

    /// Drops a user table: catalog rows, in-memory registration, data files.
    pub fn drop_table(&mut self, name: &str, user_id: u32) -> CResult<()> {
        let table_id = self.table_ids_by_name.get(name).copied().ok_or_else(|| {
            Error::NotFound(format!("table {} does not exist in database {}", name, self.name))
        })?;
        let transaction_id = self.next_transaction_id();

        // Remove catalog column rows for this table.
        let column_trids: Vec<u64> = {
            let mut matches = Vec::new();
            for trid in self.sys_columns.visible_trids() {
                let (_, row) = self.sys_columns.read_row(trid)?.ok_or_else(|| {
                    Error::Corrupt(format!("catalog column row {} vanished during drop", trid))
                })?;
                if row[0].compatible_eq(&Variant::UInt64(table_id as u64)) {
                    matches.push(trid);
                }
            }
            matches
        };
        for trid in column_trids {
            self.sys_columns.delete_row(trid, user_id, transaction_id)?;
        }
        self.sys_tables.delete_row(table_id as u64, user_id, transaction_id)?;

        self.tables.remove(&table_id);
        self.table_ids_by_name.remove(name);
        fs::remove_dir_all(self.data_dir.join(table_id.to_string()))?;
        log::info!("dropped table {} ({}) from database {}", name, table_id, self.name);
        Ok(())
    }

    /// Column declarations of a table, for DESCRIBE-style results.
    pub fn describe_table(&self, name: &str) -> CResult<Vec<(String, ColumnDataType)>> {
        let table = self.find_table(name)?;
        Ok(table
            .columns()
            .iter()
            .map(|c| (c.name().to_string(), c.data_type()))
            .collect())
    }

    pub fn flush(&mut self) -> CResult<()> {
        self.sys_tables.flush()?;
        self.sys_columns.flush()?;
        for table in self.tables.values_mut() {
            table.flush()?;
        }
        Ok(())
    }
}
