//! Request handler: executes typed engine requests on behalf of one
//! authenticated user, enforcing permissions before touching storage.

use std::sync::{Arc, Mutex};

use crate::error::{CResult, Error};
use crate::instance::{
    DatabaseObjectType, Instance, PermissionType, SYSTEM_DATABASE_NAME,
};
use crate::request::{Condition, DbeRequest, Response, RowFilter};
use crate::row::Variant;
use crate::storage::Table;

/// Default cipher for `CREATE DATABASE` without an explicit cipher clause.
pub const DEFAULT_DATABASE_CIPHER: &str = "aes128";

/// Pseudo-column addressing the row id in filters and result sets.
pub const TRID_COLUMN_NAME: &str = "TRID";

pub struct RequestHandler {
    instance: Arc<Instance>,
    user_id: u32,
    /// Database targeted by unqualified statements of this session.
    current_database: Mutex<String>,
}

impl RequestHandler {
    pub fn new(instance: Arc<Instance>, user_id: u32) -> RequestHandler {
        RequestHandler {
            instance,
            user_id,
            current_database: Mutex::new(SYSTEM_DATABASE_NAME.to_string()),
        }
    }

    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    pub fn current_database(&self) -> String {
        self.current_database.lock().unwrap().clone()
    }

    /// Executes a request; errors become responses, never panics or masked
    /// failures.
    pub fn execute(&self, request: &DbeRequest) -> Response {
        match self.execute_inner(request) {
            Ok(response) => response,
            Err(err) => {
                log::debug!("request {} failed: {}", request.kind(), err);
                Response::from(&err)
            }
        }
    }

    fn execute_inner(&self, request: &DbeRequest) -> CResult<Response> {
        match request {
            DbeRequest::CreateDatabase { database, cipher_id, description } => {
                let cipher = cipher_id.as_deref().unwrap_or(DEFAULT_DATABASE_CIPHER);
                let (id, uuid) = self.instance.create_database(
                    self.user_id,
                    database,
                    cipher,
                    description.clone(),
                )?;
                log::info!("created database {} ({}, uuid {})", database, id, uuid);
                Ok(Response::with_affected(1))
            }
            DbeRequest::DropDatabase { database } => {
                self.instance.drop_database(self.user_id, database)?;
                let mut current = self.current_database.lock().unwrap();
                if *current == *database {
                    *current = SYSTEM_DATABASE_NAME.to_string();
                }
                Ok(Response::with_affected(1))
            }
            DbeRequest::RenameDatabase { database, new_name } => {
                self.instance.rename_database(self.user_id, database, new_name)?;
                let mut current = self.current_database.lock().unwrap();
                if *current == *database {
                    *current = new_name.clone();
                }
                Ok(Response::with_affected(1))
            }
            DbeRequest::UseDatabase { database } => {
                self.instance.use_database(self.user_id, database)?;
                *self.current_database.lock().unwrap() = database.clone();
                Ok(Response::with_message(format!("using database {}", database)))
            }
            DbeRequest::ShowDatabases | DbeRequest::RestGetDatabases => {
                let databases = self.instance.list_databases(self.user_id)?;
                let rows = databases
                    .into_iter()
                    .map(|(_, name)| vec![Variant::Text(name)])
                    .collect();
                Ok(Response::with_rows(vec!["NAME".into()], rows))
            }

            DbeRequest::CreateTable { database, table, columns } => {
                let database_name = self.resolve_database(database.as_deref());
                let db = self.instance.find_database_by_name(&database_name)?;
                let mut db = db.lock().unwrap();
                self.instance.check_permission(
                    self.user_id,
                    db.id(),
                    DatabaseObjectType::Database,
                    db.id() as u64,
                    PermissionType::Create.mask(),
                )?;
                db.create_table(table, columns, self.user_id)?;
                Ok(Response::with_affected(0))
            }
            DbeRequest::DropTable { database, table } => {
                let database_name = self.resolve_database(database.as_deref());
                let db = self.instance.find_database_by_name(&database_name)?;
                let mut db = db.lock().unwrap();
                let table_id = db.table_id_by_name(table).ok_or_else(|| {
                    Error::NotFound(format!(
                        "table {} does not exist in database {}",
                        table, database_name
                    ))
                })?;
                self.instance.check_permission(
                    self.user_id,
                    db.id(),
                    DatabaseObjectType::Table,
                    table_id as u64,
                    PermissionType::Drop.mask(),
                )?;
                db.drop_table(table, self.user_id)?;
                Ok(Response::with_affected(0))
            }
            DbeRequest::ShowTables => {
                let database_name = self.current_database();
                self.list_tables(&database_name)
            }
            DbeRequest::RestGetTables { database } => self.list_tables(database),
            DbeRequest::DescribeTable { database, table } => {
                let database_name = self.resolve_database(database.as_deref());
                let db = self.instance.find_database_by_name(&database_name)?;
                let db = db.lock().unwrap();
                self.check_table_permission(&db, table, PermissionType::Select.mask())?;
                let rows = db
                    .describe_table(table)?
                    .into_iter()
                    .map(|(name, data_type)| {
                        vec![Variant::Text(name), Variant::Text(data_type.name().into())]
                    })
                    .collect();
                Ok(Response::with_rows(vec!["NAME".into(), "TYPE".into()], rows))
            }

            DbeRequest::Insert { database, table, columns, values } => {
                self.insert_rows(database.as_deref(), table, columns, values)
            }
            DbeRequest::Update { database, table, assignments, filter } => {
                let database_name = self.resolve_database(database.as_deref());
                let db = self.instance.find_database_by_name(&database_name)?;
                let mut db = db.lock().unwrap();
                self.check_table_permission(&db, table, PermissionType::Update.mask())?;
                let transaction_id = db.next_transaction_id();
                let target = db.find_table_mut(table)?;
                let assignments: Vec<(usize, Variant)> = assignments
                    .iter()
                    .map(|(name, value)| Ok((target.column_index(name)?, value.clone())))
                    .collect::<CResult<_>>()?;
                let trids = matching_trids(target, filter)?;
                for trid in &trids {
                    target.update_row(*trid, assignments.clone(), self.user_id, transaction_id)?;
                }
                let mut response = Response::with_affected(trids.len() as u64);
                response.trids = trids;
                Ok(response)
            }
            DbeRequest::Delete { database, table, filter } => {
                let database_name = self.resolve_database(database.as_deref());
                let db = self.instance.find_database_by_name(&database_name)?;
                let mut db = db.lock().unwrap();
                self.check_table_permission(&db, table, PermissionType::Delete.mask())?;
                let transaction_id = db.next_transaction_id();
                let target = db.find_table_mut(table)?;
                let trids = matching_trids(target, filter)?;
                for trid in &trids {
                    target.delete_row(*trid, self.user_id, transaction_id)?;
                }
                let mut response = Response::with_affected(trids.len() as u64);
                response.trids = trids;
                Ok(response)
            }
            DbeRequest::Select { database, table, columns, filter } => {
                self.select_rows(database.as_deref(), table, columns, filter, false)
            }

            DbeRequest::CreateUser { name, real_name, description, active } => {
                self.instance.create_user(
                    self.user_id,
                    name,
                    real_name.clone(),
                    description.clone(),
                    *active,
                )?;
                Ok(Response::with_affected(1))
            }
            DbeRequest::DropUser { name } => {
                self.instance.drop_user(self.user_id, name)?;
                Ok(Response::with_affected(1))
            }
            DbeRequest::SetUserAttributes { name, real_name, description, active } => {
                self.instance.set_user_attributes(
                    self.user_id,
                    name,
                    real_name.clone(),
                    description.clone(),
                    *active,
                )?;
                Ok(Response::with_affected(1))
            }
            DbeRequest::AddUserAccessKey { user, key_name, text, description } => {
                self.instance.create_user_access_key(
                    self.user_id,
                    user,
                    key_name,
                    text,
                    description.clone(),
                )?;
                Ok(Response::with_affected(1))
            }
            DbeRequest::DropUserAccessKey { user, key_name } => {
                self.instance.drop_user_access_key(self.user_id, user, key_name)?;
                Ok(Response::with_affected(1))
            }
            DbeRequest::CreateUserToken {
                user,
                token_name,
                value,
                expiration_timestamp,
                description,
            } => {
                let value = self.instance.create_user_token(
                    self.user_id,
                    user,
                    token_name,
                    value.clone(),
                    *expiration_timestamp,
                    description.clone(),
                )?;
                // The generated value is reported exactly once.
                Ok(Response::with_message(hex::encode(value)))
            }
            DbeRequest::DropUserToken { user, token_name } => {
                self.instance.drop_user_token(self.user_id, user, token_name)?;
                Ok(Response::with_affected(1))
            }
            DbeRequest::CheckUserToken { user, token_name, value } => {
                let ok = self
                    .instance
                    .with_user(user, |u| {
                        u.active
                            && u.tokens.iter().any(|t| {
                                t.name == *token_name
                                    && !t.is_expired(crate::util::now_micros())
                                    && t.value == *value
                            })
                    })
                    .unwrap_or(false);
                if ok {
                    Ok(Response::ok())
                } else {
                    Err(Error::Unauthenticated("access denied".into()))
                }
            }

            DbeRequest::GrantPermissions { user, database, table, permissions, grant_option } => {
                let (database_id, object_type, object_id) =
                    self.resolve_permission_object(database.as_deref(), table.as_deref())?;
                self.instance.grant_permissions(
                    self.user_id,
                    user,
                    database_id,
                    object_type,
                    object_id,
                    *permissions,
                    *grant_option,
                )?;
                Ok(Response::with_affected(1))
            }
            DbeRequest::RevokePermissions { user, database, table, permissions } => {
                let (database_id, object_type, object_id) =
                    self.resolve_permission_object(database.as_deref(), table.as_deref())?;
                self.instance.revoke_permissions(
                    self.user_id,
                    user,
                    database_id,
                    object_type,
                    object_id,
                    *permissions,
                )?;
                Ok(Response::with_affected(1))
            }

            DbeRequest::RestGetAllRows { database, table } => {
                self.select_rows(Some(database), table, &[], &Vec::new(), true)
            }
            DbeRequest::RestGetSingleRow { database, table, trid } => {
                let filter = vec![Condition {
                    column: TRID_COLUMN_NAME.into(),
                    value: Variant::UInt64(*trid),
                }];
                self.select_rows(Some(database), table, &[], &filter, true)
            }
            DbeRequest::RestPostRows { database, table, rows } => {
                let db = self.instance.find_database_by_name(database)?;
                let mut db = db.lock().unwrap();
                self.check_table_permission(&db, table, PermissionType::Insert.mask())?;
                let transaction_id = db.next_transaction_id();
                let target = db.find_table_mut(table)?;
                let mut trids = Vec::with_capacity(rows.len());
                for row in rows {
                    let values = named_values_to_row(target, row)?;
                    let inserted = target.insert_row(values, self.user_id, transaction_id)?;
                    trids.push(inserted.table_row_id);
                }
                let mut response = Response::with_affected(trids.len() as u64);
                response.trids = trids;
                Ok(response)
            }
            DbeRequest::RestDeleteRow { database, table, trid } => {
                let db = self.instance.find_database_by_name(database)?;
                let mut db = db.lock().unwrap();
                self.check_table_permission(&db, table, PermissionType::Delete.mask())?;
                let transaction_id = db.next_transaction_id();
                db.find_table_mut(table)?.delete_row(*trid, self.user_id, transaction_id)?;
                let mut response = Response::with_affected(1);
                response.trids = vec![*trid];
                Ok(response)
            }
            DbeRequest::RestPatchRow { database, table, trid, columns, values } => {
                if columns.len() != values.len() {
                    return Err(Error::InvalidArgument(format!(
                        "{} columns but {} values in row patch",
                        columns.len(),
                        values.len()
                    )));
                }
                let db = self.instance.find_database_by_name(database)?;
                let mut db = db.lock().unwrap();
                self.check_table_permission(&db, table, PermissionType::Update.mask())?;
                let transaction_id = db.next_transaction_id();
                let target = db.find_table_mut(table)?;
                let updates: Vec<(usize, Variant)> = columns
                    .iter()
                    .zip(values.iter())
                    .map(|(name, value)| Ok((target.column_index(name)?, value.clone())))
                    .collect::<CResult<_>>()?;
                target.update_row(*trid, updates, self.user_id, transaction_id)?;
                let mut response = Response::with_affected(1);
                response.trids = vec![*trid];
                Ok(response)
            }
        }
    }

    // --- internals ---

    fn resolve_database(&self, explicit: Option<&str>) -> String {
        explicit.map(|s| s.to_string()).unwrap_or_else(|| self.current_database())
    }

    fn list_tables(&self, database_name: &str) -> CResult<Response> {
        self.instance.use_database(self.user_id, database_name)?;
        let db = self.instance.find_database_by_name(database_name)?;
        let db = db.lock().unwrap();
        let rows = db.table_names().into_iter().map(|name| vec![Variant::Text(name)]).collect();
        Ok(Response::with_rows(vec!["NAME".into()], rows))
    }

    fn check_table_permission(
        &self,
        db: &crate::instance::Database,
        table: &str,
        mask: u64,
    ) -> CResult<()> {
        let table_id = db.table_id_by_name(table).ok_or_else(|| {
            Error::NotFound(format!("table {} does not exist in database {}", table, db.name()))
        })?;
        self.instance.check_permission(
            self.user_id,
            db.id(),
            DatabaseObjectType::Table,
            table_id as u64,
            mask,
        )
    }

    fn resolve_permission_object(
        &self,
        database: Option<&str>,
        table: Option<&str>,
    ) -> CResult<(u32, DatabaseObjectType, u64)> {
        match (database, table) {
            (None, None) => Ok((0, DatabaseObjectType::Instance, 0)),
            (Some(database_name), None) => {
                let db = self.instance.find_database_by_name(database_name)?;
                let id = db.lock().unwrap().id();
                Ok((id, DatabaseObjectType::Database, id as u64))
            }
            (Some(database_name), Some(table_name)) => {
                let db = self.instance.find_database_by_name(database_name)?;
                let db = db.lock().unwrap();
                let object_id = if table_name == "*" {
                    0
                } else {
                    db.table_id_by_name(table_name).ok_or_else(|| {
                        Error::NotFound(format!(
                            "table {} does not exist in database {}",
                            table_name, database_name
                        ))
                    })? as u64
                };
                Ok((db.id(), DatabaseObjectType::Table, object_id))
            }
            (None, Some(table_name)) => {
                let database_name = self.current_database();
                self.resolve_permission_object(Some(&database_name), Some(table_name))
            }
        }
    }

    fn insert_rows(
        &self,
        database: Option<&str>,
        table: &str,
        columns: &[String],
        values: &[Vec<Variant>],
    ) -> CResult<Response> {
        let database_name = self.resolve_database(database);
        let db = self.instance.find_database_by_name(&database_name)?;
        let mut db = db.lock().unwrap();
        self.check_table_permission(&db, table, PermissionType::Insert.mask())?;
        let transaction_id = db.next_transaction_id();
        let target = db.find_table_mut(table)?;

        let column_indexes: Vec<usize> = if columns.is_empty() {
            (0..target.column_count()).collect()
        } else {
            let mut seen = std::collections::HashSet::new();
            let mut indexes = Vec::with_capacity(columns.len());
            for name in columns {
                let index = target.column_index(name)?;
                if !seen.insert(index) {
                    return Err(Error::Conflict(format!("duplicate column {} in INSERT", name)));
                }
                indexes.push(index);
            }
            indexes
        };

        let mut trids = Vec::with_capacity(values.len());
        for row_values in values {
            if row_values.len() != column_indexes.len() {
                return Err(Error::InvalidArgument(format!(
                    "INSERT supplies {} values for {} columns",
                    row_values.len(),
                    column_indexes.len()
                )));
            }
            let mut full_row = vec![Variant::Null; target.column_count()];
            for (index, value) in column_indexes.iter().zip(row_values.iter()) {
                full_row[*index] = value.clone();
            }
            let inserted = target.insert_row(full_row, self.user_id, transaction_id)?;
            trids.push(inserted.table_row_id);
        }
        let mut response = Response::with_affected(trids.len() as u64);
        response.trids = trids;
        Ok(response)
    }

    fn select_rows(
        &self,
        database: Option<&str>,
        table: &str,
        columns: &[String],
        filter: &RowFilter,
        include_trid_column: bool,
    ) -> CResult<Response> {
        let database_name = self.resolve_database(database);
        let db = self.instance.find_database_by_name(&database_name)?;
        let mut db = db.lock().unwrap();
        self.check_table_permission(&db, table, PermissionType::Select.mask())?;
        let target = db.find_table_mut(table)?;

        let projection: Vec<usize> = if columns.is_empty() {
            (0..target.column_count()).collect()
        } else {
            columns
                .iter()
                .map(|name| target.column_index(name))
                .collect::<CResult<_>>()?
        };
        let mut column_names: Vec<String> = Vec::with_capacity(projection.len() + 1);
        if include_trid_column {
            column_names.push(TRID_COLUMN_NAME.into());
        }
        for index in &projection {
            column_names.push(target.columns()[*index].name().to_string());
        }

        let trids = matching_trids(target, filter)?;
        let mut rows = Vec::with_capacity(trids.len());
        for trid in &trids {
            let (_, values) = target
                .read_row(*trid)?
                .ok_or_else(|| Error::Corrupt(format!("row {} vanished during scan", trid)))?;
            let mut row = Vec::with_capacity(projection.len() + 1);
            if include_trid_column {
                row.push(Variant::UInt64(*trid));
            }
            for index in &projection {
                row.push(values[*index].clone());
            }
            rows.push(row);
        }
        let mut response = Response::with_rows(column_names, rows);
        response.trids = trids;
        Ok(response)
    }
}

/// TRIDs of all visible rows matching a conjunctive equality filter.
fn matching_trids(table: &mut Table, filter: &RowFilter) -> CResult<Vec<u64>> {
    let mut conditions: Vec<(Option<usize>, &Variant)> = Vec::with_capacity(filter.len());
    for condition in filter {
        if condition.column == TRID_COLUMN_NAME {
            conditions.push((None, &condition.value));
        } else {
            conditions.push((Some(table.column_index(&condition.column)?), &condition.value));
        }
    }
    let mut matches = Vec::new();
    for trid in table.visible_trids() {
        let mut row_cache: Option<Vec<Variant>> = None;
        let mut all_match = true;
        for (column_index, expected) in &conditions {
            let matched = match column_index {
                None => expected.compatible_eq(&Variant::UInt64(trid)),
                Some(index) => {
                    if row_cache.is_none() {
                        row_cache = table.read_row(trid)?.map(|(_, values)| values);
                    }
                    match &row_cache {
                        Some(values) => expected.compatible_eq(&values[*index]),
                        None => false,
                    }
                }
            };
            if !matched {
                all_match = false;
                break;
            }
        }
        if all_match {
            matches.push(trid);
        }
    }
    Ok(matches)
}

fn named_values_to_row(table: &Table, row: &[(String, Variant)]) -> CResult<Vec<Variant>> {
    let mut full_row = vec![Variant::Null; table.column_count()];
    let mut seen = std::collections::HashSet::new();
    for (name, value) in row {
        let index = table.column_index(name)?;
        if !seen.insert(index) {
            return Err(Error::Conflict(format!("duplicate column {} in row", name)));
        }
        full_row[index] = value.clone();
    }
    Ok(full_row)
}
