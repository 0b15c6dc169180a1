//! Typed database-engine requests and the uniform response shape.
//!
//! Connection handlers translate SQL text or REST routes into one of these
//! variants; the executor dispatches on the tag with a plain `match`.

use serde_derive::Serialize;

use crate::error::Error;
use crate::row::{ColumnDataType, Variant};

/// One conjunctive equality condition of a row filter. The pseudo-column
/// `TRID` addresses the row id.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub value: Variant,
}

/// Conjunction of equality conditions; empty means "all rows".
pub type RowFilter = Vec<Condition>;

/// A typed request against the database engine.
#[derive(Debug, Clone, PartialEq)]
pub enum DbeRequest {
    // databases
    CreateDatabase {
        database: String,
        cipher_id: Option<String>,
        description: Option<String>,
    },
    DropDatabase {
        database: String,
    },
    RenameDatabase {
        database: String,
        new_name: String,
    },
    UseDatabase {
        database: String,
    },
    ShowDatabases,

    // tables
    CreateTable {
        database: Option<String>,
        table: String,
        columns: Vec<(String, ColumnDataType)>,
    },
    DropTable {
        database: Option<String>,
        table: String,
    },
    ShowTables,
    DescribeTable {
        database: Option<String>,
        table: String,
    },

    // DML
    Insert {
        database: Option<String>,
        table: String,
        /// Empty means "all columns in declaration order".
        columns: Vec<String>,
        values: Vec<Vec<Variant>>,
    },
    Update {
        database: Option<String>,
        table: String,
        assignments: Vec<(String, Variant)>,
        filter: RowFilter,
    },
    Delete {
        database: Option<String>,
        table: String,
        filter: RowFilter,
    },
    Select {
        database: Option<String>,
        table: String,
        /// Empty means "all columns".
        columns: Vec<String>,
        filter: RowFilter,
    },

    // users
    CreateUser {
        name: String,
        real_name: Option<String>,
        description: Option<String>,
        active: bool,
    },
    DropUser {
        name: String,
    },
    SetUserAttributes {
        name: String,
        real_name: Option<Option<String>>,
        description: Option<Option<String>>,
        active: Option<bool>,
    },
    AddUserAccessKey {
        user: String,
        key_name: String,
        text: String,
        description: Option<String>,
    },
    DropUserAccessKey {
        user: String,
        key_name: String,
    },
    CreateUserToken {
        user: String,
        token_name: String,
        value: Option<Vec<u8>>,
        expiration_timestamp: Option<u64>,
        description: Option<String>,
    },
    DropUserToken {
        user: String,
        token_name: String,
    },
    CheckUserToken {
        user: String,
        token_name: String,
        value: Vec<u8>,
    },

    // permissions
    GrantPermissions {
        user: String,
        database: Option<String>,
        table: Option<String>,
        permissions: u64,
        grant_option: bool,
    },
    RevokePermissions {
        user: String,
        database: Option<String>,
        table: Option<String>,
        permissions: u64,
    },

    // REST
    RestGetDatabases,
    RestGetTables {
        database: String,
    },
    RestGetAllRows {
        database: String,
        table: String,
    },
    RestGetSingleRow {
        database: String,
        table: String,
        trid: u64,
    },
    RestPostRows {
        database: String,
        table: String,
        rows: Vec<Vec<(String, Variant)>>,
    },
    RestDeleteRow {
        database: String,
        table: String,
        trid: u64,
    },
    RestPatchRow {
        database: String,
        table: String,
        trid: u64,
        columns: Vec<String>,
        values: Vec<Variant>,
    },
}

impl DbeRequest {
    /// Short tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DbeRequest::CreateDatabase { .. } => "CREATE DATABASE",
            DbeRequest::DropDatabase { .. } => "DROP DATABASE",
            DbeRequest::RenameDatabase { .. } => "RENAME DATABASE",
            DbeRequest::UseDatabase { .. } => "USE DATABASE",
            DbeRequest::ShowDatabases => "SHOW DATABASES",
            DbeRequest::CreateTable { .. } => "CREATE TABLE",
            DbeRequest::DropTable { .. } => "DROP TABLE",
            DbeRequest::ShowTables => "SHOW TABLES",
            DbeRequest::DescribeTable { .. } => "DESCRIBE TABLE",
            DbeRequest::Insert { .. } => "INSERT",
            DbeRequest::Update { .. } => "UPDATE",
            DbeRequest::Delete { .. } => "DELETE",
            DbeRequest::Select { .. } => "SELECT",
            DbeRequest::CreateUser { .. } => "CREATE USER",
            DbeRequest::DropUser { .. } => "DROP USER",
            DbeRequest::SetUserAttributes { .. } => "ALTER USER",
            DbeRequest::AddUserAccessKey { .. } => "ADD ACCESS KEY",
            DbeRequest::DropUserAccessKey { .. } => "DROP ACCESS KEY",
            DbeRequest::CreateUserToken { .. } => "ADD TOKEN",
            DbeRequest::DropUserToken { .. } => "DROP TOKEN",
            DbeRequest::CheckUserToken { .. } => "CHECK TOKEN",
            DbeRequest::GrantPermissions { .. } => "GRANT",
            DbeRequest::RevokePermissions { .. } => "REVOKE",
            DbeRequest::RestGetDatabases => "REST GET DATABASES",
            DbeRequest::RestGetTables { .. } => "REST GET TABLES",
            DbeRequest::RestGetAllRows { .. } => "REST GET ALL ROWS",
            DbeRequest::RestGetSingleRow { .. } => "REST GET SINGLE ROW",
            DbeRequest::RestPostRows { .. } => "REST POST ROWS",
            DbeRequest::RestDeleteRow { .. } => "REST DELETE ROW",
            DbeRequest::RestPatchRow { .. } => "REST PATCH ROW",
        }
    }
}

/// Engine response. `status_code` 0 means success; a nonzero status
/// terminates the affected statement but not the session.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub status_code: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub column_names: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<Vec<Variant>>,
    pub affected_row_count: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trids: Vec<u64>,
}

impl Response {
    pub fn ok() -> Response {
        Response {
            status_code: 0,
            message: None,
            column_names: Vec::new(),
            rows: Vec::new(),
            affected_row_count: 0,
            trids: Vec::new(),
        }
    }

    pub fn with_message(message: impl Into<String>) -> Response {
        Response { message: Some(message.into()), ..Response::ok() }
    }

    pub fn with_affected(affected_row_count: u64) -> Response {
        Response { affected_row_count, ..Response::ok() }
    }

    pub fn with_rows(column_names: Vec<String>, rows: Vec<Vec<Variant>>) -> Response {
        Response { column_names, rows, ..Response::ok() }
    }

    pub fn is_ok(&self) -> bool {
        self.status_code == 0
    }
}

impl From<&Error> for Response {
    fn from(err: &Error) -> Response {
        Response {
            status_code: err.status_code(),
            message: Some(err.to_string()),
            ..Response::ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_maps_to_status() {
        let err = Error::NotFound("table T".into());
        let response = Response::from(&err);
        assert_eq!(response.status_code, 2);
        assert!(response.message.unwrap().contains("table T"));
        assert!(Response::ok().is_ok());
    }

    #[test]
    fn response_serializes_compactly() {
        let response = Response::with_rows(
            vec!["NAME".into()],
            vec![vec![Variant::Text("SYS".into())]],
        );
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"NAME\""));
        assert!(!json.contains("message"));
        assert!(!json.contains("trids"));
    }
}
