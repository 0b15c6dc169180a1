//! REST connection handler.
//!
//! Each frame is one REST command carrying the caller's token; the token is
//! validated against the instance on every command. POST/PATCH payloads run
//! through the JSON row parser with the configured caps.

use std::net::TcpStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{Context, Result};
use serde_derive::Deserialize;

use strata::error::{CResult, Error};
use strata::handler::RequestHandler;
use strata::instance::Instance;
use strata::request::{DbeRequest, Response};
use strata::row::Variant;

use crate::ast::parse_statements;
use crate::dispatcher::{EngineRequest, ExecutionOutcome, RequestDispatcher, RequestSink};
use crate::json_rows::parse_row_payload;

use super::{read_frame, write_message, ResponseMessage};

#[derive(Debug, Deserialize)]
struct RestCommand {
    request_id: u64,
    user: String,
    /// Hex form of the raw token value.
    token: String,
    method: String,
    #[serde(default)]
    database: Option<String>,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    trid: Option<u64>,
    #[serde(default)]
    query: Option<String>,
    /// JSON text of the row payload for POST/PATCH.
    #[serde(default)]
    payload: Option<String>,
}

/// Caps applied to POST/PATCH payloads.
#[derive(Debug, Clone, Copy)]
pub struct RestLimits {
    pub max_rows: usize,
    pub max_payload: usize,
}

struct RestConnectionHandler {
    instance: Arc<Instance>,
    stream: Mutex<TcpStream>,
}

impl RequestSink for RestConnectionHandler {
    fn execute_engine_request(&self, request: &EngineRequest) -> bool {
        // REST is stateless: a fresh handler bound to the authenticated
        // user of this command.
        let handler = RequestHandler::new(self.instance.clone(), request.user_id);
        let response = handler.execute(&request.request);
        let ok = response.is_ok();
        let message = ResponseMessage {
            request_id: request.request_id,
            response_id: request.response_id,
            statement_count: request.statement_count,
            response,
        };
        let mut stream = self.stream.lock().unwrap();
        if let Err(err) = write_message(&mut *stream, &message) {
            log::error!("rest connection: cannot write response: {}", err);
            return false;
        }
        ok
    }
}

pub fn serve_rest_connection(
    mut stream: TcpStream,
    instance: Arc<Instance>,
    dispatcher: Arc<RequestDispatcher>,
    limits: RestLimits,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    match serve_inner(&mut stream, instance, dispatcher, limits) {
        Ok(()) => log::info!("rest connection from {} closed", peer),
        Err(err) => log::warn!("rest connection from {} failed: {}", peer, err),
    }
}

fn serve_inner(
    stream: &mut TcpStream,
    instance: Arc<Instance>,
    dispatcher: Arc<RequestDispatcher>,
    limits: RestLimits,
) -> Result<()> {
    let connection = Arc::new(RestConnectionHandler {
        instance: instance.clone(),
        stream: Mutex::new(stream.try_clone()?),
    });
    let response_id = AtomicU32::new(1);

    while let Some(frame) = read_frame(stream)? {
        let command: RestCommand =
            serde_json::from_slice(&frame).context("malformed REST command message")?;
        let request_id = command.request_id;

        let prepared = authenticate_and_translate(&instance, &command, limits);
        let (user_id, request) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                let message = ResponseMessage {
                    request_id,
                    response_id: response_id.fetch_add(1, Ordering::Relaxed),
                    statement_count: 1,
                    response: Response::from(&err),
                };
                let mut writer = connection.stream.lock().unwrap();
                write_message(&mut *writer, &message)?;
                continue;
            }
        };

        let (engine_request, promise) = EngineRequest::new(
            request_id,
            response_id.fetch_add(1, Ordering::Relaxed),
            1,
            user_id,
            request,
            Arc::downgrade(&connection) as Weak<dyn RequestSink>,
        );
        dispatcher.add_request(engine_request);
        match promise.recv() {
            Ok(ExecutionOutcome::Completed(_)) => {}
            Ok(ExecutionOutcome::Cancelled) | Err(_) => {
                let message = ResponseMessage {
                    request_id,
                    response_id: response_id.fetch_add(1, Ordering::Relaxed),
                    statement_count: 1,
                    response: Response::from(&Error::Cancelled),
                };
                let mut writer = connection.stream.lock().unwrap();
                let _ = write_message(&mut *writer, &message);
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Validates the caller's token and builds the typed engine request.
fn authenticate_and_translate(
    instance: &Arc<Instance>,
    command: &RestCommand,
    limits: RestLimits,
) -> CResult<(u32, DbeRequest)> {
    let token = hex::decode(command.token.trim())
        .map_err(|_| Error::Unauthenticated("access denied".into()))?;
    let user_name = command.user.to_ascii_uppercase();
    let user_id = instance.authenticate_user_with_token(&user_name, &token)?;
    let request = translate_command(command, limits)?;
    Ok((user_id, request))
}

fn translate_command(command: &RestCommand, limits: RestLimits) -> CResult<DbeRequest> {
    let database = || -> CResult<String> {
        command
            .database
            .as_deref()
            .map(|s| s.to_ascii_uppercase())
            .ok_or_else(|| Error::InvalidArgument("missing database name".into()))
    };
    let table = || -> CResult<String> {
        command
            .table
            .as_deref()
            .map(|s| s.to_ascii_uppercase())
            .ok_or_else(|| Error::InvalidArgument("missing table name".into()))
    };
    let trid = || -> CResult<u64> {
        command.trid.ok_or_else(|| Error::InvalidArgument("missing row id".into()))
    };
    let rows = || -> CResult<Vec<Vec<(String, Variant)>>> {
        let payload = command
            .payload
            .as_deref()
            .ok_or_else(|| Error::InvalidArgument("missing row payload".into()))?;
        parse_row_payload(payload.as_bytes(), limits.max_rows, limits.max_payload)
    };

    match command.method.as_str() {
        "get_databases" => Ok(DbeRequest::RestGetDatabases),
        "get_tables" => Ok(DbeRequest::RestGetTables { database: database()? }),
        "get_all_rows" => {
            Ok(DbeRequest::RestGetAllRows { database: database()?, table: table()? })
        }
        "get_single_row" => Ok(DbeRequest::RestGetSingleRow {
            database: database()?,
            table: table()?,
            trid: trid()?,
        }),
        "get_sql_query_rows" => {
            let query = command
                .query
                .as_deref()
                .ok_or_else(|| Error::InvalidArgument("missing query text".into()))?;
            let mut statements = parse_statements(query)?;
            match (statements.pop(), statements.is_empty()) {
                (Some(request @ DbeRequest::Select { .. }), true) => Ok(request),
                _ => Err(Error::InvalidArgument(
                    "query must be a single SELECT statement".into(),
                )),
            }
        }
        "post_rows" => Ok(DbeRequest::RestPostRows {
            database: database()?,
            table: table()?,
            rows: rows()?,
        }),
        "delete_row" => Ok(DbeRequest::RestDeleteRow {
            database: database()?,
            table: table()?,
            trid: trid()?,
        }),
        "patch_row" => {
            let mut rows = rows()?;
            if rows.len() != 1 {
                return Err(Error::InvalidArgument(
                    "row patch payload must contain exactly one row".into(),
                ));
            }
            let row = rows.pop().unwrap();
            let (columns, values): (Vec<String>, Vec<Variant>) = row.into_iter().unzip();
            Ok(DbeRequest::RestPatchRow {
                database: database()?,
                table: table()?,
                trid: trid()?,
                columns,
                values,
            })
        }
        other => Err(Error::InvalidArgument(format!("unknown REST method '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(method: &str) -> RestCommand {
        RestCommand {
            request_id: 1,
            user: "root".into(),
            token: "00".into(),
            method: method.into(),
            database: Some("db1".into()),
            table: Some("t1".into()),
            trid: Some(3),
            query: Some("SELECT * FROM t1".into()),
            payload: Some(r#"[{"a": 1}]"#.into()),
        }
    }

    fn limits() -> RestLimits {
        RestLimits { max_rows: 100, max_payload: 1024 }
    }

    #[test]
    fn translates_methods() {
        assert_eq!(
            translate_command(&command("get_single_row"), limits()).unwrap(),
            DbeRequest::RestGetSingleRow { database: "DB1".into(), table: "T1".into(), trid: 3 }
        );
        assert!(matches!(
            translate_command(&command("get_sql_query_rows"), limits()).unwrap(),
            DbeRequest::Select { .. }
        ));
        assert!(matches!(
            translate_command(&command("patch_row"), limits()).unwrap(),
            DbeRequest::RestPatchRow { .. }
        ));
        assert!(translate_command(&command("teleport"), limits()).is_err());
    }

    #[test]
    fn missing_fields_are_rejected() {
        let mut cmd = command("get_all_rows");
        cmd.table = None;
        assert!(matches!(
            translate_command(&cmd, limits()),
            Err(Error::InvalidArgument(_))
        ));

        let mut cmd = command("get_sql_query_rows");
        cmd.query = Some("DELETE FROM t1".into());
        assert!(matches!(
            translate_command(&cmd, limits()),
            Err(Error::InvalidArgument(_))
        ));
    }
}
