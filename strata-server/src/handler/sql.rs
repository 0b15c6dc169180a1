//! SQL connection handler.
//!
//! After accept, the handler runs challenge/response authentication, then a
//! request loop: each frame carries SQL text that is translated into one or
//! more engine requests, submitted through the dispatcher, and answered
//! with one response frame per statement. A failed statement aborts the
//! rest of its batch, not the session.

use std::net::TcpStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{Context, Result};
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};

use strata::error::Error;
use strata::handler::RequestHandler;
use strata::instance::Instance;
use strata::request::Response;

use crate::ast::parse_statements;
use crate::dispatcher::{EngineRequest, ExecutionOutcome, RequestDispatcher, RequestSink};

use super::{read_frame, write_message, ResponseMessage};

const CHALLENGE_LENGTH: usize = 32;

#[derive(Serialize)]
struct ChallengeMessage {
    challenge: String,
}

#[derive(Deserialize)]
struct AuthRequest {
    user: String,
    signature: String,
}

#[derive(Serialize)]
struct AuthResponse {
    status_code: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<String>,
}

#[derive(Deserialize)]
struct SqlCommand {
    request_id: u64,
    sql: String,
}

/// Per-connection state shared with the executor through a weak reference.
struct SqlConnectionHandler {
    handler: RequestHandler,
    stream: Mutex<TcpStream>,
}

impl RequestSink for SqlConnectionHandler {
    fn execute_engine_request(&self, request: &EngineRequest) -> bool {
        let response = self.handler.execute(&request.request);
        let ok = response.is_ok();
        let message = ResponseMessage {
            request_id: request.request_id,
            response_id: request.response_id,
            statement_count: request.statement_count,
            response,
        };
        let mut stream = self.stream.lock().unwrap();
        if let Err(err) = write_message(&mut *stream, &message) {
            log::error!("sql connection: cannot write response: {}", err);
            return false;
        }
        ok
    }
}

/// Serves one SQL connection until the client disconnects or a fatal
/// transport error occurs.
pub fn serve_sql_connection(
    mut stream: TcpStream,
    instance: Arc<Instance>,
    dispatcher: Arc<RequestDispatcher>,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    match serve_inner(&mut stream, instance, dispatcher) {
        Ok(()) => log::info!("sql connection from {} closed", peer),
        Err(err) => log::warn!("sql connection from {} failed: {}", peer, err),
    }
}

fn serve_inner(
    stream: &mut TcpStream,
    instance: Arc<Instance>,
    dispatcher: Arc<RequestDispatcher>,
) -> Result<()> {
    // Challenge/response authentication.
    let mut challenge = vec![0u8; CHALLENGE_LENGTH];
    rand::thread_rng().fill_bytes(&mut challenge);
    write_message(stream, &ChallengeMessage { challenge: hex::encode(&challenge) })?;

    let auth_frame = match read_frame(stream)? {
        Some(frame) => frame,
        None => return Ok(()),
    };
    let auth: AuthRequest =
        serde_json::from_slice(&auth_frame).context("malformed authentication message")?;
    let user_name = auth.user.to_ascii_uppercase();
    let signature = hex::decode(auth.signature.trim()).unwrap_or_default();
    let auth_result = instance
        .begin_user_authentication(&user_name)
        .and_then(|_| instance.authenticate_user(&user_name, &signature, &challenge));
    let auth_result = match auth_result {
        Ok(result) => result,
        Err(err) => {
            write_message(
                stream,
                &AuthResponse {
                    status_code: err.status_code(),
                    message: Some(err.to_string()),
                    session: None,
                },
            )?;
            return Ok(());
        }
    };
    write_message(
        stream,
        &AuthResponse {
            status_code: 0,
            message: None,
            session: Some(auth_result.session_uuid.to_string()),
        },
    )?;

    let connection = Arc::new(SqlConnectionHandler {
        handler: RequestHandler::new(instance.clone(), auth_result.user_id),
        stream: Mutex::new(stream.try_clone()?),
    });
    let response_id = AtomicU32::new(1);

    // Request loop: frames are executed strictly in submission order.
    let result = request_loop(stream, &dispatcher, &connection, &response_id);
    if let Err(err) = instance.end_session(&auth_result.session_uuid) {
        log::warn!("cannot end session {}: {}", auth_result.session_uuid, err);
    }
    result
}

fn request_loop(
    stream: &mut TcpStream,
    dispatcher: &Arc<RequestDispatcher>,
    connection: &Arc<SqlConnectionHandler>,
    response_id: &AtomicU32,
) -> Result<()> {
    while let Some(frame) = read_frame(stream)? {
        let command: SqlCommand =
            serde_json::from_slice(&frame).context("malformed SQL command message")?;
        let statements = match parse_statements(&command.sql) {
            Ok(statements) => statements,
            Err(err) => {
                let message = ResponseMessage {
                    request_id: command.request_id,
                    response_id: response_id.fetch_add(1, Ordering::Relaxed),
                    statement_count: 0,
                    response: Response::from(&err),
                };
                let mut writer = connection.stream.lock().unwrap();
                write_message(&mut *writer, &message)?;
                continue;
            }
        };
        let statement_count = statements.len();
        for request in statements {
            let (engine_request, promise) = EngineRequest::new(
                command.request_id,
                response_id.fetch_add(1, Ordering::Relaxed),
                statement_count,
                connection.handler.user_id(),
                request,
                Arc::downgrade(connection) as Weak<dyn RequestSink>,
            );
            dispatcher.add_request(engine_request);
            match promise.recv() {
                Ok(ExecutionOutcome::Completed(true)) => {}
                Ok(ExecutionOutcome::Completed(false)) => break,
                Ok(ExecutionOutcome::Cancelled) | Err(_) => {
                    let message = ResponseMessage {
                        request_id: command.request_id,
                        response_id: response_id.fetch_add(1, Ordering::Relaxed),
                        statement_count,
                        response: Response::from(&Error::Cancelled),
                    };
                    let mut writer = connection.stream.lock().unwrap();
                    let _ = write_message(&mut *writer, &message);
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}
