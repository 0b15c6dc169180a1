//! End-to-end tests over the framed TCP transport: challenge/response
//! authentication, SQL batches, and REST commands with token auth.

use std::net::TcpStream;
use std::path::Path;

use ed25519_dalek::Signer;
use serde_json::{json, Value};

use strata_server::config::InstanceConfig;
use strata_server::handler::{read_frame, write_frame};
use strata_server::server::Server;

struct TestEnv {
    server: Server,
    signing_key: ed25519_dalek::SigningKey,
    _dir: tempfile::TempDir,
}

fn start_server() -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let signing_key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);

    let key_file = dir.path().join("master.key");
    std::fs::write(&key_file, [0xefu8; 16]).unwrap();

    let config = InstanceConfig {
        instance: "test".into(),
        data_dir: dir.path().join("data"),
        sql_listen_addr: Some("127.0.0.1:0".into()),
        rest_listen_addr: Some("127.0.0.1:0".into()),
        worker_threads: Some(2),
        master_cipher_id: Some("aes128".into()),
        master_key_file: key_file,
        superuser_initial_access_key: hex::encode(signing_key.verifying_key().to_bytes()),
        data_area_size: Some(64 * 1024),
        log_dir: None,
        log_level: None,
        rest_max_rows: Some(100),
        rest_max_payload: Some(64 * 1024),
    };
    let server = Server::start(&config).unwrap();
    TestEnv { server, signing_key, _dir: dir }
}

fn send(stream: &mut TcpStream, message: &Value) {
    write_frame(stream, message.to_string().as_bytes()).unwrap();
}

fn receive(stream: &mut TcpStream) -> Value {
    let frame = read_frame(stream).unwrap().expect("connection closed unexpectedly");
    serde_json::from_slice(&frame).unwrap()
}

/// Authenticates as the superuser and returns the connected stream.
fn sql_login(env: &TestEnv) -> TcpStream {
    let mut stream = TcpStream::connect(env.server.sql_addr()).unwrap();
    let challenge_message = receive(&mut stream);
    let challenge =
        hex::decode(challenge_message["challenge"].as_str().unwrap()).unwrap();
    let signature = env.signing_key.sign(&challenge);
    send(
        &mut stream,
        &json!({ "user": "root", "signature": hex::encode(signature.to_bytes()) }),
    );
    let auth_response = receive(&mut stream);
    assert_eq!(auth_response["status_code"], 0, "{:?}", auth_response);
    assert!(auth_response["session"].as_str().is_some());
    stream
}

fn run_sql(stream: &mut TcpStream, request_id: u64, sql: &str) -> Vec<Value> {
    send(stream, &json!({ "request_id": request_id, "sql": sql }));
    let first = receive(stream);
    let statement_count = first["statement_count"].as_u64().unwrap() as usize;
    let mut responses = vec![first];
    while responses.len() < statement_count
        && responses.last().unwrap()["status_code"] == 0
    {
        responses.push(receive(stream));
    }
    responses
}

#[test]
fn sql_session_over_tcp() {
    let env = start_server();
    let mut stream = sql_login(&env);

    let responses = run_sql(
        &mut stream,
        1,
        "CREATE DATABASE appdb; \
         USE DATABASE appdb; \
         CREATE TABLE notes (body TEXT, score BIGINT); \
         INSERT INTO notes VALUES ('first', 10), ('second', 20)",
    );
    assert_eq!(responses.len(), 4);
    for response in &responses {
        assert_eq!(response["status_code"], 0, "{:?}", response);
        assert_eq!(response["request_id"], 1);
    }
    assert_eq!(responses[3]["trids"], json!([1, 2]));

    let responses = run_sql(&mut stream, 2, "SELECT body FROM notes WHERE score = 20");
    assert_eq!(responses[0]["rows"], json!([["second"]]));
    assert_eq!(responses[0]["column_names"], json!(["BODY"]));

    // A bad statement fails that statement only; the session continues.
    let responses = run_sql(&mut stream, 3, "SELECT nope FROM missing");
    assert_ne!(responses[0]["status_code"], 0);
    let responses = run_sql(&mut stream, 4, "SHOW TABLES");
    assert_eq!(responses[0]["rows"], json!([["NOTES"]]));

    env.server.stop();
}

#[test]
fn failed_authentication_closes_cleanly() {
    let env = start_server();
    let mut stream = TcpStream::connect(env.server.sql_addr()).unwrap();
    let _challenge = receive(&mut stream);
    send(&mut stream, &json!({ "user": "root", "signature": "00ff" }));
    let response = receive(&mut stream);
    assert_eq!(response["status_code"], 8);
    assert_eq!(response["message"], "access denied");
    assert!(read_frame(&mut stream).unwrap().is_none());
    env.server.stop();
}

#[test]
fn rest_round_trip_with_token() {
    let env = start_server();

    // Provision a database and a token over SQL first.
    let mut sql = sql_login(&env);
    let responses = run_sql(
        &mut sql,
        1,
        "CREATE DATABASE restdb; \
         CREATE TABLE restdb.items (name TEXT, qty BIGINT); \
         ALTER USER root ADD TOKEN api x'a1b2c3'",
    );
    for response in &responses {
        assert_eq!(response["status_code"], 0, "{:?}", response);
    }

    let mut rest = TcpStream::connect(env.server.rest_addr()).unwrap();
    let auth = json!({ "user": "root", "token": "a1b2c3" });

    // POST two rows.
    send(
        &mut rest,
        &json!({
            "request_id": 1, "user": auth["user"], "token": auth["token"],
            "method": "post_rows", "database": "restdb", "table": "items",
            "payload": r#"[{"name": "bolt", "qty": 7}, {"name": "nut", "qty": 9}]"#,
        }),
    );
    let response = receive(&mut rest);
    assert_eq!(response["status_code"], 0, "{:?}", response);
    assert_eq!(response["trids"], json!([1, 2]));

    // GET them back; the TRID column comes first.
    send(
        &mut rest,
        &json!({
            "request_id": 2, "user": auth["user"], "token": auth["token"],
            "method": "get_all_rows", "database": "restdb", "table": "items",
        }),
    );
    let response = receive(&mut rest);
    assert_eq!(response["column_names"], json!(["TRID", "NAME", "QTY"]));
    assert_eq!(response["rows"], json!([[1, "bolt", 7], [2, "nut", 9]]));

    // PATCH one column of row 1, then read it alone.
    send(
        &mut rest,
        &json!({
            "request_id": 3, "user": auth["user"], "token": auth["token"],
            "method": "patch_row", "database": "restdb", "table": "items",
            "trid": 1, "payload": r#"[{"qty": 8}]"#,
        }),
    );
    assert_eq!(receive(&mut rest)["status_code"], 0);
    send(
        &mut rest,
        &json!({
            "request_id": 4, "user": auth["user"], "token": auth["token"],
            "method": "get_single_row", "database": "restdb", "table": "items", "trid": 1,
        }),
    );
    assert_eq!(receive(&mut rest)["rows"], json!([[1, "bolt", 8]]));

    // DELETE row 2: a later single-row read returns no rows, no error.
    send(
        &mut rest,
        &json!({
            "request_id": 5, "user": auth["user"], "token": auth["token"],
            "method": "delete_row", "database": "restdb", "table": "items", "trid": 2,
        }),
    );
    assert_eq!(receive(&mut rest)["status_code"], 0);
    send(
        &mut rest,
        &json!({
            "request_id": 6, "user": auth["user"], "token": auth["token"],
            "method": "get_single_row", "database": "restdb", "table": "items", "trid": 2,
        }),
    );
    let response = receive(&mut rest);
    assert_eq!(response["status_code"], 0);
    assert_eq!(response.get("rows"), None);

    // Wrong token: uniformly denied.
    send(
        &mut rest,
        &json!({
            "request_id": 7, "user": "root", "token": "ffff",
            "method": "get_databases",
        }),
    );
    let response = receive(&mut rest);
    assert_eq!(response["status_code"], 8);

    env.server.stop();
}

#[test]
fn instance_survives_server_restart() {
    let dir = tempfile::tempdir().unwrap();
    let signing_key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
    let key_file = dir.path().join("master.key");
    std::fs::write(&key_file, [0xefu8; 16]).unwrap();
    let config_for = |data_dir: &Path| InstanceConfig {
        instance: "test".into(),
        data_dir: data_dir.to_path_buf(),
        sql_listen_addr: Some("127.0.0.1:0".into()),
        rest_listen_addr: Some("127.0.0.1:0".into()),
        worker_threads: Some(1),
        master_cipher_id: Some("aes128".into()),
        master_key_file: key_file.clone(),
        superuser_initial_access_key: hex::encode(signing_key.verifying_key().to_bytes()),
        data_area_size: Some(64 * 1024),
        log_dir: None,
        log_level: None,
        rest_max_rows: Some(100),
        rest_max_payload: Some(64 * 1024),
    };
    let config = config_for(&dir.path().join("data"));

    {
        let server = Server::start(&config).unwrap();
        let env = TestEnv {
            server,
            signing_key: signing_key.clone(),
            _dir: tempfile::tempdir().unwrap(),
        };
        let mut sql = sql_login(&env);
        let responses = run_sql(
            &mut sql,
            1,
            "CREATE DATABASE keep; \
             CREATE TABLE keep.facts (fact TEXT); \
             INSERT INTO keep.facts VALUES ('durable')",
        );
        for response in &responses {
            assert_eq!(response["status_code"], 0, "{:?}", response);
        }
        drop(sql);
        env.server.stop();
    }
    // Let the connection thread release its instance handle (and with it
    // the data directory lock) before reopening.
    std::thread::sleep(std::time::Duration::from_millis(300));

    let server = Server::start(&config).unwrap();
    let env = TestEnv { server, signing_key, _dir: tempfile::tempdir().unwrap() };
    let mut sql = sql_login(&env);
    let responses = run_sql(&mut sql, 1, "SELECT fact FROM keep.facts");
    assert_eq!(responses[0]["rows"], json!([["durable"]]));
    env.server.stop();
}
