//! Drives the engine through the statement translator and request handler,
//! the same path the SQL connection handler uses.

use std::path::Path;
use std::sync::Arc;

use strata::crypto::CipherRegistry;
use strata::handler::RequestHandler;
use strata::instance::{Instance, InstanceOptions, SUPER_USER_ID};
use strata::request::Response;
use strata::row::Variant;

use strata_server::ast::parse_statements;

fn new_instance(data_dir: &Path) -> Arc<Instance> {
    let signing_key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
    let options = InstanceOptions {
        data_dir: data_dir.to_path_buf(),
        master_cipher_id: "aes128".into(),
        master_key: vec![0xef; 16],
        superuser_initial_access_key: hex::encode(signing_key.verifying_key().to_bytes()),
        data_area_size: 64 * 1024,
    };
    Arc::new(
        Instance::open_or_create(options, Arc::new(CipherRegistry::with_builtin_ciphers()))
            .unwrap(),
    )
}

fn run(handler: &RequestHandler, sql: &str) -> Vec<Response> {
    parse_statements(sql)
        .unwrap()
        .iter()
        .map(|request| handler.execute(request))
        .collect()
}

fn run_one(handler: &RequestHandler, sql: &str) -> Response {
    let mut responses = run(handler, sql);
    assert_eq!(responses.len(), 1, "expected exactly one statement in {:?}", sql);
    responses.pop().unwrap()
}

#[test]
fn full_row_lifecycle_through_sql() {
    let dir = tempfile::tempdir().unwrap();
    let instance = new_instance(dir.path());
    let handler = RequestHandler::new(instance, SUPER_USER_ID);

    for response in run(
        &handler,
        "CREATE DATABASE appdb; \
         USE DATABASE appdb; \
         CREATE TABLE customers (name TEXT, balance BIGINT);",
    ) {
        assert_eq!(response.status_code, 0, "{:?}", response.message);
    }

    // INSERT, then UPDATE one column; versions resolve to the latest.
    let response =
        run_one(&handler, "INSERT INTO customers VALUES ('hello', 42)");
    assert_eq!(response.status_code, 0);
    assert_eq!(response.trids, vec![1]);

    let response = run_one(&handler, "UPDATE customers SET balance = 43 WHERE trid = 1");
    assert_eq!(response.affected_row_count, 1);

    let response = run_one(&handler, "SELECT name, balance FROM customers");
    assert_eq!(response.column_names, vec!["NAME".to_string(), "BALANCE".to_string()]);
    assert_eq!(
        response.rows,
        vec![vec![Variant::Text("hello".into()), Variant::Int64(43)]]
    );

    // DELETE tombstones the row: reads find nothing, no error.
    let response = run_one(&handler, "DELETE FROM customers WHERE name = 'hello'");
    assert_eq!(response.status_code, 0);
    assert_eq!(response.affected_row_count, 1);
    let response = run_one(&handler, "SELECT * FROM customers WHERE trid = 1");
    assert_eq!(response.status_code, 0);
    assert!(response.rows.is_empty());
}

#[test]
fn statement_errors_do_not_end_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let instance = new_instance(dir.path());
    let handler = RequestHandler::new(instance, SUPER_USER_ID);

    let response = run_one(&handler, "SELECT * FROM missing_table");
    assert_ne!(response.status_code, 0);
    assert!(response.message.unwrap().contains("MISSING_TABLE"));

    // The handler keeps working after the failure.
    let response = run_one(&handler, "SHOW DATABASES");
    assert_eq!(response.status_code, 0);
    assert_eq!(response.rows, vec![vec![Variant::Text("SYS".into())]]);
}

#[test]
fn permissions_are_enforced_through_requests() {
    let dir = tempfile::tempdir().unwrap();
    let instance = new_instance(dir.path());
    let root = RequestHandler::new(instance.clone(), SUPER_USER_ID);

    for response in run(
        &root,
        "CREATE DATABASE appdb; \
         CREATE TABLE appdb.events (kind TEXT); \
         CREATE USER alice; \
         GRANT SELECT ON appdb.events TO alice; \
         INSERT INTO appdb.events VALUES ('boot')",
    ) {
        assert_eq!(response.status_code, 0, "{:?}", response.message);
    }

    let alice_id = instance.find_user_checked("ALICE").unwrap();
    let alice = RequestHandler::new(instance, alice_id);

    let response = run_one(&alice, "SELECT kind FROM appdb.events");
    assert_eq!(response.status_code, 0);
    assert_eq!(response.rows, vec![vec![Variant::Text("boot".into())]]);

    // Writes were not granted.
    let response = run_one(&alice, "INSERT INTO appdb.events VALUES ('no')");
    assert_eq!(response.status_code, 4);

    let response = run_one(&alice, "CREATE DATABASE mine");
    assert_eq!(response.status_code, 4);
}

#[test]
fn multi_row_and_partial_column_inserts() {
    let dir = tempfile::tempdir().unwrap();
    let instance = new_instance(dir.path());
    let handler = RequestHandler::new(instance, SUPER_USER_ID);

    run(
        &handler,
        "CREATE DATABASE d; USE d; CREATE TABLE t (a TEXT, b BIGINT, c DOUBLE)",
    );
    let response = run_one(&handler, "INSERT INTO t (b, a) VALUES (1, 'x'), (2, 'y')");
    assert_eq!(response.status_code, 0);
    assert_eq!(response.trids, vec![1, 2]);

    let response = run_one(&handler, "SELECT a, b, c FROM t WHERE b = 2");
    // The unspecified column reads back as NULL.
    assert_eq!(
        response.rows,
        vec![vec![Variant::Text("y".into()), Variant::Int64(2), Variant::Null]]
    );

    let response = run_one(&handler, "INSERT INTO t (a, a) VALUES ('x', 'y')");
    assert_eq!(response.status_code, 9);
}

#[test]
fn describe_and_show_tables() {
    let dir = tempfile::tempdir().unwrap();
    let instance = new_instance(dir.path());
    let handler = RequestHandler::new(instance, SUPER_USER_ID);

    run(&handler, "CREATE DATABASE d; USE d; CREATE TABLE t (a TEXT, b BIGINT)");
    let response = run_one(&handler, "SHOW TABLES");
    assert_eq!(response.rows, vec![vec![Variant::Text("T".into())]]);

    let response = run_one(&handler, "DESCRIBE t");
    assert_eq!(
        response.rows,
        vec![
            vec![Variant::Text("A".into()), Variant::Text("TEXT".into())],
            vec![Variant::Text("B".into()), Variant::Text("BIGINT".into())],
        ]
    );
}
