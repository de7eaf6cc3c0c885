//! Runs against a real driver when ODBC_TEST_DSN is set.

use odbc_bridge::{Environment, QueryRequest};

mod helpers;
use helpers::{get_test_dsn, init_logging};

#[test]
#[ignore]
fn test_e2e_query_and_transaction() {
    init_logging();
    let Some(dsn) = get_test_dsn() else {
        eprintln!("Skipping E2E test: set ODBC_TEST_DSN");
        return;
    };

    let env = Environment::new().expect("Failed to initialize ODBC environment");
    let conn = env.create_connection().expect("Failed to allocate connection");
    conn.set_connect_timeout(10).unwrap();
    conn.open_sync(&dsn).expect("Failed to connect");
    assert!(conn.connected());

    let output = conn
        .query_sync(QueryRequest::new("SELECT 1"))
        .expect("SELECT 1 failed");
    assert!(output.result.is_some());

    conn.begin_transaction_sync().unwrap();
    conn.end_transaction_sync(true).unwrap();

    let stmt = conn.create_statement_sync().unwrap();
    stmt.prepare_sync("SELECT ?").unwrap();
    stmt.bind_host_sync(&serde_json::json!([42])).unwrap();
    stmt.execute_sync().unwrap();
    drop(stmt);

    conn.close_sync().unwrap();
    assert!(!conn.connected());
}
