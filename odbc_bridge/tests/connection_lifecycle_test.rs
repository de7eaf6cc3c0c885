use odbc_bridge::cli::fake::FakeOp;
use odbc_bridge::cli::HandleKind;
use odbc_bridge::{JobResult, OdbcError};
use std::sync::mpsc;
use std::time::Duration;

mod helpers;
use helpers::{fake_environment, open_fake_connection};

#[test]
fn test_connect_timeout_out_of_range_uses_default() {
    let (_fake, env) = fake_environment();
    let conn = env.create_connection().unwrap();

    conn.set_connect_timeout(10).unwrap();
    assert_eq!(conn.connect_timeout(), 10);
    conn.set_connect_timeout(-1).unwrap();
    assert_eq!(conn.connect_timeout(), 30);
    conn.set_connect_timeout(40_000).unwrap();
    assert_eq!(conn.connect_timeout(), 30);
    conn.set_connect_timeout(32_767).unwrap();
    assert_eq!(conn.connect_timeout(), 32_767);
}

#[test]
fn test_open_close_round_trip() {
    let (fake, env) = fake_environment();
    let conn = env.create_connection().unwrap();
    assert!(!conn.connected());

    let (tx, rx) = mpsc::channel();
    conn.open(
        "DSN=fake;PWD=secret",
        Some(Box::new(move |r: JobResult<()>| tx.send(r.is_ok()).unwrap())),
    )
    .unwrap();
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    assert!(conn.connected());
    assert_eq!(fake.connection_strings(), vec!["DSN=fake;PWD=secret"]);

    conn.close_sync().unwrap();
    assert!(!conn.connected());
    assert_eq!(fake.live_handles(HandleKind::Dbc), 0);
}

#[test]
fn test_close_twice_frees_once() {
    let (fake, _env, conn) = open_fake_connection();
    conn.close_sync().unwrap();
    conn.close_sync().unwrap();
    drop(conn);

    assert_eq!(fake.frees(HandleKind::Dbc), 1);
    assert_eq!(fake.double_frees(), 0);
}

#[test]
fn test_open_after_close_is_rejected() {
    let (_fake, _env, conn) = open_fake_connection();
    conn.close_sync().unwrap();

    match conn.open_sync("DSN=fake") {
        Err(OdbcError::HandleReleased(what)) => assert_eq!(what, "connection"),
        other => panic!("Expected HandleReleased, got {:?}", other),
    }
}

#[test]
fn test_failed_open_leaves_connection_usable() {
    let (fake, env) = fake_environment();
    let conn = env.create_connection().unwrap();
    fake.fail(FakeOp::DriverConnect, "08001", "Unable to connect");

    let err = conn.open_sync("DSN=down").unwrap_err();
    assert_eq!(err.sql_state(), Some("08001"));
    assert!(!conn.connected());

    conn.open_sync("DSN=up").unwrap();
    assert!(conn.connected());
}

#[test]
fn test_dropping_environment_handles_leaves_nothing_live() {
    let (fake, env) = fake_environment();
    {
        let conn = env.create_connection().unwrap();
        conn.open_sync("DSN=fake").unwrap();
        let stmt = conn.create_statement_sync().unwrap();
        assert_eq!(env.statement_count(), 1);
        drop(stmt);
    }
    drop(env);

    assert_eq!(fake.live_handles(HandleKind::Stmt), 0);
    assert_eq!(fake.live_handles(HandleKind::Dbc), 0);
    assert_eq!(fake.live_handles(HandleKind::Env), 0);
    assert_eq!(fake.double_frees(), 0);
}
