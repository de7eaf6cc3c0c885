use odbc_bridge::cli::fake::FakeOp;
use odbc_bridge::cli::HandleKind;
use odbc_bridge::protocol::sql_type;
use odbc_bridge::{JobResult, OdbcError, Param, ParamValue, QueryOutput, QueryRequest};
use serde_json::json;
use std::sync::mpsc;
use std::time::Duration;

mod helpers;
use helpers::open_fake_connection;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_host_argument_shapes() {
    let (fake, _env, conn) = open_fake_connection();

    let plain = QueryRequest::from_host_args(&[json!("SELECT 1")]).unwrap();
    let with_params =
        QueryRequest::from_host_args(&[json!("SELECT ?"), json!([7])]).unwrap();
    let options = QueryRequest::from_host_args(&[json!({
        "sql": "UPDATE t SET a = ?",
        "params": ["x"],
        "noResults": true,
    })])
    .unwrap();

    assert!(conn.query_sync(plain).unwrap().result.is_some());
    assert!(conn.query_sync(with_params).unwrap().result.is_some());
    let output = conn.query_sync(options).unwrap();
    assert!(output.result.is_none());
    assert!(fake
        .calls()
        .contains(&"SQLPrepare(UPDATE t SET a = ?)".to_string()));
}

#[test]
fn test_non_array_params_rejected() {
    match QueryRequest::from_host_args(&[json!("SELECT ?"), json!({ "a": 1 })]) {
        Err(OdbcError::Usage(msg)) => assert_eq!(msg, "Argument 1 must be an Array"),
        other => panic!("Expected usage error, got {:?}", other),
    }
}

#[test]
fn test_empty_params_prepare_and_execute() {
    let (fake, _env, conn) = open_fake_connection();
    conn.query_sync(QueryRequest::new("SELECT 1").with_params(vec![]))
        .unwrap();

    let calls = fake.calls();
    assert!(calls.contains(&"SQLPrepare(SELECT 1)".to_string()));
    assert!(!calls.iter().any(|c| c.starts_with("SQLBindParameter")));
    assert!(calls.contains(&"SQLExecute".to_string()));
}

#[test]
fn test_no_results_releases_statement() {
    let (fake, _env, conn) = open_fake_connection();
    let (tx, rx) = mpsc::channel();
    let observer = fake.clone();

    conn.query(
        QueryRequest::new("DELETE FROM t").no_results(true),
        Some(Box::new(move |r: JobResult<QueryOutput>| {
            let output = r.unwrap();
            tx.send((output.result.is_none(), observer.live_handles(HandleKind::Stmt)))
                .unwrap();
        })),
    )
    .unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (true, 0));
}

#[test]
fn test_procedure_output_parameters() {
    let (fake, _env, conn) = open_fake_connection();
    fake.set_outputs(vec![ParamValue::Integer(10), ParamValue::Integer(20)]);

    let output = conn
        .query_sync(QueryRequest::new("{CALL two_outputs(?, ?, ?)}").with_params(vec![
            Param::output(sql_type::INTEGER),
            Param::input(1),
            Param::input_output(5, sql_type::INTEGER),
        ]))
        .unwrap();

    assert_eq!(
        output.out_params,
        Some(vec![ParamValue::Integer(10), ParamValue::Integer(20)])
    );
}

#[test]
fn test_input_only_params_have_no_outputs() {
    let (_fake, _env, conn) = open_fake_connection();
    let output = conn
        .query_sync(QueryRequest::new("SELECT ?").with_params(vec![Param::input("a")]))
        .unwrap();
    assert!(output.out_params.is_none());
}

#[test]
fn test_driver_error_carries_diagnostic() {
    let (fake, _env, conn) = open_fake_connection();
    fake.fail(FakeOp::ExecDirect, "42S02", "Invalid object name 'missing'");

    let err = conn.query_sync("SELECT * FROM missing").unwrap_err();
    assert_eq!(err.sql_state(), Some("42S02"));
    let json = err.to_json();
    assert_eq!(json["state"], "42S02");
    assert!(json["message"]
        .as_str()
        .unwrap()
        .contains("Invalid object name"));
    assert_eq!(fake.live_handles(HandleKind::Stmt), 0);
}

#[test]
fn test_end_transaction_reports_first_failure() {
    let (fake, _env, conn) = open_fake_connection();
    conn.begin_transaction_sync().unwrap();
    fake.fail(FakeOp::EndTran, "40001", "Serialization failure");
    fake.fail(FakeOp::SetConnectAttr, "HY011", "Attribute cannot be set now");

    let err = conn.end_transaction_sync(false).unwrap_err();
    assert_eq!(err.sql_state(), Some("40001"));
}
