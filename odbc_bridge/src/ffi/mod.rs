// Allow FFI functions to dereference raw pointers without being marked unsafe
// This is expected and safe for extern "C" FFI boundaries
#![allow(clippy::not_unsafe_ptr_arg_deref)]

use crate::async_bridge::{Callback, JobResult};
use crate::cli::CatalogFilter;
use crate::engine::{
    CloseOption, Connection, Environment, ExecuteOutput, IsolationLevel, QueryOutput,
    QueryRequest, ResultSet, Statement,
};
use crate::error::{OdbcError, Result};
use crate::protocol::ParamValue;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int, c_uint};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// Completion callback: `error_json` is null on success, `result_json` is
/// null when the operation produces nothing. Both strings are only valid
/// for the duration of the call.
pub type OdbcCallback =
    extern "C" fn(user_data: *mut c_void, error_json: *const c_char, result_json: *const c_char);

struct GlobalState {
    env: Option<Arc<Environment>>,
    connections: HashMap<u32, Arc<Connection>>,
    statements: HashMap<u32, Arc<Statement>>,
    results: HashMap<u32, Arc<ResultSet>>,
    next_result_id: u32,
    last_error: Option<String>,
}

static GLOBAL_STATE: OnceLock<Mutex<GlobalState>> = OnceLock::new();

fn get_global_state() -> &'static Mutex<GlobalState> {
    GLOBAL_STATE.get_or_init(|| {
        Mutex::new(GlobalState {
            env: None,
            connections: HashMap::new(),
            statements: HashMap::new(),
            results: HashMap::new(),
            next_result_id: 1,
            last_error: None,
        })
    })
}

/// Helper to safely lock global state mutex.
/// Returns None if mutex is poisoned, avoiding panic in FFI.
fn try_lock_global_state() -> Option<MutexGuard<'static, GlobalState>> {
    get_global_state().lock().ok()
}

fn set_error(error: &OdbcError) {
    log::debug!("FFI call failed: {}", error);
    if let Some(mut state) = try_lock_global_state() {
        state.last_error = Some(error.to_json().to_string());
    }
}

/// Records `result`'s error and maps it to the C status convention.
fn status<T>(result: Result<T>) -> c_int {
    match result {
        Ok(_) => 0,
        Err(e) => {
            set_error(&e);
            -1
        }
    }
}

/// Installs an already built environment. Used by tests that run the C ABI
/// over a scripted CLI. Returns false when one is installed already.
#[cfg(any(test, feature = "test-helpers"))]
pub fn install_environment(env: Environment) -> bool {
    let Some(mut state) = try_lock_global_state() else {
        return false;
    };
    if state.env.is_some() {
        return false;
    }
    state.env = Some(Arc::new(env));
    true
}

fn environment() -> Result<Arc<Environment>> {
    let state = try_lock_global_state()
        .ok_or_else(|| OdbcError::InternalError("Failed to lock global state mutex".to_string()))?;
    state
        .env
        .clone()
        .ok_or_else(|| OdbcError::Usage("Environment not initialized".to_string()))
}

fn connection(conn_id: c_uint) -> Result<Arc<Connection>> {
    let state = try_lock_global_state()
        .ok_or_else(|| OdbcError::InternalError("Failed to lock global state mutex".to_string()))?;
    state
        .connections
        .get(&conn_id)
        .cloned()
        .ok_or(OdbcError::InvalidHandle(conn_id))
}

fn statement(stmt_id: c_uint) -> Result<Arc<Statement>> {
    let state = try_lock_global_state()
        .ok_or_else(|| OdbcError::InternalError("Failed to lock global state mutex".to_string()))?;
    state
        .statements
        .get(&stmt_id)
        .cloned()
        .ok_or(OdbcError::InvalidHandle(stmt_id))
}

fn c_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(OdbcError::Usage(format!("{} must not be null", what)));
    }
    // Safety: `ptr` must be a valid null-terminated C string pointer that
    // remains valid for the duration of this call
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| OdbcError::Usage(format!("{} must be valid UTF-8", what)))
}

/// Nullable filter argument of the catalog functions.
fn optional_c_str(ptr: *const c_char, what: &str) -> Result<Option<String>> {
    if ptr.is_null() {
        return Ok(None);
    }
    c_str(ptr, what).map(|s| Some(s.to_string()))
}

fn parse_json(ptr: *const c_char, what: &str) -> Result<Value> {
    serde_json::from_str(c_str(ptr, what)?)
        .map_err(|e| OdbcError::Usage(format!("{} is not valid JSON: {}", what, e)))
}

/// Copies `value` as JSON into the caller's buffer.
/// Returns 0 on success, -1 on error, -2 if buffer too small.
fn write_json(value: &Value, out_buf: *mut u8, buf_len: c_uint, out_written: *mut c_uint) -> c_int {
    if out_buf.is_null() || out_written.is_null() {
        set_error(&OdbcError::Usage("Output buffer must not be null".to_string()));
        return -1;
    }
    let data = value.to_string();
    if data.len() > buf_len as usize {
        set_error(&OdbcError::Usage(format!(
            "Output buffer too small: {} bytes needed, {} given",
            data.len(),
            buf_len
        )));
        return -2;
    }
    // Safety: `out_buf` must be valid for writes of `buf_len` bytes and
    // `out_written` valid for one c_uint
    unsafe {
        ptr::copy_nonoverlapping(data.as_ptr(), out_buf, data.len());
        *out_written = data.len() as c_uint;
    }
    0
}

fn sync_json<T>(
    result: Result<T>,
    encode: impl FnOnce(T) -> Value,
    out_buf: *mut u8,
    buf_len: c_uint,
    out_written: *mut c_uint,
) -> c_int {
    match result {
        Ok(value) => {
            let value = encode(value);
            let rc = write_json(&value, out_buf, buf_len, out_written);
            if rc != 0 {
                unregister_result(&value["result"]);
            }
            rc
        }
        Err(e) => {
            set_error(&e);
            -1
        }
    }
}

fn register_result(result: ResultSet) -> Value {
    let Some(mut state) = try_lock_global_state() else {
        log::error!("Failed to lock global state mutex; dropping result set");
        return Value::Null;
    };
    let id = state.next_result_id;
    state.next_result_id = state.next_result_id.wrapping_add(1).max(1);
    state.results.insert(id, Arc::new(result));
    json!(id)
}

/// Drops a result the host never received an id for.
fn unregister_result(id: &Value) {
    let Some(id) = id.as_u64().and_then(|id| u32::try_from(id).ok()) else {
        return;
    };
    let removed = try_lock_global_state().and_then(|mut state| state.results.remove(&id));
    drop(removed);
}

fn register_statement(stmt: Statement) -> Value {
    let id = stmt.id();
    match try_lock_global_state() {
        Some(mut state) => {
            state.statements.insert(id, Arc::new(stmt));
            json!(id)
        }
        None => {
            log::error!("Failed to lock global state mutex; dropping statement");
            Value::Null
        }
    }
}

fn encode_params(values: Option<Vec<ParamValue>>) -> Value {
    match values {
        Some(values) => Value::Array(values.iter().map(ParamValue::to_json).collect()),
        None => Value::Null,
    }
}

fn encode_query(output: QueryOutput) -> Value {
    json!({
        "result": output.result.map(register_result).unwrap_or(Value::Null),
        "outParams": encode_params(output.out_params),
    })
}

fn encode_execute(output: ExecuteOutput) -> Value {
    json!({
        "result": register_result(output.result),
        "outParams": encode_params(output.out_params),
    })
}

fn encode_unit(_: ()) -> Value {
    Value::Null
}

#[derive(Clone, Copy)]
struct UserData(usize);

fn deliver(callback: OdbcCallback, user_data: UserData, error: Option<Value>, result: Value) {
    let to_c = |value: &Value| CString::new(value.to_string()).ok();
    let error = error.as_ref().and_then(to_c);
    let result = if result.is_null() { None } else { to_c(&result) };
    callback(
        user_data.0 as *mut c_void,
        error.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
        result.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
    );
}

/// Adapts a C callback to a job callback. Outputs are encoded on the
/// completion thread; a failure's partial output is encoded too.
fn host_callback<T: Send + 'static>(
    callback: Option<OdbcCallback>,
    user_data: *mut c_void,
    encode: fn(T) -> Value,
) -> Option<Callback<T>> {
    let callback = callback?;
    let user_data = UserData(user_data as usize);
    Some(Box::new(move |result: JobResult<T>| match result {
        Ok(value) => deliver(callback, user_data, None, encode(value)),
        Err(failure) => {
            let partial = failure.partial.map(encode).unwrap_or(Value::Null);
            deliver(callback, user_data, Some(failure.error.to_json()), partial)
        }
    }))
}

/// Initialize the ODBC environment and the job dispatcher.
/// Returns: 0 on success, -1 on failure
#[no_mangle]
pub extern "C" fn odbc_bridge_init() -> c_int {
    log::debug!("odbc_bridge_init");
    if environment().is_ok() {
        return 0;
    }
    match Environment::new() {
        Ok(env) => {
            let Some(mut state) = try_lock_global_state() else {
                return -1;
            };
            if state.env.is_none() {
                state.env = Some(Arc::new(env));
            }
            0
        }
        Err(e) => {
            set_error(&e);
            -1
        }
    }
}

/// Allocate a disconnected connection.
/// Returns: connection ID (>0) on success, 0 on failure
#[no_mangle]
pub extern "C" fn odbc_connection_new() -> c_uint {
    let created = environment().and_then(|env| env.create_connection());
    match created {
        Ok(conn) => {
            let id = conn.id();
            let Some(mut state) = try_lock_global_state() else {
                return 0;
            };
            state.connections.insert(id, Arc::new(conn));
            id
        }
        Err(e) => {
            set_error(&e);
            0
        }
    }
}

/// Release a connection. Pending jobs keep it alive until they complete.
#[no_mangle]
pub extern "C" fn odbc_connection_free(conn_id: c_uint) -> c_int {
    let removed = try_lock_global_state().and_then(|mut state| state.connections.remove(&conn_id));
    match removed {
        Some(_) => 0,
        None => status::<()>(Err(OdbcError::InvalidHandle(conn_id))),
    }
}

/// Login timeout in seconds; out-of-range values select the default.
#[no_mangle]
pub extern "C" fn odbc_set_connect_timeout(conn_id: c_uint, timeout_secs: i64) -> c_int {
    status(connection(conn_id).and_then(|conn| conn.set_connect_timeout(timeout_secs)))
}

/// Returns: 1 when connected, 0 when not, -1 for an unknown connection
#[no_mangle]
pub extern "C" fn odbc_is_connected(conn_id: c_uint) -> c_int {
    match connection(conn_id) {
        Ok(conn) => conn.connected() as c_int,
        Err(e) => {
            set_error(&e);
            -1
        }
    }
}

/// Connect in the background.
/// Returns: 0 when scheduled, -1 on error (nothing is scheduled)
#[no_mangle]
pub extern "C" fn odbc_open(
    conn_id: c_uint,
    conn_str: *const c_char,
    callback: Option<OdbcCallback>,
    user_data: *mut c_void,
) -> c_int {
    status((|| {
        let conn = connection(conn_id)?;
        let conn_str = c_str(conn_str, "Connection string")?;
        conn.open(conn_str, host_callback(callback, user_data, encode_unit))
    })())
}

#[no_mangle]
pub extern "C" fn odbc_open_sync(conn_id: c_uint, conn_str: *const c_char) -> c_int {
    status((|| {
        let conn = connection(conn_id)?;
        conn.open_sync(c_str(conn_str, "Connection string")?)
    })())
}

#[no_mangle]
pub extern "C" fn odbc_close(
    conn_id: c_uint,
    callback: Option<OdbcCallback>,
    user_data: *mut c_void,
) -> c_int {
    status(
        connection(conn_id)
            .and_then(|conn| conn.close(host_callback(callback, user_data, encode_unit))),
    )
}

#[no_mangle]
pub extern "C" fn odbc_close_sync(conn_id: c_uint) -> c_int {
    status(connection(conn_id).and_then(|conn| conn.close_sync()))
}

/// The callback's result is `<statement id>`.
#[no_mangle]
pub extern "C" fn odbc_create_statement(
    conn_id: c_uint,
    callback: Option<OdbcCallback>,
    user_data: *mut c_void,
) -> c_int {
    status(connection(conn_id).and_then(|conn| {
        conn.create_statement(host_callback(callback, user_data, register_statement))
    }))
}

/// Returns: statement ID (>0) on success, 0 on failure
#[no_mangle]
pub extern "C" fn odbc_create_statement_sync(conn_id: c_uint) -> c_uint {
    match connection(conn_id).and_then(|conn| conn.create_statement_sync()) {
        Ok(stmt) => register_statement(stmt).as_u64().map_or(0, |id| id as c_uint),
        Err(e) => {
            set_error(&e);
            0
        }
    }
}

/// args_json: JSON array of the arguments preceding the callback:
/// `["sql"]`, `["sql", [params]]` or `[{"sql", "params", "noResults"}]`.
/// The callback's result is `{"result": id|null, "outParams": [..]|null}`.
#[no_mangle]
pub extern "C" fn odbc_query(
    conn_id: c_uint,
    args_json: *const c_char,
    callback: Option<OdbcCallback>,
    user_data: *mut c_void,
) -> c_int {
    status((|| {
        let conn = connection(conn_id)?;
        let request = query_request(args_json)?;
        conn.query(request, host_callback(callback, user_data, encode_query))
    })())
}

#[no_mangle]
pub extern "C" fn odbc_query_sync(
    conn_id: c_uint,
    args_json: *const c_char,
    out_buf: *mut u8,
    buf_len: c_uint,
    out_written: *mut c_uint,
) -> c_int {
    let result = (|| {
        let conn = connection(conn_id)?;
        conn.query_sync(query_request(args_json)?)
    })();
    sync_json(result, encode_query, out_buf, buf_len, out_written)
}

fn query_request(args_json: *const c_char) -> Result<QueryRequest> {
    match parse_json(args_json, "Query arguments")? {
        Value::Array(args) => QueryRequest::from_host_args(&args),
        _ => Err(OdbcError::Usage(
            "Query arguments must be a JSON array".to_string(),
        )),
    }
}

fn catalog_filter(
    catalog: *const c_char,
    schema: *const c_char,
    table: *const c_char,
    last: *const c_char,
) -> Result<CatalogFilter> {
    Ok(CatalogFilter {
        catalog: optional_c_str(catalog, "Catalog")?,
        schema: optional_c_str(schema, "Schema")?,
        table: optional_c_str(table, "Table")?,
        last: optional_c_str(last, "Argument 3")?,
    })
}

/// Null filters are unfiltered. The callback's result is `<result id>`.
#[no_mangle]
pub extern "C" fn odbc_tables(
    conn_id: c_uint,
    catalog: *const c_char,
    schema: *const c_char,
    table: *const c_char,
    table_type: *const c_char,
    callback: Option<OdbcCallback>,
    user_data: *mut c_void,
) -> c_int {
    status((|| {
        let conn = connection(conn_id)?;
        let filter = catalog_filter(catalog, schema, table, table_type)?;
        conn.tables(filter, host_callback(callback, user_data, register_result))
    })())
}

#[no_mangle]
pub extern "C" fn odbc_columns(
    conn_id: c_uint,
    catalog: *const c_char,
    schema: *const c_char,
    table: *const c_char,
    column: *const c_char,
    callback: Option<OdbcCallback>,
    user_data: *mut c_void,
) -> c_int {
    status((|| {
        let conn = connection(conn_id)?;
        let filter = catalog_filter(catalog, schema, table, column)?;
        conn.columns(filter, host_callback(callback, user_data, register_result))
    })())
}

#[no_mangle]
pub extern "C" fn odbc_begin_transaction(
    conn_id: c_uint,
    callback: Option<OdbcCallback>,
    user_data: *mut c_void,
) -> c_int {
    status(connection(conn_id).and_then(|conn| {
        conn.begin_transaction(host_callback(callback, user_data, encode_unit))
    }))
}

#[no_mangle]
pub extern "C" fn odbc_begin_transaction_sync(conn_id: c_uint) -> c_int {
    status(connection(conn_id).and_then(|conn| conn.begin_transaction_sync()))
}

/// rollback: non-zero rolls back, zero commits
#[no_mangle]
pub extern "C" fn odbc_end_transaction(
    conn_id: c_uint,
    rollback: c_int,
    callback: Option<OdbcCallback>,
    user_data: *mut c_void,
) -> c_int {
    status(connection(conn_id).and_then(|conn| {
        conn.end_transaction(rollback != 0, host_callback(callback, user_data, encode_unit))
    }))
}

#[no_mangle]
pub extern "C" fn odbc_end_transaction_sync(conn_id: c_uint, rollback: c_int) -> c_int {
    status(connection(conn_id).and_then(|conn| conn.end_transaction_sync(rollback != 0)))
}

/// level: 0 selects READ COMMITTED, otherwise an `SQL_TXN_*` code
fn isolation_level(level: c_int) -> Result<Option<IsolationLevel>> {
    if level == 0 {
        return Ok(None);
    }
    IsolationLevel::from_odbc(i64::from(level)).map(Some)
}

#[no_mangle]
pub extern "C" fn odbc_set_isolation_level(
    conn_id: c_uint,
    level: c_int,
    callback: Option<OdbcCallback>,
    user_data: *mut c_void,
) -> c_int {
    status((|| {
        let conn = connection(conn_id)?;
        conn.set_isolation_level(
            isolation_level(level)?,
            host_callback(callback, user_data, Value::Bool),
        )
    })())
}

#[no_mangle]
pub extern "C" fn odbc_set_isolation_level_sync(conn_id: c_uint, level: c_int) -> c_int {
    status((|| {
        let conn = connection(conn_id)?;
        conn.set_isolation_level_sync(isolation_level(level)?)
    })())
}

/// The callback's result is `{"result": id, "outParams": [..]|null}`.
#[no_mangle]
pub extern "C" fn odbc_statement_execute(
    stmt_id: c_uint,
    callback: Option<OdbcCallback>,
    user_data: *mut c_void,
) -> c_int {
    status(
        statement(stmt_id)
            .and_then(|stmt| stmt.execute(host_callback(callback, user_data, encode_execute))),
    )
}

#[no_mangle]
pub extern "C" fn odbc_statement_execute_sync(
    stmt_id: c_uint,
    out_buf: *mut u8,
    buf_len: c_uint,
    out_written: *mut c_uint,
) -> c_int {
    let result = statement(stmt_id).and_then(|stmt| stmt.execute_sync());
    sync_json(result, encode_execute, out_buf, buf_len, out_written)
}

#[no_mangle]
pub extern "C" fn odbc_statement_execute_direct(
    stmt_id: c_uint,
    sql: *const c_char,
    callback: Option<OdbcCallback>,
    user_data: *mut c_void,
) -> c_int {
    status((|| {
        let stmt = statement(stmt_id)?;
        let sql = c_str(sql, "SQL")?;
        stmt.execute_direct(sql, host_callback(callback, user_data, register_result))
    })())
}

/// The callback's result is the affected row count.
#[no_mangle]
pub extern "C" fn odbc_statement_execute_non_query(
    stmt_id: c_uint,
    callback: Option<OdbcCallback>,
    user_data: *mut c_void,
) -> c_int {
    status(statement(stmt_id).and_then(|stmt| {
        stmt.execute_non_query(host_callback(callback, user_data, |rows: i64| json!(rows)))
    }))
}

#[no_mangle]
pub extern "C" fn odbc_statement_execute_non_query_sync(stmt_id: c_uint, out_rows: *mut i64) -> c_int {
    if out_rows.is_null() {
        return -1;
    }
    match statement(stmt_id).and_then(|stmt| stmt.execute_non_query_sync()) {
        Ok(rows) => {
            // Safety: `out_rows` is non-null and must be valid for one i64
            unsafe { *out_rows = rows };
            0
        }
        Err(e) => {
            set_error(&e);
            -1
        }
    }
}

#[no_mangle]
pub extern "C" fn odbc_statement_prepare(
    stmt_id: c_uint,
    sql: *const c_char,
    callback: Option<OdbcCallback>,
    user_data: *mut c_void,
) -> c_int {
    status((|| {
        let stmt = statement(stmt_id)?;
        let sql = c_str(sql, "SQL")?;
        stmt.prepare(sql, host_callback(callback, user_data, Value::Bool))
    })())
}

#[no_mangle]
pub extern "C" fn odbc_statement_prepare_sync(stmt_id: c_uint, sql: *const c_char) -> c_int {
    status((|| {
        let stmt = statement(stmt_id)?;
        stmt.prepare_sync(c_str(sql, "SQL")?)
    })())
}

/// params_json: JSON array of scalars or
/// `{"ParamType", "DataType", "Data", "Length"}` objects
#[no_mangle]
pub extern "C" fn odbc_statement_bind(
    stmt_id: c_uint,
    params_json: *const c_char,
    callback: Option<OdbcCallback>,
    user_data: *mut c_void,
) -> c_int {
    status((|| {
        let stmt = statement(stmt_id)?;
        let params = parse_json(params_json, "Parameters")?;
        stmt.bind_host(&params, host_callback(callback, user_data, Value::Bool))
    })())
}

#[no_mangle]
pub extern "C" fn odbc_statement_bind_sync(stmt_id: c_uint, params_json: *const c_char) -> c_int {
    status((|| {
        let stmt = statement(stmt_id)?;
        stmt.bind_host_sync(&parse_json(params_json, "Parameters")?)
    })())
}

/// option: 0 close cursor, 1 destroy, 2 unbind, 3 reset parameters
#[no_mangle]
pub extern "C" fn odbc_statement_close_sync(stmt_id: c_uint, option: c_int) -> c_int {
    status((|| {
        let stmt = statement(stmt_id)?;
        stmt.close_sync(CloseOption::from_code(i64::from(option))?)
    })())
}

#[no_mangle]
pub extern "C" fn odbc_statement_free(stmt_id: c_uint) -> c_int {
    let removed = try_lock_global_state().and_then(|mut state| state.statements.remove(&stmt_id));
    match removed {
        Some(_) => 0,
        None => status::<()>(Err(OdbcError::InvalidHandle(stmt_id))),
    }
}

#[no_mangle]
pub extern "C" fn odbc_result_row_count(result_id: c_uint, out_rows: *mut i64) -> c_int {
    if out_rows.is_null() {
        return -1;
    }
    let Some(state) = try_lock_global_state() else {
        return -1;
    };
    let result = state.results.get(&result_id).cloned();
    drop(state);
    let counted = result
        .ok_or(OdbcError::InvalidHandle(result_id))
        .and_then(|result| result.row_count());
    match counted {
        Ok(rows) => {
            // Safety: `out_rows` is non-null and must be valid for one i64
            unsafe { *out_rows = rows };
            0
        }
        Err(e) => {
            set_error(&e);
            -1
        }
    }
}

#[no_mangle]
pub extern "C" fn odbc_result_free(result_id: c_uint) -> c_int {
    let removed = try_lock_global_state().and_then(|mut state| state.results.remove(&result_id));
    match removed {
        Some(_) => 0,
        None => status::<()>(Err(OdbcError::InvalidHandle(result_id))),
    }
}

/// Copies the last error, as JSON, into `buffer` (NUL-terminated,
/// truncated to fit).
/// Returns: bytes written excluding the terminator, -1 on failure
#[no_mangle]
pub extern "C" fn odbc_get_error(buffer: *mut c_char, buffer_len: c_uint) -> c_int {
    if buffer.is_null() || buffer_len == 0 {
        return -1;
    }

    let Some(state) = try_lock_global_state() else {
        return -1;
    };

    let error_msg = state
        .last_error
        .clone()
        .unwrap_or_else(|| "No error".to_string());
    let msg_bytes = error_msg.as_bytes();
    let copy_len = (msg_bytes.len() as c_uint).min(buffer_len - 1);

    // Safety: `buffer` must be valid for writes of `copy_len + 1` bytes
    // Caller ensures buffer is large enough (buffer_len > 0 verified above)
    unsafe {
        ptr::copy_nonoverlapping(msg_bytes.as_ptr(), buffer as *mut u8, copy_len as usize);
        *buffer.add(copy_len as usize) = 0;
    }

    copy_len as c_int
}
