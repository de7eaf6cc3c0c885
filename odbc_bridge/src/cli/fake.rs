//! Scripted in-memory CLI used by tests.
//!
//! Handles are plain counters. Every call is appended to a log, failures
//! can be queued per call kind, and output parameters bound on a statement
//! receive scripted values when it executes, the same way a driver writes
//! into deferred buffers.

use super::{
    succeeded, CatalogFilter, Cli, CompletionType, ConnectAttr, FreeStmtOption, HandleKind,
    RawHandle, SqlReturn,
};
use crate::error::ErrorState;
use crate::protocol::{CType, ParamDirection, ParamValue, ParameterBinding, NULL_DATA};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    AllocHandle,
    FreeHandle,
    SetEnvAttr,
    SetConnectAttr,
    DriverConnect,
    Disconnect,
    Prepare,
    Execute,
    ExecDirect,
    BindParameter,
    FreeStmt,
    RowCount,
    Tables,
    Columns,
    EndTran,
    DiagNumber,
    DiagRecord,
}

struct Injected {
    rc: SqlReturn,
    diag: Option<ErrorState>,
}

struct FakeBinding {
    number: u16,
    direction: ParamDirection,
    c_type: CType,
    value_ptr: usize,
    buffer_len: isize,
    indicator_ptr: usize,
}

struct FakeState {
    next_handle: usize,
    live: HashMap<usize, HandleKind>,
    allocs: HashMap<HandleKind, usize>,
    frees: HashMap<HandleKind, usize>,
    double_frees: usize,
    diags: HashMap<usize, Vec<ErrorState>>,
    scripted: HashMap<FakeOp, VecDeque<Injected>>,
    bind_failures: HashMap<u16, ErrorState>,
    bindings: HashMap<usize, Vec<FakeBinding>>,
    outputs: VecDeque<ParamValue>,
    row_count: i64,
    more_results: bool,
    delay: Option<Duration>,
    calls: Vec<String>,
    connect_attrs: Vec<ConnectAttr>,
    connection_strings: Vec<String>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            next_handle: 0x1000,
            live: HashMap::new(),
            allocs: HashMap::new(),
            frees: HashMap::new(),
            double_frees: 0,
            diags: HashMap::new(),
            scripted: HashMap::new(),
            bind_failures: HashMap::new(),
            bindings: HashMap::new(),
            outputs: VecDeque::new(),
            row_count: 0,
            more_results: true,
            delay: None,
            calls: Vec::new(),
            connect_attrs: Vec::new(),
            connection_strings: Vec::new(),
        }
    }
}

impl FakeState {
    /// Starts a call on `handle`: logs it, clears the handle's diagnostics
    /// and applies any queued result for `op`.
    fn begin(&mut self, op: FakeOp, handle: RawHandle, call: String) -> SqlReturn {
        self.calls.push(call);
        self.diags.remove(&handle.0);
        if !handle.is_null() && !self.live.contains_key(&handle.0) {
            return SqlReturn::INVALID_HANDLE;
        }
        match self.scripted.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(injected) => {
                if let Some(diag) = injected.diag {
                    self.diags.entry(handle.0).or_default().push(diag);
                }
                injected.rc
            }
            None => SqlReturn::SUCCESS,
        }
    }

    fn write_outputs(&mut self, stmt: RawHandle) {
        let Some(bindings) = self.bindings.get(&stmt.0) else {
            return;
        };
        for binding in bindings.iter().filter(|b| b.direction.has_output()) {
            match self.outputs.pop_front() {
                Some(value) => write_output(binding, &value),
                None => break,
            }
        }
    }
}

fn write_output(binding: &FakeBinding, value: &ParamValue) {
    let value_ptr = binding.value_ptr as *mut u8;
    let indicator = binding.indicator_ptr as *mut isize;
    let capacity = binding.buffer_len.max(0) as usize;

    let bytes: Vec<u8> = match (binding.c_type, value) {
        (_, ParamValue::Null) => {
            // Safety: the indicator belongs to a live bound parameter.
            unsafe { *indicator = NULL_DATA };
            return;
        }
        (CType::SBigInt, ParamValue::Integer(n)) => i64::from(*n).to_ne_bytes().to_vec(),
        (CType::SBigInt, ParamValue::BigInt(n)) => n.to_ne_bytes().to_vec(),
        (CType::Double, ParamValue::Double(f)) => f.to_ne_bytes().to_vec(),
        (CType::Bit, ParamValue::Boolean(b)) => vec![*b as u8],
        (_, ParamValue::Binary(b)) => b.clone(),
        (_, other) => match other.to_json() {
            serde_json::Value::String(s) => s.into_bytes(),
            v => v.to_string().into_bytes(),
        },
    };

    let room = match binding.c_type {
        CType::Char => capacity.saturating_sub(1),
        _ => capacity,
    };
    let n = bytes.len().min(room);
    // Safety: value_ptr points at `capacity` writable bytes owned by the
    // bound parameter, which outlives the execute call.
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), value_ptr, n);
        if binding.c_type == CType::Char && n < capacity {
            *value_ptr.add(n) = 0;
        }
        *indicator = bytes.len() as isize;
    }
}

#[derive(Default)]
pub struct FakeCli {
    state: Mutex<FakeState>,
}

impl FakeCli {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next `op` call return ERROR with a diagnostic record.
    pub fn fail(&self, op: FakeOp, sql_state: &str, message: &str) {
        self.lock().scripted.entry(op).or_default().push_back(Injected {
            rc: SqlReturn::ERROR,
            diag: Some(ErrorState::new(sql_state, 0, message)),
        });
    }

    /// Makes the next `op` call return `rc` without diagnostics.
    pub fn script_return(&self, op: FakeOp, rc: SqlReturn) {
        self.lock()
            .scripted
            .entry(op)
            .or_default()
            .push_back(Injected { rc, diag: None });
    }

    /// Makes every bind at `ordinal` fail.
    pub fn fail_nth_bind(&self, ordinal: u16, sql_state: &str, message: &str) {
        self.lock()
            .bind_failures
            .insert(ordinal, ErrorState::new(sql_state, 0, message));
    }

    pub fn push_diagnostic(&self, handle: RawHandle, diag: ErrorState) {
        self.lock().diags.entry(handle.0).or_default().push(diag);
    }

    /// Values written, in order, into output-capable bindings on the next
    /// successful execute.
    pub fn set_outputs(&self, values: Vec<ParamValue>) {
        self.lock().outputs = values.into();
    }

    pub fn set_row_count(&self, rows: i64) {
        self.lock().row_count = rows;
    }

    pub fn set_more_results(&self, supported: bool) {
        self.lock().more_results = supported;
    }

    /// Slows connect and execute calls down.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn allocs(&self, kind: HandleKind) -> usize {
        self.lock().allocs.get(&kind).copied().unwrap_or(0)
    }

    pub fn frees(&self, kind: HandleKind) -> usize {
        self.lock().frees.get(&kind).copied().unwrap_or(0)
    }

    pub fn live_handles(&self, kind: HandleKind) -> usize {
        self.lock().live.values().filter(|k| **k == kind).count()
    }

    pub fn is_live(&self, handle: RawHandle) -> bool {
        self.lock().live.contains_key(&handle.0)
    }

    pub fn double_frees(&self) -> usize {
        self.lock().double_frees
    }

    pub fn bound_ordinals(&self, stmt: RawHandle) -> Vec<u16> {
        self.lock()
            .bindings
            .get(&stmt.0)
            .map(|b| b.iter().map(|b| b.number).collect())
            .unwrap_or_default()
    }

    pub fn connect_attrs(&self) -> Vec<ConnectAttr> {
        self.lock().connect_attrs.clone()
    }

    pub fn connection_strings(&self) -> Vec<String> {
        self.lock().connection_strings.clone()
    }

    fn pause(&self) {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
    }
}

impl Cli for FakeCli {
    fn alloc_handle(&self, kind: HandleKind, parent: RawHandle) -> Result<RawHandle, SqlReturn> {
        let mut state = self.lock();
        let rc = state.begin(FakeOp::AllocHandle, parent, format!("SQLAllocHandle({:?})", kind));
        if !succeeded(rc) {
            return Err(rc);
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.live.insert(handle, kind);
        *state.allocs.entry(kind).or_default() += 1;
        Ok(RawHandle(handle))
    }

    fn free_handle(&self, kind: HandleKind, handle: RawHandle) -> SqlReturn {
        let mut state = self.lock();
        state.calls.push(format!("SQLFreeHandle({:?})", kind));
        if state.live.remove(&handle.0).is_none() {
            state.double_frees += 1;
            return SqlReturn::INVALID_HANDLE;
        }
        state.diags.remove(&handle.0);
        state.bindings.remove(&handle.0);
        *state.frees.entry(kind).or_default() += 1;
        SqlReturn::SUCCESS
    }

    fn set_env_odbc_version(&self, env: RawHandle) -> SqlReturn {
        self.lock()
            .begin(FakeOp::SetEnvAttr, env, "SQLSetEnvAttr(OdbcVersion)".into())
    }

    fn set_connect_attr(&self, dbc: RawHandle, attr: ConnectAttr) -> SqlReturn {
        let mut state = self.lock();
        let rc = state.begin(
            FakeOp::SetConnectAttr,
            dbc,
            format!("SQLSetConnectAttr({:?})", attr),
        );
        if succeeded(rc) {
            state.connect_attrs.push(attr);
        }
        rc
    }

    fn driver_connect(&self, dbc: RawHandle, connection_string: &str) -> SqlReturn {
        self.pause();
        let mut state = self.lock();
        let rc = state.begin(FakeOp::DriverConnect, dbc, "SQLDriverConnect".into());
        if succeeded(rc) {
            state.connection_strings.push(connection_string.to_string());
        }
        rc
    }

    fn disconnect(&self, dbc: RawHandle) -> SqlReturn {
        self.lock()
            .begin(FakeOp::Disconnect, dbc, "SQLDisconnect".into())
    }

    fn prepare(&self, stmt: RawHandle, sql: &str) -> SqlReturn {
        self.lock()
            .begin(FakeOp::Prepare, stmt, format!("SQLPrepare({})", sql))
    }

    fn execute(&self, stmt: RawHandle) -> SqlReturn {
        self.pause();
        let mut state = self.lock();
        let rc = state.begin(FakeOp::Execute, stmt, "SQLExecute".into());
        if succeeded(rc) {
            state.write_outputs(stmt);
        }
        rc
    }

    fn exec_direct(&self, stmt: RawHandle, sql: &str) -> SqlReturn {
        self.pause();
        let mut state = self.lock();
        let rc = state.begin(FakeOp::ExecDirect, stmt, format!("SQLExecDirect({})", sql));
        if succeeded(rc) {
            state.write_outputs(stmt);
        }
        rc
    }

    fn bind_parameter(&self, stmt: RawHandle, binding: &ParameterBinding<'_>) -> SqlReturn {
        let mut state = self.lock();
        let rc = state.begin(
            FakeOp::BindParameter,
            stmt,
            format!("SQLBindParameter({})", binding.number),
        );
        if !succeeded(rc) {
            return rc;
        }
        if let Some(diag) = state.bind_failures.get(&binding.number).cloned() {
            state.diags.entry(stmt.0).or_default().push(diag);
            return SqlReturn::ERROR;
        }
        let bindings = state.bindings.entry(stmt.0).or_default();
        bindings.retain(|b| b.number != binding.number);
        bindings.push(FakeBinding {
            number: binding.number,
            direction: binding.direction,
            c_type: binding.c_type,
            value_ptr: binding.value_ptr as usize,
            buffer_len: binding.buffer_len,
            indicator_ptr: binding.indicator_ptr as usize,
        });
        rc
    }

    fn free_stmt(&self, stmt: RawHandle, option: FreeStmtOption) -> SqlReturn {
        let mut state = self.lock();
        let rc = state.begin(FakeOp::FreeStmt, stmt, format!("SQLFreeStmt({:?})", option));
        if succeeded(rc) && option == FreeStmtOption::ResetParams {
            state.bindings.remove(&stmt.0);
        }
        rc
    }

    fn row_count(&self, stmt: RawHandle) -> Result<i64, SqlReturn> {
        self.pause();
        let mut state = self.lock();
        let rc = state.begin(FakeOp::RowCount, stmt, "SQLRowCount".into());
        if succeeded(rc) {
            Ok(state.row_count)
        } else {
            Err(rc)
        }
    }

    fn tables(&self, stmt: RawHandle, filter: &CatalogFilter) -> SqlReturn {
        self.lock()
            .begin(FakeOp::Tables, stmt, format!("SQLTables({:?})", filter))
    }

    fn columns(&self, stmt: RawHandle, filter: &CatalogFilter) -> SqlReturn {
        self.lock()
            .begin(FakeOp::Columns, stmt, format!("SQLColumns({:?})", filter))
    }

    fn end_tran(&self, dbc: RawHandle, completion: CompletionType) -> SqlReturn {
        self.lock()
            .begin(FakeOp::EndTran, dbc, format!("SQLEndTran({:?})", completion))
    }

    fn diag_number(&self, _kind: HandleKind, handle: RawHandle) -> Result<i32, SqlReturn> {
        let mut state = self.lock();
        if let Some(injected) = state
            .scripted
            .get_mut(&FakeOp::DiagNumber)
            .and_then(VecDeque::pop_front)
        {
            return Err(injected.rc);
        }
        Ok(state.diags.get(&handle.0).map(|d| d.len()).unwrap_or(0) as i32)
    }

    fn diag_record(
        &self,
        _kind: HandleKind,
        handle: RawHandle,
        record: i16,
    ) -> Result<ErrorState, SqlReturn> {
        let mut state = self.lock();
        if let Some(injected) = state
            .scripted
            .get_mut(&FakeOp::DiagRecord)
            .and_then(VecDeque::pop_front)
        {
            return Err(injected.rc);
        }
        if record < 1 {
            return Err(SqlReturn::ERROR);
        }
        state
            .diags
            .get(&handle.0)
            .and_then(|d| d.get(record as usize - 1))
            .cloned()
            .ok_or(SqlReturn::NO_DATA)
    }

    fn more_results_supported(&self, _dbc: RawHandle) -> bool {
        self.lock().more_results
    }
}
