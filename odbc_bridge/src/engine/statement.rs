use super::driver_error;
use super::environment::Context;
use super::result_set::ResultSet;
use crate::async_bridge::{
    here, run_sync, submit, try_box, CallSite, Callback, Job, OperationKind,
};
use crate::cli::{is_hard_error, succeeded, Cli, FreeStmtOption, HandleKind, OwnedHandle, RawHandle};
use crate::config::EngineConfig;
use crate::error::{OdbcError, Result};
use crate::protocol::{Param, ParamValue, ParameterList};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};

struct StatementState {
    stmt: Option<OwnedHandle>,
    params: ParameterList,
    scratch: Option<Vec<u8>>,
}

impl StatementState {
    fn live(&self) -> Result<RawHandle> {
        self.stmt
            .as_ref()
            .map(OwnedHandle::raw)
            .ok_or(OdbcError::HandleReleased("statement"))
    }

    /// Unbinds, then frees, the parameter buffers so the driver holds no
    /// pointer into freed memory.
    fn reset_params(&mut self, cli: &dyn Cli) {
        if self.params.is_empty() {
            return;
        }
        if let Some(stmt) = &self.stmt {
            let rc = cli.free_stmt(stmt.raw(), FreeStmtOption::ResetParams);
            if !succeeded(rc) {
                log::debug!("SQLFreeStmt(ResetParams) returned {:?}", rc);
            }
        }
        self.params.free();
    }

    /// Parameters, then the CLI handle, then the scratch buffer. Repeating
    /// it is a no-op.
    fn release(&mut self) {
        self.params.free();
        if let Some(mut stmt) = self.stmt.take() {
            stmt.free();
        }
        self.scratch = None;
    }
}

/// Statement state shared between the [`Statement`] wrapper, its jobs and
/// the result sets it produced. The environment and connection handles are
/// borrowed: the statement does not keep them alive.
pub(crate) struct StatementCore {
    cli: Arc<dyn Cli>,
    env: RawHandle,
    dbc: RawHandle,
    state: Mutex<StatementState>,
    label: String,
    output_len: usize,
}

impl StatementCore {
    pub(crate) fn new(
        cli: Arc<dyn Cli>,
        env: RawHandle,
        dbc: RawHandle,
        stmt: OwnedHandle,
        config: &EngineConfig,
    ) -> Result<Self> {
        let mut scratch = Vec::new();
        scratch
            .try_reserve_exact(config.scratch_buffer_len)
            .map_err(|_| OdbcError::OutOfMemory { origin: here!() })?;
        scratch.resize(config.scratch_buffer_len, 0);

        Ok(Self {
            cli,
            env,
            dbc,
            state: Mutex::new(StatementState {
                stmt: Some(stmt),
                params: ParameterList::new(),
                scratch: Some(scratch),
            }),
            label: config.error_label.clone(),
            output_len: config.output_buffer_len,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, StatementState>> {
        self.state
            .lock()
            .map_err(|_| OdbcError::InternalError("Failed to lock statement mutex".to_string()))
    }

    /// Current CLI handle; null once destroyed.
    pub(crate) fn raw_handle(&self) -> RawHandle {
        self.lock()
            .ok()
            .and_then(|state| state.stmt.as_ref().map(OwnedHandle::raw))
            .unwrap_or(RawHandle::NULL)
    }

    fn error(&self, stmt: RawHandle) -> OdbcError {
        driver_error(&*self.cli, HandleKind::Stmt, stmt, &self.label)
    }
}

impl Drop for StatementCore {
    fn drop(&mut self) {
        match self.state.get_mut() {
            Ok(state) => state.release(),
            Err(poisoned) => poisoned.into_inner().release(),
        }
    }
}

/// What closing a statement does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseOption {
    /// Free parameters, handle and buffers.
    #[default]
    Destroy,
    Close,
    Unbind,
    ResetParams,
}

impl CloseOption {
    /// Host codes: `SQL_CLOSE` 0, `SQL_DROP` 1, `SQL_UNBIND` 2,
    /// `SQL_RESET_PARAMS` 3.
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(CloseOption::Close),
            1 => Ok(CloseOption::Destroy),
            2 => Ok(CloseOption::Unbind),
            3 => Ok(CloseOption::ResetParams),
            other => Err(OdbcError::Usage(format!("Invalid close option: {}", other))),
        }
    }
}

/// Result of [`Statement::execute`]: a cursor over the statement and the
/// OUT/INOUT values when any parameter has an output component.
#[derive(Debug)]
pub struct ExecuteOutput {
    pub result: ResultSet,
    pub out_params: Option<Vec<ParamValue>>,
}

/// A statement allocated on a connection.
pub struct Statement {
    id: u32,
    ctx: Arc<Context>,
}

impl Statement {
    pub(crate) fn new(id: u32, ctx: Arc<Context>) -> Self {
        Self { id, ctx }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn core(&self) -> Result<Arc<StatementCore>> {
        self.ctx.statements.get(self.id)
    }

    /// Environment and connection handles the statement was created from.
    pub fn parent_handles(&self) -> Result<(RawHandle, RawHandle)> {
        let core = self.core()?;
        Ok((core.env, core.dbc))
    }

    /// Statement handle; null after [`CloseOption::Destroy`].
    pub fn handle(&self) -> RawHandle {
        self.core()
            .map(|core| core.raw_handle())
            .unwrap_or(RawHandle::NULL)
    }

    /// Length of the decode buffer; 0 once destroyed.
    pub fn scratch_len(&self) -> usize {
        self.core()
            .ok()
            .and_then(|core| {
                core.lock()
                    .ok()
                    .map(|state| state.scratch.as_ref().map_or(0, Vec::len))
            })
            .unwrap_or(0)
    }

    fn submit_job<J>(&self, site: CallSite, callback: Option<Callback<J::Output>>, job: J) -> Result<()>
    where
        J: Job<Target = StatementCore>,
    {
        submit(site, callback, try_box(job), || self.ctx.statements.pin(self.id))
    }

    fn run_job<J>(&self, site: CallSite, job: J) -> Result<J::Output>
    where
        J: Job<Target = StatementCore>,
    {
        let core = self.core()?;
        run_sync(site, &*core, job)
    }

    /// Executes the prepared statement with the bound parameters, which are
    /// freed afterwards whatever the outcome.
    pub fn execute(&self, callback: Option<Callback<ExecuteOutput>>) -> Result<()> {
        let job = ExecuteJob::new(self.core()?);
        self.submit_job(CallSite::new(here!(), 0), callback, job)
    }

    pub fn execute_sync(&self) -> Result<ExecuteOutput> {
        let job = ExecuteJob::new(self.core()?);
        self.run_job(CallSite::new(here!(), 0), job)
    }

    pub fn execute_direct(&self, sql: &str, callback: Option<Callback<ResultSet>>) -> Result<()> {
        let job = ExecuteDirectJob::new(self.core()?, sql);
        self.submit_job(CallSite::new(here!(), 1), callback, job)
    }

    pub fn execute_direct_sync(&self, sql: &str) -> Result<ResultSet> {
        let job = ExecuteDirectJob::new(self.core()?, sql);
        self.run_job(CallSite::new(here!(), 1), job)
    }

    /// Executes and returns the affected row count, closing the cursor.
    pub fn execute_non_query(&self, callback: Option<Callback<i64>>) -> Result<()> {
        self.submit_job(CallSite::new(here!(), 0), callback, ExecuteNonQueryJob::default())
    }

    pub fn execute_non_query_sync(&self) -> Result<i64> {
        self.run_job(CallSite::new(here!(), 0), ExecuteNonQueryJob::default())
    }

    pub fn prepare(&self, sql: &str, callback: Option<Callback<bool>>) -> Result<()> {
        self.submit_job(CallSite::new(here!(), 1), callback, PrepareJob::new(sql))
    }

    pub fn prepare_sync(&self, sql: &str) -> Result<bool> {
        self.run_job(CallSite::new(here!(), 1), PrepareJob::new(sql))
    }

    /// Replaces the bound parameters. The previous list is freed first.
    pub fn bind(&self, params: &[Param], callback: Option<Callback<bool>>) -> Result<()> {
        let job = BindJob::new(params, self.ctx.config.output_buffer_len)?;
        self.submit_job(CallSite::new(here!(), 1), callback, job)
    }

    pub fn bind_sync(&self, params: &[Param]) -> Result<bool> {
        let job = BindJob::new(params, self.ctx.config.output_buffer_len)?;
        self.run_job(CallSite::new(here!(), 1), job)
    }

    /// Host form of [`bind`](Self::bind): the parameters must be an array.
    pub fn bind_host(&self, params: &Value, callback: Option<Callback<bool>>) -> Result<()> {
        self.bind(&host_params(params)?, callback)
    }

    pub fn bind_host_sync(&self, params: &Value) -> Result<bool> {
        self.bind_sync(&host_params(params)?)
    }

    pub fn close_sync(&self, option: CloseOption) -> Result<()> {
        let core = self.core()?;
        let mut state = core.lock()?;
        let free_option = match option {
            CloseOption::Destroy => {
                state.release();
                return Ok(());
            }
            CloseOption::Close => FreeStmtOption::Close,
            CloseOption::Unbind => FreeStmtOption::Unbind,
            CloseOption::ResetParams => FreeStmtOption::ResetParams,
        };

        let stmt = state.live()?;
        let rc = core.cli.free_stmt(stmt, free_option);
        if !succeeded(rc) {
            return Err(core.error(stmt));
        }
        if option == CloseOption::ResetParams {
            state.params.free();
        }
        Ok(())
    }
}

fn host_params(params: &Value) -> Result<Vec<Param>> {
    match params {
        Value::Array(values) => values.iter().map(Param::from_json).collect(),
        _ => Err(OdbcError::Usage("Argument 1 must be an Array".to_string())),
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.statements.remove(self.id) {
            log::debug!("Statement {} already removed: {}", self.id, e);
        }
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("id", &self.id)
            .field("handle", &self.handle())
            .finish()
    }
}

struct ExecuteJob {
    core: Arc<StatementCore>,
    out_params: Option<Vec<ParamValue>>,
}

impl ExecuteJob {
    fn new(core: Arc<StatementCore>) -> Self {
        Self {
            core,
            out_params: None,
        }
    }
}

impl Job for ExecuteJob {
    type Target = StatementCore;
    type Output = ExecuteOutput;

    const KIND: OperationKind = OperationKind::Execute;

    fn work(&mut self, stmt: &StatementCore) -> Result<()> {
        let mut state = stmt.lock()?;
        let handle = state.live()?;
        let rc = stmt.cli.execute(handle);
        let outcome = if is_hard_error(rc) {
            Err(stmt.error(handle))
        } else {
            if succeeded(rc) {
                self.out_params = state.params.output_values();
            }
            Ok(())
        };
        state.reset_params(&*stmt.cli);
        outcome
    }

    fn on_success(&mut self, stmt: &StatementCore) -> Result<ExecuteOutput> {
        Ok(ExecuteOutput {
            result: ResultSet::borrowed(Arc::clone(&stmt.cli), Arc::clone(&self.core), &stmt.label),
            out_params: self.out_params.take(),
        })
    }
}

struct ExecuteDirectJob {
    core: Arc<StatementCore>,
    sql: String,
}

impl ExecuteDirectJob {
    fn new(core: Arc<StatementCore>, sql: &str) -> Self {
        Self {
            core,
            sql: sql.to_string(),
        }
    }
}

impl Job for ExecuteDirectJob {
    type Target = StatementCore;
    type Output = ResultSet;

    const KIND: OperationKind = OperationKind::ExecuteDirect;

    fn work(&mut self, stmt: &StatementCore) -> Result<()> {
        let state = stmt.lock()?;
        let handle = state.live()?;
        if is_hard_error(stmt.cli.exec_direct(handle, &self.sql)) {
            return Err(stmt.error(handle));
        }
        Ok(())
    }

    fn on_success(&mut self, stmt: &StatementCore) -> Result<ResultSet> {
        Ok(ResultSet::borrowed(
            Arc::clone(&stmt.cli),
            Arc::clone(&self.core),
            &stmt.label,
        ))
    }
}

#[derive(Default)]
struct ExecuteNonQueryJob {
    rows: i64,
}

impl Job for ExecuteNonQueryJob {
    type Target = StatementCore;
    type Output = i64;

    const KIND: OperationKind = OperationKind::ExecuteNonQuery;

    fn work(&mut self, stmt: &StatementCore) -> Result<()> {
        let mut state = stmt.lock()?;
        let handle = state.live()?;
        let rc = stmt.cli.execute(handle);
        state.reset_params(&*stmt.cli);
        if is_hard_error(rc) {
            return Err(stmt.error(handle));
        }

        self.rows = stmt.cli.row_count(handle).unwrap_or(0);
        let rc = stmt.cli.free_stmt(handle, FreeStmtOption::Close);
        if !succeeded(rc) {
            log::debug!("SQLFreeStmt(Close) after non-query returned {:?}", rc);
        }
        Ok(())
    }

    fn on_success(&mut self, _stmt: &StatementCore) -> Result<i64> {
        Ok(self.rows)
    }
}

struct PrepareJob {
    sql: String,
}

impl PrepareJob {
    fn new(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
        }
    }
}

impl Job for PrepareJob {
    type Target = StatementCore;
    type Output = bool;

    const KIND: OperationKind = OperationKind::Prepare;

    fn work(&mut self, stmt: &StatementCore) -> Result<()> {
        let state = stmt.lock()?;
        let handle = state.live()?;
        if !succeeded(stmt.cli.prepare(handle, &self.sql)) {
            return Err(stmt.error(handle));
        }
        Ok(())
    }

    fn on_success(&mut self, _stmt: &StatementCore) -> Result<bool> {
        Ok(true)
    }
}

struct BindJob {
    params: Option<ParameterList>,
}

impl BindJob {
    fn new(params: &[Param], output_len: usize) -> Result<Self> {
        Ok(Self {
            params: Some(ParameterList::from_params(params, output_len)?),
        })
    }
}

impl Job for BindJob {
    type Target = StatementCore;
    type Output = bool;

    const KIND: OperationKind = OperationKind::Bind;

    fn work(&mut self, stmt: &StatementCore) -> Result<()> {
        let mut state = stmt.lock()?;
        let handle = state.live()?;
        state.reset_params(&*stmt.cli);
        state.params = self.params.take().unwrap_or_default();
        if !succeeded(state.params.bind(&*stmt.cli, handle)) {
            return Err(stmt.error(handle));
        }
        Ok(())
    }

    fn on_success(&mut self, _stmt: &StatementCore) -> Result<bool> {
        Ok(true)
    }
}
