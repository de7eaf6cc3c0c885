use super::environment::Context;
use super::statement::{Statement, StatementCore};
use super::{driver_error, LOGGER};
use crate::async_bridge::{
    here, run_sync, submit, try_box, CallSite, Callback, Job, OperationKind,
};
use crate::cli::{succeeded, Cli, ConnectAttr, HandleKind, OwnedHandle, RawHandle};
use crate::config::clamp_connect_timeout;
use crate::error::{OdbcError, Result};
use log::Level;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use zeroize::Zeroizing;

/// Connection state shared between the [`Connection`] wrapper and the jobs
/// targeting it. The CLI handle sits behind a mutex that a job holds for
/// its whole `work` phase, so jobs on one connection never overlap.
pub(crate) struct ConnectionCore {
    cli: Arc<dyn Cli>,
    env: Arc<OwnedHandle>,
    dbc: Mutex<Option<OwnedHandle>>,
    connected: AtomicBool,
    connect_timeout: AtomicU32,
    can_have_more_results: AtomicBool,
    label: String,
}

impl ConnectionCore {
    pub(crate) fn new(
        cli: Arc<dyn Cli>,
        env: Arc<OwnedHandle>,
        dbc: OwnedHandle,
        connect_timeout: u32,
        label: &str,
    ) -> Self {
        Self {
            cli,
            env,
            dbc: Mutex::new(Some(dbc)),
            connected: AtomicBool::new(false),
            connect_timeout: AtomicU32::new(connect_timeout),
            can_have_more_results: AtomicBool::new(false),
            label: label.to_string(),
        }
    }

    pub(crate) fn cli(&self) -> &Arc<dyn Cli> {
        &self.cli
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn env_handle(&self) -> RawHandle {
        self.env.raw()
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Option<OwnedHandle>>> {
        self.dbc
            .lock()
            .map_err(|_| OdbcError::InternalError("Failed to lock connection mutex".to_string()))
    }

    /// The CLI handle in `slot`, or an error once the connection was closed.
    pub(crate) fn live(slot: &Option<OwnedHandle>) -> Result<RawHandle> {
        slot.as_ref()
            .map(OwnedHandle::raw)
            .ok_or(OdbcError::HandleReleased("connection"))
    }

    pub(crate) fn error(&self, dbc: RawHandle) -> OdbcError {
        driver_error(&*self.cli, HandleKind::Dbc, dbc, &self.label)
    }

    /// Allocates a statement handle on `dbc`, reporting the connection's
    /// diagnostic on failure.
    pub(crate) fn alloc_statement(&self, dbc: RawHandle) -> Result<OwnedHandle> {
        let raw = self
            .cli
            .alloc_handle(HandleKind::Stmt, dbc)
            .map_err(|_| self.error(dbc))?;
        Ok(OwnedHandle::new(Arc::clone(&self.cli), HandleKind::Stmt, raw))
    }

    fn connect_timeout(&self) -> u32 {
        self.connect_timeout.load(Ordering::Acquire)
    }
}

/// Disconnects if needed and frees the handle. Safe to repeat.
fn release(cli: &dyn Cli, connected: &AtomicBool, slot: &mut Option<OwnedHandle>) {
    let Some(mut dbc) = slot.take() else {
        return;
    };
    if connected.swap(false, Ordering::AcqRel) {
        let rc = cli.disconnect(dbc.raw());
        if !succeeded(rc) {
            log::warn!("SQLDisconnect returned {:?}", rc);
        }
    }
    dbc.free();
}

impl Drop for ConnectionCore {
    fn drop(&mut self) {
        let slot = match self.dbc.get_mut() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        release(&*self.cli, &self.connected, slot);
    }
}

/// One logical database connection, created disconnected by
/// [`Environment::create_connection`](super::Environment::create_connection).
pub struct Connection {
    id: u32,
    ctx: Arc<Context>,
}

impl Connection {
    pub(crate) fn new(id: u32, ctx: Arc<Context>) -> Self {
        Self { id, ctx }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    fn core(&self) -> Result<Arc<ConnectionCore>> {
        self.ctx.connections.get(self.id)
    }

    pub(crate) fn submit_job<J>(
        &self,
        site: CallSite,
        callback: Option<Callback<J::Output>>,
        job: J,
    ) -> Result<()>
    where
        J: Job<Target = ConnectionCore>,
    {
        submit(site, callback, try_box(job), || self.ctx.connections.pin(self.id))
    }

    pub(crate) fn run_job<J>(&self, site: CallSite, job: J) -> Result<J::Output>
    where
        J: Job<Target = ConnectionCore>,
    {
        let core = self.core()?;
        run_sync(site, &*core, job)
    }

    pub fn connected(&self) -> bool {
        self.core()
            .map(|core| core.connected.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Login timeout in seconds; 0 means none.
    pub fn connect_timeout(&self) -> u32 {
        self.core().map(|core| core.connect_timeout()).unwrap_or(0)
    }

    /// Values outside `0..=32767` are replaced by the 30 second default.
    pub fn set_connect_timeout(&self, secs: i64) -> Result<()> {
        let timeout = clamp_connect_timeout(secs);
        if i64::from(timeout) != secs {
            log::debug!("Connect timeout {} out of range, using {}", secs, timeout);
        }
        self.core()?.connect_timeout.store(timeout, Ordering::Release);
        Ok(())
    }

    /// Whether the driver reported multiple result set support on open.
    pub fn can_have_more_results(&self) -> bool {
        self.core()
            .map(|core| core.can_have_more_results.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn open(&self, connection_string: &str, callback: Option<Callback<()>>) -> Result<()> {
        self.submit_job(
            CallSite::new(here!(), 1),
            callback,
            OpenJob::new(connection_string),
        )
    }

    pub fn open_sync(&self, connection_string: &str) -> Result<()> {
        self.run_job(CallSite::new(here!(), 1), OpenJob::new(connection_string))
    }

    pub fn close(&self, callback: Option<Callback<()>>) -> Result<()> {
        self.submit_job(CallSite::new(here!(), 0), callback, CloseJob)
    }

    /// Disconnects and frees the handle. Closing again is harmless.
    pub fn close_sync(&self) -> Result<()> {
        self.run_job(CallSite::new(here!(), 0), CloseJob)
    }

    pub fn create_statement(&self, callback: Option<Callback<Statement>>) -> Result<()> {
        self.submit_job(
            CallSite::new(here!(), 0),
            callback,
            CreateStatementJob::new(Arc::clone(&self.ctx)),
        )
    }

    pub fn create_statement_sync(&self) -> Result<Statement> {
        self.run_job(
            CallSite::new(here!(), 0),
            CreateStatementJob::new(Arc::clone(&self.ctx)),
        )
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.connections.remove(self.id) {
            log::debug!("Connection {} already removed: {}", self.id, e);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected", &self.connected())
            .finish()
    }
}

struct OpenJob {
    connection_string: Zeroizing<String>,
}

impl OpenJob {
    fn new(connection_string: &str) -> Self {
        Self {
            connection_string: Zeroizing::new(connection_string.to_string()),
        }
    }
}

impl Job for OpenJob {
    type Target = ConnectionCore;
    type Output = ();

    const KIND: OperationKind = OperationKind::Open;

    fn work(&mut self, conn: &ConnectionCore) -> Result<()> {
        let slot = conn.lock()?;
        let dbc = ConnectionCore::live(&slot)?;

        let timeout = conn.connect_timeout();
        if timeout > 0 {
            let rc = conn
                .cli
                .set_connect_attr(dbc, ConnectAttr::LoginTimeout(timeout));
            if !succeeded(rc) {
                return Err(conn.error(dbc));
            }
        }

        let rc = conn.cli.driver_connect(dbc, &self.connection_string);
        if !succeeded(rc) {
            return Err(conn.error(dbc));
        }
        conn.connected.store(true, Ordering::Release);
        conn.can_have_more_results
            .store(conn.cli.more_results_supported(dbc), Ordering::Release);
        Ok(())
    }

    fn on_success(&mut self, _conn: &ConnectionCore) -> Result<()> {
        LOGGER.log_connection(Level::Info, &self.connection_string, "opened");
        Ok(())
    }
}

struct CloseJob;

impl Job for CloseJob {
    type Target = ConnectionCore;
    type Output = ();

    const KIND: OperationKind = OperationKind::Close;

    fn work(&mut self, conn: &ConnectionCore) -> Result<()> {
        let mut slot = conn.lock()?;
        release(&*conn.cli, &conn.connected, &mut slot);
        Ok(())
    }

    fn on_success(&mut self, _conn: &ConnectionCore) -> Result<()> {
        Ok(())
    }
}

struct CreateStatementJob {
    ctx: Arc<Context>,
    dbc: RawHandle,
    stmt: Option<OwnedHandle>,
}

impl CreateStatementJob {
    fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            dbc: RawHandle::NULL,
            stmt: None,
        }
    }
}

impl Job for CreateStatementJob {
    type Target = ConnectionCore;
    type Output = Statement;

    const KIND: OperationKind = OperationKind::CreateStatement;

    fn work(&mut self, conn: &ConnectionCore) -> Result<()> {
        let slot = conn.lock()?;
        self.dbc = ConnectionCore::live(&slot)?;
        self.stmt = Some(conn.alloc_statement(self.dbc)?);
        Ok(())
    }

    fn on_success(&mut self, conn: &ConnectionCore) -> Result<Statement> {
        let handle = self
            .stmt
            .take()
            .ok_or_else(|| OdbcError::InternalError("statement handle missing".to_string()))?;
        let core = StatementCore::new(
            Arc::clone(&conn.cli),
            conn.env_handle(),
            self.dbc,
            handle,
            &self.ctx.config,
        )?;
        let id = self.ctx.statements.insert(core)?;
        Ok(Statement::new(id, Arc::clone(&self.ctx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_bridge::JobResult;
    use crate::cli::fake::{FakeCli, FakeOp};
    use crate::config::EngineConfig;
    use crate::engine::Environment;
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn setup() -> (Arc<FakeCli>, Environment) {
        let _ = env_logger::builder().is_test(true).try_init();
        let fake = Arc::new(FakeCli::new());
        let env = Environment::with_cli(fake.clone(), EngineConfig::default()).unwrap();
        (fake, env)
    }

    #[test]
    fn test_open_sync_without_timeout() {
        let (fake, env) = setup();
        let conn = env.create_connection().unwrap();
        conn.set_connect_timeout(0).unwrap();

        conn.open_sync("DSN=test").unwrap();

        assert!(conn.connected());
        assert!(conn.can_have_more_results());
        assert!(fake.connect_attrs().is_empty());
        assert_eq!(fake.connection_strings(), vec!["DSN=test".to_string()]);
    }

    #[test]
    fn test_open_sets_login_timeout_first() {
        let (fake, env) = setup();
        let conn = env.create_connection().unwrap();
        conn.set_connect_timeout(15).unwrap();
        conn.open_sync("DSN=test").unwrap();

        let calls = fake.calls();
        let attr = calls
            .iter()
            .position(|c| c == "SQLSetConnectAttr(LoginTimeout(15))")
            .unwrap();
        let connect = calls.iter().position(|c| c == "SQLDriverConnect").unwrap();
        assert!(attr < connect);
    }

    #[test]
    fn test_set_connect_timeout_clamps() {
        let (_fake, env) = setup();
        let conn = env.create_connection().unwrap();
        conn.set_connect_timeout(40000).unwrap();
        assert_eq!(conn.connect_timeout(), 30);
        conn.set_connect_timeout(-5).unwrap();
        assert_eq!(conn.connect_timeout(), 30);
        conn.set_connect_timeout(32767).unwrap();
        assert_eq!(conn.connect_timeout(), 32767);
    }

    #[test]
    fn test_open_failure_reports_driver_error() {
        let (fake, env) = setup();
        let conn = env.create_connection().unwrap();
        fake.fail(FakeOp::DriverConnect, "08001", "Server not found");

        let err = conn.open_sync("DSN=missing").unwrap_err();
        assert_eq!(err.sql_state(), Some("08001"));
        assert!(err.to_string().contains("Server not found"));
        assert!(!conn.connected());
    }

    #[test]
    fn test_open_async_delivers_to_callback() {
        let (_fake, env) = setup();
        let conn = env.create_connection().unwrap();
        let (tx, rx) = mpsc::channel();

        conn.open(
            "DSN=test",
            Some(Box::new(move |r: JobResult<()>| tx.send(r.is_ok()).unwrap())),
        )
        .unwrap();

        assert!(rx.recv_timeout(WAIT).unwrap());
        assert!(conn.connected());
    }

    #[test]
    fn test_close_twice_is_harmless() {
        let (fake, env) = setup();
        let conn = env.create_connection().unwrap();
        conn.open_sync("DSN=test").unwrap();

        conn.close_sync().unwrap();
        assert!(!conn.connected());
        conn.close_sync().unwrap();
        drop(conn);

        assert_eq!(fake.frees(HandleKind::Dbc), 1);
        assert_eq!(fake.double_frees(), 0);
        assert_eq!(
            fake.calls().iter().filter(|c| *c == "SQLDisconnect").count(),
            1
        );
    }

    #[test]
    fn test_open_after_close_reports_released_handle() {
        let (_fake, env) = setup();
        let conn = env.create_connection().unwrap();
        conn.close_sync().unwrap();
        assert!(matches!(
            conn.open_sync("DSN=test"),
            Err(OdbcError::HandleReleased("connection"))
        ));
    }

    #[test]
    fn test_drop_disconnects_open_connection() {
        let (fake, env) = setup();
        let conn = env.create_connection().unwrap();
        conn.open_sync("DSN=test").unwrap();
        drop(conn);

        assert!(fake.calls().contains(&"SQLDisconnect".to_string()));
        assert_eq!(fake.live_handles(HandleKind::Dbc), 0);
        assert_eq!(env.connection_count(), 0);
    }

    #[test]
    fn test_create_statement_sync() {
        let (fake, env) = setup();
        let conn = env.create_connection().unwrap();
        conn.open_sync("DSN=test").unwrap();

        let stmt = conn.create_statement_sync().unwrap();
        assert_eq!(env.statement_count(), 1);
        assert_eq!(fake.live_handles(HandleKind::Stmt), 1);

        drop(stmt);
        assert_eq!(env.statement_count(), 0);
        assert_eq!(fake.live_handles(HandleKind::Stmt), 0);
    }

    #[test]
    fn test_create_statement_failure_reads_connection_diagnostic() {
        let (fake, env) = setup();
        let conn = env.create_connection().unwrap();
        conn.open_sync("DSN=test").unwrap();
        fake.script_return(FakeOp::AllocHandle, crate::cli::SqlReturn::ERROR);

        assert!(matches!(conn.create_statement_sync(), Err(OdbcError::Sql(_))));
        assert_eq!(env.statement_count(), 0);
    }

    #[test]
    fn test_missing_callback_schedules_nothing() {
        let (fake, env) = setup();
        let conn = env.create_connection().unwrap();

        match conn.open("DSN=test", None) {
            Err(OdbcError::Usage(msg)) => assert_eq!(msg, "Argument 1 must be a function"),
            other => panic!("Expected usage error, got {:?}", other),
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(fake.connection_strings().is_empty());
    }

    #[test]
    fn test_job_outlives_dropped_connection() {
        let (fake, env) = setup();
        fake.set_delay(Duration::from_millis(50));
        let conn = env.create_connection().unwrap();
        let (tx, rx) = mpsc::channel();

        conn.open(
            "DSN=test",
            Some(Box::new(move |r: JobResult<()>| tx.send(r.is_ok()).unwrap())),
        )
        .unwrap();
        drop(conn);

        assert!(rx.recv_timeout(WAIT).unwrap());
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fake.live_handles(HandleKind::Dbc), 0);
        assert_eq!(fake.double_frees(), 0);
    }
}
