use super::connection::{Connection, ConnectionCore};
use super::driver_error;
use super::result_set::ResultSet;
use crate::async_bridge::{here, CallSite, Callback, Failure, Job, OperationKind};
use crate::cli::{is_hard_error, CatalogFilter, HandleKind, OwnedHandle};
use crate::error::{OdbcError, Result};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CatalogCall {
    Tables,
    Columns,
}

/// `SQLTables` or `SQLColumns` on a fresh statement handle.
struct CatalogJob {
    call: CatalogCall,
    filter: CatalogFilter,
    stmt: Option<OwnedHandle>,
}

impl CatalogJob {
    fn new(call: CatalogCall, filter: CatalogFilter) -> Self {
        Self {
            call,
            filter,
            stmt: None,
        }
    }

    fn result(&mut self, conn: &ConnectionCore) -> Option<ResultSet> {
        self.stmt
            .take()
            .map(|stmt| ResultSet::owning(Arc::clone(conn.cli()), stmt, conn.label()))
    }
}

struct TablesJob(CatalogJob);

struct ColumnsJob(CatalogJob);

fn catalog_work(job: &mut CatalogJob, conn: &ConnectionCore) -> Result<()> {
    let slot = conn.lock()?;
    let dbc = ConnectionCore::live(&slot)?;
    let cli = conn.cli();
    let stmt = job.stmt.insert(conn.alloc_statement(dbc)?).raw();

    let rc = match job.call {
        CatalogCall::Tables => cli.tables(stmt, &job.filter),
        CatalogCall::Columns => cli.columns(stmt, &job.filter),
    };
    if is_hard_error(rc) {
        return Err(driver_error(&**cli, HandleKind::Stmt, stmt, conn.label()));
    }
    Ok(())
}

fn catalog_success(job: &mut CatalogJob, conn: &ConnectionCore) -> Result<ResultSet> {
    job.result(conn)
        .ok_or_else(|| OdbcError::InternalError("catalog statement missing".to_string()))
}

fn catalog_failure(
    job: &mut CatalogJob,
    conn: &ConnectionCore,
    error: OdbcError,
) -> Failure<ResultSet> {
    match job.result(conn) {
        Some(result) => Failure::with_partial(error, result),
        None => Failure::new(error),
    }
}

impl Job for TablesJob {
    type Target = ConnectionCore;
    type Output = ResultSet;

    const KIND: OperationKind = OperationKind::Tables;

    fn work(&mut self, conn: &ConnectionCore) -> Result<()> {
        catalog_work(&mut self.0, conn)
    }

    fn on_success(&mut self, conn: &ConnectionCore) -> Result<ResultSet> {
        catalog_success(&mut self.0, conn)
    }

    fn on_failure(&mut self, conn: &ConnectionCore, error: OdbcError) -> Failure<ResultSet> {
        catalog_failure(&mut self.0, conn, error)
    }
}

impl Job for ColumnsJob {
    type Target = ConnectionCore;
    type Output = ResultSet;

    const KIND: OperationKind = OperationKind::Columns;

    fn work(&mut self, conn: &ConnectionCore) -> Result<()> {
        catalog_work(&mut self.0, conn)
    }

    fn on_success(&mut self, conn: &ConnectionCore) -> Result<ResultSet> {
        catalog_success(&mut self.0, conn)
    }

    fn on_failure(&mut self, conn: &ConnectionCore, error: OdbcError) -> Failure<ResultSet> {
        catalog_failure(&mut self.0, conn, error)
    }
}

impl Connection {
    /// Lists tables matching `filter`; `filter.last` is the table type list.
    pub fn tables(&self, filter: CatalogFilter, callback: Option<Callback<ResultSet>>) -> Result<()> {
        self.submit_job(
            CallSite::new(here!(), 4),
            callback,
            TablesJob(CatalogJob::new(CatalogCall::Tables, filter)),
        )
    }

    pub fn tables_sync(&self, filter: CatalogFilter) -> Result<ResultSet> {
        self.run_job(
            CallSite::new(here!(), 4),
            TablesJob(CatalogJob::new(CatalogCall::Tables, filter)),
        )
    }

    /// Lists columns matching `filter`; `filter.last` is the column name
    /// pattern.
    pub fn columns(
        &self,
        filter: CatalogFilter,
        callback: Option<Callback<ResultSet>>,
    ) -> Result<()> {
        self.submit_job(
            CallSite::new(here!(), 4),
            callback,
            ColumnsJob(CatalogJob::new(CatalogCall::Columns, filter)),
        )
    }

    pub fn columns_sync(&self, filter: CatalogFilter) -> Result<ResultSet> {
        self.run_job(
            CallSite::new(here!(), 4),
            ColumnsJob(CatalogJob::new(CatalogCall::Columns, filter)),
        )
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

    fn open() -> (Arc<FakeCli>, Environment, Connection) {
        let fake = Arc::new(FakeCli::new());
        let env = Environment::with_cli(fake.clone(), EngineConfig::default()).unwrap();
        let conn = env.create_connection().unwrap();
        conn.open_sync("DSN=test").unwrap();
        (fake, env, conn)
    }

    #[test]
    fn test_tables_passes_filter() {
        let (fake, _env, conn) = open();
        let filter = CatalogFilter {
            schema: Some("dbo".to_string()),
            last: Some("TABLE".to_string()),
            ..CatalogFilter::default()
        };

        let result = conn.tables_sync(filter.clone()).unwrap();
        assert!(result.owns_statement());
        assert!(fake.calls().contains(&format!("SQLTables({:?})", filter)));
    }

    #[test]
    fn test_columns_async() {
        let (fake, _env, conn) = open();
        let (tx, rx) = mpsc::channel();

        conn.columns(
            CatalogFilter {
                table: Some("users".to_string()),
                ..CatalogFilter::default()
            },
            Some(Box::new(move |r: JobResult<ResultSet>| {
                tx.send(r.map(|rs| rs.owns_statement()).is_ok()).unwrap();
            })),
        )
        .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(fake.calls().iter().any(|c| c.starts_with("SQLColumns")));
    }

    #[test]
    fn test_catalog_failure_frees_statement() {
        let (fake, _env, conn) = open();
        fake.fail(FakeOp::Tables, "HYC00", "Optional feature not implemented");

        let err = conn.tables_sync(CatalogFilter::default()).unwrap_err();
        assert_eq!(err.sql_state(), Some("HYC00"));
        assert_eq!(fake.live_handles(HandleKind::Stmt), 0);
    }

    #[test]
    fn test_catalog_callback_index() {
        let (_fake, _env, conn) = open();
        match conn.tables(CatalogFilter::default(), None) {
            Err(OdbcError::Usage(msg)) => assert_eq!(msg, "Argument 4 must be a function"),
            other => panic!("Expected usage error, got {:?}", other),
        }
    }
}
