use super::driver_error;
use super::statement::StatementCore;
use crate::cli::{succeeded, Cli, FreeStmtOption, HandleKind, OwnedHandle, RawHandle};
use crate::error::{OdbcError, Result};
use std::sync::Arc;

enum Source {
    /// Statement allocated for this result alone (queries, catalog calls).
    Owned(Option<OwnedHandle>),
    /// Cursor of a [`Statement`](super::Statement); the statement keeps the
    /// handle.
    Statement(Arc<StatementCore>),
}

/// Cursor produced by a query, a catalog call or a statement execution.
pub struct ResultSet {
    cli: Arc<dyn Cli>,
    source: Source,
    label: String,
}

impl ResultSet {
    pub(crate) fn owning(cli: Arc<dyn Cli>, handle: OwnedHandle, label: &str) -> Self {
        Self {
            cli,
            source: Source::Owned(Some(handle)),
            label: label.to_string(),
        }
    }

    pub(crate) fn borrowed(cli: Arc<dyn Cli>, statement: Arc<StatementCore>, label: &str) -> Self {
        Self {
            cli,
            source: Source::Statement(statement),
            label: label.to_string(),
        }
    }

    /// Whether dropping this result frees the statement handle.
    pub fn owns_statement(&self) -> bool {
        matches!(self.source, Source::Owned(_))
    }

    /// Statement handle behind the cursor; null once closed.
    pub fn statement_handle(&self) -> RawHandle {
        match &self.source {
            Source::Owned(handle) => handle.as_ref().map(OwnedHandle::raw).unwrap_or(RawHandle::NULL),
            Source::Statement(core) => core.raw_handle(),
        }
    }

    fn live_handle(&self) -> Result<RawHandle> {
        let handle = self.statement_handle();
        if handle.is_null() {
            return Err(OdbcError::HandleReleased("result"));
        }
        Ok(handle)
    }

    /// Rows affected by the statement that produced this result.
    pub fn row_count(&self) -> Result<i64> {
        let stmt = self.live_handle()?;
        self.cli
            .row_count(stmt)
            .map_err(|_| driver_error(&*self.cli, HandleKind::Stmt, stmt, &self.label))
    }

    /// Owned results free their statement; borrowed ones close the cursor
    /// and leave the statement reusable. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match &mut self.source {
            Source::Owned(handle) => {
                if let Some(mut handle) = handle.take() {
                    handle.free();
                }
                Ok(())
            }
            Source::Statement(core) => {
                let stmt = core.raw_handle();
                if stmt.is_null() {
                    return Ok(());
                }
                let rc = self.cli.free_stmt(stmt, FreeStmtOption::Close);
                if !succeeded(rc) {
                    return Err(driver_error(&*self.cli, HandleKind::Stmt, stmt, &self.label));
                }
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("statement", &self.statement_handle())
            .field("owns_statement", &self.owns_statement())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::fake::{FakeCli, FakeOp};
    use crate::error::DEFAULT_ERROR_LABEL;

    fn owned_result(fake: &Arc<FakeCli>) -> ResultSet {
        let cli: Arc<dyn Cli> = fake.clone();
        let raw = cli.alloc_handle(HandleKind::Stmt, RawHandle::NULL).unwrap();
        ResultSet::owning(
            Arc::clone(&cli),
            OwnedHandle::new(cli, HandleKind::Stmt, raw),
            DEFAULT_ERROR_LABEL,
        )
    }

    #[test]
    fn test_owned_result_frees_on_drop() {
        let fake = Arc::new(FakeCli::new());
        let result = owned_result(&fake);
        assert!(result.owns_statement());
        assert_eq!(fake.live_handles(HandleKind::Stmt), 1);

        drop(result);
        assert_eq!(fake.live_handles(HandleKind::Stmt), 0);
    }

    #[test]
    fn test_row_count() {
        let fake = Arc::new(FakeCli::new());
        fake.set_row_count(3);
        let result = owned_result(&fake);
        assert_eq!(result.row_count().unwrap(), 3);
    }

    #[test]
    fn test_row_count_failure_is_driver_error() {
        let fake = Arc::new(FakeCli::new());
        let result = owned_result(&fake);
        fake.fail(FakeOp::RowCount, "HY010", "Function sequence error");

        let err = result.row_count().unwrap_err();
        assert_eq!(err.sql_state(), Some("HY010"));
    }

    #[test]
    fn test_close_twice_frees_once() {
        let fake = Arc::new(FakeCli::new());
        let mut result = owned_result(&fake);
        result.close().unwrap();
        result.close().unwrap();
        drop(result);

        assert_eq!(fake.frees(HandleKind::Stmt), 1);
        assert_eq!(fake.double_frees(), 0);
    }

    #[test]
    fn test_row_count_after_close() {
        let fake = Arc::new(FakeCli::new());
        let mut result = owned_result(&fake);
        result.close().unwrap();
        assert!(matches!(
            result.row_count(),
            Err(OdbcError::HandleReleased("result"))
        ));
    }
}
