//! Boundary with the ODBC call level interface.
//!
//! Every blocking driver call the engine makes goes through [`Cli`]. The
//! production backend is [`OdbcCli`], which calls the driver manager through
//! `odbc_api::sys`. Tests swap in the scripted backend from [`fake`].

#[cfg(any(test, feature = "test-helpers"))]
pub mod fake;
mod odbc;

pub use odbc::OdbcCli;
pub use odbc_api::sys::SqlReturn;

use crate::error::ErrorState;
use crate::protocol::ParameterBinding;
use std::sync::Arc;

/// Opaque CLI handle value. Zero is the null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub usize);

impl RawHandle {
    pub const NULL: RawHandle = RawHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Env,
    Dbc,
    Stmt,
}

impl HandleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HandleKind::Env => "environment",
            HandleKind::Dbc => "connection",
            HandleKind::Stmt => "statement",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAttr {
    AutoCommit(bool),
    LoginTimeout(u32),
    TxnIsolation(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeStmtOption {
    Close,
    Unbind,
    ResetParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionType {
    Commit,
    Rollback,
}

/// Search pattern for catalog functions. `None` leaves the argument
/// unfiltered. `last` is the table type for `SQLTables` and the column name
/// for `SQLColumns`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogFilter {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub last: Option<String>,
}

/// SUCCESS or SUCCESS_WITH_INFO.
pub fn succeeded(rc: SqlReturn) -> bool {
    rc == SqlReturn::SUCCESS || rc == SqlReturn::SUCCESS_WITH_INFO
}

/// Codes that abort an operation. NO_DATA and the informational codes
/// do not.
pub fn is_hard_error(rc: SqlReturn) -> bool {
    rc == SqlReturn::ERROR || rc == SqlReturn::INVALID_HANDLE
}

/// The ODBC calls the engine depends on. All of them may block.
pub trait Cli: Send + Sync {
    fn alloc_handle(&self, kind: HandleKind, parent: RawHandle) -> Result<RawHandle, SqlReturn>;

    fn free_handle(&self, kind: HandleKind, handle: RawHandle) -> SqlReturn;

    fn set_env_odbc_version(&self, env: RawHandle) -> SqlReturn;

    fn set_connect_attr(&self, dbc: RawHandle, attr: ConnectAttr) -> SqlReturn;

    fn driver_connect(&self, dbc: RawHandle, connection_string: &str) -> SqlReturn;

    fn disconnect(&self, dbc: RawHandle) -> SqlReturn;

    fn prepare(&self, stmt: RawHandle, sql: &str) -> SqlReturn;

    fn execute(&self, stmt: RawHandle) -> SqlReturn;

    fn exec_direct(&self, stmt: RawHandle, sql: &str) -> SqlReturn;

    /// Binds the buffers described by `binding`. The buffers must stay valid
    /// until the statement is executed and any output has been read.
    fn bind_parameter(&self, stmt: RawHandle, binding: &ParameterBinding<'_>) -> SqlReturn;

    fn free_stmt(&self, stmt: RawHandle, option: FreeStmtOption) -> SqlReturn;

    fn row_count(&self, stmt: RawHandle) -> Result<i64, SqlReturn>;

    fn tables(&self, stmt: RawHandle, filter: &CatalogFilter) -> SqlReturn;

    fn columns(&self, stmt: RawHandle, filter: &CatalogFilter) -> SqlReturn;

    fn end_tran(&self, dbc: RawHandle, completion: CompletionType) -> SqlReturn;

    /// `SQLGetDiagField(SQL_DIAG_NUMBER)`.
    fn diag_number(&self, kind: HandleKind, handle: RawHandle) -> Result<i32, SqlReturn>;

    /// `SQLGetDiagRec` for a 1-based record number.
    fn diag_record(
        &self,
        kind: HandleKind,
        handle: RawHandle,
        record: i16,
    ) -> Result<ErrorState, SqlReturn>;

    /// Whether the driver behind `dbc` can return more than one result set.
    fn more_results_supported(&self, _dbc: RawHandle) -> bool {
        true
    }
}

/// A CLI handle freed exactly once, on [`OwnedHandle::free`] or drop.
pub struct OwnedHandle {
    cli: Arc<dyn Cli>,
    kind: HandleKind,
    handle: Option<RawHandle>,
}

impl OwnedHandle {
    pub fn new(cli: Arc<dyn Cli>, kind: HandleKind, handle: RawHandle) -> Self {
        Self {
            cli,
            kind,
            handle: Some(handle).filter(|h| !h.is_null()),
        }
    }

    pub fn raw(&self) -> RawHandle {
        self.handle.unwrap_or(RawHandle::NULL)
    }

    /// Hands the handle over without freeing it.
    pub fn release(mut self) -> RawHandle {
        self.handle.take().unwrap_or(RawHandle::NULL)
    }

    pub fn free(&mut self) {
        if let Some(handle) = self.handle.take() {
            let rc = self.cli.free_handle(self.kind, handle);
            if !succeeded(rc) {
                log::warn!(
                    "SQLFreeHandle({}) returned {:?}",
                    self.kind.as_str(),
                    rc
                );
            }
        }
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        self.free();
    }
}

impl std::fmt::Debug for OwnedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedHandle")
            .field("kind", &self.kind)
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeCli;
    use super::*;

    #[test]
    fn test_success_predicate() {
        assert!(succeeded(SqlReturn::SUCCESS));
        assert!(succeeded(SqlReturn::SUCCESS_WITH_INFO));
        assert!(!succeeded(SqlReturn::NO_DATA));
        assert!(!succeeded(SqlReturn::ERROR));
    }

    #[test]
    fn test_hard_error_excludes_no_data() {
        assert!(is_hard_error(SqlReturn::ERROR));
        assert!(is_hard_error(SqlReturn::INVALID_HANDLE));
        assert!(!is_hard_error(SqlReturn::NO_DATA));
        assert!(!is_hard_error(SqlReturn::SUCCESS_WITH_INFO));
    }

    #[test]
    fn test_owned_handle_frees_once() {
        let fake = Arc::new(FakeCli::new());
        let cli: Arc<dyn Cli> = fake.clone();
        let raw = cli
            .alloc_handle(HandleKind::Stmt, RawHandle::NULL)
            .expect("alloc");

        let mut owned = OwnedHandle::new(cli, HandleKind::Stmt, raw);
        owned.free();
        owned.free();
        drop(owned);

        assert_eq!(fake.frees(HandleKind::Stmt), 1);
        assert_eq!(fake.double_frees(), 0);
    }

    #[test]
    fn test_owned_handle_release_skips_free() {
        let fake = Arc::new(FakeCli::new());
        let cli: Arc<dyn Cli> = fake.clone();
        let raw = cli
            .alloc_handle(HandleKind::Stmt, RawHandle::NULL)
            .expect("alloc");

        let owned = OwnedHandle::new(cli, HandleKind::Stmt, raw);
        assert_eq!(owned.release(), raw);
        assert_eq!(fake.frees(HandleKind::Stmt), 0);
        assert_eq!(fake.live_handles(HandleKind::Stmt), 1);
    }
}
