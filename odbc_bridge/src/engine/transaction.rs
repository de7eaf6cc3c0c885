use super::connection::{Connection, ConnectionCore};
use crate::async_bridge::{here, CallSite, Callback, Job, OperationKind};
use crate::cli::{succeeded, CompletionType, ConnectAttr};
use crate::error::{OdbcError, Result};

/// `SQL_ATTR_TXN_ISOLATION` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn to_odbc(self) -> u32 {
        match self {
            IsolationLevel::ReadUncommitted => 1,
            IsolationLevel::ReadCommitted => 2,
            IsolationLevel::RepeatableRead => 4,
            IsolationLevel::Serializable => 8,
        }
    }

    pub fn from_odbc(code: i64) -> Result<Self> {
        match code {
            1 => Ok(IsolationLevel::ReadUncommitted),
            2 => Ok(IsolationLevel::ReadCommitted),
            4 => Ok(IsolationLevel::RepeatableRead),
            8 => Ok(IsolationLevel::Serializable),
            other => Err(OdbcError::Usage(format!(
                "Invalid isolation level: {}",
                other
            ))),
        }
    }
}

struct BeginTransactionJob;

impl Job for BeginTransactionJob {
    type Target = ConnectionCore;
    type Output = ();

    const KIND: OperationKind = OperationKind::BeginTransaction;

    fn work(&mut self, conn: &ConnectionCore) -> Result<()> {
        let slot = conn.lock()?;
        let dbc = ConnectionCore::live(&slot)?;
        let rc = conn
            .cli()
            .set_connect_attr(dbc, ConnectAttr::AutoCommit(false));
        if !succeeded(rc) {
            return Err(conn.error(dbc));
        }
        Ok(())
    }

    fn on_success(&mut self, _conn: &ConnectionCore) -> Result<()> {
        Ok(())
    }
}

struct EndTransactionJob {
    rollback: bool,
}

impl Job for EndTransactionJob {
    type Target = ConnectionCore;
    type Output = ();

    const KIND: OperationKind = OperationKind::EndTransaction;

    /// Autocommit is switched back on whatever the outcome of the commit or
    /// rollback. The first failing step decides the reported error.
    fn work(&mut self, conn: &ConnectionCore) -> Result<()> {
        let slot = conn.lock()?;
        let dbc = ConnectionCore::live(&slot)?;
        let cli = conn.cli();

        let completion = if self.rollback {
            CompletionType::Rollback
        } else {
            CompletionType::Commit
        };
        // Read now: the next call on the handle clears its diagnostics.
        let end_error = (!succeeded(cli.end_tran(dbc, completion))).then(|| conn.error(dbc));

        let rc = cli.set_connect_attr(dbc, ConnectAttr::AutoCommit(true));
        let reset_error = (!succeeded(rc)).then(|| conn.error(dbc));

        match end_error.or(reset_error) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn on_success(&mut self, _conn: &ConnectionCore) -> Result<()> {
        Ok(())
    }
}

struct SetIsolationLevelJob {
    level: IsolationLevel,
}

impl Job for SetIsolationLevelJob {
    type Target = ConnectionCore;
    type Output = bool;

    const KIND: OperationKind = OperationKind::SetIsolationLevel;

    fn work(&mut self, conn: &ConnectionCore) -> Result<()> {
        let slot = conn.lock()?;
        let dbc = ConnectionCore::live(&slot)?;
        let rc = conn
            .cli()
            .set_connect_attr(dbc, ConnectAttr::TxnIsolation(self.level.to_odbc()));
        if !succeeded(rc) {
            return Err(conn.error(dbc));
        }
        Ok(())
    }

    fn on_success(&mut self, _conn: &ConnectionCore) -> Result<bool> {
        Ok(true)
    }
}

impl Connection {
    /// Turns autocommit off.
    pub fn begin_transaction(&self, callback: Option<Callback<()>>) -> Result<()> {
        self.submit_job(CallSite::new(here!(), 0), callback, BeginTransactionJob)
    }

    pub fn begin_transaction_sync(&self) -> Result<()> {
        self.run_job(CallSite::new(here!(), 0), BeginTransactionJob)
    }

    /// Commits, or rolls back when `rollback` is set, then turns autocommit
    /// back on.
    pub fn end_transaction(&self, rollback: bool, callback: Option<Callback<()>>) -> Result<()> {
        self.submit_job(
            CallSite::new(here!(), 1),
            callback,
            EndTransactionJob { rollback },
        )
    }

    pub fn end_transaction_sync(&self, rollback: bool) -> Result<()> {
        self.run_job(CallSite::new(here!(), 1), EndTransactionJob { rollback })
    }

    /// `None` selects READ COMMITTED.
    pub fn set_isolation_level(
        &self,
        level: Option<IsolationLevel>,
        callback: Option<Callback<bool>>,
    ) -> Result<()> {
        self.submit_job(
            CallSite::new(here!(), 1),
            callback,
            SetIsolationLevelJob {
                level: level.unwrap_or_default(),
            },
        )
    }

    pub fn set_isolation_level_sync(&self, level: Option<IsolationLevel>) -> Result<bool> {
        self.run_job(
            CallSite::new(here!(), 0),
            SetIsolationLevelJob {
                level: level.unwrap_or_default(),
            },
        )
    }
}
