//! Connections, statements and the jobs that drive them.
//!
//! Every operation exists in two forms sharing one [`Job`](crate::async_bridge::Job)
//! body: an async form that takes a callback and returns once the job is
//! scheduled, and a `_sync` form that runs the job on the calling thread.

mod catalog;
mod connection;
mod environment;
mod query;
mod result_set;
mod statement;
mod transaction;

pub use connection::Connection;
pub use environment::Environment;
pub use query::{QueryOutput, QueryRequest};
pub use result_set::ResultSet;
pub use statement::{CloseOption, ExecuteOutput, Statement};
pub use transaction::IsolationLevel;

use crate::cli::{Cli, HandleKind, RawHandle};
use crate::error::{record_error, OdbcError};
use crate::observability::StructuredLogger;

static LOGGER: StructuredLogger = StructuredLogger::new(true);

/// Reads the last diagnostic of `handle` into a driver error.
fn driver_error(cli: &dyn Cli, kind: HandleKind, handle: RawHandle, label: &str) -> OdbcError {
    OdbcError::from_state(&record_error(cli, kind, handle), label)
}
