pub mod async_bridge;
pub mod cli;
pub mod config;
pub mod engine;
mod error;
pub mod ffi;
mod handles;
pub mod observability;
pub mod protocol;
#[cfg(feature = "test-helpers")]
pub mod test_helpers;

pub use async_bridge::{set_low_memory_handler, Callback, Failure, JobResult};
pub use config::EngineConfig;
pub use engine::{
    CloseOption, Connection, Environment, ExecuteOutput, IsolationLevel, QueryOutput,
    QueryRequest, ResultSet, Statement,
};
pub use error::{ErrorKind, ErrorState, OdbcError, Result, SqlError};
pub use protocol::{Param, ParamDirection, ParamValue};
