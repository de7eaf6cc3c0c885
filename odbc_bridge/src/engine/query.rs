use super::connection::{Connection, ConnectionCore};
use super::result_set::ResultSet;
use crate::async_bridge::{here, CallSite, Callback, Failure, Job, OperationKind};
use crate::cli::{is_hard_error, succeeded, HandleKind, OwnedHandle};
use crate::error::{OdbcError, Result};
use crate::protocol::{Param, ParamValue, ParameterList};
use serde_json::Value;
use std::sync::Arc;

/// A query as issued by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub sql: String,
    pub params: Vec<Param>,
    /// Free the statement right after execution instead of returning a
    /// result set. OUT parameters are still returned.
    pub no_results: bool,
    callback_index: usize,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            no_results: false,
            callback_index: 1,
        }
    }

    pub fn with_params(mut self, params: Vec<Param>) -> Self {
        self.params = params;
        self.callback_index = 2;
        self
    }

    pub fn no_results(mut self, no_results: bool) -> Self {
        self.no_results = no_results;
        self
    }

    /// Position the callback takes after these arguments.
    pub fn callback_index(&self) -> usize {
        self.callback_index
    }

    /// Parses the host argument list preceding the callback. Accepted
    /// shapes are `(sql)`, `(sql, params[])` and
    /// `({ sql, params?, noResults? })`.
    pub fn from_host_args(args: &[Value]) -> Result<Self> {
        match args {
            [Value::String(sql)] => Ok(Self::new(sql.as_str())),
            [Value::String(sql), Value::Array(params)] => {
                Ok(Self::new(sql.as_str()).with_params(parse_params(params)?))
            }
            [Value::String(_), _] => Err(OdbcError::Usage(
                "Argument 1 must be an Array".to_string(),
            )),
            [Value::Object(options)] => {
                let sql = match options.get("sql") {
                    Some(Value::String(sql)) => sql.as_str(),
                    _ => {
                        return Err(OdbcError::Usage(
                            "Query options must contain a string sql property".to_string(),
                        ));
                    }
                };
                let params = match options.get("params") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(params)) => parse_params(params)?,
                    Some(_) => {
                        return Err(OdbcError::Usage(
                            "Query option params must be an Array".to_string(),
                        ));
                    }
                };
                let no_results = match options.get("noResults") {
                    None | Some(Value::Null) => false,
                    Some(Value::Bool(b)) => *b,
                    Some(_) => {
                        return Err(OdbcError::Usage(
                            "Query option noResults must be a Boolean".to_string(),
                        ));
                    }
                };
                Ok(Self {
                    sql: sql.to_string(),
                    params,
                    no_results,
                    callback_index: 1,
                })
            }
            _ => Err(OdbcError::Usage(
                "Argument 0 must be a String or an Object".to_string(),
            )),
        }
    }
}

impl From<&str> for QueryRequest {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

fn parse_params(values: &[Value]) -> Result<Vec<Param>> {
    values.iter().map(Param::from_json).collect()
}

/// What a query hands back: the result set, unless `no_results` was set,
/// and the OUT/INOUT values in parameter order when any were declared.
#[derive(Debug)]
pub struct QueryOutput {
    pub result: Option<ResultSet>,
    pub out_params: Option<Vec<ParamValue>>,
}

struct QueryJob {
    sql: String,
    params: ParameterList,
    no_results: bool,
    stmt: Option<OwnedHandle>,
    out_params: Option<Vec<ParamValue>>,
}

impl QueryJob {
    fn new(request: QueryRequest, output_len: usize) -> Result<Self> {
        let params = ParameterList::from_params(&request.params, output_len)?;
        Ok(Self {
            sql: request.sql,
            params,
            no_results: request.no_results,
            stmt: None,
            out_params: None,
        })
    }

    fn execute(&mut self, conn: &ConnectionCore) -> Result<()> {
        let slot = conn.lock()?;
        let dbc = ConnectionCore::live(&slot)?;
        let cli = conn.cli();
        let stmt = self.stmt.insert(conn.alloc_statement(dbc)?).raw();

        let rc = if self.params.is_empty() {
            cli.exec_direct(stmt, &self.sql)
        } else {
            let mut rc = cli.prepare(stmt, &self.sql);
            if succeeded(rc) {
                rc = self.params.bind(&**cli, stmt);
            }
            if succeeded(rc) {
                rc = cli.execute(stmt);
            }
            rc
        };

        if is_hard_error(rc) {
            return Err(super::driver_error(&**cli, HandleKind::Stmt, stmt, conn.label()));
        }
        if succeeded(rc) {
            self.out_params = self.params.output_values();
        }
        if self.no_results {
            self.stmt = None;
        }
        Ok(())
    }

    fn result(&mut self, conn: &ConnectionCore) -> Option<ResultSet> {
        self.stmt
            .take()
            .map(|stmt| ResultSet::owning(Arc::clone(conn.cli()), stmt, conn.label()))
    }
}

impl Job for QueryJob {
    type Target = ConnectionCore;
    type Output = QueryOutput;

    const KIND: OperationKind = OperationKind::Query;

    fn work(&mut self, conn: &ConnectionCore) -> Result<()> {
        let outcome = self.execute(conn);
        // Output values have been copied out; the buffers can go.
        self.params.free();
        outcome
    }

    fn on_success(&mut self, conn: &ConnectionCore) -> Result<QueryOutput> {
        Ok(QueryOutput {
            result: self.result(conn),
            out_params: self.out_params.take(),
        })
    }

    fn on_failure(&mut self, conn: &ConnectionCore, error: OdbcError) -> Failure<QueryOutput> {
        match self.result(conn) {
            Some(result) => Failure::with_partial(
                error,
                QueryOutput {
                    result: Some(result),
                    out_params: None,
                },
            ),
            None => Failure::new(error),
        }
    }
}

impl Connection {
    /// Runs `request` in the background. Without parameters the SQL is
    /// executed directly, otherwise it is prepared, bound and executed.
    pub fn query(
        &self,
        request: impl Into<QueryRequest>,
        callback: Option<Callback<QueryOutput>>,
    ) -> Result<()> {
        let request = request.into();
        let site = CallSite::new(here!(), request.callback_index());
        let output_len = self.context().config.output_buffer_len;
        self.submit_job(site, callback, QueryJob::new(request, output_len)?)
    }

    /// Runs `request` on the calling thread. On failure the statement is
    /// freed before the error is returned.
    pub fn query_sync(&self, request: impl Into<QueryRequest>) -> Result<QueryOutput> {
        let request = request.into();
        let site = CallSite::new(here!(), request.callback_index());
        let output_len = self.context().config.output_buffer_len;
        self.run_job(site, QueryJob::new(request, output_len)?)
    }
}
