use super::{
    CatalogFilter, Cli, CompletionType, ConnectAttr, FreeStmtOption, HandleKind, RawHandle,
    SqlReturn,
};
use crate::error::{ErrorState, MAX_MESSAGE_LEN};
use crate::protocol::{ParamDirection, ParameterBinding};
use odbc_api::sys;
use std::ffi::c_void;
use std::ptr::{null, null_mut};

const SQL_DIAG_NUMBER: i16 = 2;

/// Driver-manager backed CLI using the narrow (8-bit) ODBC entry points.
#[derive(Debug, Default, Clone, Copy)]
pub struct OdbcCli;

impl OdbcCli {
    pub fn new() -> Self {
        OdbcCli
    }
}

fn handle_type(kind: HandleKind) -> sys::HandleType {
    match kind {
        HandleKind::Env => sys::HandleType::Env,
        HandleKind::Dbc => sys::HandleType::Dbc,
        HandleKind::Stmt => sys::HandleType::Stmt,
    }
}

fn as_handle(handle: RawHandle) -> sys::Handle {
    sys::Handle(handle.0 as *mut c_void)
}

fn as_dbc(handle: RawHandle) -> sys::HDbc {
    sys::HDbc(handle.0 as *mut c_void)
}

fn as_stmt(handle: RawHandle) -> sys::HStmt {
    sys::HStmt(handle.0 as *mut c_void)
}

fn connect_attr(attr: ConnectAttr) -> (sys::ConnectionAttribute, usize) {
    match attr {
        ConnectAttr::AutoCommit(on) => (sys::ConnectionAttribute::AUTOCOMMIT, on as usize),
        ConnectAttr::LoginTimeout(secs) => (sys::ConnectionAttribute::LOGIN_TIMEOUT, secs as usize),
        ConnectAttr::TxnIsolation(level) => {
            (sys::ConnectionAttribute::TXN_ISOLATION, level as usize)
        }
    }
}

fn param_type(direction: ParamDirection) -> sys::ParamType {
    match direction {
        ParamDirection::INPUT_OUTPUT => sys::ParamType::InputOutput,
        d if d.has_output() => sys::ParamType::Output,
        _ => sys::ParamType::Input,
    }
}

fn c_data_type(c_type: crate::protocol::CType) -> sys::CDataType {
    use crate::protocol::CType;
    match c_type {
        CType::Char => sys::CDataType::Char,
        CType::Double => sys::CDataType::Double,
        CType::Binary => sys::CDataType::Binary,
        CType::Bit => sys::CDataType::Bit,
        CType::SBigInt => sys::CDataType::SBigInt,
    }
}

/// Pointer and length for an optional catalog argument.
fn text_arg(value: &Option<String>) -> (*const sys::Char, sys::SmallInt) {
    match value {
        Some(s) => (s.as_ptr(), s.len().min(i16::MAX as usize) as sys::SmallInt),
        None => (null(), 0),
    }
}

impl Cli for OdbcCli {
    fn alloc_handle(&self, kind: HandleKind, parent: RawHandle) -> Result<RawHandle, SqlReturn> {
        let mut out = sys::Handle::null();
        let parent = if parent.is_null() {
            sys::Handle::null()
        } else {
            as_handle(parent)
        };
        // Safety: `out` is a valid location for the new handle; `parent` is
        // either null (environment) or a live handle owned by the caller.
        let rc = unsafe { sys::SQLAllocHandle(handle_type(kind), parent, &mut out) };
        if rc == SqlReturn::SUCCESS || rc == SqlReturn::SUCCESS_WITH_INFO {
            Ok(RawHandle(out.0 as usize))
        } else {
            Err(rc)
        }
    }

    fn free_handle(&self, kind: HandleKind, handle: RawHandle) -> SqlReturn {
        // Safety: the caller frees each handle at most once.
        unsafe { sys::SQLFreeHandle(handle_type(kind), as_handle(handle)) }
    }

    fn set_env_odbc_version(&self, env: RawHandle) -> SqlReturn {
        // Safety: `env` is a live environment handle.
        unsafe {
            sys::SQLSetEnvAttr(
                sys::HEnv(env.0 as *mut c_void),
                sys::EnvironmentAttribute::OdbcVersion,
                sys::AttrOdbcVersion::Odbc3.into(),
                0,
            )
        }
    }

    fn set_connect_attr(&self, dbc: RawHandle, attr: ConnectAttr) -> SqlReturn {
        let (attribute, value) = connect_attr(attr);
        // Safety: integer attributes are passed by value in the pointer slot.
        unsafe { sys::SQLSetConnectAttr(as_dbc(dbc), attribute, value as sys::Pointer, 0) }
    }

    fn driver_connect(&self, dbc: RawHandle, connection_string: &str) -> SqlReturn {
        let mut out_len: sys::SmallInt = 0;
        let len = connection_string.len().min(i16::MAX as usize) as sys::SmallInt;
        // Safety: the connection string outlives the call; no output buffer
        // is requested.
        unsafe {
            sys::SQLDriverConnect(
                as_dbc(dbc),
                null_mut(),
                connection_string.as_ptr(),
                len,
                null_mut(),
                0,
                &mut out_len,
                sys::DriverConnectOption::NoPrompt,
            )
        }
    }

    fn disconnect(&self, dbc: RawHandle) -> SqlReturn {
        // Safety: `dbc` is a live connection handle.
        unsafe { sys::SQLDisconnect(as_dbc(dbc)) }
    }

    fn prepare(&self, stmt: RawHandle, sql: &str) -> SqlReturn {
        // Safety: `sql` outlives the call.
        unsafe { sys::SQLPrepare(as_stmt(stmt), sql.as_ptr(), sql.len() as sys::Integer) }
    }

    fn execute(&self, stmt: RawHandle) -> SqlReturn {
        // Safety: bound parameter buffers are owned by the statement state
        // and stay alive until output values have been read.
        unsafe { sys::SQLExecute(as_stmt(stmt)) }
    }

    fn exec_direct(&self, stmt: RawHandle, sql: &str) -> SqlReturn {
        // Safety: `sql` outlives the call.
        unsafe { sys::SQLExecDirect(as_stmt(stmt), sql.as_ptr(), sql.len() as sys::Integer) }
    }

    fn bind_parameter(&self, stmt: RawHandle, binding: &ParameterBinding<'_>) -> SqlReturn {
        // Safety: the binding borrows the parameter, so both buffers are live
        // and pinned on the heap for as long as the parameter exists.
        unsafe {
            sys::SQLBindParameter(
                as_stmt(stmt),
                binding.number,
                param_type(binding.direction),
                c_data_type(binding.c_type),
                sys::SqlDataType(binding.sql_type),
                binding.column_size as sys::ULen,
                binding.decimal_digits,
                binding.value_ptr as *mut c_void,
                binding.buffer_len as sys::Len,
                binding.indicator_ptr as *mut sys::Len,
            )
        }
    }

    fn free_stmt(&self, stmt: RawHandle, option: FreeStmtOption) -> SqlReturn {
        let option = match option {
            FreeStmtOption::Close => sys::FreeStmtOption::Close,
            FreeStmtOption::Unbind => sys::FreeStmtOption::Unbind,
            FreeStmtOption::ResetParams => sys::FreeStmtOption::ResetParams,
        };
        // Safety: `stmt` is a live statement handle.
        unsafe { sys::SQLFreeStmt(as_stmt(stmt), option) }
    }

    fn row_count(&self, stmt: RawHandle) -> Result<i64, SqlReturn> {
        let mut rows: sys::Len = 0;
        // Safety: `rows` is a valid output location.
        let rc = unsafe { sys::SQLRowCount(as_stmt(stmt), &mut rows) };
        if rc == SqlReturn::SUCCESS || rc == SqlReturn::SUCCESS_WITH_INFO {
            Ok(rows as i64)
        } else {
            Err(rc)
        }
    }

    fn tables(&self, stmt: RawHandle, filter: &CatalogFilter) -> SqlReturn {
        let (catalog, catalog_len) = text_arg(&filter.catalog);
        let (schema, schema_len) = text_arg(&filter.schema);
        let (table, table_len) = text_arg(&filter.table);
        let (kind, kind_len) = text_arg(&filter.last);
        // Safety: every pointer is null or borrowed from `filter`.
        unsafe {
            sys::SQLTables(
                as_stmt(stmt),
                catalog,
                catalog_len,
                schema,
                schema_len,
                table,
                table_len,
                kind,
                kind_len,
            )
        }
    }

    fn columns(&self, stmt: RawHandle, filter: &CatalogFilter) -> SqlReturn {
        let (catalog, catalog_len) = text_arg(&filter.catalog);
        let (schema, schema_len) = text_arg(&filter.schema);
        let (table, table_len) = text_arg(&filter.table);
        let (column, column_len) = text_arg(&filter.last);
        // Safety: every pointer is null or borrowed from `filter`.
        unsafe {
            sys::SQLColumns(
                as_stmt(stmt),
                catalog,
                catalog_len,
                schema,
                schema_len,
                table,
                table_len,
                column,
                column_len,
            )
        }
    }

    fn end_tran(&self, dbc: RawHandle, completion: CompletionType) -> SqlReturn {
        let completion = match completion {
            CompletionType::Commit => sys::CompletionType::Commit,
            CompletionType::Rollback => sys::CompletionType::Rollback,
        };
        // Safety: `dbc` is a live connection handle.
        unsafe { sys::SQLEndTran(sys::HandleType::Dbc, as_handle(dbc), completion) }
    }

    fn diag_number(&self, kind: HandleKind, handle: RawHandle) -> Result<i32, SqlReturn> {
        let mut count: sys::Integer = 0;
        let mut len: sys::SmallInt = 0;
        // Safety: `count` receives an SQLINTEGER header field. Numeric fields
        // are identical for the narrow and wide entry points.
        let rc = unsafe {
            sys::SQLGetDiagFieldW(
                handle_type(kind),
                as_handle(handle),
                0,
                SQL_DIAG_NUMBER,
                &mut count as *mut sys::Integer as sys::Pointer,
                0,
                &mut len,
            )
        };
        if rc == SqlReturn::SUCCESS || rc == SqlReturn::SUCCESS_WITH_INFO {
            Ok(count)
        } else {
            Err(rc)
        }
    }

    fn diag_record(
        &self,
        kind: HandleKind,
        handle: RawHandle,
        record: i16,
    ) -> Result<ErrorState, SqlReturn> {
        let mut state = [0u8; 6];
        let mut native: sys::Integer = 0;
        let mut message = vec![0u8; MAX_MESSAGE_LEN + 1];
        let mut text_len: sys::SmallInt = 0;
        // Safety: buffers are sized as passed.
        let rc = unsafe {
            sys::SQLGetDiagRec(
                handle_type(kind),
                as_handle(handle),
                record,
                state.as_mut_ptr(),
                &mut native,
                message.as_mut_ptr(),
                message.len() as sys::SmallInt,
                &mut text_len,
            )
        };
        if rc != SqlReturn::SUCCESS && rc != SqlReturn::SUCCESS_WITH_INFO {
            return Err(rc);
        }
        let text_len = (text_len.max(0) as usize).min(MAX_MESSAGE_LEN);
        Ok(ErrorState::new(
            &String::from_utf8_lossy(&state[..5]),
            native,
            &String::from_utf8_lossy(&message[..text_len]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CType;

    #[test]
    fn test_raw_handle_conversions_keep_address() {
        let raw = RawHandle(0x1000);
        assert_eq!(as_handle(raw).0 as usize, 0x1000);
        assert_eq!(as_dbc(raw).as_handle(), as_handle(raw));
        assert_eq!(as_stmt(raw).as_handle(), as_handle(raw));
    }

    #[test]
    fn test_connect_attr_mapping() {
        assert_eq!(
            connect_attr(ConnectAttr::AutoCommit(false)),
            (sys::ConnectionAttribute::AUTOCOMMIT, 0)
        );
        assert_eq!(
            connect_attr(ConnectAttr::LoginTimeout(30)),
            (sys::ConnectionAttribute::LOGIN_TIMEOUT, 30)
        );
        assert_eq!(
            connect_attr(ConnectAttr::TxnIsolation(8)),
            (sys::ConnectionAttribute::TXN_ISOLATION, 8)
        );
    }

    #[test]
    fn test_param_direction_mapping() {
        assert_eq!(param_type(ParamDirection::INPUT), sys::ParamType::Input);
        assert_eq!(param_type(ParamDirection::OUTPUT), sys::ParamType::Output);
        assert_eq!(
            param_type(ParamDirection::INPUT_OUTPUT),
            sys::ParamType::InputOutput
        );
    }

    #[test]
    fn test_c_type_codes_match_driver_manager() {
        for c_type in [
            CType::Char,
            CType::Double,
            CType::Binary,
            CType::Bit,
            CType::SBigInt,
        ] {
            assert_eq!(c_data_type(c_type) as i16, c_type as i16);
        }
    }
}
