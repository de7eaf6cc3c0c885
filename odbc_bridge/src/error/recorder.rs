use crate::cli::{Cli, HandleKind, RawHandle};

/// SQLSTATE reported when the diagnostics themselves cannot be read.
pub const PLACEHOLDER_STATE: &str = "XXXXX";

/// `SQL_MAX_MESSAGE_LENGTH`.
pub const MAX_MESSAGE_LEN: usize = 512;

/// Last diagnostic record captured from a CLI handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorState {
    pub sql_state: String,
    pub native_code: i32,
    pub message: String,
}

impl ErrorState {
    pub fn new(sql_state: &str, native_code: i32, message: &str) -> Self {
        Self {
            sql_state: sql_state.chars().take(5).collect(),
            native_code,
            message: truncate(message, MAX_MESSAGE_LEN),
        }
    }

    pub fn placeholder(message: String) -> Self {
        Self {
            sql_state: PLACEHOLDER_STATE.to_string(),
            native_code: 0,
            message,
        }
    }
}

fn truncate(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

/// Reads the most recent diagnostic record of `handle`. Earlier records in
/// the chain are not collected.
pub fn record_error(cli: &dyn Cli, kind: HandleKind, handle: RawHandle) -> ErrorState {
    let count = match cli.diag_number(kind, handle) {
        Ok(n) => n,
        Err(rc) => {
            return ErrorState::placeholder(format!("SQLGetDiagField(): error {}", rc.0));
        }
    };

    let record = i16::try_from(count).unwrap_or(i16::MAX);
    match cli.diag_record(kind, handle, record) {
        Ok(state) => {
            log::debug!(
                "{} diagnostic [{}] {}",
                kind.as_str(),
                state.sql_state,
                state.message
            );
            ErrorState::new(&state.sql_state, state.native_code, &state.message)
        }
        Err(rc) => ErrorState::placeholder(format!("SQLGetDiagRec(): error {}", rc.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::fake::{FakeCli, FakeOp};
    use crate::cli::{Cli, SqlReturn};

    #[test]
    fn test_records_last_diagnostic() {
        let fake = FakeCli::new();
        let stmt = fake.alloc_handle(HandleKind::Stmt, RawHandle::NULL).unwrap();
        fake.push_diagnostic(stmt, ErrorState::new("01000", 0, "first"));
        fake.push_diagnostic(stmt, ErrorState::new("42S02", 208, "second"));

        let state = record_error(&fake, HandleKind::Stmt, stmt);
        assert_eq!(state.sql_state, "42S02");
        assert_eq!(state.native_code, 208);
        assert_eq!(state.message, "second");
    }

    #[test]
    fn test_placeholder_when_diag_field_fails() {
        let fake = FakeCli::new();
        let stmt = fake.alloc_handle(HandleKind::Stmt, RawHandle::NULL).unwrap();
        fake.script_return(FakeOp::DiagNumber, SqlReturn::ERROR);

        let state = record_error(&fake, HandleKind::Stmt, stmt);
        assert_eq!(state.sql_state, PLACEHOLDER_STATE);
        assert_eq!(state.message, "SQLGetDiagField(): error -1");
    }

    #[test]
    fn test_placeholder_when_no_record() {
        let fake = FakeCli::new();
        let stmt = fake.alloc_handle(HandleKind::Stmt, RawHandle::NULL).unwrap();

        let state = record_error(&fake, HandleKind::Stmt, stmt);
        assert_eq!(state.sql_state, PLACEHOLDER_STATE);
        assert!(state.message.starts_with("SQLGetDiagRec(): error"));
    }

    #[test]
    fn test_message_truncated() {
        let long = "x".repeat(MAX_MESSAGE_LEN + 100);
        let state = ErrorState::new("HY000", 0, &long);
        assert_eq!(state.message.len(), MAX_MESSAGE_LEN);
    }

    #[test]
    fn test_state_truncated_to_five_chars() {
        let state = ErrorState::new("HY0001", 0, "m");
        assert_eq!(state.sql_state, "HY000");
    }
}
