use crate::error::{OdbcError, Result};
use std::alloc::{alloc, Layout};
use std::cell::Cell;

/// Operation tag used in logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Open,
    Close,
    CreateStatement,
    Query,
    Tables,
    Columns,
    BeginTransaction,
    EndTransaction,
    SetIsolationLevel,
    Execute,
    ExecuteDirect,
    ExecuteNonQuery,
    Prepare,
    Bind,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Open => "Open",
            OperationKind::Close => "Close",
            OperationKind::CreateStatement => "CreateStatement",
            OperationKind::Query => "Query",
            OperationKind::Tables => "Tables",
            OperationKind::Columns => "Columns",
            OperationKind::BeginTransaction => "BeginTransaction",
            OperationKind::EndTransaction => "EndTransaction",
            OperationKind::SetIsolationLevel => "SetIsolationLevel",
            OperationKind::Execute => "Execute",
            OperationKind::ExecuteDirect => "ExecuteDirect",
            OperationKind::ExecuteNonQuery => "ExecuteNonQuery",
            OperationKind::Prepare => "Prepare",
            OperationKind::Bind => "Bind",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error delivered to a callback, optionally with whatever the operation
/// produced before failing (a query's result set, for instance).
pub struct Failure<T> {
    pub error: OdbcError,
    pub partial: Option<T>,
}

impl<T> Failure<T> {
    pub fn new(error: OdbcError) -> Self {
        Self {
            error,
            partial: None,
        }
    }

    pub fn with_partial(error: OdbcError, partial: T) -> Self {
        Self {
            error,
            partial: Some(partial),
        }
    }
}

impl<T> From<OdbcError> for Failure<T> {
    fn from(error: OdbcError) -> Self {
        Failure::new(error)
    }
}

impl<T> std::fmt::Debug for Failure<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Failure")
            .field("error", &self.error)
            .field("partial", &self.partial.is_some())
            .finish()
    }
}

/// What an async callback receives: error first, by convention.
pub type JobResult<T> = std::result::Result<T, Failure<T>>;

pub type Callback<T> = Box<dyn FnOnce(JobResult<T>) + Send + 'static>;

/// One operation invocation, split into a blocking phase and a completion
/// phase.
///
/// `work` is the only phase allowed to call into the CLI. It records errors
/// instead of delivering them; `on_success` / `on_failure` turn the outcome
/// into the caller-facing value. Each job runs exactly one completion.
pub trait Job: Send + 'static {
    type Target: Send + Sync + 'static;
    type Output: Send + 'static;

    const KIND: OperationKind;

    fn work(&mut self, target: &Self::Target) -> Result<()>;

    fn on_success(&mut self, target: &Self::Target) -> Result<Self::Output>;

    fn on_failure(&mut self, _target: &Self::Target, error: OdbcError) -> Failure<Self::Output> {
        Failure::new(error)
    }
}

thread_local! {
    static FAIL_NEXT_ALLOCATION: Cell<bool> = const { Cell::new(false) };
}

/// Makes the next [`try_box`] on this thread report allocation failure.
#[cfg(any(test, feature = "test-helpers"))]
pub fn fail_next_allocation() {
    FAIL_NEXT_ALLOCATION.with(|flag| flag.set(true));
}

/// Boxes `value`, returning `None` instead of aborting when the allocator
/// is out of memory.
pub fn try_box<T>(value: T) -> Option<Box<T>> {
    if FAIL_NEXT_ALLOCATION.with(|flag| flag.replace(false)) {
        return None;
    }

    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        return Some(Box::new(value));
    }

    // Safety: `layout` has a non-zero size.
    let ptr = unsafe { alloc(layout) } as *mut T;
    if ptr.is_null() {
        return None;
    }
    // Safety: `ptr` is a fresh allocation with the layout `Box<T>` uses
    // through the global allocator.
    unsafe {
        ptr.write(value);
        Some(Box::from_raw(ptr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_box_allocates() {
        let boxed = try_box([7u64; 4]).expect("allocation");
        assert_eq!(boxed[3], 7);
    }

    #[test]
    fn test_try_box_zero_sized() {
        assert!(try_box(()).is_some());
    }

    #[test]
    fn test_fail_next_allocation_is_one_shot() {
        fail_next_allocation();
        assert!(try_box(1u32).is_none());
        assert!(try_box(1u32).is_some());
    }

    #[test]
    fn test_failure_from_error_has_no_partial() {
        let failure: Failure<u8> = OdbcError::Usage("x".into()).into();
        assert!(failure.partial.is_none());
        assert!(format!("{:?}", failure).contains("partial: false"));
    }

    #[test]
    fn test_operation_kind_names() {
        assert_eq!(OperationKind::ExecuteNonQuery.to_string(), "ExecuteNonQuery");
        assert_eq!(OperationKind::Open.as_str(), "Open");
    }
}
