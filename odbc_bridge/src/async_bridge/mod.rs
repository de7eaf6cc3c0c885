//! Two-phase job execution.
//!
//! `work` runs on a bounded pool of blocking threads owned by a tokio
//! runtime. Completions run, one at a time, on the dedicated
//! `odbc-completion` thread, which is the only thread that invokes async
//! callbacks. Sync calls run both phases inline on the caller's thread.
//! There is no cancellation: a submitted job always runs to completion.

mod job;

pub use job::{try_box, Callback, Failure, Job, JobResult, OperationKind};

#[cfg(any(test, feature = "test-helpers"))]
pub use job::fail_next_allocation;

use crate::config::EngineConfig;
use crate::error::{OdbcError, Result};
use crate::handles::Pinned;
use crate::observability::{StructuredLogger, JOB_METRICS};
use log::Level;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, OnceLock, RwLock};
use std::time::Instant;
use tokio::runtime::Runtime;

/// `file:line` of the invocation, used as a job's origin.
macro_rules! here {
    () => {
        concat!(file!(), ":", line!())
    };
}
pub(crate) use here;

static LOGGER: StructuredLogger = StructuredLogger::new(true);

static DISPATCHER: OnceLock<std::result::Result<Dispatcher, String>> = OnceLock::new();

static LOW_MEMORY_HANDLER: RwLock<Option<fn()>> = RwLock::new(None);

/// Where an operation was invoked from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub origin: &'static str,
    /// Position of the callback among the call's arguments.
    pub callback_index: usize,
}

impl CallSite {
    pub const fn new(origin: &'static str, callback_index: usize) -> Self {
        Self {
            origin,
            callback_index,
        }
    }
}

trait Completion: Send {
    fn complete(self: Box<Self>);
}

struct Dispatcher {
    runtime: Runtime,
    completions: Mutex<Sender<Box<dyn Completion>>>,
}

impl Dispatcher {
    fn start(config: &EngineConfig) -> std::result::Result<Self, String> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.worker_threads.max(1))
            .thread_name("odbc-worker")
            .build()
            .map_err(|e| format!("Failed to create tokio runtime: {}", e))?;

        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("odbc-completion".to_string())
            .spawn(move || completion_loop(rx))
            .map_err(|e| format!("Failed to start completion thread: {}", e))?;

        log::debug!(
            "Dispatcher started with {} worker thread(s)",
            config.worker_threads
        );
        Ok(Self {
            runtime,
            completions: Mutex::new(tx),
        })
    }

    fn sender(&self) -> Result<Sender<Box<dyn Completion>>> {
        self.completions
            .lock()
            .map(|tx| tx.clone())
            .map_err(|_| OdbcError::InternalError("Failed to lock completion channel".to_string()))
    }
}

fn completion_loop(rx: Receiver<Box<dyn Completion>>) {
    while let Ok(task) = rx.recv() {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(move || task.complete())) {
            LOGGER.log_error(
                "Uncaught panic in completion callback; aborting",
                &[("panic", panic_message(&*panic))],
            );
            std::process::abort();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Starts the worker pool and completion thread. Later calls keep the
/// first configuration.
pub fn init_runtime(config: &EngineConfig) -> Result<()> {
    match DISPATCHER.get_or_init(|| Dispatcher::start(config)) {
        Ok(_) => Ok(()),
        Err(msg) => Err(OdbcError::InternalError(msg.clone())),
    }
}

fn dispatcher() -> Result<&'static Dispatcher> {
    match DISPATCHER.get_or_init(|| Dispatcher::start(&EngineConfig::from_env())) {
        Ok(d) => Ok(d),
        Err(msg) => Err(OdbcError::InternalError(msg.clone())),
    }
}

/// Installs the hook asked to free memory after a job allocation fails.
pub fn set_low_memory_handler(handler: fn()) {
    if let Ok(mut slot) = LOW_MEMORY_HANDLER.write() {
        *slot = Some(handler);
    }
}

fn request_memory_reclaim() {
    let handler = LOW_MEMORY_HANDLER.read().ok().and_then(|slot| *slot);
    match handler {
        Some(handler) => handler(),
        None => log::warn!("Low memory: no reclamation handler installed"),
    }
}

struct Task<J: Job> {
    site: CallSite,
    job: Box<J>,
    target: Pinned<J::Target>,
    callback: Callback<J::Output>,
    outcome: Result<()>,
}

impl<J: Job> Task<J> {
    fn run_work(&mut self) {
        let start = Instant::now();
        let job = &mut self.job;
        let target = &*self.target;
        self.outcome = match catch_unwind(AssertUnwindSafe(|| job.work(target))) {
            Ok(outcome) => outcome,
            Err(panic) => Err(OdbcError::InternalError(format!(
                "{} work panicked: {}",
                J::KIND,
                panic_message(&*panic)
            ))),
        };
        let elapsed = start.elapsed();
        JOB_METRICS.record_work(elapsed);
        LOGGER.log_job(
            Level::Debug,
            J::KIND.as_str(),
            self.site.origin,
            &[
                ("phase", "work".to_string()),
                ("ok", self.outcome.is_ok().to_string()),
                ("elapsed_us", elapsed.as_micros().to_string()),
            ],
        );
    }
}

impl<J: Job> Completion for Task<J> {
    fn complete(self: Box<Self>) {
        let Task {
            site,
            mut job,
            target,
            callback,
            outcome,
        } = *self;

        let result = match outcome {
            Ok(()) => job.on_success(&target).map_err(Failure::new),
            Err(error) => Err(job.on_failure(&target, error)),
        };
        let failed = result.is_err();
        if let Err(failure) = &result {
            log::warn!("{} at {} failed: {}", J::KIND, site.origin, failure.error);
        }

        callback(result);

        // The job goes before the pin so the target outlives everything the
        // job captured.
        drop(job);
        drop(target);
        JOB_METRICS.record_completed(failed);
    }
}

/// Runs `job` in the background and delivers its outcome to `callback` on
/// the completion thread.
///
/// Fails synchronously, scheduling nothing, when the callback is missing
/// (usage error), when the job could not be allocated (out of memory,
/// tagged with the call site's origin) or when the target cannot be pinned.
pub fn submit<J, P>(
    site: CallSite,
    callback: Option<Callback<J::Output>>,
    job: Option<Box<J>>,
    pin: P,
) -> Result<()>
where
    J: Job,
    P: FnOnce() -> Result<Pinned<J::Target>>,
{
    let Some(callback) = callback else {
        JOB_METRICS.record_rejected();
        return Err(OdbcError::Usage(format!(
            "Argument {} must be a function",
            site.callback_index
        )));
    };

    let Some(job) = job else {
        JOB_METRICS.record_allocation_failure();
        request_memory_reclaim();
        return Err(OdbcError::OutOfMemory {
            origin: site.origin,
        });
    };

    let target = pin()?;
    let dispatcher = dispatcher()?;
    let sender = dispatcher.sender()?;

    let mut task = Box::new(Task {
        site,
        job,
        target,
        callback,
        outcome: Ok(()),
    });

    JOB_METRICS.record_submitted();
    LOGGER.log_job(
        Level::Debug,
        J::KIND.as_str(),
        site.origin,
        &[("phase", "submit".to_string())],
    );

    dispatcher.runtime.spawn_blocking(move || {
        task.run_work();
        if sender.send(task).is_err() {
            LOGGER.log_error(
                "Completion thread is gone; job dropped",
                &[("kind", J::KIND.as_str().to_string()), ("origin", site.origin.to_string())],
            );
        }
    });
    Ok(())
}

/// Runs both phases of `job` on the calling thread. A failure's partial
/// output is released here; only the error reaches the caller.
pub fn run_sync<J: Job>(site: CallSite, target: &J::Target, mut job: J) -> Result<J::Output> {
    let start = Instant::now();
    let result = match job.work(target) {
        Ok(()) => job.on_success(target),
        Err(error) => Err(job.on_failure(target, error).error),
    };
    let elapsed = start.elapsed();

    JOB_METRICS.record_work(elapsed);
    JOB_METRICS.record_sync_run(result.is_err());
    LOGGER.log_job(
        Level::Debug,
        J::KIND.as_str(),
        site.origin,
        &[
            ("phase", "sync".to_string()),
            ("ok", result.is_ok().to_string()),
            ("elapsed_us", elapsed.as_micros().to_string()),
        ],
    );
    result
}
