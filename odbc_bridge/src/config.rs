use crate::error::DEFAULT_ERROR_LABEL;

/// Login timeout applied to new connections and to out-of-range values.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u32 = 30;
/// Largest login timeout accepted.
pub const MAX_CONNECT_TIMEOUT_SECS: u32 = 32767;

pub const DEFAULT_WORKER_THREADS: usize = 4;
pub const MAX_WORKER_THREADS: usize = 64;
pub const DEFAULT_SCRATCH_BUFFER_LEN: usize = 1024 * 1024;
pub const DEFAULT_OUTPUT_BUFFER_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound of the blocking worker pool.
    pub worker_threads: usize,
    pub connect_timeout_secs: u32,
    /// Size of each statement's decode buffer.
    pub scratch_buffer_len: usize,
    /// Room for output string/binary parameters declared without a length.
    pub output_buffer_len: usize,
    pub error_label: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            scratch_buffer_len: DEFAULT_SCRATCH_BUFFER_LEN,
            output_buffer_len: DEFAULT_OUTPUT_BUFFER_LEN,
            error_label: DEFAULT_ERROR_LABEL.to_string(),
        }
    }
}

impl EngineConfig {
    /// Reads `ODBC_BRIDGE_*` overrides. Unparseable or out-of-range values
    /// keep the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_threads: env_value("ODBC_BRIDGE_WORKER_THREADS")
                .filter(|n: &usize| (1..=MAX_WORKER_THREADS).contains(n))
                .unwrap_or(defaults.worker_threads),
            connect_timeout_secs: clamp_connect_timeout(
                env_value::<i64>("ODBC_BRIDGE_CONNECT_TIMEOUT")
                    .unwrap_or(i64::from(defaults.connect_timeout_secs)),
            ),
            scratch_buffer_len: env_value("ODBC_BRIDGE_SCRATCH_BUFFER_LEN")
                .unwrap_or(defaults.scratch_buffer_len),
            output_buffer_len: env_value("ODBC_BRIDGE_OUTPUT_BUFFER_LEN")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.output_buffer_len),
            error_label: std::env::var("ODBC_BRIDGE_ERROR_LABEL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.error_label),
        }
    }
}

fn env_value<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring {}={:?}: not a valid number", name, raw);
            None
        }
    }
}

/// Values outside `0..=32767` fall back to the default of 30 seconds.
pub fn clamp_connect_timeout(secs: i64) -> u32 {
    match u32::try_from(secs) {
        Ok(s) if s <= MAX_CONNECT_TIMEOUT_SECS => s,
        _ => DEFAULT_CONNECT_TIMEOUT_SECS,
    }
}
