use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

lazy_static::lazy_static! {
    /// Process-wide job counters, shared by every environment.
    pub static ref JOB_METRICS: JobMetrics = JobMetrics::new();
}

#[derive(Debug, Clone)]
pub struct LatencyStats {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyStats {
    pub fn new() -> Self {
        Self {
            count: 0,
            total: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
        }
    }

    pub fn record(&mut self, latency: Duration) {
        self.count += 1;
        self.total += latency;

        if latency < self.min {
            self.min = latency;
        }
        if latency > self.max {
            self.max = latency;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobMetricsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub sync_runs: u64,
    pub rejected: u64,
    pub allocation_failures: u64,
}

impl JobMetricsSnapshot {
    /// Async jobs submitted but not yet completed.
    pub fn in_flight(&self) -> u64 {
        self.submitted.saturating_sub(self.completed)
    }
}

/// Counters for the job dispatcher.
pub struct JobMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    sync_runs: AtomicU64,
    rejected: AtomicU64,
    allocation_failures: AtomicU64,
    work_latency: Mutex<LatencyStats>,
}

impl JobMetrics {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            sync_runs: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            allocation_failures: AtomicU64::new(0),
            work_latency: Mutex::new(LatencyStats::new()),
        }
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, failed: bool) {
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.completed.fetch_add(1, Ordering::Release);
    }

    pub fn record_sync_run(&self, failed: bool) {
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.sync_runs.fetch_add(1, Ordering::Relaxed);
    }

    /// A call refused before anything was scheduled.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allocation_failure(&self) {
        self.allocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_work(&self, latency: Duration) {
        if let Ok(mut stats) = self.work_latency.lock() {
            stats.record(latency);
        }
    }

    pub fn work_latency(&self) -> LatencyStats {
        self.work_latency
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| LatencyStats::new())
    }

    pub fn snapshot(&self) -> JobMetricsSnapshot {
        JobMetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Relaxed),
            sync_runs: self.sync_runs.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for JobMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_stats_new() {
        let stats = LatencyStats::new();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.total, Duration::ZERO);
    }

    #[test]
    fn test_latency_stats_min_max_total() {
        let mut stats = LatencyStats::new();
        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(30));

        assert_eq!(stats.count, 2);
        assert_eq!(stats.min, Duration::from_millis(10));
        assert_eq!(stats.max, Duration::from_millis(30));
        assert_eq!(stats.total, Duration::from_millis(40));
    }

    #[test]
    fn test_job_metrics_counters() {
        let metrics = JobMetrics::new();
        metrics.record_submitted();
        metrics.record_submitted();
        metrics.record_completed(false);
        metrics.record_sync_run(true);
        metrics.record_rejected();
        metrics.record_allocation_failure();

        let snap = metrics.snapshot();
        assert_eq!(snap.submitted, 2);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.in_flight(), 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.sync_runs, 1);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.allocation_failures, 1);
    }

    #[test]
    fn test_job_metrics_work_latency() {
        let metrics = JobMetrics::new();
        metrics.record_work(Duration::from_millis(5));
        assert_eq!(metrics.work_latency().count, 1);
    }
}
