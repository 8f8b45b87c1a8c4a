use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;

/// Global runtime metrics for the collector.
///
/// Purpose:
/// - Track collector invocations and their outcomes
/// - Track rendering session acquisition / release
/// - Track history merges
///
/// Design:
/// - Lock-free (Atomics)
/// - Safe in async + multithreaded contexts
#[derive(Default)]
pub struct RuntimeMetrics {
    // Collectors
    pub collectors_started: AtomicUsize,
    pub collectors_completed: AtomicUsize,
    pub collectors_failed: AtomicUsize,
    pub collectors_timed_out: AtomicUsize,

    // Rendering sessions
    pub sessions_opened: AtomicUsize,
    pub sessions_released: AtomicUsize,
    pub sessions_abandoned: AtomicUsize,

    // History
    pub merges_written: AtomicUsize,
    pub merge_failures: AtomicUsize,
    pub corrupt_recoveries: AtomicUsize,
}

impl RuntimeMetrics {
    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// One-line summary, logged at the end of a run.
    pub fn summary(&self) -> String {
        format!(
            "started={} complete={} failed={} timeouts={} sessions_open={} sessions_released={} sessions_abandoned={} merges={} merge_err={} corrupt_recovered={}",
            self.collectors_started.load(Ordering::Relaxed),
            self.collectors_completed.load(Ordering::Relaxed),
            self.collectors_failed.load(Ordering::Relaxed),
            self.collectors_timed_out.load(Ordering::Relaxed),
            self.sessions_opened.load(Ordering::Relaxed),
            self.sessions_released.load(Ordering::Relaxed),
            self.sessions_abandoned.load(Ordering::Relaxed),
            self.merges_written.load(Ordering::Relaxed),
            self.merge_failures.load(Ordering::Relaxed),
            self.corrupt_recoveries.load(Ordering::Relaxed),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));
