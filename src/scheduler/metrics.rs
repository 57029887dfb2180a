use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Compute job counters, updated at the scheduler's transition points.
///
/// `active` and `waiting` are gauges tracking the live maps; the rest are
/// monotone counters.
#[derive(Default)]
pub struct SchedulerMetrics {
    started: AtomicU64,
    finished: AtomicU64,
    canceled: AtomicU64,
    rejected: AtomicU64,
    active: AtomicI64,
    waiting: AtomicI64,
    total_execution_time_ms: AtomicU64,
    total_wait_time_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub started: u64,
    pub finished: u64,
    pub canceled: u64,
    pub rejected: u64,
    pub active: i64,
    pub waiting: i64,
    pub total_execution_time_ms: u64,
    pub total_wait_time_ms: u64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_finished(&self, execution_time_ms: u64) {
        self.finished.fetch_add(1, Ordering::Relaxed);
        self.total_execution_time_ms
            .fetch_add(execution_time_ms, Ordering::Relaxed);
    }

    pub fn job_canceled(&self) {
        self.canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_incremented(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_decremented(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn waiting_incremented(&self) {
        self.waiting.fetch_add(1, Ordering::Relaxed);
    }

    pub fn waiting_decremented(&self, waited_ms: u64) {
        self.waiting.fetch_sub(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(waited_ms, Ordering::Relaxed);
    }

    pub fn reset_active(&self) {
        self.active.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            waiting: self.waiting.load(Ordering::Relaxed),
            total_execution_time_ms: self.total_execution_time_ms.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
        }
    }
}
