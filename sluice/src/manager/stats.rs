use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::manager::FamilyCounts;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    pub total_execution_time: Duration,
    pub tasks_processed: usize,
    pub tasks_succeeded: usize,
    /// Attempts that failed and were retried.
    pub tasks_retried: usize,
    /// Tasks dropped after their last failed attempt.
    pub tasks_failed: usize,
    /// Explicit and capacity reschedules.
    pub tasks_rescheduled: usize,
    pub tasks_skipped: usize,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_execution_time(&mut self, duration: Duration) {
        self.total_execution_time = self.total_execution_time.saturating_add(duration);
        self.tasks_processed += 1;
    }

    pub fn record_success(&mut self) {
        self.tasks_succeeded += 1;
    }

    pub fn record_retry(&mut self) {
        self.tasks_retried += 1;
    }

    pub fn record_failure(&mut self) {
        self.tasks_failed += 1;
    }

    pub fn record_reschedule(&mut self) {
        self.tasks_rescheduled += 1;
    }

    pub fn record_skip(&mut self) {
        self.tasks_skipped += 1;
    }

    pub fn average_execution_time(&self) -> Duration {
        if self.tasks_processed == 0 {
            return Duration::ZERO;
        }
        self.total_execution_time
            .div_f64(self.tasks_processed as f64)
    }

    pub fn merge(&mut self, other: &WorkerStats) {
        self.total_execution_time = self
            .total_execution_time
            .saturating_add(other.total_execution_time);
        self.tasks_processed += other.tasks_processed;
        self.tasks_succeeded += other.tasks_succeeded;
        self.tasks_retried += other.tasks_retried;
        self.tasks_failed += other.tasks_failed;
        self.tasks_rescheduled += other.tasks_rescheduled;
        self.tasks_skipped += other.tasks_skipped;
    }
}

/// Point-in-time view of the whole engine.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EngineStats {
    pub elapsed: Duration,
    pub in_flight: u64,
    pub active_requests: usize,
    pub counts: BTreeMap<String, FamilyCounts>,
    /// `(ready, waiting)`
    pub gated_depth: (usize, usize),
    pub ungated_depth: (usize, usize),
    pub workers: WorkerStats,
}

impl EngineStats {
    pub fn log(&self) {
        tracing::info!("Statistic: working {:.2}s", self.elapsed.as_secs_f64());
        for (family, counts) in &self.counts {
            tracing::info!(
                "Statistic: {:<15} ~ success {}, failure {}",
                family,
                counts.success,
                counts.failure
            );
        }
        tracing::info!(
            "In flight: {}, active requests: {}",
            self.in_flight,
            self.active_requests
        );
        tracing::info!(
            "Ungated scheduler tasks left, ready: {} waiting: {}",
            self.ungated_depth.0,
            self.ungated_depth.1
        );
        tracing::info!(
            "Gated scheduler tasks left, ready: {} waiting: {}",
            self.gated_depth.0,
            self.gated_depth.1
        );
    }
}
