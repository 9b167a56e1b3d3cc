//! Pipeline execution statistics.
//!
//! One `PipelineStats` is shared by every worker of a running pipeline. All
//! counters are plain atomics updated with relaxed ordering; `snapshot`
//! mirrors them into an immutable struct for reporting.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for one pipeline execution.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Items produced by the generator
    pub items_generated: AtomicU64,
    /// Items delivered to the terminal consumer
    pub items_delivered: AtomicU64,
    /// Items dropped by filter stages
    pub items_filtered: AtomicU64,
    /// Windows emitted by reduce stages
    pub windows_reduced: AtomicU64,
    /// Queue contention events (full on push, spun on pop)
    pub backpressure_events: AtomicU64,
    /// Stage functions that panicked
    pub stage_faults: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_generated(&self) {
        self.items_generated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_delivered(&self) {
        self.items_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_filtered(&self) {
        self.items_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_window(&self) {
        self.windows_reduced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_fault(&self) {
        self.stage_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_backpressure(&self) {
        let count = self.backpressure_events.fetch_add(1, Ordering::Relaxed);
        if count % 10_000 == 0 {
            tracing::debug!(
                target: "pipewright",
                total_backpressure = count + 1,
                "backpressure detected (1/10000)"
            );
        }
    }

    /// Get snapshot of current stats
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            items_generated: self.items_generated.load(Ordering::Relaxed),
            items_delivered: self.items_delivered.load(Ordering::Relaxed),
            items_filtered: self.items_filtered.load(Ordering::Relaxed),
            windows_reduced: self.windows_reduced.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
            stage_faults: self.stage_faults.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of stats (for reporting)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub items_generated: u64,
    pub items_delivered: u64,
    pub items_filtered: u64,
    pub windows_reduced: u64,
    pub backpressure_events: u64,
    pub stage_faults: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pipeline Stats: generated={}, delivered={}, filtered={}, windows={}, backpressure={}, faults={}",
            self.items_generated,
            self.items_delivered,
            self.items_filtered,
            self.windows_reduced,
            self.backpressure_events,
            self.stage_faults
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_into_snapshot() {
        let stats = PipelineStats::new();

        stats.incr_generated();
        stats.incr_generated();
        stats.incr_delivered();
        stats.incr_filtered();
        stats.incr_window();
        stats.incr_fault();

        let snap = stats.snapshot();
        assert_eq!(snap.items_generated, 2);
        assert_eq!(snap.items_delivered, 1);
        assert_eq!(snap.items_filtered, 1);
        assert_eq!(snap.windows_reduced, 1);
        assert_eq!(snap.stage_faults, 1);
        assert_eq!(snap.backpressure_events, 0);
    }

    #[test]
    fn snapshot_displays_every_counter() {
        let stats = PipelineStats::new();
        stats.incr_generated();
        let rendered = stats.snapshot().to_string();
        assert!(rendered.contains("generated=1"));
        assert!(rendered.contains("backpressure=0"));
    }
}
