//! Execution policy for native pipelines.
//!
//! A small value object that travels with the pipeline and with each stage
//! descriptor: worker count, queue capacity and mode, and whether parallel
//! stages restore generator order. Worker threads check in and out through
//! the policy; the shared active-thread count is the hook reserved for
//! future pinning and instrumentation.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;

use crate::error::PipelineError;
use crate::queue::QueueMode;

/// Default queue capacity per stage edge.
pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// Fallback worker count when hardware parallelism cannot be probed.
const DEFAULT_NUM_THREADS: usize = 4;

/// Execution parameters for one pipeline run.
///
/// Loadable from YAML:
///
/// ```yaml
/// num_threads: 8
/// queue_size: 256
/// queue_mode: lockfree
/// ordering: false
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionPolicy {
    num_threads: usize,
    queue_size: usize,
    queue_mode: QueueMode,
    ordering: bool,
    #[serde(skip)]
    active_threads: Arc<AtomicUsize>,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            num_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(DEFAULT_NUM_THREADS),
            queue_size: DEFAULT_QUEUE_SIZE,
            queue_mode: QueueMode::default(),
            ordering: true,
            active_threads: Arc::default(),
        }
    }
}

impl ExecutionPolicy {
    /// Policy with hardware concurrency, blocking queues, ordering on.
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy with an explicit concurrency degree.
    pub fn with_concurrency(degree: usize) -> Self {
        let mut policy = Self::default();
        policy.num_threads = degree;
        policy
    }

    pub fn set_concurrency_degree(&mut self, degree: usize) {
        self.num_threads = degree;
    }

    pub fn concurrency_degree(&self) -> usize {
        self.num_threads
    }

    pub fn set_queue_size(&mut self, size: usize) {
        self.queue_size = size;
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    pub fn set_queue_mode(&mut self, mode: QueueMode) {
        self.queue_mode = mode;
    }

    pub fn queue_mode(&self) -> QueueMode {
        self.queue_mode
    }

    pub fn enable_ordering(&mut self) {
        self.ordering = true;
    }

    pub fn disable_ordering(&mut self) {
        self.ordering = false;
    }

    pub fn is_ordered(&self) -> bool {
        self.ordering
    }

    /// Reject configurations that cannot run. Called by the driver before
    /// any thread is spawned.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.num_threads < 1 {
            return Err(PipelineError::InvalidConcurrency(self.num_threads));
        }
        if self.queue_size < 1 {
            return Err(PipelineError::InvalidQueueSize(self.queue_size));
        }
        Ok(())
    }

    /// Called by every worker on entry. Reserved for pinning/instrumentation.
    pub fn register_thread(&self) {
        let active = self.active_threads.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(target: "pipewright", active, "worker registered");
    }

    /// Called by every worker on exit.
    pub fn deregister_thread(&self) {
        let active = self.active_threads.fetch_sub(1, Ordering::AcqRel) - 1;
        tracing::trace!(target: "pipewright", active, "worker deregistered");
    }

    /// Workers currently checked in across every pipeline sharing this
    /// policy (clones share the counter).
    pub fn active_threads(&self) -> usize {
        self.active_threads.load(Ordering::Acquire)
    }

    /// Load a policy from a YAML string.
    pub fn from_yaml_str(content: &str) -> Result<Self, PipelineError> {
        let policy: ExecutionPolicy =
            serde_yaml::from_str(content).map_err(|e| PipelineError::Config(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Load a policy from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(|e| PipelineError::Config(e.to_string()))?;
        Self::from_yaml_str(&content)
    }
}
