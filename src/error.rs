//! Error taxonomy for pipeline construction and execution.

use thiserror::Error;

/// Errors surfaced by pipeline construction and execution.
///
/// Configuration problems are detected before any thread is spawned. Stage
/// faults are recorded by the worker that observed them and reported by the
/// driver once every thread has joined.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid concurrency degree {0}: stages need at least one worker")]
    InvalidConcurrency(usize),

    #[error("invalid queue size {0}: queues need capacity for at least one item")]
    InvalidQueueSize(usize),

    #[error("invalid reduce window {0}: windows cover at least one item")]
    InvalidWindow(usize),

    #[error("stage `{stage}` failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error("config error: {0}")]
    Config(String),
}
