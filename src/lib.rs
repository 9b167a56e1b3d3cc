//! pipewright - composable stream parallel patterns on native threads
//!
//! Turns a declarative description of a data-flow graph
//! (generator → transform → filter → farm → reduce → consumer) into a
//! coordinated multi-threaded execution: the library schedules the work
//! across pipeline-scoped OS threads, moves items through bounded queues,
//! restores generator order after parallel stages when asked to, and
//! propagates end-of-stream through every stage so that nothing is left
//! blocked when the run returns.
//!
//! # Modules
//!
//! - [`messages`] - items that flow between stages
//! - [`queue`] - bounded MPMC queue (blocking and lock-free modes)
//! - [`policy`] - execution policy (threads, queue size/mode, ordering)
//! - [`stage`] - stage descriptors and the stage compiler
//! - [`reorder`] - reorder buffer behind ordered parallel stages
//! - [`pipeline`] - top-level driver
//! - [`stats`] - execution statistics
//! - [`error`] - error taxonomy
//! - [`logging`] - tracing setup for pipeline hosts
//!
//! # Example
//!
//! ```
//! use pipewright::{ExecutionPolicy, Pipeline, farm, keep};
//!
//! let mut policy = ExecutionPolicy::new();
//! policy.set_concurrency_degree(4);
//! policy.enable_ordering();
//!
//! let evens = Pipeline::from_iter(&policy, 1u64..=100)
//!     .stage(farm(&policy, |x: u64| x + 1))
//!     .stage(keep(&policy, |x: &u64| x % 2 == 0))
//!     .collect()
//!     .unwrap();
//!
//! assert_eq!(evens.len(), 50);
//! assert_eq!(evens.first(), Some(&2));
//! ```

pub mod error;
pub mod logging;
pub mod messages;
pub mod pipeline;
pub mod policy;
pub mod queue;
pub mod reorder;
pub mod stage;
pub mod stats;

// Convenient re-exports at crate root
pub use error::PipelineError;
pub use messages::{Item, SeqNum};
pub use pipeline::{Pipeline, Runtime};
pub use policy::ExecutionPolicy;
pub use queue::{BoundedQueue, QueueMode};
pub use reorder::ReorderBuffer;
pub use stage::{
    Compose, Farm, Iteration, Keep, Reduce, Stage, compose, farm, iteration, keep, reduce,
    reduce_all,
};
pub use stats::{PipelineStats, StatsSnapshot};
