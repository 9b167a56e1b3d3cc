//! Top-level pipeline driver.
//!
//! `Pipeline` is a lazy builder: `new` captures the generator, each `stage`
//! call composes one build step, and the terminal operation validates the
//! whole chain, materialises queues and threads, runs the consumer on the
//! calling thread, joins every worker in reverse spawn order, and surfaces
//! the first recorded fault.
//!
//! ```text
//! generator ─▶ queue₀ ─▶ stage₁ ─▶ queue₁ ─▶ ... ─▶ stageₙ ─▶ consumer
//! (thread)               (threads)                  (threads)  (caller)
//! ```

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::PipelineError;
use crate::messages::{Item, SeqNum};
use crate::policy::ExecutionPolicy;
use crate::stage::{ItemQueue, Stage};
use crate::stats::PipelineStats;

/// Shared slot holding the first fault any worker observed.
pub(crate) struct FaultSlot {
    first: Mutex<Option<PipelineError>>,
    stats: Arc<PipelineStats>,
}

impl FaultSlot {
    fn new(stats: Arc<PipelineStats>) -> Self {
        Self {
            first: Mutex::new(None),
            stats,
        }
    }

    pub(crate) fn record_panic(&self, stage: &'static str, payload: Box<dyn Any + Send>) {
        let message = panic_message(payload);
        tracing::error!(target: "pipewright", stage, %message, "stage function panicked");
        self.stats.incr_fault();
        let mut slot = self.first.lock().expect("fault slot poisoned");
        if slot.is_none() {
            *slot = Some(PipelineError::StageFailed {
                stage: stage.to_string(),
                message,
            });
        }
    }

    fn take(&self) -> Option<PipelineError> {
        self.first.lock().expect("fault slot poisoned").take()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "stage function panicked".to_string()
    }
}

/// Build-time state handed to each stage's `compile`.
pub struct Runtime {
    policy: ExecutionPolicy,
    stats: Arc<PipelineStats>,
    fault: Arc<FaultSlot>,
    handles: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Policy governing queue capacity and mode for the whole pipeline.
    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    /// Statistics shared by every worker of this pipeline.
    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Allocate one stage-to-stage queue in the policy's size and mode.
    pub fn stage_queue<T: Send>(&self) -> Arc<ItemQueue<T>> {
        Arc::new(ItemQueue::with_stats(
            self.policy.queue_size(),
            self.policy.queue_mode(),
            self.stats.clone(),
        ))
    }

    /// Spawn one worker thread under a descriptive name.
    pub fn spawn_worker(&mut self, label: &str, work: impl FnOnce() + Send + 'static) {
        let name = format!("pw-{label}-{}", self.handles.len());
        tracing::debug!(target: "pipewright", thread = %name, "spawning pipeline worker");
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(work)
            .expect("failed to spawn pipeline worker");
        self.handles.push(handle);
    }

    pub(crate) fn fault_handle(&self) -> Arc<FaultSlot> {
        self.fault.clone()
    }
}

type BuildFn<T> = Box<dyn FnOnce(&mut Runtime) -> Arc<ItemQueue<T>>>;

/// A declarative stream pipeline.
///
/// Nothing runs until a terminal operation (`sink`, `collect`, `fold`) is
/// called; configuration errors collected while chaining are reported there,
/// before any thread is spawned.
#[must_use = "pipelines do nothing until a terminal operation runs them"]
pub struct Pipeline<T: Send + 'static> {
    policy: ExecutionPolicy,
    stats: Arc<PipelineStats>,
    build: BuildFn<T>,
    deferred: Option<PipelineError>,
}

impl<T: Send + 'static> Pipeline<T> {
    /// Start a pipeline from a generator. The generator runs on its own
    /// thread and terminates the stream by returning `None`.
    pub fn new<G>(policy: &ExecutionPolicy, mut generate: G) -> Self
    where
        G: FnMut() -> Option<T> + Send + 'static,
    {
        let deferred = policy.validate().err();
        let stats = Arc::new(PipelineStats::new());
        let build: BuildFn<T> = Box::new(move |rt: &mut Runtime| {
            let output = rt.stage_queue::<T>();
            let out = output.clone();
            let policy = rt.policy().clone();
            let stats = rt.stats();
            let fault = rt.fault_handle();
            rt.spawn_worker("generator", move || {
                policy.register_thread();
                let mut order: SeqNum = 0;
                loop {
                    match panic::catch_unwind(AssertUnwindSafe(|| generate())) {
                        Ok(Some(value)) => {
                            out.push(Item::Value(value, order));
                            order += 1;
                            stats.incr_generated();
                        }
                        Ok(None) => break,
                        Err(payload) => {
                            fault.record_panic("generator", payload);
                            break;
                        }
                    }
                }
                out.push(Item::Eos);
                policy.deregister_thread();
            });
            output
        });
        Self {
            policy: policy.clone(),
            stats,
            build,
            deferred,
        }
    }

    /// Pipeline over the items of an iterator.
    pub fn from_iter<I>(policy: &ExecutionPolicy, source: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let mut items = source.into_iter();
        Self::new(policy, move || items.next())
    }

    /// Append a stage: a plain closure (Map) or a descriptor.
    pub fn stage<S>(mut self, stage: S) -> Pipeline<S::Out>
    where
        S: Stage<T> + 'static,
    {
        tracing::debug!(target: "pipewright", kind = stage.kind(), "appending stage");
        if self.deferred.is_none() {
            self.deferred = stage.validate().err();
        }
        let prev = self.build;
        Pipeline {
            policy: self.policy,
            stats: self.stats,
            build: Box::new(move |rt| {
                let input = prev(rt);
                stage.compile(rt, input)
            }),
            deferred: self.deferred,
        }
    }

    /// Statistics handle, for inspection after the run.
    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Run, applying `consume` to every delivered item on the calling
    /// thread. Under an ordered policy items arrive in generator order.
    pub fn sink<F: FnMut(T)>(self, mut consume: F) -> Result<(), PipelineError> {
        self.run(move |input, stats, fault| {
            let mut poisoned = false;
            loop {
                match input.pop() {
                    Item::Value(value, _seq) => {
                        if poisoned {
                            continue;
                        }
                        match panic::catch_unwind(AssertUnwindSafe(|| consume(value))) {
                            Ok(()) => stats.incr_delivered(),
                            Err(payload) => {
                                fault.record_panic("sink", payload);
                                poisoned = true;
                            }
                        }
                    }
                    Item::Hole(_) => {}
                    Item::Eos => break,
                }
            }
        })
    }

    /// Run, collecting every delivered item.
    pub fn collect(self) -> Result<Vec<T>, PipelineError> {
        let mut collected = Vec::new();
        self.sink(|value| collected.push(value))?;
        Ok(collected)
    }

    /// Run, folding every delivered item into an accumulator. This is the
    /// stream-reduce surface: window accumulators emitted by a `Reduce`
    /// stage land here for the final fold.
    pub fn fold<A, F>(self, init: A, mut fold: F) -> Result<A, PipelineError>
    where
        F: FnMut(A, T) -> A,
    {
        let mut acc = Some(init);
        self.sink(|value| {
            let current = acc.take().expect("fold accumulator always present");
            acc = Some(fold(current, value));
        })?;
        Ok(acc.expect("fold accumulator always present"))
    }

    fn run(
        self,
        consume: impl FnOnce(Arc<ItemQueue<T>>, Arc<PipelineStats>, Arc<FaultSlot>),
    ) -> Result<(), PipelineError> {
        if let Some(error) = self.deferred {
            return Err(error);
        }
        let fault = Arc::new(FaultSlot::new(self.stats.clone()));
        let mut rt = Runtime {
            policy: self.policy,
            stats: self.stats,
            fault,
            handles: Vec::new(),
        };
        let last = (self.build)(&mut rt);
        consume(last, rt.stats.clone(), rt.fault.clone());
        while let Some(handle) = rt.handles.pop() {
            handle.join().expect("pipeline worker panicked");
        }
        let snapshot = rt.stats.snapshot();
        tracing::debug!(target: "pipewright", %snapshot, "pipeline completed");
        match rt.fault.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_policy_fails_before_spawning() {
        let mut policy = ExecutionPolicy::with_concurrency(2);
        policy.set_queue_size(0);

        let result = Pipeline::from_iter(&policy, 0u64..10).collect();
        assert!(matches!(result, Err(PipelineError::InvalidQueueSize(0))));
        assert_eq!(policy.active_threads(), 0);
    }

    #[test]
    fn invalid_stage_fails_before_spawning() {
        let policy = ExecutionPolicy::with_concurrency(2);
        let result = Pipeline::from_iter(&policy, 0u64..10)
            .stage(crate::stage::farm(&policy, |x| x).workers(0))
            .collect();
        assert!(matches!(result, Err(PipelineError::InvalidConcurrency(0))));
        assert_eq!(policy.active_threads(), 0);
    }

    #[test]
    fn fold_threads_the_accumulator() {
        let policy = ExecutionPolicy::with_concurrency(1);
        let total = Pipeline::from_iter(&policy, 1u64..=4).fold(0u64, |acc, x| acc + x);
        assert_eq!(total.unwrap(), 10);
    }

    #[test]
    fn sink_panic_is_reported_and_joins_cleanly() {
        let policy = ExecutionPolicy::with_concurrency(1);
        let result = Pipeline::from_iter(&policy, 0u64..100).sink(|x| {
            if x == 3 {
                panic!("sink rejected {x}");
            }
        });
        match result {
            Err(PipelineError::StageFailed { stage, message }) => {
                assert_eq!(stage, "sink");
                assert!(message.contains("sink rejected"));
            }
            other => panic!("expected sink failure, got {other:?}"),
        }
        assert_eq!(policy.active_threads(), 0);
    }
}
