//! Stage descriptors and the stage compiler.
//!
//! A pipeline is a chain of stages, each consuming items from the previous
//! stage's output queue and producing into its own. Plain closures act as
//! single-worker Map stages; the descriptors in this module fan work out
//! across racing workers:
//!
//! ```text
//!              ┌──────────┐
//!      ┌─────▶ │ worker 0 │ ─────┐
//! in   │       ├──────────┤      ▼                        ┌─────────┐
//! ─────┼─────▶ │ worker 1 │ ─────────▶ (if ordered) ────▶ │ reorder │ ─▶ out
//!      │       ├──────────┤      ▲                        └─────────┘
//!      └─────▶ │ worker N │ ─────┘
//!              └──────────┘
//! ```
//!
//! # Termination protocol
//!
//! A worker that pops EOS pushes the token back onto the input queue so its
//! siblings see it too, then bumps a shared atomic counter. Whichever worker
//! bumps the counter to the stage's worker count forwards a single EOS
//! downstream; the others exit silently. Every edge therefore delivers
//! exactly one EOS to the stage behind it, whatever the worker counts are.
//!
//! # Faults
//!
//! A worker whose stage function panics records the fault and keeps popping,
//! replacing each input it can no longer process with a hole. Upstream never
//! wedges on a full queue, downstream reorder cursors never starve, and the
//! driver reports the fault once every thread has joined.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::PipelineError;
use crate::messages::Item;
use crate::pipeline::Runtime;
use crate::policy::ExecutionPolicy;
use crate::queue::BoundedQueue;
use crate::reorder::spawn_reorder;

/// Queue of tagged items connecting two stages.
pub type ItemQueue<T> = BoundedQueue<Item<T>>;

/// One stage of a pipeline: consumes `In` items, produces `Out` items.
///
/// Implemented by plain `FnMut(In) -> Out` closures (a single-worker Map
/// stage) and by the descriptors in this module. The driver calls `validate`
/// for every stage before any thread exists, then `compile` once per
/// pipeline run; `compile` spawns the stage's workers through the runtime
/// and hands back the stage's output queue.
pub trait Stage<In: Send + 'static> {
    type Out: Send + 'static;

    /// Lower this descriptor into worker threads reading `input`.
    fn compile(self, rt: &mut Runtime, input: Arc<ItemQueue<In>>) -> Arc<ItemQueue<Self::Out>>;

    /// Descriptor name used in thread labels and fault reports.
    fn kind(&self) -> &'static str {
        "map"
    }

    /// Reject descriptor parameters that cannot run.
    fn validate(&self) -> Result<(), PipelineError> {
        Ok(())
    }
}

impl<In, Out, F> Stage<In> for F
where
    F: FnMut(In) -> Out + Send + 'static,
    In: Send + 'static,
    Out: Send + 'static,
{
    type Out = Out;

    fn compile(mut self, rt: &mut Runtime, input: Arc<ItemQueue<In>>) -> Arc<ItemQueue<Out>> {
        let output = rt.stage_queue::<Out>();
        let out = output.clone();
        let policy = rt.policy().clone();
        let fault = rt.fault_handle();
        rt.spawn_worker("map", move || {
            policy.register_thread();
            let mut poisoned = false;
            loop {
                match input.pop() {
                    Item::Value(value, seq) => {
                        if poisoned {
                            out.push(Item::Hole(seq));
                            continue;
                        }
                        match panic::catch_unwind(AssertUnwindSafe(|| (self)(value))) {
                            Ok(mapped) => out.push(Item::Value(mapped, seq)),
                            Err(payload) => {
                                fault.record_panic("map", payload);
                                poisoned = true;
                                out.push(Item::Hole(seq));
                            }
                        }
                    }
                    Item::Hole(seq) => out.push(Item::Hole(seq)),
                    Item::Eos => break,
                }
            }
            out.push(Item::Eos);
            policy.deregister_thread();
        });
        output
    }
}

// ============================================================
// FARM
// ============================================================

/// Farm descriptor: `workers` threads race on the shared input queue.
pub struct Farm<F> {
    workers: usize,
    ordered: bool,
    task: F,
}

/// Farm stage: run `task` with the policy's concurrency degree.
pub fn farm<F>(policy: &ExecutionPolicy, task: F) -> Farm<F> {
    Farm {
        workers: policy.concurrency_degree(),
        ordered: policy.is_ordered(),
        task,
    }
}

impl<F> Farm<F> {
    /// Override the worker count for this stage.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Override order restoration for this stage.
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }
}

impl<In, Out, F> Stage<In> for Farm<F>
where
    F: Fn(In) -> Out + Send + Sync + 'static,
    In: Send + 'static,
    Out: Send + 'static,
{
    type Out = Out;

    fn kind(&self) -> &'static str {
        "farm"
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.workers < 1 {
            return Err(PipelineError::InvalidConcurrency(self.workers));
        }
        Ok(())
    }

    fn compile(self, rt: &mut Runtime, input: Arc<ItemQueue<In>>) -> Arc<ItemQueue<Out>> {
        let Farm {
            workers,
            ordered,
            task,
        } = self;
        let output = rt.stage_queue::<Out>();
        let task = Arc::new(task);
        let nend = Arc::new(AtomicUsize::new(0));
        for _ in 0..workers {
            let input = input.clone();
            let out = output.clone();
            let task = task.clone();
            let nend = nend.clone();
            let policy = rt.policy().clone();
            let fault = rt.fault_handle();
            rt.spawn_worker("farm", move || {
                policy.register_thread();
                let mut poisoned = false;
                loop {
                    match input.pop() {
                        Item::Value(value, seq) => {
                            if poisoned {
                                out.push(Item::Hole(seq));
                                continue;
                            }
                            match panic::catch_unwind(AssertUnwindSafe(|| (*task)(value))) {
                                Ok(mapped) => out.push(Item::Value(mapped, seq)),
                                Err(payload) => {
                                    fault.record_panic("farm", payload);
                                    poisoned = true;
                                    out.push(Item::Hole(seq));
                                }
                            }
                        }
                        Item::Hole(seq) => out.push(Item::Hole(seq)),
                        Item::Eos => {
                            input.push(Item::Eos);
                            if nend.fetch_add(1, Ordering::AcqRel) + 1 == workers {
                                out.push(Item::Eos);
                            }
                            break;
                        }
                    }
                }
                policy.deregister_thread();
            });
        }
        if ordered && workers > 1 {
            spawn_reorder(rt, output)
        } else {
            output
        }
    }
}

// ============================================================
// FILTER
// ============================================================

/// Filter descriptor: keep items satisfying `pred`.
pub struct Keep<P> {
    workers: usize,
    ordered: bool,
    pred: P,
}

/// Filter stage: keep items satisfying `pred`, with the policy's
/// concurrency degree.
pub fn keep<P>(policy: &ExecutionPolicy, pred: P) -> Keep<P> {
    Keep {
        workers: policy.concurrency_degree(),
        ordered: policy.is_ordered(),
        pred,
    }
}

impl<P> Keep<P> {
    /// Override the worker count for this stage.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Override order restoration for this stage.
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }
}

impl<T, P> Stage<T> for Keep<P>
where
    P: Fn(&T) -> bool + Send + Sync + 'static,
    T: Send + 'static,
{
    type Out = T;

    fn kind(&self) -> &'static str {
        "filter"
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.workers < 1 {
            return Err(PipelineError::InvalidConcurrency(self.workers));
        }
        Ok(())
    }

    fn compile(self, rt: &mut Runtime, input: Arc<ItemQueue<T>>) -> Arc<ItemQueue<T>> {
        let Keep {
            workers,
            ordered,
            pred,
        } = self;
        let output = rt.stage_queue::<T>();
        let pred = Arc::new(pred);
        let nend = Arc::new(AtomicUsize::new(0));
        // Unordered mode keeps edges contiguous by renumbering survivors.
        let renumber = Arc::new(AtomicU64::new(0));
        for _ in 0..workers {
            let input = input.clone();
            let out = output.clone();
            let pred = pred.clone();
            let nend = nend.clone();
            let renumber = renumber.clone();
            let policy = rt.policy().clone();
            let fault = rt.fault_handle();
            let stats = rt.stats();
            rt.spawn_worker("filter", move || {
                policy.register_thread();
                let mut poisoned = false;
                loop {
                    match input.pop() {
                        Item::Value(value, seq) => {
                            if poisoned {
                                if ordered {
                                    out.push(Item::Hole(seq));
                                }
                                continue;
                            }
                            match panic::catch_unwind(AssertUnwindSafe(|| (*pred)(&value))) {
                                Ok(true) => {
                                    if ordered {
                                        out.push(Item::Value(value, seq));
                                    } else {
                                        out.push(Item::Value(
                                            value,
                                            renumber.fetch_add(1, Ordering::Relaxed),
                                        ));
                                    }
                                }
                                Ok(false) => {
                                    stats.incr_filtered();
                                    if ordered {
                                        out.push(Item::Hole(seq));
                                    }
                                }
                                Err(payload) => {
                                    fault.record_panic("filter", payload);
                                    poisoned = true;
                                    if ordered {
                                        out.push(Item::Hole(seq));
                                    }
                                }
                            }
                        }
                        // A vacant slot only matters where sequences do; the
                        // renumbered unordered edge has no use for it.
                        Item::Hole(seq) => {
                            if ordered {
                                out.push(Item::Hole(seq));
                            }
                        }
                        Item::Eos => {
                            input.push(Item::Eos);
                            if nend.fetch_add(1, Ordering::AcqRel) + 1 == workers {
                                out.push(Item::Eos);
                            }
                            break;
                        }
                    }
                }
                policy.deregister_thread();
            });
        }
        if ordered && workers > 1 {
            spawn_reorder(rt, output)
        } else {
            output
        }
    }
}

// ============================================================
// REDUCE
// ============================================================

/// Window-reduce descriptor: fold every `window` items with `combine`,
/// starting from a clone of `identity`.
pub struct Reduce<T, C> {
    workers: usize,
    window: usize,
    identity: T,
    combine: C,
}

/// Reduce stage with an explicit window size.
///
/// `combine` must be associative for a parallel reduce to be equivalent to
/// the sequential fold; this is not checked.
pub fn reduce<T, C>(policy: &ExecutionPolicy, window: usize, identity: T, combine: C) -> Reduce<T, C> {
    Reduce {
        workers: policy.concurrency_degree(),
        window,
        identity,
        combine,
    }
}

/// Reduce the whole stream: one window per worker, flushed at end of stream.
pub fn reduce_all<T, C>(policy: &ExecutionPolicy, identity: T, combine: C) -> Reduce<T, C> {
    Reduce {
        workers: policy.concurrency_degree(),
        window: usize::MAX,
        identity,
        combine,
    }
}

impl<T, C> Reduce<T, C> {
    /// Override the worker count for this stage.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Override the window size for this stage.
    pub fn window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }
}

impl<T, C> Stage<T> for Reduce<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: Fn(T, T) -> T + Send + Sync + 'static,
{
    type Out = T;

    fn kind(&self) -> &'static str {
        "reduce"
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.workers < 1 {
            return Err(PipelineError::InvalidConcurrency(self.workers));
        }
        if self.window < 1 {
            return Err(PipelineError::InvalidWindow(self.window));
        }
        Ok(())
    }

    fn compile(self, rt: &mut Runtime, input: Arc<ItemQueue<T>>) -> Arc<ItemQueue<T>> {
        let Reduce {
            workers,
            window,
            identity,
            combine,
        } = self;
        let output = rt.stage_queue::<T>();
        let identity = Arc::new(identity);
        let combine = Arc::new(combine);
        let nend = Arc::new(AtomicUsize::new(0));
        // Windows get fresh contiguous sequences; inheriting input sequences
        // would leave gaps that starve downstream reorder cursors.
        let next_seq = Arc::new(AtomicU64::new(0));
        for _ in 0..workers {
            let input = input.clone();
            let out = output.clone();
            let identity = identity.clone();
            let combine = combine.clone();
            let nend = nend.clone();
            let next_seq = next_seq.clone();
            let policy = rt.policy().clone();
            let fault = rt.fault_handle();
            let stats = rt.stats();
            rt.spawn_worker("reduce", move || {
                policy.register_thread();
                let mut acc = (*identity).clone();
                let mut filled = 0usize;
                let mut poisoned = false;
                loop {
                    match input.pop() {
                        Item::Value(value, _seq) => {
                            if poisoned {
                                continue;
                            }
                            let previous = std::mem::replace(&mut acc, (*identity).clone());
                            match panic::catch_unwind(AssertUnwindSafe(|| (*combine)(previous, value)))
                            {
                                Ok(folded) => {
                                    acc = folded;
                                    filled += 1;
                                    if filled == window {
                                        let done =
                                            std::mem::replace(&mut acc, (*identity).clone());
                                        out.push(Item::Value(
                                            done,
                                            next_seq.fetch_add(1, Ordering::Relaxed),
                                        ));
                                        stats.incr_window();
                                        filled = 0;
                                    }
                                }
                                Err(payload) => {
                                    fault.record_panic("reduce", payload);
                                    poisoned = true;
                                }
                            }
                        }
                        // Vacant slots carry nothing to fold.
                        Item::Hole(_) => {}
                        Item::Eos => {
                            if !poisoned && filled > 0 {
                                let done = std::mem::replace(&mut acc, (*identity).clone());
                                out.push(Item::Value(
                                    done,
                                    next_seq.fetch_add(1, Ordering::Relaxed),
                                ));
                                stats.incr_window();
                            }
                            input.push(Item::Eos);
                            if nend.fetch_add(1, Ordering::AcqRel) + 1 == workers {
                                out.push(Item::Eos);
                            }
                            break;
                        }
                    }
                }
                policy.deregister_thread();
            });
        }
        output
    }
}

// ============================================================
// ITERATION
// ============================================================

/// Iteration descriptor: apply `body` until `until` holds, farm-style.
pub struct Iteration<B, P> {
    workers: usize,
    ordered: bool,
    body: B,
    until: P,
}

/// Iteration stage: repeatedly apply `body` to each item until
/// `until(item)` holds, then emit it.
pub fn iteration<B, P>(policy: &ExecutionPolicy, body: B, until: P) -> Iteration<B, P> {
    Iteration {
        workers: policy.concurrency_degree(),
        ordered: policy.is_ordered(),
        body,
        until,
    }
}

impl<B, P> Iteration<B, P> {
    /// Override the worker count for this stage.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Override order restoration for this stage.
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }
}

impl<T, B, P> Stage<T> for Iteration<B, P>
where
    T: Send + 'static,
    B: Fn(T) -> T + Send + Sync + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    type Out = T;

    fn kind(&self) -> &'static str {
        "iteration"
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.workers < 1 {
            return Err(PipelineError::InvalidConcurrency(self.workers));
        }
        Ok(())
    }

    fn compile(self, rt: &mut Runtime, input: Arc<ItemQueue<T>>) -> Arc<ItemQueue<T>> {
        let Iteration {
            workers,
            ordered,
            body,
            until,
        } = self;
        let output = rt.stage_queue::<T>();
        let body = Arc::new(body);
        let until = Arc::new(until);
        let nend = Arc::new(AtomicUsize::new(0));
        for _ in 0..workers {
            let input = input.clone();
            let out = output.clone();
            let body = body.clone();
            let until = until.clone();
            let nend = nend.clone();
            let policy = rt.policy().clone();
            let fault = rt.fault_handle();
            rt.spawn_worker("iteration", move || {
                policy.register_thread();
                let mut poisoned = false;
                loop {
                    match input.pop() {
                        Item::Value(value, seq) => {
                            if poisoned {
                                out.push(Item::Hole(seq));
                                continue;
                            }
                            let iterated = panic::catch_unwind(AssertUnwindSafe(|| {
                                let mut value = value;
                                while !(*until)(&value) {
                                    value = (*body)(value);
                                }
                                value
                            }));
                            match iterated {
                                Ok(settled) => out.push(Item::Value(settled, seq)),
                                Err(payload) => {
                                    fault.record_panic("iteration", payload);
                                    poisoned = true;
                                    out.push(Item::Hole(seq));
                                }
                            }
                        }
                        Item::Hole(seq) => out.push(Item::Hole(seq)),
                        Item::Eos => {
                            input.push(Item::Eos);
                            if nend.fetch_add(1, Ordering::AcqRel) + 1 == workers {
                                out.push(Item::Eos);
                            }
                            break;
                        }
                    }
                }
                policy.deregister_thread();
            });
        }
        if ordered && workers > 1 {
            spawn_reorder(rt, output)
        } else {
            output
        }
    }
}

// ============================================================
// NESTED PIPELINE
// ============================================================

/// Nested pipeline: `first` then `second`, spliced inline.
///
/// Compiling a `Compose` compiles its children back-to-back with an ordinary
/// stage queue between them and no extra boundary, so composition is
/// associative: `compose(a, compose(b, c))` and `compose(compose(a, b), c)`
/// build the same graph as appending `a`, `b`, `c` directly.
pub struct Compose<A, B> {
    first: A,
    second: B,
}

/// Compose two stages into one nested-pipeline descriptor.
pub fn compose<A, B>(first: A, second: B) -> Compose<A, B> {
    Compose { first, second }
}

impl<In, A, B> Stage<In> for Compose<A, B>
where
    In: Send + 'static,
    A: Stage<In>,
    B: Stage<A::Out>,
{
    type Out = B::Out;

    fn kind(&self) -> &'static str {
        "pipeline"
    }

    fn validate(&self) -> Result<(), PipelineError> {
        self.first.validate()?;
        self.second.validate()
    }

    fn compile(self, rt: &mut Runtime, input: Arc<ItemQueue<In>>) -> Arc<ItemQueue<B::Out>> {
        let middle = self.first.compile(rt, input);
        self.second.compile(rt, middle)
    }
}
