//! Reorder buffer restoring generator order after parallel stages.
//!
//! Workers of a farm, filter, or iteration stage race on a shared input
//! queue, so their output interleaves arbitrarily. When ordering is on, the
//! stage compiler puts a reorder stage behind them: it holds early arrivals
//! keyed by sequence, releases them in sequence order, suppresses holes, and
//! renumbers its output contiguously from zero.
//!
//! The holding map never grows past `workers * queue_capacity` entries: a
//! worker cannot run further ahead of the release cursor than the queues
//! that feed and drain it allow.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::messages::{Item, SeqNum};
use crate::pipeline::Runtime;
use crate::stage::ItemQueue;

/// Sequence-ordered release of out-of-order `(payload, sequence)` slots.
///
/// Pure state machine; the thread wrapper lives in [`spawn_reorder`].
/// `None` slots are holes: they advance the cursor without being emitted.
pub struct ReorderBuffer<T> {
    held: FxHashMap<SeqNum, Option<T>>,
    /// Next input sequence to release.
    current: SeqNum,
    /// Next output sequence to issue.
    order: SeqNum,
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            held: FxHashMap::default(),
            current: 0,
            order: 0,
        }
    }

    /// Feed one slot. `emit` receives every payload that becomes releasable,
    /// renumbered contiguously.
    pub fn accept(&mut self, seq: SeqNum, slot: Option<T>, mut emit: impl FnMut(T, SeqNum)) {
        if seq == self.current {
            self.release(slot, &mut emit);
            while let Some(next) = self.held.remove(&self.current) {
                self.release(next, &mut emit);
            }
        } else {
            self.held.insert(seq, slot);
        }
    }

    /// Drain everything held once EOS has been observed upstream.
    ///
    /// A gap here means a sequence was lost in flight, which breaks the
    /// contiguous-edge invariant; fail fast rather than emit out of order.
    pub fn finish(&mut self, mut emit: impl FnMut(T, SeqNum)) {
        while !self.held.is_empty() {
            match self.held.remove(&self.current) {
                Some(slot) => self.release(slot, &mut emit),
                None => {
                    tracing::error!(
                        target: "pipewright",
                        seq = self.current,
                        held = self.held.len(),
                        "sequence gap while draining reorder buffer"
                    );
                    panic!("reorder buffer: sequence gap at {}", self.current);
                }
            }
        }
    }

    /// Slots waiting for their predecessors.
    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    fn release(&mut self, slot: Option<T>, emit: &mut impl FnMut(T, SeqNum)) {
        if let Some(value) = slot {
            emit(value, self.order);
            self.order += 1;
        }
        self.current += 1;
    }
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a [`ReorderBuffer`] on its own thread between `input` and a fresh
/// output queue.
pub(crate) fn spawn_reorder<T: Send + 'static>(
    rt: &mut Runtime,
    input: Arc<ItemQueue<T>>,
) -> Arc<ItemQueue<T>> {
    let output = rt.stage_queue::<T>();
    let out = output.clone();
    let policy = rt.policy().clone();
    rt.spawn_worker("reorder", move || {
        policy.register_thread();
        let mut buffer = ReorderBuffer::new();
        loop {
            let (seq, slot) = match input.pop() {
                Item::Value(value, seq) => (seq, Some(value)),
                Item::Hole(seq) => (seq, None),
                Item::Eos => break,
            };
            buffer.accept(seq, slot, |value, order| out.push(Item::Value(value, order)));
        }
        buffer.finish(|value, order| out.push(Item::Value(value, order)));
        out.push(Item::Eos);
        policy.deregister_thread();
    });
    output
}
