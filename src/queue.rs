//! Bounded MPMC queue connecting pipeline stages.
//!
//! Two interchangeable flavours behind one type:
//!
//! - **Blocking**: mutex plus two condition variables. Producers park while
//!   the queue is full, consumers park while it is empty.
//! - **LockFree**: a bounded ring (`crossbeam_queue::ArrayQueue`, a
//!   Vyukov-style ring with per-slot sequence counters). Both sides spin,
//!   yielding to the scheduler once a short spin budget is exhausted.
//!
//! FIFO holds per producer; interleaving across producers is arbitrary. The
//! sequence number carried inside the items is the canonical order, not the
//! queue.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crossbeam_queue::ArrayQueue;
use serde::Deserialize;

use crate::stats::PipelineStats;

/// Failed attempts before a spinning side yields to the scheduler.
const SPIN_BUDGET: u32 = 100;

/// Queue flavour used for every edge of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Park on condition variables when full/empty.
    #[default]
    Blocking,
    /// Spin on a bounded ring when full/empty.
    LockFree,
}

/// Bounded multi-producer/multi-consumer queue.
///
/// `push` and `pop` never fail; they wait (parking or spinning, depending on
/// the mode) until the operation can complete. Contended operations are
/// counted as back-pressure when the queue is wired to a running pipeline's
/// statistics.
pub struct BoundedQueue<T> {
    mode: Mode<T>,
    stats: Option<Arc<PipelineStats>>,
}

enum Mode<T> {
    Blocking {
        items: Mutex<VecDeque<T>>,
        capacity: usize,
        not_full: Condvar,
        not_empty: Condvar,
    },
    LockFree(ArrayQueue<T>),
}

impl<T> BoundedQueue<T> {
    /// Create a queue with the given capacity and mode.
    pub fn new(capacity: usize, mode: QueueMode) -> Self {
        debug_assert!(capacity >= 1, "queue capacity must be at least 1");
        let mode = match mode {
            QueueMode::Blocking => Mode::Blocking {
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                not_full: Condvar::new(),
                not_empty: Condvar::new(),
            },
            QueueMode::LockFree => Mode::LockFree(ArrayQueue::new(capacity)),
        };
        Self { mode, stats: None }
    }

    /// Queue wired to a running pipeline's statistics.
    pub(crate) fn with_stats(capacity: usize, mode: QueueMode, stats: Arc<PipelineStats>) -> Self {
        let mut queue = Self::new(capacity, mode);
        queue.stats = Some(stats);
        queue
    }

    pub fn capacity(&self) -> usize {
        match &self.mode {
            Mode::Blocking { capacity, .. } => *capacity,
            Mode::LockFree(ring) => ring.capacity(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.mode {
            Mode::Blocking { items, .. } => items.lock().expect("queue mutex poisoned").len(),
            Mode::LockFree(ring) => ring.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push, parking or spinning while the queue is full. Wakes one waiting
    /// consumer in blocking mode.
    pub fn push(&self, item: T) {
        match &self.mode {
            Mode::Blocking {
                items,
                capacity,
                not_full,
                not_empty,
            } => {
                let mut queue = items.lock().expect("queue mutex poisoned");
                if queue.len() == *capacity {
                    self.note_backpressure();
                    while queue.len() == *capacity {
                        queue = not_full.wait(queue).expect("queue mutex poisoned");
                    }
                }
                queue.push_back(item);
                drop(queue);
                not_empty.notify_one();
            }
            Mode::LockFree(ring) => {
                let mut pending = item;
                let mut spins = 0u32;
                loop {
                    match ring.push(pending) {
                        Ok(()) => return,
                        Err(rejected) => {
                            pending = rejected;
                            if spins == 0 {
                                self.note_backpressure();
                            }
                            spins += 1;
                            if spins > SPIN_BUDGET {
                                std::thread::yield_now();
                                spins = 1;
                            } else {
                                std::hint::spin_loop();
                            }
                        }
                    }
                }
            }
        }
    }

    /// Pop, parking or spinning while the queue is empty. Wakes one waiting
    /// producer in blocking mode.
    pub fn pop(&self) -> T {
        match &self.mode {
            Mode::Blocking {
                items,
                not_full,
                not_empty,
                ..
            } => {
                let mut queue = items.lock().expect("queue mutex poisoned");
                while queue.is_empty() {
                    queue = not_empty.wait(queue).expect("queue mutex poisoned");
                }
                let item = queue.pop_front().expect("queue drained while locked");
                drop(queue);
                not_full.notify_one();
                item
            }
            Mode::LockFree(ring) => {
                let mut spins = 0u32;
                loop {
                    if let Some(item) = ring.pop() {
                        return item;
                    }
                    spins += 1;
                    if spins > SPIN_BUDGET {
                        std::thread::yield_now();
                        spins = 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
            }
        }
    }

    fn note_backpressure(&self) {
        if let Some(stats) = &self.stats {
            stats.incr_backpressure();
        }
    }
}
