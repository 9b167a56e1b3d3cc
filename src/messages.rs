//! Messages - items that flow between pipeline stages
//!
//! Every queue edge carries `Item<T>` values. The generator tags each
//! payload with a sequence number and stages preserve or renumber it so
//! that every edge carries a contiguous range of sequences; that is what
//! lets a reorder buffer downstream of a parallel stage restore generator
//! order without ever guessing whether a sequence is still in flight.
//!
//! # Item Flow
//!
//! ```text
//! generator ── Value(x, 0), Value(y, 1), ..., Eos ──▶ stage ──▶ ... ──▶ consumer
//!                        │
//!                        └─ ordered filters replace dropped payloads with
//!                           Hole(seq) so the slot stays accounted for
//! ```

/// Sequence number assigned by the generator and threaded through every edge.
pub type SeqNum = u64;

/// Unit of data flowing through stage queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item<T> {
    /// A payload tagged with its sequence.
    Value(T, SeqNum),
    /// The payload that carried this sequence was dropped, but the slot is
    /// kept so downstream reorder cursors never starve on a gap. Produced by
    /// ordered filters and by workers that observed a fault.
    Hole(SeqNum),
    /// End of stream.
    Eos,
}

impl<T> Item<T> {
    /// True for the end-of-stream sentinel.
    pub fn is_eos(&self) -> bool {
        matches!(self, Item::Eos)
    }

    /// The sequence carried by a value or hole.
    pub fn seq(&self) -> Option<SeqNum> {
        match self {
            Item::Value(_, seq) | Item::Hole(seq) => Some(*seq),
            Item::Eos => None,
        }
    }

    /// The payload, if this item carries one.
    pub fn into_value(self) -> Option<T> {
        match self {
            Item::Value(value, _) => Some(value),
            Item::Hole(_) | Item::Eos => None,
        }
    }
}
