//! The advisory timestamp clock shared by all producers.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Monotonic 64-bit clock stamped on every value at enqueue.
///
/// The clock is advisory: two producers may stamp the same value, and the
/// consumer resolves equal stamps by lane index. What the merge relies on
/// is weaker than uniqueness: a stamp observed in a slot is never larger
/// than any stamp a later snapshot can return.
pub(crate) struct Clock {
    up_to: CachePadded<AtomicU64>,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            up_to: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// The stamp to publish with.
    #[inline]
    pub(crate) fn snapshot(&self) -> u64 {
        self.up_to.load(Ordering::Acquire)
    }

    /// Move the clock past `seen`, unless some other producer already has.
    ///
    /// Check-then-add, not a compare-exchange: two producers may both pass
    /// the check and add twice, or interleave so that neither adds after
    /// the other's increment. Both outcomes are fine (stamps may repeat),
    /// and producers never loop against each other here.
    #[inline]
    pub(crate) fn advance(&self, seen: u64) {
        if self.up_to.load(Ordering::Relaxed) == seen {
            self.up_to.fetch_add(1, Ordering::Relaxed);
        }
    }
}
