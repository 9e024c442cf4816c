//! Non-blocking queue variant: `pop` returns `None` when empty.
//!
//! Construction registers a fixed number of producers and returns one
//! [`Producer`] handle per lane plus a single [`Consumer`]. A `Producer`
//! is `Send` but neither `Clone` nor `Sync`, so "one writer per lane" is
//! a compile-time fact and `push` never needs a runtime id check.
//!
//! # Example
//!
//! ```
//! use std::thread;
//!
//! let (producers, mut rx) = multilane::spin::queue::<u64>(4);
//!
//! let handles: Vec<_> = producers
//!     .into_iter()
//!     .map(|mut tx| {
//!         thread::spawn(move || {
//!             for i in 0..1000 {
//!                 tx.push(i);
//!             }
//!         })
//!     })
//!     .collect();
//!
//! let mut received = 0;
//! while received < 4000 {
//!     if rx.pop().is_some() {
//!         received += 1;
//!     } else {
//!         std::hint::spin_loop();
//!     }
//! }
//!
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//!
//! assert_eq!(rx.pop(), None);
//! ```
//!
//! # Ordering
//!
//! Per producer, `pop` yields values in exactly the order that producer
//! pushed them. Across producers, values are merged by their enqueue
//! stamp; equal stamps go to the lower lane index.

use std::fmt;
use std::ptr::NonNull;

use crate::lanes::Shared;
use crate::{DEFAULT_POOL_CAP, DEFAULT_SEGMENT_CAP};

/// Creates a queue with the default segment and recycle-ring capacities.
///
/// Returns one [`Producer`] per lane (index `i` of the vector is lane
/// `i`) and the single [`Consumer`].
///
/// # Panics
///
/// Panics if `producers` is zero.
///
/// # Example
///
/// ```
/// let (mut producers, mut rx) = multilane::spin::queue::<u64>(1);
/// producers[0].push(7);
/// assert_eq!(rx.pop(), Some(7));
/// ```
pub fn queue<T>(producers: u16) -> (Vec<Producer<T>>, Consumer<T>) {
    queue_with::<T, DEFAULT_SEGMENT_CAP, DEFAULT_POOL_CAP>(producers)
}

/// Creates a queue with explicit segment and recycle-ring capacities.
///
/// Both capacities must be at least 2 (checked at compile time). Small
/// capacities are mainly useful to exercise segment turnover in tests;
/// throughput wants the defaults or larger.
///
/// # Panics
///
/// Panics if `producers` is zero.
pub fn queue_with<T, const CAP: usize, const POOL: usize>(
    producers: u16,
) -> (Vec<Producer<T, CAP, POOL>>, Consumer<T, CAP, POOL>) {
    assert!(producers > 0, "queue needs at least one registered producer");

    let shared = Shared::allocate(producers, producers as usize + 1);
    let senders = (0..producers as usize)
        .map(|lane| Producer { shared, lane })
        .collect();

    (senders, Consumer { shared })
}

/// The enqueue handle for one lane.
///
/// Owns its lane exclusively: not `Clone`, not `Sync`. Move it to the
/// producing thread.
pub struct Producer<
    T,
    const CAP: usize = DEFAULT_SEGMENT_CAP,
    const POOL: usize = DEFAULT_POOL_CAP,
> {
    shared: NonNull<Shared<T, CAP, POOL>>,
    lane: usize,
}

// Safety: the handle may move between threads; lane state it touches is
// reached only through this handle, and the shared allocation is Sync.
unsafe impl<T: Send, const CAP: usize, const POOL: usize> Send for Producer<T, CAP, POOL> {}

impl<T, const CAP: usize, const POOL: usize> Producer<T, CAP, POOL> {
    /// Appends a value to this producer's lane.
    ///
    /// Never fails and never blocks: the lane grows by one segment when
    /// full, reusing a recycled segment when one is parked.
    #[inline]
    pub fn push(&mut self, value: T) {
        // Safety: this handle is the lane's only producer. It is neither
        // Clone nor Sync, and `&mut self` pins it to one thread at a time.
        unsafe { self.shared.as_ref().push(self.lane, value) }
    }

    /// The lane index this handle enqueues on.
    #[inline]
    pub fn lane(&self) -> usize {
        self.lane
    }
}

impl<T, const CAP: usize, const POOL: usize> Drop for Producer<T, CAP, POOL> {
    fn drop(&mut self) {
        // Safety: dropped exactly once, no access afterwards.
        unsafe { Shared::release(self.shared) };
    }
}

impl<T, const CAP: usize, const POOL: usize> fmt::Debug for Producer<T, CAP, POOL> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("lane", &self.lane)
            .finish_non_exhaustive()
    }
}

/// The dequeue handle. There is exactly one.
pub struct Consumer<
    T,
    const CAP: usize = DEFAULT_SEGMENT_CAP,
    const POOL: usize = DEFAULT_POOL_CAP,
> {
    shared: NonNull<Shared<T, CAP, POOL>>,
}

// Safety: single consumer by construction (not Clone, not Sync); may move
// between threads.
unsafe impl<T: Send, const CAP: usize, const POOL: usize> Send for Consumer<T, CAP, POOL> {}

impl<T, const CAP: usize, const POOL: usize> Consumer<T, CAP, POOL> {
    /// Removes the value with the smallest stamp, or `None` when the
    /// queue looks empty on two consecutive scans.
    ///
    /// `None` is not a terminal state; producers may push again at any
    /// time.
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        // Safety: this handle is the queue's only consumer.
        unsafe { self.shared.as_ref().pop() }
    }
}

impl<T, const CAP: usize, const POOL: usize> Drop for Consumer<T, CAP, POOL> {
    fn drop(&mut self) {
        // Safety: dropped exactly once, no access afterwards.
        unsafe { Shared::release(self.shared) };
    }
}

impl<T, const CAP: usize, const POOL: usize> fmt::Debug for Consumer<T, CAP, POOL> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn single_producer_fifo() {
        const ELEMENTS: u64 = 100_000;

        let (mut producers, mut rx) = queue::<u64>(1);
        let tx = &mut producers[0];

        for i in 0..ELEMENTS {
            tx.push(i);
        }
        for i in 0..ELEMENTS {
            assert_eq!(rx.pop(), Some(i));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn sequential_pushes_merge_in_program_order() {
        let (mut producers, mut rx) = queue::<u64>(3);

        // One thread, many lanes: every push advances the clock, so the
        // merge must reproduce program order.
        producers[2].push(1);
        producers[0].push(2);
        producers[1].push(3);
        producers[2].push(4);
        producers[0].push(5);

        for want in 1..=5 {
            assert_eq!(rx.pop(), Some(want));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn interleaved_push_pop() {
        let (mut producers, mut rx) = queue_with::<u64, 16, 4>(1);

        for i in 0..1000 {
            producers[0].push(i);
            producers[0].push(i + 1000);
            assert_eq!(rx.pop(), Some(i));
            assert_eq!(rx.pop(), Some(i + 1000));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn contended_no_loss_no_duplication_per_lane_fifo() {
        const PRODUCERS: usize = 8;
        const ELEMENTS: u64 = 20_000;

        let (producers, mut rx) = queue::<u64>(PRODUCERS as u16);

        // Lane k pushes k * 1_000_000 + i for i in 0..ELEMENTS.
        let handles: Vec<_> = producers
            .into_iter()
            .map(|mut tx| {
                thread::spawn(move || {
                    let base = tx.lane() as u64 * 1_000_000;
                    for i in 0..ELEMENTS {
                        tx.push(base + i);
                    }
                })
            })
            .collect();

        let mut next_per_lane = [0u64; PRODUCERS];
        let mut seen = HashSet::new();
        let mut received = 0u64;
        while received < PRODUCERS as u64 * ELEMENTS {
            let Some(value) = rx.pop() else {
                std::hint::spin_loop();
                continue;
            };
            let lane = (value / 1_000_000) as usize;
            let i = value % 1_000_000;

            // Per-lane order must be exactly the push order.
            assert_eq!(next_per_lane[lane], i, "lane {lane} out of order");
            next_per_lane[lane] += 1;
            assert!(seen.insert(value), "duplicate value {value}");
            received += 1;
        }

        assert_eq!(rx.pop(), None);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn segment_turnover_through_small_pool() {
        // Tiny segments and ring so the chain and the recycler both cycle
        // hundreds of times.
        const ELEMENTS: u64 = 10 * 16;

        let (producers, mut rx) = queue_with::<u64, 16, 4>(2);
        let handles: Vec<_> = producers
            .into_iter()
            .map(|mut tx| {
                thread::spawn(move || {
                    for i in 0..ELEMENTS {
                        tx.push(i);
                    }
                })
            })
            .collect();

        let mut received = 0;
        while received < 2 * ELEMENTS {
            if rx.pop().is_some() {
                received += 1;
            } else {
                std::hint::spin_loop();
            }
        }

        assert_eq!(rx.pop(), None);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn with_drop_type() {
        struct DropCounter(Arc<AtomicUsize>);
        impl Drop for DropCounter {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let (mut producers, mut rx) = queue_with::<DropCounter, 16, 4>(2);

            for _ in 0..50 {
                producers[0].push(DropCounter(Arc::clone(&drops)));
                producers[1].push(DropCounter(Arc::clone(&drops)));
            }

            drop(rx.pop().unwrap());
            assert_eq!(drops.load(Ordering::SeqCst), 1);
            // 99 values left undrained when the handles drop.
        }
        assert_eq!(drops.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn handles_can_drop_in_any_order() {
        let (mut producers, mut rx) = queue::<u64>(2);

        producers[0].push(1);
        drop(rx);
        producers[1].push(2);
        drop(producers);
    }

    #[test]
    fn debug_formatting() {
        let (producers, rx) = queue::<u64>(1);
        assert!(format!("{producers:?}").contains("Producer"));
        assert!(format!("{rx:?}").contains("Consumer"));
    }
}
