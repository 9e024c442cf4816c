//! Blocking queue variant: `recv` waits until a value arrives.
//!
//! Same lanes and merge as [`spin`](crate::spin); the difference is the
//! consumer's empty path. Instead of returning `None`, the consumer goes
//! through three phases of increasing cost:
//!
//! 1. immediate re-scan (catches values already in flight),
//! 2. bounded backoff with [`Backoff::snooze`],
//! 3. park the thread.
//!
//! Producers only pay for the wake when the consumer has actually gone to
//! sleep: after publishing they load a parked flag, and only a set flag
//! triggers the unpark syscall. Both flag accesses are `SeqCst` so the
//! "publish then check flag" and "set flag then re-scan" sequences cannot
//! both miss each other.
//!
//! Use this variant when the consumer is a dedicated thread with nothing
//! else to do; there is no disconnect signal, so a `recv` with no live
//! producers blocks until one shows up.
//!
//! # Example
//!
//! ```
//! use std::thread;
//!
//! let (mut producers, mut rx) = multilane::wait::queue::<u64>(1);
//!
//! let mut tx = producers.pop().unwrap();
//! thread::spawn(move || {
//!     tx.push(42);
//! });
//!
//! // Blocks until the value is published.
//! assert_eq!(rx.recv(), 42);
//! ```

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::sync::{Parker, Unparker};
use crossbeam_utils::{Backoff, CachePadded};

use crate::lanes::Shared;
use crate::{DEFAULT_POOL_CAP, DEFAULT_SEGMENT_CAP};

/// Default number of backoff snooze iterations before parking.
const DEFAULT_SNOOZE_ITERS: usize = 8;

/// Creates a blocking queue with the default capacities and backoff.
///
/// # Panics
///
/// Panics if `producers` is zero.
pub fn queue<T>(producers: u16) -> (Vec<Producer<T>>, Consumer<T>) {
    queue_with_config::<T, DEFAULT_SEGMENT_CAP, DEFAULT_POOL_CAP>(producers, DEFAULT_SNOOZE_ITERS)
}

/// Creates a blocking queue with explicit capacities and backoff tuning.
///
/// `snooze_iters` is how many backoff iterations the consumer burns
/// before committing to a park syscall. More spinning trades CPU for
/// wake latency on bursty traffic.
///
/// # Panics
///
/// Panics if `producers` is zero.
pub fn queue_with_config<T, const CAP: usize, const POOL: usize>(
    producers: u16,
    snooze_iters: usize,
) -> (Vec<Producer<T, CAP, POOL>>, Consumer<T, CAP, POOL>) {
    assert!(producers > 0, "queue needs at least one registered producer");

    let shared = Shared::allocate(producers, producers as usize + 1);
    let parked = Arc::new(CachePadded::new(AtomicBool::new(false)));
    let parker = Parker::new();
    let unparker = parker.unparker().clone();

    let senders = (0..producers as usize)
        .map(|lane| Producer {
            shared,
            lane,
            parked: Arc::clone(&parked),
            unparker: unparker.clone(),
        })
        .collect();

    let consumer = Consumer {
        shared,
        parked,
        parker,
        snooze_iters,
    };

    (senders, consumer)
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
    parked: Arc<CachePadded<AtomicBool>>,
    unparker: Unparker,
}

// Safety: same partitioning as the spin variant; the parking state is an
// Arc of atomics.
unsafe impl<T: Send, const CAP: usize, const POOL: usize> Send for Producer<T, CAP, POOL> {}

impl<T, const CAP: usize, const POOL: usize> Producer<T, CAP, POOL> {
    /// Appends a value to this producer's lane, waking the consumer if it
    /// is parked.
    ///
    /// Never fails and never blocks. The common case adds one `SeqCst`
    /// load to the spin variant's push; the unpark syscall only happens
    /// when the consumer is actually asleep.
    #[inline]
    pub fn push(&mut self, value: T) {
        // Safety: this handle is the lane's only producer. It is neither
        // Clone nor Sync, and `&mut self` pins it to one thread at a time.
        unsafe { self.shared.as_ref().push(self.lane, value) }

        if self.parked.load(Ordering::SeqCst) {
            self.unparker.unpark();
        }
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
    parked: Arc<CachePadded<AtomicBool>>,
    parker: Parker,
    snooze_iters: usize,
}

// Safety: single consumer by construction; may move between threads.
unsafe impl<T: Send, const CAP: usize, const POOL: usize> Send for Consumer<T, CAP, POOL> {}

impl<T, const CAP: usize, const POOL: usize> Consumer<T, CAP, POOL> {
    /// Removes the value with the smallest stamp, blocking until one is
    /// available.
    pub fn recv(&mut self) -> T {
        // Fast path.
        // Safety (all pops below): this handle is the queue's only
        // consumer.
        if let Some(value) = unsafe { self.shared.as_ref().pop() } {
            return value;
        }

        // Backoff phase.
        let backoff = Backoff::new();
        for _ in 0..self.snooze_iters {
            backoff.snooze();
            if let Some(value) = unsafe { self.shared.as_ref().pop() } {
                return value;
            }
        }

        // Park phase. The flag store is SeqCst and the re-scan comes
        // after it, pairing with the producer's publish-then-load order;
        // a value published while we are falling asleep is either seen by
        // the re-scan or triggers an unpark.
        loop {
            self.parked.store(true, Ordering::SeqCst);

            if let Some(value) = unsafe { self.shared.as_ref().pop() } {
                self.parked.store(false, Ordering::Relaxed);
                return value;
            }

            self.parker.park();
            self.parked.store(false, Ordering::Relaxed);

            if let Some(value) = unsafe { self.shared.as_ref().pop() } {
                return value;
            }
        }
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
        f.debug_struct("Consumer")
            .field("snooze_iters", &self.snooze_iters)
            .finish_non_exhaustive()
    }
}
