//! Overflow queue variant: registered lanes plus a lock-free auxiliary
//! list for producers beyond the provisioned count.
//!
//! Lane handles behave exactly like the [`spin`](crate::spin) variant's.
//! The extra piece is a cloneable [`Handle`] that any number of threads
//! may push through concurrently: transient workers, callbacks, threads
//! whose identity was unknown when the queue was built. That path appends
//! to a linked list with an atomic tail exchange, at the cost of one heap
//! allocation per value.
//!
//! The consumer merges both sources by stamp. An auxiliary value wins a
//! stamp tie against a lane value; lanes tie-break among themselves to
//! the lowest index.
//!
//! # Example
//!
//! ```
//! let (mut producers, extra, mut rx) = multilane::overflow::queue::<u64>(1);
//!
//! producers[0].push(1); // lane path
//! extra.push(2);        // auxiliary path
//!
//! assert_eq!(rx.pop(), Some(1));
//! assert_eq!(rx.pop(), Some(2));
//! assert_eq!(rx.pop(), None);
//! ```
//!
//! A queue with zero lanes is valid: every value then travels the
//! auxiliary path.

use std::cell::Cell;
use std::fmt;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

use crate::lanes::{NO_LANE, Shared};
use crate::seg::EMPTY;
use crate::{DEFAULT_POOL_CAP, DEFAULT_SEGMENT_CAP};

/// Merge index meaning "the auxiliary list holds the minimum".
const AUX: isize = -2;

/// One auxiliary-list entry.
///
/// Only `next` is atomic: a node is fully written before the tail
/// exchange makes it reachable, so `count` and `data` are immutable by
/// the time any other thread can see them.
struct ExtraNode<T> {
    next: AtomicPtr<ExtraNode<T>>,
    count: u64,
    data: MaybeUninit<T>,
}

impl<T> ExtraNode<T> {
    /// Heap-allocates the list's dummy head.
    fn dummy() -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            count: EMPTY,
            data: MaybeUninit::uninit(),
        }))
    }
}

/// Lane state plus the auxiliary list.
struct OverflowShared<T, const CAP: usize, const POOL: usize> {
    core: Shared<T, CAP, POOL>,
    /// Dummy head; the first real entry is `(*extra_head).next`.
    /// Consumer-owned.
    extra_head: CachePadded<Cell<*mut ExtraNode<T>>>,
    /// Most recently appended entry. Any producer may exchange it.
    extra_tail: CachePadded<AtomicPtr<ExtraNode<T>>>,
}

// Safety: the lane core carries its own partitioning argument; the
// auxiliary list is append-by-exchange from any thread and drained by the
// single consumer, with node hand-off through the release/acquire `next`
// link.
unsafe impl<T: Send, const CAP: usize, const POOL: usize> Send for OverflowShared<T, CAP, POOL> {}
unsafe impl<T: Send, const CAP: usize, const POOL: usize> Sync for OverflowShared<T, CAP, POOL> {}

impl<T, const CAP: usize, const POOL: usize> OverflowShared<T, CAP, POOL> {
    fn allocate(producers: u16, handles: usize) -> NonNull<Self> {
        let dummy = ExtraNode::dummy();
        let this = Self {
            core: Shared::new(producers, handles),
            extra_head: CachePadded::new(Cell::new(dummy)),
            extra_tail: CachePadded::new(AtomicPtr::new(dummy)),
        };
        unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(this))) }
    }

    /// Drops an owning handle, freeing everything if it was the last.
    ///
    /// # Safety
    ///
    /// Must be called exactly once per handle, with no access to `this`
    /// afterwards.
    unsafe fn release(this: NonNull<Self>) {
        if unsafe { this.as_ref() }.core.handle_dropped() {
            drop(unsafe { Box::from_raw(this.as_ptr()) });
        }
    }

    /// Appends through the auxiliary list. Safe from any thread.
    fn overflow_push(&self, value: T) {
        let ts = self.core.clock().snapshot();

        let node = Box::into_raw(Box::new(ExtraNode {
            next: AtomicPtr::new(ptr::null_mut()),
            count: ts,
            data: MaybeUninit::new(value),
        }));

        // Claim the tail slot, then make the node reachable. Between the
        // two steps the list's visible suffix simply ends one node early.
        let old = self.extra_tail.swap(node, Ordering::AcqRel);
        unsafe { (*old).next.store(node, Ordering::Release) };

        self.core.clock().advance(ts);
    }

    /// The stamp of the oldest auxiliary entry, if one is reachable.
    ///
    /// # Safety
    ///
    /// Caller must be the queue's only consumer.
    #[inline]
    unsafe fn peek_extra(&self) -> Option<u64> {
        let head = self.extra_head.get();
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            None
        } else {
            Some(unsafe { (*next).count })
        }
    }

    /// Consumes the oldest auxiliary entry; the consumed node becomes the
    /// new dummy and the old dummy is freed.
    ///
    /// # Safety
    ///
    /// Caller must be the queue's only consumer and must have observed an
    /// entry via [`OverflowShared::peek_extra`].
    unsafe fn take_extra(&self) -> T {
        let head = self.extra_head.get();
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        debug_assert!(!next.is_null());

        let value = unsafe { (*next).data.assume_init_read() };
        self.extra_head.set(next);

        // The old dummy's payload was moved out when it was consumed (or
        // never existed); only the box itself is freed.
        drop(unsafe { Box::from_raw(head) });

        value
    }
}

impl<T, const CAP: usize, const POOL: usize> Drop for OverflowShared<T, CAP, POOL> {
    fn drop(&mut self) {
        // Lanes clean themselves up. The auxiliary list still holds every
        // unconsumed entry past the dummy head.
        let head = self.extra_head.get();
        let mut node = unsafe { (*head).next.load(Ordering::Relaxed) };
        drop(unsafe { Box::from_raw(head) });

        while !node.is_null() {
            let next = unsafe { (*node).next.load(Ordering::Relaxed) };
            unsafe {
                (*node).data.assume_init_drop();
                drop(Box::from_raw(node));
            }
            node = next;
        }
    }
}

/// Creates an overflow queue with the default capacities.
///
/// Returns one [`Producer`] per lane, the cloneable auxiliary [`Handle`],
/// and the single [`Consumer`]. `producers` may be zero, in which case
/// every value travels the auxiliary path.
pub fn queue<T>(producers: u16) -> (Vec<Producer<T>>, Handle<T>, Consumer<T>) {
    queue_with::<T, DEFAULT_SEGMENT_CAP, DEFAULT_POOL_CAP>(producers)
}

/// Creates an overflow queue with explicit segment and recycle-ring
/// capacities.
pub fn queue_with<T, const CAP: usize, const POOL: usize>(
    producers: u16,
) -> (
    Vec<Producer<T, CAP, POOL>>,
    Handle<T, CAP, POOL>,
    Consumer<T, CAP, POOL>,
) {
    let shared = OverflowShared::allocate(producers, producers as usize + 2);

    let senders = (0..producers as usize)
        .map(|lane| Producer { shared, lane })
        .collect();

    (senders, Handle { shared }, Consumer { shared })
}

/// The enqueue handle for one registered lane.
///
/// Owns its lane exclusively: not `Clone`, not `Sync`. Move it to the
/// producing thread.
pub struct Producer<
    T,
    const CAP: usize = DEFAULT_SEGMENT_CAP,
    const POOL: usize = DEFAULT_POOL_CAP,
> {
    shared: NonNull<OverflowShared<T, CAP, POOL>>,
    lane: usize,
}

// Safety: same partitioning as the spin variant's producer.
unsafe impl<T: Send, const CAP: usize, const POOL: usize> Send for Producer<T, CAP, POOL> {}

impl<T, const CAP: usize, const POOL: usize> Producer<T, CAP, POOL> {
    /// Appends a value to this producer's lane.
    ///
    /// Identical to the spin variant's push: no allocation in steady
    /// state, no contention with other producers.
    #[inline]
    pub fn push(&mut self, value: T) {
        // Safety: this handle is the lane's only producer. It is neither
        // Clone nor Sync, and `&mut self` pins it to one thread at a time.
        unsafe { self.shared.as_ref().core.push(self.lane, value) }
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
        unsafe { OverflowShared::release(self.shared) };
    }
}

impl<T, const CAP: usize, const POOL: usize> fmt::Debug for Producer<T, CAP, POOL> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("lane", &self.lane)
            .finish_non_exhaustive()
    }
}

/// The auxiliary enqueue handle for producers outside the lane set.
///
/// Clone it freely and push from any thread; every push heap-allocates
/// one list node. Lanes are cheaper; use them for producers known at
/// construction.
pub struct Handle<
    T,
    const CAP: usize = DEFAULT_SEGMENT_CAP,
    const POOL: usize = DEFAULT_POOL_CAP,
> {
    shared: NonNull<OverflowShared<T, CAP, POOL>>,
}

// Safety: the auxiliary path is safe for concurrent pushes from any
// number of threads.
unsafe impl<T: Send, const CAP: usize, const POOL: usize> Send for Handle<T, CAP, POOL> {}
unsafe impl<T: Send, const CAP: usize, const POOL: usize> Sync for Handle<T, CAP, POOL> {}

impl<T, const CAP: usize, const POOL: usize> Handle<T, CAP, POOL> {
    /// Appends a value through the auxiliary list.
    #[inline]
    pub fn push(&self, value: T) {
        unsafe { self.shared.as_ref() }.overflow_push(value);
    }
}

impl<T, const CAP: usize, const POOL: usize> Clone for Handle<T, CAP, POOL> {
    fn clone(&self) -> Self {
        unsafe { self.shared.as_ref() }.core.retain();
        Self { shared: self.shared }
    }
}

impl<T, const CAP: usize, const POOL: usize> Drop for Handle<T, CAP, POOL> {
    fn drop(&mut self) {
        // Safety: dropped exactly once per clone, no access afterwards.
        unsafe { OverflowShared::release(self.shared) };
    }
}

impl<T, const CAP: usize, const POOL: usize> fmt::Debug for Handle<T, CAP, POOL> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}

/// The dequeue handle. There is exactly one.
pub struct Consumer<
    T,
    const CAP: usize = DEFAULT_SEGMENT_CAP,
    const POOL: usize = DEFAULT_POOL_CAP,
> {
    shared: NonNull<OverflowShared<T, CAP, POOL>>,
}

// Safety: single consumer by construction; may move between threads.
unsafe impl<T: Send, const CAP: usize, const POOL: usize> Send for Consumer<T, CAP, POOL> {}

impl<T, const CAP: usize, const POOL: usize> Consumer<T, CAP, POOL> {
    /// Removes the value with the smallest stamp across the lanes and the
    /// auxiliary list, or `None` when both look empty on two consecutive
    /// scans.
    pub fn pop(&mut self) -> Option<T> {
        let shared = unsafe { self.shared.as_ref() };

        let mut prev: isize = AUX;
        loop {
            let mut min_ts = EMPTY;
            let mut min_at = NO_LANE;

            // Safety (scan/peek/take below): this handle is the queue's
            // only consumer.
            if let Some(count) = unsafe { shared.peek_extra() } {
                min_ts = count;
                min_at = AUX;
            }

            let (lane_ts, lane_at) = unsafe { shared.core.scan() };
            if lane_ts < min_ts {
                min_at = lane_at;
            }

            if min_at == NO_LANE && prev == NO_LANE {
                return None;
            }
            if min_at == prev {
                let value = if min_at == AUX {
                    unsafe { shared.take_extra() }
                } else {
                    unsafe { shared.core.take(min_at as usize) }
                };
                return Some(value);
            }

            prev = min_at;
        }
    }
}

impl<T, const CAP: usize, const POOL: usize> Drop for Consumer<T, CAP, POOL> {
    fn drop(&mut self) {
        // Safety: dropped exactly once, no access afterwards.
        unsafe { OverflowShared::release(self.shared) };
    }
}

impl<T, const CAP: usize, const POOL: usize> fmt::Debug for Consumer<T, CAP, POOL> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").finish_non_exhaustive()
    }
}
