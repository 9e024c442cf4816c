//! The lane core shared by every queue variant: per-producer segmented
//! FIFOs, the enqueue path, and the consumer's stamp-merge scan.

use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::clock::Clock;
use crate::pool::RecyclePool;
use crate::seg::{EMPTY, Segment};

/// Scan result index meaning "every lane head is vacant".
pub(crate) const NO_LANE: isize = -1;

/// One producer's private segmented FIFO.
///
/// `head` and `tail` may point at the same segment. Only the consumer
/// moves `head`; only the lane's producer moves `tail`.
struct Lane<T, const CAP: usize, const POOL: usize> {
    /// Oldest live segment; drained from here. Consumer-owned.
    head: CachePadded<Cell<*mut Segment<T, CAP>>>,
    /// Newest segment; appended to here. Producer-owned.
    tail: CachePadded<Cell<*mut Segment<T, CAP>>>,
    pool: RecyclePool<T, CAP, POOL>,
}

impl<T, const CAP: usize, const POOL: usize> Lane<T, CAP, POOL> {
    fn new() -> Self {
        let seg = Segment::alloc().as_ptr();
        Self {
            head: CachePadded::new(Cell::new(seg)),
            tail: CachePadded::new(Cell::new(seg)),
            pool: RecyclePool::new(),
        }
    }
}

impl<T, const CAP: usize, const POOL: usize> Drop for Lane<T, CAP, POOL> {
    fn drop(&mut self) {
        // Walk the live chain, dropping whatever was published but never
        // consumed, then empty the recycle ring.
        let mut seg = self.head.get();
        while let Some(live) = NonNull::new(seg) {
            seg = unsafe { live.as_ref() }.next();
            unsafe {
                live.as_ref().drop_undrained();
                Segment::dealloc(live);
            }
        }

        while let Some(parked) = self.pool.drain() {
            unsafe { Segment::dealloc(parked) };
        }
    }
}

/// State shared by every handle of one queue: the lanes, the clock, and
/// the handle count that decides when to free it all.
pub(crate) struct Shared<T, const CAP: usize, const POOL: usize> {
    lanes: Box<[Lane<T, CAP, POOL>]>,
    clock: Clock,
    ref_count: AtomicUsize,
}

// Safety: cross-thread access is partitioned by role. Each lane's `tail`,
// `write_head`, and unpublished slots are touched only by that lane's
// producer; `head` and `read_head` only by the single consumer; the
// hand-offs (slot stamps, recycle ring indices) are atomic.
unsafe impl<T: Send, const CAP: usize, const POOL: usize> Send for Shared<T, CAP, POOL> {}
unsafe impl<T: Send, const CAP: usize, const POOL: usize> Sync for Shared<T, CAP, POOL> {}

impl<T, const CAP: usize, const POOL: usize> Shared<T, CAP, POOL> {
    /// Builds the lane state with one empty segment per lane.
    ///
    /// `handles` is the number of owning handles the caller is about to
    /// create; the allocation is freed when the last of them drops.
    pub(crate) fn new(producers: u16, handles: usize) -> Self {
        let lanes: Vec<_> = (0..producers).map(|_| Lane::new()).collect();
        Self {
            lanes: lanes.into_boxed_slice(),
            clock: Clock::new(),
            ref_count: AtomicUsize::new(handles),
        }
    }

    /// Heap-allocates shared state for `handles` owners.
    pub(crate) fn allocate(producers: u16, handles: usize) -> NonNull<Self> {
        unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(Self::new(producers, handles)))) }
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Registers one more owning handle.
    pub(crate) fn retain(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Unregisters an owning handle; `true` means the caller was the last
    /// one and must free the allocation.
    pub(crate) fn handle_dropped(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Drops an owning handle of a plain (non-wrapped) allocation,
    /// freeing it if this was the last.
    ///
    /// # Safety
    ///
    /// Must be called exactly once per handle, with no access to `this`
    /// afterwards.
    pub(crate) unsafe fn release(this: NonNull<Self>) {
        if unsafe { this.as_ref() }.handle_dropped() {
            drop(unsafe { Box::from_raw(this.as_ptr()) });
        }
    }

    // === Producer side ===

    /// Appends `value` to `lane`, growing the segment chain as needed.
    ///
    /// # Safety
    ///
    /// Caller must be the only producer ever pushing on `lane`, and
    /// `lane < self.lanes.len()`.
    #[inline]
    pub(crate) unsafe fn push(&self, lane: usize, value: T) {
        let lane = &self.lanes[lane];
        let seg = unsafe { &*lane.tail.get() };

        // About to fill the last slot: link a successor first, so the
        // release store of that slot's stamp publishes the link with it.
        if seg.write_head() == CAP - 1 {
            let fresh = lane.pool.pop();
            seg.link(fresh.as_ptr());
            lane.tail.set(fresh.as_ptr());
        }

        let ts = self.clock.snapshot();
        unsafe { seg.publish(value, ts) };
        self.clock.advance(ts);
    }

    // === Consumer side ===

    /// One pass over the lane heads: the smallest stamp and its lane,
    /// ties to the lowest index, or `(EMPTY, NO_LANE)` when every head is
    /// vacant.
    ///
    /// # Safety
    ///
    /// Caller must be the queue's only consumer.
    #[inline]
    pub(crate) unsafe fn scan(&self) -> (u64, isize) {
        let mut min_ts = EMPTY;
        let mut min_lane = NO_LANE;
        for (i, lane) in self.lanes.iter().enumerate() {
            let count = unsafe { (*lane.head.get()).peek() };
            if count < min_ts {
                min_ts = count;
                min_lane = i as isize;
            }
        }
        (min_ts, min_lane)
    }

    /// Consumes the head value of `lane`, retiring its segment into the
    /// recycle ring once fully drained.
    ///
    /// # Safety
    ///
    /// Caller must be the queue's only consumer and must have observed a
    /// stamp on this lane via [`Shared::scan`].
    pub(crate) unsafe fn take(&self, lane: usize) -> T {
        let lane = &self.lanes[lane];
        let seg_ptr = lane.head.get();
        let seg = unsafe { &*seg_ptr };

        let value = unsafe { seg.take() };

        if seg.read_head() == CAP {
            // The last slot was published, so its successor link is
            // visible too.
            let next = seg.next();
            debug_assert!(!next.is_null());
            lane.head.set(next);
            lane.pool.push(unsafe { NonNull::new_unchecked(seg_ptr) });
        }

        value
    }

    /// Non-blocking dequeue over the lanes alone.
    ///
    /// A scan winner is only consumed once it repeats on two consecutive
    /// scans: a producer about to publish a smaller stamp has already
    /// stored its payload, so a stable winner cannot be overtaken
    /// retroactively. Two consecutive all-vacant scans report empty.
    ///
    /// # Safety
    ///
    /// Caller must be the queue's only consumer.
    pub(crate) unsafe fn pop(&self) -> Option<T> {
        let mut prev: isize = -2;
        loop {
            let (_, min_lane) = unsafe { self.scan() };

            if min_lane == NO_LANE && prev == NO_LANE {
                return None;
            }
            if min_lane == prev {
                return Some(unsafe { self.take(min_lane as usize) });
            }

            prev = min_lane;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn single_lane_fifo_across_segments() {
        let shared = Shared::<u64, 4, 4>::new(1, 1);

        // Three segments' worth through one lane.
        unsafe {
            for i in 0..12 {
                shared.push(0, i);
            }
            for i in 0..12 {
                assert_eq!(shared.pop(), Some(i));
            }
            assert_eq!(shared.pop(), None);
        }
    }

    #[test]
    fn merge_follows_stamp_order() {
        let shared = Shared::<u64, 8, 4>::new(3, 1);

        // Sequential pushes each advance the clock, so the merge must
        // reproduce program order regardless of lane.
        unsafe {
            shared.push(2, 10);
            shared.push(0, 11);
            shared.push(1, 12);
            shared.push(0, 13);

            assert_eq!(shared.pop(), Some(10));
            assert_eq!(shared.pop(), Some(11));
            assert_eq!(shared.pop(), Some(12));
            assert_eq!(shared.pop(), Some(13));
            assert_eq!(shared.pop(), None);
        }
    }

    #[test]
    fn equal_stamps_resolve_to_lowest_lane() {
        let shared = Shared::<u64, 8, 4>::new(2, 1);

        // Publish directly with hand-picked stamps to force a tie.
        unsafe {
            let lane1 = &*shared.lanes[1].tail.get();
            lane1.publish(21, 7);
            let lane0 = &*shared.lanes[0].tail.get();
            lane0.publish(20, 7);

            assert_eq!(shared.pop(), Some(20));
            assert_eq!(shared.pop(), Some(21));
        }
    }

    #[test]
    fn vacant_lanes_are_skipped() {
        let shared = Shared::<u64, 8, 4>::new(4, 1);

        unsafe {
            shared.push(2, 99);
            assert_eq!(shared.pop(), Some(99));
            assert_eq!(shared.pop(), None);
        }
    }

    #[test]
    fn teardown_drops_undrained_values() {
        struct DropCounter(Arc<AtomicUsize>);
        impl Drop for DropCounter {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let shared = Shared::<DropCounter, 4, 4>::new(2, 1);
            unsafe {
                // Span a segment boundary on lane 0 and leave everything
                // undrained on lane 1.
                for _ in 0..6 {
                    shared.push(0, DropCounter(Arc::clone(&drops)));
                }
                for _ in 0..3 {
                    shared.push(1, DropCounter(Arc::clone(&drops)));
                }
                drop(shared.pop().unwrap());
            }
        }
        assert_eq!(drops.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn segments_recycle_through_the_pool() {
        let shared = Shared::<u64, 4, 4>::new(1, 1);

        // Many segment turnovers on one lane; drained segments must come
        // back through the ring rather than growing the chain.
        unsafe {
            for round in 0..10u64 {
                for i in 0..4 {
                    shared.push(0, round * 4 + i);
                }
                for i in 0..4 {
                    assert_eq!(shared.pop(), Some(round * 4 + i));
                }
            }
            assert_eq!(shared.pop(), None);
        }
    }
}
