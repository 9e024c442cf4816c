//! The per-lane recycle ring for drained segments.
//!
//! The consumer retires a segment once it has drained every slot; instead
//! of freeing it, the segment is handed back to the lane's producer for
//! reuse through this bounded ring. Steady-state traffic then cycles a
//! small set of segments per lane with no allocator involvement.

use std::array;
use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::seg::Segment;

/// Bounded single-producer/single-consumer ring of recycled segments.
///
/// The roles are inverted relative to the queue itself: the queue's
/// *consumer* pushes retired segments, and the lane's *producer* pops
/// them. Each side owns its own index; only the hand-off direction
/// (push's release store, pop's acquire load of `write_count`) carries a
/// payload, so the opposing-index reads on the push side stay relaxed.
///
/// One ring slot is sacrificed to tell full from empty, so `POOL - 1`
/// segments can be parked at a time.
pub(crate) struct RecyclePool<T, const CAP: usize, const POOL: usize> {
    /// Pop position. Producer-owned.
    read_count: CachePadded<AtomicUsize>,
    /// Push position. Consumer-owned.
    write_count: CachePadded<AtomicUsize>,
    slots: [CachePadded<Cell<*mut Segment<T, CAP>>>; POOL],
}

impl<T, const CAP: usize, const POOL: usize> RecyclePool<T, CAP, POOL> {
    pub(crate) fn new() -> Self {
        const { assert!(POOL >= 2, "recycle ring capacity must be at least 2") };

        Self {
            read_count: CachePadded::new(AtomicUsize::new(0)),
            write_count: CachePadded::new(AtomicUsize::new(0)),
            slots: array::from_fn(|_| CachePadded::new(Cell::new(ptr::null_mut()))),
        }
    }

    #[inline]
    fn wrap(idx: usize) -> usize {
        if idx + 1 == POOL { 0 } else { idx + 1 }
    }

    /// Parks a drained segment for reuse, or frees it if the ring is full.
    ///
    /// Consumer side. The segment is reset here, before the release store
    /// of `write_count` publishes it to the producer.
    pub(crate) fn push(&self, seg: NonNull<Segment<T, CAP>>) {
        let write_idx = self.write_count.load(Ordering::Relaxed);
        let next = Self::wrap(write_idx);

        if next == self.read_count.load(Ordering::Relaxed) {
            unsafe { Segment::dealloc(seg) };
            return;
        }

        unsafe { seg.as_ref() }.reset();
        self.slots[write_idx].set(seg.as_ptr());
        self.write_count.store(next, Ordering::Release);
    }

    /// Takes a recycled segment, or allocates a fresh one if none is
    /// parked.
    ///
    /// Producer side.
    pub(crate) fn pop(&self) -> NonNull<Segment<T, CAP>> {
        let read_idx = self.read_count.load(Ordering::Relaxed);
        if read_idx == self.write_count.load(Ordering::Acquire) {
            return Segment::alloc();
        }

        let seg = self.slots[read_idx].get();
        self.read_count.store(Self::wrap(read_idx), Ordering::Release);

        // Safety: only non-null segment pointers are ever parked.
        unsafe { NonNull::new_unchecked(seg) }
    }

    /// Removes one parked segment, if any. Teardown only, single-threaded
    /// by then.
    pub(crate) fn drain(&self) -> Option<NonNull<Segment<T, CAP>>> {
        let read_idx = self.read_count.load(Ordering::Relaxed);
        if read_idx == self.write_count.load(Ordering::Relaxed) {
            return None;
        }

        let seg = self.slots[read_idx].get();
        self.read_count.store(Self::wrap(read_idx), Ordering::Relaxed);

        Some(unsafe { NonNull::new_unchecked(seg) })
    }
}
