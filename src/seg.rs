//! Slot and segment storage for one producer lane.
//!
//! A lane is a linked list of fixed-capacity segments. The lane's producer
//! appends at the tail segment, the consumer drains from the head segment,
//! and the two only ever synchronize through the per-slot stamp.

use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Stamp value meaning "not yet written".
pub(crate) const EMPTY: u64 = u64::MAX;

/// One (payload, stamp) pair.
///
/// The stamp is the unit of publication: the producer plain-stores `data`,
/// then release-stores the stamp; a consumer that acquire-loads a stamp
/// other than [`EMPTY`] is guaranteed to see the matching `data`.
#[repr(C)]
pub(crate) struct Slot<T> {
    count: AtomicU64,
    data: UnsafeCell<MaybeUninit<T>>,
}

/// One node of a lane's segment list.
///
/// Memory layout:
/// ```text
/// ┌──────────────────────────────────────────────────────────┐
/// │ read_head  (cache-line padded) - consumer drain position │
/// ├──────────────────────────────────────────────────────────┤
/// │ next       (cache-line padded) - link to successor       │
/// ├──────────────────────────────────────────────────────────┤
/// │ Slot[0], Slot[1], ... Slot[CAP-1] (each padded)          │
/// ├──────────────────────────────────────────────────────────┤
/// │ write_head (cache-line padded) - producer fill position  │
/// └──────────────────────────────────────────────────────────┘
/// ```
///
/// `next` is a plain cell: the producer links a successor before it
/// release-publishes the last slot's stamp, and the consumer reads the
/// link only after acquire-loading that stamp.
#[repr(C)]
pub(crate) struct Segment<T, const CAP: usize> {
    /// Consumer's position in `slots`. Consumer-only.
    read_head: CachePadded<Cell<usize>>,
    /// Successor segment, once the producer has moved on.
    next: CachePadded<Cell<*mut Segment<T, CAP>>>,
    slots: [CachePadded<Slot<T>>; CAP],
    /// Producer's position in `slots`. Producer-only.
    write_head: CachePadded<Cell<usize>>,
}

// Safety: a segment is shared between exactly one producer and one
// consumer. The producer writes `write_head`, `next`, and unpublished
// slots; the consumer reads published slots and writes `read_head`. All
// cross-thread hand-off goes through the release/acquire stamp.
unsafe impl<T: Send, const CAP: usize> Send for Segment<T, CAP> {}
unsafe impl<T: Send, const CAP: usize> Sync for Segment<T, CAP> {}

impl<T, const CAP: usize> Segment<T, CAP> {
    /// Allocates a segment with every slot vacant.
    ///
    /// Aborts on allocation failure; the queue cannot continue without the
    /// segment.
    pub(crate) fn alloc() -> NonNull<Self> {
        const { assert!(CAP >= 2, "segment capacity must be at least 2") };

        let layout = Layout::new::<Self>();
        let ptr = unsafe { alloc(layout).cast::<Self>() };
        let Some(seg) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };

        unsafe {
            ptr::write(
                ptr::addr_of_mut!((*ptr).read_head),
                CachePadded::new(Cell::new(0)),
            );
            ptr::write(
                ptr::addr_of_mut!((*ptr).next),
                CachePadded::new(Cell::new(ptr::null_mut())),
            );
            ptr::write(
                ptr::addr_of_mut!((*ptr).write_head),
                CachePadded::new(Cell::new(0)),
            );

            // Stamps start vacant; payloads stay uninitialized until
            // their slot is published.
            let slots = ptr::addr_of_mut!((*ptr).slots).cast::<CachePadded<Slot<T>>>();
            for i in 0..CAP {
                ptr::write(
                    slots.add(i),
                    CachePadded::new(Slot {
                        count: AtomicU64::new(EMPTY),
                        data: UnsafeCell::new(MaybeUninit::uninit()),
                    }),
                );
            }
        }

        seg
    }

    /// Frees a segment's memory without touching payloads.
    ///
    /// # Safety
    ///
    /// The segment must have come from [`Segment::alloc`], must not be
    /// referenced afterwards, and any still-published payloads must have
    /// been dropped or moved out by the caller.
    pub(crate) unsafe fn dealloc(this: NonNull<Self>) {
        unsafe { dealloc(this.as_ptr().cast(), Layout::new::<Self>()) };
    }

    /// Returns the segment to its freshly-allocated state.
    ///
    /// Called by the consumer before handing a drained segment back
    /// through the recycle ring; the hand-off's release store publishes
    /// these writes to the producer.
    pub(crate) fn reset(&self) {
        self.read_head.set(0);
        self.write_head.set(0);
        self.next.set(ptr::null_mut());
        for slot in self.slots.iter() {
            slot.count.store(EMPTY, Ordering::Relaxed);
        }
    }

    // === Producer side ===

    #[inline]
    pub(crate) fn write_head(&self) -> usize {
        self.write_head.get()
    }

    /// Links the successor segment.
    ///
    /// Must happen before the last slot is published: the release store of
    /// that slot's stamp is what makes the link visible to the consumer.
    #[inline]
    pub(crate) fn link(&self, next: *mut Self) {
        self.next.set(next);
    }

    /// Writes `value` at the fill position, stamps it, and advances.
    ///
    /// # Safety
    ///
    /// Caller must be the lane's only producer, and `write_head < CAP`.
    #[inline]
    pub(crate) unsafe fn publish(&self, value: T, ts: u64) {
        let at = self.write_head.get();
        let slot = &self.slots[at];
        unsafe {
            (*slot.data.get()).write(value);
        }
        slot.count.store(ts, Ordering::Release);
        self.write_head.set(at + 1);
    }

    // === Consumer side ===

    #[inline]
    pub(crate) fn read_head(&self) -> usize {
        self.read_head.get()
    }

    #[inline]
    pub(crate) fn next(&self) -> *mut Self {
        self.next.get()
    }

    /// The stamp at the drain position, or [`EMPTY`] if nothing is there.
    ///
    /// # Safety
    ///
    /// Caller must be the only consumer, and `read_head < CAP`.
    #[inline]
    pub(crate) unsafe fn peek(&self) -> u64 {
        self.slots[self.read_head.get()].count.load(Ordering::Acquire)
    }

    /// Moves the payload out of the drain position and advances.
    ///
    /// # Safety
    ///
    /// Caller must be the only consumer and must have observed a stamp at
    /// this position via [`Segment::peek`].
    #[inline]
    pub(crate) unsafe fn take(&self) -> T {
        let at = self.read_head.get();
        let value = unsafe { (*self.slots[at].data.get()).assume_init_read() };
        self.read_head.set(at + 1);
        value
    }

    /// Drops every published-but-unconsumed payload.
    ///
    /// Publication is in slot order, so the first vacant stamp ends the
    /// scan.
    ///
    /// # Safety
    ///
    /// Sole-owner teardown only; no producer or consumer may be active.
    pub(crate) unsafe fn drop_undrained(&self) {
        for slot in self.slots[self.read_head.get()..].iter() {
            if slot.count.load(Ordering::Relaxed) == EMPTY {
                break;
            }
            unsafe {
                (*slot.data.get()).assume_init_drop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn publish_then_take_round_trip() {
        let seg = Segment::<u64, 8>::alloc();
        unsafe {
            let inner = seg.as_ref();

            assert_eq!(inner.peek(), EMPTY);

            inner.publish(41, 0);
            inner.publish(42, 1);

            assert_eq!(inner.peek(), 0);
            assert_eq!(inner.take(), 41);
            assert_eq!(inner.peek(), 1);
            assert_eq!(inner.take(), 42);
            assert_eq!(inner.peek(), EMPTY);

            Segment::dealloc(seg);
        }
    }

    #[test]
    fn fill_to_capacity() {
        let seg = Segment::<u64, 4>::alloc();
        unsafe {
            let inner = seg.as_ref();

            for i in 0..4 {
                inner.publish(i, i);
            }
            assert_eq!(inner.write_head(), 4);

            for i in 0..4 {
                assert_eq!(inner.take(), i);
            }
            assert_eq!(inner.read_head(), 4);

            Segment::dealloc(seg);
        }
    }

    #[test]
    fn reset_restores_vacancy() {
        let seg = Segment::<u64, 4>::alloc();
        unsafe {
            let inner = seg.as_ref();

            for i in 0..4 {
                inner.publish(i, i);
                inner.take();
            }
            inner.link(seg.as_ptr()); // arbitrary non-null

            inner.reset();
            assert_eq!(inner.read_head(), 0);
            assert_eq!(inner.write_head(), 0);
            assert!(inner.next().is_null());
            assert_eq!(inner.peek(), EMPTY);

            Segment::dealloc(seg);
        }
    }

    #[test]
    fn drop_undrained_skips_consumed_slots() {
        struct DropCounter(Arc<AtomicUsize>);
        impl Drop for DropCounter {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let seg = Segment::<DropCounter, 4>::alloc();
        unsafe {
            let inner = seg.as_ref();

            for i in 0..3 {
                inner.publish(DropCounter(Arc::clone(&drops)), i);
            }
            drop(inner.take()); // one consumed, two undrained

            inner.drop_undrained();
            Segment::dealloc(seg);
        }

        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }
}
