//! Multi-lane MPSC queues for very high enqueue throughput under contention.
//!
//! `multilane` partitions producer state so that producers never contend
//! with each other: every registered producer owns a private segmented
//! FIFO (its *lane*), and a single consumer merges the lanes back into one
//! stream using a monotonic advisory timestamp stamped on each value.
//!
//! # Quick Start
//!
//! ```
//! let (mut producers, mut rx) = multilane::spin::queue::<u64>(2);
//!
//! let mut p1 = producers.pop().unwrap();
//! let mut p0 = producers.pop().unwrap();
//!
//! p0.push(1);
//! p1.push(2);
//!
//! assert_eq!(rx.pop(), Some(1));
//! assert_eq!(rx.pop(), Some(2));
//! assert_eq!(rx.pop(), None);
//! ```
//!
//! # Variants
//!
//! Three variants share the same lanes, storage, and merge; they differ
//! only in capacity and blocking policy:
//!
//! - [`spin`]: `pop` is non-blocking and returns `None` when empty.
//! - [`wait`]: `recv` blocks the consumer until a value arrives, with a
//!   conditional-parking wake protocol so producers almost never pay a
//!   syscall.
//! - [`overflow`]: like `spin`, plus a cloneable [`overflow::Handle`] that
//!   accepts values from threads beyond the provisioned producer count via
//!   a lock-free auxiliary list (one heap allocation per value on that
//!   path).
//!
//! # Ordering
//!
//! - Values from the same producer are delivered in strict FIFO order.
//! - Across producers, delivery follows the timestamp stamped at enqueue:
//!   any two values with different stamps are delivered in stamp order.
//!   Equal stamps are possible (the clock is advisory) and resolve
//!   deterministically to the lowest lane index, with auxiliary-list
//!   values winning ties against lanes.
//!
//! This is *not* linearizable against the wall-clock moment of `push`; it
//! is a deliberate trade for an enqueue path with no producer-producer
//! contention at all.
//!
//! # Performance Notes
//!
//! The enqueue hot path is: one acquire load of the clock, one plain data
//! store, one release store of the stamp, and at most one uncontended
//! `fetch_add`. There is no CAS loop and no "queue full" branch; lanes
//! grow by segment, and drained segments are recycled through a per-lane
//! pool so steady-state traffic allocates nothing.
//!
//! Dequeue scans every lane head per value. The design targets workloads
//! with many producers and one drain loop (loggers, event collectors,
//! metric sinks), where enqueue cost dominates.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, missing_debug_implementations)]

mod clock;
mod lanes;
mod pool;
mod seg;

pub mod overflow;
pub mod spin;
pub mod wait;

/// Default number of slots per lane segment.
pub const DEFAULT_SEGMENT_CAP: usize = 4096;

/// Default number of drained segments each lane's recycle ring can hold.
pub const DEFAULT_POOL_CAP: usize = 16;
