//! Completion tracking: the `WaitCondition` capability and its atomic
//! counter implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

/// Interval between polls in [`WaitCondition::sleep_on`].
const SLEEP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A predicate that some execution is waiting to become true.
///
/// The scheduler treats conditions as opaque: it only ever asks
/// [`is_satisfied`](WaitCondition::is_satisfied) while rescanning sleeping
/// jobs. [`sleep_on`](WaitCondition::sleep_on) is a convenience for plain
/// threads that are not driving the scheduler at all; it busy-polls with a
/// short fixed sleep and must never be called from a worker fiber.
pub trait WaitCondition: Send + Sync {
    /// Non-blocking satisfaction query.
    fn is_satisfied(&self) -> bool;

    /// Blocks the calling thread until the condition is satisfied.
    fn sleep_on(&self) {
        while !self.is_satisfied() {
            thread::sleep(SLEEP_POLL_INTERVAL);
        }
    }
}

/// An atomic down-counter, satisfied exactly when it reaches zero.
///
/// One counter tracks one submitted batch: it starts at the batch size and
/// every completing job decrements it once. Decrements use release ordering
/// and satisfaction checks use acquire ordering, so everything a job wrote
/// before finishing is visible to whoever observes the counter at zero.
pub struct Counter {
    value: AtomicU64,
    /// Outstanding references for pooled counters: one per unfinished job
    /// plus one for the caller's batch handle. The last release returns the
    /// counter's index to the free pool.
    refs: AtomicU64,
}

impl Counter {
    /// Creates a standalone counter with the given initial value.
    pub fn new(initial: u64) -> Self {
        Counter {
            value: AtomicU64::new(initial),
            refs: AtomicU64::new(0),
        }
    }

    /// Current value.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Re-arms a pooled counter for a batch of `jobs` jobs.
    ///
    /// Only called on counters freshly taken from the free pool, so no other
    /// thread can race with the stores.
    pub(crate) fn prepare(&self, jobs: u64) {
        self.value.store(jobs, Ordering::Relaxed);
        self.refs.store(jobs + 1, Ordering::Relaxed);
    }

    /// Records one completed job.
    pub(crate) fn decrement(&self) {
        self.value.fetch_sub(1, Ordering::Release);
    }

    /// Drops one reference; returns true when this was the last one and the
    /// counter may be recycled.
    pub(crate) fn release_ref(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

impl Default for Counter {
    fn default() -> Self {
        Counter::new(0)
    }
}

impl WaitCondition for Counter {
    fn is_satisfied(&self) -> bool {
        self.value() == 0
    }
}
