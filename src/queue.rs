//! Bounded lock-free MPMC queue.
//!
//! A fixed-capacity ring buffer supporting concurrent push and pop from any
//! number of producers and consumers, with both blocking and non-blocking
//! variants. There are no locks anywhere: each slot carries a monotonically
//! advancing "turn" counter that encodes whether the slot is writable or
//! readable for a given generation, and producers/consumers claim slots by
//! taking tickets from the head and tail counters.
//!
//! Turn protocol: for a ticket `t`, the slot at `t & mask` belongs to
//! generation `g = t >> log2(capacity)`. A slot turn of `2g` means "writable
//! for generation g"; `2g + 1` means "readable". Every successful write and
//! every successful read advances the slot turn by one, so the slot cycles
//! through its phases in lockstep with the tickets that target it.
//!
//! The queue guarantees FIFO ordering per slot, which degenerates to full
//! FIFO ordering in the single-producer/single-consumer case. No total order
//! is promised across concurrent producers.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

struct Slot<T> {
    /// Phase marker for this slot. Padded so neighbouring slots never share
    /// a cache line with each other's turn counters.
    turn: CachePadded<AtomicU64>,
    storage: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Slot {
            turn: CachePadded::new(AtomicU64::new(0)),
            storage: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// A bounded lock-free multi-producer multi-consumer queue.
///
/// The effective capacity is the smallest power of two greater than or equal
/// to the requested capacity, so index arithmetic reduces to a bitwise AND.
pub struct BoundedQueue<T> {
    slots: Box<[Slot<T>]>,
    mask: u64,
    /// log2 of capacity; `ticket >> shift` is the ticket's generation.
    shift: u32,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
}

// SAFETY: elements move through the queue by value; slot handoff is
// synchronized by the acquire/release pairs on each slot's turn counter.
unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at least `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let slots = (0..capacity).map(|_| Slot::empty()).collect();
        BoundedQueue {
            slots,
            mask: capacity as u64 - 1,
            shift: capacity.trailing_zeros(),
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Effective (rounded-up) capacity.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn index(&self, ticket: u64) -> usize {
        (ticket & self.mask) as usize
    }

    #[inline]
    fn generation(&self, ticket: u64) -> u64 {
        ticket >> self.shift
    }

    /// Pushes a value, spinning until a slot becomes writable.
    ///
    /// Blocks (by spinning on the slot's turn counter) when the queue is
    /// full; capacity exhaustion is a stall, never a failure.
    pub fn push(&self, value: T) {
        let head = self.head.fetch_add(1, Ordering::Relaxed);
        let slot = &self.slots[self.index(head)];
        let write_turn = self.generation(head) * 2;
        while slot.turn.load(Ordering::Acquire) != write_turn {
            std::hint::spin_loop();
        }
        // SAFETY: the turn check above proves no other thread owns this slot
        // for this generation; the ticket from fetch_add is unique.
        unsafe {
            (*slot.storage.get()).write(value);
        }
        slot.turn.store(write_turn + 1, Ordering::Release);
    }

    /// Attempts to push without blocking.
    ///
    /// Returns the value back when the queue is genuinely full, detected by
    /// observing the head ticket unchanged across a failed slot check.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let slot = &self.slots[self.index(head)];
            let write_turn = self.generation(head) * 2;
            if slot.turn.load(Ordering::Acquire) == write_turn {
                match self.head.compare_exchange(
                    head,
                    head + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: we won the CAS, so the ticket (and its
                        // writable slot) is exclusively ours.
                        unsafe {
                            (*slot.storage.get()).write(value);
                        }
                        slot.turn.store(write_turn + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => head = current,
                }
            } else {
                let prev = head;
                head = self.head.load(Ordering::Acquire);
                if head == prev {
                    // Nobody advanced the head behind our back; the slot is
                    // stuck in a non-writable phase, so the queue is full.
                    return Err(value);
                }
            }
        }
    }

    /// Pops a value, spinning until one becomes readable.
    pub fn pop(&self) -> T {
        let tail = self.tail.fetch_add(1, Ordering::Relaxed);
        let slot = &self.slots[self.index(tail)];
        let read_turn = self.generation(tail) * 2 + 1;
        while slot.turn.load(Ordering::Acquire) != read_turn {
            std::hint::spin_loop();
        }
        // SAFETY: the turn marker says this slot holds an initialized value
        // written for exactly this ticket.
        let value = unsafe { (*slot.storage.get()).assume_init_read() };
        slot.turn.store(read_turn + 1, Ordering::Release);
        value
    }

    /// Attempts to pop without blocking. Returns `None` when the queue is
    /// empty, detected symmetrically to [`BoundedQueue::try_push`].
    pub fn try_pop(&self) -> Option<T> {
        let mut tail = self.tail.load(Ordering::Acquire);
        loop {
            let slot = &self.slots[self.index(tail)];
            let read_turn = self.generation(tail) * 2 + 1;
            if slot.turn.load(Ordering::Acquire) == read_turn {
                match self.tail.compare_exchange(
                    tail,
                    tail + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: CAS win gives us exclusive read rights for
                        // this ticket's slot.
                        let value = unsafe { (*slot.storage.get()).assume_init_read() };
                        slot.turn.store(read_turn + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => tail = current,
                }
            } else {
                let prev = tail;
                tail = self.tail.load(Ordering::Acquire);
                if tail == prev {
                    return None;
                }
            }
        }
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        // An odd turn marks a written-but-unread slot; its element must be
        // dropped or shutdown with outstanding items leaks resources.
        for slot in self.slots.iter_mut() {
            if slot.turn.load(Ordering::Relaxed) & 1 == 1 {
                unsafe {
                    (*slot.storage.get()).assume_init_drop();
                }
            }
        }
    }
}
