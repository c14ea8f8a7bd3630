//! Bounded wait-free MPSC queue over heap memory.
//!
//! Carries commands from any number of application threads to the single
//! conductor thread.
//!
//! # Algorithm
//!
//! Vyukov's bounded queue restricted to one consumer. Each slot carries a
//! sequence number:
//!
//! - initially the slot index,
//! - `pos + 1` once a producer has written position `pos`,
//! - `pos + capacity` once the consumer has released it.
//!
//! Producers reserve positions with a CAS on `head`; the consumer owns `tail`.
//!
//! With a single slot, "released for `pos`" (`pos + capacity`) and "written at
//! `pos`" (`pos + 1`) would be the same sequence number. The ring therefore
//! always has at least two slots, and a requested capacity of one is enforced
//! by comparing `head` against `tail` instead.
//!
//! # Example
//!
//! ```
//! use baton::sync::mpsc;
//!
//! let (tx, rx) = mpsc::channel::<u64>(4);
//! let tx2 = tx.clone();
//!
//! tx.push(1).unwrap();
//! tx2.push(2).unwrap();
//!
//! assert_eq!(rx.pop(), Some(1));
//! assert_eq!(rx.pop(), Some(2));
//! assert_eq!(rx.pop(), None);
//! ```

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(C)]
#[repr(align(64))] // one cache line per slot so producers don't false-share
struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

#[repr(align(64))]
struct CachePadded<T>(T);

const MIN_SLOTS: usize = 2;

struct Ring<T> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    buffer: Box<[Slot<T>]>,
    /// Items admitted at once. Can be less than `buffer.len()`.
    limit: usize,
}

// SAFETY: slot values are only touched by the party the sequence protocol
// hands them to; head/tail are atomics.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Self {
        let buffer = (0..capacity.max(MIN_SLOTS))
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
            buffer,
            limit: capacity,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.limit
    }

    fn push(&self, item: T) -> Result<(), T> {
        let cap = self.buffer.len();
        loop {
            let pos = self.head.0.load(Ordering::Relaxed);
            if self.limit < cap {
                let queued = pos.wrapping_sub(self.tail.0.load(Ordering::Acquire)) as isize;
                if queued < 0 {
                    // `pos` is stale: the consumer has already passed it.
                    continue;
                }
                if queued as usize >= self.limit {
                    return Err(item);
                }
            }
            let slot = &self.buffer[pos % cap];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                if self
                    .head
                    .0
                    .compare_exchange_weak(
                        pos,
                        pos.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // SAFETY: the CAS gave us exclusive ownership of position
                    // `pos`, and seq == pos means the consumer released the slot.
                    unsafe { (*slot.value.get()).write(item) };
                    slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                    return Ok(());
                }
            } else if diff < 0 {
                return Err(item);
            }
            // diff > 0: another producer claimed `pos`, reload head.
        }
    }

    /// # Safety
    ///
    /// Exactly one thread may pop at a time.
    unsafe fn pop(&self) -> Option<T> {
        let cap = self.buffer.len();
        let tail = self.tail.0.load(Ordering::Relaxed);
        let slot = &self.buffer[tail % cap];

        if slot.seq.load(Ordering::Acquire) != tail.wrapping_add(1) {
            return None;
        }

        // SAFETY: seq == tail + 1 means the producer finished writing.
        let item = unsafe { (*slot.value.get()).assume_init_read() };
        slot.seq.store(tail.wrapping_add(cap), Ordering::Release);
        self.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    fn len(&self) -> usize {
        let head = self.head.0.load(Ordering::Acquire);
        let tail = self.tail.0.load(Ordering::Acquire);
        head.wrapping_sub(tail).min(self.capacity())
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // SAFETY: &mut self, nobody else can pop.
        while unsafe { self.pop() }.is_some() {}
    }
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the queue.
///
/// Cheap to clone; every clone pushes into the same ring and clones may be
/// used from different threads concurrently.
pub struct Sender<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

/// Read end of the queue.
///
/// `Send` but not `Sync`: exactly one thread consumes.
pub struct Receiver<T> {
    ring: Arc<Ring<T>>,
    _unsync: PhantomUnsync,
}

/// Creates a bounded MPSC queue holding at most `capacity` items.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn channel<T: Send>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    assert!(capacity > 0, "queue capacity must be greater than 0");
    let ring = Arc::new(Ring::with_capacity(capacity));
    (
        Sender {
            ring: Arc::clone(&ring),
        },
        Receiver {
            ring,
            _unsync: PhantomData,
        },
    )
}

impl<T: Send> Sender<T> {
    /// Attempts to push an item (lock-free, never blocks).
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` when the queue is full.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        self.ring.push(item)
    }

    /// Maximum number of queued items.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Approximate number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send> Receiver<T> {
    /// Pops the oldest published item, or `None` if nothing is ready.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: Receiver is !Sync and not Clone, so pops never overlap.
        unsafe { self.ring.pop() }
    }

    /// Approximate number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
