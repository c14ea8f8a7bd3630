//! Bounded wait-free SPSC queue over heap memory.
//!
//! Used for the two conductor ↔ driver rings: commands flowing to the driver
//! and decoded responses flowing back.
//!
//! # Example
//!
//! ```
//! use baton::sync::spsc;
//!
//! let (tx, rx) = spsc::channel::<String>(16);
//!
//! tx.push("hello".to_string()).unwrap();
//! assert_eq!(rx.pop(), Some("hello".to_string()));
//! ```

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Producer-side state: head index and cached tail.
#[repr(align(64))]
struct ProducerState {
    head: AtomicUsize,
    cached_tail: UnsafeCell<usize>,
}

/// Consumer-side state: tail index and cached head.
#[repr(align(64))]
struct ConsumerState {
    tail: AtomicUsize,
    cached_head: UnsafeCell<usize>,
}

struct Ring<T> {
    producer: ProducerState,
    consumer: ConsumerState,
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: each slot is owned by either the producer or the consumer as decided
// by head/tail, which are published with Release/Acquire. The cached indices
// are only touched by their own side.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            producer: ProducerState {
                head: AtomicUsize::new(0),
                cached_tail: UnsafeCell::new(0),
            },
            consumer: ConsumerState {
                tail: AtomicUsize::new(0),
                cached_head: UnsafeCell::new(0),
            },
            buffer: (0..capacity)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
        }
    }

    /// # Safety
    ///
    /// Single producer.
    unsafe fn push(&self, item: T) -> Result<(), T> {
        let cap = self.buffer.len();
        let head = self.producer.head.load(Ordering::Relaxed);
        // SAFETY: cached_tail belongs to the producer.
        let cached_tail = unsafe { &mut *self.producer.cached_tail.get() };

        if head.wrapping_sub(*cached_tail) >= cap {
            *cached_tail = self.consumer.tail.load(Ordering::Acquire);
            if head.wrapping_sub(*cached_tail) >= cap {
                return Err(item);
            }
        }

        // SAFETY: head - tail < cap, so the consumer is not reading this slot.
        unsafe { (*self.buffer[head % cap].get()).write(item) };
        self.producer
            .head
            .store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// # Safety
    ///
    /// Single consumer.
    unsafe fn pop(&self) -> Option<T> {
        let cap = self.buffer.len();
        let tail = self.consumer.tail.load(Ordering::Relaxed);
        // SAFETY: cached_head belongs to the consumer.
        let cached_head = unsafe { &mut *self.consumer.cached_head.get() };

        if *cached_head == tail {
            *cached_head = self.producer.head.load(Ordering::Acquire);
            if *cached_head == tail {
                return None;
            }
        }

        // SAFETY: head != tail and the producer published this slot with Release.
        let item = unsafe { (*self.buffer[tail % cap].get()).assume_init_read() };
        self.consumer
            .tail
            .store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // SAFETY: &mut self, both ends are gone.
        while unsafe { self.pop() }.is_some() {}
    }
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the SPSC queue.
///
/// `Send` but not `Sync` and not `Clone`: exactly one producer.
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
    _unsync: PhantomUnsync,
}

/// Read end of the SPSC queue. Same threading rules as [`Producer`].
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
    _unsync: PhantomUnsync,
}

/// Creates an SPSC queue holding at most `capacity` items.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn channel<T: Send>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity > 0, "queue capacity must be greater than 0");
    let ring = Arc::new(Ring::with_capacity(capacity));
    (
        Producer {
            ring: Arc::clone(&ring),
            _unsync: PhantomData,
        },
        Consumer {
            ring,
            _unsync: PhantomData,
        },
    )
}

impl<T: Send> Producer<T> {
    /// Attempts to push an item (wait-free).
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full, allowing retry.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        // SAFETY: Producer is unique and !Sync.
        unsafe { self.ring.push(item) }
    }
}

impl<T: Send> Consumer<T> {
    /// Attempts to pop an item (wait-free).
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: Consumer is unique and !Sync.
        unsafe { self.ring.pop() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_full() {
        let (producer, consumer) = channel::<u64>(4);

        for i in 0..4 {
            assert!(producer.push(i).is_ok(), "Failed to push item {i}");
        }
        assert_eq!(producer.push(999), Err(999));

        assert_eq!(consumer.pop(), Some(0));
        assert!(producer.push(4).is_ok());
        assert_eq!(producer.push(1000), Err(1000));
    }

    #[test]
    fn test_wrapping_behavior() {
        let (producer, consumer) = channel::<u64>(3);

        for round in 0..5 {
            for i in 0..3 {
                producer.push(round * 10 + i).unwrap();
            }
            for i in 0..3 {
                assert_eq!(consumer.pop(), Some(round * 10 + i));
            }
            assert_eq!(consumer.pop(), None);
        }
    }

    #[test]
    fn test_concurrent_push_pop() {
        let (producer, consumer) = channel::<u64>(64);
        let count = 1000u64;

        let producer_handle = std::thread::spawn(move || {
            for i in 0..count {
                while producer.push(i).is_err() {
                    std::hint::spin_loop();
                }
            }
        });

        let mut received = Vec::with_capacity(count as usize);
        while received.len() < count as usize {
            if let Some(item) = consumer.pop() {
                received.push(item);
            } else {
                std::hint::spin_loop();
            }
        }
        producer_handle.join().unwrap();

        for (i, &val) in received.iter().enumerate() {
            assert_eq!(val, i as u64);
        }
    }
}
