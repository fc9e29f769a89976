use std::sync::Arc;

use crossbeam_utils::CachePadded;
use tracing::debug;

use crate::config::{OverflowPolicy, QueueConfig};
use crate::error::{PushError, Result};
use crate::ring::Ring;
use crate::sync::{AtomicUsize, Backoff, Ordering};

/// Wait-free SPSC bounded ring buffer queue.
///
/// - One dedicated producer, one dedicated consumer, enforced by the
///   non-cloneable [`SpscProducer`] / [`SpscConsumer`] handles
/// - `head` is written only by the producer, `tail` only by the consumer;
///   each is read by the other side through an Acquire/Release pair
/// - The ring holds `next_power_of_two(capacity + 1)` slots
pub struct SpscQueue<T> {
    ring: Ring<T>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    overflow: OverflowPolicy,
}

// Safety: producer and consumer operate on disjoint slot ranges; T must be Send
unsafe impl<T: Send> Send for SpscQueue<T> {}
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    /// Create a queue holding at least `capacity` values with the default
    /// (checked) overflow policy.
    pub fn new(capacity: usize) -> Result<(SpscProducer<T>, SpscConsumer<T>)> {
        Self::with_config(QueueConfig::new(capacity))
    }

    pub fn with_config(config: QueueConfig) -> Result<(SpscProducer<T>, SpscConsumer<T>)> {
        let ring = Ring::new(&config)?;
        debug!(
            capacity = config.capacity,
            slots = ring.len(),
            overflow = ?config.overflow,
            "created spsc queue"
        );
        let queue = Arc::new(SpscQueue {
            ring,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            overflow: config.overflow,
        });
        Ok((
            SpscProducer {
                queue: queue.clone(),
                head: 0,
            },
            SpscConsumer { queue },
        ))
    }

    /// Number of values the queue can hold at once.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.ring.usable()
    }

    /// Number of ring slots (a power of two).
    #[inline]
    pub(crate) fn slots(&self) -> usize {
        self.ring.len()
    }

    /// Approximate number of queued values.
    pub(crate) fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        // Both handles are gone; drop whatever the consumer never took.
        let head = self.head.load(Ordering::Acquire);
        let dropped = unsafe { self.ring.drain(&self.tail, head, drop) };
        if dropped > 0 {
            debug!(dropped, "drained spsc queue on drop");
        }
    }
}

/// Producer side of the SPSC queue.
pub struct SpscProducer<T> {
    queue: Arc<SpscQueue<T>>,
    head: usize,
}

/// Consumer side of the SPSC queue.
pub struct SpscConsumer<T> {
    queue: Arc<SpscQueue<T>>,
}

impl<T> SpscProducer<T> {
    /// Push a value.
    ///
    /// When the queue is full the configured [`OverflowPolicy`] applies:
    /// `Checked` returns the value inside a [`PushError`], `Spin` waits for
    /// the consumer.
    pub fn push(&mut self, value: T) -> std::result::Result<(), PushError<T>> {
        if self.is_full() {
            match self.queue.overflow {
                OverflowPolicy::Checked => {
                    debug!(capacity = self.queue.capacity(), "spsc producer overflowed");
                    return Err(PushError::new(value, self.queue.capacity()));
                }
                OverflowPolicy::Spin => {
                    let backoff = Backoff::new();
                    while self.is_full() {
                        backoff.snooze();
                    }
                }
            }
        }
        // Safety: a free slot was observed above and only this producer fills it.
        unsafe { self.push_unchecked(value) };
        Ok(())
    }

    /// Push without checking for a free slot.
    ///
    /// # Safety
    ///
    /// The queue must not be full. Overflowing overwrites a value the
    /// consumer has not taken yet.
    #[inline]
    pub unsafe fn push_unchecked(&mut self, value: T) {
        let queue = &*self.queue;
        unsafe { queue.ring.write(self.head, value) };
        self.head = self.head.wrapping_add(1);
        queue.head.store(self.head, Ordering::Release);
    }

    /// Returns true if the queue appears full.
    #[inline]
    pub fn is_full(&self) -> bool {
        let tail = self.queue.tail.load(Ordering::Acquire);
        self.queue.ring.is_full(self.head, tail)
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Number of ring slots (a power of two).
    pub fn slots(&self) -> usize {
        self.queue.slots()
    }
}

impl<T> SpscConsumer<T> {
    /// Move every value published so far into `f`, in FIFO order, and
    /// return how many were consumed. Never blocks.
    pub fn consume_all<F>(&mut self, f: F) -> usize
    where
        F: FnMut(T),
    {
        let queue = &*self.queue;
        let head = queue.head.load(Ordering::Acquire);
        // Safety: single consumer; [tail, head) was published by the producer.
        unsafe { queue.ring.drain(&queue.tail, head, f) }
    }

    /// Take the oldest value, if any.
    pub fn try_pop(&mut self) -> Option<T> {
        let queue = &*self.queue;
        let tail = queue.tail.load(Ordering::Relaxed);
        let head = queue.head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let value = unsafe { queue.ring.read(tail) };
        queue.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
