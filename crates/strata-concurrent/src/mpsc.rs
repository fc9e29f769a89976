use std::sync::Arc;

use crossbeam_utils::CachePadded;
use tracing::debug;

use crate::config::{OverflowPolicy, QueueConfig};
use crate::error::{PushError, Result};
use crate::ring::Ring;
use crate::sync::{AtomicUsize, Backoff, Ordering};

/// Lock-free bounded MPSC ring buffer queue.
///
/// Producers reserve a slot from `reserve`, write into it, then publish by
/// advancing the shared `head` from their position to the next one. `head`
/// therefore moves in reservation order: a producer that reserved early but
/// writes slowly holds back everyone behind it. Lock-free, not wait-free.
pub struct MpscQueue<T> {
    ring: Ring<T>,
    reserve: CachePadded<AtomicUsize>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    overflow: OverflowPolicy,
}

unsafe impl<T: Send> Send for MpscQueue<T> {}
unsafe impl<T: Send> Sync for MpscQueue<T> {}

impl<T> MpscQueue<T> {
    pub fn new(capacity: usize) -> Result<(MpscProducer<T>, MpscConsumer<T>)> {
        Self::with_config(QueueConfig::new(capacity))
    }

    pub fn with_config(config: QueueConfig) -> Result<(MpscProducer<T>, MpscConsumer<T>)> {
        let ring = Ring::new(&config)?;
        debug!(
            capacity = config.capacity,
            slots = ring.len(),
            overflow = ?config.overflow,
            "created mpsc queue"
        );
        let queue = Arc::new(MpscQueue {
            ring,
            reserve: CachePadded::new(AtomicUsize::new(0)),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            overflow: config.overflow,
        });
        Ok((
            MpscProducer {
                queue: queue.clone(),
            },
            MpscConsumer { queue },
        ))
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.ring.usable()
    }

    #[inline]
    pub(crate) fn slots(&self) -> usize {
        self.ring.len()
    }

    /// Approximate number of published, unconsumed values.
    pub(crate) fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve a position only if its slot is already free.
    fn reserve_checked(&self) -> Option<usize> {
        let mut pos = self.reserve.load(Ordering::Relaxed);
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if (pos.wrapping_sub(tail) as isize) < 0 {
                // stale reservation cursor; the consumer is already past it
                pos = self.reserve.load(Ordering::Relaxed);
                continue;
            }
            if self.ring.is_full(pos, tail) {
                return None;
            }
            match self.reserve.compare_exchange_weak(
                pos,
                pos.wrapping_add(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(pos),
                Err(actual) => pos = actual,
            }
        }
    }

    /// Reserve unconditionally, then wait for the consumer to free the slot.
    fn reserve_spinning(&self) -> usize {
        let pos = self.reserve.fetch_add(1, Ordering::Relaxed);
        let backoff = Backoff::new();
        while self.ring.is_full(pos, self.tail.load(Ordering::Acquire)) {
            backoff.snooze();
        }
        pos
    }

    /// Write into a reserved slot and publish it once every earlier
    /// reservation has been published.
    fn publish(&self, pos: usize, value: T) {
        // Safety: `pos` was reserved by this producer alone and its slot is free.
        unsafe { self.ring.write(pos, value) };
        let next = pos.wrapping_add(1);
        let backoff = Backoff::new();
        while self
            .head
            .compare_exchange_weak(pos, next, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
    }
}

impl<T> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        // No producer is left, so every reservation has been published.
        let head = self.head.load(Ordering::Acquire);
        let dropped = unsafe { self.ring.drain(&self.tail, head, drop) };
        if dropped > 0 {
            debug!(dropped, "drained mpsc queue on drop");
        }
    }
}

/// Producer side of the MPSC queue. Clone it to add producers.
pub struct MpscProducer<T> {
    queue: Arc<MpscQueue<T>>,
}

impl<T> Clone for MpscProducer<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

/// Consumer side of the MPSC queue.
pub struct MpscConsumer<T> {
    queue: Arc<MpscQueue<T>>,
}

impl<T> MpscProducer<T> {
    /// Push a value from any producer thread.
    ///
    /// With [`OverflowPolicy::Checked`] a full ring rejects the push and the
    /// value comes back in the [`PushError`]. With [`OverflowPolicy::Spin`]
    /// the producer reserves a slot immediately and busy-waits until the
    /// consumer frees it.
    pub fn push(&self, value: T) -> std::result::Result<(), PushError<T>> {
        let queue = &*self.queue;
        let pos = match queue.overflow {
            OverflowPolicy::Checked => match queue.reserve_checked() {
                Some(pos) => pos,
                None => {
                    debug!(capacity = queue.capacity(), "mpsc producer overflowed");
                    return Err(PushError::new(value, queue.capacity()));
                }
            },
            OverflowPolicy::Spin => queue.reserve_spinning(),
        };
        queue.publish(pos, value);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn slots(&self) -> usize {
        self.queue.slots()
    }
}

impl<T> MpscConsumer<T> {
    /// Move every value published so far into `f`, in reservation order,
    /// and return how many were consumed. Never blocks.
    pub fn consume_all<F>(&mut self, f: F) -> usize
    where
        F: FnMut(T),
    {
        let queue = &*self.queue;
        let head = queue.head.load(Ordering::Acquire);
        // Safety: single consumer; [tail, head) is published.
        unsafe { queue.ring.drain(&queue.tail, head, f) }
    }

    /// Wait until a value is published, then move it into `f`.
    pub fn consume<F>(&mut self, f: F)
    where
        F: FnOnce(T),
    {
        let queue = &*self.queue;
        let tail = queue.tail.load(Ordering::Relaxed);
        let backoff = Backoff::new();
        while queue.head.load(Ordering::Acquire) == tail {
            backoff.snooze();
        }
        let value = unsafe { queue.ring.read(tail) };
        queue.tail.store(tail.wrapping_add(1), Ordering::Release);
        f(value);
    }

    /// Take the oldest published value, if any.
    pub fn try_pop(&mut self) -> Option<T> {
        let queue = &*self.queue;
        let tail = queue.tail.load(Ordering::Relaxed);
        if queue.head.load(Ordering::Acquire) == tail {
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
