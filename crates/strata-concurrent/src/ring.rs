use core::mem::MaybeUninit;

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::sync::{AtomicUsize, Ordering, UnsafeCell};

/// Fixed-size slot storage shared by the SPSC and MPSC queues.
///
/// Cursors are free-running `usize` counters; a slot is addressed by
/// `cursor & mask`. The queues keep one slot free, so at most `mask` values
/// are live at once. Which slots hold initialized values is tracked by the
/// owning queue's cursors, never by the ring itself.
pub(crate) struct Ring<T> {
    mask: usize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

impl<T> Ring<T> {
    pub(crate) fn new(config: &QueueConfig) -> Result<Self> {
        config.validate()?;
        let len = config
            .ring_len()
            .ok_or(Error::InvalidCapacity(config.capacity))?;
        let slots = (0..len)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            mask: len - 1,
            slots,
        })
    }

    /// Number of slots, always a power of two.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Number of values the ring can hold at once.
    #[inline]
    pub(crate) fn usable(&self) -> usize {
        self.mask
    }

    /// True when a producer at `head` may not write because the consumer at
    /// `tail` has not freed the slot yet.
    #[inline]
    pub(crate) fn is_full(&self, head: usize, tail: usize) -> bool {
        head.wrapping_sub(tail) >= self.mask
    }

    /// # Safety
    ///
    /// The slot at `cursor` must be vacant and owned by the caller.
    #[inline]
    pub(crate) unsafe fn write(&self, cursor: usize, value: T) {
        self.slots[cursor & self.mask].with_mut(|slot| unsafe {
            (*slot).write(value);
        });
    }

    /// # Safety
    ///
    /// The slot at `cursor` must hold a published value owned by the caller.
    /// The slot is vacant afterwards.
    #[inline]
    pub(crate) unsafe fn read(&self, cursor: usize) -> T {
        self.slots[cursor & self.mask].with_mut(|slot| unsafe { (*slot).assume_init_read() })
    }

    /// Moves every value in `[tail, head)` into `f` in FIFO order and
    /// advances `tail` past them. Returns the number of values moved.
    ///
    /// Progress is committed even if `f` panics, so a value is never
    /// dropped twice.
    ///
    /// # Safety
    ///
    /// Only the consumer may call this, and every slot in `[tail, head)`
    /// must hold a published value.
    pub(crate) unsafe fn drain<F>(&self, tail: &AtomicUsize, head: usize, mut f: F) -> usize
    where
        F: FnMut(T),
    {
        let start = tail.load(Ordering::Relaxed);
        let mut commit = TailCommit {
            tail,
            cursor: start,
        };
        while commit.cursor != head {
            let value = unsafe { self.read(commit.cursor) };
            commit.cursor = commit.cursor.wrapping_add(1);
            f(value);
        }
        head.wrapping_sub(start)
    }
}

/// Publishes consumer progress back to producers when dropped.
struct TailCommit<'a> {
    tail: &'a AtomicUsize,
    cursor: usize,
}

impl Drop for TailCommit<'_> {
    fn drop(&mut self) {
        self.tail.store(self.cursor, Ordering::Release);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn sizes_to_power_of_two() {
        let ring: Ring<u8> = Ring::new(&QueueConfig::new(5)).unwrap();
        assert_eq!(ring.len(), 8);
        assert_eq!(ring.usable(), 7);

        let ring: Ring<u8> = Ring::new(&QueueConfig::new(1)).unwrap();
        assert_eq!(ring.len(), 2);
        assert!(Ring::<u8>::new(&QueueConfig::new(0)).is_err());
    }

    #[test]
    fn full_keeps_one_slot_free() {
        let ring: Ring<u8> = Ring::new(&QueueConfig::new(3)).unwrap();
        assert!(!ring.is_full(2, 0));
        assert!(ring.is_full(3, 0));
        assert!(!ring.is_full(usize::MAX.wrapping_add(2), usize::MAX));
        assert!(ring.is_full(usize::MAX.wrapping_add(3), usize::MAX));
    }

    #[test]
    fn drain_wraps_around_the_end() {
        let ring: Ring<u32> = Ring::new(&QueueConfig::new(3)).unwrap();
        let tail = AtomicUsize::new(2);
        for cursor in 2..5 {
            unsafe { ring.write(cursor, cursor as u32) };
        }
        let mut seen = Vec::new();
        let count = unsafe { ring.drain(&tail, 5, |v| seen.push(v)) };
        assert_eq!(count, 3);
        assert_eq!(seen, vec![2, 3, 4]);
        assert_eq!(tail.load(Ordering::Relaxed), 5);
    }
}
