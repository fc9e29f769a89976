use std::fmt;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid capacity {0}: must be at least 1")]
    InvalidCapacity(usize),

    #[error("{container} overflowed its capacity of {capacity}")]
    Overflow {
        container: &'static str,
        capacity: usize,
    },

    #[error("transactional value already created")]
    AlreadyCreated,

    #[error("unknown slot id {id} (map size {size})")]
    UnknownId { id: usize, size: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A push rejected because the ring was full. Gives the value back.
pub struct PushError<T> {
    value: T,
    capacity: usize,
}

impl<T> PushError<T> {
    pub(crate) fn new(value: T, capacity: usize) -> Self {
        Self { value, capacity }
    }

    /// Recover the value that could not be enqueued.
    pub fn into_inner(self) -> T {
        self.value
    }

    /// Usable capacity of the queue that rejected the push.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushError")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue is full (capacity {})", self.capacity)
    }
}

impl<T> std::error::Error for PushError<T> {}

impl<T> From<PushError<T>> for Error {
    fn from(err: PushError<T>) -> Self {
        Error::Overflow {
            container: "queue",
            capacity: err.capacity,
        }
    }
}
