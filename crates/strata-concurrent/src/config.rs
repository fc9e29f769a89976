use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What a producer does when the ring has no free slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the push and hand the value back.
    #[default]
    Checked,
    /// Busy-wait until the consumer frees a slot. The caller must size the
    /// queue for the worst-case number of in-flight values or risk livelock.
    Spin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Minimum number of values the queue must hold at once.
    pub capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            overflow: OverflowPolicy::Checked,
        }
    }
}

impl QueueConfig {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity < 1 || self.ring_len().is_none() {
            return Err(Error::InvalidCapacity(self.capacity));
        }
        Ok(())
    }

    /// Number of ring slots backing this configuration: one reserved slot
    /// plus the requested capacity, rounded up to a power of two.
    pub fn ring_len(&self) -> Option<usize> {
        self.capacity
            .checked_add(1)
            .and_then(usize::checked_next_power_of_two)
    }
}
