//! Bounded lock-free queues and RCU-style transactional containers
//!
//! - `spsc`: Wait-free single-producer single-consumer ring queue
//! - `mpsc`: Lock-free bounded multi-producer single-consumer ring queue
//! - `transactional`: Versioned cell with snapshot handles and explicit reclamation
//! - `transactional_map`: Fixed set of versioned slots addressed by id
//! - `config`: Queue sizing and overflow policy
//! - `error`: Crate error type

pub mod config;
pub mod error;
pub mod mpsc;
mod ring;
pub mod spsc;
mod sync;
pub mod transactional;
pub mod transactional_map;
mod version;

pub use config::{OverflowPolicy, QueueConfig};
pub use error::{Error, PushError, Result};
pub use mpsc::{MpscConsumer, MpscProducer, MpscQueue};
pub use spsc::{SpscConsumer, SpscProducer, SpscQueue};
pub use transactional::{Handle, TransactionalCell};
pub use transactional_map::{MapHandle, TransactionalMap};
