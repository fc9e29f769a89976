use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::sync::{AtomicBool, Ordering};
use crate::version::{VersionChain, VersionRef};

/// A single RCU-style versioned value.
///
/// Writers publish new immutable versions with [`modify`]; every [`Handle`]
/// keeps reading the version it was last bound to until it is moved forward
/// with [`update`] or [`modify`]. Superseded versions stay allocated until a
/// [`clear`] finds them unreferenced.
///
/// [`modify`]: TransactionalCell::modify
/// [`update`]: TransactionalCell::update
/// [`clear`]: TransactionalCell::clear
pub struct TransactionalCell<T> {
    chain: VersionChain<T>,
    clearing: AtomicBool,
}

impl<T> Default for TransactionalCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TransactionalCell<T> {
    /// An empty cell.
    pub fn new() -> Self {
        Self {
            chain: VersionChain::new(),
            clearing: AtomicBool::new(false),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Publish the first version and return a handle to it.
    ///
    /// Fails with [`Error::AlreadyCreated`] if the cell already holds a value.
    pub fn create(&self, value: T) -> Result<Handle<'_, T>> {
        match self.chain.install(value) {
            Ok(version) => Ok(Handle::new(version)),
            Err(_) => {
                warn!("create called on a populated transactional cell");
                Err(Error::AlreadyCreated)
            }
        }
    }

    /// A handle on the newest version, `None` while the cell is empty.
    pub fn load(&self) -> Option<Handle<'_, T>> {
        self.chain.acquire().map(Handle::new)
    }

    /// Rebind `handle` to the newest version.
    pub fn update<'c>(&'c self, handle: &mut Handle<'c, T>) {
        if let Some(version) = self.chain.acquire() {
            handle.version = version;
        }
    }

    /// Publish a copy of the newest version with `f` applied and rebind
    /// `handle` to it.
    ///
    /// On contention the copy is rebuilt from the winning version and `f`
    /// runs again, so `f` must only depend on the value it is given.
    pub fn modify<'c, F>(&'c self, handle: &mut Handle<'c, T>, f: F)
    where
        T: Clone,
        F: FnMut(&mut T),
    {
        if let Some(version) = self.chain.publish(f) {
            handle.version = version;
        }
    }

    /// Drop every version no handle can reach any more and return how many
    /// were dropped.
    ///
    /// A version survives while a handle is bound to it or to anything
    /// older. Once no handle is left the cell is emptied entirely. Must not
    /// race with another `clear`; an overlapping call returns 0 without
    /// sweeping.
    ///
    /// Before freeing anything the sweep waits for readers that are inside
    /// [`load`], [`update`] or [`modify`] to take their reference. A reader
    /// descheduled at that point, or a steady stream of such readers, delays
    /// `clear` until they are through.
    ///
    /// [`load`]: TransactionalCell::load
    /// [`update`]: TransactionalCell::update
    /// [`modify`]: TransactionalCell::modify
    pub fn clear(&self) -> usize {
        if self
            .clearing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            warn!("overlapping clear on a transactional cell skipped");
            return 0;
        }
        let reclaimed = self.chain.sweep(true);
        self.clearing.store(false, Ordering::Release);
        debug!(reclaimed, "cleared transactional cell");
        reclaimed
    }
}

impl<T: fmt::Debug> fmt::Debug for TransactionalCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalCell")
            .field("current", &self.load())
            .finish()
    }
}

/// Read-only reference to one version of a [`TransactionalCell`].
pub struct Handle<'c, T> {
    version: VersionRef<T>,
    _cell: PhantomData<&'c TransactionalCell<T>>,
}

impl<'c, T> Handle<'c, T> {
    fn new(version: VersionRef<T>) -> Self {
        Self {
            version,
            _cell: PhantomData,
        }
    }

    /// True if both handles are bound to the same version.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.version.ptr_eq(&other.version)
    }

    /// Number of handles bound to this version.
    pub fn ref_count(&self) -> usize {
        self.version.ref_count()
    }
}

impl<T> Clone for Handle<'_, T> {
    fn clone(&self) -> Self {
        Self::new(self.version.clone())
    }
}

impl<T> Deref for Handle<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.version.get()
    }
}

impl<T: fmt::Debug> fmt::Debug for Handle<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&**self).finish()
    }
}
