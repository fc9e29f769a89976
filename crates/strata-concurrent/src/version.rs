//! Version chains: the RCU core shared by [`TransactionalCell`] and
//! [`TransactionalMap`].
//!
//! A chain is a newest-first singly linked list of immutable versions. Each
//! version carries a reference count with three states:
//!
//! - `n >= 0`: live, `n` references outstanding, new references allowed
//! - `-1`: claimed by a sweep, new references are refused
//!
//! Writers publish by CAS on `head`. Readers that go through `head` pin the
//! chain for the few instructions between loading `head` and taking their
//! reference; a sweep frees nothing while any reader is pinned.
//!
//! [`TransactionalCell`]: crate::TransactionalCell
//! [`TransactionalMap`]: crate::TransactionalMap

use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use tracing::trace;

use crate::sync::{AtomicIsize, AtomicPtr, AtomicUsize, Backoff, Ordering};

const CLAIMED: isize = -1;

pub(crate) struct Node<T> {
    value: T,
    refs: AtomicIsize,
    older: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    /// A detached node holding one reference for its creator.
    fn boxed(value: T, older: *mut Node<T>) -> Box<Node<T>> {
        Box::new(Node {
            value,
            refs: AtomicIsize::new(1),
            older: AtomicPtr::new(older),
        })
    }

    /// Add a reference unless a sweep has claimed the node.
    fn try_lock(&self) -> bool {
        let mut count = self.refs.load(Ordering::Acquire);
        loop {
            if count < 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
    }

    fn release(&self) {
        self.refs.fetch_sub(1, Ordering::Release);
    }

    /// Move an unreferenced node to the claimed state.
    fn try_claim(&self) -> bool {
        self.refs
            .compare_exchange(0, CLAIMED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

/// One counted reference to a version. Cloning adds a reference, dropping
/// releases it. A live `VersionRef` keeps its node from being claimed.
pub(crate) struct VersionRef<T> {
    node: NonNull<Node<T>>,
    _marker: PhantomData<Node<T>>,
}

// Safety: the value is only read through a shared reference, and the last
// reference may be released on any thread before a sweep drops the value
// there.
unsafe impl<T: Send + Sync> Send for VersionRef<T> {}
unsafe impl<T: Send + Sync> Sync for VersionRef<T> {}

impl<T> VersionRef<T> {
    /// # Safety
    ///
    /// `node` must be live and the caller must transfer one reference it
    /// already holds on it.
    unsafe fn adopt(node: NonNull<Node<T>>) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    fn node(&self) -> &Node<T> {
        // Safety: a held reference keeps the node out of every sweep.
        unsafe { self.node.as_ref() }
    }

    #[inline]
    pub(crate) fn get(&self) -> &T {
        &self.node().value
    }

    #[inline]
    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        self.node == other.node
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.node().refs.load(Ordering::Acquire).max(0) as usize
    }
}

impl<T> Clone for VersionRef<T> {
    fn clone(&self) -> Self {
        // Already referenced, so the count is positive and cannot be claimed.
        self.node().refs.fetch_add(1, Ordering::Relaxed);
        Self {
            node: self.node,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for VersionRef<T> {
    fn drop(&mut self) {
        self.node().release();
    }
}

/// Marks a reader as between loading `head` and owning a reference.
struct Pin<'a>(&'a AtomicUsize);

impl<'a> Pin<'a> {
    fn enter(pinned: &'a AtomicUsize) -> Self {
        pinned.fetch_add(1, Ordering::SeqCst);
        Pin(pinned)
    }
}

impl Drop for Pin<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct VersionChain<T> {
    head: AtomicPtr<Node<T>>,
    pinned: AtomicUsize,
    _marker: PhantomData<Box<Node<T>>>,
}

// Safety: versions are created on one thread, read from many and dropped by
// whichever thread sweeps them.
unsafe impl<T: Send + Sync> Send for VersionChain<T> {}
unsafe impl<T: Send + Sync> Sync for VersionChain<T> {}

impl<T> VersionChain<T> {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            pinned: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Publish the first version. Hands the value back if the chain already
    /// has one.
    pub(crate) fn install(&self, value: T) -> Result<VersionRef<T>, T> {
        let node = Box::into_raw(Node::boxed(value, ptr::null_mut()));
        match self.head.compare_exchange(
            ptr::null_mut(),
            node,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            // Safety: freshly allocated and carries the creator's reference.
            Ok(_) => Ok(unsafe { VersionRef::adopt(NonNull::new_unchecked(node)) }),
            Err(_) => {
                let node = unsafe { Box::from_raw(node) };
                Err(node.value)
            }
        }
    }

    /// Take a reference on the newest version, `None` if the chain is empty.
    pub(crate) fn acquire(&self) -> Option<VersionRef<T>> {
        let _pin = Pin::enter(&self.pinned);
        let backoff = Backoff::new();
        loop {
            let node = NonNull::new(self.head.load(Ordering::SeqCst))?;
            // Safety: pinned, so no sweep frees a node observed through head.
            if unsafe { node.as_ref() }.try_lock() {
                return Some(unsafe { VersionRef::adopt(node) });
            }
            // head was replaced and claimed, or is being torn down
            backoff.spin();
        }
    }

    /// Publish a copy of the newest version with `f` applied.
    ///
    /// Lost races rebuild the copy from the winner's version and re-run `f`,
    /// so `f` may be called several times.
    pub(crate) fn publish<F>(&self, mut f: F) -> Option<VersionRef<T>>
    where
        T: Clone,
        F: FnMut(&mut T),
    {
        let mut current = self.acquire()?;
        let mut spare: Option<Box<Node<T>>> = None;
        loop {
            let mut value = current.get().clone();
            f(&mut value);
            let node = match spare.take() {
                Some(mut node) => {
                    node.value = value;
                    node.older.store(current.node.as_ptr(), Ordering::Relaxed);
                    node
                }
                None => Node::boxed(value, current.node.as_ptr()),
            };
            let node = Box::into_raw(node);
            match self.head.compare_exchange(
                current.node.as_ptr(),
                node,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                // Safety: published with the creator's reference still held.
                Ok(_) => return Some(unsafe { VersionRef::adopt(NonNull::new_unchecked(node)) }),
                Err(_) => {
                    trace!("version publish lost a race, retrying");
                    spare = Some(unsafe { Box::from_raw(node) });
                    drop(current);
                    current = self.acquire()?;
                }
            }
        }
    }

    /// Reclaim every version nobody references, oldest first, stopping at
    /// the first survivor. The newest version is only reclaimed when
    /// `teardown` is set and no version of the chain is referenced; the
    /// chain is then empty again.
    ///
    /// Sweeps of one chain must not overlap. Blocks while a reader is pinned
    /// in [`acquire`](Self::acquire) if there is anything to free. Returns
    /// the number of versions dropped.
    pub(crate) fn sweep(&self, teardown: bool) -> usize {
        let Some(newest) = NonNull::new(self.head.load(Ordering::SeqCst)) else {
            return 0;
        };

        // Everything behind `newest` is unreachable for new readers and only
        // sweeps unlink it, so the walk is stable.
        let mut older = Vec::new();
        let mut cursor = unsafe { newest.as_ref() }.older.load(Ordering::Acquire);
        while let Some(node) = NonNull::new(cursor) {
            older.push(node);
            cursor = unsafe { node.as_ref() }.older.load(Ordering::Acquire);
        }

        let claimed = older
            .iter()
            .rev()
            .take_while(|&&node| unsafe { node.as_ref() }.try_claim())
            .count();
        let survivors = older.len() - claimed;
        let mut doomed = older.split_off(survivors);

        if claimed > 0 {
            let boundary = older.last().copied().unwrap_or(newest);
            unsafe { boundary.as_ref() }
                .older
                .store(ptr::null_mut(), Ordering::Release);
        }

        if teardown && survivors == 0 && unsafe { newest.as_ref() }.try_claim() {
            match self.head.compare_exchange(
                newest.as_ptr(),
                ptr::null_mut(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => doomed.push(newest),
                // a writer published on top of it; it stays as an old version
                Err(_) => unsafe { newest.as_ref() }.refs.store(0, Ordering::Release),
            }
        }

        if doomed.is_empty() {
            return 0;
        }
        self.quiesce();
        let reclaimed = doomed.len();
        for node in doomed {
            // Safety: claimed, unlinked, and no reader is mid-acquire.
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }
        reclaimed
    }

    /// Wait until no reader sits between loading `head` and locking a node.
    fn quiesce(&self) {
        let backoff = Backoff::new();
        while self.pinned.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }
    }
}

impl<T> Drop for VersionChain<T> {
    fn drop(&mut self) {
        let mut cursor = self.head.load(Ordering::Acquire);
        while let Some(node) = NonNull::new(cursor) {
            let node = unsafe { Box::from_raw(node.as_ptr()) };
            cursor = node.older.load(Ordering::Relaxed);
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;

    #[derive(Clone)]
    struct Tracked(Arc<StdAtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn install_once() {
        let chain = VersionChain::new();
        assert!(chain.is_empty());
        let first = chain.install(1).ok().unwrap();
        assert_eq!(*first.get(), 1);
        assert_eq!(chain.install(2).err(), Some(2));
    }

    #[test]
    fn publish_links_to_previous() {
        let chain = VersionChain::new();
        let first = chain.install(10).ok().unwrap();
        let second = chain.publish(|v| *v += 1).unwrap();
        assert_eq!(*first.get(), 10);
        assert_eq!(*second.get(), 11);
        assert_eq!(second.node().older.load(Ordering::Relaxed), first.node.as_ptr());
        assert!(chain.acquire().unwrap().ptr_eq(&second));
    }

    #[test]
    fn sweep_stops_at_referenced_version() {
        let drops = Arc::new(StdAtomicUsize::new(0));
        let chain = VersionChain::new();
        let v0 = chain.install(Tracked(drops.clone())).ok().unwrap();
        let v1 = chain.publish(|_| {}).unwrap();
        let v2 = chain.publish(|_| {}).unwrap();
        let _v3 = chain.publish(|_| {}).unwrap();
        // clones made inside `publish` are dropped with their nodes only
        let baseline = drops.load(Ordering::SeqCst);

        drop(v0);
        drop(v2);
        // v1 still referenced: v0 goes, v1 and everything newer stays
        assert_eq!(chain.sweep(false), 1);
        assert_eq!(drops.load(Ordering::SeqCst), baseline + 1);

        drop(v1);
        assert_eq!(chain.sweep(false), 2);
        assert_eq!(drops.load(Ordering::SeqCst), baseline + 3);
        assert_eq!(chain.sweep(false), 0);
    }

    #[test]
    fn teardown_empties_unreferenced_chain() {
        let chain = VersionChain::new();
        let v0 = chain.install(String::from("a")).ok().unwrap();
        let v1 = chain.publish(|s| s.push('b')).unwrap();
        assert_eq!(chain.sweep(true), 0);
        drop(v0);
        assert_eq!(chain.sweep(true), 1);
        assert_eq!(chain.acquire().unwrap().get(), "ab");
        drop(v1);
        assert_eq!(chain.sweep(true), 1);
        assert!(chain.is_empty());
        assert!(chain.install(String::from("c")).is_ok());
    }

    #[test]
    fn sweep_waits_for_pinned_reader() {
        use std::thread;
        use std::time::{Duration, Instant};

        let chain = VersionChain::new();
        let v0 = chain.install(0u32).ok().unwrap();
        let _v1 = chain.publish(|v| *v += 1).unwrap();
        drop(v0);

        let pin = Pin::enter(&chain.pinned);
        let started = Instant::now();
        thread::scope(|s| {
            s.spawn(move || {
                thread::sleep(Duration::from_millis(50));
                drop(pin);
            });
            assert_eq!(chain.sweep(false), 1);
        });
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(chain.pinned.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn claimed_node_refuses_references() {
        let chain = VersionChain::new();
        let v0 = chain.install(0u8).ok().unwrap();
        let node = v0.node;
        drop(v0);
        assert!(unsafe { node.as_ref() }.try_claim());
        assert!(!unsafe { node.as_ref() }.try_lock());
        unsafe { node.as_ref() }.refs.store(0, Ordering::Release);
        assert!(chain.acquire().is_some());
    }
}
