use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;

use crossbeam_utils::CachePadded;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::sync::{AtomicBool, AtomicUsize, Ordering};
use crate::version::{VersionChain, VersionRef};

/// A fixed number of independent versioned slots addressed by id.
///
/// Every slot behaves like a [`TransactionalCell`](crate::TransactionalCell)
/// that is never emptied: ids are handed out in order by [`create`] and stay
/// valid for the lifetime of the map. [`clean`] reclaims superseded versions
/// of every slot in one pass.
///
/// [`create`]: TransactionalMap::create
/// [`clean`]: TransactionalMap::clean
pub struct TransactionalMap<T> {
    slots: Box<[VersionChain<T>]>,
    size: CachePadded<AtomicUsize>,
    cleaning: AtomicBool,
}

impl<T> TransactionalMap<T> {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 1 {
            return Err(Error::InvalidCapacity(capacity));
        }
        debug!(capacity, "created transactional map");
        Ok(Self {
            slots: (0..capacity).map(|_| VersionChain::new()).collect(),
            size: CachePadded::new(AtomicUsize::new(0)),
            cleaning: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of ids handed out so far.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire).min(self.capacity())
    }

    /// Store `value` under the next free id.
    pub fn create(&self, value: T) -> Result<MapHandle<'_, T>> {
        let id = self.size.fetch_add(1, Ordering::AcqRel);
        let Some(slot) = self.slots.get(id) else {
            self.size.fetch_sub(1, Ordering::AcqRel);
            warn!(capacity = self.capacity(), "transactional map is full");
            return Err(Error::Overflow {
                container: "transactional map",
                capacity: self.capacity(),
            });
        };
        match slot.install(value) {
            Ok(version) => Ok(MapHandle::new(id, version)),
            // ids are unique, so the slot cannot be populated yet
            Err(_) => Err(Error::AlreadyCreated),
        }
    }

    /// A handle on the newest version stored under `id`.
    pub fn get(&self, id: usize) -> Result<MapHandle<'_, T>> {
        self.slot(id)?
            .acquire()
            .map(|version| MapHandle::new(id, version))
            .ok_or(Error::UnknownId {
                id,
                size: self.size(),
            })
    }

    /// Rebind `handle` to the newest version of its slot.
    pub fn update<'m>(&'m self, handle: &mut MapHandle<'m, T>) -> Result<()> {
        if let Some(version) = self.slot(handle.id)?.acquire() {
            handle.version = version;
        }
        Ok(())
    }

    /// Publish a copy of the newest version of the handle's slot with `f`
    /// applied, and rebind `handle` to it. `f` may run more than once.
    pub fn modify<'m, F>(&'m self, handle: &mut MapHandle<'m, T>, f: F) -> Result<()>
    where
        T: Clone,
        F: FnMut(&mut T),
    {
        if let Some(version) = self.slot(handle.id)?.publish(f) {
            handle.version = version;
        }
        Ok(())
    }

    /// Reclaim unreferenced versions in every slot. The newest version of a
    /// slot is always kept.
    ///
    /// Returns `false` without doing anything if another `clean` is running.
    /// Otherwise the sweep runs to completion, but each slot first waits for
    /// readers inside [`get`], [`update`] or [`modify`] on that slot to take
    /// their reference, so a descheduled or continuously overlapping reader
    /// delays it.
    ///
    /// [`get`]: TransactionalMap::get
    /// [`update`]: TransactionalMap::update
    /// [`modify`]: TransactionalMap::modify
    pub fn clean(&self) -> bool {
        if self
            .cleaning
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        let size = self.size();
        let reclaimed: usize = self.slots[..size].iter().map(|slot| slot.sweep(false)).sum();
        self.cleaning.store(false, Ordering::Release);
        debug!(slots = size, reclaimed, "cleaned transactional map");
        true
    }

    fn slot(&self, id: usize) -> Result<&VersionChain<T>> {
        let size = self.size();
        if id >= size {
            warn!(id, size, "unknown transactional map id");
            return Err(Error::UnknownId { id, size });
        }
        Ok(&self.slots[id])
    }
}

impl<T> fmt::Debug for TransactionalMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalMap")
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Read-only reference to one version of one [`TransactionalMap`] slot.
pub struct MapHandle<'m, T> {
    id: usize,
    version: VersionRef<T>,
    _map: PhantomData<&'m TransactionalMap<T>>,
}

impl<T> MapHandle<'_, T> {
    fn new(id: usize, version: VersionRef<T>) -> Self {
        Self {
            id,
            version,
            _map: PhantomData,
        }
    }

    /// The slot this handle belongs to.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.version.ptr_eq(&other.version)
    }

    pub fn ref_count(&self) -> usize {
        self.version.ref_count()
    }
}

impl<T> Clone for MapHandle<'_, T> {
    fn clone(&self) -> Self {
        Self::new(self.id, self.version.clone())
    }
}

impl<T> Deref for MapHandle<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.version.get()
    }
}

impl<T: fmt::Debug> fmt::Debug for MapHandle<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapHandle")
            .field("id", &self.id)
            .field("value", &**self)
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[derive(Clone)]
    struct Tracked(Arc<std::sync::atomic::AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn rejects_zero_capacity() {
        assert_eq!(
            TransactionalMap::<u8>::new(0).err(),
            Some(Error::InvalidCapacity(0))
        );
    }

    #[test]
    fn overflow_keeps_size() {
        let map = TransactionalMap::new(3).unwrap();
        let handles: Vec<_> = (0..3).map(|i| map.create(i).unwrap()).collect();
        assert_eq!(
            handles.iter().map(MapHandle::id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(
            map.create(3).err(),
            Some(Error::Overflow {
                container: "transactional map",
                capacity: 3
            })
        );
        assert_eq!(map.size(), 3);
        assert_eq!(*map.get(2).unwrap(), 2);
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let map = TransactionalMap::new(4).unwrap();
        let _h = map.create("a").unwrap();
        assert_eq!(map.get(1).err(), Some(Error::UnknownId { id: 1, size: 1 }));
        assert_eq!(map.get(9).err(), Some(Error::UnknownId { id: 9, size: 1 }));
    }

    #[test]
    fn slots_are_independent() {
        let map = TransactionalMap::new(2).unwrap();
        let mut a = map.create(String::from("a")).unwrap();
        let b = map.create(String::from("b")).unwrap();
        map.modify(&mut a, |s| s.push('!')).unwrap();
        assert_eq!(&*a, "a!");
        assert_eq!(&*b, "b");
        assert_eq!(&*map.get(0).unwrap(), "a!");

        let mut stale = b.clone();
        let mut writer = b.clone();
        map.modify(&mut writer, |s| s.push('?')).unwrap();
        assert_eq!(&*stale, "b");
        map.update(&mut stale).unwrap();
        assert!(stale.ptr_eq(&writer));
    }

    #[test]
    fn clean_with_nothing_to_reclaim() {
        let drops = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let map = TransactionalMap::new(2).unwrap();
        let h = map.create(Tracked(drops.clone())).unwrap();
        assert!(map.clean());
        assert!(map.clean());
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(h);
        // the newest version of a slot is never reclaimed
        assert!(map.clean());
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert!(map.get(0).is_ok());
    }

    #[test]
    fn versions_accumulate_until_clean() {
        let drops = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let map = TransactionalMap::new(1).unwrap();
        let mut h = map.create(Tracked(drops.clone())).unwrap();
        for _ in 0..4 {
            map.modify(&mut h, |_| {}).unwrap();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert!(map.clean());
        assert_eq!(drops.load(Ordering::SeqCst), 4);
        drop(h);
        drop(map);
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn clean_while_cleaning_returns_false() {
        let map = TransactionalMap::new(1).unwrap();
        let mut h = map.create(0).unwrap();
        map.modify(&mut h, |v| *v += 1).unwrap();
        map.cleaning.store(true, Ordering::SeqCst);
        assert!(!map.clean());
        map.cleaning.store(false, Ordering::SeqCst);
        assert!(map.clean());
    }

    #[test]
    fn concurrent_writers_and_cleaners() {
        const WRITERS: usize = 4;
        const ROUNDS: u64 = 500;

        let map = TransactionalMap::new(WRITERS).unwrap();
        let handles: Vec<_> = (0..WRITERS).map(|_| map.create(0u64).unwrap()).collect();
        thread::scope(|s| {
            for mut h in handles {
                let map = &map;
                s.spawn(move || {
                    for _ in 0..ROUNDS {
                        map.modify(&mut h, |v| *v += 1).unwrap();
                    }
                    assert_eq!(*h, ROUNDS);
                });
            }
            for _ in 0..2 {
                s.spawn(|| {
                    for _ in 0..ROUNDS {
                        map.clean();
                    }
                });
            }
        });
        assert!(map.clean());
        for id in 0..WRITERS {
            let h = map.get(id).unwrap();
            assert_eq!(*h, ROUNDS);
            assert_eq!(h.ref_count(), 1);
        }
    }
}
