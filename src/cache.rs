//! Address-keyed cache of live object handles.
//!
//! One live [`PersistentObject`](crate::object::PersistentObject) per
//! address: every dereference of the same address on an open heap yields
//! the same `Arc`, so `Arc::ptr_eq` works as object identity. Entries are
//! weak and reclaim themselves when the last strong handle drops; the
//! dropped handle removes its entry on the way out.

use crate::object::PersistentObject;
use crate::region::Address;
use crate::stats::HeapStats;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

/// Weak handle table mapping addresses to live objects.
pub(crate) struct ObjectCache {
    entries: DashMap<Address, Weak<PersistentObject>>,
    stats: Arc<HeapStats>,
}

impl ObjectCache {
    pub(crate) fn new(stats: Arc<HeapStats>) -> Self {
        Self {
            entries: DashMap::new(),
            stats,
        }
    }

    /// Return the live handle for `addr`, or construct one with `make` and
    /// publish it. The entry lock spans the construction, so two threads
    /// racing on the same address get the same `Arc`.
    pub(crate) fn get_or_insert(
        &self,
        addr: Address,
        make: impl FnOnce() -> crate::error::Result<Arc<PersistentObject>>,
    ) -> crate::error::Result<Arc<PersistentObject>> {
        match self.entries.entry(addr) {
            Entry::Occupied(mut occupied) => {
                if let Some(live) = occupied.get().upgrade() {
                    self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(live);
                }
                // Stale weak entry whose drop has not removed it yet.
                self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
                let fresh = make()?;
                occupied.insert(Arc::downgrade(&fresh));
                Ok(fresh)
            }
            Entry::Vacant(vacant) => {
                self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
                let fresh = make()?;
                vacant.insert(Arc::downgrade(&fresh));
                Ok(fresh)
            }
        }
    }

    /// Publish a newly constructed object under its address.
    pub(crate) fn publish(&self, addr: Address, obj: &Arc<PersistentObject>) {
        self.entries.insert(addr, Arc::downgrade(obj));
    }

    /// Drop the entry for `addr` if its object is no longer live. Called
    /// by the object's `Drop`; a racing re-publish wins.
    pub(crate) fn forget(&self, addr: Address) {
        self.entries
            .remove_if(&addr, |_, weak| weak.strong_count() == 0);
    }

    /// Unconditionally drop the entry for `addr` (the storage was freed).
    pub(crate) fn evict(&self, addr: Address) {
        self.entries.remove(&addr);
    }

    /// Whether a live handle for `addr` exists right now.
    pub(crate) fn has_live(&self, addr: Address) -> bool {
        self.entries
            .get(&addr)
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Addresses with a live handle right now.
    pub(crate) fn live_addresses(&self) -> Vec<Address> {
        self.entries
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .map(|entry| *entry.key())
            .collect()
    }
}
