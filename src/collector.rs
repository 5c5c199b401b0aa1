//! Reference-cycle detection and reclamation.
//!
//! Reference counting reclaims acyclic garbage eagerly; cycles never reach
//! count zero on their own. Every decrement that lands on a nonzero count
//! records the object as a cycle candidate. [`CycleCollector::collect`]
//! then separates candidates into live and garbage by reachability: it
//! marks everything reachable from the roots (the heap's root object, the
//! named directory's entries, and every live in-memory handle), and any
//! candidate the marking never touched — together with whatever is
//! reachable only from such candidates — is cycle garbage and is freed.
//!
//! The candidate set survives restarts: the heap persists it at close and
//! reimports it at open, so candidates recorded before a crash are still
//! examined by the next process.

use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::object::{self, header};
use crate::region::Address;
use crate::stats::HeapStats;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Set of possible cycle roots, fed by the refcount write barrier.
pub(crate) struct CycleCollector {
    candidates: Mutex<FxHashSet<Address>>,
    stats: Arc<HeapStats>,
}

impl CycleCollector {
    pub(crate) fn new(stats: Arc<HeapStats>) -> Self {
        Self {
            candidates: Mutex::new(FxHashSet::default()),
            stats,
        }
    }

    /// Record `addr` as a possible member of a dead cycle.
    pub(crate) fn add_candidate(&self, addr: Address) {
        self.candidates.lock().insert(addr);
    }

    /// Clear `addr`'s candidacy (it gained a reference or was freed).
    pub(crate) fn remove_candidate(&self, addr: Address) {
        self.candidates.lock().remove(&addr);
    }

    /// Adopt candidates persisted by a previous process.
    pub(crate) fn import(&self, addrs: impl IntoIterator<Item = Address>) {
        self.candidates.lock().extend(addrs);
    }

    /// Snapshot the current candidate set for persistence.
    pub(crate) fn export(&self) -> Vec<Address> {
        self.candidates.lock().iter().copied().collect()
    }

    /// Run one collection. Returns the number of objects freed.
    ///
    /// The caller holds the heap's collection gate exclusively, so no
    /// counted-reference mutation runs between the marking pass and the
    /// frees. The frees themselves run inside a transaction so the
    /// refcount adjustments on surviving objects are crash-atomic with
    /// the collection.
    pub(crate) fn collect(&self, heap: &Arc<Heap>) -> Result<usize> {
        let candidates = {
            let set = self.candidates.lock();
            if set.is_empty() {
                return Ok(0);
            }
            set.clone()
        };

        let reachable = self.mark_reachable(heap)?;

        // Candidates the marking never touched seed the garbage set; the
        // closure picks up objects reachable only through dead candidates.
        let mut garbage = FxHashSet::default();
        let mut frontier: Vec<Address> = candidates
            .iter()
            .copied()
            .filter(|addr| !reachable.contains(addr))
            .collect();
        while let Some(addr) = frontier.pop() {
            if reachable.contains(&addr) || !garbage.insert(addr) {
                continue;
            }
            for child in self.refs_of(heap, addr)? {
                frontier.push(child);
            }
        }

        if garbage.is_empty() {
            return Ok(0);
        }

        let freed = garbage.len();
        heap.run_txn(|| {
            // Survivors referenced from inside the garbage lose those
            // references before the storage goes away.
            for &addr in &garbage {
                for child in self.refs_of(heap, addr)? {
                    if garbage.contains(&child) {
                        continue;
                    }
                    let region = heap.region_from_address(child)?;
                    let count = header::read_ref_count(&region)?.saturating_sub(1);
                    crate::txn::log_write(&region, header::REF_COUNT_OFFSET, 4)?;
                    region.write_u32(header::REF_COUNT_OFFSET, count)?;
                }
            }
            for &addr in &garbage {
                self.remove_candidate(addr);
                heap.cache().evict(addr);
                heap.free_address(addr)?;
            }
            Ok(())
        })?;

        self.stats
            .cycles_collected
            .fetch_add(freed as u64, Ordering::Relaxed);
        log::debug!("cycle collection freed {} objects", freed);
        Ok(freed)
    }

    /// Breadth-first marking from the heap's roots.
    fn mark_reachable(&self, heap: &Arc<Heap>) -> Result<FxHashSet<Address>> {
        let mut reachable = FxHashSet::default();
        let mut frontier = heap.root_addresses();

        while let Some(addr) = frontier.pop() {
            if addr.is_null() || !reachable.insert(addr) {
                continue;
            }
            for child in self.refs_of(heap, addr)? {
                frontier.push(child);
            }
        }
        Ok(reachable)
    }

    /// Outgoing references of the object at `addr`.
    fn refs_of(&self, heap: &Arc<Heap>, addr: Address) -> Result<object::RefList> {
        let region = heap.region_from_address(addr)?;
        let tag = header::read_tag(&region)?;
        let layout = heap
            .registry()
            .get(tag)
            .ok_or(Error::UnknownTypeTag(tag))?;
        object::outgoing_refs(&layout, &region)
    }
}
