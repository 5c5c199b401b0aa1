//! Crash-consistent transactions over an undo log.
//!
//! The heap reserves a fixed log area: `txn_log_slots` slots of
//! `txn_log_slot_size` bytes each, one slot per concurrently active
//! transaction. Before a field write mutates persistent state, the bytes
//! it will overwrite are appended to the active slot as an undo entry; the
//! in-place write then proceeds. Commit flushes the mutated data, marks
//! the slot `COMMITTED`, and retires it to `IDLE`. Rollback (explicit, or
//! recovery after a crash) replays the slot's entries newest first,
//! restoring every touched range to its pre-transaction bytes.
//!
//! ```text
//! slot:  [ state u32 | count u32 | entry | entry | ... ]
//! entry: [ target u64 | offset u64 | len u64 | old bytes ]
//! ```
//!
//! A crash can interrupt a transaction at any point:
//!
//! * slot `IDLE`      — nothing to do.
//! * slot `ACTIVE`    — the transaction never committed; undo entries
//!                      restore its effects.
//! * slot `COMMITTED` — the data was flushed before the mark was written,
//!                      so the transaction's effects are already complete;
//!                      the slot is simply retired.
//!
//! Transactions nest by flattening: an inner `run` joins the enclosing
//! transaction, and only the outermost commit or rollback touches the
//! slot. Isolation is per-region two-phase locking: the first logged
//! write to a region locks it for the transaction, and all locks release
//! at commit or rollback.

use crate::config::HeapConfig;
use crate::error::{Error, Result};
use crate::provider::RegionProvider;
use crate::region::{Address, MemoryRegion};
use crate::stats::HeapStats;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use std::cell::RefCell;
use std::sync::atomic::Ordering;
use std::sync::Arc;

const STATE_IDLE: u32 = 0;
const STATE_ACTIVE: u32 = 1;
const STATE_COMMITTED: u32 = 2;

const STATE_OFFSET: u64 = 0;
const COUNT_OFFSET: u64 = 4;
const PAYLOAD_OFFSET: u64 = 8;

/// Fixed bytes per undo entry before the saved data.
const ENTRY_HEADER: u64 = 24;

// =============================================================================
// Region lock table
// =============================================================================

/// Per-region two-phase locks.
///
/// A transaction locks each region on its first logged write and holds
/// every lock to commit or rollback, so concurrent transactions touching
/// the same region serialize rather than interleave.
struct LockTable {
    held: Mutex<FxHashSet<Address>>,
    released: Condvar,
}

impl LockTable {
    fn new() -> Self {
        Self {
            held: Mutex::new(FxHashSet::default()),
            released: Condvar::new(),
        }
    }

    fn lock(&self, addr: Address) {
        let mut held = self.held.lock();
        while held.contains(&addr) {
            self.released.wait(&mut held);
        }
        held.insert(addr);
    }

    fn unlock_all(&self, addrs: &FxHashSet<Address>) {
        let mut held = self.held.lock();
        for addr in addrs {
            held.remove(addr);
        }
        drop(held);
        self.released.notify_all();
    }
}

// =============================================================================
// Transaction manager
// =============================================================================

/// Owner of the persistent undo-log area and the region lock table.
pub(crate) struct TransactionManager {
    provider: Arc<dyn RegionProvider>,
    /// The whole log area, viewed as one region.
    log: MemoryRegion,
    slot_size: u64,
    /// Indices of slots not bound to any live transaction.
    free_slots: Mutex<Vec<u32>>,
    slot_freed: Condvar,
    locks: LockTable,
    stats: Arc<HeapStats>,
}

impl TransactionManager {
    /// Bind the manager to an already-allocated log area.
    pub(crate) fn new(
        provider: Arc<dyn RegionProvider>,
        log_addr: Address,
        config: &HeapConfig,
        stats: Arc<HeapStats>,
    ) -> Self {
        let log = MemoryRegion::persistent(log_addr, config.log_area_size(), Arc::clone(&provider));
        Self {
            provider,
            log,
            slot_size: config.txn_log_slot_size as u64,
            free_slots: Mutex::new((0..config.txn_log_slots).collect()),
            slot_freed: Condvar::new(),
            locks: LockTable::new(),
            stats,
        }
    }

    #[inline]
    fn slot_base(&self, slot: u32) -> u64 {
        slot as u64 * self.slot_size
    }

    /// Roll back or retire whatever the previous process left in the log.
    /// Runs once, during heap open, before any transaction starts.
    pub(crate) fn recover(&self) -> Result<()> {
        let slot_count = {
            let free = self.free_slots.lock();
            free.len() as u32
        };
        for slot in 0..slot_count {
            let base = self.slot_base(slot);
            match self.log.read_u32(base + STATE_OFFSET)? {
                STATE_IDLE => {}
                STATE_ACTIVE => {
                    log::info!("rolling back interrupted transaction in slot {}", slot);
                    self.undo_slot(slot)?;
                    self.retire_slot(slot)?;
                    self.stats.txn_recovered.fetch_add(1, Ordering::Relaxed);
                }
                STATE_COMMITTED => {
                    // Data was flushed before the mark; just retire.
                    self.retire_slot(slot)?;
                }
                other => {
                    return Err(Error::Corrupt(format!(
                        "transaction slot {} has unknown state {}",
                        slot, other
                    )));
                }
            }
        }
        Ok(())
    }

    fn acquire_slot(&self) -> u32 {
        let mut free = self.free_slots.lock();
        loop {
            if let Some(slot) = free.pop() {
                return slot;
            }
            self.slot_freed.wait(&mut free);
        }
    }

    fn release_slot(&self, slot: u32) {
        self.free_slots.lock().push(slot);
        self.slot_freed.notify_one();
    }

    fn activate_slot(&self, slot: u32) -> Result<()> {
        let base = self.slot_base(slot);
        self.log.write_u32(base + COUNT_OFFSET, 0)?;
        self.log.write_u32(base + STATE_OFFSET, STATE_ACTIVE)?;
        self.flush_slot_header(slot)
    }

    fn retire_slot(&self, slot: u32) -> Result<()> {
        let base = self.slot_base(slot);
        self.log.write_u32(base + STATE_OFFSET, STATE_IDLE)?;
        self.log.write_u32(base + COUNT_OFFSET, 0)?;
        self.flush_slot_header(slot)
    }

    fn flush_slot_header(&self, slot: u32) -> Result<()> {
        self.provider
            .flush_range(self.log.address(), self.slot_base(slot), PAYLOAD_OFFSET)
    }

    /// Append one undo entry recording the current bytes of
    /// `[offset, offset + len)` in `target`.
    fn append_entry(
        &self,
        slot: u32,
        cursor: u64,
        target: &MemoryRegion,
        offset: u64,
        len: u64,
    ) -> Result<u64> {
        let needed = ENTRY_HEADER + len;
        if cursor + needed > self.slot_size {
            return Err(Error::TransactionLogFull);
        }
        let base = self.slot_base(slot);
        let entry = base + cursor;

        let mut old = vec![0u8; len as usize];
        target.read_bytes(offset, &mut old)?;

        self.log.write_u64(entry, target.address().raw())?;
        self.log.write_u64(entry + 8, offset)?;
        self.log.write_u64(entry + 16, len)?;
        self.log.write_bytes(entry + ENTRY_HEADER, &old)?;
        self.provider
            .flush_range(self.log.address(), entry, needed)?;

        // The count bump makes the entry visible to recovery; it is
        // flushed after the entry bytes so a crash between the two just
        // drops an entry whose write never happened.
        let count = self.log.read_u32(base + COUNT_OFFSET)?;
        self.log.write_u32(base + COUNT_OFFSET, count + 1)?;
        self.flush_slot_header(slot)?;

        Ok(cursor + needed)
    }

    /// Restore every range this slot's entries recorded, newest first.
    fn undo_slot(&self, slot: u32) -> Result<()> {
        let base = self.slot_base(slot);
        let count = self.log.read_u32(base + COUNT_OFFSET)?;

        // Walk forward once to locate each entry, then apply in reverse.
        let mut entries = Vec::with_capacity(count as usize);
        let mut cursor = PAYLOAD_OFFSET;
        for _ in 0..count {
            let entry = base + cursor;
            let target = Address::from_raw(self.log.read_u64(entry)?);
            let offset = self.log.read_u64(entry + 8)?;
            let len = self.log.read_u64(entry + 16)?;
            entries.push((target, offset, len, entry + ENTRY_HEADER));
            cursor += ENTRY_HEADER + len;
            if cursor > self.slot_size {
                return Err(Error::Corrupt(format!(
                    "undo entry in slot {} overruns the slot",
                    slot
                )));
            }
        }

        for (target, offset, len, data) in entries.into_iter().rev() {
            let mut old = vec![0u8; len as usize];
            self.log.read_bytes(data, &mut old)?;
            self.provider.write(target, offset, &old)?;
            self.provider.flush_range(target, offset, len)?;
        }
        Ok(())
    }

    fn commit(&self, slot: u32, held: &FxHashSet<Address>) -> Result<()> {
        // Order matters: data reaches storage before the COMMITTED mark,
        // so a slot found COMMITTED needs no replay.
        self.provider.flush()?;
        let base = self.slot_base(slot);
        self.log.write_u32(base + STATE_OFFSET, STATE_COMMITTED)?;
        self.flush_slot_header(slot)?;
        self.retire_slot(slot)?;

        self.locks.unlock_all(held);
        self.release_slot(slot);
        self.stats.txn_commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rollback(&self, slot: u32, held: &FxHashSet<Address>) -> Result<()> {
        let result = self.undo_slot(slot).and_then(|_| self.retire_slot(slot));
        self.locks.unlock_all(held);
        self.release_slot(slot);
        self.stats.txn_rollbacks.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Release blocks whose frees were queued until the commit mark was
    /// durable.
    fn free_deferred(&self, addrs: &[Address]) -> Result<()> {
        for &addr in addrs {
            self.provider.free(addr)?;
            self.stats.record_free();
        }
        Ok(())
    }
}

// =============================================================================
// Thread-local active transaction
// =============================================================================

struct ActiveTxn {
    mgr: Arc<TransactionManager>,
    slot: u32,
    /// Flattened nesting depth; only depth 0 commits or rolls back.
    depth: u32,
    /// Next free byte within the slot payload.
    cursor: u64,
    /// Regions this transaction has locked.
    held: FxHashSet<Address>,
    /// Blocks to free once the commit mark is durable. A rollback undoes
    /// the reference decrements that emptied them, so the queue dies with
    /// the slot.
    deferred: Vec<Address>,
}

thread_local! {
    static CURRENT: RefCell<Option<ActiveTxn>> = const { RefCell::new(None) };
}

/// Record an impending write of `[offset, offset + len)` in `region` with
/// the calling thread's transaction.
///
/// Outside a transaction this is a no-op (the write is legal but not
/// crash-atomic); volatile scratch regions are never logged.
pub(crate) fn log_write(region: &MemoryRegion, offset: u64, len: u64) -> Result<()> {
    if region.is_volatile() || len == 0 {
        return Ok(());
    }
    CURRENT.with(|cur| {
        let mut cur = cur.borrow_mut();
        let Some(txn) = cur.as_mut() else {
            return Ok(());
        };
        if !txn.held.contains(&region.address()) {
            txn.mgr.locks.lock(region.address());
            txn.held.insert(region.address());
        }
        txn.cursor = txn
            .mgr
            .append_entry(txn.slot, txn.cursor, region, offset, len)?;
        Ok(())
    })
}

/// Whether the calling thread currently has a transaction open.
pub(crate) fn in_transaction() -> bool {
    CURRENT.with(|cur| cur.borrow().is_some())
}

/// Queue `addr` to be freed when the calling thread's transaction
/// commits. Returns `false` when no transaction is open; the caller then
/// frees immediately.
pub(crate) fn defer_free(addr: Address) -> bool {
    CURRENT.with(|cur| match cur.borrow_mut().as_mut() {
        Some(txn) => {
            txn.deferred.push(addr);
            true
        }
        None => false,
    })
}

/// Rolls the transaction back if the body unwinds before finishing.
struct UnwindGuard {
    armed: bool,
}

impl Drop for UnwindGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        CURRENT.with(|cur| {
            if let Some(txn) = cur.borrow_mut().take() {
                if let Err(err) = txn.mgr.rollback(txn.slot, &txn.held) {
                    log::error!("rollback during unwind failed: {}", err);
                }
            }
        });
    }
}

/// Run `body` inside a transaction on the calling thread.
///
/// If a transaction is already open, `body` joins it (flattened nesting).
/// Otherwise a log slot is claimed and the transaction commits when `body`
/// returns `Ok`, or rolls back when it returns `Err` or unwinds.
pub(crate) fn run<T>(
    mgr: &Arc<TransactionManager>,
    body: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let nested = CURRENT.with(|cur| {
        let mut cur = cur.borrow_mut();
        match cur.as_mut() {
            Some(txn) => {
                txn.depth += 1;
                true
            }
            None => false,
        }
    });

    if nested {
        let result = body();
        CURRENT.with(|cur| {
            if let Some(txn) = cur.borrow_mut().as_mut() {
                txn.depth -= 1;
            }
        });
        return result;
    }

    let slot = mgr.acquire_slot();
    if let Err(err) = mgr.activate_slot(slot) {
        mgr.release_slot(slot);
        return Err(err);
    }
    CURRENT.with(|cur| {
        *cur.borrow_mut() = Some(ActiveTxn {
            mgr: Arc::clone(mgr),
            slot,
            depth: 0,
            cursor: PAYLOAD_OFFSET,
            held: FxHashSet::default(),
            deferred: Vec::new(),
        });
    });

    let mut guard = UnwindGuard { armed: true };
    let result = body();
    guard.armed = false;

    let txn = CURRENT.with(|cur| cur.borrow_mut().take());
    let Some(txn) = txn else {
        return Err(Error::Corrupt(
            "active transaction vanished from its thread".into(),
        ));
    };

    match result {
        Ok(value) => {
            txn.mgr.commit(txn.slot, &txn.held)?;
            txn.mgr.free_deferred(&txn.deferred)?;
            Ok(value)
        }
        Err(err) => {
            txn.mgr.rollback(txn.slot, &txn.held)?;
            Err(err)
        }
    }
}
