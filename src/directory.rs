//! Named roots: the durable name-to-object directory.
//!
//! An object is only findable after a restart if it sits under a name
//! here (or is reachable from one that does). The directory keeps an
//! in-memory mirror for lookups and persists every mutation by writing a
//! fresh entry table and swapping the root object's table pointer to it
//! inside the mutating transaction, so a crash observes either the old
//! table or the new one, never a torn mix.
//!
//! ```text
//! table: [ count u32 | entry | entry | ... ]
//! entry: [ name_len u32 | name bytes | addr u64 ]
//! ```
//!
//! Directory entries count as references: binding a name retains the
//! object, rebinding or removing the name releases the previous one.

use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::object;
use crate::region::{Address, MemoryRegion};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

const COUNT_OFFSET: u64 = 0;
const ENTRIES_OFFSET: u64 = 4;

/// In-memory mirror of the persistent name table.
pub(crate) struct ObjectDirectory {
    entries: Mutex<FxHashMap<String, Address>>,
    /// Serializes bind/unbind end to end. The `entries` mutex is only
    /// held for mirror reads and writes, never across a transaction, so
    /// the collector can snapshot the mirror while a binder waits on the
    /// collection gate.
    write_lock: Mutex<()>,
}

impl ObjectDirectory {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// Rebuild the mirror from the persisted table at `table`.
    pub(crate) fn load(&self, heap: &Heap, table: Address) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.clear();
        if table.is_null() {
            return Ok(());
        }

        let region = heap.region_from_address(table)?;
        let count = region.read_u32(COUNT_OFFSET)?;
        let mut cursor = ENTRIES_OFFSET;
        for _ in 0..count {
            let name_len = region.read_u32(cursor)? as u64;
            let mut name = vec![0u8; name_len as usize];
            region.read_bytes(cursor + 4, &mut name)?;
            let name = String::from_utf8(name)
                .map_err(|_| Error::Corrupt("directory entry name is not UTF-8".into()))?;
            let addr = Address::from_raw(region.read_u64(cursor + 4 + name_len)?);
            entries.insert(name, addr);
            cursor += 4 + name_len + 8;
        }
        Ok(())
    }

    /// Address bound to `name`, if any.
    pub(crate) fn lookup(&self, name: &str) -> Option<Address> {
        self.entries.lock().get(name).copied()
    }

    /// All bound addresses (collection roots).
    pub(crate) fn addresses(&self) -> Vec<Address> {
        self.entries.lock().values().copied().collect()
    }

    /// All bound names, unordered.
    pub(crate) fn names(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Bind `name` to the object at `addr`, retaining it and releasing
    /// whatever the name previously held.
    pub(crate) fn bind(&self, heap: &Arc<Heap>, name: &str, addr: Address) -> Result<()> {
        let _write = self.write_lock.lock();
        let (previous, snapshot) = {
            let mut entries = self.entries.lock();
            let previous = entries.get(name).copied();
            if previous == Some(addr) {
                return Ok(());
            }
            entries.insert(name.to_owned(), addr);
            (previous, entries.clone())
        };

        let old_table = heap.directory_table()?;
        let result = heap.run_in_transaction(|| {
            object::inc_ref(heap, addr)?;
            if let Some(previous) = previous {
                object::dec_ref(heap, previous)?;
            }
            self.persist(heap, &snapshot)
        });
        if result.is_err() {
            // The persistent side rolled back; put the mirror back too.
            let mut entries = self.entries.lock();
            match previous {
                Some(previous) => entries.insert(name.to_owned(), previous),
                None => entries.remove(name),
            };
            return result;
        }
        heap.free_table(old_table)
    }

    /// Unbind `name`, releasing the object it held. Returns whether the
    /// name was bound.
    pub(crate) fn unbind(&self, heap: &Arc<Heap>, name: &str) -> Result<bool> {
        let _write = self.write_lock.lock();
        let (previous, snapshot) = {
            let mut entries = self.entries.lock();
            let Some(previous) = entries.remove(name) else {
                return Ok(false);
            };
            (previous, entries.clone())
        };

        let old_table = heap.directory_table()?;
        let result = heap.run_in_transaction(|| {
            object::dec_ref(heap, previous)?;
            self.persist(heap, &snapshot)
        });
        if result.is_err() {
            self.entries.lock().insert(name.to_owned(), previous);
            return result.map(|_| false);
        }
        heap.free_table(old_table)?;
        Ok(true)
    }

    /// Write `entries` as a fresh table and swap the root pointer to it.
    /// The old table block is freed by the caller after the transaction
    /// commits.
    fn persist(&self, heap: &Arc<Heap>, entries: &FxHashMap<String, Address>) -> Result<()> {
        if entries.is_empty() {
            heap.set_directory_table(Address::NULL)?;
            return Ok(());
        }

        let mut size = ENTRIES_OFFSET;
        for name in entries.keys() {
            size += 4 + name.len() as u64 + 8;
        }

        let region = heap.allocate(size)?;
        region.write_u32(COUNT_OFFSET, entries.len() as u32)?;
        let mut cursor = ENTRIES_OFFSET;
        for (name, addr) in entries {
            region.write_u32(cursor, name.len() as u32)?;
            region.write_bytes(cursor + 4, name.as_bytes())?;
            region.write_u64(cursor + 4 + name.len() as u64, addr.raw())?;
            cursor += 4 + name.len() as u64 + 8;
        }
        heap.set_directory_table(region.address())
    }
}

/// Decode a persisted address table (shared by the directory and the
/// collector's candidate set).
pub(crate) fn read_address_table(region: &MemoryRegion) -> Result<Vec<Address>> {
    let count = region.read_u32(COUNT_OFFSET)? as u64;
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count {
        out.push(Address::from_raw(region.read_u64(ENTRIES_OFFSET + i * 8)?));
    }
    Ok(out)
}

/// Encode `addrs` into a freshly allocated table block.
pub(crate) fn write_address_table(heap: &Heap, addrs: &[Address]) -> Result<Address> {
    let region = heap.allocate(ENTRIES_OFFSET + addrs.len() as u64 * 8)?;
    region.write_u32(COUNT_OFFSET, addrs.len() as u32)?;
    for (i, addr) in addrs.iter().enumerate() {
        region.write_u64(ENTRIES_OFFSET + i as u64 * 8, addr.raw())?;
    }
    Ok(region.address())
}
