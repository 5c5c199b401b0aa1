//! The persistent heap: lifecycle, allocation, roots, and the seams
//! between the subsystems.
//!
//! A [`Heap`] owns one persistence region through a
//! [`RegionProvider`](crate::provider::RegionProvider) and wires the
//! subsystems together: the type registry, the transaction manager, the
//! object cache, the named-root directory, and the cycle collector. It is
//! the only component that touches the provider's metadata slot.
//!
//! # Persistent bootstrap chain
//!
//! ```text
//! provider meta slot ─▶ meta block ─▶ root block ─▶ directory table
//!                       [root u64]    (strata.root)  candidate table
//!                       [log  u64]
//! ```
//!
//! A fresh region has an empty meta slot; [`Heap::open`] then allocates
//! the transaction log, the meta block, and the root block, and records
//! the chain. Every later open follows the chain instead, recovers the
//! transaction log, reloads the directory mirror, and reimports the
//! persisted cycle candidates.

use crate::cache::ObjectCache;
use crate::collector::CycleCollector;
use crate::config::HeapConfig;
use crate::directory::{self, ObjectDirectory};
use crate::error::{Error, Result};
use crate::layout::{Layout, LayoutBuilder, LongField, Mutability, TypeRegistry};
use crate::object::{header, ObjectPointer, PersistentObject};
use crate::provider::RegionProvider;
use crate::region::{Address, MemoryRegion};
use crate::stats::{HeapStats, StatsSnapshot};
use crate::txn::{self, TransactionManager};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Reserved layout name of the internal root object.
const ROOT_LAYOUT_NAME: &str = "strata.root";

/// Meta block: two stored addresses.
const META_ROOT_OFFSET: u64 = 0;
const META_LOG_OFFSET: u64 = 8;
const META_SIZE: u64 = 16;

/// Subsystem handles that exist only while the heap is open.
struct OpenState {
    txn: Arc<TransactionManager>,
    /// The root block, a pinned `strata.root` object.
    root: Arc<MemoryRegion>,
}

/// A persistent object heap.
///
/// Create with [`Heap::new`], then [`Heap::open`] before any other
/// operation. All methods are safe to call from multiple threads; object
/// handles obtained from one heap stay valid until the heap closes.
pub struct Heap {
    provider: Arc<dyn RegionProvider>,
    config: HeapConfig,
    stats: Arc<HeapStats>,
    registry: TypeRegistry,
    cache: ObjectCache,
    collector: CycleCollector,
    directory: ObjectDirectory,
    root_layout: Arc<Layout>,
    root_fields: RootFields,
    /// Address table: one live region handle per allocated address, so
    /// two lookups of the same address return the identical handle.
    regions: DashMap<Address, Arc<MemoryRegion>>,
    open: AtomicBool,
    /// Serializes open/close transitions.
    lifecycle: Mutex<()>,
    /// Transactions hold this shared; cycle collection holds it
    /// exclusive, so marking never races a counted-reference mutation.
    collect_gate: RwLock<()>,
    state: RwLock<Option<OpenState>>,
}

/// Field handles into the `strata.root` layout.
struct RootFields {
    directory_table: LongField,
    candidate_table: LongField,
}

impl Heap {
    /// Create a heap over `provider`. The heap is closed until
    /// [`Heap::open`] is called.
    pub fn new(provider: Arc<dyn RegionProvider>, config: HeapConfig) -> Result<Arc<Heap>> {
        config.validate()?;
        let stats = Arc::new(HeapStats::new());
        let registry = TypeRegistry::new();

        let mut b = LayoutBuilder::new(ROOT_LAYOUT_NAME);
        let directory_table = b.long_field(Mutability::Mutable);
        let candidate_table = b.long_field(Mutability::Mutable);
        let root_layout = b.build(&registry)?;

        Ok(Arc::new(Heap {
            provider,
            config,
            cache: ObjectCache::new(Arc::clone(&stats)),
            collector: CycleCollector::new(Arc::clone(&stats)),
            directory: ObjectDirectory::new(),
            stats,
            registry,
            root_layout,
            root_fields: RootFields {
                directory_table,
                candidate_table,
            },
            regions: DashMap::new(),
            open: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            collect_gate: RwLock::new(()),
            state: RwLock::new(None),
        }))
    }

    /// Create a heap backed by a memory-mapped file at `path`.
    pub fn open_file(
        path: impl AsRef<std::path::Path>,
        config: HeapConfig,
    ) -> Result<Arc<Heap>> {
        let capacity = config.capacity;
        let heap = Heap::new(
            Arc::new(crate::provider::MmapProvider::new(path, capacity)),
            config,
        )?;
        heap.open()?;
        Ok(heap)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the heap: map the region, recover any interrupted
    /// transactions, and reload the persisted roots. Idempotent.
    pub fn open(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.open.load(Ordering::Acquire) {
            return Ok(());
        }
        self.provider.open()?;

        let meta_addr = self.provider.meta_address()?;
        let (root_addr, log_addr) = if meta_addr.is_null() {
            self.format()?
        } else {
            let mut buf = [0u8; META_SIZE as usize];
            self.provider.read(meta_addr, 0, &mut buf)?;
            let root = Address::from_raw(u64::from_le_bytes(buf[0..8].try_into().unwrap_or([0; 8])));
            let log = Address::from_raw(u64::from_le_bytes(buf[8..16].try_into().unwrap_or([0; 8])));
            if root.is_null() || log.is_null() {
                return Err(Error::Corrupt("meta block holds a null address".into()));
            }
            (root, log)
        };

        let root_size = self.provider.size_of(root_addr)?;
        let root = Arc::new(MemoryRegion::persistent(
            root_addr,
            root_size,
            Arc::clone(&self.provider),
        ));
        let tag = header::read_tag(&root)?;
        if tag != self.root_layout.tag() {
            return Err(Error::Corrupt(format!(
                "root block has tag {:?}, expected {:?}",
                tag,
                self.root_layout.tag()
            )));
        }

        let txn = Arc::new(TransactionManager::new(
            Arc::clone(&self.provider),
            log_addr,
            &self.config,
            Arc::clone(&self.stats),
        ));
        txn.recover()?;

        *self.state.write() = Some(OpenState {
            txn,
            root: Arc::clone(&root),
        });
        self.open.store(true, Ordering::Release);

        // A failed mirror load leaves the heap closed, not half-open.
        if let Err(err) = self.load_mirrors(&root) {
            self.open.store(false, Ordering::Release);
            *self.state.write() = None;
            self.regions.clear();
            if let Err(close_err) = self.provider.close() {
                log::warn!("provider close after failed open: {}", close_err);
            }
            return Err(err);
        }

        log::info!(
            "heap open: {} named roots, {} cycle candidates",
            self.directory.names().len(),
            self.collector.export().len()
        );
        Ok(())
    }

    /// Reload the directory mirror and the persisted cycle candidates.
    fn load_mirrors(&self, root: &MemoryRegion) -> Result<()> {
        let dir_table = self.read_root_field(root, &self.root_fields.directory_table)?;
        self.directory.load(self, dir_table)?;

        let cand_table = self.read_root_field(root, &self.root_fields.candidate_table)?;
        if !cand_table.is_null() {
            let table = self.region_from_address(cand_table)?;
            self.collector.import(directory::read_address_table(&table)?);
        }
        Ok(())
    }

    /// Lay out a fresh region: log area, root block, meta block.
    fn format(&self) -> Result<(Address, Address)> {
        let log_addr = self.provider.allocate(self.config.log_area_size())?;

        let root_addr = self.provider.allocate(self.root_layout.allocation_size())?;
        let root = MemoryRegion::persistent(
            root_addr,
            self.root_layout.allocation_size(),
            Arc::clone(&self.provider),
        );
        root.write_u32(header::TYPE_TAG_OFFSET, self.root_layout.tag().raw())?;
        root.write_u32(header::REF_COUNT_OFFSET, 1)?;
        header::write_flags(&root, header::HeaderFlags::PINNED)?;

        let meta_addr = self.provider.allocate(META_SIZE)?;
        self.provider
            .write(meta_addr, META_ROOT_OFFSET, &root_addr.raw().to_le_bytes())?;
        self.provider
            .write(meta_addr, META_LOG_OFFSET, &log_addr.raw().to_le_bytes())?;
        self.provider.flush()?;
        self.provider.set_meta_address(meta_addr)?;
        log::info!("formatted fresh heap region");
        Ok((root_addr, log_addr))
    }

    /// Close the heap: persist the cycle-candidate set, flush, and unmap.
    /// Outstanding object handles become inert. Idempotent.
    pub fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if !self.open.load(Ordering::Acquire) {
            return Ok(());
        }

        self.export_candidates()?;
        self.open.store(false, Ordering::Release);
        *self.state.write() = None;
        self.regions.clear();
        self.provider.close()?;
        log::info!("heap closed");
        Ok(())
    }

    /// Whether the heap is currently open.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn export_candidates(&self) -> Result<()> {
        let root = self.root_region()?;
        let old = self.read_root_field(&root, &self.root_fields.candidate_table)?;

        let candidates = self.collector.export();
        let new = if candidates.is_empty() {
            Address::NULL
        } else {
            directory::write_address_table(self, &candidates)?
        };
        root.write_u64(
            self.root_layout.offset(self.root_fields.candidate_table.index()),
            new.raw(),
        )?;
        self.provider.flush()?;
        if !old.is_null() {
            self.free_address(old)?;
        }
        Ok(())
    }

    // =========================================================================
    // Allocation and addressing
    // =========================================================================

    /// Allocate a zeroed persistent region of `size` bytes, opening the
    /// heap first if needed. The region is registered in the address
    /// table before it is returned.
    pub(crate) fn allocate(&self, size: u64) -> Result<Arc<MemoryRegion>> {
        if !self.is_open() {
            self.open()?;
        }
        let addr = self.provider.allocate(size)?;
        self.stats.record_allocation(size);
        let region = Arc::new(MemoryRegion::persistent(
            addr,
            size,
            Arc::clone(&self.provider),
        ));
        self.regions.insert(addr, Arc::clone(&region));
        Ok(region)
    }

    /// Rebind an address to its live region: the table entry if present,
    /// else a freshly constructed and registered one.
    pub(crate) fn region_from_address(&self, addr: Address) -> Result<Arc<MemoryRegion>> {
        self.ensure_open()?;
        if addr.is_null() || addr.is_volatile() {
            return Err(Error::InvalidAddress(addr));
        }
        if let Some(region) = self.regions.get(&addr) {
            return Ok(Arc::clone(&region));
        }
        let size = self.provider.size_of(addr)?;
        let region = Arc::new(MemoryRegion::persistent(
            addr,
            size,
            Arc::clone(&self.provider),
        ));
        Ok(Arc::clone(
            self.regions.entry(addr).or_insert(region).value(),
        ))
    }

    /// Return the block at `addr` to the allocator and drop its address
    /// table entry.
    ///
    /// Inside a transaction the block must outlive a possible rollback,
    /// so the provider free waits for the commit mark.
    pub(crate) fn free_address(&self, addr: Address) -> Result<()> {
        self.ensure_open()?;
        self.regions.remove(&addr);
        if txn::defer_free(addr) {
            return Ok(());
        }
        self.provider.free(addr)?;
        self.stats.record_free();
        Ok(())
    }

    /// Free `region`'s storage outright.
    ///
    /// Reclamation is normally reference-count driven; this is the
    /// low-level escape hatch, and the caller must guarantee no stored
    /// reference or live handle still names the region.
    pub fn free_region(&self, region: &MemoryRegion) -> Result<()> {
        if region.is_volatile() {
            return Ok(());
        }
        self.cache.evict(region.address());
        self.collector.remove_candidate(region.address());
        self.free_address(region.address())
    }

    /// Free a directory or candidate table block, ignoring the null
    /// sentinel.
    pub(crate) fn free_table(&self, addr: Address) -> Result<()> {
        if addr.is_null() {
            return Ok(());
        }
        self.free_address(addr)
    }

    #[inline]
    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotOpen)
        }
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Dereference `addr` to its one live handle, constructing the proxy
    /// if no handle is currently live.
    ///
    /// The stored type tag must have a registered layout.
    pub fn object_at(self: &Arc<Self>, addr: Address) -> Result<Arc<PersistentObject>> {
        self.ensure_open()?;
        self.cache.get_or_insert(addr, || {
            let region = self.region_from_address(addr)?;
            let tag = header::read_tag(&region)?;
            let layout = self
                .registry
                .get(tag)
                .ok_or(Error::UnknownTypeTag(tag))?;
            Ok(Arc::new(PersistentObject::from_pointer(
                &Arc::downgrade(self),
                ObjectPointer::new(layout, region),
            )))
        })
    }

    /// Run `body` inside a transaction on the calling thread (joining the
    /// enclosing transaction if one is open). Commits on `Ok`, rolls back
    /// on `Err` or unwind. Cycle collection is excluded for the duration.
    pub fn run_in_transaction<T>(&self, body: impl FnOnce() -> Result<T>) -> Result<T> {
        let _gate = if txn::in_transaction() {
            None
        } else {
            Some(self.collect_gate.read())
        };
        self.run_txn(body)
    }

    /// Transaction entry that skips the collection gate. Only for the
    /// collector's own freeing transaction, which already holds the gate
    /// exclusively.
    pub(crate) fn run_txn<T>(&self, body: impl FnOnce() -> Result<T>) -> Result<T> {
        let mgr = {
            let state = self.state.read();
            let state = state.as_ref().ok_or(Error::NotOpen)?;
            Arc::clone(&state.txn)
        };
        txn::run(&mgr, body)
    }

    // =========================================================================
    // Named roots
    // =========================================================================

    /// Bind `name` to `obj` in the durable directory, replacing any
    /// previous binding. The object becomes findable across restarts.
    pub fn put_root(self: &Arc<Self>, name: &str, obj: &Arc<PersistentObject>) -> Result<()> {
        self.ensure_open()?;
        if obj.layout().is_value_based() || obj.region().is_volatile() {
            return Err(Error::ValueBasedReference);
        }
        self.directory.bind(self, name, obj.address())
    }

    /// Look up the object bound to `name`.
    pub fn get_root(self: &Arc<Self>, name: &str) -> Result<Option<Arc<PersistentObject>>> {
        self.ensure_open()?;
        match self.directory.lookup(name) {
            Some(addr) => Ok(Some(self.object_at(addr)?)),
            None => Ok(None),
        }
    }

    /// Look up `name` and check the result against `layout`.
    pub fn get_root_as(
        self: &Arc<Self>,
        name: &str,
        layout: &Arc<Layout>,
    ) -> Result<Option<Arc<PersistentObject>>> {
        match self.get_root(name)? {
            Some(obj) if obj.layout().is_a(layout.tag()) => Ok(Some(obj)),
            Some(obj) => Err(Error::TypeMismatch {
                expected: layout.tag(),
                found: obj.layout().tag(),
            }),
            None => Ok(None),
        }
    }

    /// Remove the binding for `name`, releasing the object it held.
    /// Returns whether a binding existed.
    pub fn remove_root(self: &Arc<Self>, name: &str) -> Result<bool> {
        self.ensure_open()?;
        self.directory.unbind(self, name)
    }

    /// Names currently bound, unordered.
    pub fn root_names(&self) -> Vec<String> {
        self.directory.names()
    }

    // =========================================================================
    // Collection
    // =========================================================================

    /// Run one cycle collection. Returns the number of objects freed.
    ///
    /// Takes the collection gate exclusively, so in-flight transactions
    /// finish first and no new one starts until collection is done. Must
    /// not be called from inside a transaction.
    ///
    /// The surviving candidate set is re-persisted afterwards, so a crash
    /// right after collection does not resurrect stale candidates.
    pub fn collect_cycles(self: &Arc<Self>) -> Result<usize> {
        self.ensure_open()?;
        if txn::in_transaction() {
            return Err(Error::Corrupt(
                "cycle collection cannot run inside a transaction".into(),
            ));
        }
        let freed = {
            let _gate = self.collect_gate.write();
            self.collector.collect(self)?
        };
        self.export_candidates()?;
        Ok(freed)
    }

    /// Addresses collection marking starts from: the root block, every
    /// directory binding, and every live in-memory handle.
    pub(crate) fn root_addresses(&self) -> Vec<Address> {
        let mut roots = self.directory.addresses();
        roots.extend(self.cache.live_addresses());
        if let Ok(root) = self.root_region() {
            roots.push(root.address());
        }
        roots
    }

    // =========================================================================
    // Subsystem access
    // =========================================================================

    /// The type registry for this heap. Layouts are registered here once
    /// at startup, before the objects using them are touched.
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn counters(&self) -> &HeapStats {
        &self.stats
    }

    pub(crate) fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub(crate) fn collector(&self) -> &CycleCollector {
        &self.collector
    }

    fn root_region(&self) -> Result<Arc<MemoryRegion>> {
        let state = self.state.read();
        let state = state.as_ref().ok_or(Error::NotOpen)?;
        Ok(Arc::clone(&state.root))
    }

    fn read_root_field(&self, root: &MemoryRegion, field: &LongField) -> Result<Address> {
        Ok(Address::from_raw(
            root.read_u64(self.root_layout.offset(field.index()))?,
        ))
    }

    /// Current directory table address.
    pub(crate) fn directory_table(&self) -> Result<Address> {
        let root = self.root_region()?;
        self.read_root_field(&root, &self.root_fields.directory_table)
    }

    /// Point the root block at a new directory table. Logged, so a
    /// rollback restores the previous table.
    pub(crate) fn set_directory_table(&self, addr: Address) -> Result<()> {
        let root = self.root_region()?;
        let offset = self.root_layout.offset(self.root_fields.directory_table.index());
        txn::log_write(&root, offset, 8)?;
        root.write_u64(offset, addr.raw())
    }

    /// Tag of the internal root layout (reserved; not bindable).
    #[cfg(test)]
    pub(crate) fn root_tag(&self) -> crate::layout::TypeTag {
        self.root_layout.tag()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(err) = self.close() {
                log::warn!("heap close during drop failed: {}", err);
            }
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("open", &self.is_open())
            .field("capacity", &self.config.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::IntField;
    use crate::provider::MmapProvider;
    use tempfile::TempDir;

    fn open_heap(path: &std::path::Path) -> Arc<Heap> {
        let heap = Heap::new(
            Arc::new(MmapProvider::new(path, 4 * 1024 * 1024)),
            HeapConfig::default(),
        )
        .unwrap();
        heap.open().unwrap();
        heap
    }

    fn point_layout(heap: &Arc<Heap>) -> (Arc<Layout>, IntField, IntField) {
        let mut b = LayoutBuilder::new("heap.point");
        let x = b.int_field(Mutability::Mutable);
        let y = b.int_field(Mutability::Mutable);
        (b.build(heap.registry()).unwrap(), x, y)
    }

    #[test]
    fn test_open_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir.path().join("h.strata"));
        assert!(heap.is_open());
        heap.open().unwrap();
        assert!(heap.is_open());
    }

    #[test]
    fn test_operations_require_open_heap() {
        let dir = TempDir::new().unwrap();
        let heap = Heap::new(
            Arc::new(MmapProvider::new(
                dir.path().join("h.strata"),
                4 * 1024 * 1024,
            )),
            HeapConfig::default(),
        )
        .unwrap();
        assert!(matches!(heap.get_root("x"), Err(Error::NotOpen)));
        assert!(matches!(
            heap.run_in_transaction(|| Ok(())),
            Err(Error::NotOpen)
        ));

        // Allocation is the exception: it opens the heap on demand.
        assert!(!heap.is_open());
        assert!(heap.allocate(64).is_ok());
        assert!(heap.is_open());
    }

    #[test]
    fn test_named_root_roundtrip() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir.path().join("h.strata"));
        let (layout, x, _) = point_layout(&heap);

        let p = PersistentObject::new(&heap, &layout, |o| o.set_int(&x, 42)).unwrap();
        heap.put_root("origin", &p).unwrap();

        let found = heap.get_root("origin").unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &p));
        assert_eq!(heap.root_names(), vec!["origin".to_owned()]);
        assert!(heap.get_root("missing").unwrap().is_none());
    }

    #[test]
    fn test_directory_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("h.strata");
        {
            let heap = open_heap(&path);
            let (layout, x, y) = point_layout(&heap);
            let p = PersistentObject::new(&heap, &layout, |o| {
                o.set_int(&x, 3)?;
                o.set_int(&y, 4)
            })
            .unwrap();
            heap.put_root("origin", &p).unwrap();
            heap.close().unwrap();
        }

        let heap = open_heap(&path);
        let (_, x, y) = point_layout(&heap);
        let p = heap.get_root("origin").unwrap().unwrap();
        assert_eq!(p.get_int(&x).unwrap(), 3);
        assert_eq!(p.get_int(&y).unwrap(), 4);
    }

    #[test]
    fn test_remove_root_releases_binding() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir.path().join("h.strata"));
        let (layout, _, _) = point_layout(&heap);

        let p = PersistentObject::new(&heap, &layout, |_| Ok(())).unwrap();
        heap.put_root("temp", &p).unwrap();
        assert_eq!(p.ref_count().unwrap(), 1);

        assert!(heap.remove_root("temp").unwrap());
        assert!(!heap.remove_root("temp").unwrap());
        assert_eq!(p.ref_count().unwrap(), 0);
        assert!(heap.get_root("temp").unwrap().is_none());
    }

    #[test]
    fn test_get_root_as_checks_layout() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir.path().join("h.strata"));
        let (point, _, _) = point_layout(&heap);
        let other = LayoutBuilder::new("heap.other").build(heap.registry()).unwrap();

        let p = PersistentObject::new(&heap, &point, |_| Ok(())).unwrap();
        heap.put_root("p", &p).unwrap();

        assert!(heap.get_root_as("p", &point).unwrap().is_some());
        assert!(matches!(
            heap.get_root_as("p", &other),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_value_object_not_bindable() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir.path().join("h.strata"));
        let layout = LayoutBuilder::value("heap.val").build(heap.registry()).unwrap();
        let v = PersistentObject::new(&heap, &layout, |_| Ok(())).unwrap();
        assert!(matches!(
            heap.put_root("v", &v),
            Err(Error::ValueBasedReference)
        ));
    }

    #[test]
    fn test_root_layout_registered() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir.path().join("h.strata"));
        assert!(heap.registry().contains(heap.root_tag()));
    }

    #[test]
    fn test_address_table_returns_identical_handle() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir.path().join("h.strata"));
        let region = heap.allocate(32).unwrap();
        let again = heap.region_from_address(region.address()).unwrap();
        assert!(Arc::ptr_eq(&region, &again));

        // Freeing drops the table entry: reallocating the same address
        // yields a distinct handle.
        heap.free_region(&region).unwrap();
        let fresh = heap.allocate(32).unwrap();
        assert_eq!(fresh.address(), region.address());
        assert!(!Arc::ptr_eq(&region, &fresh));
    }

    #[test]
    fn test_failed_mirror_load_leaves_heap_closed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("h.strata");
        let table_addr;
        {
            let heap = open_heap(&path);
            let (layout, _, _) = point_layout(&heap);
            let p = PersistentObject::new(&heap, &layout, |_| Ok(())).unwrap();
            heap.put_root("n", &p).unwrap();
            table_addr = heap.directory_table().unwrap();
            heap.close().unwrap();
        }

        // Corrupt the first directory entry's name length.
        let provider = MmapProvider::new(&path, 4 * 1024 * 1024);
        provider.open().unwrap();
        provider
            .write(table_addr, 4, &1000u32.to_le_bytes())
            .unwrap();
        provider.flush().unwrap();
        provider.close().unwrap();

        let heap = Heap::new(
            Arc::new(MmapProvider::new(&path, 4 * 1024 * 1024)),
            HeapConfig::default(),
        )
        .unwrap();
        assert!(heap.open().is_err());
        assert!(!heap.is_open());
        assert!(matches!(heap.get_root("n"), Err(Error::NotOpen)));
    }

    #[test]
    fn test_stats_track_allocations() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir.path().join("h.strata"));
        let (layout, _, _) = point_layout(&heap);
        let before = heap.stats().regions_allocated;
        let _p = PersistentObject::new(&heap, &layout, |_| Ok(())).unwrap();
        assert_eq!(heap.stats().regions_allocated, before + 1);
        assert!(heap.stats().txn_commits >= 1);
    }
}
