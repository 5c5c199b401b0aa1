//! The object model: typed field access over persistent regions.
//!
//! A [`PersistentObject`] is the in-memory proxy for one persistent
//! object: an [`ObjectPointer`] (layout + region) plus, during the
//! construction window only, a tracking array enforcing the one-time
//! initialization discipline for write-once fields.
//!
//! Every accessor maps its field handle to an offset through the layout's
//! flat table and performs a raw region read or write of the exact width
//! for that field kind. Object-reference fields store the referent's
//! 8-byte address (0 = unset) and dereference lazily through the object
//! cache; value-based fields copy bytes inline and read back as private
//! scratch-backed instances.
//!
//! Mutating accessors log their previous bytes through the active
//! transaction before writing, which is what makes field mutation
//! crash-atomic. Writes outside a transaction go straight to the region —
//! legal, but not crash-safe, per the heap's concurrency contract.

pub mod header;

use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::layout::{
    BoolField, ByteField, CharField, DoubleField, FieldDescriptor, FieldKind, FloatField,
    IntField, Layout, LongField, Mutability, ObjectField, ShortField, ValueField,
};
use crate::region::{Address, MemoryRegion};
use crate::txn;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::{Arc, Weak};

// =============================================================================
// Object pointer
// =============================================================================

/// The pairing of a [`Layout`] with a [`MemoryRegion`]: the only way to
/// reach an object's storage.
#[derive(Clone)]
pub struct ObjectPointer {
    layout: Arc<Layout>,
    region: Arc<MemoryRegion>,
}

impl ObjectPointer {
    /// Pair a layout with the region it interprets.
    pub fn new(layout: Arc<Layout>, region: Arc<MemoryRegion>) -> Self {
        Self { layout, region }
    }

    /// The layout interpreting the region.
    #[inline]
    pub fn layout(&self) -> &Arc<Layout> {
        &self.layout
    }

    /// The region holding the object's bytes.
    #[inline]
    pub fn region(&self) -> &Arc<MemoryRegion> {
        &self.region
    }
}

impl std::fmt::Debug for ObjectPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPointer")
            .field("layout", &self.layout.name())
            .field("addr", &self.region.address())
            .finish()
    }
}

// =============================================================================
// Persistent object
// =============================================================================

/// In-memory proxy bound 1:1 to a persistent object's storage.
///
/// Heap-resident instances are deduplicated by the object cache (one live
/// instance per address); value-based instances are private copies with no
/// cache entry. After construction completes, instances are freely
/// shareable across threads — write-once fields need no synchronization,
/// mutable fields need a transaction.
pub struct PersistentObject {
    ptr: ObjectPointer,
    heap: Weak<Heap>,
    /// `true` entries mark write-once fields not yet initialized. Present
    /// only during the construction window; `None` afterwards, so a
    /// post-construction instance costs nothing extra per field.
    uninit: Mutex<Option<Box<[bool]>>>,
}

impl PersistentObject {
    /// Allocate and construct a new object of `layout`.
    ///
    /// The region is sized by the layout, every write-once field starts
    /// unset, and `init` runs exactly once inside a transaction. When
    /// `init` returns the tracking array is discarded: write-once fields
    /// are constants from then on.
    ///
    /// Value-based layouts construct into a private scratch region
    /// instead of the heap.
    pub fn new(
        heap: &Arc<Heap>,
        layout: &Arc<Layout>,
        init: impl FnOnce(&PersistentObject) -> Result<()>,
    ) -> Result<Arc<PersistentObject>> {
        let unset = vec![true; layout.field_count() as usize].into_boxed_slice();

        if layout.is_value_based() {
            let region = Arc::new(MemoryRegion::volatile(layout.allocation_size()));
            let obj = Arc::new(PersistentObject {
                ptr: ObjectPointer::new(Arc::clone(layout), region),
                heap: Arc::downgrade(heap),
                uninit: Mutex::new(Some(unset)),
            });
            init(&obj)?;
            *obj.uninit.lock() = None;
            return Ok(obj);
        }

        let region = heap.allocate(layout.allocation_size())?;
        // The header is written before the initializer so the object is
        // reconstructible (and releasable) from its tag immediately.
        region.write_u32(header::TYPE_TAG_OFFSET, layout.tag().raw())?;

        let obj = Arc::new(PersistentObject {
            ptr: ObjectPointer::new(Arc::clone(layout), region),
            heap: Arc::downgrade(heap),
            uninit: Mutex::new(Some(unset)),
        });
        // Published before the initializer so a concurrent dereference of
        // the address lands on this handle, not a second one.
        heap.cache().publish(obj.address(), &obj);

        // On error the transaction has rolled back all field effects
        // (including child refcounts); dropping `obj` then frees the
        // region because its count is still zero.
        heap.run_in_transaction(|| init(&obj))?;

        *obj.uninit.lock() = None;
        Ok(obj)
    }

    /// Reattach to existing storage (cache reconstruction, value copies).
    pub(crate) fn from_pointer(heap: &Weak<Heap>, ptr: ObjectPointer) -> PersistentObject {
        PersistentObject {
            ptr,
            heap: heap.clone(),
            uninit: Mutex::new(None),
        }
    }

    /// The object pointer locating this object's storage.
    #[inline]
    pub fn pointer(&self) -> &ObjectPointer {
        &self.ptr
    }

    /// The layout of this object.
    #[inline]
    pub fn layout(&self) -> &Arc<Layout> {
        self.ptr.layout()
    }

    /// The region holding this object's bytes.
    #[inline]
    pub fn region(&self) -> &Arc<MemoryRegion> {
        self.ptr.region()
    }

    /// Persistent address of this object.
    #[inline]
    pub fn address(&self) -> Address {
        self.ptr.region().address()
    }

    fn heap(&self) -> Result<Arc<Heap>> {
        self.heap.upgrade().ok_or(Error::HeapGone)
    }

    // =========================================================================
    // Access checks
    // =========================================================================

    fn descriptor(&self, index: u16, kind: FieldKind) -> Result<&FieldDescriptor> {
        let layout = self.ptr.layout();
        if index >= layout.field_count() {
            return Err(Error::FieldKindMismatch { index });
        }
        let desc = layout.descriptor(index);
        if desc.kind() != kind {
            return Err(Error::FieldKindMismatch { index });
        }
        Ok(desc)
    }

    fn checked_offset(&self, index: u16, kind: FieldKind) -> Result<u64> {
        self.descriptor(index, kind)?;
        Ok(self.ptr.layout().offset(index))
    }

    /// Offset for a `set_*` access: the field must be mutable.
    fn mutable_offset(&self, index: u16, kind: FieldKind) -> Result<u64> {
        let desc = self.descriptor(index, kind)?;
        if desc.mutability() != Mutability::Mutable {
            return Err(Error::ImmutableField { index });
        }
        Ok(self.ptr.layout().offset(index))
    }

    /// Offset for an `init_*` access: the field must be write-once and
    /// still unset, and the construction window must still be open.
    /// Marks the field initialized.
    fn init_offset(&self, index: u16, kind: FieldKind) -> Result<u64> {
        let desc = self.descriptor(index, kind)?;
        if desc.mutability() != Mutability::WriteOnce {
            return Err(Error::NotWriteOnce { index });
        }
        let mut guard = self.uninit.lock();
        match guard.as_mut() {
            Some(unset) if unset[index as usize] => {
                unset[index as usize] = false;
                Ok(self.ptr.layout().offset(index))
            }
            // Second init, or init after construction completed.
            _ => Err(Error::AlreadyInitialized { index }),
        }
    }

    /// Undo-log and perform a field write.
    fn store(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        txn::log_write(self.ptr.region(), offset, bytes.len() as u64)?;
        self.ptr.region().write_bytes(offset, bytes)
    }
}

// =============================================================================
// Scalar accessors
// =============================================================================

macro_rules! scalar_accessors {
    ($kind:expr, $handle:ty, $ty:ty, $get:ident, $set:ident, $init:ident,
     $read:ident, $write:ident, $what:literal) => {
        impl PersistentObject {
            #[doc = concat!("Read a ", $what, " field.")]
            pub fn $get(&self, field: &$handle) -> Result<$ty> {
                let offset = self.checked_offset(field.index(), $kind)?;
                self.ptr.region().$read(offset)
            }

            #[doc = concat!("Write a mutable ", $what, " field.")]
            pub fn $set(&self, field: &$handle, value: $ty) -> Result<()> {
                let offset = self.mutable_offset(field.index(), $kind)?;
                txn::log_write(self.ptr.region(), offset, size_of_kind($kind))?;
                self.ptr.region().$write(offset, value)
            }

            #[doc = concat!(
                "Initialize a write-once ",
                $what,
                " field. Legal exactly once, during construction."
            )]
            pub fn $init(&self, field: &$handle, value: $ty) -> Result<()> {
                let offset = self.init_offset(field.index(), $kind)?;
                txn::log_write(self.ptr.region(), offset, size_of_kind($kind))?;
                self.ptr.region().$write(offset, value)
            }
        }
    };
}

#[inline]
const fn size_of_kind(kind: FieldKind) -> u64 {
    match kind {
        FieldKind::Byte | FieldKind::Bool => 1,
        FieldKind::Short => 2,
        FieldKind::Int | FieldKind::Float | FieldKind::Char => 4,
        FieldKind::Long | FieldKind::Double | FieldKind::Object => 8,
        FieldKind::Value => 0, // sized by the embedded layout, handled apart
    }
}

scalar_accessors!(FieldKind::Byte, ByteField, i8, get_byte, set_byte, init_byte, read_byte, write_byte, "byte");
scalar_accessors!(FieldKind::Short, ShortField, i16, get_short, set_short, init_short, read_short, write_short, "short");
scalar_accessors!(FieldKind::Int, IntField, i32, get_int, set_int, init_int, read_int, write_int, "int");
scalar_accessors!(FieldKind::Long, LongField, i64, get_long, set_long, init_long, read_long, write_long, "long");
scalar_accessors!(FieldKind::Float, FloatField, f32, get_float, set_float, init_float, read_float, write_float, "float");
scalar_accessors!(FieldKind::Double, DoubleField, f64, get_double, set_double, init_double, read_double, write_double, "double");
scalar_accessors!(FieldKind::Char, CharField, char, get_char, set_char, init_char, read_char, write_char, "char");
scalar_accessors!(FieldKind::Bool, BoolField, bool, get_bool, set_bool, init_bool, read_bool, write_bool, "boolean");

// =============================================================================
// Object-reference and value accessors
// =============================================================================

impl PersistentObject {
    /// Dereference an object field through the cache. Returns `None` when
    /// the stored address is the unset sentinel.
    pub fn get_object(&self, field: &ObjectField) -> Result<Option<Arc<PersistentObject>>> {
        let offset = self.checked_offset(field.index(), FieldKind::Object)?;
        let addr = Address::from_raw(self.ptr.region().read_u64(offset)?);
        if addr.is_null() {
            return Ok(None);
        }
        Ok(Some(self.heap()?.object_at(addr)?))
    }

    /// Assign a mutable object field, adjusting reference counts: the new
    /// referent is retained, the previous one released (freeing it
    /// eagerly if that was its last reference).
    pub fn set_object(
        &self,
        field: &ObjectField,
        value: Option<&Arc<PersistentObject>>,
    ) -> Result<()> {
        let offset = self.mutable_offset(field.index(), FieldKind::Object)?;
        self.write_reference(field.index(), offset, value)
    }

    /// Initialize a write-once object field. Legal exactly once, during
    /// construction.
    pub fn init_object(
        &self,
        field: &ObjectField,
        value: Option<&Arc<PersistentObject>>,
    ) -> Result<()> {
        let offset = self.init_offset(field.index(), FieldKind::Object)?;
        self.write_reference(field.index(), offset, value)
    }

    fn write_reference(
        &self,
        index: u16,
        offset: u64,
        value: Option<&Arc<PersistentObject>>,
    ) -> Result<()> {
        let desc = self.ptr.layout().descriptor(index);

        let new_addr = match value {
            Some(obj) => {
                if obj.layout().is_value_based() || obj.region().is_volatile() {
                    return Err(Error::ValueBasedReference);
                }
                if let Some(expected) = desc.referent() {
                    if !obj.layout().is_a(expected) {
                        return Err(Error::TypeMismatch {
                            expected,
                            found: obj.layout().tag(),
                        });
                    }
                }
                obj.address()
            }
            None => Address::NULL,
        };

        let old_addr = Address::from_raw(self.ptr.region().read_u64(offset)?);
        if old_addr == new_addr {
            return Ok(());
        }

        self.store(offset, &new_addr.raw().to_le_bytes())?;

        // A scratch-resident value holds uncounted edges; the counts are
        // taken over when the value is embedded into persistent storage.
        if self.ptr.region().is_volatile() {
            return Ok(());
        }
        let heap = self.heap()?;
        if !new_addr.is_null() {
            inc_ref(&heap, new_addr)?;
        }
        if !old_addr.is_null() {
            dec_ref(&heap, old_addr)?;
        }
        Ok(())
    }

    /// Read a value-based field as a private copy.
    ///
    /// The embedded bytes are copied into a scratch region and wrapped in
    /// a fresh instance; mutations of the copy never touch this object.
    pub fn get_value(&self, field: &ValueField) -> Result<Arc<PersistentObject>> {
        let offset = self.checked_offset(field.index(), FieldKind::Value)?;
        let desc = self.ptr.layout().descriptor(field.index());
        let embedded = desc
            .embedded()
            .ok_or(Error::FieldKindMismatch { index: field.index() })?;

        let size = embedded.allocation_size();
        let mut buf = vec![0u8; size as usize];
        self.ptr.region().read_bytes(offset, &mut buf)?;

        let scratch = MemoryRegion::volatile(size);
        scratch.write_bytes(0, &buf)?;
        Ok(Arc::new(PersistentObject::from_pointer(
            &self.heap,
            ObjectPointer::new(Arc::clone(embedded), Arc::new(scratch)),
        )))
    }

    /// Copy a value-based object's bytes into a mutable value field.
    pub fn set_value(&self, field: &ValueField, value: &PersistentObject) -> Result<()> {
        let offset = self.mutable_offset(field.index(), FieldKind::Value)?;
        self.copy_value_in(field.index(), offset, value)
    }

    /// Initialize a write-once value field. Legal exactly once, during
    /// construction.
    pub fn init_value(&self, field: &ValueField, value: &PersistentObject) -> Result<()> {
        let offset = self.init_offset(field.index(), FieldKind::Value)?;
        self.copy_value_in(field.index(), offset, value)
    }

    fn copy_value_in(&self, index: u16, offset: u64, value: &PersistentObject) -> Result<()> {
        let desc = self.ptr.layout().descriptor(index);
        let embedded = desc.embedded().ok_or(Error::FieldKindMismatch { index })?;
        if !value.layout().is_a(embedded.tag()) {
            return Err(Error::TypeMismatch {
                expected: embedded.tag(),
                found: value.layout().tag(),
            });
        }
        let size = embedded.allocation_size();
        let mut buf = vec![0u8; size as usize];
        value.region().read_bytes(0, &mut buf)?;

        if self.ptr.region().is_volatile() {
            return self.ptr.region().write_bytes(offset, &buf);
        }

        // References inside the embedded bytes become counted edges of
        // this object; those in the overwritten bytes stop being ones.
        let heap = self.heap()?;
        let new_refs = embedded_refs(embedded, value.region(), 0)?;
        let old_refs = embedded_refs(embedded, self.ptr.region(), offset)?;
        self.store(offset, &buf)?;
        for &addr in &new_refs {
            inc_ref(&heap, addr)?;
        }
        for &addr in &old_refs {
            dec_ref(&heap, addr)?;
        }
        Ok(())
    }

    /// Persistent reference count (header bookkeeping; mostly useful for
    /// tests and diagnostics).
    pub fn ref_count(&self) -> Result<u32> {
        if self.ptr.region().is_volatile() {
            return Ok(0);
        }
        header::read_ref_count(self.ptr.region())
    }
}

impl Drop for PersistentObject {
    fn drop(&mut self) {
        // Value copies have no persistent identity to reclaim.
        if self.ptr.region().is_volatile() {
            return;
        }
        let Some(heap) = self.heap.upgrade() else {
            return;
        };
        if !heap.is_open() {
            return;
        }
        let addr = self.ptr.region().address();
        heap.cache().forget(addr);

        // Last in-memory handle of an unreferenced object: free eagerly.
        // The free runs in a transaction, re-checking the count under the
        // region lock, so a racing retain or re-dereference wins.
        match header::read_ref_count(self.ptr.region()) {
            Ok(0) => {
                let region = Arc::clone(self.ptr.region());
                let result = heap.run_in_transaction(|| {
                    txn::log_write(&region, header::REF_COUNT_OFFSET, 4)?;
                    if header::read_ref_count(&region)? != 0 || heap.cache().has_live(addr) {
                        return Ok(());
                    }
                    release_address(&heap, addr)
                });
                if let Err(err) = result {
                    log::warn!("failed to free unreferenced object at {:?}: {}", addr, err);
                }
            }
            Ok(_) => {}
            Err(err) => log::warn!("failed to read header at {:?} on drop: {}", addr, err),
        }
    }
}

impl std::fmt::Debug for PersistentObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentObject")
            .field("layout", &self.ptr.layout().name())
            .field("addr", &self.address())
            .finish()
    }
}

// =============================================================================
// Reference counting and reclamation
// =============================================================================

fn logged_write_u32(region: &MemoryRegion, offset: u64, value: u32) -> Result<()> {
    txn::log_write(region, offset, 4)?;
    region.write_u32(offset, value)
}

/// Retain the object at `addr`: bump its count and clear any cycle
/// candidacy (a newly referenced object is no longer a suspect).
pub(crate) fn inc_ref(heap: &Arc<Heap>, addr: Address) -> Result<()> {
    let region = heap.region_from_address(addr)?;
    let count = header::read_ref_count(&region)?;
    logged_write_u32(&region, header::REF_COUNT_OFFSET, count + 1)?;
    heap.collector().remove_candidate(addr);
    Ok(())
}

/// Release one reference to the object at `addr`.
///
/// A count that reaches zero frees the object (and cascades through its
/// children) immediately, so acyclic garbage never waits for the
/// collector; an object still held by a live in-memory handle defers
/// that free to the handle's drop. A nonzero remainder makes the object
/// a cycle suspect.
pub(crate) fn dec_ref(heap: &Arc<Heap>, addr: Address) -> Result<()> {
    let region = heap.region_from_address(addr)?;
    let count = header::read_ref_count(&region)?;
    let count = count.saturating_sub(1);
    logged_write_u32(&region, header::REF_COUNT_OFFSET, count)?;
    if count == 0 {
        if heap.cache().has_live(addr) {
            return Ok(());
        }
        release_address(heap, addr)
    } else {
        heap.collector().add_candidate(addr);
        Ok(())
    }
}

/// Free the object at `addr`, releasing its outgoing references first.
/// Runs iteratively so long reference chains cannot overflow the stack.
pub(crate) fn release_address(heap: &Arc<Heap>, addr: Address) -> Result<()> {
    let mut worklist: SmallVec<[Address; 8]> = SmallVec::new();
    worklist.push(addr);
    while let Some(addr) = worklist.pop() {
        let region = heap.region_from_address(addr)?;
        if header::read_flags(&region)?.contains(header::HeaderFlags::PINNED) {
            continue;
        }
        let tag = header::read_tag(&region)?;
        let layout = heap
            .registry()
            .get(tag)
            .ok_or(Error::UnknownTypeTag(tag))?;

        for child in outgoing_refs(&layout, &region)? {
            let child_region = heap.region_from_address(child)?;
            let count = header::read_ref_count(&child_region)?.saturating_sub(1);
            logged_write_u32(&child_region, header::REF_COUNT_OFFSET, count)?;
            if count == 0 {
                if !heap.cache().has_live(child) {
                    worklist.push(child);
                }
            } else {
                heap.collector().add_candidate(child);
            }
        }

        heap.collector().remove_candidate(addr);
        heap.cache().evict(addr);
        heap.free_address(addr)?;
        heap.counters()
            .eager_frees
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
    Ok(())
}

/// Addresses an object may hold references in, collected small-buffer
/// first: most layouts declare only a handful of reference fields.
pub(crate) type RefList = SmallVec<[Address; 8]>;

/// Collect the addresses stored in every object-reference field of
/// `layout`, descending into embedded value fields (whose layouts may
/// themselves declare references).
pub(crate) fn outgoing_refs(layout: &Layout, region: &MemoryRegion) -> Result<RefList> {
    let mut out = RefList::new();
    collect_refs(
        layout.descriptors(),
        &|i| layout.offset(i as u16),
        region,
        &mut out,
    )?;
    Ok(out)
}

/// Addresses stored in the reference fields of a value of `layout`
/// embedded at `base` within `region`.
fn embedded_refs(layout: &Layout, region: &MemoryRegion, base: u64) -> Result<RefList> {
    let mut out = RefList::new();
    collect_refs(
        layout.descriptors(),
        &|i| base + layout.offset(i as u16),
        region,
        &mut out,
    )?;
    Ok(out)
}

fn collect_refs(
    descriptors: &[FieldDescriptor],
    offsets: &dyn Fn(usize) -> u64,
    region: &MemoryRegion,
    out: &mut RefList,
) -> Result<()> {
    for (i, desc) in descriptors.iter().enumerate() {
        match desc.kind() {
            FieldKind::Object => {
                let addr = Address::from_raw(region.read_u64(offsets(i))?);
                if !addr.is_null() {
                    out.push(addr);
                }
            }
            FieldKind::Value => {
                if let Some(embedded) = desc.embedded() {
                    let base = offsets(i);
                    collect_refs(
                        embedded.descriptors(),
                        &|j| base + embedded.offset(j as u16),
                        region,
                        out,
                    )?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::layout::{LayoutBuilder, Mutability};
    use crate::provider::MmapProvider;
    use tempfile::TempDir;

    fn test_heap(dir: &TempDir) -> Arc<Heap> {
        let provider = Arc::new(MmapProvider::new(
            dir.path().join("heap.strata"),
            4 * 1024 * 1024,
        ));
        let heap = Heap::new(provider, HeapConfig::default()).unwrap();
        heap.open().unwrap();
        heap
    }

    #[test]
    fn test_scalar_field_roundtrip() {
        let dir = TempDir::new().unwrap();
        let heap = test_heap(&dir);

        let mut b = LayoutBuilder::new("obj.scalars");
        let fb = b.byte_field(Mutability::Mutable);
        let fs = b.short_field(Mutability::Mutable);
        let fi = b.int_field(Mutability::Mutable);
        let fl = b.long_field(Mutability::Mutable);
        let ff = b.float_field(Mutability::Mutable);
        let fd = b.double_field(Mutability::Mutable);
        let fc = b.char_field(Mutability::Mutable);
        let fz = b.bool_field(Mutability::Mutable);
        let layout = b.build(heap.registry()).unwrap();

        let obj = PersistentObject::new(&heap, &layout, |o| {
            o.set_byte(&fb, -5)?;
            o.set_short(&fs, 1234)?;
            o.set_int(&fi, -99_999)?;
            o.set_long(&fl, i64::MIN + 1)?;
            o.set_float(&ff, 1.5)?;
            o.set_double(&fd, -2.25)?;
            o.set_char(&fc, 'ß')?;
            o.set_bool(&fz, true)
        })
        .unwrap();

        assert_eq!(obj.get_byte(&fb).unwrap(), -5);
        assert_eq!(obj.get_short(&fs).unwrap(), 1234);
        assert_eq!(obj.get_int(&fi).unwrap(), -99_999);
        assert_eq!(obj.get_long(&fl).unwrap(), i64::MIN + 1);
        assert_eq!(obj.get_float(&ff).unwrap(), 1.5);
        assert_eq!(obj.get_double(&fd).unwrap(), -2.25);
        assert_eq!(obj.get_char(&fc).unwrap(), 'ß');
        assert!(obj.get_bool(&fz).unwrap());
    }

    #[test]
    fn test_write_once_protocol() {
        let dir = TempDir::new().unwrap();
        let heap = test_heap(&dir);

        let mut b = LayoutBuilder::new("obj.frozen");
        let length = b.int_field(Mutability::WriteOnce);
        let layout = b.build(heap.registry()).unwrap();

        let obj = PersistentObject::new(&heap, &layout, |o| {
            o.init_int(&length, 5)?;
            // Second init inside the construction window fails.
            assert!(matches!(
                o.init_int(&length, 9),
                Err(Error::AlreadyInitialized { .. })
            ));
            Ok(())
        })
        .unwrap();

        assert_eq!(obj.get_int(&length).unwrap(), 5);
        // Init after construction fails; set on write-once fails.
        assert!(matches!(
            obj.init_int(&length, 9),
            Err(Error::AlreadyInitialized { .. })
        ));
        assert!(matches!(
            obj.set_int(&length, 9),
            Err(Error::ImmutableField { .. })
        ));
        assert_eq!(obj.get_int(&length).unwrap(), 5);
    }

    #[test]
    fn test_init_on_mutable_field_rejected() {
        let dir = TempDir::new().unwrap();
        let heap = test_heap(&dir);

        let mut b = LayoutBuilder::new("obj.mutonly");
        let f = b.int_field(Mutability::Mutable);
        let layout = b.build(heap.registry()).unwrap();

        let obj = PersistentObject::new(&heap, &layout, |_| Ok(())).unwrap();
        assert!(matches!(
            obj.init_int(&f, 1),
            Err(Error::NotWriteOnce { .. })
        ));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let heap = test_heap(&dir);

        let mut b = LayoutBuilder::new("obj.kinds");
        let fi = b.int_field(Mutability::Mutable);
        let layout = b.build(heap.registry()).unwrap();

        let obj = PersistentObject::new(&heap, &layout, |_| Ok(())).unwrap();
        let wrong = LongField::at(fi.index());
        assert!(matches!(
            obj.get_long(&wrong),
            Err(Error::FieldKindMismatch { .. })
        ));
    }

    #[test]
    fn test_object_reference_roundtrip_and_refcount() {
        let dir = TempDir::new().unwrap();
        let heap = test_heap(&dir);

        let mut b = LayoutBuilder::new("obj.leaf");
        let tagf = b.int_field(Mutability::Mutable);
        let leaf_layout = b.build(heap.registry()).unwrap();

        let mut b = LayoutBuilder::new("obj.holder");
        let child = b.object_field(Mutability::Mutable);
        let holder_layout = b.build(heap.registry()).unwrap();

        let leaf = PersistentObject::new(&heap, &leaf_layout, |o| o.set_int(&tagf, 7)).unwrap();
        let holder = PersistentObject::new(&heap, &holder_layout, |_| Ok(())).unwrap();

        assert!(holder.get_object(&child).unwrap().is_none());
        heap.run_in_transaction(|| holder.set_object(&child, Some(&leaf)))
            .unwrap();
        assert_eq!(leaf.ref_count().unwrap(), 1);

        let back = holder.get_object(&child).unwrap().unwrap();
        assert_eq!(back.address(), leaf.address());
        assert_eq!(back.get_int(&tagf).unwrap(), 7);

        // Clearing the field releases the reference.
        heap.run_in_transaction(|| holder.set_object(&child, None))
            .unwrap();
        assert_eq!(leaf.ref_count().unwrap(), 0);
        assert!(holder.get_object(&child).unwrap().is_none());
    }

    #[test]
    fn test_declared_referent_enforced() {
        let dir = TempDir::new().unwrap();
        let heap = test_heap(&dir);

        let a = LayoutBuilder::new("obj.kind_a").build(heap.registry()).unwrap();
        let other = LayoutBuilder::new("obj.kind_b").build(heap.registry()).unwrap();

        let mut b = LayoutBuilder::new("obj.typed_holder");
        let fld = b.typed_object_field(Mutability::Mutable, a.tag());
        let holder_layout = b.build(heap.registry()).unwrap();

        let wrong = PersistentObject::new(&heap, &other, |_| Ok(())).unwrap();
        let holder = PersistentObject::new(&heap, &holder_layout, |_| Ok(())).unwrap();

        let err = heap.run_in_transaction(|| holder.set_object(&fld, Some(&wrong)));
        assert!(matches!(err, Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn test_value_field_copy_semantics() {
        let dir = TempDir::new().unwrap();
        let heap = test_heap(&dir);

        let mut b = LayoutBuilder::value("obj.point2");
        let x = b.int_field(Mutability::Mutable);
        let y = b.int_field(Mutability::Mutable);
        let point = b.build(heap.registry()).unwrap();

        let mut b = LayoutBuilder::new("obj.shape");
        let origin = b.value_field(Mutability::Mutable, &point).unwrap();
        let shape_layout = b.build(heap.registry()).unwrap();

        let p = PersistentObject::new(&heap, &point, |o| {
            o.set_int(&x, 3)?;
            o.set_int(&y, 4)
        })
        .unwrap();
        assert!(p.region().is_volatile());

        let shape = PersistentObject::new(&heap, &shape_layout, |_| Ok(())).unwrap();
        heap.run_in_transaction(|| shape.set_value(&origin, &p)).unwrap();

        let copy = shape.get_value(&origin).unwrap();
        assert_eq!(copy.get_int(&x).unwrap(), 3);
        assert_eq!(copy.get_int(&y).unwrap(), 4);

        // The read-out copy is private: mutating it leaves the container
        // untouched.
        copy.set_int(&x, 99).unwrap();
        assert_eq!(shape.get_value(&origin).unwrap().get_int(&x).unwrap(), 3);
    }

    #[test]
    fn test_value_object_cannot_be_referenced() {
        let dir = TempDir::new().unwrap();
        let heap = test_heap(&dir);

        let point = LayoutBuilder::value("obj.vpoint").build(heap.registry()).unwrap();
        let mut b = LayoutBuilder::new("obj.refholder");
        let fld = b.object_field(Mutability::Mutable);
        let holder_layout = b.build(heap.registry()).unwrap();

        let v = PersistentObject::new(&heap, &point, |_| Ok(())).unwrap();
        let holder = PersistentObject::new(&heap, &holder_layout, |_| Ok(())).unwrap();
        assert!(matches!(
            heap.run_in_transaction(|| holder.set_object(&fld, Some(&v))),
            Err(Error::ValueBasedReference)
        ));
    }

    #[test]
    fn test_outgoing_refs_sees_embedded_references() {
        let dir = TempDir::new().unwrap();
        let heap = test_heap(&dir);

        let mut b = LayoutBuilder::value("obj.vref");
        let inner = b.object_field(Mutability::Mutable);
        let vref = b.build(heap.registry()).unwrap();

        let mut b = LayoutBuilder::new("obj.vref_holder");
        let emb = b.value_field(Mutability::Mutable, &vref).unwrap();
        let holder_layout = b.build(heap.registry()).unwrap();

        let target = LayoutBuilder::new("obj.vref_target").build(heap.registry()).unwrap();
        let t = PersistentObject::new(&heap, &target, |_| Ok(())).unwrap();

        let v = PersistentObject::new(&heap, &vref, |_| Ok(())).unwrap();
        v.set_object(&inner, Some(&t)).unwrap();
        let holder = PersistentObject::new(&heap, &holder_layout, |_| Ok(())).unwrap();
        heap.run_in_transaction(|| holder.set_value(&emb, &v)).unwrap();

        let refs = outgoing_refs(&holder_layout, holder.region()).unwrap();
        assert_eq!(refs.as_slice(), &[t.address()]);
    }

    #[test]
    fn test_embedded_reference_counts_as_retained() {
        let dir = TempDir::new().unwrap();
        let heap = test_heap(&dir);

        let mut b = LayoutBuilder::value("obj.edge");
        let inner = b.object_field(Mutability::Mutable);
        let edge = b.build(heap.registry()).unwrap();

        let mut b = LayoutBuilder::new("obj.edge_holder");
        let emb = b.value_field(Mutability::Mutable, &edge).unwrap();
        let holder_layout = b.build(heap.registry()).unwrap();

        let target = LayoutBuilder::new("obj.edge_target").build(heap.registry()).unwrap();
        let t = PersistentObject::new(&heap, &target, |_| Ok(())).unwrap();

        // A scratch value holding the reference does not count.
        let v = PersistentObject::new(&heap, &edge, |_| Ok(())).unwrap();
        v.set_object(&inner, Some(&t)).unwrap();
        assert_eq!(t.ref_count().unwrap(), 0);

        // Each embedding into persistent storage counts as one edge.
        let h1 = PersistentObject::new(&heap, &holder_layout, |_| Ok(())).unwrap();
        let h2 = PersistentObject::new(&heap, &holder_layout, |_| Ok(())).unwrap();
        heap.run_in_transaction(|| h1.set_value(&emb, &v)).unwrap();
        heap.run_in_transaction(|| h2.set_value(&emb, &v)).unwrap();
        assert_eq!(t.ref_count().unwrap(), 2);

        // Overwriting an embedding releases the reference it held.
        let blank = PersistentObject::new(&heap, &edge, |_| Ok(())).unwrap();
        heap.run_in_transaction(|| h1.set_value(&emb, &blank)).unwrap();
        assert_eq!(t.ref_count().unwrap(), 1);
    }

    #[test]
    fn test_drop_of_unreferenced_object_frees_in_transaction() {
        let dir = TempDir::new().unwrap();
        let heap = test_heap(&dir);

        let layout = LayoutBuilder::new("obj.transient").build(heap.registry()).unwrap();
        let obj = PersistentObject::new(&heap, &layout, |_| Ok(())).unwrap();

        let before = heap.stats();
        drop(obj);
        let after = heap.stats();
        assert_eq!(after.regions_freed, before.regions_freed + 1);
        // The drop-path free commits its own transaction.
        assert!(after.txn_commits > before.txn_commits);
    }
}
