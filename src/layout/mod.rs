//! Object layouts: reflection-free binary layout computation.
//!
//! A [`Layout`] is the compiled description of one object kind: an ordered
//! list of field descriptors, a flat table of byte offsets computed once at
//! definition time, and the total allocation size. Extension is append-only
//! composition: an extended layout copies its base's descriptors as an
//! unchanged prefix, so a value typed as the base can reinterpret a region
//! allocated with the extension — the base's fields occupy identical
//! offsets by construction.
//!
//! # Offset computation
//!
//! ```text
//! heap-resident layout            value-based layout
//! ┌──────────────┐ offset 0       ┌────────────┐ offset 0
//! │ header (16B) │                │ field 0    │
//! ├──────────────┤ offset 16      ├────────────┤
//! │ field 0      │                │ field 1    │
//! ├──────────────┤                └────────────┘
//! │ field 1      │
//! └──────────────┘
//! ```
//!
//! `offset[0]` is the header size (0 for value-based layouts) and
//! `offset[i] = offset[i-1] + size(field[i-1])`; fields are packed at their
//! natural widths with no further padding. This byte layout is the durable
//! format.
//!
//! Layouts are created once per object kind at startup, registered in the
//! [`TypeRegistry`](crate::layout::TypeRegistry), and immutable afterwards.

mod registry;

pub use registry::{TypeRegistry, TypeTag};

use crate::error::{Error, Result};
use crate::object::header::HEADER_SIZE;
use std::sync::Arc;

// =============================================================================
// Field kinds and descriptors
// =============================================================================

/// Kind of a persistent field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// 1-byte signed integer.
    Byte,
    /// 2-byte signed integer.
    Short,
    /// 4-byte signed integer.
    Int,
    /// 8-byte signed integer.
    Long,
    /// 4-byte IEEE float.
    Float,
    /// 8-byte IEEE double.
    Double,
    /// Unicode scalar, stored as a 4-byte code point.
    Char,
    /// Boolean, stored as one byte.
    Bool,
    /// Heap reference, stored as the 8-byte address of the referent
    /// (0 = unset).
    Object,
    /// Value-based object embedded inline at the field's offset.
    Value,
}

/// Whether a field may be reassigned after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    /// Freely reassignable through `set_*` (inside a transaction).
    Mutable,
    /// Set exactly once through `init_*` during construction; a true
    /// constant thereafter, safely readable without synchronization.
    WriteOnce,
}

/// Compiled description of a single field.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    kind: FieldKind,
    mutability: Mutability,
    /// Declared referent layout for [`FieldKind::Object`] fields.
    /// `None` accepts any heap-resident object.
    referent: Option<TypeTag>,
    /// Embedded layout for [`FieldKind::Value`] fields.
    embedded: Option<Arc<Layout>>,
}

impl FieldDescriptor {
    /// Field kind.
    #[inline]
    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Field mutability.
    #[inline]
    pub fn mutability(&self) -> Mutability {
        self.mutability
    }

    /// Declared referent tag, for object-reference fields.
    #[inline]
    pub fn referent(&self) -> Option<TypeTag> {
        self.referent
    }

    /// Embedded value layout, for value fields.
    #[inline]
    pub fn embedded(&self) -> Option<&Arc<Layout>> {
        self.embedded.as_ref()
    }

    /// Stored size of this field in bytes.
    pub fn size(&self) -> u64 {
        match self.kind {
            FieldKind::Byte | FieldKind::Bool => 1,
            FieldKind::Short => 2,
            FieldKind::Int | FieldKind::Float | FieldKind::Char => 4,
            FieldKind::Long | FieldKind::Double | FieldKind::Object => 8,
            FieldKind::Value => self
                .embedded
                .as_ref()
                .map(|l| l.allocation_size())
                .unwrap_or(0),
        }
    }
}

// =============================================================================
// Typed field handles
// =============================================================================

macro_rules! field_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            index: u16,
        }

        impl $name {
            #[inline]
            pub(crate) fn at(index: u16) -> Self {
                Self { index }
            }

            /// Index of this field within its layout.
            #[inline]
            pub fn index(&self) -> u16 {
                self.index
            }
        }
    };
}

field_handle!(
    /// Handle to a byte field.
    ByteField
);
field_handle!(
    /// Handle to a short field.
    ShortField
);
field_handle!(
    /// Handle to an int field.
    IntField
);
field_handle!(
    /// Handle to a long field.
    LongField
);
field_handle!(
    /// Handle to a float field.
    FloatField
);
field_handle!(
    /// Handle to a double field.
    DoubleField
);
field_handle!(
    /// Handle to a char field.
    CharField
);
field_handle!(
    /// Handle to a boolean field.
    BoolField
);
field_handle!(
    /// Handle to an object-reference field.
    ObjectField
);
field_handle!(
    /// Handle to an embedded value field.
    ValueField
);

// =============================================================================
// Layout
// =============================================================================

/// The compiled layout of one object kind.
pub struct Layout {
    name: String,
    tag: TypeTag,
    fields: Vec<FieldDescriptor>,
    offsets: Vec<u64>,
    size: u64,
    base: Option<Arc<Layout>>,
    base_index: u16,
    value_based: bool,
}

impl Layout {
    /// Layout name (unique per heap).
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Restart-stable type tag.
    #[inline]
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// Total bytes an instance occupies, including the header for
    /// heap-resident layouts.
    #[inline]
    pub fn allocation_size(&self) -> u64 {
        self.size
    }

    /// Number of fields, including inherited ones.
    #[inline]
    pub fn field_count(&self) -> u16 {
        self.fields.len() as u16
    }

    /// Index of the first field this layout itself declared (fields below
    /// this index came from the base chain).
    #[inline]
    pub fn base_index(&self) -> u16 {
        self.base_index
    }

    /// The layout this one extends, if any.
    #[inline]
    pub fn base(&self) -> Option<&Arc<Layout>> {
        self.base.as_ref()
    }

    /// Whether instances embed inline instead of living on the heap.
    #[inline]
    pub fn is_value_based(&self) -> bool {
        self.value_based
    }

    /// Byte offset of field `index` from the start of the region.
    #[inline]
    pub fn offset(&self, index: u16) -> u64 {
        self.offsets[index as usize]
    }

    /// Descriptor for field `index`.
    #[inline]
    pub fn descriptor(&self, index: u16) -> &FieldDescriptor {
        &self.fields[index as usize]
    }

    /// All descriptors in declaration order.
    pub fn descriptors(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Whether this layout is `tag` or extends a layout with that tag.
    pub fn is_a(&self, tag: TypeTag) -> bool {
        if self.tag == tag {
            return true;
        }
        match &self.base {
            Some(base) => base.is_a(tag),
            None => false,
        }
    }
}

impl std::fmt::Debug for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layout")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("fields", &self.fields.len())
            .field("size", &self.size)
            .field("value_based", &self.value_based)
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder assembling a [`Layout`] from field declarations.
///
/// Field-declaration methods return typed handles that remain valid for
/// any layout extending this one (extension never moves earlier fields).
pub struct LayoutBuilder {
    name: String,
    base: Option<Arc<Layout>>,
    value_based: bool,
    fields: Vec<FieldDescriptor>,
}

impl LayoutBuilder {
    /// Start a heap-resident layout with no base. Instances carry the
    /// object header.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            value_based: false,
            fields: Vec::new(),
        }
    }

    /// Start a layout extending `base`, appending fields after the base's.
    pub fn extending(name: impl Into<String>, base: &Arc<Layout>) -> Self {
        Self {
            name: name.into(),
            base: Some(Arc::clone(base)),
            value_based: base.value_based,
            fields: Vec::new(),
        }
    }

    /// Start a value-based layout: instances embed inline in a container's
    /// region (or copy into private scratch when read out) and are never
    /// independently allocated, cached, or reference counted.
    pub fn value(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            value_based: true,
            fields: Vec::new(),
        }
    }

    fn base_count(&self) -> u16 {
        self.base.as_ref().map_or(0, |b| b.field_count())
    }

    fn push(&mut self, desc: FieldDescriptor) -> u16 {
        let index = self.base_count() + self.fields.len() as u16;
        self.fields.push(desc);
        index
    }

    fn push_scalar(&mut self, kind: FieldKind, mutability: Mutability) -> u16 {
        self.push(FieldDescriptor {
            kind,
            mutability,
            referent: None,
            embedded: None,
        })
    }

    /// Declare a byte field.
    pub fn byte_field(&mut self, mutability: Mutability) -> ByteField {
        ByteField::at(self.push_scalar(FieldKind::Byte, mutability))
    }

    /// Declare a short field.
    pub fn short_field(&mut self, mutability: Mutability) -> ShortField {
        ShortField::at(self.push_scalar(FieldKind::Short, mutability))
    }

    /// Declare an int field.
    pub fn int_field(&mut self, mutability: Mutability) -> IntField {
        IntField::at(self.push_scalar(FieldKind::Int, mutability))
    }

    /// Declare a long field.
    pub fn long_field(&mut self, mutability: Mutability) -> LongField {
        LongField::at(self.push_scalar(FieldKind::Long, mutability))
    }

    /// Declare a float field.
    pub fn float_field(&mut self, mutability: Mutability) -> FloatField {
        FloatField::at(self.push_scalar(FieldKind::Float, mutability))
    }

    /// Declare a double field.
    pub fn double_field(&mut self, mutability: Mutability) -> DoubleField {
        DoubleField::at(self.push_scalar(FieldKind::Double, mutability))
    }

    /// Declare a char field.
    pub fn char_field(&mut self, mutability: Mutability) -> CharField {
        CharField::at(self.push_scalar(FieldKind::Char, mutability))
    }

    /// Declare a boolean field.
    pub fn bool_field(&mut self, mutability: Mutability) -> BoolField {
        BoolField::at(self.push_scalar(FieldKind::Bool, mutability))
    }

    /// Declare an object-reference field accepting any heap-resident
    /// object.
    pub fn object_field(&mut self, mutability: Mutability) -> ObjectField {
        ObjectField::at(self.push(FieldDescriptor {
            kind: FieldKind::Object,
            mutability,
            referent: None,
            embedded: None,
        }))
    }

    /// Declare an object-reference field restricted to objects whose
    /// layout is (or extends) the one registered under `tag`.
    pub fn typed_object_field(&mut self, mutability: Mutability, tag: TypeTag) -> ObjectField {
        ObjectField::at(self.push(FieldDescriptor {
            kind: FieldKind::Object,
            mutability,
            referent: Some(tag),
            embedded: None,
        }))
    }

    /// Declare an object-reference field whose declared type is the layout
    /// under construction (recursive type: a list node pointing at the
    /// next node). The tag resolves from the builder's own name, so the
    /// layout need not be finalized yet.
    pub fn self_object_field(&mut self, mutability: Mutability) -> ObjectField {
        let tag = TypeTag::from_name(&self.name);
        self.typed_object_field(mutability, tag)
    }

    /// Declare a field embedding `layout` inline. The embedded layout must
    /// be value-based.
    pub fn value_field(
        &mut self,
        mutability: Mutability,
        layout: &Arc<Layout>,
    ) -> Result<ValueField> {
        if !layout.is_value_based() {
            return Err(Error::Layout(format!(
                "cannot embed heap-resident layout '{}'; only value-based layouts embed inline",
                layout.name()
            )));
        }
        Ok(ValueField::at(self.push(FieldDescriptor {
            kind: FieldKind::Value,
            mutability,
            referent: None,
            embedded: Some(Arc::clone(layout)),
        })))
    }

    /// Compute offsets and total size, validate declared type references,
    /// and register the finished layout.
    pub fn build(self, registry: &TypeRegistry) -> Result<Arc<Layout>> {
        let tag = TypeTag::from_name(&self.name);

        // Declared referents must resolve now — to an already-registered
        // layout or to this layout itself (one level of self-reference).
        for (i, desc) in self.fields.iter().enumerate() {
            if let Some(referent) = desc.referent {
                if referent != tag && !registry.contains(referent) {
                    return Err(Error::Layout(format!(
                        "field {} of '{}' references unregistered type {:?}",
                        self.base_count() as usize + i,
                        self.name,
                        referent
                    )));
                }
            }
        }

        let (mut fields, base_index) = match &self.base {
            Some(base) => (base.fields.clone(), base.field_count()),
            None => (Vec::new(), 0),
        };
        fields.extend(self.fields);

        if fields.len() > u16::MAX as usize {
            return Err(Error::Layout(format!(
                "layout '{}' declares too many fields",
                self.name
            )));
        }

        let mut offsets = Vec::with_capacity(fields.len());
        let mut size = if self.value_based { 0 } else { HEADER_SIZE };
        for desc in &fields {
            offsets.push(size);
            size += desc.size();
        }

        let layout = Arc::new(Layout {
            name: self.name,
            tag,
            fields,
            offsets,
            size,
            base: self.base,
            base_index,
            value_based: self.value_based,
        });
        registry.register(Arc::clone(&layout))?;
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::header::HEADER_SIZE;

    fn registry() -> TypeRegistry {
        TypeRegistry::new()
    }

    #[test]
    fn test_empty_layout_is_header_only() {
        let reg = registry();
        let layout = LayoutBuilder::new("t.empty").build(&reg).unwrap();
        assert_eq!(layout.allocation_size(), HEADER_SIZE);
        assert_eq!(layout.field_count(), 0);
        assert!(!layout.is_value_based());
    }

    #[test]
    fn test_offsets_are_packed_after_header() {
        let reg = registry();
        let mut b = LayoutBuilder::new("t.mixed");
        let byte = b.byte_field(Mutability::Mutable);
        let long = b.long_field(Mutability::Mutable);
        let short = b.short_field(Mutability::Mutable);
        let obj = b.object_field(Mutability::Mutable);
        let layout = b.build(&reg).unwrap();

        assert_eq!(layout.offset(byte.index()), HEADER_SIZE);
        assert_eq!(layout.offset(long.index()), HEADER_SIZE + 1);
        assert_eq!(layout.offset(short.index()), HEADER_SIZE + 9);
        assert_eq!(layout.offset(obj.index()), HEADER_SIZE + 11);
        assert_eq!(layout.allocation_size(), HEADER_SIZE + 19);
    }

    #[test]
    fn test_extension_preserves_base_offsets() {
        let reg = registry();
        let mut b = LayoutBuilder::new("t.base");
        let x = b.int_field(Mutability::Mutable);
        let y = b.double_field(Mutability::WriteOnce);
        let base = b.build(&reg).unwrap();

        let mut b = LayoutBuilder::extending("t.derived", &base);
        let z = b.long_field(Mutability::Mutable);
        let derived = b.build(&reg).unwrap();

        // Append-only extension invariant.
        for i in 0..base.field_count() {
            assert_eq!(base.offset(i), derived.offset(i));
        }
        assert_eq!(derived.base_index(), 2);
        assert_eq!(derived.field_count(), 3);
        assert_eq!(derived.offset(z.index()), base.allocation_size());
        assert_eq!(derived.offset(x.index()), base.offset(x.index()));
        assert_eq!(
            derived.descriptor(y.index()).mutability(),
            Mutability::WriteOnce
        );
        assert!(derived.is_a(base.tag()));
        assert!(!base.is_a(derived.tag()));
    }

    #[test]
    fn test_value_layout_has_no_header() {
        let reg = registry();
        let mut b = LayoutBuilder::value("t.rgb");
        let r = b.byte_field(Mutability::Mutable);
        let g = b.byte_field(Mutability::Mutable);
        let bl = b.byte_field(Mutability::Mutable);
        let layout = b.build(&reg).unwrap();

        assert!(layout.is_value_based());
        assert_eq!(layout.offset(r.index()), 0);
        assert_eq!(layout.offset(g.index()), 1);
        assert_eq!(layout.offset(bl.index()), 2);
        assert_eq!(layout.allocation_size(), 3);
    }

    #[test]
    fn test_embedding_heap_layout_rejected() {
        let reg = registry();
        let heap_layout = LayoutBuilder::new("t.heapkind").build(&reg).unwrap();
        let mut b = LayoutBuilder::new("t.container");
        assert!(b.value_field(Mutability::Mutable, &heap_layout).is_err());
    }

    #[test]
    fn test_value_field_embeds_size() {
        let reg = registry();
        let mut b = LayoutBuilder::value("t.pair");
        b.int_field(Mutability::Mutable);
        b.int_field(Mutability::Mutable);
        let pair = b.build(&reg).unwrap();

        let mut b = LayoutBuilder::new("t.holder");
        let before = b.long_field(Mutability::Mutable);
        let embedded = b.value_field(Mutability::Mutable, &pair).unwrap();
        let after = b.byte_field(Mutability::Mutable);
        let holder = b.build(&reg).unwrap();

        assert_eq!(holder.offset(before.index()), HEADER_SIZE);
        assert_eq!(holder.offset(embedded.index()), HEADER_SIZE + 8);
        assert_eq!(holder.offset(after.index()), HEADER_SIZE + 8 + 8);
    }

    #[test]
    fn test_self_reference_resolves() {
        let reg = registry();
        let mut b = LayoutBuilder::new("t.node");
        let _value = b.long_field(Mutability::Mutable);
        let next = b.self_object_field(Mutability::Mutable);
        let layout = b.build(&reg).unwrap();

        assert_eq!(
            layout.descriptor(next.index()).referent(),
            Some(layout.tag())
        );
    }

    #[test]
    fn test_unregistered_referent_rejected() {
        let reg = registry();
        let mut b = LayoutBuilder::new("t.bad");
        b.typed_object_field(Mutability::Mutable, TypeTag::from_name("t.missing"));
        assert!(matches!(b.build(&reg), Err(Error::Layout(_))));
    }

    #[test]
    fn test_registered_referent_accepted() {
        let reg = registry();
        let target = LayoutBuilder::new("t.target").build(&reg).unwrap();
        let mut b = LayoutBuilder::new("t.pointer");
        b.typed_object_field(Mutability::Mutable, target.tag());
        assert!(b.build(&reg).is_ok());
    }
}
