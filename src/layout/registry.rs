//! Type tags and the tag-to-layout registry.
//!
//! Every heap-resident object's header records a [`TypeTag`]; the registry
//! maps that tag back to the [`Layout`] needed to reinterpret the object's
//! bytes after a restart. This explicit registry is the dispatch mechanism
//! that replaces runtime reflection: it is populated at layout-definition
//! time and consulted by the object cache on every reconstruction.
//!
//! Tags are derived from the layout name with 32-bit FNV-1a so they are
//! stable across process restarts — a header written in one session
//! resolves in the next as long as the application registers the same
//! layout names.

use crate::error::{Error, Result};
use crate::layout::Layout;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Type tag
// =============================================================================

/// Restart-stable identifier for a registered layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(u32);

impl TypeTag {
    /// Tag 0 is reserved: it marks an uninitialized header.
    pub const INVALID: TypeTag = TypeTag(0);

    /// Derive the tag for a layout name (32-bit FNV-1a, never 0).
    pub fn from_name(name: &str) -> TypeTag {
        const FNV_OFFSET: u32 = 0x811c_9dc5;
        const FNV_PRIME: u32 = 0x0100_0193;
        let mut hash = FNV_OFFSET;
        for b in name.bytes() {
            hash ^= b as u32;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        if hash == 0 {
            hash = FNV_OFFSET;
        }
        TypeTag(hash)
    }

    /// Wrap a raw tag value (as read from an object header).
    #[inline]
    pub const fn from_raw(raw: u32) -> TypeTag {
        TypeTag(raw)
    }

    /// Raw tag value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({:#010x})", self.0)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Per-heap registry mapping type tags to layouts.
///
/// Layouts are registered once, at definition time, and are immutable
/// afterwards. Lookup is on the hot path of every cache reconstruction.
pub struct TypeRegistry {
    types: RwLock<FxHashMap<TypeTag, Arc<Layout>>>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            types: RwLock::new(FxHashMap::default()),
        }
    }

    /// Register a layout under its tag.
    ///
    /// Fails if the tag is already taken — either the same name was
    /// registered twice, or two distinct names collide (rename one).
    pub fn register(&self, layout: Arc<Layout>) -> Result<()> {
        let mut types = self.types.write();
        if let Some(existing) = types.get(&layout.tag()) {
            if existing.name() == layout.name() {
                return Err(Error::Layout(format!(
                    "layout '{}' is already registered",
                    layout.name()
                )));
            }
            return Err(Error::Layout(format!(
                "type tag collision between '{}' and '{}'",
                existing.name(),
                layout.name()
            )));
        }
        types.insert(layout.tag(), layout);
        Ok(())
    }

    /// Look up a layout by tag.
    #[inline]
    pub fn get(&self, tag: TypeTag) -> Option<Arc<Layout>> {
        self.types.read().get(&tag).cloned()
    }

    /// Check whether a tag is registered.
    #[inline]
    pub fn contains(&self, tag: TypeTag) -> bool {
        self.types.read().contains_key(&tag)
    }

    /// Number of registered layouts.
    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    /// Check whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LayoutBuilder;

    #[test]
    fn test_tag_stability() {
        assert_eq!(TypeTag::from_name("point"), TypeTag::from_name("point"));
        assert_ne!(TypeTag::from_name("point"), TypeTag::from_name("point3"));
        assert_ne!(TypeTag::from_name("anything").raw(), 0);
    }

    #[test]
    fn test_register_and_get() {
        let registry = TypeRegistry::new();
        assert!(registry.is_empty());

        let layout = LayoutBuilder::new("reg.point").build(&registry).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(layout.tag()));

        let back = registry.get(layout.tag()).unwrap();
        assert_eq!(back.name(), "reg.point");
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = TypeRegistry::new();
        LayoutBuilder::new("reg.dup").build(&registry).unwrap();
        let err = LayoutBuilder::new("reg.dup").build(&registry);
        assert!(err.is_err());
    }

    #[test]
    fn test_unknown_tag_is_none() {
        let registry = TypeRegistry::new();
        assert!(registry.get(TypeTag::from_name("ghost")).is_none());
    }
}
