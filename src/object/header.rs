//! Object header: the fixed prefix of every heap-resident object.
//!
//! ```text
//! offset 0   type tag (u32)     resolves the layout via the TypeRegistry
//! offset 4   ref count (u32)    persistent references to this object
//! offset 8   flags (u32)
//! offset 12  reserved (u32)
//! offset 16  first field
//! ```
//!
//! Value-based objects have no header — they are embedded bytes with no
//! independent identity, reference count, or cache entry. The header
//! bytes are part of the durable format and must not move between
//! versions.

use crate::error::Result;
use crate::layout::TypeTag;
use crate::region::MemoryRegion;
use bitflags::bitflags;

/// Size of the header prefix in bytes.
pub const HEADER_SIZE: u64 = 16;

/// Offset of the type tag within the header.
pub(crate) const TYPE_TAG_OFFSET: u64 = 0;

/// Offset of the reference count within the header.
pub(crate) const REF_COUNT_OFFSET: u64 = 4;

/// Offset of the flags word within the header.
pub(crate) const FLAGS_OFFSET: u64 = 8;

bitflags! {
    /// Durable per-object flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct HeaderFlags: u32 {
        /// The object is infrastructure (the heap's root block) and is
        /// never reclaimed, by count or by the collector.
        const PINNED = 1 << 0;
    }
}

/// Read the type tag from an object region.
pub(crate) fn read_tag(region: &MemoryRegion) -> Result<TypeTag> {
    Ok(TypeTag::from_raw(region.read_u32(TYPE_TAG_OFFSET)?))
}

/// Read the persistent reference count from an object region.
pub(crate) fn read_ref_count(region: &MemoryRegion) -> Result<u32> {
    region.read_u32(REF_COUNT_OFFSET)
}

/// Read the header flags from an object region. Unknown bits from a
/// newer format version are dropped.
pub(crate) fn read_flags(region: &MemoryRegion) -> Result<HeaderFlags> {
    Ok(HeaderFlags::from_bits_truncate(
        region.read_u32(FLAGS_OFFSET)?,
    ))
}

/// Write the header flags of an object region.
pub(crate) fn write_flags(region: &MemoryRegion, flags: HeaderFlags) -> Result<()> {
    region.write_u32(FLAGS_OFFSET, flags.bits())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_field_offsets_do_not_overlap() {
        assert!(TYPE_TAG_OFFSET + 4 <= REF_COUNT_OFFSET);
        assert!(REF_COUNT_OFFSET + 4 <= FLAGS_OFFSET);
        assert!(FLAGS_OFFSET + 4 <= HEADER_SIZE);
    }

    #[test]
    fn test_flags_roundtrip() {
        let region = MemoryRegion::volatile(HEADER_SIZE);
        assert!(read_flags(&region).unwrap().is_empty());
        write_flags(&region, HeaderFlags::PINNED).unwrap();
        assert!(read_flags(&region).unwrap().contains(HeaderFlags::PINNED));
    }

    #[test]
    fn test_read_header_from_region() {
        let region = MemoryRegion::volatile(HEADER_SIZE);
        region.write_u32(TYPE_TAG_OFFSET, 0xDEAD_BEEF).unwrap();
        region.write_u32(REF_COUNT_OFFSET, 3).unwrap();
        assert_eq!(read_tag(&region).unwrap().raw(), 0xDEAD_BEEF);
        assert_eq!(read_ref_count(&region).unwrap(), 3);
    }
}
