//! Raw region provider boundary.
//!
//! The heap is a client of this boundary, not its implementer: a provider
//! hands out opaque addresses inside a byte-addressable persistence region
//! and performs raw reads, writes, and flushes against them. The default
//! implementation is the file-backed [`MmapProvider`]; tests may supply
//! their own.
//!
//! Addresses are opaque `u64` keys (see [`Address`]); address 0 is the
//! null sentinel and is never handed out.

mod mmap;

pub use mmap::MmapProvider;

use crate::error::Result;
use crate::region::Address;

/// Capability handed to the heap for raw persistent-memory access.
///
/// All methods take `&self`; implementations synchronize internally.
/// Allocated blocks are zero-filled, so an object field reads as the
/// "unset" sentinel until first written.
pub trait RegionProvider: Send + Sync {
    /// Open (or create) the persistence region. Idempotent.
    fn open(&self) -> Result<()>;

    /// Close the region, flushing outstanding writes. Idempotent.
    fn close(&self) -> Result<()>;

    /// Allocate a zeroed block of `size` bytes and return its address.
    fn allocate(&self, size: u64) -> Result<Address>;

    /// Release a block previously returned by [`RegionProvider::allocate`].
    fn free(&self, addr: Address) -> Result<()>;

    /// Size in bytes of the block at `addr`.
    fn size_of(&self, addr: Address) -> Result<u64>;

    /// Read `buf.len()` bytes from `addr + offset`.
    fn read(&self, addr: Address, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` at `addr + offset`. Not durable until flushed.
    fn write(&self, addr: Address, offset: u64, buf: &[u8]) -> Result<()>;

    /// Copy `len` bytes between blocks, handling overlap.
    fn copy(
        &self,
        src: Address,
        src_off: u64,
        dst: Address,
        dst_off: u64,
        len: u64,
    ) -> Result<()>;

    /// Durably flush the whole region.
    fn flush(&self) -> Result<()>;

    /// Durably flush `len` bytes starting at `addr + offset`.
    fn flush_range(&self, addr: Address, offset: u64, len: u64) -> Result<()>;

    /// Address stored in the provider's single durable metadata slot, or
    /// [`Address::NULL`] if never set. The heap bootstraps its root object
    /// from this slot after a restart.
    fn meta_address(&self) -> Result<Address>;

    /// Durably record `addr` in the metadata slot.
    fn set_meta_address(&self, addr: Address) -> Result<()>;
}
