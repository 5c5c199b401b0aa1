//! Memory regions and opaque persistent addresses.
//!
//! A [`MemoryRegion`] is a thin, comparable handle over a contiguous byte
//! range: a base [`Address`] plus bounds-checked typed accessors at an
//! offset. It carries no ownership or lifecycle logic — the heap's address
//! table owns persistent regions until they are freed.
//!
//! Two backings exist: persistent regions delegate to the
//! [`RegionProvider`], and volatile scratch regions wrap a private byte
//! buffer. Scratch regions back the private copies handed out for
//! value-based (embedded) objects and are never durable.

use crate::error::{Error, Result};
use crate::provider::RegionProvider;
use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// Address
// =============================================================================

/// Opaque key into the persistence region.
///
/// Address 0 is the null sentinel: an object-reference field holding 0
/// reads as "no value". Volatile scratch regions receive synthetic
/// addresses in a reserved high range so handles stay comparable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(u64);

impl Address {
    /// The null sentinel.
    pub const NULL: Address = Address(0);

    /// First synthetic address handed to volatile scratch regions.
    pub(crate) const VOLATILE_BASE: u64 = 1 << 62;

    /// Wrap a raw address value.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Address(raw)
    }

    /// Raw address value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check for the null sentinel.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check whether this is a synthetic volatile address.
    #[inline]
    pub(crate) const fn is_volatile(self) -> bool {
        self.0 >= Self::VOLATILE_BASE
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Address(NULL)")
        } else if self.is_volatile() {
            write!(f, "Address(volatile:{:#x})", self.0)
        } else {
            write!(f, "Address({:#x})", self.0)
        }
    }
}

// =============================================================================
// Memory region
// =============================================================================

/// Counter for synthetic volatile addresses.
static NEXT_VOLATILE: AtomicU64 = AtomicU64::new(Address::VOLATILE_BASE);

enum Storage {
    Persistent(Arc<dyn RegionProvider>),
    Volatile(Mutex<Box<[u8]>>),
}

/// A handle to a contiguous byte range inside the persistent address space
/// (or a private volatile scratch buffer).
///
/// Identity is the base address: two region handles compare equal exactly
/// when they name the same address.
pub struct MemoryRegion {
    addr: Address,
    size: u64,
    storage: Storage,
}

impl MemoryRegion {
    /// Wrap an allocated persistent block.
    pub(crate) fn persistent(
        addr: Address,
        size: u64,
        provider: Arc<dyn RegionProvider>,
    ) -> Self {
        Self {
            addr,
            size,
            storage: Storage::Persistent(provider),
        }
    }

    /// Create a private zeroed scratch region of `size` bytes.
    pub(crate) fn volatile(size: u64) -> Self {
        let addr = Address::from_raw(NEXT_VOLATILE.fetch_add(1, Ordering::Relaxed));
        Self {
            addr,
            size,
            storage: Storage::Volatile(Mutex::new(vec![0u8; size as usize].into_boxed_slice())),
        }
    }

    /// Base address of this region.
    #[inline]
    pub fn address(&self) -> Address {
        self.addr
    }

    /// Size of this region in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether this is a private scratch region rather than persistent
    /// storage.
    #[inline]
    pub fn is_volatile(&self) -> bool {
        matches!(self.storage, Storage::Volatile(_))
    }

    #[inline]
    fn check(&self, offset: u64, len: u64) -> Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(Error::OutOfBounds {
                offset,
                len,
                size: self.size,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Raw byte access
    // =========================================================================

    /// Read `buf.len()` bytes starting at `offset`.
    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len() as u64)?;
        match &self.storage {
            Storage::Persistent(p) => p.read(self.addr, offset, buf),
            Storage::Volatile(bytes) => {
                let bytes = bytes.lock();
                let start = offset as usize;
                buf.copy_from_slice(&bytes[start..start + buf.len()]);
                Ok(())
            }
        }
    }

    /// Write `buf` starting at `offset`.
    ///
    /// Callers wanting crash atomicity must log the write through the
    /// active transaction first; this is the raw primitive beneath that.
    pub fn write_bytes(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check(offset, buf.len() as u64)?;
        match &self.storage {
            Storage::Persistent(p) => p.write(self.addr, offset, buf),
            Storage::Volatile(bytes) => {
                let mut bytes = bytes.lock();
                let start = offset as usize;
                bytes[start..start + buf.len()].copy_from_slice(buf);
                Ok(())
            }
        }
    }

    // =========================================================================
    // Typed access
    // =========================================================================

    /// Read a byte (i8) at `offset`.
    pub fn read_byte(&self, offset: u64) -> Result<i8> {
        let mut b = [0u8; 1];
        self.read_bytes(offset, &mut b)?;
        Ok(b[0] as i8)
    }

    /// Read a short (i16) at `offset`.
    pub fn read_short(&self, offset: u64) -> Result<i16> {
        let mut b = [0u8; 2];
        self.read_bytes(offset, &mut b)?;
        Ok(i16::from_le_bytes(b))
    }

    /// Read an int (i32) at `offset`.
    pub fn read_int(&self, offset: u64) -> Result<i32> {
        let mut b = [0u8; 4];
        self.read_bytes(offset, &mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    /// Read a long (i64) at `offset`.
    pub fn read_long(&self, offset: u64) -> Result<i64> {
        let mut b = [0u8; 8];
        self.read_bytes(offset, &mut b)?;
        Ok(i64::from_le_bytes(b))
    }

    /// Read an unsigned 32-bit value at `offset` (header bookkeeping).
    pub(crate) fn read_u32(&self, offset: u64) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_bytes(offset, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Read an unsigned 64-bit value at `offset` (stored addresses).
    pub(crate) fn read_u64(&self, offset: u64) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_bytes(offset, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    /// Read a float at `offset`.
    pub fn read_float(&self, offset: u64) -> Result<f32> {
        let mut b = [0u8; 4];
        self.read_bytes(offset, &mut b)?;
        Ok(f32::from_le_bytes(b))
    }

    /// Read a double at `offset`.
    pub fn read_double(&self, offset: u64) -> Result<f64> {
        let mut b = [0u8; 8];
        self.read_bytes(offset, &mut b)?;
        Ok(f64::from_le_bytes(b))
    }

    /// Read a char (stored as a u32 code point) at `offset`.
    pub fn read_char(&self, offset: u64) -> Result<char> {
        let code = self.read_u32(offset)?;
        char::from_u32(code)
            .ok_or_else(|| Error::Corrupt(format!("invalid char code point {:#x}", code)))
    }

    /// Read a boolean (stored as one byte) at `offset`.
    pub fn read_bool(&self, offset: u64) -> Result<bool> {
        Ok(self.read_byte(offset)? != 0)
    }

    /// Write a byte at `offset`.
    pub fn write_byte(&self, offset: u64, value: i8) -> Result<()> {
        self.write_bytes(offset, &[value as u8])
    }

    /// Write a short at `offset`.
    pub fn write_short(&self, offset: u64, value: i16) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Write an int at `offset`.
    pub fn write_int(&self, offset: u64, value: i32) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Write a long at `offset`.
    pub fn write_long(&self, offset: u64, value: i64) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Write an unsigned 32-bit value at `offset`.
    pub(crate) fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Write an unsigned 64-bit value at `offset`.
    pub(crate) fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Write a float at `offset`.
    pub fn write_float(&self, offset: u64, value: f32) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Write a double at `offset`.
    pub fn write_double(&self, offset: u64, value: f64) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Write a char at `offset` as its u32 code point.
    pub fn write_char(&self, offset: u64, value: char) -> Result<()> {
        self.write_u32(offset, value as u32)
    }

    /// Write a boolean at `offset` as one byte.
    pub fn write_bool(&self, offset: u64, value: bool) -> Result<()> {
        self.write_byte(offset, value as i8)
    }
}

impl PartialEq for MemoryRegion {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for MemoryRegion {}

impl Hash for MemoryRegion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("addr", &self.addr)
            .field("size", &self.size)
            .field("volatile", &self.is_volatile())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_sentinels() {
        assert!(Address::NULL.is_null());
        assert!(!Address::from_raw(72).is_null());
        assert!(Address::from_raw(Address::VOLATILE_BASE).is_volatile());
        assert!(!Address::from_raw(72).is_volatile());
    }

    #[test]
    fn test_volatile_region_roundtrip() {
        let r = MemoryRegion::volatile(32);
        assert!(r.is_volatile());
        assert_eq!(r.size(), 32);

        r.write_int(0, -42).unwrap();
        r.write_long(8, i64::MAX).unwrap();
        r.write_double(16, 2.5).unwrap();
        r.write_char(24, 'λ').unwrap();
        r.write_bool(28, true).unwrap();
        r.write_byte(29, -7).unwrap();
        r.write_short(30, 300).unwrap();

        assert_eq!(r.read_int(0).unwrap(), -42);
        assert_eq!(r.read_long(8).unwrap(), i64::MAX);
        assert_eq!(r.read_double(16).unwrap(), 2.5);
        assert_eq!(r.read_char(24).unwrap(), 'λ');
        assert!(r.read_bool(28).unwrap());
        assert_eq!(r.read_byte(29).unwrap(), -7);
        assert_eq!(r.read_short(30).unwrap(), 300);
    }

    #[test]
    fn test_bounds_checked() {
        let r = MemoryRegion::volatile(8);
        assert!(matches!(
            r.read_long(1),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(r.write_int(6, 1).is_err());
        assert!(r.read_long(0).is_ok());
    }

    #[test]
    fn test_identity_is_address() {
        let a = MemoryRegion::volatile(8);
        let b = MemoryRegion::volatile(8);
        assert_ne!(a, b);
        assert_eq!(a, a);
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn test_fresh_region_reads_zero() {
        let r = MemoryRegion::volatile(16);
        assert_eq!(r.read_long(0).unwrap(), 0);
        assert!(!r.read_bool(15).unwrap());
    }
}
