//! File-backed region provider using a memory-mapped heap file.
//!
//! # File format
//!
//! ```text
//! offset 0    superblock (64 bytes)
//!             ├── magic: u64          "STRATAH1"
//!             ├── version: u32
//!             ├── reserved: u32
//!             ├── alloc cursor: u64   next never-allocated byte
//!             ├── free head: u64      first block on the free list (0 = none)
//!             └── meta slot: u64      heap bootstrap address (0 = unset)
//! offset 64   blocks, each: size header (u64) followed by the payload
//! ```
//!
//! Allocation is first-fit over a singly-linked free list (the link lives
//! in the first 8 payload bytes of a freed block), falling back to bumping
//! the cursor. Payloads are zero-filled before they are handed out, so a
//! freshly allocated object reads every field as unset.
//!
//! Durability is byte-range flushing of the mapping; the provider makes no
//! atomicity promise beyond what the OS gives a flushed range, which is
//! exactly the contract the transaction log is built on.

use crate::error::{Error, Result};
use crate::provider::RegionProvider;
use crate::region::Address;
use memmap2::MmapMut;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

const MAGIC: u64 = 0x5354_5241_5441_4831; // "STRATAH1"
const VERSION: u32 = 1;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_CURSOR: usize = 16;
const OFF_FREE_HEAD: usize = 24;
const OFF_META: usize = 32;
const SUPERBLOCK_SIZE: u64 = 64;

/// Per-block size header preceding every payload.
const BLOCK_HEADER: u64 = 8;

struct Mapped {
    map: MmapMut,
    _file: File,
    len: u64,
}

/// Memory-mapped file provider. The default persistence primitive.
pub struct MmapProvider {
    path: PathBuf,
    capacity: u64,
    state: RwLock<Option<Mapped>>,
}

impl MmapProvider {
    /// Create a provider for the heap file at `path`.
    ///
    /// `capacity` is used only when the file does not exist yet; an
    /// existing file keeps its size.
    pub fn new(path: impl AsRef<Path>, capacity: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            capacity,
            state: RwLock::new(None),
        }
    }

    fn with_map<T>(&self, f: impl FnOnce(&Mapped) -> Result<T>) -> Result<T> {
        let guard = self.state.read();
        let mapped = guard.as_ref().ok_or(Error::NotOpen)?;
        f(mapped)
    }

    fn with_map_mut<T>(&self, f: impl FnOnce(&mut Mapped) -> Result<T>) -> Result<T> {
        let mut guard = self.state.write();
        let mapped = guard.as_mut().ok_or(Error::NotOpen)?;
        f(mapped)
    }

    /// Check that `[addr + offset, addr + offset + len)` stays inside the
    /// block at `addr`.
    fn check_block(mapped: &Mapped, addr: Address, offset: u64, len: u64) -> Result<()> {
        let size = block_size(mapped, addr)?;
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(Error::OutOfBounds {
                offset,
                len,
                size,
            });
        }
        Ok(())
    }
}

fn read_u64(map: &MmapMut, off: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&map[off..off + 8]);
    u64::from_le_bytes(buf)
}

fn write_u64(map: &mut MmapMut, off: usize, val: u64) {
    map[off..off + 8].copy_from_slice(&val.to_le_bytes());
}

fn read_u32(map: &MmapMut, off: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&map[off..off + 4]);
    u32::from_le_bytes(buf)
}

/// Validate that `addr` plausibly points at a block payload.
fn check_addr(mapped: &Mapped, addr: Address) -> Result<()> {
    let raw = addr.raw();
    if raw < SUPERBLOCK_SIZE + BLOCK_HEADER || raw >= mapped.len || raw % 8 != 0 {
        return Err(Error::InvalidAddress(addr));
    }
    Ok(())
}

fn block_size(mapped: &Mapped, addr: Address) -> Result<u64> {
    check_addr(mapped, addr)?;
    let size = read_u64(&mapped.map, (addr.raw() - BLOCK_HEADER) as usize);
    if size == 0 || addr.raw() + size > mapped.len {
        return Err(Error::InvalidAddress(addr));
    }
    Ok(size)
}

impl RegionProvider for MmapProvider {
    fn open(&self) -> Result<()> {
        let mut guard = self.state.write();
        if guard.is_some() {
            return Ok(());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        let existing = file.metadata()?.len();
        let fresh = existing == 0;
        let len = if fresh { self.capacity } else { existing };
        if fresh {
            file.set_len(len)?;
        }

        // Safety: the file stays open for the lifetime of the mapping and
        // this provider is the only writer of the heap file.
        let mut map = unsafe { MmapMut::map_mut(&file)? };

        if fresh {
            write_u64(&mut map, OFF_MAGIC, MAGIC);
            map[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&VERSION.to_le_bytes());
            write_u64(&mut map, OFF_CURSOR, SUPERBLOCK_SIZE);
            write_u64(&mut map, OFF_FREE_HEAD, 0);
            write_u64(&mut map, OFF_META, 0);
            map.flush()?;
        } else {
            if read_u64(&map, OFF_MAGIC) != MAGIC {
                return Err(Error::Corrupt(format!(
                    "{}: bad magic in superblock",
                    self.path.display()
                )));
            }
            let version = read_u32(&map, OFF_VERSION);
            if version != VERSION {
                return Err(Error::Corrupt(format!(
                    "{}: unsupported heap version {}",
                    self.path.display(),
                    version
                )));
            }
        }

        log::debug!(
            "opened heap file {} ({} bytes, fresh = {})",
            self.path.display(),
            len,
            fresh
        );
        *guard = Some(Mapped {
            map,
            _file: file,
            len,
        });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.state.write();
        if let Some(mapped) = guard.take() {
            mapped.map.flush()?;
        }
        Ok(())
    }

    fn allocate(&self, size: u64) -> Result<Address> {
        if size == 0 {
            return Err(Error::Layout("cannot allocate a zero-sized block".into()));
        }
        let size = size.div_ceil(8) * 8;
        self.with_map_mut(|mapped| {
            // First fit on the free list.
            let mut prev: Option<u64> = None;
            let mut cur = read_u64(&mapped.map, OFF_FREE_HEAD);
            while cur != 0 {
                let cur_size = read_u64(&mapped.map, (cur - BLOCK_HEADER) as usize);
                let next = read_u64(&mapped.map, cur as usize);
                if cur_size >= size {
                    match prev {
                        Some(p) => write_u64(&mut mapped.map, p as usize, next),
                        None => write_u64(&mut mapped.map, OFF_FREE_HEAD, next),
                    }
                    let start = cur as usize;
                    mapped.map[start..start + cur_size as usize].fill(0);
                    return Ok(Address::from_raw(cur));
                }
                prev = Some(cur);
                cur = next;
            }

            // Bump allocation. Fresh space is already zero.
            let cursor = read_u64(&mapped.map, OFF_CURSOR);
            let addr = cursor + BLOCK_HEADER;
            let end = addr.checked_add(size).ok_or(Error::OutOfMemory {
                requested: size,
            })?;
            if end > mapped.len {
                return Err(Error::OutOfMemory { requested: size });
            }
            write_u64(&mut mapped.map, cursor as usize, size);
            write_u64(&mut mapped.map, OFF_CURSOR, end);
            Ok(Address::from_raw(addr))
        })
    }

    fn free(&self, addr: Address) -> Result<()> {
        self.with_map_mut(|mapped| {
            block_size(mapped, addr)?;
            let head = read_u64(&mapped.map, OFF_FREE_HEAD);
            write_u64(&mut mapped.map, addr.raw() as usize, head);
            write_u64(&mut mapped.map, OFF_FREE_HEAD, addr.raw());
            Ok(())
        })
    }

    fn size_of(&self, addr: Address) -> Result<u64> {
        self.with_map(|mapped| block_size(mapped, addr))
    }

    fn read(&self, addr: Address, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.with_map(|mapped| {
            Self::check_block(mapped, addr, offset, buf.len() as u64)?;
            let start = (addr.raw() + offset) as usize;
            buf.copy_from_slice(&mapped.map[start..start + buf.len()]);
            Ok(())
        })
    }

    fn write(&self, addr: Address, offset: u64, buf: &[u8]) -> Result<()> {
        self.with_map_mut(|mapped| {
            Self::check_block(mapped, addr, offset, buf.len() as u64)?;
            let start = (addr.raw() + offset) as usize;
            mapped.map[start..start + buf.len()].copy_from_slice(buf);
            Ok(())
        })
    }

    fn copy(
        &self,
        src: Address,
        src_off: u64,
        dst: Address,
        dst_off: u64,
        len: u64,
    ) -> Result<()> {
        self.with_map_mut(|mapped| {
            Self::check_block(mapped, src, src_off, len)?;
            Self::check_block(mapped, dst, dst_off, len)?;
            let s = (src.raw() + src_off) as usize;
            let d = (dst.raw() + dst_off) as usize;
            mapped.map.copy_within(s..s + len as usize, d);
            Ok(())
        })
    }

    fn flush(&self) -> Result<()> {
        self.with_map(|mapped| {
            mapped.map.flush()?;
            Ok(())
        })
    }

    fn flush_range(&self, addr: Address, offset: u64, len: u64) -> Result<()> {
        self.with_map(|mapped| {
            Self::check_block(mapped, addr, offset, len)?;
            mapped
                .map
                .flush_range((addr.raw() + offset) as usize, len as usize)?;
            Ok(())
        })
    }

    fn meta_address(&self) -> Result<Address> {
        self.with_map(|mapped| Ok(Address::from_raw(read_u64(&mapped.map, OFF_META))))
    }

    fn set_meta_address(&self, addr: Address) -> Result<()> {
        self.with_map_mut(|mapped| {
            write_u64(&mut mapped.map, OFF_META, addr.raw());
            mapped.map.flush_range(OFF_META, 8)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn provider(dir: &TempDir) -> MmapProvider {
        MmapProvider::new(dir.path().join("heap.strata"), 1024 * 1024)
    }

    #[test]
    fn test_open_idempotent() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir);
        p.open().unwrap();
        p.open().unwrap();
        p.close().unwrap();
        p.close().unwrap();
    }

    #[test]
    fn test_not_open_errors() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir);
        assert!(matches!(p.allocate(16), Err(Error::NotOpen)));
    }

    #[test]
    fn test_allocate_zeroed_and_roundtrip() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir);
        p.open().unwrap();

        let addr = p.allocate(32).unwrap();
        let mut buf = [0xFFu8; 32];
        p.read(addr, 0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 32]);

        p.write(addr, 8, &[1, 2, 3, 4]).unwrap();
        let mut back = [0u8; 4];
        p.read(addr, 8, &mut back).unwrap();
        assert_eq!(back, [1, 2, 3, 4]);
        assert_eq!(p.size_of(addr).unwrap(), 32);
    }

    #[test]
    fn test_free_list_reuse_is_zeroed() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir);
        p.open().unwrap();

        let a = p.allocate(64).unwrap();
        p.write(a, 0, &[0xAB; 64]).unwrap();
        p.free(a).unwrap();

        let b = p.allocate(64).unwrap();
        assert_eq!(a, b);
        let mut buf = [0xFFu8; 64];
        p.read(b, 0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 64]);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir);
        p.open().unwrap();

        let addr = p.allocate(16).unwrap();
        let mut buf = [0u8; 17];
        assert!(matches!(
            p.read(addr, 0, &mut buf),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(p.write(addr, 12, &[0; 8]).is_err());
    }

    #[test]
    fn test_out_of_memory() {
        let dir = TempDir::new().unwrap();
        let p = MmapProvider::new(dir.path().join("tiny.strata"), 4096);
        p.open().unwrap();
        assert!(matches!(
            p.allocate(1024 * 1024),
            Err(Error::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_meta_slot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heap.strata");
        let addr;
        {
            let p = MmapProvider::new(&path, 1024 * 1024);
            p.open().unwrap();
            addr = p.allocate(24).unwrap();
            p.write(addr, 0, &[7u8; 24]).unwrap();
            p.set_meta_address(addr).unwrap();
            p.flush().unwrap();
            p.close().unwrap();
        }
        let p = MmapProvider::new(&path, 1024 * 1024);
        p.open().unwrap();
        assert_eq!(p.meta_address().unwrap(), addr);
        let mut buf = [0u8; 24];
        p.read(addr, 0, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 24]);
    }

    #[test]
    fn test_copy_between_blocks() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir);
        p.open().unwrap();
        let a = p.allocate(16).unwrap();
        let b = p.allocate(16).unwrap();
        p.write(a, 0, &[9u8; 16]).unwrap();
        p.copy(a, 4, b, 8, 8).unwrap();
        let mut buf = [0u8; 8];
        p.read(b, 8, &mut buf).unwrap();
        assert_eq!(buf, [9u8; 8]);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.strata");
        std::fs::write(&path, vec![0x55u8; 4096]).unwrap();
        let p = MmapProvider::new(&path, 4096);
        assert!(matches!(p.open(), Err(Error::Corrupt(_))));
    }
}
