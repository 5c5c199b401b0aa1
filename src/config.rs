//! Heap configuration parameters.
//!
//! All sizes are tunable; defaults suit tests and small embedded stores.
//! Capacity is fixed at creation time — the mapping is not grown once a
//! heap file exists.

use crate::error::{Error, Result};

/// Configuration for a persistent heap.
///
/// # Example
///
/// ```ignore
/// use strata::HeapConfig;
///
/// let config = HeapConfig {
///     capacity: 256 * 1024 * 1024, // 256MB region
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Total capacity of the persistence region in bytes.
    ///
    /// Includes the provider superblock, the transaction log area, and all
    /// object storage. Default: 16MB.
    pub capacity: u64,

    /// Number of concurrent transaction log slots.
    ///
    /// Bounds the number of transactions that can be in flight at once;
    /// additional transactions wait for a free slot. Default: 8.
    pub txn_log_slots: u32,

    /// Size of each transaction log slot in bytes.
    ///
    /// Bounds the total undo data one transaction may accumulate. A
    /// transaction that overflows its slot fails with
    /// [`Error::TransactionLogFull`](crate::Error::TransactionLogFull)
    /// and is rolled back. Default: 4096.
    pub txn_log_slot_size: u32,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            capacity: 16 * 1024 * 1024,
            txn_log_slots: 8,
            txn_log_slot_size: 4096,
        }
    }
}

impl HeapConfig {
    /// Minimum slot size: the 8-byte slot header plus one entry header
    /// and a useful amount of undo payload.
    pub const MIN_SLOT_SIZE: u32 = 64;

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if self.txn_log_slots == 0 {
            return Err(Error::Layout(
                "txn_log_slots must be at least 1".to_string(),
            ));
        }
        if self.txn_log_slot_size < Self::MIN_SLOT_SIZE {
            return Err(Error::Layout(format!(
                "txn_log_slot_size must be at least {}",
                Self::MIN_SLOT_SIZE
            )));
        }
        let log_area = self.txn_log_slots as u64 * self.txn_log_slot_size as u64;
        // Superblock plus log plus some room for objects.
        if self.capacity < 4096 + log_area {
            return Err(Error::Layout(format!(
                "capacity {} too small for {} log slots of {} bytes",
                self.capacity, self.txn_log_slots, self.txn_log_slot_size
            )));
        }
        Ok(())
    }

    /// Total size of the transaction log area in bytes.
    #[inline]
    pub fn log_area_size(&self) -> u64 {
        self.txn_log_slots as u64 * self.txn_log_slot_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(HeapConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_slots_rejected() {
        let config = HeapConfig {
            txn_log_slots: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tiny_slot_rejected() {
        let config = HeapConfig {
            txn_log_slot_size: 16,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_capacity_must_cover_log() {
        let config = HeapConfig {
            capacity: 8192,
            txn_log_slots: 8,
            txn_log_slot_size: 4096,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_area_size() {
        let config = HeapConfig {
            txn_log_slots: 4,
            txn_log_slot_size: 1024,
            ..Default::default()
        };
        assert_eq!(config.log_area_size(), 4096);
    }
}
