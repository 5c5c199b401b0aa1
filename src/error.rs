//! Error taxonomy for the persistent heap.
//!
//! Errors fall into five families: lifecycle misuse, immutability
//! violations, layout definition problems, transaction failures, and
//! recovery-time corruption. Lifecycle and immutability errors surface
//! synchronously at the call site; recovery errors surface from
//! [`Heap::open`](crate::heap::Heap::open).

use crate::layout::TypeTag;
use crate::region::Address;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the persistent heap and its components.
#[derive(Debug, Error)]
pub enum Error {
    // =========================================================================
    // Lifecycle
    // =========================================================================
    /// An operation that requires an open heap found it closed.
    #[error("heap is not open")]
    NotOpen,

    /// The heap backing this handle was dropped while the handle was alive.
    #[error("heap was dropped while object handles were still live")]
    HeapGone,

    /// Underlying file or mapping failure from the region provider.
    #[error("provider I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Allocation / addressing
    // =========================================================================
    /// The persistence region cannot satisfy an allocation request.
    #[error("out of persistent memory: requested {requested} bytes")]
    OutOfMemory {
        /// Size of the failed request in bytes.
        requested: u64,
    },

    /// A typed access fell outside its region.
    #[error("access out of bounds: offset {offset} + {len} exceeds region of {size} bytes")]
    OutOfBounds {
        /// Byte offset of the access within the region.
        offset: u64,
        /// Length of the access in bytes.
        len: u64,
        /// Total region size in bytes.
        size: u64,
    },

    /// An address did not resolve to a live allocation.
    #[error("invalid address {0:?}")]
    InvalidAddress(Address),

    // =========================================================================
    // Layout definition
    // =========================================================================
    /// A layout declaration was rejected at definition time.
    #[error("layout error: {0}")]
    Layout(String),

    /// A stored type tag has no registered layout.
    #[error("unknown type tag {0:?}; register the layout before dereferencing")]
    UnknownTypeTag(TypeTag),

    // =========================================================================
    // Field access
    // =========================================================================
    /// An accessor of one kind was applied to a field of another kind.
    #[error("field {index} kind mismatch: accessor does not match the declared field kind")]
    FieldKindMismatch {
        /// Index of the offending field.
        index: u16,
    },

    /// `set_*` was applied to a write-once field.
    #[error("field {index} is write-once; use init_* during construction")]
    ImmutableField {
        /// Index of the offending field.
        index: u16,
    },

    /// `init_*` was applied to a field that is not write-once.
    #[error("field {index} is mutable; use set_* instead of init_*")]
    NotWriteOnce {
        /// Index of the offending field.
        index: u16,
    },

    /// `init_*` was applied twice, or after construction completed.
    #[error("field {index} already initialized")]
    AlreadyInitialized {
        /// Index of the offending field.
        index: u16,
    },

    /// A stored object's layout does not satisfy a declared field type.
    #[error("type mismatch: field declares {expected:?}, value has {found:?}")]
    TypeMismatch {
        /// Tag the field declares.
        expected: TypeTag,
        /// Tag of the value actually supplied.
        found: TypeTag,
    },

    /// A value-based (embedded) object was used where a heap reference is
    /// required, or vice versa.
    #[error("value-based object cannot be stored by reference")]
    ValueBasedReference,

    // =========================================================================
    // Transactions
    // =========================================================================
    /// The undo-log slot for the current transaction is exhausted.
    #[error("transaction undo log full; raise HeapConfig::txn_log_slot_size")]
    TransactionLogFull,

    // =========================================================================
    // Recovery
    // =========================================================================
    /// Persistent state failed a consistency check. Fatal; the heap cannot
    /// report itself open.
    #[error("persistent state corrupt: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ImmutableField { index: 3 };
        assert!(err.to_string().contains("write-once"));

        let err = Error::OutOfBounds {
            offset: 8,
            len: 8,
            size: 12,
        };
        assert!(err.to_string().contains("12"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
