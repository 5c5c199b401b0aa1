//! Strata Persistent Object Heap
//!
//! A crash-consistent object store over a byte-addressable persistence
//! region (a memory-mapped file by default). Objects survive process
//! restarts: define a layout, construct objects against it, bind them
//! under durable names, and find them again after reopening the heap.
//!
//! # Architecture
//!
//! The heap wires five subsystems around one persistence region:
//!
//! - **Layouts**: each object kind is described once by a [`Layout`]
//!   built from explicit field declarations. Field offsets are computed
//!   at definition time and identify storage without any runtime
//!   reflection; the restart-stable [`TypeTag`] in each object header
//!   maps stored bytes back to their layout through the
//!   [`TypeRegistry`].
//!
//! - **Transactions**: mutations run inside undo-log transactions.
//!   [`Heap::run_in_transaction`] commits on `Ok` and rolls back on
//!   `Err` or unwind; a crash mid-transaction is rolled back by recovery
//!   at the next open.
//!
//! - **Object cache**: one live [`PersistentObject`] handle per address,
//!   so `Arc::ptr_eq` is object identity.
//!
//! - **Named roots**: a durable name-to-object directory; everything
//!   reachable from a bound name survives restarts.
//!
//! - **Reclamation**: objects are reference counted and freed eagerly
//!   when unreferenced; [`Heap::collect_cycles`] reclaims reference
//!   cycles the counts cannot see.
//!
//! # Usage
//!
//! ```ignore
//! use strata::{Heap, HeapConfig, LayoutBuilder, Mutability, PersistentObject};
//!
//! let heap = Heap::open_file("app.strata", HeapConfig::default())?;
//!
//! let mut b = LayoutBuilder::new("app.point");
//! let x = b.int_field(Mutability::Mutable);
//! let y = b.int_field(Mutability::Mutable);
//! let point = b.build(heap.registry())?;
//!
//! let origin = PersistentObject::new(&heap, &point, |o| {
//!     o.set_int(&x, 0)?;
//!     o.set_int(&y, 0)
//! })?;
//! heap.put_root("origin", &origin)?;
//! ```
//!
//! # Concurrency
//!
//! All heap operations are thread-safe. Transactions isolate by
//! per-region locking: two transactions writing the same object
//! serialize, and locks release at commit or rollback. Write-once fields
//! are readable without any transaction once construction completes.
//! Cycle collection waits for in-flight transactions and excludes new
//! ones while it runs.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod heap;
pub mod layout;
pub mod object;
pub mod provider;
pub mod region;
pub mod stats;

mod cache;
mod collector;
mod directory;
mod txn;

pub use config::HeapConfig;
pub use error::{Error, Result};
pub use heap::Heap;
pub use layout::{
    BoolField, ByteField, CharField, DoubleField, FieldDescriptor, FieldKind, FloatField,
    IntField, Layout, LayoutBuilder, LongField, Mutability, ObjectField, ShortField, TypeRegistry,
    TypeTag, ValueField,
};
pub use object::{ObjectPointer, PersistentObject};
pub use provider::{MmapProvider, RegionProvider};
pub use region::{Address, MemoryRegion};
pub use stats::{HeapStats, StatsSnapshot};
