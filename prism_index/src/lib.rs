//! The key-value index of known blobs, stream membership, and per-host
//! blob placement (spec §4.2, component C2).
//!
//! [`Index`] is the trait boundary; [`RedbIndex`] is the production,
//! on-disk implementation and [`MemoryIndex`] is the in-process double
//! selected by the `"fake"` config sentinel and used throughout the test
//! suite — mirroring `s5_core`'s split between `RedbRegistry` and an
//! in-memory `RegistryApi` double.

mod memory_index;
mod redb_index;
mod trait_def;

pub use memory_index::MemoryIndex;
pub use redb_index::RedbIndex;
pub use trait_def::{BlobRecord, Index, IndexError, IndexResult, NeededBlobs};
