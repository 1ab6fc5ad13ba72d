//! Core types shared by every Prism crate: the content hash, blob/SD-blob
//! data model, and the concept-level error taxonomy.
//!
//! ## Protocol types (wire-stable)
//!
//! - `hash::Hash` — SHA-384 content hash, 96 hex chars on the wire.
//! - `blob::BlobId`, `blob::SdBlobManifest` — blob identity and the JSON
//!   shape of an SD blob's member list.
//!
//! These are used directly on the wire (spec §6) and in persisted index
//! state (spec §3); changes to them are protocol changes.
//!
//! ## Error taxonomy
//!
//! `error` groups the concept-level errors from spec §7 by the component
//! that raises them.

pub mod blob;
pub mod error;
pub mod hash;

pub use blob::{BlobId, SdBlobEntry, SdBlobError, SdBlobManifest};
pub use hash::{HASH_HEX_LEN, HASH_LEN, Hash, InvalidHash};
