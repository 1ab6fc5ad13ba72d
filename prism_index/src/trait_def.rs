//! The `Index` trait: the shared key-value record of known blobs, stream
//! membership, and per-host placement (spec §4.2, component C2).

use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use async_trait::async_trait;
use prism_core::Hash;
use serde::{Deserialize, Serialize};

pub use prism_core::error::IndexError;

pub type IndexResult<T> = Result<T, IndexError>;

/// A single blob's index record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub length: u64,
    pub timestamp_first_seen: SystemTime,
    /// Empty string means "not yet forwarded" (spec §3).
    pub host: String,
}

impl BlobRecord {
    pub fn is_forwarded(&self) -> bool {
        !self.host.is_empty()
    }
}

/// Sentinel distinguishing "the SD blob itself is unknown" from "the SD
/// blob is known and needs zero more members" (spec §4.2, §9 Open
/// Question: the wire-level distinction between omitting `needed_blobs`
/// and sending an empty array is preserved here as `None` vs `Some(vec![])`).
pub type NeededBlobs = Option<Vec<Hash>>;

/// The shared, asynchronous key-value index described in spec §4.2.
///
/// Implementations must be safe to call from many concurrent tasks; the
/// backing store may be a local embedded database (`RedbIndex`) or an
/// in-memory double (`MemoryIndex`, used for tests and the `"fake"`
/// config sentinel).
#[async_trait]
pub trait Index: std::fmt::Debug + Send + Sync + 'static {
    /// True iff there is a record for `hash` (received locally, forwarded,
    /// or both historically — any record at all).
    async fn blob_exists(&self, hash: Hash) -> IndexResult<bool>;

    /// True iff `hash` has been forwarded to some host.
    async fn blob_forwarded(&self, hash: Hash) -> IndexResult<bool>;

    /// Returns the full record for `hash`, if any.
    async fn get_record(&self, hash: Hash) -> IndexResult<Option<BlobRecord>>;

    /// Records that `hash` has completed locally. Idempotent: replaying
    /// this for an already-recorded hash must not duplicate or regress its
    /// `timestamp_first_seen`.
    async fn record_blob_completed(&self, hash: Hash, length: u64, now: SystemTime) -> IndexResult<()>;

    /// Atomically adds `hash` to `cluster_blobs` and `host_blobs(host)` and
    /// sets the record's host field. See spec §4.2 for the atomicity floor
    /// required on backends without multi-key transactions.
    async fn attach_blob_to_host(&self, hash: Hash, host: &str) -> IndexResult<()>;

    /// Inverse of [`Index::attach_blob_to_host`].
    async fn detach_blob_from_host(&self, hash: Hash) -> IndexResult<()>;

    /// Registers `sd_hash` as an SD blob with the given member hashes.
    async fn register_sd_blob(&self, sd_hash: Hash, member_hashes: Vec<Hash>) -> IndexResult<()>;

    /// Returns the full member set declared by `sd_hash`'s manifest.
    async fn members_of_stream(&self, sd_hash: Hash) -> IndexResult<HashSet<Hash>>;

    /// Returns the member hashes not locally present and not forwarded, or
    /// `None` if `sd_hash` itself is not a known SD blob.
    async fn needed_blobs_for_stream(&self, sd_hash: Hash) -> IndexResult<NeededBlobs>;

    /// `|host_blobs(host)|` for every host with at least one placed blob.
    async fn host_counts(&self) -> IndexResult<HashMap<String, u64>>;

    /// The hashes currently placed on `host`, i.e. `host_blobs(host)`
    /// itself rather than just its cardinality. Used by operator tooling
    /// that needs to act on specific blobs (e.g. redistribution), not just
    /// report counts.
    async fn host_blobs(&self, host: &str) -> IndexResult<HashSet<Hash>>;

    /// `sd_blobs \ cluster_blobs`.
    async fn unforwarded_sd_blobs(&self) -> IndexResult<HashSet<Hash>>;

    /// Deletes the record for `hash` (valid only when its host is empty;
    /// callers are responsible for checking this precondition).
    async fn delete_record(&self, hash: Hash) -> IndexResult<()>;

    /// Read-repair rule for I1/I2 (spec §7): if `hash` is found in
    /// `cluster_blobs` but its record shows an empty host (or vice versa),
    /// treat it as "state unknown" rather than silently trusting either
    /// side, and report whether a repair was applied.
    async fn repair_if_inconsistent(&self, hash: Hash) -> IndexResult<bool>;
}
