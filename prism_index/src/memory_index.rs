//! In-memory `Index` double, selected by the `"fake"` config sentinel
//! (spec §6) and used throughout the test suite. Grounded in
//! `s5_store_memory::MemoryStore`'s `DashMap`-backed approach.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use dashmap::DashMap;
use prism_core::Hash;

use crate::trait_def::{BlobRecord, Index, IndexResult, NeededBlobs};

#[derive(Debug, Default)]
pub struct MemoryIndex {
    records: DashMap<Hash, BlobRecord>,
    cluster_blobs: DashMap<Hash, ()>,
    sd_blobs: DashMap<Hash, ()>,
    members: DashMap<Hash, Vec<Hash>>,
    host_blobs: DashMap<String, HashSet<Hash>>,
    // Guards compound mutations so concurrent attach/detach calls observe
    // a consistent three-table view, the same floor spec §4.2 demands of
    // backends without native multi-key transactions.
    mutation_lock: Mutex<()>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Index for MemoryIndex {
    async fn blob_exists(&self, hash: Hash) -> IndexResult<bool> {
        Ok(self.records.contains_key(&hash))
    }

    async fn blob_forwarded(&self, hash: Hash) -> IndexResult<bool> {
        Ok(self.cluster_blobs.contains_key(&hash))
    }

    async fn get_record(&self, hash: Hash) -> IndexResult<Option<BlobRecord>> {
        Ok(self.records.get(&hash).map(|r| r.clone()))
    }

    async fn record_blob_completed(
        &self,
        hash: Hash,
        length: u64,
        now: SystemTime,
    ) -> IndexResult<()> {
        self.records.entry(hash).or_insert_with(|| BlobRecord {
            length,
            timestamp_first_seen: now,
            host: String::new(),
        });
        Ok(())
    }

    async fn attach_blob_to_host(&self, hash: Hash, host: &str) -> IndexResult<()> {
        let _guard = self.mutation_lock.lock().unwrap();
        if let Some(mut record) = self.records.get_mut(&hash) {
            record.host = host.to_string();
        }
        self.cluster_blobs.insert(hash, ());
        self.host_blobs.entry(host.to_string()).or_default().insert(hash);
        Ok(())
    }

    async fn detach_blob_from_host(&self, hash: Hash) -> IndexResult<()> {
        let _guard = self.mutation_lock.lock().unwrap();
        if let Some(mut record) = self.records.get_mut(&hash) {
            if !record.host.is_empty()
                && let Some(mut members) = self.host_blobs.get_mut(&record.host)
            {
                members.remove(&hash);
            }
            record.host.clear();
        }
        self.cluster_blobs.remove(&hash);
        Ok(())
    }

    async fn register_sd_blob(&self, sd_hash: Hash, member_hashes: Vec<Hash>) -> IndexResult<()> {
        self.sd_blobs.insert(sd_hash, ());
        self.members.insert(sd_hash, member_hashes);
        Ok(())
    }

    async fn members_of_stream(&self, sd_hash: Hash) -> IndexResult<HashSet<Hash>> {
        Ok(self
            .members
            .get(&sd_hash)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn needed_blobs_for_stream(&self, sd_hash: Hash) -> IndexResult<NeededBlobs> {
        let Some(members) = self.members.get(&sd_hash) else {
            return Ok(None);
        };
        let needed = members
            .iter()
            .filter(|h| !self.records.contains_key(*h))
            .copied()
            .collect();
        Ok(Some(needed))
    }

    async fn host_counts(&self) -> IndexResult<HashMap<String, u64>> {
        Ok(self
            .host_blobs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len() as u64))
            .collect())
    }

    async fn host_blobs(&self, host: &str) -> IndexResult<HashSet<Hash>> {
        Ok(self.host_blobs.get(host).map(|s| s.clone()).unwrap_or_default())
    }

    async fn unforwarded_sd_blobs(&self) -> IndexResult<HashSet<Hash>> {
        Ok(self
            .sd_blobs
            .iter()
            .map(|e| *e.key())
            .filter(|h| !self.cluster_blobs.contains_key(h))
            .collect())
    }

    async fn delete_record(&self, hash: Hash) -> IndexResult<()> {
        self.records.remove(&hash);
        self.sd_blobs.remove(&hash);
        self.members.remove(&hash);
        Ok(())
    }

    async fn repair_if_inconsistent(&self, hash: Hash) -> IndexResult<bool> {
        let _guard = self.mutation_lock.lock().unwrap();
        let in_cluster = self.cluster_blobs.contains_key(&hash);
        let record_host_empty = self
            .records
            .get(&hash)
            .map(|r| r.host.is_empty())
            .unwrap_or(true);

        if in_cluster == !record_host_empty {
            return Ok(false);
        }

        // Inconsistent: trust neither side blindly. Drop the forwarded
        // marker so the blob is treated as "not yet forwarded" and may be
        // safely re-enqueued; an operator tool can reconcile placement
        // separately (spec §7's read-repair rule).
        self.cluster_blobs.remove(&hash);
        if let Some(mut record) = self.records.get_mut(&hash) {
            if !record.host.is_empty()
                && let Some(mut members) = self.host_blobs.get_mut(&record.host)
            {
                members.remove(&hash);
            }
            record.host.clear();
        }
        Ok(true)
    }
}
