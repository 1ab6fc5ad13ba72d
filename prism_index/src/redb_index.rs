//! `redb`-backed `Index` implementation (spec §4.2, component C2).
//!
//! Grounded in `s5_registries_redb::RedbRegistry`: one `redb::Database`
//! opened once at startup, every operation wrapped in
//! `tokio::task::spawn_blocking` since redb transactions are synchronous.
//! Unlike `RedbRegistry`'s single table, the index needs several related
//! tables kept consistent within one write transaction per call — redb's
//! transaction scope is exactly the atomicity floor spec §4.2 asks for.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use prism_core::Hash;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::trait_def::{BlobRecord, Index, IndexError, IndexResult, NeededBlobs};

const RECORDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("records");
const CLUSTER_BLOBS: TableDefinition<&[u8], u8> = TableDefinition::new("cluster_blobs");
const SD_BLOBS: TableDefinition<&[u8], u8> = TableDefinition::new("sd_blobs");
const MEMBERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("members");
const HOST_BLOBS: TableDefinition<(&str, &[u8]), u8> = TableDefinition::new("host_blobs");
const HOST_COUNTS: TableDefinition<&str, u64> = TableDefinition::new("host_counts");

fn backend_err(e: impl std::fmt::Display) -> IndexError {
    IndexError::Backend(anyhow::anyhow!("{e}"))
}

fn join_err(e: tokio::task::JoinError) -> IndexError {
    IndexError::Backend(anyhow::anyhow!("redb task panicked: {e}"))
}

/// Local, embedded index backed by a single `redb::Database` file.
#[derive(Clone)]
pub struct RedbIndex {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbIndex").finish()
    }
}

impl RedbIndex {
    pub fn open<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join("index.redb"))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RECORDS)?;
            let _ = write_txn.open_table(CLUSTER_BLOBS)?;
            let _ = write_txn.open_table(SD_BLOBS)?;
            let _ = write_txn.open_table(MEMBERS)?;
            let _ = write_txn.open_table(HOST_BLOBS)?;
            let _ = write_txn.open_table(HOST_COUNTS)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }
}

fn encode_record(record: &BlobRecord) -> IndexResult<Vec<u8>> {
    postcard::to_allocvec(record).map_err(|e| backend_err(format!("encode record: {e}")))
}

fn decode_record(bytes: &[u8]) -> IndexResult<BlobRecord> {
    postcard::from_bytes(bytes).map_err(|e| backend_err(format!("decode record: {e}")))
}

fn encode_hashes(hashes: &[Hash]) -> IndexResult<Vec<u8>> {
    let raw: Vec<[u8; prism_core::HASH_LEN]> = hashes.iter().map(|h| *h.as_bytes()).collect();
    postcard::to_allocvec(&raw).map_err(|e| backend_err(format!("encode members: {e}")))
}

fn decode_hashes(bytes: &[u8]) -> IndexResult<Vec<Hash>> {
    let raw: Vec<[u8; prism_core::HASH_LEN]> =
        postcard::from_bytes(bytes).map_err(|e| backend_err(format!("decode members: {e}")))?;
    Ok(raw.into_iter().map(Hash::from_bytes).collect())
}

#[async_trait]
impl Index for RedbIndex {
    async fn blob_exists(&self, hash: Hash) -> IndexResult<bool> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> IndexResult<bool> {
            let read_txn = db.begin_read().map_err(backend_err)?;
            let table = read_txn.open_table(RECORDS).map_err(backend_err)?;
            Ok(table.get(hash.as_bytes().as_slice()).map_err(backend_err)?.is_some())
        })
        .await
        .map_err(join_err)?
    }

    async fn blob_forwarded(&self, hash: Hash) -> IndexResult<bool> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> IndexResult<bool> {
            let read_txn = db.begin_read().map_err(backend_err)?;
            let table = read_txn.open_table(CLUSTER_BLOBS).map_err(backend_err)?;
            Ok(table.get(hash.as_bytes().as_slice()).map_err(backend_err)?.is_some())
        })
        .await
        .map_err(join_err)?
    }

    async fn get_record(&self, hash: Hash) -> IndexResult<Option<BlobRecord>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> IndexResult<Option<BlobRecord>> {
            let read_txn = db.begin_read().map_err(backend_err)?;
            let table = read_txn.open_table(RECORDS).map_err(backend_err)?;
            table
                .get(hash.as_bytes().as_slice())
                .map_err(backend_err)?
                .map(|guard| decode_record(guard.value()))
                .transpose()
        })
        .await
        .map_err(join_err)?
    }

    async fn record_blob_completed(
        &self,
        hash: Hash,
        length: u64,
        now: SystemTime,
    ) -> IndexResult<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> IndexResult<()> {
            let write_txn = db.begin_write().map_err(backend_err)?;
            {
                let mut table = write_txn.open_table(RECORDS).map_err(backend_err)?;
                let key = hash.as_bytes().as_slice();
                if table.get(key).map_err(backend_err)?.is_none() {
                    let record = BlobRecord {
                        length,
                        timestamp_first_seen: now,
                        host: String::new(),
                    };
                    table.insert(key, encode_record(&record)?.as_slice()).map_err(backend_err)?;
                }
            }
            write_txn.commit().map_err(backend_err)?;
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn attach_blob_to_host(&self, hash: Hash, host: &str) -> IndexResult<()> {
        let db = self.db.clone();
        let host = host.to_string();
        tokio::task::spawn_blocking(move || -> IndexResult<()> {
            let write_txn = db.begin_write().map_err(backend_err)?;
            {
                let key = hash.as_bytes().as_slice();
                let mut records = write_txn.open_table(RECORDS).map_err(backend_err)?;
                if let Some(guard) = records.get(key).map_err(backend_err)? {
                    let mut record = decode_record(guard.value())?;
                    drop(guard);
                    record.host = host.clone();
                    records
                        .insert(key, encode_record(&record)?.as_slice())
                        .map_err(backend_err)?;
                }

                let mut cluster_blobs = write_txn.open_table(CLUSTER_BLOBS).map_err(backend_err)?;
                cluster_blobs.insert(key, 1u8).map_err(backend_err)?;

                let mut host_blobs = write_txn.open_table(HOST_BLOBS).map_err(backend_err)?;
                let already_placed = host_blobs
                    .insert((host.as_str(), key), 1u8)
                    .map_err(backend_err)?
                    .is_some();

                if !already_placed {
                    let mut host_counts = write_txn.open_table(HOST_COUNTS).map_err(backend_err)?;
                    let current = host_counts
                        .get(host.as_str())
                        .map_err(backend_err)?
                        .map(|g| g.value())
                        .unwrap_or(0);
                    host_counts.insert(host.as_str(), current + 1).map_err(backend_err)?;
                }
            }
            write_txn.commit().map_err(backend_err)?;
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn detach_blob_from_host(&self, hash: Hash) -> IndexResult<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> IndexResult<()> {
            let write_txn = db.begin_write().map_err(backend_err)?;
            {
                let key = hash.as_bytes().as_slice();
                let mut records = write_txn.open_table(RECORDS).map_err(backend_err)?;
                let host = if let Some(guard) = records.get(key).map_err(backend_err)? {
                    let mut record = decode_record(guard.value())?;
                    drop(guard);
                    let host = record.host.clone();
                    record.host.clear();
                    records
                        .insert(key, encode_record(&record)?.as_slice())
                        .map_err(backend_err)?;
                    host
                } else {
                    String::new()
                };

                let mut cluster_blobs = write_txn.open_table(CLUSTER_BLOBS).map_err(backend_err)?;
                cluster_blobs.remove(key).map_err(backend_err)?;

                if !host.is_empty() {
                    let mut host_blobs = write_txn.open_table(HOST_BLOBS).map_err(backend_err)?;
                    let removed = host_blobs
                        .remove((host.as_str(), key))
                        .map_err(backend_err)?
                        .is_some();
                    if removed {
                        let mut host_counts = write_txn.open_table(HOST_COUNTS).map_err(backend_err)?;
                        let current = host_counts
                            .get(host.as_str())
                            .map_err(backend_err)?
                            .map(|g| g.value())
                            .unwrap_or(0);
                        if current > 1 {
                            host_counts.insert(host.as_str(), current - 1).map_err(backend_err)?;
                        } else {
                            host_counts.remove(host.as_str()).map_err(backend_err)?;
                        }
                    }
                }
            }
            write_txn.commit().map_err(backend_err)?;
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn register_sd_blob(&self, sd_hash: Hash, member_hashes: Vec<Hash>) -> IndexResult<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> IndexResult<()> {
            let write_txn = db.begin_write().map_err(backend_err)?;
            {
                let key = sd_hash.as_bytes().as_slice();
                let mut sd_blobs = write_txn.open_table(SD_BLOBS).map_err(backend_err)?;
                sd_blobs.insert(key, 1u8).map_err(backend_err)?;

                let mut members = write_txn.open_table(MEMBERS).map_err(backend_err)?;
                members
                    .insert(key, encode_hashes(&member_hashes)?.as_slice())
                    .map_err(backend_err)?;
            }
            write_txn.commit().map_err(backend_err)?;
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn members_of_stream(&self, sd_hash: Hash) -> IndexResult<HashSet<Hash>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> IndexResult<HashSet<Hash>> {
            let read_txn = db.begin_read().map_err(backend_err)?;
            let table = read_txn.open_table(MEMBERS).map_err(backend_err)?;
            match table.get(sd_hash.as_bytes().as_slice()).map_err(backend_err)? {
                Some(guard) => Ok(decode_hashes(guard.value())?.into_iter().collect()),
                None => Ok(HashSet::new()),
            }
        })
        .await
        .map_err(join_err)?
    }

    async fn needed_blobs_for_stream(&self, sd_hash: Hash) -> IndexResult<NeededBlobs> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> IndexResult<NeededBlobs> {
            let read_txn = db.begin_read().map_err(backend_err)?;
            let members_table = read_txn.open_table(MEMBERS).map_err(backend_err)?;
            let Some(guard) = members_table.get(sd_hash.as_bytes().as_slice()).map_err(backend_err)? else {
                return Ok(None);
            };
            let members = decode_hashes(guard.value())?;
            drop(guard);

            let records = read_txn.open_table(RECORDS).map_err(backend_err)?;
            let mut needed = Vec::new();
            for member in members {
                if records.get(member.as_bytes().as_slice()).map_err(backend_err)?.is_none() {
                    needed.push(member);
                }
            }
            Ok(Some(needed))
        })
        .await
        .map_err(join_err)?
    }

    async fn host_counts(&self) -> IndexResult<HashMap<String, u64>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> IndexResult<HashMap<String, u64>> {
            let read_txn = db.begin_read().map_err(backend_err)?;
            let table = read_txn.open_table(HOST_COUNTS).map_err(backend_err)?;
            let mut out = HashMap::new();
            for entry in table.iter().map_err(backend_err)? {
                let (host, count) = entry.map_err(backend_err)?;
                out.insert(host.value().to_string(), count.value());
            }
            Ok(out)
        })
        .await
        .map_err(join_err)?
    }

    async fn host_blobs(&self, host: &str) -> IndexResult<HashSet<Hash>> {
        let db = self.db.clone();
        let host = host.to_string();
        tokio::task::spawn_blocking(move || -> IndexResult<HashSet<Hash>> {
            let read_txn = db.begin_read().map_err(backend_err)?;
            let table = read_txn.open_table(HOST_BLOBS).map_err(backend_err)?;
            let mut out = HashSet::new();
            for entry in table.iter().map_err(backend_err)? {
                let (key, _) = entry.map_err(backend_err)?;
                let (entry_host, hash_bytes) = key.value();
                if entry_host == host {
                    let mut raw = [0u8; prism_core::HASH_LEN];
                    raw.copy_from_slice(hash_bytes);
                    out.insert(Hash::from_bytes(raw));
                }
            }
            Ok(out)
        })
        .await
        .map_err(join_err)?
    }

    async fn unforwarded_sd_blobs(&self) -> IndexResult<HashSet<Hash>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> IndexResult<HashSet<Hash>> {
            let read_txn = db.begin_read().map_err(backend_err)?;
            let sd_blobs = read_txn.open_table(SD_BLOBS).map_err(backend_err)?;
            let cluster_blobs = read_txn.open_table(CLUSTER_BLOBS).map_err(backend_err)?;
            let mut out = HashSet::new();
            for entry in sd_blobs.iter().map_err(backend_err)? {
                let (key, _) = entry.map_err(backend_err)?;
                let bytes = key.value();
                if cluster_blobs.get(bytes).map_err(backend_err)?.is_none() {
                    let mut raw = [0u8; prism_core::HASH_LEN];
                    raw.copy_from_slice(bytes);
                    out.insert(Hash::from_bytes(raw));
                }
            }
            Ok(out)
        })
        .await
        .map_err(join_err)?
    }

    async fn delete_record(&self, hash: Hash) -> IndexResult<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> IndexResult<()> {
            let write_txn = db.begin_write().map_err(backend_err)?;
            {
                let key = hash.as_bytes().as_slice();
                let mut records = write_txn.open_table(RECORDS).map_err(backend_err)?;
                records.remove(key).map_err(backend_err)?;

                // Cascade: if `hash` is itself an SD blob, drop its
                // membership entry too, so a deleted SD blob can't keep
                // `needed_blobs_for_stream` answering for a hash that no
                // longer has a record of its own (preserves I3).
                let mut sd_blobs = write_txn.open_table(SD_BLOBS).map_err(backend_err)?;
                sd_blobs.remove(key).map_err(backend_err)?;
                let mut members = write_txn.open_table(MEMBERS).map_err(backend_err)?;
                members.remove(key).map_err(backend_err)?;
            }
            write_txn.commit().map_err(backend_err)?;
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn repair_if_inconsistent(&self, hash: Hash) -> IndexResult<bool> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> IndexResult<bool> {
            let write_txn = db.begin_write().map_err(backend_err)?;
            let repaired;
            {
                let key = hash.as_bytes().as_slice();
                let mut cluster_blobs = write_txn.open_table(CLUSTER_BLOBS).map_err(backend_err)?;
                let in_cluster = cluster_blobs.get(key).map_err(backend_err)?.is_some();

                let mut records = write_txn.open_table(RECORDS).map_err(backend_err)?;
                let (record_host_empty, host) = match records.get(key).map_err(backend_err)? {
                    Some(guard) => {
                        let record = decode_record(guard.value())?;
                        (record.host.is_empty(), record.host)
                    }
                    None => (true, String::new()),
                };

                if in_cluster == !record_host_empty {
                    return Ok(false);
                }

                cluster_blobs.remove(key).map_err(backend_err)?;
                if let Some(guard) = records.get(key).map_err(backend_err)? {
                    let mut record = decode_record(guard.value())?;
                    drop(guard);
                    record.host.clear();
                    records
                        .insert(key, encode_record(&record)?.as_slice())
                        .map_err(backend_err)?;
                }
                if !host.is_empty() {
                    let mut host_blobs = write_txn.open_table(HOST_BLOBS).map_err(backend_err)?;
                    host_blobs.remove((host.as_str(), key)).map_err(backend_err)?;
                }
                repaired = true;
            }
            write_txn.commit().map_err(backend_err)?;
            Ok(repaired)
        })
        .await
        .map_err(join_err)?
    }
}
