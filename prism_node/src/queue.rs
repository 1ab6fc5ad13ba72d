//! Durable job queue (C6, spec §4.6).
//!
//! The original used Redis + `rq`; this workspace has no Redis dependency
//! in the teacher stack, so the queue is built the same way the index is
//! (`prism_index::RedbIndex`): a dedicated `redb` table holding pending
//! jobs keyed by an auto-incrementing id, with per-job `leased_until`
//! checked on dequeue so a worker that dies mid-job doesn't lose it —
//! a timed-out lease is simply handed to the next dequeuer rather than
//! requiring an explicit background reaper task.
//!
//! The queue does not deduplicate submissions (spec §4.6); duplicate
//! protection lives higher up (the inbound connection-close guard flag
//! and the worker's preflight checks, spec I6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use prism_core::Hash;
use prism_protocol::ForwardEnqueuer;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// A unit of forwarding work (spec §4.6's two logical job types).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Job {
    ForwardBlob(Hash),
    ForwardStream { sd_hash: Hash, member_count: u64 },
}

impl Job {
    /// Per-job timeout (spec §4.6): 60s for a single blob, `(member_count
    /// + 1) * 30s` for a stream.
    pub fn timeout(&self) -> Duration {
        match self {
            Job::ForwardBlob(_) => Duration::from_secs(60),
            Job::ForwardStream { member_count, .. } => {
                Duration::from_secs((member_count + 1) * 30)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend unavailable: {0}")]
    BackendUnavailable(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// An in-flight lease on a dequeued job. Workers must call [`JobQueue::ack`]
/// on success or [`JobQueue::nack`] on failure; letting the lease expire
/// without either has the same effect as an explicit `nack` once the
/// deadline passes.
#[derive(Debug, Clone, Copy)]
pub struct Lease {
    pub job_id: u64,
    pub job: Job,
}

#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    async fn enqueue(&self, job: Job) -> QueueResult<()>;
    /// Pulls the oldest job whose lease (if any) has expired.
    async fn dequeue(&self) -> QueueResult<Option<Lease>>;
    async fn ack(&self, job_id: u64) -> QueueResult<()>;
    /// Releases the lease immediately so another worker may retry sooner
    /// than the lease deadline (spec §7: transient backend errors retry).
    async fn nack(&self, job_id: u64) -> QueueResult<()>;
}

const JOBS: TableDefinition<u64, &[u8]> = TableDefinition::new("jobs");
const LEASES: TableDefinition<u64, u64> = TableDefinition::new("leases");
const NEXT_ID: TableDefinition<(), u64> = TableDefinition::new("next_id");

fn backend_err(e: impl std::fmt::Display) -> QueueError {
    QueueError::BackendUnavailable(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> QueueError {
    QueueError::BackendUnavailable(format!("queue task panicked: {e}"))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Durable, `redb`-backed job queue.
#[derive(Clone)]
pub struct RedbJobQueue {
    db: Arc<Database>,
}

impl RedbJobQueue {
    pub fn open<P: AsRef<std::path::Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join("queue.redb"))?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(JOBS)?;
            let _ = write_txn.open_table(LEASES)?;
            let mut next_id = write_txn.open_table(NEXT_ID)?;
            if next_id.get(())?.is_none() {
                next_id.insert((), 0u64)?;
            }
        }
        write_txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl JobQueue for RedbJobQueue {
    async fn enqueue(&self, job: Job) -> QueueResult<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> QueueResult<()> {
            let encoded = postcard::to_allocvec(&job).map_err(backend_err)?;
            let write_txn = db.begin_write().map_err(backend_err)?;
            {
                let mut next_id = write_txn.open_table(NEXT_ID).map_err(backend_err)?;
                let id = next_id.get(()).map_err(backend_err)?.map(|g| g.value()).unwrap_or(0);
                next_id.insert((), id + 1).map_err(backend_err)?;

                let mut jobs = write_txn.open_table(JOBS).map_err(backend_err)?;
                jobs.insert(id, encoded.as_slice()).map_err(backend_err)?;
            }
            write_txn.commit().map_err(backend_err)?;
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn dequeue(&self) -> QueueResult<Option<Lease>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> QueueResult<Option<Lease>> {
            let now = now_secs();
            let write_txn = db.begin_write().map_err(backend_err)?;
            let found;
            {
                let jobs = write_txn.open_table(JOBS).map_err(backend_err)?;
                let mut leases = write_txn.open_table(LEASES).map_err(backend_err)?;

                let mut picked = None;
                for entry in jobs.iter().map_err(backend_err)? {
                    let (key, value) = entry.map_err(backend_err)?;
                    let id = key.value();
                    let leased_until = leases.get(id).map_err(backend_err)?.map(|g| g.value());
                    if leased_until.map(|until| until <= now).unwrap_or(true) {
                        let job: Job = postcard::from_bytes(value.value()).map_err(backend_err)?;
                        picked = Some((id, job));
                        break;
                    }
                }

                found = picked;
                if let Some((id, job)) = &found {
                    let deadline = now + job.timeout().as_secs();
                    leases.insert(*id, deadline).map_err(backend_err)?;
                }
            }
            write_txn.commit().map_err(backend_err)?;
            Ok(found.map(|(job_id, job)| Lease { job_id, job }))
        })
        .await
        .map_err(join_err)?
    }

    async fn ack(&self, job_id: u64) -> QueueResult<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> QueueResult<()> {
            let write_txn = db.begin_write().map_err(backend_err)?;
            {
                let mut jobs = write_txn.open_table(JOBS).map_err(backend_err)?;
                jobs.remove(job_id).map_err(backend_err)?;
                let mut leases = write_txn.open_table(LEASES).map_err(backend_err)?;
                leases.remove(job_id).map_err(backend_err)?;
            }
            write_txn.commit().map_err(backend_err)?;
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn nack(&self, job_id: u64) -> QueueResult<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> QueueResult<()> {
            let write_txn = db.begin_write().map_err(backend_err)?;
            {
                let mut leases = write_txn.open_table(LEASES).map_err(backend_err)?;
                leases.remove(job_id).map_err(backend_err)?;
            }
            write_txn.commit().map_err(backend_err)?;
            Ok(())
        })
        .await
        .map_err(join_err)?
    }
}

/// In-memory queue used for tests and the `"fake"` index config sentinel.
#[derive(Clone, Default)]
pub struct MemoryJobQueue {
    inner: Arc<Mutex<MemoryQueueState>>,
}

#[derive(Default)]
struct MemoryQueueState {
    jobs: HashMap<u64, Job>,
    leased_until: HashMap<u64, u64>,
    next_id: u64,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: Job) -> QueueResult<()> {
        let mut state = self.inner.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        state.jobs.insert(id, job);
        Ok(())
    }

    async fn dequeue(&self) -> QueueResult<Option<Lease>> {
        let mut state = self.inner.lock().await;
        let now = now_secs();
        let candidate = state
            .jobs
            .iter()
            .find(|(id, _)| {
                state
                    .leased_until
                    .get(id)
                    .map(|until| *until <= now)
                    .unwrap_or(true)
            })
            .map(|(id, job)| (*id, *job));

        if let Some((id, job)) = candidate {
            state.leased_until.insert(id, now + job.timeout().as_secs());
            Ok(Some(Lease { job_id: id, job }))
        } else {
            Ok(None)
        }
    }

    async fn ack(&self, job_id: u64) -> QueueResult<()> {
        let mut state = self.inner.lock().await;
        state.jobs.remove(&job_id);
        state.leased_until.remove(&job_id);
        Ok(())
    }

    async fn nack(&self, job_id: u64) -> QueueResult<()> {
        let mut state = self.inner.lock().await;
        state.leased_until.remove(&job_id);
        Ok(())
    }
}

/// Bridges the inbound protocol's close-time enqueue calls
/// (`prism_protocol::ForwardEnqueuer`) to a concrete [`JobQueue`], looking
/// up each stream's member count so `ForwardStream`'s timeout can be
/// computed (spec §4.6).
pub struct QueueEnqueuer<Q, I> {
    queue: Q,
    index: Arc<I>,
}

impl<Q: JobQueue, I: prism_index::Index> QueueEnqueuer<Q, I> {
    pub fn new(queue: Q, index: Arc<I>) -> Self {
        Self { queue, index }
    }
}

#[async_trait]
impl<Q: JobQueue, I: prism_index::Index> ForwardEnqueuer for QueueEnqueuer<Q, I> {
    async fn enqueue_forward_blob(&self, hash: Hash) {
        let _ = self.queue.enqueue(Job::ForwardBlob(hash)).await;
    }

    async fn enqueue_forward_stream(&self, sd_hash: Hash) {
        let member_count = self
            .index
            .members_of_stream(sd_hash)
            .await
            .map(|m| m.len() as u64)
            .unwrap_or(0);
        let _ = self
            .queue
            .enqueue(Job::ForwardStream {
                sd_hash,
                member_count,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_queue_round_trips() {
        let queue = MemoryJobQueue::new();
        let hash = Hash::digest(b"x");
        queue.enqueue(Job::ForwardBlob(hash)).await.unwrap();

        let lease = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(lease.job, Job::ForwardBlob(hash));

        // Leased; a second dequeue finds nothing ready.
        assert!(queue.dequeue().await.unwrap().is_none());

        queue.ack(lease.job_id).await.unwrap();
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nack_makes_job_immediately_available_again() {
        let queue = MemoryJobQueue::new();
        let hash = Hash::digest(b"y");
        queue.enqueue(Job::ForwardBlob(hash)).await.unwrap();

        let lease = queue.dequeue().await.unwrap().unwrap();
        queue.nack(lease.job_id).await.unwrap();

        let lease2 = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(lease2.job_id, lease.job_id);
    }

    #[tokio::test]
    async fn redb_queue_persists_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let queue = RedbJobQueue::open(dir.path()).unwrap();
        let sd_hash = Hash::digest(b"sd");
        queue
            .enqueue(Job::ForwardStream {
                sd_hash,
                member_count: 2,
            })
            .await
            .unwrap();

        let lease = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(
            lease.job,
            Job::ForwardStream {
                sd_hash,
                member_count: 2
            }
        );
        assert_eq!(lease.job.timeout(), Duration::from_secs(90));
        queue.ack(lease.job_id).await.unwrap();
        assert!(queue.dequeue().await.unwrap().is_none());
    }
}
