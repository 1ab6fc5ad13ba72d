//! Worker / task runner (C7, spec §4.7).
//!
//! Grounded in `examples/original_source/prism/node.py`'s worker loop:
//! preflight against the index, pick a host, run the outbound state
//! machine, then reconcile the index and local files from whichever
//! blobs were actually acknowledged.

use std::sync::Arc;
use std::time::Duration;

use prism_core::Hash;
use prism_index::Index;
use prism_protocol::outbound::{self, OutboundJob};
use prism_store::BlobFileStore;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::host_selector::{select_host, Host};
use crate::queue::{Job, JobQueue, Lease};

const CONNECT_TIMEOUT: Duration = outbound::CONNECT_TIMEOUT;

/// Runs dequeue → preflight → host-select → outbound → reconcile in a
/// loop until `queue.dequeue()` keeps returning `None`, at which point it
/// sleeps briefly and retries. Intended to be spawned once per configured
/// `workers` count (spec §6).
pub async fn run_worker_loop<Q, I>(
    queue: Q,
    index: Arc<I>,
    store: Arc<BlobFileStore>,
    hosts: Vec<Host>,
    max_blobs: u64,
    idle_poll: Duration,
) where
    Q: JobQueue,
    I: Index,
{
    loop {
        match queue.dequeue().await {
            Ok(Some(lease)) => {
                process_lease(&queue, &index, &store, &hosts, max_blobs, lease).await;
            }
            Ok(None) => tokio::time::sleep(idle_poll).await,
            Err(e) => {
                warn!(error = %e, "queue backend unavailable; exiting worker");
                return;
            }
        }
    }
}

async fn process_lease<Q: JobQueue, I: Index>(
    queue: &Q,
    index: &Arc<I>,
    store: &Arc<BlobFileStore>,
    hosts: &[Host],
    max_blobs: u64,
    lease: Lease,
) {
    match run_job(index, store, hosts, max_blobs, lease.job).await {
        Ok(()) => {
            let _ = queue.ack(lease.job_id).await;
        }
        Err(WorkerError::PreflightFailed) => {
            // Superseded or removed; drop the job without retry.
            let _ = queue.ack(lease.job_id).await;
        }
        Err(WorkerError::NoHost) | Err(WorkerError::Outbound(_)) => {
            let _ = queue.nack(lease.job_id).await;
        }
    }
}

#[derive(Debug)]
enum WorkerError {
    PreflightFailed,
    NoHost,
    Outbound(String),
}

/// Runs a single job to completion against a freshly chosen host. Exposed
/// directly (outside the loop) so tests can exercise one job without a
/// queue.
pub async fn run_job<I: Index>(
    index: &Arc<I>,
    store: &Arc<BlobFileStore>,
    hosts: &[Host],
    max_blobs: u64,
    job: Job,
) -> Result<(), WorkerError> {
    let outbound_job = match job {
        Job::ForwardBlob(hash) => {
            if !preflight_blob_ready(index, store, hash).await {
                return Err(WorkerError::PreflightFailed);
            }
            let payload = store
                .read_to_vec(&hash)
                .await
                .map_err(|e| WorkerError::Outbound(e.to_string()))?;
            OutboundJob::Blob { hash, payload }
        }
        Job::ForwardStream { sd_hash, .. } => {
            if !stream_ready_to_forward(index, store, sd_hash).await {
                return Err(WorkerError::PreflightFailed);
            }
            let sd_payload = store
                .read_to_vec(&sd_hash)
                .await
                .map_err(|e| WorkerError::Outbound(e.to_string()))?;
            let members = index
                .members_of_stream(sd_hash)
                .await
                .map_err(|e| WorkerError::Outbound(e.to_string()))?;
            let mut member_payloads = Vec::with_capacity(members.len());
            for member in members {
                let payload = store
                    .read_to_vec(&member)
                    .await
                    .map_err(|e| WorkerError::Outbound(e.to_string()))?;
                member_payloads.push((member, payload));
            }
            OutboundJob::Stream {
                sd_hash,
                sd_payload: Some(sd_payload),
                members: member_payloads,
            }
        }
    };

    let counts = index
        .host_counts()
        .await
        .map_err(|e| WorkerError::Outbound(e.to_string()))?;
    let host = select_host(hosts, &counts, max_blobs).map_err(|_| WorkerError::NoHost)?.clone();

    let stream = tokio::time::timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((host.address.as_str(), host.port)),
    )
    .await
    .map_err(|_| WorkerError::Outbound("connect timeout".to_string()))?
    .map_err(|e| WorkerError::Outbound(e.to_string()))?;

    // Whatever the downstream host acknowledged before a failure (if any)
    // must still be attached and deleted locally — only the unacknowledged
    // remainder is left for a future job (spec §4.7 step 5).
    let outcome = match outbound::run_job(stream, outbound_job).await {
        Ok(outcome) => outcome,
        Err((outcome, e)) => {
            reconcile_acknowledged(index, store, &host, &outcome).await;
            return Err(WorkerError::Outbound(e.to_string()));
        }
    };

    reconcile_acknowledged(index, store, &host, &outcome).await;

    info!(
        host = %host.display(),
        acknowledged = outcome.acknowledged.len(),
        "job forwarded"
    );

    Ok(())
}

async fn reconcile_acknowledged<I: Index>(
    index: &Arc<I>,
    store: &Arc<BlobFileStore>,
    host: &Host,
    outcome: &outbound::OutboundOutcome,
) {
    for hash in &outcome.acknowledged {
        if index.attach_blob_to_host(*hash, &host.display()).await.is_ok() {
            let _ = store.delete(hash).await;
        }
    }
}

async fn preflight_blob_ready<I: Index>(index: &Arc<I>, store: &Arc<BlobFileStore>, hash: Hash) -> bool {
    matches!(index.blob_exists(hash).await, Ok(true))
        && matches!(index.blob_forwarded(hash).await, Ok(false))
        && store.contains(&hash).await
}

async fn stream_ready_to_forward<I: Index>(
    index: &Arc<I>,
    store: &Arc<BlobFileStore>,
    sd_hash: Hash,
) -> bool {
    if !preflight_blob_ready(index, store, sd_hash).await {
        return false;
    }
    match index.needed_blobs_for_stream(sd_hash).await {
        Ok(Some(needed)) => needed.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_index::MemoryIndex;
    use std::time::SystemTime;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn forwards_single_blob_and_attaches_on_ack() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobFileStore::new(dir.path()));
        let index = Arc::new(MemoryIndex::new());

        let payload = b"hello worker".to_vec();
        let hash = Hash::digest(&payload);
        let mut writer = store.open_for_writing(hash, payload.len() as u64).await.unwrap();
        writer.write(&payload).await.unwrap();
        index
            .record_blob_completed(hash, payload.len() as u64, SystemTime::now())
            .await
            .unwrap();

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], br#"{"version":1}"#);
            sock.write_all(br#"{"version":1}"#).await.unwrap();

            let n = sock.read(&mut buf).await.unwrap();
            let _: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
            sock.write_all(br#"{"send_blob":true}"#).await.unwrap();

            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], payload.as_slice());
            sock.write_all(br#"{"received_blob":true}"#).await.unwrap();
        });

        let hosts = vec![Host {
            address: addr.ip().to_string(),
            port: addr.port(),
        }];

        run_job(&index, &store, &hosts, 100, Job::ForwardBlob(hash))
            .await
            .unwrap();
        server.await.unwrap();

        assert!(index.blob_forwarded(hash).await.unwrap());
        assert!(!store.contains(&hash).await);
    }

    /// If the downstream connection drops partway through a stream (after
    /// acknowledging the SD blob and the first member, before responding to
    /// the second), the blobs already acknowledged are still attached and
    /// deleted locally — only the unacknowledged remainder is left behind.
    #[tokio::test]
    async fn partial_stream_forward_reconciles_acknowledged_before_erroring() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobFileStore::new(dir.path()));
        let index = Arc::new(MemoryIndex::new());

        let member1_payload = b"member one".to_vec();
        let member2_payload = b"member two".to_vec();
        let member1 = Hash::digest(&member1_payload);
        let member2 = Hash::digest(&member2_payload);

        for (hash, payload) in [(member1, &member1_payload), (member2, &member2_payload)] {
            let mut writer = store.open_for_writing(hash, payload.len() as u64).await.unwrap();
            writer.write(payload).await.unwrap();
            index
                .record_blob_completed(hash, payload.len() as u64, SystemTime::now())
                .await
                .unwrap();
        }

        let manifest = serde_json::json!({
            "blobs": [
                {"blob_hash": member1.to_hex(), "length": member1_payload.len()},
                {"blob_hash": member2.to_hex(), "length": member2_payload.len()},
            ]
        });
        let sd_payload = manifest.to_string().into_bytes();
        let sd_hash = Hash::digest(&sd_payload);
        let mut sd_writer = store.open_for_writing(sd_hash, sd_payload.len() as u64).await.unwrap();
        sd_writer.write(&sd_payload).await.unwrap();
        index
            .record_blob_completed(sd_hash, sd_payload.len() as u64, SystemTime::now())
            .await
            .unwrap();
        let members = prism_core::SdBlobManifest::parse(&sd_payload).unwrap();
        index.register_sd_blob(sd_hash, members).await.unwrap();

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];

            sock.read(&mut buf).await.unwrap();
            sock.write_all(br#"{"version":1}"#).await.unwrap();

            sock.read(&mut buf).await.unwrap(); // sd_blob_hash/sd_blob_size
            sock.write_all(br#"{"send_sd_blob":true}"#).await.unwrap();
            sock.read(&mut buf).await.unwrap(); // sd blob bytes
            sock.write_all(br#"{"received_sd_blob":true}"#).await.unwrap();

            sock.read(&mut buf).await.unwrap(); // member1 blob_hash/blob_size
            sock.write_all(br#"{"send_blob":true}"#).await.unwrap();
            sock.read(&mut buf).await.unwrap(); // member1 bytes
            sock.write_all(br#"{"received_blob":true}"#).await.unwrap();

            sock.read(&mut buf).await.unwrap(); // member2 blob_hash/blob_size
                                                 // Drop the connection instead of replying: member2 never gets acked.
        });

        let hosts = vec![Host {
            address: addr.ip().to_string(),
            port: addr.port(),
        }];

        let result = run_job(
            &index,
            &store,
            &hosts,
            100,
            Job::ForwardStream {
                sd_hash,
                member_count: 2,
            },
        )
        .await;
        assert!(matches!(result, Err(WorkerError::Outbound(_))));
        server.await.unwrap();

        assert!(index.blob_forwarded(sd_hash).await.unwrap());
        assert!(!store.contains(&sd_hash).await);
        assert!(index.blob_forwarded(member1).await.unwrap());
        assert!(!store.contains(&member1).await);

        assert!(!index.blob_forwarded(member2).await.unwrap());
        assert!(store.contains(&member2).await);
    }

    #[tokio::test]
    async fn preflight_fails_for_unknown_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobFileStore::new(dir.path()));
        let index = Arc::new(MemoryIndex::new());
        let hash = Hash::digest(b"missing");

        let result = run_job(&index, &store, &[], 10, Job::ForwardBlob(hash)).await;
        assert!(matches!(result, Err(WorkerError::PreflightFailed)));
    }
}
