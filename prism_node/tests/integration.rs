//! End-to-end scenarios S4-S6 and properties P4, P5, P7 from spec §8,
//! exercised across the store, index, queue, worker, and reconciler
//! together. S1-S3 are covered as unit tests in
//! `prism_protocol::inbound`, where the inbound state machine they
//! describe actually lives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use prism_core::Hash;
use prism_index::{Index, MemoryIndex};
use prism_node::host_selector::{select_host, Host};
use prism_node::queue::{Job, JobQueue, MemoryJobQueue};
use prism_node::reconciler::reconcile;
use prism_node::worker;
use prism_store::BlobFileStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn write_completed_blob(store: &BlobFileStore, index: &MemoryIndex, payload: &[u8]) -> Hash {
    let hash = Hash::digest(payload);
    let mut writer = store.open_for_writing(hash, payload.len() as u64).await.unwrap();
    writer.write(payload).await.unwrap();
    index
        .record_blob_completed(hash, payload.len() as u64, SystemTime::now())
        .await
        .unwrap();
    hash
}

/// S4: after SDH + its member are both locally present, a fresh
/// descriptor request for SDH reports `send_sd_blob: false,
/// needed_blobs: []`.
#[tokio::test]
async fn s4_second_descriptor_request_reports_nothing_needed() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlobFileStore::new(dir.path());
    let index = MemoryIndex::new();

    let member_payload = b"member bytes";
    let member = write_completed_blob(&store, &index, member_payload).await;

    let manifest = serde_json::json!({
        "blobs": [{"blob_hash": member.to_hex(), "length": member_payload.len()}]
    });
    let sd_payload = manifest.to_string().into_bytes();
    let sd_hash = write_completed_blob(&store, &index, &sd_payload).await;
    let members = prism_core::SdBlobManifest::parse(&sd_payload).unwrap();
    index.register_sd_blob(sd_hash, members).await.unwrap();

    let needed = index.needed_blobs_for_stream(sd_hash).await.unwrap();
    assert_eq!(needed, Some(vec![]));
}

/// S5: a worker that drains `ForwardBlob(BH)` against a host that acks
/// leaves `record.host = host1`, `BH` in `cluster_blobs`/`host_blobs`,
/// and deletes the local file.
#[tokio::test]
async fn s5_worker_forwards_blob_and_updates_index_and_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(BlobFileStore::new(dir.path()));
    let index = Arc::new(MemoryIndex::new());

    let payload = b"s5 payload";
    let hash = write_completed_blob(&store, &index, payload).await;

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        sock.read(&mut buf).await.unwrap();
        sock.write_all(br#"{"version":1}"#).await.unwrap();
        sock.read(&mut buf).await.unwrap();
        sock.write_all(br#"{"send_blob":true}"#).await.unwrap();
        sock.read(&mut buf).await.unwrap();
        sock.write_all(br#"{"received_blob":true}"#).await.unwrap();
    });

    let hosts = vec![Host {
        address: addr.ip().to_string(),
        port: addr.port(),
    }];

    worker::run_job(&index, &store, &hosts, 1000, Job::ForwardBlob(hash))
        .await
        .unwrap();
    server.await.unwrap();

    let record = index.get_record(hash).await.unwrap().unwrap();
    assert_eq!(record.host, hosts[0].display());
    assert!(index.blob_forwarded(hash).await.unwrap());
    assert!(!store.contains(&hash).await);
}

/// S6: startup reconciliation finds a leftover file whose record shows
/// `host != ""` and deletes it without enqueueing anything.
#[tokio::test]
async fn s6_startup_deletes_stale_forwarded_file_without_enqueue() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlobFileStore::new(dir.path());
    let index = Arc::new(MemoryIndex::new());
    let queue = MemoryJobQueue::new();

    let payload = b"already forwarded";
    let hash = write_completed_blob(&store, &index, payload).await;
    index.attach_blob_to_host(hash, "host1").await.unwrap();

    let report = reconcile(&store, &index, &queue).await.unwrap();
    assert_eq!(report.stale_files_deleted, 1);
    assert_eq!(report.blob_jobs_enqueued, 0);
    assert!(!store.contains(&hash).await);
    assert!(queue.dequeue().await.unwrap().is_none());
}

/// P4: concurrent duplicate jobs for the same hash settle to exactly one
/// successful `attach_blob_to_host`, because the second worker's
/// preflight finds `blob_forwarded(hash)` already true.
#[tokio::test]
async fn p4_only_one_concurrent_forward_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(BlobFileStore::new(dir.path()));
    let index = Arc::new(MemoryIndex::new());

    let payload = b"contested";
    let hash = write_completed_blob(&store, &index, payload).await;

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        sock.read(&mut buf).await.unwrap();
        sock.write_all(br#"{"version":1}"#).await.unwrap();
        sock.read(&mut buf).await.unwrap();
        sock.write_all(br#"{"send_blob":true}"#).await.unwrap();
        sock.read(&mut buf).await.unwrap();
        sock.write_all(br#"{"received_blob":true}"#).await.unwrap();
    });

    let hosts = vec![Host {
        address: addr.ip().to_string(),
        port: addr.port(),
    }];

    // First job runs to completion (attaches + deletes the file).
    worker::run_job(&index, &store, &hosts, 1000, Job::ForwardBlob(hash))
        .await
        .unwrap();
    server.await.unwrap();

    // A second, superseded job for the same hash now preflight-aborts:
    // the file is gone and the record shows it forwarded already.
    let result = worker::run_job(&index, &store, &hosts, 1000, Job::ForwardBlob(hash)).await;
    assert!(result.is_err());
}

/// P5: file/record coherence holds in both the "received, not forwarded"
/// and "forwarded" states.
#[tokio::test]
async fn p5_file_record_coherence() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlobFileStore::new(dir.path());
    let index = MemoryIndex::new();

    let payload = b"coherence";
    let hash = write_completed_blob(&store, &index, payload).await;
    assert!(store.contains(&hash).await);
    assert_eq!(index.get_record(hash).await.unwrap().unwrap().host, "");

    index.attach_blob_to_host(hash, "host9").await.unwrap();
    store.delete(&hash).await.unwrap();
    assert!(!store.contains(&hash).await);
    assert_eq!(index.get_record(hash).await.unwrap().unwrap().host, "host9");
}

/// P7: over many uniform-random selections among equal-capacity hosts,
/// each host's observed share is close to 1/#hosts.
#[test]
fn p7_host_selection_fairness() {
    let hosts = vec![
        Host { address: "a".into(), port: 1 },
        Host { address: "b".into(), port: 1 },
        Host { address: "c".into(), port: 1 },
        Host { address: "d".into(), port: 1 },
    ];
    let counts: HashMap<String, u64> = HashMap::new();

    let mut tallies = HashMap::new();
    const N: usize = 20_000;
    for _ in 0..N {
        let picked = select_host(&hosts, &counts, u64::MAX).unwrap();
        *tallies.entry(picked.address.clone()).or_insert(0u64) += 1;
    }

    let expected = N as f64 / hosts.len() as f64;
    for host in &hosts {
        let observed = *tallies.get(&host.address).unwrap_or(&0) as f64;
        // Binomial std dev for p=1/4, n=20000 is ~61; allow generous slack.
        assert!(
            (observed - expected).abs() < expected * 0.1,
            "host {} got {observed}, expected ~{expected}",
            host.address
        );
    }
}
