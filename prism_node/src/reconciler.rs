//! Startup reconciler (C9, spec §4.9).
//!
//! Runs once at boot when `enqueue on startup` is set. Grounded in
//! `examples/original_source/prism/node.py`'s boot-time directory scan:
//! list the blob directory, classify each validly-named file by its
//! index record, enqueue or delete accordingly, then sweep
//! `unforwarded_sd_blobs()` for streams whose forward never completed.

use std::sync::Arc;

use prism_index::Index;
use prism_store::BlobFileStore;
use tracing::{info, warn};

use crate::queue::{Job, JobQueue};

/// Caps how many on-disk files are inspected per startup run (spec §4.9:
/// "best-effort and bounded... to cap startup cost").
pub const MAX_RECONCILE_FILES: usize = 10_000;

pub struct ReconcileReport {
    pub blob_jobs_enqueued: usize,
    pub stale_files_deleted: usize,
    pub stream_jobs_enqueued: usize,
}

pub async fn reconcile<Q: JobQueue, I: Index>(
    store: &BlobFileStore,
    index: &Arc<I>,
    queue: &Q,
) -> anyhow::Result<ReconcileReport> {
    let mut report = ReconcileReport {
        blob_jobs_enqueued: 0,
        stale_files_deleted: 0,
        stream_jobs_enqueued: 0,
    };

    let hashes = store.list_hashes().await?;
    for hash in hashes.into_iter().take(MAX_RECONCILE_FILES) {
        match index.get_record(hash).await {
            Ok(Some(record)) if record.host.is_empty() => {
                if let Err(e) = queue.enqueue(Job::ForwardBlob(hash)).await {
                    warn!(hash = %hash, error = %e, "failed to enqueue reconciled blob");
                    continue;
                }
                report.blob_jobs_enqueued += 1;
            }
            Ok(Some(_)) => {
                if let Err(e) = store.delete(&hash).await {
                    warn!(hash = %hash, error = %e, "failed to delete stale reconciled file");
                } else {
                    report.stale_files_deleted += 1;
                }
            }
            Ok(None) => {
                // On disk but unknown to the index: not addressed by spec
                // §4.9's classification (it only covers files whose record
                // exists); leave untouched rather than guessing.
                warn!(hash = %hash, "reconciled file has no index record; leaving in place");
            }
            Err(e) => {
                warn!(hash = %hash, error = %e, "index lookup failed during reconciliation");
            }
        }
    }

    match index.unforwarded_sd_blobs().await {
        Ok(unforwarded) => {
            for sd_hash in unforwarded {
                let member_count = index
                    .members_of_stream(sd_hash)
                    .await
                    .map(|m| m.len() as u64)
                    .unwrap_or(0);
                if let Err(e) = queue
                    .enqueue(Job::ForwardStream {
                        sd_hash,
                        member_count,
                    })
                    .await
                {
                    warn!(sd_hash = %sd_hash, error = %e, "failed to enqueue reconciled stream");
                    continue;
                }
                report.stream_jobs_enqueued += 1;
            }
        }
        Err(e) => warn!(error = %e, "failed to list unforwarded SD blobs during reconciliation"),
    }

    info!(
        blob_jobs = report.blob_jobs_enqueued,
        stale_deleted = report.stale_files_deleted,
        stream_jobs = report.stream_jobs_enqueued,
        "startup reconciliation complete"
    );

    Ok(report)
}
