//! Node orchestration: wires together the index, store, queue, host
//! selector, worker pool, listener, and startup reconciler into one
//! running process (spec §4.3, §4.6-§4.9).
//!
//! Grounded in `s5_node::run_node`: build every resource from config,
//! optionally reconcile, spawn the long-running tasks, then block on
//! `tokio::signal::ctrl_c()` and shut down gracefully.

pub mod config;
pub mod host_selector;
pub mod listener;
pub mod queue;
pub mod reconciler;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use prism_index::{Index, MemoryIndex, RedbIndex};
use prism_store::BlobFileStore;
use tracing::info;

use config::ReflectorConfig;
use host_selector::Host;
use listener::Listener;
use queue::{JobQueue, MemoryJobQueue, QueueEnqueuer, RedbJobQueue};

/// How often an idle worker polls the queue for new work when it finds
/// nothing ready to dequeue.
const WORKER_IDLE_POLL: Duration = Duration::from_millis(500);

/// Opens the index backend named by `config`, without starting the rest
/// of the node. Used by operator-facing CLI subcommands (`cluster-info`,
/// `redistribute`, `repair`) that need index access but not a running
/// listener or worker pool.
pub fn open_index(config: &ReflectorConfig) -> anyhow::Result<Arc<dyn Index>> {
    if config.uses_fake_index() {
        Ok(Arc::new(MemoryIndex::new()))
    } else {
        Ok(Arc::new(RedbIndex::open(config.index_directory_path())?))
    }
}

/// Opens the job queue named by `config`, mirroring [`open_index`] for CLI
/// subcommands that need to enqueue jobs (`redistribute`) without running
/// the full node.
pub fn open_queue(config: &ReflectorConfig) -> anyhow::Result<Arc<dyn JobQueue>> {
    if config.uses_fake_index() {
        Ok(Arc::new(MemoryJobQueue::new()))
    } else {
        Ok(Arc::new(RedbJobQueue::open(
            config.blob_directory_path().join("queue"),
        )?))
    }
}

/// Runs a node to completion: construct resources from `config`, run
/// startup reconciliation if configured, spawn the listener and worker
/// pool, then wait for `ctrl_c` and shut down.
pub async fn run_node(config: ReflectorConfig) -> anyhow::Result<()> {
    let store = Arc::new(BlobFileStore::new(config.blob_directory_path()));
    store.ensure_dir().await?;

    let hosts = config.parsed_hosts();

    if config.uses_fake_index() {
        run_with_index(config, store, hosts, Arc::new(MemoryIndex::new()), MemoryJobQueue::new()).await
    } else {
        let index = Arc::new(RedbIndex::open(config.index_directory_path())?);
        let queue = RedbJobQueue::open(config.blob_directory_path().join("queue"))?;
        run_with_index(config, store, hosts, index, queue).await
    }
}

async fn run_with_index<I, Q>(
    config: ReflectorConfig,
    store: Arc<BlobFileStore>,
    hosts: Vec<Host>,
    index: Arc<I>,
    queue: Q,
) -> anyhow::Result<()>
where
    I: Index,
    Q: JobQueue + Clone,
{
    if config.enqueue_on_startup {
        let report = reconciler::reconcile(&store, &index, &queue).await?;
        info!(
            blob_jobs = report.blob_jobs_enqueued,
            stream_jobs = report.stream_jobs_enqueued,
            "startup reconciliation done"
        );
    }

    let enqueuer = Arc::new(QueueEnqueuer::new(queue.clone(), index.clone()));
    let listener = Listener::bind(
        config.listen.clone(),
        prism_protocol::wire::DEFAULT_PORT,
        store.clone(),
        index.clone(),
        enqueuer,
    )
    .await?;
    info!(addr = %listener.local_addr(), "listening");

    let worker_handles: Vec<_> = (0..config.workers.max(1))
        .map(|_| {
            let queue = queue.clone();
            let index = index.clone();
            let store = store.clone();
            let hosts = hosts.clone();
            let max_blobs = config.max_blobs;
            tokio::spawn(async move {
                worker::run_worker_loop(queue, index, store, hosts, max_blobs, WORKER_IDLE_POLL).await;
            })
        })
        .collect();

    listener::run_until_ctrl_c(listener).await?;

    for handle in worker_handles {
        handle.abort();
    }

    Ok(())
}
