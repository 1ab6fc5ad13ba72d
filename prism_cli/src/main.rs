use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::InfoLevel;
use directories::ProjectDirs;
use prism_core::Hash;
use prism_index::Index;
use prism_node::config::ReflectorConfig;
use toml_edit::{DocumentMut, Item, Table};
use tracing::info;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// which configured reflector node this command should run on
    #[arg(short, long, value_name = "NAME", default_value = "local")]
    node: String,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<InfoLevel>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Modify the node's config
    Config {
        #[command(subcommand)]
        cmd: CmdConfig,
    },
    /// Start the node: listener, worker pool, and (if configured) startup reconciliation
    Start,
    /// Report host_counts() and aggregate local/forwarded/SD-blob counts
    ClusterInfo,
    /// Detach up to COUNT blobs from --from and re-enqueue them for forwarding
    Redistribute {
        #[arg(long, value_name = "HOST")]
        from: String,
        #[arg(long, value_name = "HOST")]
        to: Option<String>,
        #[arg(long, value_name = "COUNT", default_value_t = 100)]
        count: usize,
    },
    /// Run the read-repair rule for I1/I2 against one hash, or every
    /// known blob if no hash is given
    Repair {
        hash: Option<String>,
    },
}

#[derive(Subcommand)]
enum CmdConfig {
    /// Creates the node config file with defaults if it doesn't exist
    Init,
}

impl CmdConfig {
    fn run(self, node_config_file: PathBuf) -> anyhow::Result<()> {
        let mut doc = if node_config_file.exists() {
            fs::read_to_string(&node_config_file)?
        } else {
            fs::create_dir_all(node_config_file.parent().unwrap())?;
            "".to_owned()
        }
        .parse::<DocumentMut>()
        .context("could not parse node config file")?;

        match self {
            Self::Init => {
                let defaults = ReflectorConfig::default();
                let defaults_toml = toml::to_string(&defaults)?.parse::<DocumentMut>()?;
                for (key, value) in defaults_toml.iter() {
                    if doc.get(key).is_none() {
                        doc.insert(key, value.clone());
                    }
                }
                let _ = Item::Table(Table::new());
            }
        }

        info!("writing to config file {node_config_file:?}");
        let tmp_path = node_config_file.with_extension("tmp");
        fs::write(&tmp_path, doc.to_string())?;
        fs::rename(&tmp_path, node_config_file)?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(cli.verbosity).init();

    let dirs = ProjectDirs::from("tech", "prism", "prism")
        .context("failed to determine config directory path")?;
    let node_config_file = dirs
        .config_dir()
        .join("nodes")
        .join(&cli.node)
        .with_extension("toml");

    if let Commands::Config { cmd } = cli.cmd {
        return cmd.run(node_config_file);
    }

    let toml_content = fs::read_to_string(&node_config_file)
        .with_context(|| format!("reading node config at {node_config_file:?}"))?;
    let config: ReflectorConfig = toml::from_str(&toml_content)?;

    match cli.cmd {
        Commands::Config { .. } => unreachable!("handled above"),
        Commands::Start => {
            prism_node::run_node(config).await?;
        }
        Commands::ClusterInfo => {
            run_cluster_info(&config).await?;
        }
        Commands::Redistribute { from, to, count } => {
            run_redistribute(&config, &from, to.as_deref(), count).await?;
        }
        Commands::Repair { hash } => {
            run_repair(&config, hash).await?;
        }
    }

    Ok(())
}

/// `cluster-info`: read-only report over `host_counts()` plus aggregate
/// local/forwarded/SD-blob counts, folding in a per-stream breakdown
/// (supplementing spec.md with the original's `get_cluster_info.py` and
/// `stream_summary.py`).
async fn run_cluster_info(config: &ReflectorConfig) -> anyhow::Result<()> {
    let index = prism_node::open_index(config)?;

    let counts = index.host_counts().await?;
    println!("host counts:");
    for (host, count) in &counts {
        println!("  {host}: {count}");
    }
    let total_forwarded: u64 = counts.values().sum();
    println!("total forwarded: {total_forwarded}");

    let unforwarded_streams = index.unforwarded_sd_blobs().await?;
    println!("unforwarded streams: {}", unforwarded_streams.len());
    for sd_hash in &unforwarded_streams {
        let members = index.members_of_stream(*sd_hash).await?;
        println!("  {} ({} members)", sd_hash.fmt_short(), members.len());
    }

    Ok(())
}

/// `redistribute --from HOST --to HOST --count N`: detaches up to `count`
/// blobs currently on `--from` and re-enqueues `ForwardBlob` jobs for
/// them. Does not move bytes between downstream hosts directly — a future
/// worker pass picks a host via the normal selector, which may or may not
/// be `--to` (supplementing spec.md with the original's
/// `redistribute_blobs.py`; spec.md §1 allows this simple helper while
/// excluding rebalancing beyond it).
async fn run_redistribute(
    config: &ReflectorConfig,
    from: &str,
    to: Option<&str>,
    count: usize,
) -> anyhow::Result<()> {
    if let Some(to) = to {
        info!(from, to, count, "redistributing (target host is advisory only)");
    } else {
        info!(from, count, "redistributing");
    }

    let index = prism_node::open_index(config)?;
    let queue = prism_node::open_queue(config)?;

    let candidates = index.host_blobs(from).await?;
    if candidates.is_empty() {
        println!("host {from} has no recorded blobs; nothing to redistribute");
        return Ok(());
    }

    let mut moved = 0usize;
    for hash in candidates.into_iter().take(count) {
        index.detach_blob_from_host(hash).await?;
        queue.enqueue(prism_node::queue::Job::ForwardBlob(hash)).await?;
        moved += 1;
    }

    println!("detached and re-enqueued {moved} blob(s) from {from}");
    Ok(())
}

/// `repair [HASH]`: runs `Index::repair_if_inconsistent` against one hash,
/// or reports that a full sweep needs a hash list the index doesn't expose
/// (mirrors the original's `get_cluster_info.py` consistency-check mode).
async fn run_repair(config: &ReflectorConfig, hash: Option<String>) -> anyhow::Result<()> {
    let index = prism_node::open_index(config)?;
    match hash {
        Some(hex) => {
            let hash: Hash = hex.parse().context("invalid hash")?;
            let repaired = index.repair_if_inconsistent(hash).await?;
            if repaired {
                println!("repaired inconsistent record for {}", hash.fmt_short());
            } else {
                println!("{} was consistent", hash.fmt_short());
            }
        }
        None => {
            println!("no hash given; a full sweep needs a blob enumeration this index backend does not expose");
        }
    }
    Ok(())
}
