//! Node configuration (spec §6), loaded from TOML.
//!
//! Grounded in `s5_node::config::S5NodeConfig` — a plain `serde` struct
//! loaded once at startup and threaded through by value (spec §9's "treat
//! configuration as an immutable struct passed at construction" design
//! note), rather than hidden in process-wide state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::host_selector::Host;
use prism_protocol::wire::DEFAULT_PORT;

fn default_listen() -> String {
    "localhost".to_string()
}

fn default_hosts() -> Vec<String> {
    vec!["jack.lbry.tech".to_string()]
}

fn default_max_blobs() -> u64 {
    480_000
}

fn default_blob_directory() -> String {
    "~/.prism".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_redis_server() -> String {
    "localhost".to_string()
}

fn default_true() -> bool {
    true
}

/// Recognized options from spec §6, with the same field names (translated
/// from the original's space-separated TOML keys) and defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReflectorConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,

    #[serde(rename = "max blobs", default = "default_max_blobs")]
    pub max_blobs: u64,

    #[serde(rename = "blob directory", default = "default_blob_directory")]
    pub blob_directory: String,

    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Backing store endpoint. The sentinel `"fake"` selects
    /// [`prism_index::MemoryIndex`]; any other value selects a persistent
    /// `RedbIndex` rooted at `<blob directory>/index` — there is no Redis
    /// dependency in this workspace's stack, so this field is kept only
    /// for config-format compatibility and as that selector (see
    /// DESIGN.md).
    #[serde(rename = "redis server", default = "default_redis_server")]
    pub redis_server: String,

    #[serde(rename = "enqueue on startup", default = "default_true")]
    pub enqueue_on_startup: bool,

    #[serde(default)]
    pub verbose: bool,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            hosts: default_hosts(),
            max_blobs: default_max_blobs(),
            blob_directory: default_blob_directory(),
            workers: default_workers(),
            redis_server: default_redis_server(),
            enqueue_on_startup: default_true(),
            verbose: false,
        }
    }
}

impl ReflectorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Resolves `~` against `$HOME` the same way `s5_cli` expands
    /// environment-relative paths before using them.
    pub fn blob_directory_path(&self) -> PathBuf {
        expand_tilde(&self.blob_directory)
    }

    pub fn index_directory_path(&self) -> PathBuf {
        self.blob_directory_path().join("index")
    }

    pub fn uses_fake_index(&self) -> bool {
        self.redis_server == "fake"
    }

    /// Parses `hosts` into `(address, port)` pairs, defaulting to
    /// [`DEFAULT_PORT`] when a host entry has no `:port` suffix.
    pub fn parsed_hosts(&self) -> Vec<Host> {
        self.hosts
            .iter()
            .map(|entry| match entry.rsplit_once(':') {
                Some((addr, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
                    Host {
                        address: addr.to_string(),
                        port: port.parse().unwrap_or(DEFAULT_PORT),
                    }
                }
                _ => Host {
                    address: entry.clone(),
                    port: DEFAULT_PORT,
                },
            })
            .collect()
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
