//! Host selection (C3, spec §4.3): picks a downstream host for a forward
//! job among the configured hosts that are not yet at `max blobs` capacity.
//!
//! Grounded in the teacher's `s5_core` use of `rand` for endpoint/index
//! selection (see `examples/s5-dev-s5-rs/s5_core/Cargo.toml`'s `rand`
//! dependency); the selection rule itself (spec §4.3: uniform-random among
//! under-capacity hosts, error if none) comes from
//! `examples/original_source/prism/node.py`'s host-picking loop.

use rand::seq::SliceRandom;

pub use prism_core::error::HostSelectError;

/// A configured downstream host, parsed from `ReflectorConfig::hosts`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Host {
    pub address: String,
    pub port: u16,
}

impl Host {
    pub fn display(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Selects uniformly at random among hosts whose current blob count is
/// strictly below `max_blobs`. `counts` must contain an entry (possibly
/// zero) for every host in `hosts`; a host absent from `counts` is treated
/// as empty.
pub fn select_host<'a>(
    hosts: &'a [Host],
    counts: &std::collections::HashMap<String, u64>,
    max_blobs: u64,
) -> Result<&'a Host, HostSelectError> {
    let candidates: Vec<&Host> = hosts
        .iter()
        .filter(|h| counts.get(&h.display()).copied().unwrap_or(0) < max_blobs)
        .collect();

    candidates
        .choose(&mut rand::rng())
        .copied()
        .ok_or(HostSelectError::NoHostAvailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn host(addr: &str) -> Host {
        Host {
            address: addr.to_string(),
            port: 5566,
        }
    }

    #[test]
    fn picks_among_under_capacity_hosts() {
        let hosts = vec![host("a"), host("b"), host("c")];
        let mut counts = HashMap::new();
        counts.insert("a:5566".to_string(), 100);
        counts.insert("b:5566".to_string(), 5);
        counts.insert("c:5566".to_string(), 100);

        for _ in 0..20 {
            let picked = select_host(&hosts, &counts, 10).unwrap();
            assert_eq!(picked.address, "b");
        }
    }

    #[test]
    fn errors_when_all_hosts_full() {
        let hosts = vec![host("a"), host("b")];
        let mut counts = HashMap::new();
        counts.insert("a:5566".to_string(), 10);
        counts.insert("b:5566".to_string(), 10);

        let result = select_host(&hosts, &counts, 10);
        assert!(matches!(result, Err(HostSelectError::NoHostAvailable)));
    }

    #[test]
    fn missing_count_entry_treated_as_empty() {
        let hosts = vec![host("a")];
        let counts = HashMap::new();
        assert!(select_host(&hosts, &counts, 1).is_ok());
    }
}
