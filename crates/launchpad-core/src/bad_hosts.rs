//! Shared set of hosts currently excluded from selection.
//!
//! `BadHosts` is a cheap-to-clone handle; every clone observes the same set.
//! Entries are added by the submission pipeline on host-level failures and
//! may also be added or cleared by anything else holding a handle (e.g. a
//! job poller that saw the host drop out).

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::{BadHostsConfig, LOCALHOST};

#[derive(Debug, Clone)]
pub struct BadHosts {
    /// host → instant it was marked bad.
    entries: Arc<DashMap<String, Instant>>,
    /// `None` keeps entries until explicitly removed.
    ttl: Option<Duration>,
}

impl BadHosts {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn from_config(cfg: &BadHostsConfig) -> Self {
        let ttl = (cfg.ttl_secs > 0).then(|| Duration::from_secs(cfg.ttl_secs));
        Self::new(ttl)
    }

    /// Mark `host` bad. Re-marking refreshes its expiry. `localhost` is
    /// never excluded.
    pub fn add(&self, host: &str) {
        if host == LOCALHOST {
            return;
        }
        if self.entries.insert(host.to_string(), Instant::now()).is_none() {
            info!(host, "host marked bad");
        }
    }

    /// Clear `host`, e.g. after a successful contact. Returns whether it
    /// was present.
    pub fn remove(&self, host: &str) -> bool {
        let removed = self.entries.remove(host).is_some();
        if removed {
            info!(host, "host cleared from bad hosts");
        }
        removed
    }

    pub fn contains(&self, host: &str) -> bool {
        let expired = match self.entries.get(host) {
            None => return false,
            Some(marked) => self.is_expired(*marked),
        };
        if expired {
            // Guard dropped above; re-check under the shard lock.
            if self
                .entries
                .remove_if(host, |_, marked| self.is_expired(*marked))
                .is_some()
            {
                debug!(host, "bad host entry expired");
            }
            return false;
        }
        true
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Sorted list of hosts currently excluded.
    pub fn snapshot(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !self.is_expired(*e.value()))
            .map(|e| e.key().clone())
            .collect();
        hosts.sort();
        hosts
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, marked: Instant) -> bool {
        self.ttl.is_some_and(|ttl| marked.elapsed() >= ttl)
    }
}

impl Default for BadHosts {
    fn default() -> Self {
        Self::new(None)
    }
}
