//! Runtime broadcasts: setting overrides applied on top of task definitions.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::types::{RuntimeConfig, TaskId};

/// Supplies the merged runtime configuration for a task.
pub trait RuntimeConfigSource: Send + Sync {
    fn runtime_config(&self, task: &TaskId, base: &RuntimeConfig) -> Result<RuntimeConfig>;
}

/// One broadcast. `None` selectors match every task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    #[serde(default)]
    pub point: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    pub settings: BTreeMap<String, String>,
}

impl Broadcast {
    fn matches(&self, task: &TaskId) -> bool {
        let point_ok = self
            .point
            .as_deref()
            .map_or(true, |p| p == "*" || p == task.point);
        let ns_ok = self
            .namespace
            .as_deref()
            .map_or(true, |n| n == "root" || n == task.name);
        point_ok && ns_ok
    }
}

/// In-memory broadcast table, applied in insertion order.
pub struct BroadcastStore {
    entries: RwLock<Vec<Broadcast>>,
}

impl BroadcastStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn put(&self, broadcast: Broadcast) {
        debug!(point = ?broadcast.point, namespace = ?broadcast.namespace, "broadcast added");
        self.entries
            .write()
            .expect("broadcast table poisoned")
            .push(broadcast);
    }

    /// Remove every broadcast. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write().expect("broadcast table poisoned");
        let n = entries.len();
        entries.clear();
        n
    }

    /// Overrides that apply to `task`, later broadcasts winning.
    pub fn overrides_for(&self, task: &TaskId) -> BTreeMap<String, String> {
        let entries = self.entries.read().expect("broadcast table poisoned");
        let mut merged = BTreeMap::new();
        for b in entries.iter().filter(|b| b.matches(task)) {
            merged.extend(b.settings.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }
}

impl Default for BroadcastStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfigSource for BroadcastStore {
    fn runtime_config(&self, task: &TaskId, base: &RuntimeConfig) -> Result<RuntimeConfig> {
        let overrides = self.overrides_for(task);
        if overrides.is_empty() {
            return Ok(base.clone());
        }
        base.with_overrides(&overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn no_broadcasts_returns_definition() {
        let store = BroadcastStore::new();
        let base = RuntimeConfig {
            platform: Some("desktop".into()),
            ..Default::default()
        };
        let rt = store.runtime_config(&TaskId::new("1", "a"), &base).unwrap();
        assert_eq!(rt, base);
    }

    #[test]
    fn selectors_limit_scope() {
        let store = BroadcastStore::new();
        store.put(Broadcast {
            point: Some("2".into()),
            namespace: None,
            settings: settings(&[("platform", "hpc")]),
        });
        store.put(Broadcast {
            point: None,
            namespace: Some("b".into()),
            settings: settings(&[("env.X", "1")]),
        });

        assert!(store.overrides_for(&TaskId::new("1", "a")).is_empty());
        assert_eq!(store.overrides_for(&TaskId::new("2", "a"))["platform"], "hpc");
        let both = store.overrides_for(&TaskId::new("2", "b"));
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn later_broadcast_wins() {
        let store = BroadcastStore::new();
        store.put(Broadcast {
            settings: settings(&[("platform", "one")]),
            ..Default::default()
        });
        store.put(Broadcast {
            namespace: Some("root".into()),
            settings: settings(&[("platform", "two")]),
            ..Default::default()
        });
        let rt = store
            .runtime_config(&TaskId::new("1", "a"), &RuntimeConfig::default())
            .unwrap();
        assert_eq!(rt.platform.as_deref(), Some("two"));
        assert_eq!(store.clear(), 2);
    }
}
