//! Recognising names that refer to the scheduler's own host.

use std::collections::HashSet;

use crate::config::{HostConfig, LOCALHOST};

/// Names under which the scheduler host is known.
#[derive(Debug, Clone)]
pub struct HostIdentity {
    names: HashSet<String>,
}

impl HostIdentity {
    /// Build from the system hostname plus any configured aliases.
    pub fn detect(cfg: &HostConfig) -> Self {
        let mut names: Vec<String> = cfg.aliases.clone();
        if let Some(hostname) = system_hostname() {
            names.push(hostname);
        }
        Self::with_names(names)
    }

    pub fn with_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = HashSet::new();
        for name in names {
            let name = name.into().to_ascii_lowercase();
            if name.is_empty() {
                continue;
            }
            // Register the short form too so `host` matches `host.domain`.
            if let Some((short, _)) = name.split_once('.') {
                set.insert(short.to_string());
            }
            set.insert(name);
        }
        Self { names: set }
    }

    /// True when `name` is empty, a `localhost*` form, or one of our names.
    pub fn is_local(&self, name: &str) -> bool {
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return true;
        }
        let short = name.split('.').next().unwrap_or_default();
        short.starts_with(LOCALHOST) || self.names.contains(&name) || self.names.contains(short)
    }
}

fn system_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/proc/sys/kernel/hostname").ok())
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_forms_are_local() {
        let id = HostIdentity::with_names(Vec::<String>::new());
        assert!(id.is_local(""));
        assert!(id.is_local("localhost"));
        assert!(id.is_local("localhost4.localdomain4"));
        assert!(!id.is_local("backend1"));
    }

    #[test]
    fn own_names_match_short_and_long() {
        let id = HostIdentity::with_names(["Backend1.example.org"]);
        assert!(id.is_local("backend1"));
        assert!(id.is_local("backend1.example.org"));
        assert!(id.is_local("BACKEND1"));
        assert!(!id.is_local("backend2"));
    }
}
