//! Turning a task's platform/host settings into an ordered sequence of
//! `(platform, host)` candidates.

use std::sync::Arc;
use std::time::Duration;

use launchpad_core::{
    BadHosts, HostIdentity, Platform, PlatformRegistry, RuntimeConfig, TaskId, LOCALHOST,
};
use launchpad_remote::CommandRunner;
use tracing::{debug, warn};

use crate::cache::SelectionCache;
use crate::error::{Result, SubmitError};
use crate::subshell::{eval_host, eval_platform};

/// What a resolution is cached under. The job runner only matters when a
/// host expression is used to find a platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolutionKey {
    pub platform: Option<String>,
    pub host: Option<String>,
    pub job_runner: Option<String>,
}

impl ResolutionKey {
    pub fn for_runtime(rt: &RuntimeConfig) -> Self {
        let host = rt.host_expr().map(str::to_string);
        Self {
            platform: rt.platform_expr().map(str::to_string),
            job_runner: host.as_ref().and(rt.job_runner.clone()),
            host,
        }
    }

    fn expr(&self) -> &str {
        self.host
            .as_deref()
            .or(self.platform.as_deref())
            .unwrap_or(LOCALHOST)
    }
}

/// Evaluated platform set for one key.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Name the expression evaluated to (platform or group).
    pub platform_string: String,
    pub platforms: Vec<Arc<Platform>>,
    /// Set when a host expression chose the host directly.
    pub fixed_host: Option<String>,
}

// ---------------------------------------------------------------------------
// HostSelector
// ---------------------------------------------------------------------------

/// Lazy per-task iterator over candidates.
///
/// Platforms are walked in group order and hosts in definition order. The
/// bad-hosts set is consulted on every step, so hosts marked bad by other
/// tasks after this iterator was created are skipped too.
#[derive(Debug)]
pub struct HostSelector {
    resolution: Arc<Resolution>,
    bad_hosts: BadHosts,
    platform_idx: usize,
    host_idx: usize,
}

impl HostSelector {
    pub fn new(resolution: Arc<Resolution>, bad_hosts: BadHosts) -> Self {
        Self {
            resolution,
            bad_hosts,
            platform_idx: 0,
            host_idx: 0,
        }
    }

    pub fn platform_string(&self) -> &str {
        &self.resolution.platform_string
    }
}

impl Iterator for HostSelector {
    type Item = (Arc<Platform>, String);

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(host) = &self.resolution.fixed_host {
            // Only one candidate; never retried.
            if self.platform_idx > 0 {
                return None;
            }
            self.platform_idx = 1;
            if host != LOCALHOST && self.bad_hosts.contains(host) {
                return None;
            }
            let platform = self.resolution.platforms.first()?;
            return Some((Arc::clone(platform), host.clone()));
        }

        while let Some(platform) = self.resolution.platforms.get(self.platform_idx) {
            while let Some(host) = platform.hosts.get(self.host_idx) {
                self.host_idx += 1;
                if host == LOCALHOST || !self.bad_hosts.contains(host) {
                    return Some((Arc::clone(platform), host.clone()));
                }
            }
            self.platform_idx += 1;
            self.host_idx = 0;
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Evaluates expressions through the shared cache and hands out selectors.
#[derive(Clone)]
pub struct Resolver {
    registry: Arc<dyn PlatformRegistry>,
    runner: Arc<dyn CommandRunner>,
    identity: HostIdentity,
    bad_hosts: BadHosts,
    eval_timeout: Duration,
    eval_wait: Duration,
}

impl Resolver {
    pub fn new(
        registry: Arc<dyn PlatformRegistry>,
        runner: Arc<dyn CommandRunner>,
        identity: HostIdentity,
        bad_hosts: BadHosts,
        eval_timeout: Duration,
        eval_wait: Duration,
    ) -> Self {
        Self {
            registry,
            runner,
            identity,
            bad_hosts,
            eval_timeout,
            eval_wait,
        }
    }

    /// Candidate selector for `task`.
    ///
    /// Fails with [`SubmitError::Evaluating`] when the expression is still
    /// being evaluated after the wait window; the evaluation carries on in
    /// the background and a later call picks up its result.
    pub async fn select(
        &self,
        cache: &SelectionCache,
        task: &TaskId,
        rt: &RuntimeConfig,
    ) -> Result<HostSelector> {
        if let (Some(host), Some(platform)) = (rt.host_expr(), rt.platform_expr()) {
            return Err(SubmitError::Config(format!(
                "task {task} sets both platform = {platform:?} and remote host = {host:?}"
            )));
        }

        let key = ResolutionKey::for_runtime(rt);
        let expr = key.expr().to_string();
        let this = self.clone();
        let eval_key = key.clone();
        let flight = cache
            .resolutions
            .get_or_start(key.clone(), cache.tick(), move || async move {
                this.resolve(&eval_key).await.map(Arc::new)
            });
        let generation = flight.generation();

        let resolution = match tokio::time::timeout(self.eval_wait, flight.wait()).await {
            Err(_elapsed) => {
                debug!(task = %task, expr = %expr, "expression still evaluating");
                return Err(SubmitError::Evaluating { expr });
            }
            Ok(None) => return Err(SubmitError::Cancelled),
            Ok(Some(Err(e))) => {
                // Don't pin a failed evaluation; the next tick re-runs it.
                cache.resolutions.invalidate(&key, generation);
                warn!(task = %task, expr = %expr, error = %e, "platform resolution failed");
                return Err(e);
            }
            Ok(Some(Ok(resolution))) => resolution,
        };

        Ok(HostSelector::new(resolution, self.bad_hosts.clone()))
    }

    async fn resolve(&self, key: &ResolutionKey) -> Result<Resolution> {
        match &key.host {
            Some(host_expr) => {
                let host =
                    eval_host(host_expr, &*self.runner, &self.identity, self.eval_timeout)
                        .await?;
                let name = self
                    .registry
                    .platform_for_host(&host, key.job_runner.as_deref())?;
                let platforms = self.registry.lookup(&name)?;
                debug!(
                    host_expr = %host_expr,
                    host = %host,
                    platform = %name,
                    "host expression resolved"
                );
                Ok(Resolution {
                    platform_string: name,
                    platforms,
                    fixed_host: Some(host),
                })
            }
            None => {
                let expr = key.platform.as_deref().unwrap_or_default();
                let name = eval_platform(expr, &*self.runner, self.eval_timeout).await?;
                let platforms = self.registry.lookup(&name)?;
                debug!(
                    expr,
                    platform = %name,
                    count = platforms.len(),
                    "platform expression resolved"
                );
                Ok(Resolution {
                    platform_string: name,
                    platforms,
                    fixed_host: None,
                })
            }
        }
    }
}
