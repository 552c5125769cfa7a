//! The per-task submission state machine.
//!
//! ```text
//! PendingResolution ─► PendingInit ─► PendingFileInstall ─► PendingSubmit ─► Submitted
//!        ▲                  │                 │                   │
//!        └──── host failure: mark host bad, take next candidate ──┘
//! ```
//!
//! The job file is written as soon as a host is chosen, before the install
//! target is prepared. Any other failure ends the attempt. Running out of
//! candidates ends it with `NoHostsAvailable`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use launchpad_core::{
    AttemptId, BadHosts, HostIdentity, LaunchpadConfig, Platform, PlatformRegistry,
    RuntimeConfig, RuntimeConfigSource, SubmitOutcome,
};
use launchpad_remote::CommandRunner;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::batcher::JobBatcher;
use crate::cache::{SelectionCache, SingleFlight};
use crate::error::{Result, SubmitError};
use crate::file_install::FileInstaller;
use crate::job_file::JobFileWriter;
use crate::keys::KeyStore;
use crate::remote_init::RemoteInitializer;
use crate::resolver::Resolver;
use crate::task::TaskToSubmit;

/// Times a task re-joins a shared init/file-install after it failed for
/// some other task's host.
const MAX_SHARED_RETRIES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PendingResolution,
    PendingInit,
    PendingFileInstall,
    PendingSubmit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::PendingResolution => "pending-resolution",
            Stage::PendingInit => "pending-init",
            Stage::PendingFileInstall => "pending-file-install",
            Stage::PendingSubmit => "pending-submit",
        };
        f.write_str(s)
    }
}

/// External services the pipeline is built on.
pub struct PipelineServices {
    pub runner: Arc<dyn CommandRunner>,
    pub registry: Arc<dyn PlatformRegistry>,
    pub runtime: Arc<dyn RuntimeConfigSource>,
    pub keys: Arc<dyn KeyStore>,
    pub bad_hosts: BadHosts,
    pub identity: HostIdentity,
}

pub struct SubmitPipeline {
    resolver: Resolver,
    cache: SelectionCache,
    initializer: Arc<RemoteInitializer>,
    installer: Arc<FileInstaller>,
    batcher: Arc<JobBatcher>,
    runtime: Arc<dyn RuntimeConfigSource>,
    bad_hosts: BadHosts,
}

impl SubmitPipeline {
    pub fn new(config: &LaunchpadConfig, services: PipelineServices) -> Self {
        let submit = &config.submit;
        let command_timeout = Duration::from_secs(submit.command_timeout_secs);
        let localhost_target = services.registry.localhost_install_target().to_string();
        let workflow = config.workflow.clone();

        let resolver = Resolver::new(
            Arc::clone(&services.registry),
            Arc::clone(&services.runner),
            services.identity,
            services.bad_hosts.clone(),
            Duration::from_secs(submit.eval_timeout_secs),
            Duration::from_millis(submit.eval_wait_ms),
        );
        let initializer = RemoteInitializer::new(
            workflow.clone(),
            config.install.clone(),
            submit.remote_command.clone(),
            Arc::clone(&services.runner),
            services.keys,
            localhost_target.clone(),
            command_timeout,
        );
        let installer = FileInstaller::new(
            workflow.clone(),
            config.install.exclude.clone(),
            Arc::clone(&services.runner),
            localhost_target.clone(),
            command_timeout,
        );
        let writer = JobFileWriter::new(
            workflow.clone(),
            Arc::clone(&services.runner),
            submit.check_syntax,
        );
        let batcher = JobBatcher::new(
            writer,
            services.runner,
            submit.remote_command.clone(),
            workflow.run_dir(),
            workflow.remote_run_dir(),
            localhost_target,
            (submit.batch_window_ms > 0).then_some(Duration::from_millis(submit.batch_window_ms)),
            command_timeout,
        );

        Self {
            resolver,
            cache: SelectionCache::new(submit.cache_idle_ticks),
            initializer: Arc::new(initializer),
            installer: Arc::new(installer),
            batcher: Arc::new(batcher),
            runtime: services.runtime,
            bad_hosts: services.bad_hosts,
        }
    }

    pub fn cache(&self) -> &SelectionCache {
        &self.cache
    }

    pub fn bad_hosts(&self) -> &BadHosts {
        &self.bad_hosts
    }

    /// Mark the start of a scheduler tick. Returns the new tick number.
    pub fn begin_tick(&self) -> u64 {
        self.cache.advance_tick()
    }

    /// Submit a set of tasks concurrently as one tick.
    pub async fn submit_all(
        &self,
        tasks: Vec<TaskToSubmit>,
    ) -> Vec<(TaskToSubmit, SubmitOutcome)> {
        self.begin_tick();
        join_all(tasks.into_iter().map(|mut task| async move {
            let outcome = self.submit(&mut task).await;
            (task, outcome)
        }))
        .await
    }

    /// Take `task` through one submission attempt.
    pub async fn submit(&self, task: &mut TaskToSubmit) -> SubmitOutcome {
        self.submit_until(task, &CancellationToken::new()).await
    }

    /// Like [`submit`](Self::submit), but stops early once `abort` fires.
    ///
    /// A task stopped before its job was handed to `jobs-submit` comes back
    /// `Deferred` with its state as it was before the attempt. A task whose
    /// batch is already being submitted gets the real result.
    pub async fn submit_until(
        &self,
        task: &mut TaskToSubmit,
        abort: &CancellationToken,
    ) -> SubmitOutcome {
        let attempt = AttemptId::new();
        let span = info_span!("submit", task = %task.id, attempt = %attempt);
        self.run_attempt(task, abort).instrument(span).await
    }

    async fn run_attempt(
        &self,
        task: &mut TaskToSubmit,
        abort: &CancellationToken,
    ) -> SubmitOutcome {
        let before = task.state.clone();
        debug!(stage = %Stage::PendingResolution, "resolving platform");
        let rt = match self.runtime.runtime_config(&task.id, &task.runtime) {
            Ok(rt) => rt,
            Err(e) => return failed(task, e.into()),
        };

        let selection = until(abort, self.resolver.select(&self.cache, &task.id, &rt)).await;
        let mut candidates = match selection {
            Ok(selector) => selector,
            Err(SubmitError::Evaluating { expr }) => {
                return SubmitOutcome::Deferred {
                    reason: format!("still evaluating {expr}"),
                }
            }
            Err(SubmitError::Cancelled) => return deferred_by_shutdown(),
            Err(e) => return failed(task, e),
        };

        task.state.submit_num += 1;
        loop {
            let Some((platform, host)) = candidates.next() else {
                let platform = candidates.platform_string().to_string();
                warn!(platform = %platform, "no hosts available");
                task.state.last_error = Some(format!("no hosts available for {platform}"));
                return SubmitOutcome::NoHostsAvailable { platform };
            };
            task.state.platform = Some(platform.name.clone());
            task.state.host = Some(host.clone());

            match self.attempt_host(task, &rt, &platform, &host, abort).await {
                Ok(job_id) => {
                    self.bad_hosts.remove(&host);
                    task.state.job_id = job_id.clone();
                    task.state.last_error = None;
                    return SubmitOutcome::Submitted {
                        platform: platform.name.clone(),
                        host,
                        job_id,
                    };
                }
                Err(SubmitError::HostUnreachable { host: failed_host, detail }) => {
                    warn!(
                        platform = %platform.name,
                        host = %failed_host,
                        reason = %detail.message,
                        "host unreachable, trying next candidate"
                    );
                    self.bad_hosts.add(&failed_host);
                }
                Err(e) if e.is_job_file_failure() => {
                    warn!(error = %e, "job file rejected");
                    task.state.last_error = Some(e.to_string());
                    return SubmitOutcome::SyntaxError {
                        detail: e.to_string(),
                    };
                }
                Err(SubmitError::Cancelled) => {
                    task.state = before;
                    return deferred_by_shutdown();
                }
                Err(e) => return failed(task, e),
            }
        }
    }

    /// Stages after resolution for one candidate.
    async fn attempt_host(
        &self,
        task: &TaskToSubmit,
        rt: &RuntimeConfig,
        platform: &Arc<Platform>,
        host: &str,
        abort: &CancellationToken,
    ) -> Result<Option<String>> {
        let mut slot = self.batcher.reserve(Arc::clone(platform), host);
        until(abort, slot.write_job(task, rt)).await?;

        debug!(stage = %Stage::PendingInit, platform = %platform.name, host, "remote init");
        let init = Arc::clone(&self.initializer);
        let initialized = self.shared_stage(&self.cache.remote_inits, platform, host, move |p, h| {
            let init = Arc::clone(&init);
            async move { init.ensure_initialized(&p, &h).await }
        });
        until(abort, initialized).await?;

        debug!(
            stage = %Stage::PendingFileInstall,
            platform = %platform.name,
            host,
            "file install"
        );
        let installer = Arc::clone(&self.installer);
        let installed = self.shared_stage(&self.cache.file_installs, platform, host, move |p, h| {
            let installer = Arc::clone(&installer);
            async move { installer.ensure_files_installed(&p, &h).await }
        });
        until(abort, installed).await?;

        debug!(stage = %Stage::PendingSubmit, platform = %platform.name, host, "submitting");
        let submitted = slot.submit(abort).await?;
        info!(platform = %platform.name, host, job_id = ?submitted.job_id, "submitted");
        Ok(submitted.job_id)
    }

    /// Run a once-per-install-target stage through its cache.
    ///
    /// A failed result is evicted so a later candidate retries. When the
    /// shared attempt failed on some other task's host, that host is marked
    /// bad and the stage is retried through `host`.
    async fn shared_stage<F, Fut>(
        &self,
        cache: &SingleFlight<String, Result<()>>,
        platform: &Arc<Platform>,
        host: &str,
        op: F,
    ) -> Result<()>
    where
        F: Fn(Arc<Platform>, String) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let target = platform.install_target.clone();
        let mut last_err = SubmitError::Cancelled;
        for _ in 0..MAX_SHARED_RETRIES {
            let flight = cache.get_or_start(target.clone(), self.cache.tick(), || {
                op(Arc::clone(platform), host.to_string())
            });
            let leader = flight.leader;
            let generation = flight.generation();

            match flight.wait().await.unwrap_or(Err(SubmitError::Cancelled)) {
                Ok(()) => {
                    if leader {
                        self.bad_hosts.remove(host);
                    }
                    return Ok(());
                }
                Err(e) => {
                    cache.invalidate(&target, generation);
                    let other_host = match &e {
                        SubmitError::HostUnreachable { host: failed, .. }
                            if failed.as_str() != host && !self.bad_hosts.contains(host) =>
                        {
                            failed.clone()
                        }
                        _ => return Err(e),
                    };
                    debug!(
                        install_target = %target,
                        failed_host = %other_host,
                        host,
                        "shared stage failed elsewhere, retrying through own host"
                    );
                    self.bad_hosts.add(&other_host);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

/// Run `work` unless `abort` fires first.
async fn until<T>(
    abort: &CancellationToken,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        res = work => res,
        _ = abort.cancelled() => Err(SubmitError::Cancelled),
    }
}

fn failed(task: &mut TaskToSubmit, e: SubmitError) -> SubmitOutcome {
    if matches!(e, SubmitError::Internal(_)) {
        error!(code = e.code(), error = %e, "submission failed");
    } else {
        warn!(code = e.code(), error = %e, "submission failed");
    }
    task.state.last_error = Some(e.to_string());
    SubmitOutcome::SubmitFailed {
        reason: e.to_string(),
    }
}

fn deferred_by_shutdown() -> SubmitOutcome {
    SubmitOutcome::Deferred {
        reason: "submission pipeline shutting down".to_string(),
    }
}
