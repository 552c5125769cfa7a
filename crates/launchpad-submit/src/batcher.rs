//! Grouping job submissions per `(platform, host)`.
//!
//! A task reserves a [`BatchSlot`] as soon as its `(platform, host)` is
//! chosen, writes its job file through the slot, and queues the job once
//! the install target is ready. The first job queued for a pair opens a
//! batch and starts its dispatcher. The dispatcher waits until no other
//! slot reserved for the pair is still preparing, then one scheduler yield
//! (or the configured window), and submits every queued job in one
//! `jobs-submit` call, handing each task its own result.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use launchpad_core::{Platform, RuntimeConfig};
use launchpad_remote::{
    construct_ssh_cmd, run_remote, CommandRunner, CommandSpec, ExecResult,
};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::make_archive;
use crate::error::{PlatformError, Result, SubmitError, MSG_SUBMIT};
use crate::job_file::{JobFile, JobFileWriter, JOB_LOG_DIR};
use crate::task::TaskToSubmit;

/// Prefix of the per-job result lines printed by `jobs-submit`.
pub const SUMMARY_PREFIX: &str = "[TASK JOB SUMMARY]";

/// One line of `jobs-submit` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub job_dir: String,
    pub ret_code: i32,
    pub job_id: Option<String>,
}

/// Parse the summary lines out of `jobs-submit` stdout:
/// `[TASK JOB SUMMARY]<time>|<job_dir>|<ret_code>|<job_id>`.
pub fn parse_summaries(stdout: &str) -> HashMap<String, JobSummary> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix(SUMMARY_PREFIX))
        .filter_map(|rest| {
            let mut fields = rest.split('|');
            let _time = fields.next()?;
            let job_dir = fields.next()?.trim().to_string();
            let ret_code = fields.next()?.trim().parse().ok()?;
            let job_id = fields
                .next()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            Some((job_dir.clone(), JobSummary { job_dir, ret_code, job_id }))
        })
        .collect()
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSubmitted {
    pub job_id: Option<String>,
}

type BatchKey = (String, String);

struct Pending {
    ticket: u64,
    job: JobFile,
    reply: oneshot::Sender<Result<JobSubmitted>>,
}

#[derive(Default)]
struct Queue {
    /// Jobs waiting for their batch to be dispatched.
    batches: HashMap<BatchKey, Vec<Pending>>,
    /// Reserved slots per pair whose job is not queued yet.
    preparing: HashMap<BatchKey, usize>,
    next_ticket: u64,
}

impl Queue {
    fn release(&mut self, key: &BatchKey) {
        if let Some(count) = self.preparing.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.preparing.remove(key);
            }
        }
    }
}

pub struct JobBatcher {
    queue: Mutex<Queue>,
    /// Woken whenever a reserved slot queues its job or goes away.
    settled: Notify,
    writer: JobFileWriter,
    runner: Arc<dyn CommandRunner>,
    remote_command: String,
    remote_run_dir: String,
    run_dir: PathBuf,
    localhost_target: String,
    window: Option<Duration>,
    timeout: Duration,
}

impl JobBatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        writer: JobFileWriter,
        runner: Arc<dyn CommandRunner>,
        remote_command: String,
        run_dir: PathBuf,
        remote_run_dir: String,
        localhost_target: String,
        window: Option<Duration>,
        timeout: Duration,
    ) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            settled: Notify::new(),
            writer,
            runner,
            remote_command,
            remote_run_dir,
            run_dir,
            localhost_target,
            window,
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().expect("submission queue poisoned")
    }

    /// Number of batches currently collecting jobs.
    pub fn open_batches(&self) -> usize {
        self.lock().batches.len()
    }

    /// Number of jobs queued and not yet handed to `jobs-submit`.
    pub fn queued_jobs(&self) -> usize {
        self.lock().batches.values().map(Vec::len).sum()
    }

    /// Reserve a place in the next batch for `host` on `platform`.
    ///
    /// Until the slot queues its job or is dropped, a batch for the same
    /// pair waits for it.
    pub fn reserve(self: &Arc<Self>, platform: Arc<Platform>, host: &str) -> BatchSlot {
        let key = (platform.name.clone(), host.to_string());
        *self.lock().preparing.entry(key.clone()).or_default() += 1;
        BatchSlot {
            batcher: Arc::clone(self),
            key,
            platform,
            job: None,
            reserved: true,
        }
    }

    /// Take a queued job back out of its batch. False once the batch has
    /// been handed to `jobs-submit`.
    fn withdraw(&self, key: &BatchKey, ticket: u64) -> bool {
        let mut queue = self.lock();
        let Some(batch) = queue.batches.get_mut(key) else {
            return false;
        };
        match batch.iter().position(|p| p.ticket == ticket) {
            Some(i) => {
                batch.remove(i);
                true
            }
            None => false,
        }
    }

    async fn close_batch(self: Arc<Self>, key: BatchKey, platform: Arc<Platform>) {
        let siblings = async {
            loop {
                let settled = self.settled.notified();
                let preparing = self.lock().preparing.contains_key(&key);
                if !preparing {
                    return;
                }
                settled.await;
            }
        };
        if tokio::time::timeout(self.timeout, siblings).await.is_err() {
            warn!(
                platform = %platform.name,
                host = %key.1,
                "tasks still preparing for this host, submitting without them"
            );
        }
        match self.window {
            Some(window) => tokio::time::sleep(window).await,
            None => tokio::task::yield_now().await,
        }
        self.dispatch(key, platform).await;
    }

    async fn dispatch(&self, key: BatchKey, platform: Arc<Platform>) {
        let batch = self.lock().batches.remove(&key).unwrap_or_default();
        if batch.is_empty() {
            return;
        }
        let (_, host) = &key;
        debug!(platform = %platform.name, host = %host, jobs = batch.len(), "dispatching batch");

        let job_dirs: Vec<String> = batch.iter().map(|p| p.job.job_dir.clone()).collect();
        let outcome = self.run_batch(&platform, host, &job_dirs).await;

        let (spec, res) = match outcome {
            Ok(ran) => ran,
            Err(e) => {
                for pending in batch {
                    let _ = pending.reply.send(Err(e.clone()));
                }
                return;
            }
        };

        let summaries = parse_summaries(&res.stdout);
        for pending in batch {
            let summary = summaries.get(&pending.job.job_dir);
            let result = job_result(&platform.name, host, &spec, &res, summary);
            if let Ok(JobSubmitted { job_id }) = &result {
                info!(
                    platform = %platform.name,
                    host = %host,
                    job = %pending.job.job_dir,
                    job_id = job_id.as_deref().unwrap_or("-"),
                    "job submitted"
                );
            }
            if pending.reply.send(result).is_err() {
                warn!(
                    job = %pending.job.job_dir,
                    "submitting task went away before its result arrived"
                );
            }
        }
    }

    /// Run one `jobs-submit` for `job_dirs`. Remote hosts receive the job
    /// files as a tar archive on stdin.
    async fn run_batch(
        &self,
        platform: &Platform,
        host: &str,
        job_dirs: &[String],
    ) -> Result<(CommandSpec, ExecResult)> {
        if platform.install_target == self.localhost_target {
            let spec = CommandSpec::new(&self.remote_command)
                .args(["jobs-submit", "--"])
                .arg(self.run_dir.join(JOB_LOG_DIR).to_string_lossy())
                .args(job_dirs.iter().cloned())
                .timeout(self.timeout);
            let res = run_remote(&*self.runner, spec.clone()).await;
            return Ok((spec, res));
        }

        let job_root = self.run_dir.join(JOB_LOG_DIR);
        let archive = make_archive(&*self.runner, &job_root, job_dirs).await?;
        let mut remote_args = vec![
            self.remote_command.clone(),
            "jobs-submit".to_string(),
            "--remote-mode".to_string(),
            "--".to_string(),
            format!("{}/{JOB_LOG_DIR}", self.remote_run_dir),
        ];
        remote_args.extend(job_dirs.iter().cloned());
        let spec = construct_ssh_cmd(&remote_args, platform, host)
            .stdin_file(archive.path())
            .timeout(self.timeout);
        let res = run_remote(&*self.runner, spec.clone()).await;
        Ok((spec, res))
    }
}

/// A task's place in the batch for one `(platform, host)`.
///
/// Dropping the slot before its job is queued releases the reservation.
pub struct BatchSlot {
    batcher: Arc<JobBatcher>,
    key: BatchKey,
    platform: Arc<Platform>,
    job: Option<JobFile>,
    reserved: bool,
}

impl BatchSlot {
    /// Render, write and check the task's job file for this host.
    ///
    /// A job file that fails to render or check fails only this task; it
    /// never joins the batch.
    pub async fn write_job(&mut self, task: &TaskToSubmit, rt: &RuntimeConfig) -> Result<()> {
        let (_, host) = &self.key;
        let job = self.batcher.writer.write(task, rt, &self.platform, host).await?;
        self.job = Some(job);
        Ok(())
    }

    /// Queue the written job and wait for its batch's result.
    ///
    /// If `abort` fires while the job is still queued it is withdrawn and
    /// `Cancelled` is returned. Once its batch has been handed to
    /// `jobs-submit` the real result is awaited.
    pub async fn submit(mut self, abort: &CancellationToken) -> Result<JobSubmitted> {
        let (platform, host) = self.key.clone();
        let job = self.job.take().ok_or_else(|| {
            SubmitError::Internal(format!("no job file written for {platform} on {host}"))
        })?;

        let (reply, mut rx) = oneshot::channel();
        let (ticket, opens_batch) = {
            let mut queue = self.batcher.lock();
            queue.release(&self.key);
            self.reserved = false;
            let ticket = queue.next_ticket;
            queue.next_ticket += 1;
            let opens_batch = !queue.batches.contains_key(&self.key);
            queue
                .batches
                .entry(self.key.clone())
                .or_default()
                .push(Pending { ticket, job, reply });
            (ticket, opens_batch)
        };
        self.batcher.settled.notify_waiters();

        if opens_batch {
            let batcher = Arc::clone(&self.batcher);
            tokio::spawn(batcher.close_batch(self.key.clone(), Arc::clone(&self.platform)));
        }

        let reply = tokio::select! {
            reply = &mut rx => reply,
            _ = abort.cancelled() => {
                if self.batcher.withdraw(&self.key, ticket) {
                    return Err(SubmitError::Cancelled);
                }
                debug!(platform = %platform, host = %host, "batch already submitting, waiting for result");
                rx.await
            }
        };
        reply.map_err(|_| {
            SubmitError::Internal(format!(
                "batch dispatcher for {platform} on {host} stopped without a result"
            ))
        })?
    }
}

impl Drop for BatchSlot {
    fn drop(&mut self) {
        if !self.reserved {
            return;
        }
        if let Ok(mut queue) = self.batcher.queue.lock() {
            queue.release(&self.key);
        }
        self.batcher.settled.notify_waiters();
    }
}

/// Result for one job of a batch that ran.
fn job_result(
    platform: &str,
    host: &str,
    spec: &CommandSpec,
    res: &ExecResult,
    summary: Option<&JobSummary>,
) -> Result<JobSubmitted> {
    if res.host_unreachable() {
        return Err(SubmitError::from_exec(MSG_SUBMIT, platform, host, spec, res));
    }
    match summary {
        Some(s) if s.ret_code == 0 => Ok(JobSubmitted {
            job_id: s.job_id.clone(),
        }),
        Some(s) => Err(SubmitError::Remote(PlatformError {
            ret_code: Some(s.ret_code),
            ..PlatformError::from_exec(
                &format!("{MSG_SUBMIT} for {}", s.job_dir),
                platform,
                spec,
                res,
            )
        })),
        None => Err(SubmitError::Remote(PlatformError::from_exec(
            &format!("{MSG_SUBMIT}: no result reported"),
            platform,
            spec,
            res,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use launchpad_core::config::WorkflowConfig;
    use launchpad_core::TaskId;
    use launchpad_remote::ProcessRunner;

    #[test]
    fn parses_summary_lines() {
        let out = "\
noise
[TASK JOB SUMMARY]2025-01-01T00:00:00Z|1/a/01|0|1234
[TASK JOB SUMMARY]2025-01-01T00:00:00Z|1/b/01|1|
[TASK JOB SUMMARY]garbage
";
        let got = parse_summaries(out);
        assert_eq!(got.len(), 2);
        assert_eq!(got["1/a/01"].job_id.as_deref(), Some("1234"));
        assert_eq!(got["1/b/01"].ret_code, 1);
        assert_eq!(got["1/b/01"].job_id, None);
    }

    #[test]
    fn job_results_per_summary() {
        let spec = CommandSpec::new("cylc");
        let res = ExecResult::default();
        let ok = JobSummary {
            job_dir: "1/a/01".into(),
            ret_code: 0,
            job_id: Some("99".into()),
        };
        assert_eq!(
            job_result("hpc", "h1", &spec, &res, Some(&ok)).unwrap().job_id.as_deref(),
            Some("99")
        );

        let missing = job_result("hpc", "h1", &spec, &res, None).unwrap_err();
        assert!(matches!(missing, SubmitError::Remote(_)));
    }

    fn batcher(root: &std::path::Path, window: Option<Duration>) -> Arc<JobBatcher> {
        let workflow = WorkflowConfig {
            id: "flow".into(),
            run_root: root.to_string_lossy().into_owned(),
            ..Default::default()
        };
        let runner: Arc<dyn CommandRunner> =
            Arc::new(ProcessRunner::new(2, Duration::from_secs(10)));
        let writer = JobFileWriter::new(workflow.clone(), Arc::clone(&runner), false);
        Arc::new(JobBatcher::new(
            writer,
            runner,
            "/nonexistent/cylc".into(),
            workflow.run_dir(),
            workflow.remote_run_dir(),
            "localhost".into(),
            window,
            Duration::from_secs(10),
        ))
    }

    async fn written_slot(b: &Arc<JobBatcher>, name: &str) -> BatchSlot {
        let mut task = TaskToSubmit::new(TaskId::new("1", name), RuntimeConfig::default());
        task.state.submit_num = 1;
        let mut slot = b.reserve(Arc::new(Platform::localhost()), "localhost");
        slot.write_job(&task, &task.runtime).await.unwrap();
        slot
    }

    async fn wait_queued(b: &JobBatcher, n: usize) {
        while b.queued_jobs() != n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn batch_waits_for_reserved_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let b = batcher(dir.path(), None);
        let first = written_slot(&b, "a").await;
        let sibling = written_slot(&b, "b").await;

        let waiting = tokio::spawn(async move { first.submit(&CancellationToken::new()).await });
        wait_queued(&b, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Still held back by the sibling's reservation.
        assert_eq!(b.queued_jobs(), 1);

        drop(sibling);
        let err = waiting.await.unwrap().unwrap_err();
        // The submit command cannot be started, which reads as an unreachable host.
        assert!(err.is_host_failure(), "{err:?}");
        assert_eq!(b.queued_jobs(), 0);
    }

    #[tokio::test]
    async fn abort_withdraws_queued_job() {
        let dir = tempfile::tempdir().unwrap();
        let b = batcher(dir.path(), Some(Duration::from_secs(5)));
        let slot = written_slot(&b, "a").await;
        let abort = CancellationToken::new();

        let token = abort.clone();
        let waiting = tokio::spawn(async move { slot.submit(&token).await });
        wait_queued(&b, 1).await;
        abort.cancel();

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, SubmitError::Cancelled), "{err:?}");
        assert_eq!(b.queued_jobs(), 0);
    }

    #[tokio::test]
    async fn lost_dispatcher_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let b = batcher(dir.path(), Some(Duration::from_secs(5)));
        let slot = written_slot(&b, "a").await;

        let waiting = tokio::spawn(async move { slot.submit(&CancellationToken::new()).await });
        wait_queued(&b, 1).await;
        // A dispatcher that dies drops the reply senders it holds.
        let taken: Vec<_> = b.lock().batches.drain().collect();
        drop(taken);

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, SubmitError::Internal(_)), "{err:?}");
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }

    #[test]
    fn unreachable_host_fails_whole_batch() {
        let spec = CommandSpec::new("ssh");
        let res = ExecResult {
            exit_code: 255,
            ..Default::default()
        };
        let ok = JobSummary {
            job_dir: "1/a/01".into(),
            ret_code: 0,
            job_id: None,
        };
        let err = job_result("hpc", "h1", &spec, &res, Some(&ok)).unwrap_err();
        assert!(err.is_host_failure());
    }
}
