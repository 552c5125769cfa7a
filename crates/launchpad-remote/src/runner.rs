//! The command execution service: every crossing of the machine boundary
//! (subshell evaluation, ssh, rsync, tar) goes through a [`CommandRunner`].

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command as AsyncCommand;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::{
    error::{RemoteError, Result},
    types::{CommandSpec, ExecResult, HOST_UNREACHABLE},
};

/// Runs commands to completion and reports their output.
///
/// Implementations must not block the async runtime while a command runs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: CommandSpec) -> Result<ExecResult>;
}

/// [`CommandRunner`] backed by `tokio::process`.
///
/// At most `max_concurrent` child processes run at once; further commands
/// wait for a slot without blocking other tasks.
pub struct ProcessRunner {
    slots: Arc<Semaphore>,
    default_timeout: Duration,
}

impl ProcessRunner {
    pub fn new(max_concurrent: usize, default_timeout: Duration) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
            default_timeout,
        }
    }

    /// Stop handing out slots; queued commands fail with `Closed`.
    pub fn close(&self) {
        self.slots.close();
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: CommandSpec) -> Result<ExecResult> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| RemoteError::Closed)?;

        debug!(command = %spec.display(), "exec");

        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        let stdin = match &spec.stdin_file {
            Some(path) => Stdio::from(std::fs::File::open(path)?),
            None => Stdio::null(),
        };

        let child = AsyncCommand::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RemoteError::Spawn(format!("{}: {e}", spec.program)))?;

        // `wait_with_output` consumes the child, so drive it on its own task
        // and keep the PID for the timeout path.
        let pid = child.id();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(child.wait_with_output().await);
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(output))) => Ok(ExecResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: strip_text(&output.stdout),
                stderr: strip_text(&output.stderr),
            }),

            Ok(Ok(Err(e))) => Err(RemoteError::Io(e)),

            // The wait task was dropped without sending.
            Ok(Err(_recv_err)) => Err(RemoteError::Spawn(
                "wait task ended unexpectedly".to_string(),
            )),

            Err(_elapsed) => {
                if let Some(raw_pid) = pid {
                    // Safety: raw_pid is our direct child, still running.
                    #[cfg(unix)]
                    unsafe {
                        libc::kill(raw_pid as libc::pid_t, libc::SIGKILL);
                    }
                }
                warn!(
                    command = %spec.display(),
                    timeout_ms = timeout.as_millis() as u64,
                    "command killed after timeout"
                );
                Err(RemoteError::Timeout {
                    ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// Run a command whose failure to complete should look like an unreachable
/// host: a timeout or a spawn failure becomes exit code 255, so callers
/// treat it exactly like an ssh connection failure.
///
/// Other I/O failures (e.g. an unreadable stdin file) come back as exit
/// code 1.
pub async fn run_remote(runner: &dyn CommandRunner, spec: CommandSpec) -> ExecResult {
    match runner.run(spec).await {
        Ok(result) => result,
        Err(RemoteError::Timeout { ms }) => ExecResult {
            exit_code: HOST_UNREACHABLE,
            stdout: String::new(),
            stderr: format!("command timed out after {ms}ms"),
        },
        Err(e @ RemoteError::Spawn(_)) => ExecResult {
            exit_code: HOST_UNREACHABLE,
            stdout: String::new(),
            stderr: e.to_string(),
        },
        Err(e) => ExecResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: e.to_string(),
        },
    }
}

/// Strip ANSI escape codes and convert bytes to a UTF-8 string.
fn strip_text(raw: &[u8]) -> String {
    let clean = strip_ansi_escapes::strip(raw);
    String::from_utf8_lossy(&clean).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(2, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let res = runner()
            .run(CommandSpec::new("sh").args(["-c", "echo hello; exit 3"]))
            .await
            .unwrap();
        assert_eq!(res.exit_code, 3);
        assert_eq!(res.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn passes_env() {
        let res = runner()
            .run(
                CommandSpec::new("sh")
                    .args(["-c", "printf %s \"$LP_TEST\""])
                    .env("LP_TEST", "ok"),
            )
            .await
            .unwrap();
        assert_eq!(res.stdout, "ok");
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let err = runner()
            .run(
                CommandSpec::new("sleep")
                    .arg("5")
                    .timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Timeout { ms: 100 }));
    }

    #[tokio::test]
    async fn timeout_maps_to_unreachable() {
        let res = run_remote(
            &runner(),
            CommandSpec::new("sleep")
                .arg("5")
                .timeout(Duration::from_millis(100)),
        )
        .await;
        assert!(res.host_unreachable());
    }

    #[tokio::test]
    async fn missing_program_maps_to_unreachable() {
        let res = run_remote(&runner(), CommandSpec::new("/nonexistent/launchpad-test")).await;
        assert_eq!(res.exit_code, HOST_UNREACHABLE);
        assert!(res.host_unreachable());
        assert!(res.stderr.contains("spawn error"));
    }

    #[tokio::test]
    async fn unreadable_stdin_is_local_failure() {
        let res = run_remote(
            &runner(),
            CommandSpec::new("cat").stdin_file("/nonexistent/launchpad-archive.tar"),
        )
        .await;
        assert_eq!(res.exit_code, 1);
        assert!(!res.host_unreachable());
    }

    #[tokio::test]
    async fn closed_runner_rejects() {
        let r = runner();
        r.close();
        let err = r.run(CommandSpec::new("true")).await.unwrap_err();
        assert!(matches!(err, RemoteError::Closed));
    }
}
