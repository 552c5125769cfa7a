//! Copying the run directory's shared files to an install target.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use launchpad_core::config::WorkflowConfig;
use launchpad_core::Platform;
use launchpad_remote::{
    construct_rsync_over_ssh_cmd, run_remote, CommandRunner, CommandSpec, ExecResult,
};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::error::{Result, SubmitError, MSG_FILE_INSTALL};

/// Directory, relative to the run directory, holding file-install logs.
pub const LOG_DIR: &str = "log/remote-install";

pub struct FileInstaller {
    workflow: WorkflowConfig,
    excludes: Vec<String>,
    runner: Arc<dyn CommandRunner>,
    localhost_target: String,
    timeout: Duration,
}

impl FileInstaller {
    pub fn new(
        workflow: WorkflowConfig,
        excludes: Vec<String>,
        runner: Arc<dyn CommandRunner>,
        localhost_target: String,
        timeout: Duration,
    ) -> Self {
        Self {
            workflow,
            excludes,
            runner,
            localhost_target,
            timeout,
        }
    }

    /// rsync the run directory to `platform`'s install target via `host`.
    ///
    /// The scheduler's own install target shares the run directory and
    /// needs nothing copied.
    pub async fn ensure_files_installed(&self, platform: &Platform, host: &str) -> Result<()> {
        let target = &platform.install_target;
        if *target == self.localhost_target {
            return Ok(());
        }

        let run_dir = self.workflow.run_dir();
        let spec = construct_rsync_over_ssh_cmd(
            &run_dir.to_string_lossy(),
            &self.workflow.remote_run_dir(),
            platform,
            host,
            &self.excludes,
        )
        .timeout(self.timeout);
        let res = run_remote(&*self.runner, spec.clone()).await;

        if let Err(e) = write_install_log(&run_dir.join(LOG_DIR), target, &spec, &res).await {
            warn!(install_target = %target, error = %e, "cannot write file install log");
        }
        if !res.stderr.trim().is_empty() {
            warn!(
                install_target = %target,
                host,
                stderr = %res.stderr.trim(),
                "file install reported errors"
            );
        }

        if res.success() {
            info!(install_target = %target, host, "file install complete");
            return Ok(());
        }
        let err = SubmitError::from_exec(MSG_FILE_INSTALL, &platform.name, host, &spec, &res);
        error!(install_target = %target, host, code = err.code(), "{err}");
        Err(err)
    }
}

/// Next free two-digit log number in `dir` (01, 02, ...).
async fn next_log_number(dir: &Path) -> std::io::Result<u32> {
    let mut max = 0;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(1),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let n = name
            .to_str()
            .and_then(|n| n.split('-').next())
            .and_then(|n| n.parse::<u32>().ok());
        if let Some(n) = n {
            max = max.max(n);
        }
    }
    Ok(max + 1)
}

async fn write_install_log(
    dir: &Path,
    target: &str,
    spec: &CommandSpec,
    res: &ExecResult,
) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{:02}-start-{target}.log", next_log_number(dir).await?));

    let mut text = format!("$ {}\n", spec.display());
    if !res.stdout.is_empty() {
        text.push_str("\n### STDOUT:\n");
        text.push_str(&res.stdout);
    }
    if !res.stderr.is_empty() {
        text.push_str("\n### STDERR:\n");
        text.push_str(&res.stderr);
    }
    text.push_str(&format!("\n### EXIT: {}\n", res.exit_code));

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await?;
    Ok(path)
}
