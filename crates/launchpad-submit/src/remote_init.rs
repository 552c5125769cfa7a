//! One-time preparation of an install target: create the remote run
//! directory, ship the contact file and collect the client's public key.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use launchpad_core::config::{InstallConfig, WorkflowConfig};
use launchpad_core::Platform;
use launchpad_remote::{construct_ssh_cmd, run_remote, CommandRunner};
use tracing::{error, info};

use crate::archive::make_archive;
use crate::error::{PlatformError, Result, SubmitError, MSG_INIT};
use crate::keys::KeyStore;

pub const KEY_START: &str = "KEYSTART";
pub const KEY_END: &str = "KEYEND";

/// Contact file path relative to the run directory.
pub const CONTACT_FILE: &str = ".service/contact";

/// Text between the key markers in remote-init output.
pub fn extract_key(stdout: &str) -> Option<&str> {
    let start = stdout.find(KEY_START)? + KEY_START.len();
    let end = stdout.rfind(KEY_END)?;
    (end >= start).then(|| &stdout[start..end])
}

pub struct RemoteInitializer {
    workflow: WorkflowConfig,
    install: InstallConfig,
    remote_command: String,
    runner: Arc<dyn CommandRunner>,
    keys: Arc<dyn KeyStore>,
    localhost_target: String,
    timeout: Duration,
}

impl RemoteInitializer {
    pub fn new(
        workflow: WorkflowConfig,
        install: InstallConfig,
        remote_command: String,
        runner: Arc<dyn CommandRunner>,
        keys: Arc<dyn KeyStore>,
        localhost_target: String,
        timeout: Duration,
    ) -> Self {
        Self {
            workflow,
            install,
            remote_command,
            runner,
            keys,
            localhost_target,
            timeout,
        }
    }

    /// `dir=path` arguments for the symlink directories configured for
    /// `install_target`.
    fn symlink_args(&self, install_target: &str) -> Vec<String> {
        self.install
            .symlink_dirs
            .get(install_target)
            .map(|dirs| {
                dirs.iter()
                    .filter(|(_, path)| !path.trim().is_empty())
                    .map(|(dir, path)| format!("{dir}={path}"))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Initialise `platform`'s install target through `host`.
    ///
    /// Succeeds immediately for the scheduler's own install target.
    pub async fn ensure_initialized(&self, platform: &Platform, host: &str) -> Result<()> {
        let target = &platform.install_target;
        if *target == self.localhost_target {
            return Ok(());
        }

        let run_dir = self.workflow.run_dir();
        let items: Vec<String> = if platform.communication_method.needs_contact_file()
            && run_dir.join(CONTACT_FILE).exists()
        {
            vec![CONTACT_FILE.to_string()]
        } else {
            Vec::new()
        };
        let archive = make_archive(&*self.runner, &run_dir, &items).await?;

        let mut remote_args = vec![
            self.remote_command.clone(),
            "remote-init".to_string(),
            target.clone(),
            self.workflow.remote_run_dir(),
        ];
        remote_args.extend(self.symlink_args(target));

        let spec = construct_ssh_cmd(&remote_args, platform, host)
            .stdin_file(PathBuf::from(archive.path()))
            .timeout(self.timeout);
        let res = run_remote(&*self.runner, spec.clone()).await;
        drop(archive);

        if res.success() {
            if let Some(key) = extract_key(&res.stdout) {
                self.keys.write_client_key(target, key).map_err(|e| {
                    SubmitError::Remote(PlatformError::new(
                        format!("{MSG_INIT}: cannot store client key: {e}"),
                        &platform.name,
                    ))
                })?;
                info!(install_target = %target, host, "remote init complete");
                return Ok(());
            }
        }

        let err = if res.success() {
            // Ran, but the output carries no key.
            SubmitError::Remote(PlatformError::from_exec(
                &format!("{MSG_INIT}: no client key in output"),
                &platform.name,
                &spec,
                &res,
            ))
        } else {
            SubmitError::from_exec(MSG_INIT, &platform.name, host, &spec, &res)
        };
        error!(
            install_target = %target,
            host,
            code = err.code(),
            "{err}"
        );
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_between_markers() {
        assert_eq!(extract_key("noise KEYSTARTabc123KEYEND more"), Some("abc123"));
        assert_eq!(extract_key("KEYSTART\nline1\nline2\nKEYEND\n"), Some("\nline1\nline2\n"));
    }

    #[test]
    fn missing_markers() {
        assert_eq!(extract_key("KEYSTART only"), None);
        assert_eq!(extract_key("KEYEND before KEYSTART"), None);
        assert_eq!(extract_key(""), None);
    }
}
