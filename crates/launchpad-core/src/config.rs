use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const LOCALHOST: &str = "localhost";
pub const DEFAULT_JOB_RUNNER: &str = "background";
pub const DEFAULT_SSH_COMMAND: &str = "ssh -oBatchMode=yes -oConnectTimeout=10";
pub const DEFAULT_REMOTE_COMMAND: &str = "cylc";
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_EVAL_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_EVAL_WAIT_MS: u64 = 2_000;
pub const DEFAULT_MAX_CONCURRENT_COMMANDS: usize = 16;
pub const DEFAULT_CACHE_IDLE_TICKS: u64 = 1;
pub const DEFAULT_BAD_HOST_TTL_SECS: u64 = 1_800; // 30 minutes

/// Top-level config (launchpad.toml + LAUNCHPAD_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchpadConfig {
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub submit: SubmitConfig,
    #[serde(default)]
    pub bad_hosts: BadHostsConfig,
    /// Ordered: host-to-platform reverse lookup depends on definition order.
    #[serde(default)]
    pub platforms: Vec<PlatformConfig>,
    #[serde(default)]
    pub platform_groups: Vec<PlatformGroupConfig>,
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub host: HostConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Workflow registration name, e.g. `nwp/run1`.
    #[serde(default = "default_workflow_id")]
    pub id: String,
    /// Local root holding all workflow run directories.
    #[serde(default = "default_run_root")]
    pub run_root: String,
    /// Remote root, relative to `$HOME` on the install target.
    #[serde(default = "default_remote_run_root")]
    pub remote_run_root: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            id: default_workflow_id(),
            run_root: default_run_root(),
            remote_run_root: default_remote_run_root(),
        }
    }
}

impl WorkflowConfig {
    /// Local run directory of this workflow.
    pub fn run_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.run_root).join(&self.id)
    }

    /// Run directory on a remote install target, relative to the remote
    /// login directory.
    pub fn remote_run_dir(&self) -> String {
        format!("{}/{}", self.remote_run_root, self.id)
    }

    /// Service directory (`.service`) holding the contact file and keys.
    pub fn service_dir(&self) -> std::path::PathBuf {
        self.run_dir().join(".service")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitConfig {
    /// Upper bound on any single remote command (init, install, submit).
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Upper bound on a host/platform subshell evaluation.
    #[serde(default = "default_eval_timeout_secs")]
    pub eval_timeout_secs: u64,
    /// How long one pipeline pass waits on a running evaluation before the
    /// task is deferred to the next tick.
    #[serde(default = "default_eval_wait_ms")]
    pub eval_wait_ms: u64,
    #[serde(default = "default_max_concurrent_commands")]
    pub max_concurrent_commands: usize,
    /// 0 = dispatch once every reserved sibling has queued, plus one yield.
    #[serde(default)]
    pub batch_window_ms: u64,
    /// Executable invoked on the remote side (`remote-init`, `jobs-submit`).
    #[serde(default = "default_remote_command")]
    pub remote_command: String,
    /// Completed cache entries unused for this many ticks are evicted.
    #[serde(default = "default_cache_idle_ticks")]
    pub cache_idle_ticks: u64,
    /// Run `bash -n` over each rendered job file.
    #[serde(default = "bool_true")]
    pub check_syntax: bool,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            eval_timeout_secs: default_eval_timeout_secs(),
            eval_wait_ms: default_eval_wait_ms(),
            max_concurrent_commands: default_max_concurrent_commands(),
            batch_window_ms: 0,
            remote_command: default_remote_command(),
            cache_idle_ticks: default_cache_idle_ticks(),
            check_syntax: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadHostsConfig {
    /// Seconds a host stays excluded. 0 disables expiry.
    #[serde(default = "default_bad_host_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for BadHostsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_bad_host_ttl_secs(),
        }
    }
}

/// How jobs on a platform talk back to the scheduler.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommsMethod {
    #[default]
    Zmq,
    Ssh,
    Poll,
}

impl CommsMethod {
    /// Whether jobs need the contact file installed on the remote.
    pub fn needs_contact_file(self) -> bool {
        matches!(self, CommsMethod::Zmq | CommsMethod::Ssh)
    }
}

impl std::fmt::Display for CommsMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Zmq => write!(f, "zmq"),
            Self::Ssh => write!(f, "ssh"),
            Self::Poll => write!(f, "poll"),
        }
    }
}

/// One `[[platforms]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub name: String,
    /// Candidate hosts in preference order. Empty means `[name]`.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Defaults to the platform name.
    pub install_target: Option<String>,
    #[serde(default)]
    pub communication_method: CommsMethod,
    #[serde(default = "default_job_runner")]
    pub job_runner: String,
    #[serde(default = "default_ssh_command")]
    pub ssh_command: String,
    /// Extra run-directory paths copied by file installation.
    #[serde(default)]
    pub rsync_includes: Vec<String>,
}

impl PlatformConfig {
    pub fn localhost() -> Self {
        Self {
            name: LOCALHOST.to_string(),
            hosts: vec![LOCALHOST.to_string()],
            install_target: Some(LOCALHOST.to_string()),
            communication_method: CommsMethod::Zmq,
            job_runner: default_job_runner(),
            ssh_command: default_ssh_command(),
            rsync_includes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformGroupConfig {
    pub name: String,
    pub platforms: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallConfig {
    /// install target → { dir name → path } applied by remote init.
    #[serde(default)]
    pub symlink_dirs: BTreeMap<String, BTreeMap<String, String>>,
    /// Extra rsync exclude patterns.
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// Additional names that refer to the scheduler host.
    #[serde(default)]
    pub aliases: Vec<String>,
}

fn bool_true() -> bool {
    true
}
fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}
fn default_workflow_id() -> String {
    "default".to_string()
}
fn default_run_root() -> String {
    format!("{}/cylc-run", home_dir())
}
fn default_remote_run_root() -> String {
    "cylc-run".to_string()
}
fn default_command_timeout_secs() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}
fn default_eval_timeout_secs() -> u64 {
    DEFAULT_EVAL_TIMEOUT_SECS
}
fn default_eval_wait_ms() -> u64 {
    DEFAULT_EVAL_WAIT_MS
}
fn default_max_concurrent_commands() -> usize {
    DEFAULT_MAX_CONCURRENT_COMMANDS
}
fn default_remote_command() -> String {
    DEFAULT_REMOTE_COMMAND.to_string()
}
fn default_cache_idle_ticks() -> u64 {
    DEFAULT_CACHE_IDLE_TICKS
}
fn default_bad_host_ttl_secs() -> u64 {
    DEFAULT_BAD_HOST_TTL_SECS
}
fn default_job_runner() -> String {
    DEFAULT_JOB_RUNNER.to_string()
}
fn default_ssh_command() -> String {
    DEFAULT_SSH_COMMAND.to_string()
}

impl LaunchpadConfig {
    /// Load config from a TOML file with LAUNCHPAD_* env var overrides.
    ///
    /// A double underscore separates nesting levels, so
    /// `LAUNCHPAD_SUBMIT__BATCH_WINDOW_MS` sets `submit.batch_window_ms`.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.launchpad/launchpad.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("LAUNCHPAD_").split("__")),
        )
    }

    /// Parse config from an in-memory TOML document (no env overrides).
    pub fn from_toml_str(toml: &str) -> crate::error::Result<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        let config: LaunchpadConfig = figment
            .extract()
            .map_err(|e| crate::error::LaunchpadError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject duplicate names and groups that reference unknown platforms.
    pub fn validate(&self) -> crate::error::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for p in &self.platforms {
            if !seen.insert(p.name.as_str()) {
                return Err(crate::error::LaunchpadError::Config(format!(
                    "platform defined twice: {}",
                    p.name
                )));
            }
        }
        for g in &self.platform_groups {
            if seen.contains(g.name.as_str()) {
                return Err(crate::error::LaunchpadError::Config(format!(
                    "platform group name clashes with a platform: {}",
                    g.name
                )));
            }
            for member in &g.platforms {
                let defined = self
                    .platforms
                    .iter()
                    .any(|p| crate::platform::name_matches(&p.name, member));
                if member != LOCALHOST && !defined {
                    return Err(crate::error::LaunchpadError::Config(format!(
                        "platform group {} references unknown platform {member}",
                        g.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    format!("{}/.launchpad/launchpad.toml", home_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_sparse_platform() {
        let cfg = LaunchpadConfig::from_toml_str(
            r#"
            [[platforms]]
            name = "hpc"
            hosts = ["hpc1", "hpc2"]
            "#,
        )
        .unwrap();
        let hpc = &cfg.platforms[0];
        assert_eq!(hpc.job_runner, "background");
        assert_eq!(hpc.communication_method, CommsMethod::Zmq);
        assert_eq!(hpc.ssh_command, DEFAULT_SSH_COMMAND);
        assert!(hpc.install_target.is_none());
        assert_eq!(cfg.submit.batch_window_ms, 0);
        assert!(cfg.submit.check_syntax);
    }

    #[test]
    fn platform_order_is_preserved() {
        let cfg = LaunchpadConfig::from_toml_str(
            r#"
            [[platforms]]
            name = "zeta"
            [[platforms]]
            name = "alpha"
            "#,
        )
        .unwrap();
        let names: Vec<_> = cfg.platforms.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha"]);
    }

    #[test]
    fn duplicate_platform_rejected() {
        let err = LaunchpadConfig::from_toml_str(
            r#"
            [[platforms]]
            name = "a"
            [[platforms]]
            name = "a"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }

    #[test]
    fn group_with_unknown_member_rejected() {
        let err = LaunchpadConfig::from_toml_str(
            r#"
            [[platform_groups]]
            name = "g"
            platforms = ["nope"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown platform nope"));
    }

    #[test]
    fn group_member_may_match_a_pattern() {
        let cfg = LaunchpadConfig::from_toml_str(
            r#"
            [[platforms]]
            name = "vld[0-9]{2}"
            [[platform_groups]]
            name = "g"
            platforms = ["vld01"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.platform_groups[0].platforms, ["vld01"]);
    }

    #[test]
    fn env_overrides_reach_underscored_fields() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("LAUNCHPAD_SUBMIT__BATCH_WINDOW_MS", "250");
            jail.set_env("LAUNCHPAD_WORKFLOW__RUN_ROOT", "/scratch/cylc-run");
            let cfg = LaunchpadConfig::load(Some("absent.toml")).map_err(|e| e.to_string())?;
            assert_eq!(cfg.submit.batch_window_ms, 250);
            assert_eq!(cfg.workflow.run_root, "/scratch/cylc-run");
            Ok(())
        });
    }

    #[test]
    fn remote_run_dir_is_home_relative() {
        let wf = WorkflowConfig {
            id: "flow/run1".into(),
            ..WorkflowConfig::default()
        };
        assert_eq!(wf.remote_run_dir(), "cylc-run/flow/run1");
    }
}
