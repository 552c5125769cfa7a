use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use chrono::Utc;
use launchpad_remote::{CommandRunner, CommandSpec, ExecResult};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{InstallError, Result};
use crate::rundir::{
    link_run_n, next_run_number, prepare_source, validate_flow_name, FLOW_FILE, INSTALL_DIR,
    RESERVED_DIRS, SOURCE_LINK,
};

/// File in the source directory listing extra rsync exclude patterns.
pub const IGNORE_FILE: &str = ".cylcignore";

const VCS_DIRS: &[&str] = &[".git", ".svn"];

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub source: PathBuf,
    /// Defaults to the source directory's name.
    pub flow_name: Option<String>,
    /// Install into `<flow>/<run_name>` instead of the next `run<N>`.
    pub run_name: Option<String>,
    /// Install directly into `<flow>`.
    pub no_run_name: bool,
    /// Allow re-pointing an installed workflow at a different source.
    pub redirect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub flow_name: String,
    pub run_dir: PathBuf,
    /// Set for numbered installs.
    pub run_number: Option<u32>,
    pub source: PathBuf,
    pub log_file: PathBuf,
}

/// Installs workflows from source directories into the run root.
pub struct Installer<'a> {
    run_root: PathBuf,
    excludes: Vec<String>,
    runner: &'a dyn CommandRunner,
}

impl<'a> Installer<'a> {
    pub fn new(
        run_root: impl Into<PathBuf>,
        excludes: Vec<String>,
        runner: &'a dyn CommandRunner,
    ) -> Self {
        Self {
            run_root: run_root.into(),
            excludes,
            runner,
        }
    }

    pub async fn install(&self, opts: &InstallOptions) -> Result<InstallReport> {
        let source = fs::canonicalize(&opts.source).map_err(|e| {
            InstallError::Source(format!("{}: {e}", opts.source.display()))
        })?;
        let flow_name = match &opts.flow_name {
            Some(name) => name.clone(),
            None => source
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .unwrap_or_default(),
        };
        validate_flow_name(&flow_name)?;
        if opts.run_name.as_deref() == Some(INSTALL_DIR) {
            return Err(InstallError::InvalidName {
                name: INSTALL_DIR.to_string(),
                reason: "reserved, choose another run name".to_string(),
            });
        }
        if let Some(run_name) = &opts.run_name {
            validate_flow_name(run_name)?;
        }

        if prepare_source(&source)? {
            warn!(
                source = %source.display(),
                "suite.rc is deprecated in favour of flow.cylc, symlink created"
            );
        }

        let flow_dir = self.run_root.join(&flow_name);
        let (run_dir, run_number) = if opts.no_run_name {
            (flow_dir.clone(), None)
        } else if let Some(run_name) = &opts.run_name {
            (flow_dir.join(run_name), None)
        } else {
            let n = next_run_number(&flow_dir)?;
            (flow_dir.join(format!("run{n}")), Some(n))
        };
        if run_dir.join(FLOW_FILE).exists() {
            return Err(InstallError::RunExists(run_dir.display().to_string()));
        }

        let source_link = self.check_source_link(&flow_dir, &flow_name, &source, opts.redirect)?;

        fs::create_dir_all(&run_dir)?;
        let spec = self.rsync_cmd(&source, &run_dir);
        let res = self.runner.run(spec.clone()).await?;
        let log_file = write_install_log(&run_dir, &spec, &res)?;
        if !res.success() {
            return Err(InstallError::Rsync {
                code: res.exit_code,
                stderr: res.stderr.trim().to_string(),
            });
        }

        if let Some(link) = source_link {
            fs::create_dir_all(flow_dir.join(INSTALL_DIR))?;
            symlink(&source, &link)?;
        }
        if let Some(n) = run_number {
            link_run_n(&flow_dir, n)?;
        }

        info!(
            flow = %flow_name,
            source = %source.display(),
            run_dir = %run_dir.display(),
            "installed"
        );
        Ok(InstallReport {
            flow_name,
            run_dir,
            run_number,
            source,
            log_file,
        })
    }

    /// Path of the source symlink to create, if one is needed.
    fn check_source_link(
        &self,
        flow_dir: &Path,
        flow_name: &str,
        source: &Path,
        redirect: bool,
    ) -> Result<Option<PathBuf>> {
        let link = flow_dir.join(INSTALL_DIR).join(SOURCE_LINK);
        let existing = match fs::read_link(&link) {
            Ok(target) => target,
            Err(_) => return Ok(Some(link)),
        };
        if existing == source {
            return Ok(None);
        }
        if !redirect {
            return Err(InstallError::SourceConflict {
                flow: flow_name.to_string(),
                existing: existing.display().to_string(),
                requested: source.display().to_string(),
            });
        }
        warn!(
            flow = %flow_name,
            from = %existing.display(),
            to = %source.display(),
            "redirecting installed workflow to a new source"
        );
        fs::remove_file(&link)?;
        Ok(Some(link))
    }

    fn rsync_cmd(&self, source: &Path, run_dir: &Path) -> CommandSpec {
        let mut spec = CommandSpec::new("rsync").args(["-a", "--checksum"]);
        for dir in VCS_DIRS {
            spec = spec.arg(format!("--exclude={dir}"));
        }
        for dir in RESERVED_DIRS {
            spec = spec.arg(format!("--exclude=/{dir}"));
        }
        for pattern in &self.excludes {
            spec = spec.arg(format!("--exclude={pattern}"));
        }
        let ignore = source.join(IGNORE_FILE);
        if ignore.is_file() {
            spec = spec.arg(format!("--exclude-from={}", ignore.display()));
        }
        spec.arg(format!("{}/", source.display()))
            .arg(format!("{}/", run_dir.display()))
    }
}

fn write_install_log(run_dir: &Path, spec: &CommandSpec, res: &ExecResult) -> Result<PathBuf> {
    let dir = run_dir.join("log").join("install");
    fs::create_dir_all(&dir)?;
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let path = dir.join(format!("{stamp}-install.log"));

    let mut text = format!("{} INFO - $ {}\n", Utc::now().to_rfc3339(), spec.display());
    for line in res.stdout.lines() {
        text.push_str(&format!("  {line}\n"));
    }
    for line in res.stderr.lines() {
        text.push_str(&format!("  [stderr] {line}\n"));
    }
    text.push_str(&format!("exit code: {}\n", res.exit_code));
    fs::write(&path, text)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    /// Records commands and reports success without copying anything.
    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<CommandSpec>>,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, spec: CommandSpec) -> launchpad_remote::Result<ExecResult> {
            self.calls.lock().unwrap().push(spec);
            Ok(ExecResult::default())
        }
    }

    fn source_dir(root: &Path) -> PathBuf {
        let src = root.join("src").join("nwp");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("flow.cylc"), "[scheduling]\n").unwrap();
        src
    }

    #[tokio::test]
    async fn numbered_runs_and_run_n() {
        let root = tempfile::tempdir().unwrap();
        let src = source_dir(root.path());
        let runner = RecordingRunner::default();
        let installer = Installer::new(root.path().join("cylc-run"), Vec::new(), &runner);
        let opts = InstallOptions {
            source: src.clone(),
            ..Default::default()
        };

        let first = installer.install(&opts).await.unwrap();
        let second = installer.install(&opts).await.unwrap();
        assert_eq!(first.flow_name, "nwp");
        assert_eq!(first.run_number, Some(1));
        assert_eq!(second.run_number, Some(2));

        let flow_dir = root.path().join("cylc-run/nwp");
        assert_eq!(fs::read_link(flow_dir.join("runN")).unwrap(), Path::new("run2"));
        assert_eq!(
            fs::read_link(flow_dir.join("_cylc-install/source")).unwrap(),
            fs::canonicalize(&src).unwrap()
        );
        assert!(second.log_file.starts_with(flow_dir.join("run2/log/install")));
    }

    #[tokio::test]
    async fn rsync_excludes() {
        let root = tempfile::tempdir().unwrap();
        let src = source_dir(root.path());
        fs::write(src.join(IGNORE_FILE), "*.bak\n").unwrap();
        let runner = RecordingRunner::default();
        let excludes = vec!["*.tmp".to_string()];
        let installer = Installer::new(root.path().join("cylc-run"), excludes, &runner);
        installer
            .install(&InstallOptions {
                source: src,
                run_name: Some("test".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let calls = runner.calls.lock().unwrap();
        let args = calls[0].args.join(" ");
        assert!(args.starts_with("-a --checksum --exclude=.git --exclude=.svn --exclude=/log"));
        assert!(args.contains("--exclude=*.tmp"));
        assert!(args.contains("--exclude-from="));
        assert!(args.ends_with("/cylc-run/nwp/test/"));
    }

    #[tokio::test]
    async fn other_source_conflicts_unless_redirected() {
        let root = tempfile::tempdir().unwrap();
        let src = source_dir(root.path());
        let other = root.path().join("elsewhere").join("nwp");
        fs::create_dir_all(&other).unwrap();
        fs::write(other.join("flow.cylc"), "").unwrap();

        let runner = RecordingRunner::default();
        let installer = Installer::new(root.path().join("cylc-run"), Vec::new(), &runner);
        installer
            .install(&InstallOptions {
                source: src,
                ..Default::default()
            })
            .await
            .unwrap();

        let mut opts = InstallOptions {
            source: other.clone(),
            ..Default::default()
        };
        let err = installer.install(&opts).await.unwrap_err();
        assert!(matches!(err, InstallError::SourceConflict { .. }), "{err}");

        opts.redirect = true;
        installer.install(&opts).await.unwrap();
        let link = root.path().join("cylc-run/nwp/_cylc-install/source");
        assert_eq!(fs::read_link(link).unwrap(), fs::canonicalize(other).unwrap());
    }

    #[tokio::test]
    async fn reserved_run_name_rejected() {
        let root = tempfile::tempdir().unwrap();
        let src = source_dir(root.path());
        let runner = RecordingRunner::default();
        let installer = Installer::new(root.path().join("cylc-run"), Vec::new(), &runner);
        let err = installer
            .install(&InstallOptions {
                source: src,
                run_name: Some(INSTALL_DIR.into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::InvalidName { .. }));
        assert!(runner.calls.lock().unwrap().is_empty());
    }
}
