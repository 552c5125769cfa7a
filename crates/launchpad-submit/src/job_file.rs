//! Rendering and writing task job scripts.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use launchpad_core::config::WorkflowConfig;
use launchpad_core::{Platform, RuntimeConfig};
use launchpad_remote::{run_remote, shell_quote, CommandRunner, CommandSpec};
use tracing::debug;

use crate::error::{Result, SubmitError};
use crate::task::TaskToSubmit;

/// Job log root, relative to the run directory.
pub const JOB_LOG_DIR: &str = "log/job";

/// A job script written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFile {
    pub path: PathBuf,
    /// `<point>/<name>/<NN>`, relative to [`JOB_LOG_DIR`].
    pub job_dir: String,
}

pub struct JobFileWriter {
    workflow: WorkflowConfig,
    runner: Arc<dyn CommandRunner>,
    check_syntax: bool,
}

impl JobFileWriter {
    pub fn new(
        workflow: WorkflowConfig,
        runner: Arc<dyn CommandRunner>,
        check_syntax: bool,
    ) -> Self {
        Self {
            workflow,
            runner,
            check_syntax,
        }
    }

    pub fn render(
        &self,
        task: &TaskToSubmit,
        rt: &RuntimeConfig,
        platform: &Platform,
        host: &str,
    ) -> Result<String> {
        let job_dir = task.job_dir();
        let mut s = String::new();
        let _ = writeln!(s, "#!/bin/bash -l");
        let _ = writeln!(s, "#");
        let _ = writeln!(s, "# ++++ THIS IS A CYLC TASK JOB SCRIPT ++++");
        let _ = writeln!(s, "# Workflow: {}", self.workflow.id);
        let _ = writeln!(s, "# Task: {}", task.id);
        let _ = writeln!(s, "# Job log directory: {job_dir}");
        let _ = writeln!(s, "# Job runner: {}", platform.job_runner);
        let _ = writeln!(s);

        let vars = [
            ("CYLC_WORKFLOW_ID", self.workflow.id.as_str()),
            ("CYLC_TASK_CYCLE_POINT", task.id.point.as_str()),
            ("CYLC_TASK_NAME", task.id.name.as_str()),
            ("CYLC_TASK_JOB", job_dir.as_str()),
            ("CYLC_TASK_PLATFORM", platform.name.as_str()),
            ("CYLC_TASK_HOST", host),
        ];
        for (name, value) in vars {
            let _ = writeln!(s, "export {name}={}", shell_quote(value));
        }
        let _ = writeln!(s, "export CYLC_TASK_SUBMIT_NUMBER={}", task.state.submit_num);

        if !rt.env.is_empty() {
            let _ = writeln!(s, "\n# ENVIRONMENT:");
        }
        for (name, value) in &rt.env {
            if !is_env_name(name) {
                return Err(SubmitError::JobFile(format!(
                    "{}: invalid environment variable name {name:?}",
                    task.id
                )));
            }
            // Written verbatim: no expansion, no command substitution.
            let _ = writeln!(s, "export {name}={}", shell_quote(value));
        }

        let _ = writeln!(s, "\ncylc__job__main() {{");
        if rt.script.trim().is_empty() {
            let _ = writeln!(s, "    :");
        } else {
            let _ = writeln!(s, "{}", rt.script.trim_end());
        }
        let _ = writeln!(s, "}}\n\ncylc__job__main \"$@\"");
        Ok(s)
    }

    /// Render, write and (optionally) syntax-check the job file for `task`.
    pub async fn write(
        &self,
        task: &TaskToSubmit,
        rt: &RuntimeConfig,
        platform: &Platform,
        host: &str,
    ) -> Result<JobFile> {
        let text = self.render(task, rt, platform, host)?;
        let job_dir = task.job_dir();
        let dir = self.workflow.run_dir().join(JOB_LOG_DIR).join(&job_dir);
        let path = dir.join("job");

        let io_err = |e: std::io::Error| {
            SubmitError::JobFile(format!("{}: cannot write {}: {e}", task.id, path.display()))
        };
        tokio::fs::create_dir_all(&dir).await.map_err(io_err)?;
        tokio::fs::write(&path, text).await.map_err(io_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(io_err)?;
        }

        if self.check_syntax {
            let spec = CommandSpec::new("bash").arg("-n").arg(path.to_string_lossy());
            let res = run_remote(&*self.runner, spec).await;
            if !res.success() {
                return Err(SubmitError::Syntax(format!(
                    "{}: {}",
                    task.id,
                    res.stderr.trim()
                )));
            }
        }
        debug!(task = %task.id, path = %path.display(), "job file written");
        Ok(JobFile { path, job_dir })
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use launchpad_core::TaskId;
    use launchpad_remote::ProcessRunner;
    use std::time::Duration;

    fn writer(root: &std::path::Path) -> JobFileWriter {
        let workflow = WorkflowConfig {
            id: "flow/run1".into(),
            run_root: root.to_string_lossy().into_owned(),
            ..Default::default()
        };
        let runner = Arc::new(ProcessRunner::new(2, Duration::from_secs(10)));
        JobFileWriter::new(workflow, runner, true)
    }

    fn task(script: &str) -> (TaskToSubmit, RuntimeConfig) {
        let rt = RuntimeConfig {
            script: script.into(),
            env: [("GREETING".to_string(), "hello $USER".to_string())].into(),
            ..Default::default()
        };
        let mut t = TaskToSubmit::new(TaskId::new("1", "foo"), rt.clone());
        t.state.submit_num = 1;
        (t, rt)
    }

    #[test]
    fn render_exports_identity_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let (t, rt) = task("echo $GREETING");
        let text = writer(dir.path())
            .render(&t, &rt, &Platform::localhost(), "localhost")
            .unwrap();
        assert!(text.starts_with("#!/bin/bash -l\n"));
        assert!(text.contains("export CYLC_TASK_JOB=1/foo/01\n"));
        assert!(text.contains("export CYLC_WORKFLOW_ID=flow/run1\n"));
        assert!(text.contains("export GREETING='hello $USER'\n"));
        assert!(text.contains("cylc__job__main() {\necho $GREETING\n}"));
    }

    #[tokio::test]
    async fn env_values_survive_shell_metacharacters() {
        let dir = tempfile::tempdir().unwrap();
        let (t, mut rt) = task("printf '%s|%s|%s' \"$TRAILING\" \"$TICKS\" \"$QUOTED\"");
        rt.env = [
            ("TRAILING".to_string(), r"C:\dir\".to_string()),
            ("TICKS".to_string(), "`id` $(id) $HOME".to_string()),
            ("QUOTED".to_string(), r#"it's "x""#.to_string()),
        ]
        .into();
        let job = writer(dir.path())
            .write(&t, &rt, &Platform::localhost(), "localhost")
            .await
            .unwrap();

        let runner = ProcessRunner::new(1, Duration::from_secs(10));
        let res = runner
            .run(CommandSpec::new("bash").arg(job.path.to_string_lossy()))
            .await
            .unwrap();
        assert_eq!(res.exit_code, 0, "{}", res.stderr);
        assert_eq!(res.stdout, r#"C:\dir\|`id` $(id) $HOME|it's "x""#);
    }

    #[test]
    fn bad_env_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (t, mut rt) = task("true");
        rt.env.insert("1BAD".into(), "x".into());
        let err = writer(dir.path())
            .render(&t, &rt, &Platform::localhost(), "localhost")
            .unwrap_err();
        assert!(matches!(err, SubmitError::JobFile(_)));
    }

    #[tokio::test]
    async fn write_places_job_under_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (t, rt) = task("echo ok");
        let job = writer(dir.path())
            .write(&t, &rt, &Platform::localhost(), "localhost")
            .await
            .unwrap();
        assert_eq!(job.job_dir, "1/foo/01");
        assert!(job.path.ends_with("flow/run1/log/job/1/foo/01/job"));
        assert!(job.path.exists());
    }

    #[tokio::test]
    async fn syntax_error_detected() {
        let dir = tempfile::tempdir().unwrap();
        let (t, rt) = task("if then fi (");
        let err = writer(dir.path())
            .write(&t, &rt, &Platform::localhost(), "localhost")
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Syntax(_)), "{err:?}");
    }
}
