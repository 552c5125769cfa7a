use std::fmt;

use launchpad_core::LaunchpadError;
use launchpad_remote::{CommandSpec, ExecResult};
use thiserror::Error;

/// Errors raised while moving a task through the submission pipeline.
///
/// `Clone` because results are shared between every task waiting on the
/// same cached evaluation, initialisation or file installation.
#[derive(Debug, Clone, Error)]
pub enum SubmitError {
    /// Invalid task configuration (e.g. both host and platform set).
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No matching platform found: {0}")]
    PlatformLookup(String),

    /// A host or platform expression could not be evaluated.
    #[error("Failed to evaluate {expr:?}: {reason}")]
    Eval { expr: String, reason: String },

    /// The evaluation is still running; the task should try again later.
    #[error("Still evaluating {expr:?}")]
    Evaluating { expr: String },

    /// The host could not be contacted; another host may succeed.
    #[error("Host {host} unreachable: {detail}")]
    HostUnreachable { host: String, detail: PlatformError },

    /// A remote operation failed in a way that retrying elsewhere won't fix.
    #[error("{0}")]
    Remote(PlatformError),

    #[error("Job file error: {0}")]
    JobFile(String),

    #[error("Job file syntax error: {0}")]
    Syntax(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Submission cancelled")]
    Cancelled,

    /// A bug in the pipeline itself, e.g. a batch dispatcher that died.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SubmitError {
    /// Short error code string used in structured outcome records.
    pub fn code(&self) -> &'static str {
        match self {
            SubmitError::Config(_) => "CONFIG_ERROR",
            SubmitError::PlatformLookup(_) => "PLATFORM_LOOKUP_ERROR",
            SubmitError::Eval { .. } => "EVAL_ERROR",
            SubmitError::Evaluating { .. } => "EVALUATING",
            SubmitError::HostUnreachable { .. } => "HOST_UNREACHABLE",
            SubmitError::Remote(_) => "REMOTE_ERROR",
            SubmitError::JobFile(_) => "JOB_FILE_ERROR",
            SubmitError::Syntax(_) => "SYNTAX_ERROR",
            SubmitError::Io(_) => "IO_ERROR",
            SubmitError::Cancelled => "CANCELLED",
            SubmitError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// True when the failure belongs to the host rather than the task, so
    /// the host should be marked bad and the next candidate tried.
    pub fn is_host_failure(&self) -> bool {
        matches!(self, SubmitError::HostUnreachable { .. })
    }

    /// True for failures of the job file itself; these never fail over.
    pub fn is_job_file_failure(&self) -> bool {
        matches!(self, SubmitError::JobFile(_) | SubmitError::Syntax(_))
    }

    /// Build the error for a remote command that ran but did not succeed.
    pub fn from_exec(
        message: &str,
        platform: &str,
        host: &str,
        spec: &CommandSpec,
        result: &ExecResult,
    ) -> Self {
        let detail = PlatformError::from_exec(message, platform, spec, result);
        if result.host_unreachable() {
            SubmitError::HostUnreachable {
                host: host.to_string(),
                detail,
            }
        } else {
            SubmitError::Remote(detail)
        }
    }
}

impl From<LaunchpadError> for SubmitError {
    fn from(e: LaunchpadError) -> Self {
        match e {
            LaunchpadError::Config(msg) => SubmitError::Config(msg),
            LaunchpadError::PlatformLookup(msg) => SubmitError::PlatformLookup(msg),
            other => SubmitError::Io(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SubmitError {
    fn from(e: std::io::Error) -> Self {
        SubmitError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SubmitError>;

// ---------------------------------------------------------------------------
// PlatformError
// ---------------------------------------------------------------------------

pub const MSG_INIT: &str = "initialisation did not complete";
pub const MSG_FILE_INSTALL: &str = "file installation did not complete";
pub const MSG_SUBMIT: &str = "job submission failed";

/// Structured report of a failed remote operation, suitable for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformError {
    pub message: String,
    pub platform: String,
    pub cmd: Option<String>,
    pub ret_code: Option<i32>,
    pub out: Option<String>,
    pub err: Option<String>,
}

impl PlatformError {
    pub fn new(message: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            platform: platform.into(),
            cmd: None,
            ret_code: None,
            out: None,
            err: None,
        }
    }

    pub fn from_exec(message: &str, platform: &str, spec: &CommandSpec, result: &ExecResult) -> Self {
        let nonempty = |s: &str| (!s.trim().is_empty()).then(|| s.to_string());
        Self {
            message: message.to_string(),
            platform: platform.to_string(),
            cmd: Some(spec.display()),
            ret_code: Some(result.exit_code),
            out: nonempty(&result.stdout),
            err: nonempty(&result.stderr),
        }
    }
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on platform {}", self.message, self.platform)?;
        if let Some(cmd) = &self.cmd {
            match self.ret_code {
                Some(code) => write!(f, "\nCOMMAND FAILED ({code}): {cmd}")?,
                None => write!(f, "\nCOMMAND FAILED: {cmd}")?,
            }
        }
        if let Some(out) = &self.out {
            write!(f, "\nCOMMAND STDOUT:\n{}", out.trim_end())?;
        }
        if let Some(err) = &self.err {
            write!(f, "\nCOMMAND STDERR:\n{}", err.trim_end())?;
        }
        Ok(())
    }
}

impl std::error::Error for PlatformError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_exec_is_host_failure() {
        let spec = CommandSpec::new("ssh").arg("h1");
        let res = ExecResult {
            exit_code: 255,
            stdout: String::new(),
            stderr: "Connection refused".into(),
        };
        let err = SubmitError::from_exec(MSG_INIT, "hpc", "h1", &spec, &res);
        assert!(err.is_host_failure());
        assert_eq!(err.code(), "HOST_UNREACHABLE");
    }

    #[test]
    fn other_exit_is_fatal() {
        let spec = CommandSpec::new("ssh").arg("h1");
        let res = ExecResult {
            exit_code: 1,
            ..Default::default()
        };
        let err = SubmitError::from_exec(MSG_SUBMIT, "hpc", "h1", &spec, &res);
        assert!(!err.is_host_failure());
        assert!(matches!(err, SubmitError::Remote(_)));
    }

    #[test]
    fn platform_error_report() {
        let spec = CommandSpec::new("ssh").args(["h1", "cylc remote-init"]);
        let res = ExecResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: "boom\n".into(),
        };
        let text = PlatformError::from_exec(MSG_INIT, "hpc", &spec, &res).to_string();
        assert!(text.starts_with("initialisation did not complete on platform hpc"));
        assert!(text.contains("COMMAND FAILED (1): ssh h1 'cylc remote-init'"));
        assert!(text.contains("COMMAND STDERR:\nboom"));
        assert!(!text.contains("STDOUT"));
    }

    #[test]
    fn core_errors_convert() {
        let e: SubmitError = LaunchpadError::PlatformLookup("nope".into()).into();
        assert!(matches!(e, SubmitError::PlatformLookup(_)));
    }
}
