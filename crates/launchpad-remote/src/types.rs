//! Shared data types for launchpad-remote.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::quote::shell_join;

/// Exit status reserved by ssh for connection/authentication failure.
/// Timeouts are reported with the same code.
pub const HOST_UNREACHABLE: i32 = 255;

// ---------------------------------------------------------------------------
// CommandSpec
// ---------------------------------------------------------------------------

/// A fully-formed command line ready for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Local file streamed to the child's stdin (e.g. an archive for
    /// remote init).
    pub stdin_file: Option<PathBuf>,
    /// Overrides the runner's default timeout.
    pub timeout: Option<Duration>,
    /// Extra environment for the child.
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin_file: None,
            timeout: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Shell-quoted rendering for logs and error reports.
    pub fn display(&self) -> String {
        shell_join(&self.argv())
    }
}

// ---------------------------------------------------------------------------
// ExecResult
// ---------------------------------------------------------------------------

/// Outcome of a command that ran (whatever its exit code).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Process exit code (0 = success, -1 = killed by signal).
    pub exit_code: i32,

    /// Captured standard output (ANSI escapes already stripped).
    pub stdout: String,

    /// Captured standard error (ANSI escapes already stripped).
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// True when the exit code signals the host could not be reached.
    pub fn host_unreachable(&self) -> bool {
        self.exit_code == HOST_UNREACHABLE
    }
}
