use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LaunchpadError, Result};

/// Identity of one task instance: `<point>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub name: String,
    pub point: String,
}

impl TaskId {
    pub fn new(point: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            point: point.into(),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.point, self.name)
    }
}

/// Correlates every log line of one pass through the submission pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(pub String);

impl AttemptId {
    pub fn new() -> Self {
        // v7 is time-ordered, which keeps attempts sortable in logs
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The subset of a task's runtime configuration the submission pipeline
/// reads, after broadcasts have been merged in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Platform name, group name, or an expression evaluating to one.
    #[serde(default)]
    pub platform: Option<String>,
    /// Legacy host expression. Mutually exclusive with `platform`.
    #[serde(default)]
    pub remote_host: Option<String>,
    /// Legacy job runner, used with `remote_host` to find a platform.
    #[serde(default)]
    pub job_runner: Option<String>,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl RuntimeConfig {
    /// Non-empty platform expression, if any.
    pub fn platform_expr(&self) -> Option<&str> {
        self.platform.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// Non-empty host expression, if any.
    pub fn host_expr(&self) -> Option<&str> {
        self.remote_host.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// Return a copy with broadcast `overrides` applied.
    ///
    /// Keys are dotted setting paths: `platform`, `remote.host`,
    /// `job.runner`, `script`, `env.<NAME>`. Later entries win.
    pub fn with_overrides(&self, overrides: &BTreeMap<String, String>) -> Result<Self> {
        let mut merged = self.clone();
        for (key, value) in overrides {
            match key.as_str() {
                "platform" => merged.platform = Some(value.clone()),
                "remote.host" => merged.remote_host = Some(value.clone()),
                "job.runner" => merged.job_runner = Some(value.clone()),
                "script" => merged.script = value.clone(),
                other => match other.strip_prefix("env.") {
                    Some(name) if !name.is_empty() => {
                        merged.env.insert(name.to_string(), value.clone());
                    }
                    _ => {
                        return Err(LaunchpadError::Config(format!(
                            "unsupported broadcast setting: {other}"
                        )))
                    }
                },
            }
        }
        Ok(merged)
    }
}

/// Result of one submission attempt, handed back to the task pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Submitted {
        platform: String,
        host: String,
        /// Identifier reported by the job runner, when it gave one.
        job_id: Option<String>,
    },
    SubmitFailed {
        reason: String,
    },
    SyntaxError {
        detail: String,
    },
    NoHostsAvailable {
        platform: String,
    },
    /// Not attempted to completion this pass (evaluation still running,
    /// or the pipeline was shut down). Safe to re-attempt.
    Deferred {
        reason: String,
    },
}

impl SubmitOutcome {
    pub fn is_submitted(&self) -> bool {
        matches!(self, SubmitOutcome::Submitted { .. })
    }

    /// True for the terminal failure variants (not `Deferred`).
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SubmitOutcome::SubmitFailed { .. }
                | SubmitOutcome::SyntaxError { .. }
                | SubmitOutcome::NoHostsAvailable { .. }
        )
    }
}

impl fmt::Display for SubmitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted { platform, host, .. } => write!(f, "submitted to {platform}:{host}"),
            Self::SubmitFailed { reason } => write!(f, "submit-failed: {reason}"),
            Self::SyntaxError { detail } => write!(f, "submit-failed (job file): {detail}"),
            Self::NoHostsAvailable { platform } => {
                write!(f, "submit-failed: no hosts available for {platform}")
            }
            Self::Deferred { reason } => write!(f, "deferred: {reason}"),
        }
    }
}
