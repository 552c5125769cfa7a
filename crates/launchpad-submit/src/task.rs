use launchpad_core::{RuntimeConfig, TaskId};
use serde::{Deserialize, Serialize};

/// A task handed to the pipeline for job submission.
///
/// The pipeline borrows it for one pass and writes the outcome back into
/// `state`; everything else belongs to the task pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskToSubmit {
    #[serde(flatten)]
    pub id: TaskId,
    /// Runtime configuration before broadcasts are applied.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub state: SubmitState,
}

impl TaskToSubmit {
    pub fn new(id: TaskId, runtime: RuntimeConfig) -> Self {
        Self {
            id,
            runtime,
            state: SubmitState::default(),
        }
    }

    /// Job log directory relative to `<run_dir>/log/job`: `<point>/<name>/<NN>`.
    pub fn job_dir(&self) -> String {
        format!("{}/{}/{:02}", self.id.point, self.id.name, self.state.submit_num)
    }
}

/// Submission bookkeeping carried across attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitState {
    /// Incremented at the start of each attempt.
    pub submit_num: u32,
    pub platform: Option<String>,
    pub host: Option<String>,
    pub job_id: Option<String>,
    pub last_error: Option<String>,
}
