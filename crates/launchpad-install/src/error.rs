use launchpad_remote::RemoteError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Invalid workflow name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// The source directory is missing a workflow definition or contains
    /// reserved content.
    #[error("Invalid source directory: {0}")]
    Source(String),

    #[error("Run directory already exists: {0}")]
    RunExists(String),

    /// The workflow is already installed from a different source.
    #[error("Workflow {flow} already points to {existing}, not {requested}")]
    SourceConflict {
        flow: String,
        existing: String,
        requested: String,
    },

    #[error("rsync exited {code}: {stderr}")]
    Rsync { code: i32, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command error: {0}")]
    Remote(#[from] RemoteError),
}

pub type Result<T> = std::result::Result<T, InstallError>;
