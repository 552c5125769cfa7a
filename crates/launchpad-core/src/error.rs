use thiserror::Error;

#[derive(Debug, Error)]
pub enum LaunchpadError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No matching platform found: {0}")]
    PlatformLookup(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LaunchpadError {
    /// Short error code string used in structured outcome records.
    pub fn code(&self) -> &'static str {
        match self {
            LaunchpadError::Config(_) => "CONFIG_ERROR",
            LaunchpadError::PlatformLookup(_) => "PLATFORM_LOOKUP_ERROR",
            LaunchpadError::Serialization(_) => "SERIALIZATION_ERROR",
            LaunchpadError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, LaunchpadError>;
