//! Error types for moor

use crate::resource::ResourceRef;
use thiserror::Error;

/// Result type for moor operations
pub type Result<T> = std::result::Result<T, MoorError>;

/// moor error types
#[derive(Error, Debug)]
pub enum MoorError {
    /// Desired input is malformed; never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// The engine cannot be queried, so observed state is unknown
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    /// Desired state references a resource that does not exist yet
    #[error("Missing dependency: {0} does not exist")]
    Dependency(ResourceRef),

    /// Transient failures persisted through every retry attempt
    #[error("Transient execution error after {attempts} attempt(s): {message}")]
    TransientExecution { attempts: u32, message: String },

    #[error("Fatal execution error: {0}")]
    FatalExecution(String),

    /// The engine accepted the action but converged to something else
    #[error("Verification error: expected {expected}, found {found}")]
    Verification { expected: String, found: String },

    #[error("Cancelled while {0}")]
    Cancelled(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),
}

impl MoorError {
    /// Short machine-friendly name of the error class
    pub fn cause(&self) -> &'static str {
        match self {
            MoorError::Validation(_) => "validation",
            MoorError::Unavailable(_) => "unavailable",
            MoorError::Dependency(_) => "dependency",
            MoorError::TransientExecution { .. } => "transient",
            MoorError::FatalExecution(_) => "fatal",
            MoorError::Verification { .. } => "verification",
            MoorError::Cancelled(_) => "cancelled",
            MoorError::Config(_) => "config",
            MoorError::Io(_) | MoorError::Json(_) | MoorError::Yaml(_) => "internal",
        }
    }
}

impl From<serde_yaml::Error> for MoorError {
    fn from(e: serde_yaml::Error) -> Self {
        MoorError::Yaml(e.to_string())
    }
}
