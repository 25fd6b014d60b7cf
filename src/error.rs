//! Error types for hubsync
//!
//! Exit codes:
//! - 0: Success
//! - 2: User error (bad args, unknown task, missing configuration)
//! - 3: Blocked (Hub not connected)
//! - 4: Operation failed (I/O, Hub rejected the request)

use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the hubsync CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const BLOCKED: i32 = 3;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Main error type for hubsync operations
#[derive(Error, Debug)]
pub enum Error {
    // User errors (exit code 2)
    #[error("Hub is not configured: missing {0}")]
    NotConfigured(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Task not found: {project_id}/{task_id}")]
    TaskNotFound { project_id: String, task_id: String },

    #[error("Unknown task {0}: list tasks first")]
    UnknownTask(String),

    // Blocked (exit code 3)
    #[error("Hub not connected")]
    HubUnavailable,

    // Operation failures (exit code 4)
    #[error("Hub request failed: {message}")]
    Hub {
        message: String,
        status: Option<u16>,
        retryable: bool,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Lock acquisition failed: {0}")]
    LockFailed(PathBuf),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

impl Error {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotConfigured(_)
            | Error::InvalidConfig(_)
            | Error::InvalidArgument(_)
            | Error::ProjectNotFound(_)
            | Error::TaskNotFound { .. }
            | Error::UnknownTask(_) => exit_codes::USER_ERROR,

            Error::HubUnavailable => exit_codes::BLOCKED,

            Error::Hub { .. }
            | Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::LockFailed(_)
            | Error::OperationFailed(_) => exit_codes::OPERATION_FAILED,
        }
    }

    /// Whether retrying the same call later could succeed without user action.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::HubUnavailable | Error::LockFailed(_) => true,
            Error::Hub { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Structured details for the JSON error envelope
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::TaskNotFound {
                project_id,
                task_id,
            } => Some(serde_json::json!({
                "project_id": project_id,
                "task_id": task_id,
            })),
            Error::UnknownTask(task_id) => Some(serde_json::json!({ "task_id": task_id })),
            Error::Hub {
                status, retryable, ..
            } => Some(serde_json::json!({
                "status": status,
                "retryable": retryable,
            })),
            _ => None,
        }
    }
}

/// Result type alias for hubsync operations
pub type Result<T> = std::result::Result<T, Error>;
