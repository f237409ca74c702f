//! Error types and handling
//!
//! Synchronous failures of session operations. Transport failures never show
//! up here; they are delivered asynchronously as session events.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::session::Sink;

/// Errors returned by session operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Must specify a url.")]
    MissingUrl,

    #[error("Must specify a filePath.")]
    MissingPath,

    #[error("File at path '{}' already exists. Cannot overwrite.", .0.display())]
    FileExists(PathBuf),

    #[error("{0} is not active")]
    NotActive(Sink),

    #[error("{0} is already active")]
    AlreadyActive(Sink),

    #[error("Operation not valid in state {0}")]
    InvalidState(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Active camera is not rear-facing")]
    InvalidFacing,

    #[error("Device error: {0}")]
    Device(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Session has been disposed")]
    Disposed,
}

impl SessionError {
    /// Stable error code reported to the embedding application
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::MissingUrl => "missingUrl",
            SessionError::MissingPath => "missingPath",
            SessionError::FileExists(_) => "fileExists",
            SessionError::NotActive(_) => "notActive",
            SessionError::AlreadyActive(_) => "alreadyActive",
            SessionError::InvalidState(_) => "invalidState",
            SessionError::DeviceUnavailable(_) => "deviceUnavailable",
            SessionError::InvalidFacing => "invalidFacing",
            SessionError::Device(_) => "deviceError",
            SessionError::Io(_) => "IOError",
            SessionError::Disposed => "disposed",
        }
    }

    /// Wrap a collaborator failure, keeping the whole context chain
    pub fn device(err: anyhow::Error) -> Self {
        SessionError::Device(format!("{:#}", err))
    }
}

/// Error response for the method-call surface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<SessionError> for ErrorResponse {
    fn from(error: SessionError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using SessionError
pub type SessionResult<T> = Result<T, SessionError>;
