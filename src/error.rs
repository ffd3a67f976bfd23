use serde::Serialize;
use thiserror::Error;

/// Every failure an operation can hand back to a caller.
///
/// Background jobs never raise these into the caller; they end up as the
/// `reason` of a failed job instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("install failed: {0}")]
    Install(String),

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("IO error ({kind}): {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
}

/// Wire-level error body.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn install(msg: impl Into<String>) -> Self {
        Self::Install(msg.into())
    }

    pub fn launch(msg: impl Into<String>) -> Self {
        Self::Launch(msg.into())
    }

    /// Stable identifier sent over the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::Unavailable(_) => "unavailable",
            Self::Install(_) => "install",
            Self::Launch(_) => "launch",
            Self::NotFound(_) => "not_found",
            Self::Io { .. } => "io",
        }
    }

    /// Only downstream outages are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Flattens the error into the text stored on a failed job.
    pub fn reason(&self) -> String {
        match self {
            Self::Install(reason) | Self::Launch(reason) => reason.clone(),
            other => other.to_string(),
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
