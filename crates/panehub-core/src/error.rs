use panehub_pty::{PaneId, PtyError, StreamError};
use serde::{Deserialize, Serialize};

use crate::metrics::MetricsError;
use crate::registry::SessionId;

/// Errors returned by orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("pane {0} not found")]
    PaneNotFound(PaneId),
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
    #[error("pane {0}: process has exited")]
    ProcessExited(PaneId),
    #[error("invalid geometry {rows}x{cols}: rows and cols must be between 1 and 1000")]
    InvalidGeometry { rows: u16, cols: u16 },
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Pty(PtyError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

impl OrchestratorError {
    /// Attach pane context to a PTY failure.
    pub fn from_pty(pane_id: PaneId, err: PtyError) -> Self {
        match err {
            PtyError::SpawnFailed(msg) => OrchestratorError::SpawnFailed(msg),
            PtyError::InvalidGeometry { rows, cols } => OrchestratorError::InvalidGeometry { rows, cols },
            PtyError::ProcessExited => OrchestratorError::ProcessExited(pane_id),
            other => OrchestratorError::Pty(other),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestratorError::SessionNotFound(_) | OrchestratorError::PaneNotFound(_) => ErrorCode::NotFound,
            OrchestratorError::SpawnFailed(_) => ErrorCode::SpawnFailed,
            OrchestratorError::ProcessExited(_) => ErrorCode::ProcessExited,
            OrchestratorError::InvalidGeometry { .. } => ErrorCode::InvalidGeometry,
            OrchestratorError::Unsupported(_) => ErrorCode::InvalidRequest,
            OrchestratorError::Pty(_) | OrchestratorError::Metrics(_) => ErrorCode::Internal,
        }
    }
}

/// Stable machine-readable error codes used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    SpawnFailed,
    ProcessExited,
    InvalidGeometry,
    Truncated,
    Timeout,
    InvalidRequest,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::SpawnFailed => "spawn_failed",
            ErrorCode::ProcessExited => "process_exited",
            ErrorCode::InvalidGeometry => "invalid_geometry",
            ErrorCode::Truncated => "truncated",
            ErrorCode::Timeout => "timeout",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&StreamError> for ErrorCode {
    fn from(err: &StreamError) -> Self {
        match err {
            StreamError::Truncated { .. } => ErrorCode::Truncated,
            StreamError::ReadFailed { .. } | StreamError::ResizeFailed { .. } => ErrorCode::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
