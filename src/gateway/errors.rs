//! # Write Errors
//!
//! Error types for the durable write path.
//!
//! A write either never became visible ([`WriteError::NotCommitted`]) or
//! committed locally without reaching remote storage
//! ([`WriteError::NotDurable`]). There is no partial acknowledgment.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::replication::{Position, ReplicationError};

/// Result type for write operations
pub type WriteResult<T> = Result<T, WriteError>;

/// Step of the write path that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStep {
    Begin,
    Execute,
    SyncPreCommit,
    Read,
    Commit,
    SyncPostCommit,
    Confirm,
}

impl WriteStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteStep::Begin => "begin",
            WriteStep::Execute => "execute",
            WriteStep::SyncPreCommit => "sync_pre_commit",
            WriteStep::Read => "read",
            WriteStep::Commit => "commit",
            WriteStep::SyncPostCommit => "sync_post_commit",
            WriteStep::Confirm => "confirm",
        }
    }
}

impl std::fmt::Display for WriteStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Underlying reason a step failed
#[derive(Debug, Error)]
pub enum WriteCause {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Replication(#[from] ReplicationError),

    #[error("request cancelled")]
    Cancelled,

    /// Malformed request; never reaches the database
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WriteCause {
    fn is_cancelled(&self) -> bool {
        matches!(
            self,
            WriteCause::Cancelled | WriteCause::Replication(ReplicationError::Cancelled)
        )
    }
}

/// Durable write failure
#[derive(Debug, Error)]
pub enum WriteError {
    /// Rolled back; no effect is visible anywhere
    #[error("write not committed ({step}): {cause}")]
    NotCommitted { step: WriteStep, cause: WriteCause },

    /// Committed locally; remote durability was not confirmed
    #[error("write committed but not durable ({step}): {cause}")]
    NotDurable {
        step: WriteStep,
        position: Option<Position>,
        cause: WriteCause,
    },
}

impl WriteError {
    pub fn not_committed(step: WriteStep, cause: impl Into<WriteCause>) -> Self {
        WriteError::NotCommitted {
            step,
            cause: cause.into(),
        }
    }

    pub fn not_durable(step: WriteStep, position: Option<Position>, cause: impl Into<WriteCause>) -> Self {
        WriteError::NotDurable {
            step,
            position,
            cause: cause.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::not_committed(WriteStep::Begin, WriteCause::Invalid(msg.into()))
    }

    /// True when the write is visible locally
    pub fn is_committed(&self) -> bool {
        matches!(self, WriteError::NotDurable { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cause().is_cancelled()
    }

    pub fn step(&self) -> WriteStep {
        match self {
            WriteError::NotCommitted { step, .. } | WriteError::NotDurable { step, .. } => *step,
        }
    }

    /// Post-commit position of a committed write
    pub fn position(&self) -> Option<Position> {
        match self {
            WriteError::NotCommitted { .. } => None,
            WriteError::NotDurable { position, .. } => *position,
        }
    }

    pub fn cause(&self) -> &WriteCause {
        match self {
            WriteError::NotCommitted { cause, .. } | WriteError::NotDurable { cause, .. } => cause,
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            WriteError::NotCommitted {
                cause: WriteCause::Invalid(_),
                ..
            } => StatusCode::BAD_REQUEST,
            WriteError::NotDurable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            WriteError::NotCommitted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub step: WriteStep,
    pub committed: bool,
    pub position: Option<String>,
    pub code: u16,
}

impl From<&WriteError> for ErrorResponse {
    fn from(err: &WriteError) -> Self {
        Self {
            error: err.to_string(),
            step: err.step(),
            committed: err.is_committed(),
            position: err.position().map(|p| p.to_string()),
            code: err.status_code().as_u16(),
        }
    }
}

impl IntoResponse for WriteError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(ErrorResponse::from(&self));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::Generation;

    #[test]
    fn test_status_codes() {
        assert_eq!(WriteError::invalid("empty").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            WriteError::not_committed(WriteStep::Commit, WriteCause::Cancelled).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            WriteError::not_durable(WriteStep::Confirm, None, WriteCause::Cancelled).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_not_durable_carries_position() {
        let position = Position::new(Generation::new(), 1, 4152);
        let err = WriteError::not_durable(
            WriteStep::Confirm,
            Some(position),
            ReplicationError::Cancelled,
        );
        assert!(err.is_committed());
        assert!(err.is_cancelled());
        assert_eq!(err.position(), Some(position));

        let body = ErrorResponse::from(&err);
        assert!(body.committed);
        assert_eq!(body.position, Some(position.to_string()));
        assert_eq!(body.code, 503);
    }

    #[test]
    fn test_display_names_step() {
        let err = WriteError::not_committed(WriteStep::Execute, WriteCause::Invalid("x".into()));
        assert_eq!(err.to_string(), "write not committed (execute): invalid request: x");
        assert!(!err.is_committed());
        assert_eq!(err.position(), None);
    }
}
