//! Restore-specific error types
//!
//! - Structured error codes in WALGATE_CATEGORY_NAME format
//! - No silent failures
//!
//! All restore errors are FATAL: a failed restore aborts startup.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use crate::client::ClientError;
use crate::replication::ReplicationError;

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Unrecoverable error requiring operator intervention
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Restore error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreErrorCode {
    /// General restore failure
    WalgateRestoreFailed,
    /// Local I/O failure during restore
    WalgateRestoreIo,
    /// Remote data is inconsistent (checksum, gap, overlap)
    WalgateRestoreCorruption,
    /// Remote could not be read
    WalgateRestoreRemote,
    /// Caller cancelled the restore
    WalgateRestoreCancelled,
}

impl RestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreErrorCode::WalgateRestoreFailed => "WALGATE_RESTORE_FAILED",
            RestoreErrorCode::WalgateRestoreIo => "WALGATE_RESTORE_IO",
            RestoreErrorCode::WalgateRestoreCorruption => "WALGATE_RESTORE_CORRUPTION",
            RestoreErrorCode::WalgateRestoreRemote => "WALGATE_RESTORE_REMOTE",
            RestoreErrorCode::WalgateRestoreCancelled => "WALGATE_RESTORE_CANCELLED",
        }
    }

    pub fn severity(&self) -> Severity {
        Severity::Fatal
    }
}

impl fmt::Display for RestoreErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Restore error with full context
#[derive(Debug)]
pub struct RestoreError {
    code: RestoreErrorCode,
    message: String,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl RestoreError {
    fn new(
        code: RestoreErrorCode,
        message: impl Into<String>,
        source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            source,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(RestoreErrorCode::WalgateRestoreFailed, message, None)
    }

    pub fn io_error(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(RestoreErrorCode::WalgateRestoreIo, message, Some(Box::new(source)))
    }

    pub fn io_error_at_path(path: &std::path::Path, source: io::Error) -> Self {
        Self::io_error(format!("I/O error at {}", path.display()), source)
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Self::new(RestoreErrorCode::WalgateRestoreCorruption, message, None)
    }

    /// A replica client failure; corrupt objects map to the corruption code
    pub fn remote(message: impl Into<String>, source: ClientError) -> Self {
        let code = match source {
            ClientError::Corrupt(_) => RestoreErrorCode::WalgateRestoreCorruption,
            _ => RestoreErrorCode::WalgateRestoreRemote,
        };
        Self::new(code, message, Some(Box::new(source)))
    }

    pub fn replication(message: impl Into<String>, source: ReplicationError) -> Self {
        match source {
            ReplicationError::Cancelled => Self::cancelled(),
            ReplicationError::Client { source, .. } => Self::remote(message, source),
            other => Self::new(
                RestoreErrorCode::WalgateRestoreRemote,
                message,
                Some(Box::new(other)),
            ),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(
            RestoreErrorCode::WalgateRestoreCancelled,
            "restore cancelled",
            None,
        )
    }

    pub fn code(&self) -> RestoreErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// Restore errors always abort startup
    pub fn is_fatal(&self) -> bool {
        true
    }
}

impl fmt::Display for RestoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code.severity(), self.code, self.message)?;
        if let Some(ref source) = self.source {
            write!(f, " (caused by: {})", source)?;
        }
        Ok(())
    }
}

impl StdError for RestoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

/// Result type for restore operations
pub type RestoreResult<T> = Result<T, RestoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RestoreErrorCode::WalgateRestoreFailed.as_str(),
            "WALGATE_RESTORE_FAILED"
        );
        assert_eq!(RestoreErrorCode::WalgateRestoreIo.as_str(), "WALGATE_RESTORE_IO");
        assert_eq!(
            RestoreErrorCode::WalgateRestoreCorruption.as_str(),
            "WALGATE_RESTORE_CORRUPTION"
        );
        assert_eq!(
            RestoreErrorCode::WalgateRestoreRemote.as_str(),
            "WALGATE_RESTORE_REMOTE"
        );
    }

    #[test]
    fn test_all_errors_are_fatal_severity() {
        let codes = [
            RestoreErrorCode::WalgateRestoreFailed,
            RestoreErrorCode::WalgateRestoreIo,
            RestoreErrorCode::WalgateRestoreCorruption,
            RestoreErrorCode::WalgateRestoreRemote,
            RestoreErrorCode::WalgateRestoreCancelled,
        ];
        for code in codes {
            assert_eq!(code.severity(), Severity::Fatal);
        }
        assert!(RestoreError::cancelled().is_fatal());
    }

    #[test]
    fn test_error_display_contains_required_fields() {
        let err = RestoreError::failed("test message");
        let display = format!("{}", err);
        assert!(display.starts_with("[FATAL] WALGATE_RESTORE_FAILED: test message"));
    }

    #[test]
    fn test_remote_corrupt_maps_to_corruption() {
        let err = RestoreError::remote("fetch", ClientError::Corrupt("bad crc".into()));
        assert_eq!(err.code(), RestoreErrorCode::WalgateRestoreCorruption);

        let err = RestoreError::remote("fetch", ClientError::Unavailable("down".into()));
        assert_eq!(err.code(), RestoreErrorCode::WalgateRestoreRemote);
        assert!(err.to_string().contains("caused by: remote unavailable: down"));
    }

    #[test]
    fn test_replication_cancelled_maps_to_cancelled() {
        let err = RestoreError::replication("list", ReplicationError::Cancelled);
        assert_eq!(err.code(), RestoreErrorCode::WalgateRestoreCancelled);
    }

    #[test]
    fn test_io_error_has_source() {
        let io_err = io::Error::new(io::ErrorKind::Other, "disk full");
        let err = RestoreError::io_error("write temp file", io_err);
        assert_eq!(err.code(), RestoreErrorCode::WalgateRestoreIo);
        assert!(StdError::source(&err).is_some());
        assert!(err.to_string().contains("disk full"));
    }
}
