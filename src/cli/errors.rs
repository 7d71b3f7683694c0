//! CLI-specific error types
//!
//! All CLI errors are FATAL: the process prints the error and exits 1.

use std::fmt;
use std::io;

use crate::gateway::{ConfigError, StartupError};
use crate::replication::ReplicationError;
use crate::restore::RestoreError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file or flag error
    ConfigError,
    /// I/O error (listener, runtime)
    IoError,
    /// Restore failed
    RestoreFailed,
    /// Startup failed after restore
    BootFailed,
    /// Shutdown did not complete cleanly
    ShutdownFailed,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "WALGATE_CLI_CONFIG_ERROR",
            Self::IoError => "WALGATE_CLI_IO_ERROR",
            Self::RestoreFailed => "WALGATE_CLI_RESTORE_FAILED",
            Self::BootFailed => "WALGATE_CLI_BOOT_FAILED",
            Self::ShutdownFailed => "WALGATE_CLI_SHUTDOWN_FAILED",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    /// Create a new CLI error
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Config error
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    /// I/O error
    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    /// Restore failed
    pub fn restore_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::RestoreFailed, msg)
    }

    /// Boot failed
    pub fn boot_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::BootFailed, msg)
    }

    /// Shutdown failed
    pub fn shutdown_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ShutdownFailed, msg)
    }

    /// Get the error code
    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        Self::config_error(e.to_string())
    }
}

impl From<RestoreError> for CliError {
    fn from(e: RestoreError) -> Self {
        Self::restore_failed(e.to_string())
    }
}

impl From<StartupError> for CliError {
    fn from(e: StartupError) -> Self {
        match e {
            StartupError::Config(e) => e.into(),
            StartupError::Restore(e) => e.into(),
            other => Self::boot_failed(other.to_string()),
        }
    }
}

impl From<ReplicationError> for CliError {
    fn from(e: ReplicationError) -> Self {
        Self::boot_failed(e.to_string())
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;
