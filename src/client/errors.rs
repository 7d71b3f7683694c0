//! # Replica Client Errors

use thiserror::Error;

/// Result type for replica client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Replica client errors
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt object: {0}")]
    Corrupt(String),

    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ClientError {
    /// Network/storage hiccups are worth retrying; missing or corrupt data is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Unavailable(_) | ClientError::Io(_))
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => ClientError::NotFound(e.to_string()),
            _ => ClientError::Io(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err: ClientError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, ClientError::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_io_other_is_transient() {
        let err: ClientError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(err.is_transient());
    }
}
