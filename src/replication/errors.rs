//! Replication Error Types
//!
//! Transient errors (remote unavailable) are retried forever by the
//! background shipper and surfaced immediately on the durability gate.
//! Everything raised while opening the manager is fatal to startup.

use thiserror::Error;

use super::position::Position;
use super::wal::WalFormatError;
use crate::client::ClientError;

/// Result type for replication operations
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Replication errors
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// No generation exists yet (empty database, zero commits)
    #[error("no position available: database has no replicated content yet")]
    NoPosition,

    /// Caller's context was cancelled or its deadline passed
    #[error("operation cancelled")]
    Cancelled,

    /// Manager already closed
    #[error("replication manager is closed")]
    Closed,

    /// Replica used before it was attached to a manager
    #[error("replica {0} is not attached to a replication manager")]
    NotAttached(String),

    /// Another process holds the database
    #[error("database {0} is locked by another replication manager")]
    Locked(String),

    /// Local database error
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Local file error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WAL could not be parsed
    #[error("WAL format: {0}")]
    WalFormat(#[from] WalFormatError),

    /// WAL changed underneath the tracker; a new generation is required
    #[error("WAL discontinuity: {0}")]
    WalDiscontinuity(String),

    /// Remote storage failure
    #[error("replica {replica}: {source}")]
    Client {
        replica: String,
        #[source]
        source: ClientError,
    },

    /// Shipping finished but did not reach the requested position
    #[error("replica {replica} confirmed {confirmed:?}, needed {target}")]
    Unconfirmed {
        replica: String,
        confirmed: Option<Position>,
        target: Position,
    },
}

impl ReplicationError {
    /// Wrap a client error with the replica name it came from.
    pub fn client(replica: impl Into<String>, source: ClientError) -> Self {
        Self::Client {
            replica: replica.into(),
            source,
        }
    }

    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ReplicationError::Client { source, .. } => source.is_transient(),
            ReplicationError::Unconfirmed { .. } => true,
            ReplicationError::Io(_) => true,
            _ => false,
        }
    }
}
