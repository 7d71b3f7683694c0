//! Replication subsystem
//!
//! Tails the local SQLite WAL, assigns every committed change a
//! [`Position`], and ships snapshots and WAL segments to each [`Replica`].
//!
//! - One generation per process start, rooted at a snapshot
//! - Segments always end on a commit frame
//! - The remote position marker is written after the data it covers
//! - Shipping happens in the background and on demand (durability gate);
//!   both paths share one cursor per replica

mod config;
mod context;
mod errors;
mod manager;
mod position;
mod replica;
mod shadow;
pub mod wal;

pub use config::{
    DurabilityPolicy, ManagerOptions, RetryPolicy, DEFAULT_BUSY_TIMEOUT,
    DEFAULT_MAX_PENDING_ITEMS, DEFAULT_MIN_CHECKPOINT_PAGES, DEFAULT_MONITOR_INTERVAL,
    DEFAULT_SHUTDOWN_GRACE,
};
pub use context::{CancelHandle, Context};
pub use errors::{ReplicationError, ReplicationResult};
pub use manager::{
    lock_path, wal_path, CheckpointMode, CheckpointOutcome, DatabaseLock, ManagerStatus,
    ReplicationManager,
};
pub use position::{Generation, Position, PositionParseError, FIRST_INDEX};
pub use replica::{Replica, ReplicaStatus, RestoreTarget};
pub use shadow::{ShadowLog, ShipBatch};
