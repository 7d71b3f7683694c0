//! Replica clients
//!
//! A replica client is the object-storage capability the gateway ships to
//! and restores from. Implement [`ReplicaClient`] to add a backend
//! (S3, GCS, Azure Blob, ...).
//!
//! Remote state is organized by generation. Each generation holds one
//! snapshot, an ordered run of WAL segments, and a "latest position" marker
//! that is written only after the segments it covers.

mod errors;
mod file;
mod memory;

pub use errors::{ClientError, ClientResult};
pub use file::FileReplicaClient;
pub use memory::MemoryReplicaClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::replication::{Generation, Position};

/// Full database image at the start of a generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub generation: Generation,
    pub data: Vec<u8>,
}

impl Snapshot {
    /// The snapshot covers everything before the first WAL of its generation.
    pub fn position(&self) -> Position {
        Position::snapshot(self.generation)
    }
}

/// A byte range of one WAL, ending on a commit frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub generation: Generation,
    pub index: u64,
    pub offset: u64,
    pub data: Vec<u8>,
}

impl Segment {
    /// Position of the first byte
    pub fn start(&self) -> Position {
        Position::new(self.generation, self.index, self.offset)
    }

    /// Position just past the last byte
    pub fn end(&self) -> Position {
        Position::new(self.generation, self.index, self.offset + self.data.len() as u64)
    }
}

/// Contents of the latest-position marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionMarker {
    pub position: Position,
    pub updated_at: DateTime<Utc>,
}

/// Summary of one remote generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationInfo {
    pub generation: Generation,
    pub has_snapshot: bool,
    pub marker: Option<PositionMarker>,
}

impl GenerationInfo {
    /// A generation can be restored when it has both a snapshot and a marker.
    pub fn is_restorable(&self) -> bool {
        self.has_snapshot && self.marker.is_some()
    }
}

/// Order generations newest first: latest marker update, then generation id.
pub fn sort_by_recency(generations: &mut [GenerationInfo]) {
    generations.sort_by(|a, b| {
        let a_time = a.marker.as_ref().map(|m| m.updated_at);
        let b_time = b.marker.as_ref().map(|m| m.updated_at);
        b_time
            .cmp(&a_time)
            .then_with(|| b.generation.cmp(&a.generation))
    });
}

/// Object-storage capability used for shipping and restore.
///
/// Implementations must be safe for concurrent use by the background shipper
/// and the on-demand durability gate. Writes must be idempotent: writing the
/// same segment twice stores the same bytes under the same key.
#[async_trait]
pub trait ReplicaClient: Send + Sync {
    /// Backend identifier ("file", "memory", ...)
    fn kind(&self) -> &'static str;

    /// All generations present remotely, newest first
    async fn generations(&self) -> ClientResult<Vec<GenerationInfo>>;

    /// The latest position marker of a generation
    ///
    /// Fails with [`ClientError::NotFound`] if the generation has none.
    async fn latest_position(&self, generation: &Generation) -> ClientResult<Position>;

    /// Fetch a generation's snapshot
    async fn fetch_snapshot(&self, generation: &Generation) -> ClientResult<Snapshot>;

    /// Fetch the segments of a generation starting at or after `from`, in
    /// `(index, offset)` order
    async fn fetch_segments(
        &self,
        generation: &Generation,
        from: &Position,
    ) -> ClientResult<Vec<Segment>>;

    /// Durably store a snapshot
    async fn write_snapshot(&self, snapshot: &Snapshot) -> ClientResult<()>;

    /// Durably store a segment
    async fn write_segment(&self, segment: &Segment) -> ClientResult<()>;

    /// Durably store the latest-position marker of `position.generation`
    async fn write_position(&self, position: &Position) -> ClientResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn info(n: u128, secs: Option<i64>) -> GenerationInfo {
        let generation = Generation::from_uuid(Uuid::from_u128(n));
        GenerationInfo {
            generation,
            has_snapshot: true,
            marker: secs.map(|s| PositionMarker {
                position: Position::snapshot(generation),
                updated_at: Utc.timestamp_opt(s, 0).unwrap(),
            }),
        }
    }

    #[test]
    fn test_sort_by_recency_prefers_latest_marker() {
        let mut gens = vec![info(3, Some(100)), info(1, Some(300)), info(2, None)];
        sort_by_recency(&mut gens);
        let order: Vec<u128> = gens.iter().map(|g| g.generation.as_uuid().as_u128()).collect();
        assert_eq!(order, vec![1, 3, 2]);
    }

    #[test]
    fn test_segment_bounds() {
        let generation = Generation::new();
        let segment = Segment {
            generation,
            index: 2,
            offset: 32,
            data: vec![0; 100],
        };
        assert_eq!(segment.start(), Position::new(generation, 2, 32));
        assert_eq!(segment.end(), Position::new(generation, 2, 132));
    }

    #[test]
    fn test_restorable_requires_snapshot_and_marker() {
        let mut gen = info(1, Some(1));
        assert!(gen.is_restorable());
        gen.has_snapshot = false;
        assert!(!gen.is_restorable());
        assert!(!info(2, None).is_restorable());
    }
}
