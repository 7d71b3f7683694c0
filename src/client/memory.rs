//! In-memory replica client
//!
//! Holds every object in process memory. Used by tests and by local
//! development where durability across restarts is not needed. Supports
//! fault injection: writes can be made to fail or to stall.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{
    sort_by_recency, ClientError, ClientResult, GenerationInfo, PositionMarker, ReplicaClient,
    Segment, Snapshot,
};
use crate::replication::{Generation, Position};

#[derive(Debug, Default)]
struct Objects {
    snapshots: HashMap<Generation, Vec<u8>>,
    segments: BTreeMap<(Generation, u64, u64), Vec<u8>>,
    markers: HashMap<Generation, PositionMarker>,
}

/// Replica client that stores objects in memory
#[derive(Debug, Default)]
pub struct MemoryReplicaClient {
    objects: Mutex<Objects>,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
    snapshot_writes: AtomicU64,
    segment_writes: AtomicU64,
    position_writes: AtomicU64,
}

impl MemoryReplicaClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`ClientError::Unavailable`]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay every subsequent write by `delay`
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn snapshot_writes(&self) -> u64 {
        self.snapshot_writes.load(Ordering::SeqCst)
    }

    pub fn segment_writes(&self) -> u64 {
        self.segment_writes.load(Ordering::SeqCst)
    }

    pub fn position_writes(&self) -> u64 {
        self.position_writes.load(Ordering::SeqCst)
    }

    /// Latest marker across all generations
    pub fn latest_marker(&self) -> Option<PositionMarker> {
        self.lock()
            .ok()?
            .markers
            .values()
            .max_by(|a, b| a.position.cmp(&b.position))
            .cloned()
    }

    /// Drop every stored object
    pub fn clear(&self) {
        if let Ok(mut objects) = self.lock() {
            *objects = Objects::default();
        }
    }

    fn lock(&self) -> ClientResult<std::sync::MutexGuard<'_, Objects>> {
        self.objects
            .lock()
            .map_err(|_| ClientError::Unavailable("memory client lock poisoned".into()))
    }

    async fn before_write(&self) -> ClientResult<()> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ClientError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicaClient for MemoryReplicaClient {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn generations(&self) -> ClientResult<Vec<GenerationInfo>> {
        let objects = self.lock()?;
        let mut ids: Vec<Generation> = objects.snapshots.keys().copied().collect();
        ids.extend(objects.markers.keys().copied());
        ids.extend(objects.segments.keys().map(|(g, _, _)| *g));
        ids.sort_unstable();
        ids.dedup();

        let mut generations: Vec<GenerationInfo> = ids
            .into_iter()
            .map(|generation| GenerationInfo {
                generation,
                has_snapshot: objects.snapshots.contains_key(&generation),
                marker: objects.markers.get(&generation).cloned(),
            })
            .collect();
        sort_by_recency(&mut generations);
        Ok(generations)
    }

    async fn latest_position(&self, generation: &Generation) -> ClientResult<Position> {
        self.lock()?
            .markers
            .get(generation)
            .map(|m| m.position)
            .ok_or_else(|| ClientError::NotFound(format!("position marker for {}", generation)))
    }

    async fn fetch_snapshot(&self, generation: &Generation) -> ClientResult<Snapshot> {
        let data = self
            .lock()?
            .snapshots
            .get(generation)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("snapshot for {}", generation)))?;
        Ok(Snapshot {
            generation: *generation,
            data,
        })
    }

    async fn fetch_segments(
        &self,
        generation: &Generation,
        from: &Position,
    ) -> ClientResult<Vec<Segment>> {
        let objects = self.lock()?;
        let start = (*generation, from.index, from.offset);
        let end = (*generation, u64::MAX, u64::MAX);
        Ok(objects
            .segments
            .range(start..=end)
            .map(|(&(generation, index, offset), data)| Segment {
                generation,
                index,
                offset,
                data: data.clone(),
            })
            .collect())
    }

    async fn write_snapshot(&self, snapshot: &Snapshot) -> ClientResult<()> {
        self.before_write().await?;
        self.lock()?
            .snapshots
            .insert(snapshot.generation, snapshot.data.clone());
        self.snapshot_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write_segment(&self, segment: &Segment) -> ClientResult<()> {
        self.before_write().await?;
        self.lock()?.segments.insert(
            (segment.generation, segment.index, segment.offset),
            segment.data.clone(),
        );
        self.segment_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write_position(&self, position: &Position) -> ClientResult<()> {
        self.before_write().await?;
        self.lock()?.markers.insert(
            position.generation,
            PositionMarker {
                position: *position,
                updated_at: Utc::now(),
            },
        );
        self.position_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
