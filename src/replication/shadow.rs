//! Shadow log
//!
//! In-memory queue of items the replicas have not all shipped yet: at most
//! one snapshot plus the ordered segments of the active generation. An item
//! is dropped once every registered replica has acknowledged a position at
//! or past its end.
//!
//! While a replica is unreachable everything since its last acknowledgment
//! stays queued. The manager caps the queue by starting a new generation,
//! which drops every item and forces the lagging replica onto a fresh
//! snapshot.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use super::errors::{ReplicationError, ReplicationResult};
use super::position::{Generation, Position};
use crate::client::{Segment, Snapshot};

/// Items a replica must upload to reach `position`
#[derive(Debug, Clone)]
pub struct ShipBatch {
    pub generation: Generation,
    /// Present when the replica has not confirmed anything in this generation
    pub snapshot: Option<Arc<Snapshot>>,
    pub segments: Vec<Arc<Segment>>,
    /// Position the batch reaches once fully uploaded
    pub position: Position,
}

impl ShipBatch {
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.segments.is_empty()
    }
}

#[derive(Debug, Default)]
struct ShadowInner {
    generation: Option<Generation>,
    position: Option<Position>,
    snapshot: Option<Arc<Snapshot>>,
    segments: VecDeque<Arc<Segment>>,
    acks: HashMap<String, Option<Position>>,
}

/// Shared queue between the WAL tracker and the replica shippers
#[derive(Debug)]
pub struct ShadowLog {
    inner: Mutex<ShadowInner>,
    updates: watch::Sender<Option<Position>>,
}

impl ShadowLog {
    pub fn new() -> Self {
        let (updates, _) = watch::channel(None);
        Self {
            inner: Mutex::new(ShadowInner::default()),
            updates,
        }
    }

    fn lock(&self) -> ReplicationResult<MutexGuard<'_, ShadowInner>> {
        self.inner
            .lock()
            .map_err(|_| ReplicationError::Io(std::io::Error::other("shadow log lock poisoned")))
    }

    /// Register a replica so trimming waits for its acknowledgments
    pub fn register(&self, replica: &str) -> ReplicationResult<()> {
        self.lock()?.acks.entry(replica.to_string()).or_insert(None);
        Ok(())
    }

    /// Start a generation rooted at `snapshot`, discarding everything queued
    pub fn begin_generation(&self, snapshot: Snapshot) -> ReplicationResult<Position> {
        let position = snapshot.position();
        {
            let mut inner = self.lock()?;
            inner.generation = Some(snapshot.generation);
            inner.position = Some(position);
            inner.snapshot = Some(Arc::new(snapshot));
            inner.segments.clear();
        }
        self.updates.send_replace(Some(position));
        Ok(position)
    }

    /// Queue a segment of the active generation and advance to its end
    pub fn append(&self, segment: Segment) -> ReplicationResult<Position> {
        let end = segment.end();
        {
            let mut inner = self.lock()?;
            if inner.generation != Some(segment.generation) {
                return Err(ReplicationError::WalDiscontinuity(format!(
                    "segment for generation {} while {:?} is active",
                    segment.generation, inner.generation
                )));
            }
            inner.segments.push_back(Arc::new(segment));
            inner.position = Some(end);
        }
        self.updates.send_replace(Some(end));
        Ok(end)
    }

    /// Latest position accounted for
    pub fn position(&self) -> ReplicationResult<Option<Position>> {
        Ok(self.lock()?.position)
    }

    pub fn generation(&self) -> ReplicationResult<Option<Generation>> {
        Ok(self.lock()?.generation)
    }

    /// Everything after `confirmed` in the active generation.
    ///
    /// `None` before any generation exists.
    pub fn batch_since(&self, confirmed: Option<Position>) -> ReplicationResult<Option<ShipBatch>> {
        let inner = self.lock()?;
        let (Some(generation), Some(position)) = (inner.generation, inner.position) else {
            return Ok(None);
        };

        let confirmed = confirmed.filter(|c| c.generation == generation);
        let snapshot = match confirmed {
            Some(_) => None,
            None => inner.snapshot.clone(),
        };
        let segments = inner
            .segments
            .iter()
            .filter(|s| confirmed.map_or(true, |c| s.end() > c))
            .cloned()
            .collect();

        Ok(Some(ShipBatch {
            generation,
            snapshot,
            segments,
            position,
        }))
    }

    /// Record that `replica` has stored everything up to `position`, and drop
    /// items every replica has stored.
    pub fn ack(&self, replica: &str, position: Position) -> ReplicationResult<()> {
        let mut inner = self.lock()?;
        if inner.generation != Some(position.generation) {
            return Ok(());
        }
        inner.acks.insert(replica.to_string(), Some(position));

        let generation = position.generation;
        let mut floor: Option<Position> = None;
        for ack in inner.acks.values() {
            match ack {
                Some(p) if p.generation == generation => {
                    floor = Some(floor.map_or(*p, |f| f.min(*p)));
                }
                _ => return Ok(()),
            }
        }

        if let Some(floor) = floor {
            inner.snapshot = None;
            while inner.segments.front().is_some_and(|s| s.end() <= floor) {
                inner.segments.pop_front();
            }
        }
        Ok(())
    }

    /// Number of queued items (snapshot counts as one)
    pub fn pending_items(&self) -> ReplicationResult<usize> {
        let inner = self.lock()?;
        Ok(inner.segments.len() + usize::from(inner.snapshot.is_some()))
    }

    /// Replicas that have not acknowledged the latest position
    pub fn lagging(&self) -> ReplicationResult<Vec<String>> {
        let inner = self.lock()?;
        let mut names: Vec<String> = inner
            .acks
            .iter()
            .filter(|(_, ack)| ack.is_none() || **ack < inner.position)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Receiver that changes whenever the position advances
    pub fn subscribe(&self) -> watch::Receiver<Option<Position>> {
        self.updates.subscribe()
    }
}

impl Default for ShadowLog {
    fn default() -> Self {
        Self::new()
    }
}
