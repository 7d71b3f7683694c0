//! Metrics registry
//!
//! - Counters only
//! - Monotonic increase
//! - Reset only on process start

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters shared by the gateway, the manager, and every replica.
///
/// Relaxed ordering throughout: counters are observed, never synchronized on.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    writes_acknowledged: AtomicU64,
    writes_not_committed: AtomicU64,
    writes_not_durable: AtomicU64,
    snapshots_shipped: AtomicU64,
    segments_shipped: AtomicU64,
    bytes_shipped: AtomicU64,
    ship_failures: AtomicU64,
    checkpoints: AtomicU64,
    generations_created: AtomicU64,
    restores: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Write path

    pub fn increment_writes_acknowledged(&self) {
        self.writes_acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_writes_not_committed(&self) {
        self.writes_not_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_writes_not_durable(&self) {
        self.writes_not_durable.fetch_add(1, Ordering::Relaxed);
    }

    // Shipping

    pub fn increment_snapshots_shipped(&self, bytes: u64) {
        self.snapshots_shipped.fetch_add(1, Ordering::Relaxed);
        self.bytes_shipped.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_segments_shipped(&self, bytes: u64) {
        self.segments_shipped.fetch_add(1, Ordering::Relaxed);
        self.bytes_shipped.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_ship_failures(&self) {
        self.ship_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Local database

    pub fn increment_checkpoints(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_generations(&self) {
        self.generations_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_restores(&self) {
        self.restores.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values as a JSON object
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            writes_acknowledged: self.writes_acknowledged.load(Ordering::Relaxed),
            writes_not_committed: self.writes_not_committed.load(Ordering::Relaxed),
            writes_not_durable: self.writes_not_durable.load(Ordering::Relaxed),
            snapshots_shipped: self.snapshots_shipped.load(Ordering::Relaxed),
            segments_shipped: self.segments_shipped.load(Ordering::Relaxed),
            bytes_shipped: self.bytes_shipped.load(Ordering::Relaxed),
            ship_failures: self.ship_failures.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            generations_created: self.generations_created.load(Ordering::Relaxed),
            restores: self.restores.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub writes_acknowledged: u64,
    pub writes_not_committed: u64,
    pub writes_not_durable: u64,
    pub snapshots_shipped: u64,
    pub segments_shipped: u64,
    pub bytes_shipped: u64,
    pub ship_failures: u64,
    pub checkpoints: u64,
    pub generations_created: u64,
    pub restores: u64,
}
