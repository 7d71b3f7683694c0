//! Replication configuration
//!
//! Fixed at open, immutable afterwards.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default monitor tick
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// WAL size (in pages) above which the monitor truncates it
pub const DEFAULT_MIN_CHECKPOINT_PAGES: u64 = 1000;

/// Bound on the final ship during close
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shadow log length (snapshot plus segments) that forces a new generation
pub const DEFAULT_MAX_PENDING_ITEMS: usize = 1024;

/// SQLite busy timeout on the owned connection
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for opening a [`ReplicationManager`](super::ReplicationManager)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    /// Interval of the background sync + checkpoint tick
    pub monitor_interval: Duration,
    /// Checkpoint (TRUNCATE) once the WAL holds at least this many pages
    pub min_checkpoint_pages: u64,
    pub busy_timeout: Duration,
    /// Once the shadow log holds more items than this, a new generation
    /// replaces everything a lagging replica has not acknowledged
    pub max_pending_items: usize,
    /// Backoff policy of every background shipper
    pub retry: RetryPolicy,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            min_checkpoint_pages: DEFAULT_MIN_CHECKPOINT_PAGES,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            max_pending_items: DEFAULT_MAX_PENDING_ITEMS,
            retry: RetryPolicy::default(),
        }
    }
}

/// Exponential backoff with jitter for background shipping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Backoff with up to 25% random jitter added
    pub fn jittered(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let spread = (base.as_millis() as u64) / 4;
        if spread == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// How many replicas must confirm before a write is acknowledged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurabilityPolicy {
    /// Every attached replica
    #[default]
    All,
    /// The first replica to confirm
    Any,
}

impl DurabilityPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DurabilityPolicy::All => "all",
            DurabilityPolicy::Any => "any",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ManagerOptions::default();
        assert_eq!(options.monitor_interval, Duration::from_secs(1));
        assert_eq!(options.min_checkpoint_pages, 1000);
        assert_eq!(options.max_pending_items, 1024);
        assert_eq!(DurabilityPolicy::default(), DurabilityPolicy::All);
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(1600));
        assert_eq!(policy.backoff(20), Duration::from_secs(30));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = policy.jittered(2);
            assert!(d >= Duration::from_millis(400));
            assert!(d <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_durability_policy_serde() {
        let p: DurabilityPolicy = serde_json::from_str("\"any\"").unwrap();
        assert_eq!(p, DurabilityPolicy::Any);
        assert_eq!(serde_json::to_string(&DurabilityPolicy::All).unwrap(), "\"all\"");
    }
}
