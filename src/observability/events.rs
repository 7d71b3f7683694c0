//! Observability events for walgate
//!
//! Every lifecycle event the gateway emits is named here.
//! Events are explicit and typed.

use std::fmt;

/// Observable events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Boot & Lifecycle
    /// Startup begins
    BootStart,
    /// Startup complete, ready to serve
    BootComplete,
    /// HTTP listener bound
    Serving,
    /// Shutdown initiated
    ShutdownStart,
    /// Shutdown complete
    ShutdownComplete,

    // Configuration
    /// Configuration loaded
    ConfigLoaded,

    // Restore
    /// Local database already present, restore skipped
    RestoreSkippedExisting,
    /// No restorable remote generation
    RestoreNoGeneration,
    /// Restore failed (FATAL)
    RestoreFailed,

    // Replication
    /// Replication manager opened the database
    ReplicationOpen,
    /// Replication manager closed
    ReplicationClosed,
    /// New generation started
    GenerationCreated,
    /// Generation replaced after a WAL discontinuity
    GenerationReset,
    /// SQLite restarted the WAL
    WalRestart,
    /// WAL no longer matches what was tracked
    WalDiscontinuity,
    /// Shadow log over its cap; a new generation replaces it
    ShadowOverflow,
    /// Background shipping failed, will retry
    ShipRetry,
    /// Final ship during close did not finish
    ShipAbandoned,

    // Checkpoint
    /// Checkpoint could not run (readers active)
    CheckpointBusy,

    // Writes
    /// Write acknowledged after remote confirmation
    WriteDurable,
    /// Write failed before commit
    WriteNotCommitted,
    /// Write committed locally but not confirmed remote
    WriteNotDurable,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::BootStart => "WALGATE_STARTUP_BEGIN",
            Event::BootComplete => "WALGATE_STARTUP_COMPLETE",
            Event::Serving => "WALGATE_SERVING",
            Event::ShutdownStart => "SHUTDOWN_START",
            Event::ShutdownComplete => "SHUTDOWN_COMPLETE",

            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::RestoreSkippedExisting => "RESTORE_SKIPPED_EXISTING",
            Event::RestoreNoGeneration => "RESTORE_NO_GENERATION_FOUND",
            Event::RestoreFailed => "RESTORE_FAILED",

            Event::ReplicationOpen => "REPLICATION_OPEN",
            Event::ReplicationClosed => "REPLICATION_CLOSED",
            Event::GenerationCreated => "REPLICATION_GENERATION_CREATED",
            Event::GenerationReset => "REPLICATION_GENERATION_RESET",
            Event::WalRestart => "REPLICATION_WAL_RESTART",
            Event::WalDiscontinuity => "REPLICATION_WAL_DISCONTINUITY",
            Event::ShadowOverflow => "REPLICATION_SHADOW_OVERFLOW",
            Event::ShipRetry => "REPLICA_SHIP_RETRY",
            Event::ShipAbandoned => "REPLICA_SHIP_ABANDONED",

            Event::CheckpointBusy => "CHECKPOINT_BUSY",

            Event::WriteDurable => "WRITE_DURABLE",
            Event::WriteNotCommitted => "WRITE_NOT_COMMITTED",
            Event::WriteNotDurable => "WRITE_NOT_DURABLE",
        }
    }

    /// Returns true if this event indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::RestoreFailed)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_events_have_string_representation() {
        let events = [
            Event::BootStart,
            Event::BootComplete,
            Event::Serving,
            Event::ShutdownStart,
            Event::ShutdownComplete,
            Event::ConfigLoaded,
            Event::RestoreSkippedExisting,
            Event::RestoreNoGeneration,
            Event::RestoreFailed,
            Event::ReplicationOpen,
            Event::ReplicationClosed,
            Event::GenerationCreated,
            Event::GenerationReset,
            Event::WalRestart,
            Event::WalDiscontinuity,
            Event::ShadowOverflow,
            Event::ShipRetry,
            Event::ShipAbandoned,
            Event::CheckpointBusy,
            Event::WriteDurable,
            Event::WriteNotCommitted,
            Event::WriteNotDurable,
        ];

        for event in events {
            let s = event.as_str();
            assert!(!s.is_empty());
            assert!(s.chars().all(|c| c.is_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_fatal_events() {
        assert!(Event::RestoreFailed.is_fatal());
        assert!(!Event::RestoreSkippedExisting.is_fatal());
        assert!(!Event::WriteNotDurable.is_fatal());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(format!("{}", Event::WriteDurable), "WRITE_DURABLE");
        assert_eq!(
            format!("{}", Event::GenerationReset),
            "REPLICATION_GENERATION_RESET"
        );
    }
}
