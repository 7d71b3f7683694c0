//! Observability subsystem
//!
//! - Structured logging (JSON, one line per event)
//! - Atomic counters, exposed at `/metrics`
//! - Typed lifecycle events
//!
//! ```ignore
//! use walgate::observability::{Event, Logger, MetricsRegistry, ObservationScope, Severity};
//!
//! Logger::event(Severity::Info, Event::WriteDurable, &[("post", &post.to_string())]);
//!
//! let metrics = MetricsRegistry::new();
//! metrics.increment_writes_acknowledged();
//!
//! let scope = ObservationScope::new("CHECKPOINT");
//! // ... do work ...
//! scope.complete();
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::{ObservationScope, Timer};

#[cfg(test)]
pub(crate) use logger::capture_log;

/// Log a lifecycle event at its natural severity
pub fn log_event(event: Event) {
    log_event_with_fields(event, &[]);
}

/// Log a lifecycle event with fields at its natural severity
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    let severity = if event.is_fatal() {
        Severity::Fatal
    } else {
        Severity::Info
    };
    Logger::event(severity, event, fields);
}
