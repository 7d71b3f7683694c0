//! ObservationScope for begin/complete/failed logging
//!
//! - Logs `{name}_BEGIN` on creation
//! - Logs `{name}_COMPLETE` or `{name}_FAILED` when finished
//! - Logs `{name}_INCOMPLETE` if dropped unfinished

use std::time::Instant;

use super::logger::Logger;

/// A scope that logs begin and outcome events with elapsed time
///
/// ```ignore
/// let scope = ObservationScope::with_fields("RESTORE", &[("db", "/data/app.db")]);
/// // ... do work ...
/// scope.complete_with_fields(&[("position", &pos.to_string())]);
/// ```
pub struct ObservationScope<'a> {
    name: &'a str,
    completed: bool,
    fields: Vec<(&'a str, String)>,
    timer: Timer,
}

impl<'a> ObservationScope<'a> {
    /// Logs `{name}_BEGIN` immediately.
    pub fn new(name: &'a str) -> Self {
        Self::with_fields(name, &[])
    }

    /// Create a scope whose fields are repeated on every event it logs
    pub fn with_fields(name: &'a str, fields: &[(&'a str, &str)]) -> Self {
        Logger::info(&format!("{}_BEGIN", name), fields);

        Self {
            name,
            completed: false,
            fields: fields.iter().map(|(k, v)| (*k, v.to_string())).collect(),
            timer: Timer::new(),
        }
    }

    /// Logs `{name}_COMPLETE` at INFO level.
    pub fn complete(self) {
        self.complete_with_fields(&[]);
    }

    pub fn complete_with_fields(mut self, extra_fields: &[(&str, &str)]) {
        self.completed = true;
        let elapsed = self.timer.elapsed_ms();
        let mut fields = self.field_refs();
        fields.push(("elapsed_ms", &elapsed));
        fields.extend(extra_fields.iter().copied());
        Logger::info(&format!("{}_COMPLETE", self.name), &fields);
    }

    /// Logs `{name}_FAILED` at ERROR level.
    pub fn fail(mut self, reason: &str) {
        self.completed = true;
        let elapsed = self.timer.elapsed_ms();
        let mut fields = self.field_refs();
        fields.push(("elapsed_ms", &elapsed));
        fields.push(("reason", reason));
        Logger::error(&format!("{}_FAILED", self.name), &fields);
    }

    /// Logs `{name}_FAILED` at FATAL level.
    pub fn fail_fatal(mut self, reason: &str) {
        self.completed = true;
        let mut fields = self.field_refs();
        fields.push(("reason", reason));
        Logger::fatal(&format!("{}_FAILED", self.name), &fields);
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    fn field_refs(&self) -> Vec<(&str, &str)> {
        self.fields.iter().map(|(k, v)| (*k, v.as_str())).collect()
    }
}

impl Drop for ObservationScope<'_> {
    fn drop(&mut self) {
        if !self.completed {
            Logger::warn(
                &format!("{}_INCOMPLETE", self.name),
                &[("reason", "scope dropped without completion")],
            );
        }
    }
}

/// A simple duration timer for logging elapsed time
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    /// Elapsed milliseconds as a string
    pub fn elapsed_ms(&self) -> String {
        self.start.elapsed().as_millis().to_string()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
