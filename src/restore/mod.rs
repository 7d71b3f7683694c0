//! Restore subsystem
//!
//! Rebuilds the local database from the most recent remote generation
//! before the replication manager opens it.
//!
//! # Algorithm
//!
//! 1. Target file exists → skip (existing data is never overwritten)
//! 2. Pick the newest restorable generation → none means start empty
//! 3. Fetch snapshot into `<db>.walgate-restore.tmp`
//! 4. Replay segments in `(index, offset)` order up to the position marker
//! 5. fsync temp, remove stale `-wal`/`-shm`
//! 6. Rename temp → target, fsync parent
//!
//! Any failure deletes the temp file and leaves the target path absent.

mod errors;
mod replay;

pub use errors::{RestoreError, RestoreErrorCode, RestoreResult, Severity};
pub use replay::ReplayStats;

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::observability::{Event, Logger, MetricsRegistry, ObservationScope, Severity as LogSeverity};
use crate::replication::{Context, Generation, Position, Replica, RestoreTarget};

/// Progress of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    NotStarted,
    SkippedExisting,
    NoGenerationFound,
    Restoring,
    Complete,
    Failed,
}

impl RestoreState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreState::NotStarted => "not_started",
            RestoreState::SkippedExisting => "skipped_existing",
            RestoreState::NoGenerationFound => "no_generation_found",
            RestoreState::Restoring => "restoring",
            RestoreState::Complete => "complete",
            RestoreState::Failed => "failed",
        }
    }
}

/// Successful result of a restore run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// A local database already existed and was left untouched
    SkippedExisting,
    /// The remote holds nothing restorable; the caller starts empty
    NoGenerationFound,
    /// The target was rebuilt up to `position`
    Complete {
        generation: Generation,
        position: Position,
        stats: ReplayStats,
    },
}

impl RestoreOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreOutcome::SkippedExisting => RestoreState::SkippedExisting.as_str(),
            RestoreOutcome::NoGenerationFound => RestoreState::NoGenerationFound.as_str(),
            RestoreOutcome::Complete { .. } => RestoreState::Complete.as_str(),
        }
    }
}

/// Runs the startup restore through one replica
pub struct RestoreCoordinator {
    replica: Arc<Replica>,
    metrics: Option<Arc<MetricsRegistry>>,
    state: Mutex<RestoreState>,
}

impl RestoreCoordinator {
    pub fn new(replica: Arc<Replica>) -> Self {
        Self {
            replica,
            metrics: None,
            state: Mutex::new(RestoreState::NotStarted),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> RestoreState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(RestoreState::Failed)
    }

    fn set_state(&self, state: RestoreState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    /// Temporary file a restore builds before renaming into place
    pub fn temp_path(target: &Path) -> PathBuf {
        let mut name = target.as_os_str().to_os_string();
        name.push(".walgate-restore.tmp");
        PathBuf::from(name)
    }

    /// Restore `target` unless it already exists.
    ///
    /// The existence check and the final rename are separate steps; callers
    /// hold the target's [`DatabaseLock`](crate::replication::DatabaseLock)
    /// across the call.
    pub async fn restore(&self, ctx: &Context, target: &Path) -> RestoreResult<RestoreOutcome> {
        match tokio::fs::metadata(target).await {
            Ok(_) => {
                self.set_state(RestoreState::SkippedExisting);
                Logger::event(
                    LogSeverity::Info,
                    Event::RestoreSkippedExisting,
                    &[("path", &target.display().to_string())],
                );
                return Ok(RestoreOutcome::SkippedExisting);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                self.set_state(RestoreState::Failed);
                return Err(RestoreError::io_error_at_path(target, e));
            }
        }

        if ctx.is_cancelled() {
            self.set_state(RestoreState::Failed);
            return Err(RestoreError::cancelled());
        }

        let restore_target = match ctx.race(self.replica.calc_restore_target()).await {
            None => {
                self.set_state(RestoreState::Failed);
                return Err(RestoreError::cancelled());
            }
            Some(Err(e)) => {
                self.set_state(RestoreState::Failed);
                return Err(RestoreError::replication("list remote generations", e));
            }
            Some(Ok(None)) => {
                self.set_state(RestoreState::NoGenerationFound);
                Logger::event(
                    LogSeverity::Info,
                    Event::RestoreNoGeneration,
                    &[
                        ("path", &target.display().to_string()),
                        ("replica", self.replica.name()),
                    ],
                );
                return Ok(RestoreOutcome::NoGenerationFound);
            }
            Some(Ok(Some(t))) => t,
        };

        self.set_state(RestoreState::Restoring);
        let path = target.display().to_string();
        let generation = restore_target.generation.to_string();
        let scope = ObservationScope::with_fields(
            "RESTORE",
            &[("path", &path), ("generation", &generation)],
        );

        let temp = Self::temp_path(target);
        match self.restore_into(ctx, target, &temp, &restore_target).await {
            Ok(stats) => {
                self.set_state(RestoreState::Complete);
                if let Some(metrics) = &self.metrics {
                    metrics.increment_restores();
                }
                scope.complete_with_fields(&[
                    ("position", &restore_target.position.to_string()),
                    ("segments", &stats.segments.to_string()),
                    ("transactions", &stats.transactions.to_string()),
                ]);
                Ok(RestoreOutcome::Complete {
                    generation: restore_target.generation,
                    position: restore_target.position,
                    stats,
                })
            }
            Err(e) => {
                let _ = fs::remove_file(&temp);
                self.set_state(RestoreState::Failed);
                scope.fail_fatal(&e.to_string());
                Err(e)
            }
        }
    }

    async fn restore_into(
        &self,
        ctx: &Context,
        target: &Path,
        temp: &Path,
        restore_target: &RestoreTarget,
    ) -> RestoreResult<ReplayStats> {
        let client = self.replica.client();
        let generation = restore_target.generation;

        let snapshot = ctx
            .race(client.fetch_snapshot(&generation))
            .await
            .ok_or_else(RestoreError::cancelled)?
            .map_err(|e| RestoreError::remote("fetch snapshot", e))?;

        let segments = ctx
            .race(client.fetch_segments(&generation, &Position::snapshot(generation)))
            .await
            .ok_or_else(RestoreError::cancelled)?
            .map_err(|e| RestoreError::remote("fetch segments", e))?;

        let planned = replay::plan(segments, &restore_target.position)?;
        let page_size = replay::database_page_size(&snapshot.data)?;

        let ctx = ctx.clone();
        let target = target.to_path_buf();
        let temp = temp.to_path_buf();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = temp.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| RestoreError::io_error_at_path(parent, e))?;
            }
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp)
                .map_err(|e| RestoreError::io_error_at_path(&temp, e))?;
            file.write_all(&snapshot.data)
                .map_err(|e| RestoreError::io_error_at_path(&temp, e))?;

            let stats = replay::apply(&ctx, &mut file, page_size, &planned)?;

            file.sync_all()
                .map_err(|e| RestoreError::io_error_at_path(&temp, e))?;
            drop(file);

            ctx.check().map_err(|_| RestoreError::cancelled())?;
            install(&temp, &target)?;
            Ok(stats)
        })
        .await
        .map_err(|e| RestoreError::failed(format!("restore task failed: {}", e)))?
    }
}

/// Move a fully written database into place
fn install(temp: &Path, target: &Path) -> RestoreResult<()> {
    for suffix in ["-wal", "-shm"] {
        let mut name = target.as_os_str().to_os_string();
        name.push(suffix);
        let stale = PathBuf::from(name);
        match fs::remove_file(&stale) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(RestoreError::io_error_at_path(&stale, e)),
        }
    }

    fs::rename(temp, target).map_err(|e| RestoreError::io_error_at_path(target, e))?;

    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fsync_dir(parent)?;
    }
    Ok(())
}

fn fsync_dir(dir: &Path) -> RestoreResult<()> {
    #[cfg(unix)]
    {
        fs::File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| RestoreError::io_error(format!("Failed to fsync {}", dir.display()), e))?;
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
    }

    Ok(())
}
