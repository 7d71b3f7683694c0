//! Replication manager
//!
//! Owns the single SQLite connection, tails its WAL into the shadow log,
//! and drives one background shipper per replica plus a monitor task that
//! syncs and checkpoints on a fixed interval.
//!
//! Lock order: connection mutex, then tracker mutex. [`ReplicationManager::sync`]
//! takes only the tracker mutex, so it may run while a writer holds the
//! connection.
//!
//! SQLite in WAL mode only writes the main database file during a checkpoint,
//! and autocheckpointing is disabled, so the database file read under the
//! tracker mutex plus every committed WAL frame after it reconstructs the
//! database exactly.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use fs2::FileExt;
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::config::ManagerOptions;
use super::context::Context;
use super::errors::{ReplicationError, ReplicationResult};
use super::position::{Generation, Position, FIRST_INDEX};
use super::replica::{Replica, ReplicaStatus};
use super::shadow::ShadowLog;
use super::wal::{scan_committed, Checksum, WalHeader, WAL_HEADER_SIZE};
use crate::client::{Segment, Snapshot};
use crate::observability::{Event, Logger, MetricsRegistry, ObservationScope, Severity};

/// When [`ReplicationManager::checkpoint`] truncates the WAL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Only once the WAL reaches `min_checkpoint_pages`
    Threshold,
    /// Always
    Force,
}

/// Outcome of a checkpoint attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// WAL below the threshold
    Skipped,
    /// Readers held the WAL; retried on the next tick
    Busy,
    /// WAL copied into the database file and truncated
    Truncated { pages: u64 },
}

/// Point-in-time view served on `/status`
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub path: String,
    pub generation: Option<Generation>,
    pub position: Option<Position>,
    pub pending_items: usize,
    pub closed: bool,
    pub replicas: Vec<ReplicaStatus>,
}

/// WAL read state of the active generation
#[derive(Debug, Default)]
struct WalTracker {
    generation: Option<Generation>,
    index: u64,
    /// WAL bytes accounted for, header included
    offset: u64,
    header: Option<WalHeader>,
    checksum: Checksum,
    /// Set after the manager's own truncating checkpoint; the next salt
    /// change is a WAL restart rather than a discontinuity
    restart_expected: bool,
}

/// Exclusive advisory lock on `<db>-walgate.lock`.
///
/// Held from before restore until [`ReplicationManager::close`], so one
/// process at a time decides whether the database file exists and owns it.
#[derive(Debug)]
pub struct DatabaseLock {
    file: File,
    path: PathBuf,
}

impl DatabaseLock {
    /// Take the lock of the database at `db`, creating its directory.
    ///
    /// Fails with [`ReplicationError::Locked`] when another process holds it.
    pub fn acquire(db: &Path) -> ReplicationResult<Self> {
        if let Some(parent) = db.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let path = lock_path(db);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| ReplicationError::Locked(db.display().to_string()))?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Owner of the local database and driver of replication
pub struct ReplicationManager {
    path: PathBuf,
    wal_path: PathBuf,
    options: ManagerOptions,
    conn: Mutex<Option<Connection>>,
    tracker: Mutex<WalTracker>,
    shadow: Arc<ShadowLog>,
    replicas: Vec<Arc<Replica>>,
    metrics: Arc<MetricsRegistry>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    lock: Mutex<Option<DatabaseLock>>,
}

impl std::fmt::Debug for ReplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationManager")
            .field("path", &self.path)
            .field("replicas", &self.replicas)
            .finish()
    }
}

impl ReplicationManager {
    /// Open the database at `path`, attach `replicas`, and start the
    /// background tasks. Every failure here is fatal to startup.
    pub async fn open(
        path: impl AsRef<Path>,
        replicas: Vec<Arc<Replica>>,
        options: ManagerOptions,
        metrics: Arc<MetricsRegistry>,
    ) -> ReplicationResult<Arc<Self>> {
        let lock = DatabaseLock::acquire(path.as_ref())?;
        Self::open_locked(path, lock, replicas, options, metrics).await
    }

    /// [`open`](Self::open) with a lock the caller already holds
    pub async fn open_locked(
        path: impl AsRef<Path>,
        lock: DatabaseLock,
        replicas: Vec<Arc<Replica>>,
        options: ManagerOptions,
        metrics: Arc<MetricsRegistry>,
    ) -> ReplicationResult<Arc<Self>> {
        let path = path.as_ref().to_path_buf();

        let conn = {
            let path = path.clone();
            let options = options.clone();
            tokio::task::spawn_blocking(move || open_local(&path, &options))
                .await
                .map_err(join_error)??
        };

        let shadow = Arc::new(ShadowLog::new());
        for replica in &replicas {
            replica.attach(shadow.clone(), metrics.clone(), options.retry)?;
        }

        let (shutdown, _) = watch::channel(false);
        let manager = Arc::new(Self {
            wal_path: wal_path(&path),
            path,
            options,
            conn: Mutex::new(Some(conn)),
            tracker: Mutex::new(WalTracker::default()),
            shadow,
            replicas,
            metrics,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            lock: Mutex::new(Some(lock)),
        });

        {
            let m = manager.clone();
            tokio::task::spawn_blocking(move || m.sync(&Context::background()))
                .await
                .map_err(join_error)??;
        }

        manager.start_tasks()?;

        Logger::event(
            Severity::Info,
            Event::ReplicationOpen,
            &[
                ("path", &manager.path.display().to_string()),
                ("replicas", &manager.replicas.len().to_string()),
            ],
        );
        Ok(manager)
    }

    fn start_tasks(self: &Arc<Self>) -> ReplicationResult<()> {
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| poisoned("task list"))?;

        for replica in &self.replicas {
            tasks.push(tokio::spawn(
                replica
                    .clone()
                    .run(self.shutdown.subscribe(), self.options.monitor_interval),
            ));
        }

        tasks.push(tokio::spawn(monitor(
            Arc::downgrade(self),
            self.shutdown.subscribe(),
            self.options.monitor_interval,
        )));
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn replicas(&self) -> &[Arc<Replica>] {
        &self.replicas
    }

    pub fn replica(&self, name: &str) -> Option<&Arc<Replica>> {
        self.replicas.iter().find(|r| r.name() == name)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Latest position accounted for.
    ///
    /// [`ReplicationError::NoPosition`] until the database has content.
    pub fn current_position(&self) -> ReplicationResult<Position> {
        self.shadow.position()?.ok_or(ReplicationError::NoPosition)
    }

    /// Run `f` on the owned connection. Blocks; call from a blocking thread.
    pub fn with_connection<T, F>(&self, f: F) -> ReplicationResult<T>
    where
        F: FnOnce(&mut Connection) -> T,
    {
        let mut guard = self.conn.lock().map_err(|_| poisoned("connection"))?;
        let conn = guard.as_mut().ok_or(ReplicationError::Closed)?;
        Ok(f(conn))
    }

    fn lock_tracker(&self) -> ReplicationResult<MutexGuard<'_, WalTracker>> {
        self.tracker.lock().map_err(|_| poisoned("wal tracker"))
    }

    /// Move newly committed WAL frames into the shadow log.
    ///
    /// Returns the current position, or `None` while the database is empty.
    /// Never touches the network or the connection lock.
    pub fn sync(&self, ctx: &Context) -> ReplicationResult<Option<Position>> {
        ctx.check()?;
        let mut tracker = self.lock_tracker()?;
        self.sync_locked(&mut tracker)
    }

    fn sync_locked(&self, tracker: &mut WalTracker) -> ReplicationResult<Option<Position>> {
        let position = self.sync_tracked(tracker)?;
        let pending = self.shadow.pending_items()?;
        if pending <= self.options.max_pending_items {
            return Ok(position);
        }

        // A replica too far behind restarts from a fresh snapshot
        Logger::event(
            Severity::Warn,
            Event::ShadowOverflow,
            &[
                ("pending", &pending.to_string()),
                ("max", &self.options.max_pending_items.to_string()),
                ("lagging", &self.shadow.lagging()?.join(",")),
            ],
        );
        self.reset_generation(tracker)?;
        self.sync_tracked(tracker)
    }

    fn reset_generation(&self, tracker: &mut WalTracker) -> ReplicationResult<Position> {
        let previous = tracker.generation;
        let position = self.begin_generation(tracker)?;
        Logger::event(
            Severity::Warn,
            Event::GenerationReset,
            &[
                ("previous", &previous.map(|g| g.to_string()).unwrap_or_default()),
                ("generation", &position.generation.to_string()),
            ],
        );
        Ok(position)
    }

    fn sync_tracked(&self, tracker: &mut WalTracker) -> ReplicationResult<Option<Position>> {
        // One reset at most per call
        for _ in 0..2 {
            match self.sync_step(tracker) {
                Err(ReplicationError::WalDiscontinuity(reason)) => {
                    Logger::event(
                        Severity::Warn,
                        Event::WalDiscontinuity,
                        &[("path", &self.path.display().to_string()), ("reason", &reason)],
                    );
                    self.reset_generation(tracker)?;
                }
                other => return other,
            }
        }
        self.sync_step(tracker)
    }

    fn sync_step(&self, tracker: &mut WalTracker) -> ReplicationResult<Option<Position>> {
        if let Some(result) = self.sync_tail(tracker)? {
            return Ok(result);
        }
        let wal = read_or_empty(&self.wal_path)?;

        if tracker.generation.is_none() {
            let has_commits = WalHeader::parse(&wal)
                .map(|h| scan_committed(&h, &wal[WAL_HEADER_SIZE..], h.checksum).commits > 0)
                .unwrap_or(false);
            if !has_commits && !database_has_schema(&self.path)? {
                return Ok(None);
            }
            let position = self.begin_generation(tracker)?;
            Logger::event(
                Severity::Info,
                Event::GenerationCreated,
                &[("generation", &position.generation.to_string())],
            );
        }

        let Some(generation) = tracker.generation else {
            return Ok(None);
        };

        if wal.len() < WAL_HEADER_SIZE {
            if tracker.offset > 0 && !tracker.restart_expected {
                return Err(ReplicationError::WalDiscontinuity(format!(
                    "WAL shrank to {} bytes below tracked offset {}",
                    wal.len(),
                    tracker.offset
                )));
            }
            return self.shadow.position();
        }

        let header = match WalHeader::parse(&wal) {
            Ok(header) => header,
            Err(_) if tracker.offset == 0 || tracker.restart_expected => {
                return self.shadow.position();
            }
            Err(e) => return Err(ReplicationError::WalDiscontinuity(e.to_string())),
        };

        if tracker.header.map(|h| h.salt) != Some(header.salt) {
            if tracker.header.is_some() {
                if !tracker.restart_expected {
                    return Err(ReplicationError::WalDiscontinuity(
                        "WAL salt changed without a checkpoint".into(),
                    ));
                }
                // Index moves only once the new WAL holds a commit
                let scan = scan_committed(&header, &wal[WAL_HEADER_SIZE..], header.checksum);
                if scan.commits == 0 {
                    return self.shadow.position();
                }
                tracker.index += 1;
                Logger::event(
                    Severity::Info,
                    Event::WalRestart,
                    &[
                        ("generation", &generation.to_string()),
                        ("index", &tracker.index.to_string()),
                    ],
                );
            }
            tracker.header = Some(header);
            tracker.checksum = header.checksum;
            tracker.offset = 0;
            tracker.restart_expected = false;
        }

        let start = tracker.offset as usize;
        if wal.len() < start {
            return Err(ReplicationError::WalDiscontinuity(format!(
                "WAL is {} bytes, {} already accounted for",
                wal.len(),
                start
            )));
        }

        let frames_from = start.max(WAL_HEADER_SIZE);
        let scan = scan_committed(&header, &wal[frames_from..], tracker.checksum);
        if scan.commits == 0 {
            return self.shadow.position();
        }

        let end = frames_from + scan.committed_len;
        let position = self.shadow.append(Segment {
            generation,
            index: tracker.index,
            offset: tracker.offset,
            data: wal[start..end].to_vec(),
        })?;
        tracker.offset = end as u64;
        tracker.checksum = scan.checksum;
        Ok(Some(position))
    }

    /// Steady state: same WAL as last time, so only bytes past the tracked
    /// offset are read. `None` when the full read has to decide.
    fn sync_tail(&self, tracker: &mut WalTracker) -> ReplicationResult<Option<Option<Position>>> {
        let (Some(generation), Some(known)) = (tracker.generation, tracker.header) else {
            return Ok(None);
        };
        if tracker.restart_expected || tracker.offset < WAL_HEADER_SIZE as u64 {
            return Ok(None);
        }
        let Some((header, tail)) = read_wal_tail(&self.wal_path, tracker.offset)? else {
            return Ok(None);
        };
        if header.salt != known.salt {
            return Ok(None);
        }

        let scan = scan_committed(&header, &tail, tracker.checksum);
        if scan.commits == 0 {
            return self.shadow.position().map(Some);
        }
        let position = self.shadow.append(Segment {
            generation,
            index: tracker.index,
            offset: tracker.offset,
            data: tail[..scan.committed_len].to_vec(),
        })?;
        tracker.offset += scan.committed_len as u64;
        tracker.checksum = scan.checksum;
        Ok(Some(Some(position)))
    }

    /// Start a generation rooted at the current database file.
    ///
    /// The WAL live at this moment becomes index 1 and is tailed from byte 0.
    fn begin_generation(&self, tracker: &mut WalTracker) -> ReplicationResult<Position> {
        let generation = Generation::new();
        let data = read_or_empty(&self.path)?;

        *tracker = WalTracker {
            generation: Some(generation),
            index: FIRST_INDEX,
            ..WalTracker::default()
        };
        self.metrics.increment_generations();
        self.shadow.begin_generation(Snapshot { generation, data })
    }

    /// WAL size in pages, from its length on disk
    pub fn wal_pages(&self) -> ReplicationResult<u64> {
        let len = match fs::metadata(&self.wal_path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        if len < WAL_HEADER_SIZE as u64 {
            return Ok(0);
        }

        let frame_size = self
            .lock_tracker()?
            .header
            .map(|h| h.frame_size() as u64)
            .unwrap_or(0);
        if frame_size == 0 {
            return Ok(0);
        }
        Ok((len - WAL_HEADER_SIZE as u64) / frame_size)
    }

    /// Sync, then copy the WAL into the database file and truncate it.
    ///
    /// Holds the connection for the whole operation so no write lands
    /// between the final sync and the truncation. Blocks.
    pub fn checkpoint(&self, ctx: &Context, mode: CheckpointMode) -> ReplicationResult<CheckpointOutcome> {
        ctx.check()?;

        if mode == CheckpointMode::Threshold && self.wal_pages()? < self.options.min_checkpoint_pages {
            return Ok(CheckpointOutcome::Skipped);
        }

        let guard = self.conn.lock().map_err(|_| poisoned("connection"))?;
        let conn = guard.as_ref().ok_or(ReplicationError::Closed)?;
        let mut tracker = self.lock_tracker()?;

        self.sync_locked(&mut tracker)?;
        let pages = self.wal_pages_locked(&tracker)?;

        let scope = ObservationScope::with_fields("CHECKPOINT", &[("mode", "TRUNCATE")]);
        let busy = match truncate_wal(conn) {
            Ok(busy) => busy,
            Err(e) => {
                scope.fail(&e.to_string());
                return Err(e.into());
            }
        };

        if busy {
            scope.complete_with_fields(&[("busy", "true")]);
            Logger::event(
                Severity::Warn,
                Event::CheckpointBusy,
                &[("path", &self.path.display().to_string())],
            );
            return Ok(CheckpointOutcome::Busy);
        }

        tracker.restart_expected = true;
        self.metrics.increment_checkpoints();
        scope.complete_with_fields(&[("pages", &pages.to_string())]);
        Ok(CheckpointOutcome::Truncated { pages })
    }

    fn wal_pages_locked(&self, tracker: &WalTracker) -> ReplicationResult<u64> {
        let len = match fs::metadata(&self.wal_path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(match tracker.header {
            Some(h) if len >= WAL_HEADER_SIZE as u64 => {
                (len - WAL_HEADER_SIZE as u64) / h.frame_size() as u64
            }
            _ => 0,
        })
    }

    /// One monitor tick: sync, and checkpoint past the threshold
    fn tick(&self) -> ReplicationResult<()> {
        self.sync(&Context::background())?;
        self.checkpoint(&Context::background(), CheckpointMode::Threshold)?;
        Ok(())
    }

    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            path: self.path.display().to_string(),
            generation: self.shadow.generation().ok().flatten(),
            position: self.shadow.position().ok().flatten(),
            pending_items: self.shadow.pending_items().unwrap_or(0),
            closed: self.is_closed(),
            replicas: self.replicas.iter().map(|r| r.status()).collect(),
        }
    }

    /// Soft close.
    ///
    /// Stops the background tasks, syncs once more, and gives every replica
    /// one attempt to ship. Shipping and task joins share one deadline of
    /// `grace`. Then closes the connection and releases the lock file. Safe
    /// to call more than once.
    pub async fn close(self: &Arc<Self>, grace: Duration) -> ReplicationResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown.send(true);

        let ctx = Context::background().with_timeout(grace);
        let deadline = ctx.deadline().unwrap_or_else(|| Instant::now() + grace);

        let final_sync = {
            let m = self.clone();
            let ctx = ctx.clone();
            tokio::task::spawn_blocking(move || m.sync(&ctx))
                .await
                .map_err(join_error)
                .and_then(|r| r)
        };
        if let Err(e) = final_sync {
            Logger::warn(
                Event::ShipAbandoned.as_str(),
                &[("stage", "final_sync"), ("error", &e.to_string())],
            );
        }

        let ships = self.replicas.iter().map(|replica| {
            let ctx = ctx.clone();
            async move { (replica.name().to_string(), replica.ship_pending(&ctx).await) }
        });
        for (name, result) in futures_util::future::join_all(ships).await {
            match result {
                Ok(_) | Err(ReplicationError::NoPosition) => {}
                Err(e) => Logger::event(
                    Severity::Warn,
                    Event::ShipAbandoned,
                    &[("replica", &name), ("error", &e.to_string())],
                ),
            }
        }

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                abort.abort();
                Logger::warn(
                    Event::ShipAbandoned.as_str(),
                    &[("stage", "join"), ("reason", "task did not stop within grace")],
                );
            }
        }

        let conn = self
            .conn
            .lock()
            .map_err(|_| poisoned("connection"))?
            .take();
        if let Some(conn) = conn {
            tokio::task::spawn_blocking(move || conn.close().map_err(|(_, e)| e))
                .await
                .map_err(join_error)??;
        }

        if let Some(lock) = self.lock.lock().map_err(|_| poisoned("lock file"))?.take() {
            lock.release();
        }

        Logger::event(
            Severity::Info,
            Event::ReplicationClosed,
            &[("path", &self.path.display().to_string())],
        );
        Ok(())
    }
}

async fn monitor(manager: Weak<ReplicationManager>, mut shutdown: watch::Receiver<bool>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let Some(m) = manager.upgrade() else {
            break;
        };
        let result = tokio::task::spawn_blocking(move || m.tick()).await;
        match result {
            Ok(Ok(())) | Ok(Err(ReplicationError::Closed)) => {}
            Ok(Err(e)) => Logger::warn("REPLICATION_MONITOR_ERROR", &[("error", &e.to_string())]),
            Err(e) => Logger::error("REPLICATION_MONITOR_ERROR", &[("error", &e.to_string())]),
        }
    }
}

/// `<db>-wal`
pub fn wal_path(db: &Path) -> PathBuf {
    sibling(db, "-wal")
}

/// `<db>-walgate.lock`
pub fn lock_path(db: &Path) -> PathBuf {
    sibling(db, "-walgate.lock")
}

fn sibling(db: &Path, suffix: &str) -> PathBuf {
    let mut name = db.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn open_local(path: &Path, options: &ManagerOptions) -> ReplicationResult<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(options.busy_timeout)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "wal_autocheckpoint", 0)?;
    conn.pragma_update(None, "synchronous", "FULL")?;

    // Fold any leftover WAL into the database file before the first generation
    truncate_wal(&conn)?;

    Ok(conn)
}

/// `PRAGMA wal_checkpoint(TRUNCATE)`; returns true if the checkpoint was blocked
fn truncate_wal(conn: &Connection) -> rusqlite::Result<bool> {
    let mut busy: i64 = 0;
    conn.pragma_update_and_check(None, "wal_checkpoint", "TRUNCATE", |row| {
        busy = row.get(0)?;
        Ok(())
    })?;
    Ok(busy != 0)
}

/// WAL header plus every byte from `offset` on. `None` when the file is
/// missing, shorter than `offset`, or has no valid header.
fn read_wal_tail(path: &Path, offset: u64) -> io::Result<Option<(WalHeader, Vec<u8>)>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if file.metadata()?.len() < offset {
        return Ok(None);
    }

    let mut head = [0u8; WAL_HEADER_SIZE];
    match file.read_exact(&mut head) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let Ok(header) = WalHeader::parse(&head) else {
        return Ok(None);
    };

    file.seek(SeekFrom::Start(offset))?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail)?;
    Ok(Some((header, tail)))
}

fn read_or_empty(path: &Path) -> io::Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// True once the database header records a schema (any table created)
fn database_has_schema(path: &Path) -> io::Result<bool> {
    let mut header = [0u8; 100];
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(e),
    }
    let cookie = u32::from_be_bytes([header[40], header[41], header[42], header[43]]);
    Ok(cookie != 0)
}

fn poisoned(what: &str) -> ReplicationError {
    ReplicationError::Io(io::Error::other(format!("{} lock poisoned", what)))
}

fn join_error(e: tokio::task::JoinError) -> ReplicationError {
    ReplicationError::Io(io::Error::other(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MemoryReplicaClient, ReplicaClient};
    use tempfile::TempDir;

    fn options() -> ManagerOptions {
        ManagerOptions {
            monitor_interval: Duration::from_millis(50),
            ..ManagerOptions::default()
        }
    }

    async fn open(dir: &TempDir) -> (Arc<ReplicationManager>, Arc<MemoryReplicaClient>) {
        let client = Arc::new(MemoryReplicaClient::new());
        let replica = Replica::new("memory", client.clone());
        let manager = ReplicationManager::open(
            dir.path().join("app.db"),
            vec![replica],
            options(),
            Arc::new(MetricsRegistry::new()),
        )
        .await
        .unwrap();
        (manager, client)
    }

    fn write(manager: &ReplicationManager, sql: &str) {
        manager
            .with_connection(|conn| conn.execute_batch(sql))
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_database_has_no_position() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = open(&dir).await;
        assert!(matches!(
            manager.current_position(),
            Err(ReplicationError::NoPosition)
        ));
        assert!(manager.sync(&Context::background()).unwrap().is_none());
        manager.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_first_commit_creates_generation_at_first_index() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = open(&dir).await;

        write(&manager, "CREATE TABLE t (v INTEGER)");
        let pos = manager.sync(&Context::background()).unwrap().unwrap();
        assert_eq!(pos.index, FIRST_INDEX);
        assert!(pos.offset > WAL_HEADER_SIZE as u64);

        write(&manager, "INSERT INTO t VALUES (1)");
        let next = manager.sync(&Context::background()).unwrap().unwrap();
        assert!(next > pos);
        assert_eq!(next.generation, pos.generation);
        assert_eq!(manager.current_position().unwrap(), next);

        manager.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_checkpoint_restarts_wal_with_next_index() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = open(&dir).await;

        write(&manager, "CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (1);");
        let before = manager.sync(&Context::background()).unwrap().unwrap();

        let outcome = manager
            .checkpoint(&Context::background(), CheckpointMode::Force)
            .unwrap();
        assert!(matches!(outcome, CheckpointOutcome::Truncated { .. }));
        assert_eq!(manager.wal_pages().unwrap(), 0);

        // No commit in the new WAL yet: index unchanged
        assert_eq!(manager.sync(&Context::background()).unwrap(), Some(before));

        write(&manager, "INSERT INTO t VALUES (2)");
        let after = manager.sync(&Context::background()).unwrap().unwrap();
        assert_eq!(after.generation, before.generation);
        assert_eq!(after.index, before.index + 1);
        assert!(after > before);

        manager.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_threshold_checkpoint_skips_small_wal() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = open(&dir).await;
        write(&manager, "CREATE TABLE t (v INTEGER)");
        let outcome = manager
            .checkpoint(&Context::background(), CheckpointMode::Threshold)
            .unwrap();
        assert_eq!(outcome, CheckpointOutcome::Skipped);
        manager.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_background_shipping_reaches_remote() {
        let dir = TempDir::new().unwrap();
        let (manager, client) = open(&dir).await;

        write(&manager, "CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (1);");
        let pos = manager.sync(&Context::background()).unwrap().unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if client.latest_marker().map(|m| m.position) == Some(pos) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "shipping never caught up");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let status = manager.status();
        assert_eq!(status.position, Some(pos));
        assert_eq!(status.replicas[0].confirmed, Some(pos));
        assert_eq!(client.generations().await.unwrap().len(), 1);

        manager.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_manager_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = open(&dir).await;

        let err = ReplicationManager::open(
            dir.path().join("app.db"),
            Vec::new(),
            options(),
            Arc::new(MetricsRegistry::new()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ReplicationError::Locked(_)));

        manager.close(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            manager.with_connection(|_| ()),
            Err(ReplicationError::Closed)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_is_bounded_by_grace() {
        let dir = TempDir::new().unwrap();
        let (manager, client) = open(&dir).await;
        write(&manager, "CREATE TABLE t (v INTEGER)");
        manager.sync(&Context::background()).unwrap();
        client.set_write_delay(Duration::from_secs(30));

        let started = std::time::Instant::now();
        manager.close(Duration::from_millis(200)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(manager.is_closed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_shares_one_deadline_across_replicas() {
        let dir = TempDir::new().unwrap();
        let clients = [Arc::new(MemoryReplicaClient::new()), Arc::new(MemoryReplicaClient::new())];
        let replicas = clients
            .iter()
            .enumerate()
            .map(|(i, c)| Replica::new(format!("slow-{}", i), c.clone() as Arc<dyn ReplicaClient>))
            .collect();
        let manager = ReplicationManager::open(
            dir.path().join("app.db"),
            replicas,
            options(),
            Arc::new(MetricsRegistry::new()),
        )
        .await
        .unwrap();

        for client in &clients {
            client.set_write_delay(Duration::from_secs(30));
        }
        write(&manager, "CREATE TABLE t (v INTEGER)");
        manager.sync(&Context::background()).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let grace = Duration::from_millis(500);
        let started = std::time::Instant::now();
        manager.close(grace).await.unwrap();
        assert!(started.elapsed() < grace * 2, "close took {:?}", started.elapsed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sync_reads_only_frames_past_tracked_offset() {
        let dir = TempDir::new().unwrap();
        // No replicas: nothing trims the shadow log
        let manager = ReplicationManager::open(
            dir.path().join("app.db"),
            Vec::new(),
            options(),
            Arc::new(MetricsRegistry::new()),
        )
        .await
        .unwrap();

        write(&manager, "CREATE TABLE t (v INTEGER)");
        manager.sync(&Context::background()).unwrap();
        write(&manager, "INSERT INTO t VALUES (1)");
        manager.sync(&Context::background()).unwrap();
        write(&manager, "INSERT INTO t VALUES (2)");
        let last = manager.sync(&Context::background()).unwrap().unwrap();

        let frame_size = manager.lock_tracker().unwrap().header.unwrap().frame_size() as u64;
        let batch = manager.shadow.batch_since(None).unwrap().unwrap();
        assert_eq!(batch.segments.len(), 3);
        assert_eq!(batch.segments[0].offset, 0);
        for pair in batch.segments.windows(2) {
            assert_eq!(pair[1].offset, pair[0].end().offset);
            // Frames only, no header
            assert_eq!(pair[1].data.len() as u64 % frame_size, 0);
        }
        assert_eq!(fs::metadata(wal_path(manager.path())).unwrap().len(), last.offset);

        manager.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shadow_log_capped_while_replica_is_down() {
        let dir = TempDir::new().unwrap();
        let failing = Arc::new(MemoryReplicaClient::new());
        failing.set_fail_writes(true);
        let metrics = Arc::new(MetricsRegistry::new());
        let manager = ReplicationManager::open(
            dir.path().join("app.db"),
            vec![Replica::new("down", failing.clone())],
            ManagerOptions {
                max_pending_items: 4,
                ..options()
            },
            metrics.clone(),
        )
        .await
        .unwrap();

        write(&manager, "CREATE TABLE t (v INTEGER)");
        for i in 0..20 {
            write(&manager, &format!("INSERT INTO t VALUES ({})", i));
            manager.sync(&Context::background()).unwrap();
            assert!(manager.status().pending_items <= 4);
        }
        assert!(metrics.snapshot().generations_created > 1);

        failing.set_fail_writes(false);
        manager.close(Duration::from_secs(1)).await.unwrap();
    }

    #[test]
    fn test_database_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("nested").join("app.db");
        let lock = DatabaseLock::acquire(&db).unwrap();
        assert_eq!(lock.path(), lock_path(&db));
        assert!(matches!(
            DatabaseLock::acquire(&db),
            Err(ReplicationError::Locked(_))
        ));
        lock.release();
        DatabaseLock::acquire(&db).unwrap();
    }

    #[test]
    fn test_sibling_paths() {
        let db = Path::new("/data/app.db");
        assert_eq!(wal_path(db), PathBuf::from("/data/app.db-wal"));
        assert_eq!(lock_path(db), PathBuf::from("/data/app.db-walgate.lock"));
    }
}
