//! Replica binding
//!
//! Associates one [`ReplicaClient`] with the manager's shadow log. Holds the
//! shipping cursor (last position the remote confirmed) behind one async
//! mutex shared by the background shipper and the on-demand durability gate,
//! so uploads of one replica never race.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use super::config::RetryPolicy;
use super::context::Context;
use super::errors::{ReplicationError, ReplicationResult};
use super::position::{Generation, Position};
use super::shadow::{ShadowLog, ShipBatch};
use crate::client::ReplicaClient;
use crate::observability::{Event, Logger, MetricsRegistry, Severity};

/// The generation restore should rebuild, and how far
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreTarget {
    pub generation: Generation,
    pub position: Position,
    pub updated_at: DateTime<Utc>,
}

/// Point-in-time view of a replica, served on `/status`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplicaStatus {
    pub name: String,
    pub kind: String,
    pub confirmed: Option<Position>,
    pub last_shipped_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

struct Attachment {
    shadow: Arc<ShadowLog>,
    metrics: Arc<MetricsRegistry>,
    retry: RetryPolicy,
}

/// One remote target of the replication manager
pub struct Replica {
    name: String,
    client: Arc<dyn ReplicaClient>,
    attachment: OnceLock<Attachment>,
    cursor: tokio::sync::Mutex<Option<Position>>,
    status: Mutex<ReplicaStatus>,
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("name", &self.name)
            .field("kind", &self.client.kind())
            .finish()
    }
}

impl Replica {
    pub fn new(name: impl Into<String>, client: Arc<dyn ReplicaClient>) -> Arc<Self> {
        let name = name.into();
        let status = ReplicaStatus {
            name: name.clone(),
            kind: client.kind().to_string(),
            ..ReplicaStatus::default()
        };
        Arc::new(Self {
            name,
            client,
            attachment: OnceLock::new(),
            cursor: tokio::sync::Mutex::new(None),
            status: Mutex::new(status),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Arc<dyn ReplicaClient> {
        &self.client
    }

    /// Bind to a manager's shadow log. A replica attaches at most once.
    pub(crate) fn attach(
        &self,
        shadow: Arc<ShadowLog>,
        metrics: Arc<MetricsRegistry>,
        retry: RetryPolicy,
    ) -> ReplicationResult<()> {
        shadow.register(&self.name)?;
        self.attachment
            .set(Attachment {
                shadow,
                metrics,
                retry,
            })
            .map_err(|_| {
                ReplicationError::Io(std::io::Error::other(format!(
                    "replica {} is already attached",
                    self.name
                )))
            })
    }

    fn attached(&self) -> ReplicationResult<&Attachment> {
        self.attachment
            .get()
            .ok_or_else(|| ReplicationError::NotAttached(self.name.clone()))
    }

    pub fn status(&self) -> ReplicaStatus {
        self.status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    /// Last position the remote confirmed, if any
    pub fn confirmed(&self) -> Option<Position> {
        self.status().confirmed
    }

    /// Most recent restorable generation on the remote.
    ///
    /// Generations without a snapshot or a readable marker are skipped.
    pub async fn calc_restore_target(&self) -> ReplicationResult<Option<RestoreTarget>> {
        let generations = self
            .client
            .generations()
            .await
            .map_err(|e| ReplicationError::client(&self.name, e))?;

        Ok(generations
            .into_iter()
            .filter(|g| g.is_restorable())
            .find_map(|g| {
                g.marker.map(|marker| RestoreTarget {
                    generation: g.generation,
                    position: marker.position,
                    updated_at: marker.updated_at,
                })
            }))
    }

    /// Upload everything queued and write the position marker.
    ///
    /// Returns the confirmed position. Segments are uploaded in order and the
    /// marker only after them, so a remote marker never points past data the
    /// remote holds.
    pub async fn ship_pending(&self, ctx: &Context) -> ReplicationResult<Position> {
        let attachment = self.attached()?;
        let mut cursor = ctx
            .race(self.cursor.lock())
            .await
            .ok_or(ReplicationError::Cancelled)?;

        let batch = attachment
            .shadow
            .batch_since(*cursor)?
            .ok_or(ReplicationError::NoPosition)?;

        if batch.is_empty() && *cursor == Some(batch.position) {
            return Ok(batch.position);
        }

        match self.upload(ctx, attachment, &batch).await {
            Ok(()) => {
                *cursor = Some(batch.position);
                attachment.shadow.ack(&self.name, batch.position)?;
                self.record_success(batch.position);
                Ok(batch.position)
            }
            Err(e) => {
                if !matches!(e, ReplicationError::Cancelled) {
                    attachment.metrics.increment_ship_failures();
                    self.record_failure(&e);
                }
                Err(e)
            }
        }
    }

    async fn upload(
        &self,
        ctx: &Context,
        attachment: &Attachment,
        batch: &ShipBatch,
    ) -> ReplicationResult<()> {
        if let Some(snapshot) = &batch.snapshot {
            ctx.check()?;
            ctx.race(self.client.write_snapshot(snapshot))
                .await
                .ok_or(ReplicationError::Cancelled)?
                .map_err(|e| ReplicationError::client(&self.name, e))?;
            attachment
                .metrics
                .increment_snapshots_shipped(snapshot.data.len() as u64);
        }

        for segment in &batch.segments {
            ctx.check()?;
            ctx.race(self.client.write_segment(segment))
                .await
                .ok_or(ReplicationError::Cancelled)?
                .map_err(|e| ReplicationError::client(&self.name, e))?;
            attachment
                .metrics
                .increment_segments_shipped(segment.data.len() as u64);
        }

        ctx.check()?;
        ctx.race(self.client.write_position(&batch.position))
            .await
            .ok_or(ReplicationError::Cancelled)?
            .map_err(|e| ReplicationError::client(&self.name, e))
    }

    /// Ship until the remote holds at least `target`.
    ///
    /// A confirmation in a newer generation satisfies a target in an older
    /// one: the newer snapshot contains everything committed before it.
    pub async fn confirm(&self, ctx: &Context, target: Position) -> ReplicationResult<Position> {
        let confirmed = self.ship_pending(ctx).await?;
        if confirmed >= target {
            Ok(confirmed)
        } else {
            Err(ReplicationError::Unconfirmed {
                replica: self.name.clone(),
                confirmed: Some(confirmed),
                target,
            })
        }
    }

    fn record_success(&self, position: Position) {
        if let Ok(mut status) = self.status.lock() {
            status.confirmed = Some(position);
            status.last_shipped_at = Some(Utc::now());
            status.last_error = None;
            status.consecutive_failures = 0;
        }
    }

    fn record_failure(&self, err: &ReplicationError) {
        if let Ok(mut status) = self.status.lock() {
            status.last_error = Some(err.to_string());
            status.consecutive_failures = status.consecutive_failures.saturating_add(1);
        }
    }

    /// Background shipping loop. Runs until `shutdown` flips to true.
    pub(crate) async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        poll_interval: Duration,
    ) {
        let Ok(attachment) = self.attached() else {
            return;
        };
        let retry = attachment.retry;
        let mut updates = attachment.shadow.subscribe();
        let ctx = Context::background().with_signal(shutdown.clone());
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            updates.borrow_and_update();

            let wait = match self.ship_pending(&ctx).await {
                Ok(_) | Err(ReplicationError::NoPosition) => {
                    attempt = 0;
                    None
                }
                Err(ReplicationError::Cancelled) => break,
                Err(e) => {
                    let backoff = retry.jittered(attempt);
                    attempt = attempt.saturating_add(1);
                    let severity = if e.is_transient() {
                        Severity::Warn
                    } else {
                        Severity::Error
                    };
                    Logger::event(
                        severity,
                        Event::ShipRetry,
                        &[
                            ("replica", &self.name),
                            ("error", &e.to_string()),
                            ("attempt", &attempt.to_string()),
                            ("backoff_ms", &backoff.as_millis().to_string()),
                        ],
                    );
                    Some(backoff)
                }
            };

            match wait {
                Some(backoff) => {
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = updates.changed() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }
}
