//! Gateway
//!
//! Process-wide context: restore, then open replication, then accept writes.
//! Nothing is global; the HTTP layer and the CLI hold a [`Gateway`].
//!
//! Startup order:
//!
//! 1. Take the database lock
//! 2. Restore the database from the replica unless a local file exists
//! 3. Open the replication manager (keeps the lock, starts shipping)
//! 4. Create the page-view schema
//!
//! Any failure aborts startup.

mod config;
mod coordinator;
mod errors;
mod page_view;

pub use config::{ConfigError, GatewayConfig, RetryConfig};
pub use coordinator::{DurableWriteCoordinator, QueryResult, Statement, WriteReceipt, WriteRequest};
pub use errors::{ErrorResponse, WriteCause, WriteError, WriteResult, WriteStep};
pub use page_view::{
    page_view, record_visit, visit_count, visit_message, Visit, PAGE_VIEWS_SCHEMA,
};

use std::sync::Arc;

use thiserror::Error;

use crate::client::FileReplicaClient;
use crate::observability::{log_event_with_fields, Event, Logger, MetricsRegistry};
use crate::replication::{Context, DatabaseLock, Replica, ReplicationError, ReplicationManager};
use crate::restore::{RestoreCoordinator, RestoreError, RestoreOutcome};

/// Name of the replica built from `replica_dir`
pub const FILE_REPLICA_NAME: &str = "file";

/// Startup failure. Always fatal.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Restore(#[from] RestoreError),

    #[error("replication: {0}")]
    Replication(#[from] ReplicationError),

    #[error("create schema: {0}")]
    Schema(#[from] rusqlite::Error),

    #[error("at least one replica is required")]
    NoReplica,
}

/// A running gateway
pub struct Gateway {
    config: GatewayConfig,
    manager: Arc<ReplicationManager>,
    coordinator: Arc<DurableWriteCoordinator>,
    restore_outcome: RestoreOutcome,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("dsn", &self.config.dsn)
            .field("restore_outcome", &self.restore_outcome)
            .finish()
    }
}

impl Gateway {
    /// Restore and open with the file replica named by `config`.
    pub async fn restore_and_open(config: GatewayConfig) -> Result<Self, StartupError> {
        config.validate()?;
        let client = FileReplicaClient::with_prefix(config.replica_path(), &config.replica_prefix);
        let replica = Replica::new(FILE_REPLICA_NAME, Arc::new(client));
        Self::open_with(config, vec![replica]).await
    }

    /// Restore through the first replica, then open with all of them.
    pub async fn open_with(
        config: GatewayConfig,
        replicas: Vec<Arc<Replica>>,
    ) -> Result<Self, StartupError> {
        let first = replicas.first().cloned().ok_or(StartupError::NoReplica)?;
        log_event_with_fields(
            Event::BootStart,
            &[("dsn", &config.dsn), ("replicas", &replicas.len().to_string())],
        );

        let lock = DatabaseLock::acquire(config.dsn_path())?;
        let metrics = Arc::new(MetricsRegistry::new());
        let restore = RestoreCoordinator::new(first).with_metrics(metrics.clone());
        let restore_outcome = match restore.restore(&Context::background(), config.dsn_path()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log_event_with_fields(
                    Event::RestoreFailed,
                    &[("dsn", &config.dsn), ("error", &e.to_string())],
                );
                return Err(e.into());
            }
        };

        let manager = ReplicationManager::open_locked(
            config.dsn_path(),
            lock,
            replicas,
            config.manager_options(),
            metrics,
        )
        .await?;

        if let Err(e) = create_schema(&manager).await {
            if let Err(close_err) = manager.close(config.shutdown_grace()).await {
                Logger::error(
                    "WALGATE_STARTUP_CLEANUP_FAILED",
                    &[("error", &close_err.to_string())],
                );
            }
            return Err(e);
        }

        let coordinator = Arc::new(DurableWriteCoordinator::new(
            manager.clone(),
            config.durability,
        ));

        log_event_with_fields(
            Event::BootComplete,
            &[
                ("dsn", &config.dsn),
                ("durability", config.durability.as_str()),
                ("restore", restore.state().as_str()),
            ],
        );

        Ok(Self {
            config,
            manager,
            coordinator,
            restore_outcome,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<DurableWriteCoordinator> {
        &self.coordinator
    }

    pub fn manager(&self) -> &Arc<ReplicationManager> {
        &self.manager
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        self.manager.metrics()
    }

    pub fn restore_outcome(&self) -> &RestoreOutcome {
        &self.restore_outcome
    }

    /// Final ship bounded by `shutdown_grace`, then release the database.
    pub async fn close(&self) -> Result<(), ReplicationError> {
        self.manager.close(self.config.shutdown_grace()).await
    }
}

async fn create_schema(manager: &Arc<ReplicationManager>) -> Result<(), StartupError> {
    let manager = manager.clone();
    tokio::task::spawn_blocking(move || {
        manager
            .with_connection(|conn| conn.execute_batch(PAGE_VIEWS_SCHEMA))?
            .map_err(StartupError::from)
    })
    .await
    .map_err(|e| {
        StartupError::Replication(ReplicationError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("schema task failed: {}", e),
        )))
    })?
}
