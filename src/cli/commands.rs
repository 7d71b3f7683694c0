//! CLI command implementations
//!
//! `serve` boots in strict order: configuration, restore, replication,
//! HTTP. Shutdown reverses it: stop accepting, cancel in-flight writes,
//! final ship, release the database.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;

use crate::client::FileReplicaClient;
use crate::gateway::{Gateway, GatewayConfig, FILE_REPLICA_NAME};
use crate::http_server::HttpServer;
use crate::observability::{log_event_with_fields, Event, Logger, Severity};
use crate::replication::{Context, DatabaseLock, Replica};
use crate::restore::{RestoreCoordinator, RestoreOutcome};

use super::args::Command;
use super::errors::{CliError, CliResult};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::boot_failed(format!("Failed to create tokio runtime: {}", e)))?;

    match cmd {
        Command::Serve {
            dsn,
            replica_dir,
            config,
            addr,
        } => {
            let config = build_config(&dsn, &replica_dir, config.as_deref(), addr.as_deref())?;
            rt.block_on(serve(config))
        }
        Command::Restore {
            dsn,
            replica_dir,
            output,
        } => {
            let config = build_config(&dsn, &replica_dir, None, None)?;
            let target = output.unwrap_or(dsn);
            rt.block_on(restore(&config, &target)).map(|_| ())
        }
    }
}

/// Merge the optional config file with the command-line flags, flags winning.
pub fn build_config(
    dsn: &Path,
    replica_dir: &Path,
    config_path: Option<&Path>,
    addr: Option<&str>,
) -> CliResult<GatewayConfig> {
    let mut config = match config_path {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };

    config.dsn = dsn.to_string_lossy().into_owned();
    config.replica_dir = replica_dir.to_string_lossy().into_owned();
    if let Some(addr) = addr {
        config.http = config.http.with_addr(addr).map_err(CliError::config_error)?;
    }
    config.validate()?;

    log_event_with_fields(
        Event::ConfigLoaded,
        &[
            ("dsn", &config.dsn),
            ("replica_dir", &config.replica_dir),
            ("addr", &config.http.socket_addr()),
        ],
    );
    Ok(config)
}

/// Restore, open, and serve until SIGINT/SIGTERM.
pub async fn serve(config: GatewayConfig) -> CliResult<()> {
    let gateway = Arc::new(Gateway::restore_and_open(config).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server = tokio::spawn(HttpServer::new(gateway.clone(), shutdown_rx).start());

    let early_exit = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut server => Some(result),
    };

    log_event_with_fields(Event::ShutdownStart, &[("dsn", &gateway.config().dsn)]);
    let _ = shutdown_tx.send(true);

    let served = match early_exit {
        Some(result) => result,
        None => server.await,
    };
    let served = served
        .map_err(|e| CliError::io_error(format!("HTTP server task failed: {}", e)))
        .and_then(|r| r.map_err(|e| CliError::io_error(format!("HTTP server failed: {}", e))));

    let closed = gateway
        .close()
        .await
        .map_err(|e| CliError::shutdown_failed(e.to_string()));

    match (&served, &closed) {
        (Ok(()), Ok(())) => log_event_with_fields(Event::ShutdownComplete, &[]),
        _ => Logger::event(
            Severity::Error,
            Event::ShutdownComplete,
            &[("clean", "false")],
        ),
    }
    served.and(closed)
}

/// One-shot restore into `target`. Never overwrites an existing file.
///
/// Holds the database lock of `target` throughout, so it fails while a
/// gateway owns that path.
pub async fn restore(config: &GatewayConfig, target: &Path) -> CliResult<RestoreOutcome> {
    let lock = DatabaseLock::acquire(target)?;
    let client = FileReplicaClient::with_prefix(config.replica_path(), &config.replica_prefix);
    let replica = Replica::new(FILE_REPLICA_NAME, Arc::new(client));
    let outcome = RestoreCoordinator::new(replica)
        .restore(&Context::background(), target)
        .await;
    lock.release();
    Ok(outcome?)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => Logger::warn("SHUTDOWN_SIGNAL", &[("signal", "SIGINT")]),
        _ = terminate => Logger::warn("SHUTDOWN_SIGNAL", &[("signal", "SIGTERM")]),
    }
}
