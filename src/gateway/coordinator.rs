//! Durable write coordinator
//!
//! One write, end to end:
//!
//! 1. BEGIN IMMEDIATE
//! 2. Execute the request's statements
//! 3. `sync()` → pre-commit position (observability only)
//! 4. Run the read-your-write queries inside the same transaction
//! 5. COMMIT
//! 6. `sync()` → post-commit position (the gate)
//! 7. Ship and confirm up to the post-commit position
//!
//! Steps 1–6 hold the connection on a blocking thread. The connection is
//! released before step 7 so a slow remote never blocks other writers.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::future::{select_ok, try_join_all};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};

use super::errors::{WriteCause, WriteError, WriteResult, WriteStep};
use crate::observability::{Event, Logger, MetricsRegistry, Severity, Timer};
use crate::replication::{
    Context, DurabilityPolicy, Position, ReplicationError, ReplicationManager,
};

/// One SQL statement with positional parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<serde_json::Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Statements to commit and queries to read back before commit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub statements: Vec<Statement>,
    #[serde(default)]
    pub reads: Vec<Statement>,
}

/// Rows returned by one read query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// Acknowledgment of a durable write
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteReceipt {
    pub reads: Vec<QueryResult>,
    /// Position before commit; `None` while the database was still empty
    pub pre_position: Option<Position>,
    pub post_position: Position,
    /// Position the durability gate confirmed, at least `post_position`
    pub confirmed: Position,
    /// Time spent shipping and confirming
    pub ship_ms: u64,
}

struct LocalCommit {
    reads: Vec<QueryResult>,
    pre: Option<Position>,
    post: Position,
}

/// Runs writes against the manager's connection and holds the response
/// until remote storage confirms them.
pub struct DurableWriteCoordinator {
    manager: Arc<ReplicationManager>,
    policy: DurabilityPolicy,
    metrics: Arc<MetricsRegistry>,
}

impl DurableWriteCoordinator {
    pub fn new(manager: Arc<ReplicationManager>, policy: DurabilityPolicy) -> Self {
        let metrics = manager.metrics().clone();
        Self {
            manager,
            policy,
            metrics,
        }
    }

    pub fn manager(&self) -> &Arc<ReplicationManager> {
        &self.manager
    }

    pub fn policy(&self) -> DurabilityPolicy {
        self.policy
    }

    /// Execute `request` and return once it is durable on the remote.
    pub async fn execute(&self, ctx: &Context, request: WriteRequest) -> WriteResult<WriteReceipt> {
        let result = self.execute_inner(ctx, request).await;

        match &result {
            Ok(receipt) => {
                self.metrics.increment_writes_acknowledged();
                Logger::event(
                    Severity::Info,
                    Event::WriteDurable,
                    &[
                        ("pre", &display_position(receipt.pre_position)),
                        ("post", &receipt.post_position.to_string()),
                        ("confirmed", &receipt.confirmed.to_string()),
                        ("ship_ms", &receipt.ship_ms.to_string()),
                    ],
                );
            }
            Err(e) if e.is_committed() => {
                self.metrics.increment_writes_not_durable();
                Logger::event(
                    Severity::Error,
                    Event::WriteNotDurable,
                    &[
                        ("step", e.step().as_str()),
                        ("post", &display_position(e.position())),
                        ("error", &e.to_string()),
                    ],
                );
            }
            Err(e) => {
                self.metrics.increment_writes_not_committed();
                Logger::event(
                    Severity::Warn,
                    Event::WriteNotCommitted,
                    &[("step", e.step().as_str()), ("error", &e.to_string())],
                );
            }
        }

        result
    }

    async fn execute_inner(&self, ctx: &Context, request: WriteRequest) -> WriteResult<WriteReceipt> {
        if request.statements.is_empty() {
            return Err(WriteError::invalid("request has no statements"));
        }
        let params = request
            .statements
            .iter()
            .chain(request.reads.iter())
            .map(|s| convert_params(&s.params))
            .collect::<WriteResult<Vec<_>>>()?;
        if ctx.is_cancelled() {
            return Err(WriteError::not_committed(WriteStep::Begin, WriteCause::Cancelled));
        }

        let local = {
            let manager = self.manager.clone();
            let ctx = ctx.clone();
            tokio::task::spawn_blocking(move || {
                manager
                    .with_connection(|conn| commit_locally(&ctx, &manager, conn, &request, &params))
                    .map_err(|e| WriteError::not_committed(WriteStep::Begin, e))?
            })
            .await
            .map_err(|e| {
                WriteError::not_committed(
                    WriteStep::Begin,
                    WriteCause::Internal(format!("write task failed: {}", e)),
                )
            })??
        };

        let timer = Timer::new();
        let confirmed = self
            .confirm(ctx, local.post)
            .await
            .map_err(|cause| WriteError::not_durable(WriteStep::Confirm, Some(local.post), cause))?;

        Ok(WriteReceipt {
            reads: local.reads,
            pre_position: local.pre,
            post_position: local.post,
            confirmed,
            ship_ms: timer.elapsed().as_millis() as u64,
        })
    }

    /// Ship until the gate replicas hold `target`. No retry.
    async fn confirm(&self, ctx: &Context, target: Position) -> Result<Position, WriteCause> {
        let replicas = self.manager.replicas();
        if replicas.is_empty() {
            return Err(WriteCause::Internal(
                "no replica is bound to the durability gate".to_string(),
            ));
        }

        let confirmed = match self.policy {
            DurabilityPolicy::All => ctx
                .race(try_join_all(replicas.iter().map(|r| r.confirm(ctx, target))))
                .await
                .ok_or(WriteCause::Cancelled)??
                .into_iter()
                .min()
                .unwrap_or(target),
            DurabilityPolicy::Any => {
                let attempts = replicas.iter().map(|r| Box::pin(r.confirm(ctx, target)));
                ctx.race(select_ok(attempts))
                    .await
                    .ok_or(WriteCause::Cancelled)??
                    .0
            }
        };
        Ok(confirmed)
    }
}

/// Steps 1–6. Any error before commit drops the transaction, rolling back.
fn commit_locally(
    ctx: &Context,
    manager: &ReplicationManager,
    conn: &mut Connection,
    request: &WriteRequest,
    params: &[Vec<Value>],
) -> WriteResult<LocalCommit> {
    let (write_params, read_params) = params.split_at(request.statements.len());

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| WriteError::not_committed(WriteStep::Begin, e))?;

    for (statement, values) in request.statements.iter().zip(write_params) {
        check(ctx, WriteStep::Execute)?;
        tx.execute(&statement.sql, params_from_iter(values.iter()))
            .map_err(|e| WriteError::not_committed(WriteStep::Execute, e))?;
    }

    check(ctx, WriteStep::SyncPreCommit)?;
    let pre = match manager.sync(ctx) {
        Ok(position) => position,
        Err(ReplicationError::NoPosition) => None,
        Err(e) => return Err(WriteError::not_committed(WriteStep::SyncPreCommit, e)),
    };

    let mut reads = Vec::with_capacity(request.reads.len());
    for (query, values) in request.reads.iter().zip(read_params) {
        check(ctx, WriteStep::Read)?;
        reads.push(
            read(&tx, &query.sql, values).map_err(|e| WriteError::not_committed(WriteStep::Read, e))?,
        );
    }

    check(ctx, WriteStep::Commit)?;
    tx.commit()
        .map_err(|e| WriteError::not_committed(WriteStep::Commit, e))?;

    // Committed from here on. The caller's cancellation is observed by the
    // gate, so the post-commit position is always captured.
    let post = manager
        .sync(&Context::background())
        .map_err(|e| WriteError::not_durable(WriteStep::SyncPostCommit, None, e))?
        .ok_or_else(|| {
            WriteError::not_durable(WriteStep::SyncPostCommit, None, ReplicationError::NoPosition)
        })?;

    Ok(LocalCommit { reads, pre, post })
}

fn check(ctx: &Context, step: WriteStep) -> WriteResult<()> {
    if ctx.is_cancelled() {
        Err(WriteError::not_committed(step, WriteCause::Cancelled))
    } else {
        Ok(())
    }
}

fn read(tx: &Transaction<'_>, sql: &str, params: &[Value]) -> rusqlite::Result<QueryResult> {
    let mut stmt = tx.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = Vec::new();
    let mut cursor = stmt.query(params_from_iter(params.iter()))?;
    while let Some(row) = cursor.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(to_json(row.get_ref(i)?));
        }
        rows.push(values);
    }
    Ok(QueryResult { columns, rows })
}

fn convert_params(params: &[serde_json::Value]) -> WriteResult<Vec<Value>> {
    params
        .iter()
        .map(|p| match p {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Integer(i64::from(*b))),
            serde_json::Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => Ok(Value::Integer(i)),
                (None, Some(f)) => Ok(Value::Real(f)),
                (None, None) => Err(WriteError::invalid(format!("number {} out of range", n))),
            },
            serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
            other => Err(WriteError::invalid(format!(
                "unsupported parameter {}: only scalars bind",
                other
            ))),
        })
        .collect()
}

fn to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(STANDARD.encode(b)),
    }
}

fn display_position(position: Option<Position>) -> String {
    position
        .map(|p| p.to_string())
        .unwrap_or_else(|| "none".to_string())
}
