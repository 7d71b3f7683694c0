//! Page-view counter
//!
//! The built-in workload: every visit inserts one row and reads the total
//! back in the same transaction.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;

use super::coordinator::{DurableWriteCoordinator, Statement, WriteReceipt, WriteRequest};
use super::errors::WriteResult;
use crate::replication::Context;

pub const PAGE_VIEWS_SCHEMA: &str =
    "CREATE TABLE IF NOT EXISTS page_views (id INTEGER PRIMARY KEY, timestamp TEXT)";

const INSERT_VIEW: &str = "INSERT INTO page_views (timestamp) VALUES (?1)";
const COUNT_VIEWS: &str = "SELECT COUNT(1) FROM page_views";

/// The write recording one visit at `now`
pub fn page_view(now: DateTime<Utc>) -> WriteRequest {
    WriteRequest {
        statements: vec![Statement::with_params(
            INSERT_VIEW,
            vec![json!(now.to_rfc3339_opts(SecondsFormat::Secs, true))],
        )],
        reads: vec![Statement::new(COUNT_VIEWS)],
    }
}

/// Visit total read back by a page-view write
pub fn visit_count(receipt: &WriteReceipt) -> Option<i64> {
    receipt.reads.first()?.rows.first()?.first()?.as_i64()
}

pub fn visit_message(count: i64) -> String {
    format!("This server has been visited {} times.", count)
}

/// A durable visit
#[derive(Debug, Clone, PartialEq)]
pub struct Visit {
    pub count: i64,
    pub receipt: WriteReceipt,
}

impl Visit {
    pub fn message(&self) -> String {
        visit_message(self.count)
    }
}

/// Record one visit and wait until it is durable.
pub async fn record_visit(coordinator: &DurableWriteCoordinator, ctx: &Context) -> WriteResult<Visit> {
    let receipt = coordinator.execute(ctx, page_view(Utc::now())).await?;
    let count = visit_count(&receipt).unwrap_or_default();
    Ok(Visit { count, receipt })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::QueryResult;
    use crate::replication::{Generation, Position};
    use chrono::TimeZone;

    #[test]
    fn test_page_view_request() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let request = page_view(now);
        assert_eq!(request.statements.len(), 1);
        assert_eq!(request.statements[0].params, vec![json!("2024-05-01T12:00:00Z")]);
        assert_eq!(request.reads[0].sql, COUNT_VIEWS);
    }

    #[test]
    fn test_visit_count_from_receipt() {
        let position = Position::new(Generation::new(), 1, 4152);
        let mut receipt = WriteReceipt {
            reads: vec![QueryResult {
                columns: vec!["COUNT(1)".into()],
                rows: vec![vec![json!(3)]],
            }],
            pre_position: None,
            post_position: position,
            confirmed: position,
            ship_ms: 0,
        };
        assert_eq!(visit_count(&receipt), Some(3));
        assert_eq!(visit_message(3), "This server has been visited 3 times.");

        receipt.reads.clear();
        assert_eq!(visit_count(&receipt), None);
    }
}
