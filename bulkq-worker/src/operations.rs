//! Operation summary records
//!
//! Each bulk operation owns one summary row. The aggregate time accumulates
//! elapsed milliseconds reported by the pipeline's discrete message-handling
//! invocations and never decreases.

use bulkq_common::Result;
use sqlx::SqlitePool;

/// SQLite-backed store for per-operation summaries
#[derive(Clone)]
pub struct OperationSummaryStore {
    pool: SqlitePool,
}

impl OperationSummaryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Add elapsed milliseconds to the operation's running total.
    /// Creates the summary row on first report.
    pub async fn increment_aggregate_time(&self, operation_id: i64, delta: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO operations (id, aggregate_time) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE
             SET aggregate_time = aggregate_time + excluded.aggregate_time",
        )
        .bind(operation_id)
        .bind(delta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Current aggregate time for an operation (0 if never reported)
    pub async fn aggregate_time(&self, operation_id: i64) -> Result<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT aggregate_time FROM operations WHERE id = ?")
                .bind(operation_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.0).unwrap_or(0))
    }
}
