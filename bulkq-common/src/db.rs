//! Database initialization
//!
//! Creates the SQLite database on first run and applies the schema for the
//! message queue, the job tree, and the operation summaries. All schema
//! statements are idempotent so startup can run them unconditionally.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL allows concurrent readers while one consumer writes
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// In-memory database with the schema applied, capped at one connection so
/// every query sees the same memory database. Intended for tests.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    create_schema(&pool).await?;
    Ok(pool)
}

/// Create the bulkq schema (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_messages_table(pool).await?;
    create_jobs_table(pool).await?;
    create_operations_table(pool).await?;
    Ok(())
}

/// Queue messages. A message belongs to one transport queue; a consumer
/// claims it by writing its consumer_id, deletes it on ack/reject, or
/// releases it (consumer_id NULL, redelivered = 1) on requeue.
async fn create_messages_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            topic TEXT NOT NULL,
            processor TEXT,
            body TEXT NOT NULL,
            consumer_id TEXT,
            redelivered INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_queue_consumer
         ON messages(queue, consumer_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_consumer
         ON messages(consumer_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Job tree: one root job per operation, delayed child jobs created in
/// batches. `success` is NULL until the job's completion callback runs.
async fn create_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            root_job_id INTEGER,
            success INTEGER,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (root_job_id) REFERENCES jobs(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_root ON jobs(root_job_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Per-operation summary record. `aggregate_time` accumulates elapsed
/// milliseconds across all processing stages and never decreases.
async fn create_operations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS operations (
            id INTEGER PRIMARY KEY,
            entity_class TEXT,
            aggregate_time INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let pool = init_memory_database().await.unwrap();
        create_schema(&pool).await.unwrap();

        // All three tables exist and are queryable
        for table in ["messages", "jobs", "operations"] {
            let count: (i64,) =
                sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
                    .fetch_one(&pool)
                    .await
                    .unwrap();
            assert_eq!(count.0, 0);
        }
    }

    #[tokio::test]
    async fn test_init_database_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("bulkq.db");
        let pool = init_database(&db_path).await.unwrap();
        assert!(db_path.exists());
        drop(pool);
    }
}
