//! Job tree
//!
//! One root job per bulk operation; delayed child jobs are created in named
//! batches under that root. Jobs are rows in the `jobs` table; the runner
//! scopes child creation to a root job so descendants stay in one tree.

use async_trait::async_trait;
use bulkq_common::{Error, Result};
use sqlx::SqlitePool;

/// Job status values stored in the `status` column
pub mod status {
    pub const NEW: &str = "new";
    pub const DELAYED: &str = "delayed";
    pub const SUCCESS: &str = "success";
    pub const FAILED: &str = "failed";
}

/// One node of a job tree (referenced by the pipeline, owned by the store)
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub root_job_id: Option<i64>,
    pub success: Option<bool>,
}

impl Job {
    pub fn is_root(&self) -> bool {
        self.root_job_id.is_none()
    }
}

/// SQLite-backed job repository
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the root job for an operation
    pub async fn create_root_job(&self, name: &str) -> Result<Job> {
        self.insert(name, status::NEW, None).await
    }

    /// Look up a job by id
    pub async fn find_job(&self, id: i64) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            "SELECT id, name, status, root_job_id, success FROM jobs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Count the child jobs of a root job
    pub async fn count_children(&self, root_job_id: i64) -> Result<u32> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE root_job_id = ?")
                .bind(root_job_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0 as u32)
    }

    /// Record a job's completion result
    pub async fn record_result(&self, job_id: i64, success: bool) -> Result<()> {
        let status = if success { status::SUCCESS } else { status::FAILED };
        sqlx::query("UPDATE jobs SET success = ?, status = ? WHERE id = ?")
            .bind(success)
            .bind(status)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert(&self, name: &str, status: &str, root_job_id: Option<i64>) -> Result<Job> {
        let created_at = chrono::Utc::now().timestamp();
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO jobs (name, status, root_job_id, created_at)
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(status)
        .bind(root_job_id)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(Job {
            id: row.0,
            name: name.to_string(),
            status: status.to_string(),
            root_job_id,
            success: None,
        })
    }
}

/// Callback invoked with the freshly created delayed job. Returning `false`
/// marks the job failed immediately.
pub type DelayedJobCallback = Box<dyn FnOnce(&Job) -> Result<bool> + Send>;

/// Creates delayed jobs within one job tree
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Create a delayed child job under this runner's root scope and invoke
    /// the callback with it
    async fn create_delayed(&self, name: &str, callback: DelayedJobCallback) -> Result<Job>;

    /// A runner scoped to the given root job's descendants
    fn for_child_job(&self, root_job: &Job) -> Box<dyn JobRunner>;
}

/// Job runner over the SQLite job store
pub struct SqliteJobRunner {
    store: JobStore,
    root_job: Option<Job>,
}

impl SqliteJobRunner {
    /// Unscoped runner; use [`JobRunner::for_child_job`] to scope it
    pub fn new(store: JobStore) -> Self {
        Self { store, root_job: None }
    }
}

#[async_trait]
impl JobRunner for SqliteJobRunner {
    async fn create_delayed(&self, name: &str, callback: DelayedJobCallback) -> Result<Job> {
        let root = self.root_job.as_ref().ok_or_else(|| {
            Error::Internal("Delayed jobs require a root job scope".to_string())
        })?;

        let job = self.store.insert(name, status::DELAYED, Some(root.id)).await?;
        if !callback(&job)? {
            self.store.record_result(job.id, false).await?;
        }
        Ok(job)
    }

    fn for_child_job(&self, root_job: &Job) -> Box<dyn JobRunner> {
        Box::new(SqliteJobRunner {
            store: self.store.clone(),
            root_job: Some(root_job.clone()),
        })
    }
}
