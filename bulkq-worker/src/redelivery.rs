//! Orphan-message redelivery
//!
//! A consumer that dies mid-delivery leaves its claimed messages stuck.
//! Every live consumer writes a pid file once per process lifetime; on each
//! before-receive tick it cross-references all pid files against the live
//! process list. Records whose pid is gone are orphans: one bulk statement
//! releases every message claimed by any orphan (clears `consumer_id`, sets
//! `redelivered`), then the stale pid files are removed.
//!
//! Pid-file bookkeeping is not transactional with the SQL update. A crash
//! between the two leaves a stale pid file; the next sweep finds no live
//! pid for it and repeats the cleanup, which is idempotent.

use crate::consumption::{ConsumptionContext, ConsumptionExtension};
use async_trait::async_trait;
use bulkq_common::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// One pid-file record: the process and the consumer it belonged to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFileInfo {
    pub pid: u32,
    pub consumer_id: String,
}

/// Pid files live in one directory, named `<pid>.pid`, containing the
/// consumer id
pub struct PidFileStore {
    dir: PathBuf,
}

impl PidFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, pid: u32) -> PathBuf {
        self.dir.join(format!("{}.pid", pid))
    }

    pub async fn create_pid_file(&self, pid: u32, consumer_id: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.path_for(pid), consumer_id).await?;
        Ok(())
    }

    /// All parseable pid-file records. Files that are not `<pid>.pid` are
    /// skipped.
    pub async fn list_pid_files(&self) -> Result<Vec<PidFileInfo>> {
        let mut infos = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(infos),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(pid) = parse_pid_file_name(&path) else {
                continue;
            };
            let consumer_id = tokio::fs::read_to_string(&path).await?;
            infos.push(PidFileInfo {
                pid,
                consumer_id: consumer_id.trim().to_string(),
            });
        }
        infos.sort_by_key(|info| info.pid);
        Ok(infos)
    }

    pub async fn remove_pid_file(&self, pid: u32) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(pid)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_pid_file_name(path: &Path) -> Option<u32> {
    if path.extension()? != "pid" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Whether a process is currently alive. Abstracted so orphan detection is
/// portable across process models.
pub trait ProcessLivenessChecker: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Liveness via `/proc/<pid>` existence
pub struct ProcFsLivenessChecker;

impl ProcessLivenessChecker for ProcFsLivenessChecker {
    fn is_alive(&self, pid: u32) -> bool {
        Path::new("/proc").join(pid.to_string()).exists()
    }
}

/// Consumption extension that redelivers messages of dead consumers
pub struct OrphanRedeliveryExtension {
    pid_store: PidFileStore,
    liveness: Arc<dyn ProcessLivenessChecker>,
    own_pid: u32,
    pid_file_created: AtomicBool,
}

impl OrphanRedeliveryExtension {
    pub fn new(pid_store: PidFileStore, liveness: Arc<dyn ProcessLivenessChecker>) -> Self {
        Self {
            pid_store,
            liveness,
            own_pid: std::process::id(),
            pid_file_created: AtomicBool::new(false),
        }
    }

    /// Release every message claimed by any of the orphan consumer ids in
    /// one batched statement, bounding database round-trips.
    async fn redeliver(&self, ctx: &ConsumptionContext, orphans: &[PidFileInfo]) -> Result<()> {
        let mut query = sqlx::QueryBuilder::new(
            "UPDATE messages SET consumer_id = NULL, redelivered = 1 WHERE consumer_id IN (",
        );
        let mut ids = query.separated(", ");
        for orphan in orphans {
            ids.push_bind(orphan.consumer_id.clone());
        }
        query.push(")");
        query.build().execute(&ctx.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ConsumptionExtension for OrphanRedeliveryExtension {
    async fn on_before_receive(&self, ctx: &ConsumptionContext) -> Result<()> {
        // Exactly once per process lifetime
        if !self.pid_file_created.load(Ordering::SeqCst) {
            self.pid_store
                .create_pid_file(self.own_pid, &ctx.consumer_id)
                .await?;
            self.pid_file_created.store(true, Ordering::SeqCst);
            debug!(pid = self.own_pid, consumer_id = %ctx.consumer_id, "Created pid file");
        }

        let orphans: Vec<PidFileInfo> = self
            .pid_store
            .list_pid_files()
            .await?
            .into_iter()
            .filter(|info| !self.liveness.is_alive(info.pid))
            .collect();
        if orphans.is_empty() {
            return Ok(());
        }

        // Redelivery failure propagates; pid files stay and the next sweep
        // retries.
        self.redeliver(ctx, &orphans).await?;

        let consumer_ids: Vec<&str> =
            orphans.iter().map(|info| info.consumer_id.as_str()).collect();
        for orphan in &orphans {
            if let Err(e) = self.pid_store.remove_pid_file(orphan.pid).await {
                error!(pid = orphan.pid, error = %e, "Failed to remove orphan pid file");
            }
        }
        error!(
            consumer_ids = ?consumer_ids,
            "Orphan consumers detected, their messages were redelivered"
        );

        Ok(())
    }

    async fn on_interrupted(&self, _ctx: &ConsumptionContext) -> Result<()> {
        // Never leave our own pid file behind to be mistaken for an orphan
        if self.pid_file_created.load(Ordering::SeqCst) {
            self.pid_store.remove_pid_file(self.own_pid).await?;
            info!(pid = self.own_pid, "Removed own pid file on shutdown");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;
    use std::collections::HashSet;

    struct FixedLiveness(HashSet<u32>);

    impl ProcessLivenessChecker for FixedLiveness {
        fn is_alive(&self, pid: u32) -> bool {
            self.0.contains(&pid)
        }
    }

    async fn pool() -> SqlitePool {
        bulkq_common::db::init_memory_database().await.unwrap()
    }

    async fn enqueue_claimed(pool: &SqlitePool, consumer_id: Option<&str>) -> i64 {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO messages (queue, topic, processor, body, consumer_id, redelivered, created_at)
             VALUES ('q', 't', 'p', '{}', ?, 0, 0) RETURNING id",
        )
        .bind(consumer_id)
        .fetch_one(pool)
        .await
        .unwrap();
        row.0
    }

    async fn message_state(pool: &SqlitePool, id: i64) -> (Option<String>, bool) {
        sqlx::query_as("SELECT consumer_id, redelivered FROM messages WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    fn extension(
        dir: &tempfile::TempDir,
        live: impl IntoIterator<Item = u32>,
    ) -> OrphanRedeliveryExtension {
        let mut live: HashSet<u32> = live.into_iter().collect();
        // Our own process is always alive
        live.insert(std::process::id());
        OrphanRedeliveryExtension::new(
            PidFileStore::new(dir.path()),
            Arc::new(FixedLiveness(live)),
        )
    }

    fn ctx(pool: SqlitePool) -> ConsumptionContext {
        ConsumptionContext {
            consumer_id: "self".to_string(),
            pool,
        }
    }

    #[tokio::test]
    async fn test_pid_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PidFileStore::new(dir.path());
        store.create_pid_file(1, "a").await.unwrap();
        store.create_pid_file(2, "b").await.unwrap();

        let infos = store.list_pid_files().await.unwrap();
        assert_eq!(
            infos,
            vec![
                PidFileInfo { pid: 1, consumer_id: "a".to_string() },
                PidFileInfo { pid: 2, consumer_id: "b".to_string() },
            ]
        );

        store.remove_pid_file(1).await.unwrap();
        assert_eq!(store.list_pid_files().await.unwrap().len(), 1);
        // Removing a missing pid file is fine
        store.remove_pid_file(99).await.unwrap();
    }

    // Records {1,"a"} and {2,"b"} with live pids {1}: exactly consumer "b"
    // is swept
    #[tokio::test]
    async fn test_only_dead_consumers_are_redelivered() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool().await;
        let ext = extension(&dir, [1]);
        ext.pid_store.create_pid_file(1, "a").await.unwrap();
        ext.pid_store.create_pid_file(2, "b").await.unwrap();

        let a_msg = enqueue_claimed(&pool, Some("a")).await;
        let b_msg1 = enqueue_claimed(&pool, Some("b")).await;
        let b_msg2 = enqueue_claimed(&pool, Some("b")).await;
        let free_msg = enqueue_claimed(&pool, None).await;

        ext.on_before_receive(&ctx(pool.clone())).await.unwrap();

        // "a" untouched
        assert_eq!(message_state(&pool, a_msg).await, (Some("a".to_string()), false));
        // Both of "b"'s messages released and marked redelivered
        assert_eq!(message_state(&pool, b_msg1).await, (None, true));
        assert_eq!(message_state(&pool, b_msg2).await, (None, true));
        // Unclaimed messages keep their flags
        assert_eq!(message_state(&pool, free_msg).await, (None, false));

        // Orphan pid file removed, live one kept
        let pids: Vec<u32> = ext
            .pid_store
            .list_pid_files()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.pid)
            .filter(|&p| p != std::process::id())
            .collect();
        assert_eq!(pids, vec![1]);
    }

    #[tokio::test]
    async fn test_own_pid_file_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool().await;
        let ext = extension(&dir, []);
        let ctx = ctx(pool);

        ext.on_before_receive(&ctx).await.unwrap();
        ext.on_before_receive(&ctx).await.unwrap();

        let infos = ext.pid_store.list_pid_files().await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].pid, std::process::id());
        assert_eq!(infos[0].consumer_id, "self");
    }

    #[tokio::test]
    async fn test_interrupted_removes_own_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool().await;
        let ext = extension(&dir, []);
        let ctx = ctx(pool);

        ext.on_before_receive(&ctx).await.unwrap();
        ext.on_interrupted(&ctx).await.unwrap();
        assert!(ext.pid_store.list_pid_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_without_orphans_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool().await;
        let ext = extension(&dir, [1]);
        ext.pid_store.create_pid_file(1, "a").await.unwrap();
        let a_msg = enqueue_claimed(&pool, Some("a")).await;

        ext.on_before_receive(&ctx(pool.clone())).await.unwrap();
        assert_eq!(message_state(&pool, a_msg).await, (Some("a".to_string()), false));
    }
}
