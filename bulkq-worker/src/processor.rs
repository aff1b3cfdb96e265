//! Chunk-jobs pagination processor
//!
//! Consumes "create the next batch of chunk jobs" messages. Each message
//! creates at most `CHUNK_JOBS_BATCH_SIZE` delayed jobs and then either
//! sends a continuation message with the advanced cursor or, once every
//! chunk has a job, sends the "start chunk jobs" message. Pagination runs
//! via message chaining rather than a loop so per-message work stays
//! bounded and queue scheduling stays fair.

use crate::chunk::ProcessingHelper;
use crate::consumption::{MessageProcessor, MessageStatus};
use crate::jobs::{JobRunner, JobStore};
use crate::mq::{body, Message};
use crate::operations::OperationSummaryStore;
use async_trait::async_trait;
use bulkq_common::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

/// Number of chunk jobs created per message. A tunable constant, not a
/// protocol invariant: the continuation cursor works for any value.
pub const CHUNK_JOBS_BATCH_SIZE: u32 = 2000;

/// Processor name for route registration
pub const CREATE_CHUNK_JOBS_PROCESSOR: &str = "update_list_create_chunk_jobs";

/// Validated body of a create-chunk-jobs message
struct CreateChunkJobsMessage {
    operation_id: i64,
    root_job_id: i64,
    chunk_job_name_template: String,
    first_chunk_file_index: u32,
    aggregate_time: i64,
}

impl CreateChunkJobsMessage {
    /// All required keys must be present with the right types; the two
    /// optional fields default (sparse wire format).
    fn parse(value: &Value) -> Option<Self> {
        let operation_id = value.get(body::OPERATION_ID)?.as_i64()?;
        value.get(body::ENTITY_CLASS)?.as_str()?;
        value.get(body::REQUEST_TYPE)?.as_str()?;
        value.get(body::VERSION)?.as_str()?;
        let root_job_id = value.get(body::ROOT_JOB_ID)?.as_i64()?;
        let chunk_job_name_template =
            value.get(body::CHUNK_JOB_NAME_TEMPLATE)?.as_str()?.to_string();

        let first_chunk_file_index = match value.get(body::FIRST_CHUNK_FILE_INDEX) {
            Some(v) => u32::try_from(v.as_i64()?).ok()?,
            None => 0,
        };
        let aggregate_time = match value.get(body::AGGREGATE_TIME) {
            Some(v) => v.as_i64()?,
            None => 0,
        };

        Some(Self {
            operation_id,
            root_job_id,
            chunk_job_name_template,
            first_chunk_file_index,
            aggregate_time,
        })
    }
}

/// Creates one batch of delayed chunk jobs per message and chains the next
pub struct CreateChunkJobsProcessor {
    helper: Arc<ProcessingHelper>,
    job_store: JobStore,
    job_runner: Arc<dyn JobRunner>,
    summary: OperationSummaryStore,
    batch_size: u32,
}

impl CreateChunkJobsProcessor {
    pub fn new(
        helper: Arc<ProcessingHelper>,
        job_store: JobStore,
        job_runner: Arc<dyn JobRunner>,
        summary: OperationSummaryStore,
    ) -> Self {
        Self {
            helper,
            job_store,
            job_runner,
            summary,
            batch_size: CHUNK_JOBS_BATCH_SIZE,
        }
    }

    /// Override the batch size (tests and tuning)
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }
}

#[async_trait]
impl MessageProcessor for CreateChunkJobsProcessor {
    async fn process(&self, message: &Message) -> Result<MessageStatus> {
        let started_at = Instant::now();

        // Malformed control messages are a programming/data error, never a
        // transient condition: reject without retry.
        let Some(parsed) = CreateChunkJobsMessage::parse(&message.body) else {
            error!("Got invalid message.");
            return Ok(MessageStatus::Reject);
        };

        let Some(root_job) = self.job_store.find_job(parsed.root_job_id).await? else {
            // The parent job tree has vanished; unrecoverable.
            error!("The root job does not exist.");
            return Ok(MessageStatus::Reject);
        };

        let chunk_count = self.helper.get_chunk_index_count(parsed.operation_id).await?;

        let first_index = parsed.first_chunk_file_index;
        let mut next_index = first_index;
        if first_index < chunk_count {
            let last_index = std::cmp::min(first_index + self.batch_size, chunk_count) - 1;
            let scoped_runner = self.job_runner.for_child_job(&root_job);
            next_index = self
                .helper
                .create_chunk_jobs(
                    scoped_runner.as_ref(),
                    parsed.operation_id,
                    &parsed.chunk_job_name_template,
                    first_index,
                    last_index,
                )
                .await?;
        }

        let aggregate_time = self
            .helper
            .calculate_aggregate_time(started_at, parsed.aggregate_time);

        if next_index < chunk_count {
            // More chunks remain: continue via a fresh message
            self.helper
                .send_message_to_create_chunk_jobs(
                    &root_job,
                    &parsed.chunk_job_name_template,
                    &message.body,
                    next_index,
                    Some(aggregate_time),
                )
                .await?;
        } else {
            self.helper
                .send_message_to_start_chunk_jobs(&root_job, &message.body)
                .await?;
            self.summary
                .increment_aggregate_time(parsed.operation_id, aggregate_time)
                .await?;
        }

        Ok(MessageStatus::Ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkFile;
    use crate::jobs::SqliteJobRunner;
    use crate::mq::{topics, InMemoryProducer};
    use crate::storage::LocalFileManager;
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        helper: Arc<ProcessingHelper>,
        producer: Arc<InMemoryProducer>,
        job_store: JobStore,
        summary: OperationSummaryStore,
        processor: CreateChunkJobsProcessor,
    }

    async fn fixture(batch_size: u32) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool = bulkq_common::db::init_memory_database().await.unwrap();

        let producer = Arc::new(InMemoryProducer::new());
        let helper = Arc::new(ProcessingHelper::new(
            Arc::new(LocalFileManager::new(dir.path())),
            producer.clone(),
        ));
        let job_store = JobStore::new(pool.clone());
        let summary = OperationSummaryStore::new(pool);
        let processor = CreateChunkJobsProcessor::new(
            helper.clone(),
            job_store.clone(),
            Arc::new(SqliteJobRunner::new(job_store.clone())),
            summary.clone(),
        )
        .with_batch_size(batch_size);

        Fixture {
            _dir: dir,
            helper,
            producer,
            job_store,
            summary,
            processor,
        }
    }

    async fn seed_chunks(f: &Fixture, operation_id: i64, count: u32) {
        let files: Vec<ChunkFile> = (0..count)
            .map(|i| ChunkFile::new(format!("chunk_{}", i), i, 0, Some("data".to_string())))
            .collect();
        f.helper.update_chunk_index(operation_id, &files).await.unwrap();
    }

    fn control_message(root_job_id: i64, extra: Value) -> Message {
        let mut body = json!({
            "operationId": 123,
            "entityClass": "Product",
            "requestType": "rest",
            "version": "1.1",
            "rootJobId": root_job_id,
            "chunkJobNameTemplate": "bulk:123:chunk:{}",
        });
        if let (Some(obj), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        Message::new(topics::UPDATE_LIST_CREATE_CHUNK_JOBS, body)
    }

    #[tokio::test]
    async fn test_invalid_message_is_rejected() {
        let f = fixture(10).await;
        let message = Message::new(
            topics::UPDATE_LIST_CREATE_CHUNK_JOBS,
            json!({"key": "value"}),
        );
        let status = f.processor.process(&message).await.unwrap();
        assert_eq!(status, MessageStatus::Reject);
        assert!(f.producer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_missing_root_job_is_rejected() {
        let f = fixture(10).await;
        let status = f
            .processor
            .process(&control_message(100, json!({})))
            .await
            .unwrap();
        assert_eq!(status, MessageStatus::Reject);
        assert!(f.producer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_single_batch_finishes_with_start_message() {
        let f = fixture(10).await;
        let root = f.job_store.create_root_job("bulk:123").await.unwrap();
        seed_chunks(&f, 123, 3).await;

        let status = f
            .processor
            .process(&control_message(root.id, json!({})))
            .await
            .unwrap();
        assert_eq!(status, MessageStatus::Ack);

        // All three chunks got jobs in one pass
        assert_eq!(f.job_store.count_children(root.id).await.unwrap(), 3);
        let index = f.helper.load_chunk_job_index(123).await.unwrap();
        assert_eq!(index.len(), 3);

        let sent = f.producer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, topics::UPDATE_LIST_START_CHUNK_JOBS);
        assert_eq!(sent[0].1["rootJobId"], json!(root.id));
        assert!(sent[0].1.get("chunkJobNameTemplate").is_none());

        // Final aggregate time reported to the operation summary
        assert!(f.summary.aggregate_time(123).await.unwrap() >= 0);
    }

    // 3000 chunks with batch size 2000: two messages, the first continuing
    // with cursor 2000, the second finishing
    #[tokio::test]
    async fn test_two_pass_pagination_covers_all_chunks_exactly_once() {
        let f = fixture(2000).await;
        let root = f.job_store.create_root_job("bulk:123").await.unwrap();
        seed_chunks(&f, 123, 3000).await;

        // First message: cursor absent, defaults to 0
        let status = f
            .processor
            .process(&control_message(root.id, json!({})))
            .await
            .unwrap();
        assert_eq!(status, MessageStatus::Ack);
        assert_eq!(f.job_store.count_children(root.id).await.unwrap(), 2000);

        let sent = f.producer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, topics::UPDATE_LIST_CREATE_CHUNK_JOBS);
        assert_eq!(sent[0].1["firstChunkFileIndex"], json!(2000));
        let carried_aggregate = sent[0].1["aggregateTime"].as_i64().unwrap();
        assert!(carried_aggregate >= 0);

        // Second message: the continuation the first pass sent
        let status = f
            .processor
            .process(&Message::new(
                topics::UPDATE_LIST_CREATE_CHUNK_JOBS,
                sent[0].1.clone(),
            ))
            .await
            .unwrap();
        assert_eq!(status, MessageStatus::Ack);
        assert_eq!(f.job_store.count_children(root.id).await.unwrap(), 3000);

        let sent = f.producer.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].0, topics::UPDATE_LIST_START_CHUNK_JOBS);

        // Every chunk index got exactly one job
        let index = f.helper.load_chunk_job_index(123).await.unwrap();
        assert_eq!(index.len(), 3000);

        // Final aggregate includes the first pass's carry-over
        assert!(f.summary.aggregate_time(123).await.unwrap() >= carried_aggregate);
    }

    #[tokio::test]
    async fn test_cursor_partition_is_contiguous() {
        let f = fixture(4).await;
        let root = f.job_store.create_root_job("bulk:123").await.unwrap();
        seed_chunks(&f, 123, 10).await;

        let mut message = control_message(root.id, json!({}));
        let mut cursors = vec![0u32];
        loop {
            let status = f.processor.process(&message).await.unwrap();
            assert_eq!(status, MessageStatus::Ack);
            let last = f.producer.sent().pop().unwrap();
            if last.0 == topics::UPDATE_LIST_START_CHUNK_JOBS {
                break;
            }
            let cursor = last.1["firstChunkFileIndex"].as_i64().unwrap() as u32;
            cursors.push(cursor);
            message = Message::new(topics::UPDATE_LIST_CREATE_CHUNK_JOBS, last.1);
        }

        // [0,3], [4,7], [8,9]
        assert_eq!(cursors, vec![0, 4, 8]);
        assert_eq!(f.job_store.count_children(root.id).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_stale_cursor_past_the_end_goes_straight_to_start() {
        let f = fixture(4).await;
        let root = f.job_store.create_root_job("bulk:123").await.unwrap();
        seed_chunks(&f, 123, 2).await;

        let status = f
            .processor
            .process(&control_message(root.id, json!({"firstChunkFileIndex": 5})))
            .await
            .unwrap();
        assert_eq!(status, MessageStatus::Ack);
        assert_eq!(f.job_store.count_children(root.id).await.unwrap(), 0);

        let sent = f.producer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, topics::UPDATE_LIST_START_CHUNK_JOBS);
    }

    #[tokio::test]
    async fn test_missing_chunk_index_propagates_for_retry() {
        let f = fixture(10).await;
        let root = f.job_store.create_root_job("bulk:123").await.unwrap();
        // No chunk index seeded: correctness-critical storage error
        let result = f.processor.process(&control_message(root.id, json!({}))).await;
        assert!(result.is_err());
    }
}
