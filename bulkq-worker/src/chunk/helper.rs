//! Processing helper
//!
//! Orchestration glue shared by the update-list pipeline stages: CRUD over
//! the two per-operation JSON index files, batched creation of delayed chunk
//! jobs, aggregate-time accounting, and dispatch of the inter-stage
//! messages.
//!
//! The two index stores deliberately diverge: the chunk index is
//! **append-only** (writing the same batch twice duplicates its entries)
//! while the chunk-job index **merges by key** (last write per file index
//! wins). Both behaviors are pinned by tests.

use crate::chunk::{fill_template, ChunkFile};
use crate::jobs::{Job, JobRunner};
use crate::mq::{body, topics, MessageProducer};
use crate::storage::FileManager;
use bulkq_common::{Error, Result};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::error;

/// Body keys every inter-stage message carries
const COMMON_BODY_KEYS: [&str; 4] = [
    body::OPERATION_ID,
    body::ENTITY_CLASS,
    body::REQUEST_TYPE,
    body::VERSION,
];

fn chunk_index_file_name(operation_id: i64) -> String {
    format!("chunk_index_{}", operation_id)
}

fn chunk_job_index_file_name(operation_id: i64) -> String {
    format!("chunk_job_index_{}", operation_id)
}

/// Orchestrates chunk bookkeeping for bulk operations
pub struct ProcessingHelper {
    file_manager: Arc<dyn FileManager>,
    producer: Arc<dyn MessageProducer>,
}

impl ProcessingHelper {
    pub fn new(file_manager: Arc<dyn FileManager>, producer: Arc<dyn MessageProducer>) -> Self {
        Self {
            file_manager,
            producer,
        }
    }

    /// Project only the operation-identity fields out of a message body.
    ///
    /// Downstream messages must carry exactly the operation's identity,
    /// never accidental extra state from the parent message.
    pub fn get_common_body(&self, parent_body: &Value) -> Value {
        let mut common = Map::new();
        if let Some(parent) = parent_body.as_object() {
            for key in COMMON_BODY_KEYS {
                if let Some(value) = parent.get(key) {
                    common.insert(key.to_string(), value.clone());
                }
            }
        }
        Value::Object(common)
    }

    /// Elapsed milliseconds since `started_at`, rounded to the nearest
    /// integer, plus the running total carried over from earlier stages
    pub fn calculate_aggregate_time(&self, started_at: Instant, additional: i64) -> i64 {
        (started_at.elapsed().as_secs_f64() * 1000.0).round() as i64 + additional
    }

    /// Best-effort delete: a storage error is logged and swallowed so that
    /// cleanup never aborts the surrounding workflow
    pub async fn safe_delete_file(&self, file_name: &str) {
        if let Err(e) = self.file_manager.delete_file(file_name).await {
            error!(file_name, error = %e, "Failed to delete a file");
        }
    }

    /// Best-effort delete of all chunk files belonging to an operation.
    /// A lookup failure is logged and treated as "nothing to delete".
    pub async fn safe_delete_chunk_files(&self, operation_id: i64, file_name_template: &str) {
        let prefix = fill_template(file_name_template, "");
        let files = match self.file_manager.find_files(&prefix).await {
            Ok(files) => files,
            Err(e) => {
                error!(operation_id, error = %e, "Failed to find chunk files to delete");
                return;
            }
        };
        for file_name in files {
            self.safe_delete_file(&file_name).await;
        }
    }

    // ------------------------------------------------------------------
    // Chunk index
    // ------------------------------------------------------------------

    pub async fn has_chunk_index(&self, operation_id: i64) -> Result<bool> {
        self.file_manager
            .has_file(&chunk_index_file_name(operation_id))
            .await
    }

    pub async fn get_chunk_index_count(&self, operation_id: i64) -> Result<u32> {
        Ok(self.load_chunk_index(operation_id).await?.len() as u32)
    }

    /// Load the ordered chunk manifest; the file must exist
    pub async fn load_chunk_index(&self, operation_id: i64) -> Result<Vec<ChunkFile>> {
        let content = self
            .file_manager
            .get_file_content(&chunk_index_file_name(operation_id))
            .await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Append chunk files to the stored manifest.
    ///
    /// This is a blind append, not a merge: the existing entries are read
    /// (or an empty list is started), the new files are appended, and the
    /// whole file is rewritten. Calling it twice with the same batch stores
    /// that batch twice.
    pub async fn update_chunk_index(&self, operation_id: i64, files: &[ChunkFile]) -> Result<()> {
        let mut stored = if self.has_chunk_index(operation_id).await? {
            self.load_chunk_index(operation_id).await?
        } else {
            Vec::new()
        };
        stored.extend_from_slice(files);
        self.file_manager
            .write_to_storage(
                &serde_json::to_string(&stored)?,
                &chunk_index_file_name(operation_id),
            )
            .await
    }

    pub async fn delete_chunk_index(&self, operation_id: i64) {
        self.safe_delete_file(&chunk_index_file_name(operation_id)).await;
    }

    // ------------------------------------------------------------------
    // Chunk-job index
    // ------------------------------------------------------------------

    /// Load the chunk-file-index -> job-id map; empty if not written yet
    pub async fn load_chunk_job_index(&self, operation_id: i64) -> Result<HashMap<u32, i64>> {
        let file_name = chunk_job_index_file_name(operation_id);
        if !self.file_manager.has_file(&file_name).await? {
            return Ok(HashMap::new());
        }
        let content = self.file_manager.get_file_content(&file_name).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Merge new chunk->job mappings into the stored index (by key, last
    /// write wins — unlike [`Self::update_chunk_index`])
    pub async fn update_chunk_job_index(
        &self,
        operation_id: i64,
        entries: &HashMap<u32, i64>,
    ) -> Result<()> {
        let mut stored = self.load_chunk_job_index(operation_id).await?;
        for (&chunk_file_index, &job_id) in entries {
            stored.insert(chunk_file_index, job_id);
        }
        self.file_manager
            .write_to_storage(
                &serde_json::to_string(&stored)?,
                &chunk_job_index_file_name(operation_id),
            )
            .await
    }

    pub async fn delete_chunk_job_index(&self, operation_id: i64) {
        self.safe_delete_file(&chunk_job_index_file_name(operation_id)).await;
    }

    // ------------------------------------------------------------------
    // Chunk job creation
    // ------------------------------------------------------------------

    /// Create one delayed job per chunk file index in the inclusive range
    /// `[first_index, last_index]`.
    ///
    /// Job names fill the template with the one-based job number. Each
    /// creation callback records the `file_index -> job_id` mapping; the
    /// whole batch is persisted with a single chunk-job index write.
    /// Returns the first unprocessed index for the next batch.
    pub async fn create_chunk_jobs(
        &self,
        job_runner: &dyn JobRunner,
        operation_id: i64,
        job_name_template: &str,
        first_index: u32,
        last_index: u32,
    ) -> Result<u32> {
        let chunk_file_to_job_id: Arc<Mutex<HashMap<u32, i64>>> =
            Arc::new(Mutex::new(HashMap::new()));

        for index in first_index..=last_index {
            let job_name = fill_template(job_name_template, index + 1);
            let map = Arc::clone(&chunk_file_to_job_id);
            job_runner
                .create_delayed(
                    &job_name,
                    Box::new(move |job: &Job| {
                        map.lock()
                            .map_err(|_| {
                                Error::Internal("Chunk job map lock poisoned".to_string())
                            })?
                            .insert(index, job.id);
                        Ok(true)
                    }),
                )
                .await?;
        }

        let entries = Arc::try_unwrap(chunk_file_to_job_id)
            .map_err(|_| Error::Internal("Chunk job map still shared".to_string()))?
            .into_inner()
            .map_err(|_| Error::Internal("Chunk job map lock poisoned".to_string()))?;
        self.update_chunk_job_index(operation_id, &entries).await?;

        Ok(last_index + 1)
    }

    // ------------------------------------------------------------------
    // Inter-stage messages (sparse wire format: optional fields omitted)
    // ------------------------------------------------------------------

    /// Ask for the next batch of chunk jobs to be created.
    ///
    /// `firstChunkFileIndex` is carried only when non-zero and
    /// `aggregateTime` only when present; the receiving side defaults both.
    pub async fn send_message_to_create_chunk_jobs(
        &self,
        root_job: &Job,
        chunk_job_name_template: &str,
        parent_body: &Value,
        first_chunk_file_index: u32,
        previous_aggregate_time: Option<i64>,
    ) -> Result<()> {
        let mut message = self.get_common_body(parent_body);
        let fields = message
            .as_object_mut()
            .ok_or_else(|| Error::Internal("Common body is not an object".to_string()))?;
        fields.insert(body::ROOT_JOB_ID.to_string(), json!(root_job.id));
        fields.insert(
            body::CHUNK_JOB_NAME_TEMPLATE.to_string(),
            json!(chunk_job_name_template),
        );
        if first_chunk_file_index > 0 {
            fields.insert(
                body::FIRST_CHUNK_FILE_INDEX.to_string(),
                json!(first_chunk_file_index),
            );
        }
        if let Some(aggregate_time) = previous_aggregate_time {
            fields.insert(body::AGGREGATE_TIME.to_string(), json!(aggregate_time));
        }

        self.producer
            .send(topics::UPDATE_LIST_CREATE_CHUNK_JOBS, message)
            .await
    }

    /// Signal that chunk job creation is finished and processing can start
    pub async fn send_message_to_start_chunk_jobs(
        &self,
        root_job: &Job,
        parent_body: &Value,
    ) -> Result<()> {
        let mut message = self.get_common_body(parent_body);
        let fields = message
            .as_object_mut()
            .ok_or_else(|| Error::Internal("Common body is not an object".to_string()))?;
        fields.insert(body::ROOT_JOB_ID.to_string(), json!(root_job.id));

        self.producer
            .send(topics::UPDATE_LIST_START_CHUNK_JOBS, message)
            .await
    }

    /// Dispatch one chunk file to its processing job
    pub async fn send_process_chunk_message(
        &self,
        parent_body: &Value,
        job: &Job,
        chunk_file: &ChunkFile,
        extra_chunk: bool,
    ) -> Result<()> {
        let mut message = self.get_common_body(parent_body);
        let fields = message
            .as_object_mut()
            .ok_or_else(|| Error::Internal("Common body is not an object".to_string()))?;
        fields.insert(body::JOB_ID.to_string(), json!(job.id));
        fields.insert(body::FILE_NAME.to_string(), json!(chunk_file.file_name));
        fields.insert(body::FILE_INDEX.to_string(), json!(chunk_file.file_index));
        fields.insert(
            body::FIRST_RECORD_OFFSET.to_string(),
            json!(chunk_file.first_record_offset),
        );
        fields.insert(body::SECTION_NAME.to_string(), json!(chunk_file.section_name));
        if extra_chunk {
            fields.insert(body::EXTRA_CHUNK.to_string(), json!(true));
        }

        self.producer
            .send(topics::UPDATE_LIST_PROCESS_CHUNK, message)
            .await
    }
}
