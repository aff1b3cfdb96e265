//! Message queue primitives
//!
//! Messages are JSON bodies with string properties. A producer sends to a
//! topic; the router fans the topic out to one or more (processor, queue)
//! pairs and the resulting rows land in the `messages` table, from which
//! consumers claim them.

mod message;
mod producer;
mod router;

pub use message::{property, Message};
pub use producer::{DbMessageProducer, InMemoryProducer, MessageProducer};
pub use router::{DestinationMetaRegistry, Recipient, Router};

/// Topic names of the update-list pipeline
pub mod topics {
    /// Create the next batch of chunk jobs for an operation
    pub const UPDATE_LIST_CREATE_CHUNK_JOBS: &str = "bulkq.update_list.create_chunk_jobs";
    /// All chunk jobs are created; start processing them
    pub const UPDATE_LIST_START_CHUNK_JOBS: &str = "bulkq.update_list.start_chunk_jobs";
    /// Process one chunk file
    pub const UPDATE_LIST_PROCESS_CHUNK: &str = "bulkq.update_list.process_chunk";
}

/// Wire body keys shared by the update-list topics
pub mod body {
    pub const OPERATION_ID: &str = "operationId";
    pub const ENTITY_CLASS: &str = "entityClass";
    pub const REQUEST_TYPE: &str = "requestType";
    pub const VERSION: &str = "version";
    pub const ROOT_JOB_ID: &str = "rootJobId";
    pub const CHUNK_JOB_NAME_TEMPLATE: &str = "chunkJobNameTemplate";
    pub const FIRST_CHUNK_FILE_INDEX: &str = "firstChunkFileIndex";
    pub const AGGREGATE_TIME: &str = "aggregateTime";
    pub const JOB_ID: &str = "jobId";
    pub const FILE_NAME: &str = "fileName";
    pub const FILE_INDEX: &str = "fileIndex";
    pub const FIRST_RECORD_OFFSET: &str = "firstRecordOffset";
    pub const SECTION_NAME: &str = "sectionName";
    pub const EXTRA_CHUNK: &str = "extra_chunk";
}
