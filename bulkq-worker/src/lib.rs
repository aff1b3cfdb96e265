//! # bulkq Worker
//!
//! Consumer service for the asynchronous bulk-operation pipeline:
//! - Chunk file model and blob-backed chunk/chunk-job indexes
//! - Processing helper (index CRUD, batched job creation, stage messages)
//! - Job tree (root + delayed child jobs) backed by SQLite
//! - Message producer, topic router, and polling queue consumer
//! - Chunk-jobs pagination processor
//! - Orphan-redelivery consumption extension

pub mod chunk;
pub mod consumption;
pub mod jobs;
pub mod mq;
pub mod operations;
pub mod processor;
pub mod redelivery;
pub mod storage;

pub use bulkq_common::{Error, Result};
