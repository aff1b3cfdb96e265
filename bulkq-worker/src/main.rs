//! bulkq Worker - Main entry point
//!
//! Starts one queue consumer for the update-list bulk-operation pipeline:
//! wires the blob store, job tree, router, and the chunk-jobs pagination
//! processor together, with orphan redelivery guarding against consumers
//! that died mid-delivery.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bulkq_common::config::WorkerConfig;
use bulkq_worker::chunk::ProcessingHelper;
use bulkq_worker::consumption::QueueConsumer;
use bulkq_worker::jobs::{JobStore, SqliteJobRunner};
use bulkq_worker::mq::{topics, DbMessageProducer, DestinationMetaRegistry, Router};
use bulkq_worker::operations::OperationSummaryStore;
use bulkq_worker::processor::{CreateChunkJobsProcessor, CREATE_CHUNK_JOBS_PROCESSOR};
use bulkq_worker::redelivery::{OrphanRedeliveryExtension, PidFileStore, ProcFsLivenessChecker};
use bulkq_worker::storage::LocalFileManager;

/// Command-line arguments for bulkq-worker
#[derive(Parser, Debug)]
#[command(name = "bulkq-worker")]
#[command(about = "Queue consumer for the bulkq bulk-operation pipeline")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "BULKQ_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bulkq_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = WorkerConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    info!("Data folder: {}", config.data_dir.display());

    let pool = bulkq_common::db::init_database(&config.database_path)
        .await
        .context("Failed to initialize database")?;

    let file_manager = Arc::new(LocalFileManager::new(&config.data_dir));
    file_manager
        .ensure_root()
        .await
        .context("Failed to create data folder")?;

    let registry = DestinationMetaRegistry::new(&config.queue_prefix);
    let transport_queue = registry.transport_name(&config.consumer_queue);
    let mut router = Router::new(registry);
    router
        .add_route(
            topics::UPDATE_LIST_CREATE_CHUNK_JOBS,
            CREATE_CHUNK_JOBS_PROCESSOR,
            &config.default_queue,
        )
        .context("Failed to register routes")?;

    let producer = Arc::new(DbMessageProducer::new(pool.clone(), router));
    let helper = Arc::new(ProcessingHelper::new(file_manager, producer));
    let job_store = JobStore::new(pool.clone());
    let summary = OperationSummaryStore::new(pool.clone());

    let mut consumer = QueueConsumer::new(
        pool,
        transport_queue,
        Duration::from_millis(config.poll_interval_ms),
    );
    consumer.register_processor(
        CREATE_CHUNK_JOBS_PROCESSOR,
        Arc::new(CreateChunkJobsProcessor::new(
            helper,
            job_store.clone(),
            Arc::new(SqliteJobRunner::new(job_store)),
            summary,
        )),
    );
    consumer.add_extension(Arc::new(OrphanRedeliveryExtension::new(
        PidFileStore::new(&config.pid_dir),
        Arc::new(ProcFsLivenessChecker),
    )));

    // Graceful shutdown on ctrl-c: the consumer finishes its in-flight
    // message and fires the interrupted hooks (pid file cleanup).
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    consumer.run(cancel).await.context("Consumer failed")?;
    Ok(())
}
