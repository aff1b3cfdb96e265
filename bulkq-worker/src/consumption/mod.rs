//! Message consumption
//!
//! Processors handle claimed messages and decide their fate (ack, reject,
//! requeue). Extensions hook into the consumer's lifecycle: before every
//! receive tick and on interruption (graceful shutdown).

mod consumer;

pub use consumer::QueueConsumer;

use crate::mq::Message;
use async_trait::async_trait;
use bulkq_common::Result;
use sqlx::SqlitePool;

/// Outcome of processing one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// Message handled; remove it from the queue
    Ack,
    /// Message is broken beyond retry; remove it and log
    Reject,
    /// Release the message for another delivery attempt
    Requeue,
}

/// Handles messages dispatched by the consumer
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: &Message) -> Result<MessageStatus>;
}

/// Consumer state visible to extensions
#[derive(Clone)]
pub struct ConsumptionContext {
    pub consumer_id: String,
    pub pool: SqlitePool,
}

/// Hooks into the consumption lifecycle
#[async_trait]
pub trait ConsumptionExtension: Send + Sync {
    /// Called before every receive tick
    async fn on_before_receive(&self, _ctx: &ConsumptionContext) -> Result<()> {
        Ok(())
    }

    /// Called once when the consumer shuts down gracefully
    async fn on_interrupted(&self, _ctx: &ConsumptionContext) -> Result<()> {
        Ok(())
    }
}
