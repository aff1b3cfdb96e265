//! Polling queue consumer
//!
//! Pulls messages from one transport queue in the `messages` table. A
//! message is claimed by writing this consumer's id into its row (single
//! UPDATE, so concurrent consumers never claim the same message), handled
//! by the processor named in its properties, then acked (deleted), rejected
//! (deleted, logged) or requeued (released with the redelivered flag).

use super::{ConsumptionContext, ConsumptionExtension, MessageProcessor, MessageStatus};
use crate::mq::{property, Message};
use bulkq_common::Result;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct QueueConsumer {
    pool: SqlitePool,
    queue: String,
    consumer_id: String,
    poll_interval: Duration,
    processors: HashMap<String, Arc<dyn MessageProcessor>>,
    extensions: Vec<Arc<dyn ConsumptionExtension>>,
}

impl QueueConsumer {
    pub fn new(pool: SqlitePool, queue: impl Into<String>, poll_interval: Duration) -> Self {
        let consumer_id = format!("{}-{}", std::process::id(), uuid::Uuid::new_v4());
        Self {
            pool,
            queue: queue.into(),
            consumer_id,
            poll_interval,
            processors: HashMap::new(),
            extensions: Vec::new(),
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn register_processor(&mut self, name: &str, processor: Arc<dyn MessageProcessor>) {
        self.processors.insert(name.to_string(), processor);
    }

    pub fn add_extension(&mut self, extension: Arc<dyn ConsumptionExtension>) {
        self.extensions.push(extension);
    }

    /// Consume until the token is cancelled. Extensions run before every
    /// receive tick; `on_interrupted` fires once on the way out.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            queue = %self.queue,
            consumer_id = %self.consumer_id,
            "Consumer started"
        );

        let ctx = ConsumptionContext {
            consumer_id: self.consumer_id.clone(),
            pool: self.pool.clone(),
        };

        let result = self.consume_loop(&ctx, &cancel).await;

        for extension in &self.extensions {
            if let Err(e) = extension.on_interrupted(&ctx).await {
                error!(error = %e, "Consumption extension failed on interruption");
            }
        }
        info!(consumer_id = %self.consumer_id, "Consumer stopped");

        result
    }

    async fn consume_loop(
        &self,
        ctx: &ConsumptionContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            for extension in &self.extensions {
                extension.on_before_receive(ctx).await?;
            }

            match self.claim_next().await? {
                Some(message) => {
                    let released = self.handle(&message).await?;
                    if released {
                        // The released row is the oldest unclaimed again;
                        // wait one interval so a failing message cannot
                        // spin the loop
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(self.poll_interval) => {}
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
    }

    /// Claim the oldest unclaimed message of this consumer's queue
    async fn claim_next(&self) -> Result<Option<Message>> {
        let row: Option<(i64, String, Option<String>, String, bool)> = sqlx::query_as(
            "UPDATE messages SET consumer_id = ?
             WHERE id = (
                 SELECT id FROM messages
                 WHERE queue = ? AND consumer_id IS NULL
                 ORDER BY id LIMIT 1
             )
             RETURNING id, topic, processor, body, redelivered",
        )
        .bind(&self.consumer_id)
        .bind(&self.queue)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, topic, processor, body_text, redelivered)) = row else {
            return Ok(None);
        };

        let body = match serde_json::from_str(&body_text) {
            Ok(body) => body,
            Err(e) => {
                // A row that cannot be decoded can never be processed;
                // rejecting it keeps the consumer alive
                error!(message_id = id, error = %e, "Message body is not valid JSON, rejecting");
                self.delete(id).await?;
                return Ok(None);
            }
        };
        let mut message = Message::new(&topic, body);
        message.id = id;
        message.redelivered = redelivered;
        message.set_property(property::QUEUE, &self.queue);
        if let Some(processor) = processor {
            message.set_property(property::PROCESSOR, &processor);
        }
        Ok(Some(message))
    }

    /// Dispatch one claimed message. Returns true when the message was
    /// released back to the queue.
    async fn handle(&self, message: &Message) -> Result<bool> {
        let processor = message
            .property(property::PROCESSOR)
            .and_then(|name| self.processors.get(name));

        let Some(processor) = processor else {
            error!(
                message_id = message.id,
                processor = ?message.property(property::PROCESSOR),
                "No processor registered for message, rejecting"
            );
            self.delete(message.id).await?;
            return Ok(false);
        };

        match processor.process(message).await {
            Ok(MessageStatus::Ack) => {
                debug!(message_id = message.id, "Message acknowledged");
                self.delete(message.id).await?;
                Ok(false)
            }
            Ok(MessageStatus::Reject) => {
                warn!(message_id = message.id, "Message rejected");
                self.delete(message.id).await?;
                Ok(false)
            }
            Ok(MessageStatus::Requeue) => {
                debug!(message_id = message.id, "Message requeued");
                self.release(message.id).await?;
                Ok(true)
            }
            Err(e) => {
                // Standard retry policy: unhandled processor errors requeue
                error!(message_id = message.id, error = %e, "Message processing failed");
                self.release(message.id).await?;
                Ok(true)
            }
        }
    }

    async fn delete(&self, message_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release(&self, message_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET consumer_id = NULL, redelivered = 1 WHERE id = ?",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
