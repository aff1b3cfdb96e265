//! Message producers

use super::message::{property, Message};
use super::router::Router;
use async_trait::async_trait;
use bulkq_common::Result;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Mutex;
use tracing::debug;

/// Sends a message body to a topic
#[async_trait]
pub trait MessageProducer: Send + Sync {
    async fn send(&self, topic: &str, body: Value) -> Result<()>;
}

/// Producer that routes the topic through the [`Router`] and persists one
/// row per recipient into the `messages` table.
pub struct DbMessageProducer {
    pool: SqlitePool,
    router: Router,
}

impl DbMessageProducer {
    pub fn new(pool: SqlitePool, router: Router) -> Self {
        Self { pool, router }
    }
}

#[async_trait]
impl MessageProducer for DbMessageProducer {
    async fn send(&self, topic: &str, body: Value) -> Result<()> {
        let message = Message::new(topic, body);
        let recipients = self.router.route(&message)?;
        if recipients.is_empty() {
            debug!(topic, "No routes registered for topic, message dropped");
            return Ok(());
        }

        let created_at = chrono::Utc::now().timestamp();
        for recipient in recipients {
            let body_text = serde_json::to_string(&recipient.message.body)?;
            sqlx::query(
                "INSERT INTO messages (queue, topic, processor, body, redelivered, created_at)
                 VALUES (?, ?, ?, ?, 0, ?)",
            )
            .bind(&recipient.queue)
            .bind(topic)
            .bind(recipient.message.property(property::PROCESSOR))
            .bind(&body_text)
            .bind(created_at)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

/// Producer that records sent messages in memory instead of persisting them.
/// Used by tests to assert on the pipeline's outgoing traffic.
#[derive(Default)]
pub struct InMemoryProducer {
    sent: Mutex<Vec<(String, Value)>>,
}

impl InMemoryProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// All (topic, body) pairs sent so far, in order
    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().expect("producer lock").clone()
    }
}

#[async_trait]
impl MessageProducer for InMemoryProducer {
    async fn send(&self, topic: &str, body: Value) -> Result<()> {
        self.sent.lock().expect("producer lock").push((topic.to_string(), body));
        Ok(())
    }
}
