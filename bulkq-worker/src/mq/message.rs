//! Queue message model

use serde_json::Value;
use std::collections::HashMap;

/// Well-known message property names
pub mod property {
    /// Logical topic the message was sent to
    pub const TOPIC: &str = "topic";
    /// Processor that should handle the message (stamped by the router)
    pub const PROCESSOR: &str = "processor";
    /// Transport queue the message was routed to (stamped by the router)
    pub const QUEUE: &str = "queue";
}

/// One queue message: a JSON body plus string properties.
///
/// `id` is 0 until the message is persisted; `redelivered` is set when a
/// message returns to the queue after an unacknowledged delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: i64,
    pub body: Value,
    pub properties: HashMap<String, String>,
    pub redelivered: bool,
}

impl Message {
    /// New unsent message for a topic
    pub fn new(topic: &str, body: Value) -> Self {
        let mut properties = HashMap::new();
        properties.insert(property::TOPIC.to_string(), topic.to_string());
        Self {
            id: 0,
            body,
            properties,
            redelivered: false,
        }
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn set_property(&mut self, name: &str, value: &str) {
        self.properties.insert(name.to_string(), value.to_string());
    }

    pub fn topic(&self) -> Option<&str> {
        self.property(property::TOPIC)
    }
}
