//! Topic router
//!
//! Maps an outgoing message's topic to its destination queues. A topic may
//! fan out to multiple (processor, queue) pairs; every registered route
//! fires. Logical queue names are resolved to transport names through the
//! destination registry.

use super::message::{property, Message};
use bulkq_common::{Error, Result};
use std::collections::HashMap;

/// Resolves logical queue names to transport queue names.
///
/// A configured override wins; otherwise the transport name is the prefix
/// plus the normalized logical name (lowercase, non-alphanumerics collapsed
/// to underscores).
#[derive(Debug, Clone)]
pub struct DestinationMetaRegistry {
    prefix: String,
    overrides: HashMap<String, String>,
}

impl DestinationMetaRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            overrides: HashMap::new(),
        }
    }

    /// Configure an explicit transport name for a logical queue
    pub fn set_destination(&mut self, logical: &str, transport: &str) {
        self.overrides.insert(logical.to_string(), transport.to_string());
    }

    /// Transport queue name for a logical queue name
    pub fn transport_name(&self, logical: &str) -> String {
        if let Some(transport) = self.overrides.get(logical) {
            return transport.clone();
        }
        format!("{}{}", self.prefix, normalize(logical))
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() { c } else { '_' }
        })
        .collect()
}

/// A routing target: one transport queue plus the message rewritten for it
#[derive(Debug, Clone)]
pub struct Recipient {
    pub queue: String,
    pub message: Message,
}

/// Routes topic messages to their registered (processor, queue) pairs
pub struct Router {
    registry: DestinationMetaRegistry,
    routes: HashMap<String, Vec<(String, String)>>,
}

impl Router {
    pub fn new(registry: DestinationMetaRegistry) -> Self {
        Self {
            registry,
            routes: HashMap::new(),
        }
    }

    /// Register a route. All three names must be non-empty; a topic may be
    /// registered any number of times and every route fires.
    pub fn add_route(&mut self, topic: &str, processor: &str, queue: &str) -> Result<()> {
        if topic.is_empty() {
            return Err(Error::InvalidInput("The topic name must not be empty".to_string()));
        }
        if processor.is_empty() {
            return Err(Error::InvalidInput(
                "The processor name must not be empty".to_string(),
            ));
        }
        if queue.is_empty() {
            return Err(Error::InvalidInput("The queue name must not be empty".to_string()));
        }

        self.routes
            .entry(topic.to_string())
            .or_default()
            .push((processor.to_string(), queue.to_string()));
        Ok(())
    }

    /// One recipient per route registered for the message's topic.
    ///
    /// A message without a topic property cannot be routed; that is a
    /// configuration error, not a retry case.
    pub fn route(&self, message: &Message) -> Result<Vec<Recipient>> {
        let topic = message.topic().ok_or_else(|| {
            Error::Internal(format!(
                "Got message without required parameter: \"{}\"",
                property::TOPIC
            ))
        })?;

        let mut recipients = Vec::new();
        if let Some(routes) = self.routes.get(topic) {
            for (processor, queue) in routes {
                let transport = self.registry.transport_name(queue);
                let mut routed = message.clone();
                routed.set_property(property::PROCESSOR, processor);
                routed.set_property(property::QUEUE, &transport);
                recipients.push(Recipient {
                    queue: transport,
                    message: routed,
                });
            }
        }
        Ok(recipients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> DestinationMetaRegistry {
        DestinationMetaRegistry::new("bulkq.")
    }

    #[test]
    fn test_transport_name_default_prefix() {
        let registry = registry();
        assert_eq!(registry.transport_name("default"), "bulkq.default");
        assert_eq!(registry.transport_name("Update List!"), "bulkq.update_list_");
    }

    #[test]
    fn test_transport_name_override() {
        let mut registry = registry();
        registry.set_destination("default", "app.main");
        assert_eq!(registry.transport_name("default"), "app.main");
        assert_eq!(registry.transport_name("other"), "bulkq.other");
    }

    #[test]
    fn test_add_route_rejects_empty_names() {
        let mut router = Router::new(registry());
        assert!(router.add_route("", "p", "q").is_err());
        assert!(router.add_route("t", "", "q").is_err());
        assert!(router.add_route("t", "p", "").is_err());
    }

    #[test]
    fn test_route_fans_out_to_all_registered_routes() {
        let mut router = Router::new(registry());
        router.add_route("topic.a", "processor1", "default").unwrap();
        router.add_route("topic.a", "processor2", "update_list").unwrap();

        let message = Message::new("topic.a", json!({"k": "v"}));
        let recipients = router.route(&message).unwrap();
        assert_eq!(recipients.len(), 2);

        assert_eq!(recipients[0].queue, "bulkq.default");
        assert_eq!(
            recipients[0].message.property(property::PROCESSOR),
            Some("processor1")
        );
        assert_eq!(
            recipients[0].message.property(property::QUEUE),
            Some("bulkq.default")
        );

        assert_eq!(recipients[1].queue, "bulkq.update_list");
        assert_eq!(
            recipients[1].message.property(property::PROCESSOR),
            Some("processor2")
        );

        // The original message is untouched
        assert_eq!(message.property(property::PROCESSOR), None);
    }

    #[test]
    fn test_route_unknown_topic_yields_nothing() {
        let router = Router::new(registry());
        let message = Message::new("unknown", json!({}));
        assert!(router.route(&message).unwrap().is_empty());
    }

    #[test]
    fn test_route_without_topic_is_an_error() {
        let router = Router::new(registry());
        let mut message = Message::new("t", json!({}));
        message.properties.clear();
        let err = router.route(&message).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
