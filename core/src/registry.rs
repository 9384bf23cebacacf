//! Topic registry: which handler runs for which topic.
//!
//! The registry is insertion-ordered so the topic list handed to the broker is
//! stable across runs. It is mutable only during setup; the gateway freezes it
//! into an `Arc<TopicRegistry>` when it starts, and the consume path only ever
//! reads the frozen copy.

use crate::handler::Handler;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// What to do when a topic is registered twice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// The last registration wins; the topic keeps its original position
    #[default]
    Replace,
    /// A second registration is an error
    Reject,
}

/// Registration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The topic already has a handler and duplicates are rejected
    #[error("A handler is already registered for topic '{0}'")]
    DuplicateTopic(String),
}

/// One topic → handler binding.
#[derive(Clone)]
pub struct ConsumerBinding {
    topic: String,
    handler: Arc<dyn Handler>,
}

impl ConsumerBinding {
    /// Topic this binding consumes.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Handler invoked for every message of the topic.
    #[must_use]
    pub const fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }
}

impl fmt::Debug for ConsumerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerBinding")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// Insertion-ordered mapping from topic name to handler.
#[derive(Clone, Default)]
pub struct TopicRegistry {
    bindings: Vec<ConsumerBinding>,
    index: HashMap<String, usize>,
    policy: DuplicatePolicy,
}

impl TopicRegistry {
    /// Create an empty registry with the given duplicate policy.
    #[must_use]
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            bindings: Vec::new(),
            index: HashMap::new(),
            policy,
        }
    }

    /// Duplicate policy in effect.
    #[must_use]
    pub const fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Bind `handler` to `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateTopic`] if the topic is already bound
    /// and the policy is [`DuplicatePolicy::Reject`].
    pub fn register(
        &mut self,
        topic: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistryError> {
        let topic = topic.into();

        if let Some(&position) = self.index.get(&topic) {
            return match self.policy {
                DuplicatePolicy::Reject => Err(RegistryError::DuplicateTopic(topic)),
                DuplicatePolicy::Replace => {
                    self.bindings[position].handler = handler;
                    Ok(())
                },
            };
        }

        self.index.insert(topic.clone(), self.bindings.len());
        self.bindings.push(ConsumerBinding { topic, handler });
        Ok(())
    }

    /// Handler bound to `topic`, if any.
    #[must_use]
    pub fn get(&self, topic: &str) -> Option<&Arc<dyn Handler>> {
        self.index
            .get(topic)
            .map(|&position| &self.bindings[position].handler)
    }

    /// Registered topics, in registration order, without duplicates.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.bindings.iter().map(|b| b.topic.clone()).collect()
    }

    /// Iterate over the bindings in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ConsumerBinding> {
        self.bindings.iter()
    }

    /// Number of bound topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether no topic is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicRegistry")
            .field("topics", &self.topics())
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::handler::MessageContext;
    use proptest::prelude::*;

    fn ok_handler() -> Arc<dyn Handler> {
        Arc::new(|_ctx: MessageContext, _payload: Vec<u8>| async { Ok::<(), anyhow::Error>(()) })
    }

    fn failing_handler() -> Arc<dyn Handler> {
        Arc::new(|_ctx: MessageContext, _payload: Vec<u8>| async {
            Err::<(), anyhow::Error>(anyhow::anyhow!("boom"))
        })
    }

    fn ctx() -> MessageContext {
        MessageContext {
            topic: "orders".to_string(),
            partition: 0,
            offset: 0,
            key: None,
            timestamp: None,
        }
    }

    #[test]
    fn lookup_misses_unknown_topic() {
        let mut registry = TopicRegistry::default();
        registry.register("orders", ok_handler()).unwrap();

        assert!(registry.get("orders").is_some());
        assert!(registry.get("payments").is_none());
    }

    #[tokio::test]
    async fn replace_policy_keeps_last_handler_and_position() {
        let mut registry = TopicRegistry::new(DuplicatePolicy::Replace);
        registry.register("orders", ok_handler()).unwrap();
        registry.register("payments", ok_handler()).unwrap();
        registry.register("orders", failing_handler()).unwrap();

        assert_eq!(registry.topics(), vec!["orders", "payments"]);
        let handler = registry.get("orders").unwrap();
        assert!(handler.handle(ctx(), Vec::new()).await.is_err());
    }

    #[test]
    fn reject_policy_refuses_duplicates() {
        let mut registry = TopicRegistry::new(DuplicatePolicy::Reject);
        registry.register("orders", ok_handler()).unwrap();

        let err = registry.register("orders", ok_handler()).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateTopic("orders".to_string()));
        assert_eq!(registry.len(), 1);
    }

    proptest! {
        #[test]
        fn topics_are_distinct_and_in_first_registration_order(
            names in proptest::collection::vec("[a-d]{1,2}", 0..20)
        ) {
            let mut registry = TopicRegistry::default();
            for name in &names {
                registry.register(name.clone(), ok_handler()).unwrap();
            }

            let mut expected: Vec<String> = Vec::new();
            for name in &names {
                if !expected.contains(name) {
                    expected.push(name.clone());
                }
            }
            prop_assert_eq!(registry.topics(), expected);
        }
    }
}
