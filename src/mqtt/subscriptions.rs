//! Ordered, topic-unique set of subscriptions

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use super::config::QoS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub topic: String,
    #[serde(default)]
    pub qos: QoS,
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (QoS {})", self.topic, self.qos)
    }
}

/// Topics the session wants to receive, in the order they were added.
///
/// The topic string is the key: adding a topic that is already present
/// leaves the registry untouched, including the stored QoS. The registry
/// knows nothing about the connection; the session decides whether a change
/// also goes to the broker.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the topic was added.
    pub fn add(&mut self, topic: &str, qos: QoS) -> bool {
        if topic.trim().is_empty() {
            debug!("Ignoring empty subscription topic");
            return false;
        }
        if self.contains(topic) {
            debug!("Already subscribed to {}", topic);
            return false;
        }
        self.entries.push(Subscription {
            topic: topic.to_string(),
            qos,
        });
        true
    }

    /// Returns the removed entry, if the topic was present.
    pub fn remove(&mut self, topic: &str) -> Option<Subscription> {
        let idx = self.entries.iter().position(|s| s.topic == topic)?;
        Some(self.entries.remove(idx))
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries.iter().any(|s| s.topic == topic)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[Subscription] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn keeps_insertion_order() {
        let mut registry = SubscriptionRegistry::new();
        registry.add("b/#", QoS::AtMostOnce);
        registry.add("a/+", QoS::ExactlyOnce);
        registry.add("c", QoS::AtLeastOnce);

        let topics: Vec<_> = registry.iter().map(|s| s.topic.as_str()).collect();
        assert_eq!(topics, vec!["b/#", "a/+", "c"]);
    }

    #[test]
    fn duplicate_topic_keeps_first_qos() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.add("sensors/#", QoS::AtLeastOnce));
        assert!(!registry.add("sensors/#", QoS::ExactlyOnce));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.as_slice()[0].qos, QoS::AtLeastOnce);
    }

    #[test]
    fn empty_topic_is_ignored() {
        let mut registry = SubscriptionRegistry::new();
        assert!(!registry.add("", QoS::AtMostOnce));
        assert!(!registry.add("   ", QoS::AtMostOnce));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_missing_topic_is_noop() {
        let mut registry = SubscriptionRegistry::new();
        registry.add("a", QoS::AtMostOnce);
        assert_eq!(registry.remove("b"), None);
        assert_eq!(registry.len(), 1);

        let removed = registry.remove("a").unwrap();
        assert_eq!(removed.topic, "a");
        assert!(registry.is_empty());
    }

    proptest! {
        #[test]
        fn distinct_topics_are_all_kept(t1 in "[a-z/#+]{1,16}", t2 in "[a-z/#+]{1,16}") {
            prop_assume!(t1 != t2);
            let mut registry = SubscriptionRegistry::new();
            registry.add(&t1, QoS::AtMostOnce);
            registry.add(&t2, QoS::AtMostOnce);
            prop_assert_eq!(registry.len(), 2);
        }

        #[test]
        fn same_topic_twice_is_kept_once(t in "[a-z/#+]{1,16}") {
            let mut registry = SubscriptionRegistry::new();
            registry.add(&t, QoS::AtMostOnce);
            registry.add(&t, QoS::AtLeastOnce);
            prop_assert_eq!(registry.len(), 1);
        }
    }
}
