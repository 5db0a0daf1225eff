//! In-memory topic and its queue subscriptions.

use chrono::{DateTime, Utc};

use crate::core::receipt::new_id;
use crate::types::{CreateTopicOptions, SubscriptionInfo, Tags, TopicInfo, TopicProtocol};

/// In-memory topic.
#[derive(Debug)]
pub struct MemoryTopic {
    pub(crate) name: String,
    pub(crate) tags: Tags,
    created: DateTime<Utc>,
    last_modified: DateTime<Utc>,
    subscriptions: Vec<SubscriptionInfo>,
}

impl MemoryTopic {
    pub(crate) fn new(name: &str, options: CreateTopicOptions, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            tags: options.tags,
            created: now,
            last_modified: now,
            subscriptions: Vec::new(),
        }
    }

    /// Subscribe a queue. An existing subscription of the same queue is reused.
    pub(crate) fn subscribe_queue(&mut self, queue_name: &str) -> String {
        if let Some(existing) = self
            .subscriptions
            .iter()
            .find(|s| s.queue_name == queue_name)
        {
            return existing.id.clone();
        }

        let id = new_id();
        self.subscriptions.push(SubscriptionInfo {
            id: id.clone(),
            protocol: TopicProtocol::Queue,
            queue_name: queue_name.to_string(),
        });
        self.subscriptions
            .sort_by(|a, b| a.queue_name.cmp(&b.queue_name));
        id
    }

    /// Drop subscriptions of a deleted queue.
    pub(crate) fn remove_queue(&mut self, queue_name: &str) {
        self.subscriptions.retain(|s| s.queue_name != queue_name);
    }

    pub(crate) fn queue_names(&self) -> Vec<String> {
        self.subscriptions
            .iter()
            .map(|s| s.queue_name.clone())
            .collect()
    }

    pub(crate) fn info(&self) -> TopicInfo {
        TopicInfo {
            name: self.name.clone(),
            tags: self.tags.clone(),
            created: self.created,
            last_modified: self.last_modified,
            subscriptions: self.subscriptions.clone(),
        }
    }
}
