//! Queue configuration cache shared by a store and its notification listener.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::trace;

use crate::types::CreateQueueOptions;

/// Queue options by queue name.
///
/// Local mutations write through, notifications invalidate entries and every
/// sweep replaces the whole map. Entries may lag changes made by other
/// processes by up to one poll interval when notifications are unavailable.
#[derive(Debug, Default)]
pub struct QueueCache {
    entries: RwLock<HashMap<String, CreateQueueOptions>>,
}

impl QueueCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached options of `queue_name`, if any.
    pub fn get(&self, queue_name: &str) -> Option<CreateQueueOptions> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(queue_name).cloned()
    }

    /// Store the options of `queue_name`.
    pub fn put(&self, queue_name: &str, options: CreateQueueOptions) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(queue_name.to_string(), options);
    }

    /// Drop the entry of `queue_name`.
    pub fn invalidate(&self, queue_name: &str) {
        trace!(queue_name = %queue_name, "Invalidating cached queue options");
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(queue_name);
    }

    /// Replace every entry.
    pub fn replace_all(&self, queues: impl IntoIterator<Item = (String, CreateQueueOptions)>) {
        let fresh: HashMap<_, _> = queues.into_iter().collect();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        *entries = fresh;
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }
}
