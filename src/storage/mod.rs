//! Store trait and backend implementations.
//!
//! Both backends expose the same [`Store`] contract and are exercised by the same
//! behavioral test suite.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::StoreConfig;
use crate::core::time::Clock;
use crate::error::ValidationError;
use crate::types::{
    CreateQueueOptions, CreateTopicOptions, GetMessage, Message, MoveMessagesResult, PeekMessagesOptions,
    QueueInfo, ReceiveMessagesOptions, ReceivedMessage, SendMessageEntry, SendMessageOptions,
    SendMessageResult, TopicInfo, TopicProtocol, UpdateMessageOptions,
    DEFAULT_MAX_NUMBER_OF_MESSAGES, DEFAULT_VISIBILITY_TIMEOUT_MS,
};
use crate::Result;

pub mod memory;
pub mod sql;

/// Queue and topic store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run a first sweep and schedule the periodic sweep.
    async fn start(&self) -> Result<()>;

    /// Cancel the periodic sweep and release resources.
    async fn shutdown(&self) -> Result<()>;

    /// Run one sweep pass.
    async fn poll(&self) -> Result<()>;

    /// Remove every queue, topic, subscription and message.
    async fn delete_all_data(&self) -> Result<()>;

    /// Create a queue, or update it in place when `options.upsert` is set.
    async fn create_queue(&self, queue_name: &str, options: CreateQueueOptions) -> Result<()>;

    /// Delete a queue with its messages and subscriptions.
    async fn delete_queue(&self, queue_name: &str) -> Result<()>;

    /// Delete every message of a queue.
    async fn purge_queue(&self, queue_name: &str) -> Result<()>;

    /// Queue configuration and message counts.
    async fn get_queue_info(&self, queue_name: &str) -> Result<QueueInfo>;

    /// All queues, sorted by name.
    async fn get_queue_infos(&self) -> Result<Vec<QueueInfo>>;

    /// Stop delivering messages from a queue.
    async fn pause_queue(&self, queue_name: &str) -> Result<()>;

    /// Resume delivering messages and wake waiting receivers.
    async fn resume_queue(&self, queue_name: &str) -> Result<()>;

    /// Send one message.
    async fn send_message(
        &self,
        queue_name: &str,
        body: &str,
        options: SendMessageOptions,
    ) -> Result<SendMessageResult>;

    /// Send a batch of messages, stopping at the first failure.
    async fn send_messages(
        &self,
        queue_name: &str,
        entries: Vec<SendMessageEntry>,
    ) -> Result<Vec<SendMessageResult>> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            results.push(
                self.send_message(queue_name, &entry.body, entry.options)
                    .await?,
            );
        }
        Ok(results)
    }

    /// Claim up to `max_number_of_messages`, long-polling up to the wait time.
    async fn receive_messages(
        &self,
        queue_name: &str,
        options: ReceiveMessagesOptions,
    ) -> Result<Vec<ReceivedMessage>>;

    /// Claim a single message.
    async fn receive_message(
        &self,
        queue_name: &str,
        options: ReceiveMessagesOptions,
    ) -> Result<Option<ReceivedMessage>> {
        let options = ReceiveMessagesOptions {
            max_number_of_messages: Some(1),
            ..options
        };
        Ok(self
            .receive_messages(queue_name, options)
            .await?
            .into_iter()
            .next())
    }

    /// Messages in delivery order, without claiming them.
    async fn peek_messages(
        &self,
        queue_name: &str,
        options: PeekMessagesOptions,
    ) -> Result<Vec<Message>>;

    /// A message and its position in delivery order.
    async fn get_message(&self, queue_name: &str, message_id: &str) -> Result<GetMessage>;

    /// Change priority, attributes or visibility of a message.
    async fn update_message(
        &self,
        queue_name: &str,
        message_id: &str,
        receipt_handle: Option<&str>,
        options: UpdateMessageOptions,
    ) -> Result<()>;

    /// Hand a message back before its visibility timeout.
    async fn nak_message(
        &self,
        queue_name: &str,
        message_id: &str,
        receipt_handle: &str,
        reason: Option<&str>,
    ) -> Result<()>;

    /// Delete a message, checking the receipt handle when given.
    async fn delete_message(
        &self,
        queue_name: &str,
        message_id: &str,
        receipt_handle: Option<&str>,
    ) -> Result<()>;

    /// Delete the message currently held with `receipt_handle`.
    async fn delete_message_by_receipt_handle(
        &self,
        queue_name: &str,
        receipt_handle: &str,
    ) -> Result<()>;

    /// Reset the visibility deadline of the message held with `receipt_handle`.
    async fn update_message_visibility_by_receipt_handle(
        &self,
        queue_name: &str,
        receipt_handle: &str,
        visibility_timeout_ms: u64,
    ) -> Result<()>;

    /// Move every available message from one queue to another.
    async fn move_messages(
        &self,
        source_queue_name: &str,
        target_queue_name: &str,
    ) -> Result<MoveMessagesResult>;

    /// Create a topic.
    async fn create_topic(&self, topic_name: &str, options: CreateTopicOptions) -> Result<()>;

    /// Delete a topic with its subscriptions.
    async fn delete_topic(&self, topic_name: &str) -> Result<()>;

    /// Topic configuration and subscriptions.
    async fn get_topic_info(&self, topic_name: &str) -> Result<TopicInfo>;

    /// All topics, sorted by name.
    async fn get_topic_infos(&self) -> Result<Vec<TopicInfo>>;

    /// Subscribe a queue to a topic, returning the subscription id.
    async fn subscribe(
        &self,
        topic_name: &str,
        protocol: TopicProtocol,
        queue_name: &str,
    ) -> Result<String>;

    /// Send a message to every queue subscribed to a topic.
    async fn publish_message(
        &self,
        topic_name: &str,
        body: &str,
        options: SendMessageOptions,
    ) -> Result<SendMessageResult>;
}

/// First compared option that differs between an existing queue and a create request.
pub fn queue_options_difference(
    existing: &CreateQueueOptions,
    requested: &CreateQueueOptions,
) -> Option<String> {
    let differs = |field: &str| Some(format!("{} is different", field));

    if existing.dead_letter_queue_name != requested.dead_letter_queue_name {
        return differs("deadLetterQueueName");
    }
    if existing.dead_letter_topic_name != requested.dead_letter_topic_name {
        return differs("deadLetterTopicName");
    }
    if existing.delay_ms != requested.delay_ms {
        return differs("delayMs");
    }
    if existing.message_retention_period_ms != requested.message_retention_period_ms {
        return differs("messageRetentionPeriodMs");
    }
    if existing.visibility_timeout_ms != requested.visibility_timeout_ms {
        return differs("visibilityTimeoutMs");
    }
    if existing.receive_message_wait_time_ms != requested.receive_message_wait_time_ms {
        return differs("receiveMessageWaitTimeMs");
    }
    if existing.expires_ms != requested.expires_ms {
        return differs("expiresMs");
    }
    if existing.max_receive_count != requested.max_receive_count {
        return differs("maxReceiveCount");
    }
    if existing.max_message_size != requested.max_message_size {
        return differs("maxMessageSize");
    }
    if existing.tags != requested.tags {
        return Some("tags are different".to_string());
    }
    if existing.nak_expire_behavior.unwrap_or_default()
        != requested.nak_expire_behavior.unwrap_or_default()
    {
        return differs("nakExpireBehavior");
    }
    None
}

/// Receive parameters with queue defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReceiveSettings {
    pub max_number_of_messages: usize,
    pub visibility_timeout_ms: u64,
    pub wait: Duration,
}

impl ReceiveSettings {
    pub(crate) fn resolve(
        options: &ReceiveMessagesOptions,
        queue: &CreateQueueOptions,
    ) -> Result<Self> {
        let max_number_of_messages = options
            .max_number_of_messages
            .unwrap_or(DEFAULT_MAX_NUMBER_OF_MESSAGES);
        if max_number_of_messages == 0 {
            return Err(ValidationError::InvalidParameter {
                name: "maxNumberOfMessages".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }

        Ok(Self {
            max_number_of_messages,
            visibility_timeout_ms: options
                .visibility_timeout_ms
                .or(queue.visibility_timeout_ms)
                .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_MS),
            wait: Duration::from_millis(
                options
                    .wait_time_ms
                    .or(queue.receive_message_wait_time_ms)
                    .unwrap_or(0),
            ),
        })
    }
}

/// Sort key used for queue and topic listings.
pub(crate) fn listing_order(a: &str, b: &str) -> std::cmp::Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

/// Build the store described by `config`.
///
/// The store is not started; call [`Store::start`] to run the sweep.
pub async fn connect(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn Store>> {
    info!(backend = config.backend_name(), "Connecting store");
    match config {
        StoreConfig::Memory { .. } => Ok(Arc::new(memory::MemoryStore::new(
            clock,
            config.poll_interval(),
        ))),
        StoreConfig::Sqlite {
            database_url,
            max_connections,
            ..
        }
        | StoreConfig::Postgres {
            database_url,
            max_connections,
            ..
        } => {
            let store = sql::SqlStore::connect(
                sql::SqlStoreOptions {
                    database_url: database_url.clone(),
                    max_connections: *max_connections,
                    poll_interval: config.poll_interval(),
                },
                clock,
            )
            .await?;
            Ok(Arc::new(store))
        }
    }
}
