//! Common data types for nexq.

pub mod validation;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Message attributes (string map).
pub type MessageAttributes = HashMap<String, String>;

/// Queue and topic tags.
pub type Tags = HashMap<String, String>;

/// Default number of messages returned by a receive call.
pub const DEFAULT_MAX_NUMBER_OF_MESSAGES: usize = 10;

/// Default visibility timeout when neither the call nor the queue set one.
pub const DEFAULT_VISIBILITY_TIMEOUT_MS: u64 = 30_000;

/// What happens to a message whose visibility timeout expired (or was naked)
/// while it still has delivery attempts left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum NakExpireBehavior {
    /// Leave the message where it is.
    #[default]
    Retry,
    /// Re-stamp the ordering key so the message goes to the tail.
    MoveToEnd,
    /// Subtract from the message priority. There is no floor.
    DecreasePriorityBy(i64),
}

impl NakExpireBehavior {
    /// Serialize to the JSON form stored by the SQL backend.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the JSON form stored by the SQL backend.
    pub fn from_json(s: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Subscription protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum TopicProtocol {
    /// Deliver published messages into a queue.
    #[default]
    Queue,
}

impl TopicProtocol {
    /// Name used in storage and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicProtocol::Queue => "queue",
        }
    }
}

/// Options for creating (or upserting) a queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateQueueOptions {
    /// Update the queue in place if it already exists.
    pub upsert: bool,
    /// Queue receiving exhausted messages.
    pub dead_letter_queue_name: Option<String>,
    /// Topic receiving exhausted messages.
    pub dead_letter_topic_name: Option<String>,
    /// Default delay applied to sent messages.
    pub delay_ms: Option<u64>,
    /// How long a message is kept after it is sent.
    pub message_retention_period_ms: Option<u64>,
    /// Default visibility timeout for receives.
    pub visibility_timeout_ms: Option<u64>,
    /// Default long-poll wait for receives.
    pub receive_message_wait_time_ms: Option<u64>,
    /// Delete the queue after this long without a receive.
    pub expires_ms: Option<u64>,
    /// Delivery attempts before a message is dead-lettered or dropped.
    pub max_receive_count: Option<u32>,
    /// Maximum body length in bytes.
    pub max_message_size: Option<usize>,
    /// Behavior for expired or naked messages.
    pub nak_expire_behavior: Option<NakExpireBehavior>,
    /// Queue tags.
    pub tags: Tags,
}

/// Queue configuration and message counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    /// Queue name.
    pub name: String,
    /// Messages available for receive.
    pub number_of_messages: u64,
    /// Messages waiting for their delay to pass.
    pub number_of_messages_delayed: u64,
    /// Messages currently held by a receiver.
    pub number_of_messages_not_visible: u64,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Last configuration change.
    pub last_modified: DateTime<Utc>,
    /// Default delay.
    pub delay_ms: Option<u64>,
    /// Idle expiry.
    pub expires_ms: Option<u64>,
    /// When the queue will be deleted if it stays idle.
    pub expires_at: Option<DateTime<Utc>>,
    /// Maximum body length.
    pub max_message_size: Option<usize>,
    /// Retention period.
    pub message_retention_period_ms: Option<u64>,
    /// Default long-poll wait.
    pub receive_message_wait_time_ms: Option<u64>,
    /// Default visibility timeout.
    pub visibility_timeout_ms: Option<u64>,
    /// Nak/expire behavior.
    pub nak_expire_behavior: NakExpireBehavior,
    /// Tags.
    pub tags: Tags,
    /// Dead letter queue.
    pub dead_letter_queue_name: Option<String>,
    /// Dead letter topic.
    pub dead_letter_topic_name: Option<String>,
    /// Delivery attempts budget.
    pub max_receive_count: Option<u32>,
    /// Whether receives are suspended.
    pub paused: bool,
}

/// Options for creating a topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateTopicOptions {
    /// Topic tags.
    pub tags: Tags,
}

/// A topic subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    /// Subscription id.
    pub id: String,
    /// Delivery protocol.
    pub protocol: TopicProtocol,
    /// Target queue.
    pub queue_name: String,
}

/// Topic configuration and subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicInfo {
    /// Topic name.
    pub name: String,
    /// Tags.
    pub tags: Tags,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Last configuration change.
    pub last_modified: DateTime<Utc>,
    /// Subscriptions ordered by queue name.
    pub subscriptions: Vec<SubscriptionInfo>,
}

/// Options for sending a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendMessageOptions {
    /// Message attributes.
    pub attributes: MessageAttributes,
    /// Delay before the message becomes available; defaults to the queue delay.
    pub delay_ms: Option<u64>,
    /// Priority, higher is delivered first.
    pub priority: i64,
    /// Rejects the send while another undelivered message carries the same id.
    pub deduplication_id: Option<String>,
}

/// One entry of a batch send.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageEntry {
    /// Message body.
    pub body: String,
    /// Send options.
    #[serde(default)]
    pub options: SendMessageOptions,
}

/// Result of a send or publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResult {
    /// Assigned message id.
    pub id: String,
}

/// Options for receiving messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReceiveMessagesOptions {
    /// Maximum number of messages to claim, defaults to 10.
    pub max_number_of_messages: Option<usize>,
    /// Visibility timeout for the claimed messages.
    pub visibility_timeout_ms: Option<u64>,
    /// Long-poll budget.
    pub wait_time_ms: Option<u64>,
}

/// Options for peeking at messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeekMessagesOptions {
    /// Maximum number of messages to return.
    pub max_number_of_messages: usize,
    /// Include messages held by a receiver.
    pub include_not_visible: bool,
    /// Include delayed messages.
    pub include_delayed: bool,
}

impl Default for PeekMessagesOptions {
    fn default() -> Self {
        Self {
            max_number_of_messages: DEFAULT_MAX_NUMBER_OF_MESSAGES,
            include_not_visible: false,
            include_delayed: false,
        }
    }
}

/// Options for updating a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateMessageOptions {
    /// New priority.
    pub priority: Option<i64>,
    /// Replacement attributes.
    pub attributes: Option<MessageAttributes>,
    /// New visibility timeout counted from now; requires a receipt handle.
    pub visibility_timeout_ms: Option<u64>,
}

/// A message as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message id, unique within its queue.
    pub id: String,
    /// Message body.
    pub body: String,
    /// Time the message was sent to this queue.
    pub sent_time: DateTime<Utc>,
    /// Priority.
    pub priority: i64,
    /// Attributes.
    pub attributes: MessageAttributes,
    /// Time the message becomes available.
    pub delay_until: Option<DateTime<Utc>>,
    /// Whether the message can be received right now.
    pub is_available: bool,
    /// Delivery attempts so far.
    pub receive_count: u32,
    /// Visibility deadline of the current holder.
    pub expires_at: Option<DateTime<Utc>>,
    /// Handle of the current holder.
    pub receipt_handle: Option<String>,
    /// First delivery time.
    pub first_received_at: Option<DateTime<Utc>>,
    /// Reason given by the last nak.
    pub last_nak_reason: Option<String>,
}

/// A message claimed by a receive call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    /// The message.
    #[serde(flatten)]
    pub message: Message,
    /// Receipt handle proving possession.
    pub receipt_handle: String,
}

/// A message with its position in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMessage {
    /// The message.
    #[serde(flatten)]
    pub message: Message,
    /// Zero-based position in delivery order.
    pub position_in_queue: u64,
}

/// Result of moving messages between queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveMessagesResult {
    /// Number of messages moved.
    pub moved_message_count: u64,
}
