//! Row mapping between the SQL schema and nexq types.

use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::{Any, Decode, Row, Type};

use crate::core::lifecycle::MessageState;
use crate::core::time::from_millis;
use crate::types::{
    CreateQueueOptions, Message, MessageAttributes, NakExpireBehavior, QueueInfo, SubscriptionInfo,
    Tags, TopicInfo,
};
use crate::{Error, Result};

/// Queue columns, in [`QueueRow::from_row`] order.
pub(crate) const QUEUE_COLUMNS: &str = "name, created_at, last_modified_at, expires_at, paused, \
    dead_letter_queue_name, dead_letter_topic_name, delay_ms, message_retention_period_ms, \
    visibility_timeout_ms, receive_message_wait_time_ms, expires_ms, max_receive_count, \
    max_message_size, nak_expire_behavior, tags";

/// Message columns, in [`MessageRow::from_row`] order.
pub(crate) const MESSAGE_COLUMNS: &str = "id, queue_name, priority, sent_at, order_by, \
    retain_until, message_body, receive_count, attributes, expires_at, delay_until, \
    receipt_handle, first_received_at, last_nak_reason, deduplication_id";

/// Map a driver error to [`Error::StorageError`] with the failed action.
pub(crate) fn db_error(action: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::StorageError(format!("Failed to {}: {}", action, e))
}

/// Map a message insert error. Key conflicts are duplicates, a missing
/// parent row means the queue is gone.
pub(crate) fn insert_error(queue_name: &str, message_id: &str, e: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return Error::duplicate_message(queue_name, message_id);
        }
        if db.is_foreign_key_violation() {
            return Error::QueueNotFound(queue_name.to_string());
        }
    }
    Error::StorageError(format!("Failed to insert message: {}", e))
}

pub(crate) fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn opt_time(value: Option<i64>) -> Option<DateTime<Utc>> {
    value.map(from_millis)
}

/// Column value of an unsigned setting, saturating at `i64::MAX`.
pub(crate) fn column_u64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn opt_u64(value: Option<i64>) -> Option<u64> {
    value.map(|v| v.max(0) as u64)
}

fn col<'r, T>(row: &'r AnyRow, name: &str) -> Result<T>
where
    T: Decode<'r, Any> + Type<Any>,
{
    row.try_get(name)
        .map_err(|e| Error::StorageError(format!("Failed to decode column {}: {}", name, e)))
}

pub(crate) fn encode_tags(tags: &Tags) -> Result<String> {
    Ok(serde_json::to_string(tags)?)
}

pub(crate) fn encode_attributes(attributes: &MessageAttributes) -> Result<String> {
    Ok(serde_json::to_string(attributes)?)
}

/// Bindable column values of a queue's options.
#[derive(Debug)]
pub(crate) struct QueueOptionColumns {
    pub dead_letter_queue_name: Option<String>,
    pub dead_letter_topic_name: Option<String>,
    pub delay_ms: Option<i64>,
    pub message_retention_period_ms: Option<i64>,
    pub visibility_timeout_ms: Option<i64>,
    pub receive_message_wait_time_ms: Option<i64>,
    pub expires_ms: Option<i64>,
    pub max_receive_count: Option<i64>,
    pub max_message_size: Option<i64>,
    pub nak_expire_behavior: String,
    pub tags: String,
}

impl QueueOptionColumns {
    pub(crate) fn new(options: &CreateQueueOptions) -> Result<Self> {
        Ok(Self {
            dead_letter_queue_name: options.dead_letter_queue_name.clone(),
            dead_letter_topic_name: options.dead_letter_topic_name.clone(),
            delay_ms: options.delay_ms.map(column_u64),
            message_retention_period_ms: options.message_retention_period_ms.map(column_u64),
            visibility_timeout_ms: options.visibility_timeout_ms.map(column_u64),
            receive_message_wait_time_ms: options.receive_message_wait_time_ms.map(column_u64),
            expires_ms: options.expires_ms.map(column_u64),
            max_receive_count: options.max_receive_count.map(i64::from),
            max_message_size: options.max_message_size.map(|v| column_u64(v as u64)),
            nak_expire_behavior: options.nak_expire_behavior.unwrap_or_default().to_json()?,
            tags: encode_tags(&options.tags)?,
        })
    }
}

/// A `nexq_queue` row.
#[derive(Debug, Clone)]
pub(crate) struct QueueRow {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub paused: bool,
    pub options: CreateQueueOptions,
}

impl QueueRow {
    pub(crate) fn from_row(row: &AnyRow) -> Result<Self> {
        let nak_expire_behavior: String = col(row, "nak_expire_behavior")?;
        let tags: String = col(row, "tags")?;
        Ok(Self {
            name: col(row, "name")?,
            created_at: from_millis(col(row, "created_at")?),
            last_modified_at: from_millis(col(row, "last_modified_at")?),
            expires_at: opt_time(col(row, "expires_at")?),
            paused: col::<i64>(row, "paused")? != 0,
            options: CreateQueueOptions {
                upsert: false,
                dead_letter_queue_name: col(row, "dead_letter_queue_name")?,
                dead_letter_topic_name: col(row, "dead_letter_topic_name")?,
                delay_ms: opt_u64(col(row, "delay_ms")?),
                message_retention_period_ms: opt_u64(col(row, "message_retention_period_ms")?),
                visibility_timeout_ms: opt_u64(col(row, "visibility_timeout_ms")?),
                receive_message_wait_time_ms: opt_u64(col(row, "receive_message_wait_time_ms")?),
                expires_ms: opt_u64(col(row, "expires_ms")?),
                max_receive_count: col::<Option<i64>>(row, "max_receive_count")?
                    .map(|v| v.clamp(0, u32::MAX as i64) as u32),
                max_message_size: col::<Option<i64>>(row, "max_message_size")?
                    .map(|v| v.max(0) as usize),
                nak_expire_behavior: Some(NakExpireBehavior::from_json(&nak_expire_behavior)?),
                tags: serde_json::from_str(&tags)?,
            },
        })
    }

    pub(crate) fn info(&self, counts: MessageCounts) -> QueueInfo {
        let options = &self.options;
        QueueInfo {
            name: self.name.clone(),
            number_of_messages: counts.available,
            number_of_messages_delayed: counts.delayed,
            number_of_messages_not_visible: counts.not_visible,
            created: self.created_at,
            last_modified: self.last_modified_at,
            delay_ms: options.delay_ms,
            expires_ms: options.expires_ms,
            expires_at: self.expires_at,
            max_message_size: options.max_message_size,
            message_retention_period_ms: options.message_retention_period_ms,
            receive_message_wait_time_ms: options.receive_message_wait_time_ms,
            visibility_timeout_ms: options.visibility_timeout_ms,
            nak_expire_behavior: options.nak_expire_behavior.unwrap_or_default(),
            tags: options.tags.clone(),
            dead_letter_queue_name: options.dead_letter_queue_name.clone(),
            dead_letter_topic_name: options.dead_letter_topic_name.clone(),
            max_receive_count: options.max_receive_count,
            paused: self.paused,
        }
    }
}

/// Message counts by state, see [`MessageCounts::QUERY`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MessageCounts {
    pub available: u64,
    pub delayed: u64,
    pub not_visible: u64,
}

impl MessageCounts {
    /// Binds: now five times, then the queue name.
    pub(crate) const QUERY: &'static str = "SELECT \
        COUNT(CASE WHEN (expires_at IS NULL OR expires_at < ?) \
            AND (delay_until IS NULL OR delay_until <= ?) THEN 1 END) AS available, \
        COUNT(CASE WHEN (expires_at IS NULL OR expires_at < ?) \
            AND delay_until > ? THEN 1 END) AS delayed, \
        COUNT(CASE WHEN expires_at >= ? THEN 1 END) AS not_visible \
        FROM nexq_message WHERE queue_name = ?";

    pub(crate) fn from_row(row: &AnyRow) -> Result<Self> {
        Ok(Self {
            available: col::<i64>(row, "available")?.max(0) as u64,
            delayed: col::<i64>(row, "delayed")?.max(0) as u64,
            not_visible: col::<i64>(row, "not_visible")?.max(0) as u64,
        })
    }
}

/// A `nexq_message` row.
#[derive(Debug, Clone)]
pub(crate) struct MessageRow {
    pub id: String,
    pub priority: i64,
    pub sent_at: i64,
    pub order_by: i64,
    pub body: String,
    pub receive_count: i64,
    pub attributes: String,
    pub expires_at: Option<i64>,
    pub delay_until: Option<i64>,
    pub receipt_handle: Option<String>,
    pub first_received_at: Option<i64>,
    pub last_nak_reason: Option<String>,
}

impl MessageRow {
    pub(crate) fn from_row(row: &AnyRow) -> Result<Self> {
        Ok(Self {
            id: col(row, "id")?,
            priority: col(row, "priority")?,
            sent_at: col(row, "sent_at")?,
            order_by: col(row, "order_by")?,
            body: col(row, "message_body")?,
            receive_count: col(row, "receive_count")?,
            attributes: col(row, "attributes")?,
            expires_at: col(row, "expires_at")?,
            delay_until: col(row, "delay_until")?,
            receipt_handle: col(row, "receipt_handle")?,
            first_received_at: col(row, "first_received_at")?,
            last_nak_reason: col(row, "last_nak_reason")?,
        })
    }

    pub(crate) fn attributes(&self) -> Result<MessageAttributes> {
        Ok(serde_json::from_str(&self.attributes)?)
    }

    pub(crate) fn state(&self, now: DateTime<Utc>) -> MessageState {
        MessageState::classify(
            now,
            opt_time(self.expires_at),
            opt_time(self.delay_until),
        )
    }

    pub(crate) fn to_message(&self, now: DateTime<Utc>) -> Result<Message> {
        Ok(Message {
            id: self.id.clone(),
            body: self.body.clone(),
            sent_time: from_millis(self.sent_at),
            priority: self.priority,
            attributes: self.attributes()?,
            delay_until: opt_time(self.delay_until),
            is_available: self.state(now) == MessageState::Available,
            receive_count: self.receive_count.max(0) as u32,
            expires_at: opt_time(self.expires_at),
            receipt_handle: self.receipt_handle.clone(),
            first_received_at: opt_time(self.first_received_at),
            last_nak_reason: self.last_nak_reason.clone(),
        })
    }
}

/// A `nexq_topic` row, without subscriptions.
#[derive(Debug, Clone)]
pub(crate) struct TopicRow {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub tags: Tags,
}

impl TopicRow {
    pub(crate) const COLUMNS: &'static str = "name, created_at, last_modified_at, tags";

    pub(crate) fn from_row(row: &AnyRow) -> Result<Self> {
        let tags: String = col(row, "tags")?;
        Ok(Self {
            name: col(row, "name")?,
            created_at: from_millis(col(row, "created_at")?),
            last_modified_at: from_millis(col(row, "last_modified_at")?),
            tags: serde_json::from_str(&tags)?,
        })
    }

    pub(crate) fn info(self, subscriptions: Vec<SubscriptionInfo>) -> TopicInfo {
        TopicInfo {
            name: self.name,
            tags: self.tags,
            created: self.created_at,
            last_modified: self.last_modified_at,
            subscriptions,
        }
    }
}

pub(crate) fn subscription_from_row(row: &AnyRow) -> Result<SubscriptionInfo> {
    let protocol: String = col(row, "protocol")?;
    Ok(SubscriptionInfo {
        id: col(row, "id")?,
        protocol: serde_json::from_value(serde_json::Value::String(protocol))?,
        queue_name: col(row, "queue_name")?,
    })
}
