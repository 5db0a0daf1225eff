//! Error types for nexq.

use thiserror::Error;

/// Result type for nexq operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nexq.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Storage backend error.
    #[error("storage error: {0}")]
    StorageError(String),

    /// Queue not found.
    #[error("queue \"{0}\" not found")]
    QueueNotFound(String),

    /// Topic not found.
    #[error("topic \"{0}\" not found")]
    TopicNotFound(String),

    /// Message id is not present in the queue.
    #[error("message id \"{message_id}\" is invalid for queue \"{queue_name}\"")]
    MessageNotFound {
        /// Queue that was searched.
        queue_name: String,
        /// Message id that was not found.
        message_id: String,
    },

    /// The message exists but the receipt handle doesn't match its current holder.
    #[error("receipt handle \"{receipt_handle}\" is invalid for queue \"{queue_name}\"")]
    ReceiptHandleInvalid {
        /// Queue that was searched.
        queue_name: String,
        /// Offending receipt handle.
        receipt_handle: String,
    },

    /// Queue name reused with incompatible options.
    #[error("queue \"{name}\" already exists: {reason}")]
    QueueAlreadyExists {
        /// Queue name.
        name: String,
        /// First option that differs.
        reason: String,
    },

    /// Topic name reused with incompatible options.
    #[error("topic \"{name}\" already exists: {reason}")]
    TopicAlreadyExists {
        /// Topic name.
        name: String,
        /// First option that differs.
        reason: String,
    },

    /// Message body larger than the queue allows.
    #[error("message of size {size} exceeded the maximum message size of {max}")]
    MessageExceededMaxMessageSize {
        /// Body length in bytes.
        size: usize,
        /// Queue maximum in bytes.
        max: usize,
    },

    /// Update that can't be applied to the message.
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    /// Queue is still configured as another queue's dead letter queue.
    #[error("cannot delete dead letter queue \"{dead_letter_queue_name}\", associated with queue \"{queue_name}\"")]
    DeleteDeadLetterQueue {
        /// Queue that was asked to be deleted.
        dead_letter_queue_name: String,
        /// Queue referencing it.
        queue_name: String,
    },

    /// Topic is still configured as a queue's dead letter topic.
    #[error("cannot delete dead letter topic \"{dead_letter_topic_name}\", associated with queue \"{queue_name}\"")]
    DeleteDeadLetterTopic {
        /// Topic that was asked to be deleted.
        dead_letter_topic_name: String,
        /// Queue referencing it.
        queue_name: String,
    },

    /// Message id or deduplication id already present in the queue.
    #[error("duplicate message \"{id}\" in queue \"{queue_name}\"")]
    DuplicateMessage {
        /// Queue the message was sent to.
        queue_name: String,
        /// Conflicting message id or deduplication id.
        id: String,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn message_not_found(queue_name: &str, message_id: &str) -> Self {
        Self::MessageNotFound {
            queue_name: queue_name.to_string(),
            message_id: message_id.to_string(),
        }
    }

    pub(crate) fn receipt_handle_invalid(queue_name: &str, receipt_handle: &str) -> Self {
        Self::ReceiptHandleInvalid {
            queue_name: queue_name.to_string(),
            receipt_handle: receipt_handle.to_string(),
        }
    }

    pub(crate) fn duplicate_message(queue_name: &str, id: &str) -> Self {
        Self::DuplicateMessage {
            queue_name: queue_name.to_string(),
            id: id.to_string(),
        }
    }
}

/// Validation error types.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Invalid queue name.
    #[error("invalid queue name: {0}")]
    InvalidQueueName(String),

    /// Invalid topic name.
    #[error("invalid topic name: {0}")]
    InvalidTopicName(String),

    /// Invalid parameter.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// Reason for invalidity.
        reason: String,
    },
}
