//! Validation functions for queue names, topic names and options.

use crate::error::ValidationError;
use crate::types::CreateQueueOptions;
use crate::{Error, Result};

/// Maximum length of a queue or topic name.
pub const MAX_NAME_LENGTH: usize = 256;

/// Trim and validate a queue name (1-256 chars, alphanumeric plus `-`, `_` and `.`).
pub fn normalize_queue_name(name: &str) -> Result<String> {
    let name = name.trim();
    check_name(name).map_err(ValidationError::InvalidQueueName)?;
    Ok(name.to_string())
}

/// Trim and validate a topic name, same rules as queue names.
pub fn normalize_topic_name(name: &str) -> Result<String> {
    let name = name.trim();
    check_name(name).map_err(ValidationError::InvalidTopicName)?;
    Ok(name.to_string())
}

fn check_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("name cannot be empty".to_string());
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(format!(
            "name must be at most {} characters, got {}",
            MAX_NAME_LENGTH,
            name.len()
        ));
    }
    for ch in name.chars() {
        if !ch.is_alphanumeric() && ch != '-' && ch != '_' && ch != '.' {
            return Err(format!("name contains invalid character: '{}'", ch));
        }
    }
    Ok(())
}

/// Validate create-queue options against the queue they are for.
pub fn validate_create_queue_options(queue_name: &str, options: &CreateQueueOptions) -> Result<()> {
    if options.dead_letter_queue_name.as_deref() == Some(queue_name) {
        return Err(ValidationError::InvalidParameter {
            name: "deadLetterQueueName".to_string(),
            reason: "a queue cannot be its own dead letter queue".to_string(),
        }
        .into());
    }
    if options.max_receive_count == Some(0) {
        return Err(ValidationError::InvalidParameter {
            name: "maxReceiveCount".to_string(),
            reason: "must be at least 1".to_string(),
        }
        .into());
    }
    Ok(())
}

/// Check a body length against the queue maximum.
pub fn validate_message_size(size: usize, max_size: Option<usize>) -> Result<()> {
    match max_size {
        Some(max) if size > max => Err(Error::MessageExceededMaxMessageSize { size, max }),
        _ => Ok(()),
    }
}
