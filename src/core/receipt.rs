//! Message id and receipt handle generation.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

/// Decoded contents of a receipt handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptHandleData {
    /// Queue the message was received from.
    pub queue_name: String,
    /// Received message.
    pub message_id: String,
    /// Makes every handle unique, so a stale one never matches again.
    pub nonce: String,
}

/// New time-ordered message or subscription id.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Generate a fresh receipt handle for a message.
pub fn generate_receipt_handle(queue_name: &str, message_id: &str) -> Result<String> {
    let data = ReceiptHandleData {
        queue_name: queue_name.to_string(),
        message_id: message_id.to_string(),
        nonce: Uuid::new_v4().to_string(),
    };

    let json = serde_json::to_string(&data)?;
    Ok(STANDARD.encode(json.as_bytes()))
}

/// Decode a receipt handle. Returns `None` for anything that isn't one of ours.
pub fn parse_receipt_handle(receipt_handle: &str) -> Option<ReceiptHandleData> {
    let decoded = STANDARD.decode(receipt_handle).ok()?;
    serde_json::from_slice(&decoded).ok()
}
