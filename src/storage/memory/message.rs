//! A message held by an in-memory queue.

use std::cmp::{Ordering, Reverse};

use chrono::{DateTime, Utc};

use crate::core::lifecycle::{MessageState, SweepInput};
use crate::core::receipt::generate_receipt_handle;
use crate::core::time::add_millis;
use crate::types::{
    Message, MessageAttributes, NakExpireBehavior, ReceivedMessage, UpdateMessageOptions,
};
use crate::Result;

/// Message state owned by a [`super::MemoryQueue`].
#[derive(Debug, Clone)]
pub struct MemoryMessage {
    pub(crate) id: String,
    pub(crate) body: String,
    pub(crate) attributes: MessageAttributes,
    pub(crate) priority: i64,
    pub(crate) sent_time: DateTime<Utc>,
    pub(crate) order_time: DateTime<Utc>,
    /// Insertion sequence within the owning queue, breaks ordering ties.
    pub(crate) seq: u64,
    pub(crate) delay_until: Option<DateTime<Utc>>,
    pub(crate) retain_until: Option<DateTime<Utc>>,
    pub(crate) expires_at: Option<DateTime<Utc>>,
    pub(crate) receipt_handle: Option<String>,
    pub(crate) receive_count: u32,
    pub(crate) first_received_at: Option<DateTime<Utc>>,
    pub(crate) last_nak_reason: Option<String>,
    pub(crate) deduplication_id: Option<String>,
}

impl MemoryMessage {
    pub(crate) fn state(&self, now: DateTime<Utc>) -> MessageState {
        MessageState::classify(now, self.expires_at, self.delay_until)
    }

    pub(crate) fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == MessageState::Available
    }

    pub(crate) fn sweep_input(&self) -> SweepInput {
        SweepInput {
            retain_until: self.retain_until,
            expires_at: self.expires_at,
            receive_count: self.receive_count,
        }
    }

    /// Delivery order: priority descending, then order time, then insertion.
    pub(crate) fn delivery_order(&self, other: &Self) -> Ordering {
        (Reverse(self.priority), self.order_time, self.seq).cmp(&(
            Reverse(other.priority),
            other.order_time,
            other.seq,
        ))
    }

    pub(crate) fn mark_received(
        &mut self,
        queue_name: &str,
        now: DateTime<Utc>,
        visibility_timeout_ms: u64,
    ) -> Result<ReceivedMessage> {
        let receipt_handle = generate_receipt_handle(queue_name, &self.id)?;
        self.expires_at = Some(add_millis(now, visibility_timeout_ms));
        self.receipt_handle = Some(receipt_handle.clone());
        self.first_received_at.get_or_insert(now);
        self.receive_count += 1;
        Ok(ReceivedMessage {
            message: self.to_message(now),
            receipt_handle,
        })
    }

    pub(crate) fn update(&mut self, now: DateTime<Utc>, options: UpdateMessageOptions) {
        if let Some(priority) = options.priority {
            self.priority = priority;
        }
        if let Some(attributes) = options.attributes {
            self.attributes = attributes;
        }
        if let Some(visibility_timeout_ms) = options.visibility_timeout_ms {
            self.expires_at = Some(add_millis(now, visibility_timeout_ms));
        }
    }

    pub(crate) fn nak(&mut self, now: DateTime<Utc>, reason: Option<&str>) {
        self.expires_at = Some(now - chrono::Duration::milliseconds(1));
        self.last_nak_reason = reason.map(str::to_string);
        self.receipt_handle = None;
    }

    /// Apply the queue behavior to a message whose visibility expired.
    pub(crate) fn expire(&mut self, now: DateTime<Utc>, behavior: NakExpireBehavior) {
        self.expires_at = None;
        match behavior {
            NakExpireBehavior::Retry => {}
            NakExpireBehavior::MoveToEnd => {
                self.order_time = now;
                self.receipt_handle = None;
            }
            NakExpireBehavior::DecreasePriorityBy(amount) => {
                self.priority = self.priority.saturating_sub(amount);
                self.receipt_handle = None;
            }
        }
    }

    pub(crate) fn to_message(&self, now: DateTime<Utc>) -> Message {
        Message {
            id: self.id.clone(),
            body: self.body.clone(),
            sent_time: self.sent_time,
            priority: self.priority,
            attributes: self.attributes.clone(),
            delay_until: self.delay_until,
            is_available: self.is_available(now),
            receive_count: self.receive_count,
            expires_at: self.expires_at,
            receipt_handle: self.receipt_handle.clone(),
            first_received_at: self.first_received_at,
            last_nak_reason: self.last_nak_reason.clone(),
        }
    }
}
