//! In-memory queue: configuration plus its ordered messages.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::message::MemoryMessage;
use crate::core::lifecycle::{can_receive, sweep_action, MessageState, SweepAction};
use crate::core::receipt::new_id;
use crate::core::time::add_millis;
use crate::storage::ReceiveSettings;
use crate::types::validation::validate_message_size;
use crate::types::{
    CreateQueueOptions, GetMessage, Message, PeekMessagesOptions, QueueInfo, ReceivedMessage,
    SendMessageOptions, SendMessageResult, UpdateMessageOptions,
};
use crate::{Error, Result};

/// A message about to be enqueued.
#[derive(Debug, Clone, Default)]
pub(crate) struct NewMessage {
    /// Reuse an id, e.g. for topic fan-out; a fresh one is generated otherwise.
    pub id: Option<String>,
    pub body: String,
    pub options: SendMessageOptions,
    pub last_nak_reason: Option<String>,
}

/// What one sweep removed from a queue.
#[derive(Debug, Default)]
pub(crate) struct QueueSweep {
    /// Messages deleted by retention.
    pub retention_deleted: u64,
    /// Messages out of delivery attempts, to be dead-lettered or dropped.
    pub exhausted: Vec<MemoryMessage>,
}

/// In-memory queue.
#[derive(Debug)]
pub struct MemoryQueue {
    pub(crate) name: String,
    pub(crate) created: DateTime<Utc>,
    pub(crate) last_modified: DateTime<Utc>,
    pub(crate) options: CreateQueueOptions,
    pub(crate) expires_at: Option<DateTime<Utc>>,
    pub(crate) paused: bool,
    messages: Vec<MemoryMessage>,
    next_seq: u64,
}

impl MemoryQueue {
    pub(crate) fn new(name: &str, options: CreateQueueOptions, now: DateTime<Utc>) -> Self {
        let mut queue = Self {
            name: name.to_string(),
            created: now,
            last_modified: now,
            options: CreateQueueOptions::default(),
            expires_at: None,
            paused: false,
            messages: Vec::new(),
            next_seq: 0,
        };
        queue.update(options, now);
        queue
    }

    /// Replace the configuration, keeping messages.
    pub(crate) fn update(&mut self, options: CreateQueueOptions, now: DateTime<Utc>) {
        self.options = CreateQueueOptions {
            upsert: false,
            ..options
        };
        self.expires_at = self.options.expires_ms.map(|ms| add_millis(now, ms));
        self.last_modified = now;
    }

    pub(crate) fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if now > expires_at)
    }

    /// Push the idle expiry forward.
    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        if let Some(ms) = self.options.expires_ms {
            self.expires_at = Some(add_millis(now, ms));
        }
    }

    pub(crate) fn check_size(&self, body: &str) -> Result<()> {
        validate_message_size(body.len(), self.options.max_message_size)
    }

    pub(crate) fn send(&mut self, message: NewMessage, now: DateTime<Utc>) -> Result<SendMessageResult> {
        self.check_size(&message.body)?;

        let id = message.id.unwrap_or_else(new_id);
        if self.messages.iter().any(|m| m.id == id) {
            return Err(Error::duplicate_message(&self.name, &id));
        }
        if let Some(dedup_id) = &message.options.deduplication_id {
            let pending = self.messages.iter().any(|m| {
                m.receive_count == 0 && m.deduplication_id.as_deref() == Some(dedup_id)
            });
            if pending {
                return Err(Error::duplicate_message(&self.name, dedup_id));
            }
        }

        let delay_ms = message.options.delay_ms.or(self.options.delay_ms);
        let seq = self.take_seq();
        self.messages.push(MemoryMessage {
            id: id.clone(),
            body: message.body,
            attributes: message.options.attributes,
            priority: message.options.priority,
            sent_time: now,
            order_time: now,
            seq,
            delay_until: delay_ms.map(|ms| add_millis(now, ms)),
            retain_until: self.retain_until(now),
            expires_at: None,
            receipt_handle: None,
            receive_count: 0,
            first_received_at: None,
            last_nak_reason: message.last_nak_reason,
            deduplication_id: message.options.deduplication_id,
        });
        Ok(SendMessageResult { id })
    }

    /// Take in a message moved from another queue, placing it at the tail.
    pub(crate) fn accept_moved(&mut self, mut message: MemoryMessage, now: DateTime<Utc>) {
        message.seq = self.take_seq();
        message.retain_until = self.retain_until(now);
        message.deduplication_id = None;
        self.messages.push(message);
    }

    /// Take in a dead-lettered message: attempts reset, stamped to the tail.
    pub(crate) fn accept_dead_letter(&mut self, mut message: MemoryMessage, now: DateTime<Utc>) {
        message.receive_count = 0;
        message.receipt_handle = None;
        message.expires_at = None;
        message.delay_until = None;
        message.sent_time = now;
        message.order_time = now;
        self.accept_moved(message, now);
    }

    pub(crate) fn receive(
        &mut self,
        now: DateTime<Utc>,
        settings: ReceiveSettings,
    ) -> Result<Vec<ReceivedMessage>> {
        let mut received = Vec::new();
        if self.paused {
            return Ok(received);
        }

        self.sort();
        let max_receive_count = self.options.max_receive_count;
        for message in self.messages.iter_mut() {
            if received.len() >= settings.max_number_of_messages {
                break;
            }
            if !can_receive(message.receive_count, max_receive_count) || !message.is_available(now)
            {
                continue;
            }
            received.push(message.mark_received(&self.name, now, settings.visibility_timeout_ms)?);
        }
        Ok(received)
    }

    pub(crate) fn peek(&mut self, now: DateTime<Utc>, options: &PeekMessagesOptions) -> Vec<Message> {
        self.sort();
        self.messages
            .iter()
            .filter(|m| match m.state(now) {
                MessageState::Available => true,
                MessageState::InFlight => options.include_not_visible,
                MessageState::Delayed => options.include_delayed,
            })
            .take(options.max_number_of_messages)
            .map(|m| m.to_message(now))
            .collect()
    }

    pub(crate) fn get(&mut self, now: DateTime<Utc>, message_id: &str) -> Result<GetMessage> {
        self.sort();
        self.messages
            .iter()
            .position(|m| m.id == message_id)
            .map(|position| GetMessage {
                message: self.messages[position].to_message(now),
                position_in_queue: position as u64,
            })
            .ok_or_else(|| Error::message_not_found(&self.name, message_id))
    }

    pub(crate) fn update_message(
        &mut self,
        now: DateTime<Utc>,
        message_id: &str,
        receipt_handle: Option<&str>,
        options: UpdateMessageOptions,
    ) -> Result<()> {
        let name = &self.name;
        let message = self
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| Error::message_not_found(name, message_id))?;

        match receipt_handle {
            None if options.visibility_timeout_ms.is_some() => {
                return Err(Error::InvalidUpdate(
                    "cannot update message visibility timeout without providing a receipt handle"
                        .to_string(),
                ));
            }
            Some(handle) if message.receipt_handle.as_deref() != Some(handle) => {
                return Err(Error::receipt_handle_invalid(name, handle));
            }
            _ => {}
        }

        message.update(now, options);
        Ok(())
    }

    pub(crate) fn nak(
        &mut self,
        now: DateTime<Utc>,
        message_id: &str,
        receipt_handle: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        let name = &self.name;
        let message = self
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| Error::message_not_found(name, message_id))?;
        if message.receipt_handle.as_deref() != Some(receipt_handle) {
            return Err(Error::receipt_handle_invalid(name, receipt_handle));
        }
        message.nak(now, reason);
        Ok(())
    }

    pub(crate) fn delete(&mut self, message_id: &str, receipt_handle: Option<&str>) -> Result<()> {
        let position = self
            .messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or_else(|| Error::message_not_found(&self.name, message_id))?;
        if let Some(handle) = receipt_handle {
            if self.messages[position].receipt_handle.as_deref() != Some(handle) {
                return Err(Error::receipt_handle_invalid(&self.name, handle));
            }
        }
        self.messages.remove(position);
        Ok(())
    }

    pub(crate) fn delete_by_receipt_handle(&mut self, receipt_handle: &str) -> Result<()> {
        let position = self
            .messages
            .iter()
            .position(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| Error::receipt_handle_invalid(&self.name, receipt_handle))?;
        self.messages.remove(position);
        Ok(())
    }

    pub(crate) fn update_visibility_by_receipt_handle(
        &mut self,
        now: DateTime<Utc>,
        receipt_handle: &str,
        visibility_timeout_ms: u64,
    ) -> Result<()> {
        let name = &self.name;
        let message = self
            .messages
            .iter_mut()
            .find(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| Error::receipt_handle_invalid(name, receipt_handle))?;
        message.expires_at = Some(add_millis(now, visibility_timeout_ms));
        Ok(())
    }

    /// Delete every message, returning how many there were.
    pub(crate) fn purge(&mut self) -> u64 {
        let count = self.messages.len() as u64;
        self.messages.clear();
        count
    }

    pub(crate) fn contains(&self, message_id: &str) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }

    pub(crate) fn available_ids(&self, now: DateTime<Utc>) -> Vec<&str> {
        self.messages
            .iter()
            .filter(|m| m.is_available(now))
            .map(|m| m.id.as_str())
            .collect()
    }

    /// Remove the available messages, in delivery order.
    pub(crate) fn take_available(&mut self, now: DateTime<Utc>) -> Vec<MemoryMessage> {
        self.sort();
        let (available, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.messages)
            .into_iter()
            .partition(|m| m.is_available(now));
        self.messages = kept;
        available
    }

    /// Apply retention, exhaustion and expiry rules.
    pub(crate) fn sweep(&mut self, now: DateTime<Utc>) -> QueueSweep {
        let mut outcome = QueueSweep::default();
        let max_receive_count = self.options.max_receive_count;
        let behavior = self.options.nak_expire_behavior.unwrap_or_default();

        self.sort();
        let mut kept = Vec::with_capacity(self.messages.len());
        for mut message in std::mem::take(&mut self.messages) {
            match sweep_action(now, message.sweep_input(), max_receive_count, behavior) {
                SweepAction::Keep => kept.push(message),
                SweepAction::Delete => {
                    debug!(
                        queue_name = %self.name,
                        message_id = %message.id,
                        "Deleting message past retention period"
                    );
                    outcome.retention_deleted += 1;
                }
                SweepAction::DeadLetter => outcome.exhausted.push(message),
                SweepAction::Expire(behavior) => {
                    message.expire(now, behavior);
                    kept.push(message);
                }
            }
        }
        self.messages = kept;
        outcome
    }

    pub(crate) fn info(&self, now: DateTime<Utc>) -> QueueInfo {
        let (mut available, mut delayed, mut in_flight) = (0, 0, 0);
        for message in &self.messages {
            match message.state(now) {
                MessageState::Available => available += 1,
                MessageState::Delayed => delayed += 1,
                MessageState::InFlight => in_flight += 1,
            }
        }

        QueueInfo {
            name: self.name.clone(),
            number_of_messages: available,
            number_of_messages_delayed: delayed,
            number_of_messages_not_visible: in_flight,
            created: self.created,
            last_modified: self.last_modified,
            delay_ms: self.options.delay_ms,
            expires_ms: self.options.expires_ms,
            expires_at: self.expires_at,
            max_message_size: self.options.max_message_size,
            message_retention_period_ms: self.options.message_retention_period_ms,
            receive_message_wait_time_ms: self.options.receive_message_wait_time_ms,
            visibility_timeout_ms: self.options.visibility_timeout_ms,
            nak_expire_behavior: self.options.nak_expire_behavior.unwrap_or_default(),
            tags: self.options.tags.clone(),
            dead_letter_queue_name: self.options.dead_letter_queue_name.clone(),
            dead_letter_topic_name: self.options.dead_letter_topic_name.clone(),
            max_receive_count: self.options.max_receive_count,
            paused: self.paused,
        }
    }

    fn retain_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.options
            .message_retention_period_ms
            .map(|ms| add_millis(now, ms))
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn sort(&mut self) {
        self.messages.sort_by(|a, b| a.delivery_order(b));
    }
}
