//! Message state classification shared by the storage backends.

use chrono::{DateTime, Utc};

use crate::types::NakExpireBehavior;

/// Where a message sits in its lifecycle at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Waiting for its delay to pass.
    Delayed,
    /// Can be received.
    Available,
    /// Held by a receiver until its visibility deadline.
    InFlight,
}

impl MessageState {
    /// Classify a message from its visibility deadline and delay.
    pub fn classify(
        now: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
        delay_until: Option<DateTime<Utc>>,
    ) -> Self {
        match (expires_at, delay_until) {
            (Some(expires_at), _) if expires_at >= now => MessageState::InFlight,
            (_, Some(delay_until)) if now < delay_until => MessageState::Delayed,
            _ => MessageState::Available,
        }
    }
}

/// Whether a message with `receive_count` deliveries may be delivered again.
pub fn can_receive(receive_count: u32, max_receive_count: Option<u32>) -> bool {
    match max_receive_count {
        Some(max) => receive_count < max,
        None => true,
    }
}

/// What the sweep does with one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    /// Nothing to do.
    Keep,
    /// Past retention, delete regardless of state.
    Delete,
    /// Out of delivery attempts, dead-letter or delete.
    DeadLetter,
    /// Visibility expired with attempts left, apply the queue behavior.
    Expire(NakExpireBehavior),
}

/// Per-message inputs of [`sweep_action`].
#[derive(Debug, Clone, Copy)]
pub struct SweepInput {
    /// Retention deadline.
    pub retain_until: Option<DateTime<Utc>>,
    /// Visibility deadline.
    pub expires_at: Option<DateTime<Utc>>,
    /// Deliveries so far.
    pub receive_count: u32,
}

/// Decide what the sweep does with a message.
///
/// Retention wins over everything. A message that used all of its delivery
/// attempts is dead-lettered once nobody holds it. Any other expired message
/// gets the queue's nak/expire behavior.
pub fn sweep_action(
    now: DateTime<Utc>,
    input: SweepInput,
    max_receive_count: Option<u32>,
    behavior: NakExpireBehavior,
) -> SweepAction {
    if let Some(retain_until) = input.retain_until {
        if now > retain_until {
            return SweepAction::Delete;
        }
    }

    let in_flight = matches!(input.expires_at, Some(expires_at) if expires_at >= now);
    if in_flight {
        return SweepAction::Keep;
    }

    if !can_receive(input.receive_count, max_receive_count) {
        return SweepAction::DeadLetter;
    }

    match input.expires_at {
        Some(_) => SweepAction::Expire(behavior),
        None => SweepAction::Keep,
    }
}
