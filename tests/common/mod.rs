//! Behavioral suite shared by every store backend.
//!
//! Each backend test file builds a [`Harness`] and expands [`store_suite!`],
//! which turns every scenario below into a `#[tokio::test]`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nexq::core::time::{add_millis, Clock, MockClock};
use nexq::storage::Store;
use nexq::types::{
    CreateQueueOptions, CreateTopicOptions, NakExpireBehavior, PeekMessagesOptions, QueueInfo,
    ReceiveMessagesOptions, ReceivedMessage, SendMessageEntry, SendMessageOptions, TopicProtocol,
    UpdateMessageOptions,
};
use nexq::Error;
use tokio::sync::OwnedMutexGuard;

pub const QUEUE1: &str = "queue1";
pub const QUEUE2: &str = "queue2";
pub const QUEUE3: &str = "queue3";
pub const DEAD_LETTER_QUEUE1: &str = "deadLetterQueue1";
pub const DEAD_LETTER_QUEUE2: &str = "deadLetterQueue2";
pub const TOPIC1: &str = "topic1";
pub const TOPIC2: &str = "topic2";
pub const MESSAGE1: &str = "message1";
pub const MESSAGE2: &str = "message2";
pub const MESSAGE3: &str = "message3";
pub const MESSAGE4: &str = "message4";

/// A store under test and the clock driving it.
pub struct Harness {
    pub store: Arc<dyn Store>,
    pub clock: Arc<MockClock>,
    _lock: Option<OwnedMutexGuard<()>>,
}

impl Harness {
    pub fn new(store: Arc<dyn Store>, clock: Arc<MockClock>) -> Self {
        Self {
            store,
            clock,
            _lock: None,
        }
    }

    /// Hold `lock` for the lifetime of the harness, for backends whose tests share a database.
    pub fn with_lock(mut self, lock: OwnedMutexGuard<()>) -> Self {
        self._lock = Some(lock);
        self
    }

    fn advance_ms(&self, ms: u64) {
        self.clock.advance(Duration::from_millis(ms));
    }
}

/// Expand every scenario of the suite into a test using `$setup`, an async fn
/// returning `Option<Harness>` (`None` skips the test).
#[macro_export]
macro_rules! store_suite {
    ($setup:path) => {
        $crate::store_suite!(
            $setup;
            peek_messages,
            peek_messages_include_not_visible,
            peek_messages_include_everything,
            peek_messages_max_messages,
            peek_messages_include_delayed,
            get_message,
            receive_message,
            receive_message_timeout,
            receive_message_wakes_on_send,
            receive_multiple,
            receive_rejects_zero_messages,
            queue_ordering_fifo,
            queue_ordering_priority,
            queue_ordering_dead_letter,
            queue_with_expires,
            visibility_timeout,
            far_future_durations,
            delay,
            max_message_size,
            max_receive_count_without_dead_letter_queue,
            no_max_receive_count,
            retention_with_max_receive_count,
            retention_without_max_receive_count,
            update_message,
            nak_message,
            nak_message_dead_letter_queue,
            nak_message_dead_letter_topic,
            nak_message_to_same_dead_letter_queue,
            nak_expire_behavior_default,
            nak_expire_behavior_move_to_end,
            nak_expire_behavior_decrease_priority,
            dead_letter_queue_with_retention,
            delete_message_by_id,
            delete_message_by_id_and_receipt_handle,
            delete_message_by_receipt_handle,
            dead_letter_queue,
            dead_letter_topic,
            dead_letter_queue_id_already_present,
            create_queue_missing_dead_letter_queue,
            duplicate_queues,
            upsert_queues,
            duplicate_queues_without_tags,
            delete_queue,
            delete_dead_letter_queue,
            get_queue_infos,
            purge_queue,
            move_messages,
            pause_resume,
            send_messages_batch,
            deduplication_id,
            delete_all_data,
            add_topic,
            duplicate_topics,
            duplicate_topics_without_tags,
            subscribe,
            get_topics,
            delete_topic,
            delete_dead_letter_topic,
            publish,
            publish_checks_every_queue_size,
        );
    };
    ($setup:path; $($name:ident),* $(,)?) => {
        $(
            #[tokio::test]
            async fn $name() {
                if let Some(harness) = $setup().await {
                    common::$name(&harness).await;
                    nexq::storage::Store::shutdown(harness.store.as_ref())
                        .await
                        .unwrap();
                }
            }
        )*
    };
}

pub async fn assert_queue_size(
    store: &dyn Store,
    queue_name: &str,
    available: u64,
    delayed: u64,
    not_visible: u64,
) {
    let info = store.get_queue_info(queue_name).await.unwrap();
    assert_eq!(info.number_of_messages, available, "numberOfMessages");
    assert_eq!(info.number_of_messages_delayed, delayed, "numberOfMessagesDelayed");
    assert_eq!(
        info.number_of_messages_not_visible, not_visible,
        "numberOfMessagesNotVisible"
    );
}

pub async fn assert_queue_empty(store: &dyn Store, queue_name: &str) {
    assert_queue_size(store, queue_name, 0, 0, 0).await;
}

/// Two concurrent sweeps, as if two processes shared the store.
pub async fn poll(store: &dyn Store) {
    let (a, b) = tokio::join!(store.poll(), store.poll());
    a.unwrap();
    b.unwrap();
}

/// Park until some task sleeps on the mock clock.
pub async fn wait_for_sleepers(clock: &MockClock) {
    while clock.pending_sleepers() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

fn queue_options() -> CreateQueueOptions {
    CreateQueueOptions::default()
}

fn receive(visibility_timeout_ms: u64) -> ReceiveMessagesOptions {
    ReceiveMessagesOptions {
        visibility_timeout_ms: Some(visibility_timeout_ms),
        ..Default::default()
    }
}

fn priority(priority: i64) -> SendMessageOptions {
    SendMessageOptions {
        priority,
        ..Default::default()
    }
}

fn delayed(delay_ms: u64) -> SendMessageOptions {
    SendMessageOptions {
        delay_ms: Some(delay_ms),
        ..Default::default()
    }
}

fn attributes() -> HashMap<String, String> {
    HashMap::from([
        ("attr1".to_string(), "attr1Value".to_string()),
        ("attr2".to_string(), "attr2Value".to_string()),
    ])
}

async fn send(store: &dyn Store, queue_name: &str, body: &str) -> String {
    store
        .send_message(queue_name, body, SendMessageOptions::default())
        .await
        .unwrap()
        .id
}

async fn receive_one(store: &dyn Store, queue_name: &str) -> Option<ReceivedMessage> {
    store
        .receive_message(queue_name, ReceiveMessagesOptions::default())
        .await
        .unwrap()
}

// queue

pub async fn peek_messages(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();

    let peeked = store
        .peek_messages(QUEUE1, PeekMessagesOptions::default())
        .await
        .unwrap();
    assert!(peeked.is_empty());

    send(store, QUEUE1, MESSAGE1).await;

    let peeked = store
        .peek_messages(QUEUE1, PeekMessagesOptions::default())
        .await
        .unwrap();
    assert_eq!(peeked.len(), 1);
    assert_eq!(peeked[0].body, MESSAGE1);
    assert_queue_size(store, QUEUE1, 1, 0, 0).await;
}

pub async fn peek_messages_include_not_visible(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    send(store, QUEUE1, MESSAGE1).await;
    receive_one(store, QUEUE1).await.unwrap();

    let peeked = store
        .peek_messages(QUEUE1, PeekMessagesOptions::default())
        .await
        .unwrap();
    assert!(peeked.is_empty());

    let peeked = store
        .peek_messages(
            QUEUE1,
            PeekMessagesOptions {
                include_not_visible: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(peeked.len(), 1);
    assert!(!peeked[0].is_available);
    assert_queue_size(store, QUEUE1, 0, 0, 1).await;
}

pub async fn peek_messages_include_everything(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    send(store, QUEUE1, MESSAGE1).await;
    receive_one(store, QUEUE1).await.unwrap();
    store
        .send_message(QUEUE1, MESSAGE1, delayed(100))
        .await
        .unwrap();

    let peeked = store
        .peek_messages(QUEUE1, PeekMessagesOptions::default())
        .await
        .unwrap();
    assert!(peeked.is_empty());

    let peeked = store
        .peek_messages(
            QUEUE1,
            PeekMessagesOptions {
                include_not_visible: true,
                include_delayed: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(peeked.len(), 2);
    assert_queue_size(store, QUEUE1, 0, 1, 1).await;
}

pub async fn peek_messages_max_messages(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    for _ in 0..11 {
        send(store, QUEUE1, MESSAGE1).await;
    }

    let peeked = store
        .peek_messages(
            QUEUE1,
            PeekMessagesOptions {
                max_number_of_messages: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(peeked.len(), 10);
    assert_queue_size(store, QUEUE1, 11, 0, 0).await;
}

pub async fn peek_messages_include_delayed(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    store
        .send_message(QUEUE1, MESSAGE1, delayed(1000))
        .await
        .unwrap();

    let peeked = store
        .peek_messages(QUEUE1, PeekMessagesOptions::default())
        .await
        .unwrap();
    assert!(peeked.is_empty());

    let peeked = store
        .peek_messages(
            QUEUE1,
            PeekMessagesOptions {
                include_delayed: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(peeked.len(), 1);
    assert!(peeked[0].delay_until.is_some());
    assert_queue_size(store, QUEUE1, 0, 1, 0).await;
}

pub async fn get_message(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                nak_expire_behavior: Some(NakExpireBehavior::MoveToEnd),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let id = send(store, QUEUE1, MESSAGE1).await;
    h.advance_ms(1);

    let m = store.get_message(QUEUE1, &id).await.unwrap();
    assert_eq!(m.message.id, id);
    assert_eq!(m.position_in_queue, 0);
    assert!(m.message.delay_until.is_none());
    assert!(m.message.is_available);
    assert_eq!(m.message.receive_count, 0);
    assert!(m.message.expires_at.is_none());
    assert!(m.message.receipt_handle.is_none());
    assert!(m.message.first_received_at.is_none());
    assert!(m.message.last_nak_reason.is_none());

    send(store, QUEUE1, MESSAGE2).await;
    h.advance_ms(1);
    send(store, QUEUE1, MESSAGE3).await;
    h.advance_ms(1);
    let received = receive_one(store, QUEUE1).await.unwrap();

    let m = store.get_message(QUEUE1, &id).await.unwrap();
    assert_eq!(m.position_in_queue, 0);
    assert!(!m.message.is_available);
    assert_eq!(m.message.receipt_handle.as_deref(), Some(received.receipt_handle.as_str()));
    assert_eq!(m.message.first_received_at, Some(h.clock.now()));

    store
        .nak_message(QUEUE1, &id, &received.receipt_handle, Some("testing"))
        .await
        .unwrap();
    h.advance_ms(1);
    poll(store).await;

    let m = store.get_message(QUEUE1, &id).await.unwrap();
    assert_eq!(m.position_in_queue, 2);
    assert!(m.message.is_available);
    assert_eq!(m.message.last_nak_reason.as_deref(), Some("testing"));
    assert!(m.message.receipt_handle.is_none());

    let err = store.get_message(QUEUE1, "bad-message-id").await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "message id \"bad-message-id\" is invalid for queue \"queue1\""
    );
}

pub async fn receive_message(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    send(store, QUEUE1, MESSAGE1).await;

    let message = store
        .receive_message(QUEUE1, receive(5000))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.message.body, MESSAGE1);
    assert_eq!(message.message.receive_count, 1);
    let receipt_handle = message.receipt_handle;
    assert_queue_size(store, QUEUE1, 0, 0, 1).await;

    assert!(receive_one(store, QUEUE1).await.is_none());
    assert_queue_size(store, QUEUE1, 0, 0, 1).await;

    // still inside the visibility timeout
    h.advance_ms(4000);
    poll(store).await;
    assert_queue_size(store, QUEUE1, 0, 0, 1).await;

    store
        .update_message_visibility_by_receipt_handle(QUEUE1, &receipt_handle, 5000)
        .await
        .unwrap();
    poll(store).await;
    assert_queue_size(store, QUEUE1, 0, 0, 1).await;

    h.advance_ms(6000);
    poll(store).await;
    assert_queue_size(store, QUEUE1, 1, 0, 0).await;

    // nobody picked the message up, so the old handle still extends visibility
    store
        .update_message_visibility_by_receipt_handle(QUEUE1, &receipt_handle, 5000)
        .await
        .unwrap();
    poll(store).await;
    assert_queue_size(store, QUEUE1, 0, 0, 1).await;

    h.advance_ms(6000);
    poll(store).await;
    assert_queue_size(store, QUEUE1, 1, 0, 0).await;

    let again = receive_one(store, QUEUE1).await.unwrap();
    assert_eq!(again.message.body, MESSAGE1);
    assert_ne!(again.receipt_handle, receipt_handle);
    assert_queue_size(store, QUEUE1, 0, 0, 1).await;

    store
        .delete_message_by_receipt_handle(QUEUE1, &again.receipt_handle)
        .await
        .unwrap();
    assert_queue_empty(store, QUEUE1).await;
}

pub async fn receive_message_timeout(h: &Harness) {
    h.store.create_queue(QUEUE1, queue_options()).await.unwrap();
    let started = h.clock.now();

    let store = h.store.clone();
    let receiver = tokio::spawn(async move {
        store
            .receive_message(
                QUEUE1,
                ReceiveMessagesOptions {
                    wait_time_ms: Some(1000),
                    ..Default::default()
                },
            )
            .await
    });

    wait_for_sleepers(&h.clock).await;
    h.advance_ms(1000);

    assert!(receiver.await.unwrap().unwrap().is_none());
    assert_eq!(h.clock.now(), add_millis(started, 1000));
}

pub async fn receive_message_wakes_on_send(h: &Harness) {
    h.store.create_queue(QUEUE1, queue_options()).await.unwrap();

    let store = h.store.clone();
    let receiver = tokio::spawn(async move {
        store
            .receive_message(
                QUEUE1,
                ReceiveMessagesOptions {
                    wait_time_ms: Some(1000),
                    ..Default::default()
                },
            )
            .await
    });

    wait_for_sleepers(&h.clock).await;
    h.advance_ms(999);
    poll(h.store.as_ref()).await;
    send(h.store.as_ref(), QUEUE1, MESSAGE1).await;

    let message = receiver.await.unwrap().unwrap().unwrap();
    assert_eq!(message.message.body, MESSAGE1);
}

pub async fn receive_multiple(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    send(store, QUEUE1, MESSAGE1).await;
    send(store, QUEUE1, MESSAGE2).await;
    send(store, QUEUE1, MESSAGE3).await;

    let batch = ReceiveMessagesOptions {
        max_number_of_messages: Some(2),
        ..Default::default()
    };
    let first = store.receive_messages(QUEUE1, batch.clone()).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].message.body, MESSAGE1);
    assert_eq!(first[1].message.body, MESSAGE2);

    let second = store.receive_messages(QUEUE1, batch).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].message.body, MESSAGE3);
}

pub async fn receive_rejects_zero_messages(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();

    let err = store
        .receive_messages(
            QUEUE1,
            ReceiveMessagesOptions {
                max_number_of_messages: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = store
        .receive_messages("bad-queue-name", ReceiveMessagesOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueNotFound(_)));
}

pub async fn queue_ordering_fifo(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();

    let id1 = send(store, QUEUE1, MESSAGE1).await;
    h.advance_ms(1);
    let id2 = send(store, QUEUE1, MESSAGE2).await;

    let m1 = receive_one(store, QUEUE1).await.unwrap();
    assert_eq!(m1.message.id, id1);
    assert_eq!(m1.message.body, MESSAGE1);

    let m2 = receive_one(store, QUEUE1).await.unwrap();
    assert_eq!(m2.message.id, id2);
    assert_eq!(m2.message.body, MESSAGE2);

    assert!(receive_one(store, QUEUE1).await.is_none());
}

pub async fn queue_ordering_priority(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();

    let id1 = send(store, QUEUE1, MESSAGE1).await;
    h.advance_ms(1);
    let id2 = store
        .send_message(QUEUE1, MESSAGE2, priority(1))
        .await
        .unwrap()
        .id;

    let m2 = receive_one(store, QUEUE1).await.unwrap();
    assert_eq!(m2.message.id, id2);
    assert_eq!(m2.message.priority, 1);

    let m1 = receive_one(store, QUEUE1).await.unwrap();
    assert_eq!(m1.message.id, id1);

    assert!(receive_one(store, QUEUE1).await.is_none());
}

pub async fn queue_ordering_dead_letter(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(DEAD_LETTER_QUEUE1, queue_options())
        .await
        .unwrap();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                dead_letter_queue_name: Some(DEAD_LETTER_QUEUE1.to_string()),
                max_receive_count: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    send(store, QUEUE1, MESSAGE1).await;
    h.advance_ms(1);
    send(store, DEAD_LETTER_QUEUE1, MESSAGE2).await;
    h.advance_ms(1);
    send(store, DEAD_LETTER_QUEUE1, MESSAGE3).await;

    store.receive_message(QUEUE1, receive(1)).await.unwrap();
    h.advance_ms(2);
    poll(store).await;

    // the dead-lettered message lands behind what the dead letter queue already held
    for expected in [MESSAGE2, MESSAGE3, MESSAGE1] {
        let message = receive_one(store, DEAD_LETTER_QUEUE1).await.unwrap();
        assert_eq!(message.message.body, expected);
    }
}

pub async fn queue_with_expires(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                expires_ms: Some(60_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.advance_ms(59_000);
    poll(store).await;

    // receiving pushes the expiry out
    receive_one(store, QUEUE1).await;
    h.advance_ms(59_000);
    poll(store).await;
    store.get_queue_info(QUEUE1).await.unwrap();

    receive_one(store, QUEUE1).await;
    h.advance_ms(59_000);
    poll(store).await;
    store.get_queue_info(QUEUE1).await.unwrap();

    h.advance_ms(2_000);
    poll(store).await;
    let err = store.get_queue_info(QUEUE1).await.unwrap_err();
    assert!(err.to_string().contains("not found"));
}

pub async fn visibility_timeout(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    send(store, QUEUE1, MESSAGE1).await;

    store.receive_message(QUEUE1, receive(5000)).await.unwrap();
    assert_queue_size(store, QUEUE1, 0, 0, 1).await;
    assert!(receive_one(store, QUEUE1).await.is_none());

    // visibility is computed from the clock, no sweep needed
    h.advance_ms(6000);
    assert_queue_size(store, QUEUE1, 1, 0, 0).await;
    assert!(receive_one(store, QUEUE1).await.is_some());
}

pub async fn far_future_durations(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                expires_ms: Some(u64::MAX),
                message_retention_period_ms: Some(u64::MAX),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    store
        .send_message(QUEUE1, MESSAGE1, delayed(u64::MAX))
        .await
        .unwrap();
    send(store, QUEUE1, MESSAGE2).await;

    let received = store
        .receive_messages(QUEUE1, receive(u64::MAX / 2))
        .await
        .unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].message.body, MESSAGE2);
    store
        .update_message_visibility_by_receipt_handle(QUEUE1, &received[0].receipt_handle, u64::MAX)
        .await
        .unwrap();
    assert_queue_size(store, QUEUE1, 0, 1, 1).await;

    h.advance_ms(86_400_000);
    poll(store).await;
    assert_queue_size(store, QUEUE1, 0, 1, 1).await;
}

pub async fn delay(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    store
        .send_message(QUEUE1, MESSAGE1, delayed(10))
        .await
        .unwrap();
    poll(store).await;
    assert_queue_size(store, QUEUE1, 0, 1, 0).await;
    assert!(receive_one(store, QUEUE1).await.is_none());

    h.advance_ms(11);
    poll(store).await;
    assert_queue_size(store, QUEUE1, 1, 0, 0).await;
    assert!(receive_one(store, QUEUE1).await.is_some());
}

pub async fn max_message_size(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                max_message_size: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    send(store, QUEUE1, "1234567890").await;
    assert_queue_size(store, QUEUE1, 1, 0, 0).await;

    let err = store
        .send_message(QUEUE1, "12345678901", SendMessageOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "message of size 11 exceeded the maximum message size of 10"
    );
    assert_queue_size(store, QUEUE1, 1, 0, 0).await;
}

pub async fn max_receive_count_without_dead_letter_queue(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                max_receive_count: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    send(store, QUEUE1, MESSAGE1).await;
    poll(store).await;
    assert_queue_size(store, QUEUE1, 1, 0, 0).await;

    store.receive_message(QUEUE1, receive(1000)).await.unwrap();
    h.advance_ms(1001);
    poll(store).await;

    assert_queue_empty(store, QUEUE1).await;
}

pub async fn no_max_receive_count(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    send(store, QUEUE1, MESSAGE1).await;
    poll(store).await;

    for attempt in 1..=10u32 {
        assert_queue_size(store, QUEUE1, 1, 0, 0).await;
        let message = store
            .receive_message(QUEUE1, receive(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.message.receive_count, attempt);
        assert_queue_size(store, QUEUE1, 0, 0, 1).await;
        h.advance_ms(11);
        poll(store).await;
    }
}

pub async fn retention_with_max_receive_count(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                message_retention_period_ms: Some(5000),
                max_receive_count: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    send(store, QUEUE1, MESSAGE1).await;
    poll(store).await;
    assert_queue_size(store, QUEUE1, 1, 0, 0).await;

    h.advance_ms(6000);
    poll(store).await;
    assert_queue_empty(store, QUEUE1).await;
}

pub async fn retention_without_max_receive_count(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                message_retention_period_ms: Some(5000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    send(store, QUEUE1, MESSAGE1).await;
    poll(store).await;
    assert_queue_size(store, QUEUE1, 1, 0, 0).await;

    h.advance_ms(6000);
    poll(store).await;
    assert_queue_empty(store, QUEUE1).await;
}

pub async fn update_message(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                visibility_timeout_ms: Some(5000),
                max_receive_count: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let id = store
        .send_message(
            QUEUE1,
            MESSAGE1,
            SendMessageOptions {
                priority: 5,
                attributes: HashMap::from([("oldAttr".to_string(), "oldAttrValue".to_string())]),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .id;

    let bump = UpdateMessageOptions {
        priority: Some(111),
        ..Default::default()
    };
    let err = store
        .update_message(QUEUE1, "bad-message-id", None, bump.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MessageNotFound { .. }));

    let err = store
        .update_message(QUEUE1, &id, Some("bad-receipt-handle"), bump)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReceiptHandleInvalid { .. }));

    let err = store
        .update_message(
            QUEUE1,
            &id,
            None,
            UpdateMessageOptions {
                visibility_timeout_ms: Some(111),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("cannot update message visibility timeout without providing a receipt handle"));

    store
        .update_message(
            QUEUE1,
            &id,
            None,
            UpdateMessageOptions {
                priority: Some(12),
                attributes: Some(HashMap::from([(
                    "newAttr".to_string(),
                    "newAttrValue".to_string(),
                )])),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let received = receive_one(store, QUEUE1).await.unwrap();
    assert_eq!(received.message.priority, 12);
    assert!(!received.message.attributes.contains_key("oldAttr"));
    assert_eq!(
        received.message.attributes.get("newAttr").map(String::as_str),
        Some("newAttrValue")
    );
    h.advance_ms(4000);
    poll(store).await;

    store
        .update_message(
            QUEUE1,
            &id,
            Some(&received.receipt_handle),
            UpdateMessageOptions {
                priority: Some(22),
                visibility_timeout_ms: Some(5000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.advance_ms(4000);
    poll(store).await;
    assert_queue_size(store, QUEUE1, 0, 0, 1).await;

    h.advance_ms(1001);
    poll(store).await;
    assert_queue_empty(store, QUEUE1).await;
}

pub async fn nak_message(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                visibility_timeout_ms: Some(5000),
                max_receive_count: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let id = send(store, QUEUE1, MESSAGE1).await;

    let err = store
        .nak_message(QUEUE1, "bad-message-id", "1", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MessageNotFound { .. }));

    let err = store
        .nak_message(QUEUE1, &id, "bad-receipt-handle", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReceiptHandleInvalid { .. }));

    let received = receive_one(store, QUEUE1).await.unwrap();
    store
        .nak_message(QUEUE1, &id, &received.receipt_handle, None)
        .await
        .unwrap();

    // the receive budget is spent, so the nak does not make it deliverable
    let again = store
        .receive_message(
            QUEUE1,
            ReceiveMessagesOptions {
                wait_time_ms: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(again.is_none());

    poll(store).await;
    assert_queue_empty(store, QUEUE1).await;
}

pub async fn nak_message_dead_letter_queue(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(DEAD_LETTER_QUEUE1, queue_options())
        .await
        .unwrap();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                max_receive_count: Some(1),
                dead_letter_queue_name: Some(DEAD_LETTER_QUEUE1.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let id = send(store, QUEUE1, MESSAGE1).await;

    let received = receive_one(store, QUEUE1).await.unwrap();
    store
        .nak_message(QUEUE1, &id, &received.receipt_handle, Some("test message"))
        .await
        .unwrap();
    poll(store).await;
    assert_queue_empty(store, QUEUE1).await;

    let dead = receive_one(store, DEAD_LETTER_QUEUE1).await.unwrap();
    assert_eq!(dead.message.id, id);
    assert_eq!(dead.message.last_nak_reason.as_deref(), Some("test message"));
    assert_eq!(dead.message.receive_count, 1);
}

pub async fn nak_message_dead_letter_topic(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(DEAD_LETTER_QUEUE1, queue_options())
        .await
        .unwrap();
    store
        .create_queue(DEAD_LETTER_QUEUE2, queue_options())
        .await
        .unwrap();
    store
        .create_topic(TOPIC1, CreateTopicOptions::default())
        .await
        .unwrap();
    store
        .subscribe(TOPIC1, TopicProtocol::Queue, DEAD_LETTER_QUEUE1)
        .await
        .unwrap();
    store
        .subscribe(TOPIC1, TopicProtocol::Queue, DEAD_LETTER_QUEUE2)
        .await
        .unwrap();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                max_receive_count: Some(1),
                dead_letter_topic_name: Some(TOPIC1.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let id = send(store, QUEUE1, MESSAGE1).await;

    let received = receive_one(store, QUEUE1).await.unwrap();
    store
        .nak_message(QUEUE1, &id, &received.receipt_handle, Some("test message"))
        .await
        .unwrap();
    poll(store).await;
    assert_queue_empty(store, QUEUE1).await;

    for queue_name in [DEAD_LETTER_QUEUE1, DEAD_LETTER_QUEUE2] {
        let dead = receive_one(store, queue_name).await.unwrap();
        assert_eq!(dead.message.last_nak_reason.as_deref(), Some("test message"));
    }
}

pub async fn nak_message_to_same_dead_letter_queue(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(DEAD_LETTER_QUEUE1, queue_options())
        .await
        .unwrap();
    store
        .create_topic(TOPIC1, CreateTopicOptions::default())
        .await
        .unwrap();
    store
        .subscribe(TOPIC1, TopicProtocol::Queue, DEAD_LETTER_QUEUE1)
        .await
        .unwrap();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                max_receive_count: Some(1),
                dead_letter_topic_name: Some(TOPIC1.to_string()),
                dead_letter_queue_name: Some(DEAD_LETTER_QUEUE1.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    send(store, QUEUE1, MESSAGE1).await;
    h.advance_ms(1);
    poll(store).await;

    let received = receive_one(store, QUEUE1).await.unwrap();
    store
        .nak_message(QUEUE1, &received.message.id, &received.receipt_handle, None)
        .await
        .unwrap();
    h.advance_ms(1);
    poll(store).await;
    assert_queue_empty(store, QUEUE1).await;

    // one copy through the topic, one through the dead letter queue
    assert_queue_size(store, DEAD_LETTER_QUEUE1, 2, 0, 0).await;
}

async fn send_three_spaced(h: &Harness, priorities: [i64; 3]) {
    for (body, p) in [MESSAGE1, MESSAGE2, MESSAGE3].into_iter().zip(priorities) {
        h.store
            .send_message(QUEUE1, body, priority(p))
            .await
            .unwrap();
        h.advance_ms(1);
    }
}

pub async fn nak_expire_behavior_default(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    send_three_spaced(h, [0, 0, 0]).await;

    let received = receive_one(store, QUEUE1).await.unwrap();
    assert_eq!(received.message.body, MESSAGE1);
    store
        .nak_message(QUEUE1, &received.message.id, &received.receipt_handle, None)
        .await
        .unwrap();
    poll(store).await;

    let received = store
        .receive_message(QUEUE1, receive(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.message.body, MESSAGE1);

    h.advance_ms(101);
    poll(store).await;

    let received = store
        .receive_message(QUEUE1, receive(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.message.body, MESSAGE1);
}

pub async fn nak_expire_behavior_move_to_end(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                nak_expire_behavior: Some(NakExpireBehavior::MoveToEnd),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    send_three_spaced(h, [0, 0, 0]).await;

    let received = receive_one(store, QUEUE1).await.unwrap();
    assert_eq!(received.message.body, MESSAGE1);
    store
        .nak_message(QUEUE1, &received.message.id, &received.receipt_handle, None)
        .await
        .unwrap();
    poll(store).await;

    let received = store
        .receive_message(QUEUE1, receive(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.message.body, MESSAGE2);

    h.advance_ms(101);
    poll(store).await;

    let received = store
        .receive_message(QUEUE1, receive(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.message.body, MESSAGE3);
}

pub async fn nak_expire_behavior_decrease_priority(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                nak_expire_behavior: Some(NakExpireBehavior::DecreasePriorityBy(10)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    send_three_spaced(h, [20, 10, 1]).await;

    let received = receive_one(store, QUEUE1).await.unwrap();
    assert_eq!(received.message.body, MESSAGE1);
    assert_eq!(received.message.priority, 20);
    store
        .nak_message(QUEUE1, &received.message.id, &received.receipt_handle, None)
        .await
        .unwrap();
    poll(store).await;

    // same priority as message2 now, but older
    let received = store
        .receive_message(QUEUE1, receive(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.message.body, MESSAGE1);
    assert_eq!(received.message.priority, 10);
    store
        .nak_message(QUEUE1, &received.message.id, &received.receipt_handle, None)
        .await
        .unwrap();
    poll(store).await;

    let received = store
        .receive_message(QUEUE1, receive(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.message.body, MESSAGE2);
    assert_eq!(received.message.priority, 10);

    h.advance_ms(101);
    poll(store).await;

    for (body, p) in [(MESSAGE3, 1), (MESSAGE1, 0), (MESSAGE2, 0)] {
        let received = receive_one(store, QUEUE1).await.unwrap();
        assert_eq!(received.message.body, body);
        assert_eq!(received.message.priority, p);
    }
}

pub async fn dead_letter_queue_with_retention(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(
            DEAD_LETTER_QUEUE1,
            CreateQueueOptions {
                message_retention_period_ms: Some(1000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                max_receive_count: Some(1),
                dead_letter_queue_name: Some(DEAD_LETTER_QUEUE1.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let id = send(store, QUEUE1, MESSAGE1).await;

    let received = receive_one(store, QUEUE1).await.unwrap();
    store
        .nak_message(QUEUE1, &id, &received.receipt_handle, None)
        .await
        .unwrap();
    poll(store).await;
    assert_queue_empty(store, QUEUE1).await;
    assert_queue_size(store, DEAD_LETTER_QUEUE1, 1, 0, 0).await;

    h.advance_ms(1001);
    poll(store).await;
    assert_queue_empty(store, DEAD_LETTER_QUEUE1).await;
}

pub async fn delete_message_by_id(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    let id = send(store, QUEUE1, MESSAGE1).await;

    let err = store
        .delete_message(QUEUE1, "bad-message-id", None)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "message id \"bad-message-id\" is invalid for queue \"queue1\""
    );

    store.delete_message(QUEUE1, &id, None).await.unwrap();
    assert_queue_empty(store, QUEUE1).await;
}

pub async fn delete_message_by_id_and_receipt_handle(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    let id = send(store, QUEUE1, MESSAGE1).await;
    let received = receive_one(store, QUEUE1).await.unwrap();

    let err = store
        .delete_message(QUEUE1, &id, Some("bad-receipt-handle"))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "receipt handle \"bad-receipt-handle\" is invalid for queue \"queue1\""
    );

    store
        .delete_message(QUEUE1, &id, Some(&received.receipt_handle))
        .await
        .unwrap();
    assert_queue_empty(store, QUEUE1).await;
}

pub async fn delete_message_by_receipt_handle(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    send(store, QUEUE1, MESSAGE1).await;
    let first = store
        .receive_message(QUEUE1, receive(10))
        .await
        .unwrap()
        .unwrap();

    h.advance_ms(11);
    let second = receive_one(store, QUEUE1).await.unwrap();

    // the first handle went stale when the message was received again
    let err = store
        .delete_message_by_receipt_handle(QUEUE1, &first.receipt_handle)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReceiptHandleInvalid { .. }));

    store
        .delete_message_by_receipt_handle(QUEUE1, &second.receipt_handle)
        .await
        .unwrap();
    assert_queue_empty(store, QUEUE1).await;
}

pub async fn dead_letter_queue(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(DEAD_LETTER_QUEUE1, queue_options())
        .await
        .unwrap();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                dead_letter_queue_name: Some(DEAD_LETTER_QUEUE1.to_string()),
                max_receive_count: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    store
        .send_message(
            QUEUE1,
            MESSAGE1,
            SendMessageOptions {
                attributes: attributes(),
                priority: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    store.receive_message(QUEUE1, receive(1)).await.unwrap();
    h.advance_ms(2);
    poll(store).await;
    assert_queue_size(store, QUEUE1, 1, 0, 0).await;

    store.receive_message(QUEUE1, receive(1)).await.unwrap();
    h.advance_ms(2);
    poll(store).await;
    assert_queue_empty(store, QUEUE1).await;

    assert_queue_size(store, DEAD_LETTER_QUEUE1, 1, 0, 0).await;
    let dead = receive_one(store, DEAD_LETTER_QUEUE1).await.unwrap();
    assert_eq!(dead.message.priority, 5);
    assert_eq!(dead.message.attributes, attributes());
}

pub async fn dead_letter_topic(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(DEAD_LETTER_QUEUE1, queue_options())
        .await
        .unwrap();
    store
        .create_queue(DEAD_LETTER_QUEUE2, queue_options())
        .await
        .unwrap();
    store
        .create_topic(TOPIC1, CreateTopicOptions::default())
        .await
        .unwrap();
    store
        .subscribe(TOPIC1, TopicProtocol::Queue, DEAD_LETTER_QUEUE1)
        .await
        .unwrap();
    store
        .subscribe(TOPIC1, TopicProtocol::Queue, DEAD_LETTER_QUEUE2)
        .await
        .unwrap();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                dead_letter_topic_name: Some(TOPIC1.to_string()),
                max_receive_count: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    store
        .send_message(
            QUEUE1,
            MESSAGE1,
            SendMessageOptions {
                attributes: attributes(),
                priority: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    store.receive_message(QUEUE1, receive(1)).await.unwrap();
    h.advance_ms(2);
    poll(store).await;
    assert_queue_empty(store, QUEUE1).await;

    for queue_name in [DEAD_LETTER_QUEUE1, DEAD_LETTER_QUEUE2] {
        assert_queue_size(store, queue_name, 1, 0, 0).await;
        let dead = receive_one(store, queue_name).await.unwrap();
        assert_eq!(dead.message.priority, 5);
        assert_eq!(dead.message.attributes, attributes());
    }
}

pub async fn dead_letter_queue_id_already_present(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(DEAD_LETTER_QUEUE1, queue_options())
        .await
        .unwrap();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                max_receive_count: Some(1),
                dead_letter_queue_name: Some(DEAD_LETTER_QUEUE1.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store
        .create_topic(TOPIC1, CreateTopicOptions::default())
        .await
        .unwrap();
    for queue_name in [QUEUE1, DEAD_LETTER_QUEUE1] {
        store
            .subscribe(TOPIC1, TopicProtocol::Queue, queue_name)
            .await
            .unwrap();
    }
    let id = store
        .publish_message(TOPIC1, MESSAGE1, SendMessageOptions::default())
        .await
        .unwrap()
        .id;

    let received = store.receive_messages(QUEUE1, receive(10)).await.unwrap();
    assert_eq!(received.len(), 1);
    h.advance_ms(20);
    poll(store).await;

    // the exhausted message leaves its queue even though the id is taken
    assert_queue_empty(store, QUEUE1).await;
    assert_queue_size(store, DEAD_LETTER_QUEUE1, 2, 0, 0).await;

    let dead = store
        .receive_messages(DEAD_LETTER_QUEUE1, ReceiveMessagesOptions::default())
        .await
        .unwrap();
    assert_eq!(dead.len(), 2);
    assert_eq!(dead[0].message.id, id);
    assert_ne!(dead[1].message.id, id);
    assert_eq!(dead[1].message.body, MESSAGE1);

    for message in &dead {
        let found = store
            .get_message(DEAD_LETTER_QUEUE1, &message.message.id)
            .await
            .unwrap();
        assert_eq!(found.message.receipt_handle, Some(message.receipt_handle.clone()));
        store
            .delete_message(
                DEAD_LETTER_QUEUE1,
                &message.message.id,
                Some(&message.receipt_handle),
            )
            .await
            .unwrap();
    }
    assert_queue_empty(store, DEAD_LETTER_QUEUE1).await;

    poll(store).await;
}

pub async fn create_queue_missing_dead_letter_queue(h: &Harness) {
    let err = h
        .store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                dead_letter_queue_name: Some(DEAD_LETTER_QUEUE1.to_string()),
                max_receive_count: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}

pub async fn duplicate_queues(h: &Harness) {
    let store = h.store.as_ref();
    let options = CreateQueueOptions {
        upsert: false,
        dead_letter_queue_name: Some(DEAD_LETTER_QUEUE1.to_string()),
        dead_letter_topic_name: None,
        delay_ms: Some(1),
        message_retention_period_ms: Some(2),
        visibility_timeout_ms: Some(3),
        receive_message_wait_time_ms: Some(4),
        expires_ms: Some(5),
        max_receive_count: Some(6),
        max_message_size: Some(7),
        nak_expire_behavior: Some(NakExpireBehavior::Retry),
        tags: HashMap::from([
            ("tag1".to_string(), "tag1Value".to_string()),
            ("tag2".to_string(), "tag2Value".to_string()),
        ]),
    };

    store
        .create_queue(DEAD_LETTER_QUEUE1, queue_options())
        .await
        .unwrap();
    store.create_queue(QUEUE1, options.clone()).await.unwrap();

    let now = h.clock.now();
    let info = store.get_queue_info(QUEUE1).await.unwrap();
    assert_eq!(
        info,
        QueueInfo {
            name: QUEUE1.to_string(),
            number_of_messages: 0,
            number_of_messages_delayed: 0,
            number_of_messages_not_visible: 0,
            created: now,
            last_modified: now,
            delay_ms: Some(1),
            expires_ms: Some(5),
            expires_at: Some(add_millis(now, 5)),
            max_message_size: Some(7),
            message_retention_period_ms: Some(2),
            receive_message_wait_time_ms: Some(4),
            visibility_timeout_ms: Some(3),
            nak_expire_behavior: NakExpireBehavior::Retry,
            tags: options.tags.clone(),
            dead_letter_queue_name: Some(DEAD_LETTER_QUEUE1.to_string()),
            dead_letter_topic_name: None,
            max_receive_count: Some(6),
            paused: false,
        }
    );

    // same options again is a no-op
    store.create_queue(QUEUE1, options.clone()).await.unwrap();

    let mut changed_tags = options.tags.clone();
    changed_tags.insert("tag2".to_string(), "tag2ValueNew".to_string());
    let changes = vec![
        CreateQueueOptions {
            dead_letter_queue_name: Some(format!("{}2", DEAD_LETTER_QUEUE1)),
            ..options.clone()
        },
        CreateQueueOptions {
            delay_ms: Some(42),
            ..options.clone()
        },
        CreateQueueOptions {
            message_retention_period_ms: Some(42),
            ..options.clone()
        },
        CreateQueueOptions {
            visibility_timeout_ms: Some(42),
            ..options.clone()
        },
        CreateQueueOptions {
            receive_message_wait_time_ms: Some(42),
            ..options.clone()
        },
        CreateQueueOptions {
            expires_ms: Some(42),
            ..options.clone()
        },
        CreateQueueOptions {
            max_receive_count: Some(42),
            ..options.clone()
        },
        CreateQueueOptions {
            max_message_size: Some(42),
            ..options.clone()
        },
        CreateQueueOptions {
            nak_expire_behavior: Some(NakExpireBehavior::MoveToEnd),
            ..options.clone()
        },
        CreateQueueOptions {
            tags: changed_tags,
            ..options.clone()
        },
    ];
    for change in changes {
        let err = store.create_queue(QUEUE1, change).await.unwrap_err();
        assert!(
            matches!(err, Error::QueueAlreadyExists { .. }),
            "unexpected error: {}",
            err
        );
    }
}

pub async fn upsert_queues(h: &Harness) {
    let store = h.store.as_ref();
    let before = h.clock.now();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                max_receive_count: Some(5),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    send(store, QUEUE1, MESSAGE1).await;
    assert_eq!(
        store.get_queue_info(QUEUE1).await.unwrap().last_modified,
        before
    );
    h.advance_ms(100);

    let update_time = h.clock.now();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                upsert: true,
                max_receive_count: Some(6),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let info = store.get_queue_info(QUEUE1).await.unwrap();
    assert_eq!(info.max_receive_count, Some(6));
    assert_eq!(info.last_modified, update_time);
    assert_eq!(info.created, before);
    assert_queue_size(store, QUEUE1, 1, 0, 0).await;
}

pub async fn duplicate_queues_without_tags(h: &Harness) {
    h.store.create_queue(QUEUE1, queue_options()).await.unwrap();
    h.store.create_queue(QUEUE1, queue_options()).await.unwrap();
}

pub async fn delete_queue(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    send(store, QUEUE1, MESSAGE1).await;

    store.delete_queue(QUEUE1).await.unwrap();

    let err = store.delete_queue(QUEUE1).await.unwrap_err();
    assert!(err.to_string().contains("not found"));
}

pub async fn delete_dead_letter_queue(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(DEAD_LETTER_QUEUE1, queue_options())
        .await
        .unwrap();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                dead_letter_queue_name: Some(DEAD_LETTER_QUEUE1.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = store.delete_queue(DEAD_LETTER_QUEUE1).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "cannot delete dead letter queue \"deadLetterQueue1\", associated with queue \"queue1\""
    );
}

pub async fn get_queue_infos(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    store.create_queue(QUEUE2, queue_options()).await.unwrap();
    for body in ["test1", "test2", "test3", "test4", "test5"] {
        send(store, QUEUE2, body).await;
    }
    store
        .send_message(QUEUE2, "test-delayed", delayed(100))
        .await
        .unwrap();
    receive_one(store, QUEUE2).await.unwrap();
    receive_one(store, QUEUE2).await.unwrap();

    let infos = store.get_queue_infos().await.unwrap();
    assert_eq!(infos.len(), 2);

    assert_eq!(infos[0].name, QUEUE1);
    assert_eq!(infos[0].number_of_messages, 0);
    assert_eq!(infos[0].number_of_messages_not_visible, 0);
    assert_eq!(infos[0].number_of_messages_delayed, 0);

    assert_eq!(infos[1].name, QUEUE2);
    assert_eq!(infos[1].number_of_messages, 3);
    assert_eq!(infos[1].number_of_messages_not_visible, 2);
    assert_eq!(infos[1].number_of_messages_delayed, 1);
}

pub async fn purge_queue(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    send(store, QUEUE1, MESSAGE1).await;
    send(store, QUEUE1, MESSAGE2).await;
    send(store, QUEUE1, MESSAGE3).await;
    receive_one(store, QUEUE1).await.unwrap();

    store.purge_queue(QUEUE1).await.unwrap();
    assert_queue_empty(store, QUEUE1).await;
}

pub async fn move_messages(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                message_retention_period_ms: Some(10_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store
        .create_queue(
            QUEUE2,
            CreateQueueOptions {
                message_retention_period_ms: Some(1000),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    send(store, QUEUE1, MESSAGE1).await;
    store
        .send_message(QUEUE1, MESSAGE2, delayed(100))
        .await
        .unwrap();
    send(store, QUEUE1, MESSAGE3).await;
    send(store, QUEUE1, MESSAGE4).await;
    receive_one(store, QUEUE1).await.unwrap();

    let err = store
        .move_messages(QUEUE1, "bad-queue-name")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "queue \"bad-queue-name\" not found");
    let err = store
        .move_messages("bad-queue-name", QUEUE2)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "queue \"bad-queue-name\" not found");

    let result = store.move_messages(QUEUE1, QUEUE2).await.unwrap();
    assert_eq!(result.moved_message_count, 2);

    assert_queue_size(store, QUEUE1, 0, 1, 1).await;
    assert_queue_size(store, QUEUE2, 2, 0, 0).await;

    // delivery order survives the move
    let peeked = store
        .peek_messages(QUEUE2, PeekMessagesOptions::default())
        .await
        .unwrap();
    let bodies: Vec<_> = peeked.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec![MESSAGE3, MESSAGE4]);

    // the target queue's retention applies
    h.advance_ms(1001);
    poll(store).await;
    assert_queue_empty(store, QUEUE2).await;
}

pub async fn pause_resume(h: &Harness) {
    h.store.create_queue(QUEUE1, queue_options()).await.unwrap();
    send(h.store.as_ref(), QUEUE1, MESSAGE1).await;
    h.advance_ms(10);
    h.store.pause_queue(QUEUE1).await.unwrap();
    assert!(h.store.get_queue_info(QUEUE1).await.unwrap().paused);
    h.advance_ms(10);

    // paused: the receive waits out its full wait time
    let store = h.store.clone();
    let receiver = tokio::spawn(async move {
        store
            .receive_messages(
                QUEUE1,
                ReceiveMessagesOptions {
                    wait_time_ms: Some(1000),
                    ..Default::default()
                },
            )
            .await
    });
    wait_for_sleepers(&h.clock).await;
    h.advance_ms(999);
    h.advance_ms(1);
    assert!(receiver.await.unwrap().unwrap().is_empty());

    // resumed: a waiting receive picks the message up immediately
    let store = h.store.clone();
    let receiver = tokio::spawn(async move {
        store
            .receive_messages(
                QUEUE1,
                ReceiveMessagesOptions {
                    wait_time_ms: Some(1000),
                    max_number_of_messages: Some(1),
                    ..Default::default()
                },
            )
            .await
    });
    wait_for_sleepers(&h.clock).await;
    h.advance_ms(999);
    let resumed_at = h.clock.now();
    h.store.resume_queue(QUEUE1).await.unwrap();
    assert!(!h.store.get_queue_info(QUEUE1).await.unwrap().paused);

    let messages = receiver.await.unwrap().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(h.clock.now(), resumed_at);
}

pub async fn send_messages_batch(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();

    let results = store
        .send_messages(
            QUEUE1,
            vec![
                SendMessageEntry {
                    body: MESSAGE1.to_string(),
                    options: SendMessageOptions::default(),
                },
                SendMessageEntry {
                    body: MESSAGE2.to_string(),
                    options: priority(3),
                },
            ],
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_ne!(results[0].id, results[1].id);

    let first = receive_one(store, QUEUE1).await.unwrap();
    assert_eq!(first.message.id, results[1].id);
    assert_queue_size(store, QUEUE1, 1, 0, 1).await;
}

pub async fn deduplication_id(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    let dedup = || SendMessageOptions {
        deduplication_id: Some("order-1".to_string()),
        ..Default::default()
    };

    store.send_message(QUEUE1, MESSAGE1, dedup()).await.unwrap();
    let err = store
        .send_message(QUEUE1, MESSAGE2, dedup())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateMessage { .. }));
    assert_queue_size(store, QUEUE1, 1, 0, 0).await;

    // once delivered, the id can be reused
    receive_one(store, QUEUE1).await.unwrap();
    store.send_message(QUEUE1, MESSAGE2, dedup()).await.unwrap();
    assert_queue_size(store, QUEUE1, 1, 0, 1).await;
}

pub async fn delete_all_data(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    store
        .create_topic(TOPIC1, CreateTopicOptions::default())
        .await
        .unwrap();
    store
        .subscribe(TOPIC1, TopicProtocol::Queue, QUEUE1)
        .await
        .unwrap();
    send(store, QUEUE1, MESSAGE1).await;

    store.delete_all_data().await.unwrap();

    assert!(store.get_queue_infos().await.unwrap().is_empty());
    assert!(store.get_topic_infos().await.unwrap().is_empty());
    let err = store
        .send_message(QUEUE1, MESSAGE1, SendMessageOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueNotFound(_)));
}

// topics

pub async fn add_topic(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_topic(TOPIC1, CreateTopicOptions::default())
        .await
        .unwrap();

    let topics = store.get_topic_infos().await.unwrap();
    assert_eq!(topics.len(), 1);
    assert_eq!(topics[0].name, TOPIC1);
    assert_eq!(topics[0].created, h.clock.now());

    let err = store
        .create_topic(
            TOPIC1,
            CreateTopicOptions {
                tags: HashMap::from([("tag1".to_string(), "tag1Value".to_string())]),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TopicAlreadyExists { .. }));
}

pub async fn duplicate_topics(h: &Harness) {
    let tags = |value: &str| CreateTopicOptions {
        tags: HashMap::from([("a".to_string(), value.to_string())]),
    };
    h.store.create_topic(TOPIC1, tags("b")).await.unwrap();
    let err = h.store.create_topic(TOPIC1, tags("c")).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "topic \"topic1\" already exists: tags are different"
    );
}

pub async fn duplicate_topics_without_tags(h: &Harness) {
    h.store
        .create_topic(TOPIC1, CreateTopicOptions::default())
        .await
        .unwrap();
    h.store
        .create_topic(TOPIC1, CreateTopicOptions::default())
        .await
        .unwrap();
}

pub async fn subscribe(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    store
        .create_topic(TOPIC1, CreateTopicOptions::default())
        .await
        .unwrap();
    let subscription_id = store
        .subscribe(TOPIC1, TopicProtocol::Queue, QUEUE1)
        .await
        .unwrap();

    let topic = store.get_topic_info(TOPIC1).await.unwrap();
    assert_eq!(topic.subscriptions.len(), 1);
    assert_eq!(topic.subscriptions[0].id, subscription_id);
    assert_eq!(topic.subscriptions[0].protocol, TopicProtocol::Queue);
    assert_eq!(topic.subscriptions[0].queue_name, QUEUE1);

    let err = store
        .subscribe("bad-topic-name", TopicProtocol::Queue, QUEUE1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TopicNotFound(_)));

    let err = store
        .subscribe(TOPIC1, TopicProtocol::Queue, "bad-queue-name")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueNotFound(_)));
}

pub async fn get_topics(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    store
        .create_topic(TOPIC2, CreateTopicOptions::default())
        .await
        .unwrap();
    store
        .create_topic(TOPIC1, CreateTopicOptions::default())
        .await
        .unwrap();
    let subscription_id = store
        .subscribe(TOPIC1, TopicProtocol::Queue, QUEUE1)
        .await
        .unwrap();

    let topics = store.get_topic_infos().await.unwrap();
    assert_eq!(topics.len(), 2);
    assert_eq!(topics[0].name, TOPIC1);
    assert_eq!(topics[0].subscriptions.len(), 1);
    assert_eq!(topics[0].subscriptions[0].id, subscription_id);
    assert_eq!(topics[1].name, TOPIC2);
    assert!(topics[1].subscriptions.is_empty());
}

pub async fn delete_topic(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    store
        .create_topic(TOPIC1, CreateTopicOptions::default())
        .await
        .unwrap();
    store
        .subscribe(TOPIC1, TopicProtocol::Queue, QUEUE1)
        .await
        .unwrap();

    store.delete_topic(TOPIC1).await.unwrap();
    let err = store.delete_topic("bad-topic-name").await.unwrap_err();
    assert!(matches!(err, Error::TopicNotFound(_)));

    assert!(store.get_topic_infos().await.unwrap().is_empty());
    // the subscribed queue survives its topic
    store.get_queue_info(QUEUE1).await.unwrap();
}

pub async fn delete_dead_letter_topic(h: &Harness) {
    let store = h.store.as_ref();
    store
        .create_topic(TOPIC1, CreateTopicOptions::default())
        .await
        .unwrap();
    store
        .create_queue(
            QUEUE1,
            CreateQueueOptions {
                dead_letter_topic_name: Some(TOPIC1.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = store.delete_topic(TOPIC1).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "cannot delete dead letter topic \"topic1\", associated with queue \"queue1\""
    );
}

pub async fn publish(h: &Harness) {
    let store = h.store.as_ref();
    for queue_name in [QUEUE1, QUEUE2, QUEUE3] {
        store.create_queue(queue_name, queue_options()).await.unwrap();
    }
    store
        .create_topic(TOPIC1, CreateTopicOptions::default())
        .await
        .unwrap();
    store
        .subscribe(TOPIC1, TopicProtocol::Queue, QUEUE1)
        .await
        .unwrap();
    store
        .subscribe(TOPIC1, TopicProtocol::Queue, QUEUE2)
        .await
        .unwrap();
    h.advance_ms(1000);

    store
        .publish_message(TOPIC1, MESSAGE1, SendMessageOptions::default())
        .await
        .unwrap();
    store
        .publish_message(TOPIC1, MESSAGE2, SendMessageOptions::default())
        .await
        .unwrap();
    let err = store
        .publish_message("bad-topic-name", MESSAGE2, SendMessageOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TopicNotFound(_)));

    assert_queue_size(store, QUEUE1, 2, 0, 0).await;
    assert_queue_size(store, QUEUE2, 2, 0, 0).await;
    assert_queue_empty(store, QUEUE3).await;

    for queue_name in [QUEUE1, QUEUE2] {
        for body in [MESSAGE1, MESSAGE2] {
            let message = receive_one(store, queue_name).await.unwrap();
            assert_eq!(message.message.body, body);
        }
    }
}

pub async fn publish_checks_every_queue_size(h: &Harness) {
    let store = h.store.as_ref();
    store.create_queue(QUEUE1, queue_options()).await.unwrap();
    store
        .create_queue(
            QUEUE2,
            CreateQueueOptions {
                max_message_size: Some(4),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store
        .create_topic(TOPIC1, CreateTopicOptions::default())
        .await
        .unwrap();
    store
        .subscribe(TOPIC1, TopicProtocol::Queue, QUEUE1)
        .await
        .unwrap();
    store
        .subscribe(TOPIC1, TopicProtocol::Queue, QUEUE2)
        .await
        .unwrap();

    let err = store
        .publish_message(TOPIC1, MESSAGE1, SendMessageOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MessageExceededMaxMessageSize { size: 8, max: 4 }));

    // rejected before any queue received a copy
    assert_queue_empty(store, QUEUE1).await;
    assert_queue_empty(store, QUEUE2).await;
}
