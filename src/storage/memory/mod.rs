//! In-memory storage backend.
//!
//! All state lives behind one async read/write lock, so mutations are serialized.
//! Nothing survives a restart.

mod message;
mod queue;
mod topic;

pub use message::MemoryMessage;
pub use queue::MemoryQueue;
pub use topic::MemoryTopic;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use self::queue::NewMessage;
use crate::core::poller::{clamp_poll_interval, Poller};
use crate::core::receipt::new_id;
use crate::core::time::Clock;
use crate::core::trigger::{long_poll, TriggerRegistry};
use crate::metrics::{get_metrics, record};
use crate::storage::{listing_order, queue_options_difference, ReceiveSettings, Store};
use crate::types::validation::{
    normalize_queue_name, normalize_topic_name, validate_create_queue_options,
};
use crate::types::{
    CreateQueueOptions, CreateTopicOptions, GetMessage, Message, MoveMessagesResult,
    PeekMessagesOptions, QueueInfo, ReceiveMessagesOptions, ReceivedMessage, SendMessageOptions,
    SendMessageResult, TopicInfo, TopicProtocol, UpdateMessageOptions,
};
use crate::{Error, Result};

const BACKEND: &str = "memory";

#[derive(Debug, Default)]
struct MemoryState {
    queues: BTreeMap<String, MemoryQueue>,
    topics: BTreeMap<String, MemoryTopic>,
}

impl MemoryState {
    fn queue(&self, queue_name: &str) -> Result<&MemoryQueue> {
        self.queues
            .get(queue_name)
            .ok_or_else(|| Error::QueueNotFound(queue_name.to_string()))
    }

    fn queue_mut(&mut self, queue_name: &str) -> Result<&mut MemoryQueue> {
        self.queues
            .get_mut(queue_name)
            .ok_or_else(|| Error::QueueNotFound(queue_name.to_string()))
    }

    fn topic(&self, topic_name: &str) -> Result<&MemoryTopic> {
        self.topics
            .get(topic_name)
            .ok_or_else(|| Error::TopicNotFound(topic_name.to_string()))
    }

    fn remove_queue(&mut self, queue_name: &str) {
        self.queues.remove(queue_name);
        for topic in self.topics.values_mut() {
            topic.remove_queue(queue_name);
        }
    }

    /// Fan a message out to every subscribed queue, returning the queues reached.
    ///
    /// Sizes are checked against every queue first. After that each queue is
    /// attempted and the first failure is returned.
    fn publish(
        &mut self,
        topic_name: &str,
        body: &str,
        options: SendMessageOptions,
        last_nak_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(SendMessageResult, Vec<String>)> {
        let queue_names = self.topic(topic_name)?.queue_names();
        for queue_name in &queue_names {
            self.queue(queue_name)?.check_size(body)?;
        }

        let id = new_id();
        let mut delivered = Vec::with_capacity(queue_names.len());
        let mut first_error = None;
        for queue_name in queue_names {
            let message = NewMessage {
                id: Some(id.clone()),
                body: body.to_string(),
                options: options.clone(),
                last_nak_reason: last_nak_reason.clone(),
            };
            match self.queue_mut(&queue_name).and_then(|q| q.send(message, now)) {
                Ok(_) => delivered.push(queue_name),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok((SendMessageResult { id }, delivered)),
        }
    }

    /// Route one exhausted message to the dead letter targets of `source`.
    fn dead_letter(
        &mut self,
        source: &CreateQueueOptions,
        source_name: &str,
        mut message: MemoryMessage,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut result = Ok(());

        if let Some(topic_name) = &source.dead_letter_topic_name {
            let options = SendMessageOptions {
                attributes: message.attributes.clone(),
                priority: message.priority,
                ..Default::default()
            };
            match self.publish(
                topic_name,
                &message.body,
                options,
                message.last_nak_reason.clone(),
                now,
            ) {
                Ok(_) => debug!(
                    queue_name = %source_name,
                    topic_name = %topic_name,
                    message_id = %message.id,
                    "Published message to dead letter topic"
                ),
                Err(e @ Error::MessageExceededMaxMessageSize { .. }) => warn!(
                    queue_name = %source_name,
                    topic_name = %topic_name,
                    message_id = %message.id,
                    error = %e,
                    "Skipping dead letter topic"
                ),
                Err(e) => result = Err(e),
            }
        }

        match &source.dead_letter_queue_name {
            Some(dlq_name) => {
                let dlq = self.queue_mut(dlq_name)?;
                let source_id = message.id.clone();
                if dlq.contains(&message.id) {
                    message.id = new_id();
                }
                debug!(
                    queue_name = %source_name,
                    dead_letter_queue_name = %dlq_name,
                    message_id = %source_id,
                    dead_letter_id = %message.id,
                    "Moving message to dead letter queue"
                );
                dlq.accept_dead_letter(message, now);
            }
            None if source.dead_letter_topic_name.is_none() => debug!(
                queue_name = %source_name,
                message_id = %message.id,
                "Deleting message that exceeded max receive count"
            ),
            None => {}
        }

        result
    }
}

struct Inner {
    state: RwLock<MemoryState>,
    triggers: TriggerRegistry,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    poller: Mutex<Option<Poller>>,
}

/// In-memory store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty store. Call [`Store::start`] to run the periodic sweep.
    pub fn new(clock: Arc<dyn Clock>, poll_interval: Duration) -> Self {
        info!(
            poll_interval_ms = poll_interval.as_millis() as u64,
            "Initializing in-memory store"
        );
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(MemoryState::default()),
                triggers: TriggerRegistry::new(),
                clock,
                poll_interval,
                poller: Mutex::new(None),
            }),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    async fn sweep(&self) -> Result<()> {
        let started = Instant::now();
        let metrics = get_metrics();
        let now = self.now();
        {
            let mut state = self.inner.state.write().await;

            let expired: Vec<String> = state
                .queues
                .values()
                .filter(|q| q.is_expired(now))
                .map(|q| q.name.clone())
                .collect();
            for queue_name in expired {
                info!(queue_name = %queue_name, "Deleting expired queue");
                state.remove_queue(&queue_name);
            }

            let queue_names: Vec<String> = state.queues.keys().cloned().collect();
            for queue_name in queue_names {
                let (options, outcome) = match state.queues.get_mut(&queue_name) {
                    Some(queue) => (queue.options.clone(), queue.sweep(now)),
                    None => continue,
                };
                record(
                    &metrics.messages_expired_total,
                    BACKEND,
                    &queue_name,
                    outcome.retention_deleted,
                );
                record(
                    &metrics.messages_dead_lettered_total,
                    BACKEND,
                    &queue_name,
                    outcome.exhausted.len() as u64,
                );

                for message in outcome.exhausted {
                    if let Err(e) = state.dead_letter(&options, &queue_name, message, now) {
                        error!(queue_name = %queue_name, error = %e, "Failed to dead letter message");
                        record(&metrics.sweep_failures_total, BACKEND, &queue_name, 1);
                    }
                }
            }
        }

        self.inner.triggers.trigger_all();
        metrics
            .sweep_duration_seconds
            .with_label_values(&[BACKEND])
            .observe(started.elapsed().as_secs_f64());
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn start(&self) -> Result<()> {
        self.poll().await?;

        let interval = clamp_poll_interval(self.inner.poll_interval);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let poller = Poller::start(BACKEND, self.inner.clock.clone(), interval, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => MemoryStore { inner }.poll().await,
                    None => Ok(()),
                }
            }
        });

        let mut slot = self.inner.poller.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(poller) {
            previous.stop();
        }
        info!("In-memory store started");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let poller = self
            .inner
            .poller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(poller) = poller {
            poller.stop();
        }
        info!("In-memory store shut down");
        Ok(())
    }

    async fn poll(&self) -> Result<()> {
        self.sweep().await
    }

    async fn delete_all_data(&self) -> Result<()> {
        let mut state = self.inner.state.write().await;
        state.queues.clear();
        state.topics.clear();
        Ok(())
    }

    async fn create_queue(&self, queue_name: &str, options: CreateQueueOptions) -> Result<()> {
        let queue_name = normalize_queue_name(queue_name)?;
        validate_create_queue_options(&queue_name, &options)?;
        let now = self.now();
        let mut state = self.inner.state.write().await;

        if let Some(dlq_name) = &options.dead_letter_queue_name {
            state.queue(dlq_name)?;
        }
        if let Some(topic_name) = &options.dead_letter_topic_name {
            state.topic(topic_name)?;
        }

        match state.queues.get_mut(&queue_name) {
            Some(existing) if options.upsert => {
                existing.update(options, now);
                info!(queue_name = %queue_name, "Updated queue");
            }
            Some(existing) => {
                if let Some(reason) = queue_options_difference(&existing.options, &options) {
                    return Err(Error::QueueAlreadyExists {
                        name: queue_name,
                        reason,
                    });
                }
            }
            None => {
                let queue = MemoryQueue::new(&queue_name, options, now);
                state.queues.insert(queue_name.clone(), queue);
                info!(queue_name = %queue_name, "Created queue");
            }
        }
        Ok(())
    }

    async fn delete_queue(&self, queue_name: &str) -> Result<()> {
        let mut state = self.inner.state.write().await;
        state.queue(queue_name)?;

        if let Some(referencing) = state
            .queues
            .values()
            .find(|q| q.options.dead_letter_queue_name.as_deref() == Some(queue_name))
        {
            return Err(Error::DeleteDeadLetterQueue {
                dead_letter_queue_name: queue_name.to_string(),
                queue_name: referencing.name.clone(),
            });
        }

        state.remove_queue(queue_name);
        info!(queue_name = %queue_name, "Deleted queue");
        Ok(())
    }

    async fn purge_queue(&self, queue_name: &str) -> Result<()> {
        let mut state = self.inner.state.write().await;
        let purged = state.queue_mut(queue_name)?.purge();
        info!(queue_name = %queue_name, purged, "Purged queue");
        Ok(())
    }

    async fn get_queue_info(&self, queue_name: &str) -> Result<QueueInfo> {
        let now = self.now();
        let state = self.inner.state.read().await;
        Ok(state.queue(queue_name)?.info(now))
    }

    async fn get_queue_infos(&self) -> Result<Vec<QueueInfo>> {
        let now = self.now();
        let state = self.inner.state.read().await;
        let mut infos: Vec<QueueInfo> = state.queues.values().map(|q| q.info(now)).collect();
        infos.sort_by(|a, b| listing_order(&a.name, &b.name));
        Ok(infos)
    }

    async fn pause_queue(&self, queue_name: &str) -> Result<()> {
        let mut state = self.inner.state.write().await;
        state.queue_mut(queue_name)?.paused = true;
        info!(queue_name = %queue_name, "Paused queue");
        Ok(())
    }

    async fn resume_queue(&self, queue_name: &str) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            state.queue_mut(queue_name)?.paused = false;
        }
        self.inner.triggers.trigger(queue_name);
        info!(queue_name = %queue_name, "Resumed queue");
        Ok(())
    }

    async fn send_message(
        &self,
        queue_name: &str,
        body: &str,
        options: SendMessageOptions,
    ) -> Result<SendMessageResult> {
        let now = self.now();
        let result = {
            let mut state = self.inner.state.write().await;
            let message = NewMessage {
                body: body.to_string(),
                options,
                ..Default::default()
            };
            state.queue_mut(queue_name)?.send(message, now)?
        };
        record(&get_metrics().messages_sent_total, BACKEND, queue_name, 1);
        self.inner.triggers.trigger(queue_name);
        Ok(result)
    }

    async fn receive_messages(
        &self,
        queue_name: &str,
        options: ReceiveMessagesOptions,
    ) -> Result<Vec<ReceivedMessage>> {
        let settings = {
            let state = self.inner.state.read().await;
            ReceiveSettings::resolve(&options, &state.queue(queue_name)?.options)?
        };

        let inner = &self.inner;
        let received = long_poll(
            inner.clock.as_ref(),
            &inner.triggers,
            queue_name,
            settings.wait,
            || async move {
                let now = inner.clock.now();
                let mut state = inner.state.write().await;
                let queue = state.queue_mut(queue_name)?;
                queue.touch(now);
                queue.receive(now, settings)
            },
        )
        .await?;

        record(
            &get_metrics().messages_received_total,
            BACKEND,
            queue_name,
            received.len() as u64,
        );
        Ok(received)
    }

    async fn peek_messages(
        &self,
        queue_name: &str,
        options: PeekMessagesOptions,
    ) -> Result<Vec<Message>> {
        let now = self.now();
        let mut state = self.inner.state.write().await;
        Ok(state.queue_mut(queue_name)?.peek(now, &options))
    }

    async fn get_message(&self, queue_name: &str, message_id: &str) -> Result<GetMessage> {
        let now = self.now();
        let mut state = self.inner.state.write().await;
        state.queue_mut(queue_name)?.get(now, message_id)
    }

    async fn update_message(
        &self,
        queue_name: &str,
        message_id: &str,
        receipt_handle: Option<&str>,
        options: UpdateMessageOptions,
    ) -> Result<()> {
        let now = self.now();
        let mut state = self.inner.state.write().await;
        state
            .queue_mut(queue_name)?
            .update_message(now, message_id, receipt_handle, options)
    }

    async fn nak_message(
        &self,
        queue_name: &str,
        message_id: &str,
        receipt_handle: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        let now = self.now();
        {
            let mut state = self.inner.state.write().await;
            state
                .queue_mut(queue_name)?
                .nak(now, message_id, receipt_handle, reason)?;
        }
        self.inner.triggers.trigger(queue_name);
        Ok(())
    }

    async fn delete_message(
        &self,
        queue_name: &str,
        message_id: &str,
        receipt_handle: Option<&str>,
    ) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            state
                .queue_mut(queue_name)?
                .delete(message_id, receipt_handle)?;
        }
        record(&get_metrics().messages_deleted_total, BACKEND, queue_name, 1);
        Ok(())
    }

    async fn delete_message_by_receipt_handle(
        &self,
        queue_name: &str,
        receipt_handle: &str,
    ) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            state
                .queue_mut(queue_name)?
                .delete_by_receipt_handle(receipt_handle)?;
        }
        record(&get_metrics().messages_deleted_total, BACKEND, queue_name, 1);
        Ok(())
    }

    async fn update_message_visibility_by_receipt_handle(
        &self,
        queue_name: &str,
        receipt_handle: &str,
        visibility_timeout_ms: u64,
    ) -> Result<()> {
        let now = self.now();
        let mut state = self.inner.state.write().await;
        state.queue_mut(queue_name)?.update_visibility_by_receipt_handle(
            now,
            receipt_handle,
            visibility_timeout_ms,
        )
    }

    async fn move_messages(
        &self,
        source_queue_name: &str,
        target_queue_name: &str,
    ) -> Result<MoveMessagesResult> {
        let now = self.now();
        let moved_message_count = {
            let mut state = self.inner.state.write().await;
            state.queue(source_queue_name)?;
            state.queue(target_queue_name)?;
            if source_queue_name == target_queue_name {
                return Ok(MoveMessagesResult {
                    moved_message_count: 0,
                });
            }

            let target = state.queue(target_queue_name)?;
            if let Some(id) = state
                .queue(source_queue_name)?
                .available_ids(now)
                .into_iter()
                .find(|id| target.contains(id))
            {
                return Err(Error::duplicate_message(target_queue_name, id));
            }

            let messages = state.queue_mut(source_queue_name)?.take_available(now);
            let count = messages.len() as u64;
            let target = state.queue_mut(target_queue_name)?;
            for message in messages {
                target.accept_moved(message, now);
            }
            count
        };

        info!(
            source_queue_name = %source_queue_name,
            target_queue_name = %target_queue_name,
            moved_message_count,
            "Moved messages"
        );
        self.inner.triggers.trigger(target_queue_name);
        Ok(MoveMessagesResult {
            moved_message_count,
        })
    }

    async fn create_topic(&self, topic_name: &str, options: CreateTopicOptions) -> Result<()> {
        let topic_name = normalize_topic_name(topic_name)?;
        let now = self.now();
        let mut state = self.inner.state.write().await;

        match state.topics.get(&topic_name) {
            Some(existing) if existing.tags != options.tags => Err(Error::TopicAlreadyExists {
                name: topic_name,
                reason: "tags are different".to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                let topic = MemoryTopic::new(&topic_name, options, now);
                state.topics.insert(topic_name.clone(), topic);
                info!(topic_name = %topic_name, "Created topic");
                Ok(())
            }
        }
    }

    async fn delete_topic(&self, topic_name: &str) -> Result<()> {
        let mut state = self.inner.state.write().await;
        state.topic(topic_name)?;

        if let Some(referencing) = state
            .queues
            .values()
            .find(|q| q.options.dead_letter_topic_name.as_deref() == Some(topic_name))
        {
            return Err(Error::DeleteDeadLetterTopic {
                dead_letter_topic_name: topic_name.to_string(),
                queue_name: referencing.name.clone(),
            });
        }

        state.topics.remove(topic_name);
        info!(topic_name = %topic_name, "Deleted topic");
        Ok(())
    }

    async fn get_topic_info(&self, topic_name: &str) -> Result<TopicInfo> {
        let state = self.inner.state.read().await;
        Ok(state.topic(topic_name)?.info())
    }

    async fn get_topic_infos(&self) -> Result<Vec<TopicInfo>> {
        let state = self.inner.state.read().await;
        let mut infos: Vec<TopicInfo> = state.topics.values().map(|t| t.info()).collect();
        infos.sort_by(|a, b| listing_order(&a.name, &b.name));
        Ok(infos)
    }

    async fn subscribe(
        &self,
        topic_name: &str,
        protocol: TopicProtocol,
        queue_name: &str,
    ) -> Result<String> {
        let mut state = self.inner.state.write().await;
        state.topic(topic_name)?;
        state.queue(queue_name)?;

        let id = match protocol {
            TopicProtocol::Queue => state
                .topics
                .get_mut(topic_name)
                .ok_or_else(|| Error::TopicNotFound(topic_name.to_string()))?
                .subscribe_queue(queue_name),
        };
        info!(topic_name = %topic_name, queue_name = %queue_name, "Subscribed queue to topic");
        Ok(id)
    }

    async fn publish_message(
        &self,
        topic_name: &str,
        body: &str,
        options: SendMessageOptions,
    ) -> Result<SendMessageResult> {
        let now = self.now();
        let outcome = {
            let mut state = self.inner.state.write().await;
            state.publish(topic_name, body, options, None, now)
        };

        match outcome {
            Ok((result, delivered)) => {
                let metrics = get_metrics();
                for queue_name in &delivered {
                    record(&metrics.messages_sent_total, BACKEND, queue_name, 1);
                    self.inner.triggers.trigger(queue_name);
                }
                Ok(result)
            }
            Err(e) => {
                // partial deliveries may still have waiters to wake
                self.inner.triggers.trigger_all();
                Err(e)
            }
        }
    }
}
