//! Periodic sweep of the SQL store.

use std::time::Instant;

use chrono::{DateTime, Utc};
use sqlx::{AnyConnection, Row};
use tracing::{debug, error, info, warn};

use super::rows::{db_error, millis, MessageRow, MESSAGE_COLUMNS};
use super::{retain_until, CopyMode, NewMessage, SqlStore};
use crate::core::receipt::new_id;
use crate::metrics::{get_metrics, record};
use crate::types::validation::validate_message_size;
use crate::types::{CreateQueueOptions, NakExpireBehavior, SendMessageOptions};
use crate::{Error, Result};

/// What one queue sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct QueueSweep {
    retention_deleted: u64,
    dead_lettered: u64,
    expired: u64,
}

impl SqlStore {
    /// One sweep pass: expired queues, then every remaining queue on its own
    /// transaction, then wake every waiter.
    pub(super) async fn sweep(&self) -> Result<()> {
        let started = Instant::now();
        let metrics = get_metrics();
        let backend = self.backend();
        let now = self.now();

        for queue_name in self.delete_expired_queues(now).await? {
            info!(queue_name = %queue_name, "Deleted expired queue");
            self.inner.cache.invalidate(&queue_name);
        }

        let rows = {
            let mut conn = self.acquire().await?;
            self.fetch_queue_rows(&mut conn).await?
        };
        self.inner.cache.replace_all(
            rows.iter()
                .map(|row| (row.name.clone(), row.options.clone())),
        );

        for row in &rows {
            match self.sweep_queue(&row.name, &row.options, now).await {
                Ok(outcome) => {
                    record(
                        &metrics.messages_expired_total,
                        backend,
                        &row.name,
                        outcome.retention_deleted,
                    );
                    record(
                        &metrics.messages_dead_lettered_total,
                        backend,
                        &row.name,
                        outcome.dead_lettered,
                    );
                    if outcome != QueueSweep::default() {
                        debug!(
                            queue_name = %row.name,
                            retention_deleted = outcome.retention_deleted,
                            dead_lettered = outcome.dead_lettered,
                            expired = outcome.expired,
                            "Swept queue"
                        );
                    }
                }
                Err(e) => {
                    error!(queue_name = %row.name, error = %e, "Failed to sweep queue");
                    record(&metrics.sweep_failures_total, backend, &row.name, 1);
                }
            }
        }

        self.inner.triggers.trigger_all();
        metrics
            .sweep_duration_seconds
            .with_label_values(&[backend])
            .observe(started.elapsed().as_secs_f64());
        Ok(())
    }

    async fn delete_expired_queues(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let dialect = self.inner.dialect;
        let mut tx = self.begin().await?;

        let sql = dialect.sql(
            "SELECT name FROM nexq_queue WHERE expires_at IS NOT NULL AND expires_at < ?",
        );
        let names: Vec<String> = sqlx::query(&sql)
            .bind(millis(now))
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error("select expired queues"))?
            .iter()
            .map(|row| row.try_get("name"))
            .collect::<std::result::Result<_, _>>()
            .map_err(db_error("decode queue"))?;

        let delete = dialect.sql("DELETE FROM nexq_queue WHERE name = ?");
        for name in &names {
            sqlx::query(&delete)
                .bind(name.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_error("delete expired queue"))?;
        }
        tx.commit().await?;
        Ok(names)
    }

    async fn sweep_queue(
        &self,
        queue_name: &str,
        options: &CreateQueueOptions,
        now: DateTime<Utc>,
    ) -> Result<QueueSweep> {
        let dialect = self.inner.dialect;
        let now_ms = millis(now);
        let mut outcome = QueueSweep::default();
        let mut tx = self.begin().await?;

        let sql = dialect.sql(
            "DELETE FROM nexq_message \
             WHERE queue_name = ? AND retain_until IS NOT NULL AND retain_until < ?",
        );
        outcome.retention_deleted = sqlx::query(&sql)
            .bind(queue_name)
            .bind(now_ms)
            .execute(&mut *tx)
            .await
            .map_err(db_error("delete messages past retention"))?
            .rows_affected();

        if let Some(max_receive_count) = options.max_receive_count {
            let sql = format!(
                "SELECT {} FROM nexq_message WHERE queue_name = ? AND receive_count >= ? \
                 AND (expires_at IS NULL OR expires_at < ?) {}{}",
                MESSAGE_COLUMNS,
                dialect.delivery_order(),
                dialect.lock_clause()
            );
            let sql = dialect.sql(&sql);
            let rows = sqlx::query(&sql)
                .bind(queue_name)
                .bind(i64::from(max_receive_count))
                .bind(now_ms)
                .fetch_all(&mut *tx)
                .await
                .map_err(db_error("select exhausted messages"))?;
            for row in &rows {
                let message = MessageRow::from_row(row)?;
                self.dead_letter(&mut tx, queue_name, options, &message, now)
                    .await?;
            }
            outcome.dead_lettered = rows.len() as u64;
        }

        let max_filter = if options.max_receive_count.is_some() {
            " AND receive_count < ?"
        } else {
            ""
        };
        let expired = "queue_name = ? AND expires_at IS NOT NULL AND expires_at < ?";
        let behavior = options.nak_expire_behavior.unwrap_or_default();
        let sql = match behavior {
            NakExpireBehavior::Retry => format!(
                "UPDATE nexq_message SET expires_at = NULL WHERE {}{}",
                expired, max_filter
            ),
            NakExpireBehavior::MoveToEnd => format!(
                "UPDATE nexq_message SET expires_at = NULL, order_by = ?, receipt_handle = NULL \
                 WHERE {}{}",
                expired, max_filter
            ),
            NakExpireBehavior::DecreasePriorityBy(_) => format!(
                "UPDATE nexq_message SET expires_at = NULL, priority = priority - ?, \
                 receipt_handle = NULL WHERE {}{}",
                expired, max_filter
            ),
        };
        let sql = dialect.sql(&sql);
        let mut query = sqlx::query(&sql);
        query = match behavior {
            NakExpireBehavior::Retry => query,
            NakExpireBehavior::MoveToEnd => query.bind(now_ms),
            NakExpireBehavior::DecreasePriorityBy(amount) => query.bind(amount),
        };
        query = query.bind(queue_name).bind(now_ms);
        if let Some(max_receive_count) = options.max_receive_count {
            query = query.bind(i64::from(max_receive_count));
        }
        outcome.expired = query
            .execute(&mut *tx)
            .await
            .map_err(db_error("expire messages"))?
            .rows_affected();

        tx.commit().await?;
        Ok(outcome)
    }

    /// Route one exhausted message to the dead letter targets of its queue, then
    /// remove it from the queue.
    async fn dead_letter(
        &self,
        conn: &mut AnyConnection,
        queue_name: &str,
        options: &CreateQueueOptions,
        message: &MessageRow,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(topic_name) = &options.dead_letter_topic_name {
            match self.publish_dead_letter(conn, topic_name, message, now).await {
                Ok(()) => debug!(
                    queue_name = %queue_name,
                    topic_name = %topic_name,
                    message_id = %message.id,
                    "Published message to dead letter topic"
                ),
                Err(e @ Error::MessageExceededMaxMessageSize { .. }) => warn!(
                    queue_name = %queue_name,
                    topic_name = %topic_name,
                    message_id = %message.id,
                    error = %e,
                    "Skipping dead letter topic"
                ),
                Err(e) => return Err(e),
            }
        }

        match &options.dead_letter_queue_name {
            Some(dlq_name) => {
                let dlq = self.queue_options_in(conn, dlq_name).await?;
                let id = match self.fetch_message(conn, dlq_name, &message.id).await? {
                    Some(_) => new_id(),
                    None => message.id.clone(),
                };
                debug!(
                    queue_name = %queue_name,
                    dead_letter_queue_name = %dlq_name,
                    message_id = %message.id,
                    dead_letter_id = %id,
                    "Moving message to dead letter queue"
                );
                let copy = CopyMode::DeadLetter {
                    id: &id,
                    now: millis(now),
                    retain_until: retain_until(&dlq, now),
                };
                self.copy_message(conn, queue_name, dlq_name, &message.id, copy)
                    .await?;
            }
            None if options.dead_letter_topic_name.is_none() => debug!(
                queue_name = %queue_name,
                message_id = %message.id,
                "Deleting message that exceeded max receive count"
            ),
            None => {}
        }

        self.remove_message(conn, queue_name, &message.id).await?;
        Ok(())
    }

    /// Fan an exhausted message out to a topic's queues under a fresh id.
    async fn publish_dead_letter(
        &self,
        conn: &mut AnyConnection,
        topic_name: &str,
        message: &MessageRow,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut queues = Vec::new();
        for queue_name in self.subscribed_queue_names(conn, topic_name).await? {
            let queue = self.queue_options_in(conn, &queue_name).await?;
            validate_message_size(message.body.len(), queue.max_message_size)?;
            queues.push((queue_name, queue));
        }

        let id = new_id();
        let send = SendMessageOptions {
            attributes: message.attributes()?,
            priority: message.priority,
            ..Default::default()
        };
        let outgoing = NewMessage {
            id: &id,
            body: &message.body,
            options: &send,
            last_nak_reason: message.last_nak_reason.as_deref(),
        };
        for (queue_name, queue) in &queues {
            self.insert_message(conn, queue_name, queue, &outgoing, now)
                .await?;
        }
        Ok(())
    }
}
