//! SQL storage backend for SQLite and PostgreSQL.
//!
//! One implementation serves both databases through the sqlx `Any` driver; the
//! differences live in [`Dialect`]. Several processes may share a PostgreSQL
//! database: receives lock rows with `FOR UPDATE SKIP LOCKED` and a listener
//! turns table notifications into local wake-ups. SQLite is single writer and
//! relies on waiter timeouts and the sweep for cross-process changes.

mod cache;
pub mod dialect;
pub mod listener;
mod rows;
mod sweep;

pub use cache::QueueCache;
pub use dialect::Dialect;

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::AnyPoolOptions;
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyConnection, AnyPool, Executor, Row, Transaction};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use self::rows::{
    db_error, encode_attributes, encode_tags, insert_error, millis, subscription_from_row,
    MessageCounts, MessageRow, QueueOptionColumns, QueueRow, TopicRow, MESSAGE_COLUMNS,
    QUEUE_COLUMNS,
};
use crate::core::poller::{clamp_poll_interval, Poller};
use crate::core::receipt::{generate_receipt_handle, new_id};
use crate::core::time::{add_millis, Clock};
use crate::core::trigger::{long_poll, TriggerRegistry};
use crate::metrics::{get_metrics, record};
use crate::storage::{listing_order, queue_options_difference, ReceiveSettings, Store};
use crate::types::validation::{
    normalize_queue_name, normalize_topic_name, validate_create_queue_options,
    validate_message_size,
};
use crate::types::{
    CreateQueueOptions, CreateTopicOptions, GetMessage, Message, MoveMessagesResult,
    PeekMessagesOptions, QueueInfo, ReceiveMessagesOptions, ReceivedMessage, SendMessageOptions,
    SendMessageResult, SubscriptionInfo, TopicInfo, TopicProtocol, UpdateMessageOptions,
};
use crate::{Error, Result};

/// Connection settings of a [`SqlStore`].
#[derive(Debug, Clone)]
pub struct SqlStoreOptions {
    /// `sqlite:` or `postgres://` URL.
    pub database_url: String,
    /// Pool size.
    pub max_connections: u32,
    /// Sweep interval.
    pub poll_interval: Duration,
}

#[derive(Default)]
struct Tasks {
    poller: Option<Poller>,
    listener: Option<JoinHandle<()>>,
}

struct Inner {
    pool: AnyPool,
    dialect: Dialect,
    database_url: String,
    clock: Arc<dyn Clock>,
    triggers: Arc<TriggerRegistry>,
    cache: Arc<QueueCache>,
    write_lock: tokio::sync::Mutex<()>,
    poll_interval: Duration,
    tasks: Mutex<Tasks>,
}

/// SQL-backed store.
#[derive(Clone)]
pub struct SqlStore {
    inner: Arc<Inner>,
}

/// A transaction, holding the in-process write lock on single-writer databases.
///
/// Dropping it without [`SqlTx::commit`] rolls back.
pub(crate) struct SqlTx<'a> {
    tx: Transaction<'static, Any>,
    _write: Option<tokio::sync::MutexGuard<'a, ()>>,
}

impl SqlTx<'_> {
    async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(db_error("commit transaction"))
    }
}

impl Deref for SqlTx<'_> {
    type Target = AnyConnection;

    fn deref(&self) -> &AnyConnection {
        &self.tx
    }
}

impl DerefMut for SqlTx<'_> {
    fn deref_mut(&mut self) -> &mut AnyConnection {
        &mut self.tx
    }
}

/// A message about to be inserted.
pub(crate) struct NewMessage<'a> {
    pub id: &'a str,
    pub body: &'a str,
    pub options: &'a SendMessageOptions,
    pub last_nak_reason: Option<&'a str>,
}

/// SQL predicate for available messages. Binds: now, now.
const AVAILABLE: &str =
    "(expires_at IS NULL OR expires_at < ?) AND (delay_until IS NULL OR delay_until <= ?)";

impl SqlStore {
    /// Connect, run migrations and build the store. Call [`Store::start`] to run
    /// the sweep and the notification listener.
    pub async fn connect(options: SqlStoreOptions, clock: Arc<dyn Clock>) -> Result<Self> {
        let dialect = Dialect::from_url(&options.database_url)?;
        info!(
            backend = dialect.name(),
            max_connections = options.max_connections,
            poll_interval_ms = options.poll_interval.as_millis() as u64,
            "Initializing SQL store"
        );

        sqlx::any::install_default_drivers();
        let in_memory = options.database_url.contains(":memory:")
            || options.database_url.contains("mode=memory");
        let pool = AnyPoolOptions::new()
            .max_connections(options.max_connections)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if dialect == Dialect::Sqlite {
                        conn.execute("PRAGMA foreign_keys = ON").await?;
                        conn.execute("PRAGMA busy_timeout = 5000").await?;
                        if !in_memory {
                            conn.execute("PRAGMA journal_mode = WAL").await?;
                        }
                    }
                    Ok(())
                })
            })
            .connect(&options.database_url)
            .await
            .map_err(db_error("connect to database"))?;

        let migrator = match dialect {
            Dialect::Sqlite => sqlx::migrate!("./migrations/sqlite"),
            Dialect::Postgres => sqlx::migrate!("./migrations/postgres"),
        };
        migrator
            .run(&pool)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to run migrations: {}", e)))?;

        info!(backend = dialect.name(), "SQL store initialized");
        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                dialect,
                database_url: options.database_url,
                clock,
                triggers: Arc::new(TriggerRegistry::new()),
                cache: Arc::new(QueueCache::new()),
                write_lock: tokio::sync::Mutex::new(()),
                poll_interval: options.poll_interval,
                tasks: Mutex::new(Tasks::default()),
            }),
        })
    }

    /// The database dialect.
    pub fn dialect(&self) -> Dialect {
        self.inner.dialect
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    fn backend(&self) -> &'static str {
        self.inner.dialect.name()
    }

    async fn acquire(&self) -> Result<PoolConnection<Any>> {
        self.inner
            .pool
            .acquire()
            .await
            .map_err(db_error("acquire connection"))
    }

    async fn begin(&self) -> Result<SqlTx<'_>> {
        let write = if self.inner.dialect.single_writer() {
            Some(self.inner.write_lock.lock().await)
        } else {
            None
        };
        let tx = self
            .inner
            .pool
            .begin()
            .await
            .map_err(db_error("begin transaction"))?;
        Ok(SqlTx { tx, _write: write })
    }

    async fn fetch_queue_row(
        &self,
        conn: &mut AnyConnection,
        queue_name: &str,
    ) -> Result<Option<QueueRow>> {
        let sql = format!("SELECT {} FROM nexq_queue WHERE name = ?", QUEUE_COLUMNS);
        let sql = self.inner.dialect.sql(&sql);
        let row = sqlx::query(&sql)
            .bind(queue_name)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error("load queue"))?;
        row.as_ref().map(QueueRow::from_row).transpose()
    }

    async fn fetch_queue_rows(&self, conn: &mut AnyConnection) -> Result<Vec<QueueRow>> {
        let sql = format!("SELECT {} FROM nexq_queue", QUEUE_COLUMNS);
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_error("list queues"))?;
        rows.iter().map(QueueRow::from_row).collect()
    }

    async fn require_queue_row(
        &self,
        conn: &mut AnyConnection,
        queue_name: &str,
    ) -> Result<QueueRow> {
        self.fetch_queue_row(conn, queue_name)
            .await?
            .ok_or_else(|| Error::QueueNotFound(queue_name.to_string()))
    }

    /// Queue options, from the cache or loaded through `conn`.
    async fn queue_options_in(
        &self,
        conn: &mut AnyConnection,
        queue_name: &str,
    ) -> Result<CreateQueueOptions> {
        if let Some(options) = self.inner.cache.get(queue_name) {
            return Ok(options);
        }
        let row = self.require_queue_row(conn, queue_name).await?;
        self.inner.cache.put(queue_name, row.options.clone());
        Ok(row.options)
    }

    async fn queue_options(&self, queue_name: &str) -> Result<CreateQueueOptions> {
        if let Some(options) = self.inner.cache.get(queue_name) {
            return Ok(options);
        }
        let mut conn = self.acquire().await?;
        self.queue_options_in(&mut conn, queue_name).await
    }

    async fn message_counts(
        &self,
        conn: &mut AnyConnection,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<MessageCounts> {
        let now = millis(now);
        let sql = self.inner.dialect.sql(MessageCounts::QUERY);
        let row = sqlx::query(&sql)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(queue_name)
            .fetch_one(&mut *conn)
            .await
            .map_err(db_error("count messages"))?;
        MessageCounts::from_row(&row)
    }

    async fn fetch_message(
        &self,
        conn: &mut AnyConnection,
        queue_name: &str,
        message_id: &str,
    ) -> Result<Option<MessageRow>> {
        let sql = format!(
            "SELECT {} FROM nexq_message WHERE queue_name = ? AND id = ?",
            MESSAGE_COLUMNS
        );
        let sql = self.inner.dialect.sql(&sql);
        let row = sqlx::query(&sql)
            .bind(queue_name)
            .bind(message_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error("load message"))?;
        row.as_ref().map(MessageRow::from_row).transpose()
    }

    /// Error for a write that matched no row: wrong handle if the message
    /// exists, unknown message otherwise.
    async fn missed_write(
        &self,
        conn: &mut AnyConnection,
        queue_name: &str,
        message_id: &str,
        receipt_handle: &str,
    ) -> Result<Error> {
        Ok(match self.fetch_message(conn, queue_name, message_id).await? {
            Some(_) => Error::receipt_handle_invalid(queue_name, receipt_handle),
            None => Error::message_not_found(queue_name, message_id),
        })
    }

    async fn topic_row(&self, conn: &mut AnyConnection, topic_name: &str) -> Result<Option<TopicRow>> {
        let sql = format!("SELECT {} FROM nexq_topic WHERE name = ?", TopicRow::COLUMNS);
        let sql = self.inner.dialect.sql(&sql);
        let row = sqlx::query(&sql)
            .bind(topic_name)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error("load topic"))?;
        row.as_ref().map(TopicRow::from_row).transpose()
    }

    async fn subscriptions(
        &self,
        conn: &mut AnyConnection,
        topic_name: &str,
    ) -> Result<Vec<SubscriptionInfo>> {
        let sql = self.inner.dialect.sql(
            "SELECT id, protocol, queue_name FROM nexq_subscription \
             WHERE topic_name = ? ORDER BY queue_name",
        );
        let rows = sqlx::query(&sql)
            .bind(topic_name)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_error("list subscriptions"))?;
        rows.iter().map(subscription_from_row).collect()
    }

    /// Insert one message after size and deduplication checks.
    async fn insert_message(
        &self,
        conn: &mut AnyConnection,
        queue_name: &str,
        queue: &CreateQueueOptions,
        message: &NewMessage<'_>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        validate_message_size(message.body.len(), queue.max_message_size)?;

        if let Some(dedup_id) = &message.options.deduplication_id {
            let sql = self.inner.dialect.sql(
                "SELECT id FROM nexq_message \
                 WHERE queue_name = ? AND deduplication_id = ? AND receive_count = 0 LIMIT 1",
            );
            let pending = sqlx::query(&sql)
                .bind(queue_name)
                .bind(dedup_id.as_str())
                .fetch_optional(&mut *conn)
                .await
                .map_err(db_error("check deduplication id"))?;
            if pending.is_some() {
                return Err(Error::duplicate_message(queue_name, dedup_id));
            }
        }

        let delay_ms = message.options.delay_ms.or(queue.delay_ms);
        let sql = self.inner.dialect.sql(
            "INSERT INTO nexq_message (id, queue_name, priority, sent_at, order_by, retain_until, \
             message_body, receive_count, attributes, delay_until, last_nak_reason, deduplication_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)",
        );
        sqlx::query(&sql)
            .bind(message.id)
            .bind(queue_name)
            .bind(message.options.priority)
            .bind(millis(now))
            .bind(millis(now))
            .bind(retain_until(queue, now))
            .bind(message.body)
            .bind(encode_attributes(&message.options.attributes)?)
            .bind(delay_ms.map(|ms| millis(add_millis(now, ms))))
            .bind(message.last_nak_reason)
            .bind(message.options.deduplication_id.as_deref())
            .execute(&mut *conn)
            .await
            .map_err(|e| insert_error(queue_name, message.id, e))?;
        Ok(())
    }

    /// Copy a message row into another queue, re-stamping the fields the
    /// target owns. The new row sorts after every existing tie.
    async fn copy_message(
        &self,
        conn: &mut AnyConnection,
        source_queue_name: &str,
        target_queue_name: &str,
        message_id: &str,
        copy: CopyMode<'_>,
    ) -> Result<()> {
        let sql = match copy {
            CopyMode::Move { .. } => {
                "INSERT INTO nexq_message (id, queue_name, priority, sent_at, order_by, retain_until, \
                 message_body, receive_count, attributes, expires_at, delay_until, receipt_handle, \
                 first_received_at, last_nak_reason, deduplication_id) \
                 SELECT id, ?, priority, sent_at, order_by, ?, message_body, receive_count, \
                 attributes, expires_at, delay_until, receipt_handle, first_received_at, \
                 last_nak_reason, NULL \
                 FROM nexq_message WHERE queue_name = ? AND id = ?"
            }
            CopyMode::DeadLetter { .. } => {
                "INSERT INTO nexq_message (id, queue_name, priority, sent_at, order_by, retain_until, \
                 message_body, receive_count, attributes, expires_at, delay_until, receipt_handle, \
                 first_received_at, last_nak_reason, deduplication_id) \
                 SELECT ?, ?, priority, ?, ?, ?, message_body, 0, attributes, NULL, NULL, NULL, \
                 first_received_at, last_nak_reason, NULL \
                 FROM nexq_message WHERE queue_name = ? AND id = ?"
            }
        };
        let sql = self.inner.dialect.sql(sql);
        let (query, target_id) = match copy {
            CopyMode::Move { retain_until } => (
                sqlx::query(&sql).bind(target_queue_name).bind(retain_until),
                message_id,
            ),
            CopyMode::DeadLetter {
                id,
                now,
                retain_until,
            } => (
                sqlx::query(&sql)
                    .bind(id)
                    .bind(target_queue_name)
                    .bind(now)
                    .bind(now)
                    .bind(retain_until),
                id,
            ),
        };
        query
            .bind(source_queue_name)
            .bind(message_id)
            .execute(&mut *conn)
            .await
            .map_err(|e| insert_error(target_queue_name, target_id, e))?;
        Ok(())
    }

    async fn remove_message(
        &self,
        conn: &mut AnyConnection,
        queue_name: &str,
        message_id: &str,
    ) -> Result<u64> {
        let sql = self
            .inner
            .dialect
            .sql("DELETE FROM nexq_message WHERE queue_name = ? AND id = ?");
        let result = sqlx::query(&sql)
            .bind(queue_name)
            .bind(message_id)
            .execute(&mut *conn)
            .await
            .map_err(db_error("delete message"))?;
        Ok(result.rows_affected())
    }

    async fn subscribed_queue_names(
        &self,
        conn: &mut AnyConnection,
        topic_name: &str,
    ) -> Result<Vec<String>> {
        Ok(self
            .subscriptions(conn, topic_name)
            .await?
            .into_iter()
            .map(|s| s.queue_name)
            .collect())
    }

    /// One receive attempt: touch the queue, then claim available messages.
    async fn try_receive(
        &self,
        queue_name: &str,
        queue: &CreateQueueOptions,
        settings: ReceiveSettings,
    ) -> Result<Vec<ReceivedMessage>> {
        let now = self.now();
        let dialect = self.inner.dialect;
        let mut tx = self.begin().await?;

        let sql = dialect.sql("SELECT paused FROM nexq_queue WHERE name = ?");
        let row = sqlx::query(&sql)
            .bind(queue_name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error("load queue"))?;
        let paused: i64 = match row {
            Some(row) => row.try_get("paused").map_err(db_error("decode queue"))?,
            None => {
                self.inner.cache.invalidate(queue_name);
                return Err(Error::QueueNotFound(queue_name.to_string()));
            }
        };

        if let Some(expires_ms) = queue.expires_ms {
            let sql = dialect.sql("UPDATE nexq_queue SET expires_at = ? WHERE name = ?");
            sqlx::query(&sql)
                .bind(millis(add_millis(now, expires_ms)))
                .bind(queue_name)
                .execute(&mut *tx)
                .await
                .map_err(db_error("touch queue"))?;
        }

        if paused != 0 {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let max_filter = if queue.max_receive_count.is_some() {
            " AND receive_count < ?"
        } else {
            ""
        };
        let sql = format!(
            "SELECT {} FROM nexq_message WHERE queue_name = ? AND {}{} {} LIMIT ?{}",
            MESSAGE_COLUMNS,
            AVAILABLE,
            max_filter,
            dialect.delivery_order(),
            dialect.lock_clause()
        );
        let sql = dialect.sql(&sql);
        let mut query = sqlx::query(&sql)
            .bind(queue_name)
            .bind(millis(now))
            .bind(millis(now));
        if let Some(max) = queue.max_receive_count {
            query = query.bind(i64::from(max));
        }
        let rows = query
            .bind(settings.max_number_of_messages as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error("select messages"))?;

        let update = dialect.sql(
            "UPDATE nexq_message SET expires_at = ?, receipt_handle = ?, \
             receive_count = receive_count + 1, first_received_at = COALESCE(first_received_at, ?) \
             WHERE queue_name = ? AND id = ?",
        );
        let mut received = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut message = MessageRow::from_row(row)?;
            let receipt_handle = generate_receipt_handle(queue_name, &message.id)?;
            let expires_at = millis(add_millis(now, settings.visibility_timeout_ms));
            sqlx::query(&update)
                .bind(expires_at)
                .bind(receipt_handle.as_str())
                .bind(millis(now))
                .bind(queue_name)
                .bind(message.id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_error("claim message"))?;

            message.expires_at = Some(expires_at);
            message.receipt_handle = Some(receipt_handle.clone());
            message.receive_count += 1;
            message.first_received_at.get_or_insert(millis(now));
            received.push(ReceivedMessage {
                message: message.to_message(now)?,
                receipt_handle,
            });
        }

        tx.commit().await?;
        Ok(received)
    }

    fn trigger(&self, queue_name: &str) {
        self.inner.triggers.trigger(queue_name);
    }
}

/// How [`SqlStore::copy_message`] stamps the copy.
#[derive(Debug, Clone, Copy)]
enum CopyMode<'a> {
    /// Keep id and delivery state, take the target's retention.
    Move { retain_until: Option<i64> },
    /// Insert as `id`, resetting delivery state and sending it anew at `now`.
    DeadLetter {
        id: &'a str,
        now: i64,
        retain_until: Option<i64>,
    },
}

/// UPDATE for the requested fields only, guarded by the receipt handle when
/// one is given so a concurrent claim is never overwritten. `None` when
/// nothing was requested.
///
/// Binds: the requested fields in declaration order, queue name, id, then
/// the handle.
fn update_message_sql(options: &UpdateMessageOptions, guard_handle: bool) -> Option<String> {
    let mut columns = Vec::new();
    if options.priority.is_some() {
        columns.push("priority = ?");
    }
    if options.attributes.is_some() {
        columns.push("attributes = ?");
    }
    if options.visibility_timeout_ms.is_some() {
        columns.push("expires_at = ?");
    }
    if columns.is_empty() {
        return None;
    }
    let guard = if guard_handle {
        " AND receipt_handle = ?"
    } else {
        ""
    };
    Some(format!(
        "UPDATE nexq_message SET {} WHERE queue_name = ? AND id = ?{}",
        columns.join(", "),
        guard
    ))
}

fn retain_until(queue: &CreateQueueOptions, now: DateTime<Utc>) -> Option<i64> {
    queue
        .message_retention_period_ms
        .map(|ms| millis(add_millis(now, ms)))
}

/// Options as stored: no upsert flag and an explicit nak behavior.
fn stored_options(options: &CreateQueueOptions) -> CreateQueueOptions {
    CreateQueueOptions {
        upsert: false,
        nak_expire_behavior: Some(options.nak_expire_behavior.unwrap_or_default()),
        ..options.clone()
    }
}

#[async_trait]
impl Store for SqlStore {
    async fn start(&self) -> Result<()> {
        self.poll().await?;

        let interval = clamp_poll_interval(self.inner.poll_interval);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let poller = Poller::start(
            self.backend(),
            self.inner.clock.clone(),
            interval,
            move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => SqlStore { inner }.poll().await,
                        None => Ok(()),
                    }
                }
            },
        );

        let listener = if self.inner.dialect.supports_notifications() {
            let handler = listener::ChangeHandler::new(
                self.inner.cache.clone(),
                self.inner.triggers.clone(),
            );
            Some(listener::spawn(self.inner.database_url.clone(), handler))
        } else {
            None
        };

        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = tasks.poller.replace(poller) {
            previous.stop();
        }
        if let Some(previous) = std::mem::replace(&mut tasks.listener, listener) {
            previous.abort();
        }
        info!(backend = self.backend(), "SQL store started");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let (poller, listener) = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            (tasks.poller.take(), tasks.listener.take())
        };
        if let Some(poller) = poller {
            poller.stop();
        }
        if let Some(listener) = listener {
            listener.abort();
        }
        self.inner.pool.close().await;
        info!(backend = self.backend(), "SQL store shut down");
        Ok(())
    }

    async fn poll(&self) -> Result<()> {
        self.sweep().await
    }

    async fn delete_all_data(&self) -> Result<()> {
        let mut tx = self.begin().await?;
        for table in ["nexq_subscription", "nexq_message", "nexq_topic", "nexq_queue"] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await
                .map_err(db_error("delete data"))?;
        }
        tx.commit().await?;
        self.inner.cache.clear();
        warn!(backend = self.backend(), "Deleted all data");
        Ok(())
    }

    async fn create_queue(&self, queue_name: &str, options: CreateQueueOptions) -> Result<()> {
        let queue_name = normalize_queue_name(queue_name)?;
        validate_create_queue_options(&queue_name, &options)?;
        let now = self.now();
        let dialect = self.inner.dialect;
        let mut tx = self.begin().await?;

        if let Some(dlq_name) = &options.dead_letter_queue_name {
            self.require_queue_row(&mut tx, dlq_name).await?;
        }
        if let Some(topic_name) = &options.dead_letter_topic_name {
            if self.topic_row(&mut tx, topic_name).await?.is_none() {
                return Err(Error::TopicNotFound(topic_name.clone()));
            }
        }

        let stored = stored_options(&options);
        let columns = QueueOptionColumns::new(&stored)?;
        let expires_at = options.expires_ms.map(|ms| millis(add_millis(now, ms)));

        match self.fetch_queue_row(&mut tx, &queue_name).await? {
            Some(_) if options.upsert => {
                let sql = dialect.sql(
                    "UPDATE nexq_queue SET last_modified_at = ?, expires_at = ?, \
                     dead_letter_queue_name = ?, dead_letter_topic_name = ?, delay_ms = ?, \
                     message_retention_period_ms = ?, visibility_timeout_ms = ?, \
                     receive_message_wait_time_ms = ?, expires_ms = ?, max_receive_count = ?, \
                     max_message_size = ?, nak_expire_behavior = ?, tags = ? WHERE name = ?",
                );
                sqlx::query(&sql)
                    .bind(millis(now))
                    .bind(expires_at)
                    .bind(columns.dead_letter_queue_name)
                    .bind(columns.dead_letter_topic_name)
                    .bind(columns.delay_ms)
                    .bind(columns.message_retention_period_ms)
                    .bind(columns.visibility_timeout_ms)
                    .bind(columns.receive_message_wait_time_ms)
                    .bind(columns.expires_ms)
                    .bind(columns.max_receive_count)
                    .bind(columns.max_message_size)
                    .bind(columns.nak_expire_behavior)
                    .bind(columns.tags)
                    .bind(queue_name.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error("update queue"))?;
                tx.commit().await?;
                info!(queue_name = %queue_name, "Updated queue");
            }
            Some(existing) => {
                if let Some(reason) = queue_options_difference(&existing.options, &options) {
                    return Err(Error::QueueAlreadyExists {
                        name: queue_name,
                        reason,
                    });
                }
                return Ok(());
            }
            None => {
                let sql = dialect.sql(
                    "INSERT INTO nexq_queue (name, created_at, last_modified_at, expires_at, paused, \
                     dead_letter_queue_name, dead_letter_topic_name, delay_ms, \
                     message_retention_period_ms, visibility_timeout_ms, \
                     receive_message_wait_time_ms, expires_ms, max_receive_count, \
                     max_message_size, nak_expire_behavior, tags) \
                     VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                );
                sqlx::query(&sql)
                    .bind(queue_name.as_str())
                    .bind(millis(now))
                    .bind(millis(now))
                    .bind(expires_at)
                    .bind(columns.dead_letter_queue_name)
                    .bind(columns.dead_letter_topic_name)
                    .bind(columns.delay_ms)
                    .bind(columns.message_retention_period_ms)
                    .bind(columns.visibility_timeout_ms)
                    .bind(columns.receive_message_wait_time_ms)
                    .bind(columns.expires_ms)
                    .bind(columns.max_receive_count)
                    .bind(columns.max_message_size)
                    .bind(columns.nak_expire_behavior)
                    .bind(columns.tags)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error("create queue"))?;
                tx.commit().await?;
                info!(queue_name = %queue_name, "Created queue");
            }
        }

        self.inner.cache.put(&queue_name, stored);
        Ok(())
    }

    async fn delete_queue(&self, queue_name: &str) -> Result<()> {
        let dialect = self.inner.dialect;
        let mut tx = self.begin().await?;
        self.require_queue_row(&mut tx, queue_name).await?;

        let sql = dialect.sql(
            "SELECT name FROM nexq_queue WHERE dead_letter_queue_name = ? ORDER BY name LIMIT 1",
        );
        let referencing = sqlx::query(&sql)
            .bind(queue_name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error("check dead letter references"))?;
        if let Some(row) = referencing {
            return Err(Error::DeleteDeadLetterQueue {
                dead_letter_queue_name: queue_name.to_string(),
                queue_name: row.try_get("name").map_err(db_error("decode queue"))?,
            });
        }

        let sql = dialect.sql("DELETE FROM nexq_queue WHERE name = ?");
        sqlx::query(&sql)
            .bind(queue_name)
            .execute(&mut *tx)
            .await
            .map_err(db_error("delete queue"))?;
        tx.commit().await?;

        self.inner.cache.invalidate(queue_name);
        info!(queue_name = %queue_name, "Deleted queue");
        Ok(())
    }

    async fn purge_queue(&self, queue_name: &str) -> Result<()> {
        self.queue_options(queue_name).await?;
        let mut tx = self.begin().await?;
        let sql = self
            .inner
            .dialect
            .sql("DELETE FROM nexq_message WHERE queue_name = ?");
        let result = sqlx::query(&sql)
            .bind(queue_name)
            .execute(&mut *tx)
            .await
            .map_err(db_error("purge queue"))?;
        tx.commit().await?;
        info!(queue_name = %queue_name, purged = result.rows_affected(), "Purged queue");
        Ok(())
    }

    async fn get_queue_info(&self, queue_name: &str) -> Result<QueueInfo> {
        let now = self.now();
        let mut conn = self.acquire().await?;
        let row = self.require_queue_row(&mut conn, queue_name).await?;
        let counts = self.message_counts(&mut conn, queue_name, now).await?;
        Ok(row.info(counts))
    }

    async fn get_queue_infos(&self) -> Result<Vec<QueueInfo>> {
        let now = self.now();
        let mut conn = self.acquire().await?;
        let rows = self.fetch_queue_rows(&mut conn).await?;
        let mut infos = Vec::with_capacity(rows.len());
        for row in rows {
            let counts = self.message_counts(&mut conn, &row.name, now).await?;
            infos.push(row.info(counts));
        }
        infos.sort_by(|a, b| listing_order(&a.name, &b.name));
        Ok(infos)
    }

    async fn pause_queue(&self, queue_name: &str) -> Result<()> {
        set_paused(self, queue_name, true).await?;
        info!(queue_name = %queue_name, "Paused queue");
        Ok(())
    }

    async fn resume_queue(&self, queue_name: &str) -> Result<()> {
        set_paused(self, queue_name, false).await?;
        self.trigger(queue_name);
        info!(queue_name = %queue_name, "Resumed queue");
        Ok(())
    }

    async fn send_message(
        &self,
        queue_name: &str,
        body: &str,
        options: SendMessageOptions,
    ) -> Result<SendMessageResult> {
        let queue = self.queue_options(queue_name).await?;
        let now = self.now();
        let id = new_id();

        let mut tx = self.begin().await?;
        let message = NewMessage {
            id: &id,
            body,
            options: &options,
            last_nak_reason: None,
        };
        self.insert_message(&mut tx, queue_name, &queue, &message, now)
            .await?;
        tx.commit().await?;

        record(&get_metrics().messages_sent_total, self.backend(), queue_name, 1);
        self.trigger(queue_name);
        Ok(SendMessageResult { id })
    }

    async fn receive_messages(
        &self,
        queue_name: &str,
        options: ReceiveMessagesOptions,
    ) -> Result<Vec<ReceivedMessage>> {
        let queue = self.queue_options(queue_name).await?;
        let settings = ReceiveSettings::resolve(&options, &queue)?;

        let received = long_poll(
            self.inner.clock.as_ref(),
            &self.inner.triggers,
            queue_name,
            settings.wait,
            || self.try_receive(queue_name, &queue, settings),
        )
        .await?;

        record(
            &get_metrics().messages_received_total,
            self.backend(),
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
        self.queue_options(queue_name).await?;
        let now = self.now();
        let dialect = self.inner.dialect;

        let mut states = vec![format!("({})", AVAILABLE)];
        if options.include_not_visible {
            states.push("expires_at >= ?".to_string());
        }
        if options.include_delayed {
            states.push(
                "((expires_at IS NULL OR expires_at < ?) AND delay_until > ?)".to_string(),
            );
        }
        let sql = format!(
            "SELECT {} FROM nexq_message WHERE queue_name = ? AND ({}) {} LIMIT ?",
            MESSAGE_COLUMNS,
            states.join(" OR "),
            dialect.delivery_order()
        );
        let sql = dialect.sql(&sql);

        let now_ms = millis(now);
        let mut query = sqlx::query(&sql).bind(queue_name).bind(now_ms).bind(now_ms);
        if options.include_not_visible {
            query = query.bind(now_ms);
        }
        if options.include_delayed {
            query = query.bind(now_ms).bind(now_ms);
        }
        let mut conn = self.acquire().await?;
        let rows = query
            .bind(options.max_number_of_messages as i64)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_error("peek messages"))?;

        rows.iter()
            .map(|row| MessageRow::from_row(row)?.to_message(now))
            .collect()
    }

    async fn get_message(&self, queue_name: &str, message_id: &str) -> Result<GetMessage> {
        self.queue_options(queue_name).await?;
        let now = self.now();
        let dialect = self.inner.dialect;
        let tiebreak = dialect.order_tiebreak();
        let mut conn = self.acquire().await?;

        let sql = format!(
            "SELECT {}, {} AS tiebreak FROM nexq_message WHERE queue_name = ? AND id = ?",
            MESSAGE_COLUMNS, tiebreak
        );
        let sql = dialect.sql(&sql);
        let row = sqlx::query(&sql)
            .bind(queue_name)
            .bind(message_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error("load message"))?
            .ok_or_else(|| Error::message_not_found(queue_name, message_id))?;
        let message = MessageRow::from_row(&row)?;
        let seq: i64 = row
            .try_get("tiebreak")
            .map_err(db_error("decode message"))?;

        let sql = format!(
            "SELECT COUNT(*) AS position FROM nexq_message WHERE queue_name = ? AND \
             (priority > ? OR (priority = ? AND order_by < ?) \
             OR (priority = ? AND order_by = ? AND {} < ?))",
            tiebreak
        );
        let sql = dialect.sql(&sql);
        let position: i64 = sqlx::query(&sql)
            .bind(queue_name)
            .bind(message.priority)
            .bind(message.priority)
            .bind(message.order_by)
            .bind(message.priority)
            .bind(message.order_by)
            .bind(seq)
            .fetch_one(&mut *conn)
            .await
            .map_err(db_error("locate message"))?
            .try_get("position")
            .map_err(db_error("decode message position"))?;

        Ok(GetMessage {
            message: message.to_message(now)?,
            position_in_queue: position.max(0) as u64,
        })
    }

    async fn update_message(
        &self,
        queue_name: &str,
        message_id: &str,
        receipt_handle: Option<&str>,
        options: UpdateMessageOptions,
    ) -> Result<()> {
        self.queue_options(queue_name).await?;
        let now = self.now();
        let mut tx = self.begin().await?;

        let message = self
            .fetch_message(&mut tx, queue_name, message_id)
            .await?
            .ok_or_else(|| Error::message_not_found(queue_name, message_id))?;
        match receipt_handle {
            None if options.visibility_timeout_ms.is_some() => {
                return Err(Error::InvalidUpdate(
                    "cannot update message visibility timeout without providing a receipt handle"
                        .to_string(),
                ));
            }
            Some(handle) if message.receipt_handle.as_deref() != Some(handle) => {
                return Err(Error::receipt_handle_invalid(queue_name, handle));
            }
            _ => {}
        }

        let Some(sql) = update_message_sql(&options, receipt_handle.is_some()) else {
            return tx.commit().await;
        };
        let sql = self.inner.dialect.sql(&sql);
        let mut query = sqlx::query(&sql);
        if let Some(priority) = options.priority {
            query = query.bind(priority);
        }
        if let Some(attributes) = &options.attributes {
            query = query.bind(encode_attributes(attributes)?);
        }
        if let Some(visibility_timeout_ms) = options.visibility_timeout_ms {
            query = query.bind(millis(add_millis(now, visibility_timeout_ms)));
        }
        query = query.bind(queue_name).bind(message_id);
        if let Some(handle) = receipt_handle {
            query = query.bind(handle);
        }
        let result = query
            .execute(&mut *tx)
            .await
            .map_err(db_error("update message"))?;
        if result.rows_affected() == 0 {
            let handle = receipt_handle.unwrap_or_default();
            return Err(self
                .missed_write(&mut tx, queue_name, message_id, handle)
                .await?);
        }
        tx.commit().await
    }

    async fn nak_message(
        &self,
        queue_name: &str,
        message_id: &str,
        receipt_handle: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        self.queue_options(queue_name).await?;
        let now = self.now();
        let mut tx = self.begin().await?;

        let sql = self.inner.dialect.sql(
            "UPDATE nexq_message SET expires_at = ?, last_nak_reason = ?, receipt_handle = NULL \
             WHERE queue_name = ? AND id = ? AND receipt_handle = ?",
        );
        let result = sqlx::query(&sql)
            .bind(millis(now) - 1)
            .bind(reason)
            .bind(queue_name)
            .bind(message_id)
            .bind(receipt_handle)
            .execute(&mut *tx)
            .await
            .map_err(db_error("nak message"))?;
        if result.rows_affected() == 0 {
            return Err(self
                .missed_write(&mut tx, queue_name, message_id, receipt_handle)
                .await?);
        }
        tx.commit().await?;

        self.trigger(queue_name);
        Ok(())
    }

    async fn delete_message(
        &self,
        queue_name: &str,
        message_id: &str,
        receipt_handle: Option<&str>,
    ) -> Result<()> {
        self.queue_options(queue_name).await?;
        let mut tx = self.begin().await?;

        let deleted = match receipt_handle {
            None => self.remove_message(&mut tx, queue_name, message_id).await?,
            Some(handle) => {
                let sql = self.inner.dialect.sql(
                    "DELETE FROM nexq_message WHERE queue_name = ? AND id = ? AND receipt_handle = ?",
                );
                let result = sqlx::query(&sql)
                    .bind(queue_name)
                    .bind(message_id)
                    .bind(handle)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error("delete message"))?;
                if result.rows_affected() == 0 {
                    return Err(self.missed_write(&mut tx, queue_name, message_id, handle).await?);
                }
                result.rows_affected()
            }
        };
        if deleted == 0 {
            return Err(Error::message_not_found(queue_name, message_id));
        }
        tx.commit().await?;

        record(&get_metrics().messages_deleted_total, self.backend(), queue_name, 1);
        Ok(())
    }

    async fn delete_message_by_receipt_handle(
        &self,
        queue_name: &str,
        receipt_handle: &str,
    ) -> Result<()> {
        self.queue_options(queue_name).await?;
        let mut tx = self.begin().await?;
        let sql = self
            .inner
            .dialect
            .sql("DELETE FROM nexq_message WHERE queue_name = ? AND receipt_handle = ?");
        let result = sqlx::query(&sql)
            .bind(queue_name)
            .bind(receipt_handle)
            .execute(&mut *tx)
            .await
            .map_err(db_error("delete message"))?;
        if result.rows_affected() == 0 {
            return Err(Error::receipt_handle_invalid(queue_name, receipt_handle));
        }
        tx.commit().await?;

        record(&get_metrics().messages_deleted_total, self.backend(), queue_name, 1);
        Ok(())
    }

    async fn update_message_visibility_by_receipt_handle(
        &self,
        queue_name: &str,
        receipt_handle: &str,
        visibility_timeout_ms: u64,
    ) -> Result<()> {
        self.queue_options(queue_name).await?;
        let now = self.now();
        let mut tx = self.begin().await?;
        let sql = self.inner.dialect.sql(
            "UPDATE nexq_message SET expires_at = ? WHERE queue_name = ? AND receipt_handle = ?",
        );
        let result = sqlx::query(&sql)
            .bind(millis(add_millis(now, visibility_timeout_ms)))
            .bind(queue_name)
            .bind(receipt_handle)
            .execute(&mut *tx)
            .await
            .map_err(db_error("update message visibility"))?;
        if result.rows_affected() == 0 {
            return Err(Error::receipt_handle_invalid(queue_name, receipt_handle));
        }
        tx.commit().await
    }

    async fn move_messages(
        &self,
        source_queue_name: &str,
        target_queue_name: &str,
    ) -> Result<MoveMessagesResult> {
        self.queue_options(source_queue_name).await?;
        let target = self.queue_options(target_queue_name).await?;
        if source_queue_name == target_queue_name {
            return Ok(MoveMessagesResult {
                moved_message_count: 0,
            });
        }

        let now = self.now();
        let dialect = self.inner.dialect;
        let mut tx = self.begin().await?;

        let sql = format!(
            "SELECT id FROM nexq_message WHERE queue_name = ? AND {} {}",
            AVAILABLE,
            dialect.delivery_order()
        );
        let sql = dialect.sql(&sql);
        let ids: Vec<String> = sqlx::query(&sql)
            .bind(source_queue_name)
            .bind(millis(now))
            .bind(millis(now))
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error("select messages to move"))?
            .iter()
            .map(|row| row.try_get("id"))
            .collect::<std::result::Result<_, _>>()
            .map_err(db_error("decode message"))?;

        let copy = CopyMode::Move {
            retain_until: retain_until(&target, now),
        };
        for id in &ids {
            self.copy_message(&mut tx, source_queue_name, target_queue_name, id, copy)
                .await?;
            self.remove_message(&mut tx, source_queue_name, id).await?;
        }
        tx.commit().await?;

        let moved_message_count = ids.len() as u64;
        info!(
            source_queue_name = %source_queue_name,
            target_queue_name = %target_queue_name,
            moved_message_count,
            "Moved messages"
        );
        self.trigger(target_queue_name);
        Ok(MoveMessagesResult {
            moved_message_count,
        })
    }

    async fn create_topic(&self, topic_name: &str, options: CreateTopicOptions) -> Result<()> {
        let topic_name = normalize_topic_name(topic_name)?;
        let now = self.now();
        let mut tx = self.begin().await?;

        if let Some(existing) = self.topic_row(&mut tx, &topic_name).await? {
            if existing.tags != options.tags {
                return Err(Error::TopicAlreadyExists {
                    name: topic_name,
                    reason: "tags are different".to_string(),
                });
            }
            return Ok(());
        }

        let sql = self.inner.dialect.sql(
            "INSERT INTO nexq_topic (name, created_at, last_modified_at, tags) VALUES (?, ?, ?, ?)",
        );
        sqlx::query(&sql)
            .bind(topic_name.as_str())
            .bind(millis(now))
            .bind(millis(now))
            .bind(encode_tags(&options.tags)?)
            .execute(&mut *tx)
            .await
            .map_err(db_error("create topic"))?;
        tx.commit().await?;

        info!(topic_name = %topic_name, "Created topic");
        Ok(())
    }

    async fn delete_topic(&self, topic_name: &str) -> Result<()> {
        let dialect = self.inner.dialect;
        let mut tx = self.begin().await?;
        if self.topic_row(&mut tx, topic_name).await?.is_none() {
            return Err(Error::TopicNotFound(topic_name.to_string()));
        }

        let sql = dialect.sql(
            "SELECT name FROM nexq_queue WHERE dead_letter_topic_name = ? ORDER BY name LIMIT 1",
        );
        let referencing = sqlx::query(&sql)
            .bind(topic_name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error("check dead letter references"))?;
        if let Some(row) = referencing {
            return Err(Error::DeleteDeadLetterTopic {
                dead_letter_topic_name: topic_name.to_string(),
                queue_name: row.try_get("name").map_err(db_error("decode queue"))?,
            });
        }

        let sql = dialect.sql("DELETE FROM nexq_topic WHERE name = ?");
        sqlx::query(&sql)
            .bind(topic_name)
            .execute(&mut *tx)
            .await
            .map_err(db_error("delete topic"))?;
        tx.commit().await?;

        info!(topic_name = %topic_name, "Deleted topic");
        Ok(())
    }

    async fn get_topic_info(&self, topic_name: &str) -> Result<TopicInfo> {
        let mut conn = self.acquire().await?;
        let row = self
            .topic_row(&mut conn, topic_name)
            .await?
            .ok_or_else(|| Error::TopicNotFound(topic_name.to_string()))?;
        let subscriptions = self.subscriptions(&mut conn, topic_name).await?;
        Ok(row.info(subscriptions))
    }

    async fn get_topic_infos(&self) -> Result<Vec<TopicInfo>> {
        let mut conn = self.acquire().await?;
        let sql = format!("SELECT {} FROM nexq_topic", TopicRow::COLUMNS);
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_error("list topics"))?;

        let mut infos = Vec::with_capacity(rows.len());
        for row in &rows {
            let topic = TopicRow::from_row(row)?;
            let subscriptions = self.subscriptions(&mut conn, &topic.name).await?;
            infos.push(topic.info(subscriptions));
        }
        infos.sort_by(|a, b| listing_order(&a.name, &b.name));
        Ok(infos)
    }

    async fn subscribe(
        &self,
        topic_name: &str,
        protocol: TopicProtocol,
        queue_name: &str,
    ) -> Result<String> {
        let dialect = self.inner.dialect;
        let mut tx = self.begin().await?;
        if self.topic_row(&mut tx, topic_name).await?.is_none() {
            return Err(Error::TopicNotFound(topic_name.to_string()));
        }
        self.require_queue_row(&mut tx, queue_name).await?;

        let sql = dialect
            .sql("SELECT id FROM nexq_subscription WHERE topic_name = ? AND queue_name = ?");
        let existing = sqlx::query(&sql)
            .bind(topic_name)
            .bind(queue_name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error("load subscription"))?;
        if let Some(row) = existing {
            return row.try_get("id").map_err(db_error("decode subscription"));
        }

        let id = new_id();
        let sql = dialect.sql(
            "INSERT INTO nexq_subscription (id, topic_name, protocol, queue_name) VALUES (?, ?, ?, ?)",
        );
        sqlx::query(&sql)
            .bind(id.as_str())
            .bind(topic_name)
            .bind(protocol.as_str())
            .bind(queue_name)
            .execute(&mut *tx)
            .await
            .map_err(db_error("create subscription"))?;
        tx.commit().await?;

        info!(topic_name = %topic_name, queue_name = %queue_name, "Subscribed queue to topic");
        Ok(id)
    }

    async fn publish_message(
        &self,
        topic_name: &str,
        body: &str,
        options: SendMessageOptions,
    ) -> Result<SendMessageResult> {
        let queue_names = {
            let mut conn = self.acquire().await?;
            if self.topic_row(&mut conn, topic_name).await?.is_none() {
                return Err(Error::TopicNotFound(topic_name.to_string()));
            }
            self.subscribed_queue_names(&mut conn, topic_name).await?
        };

        let mut queues = Vec::with_capacity(queue_names.len());
        for queue_name in queue_names {
            let queue = self.queue_options(&queue_name).await?;
            validate_message_size(body.len(), queue.max_message_size)?;
            queues.push((queue_name, queue));
        }

        let id = new_id();
        let now = self.now();
        let message = NewMessage {
            id: &id,
            body,
            options: &options,
            last_nak_reason: None,
        };
        let metrics = get_metrics();
        let mut first_error = None;
        for (queue_name, queue) in &queues {
            let sent = async {
                let mut tx = self.begin().await?;
                self.insert_message(&mut tx, queue_name, queue, &message, now)
                    .await?;
                tx.commit().await
            }
            .await;
            match sent {
                Ok(()) => {
                    record(&metrics.messages_sent_total, self.backend(), queue_name, 1);
                    self.trigger(queue_name);
                }
                Err(e) => {
                    debug!(topic_name = %topic_name, queue_name = %queue_name, error = %e, "Publish to queue failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(SendMessageResult { id }),
        }
    }
}

async fn set_paused(store: &SqlStore, queue_name: &str, paused: bool) -> Result<()> {
    let mut tx = store.begin().await?;
    let sql = store
        .inner
        .dialect
        .sql("UPDATE nexq_queue SET paused = ? WHERE name = ?");
    let result = sqlx::query(&sql)
        .bind(i64::from(paused))
        .bind(queue_name)
        .execute(&mut *tx)
        .await
        .map_err(db_error("update queue"))?;
    if result.rows_affected() == 0 {
        return Err(Error::QueueNotFound(queue_name.to_string()));
    }
    tx.commit().await
}
