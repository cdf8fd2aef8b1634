//! # PostgreSQL Store
//!
//! `MessageStore` over PostgreSQL using `sqlx`.
//!
//! Each queue maps to two tables:
//!
//! - `<queue>`: routing columns plus the full message as `body JSONB`.
//!   `processed_by` and `delete_at` live in their own columns and are the
//!   authoritative values; `processed_by` is only ever appended to with a
//!   guarded `UPDATE`.
//! - `<queue>_lck`: one row per held lock, primary key on the message id.
//!
//! Inserts and deletes on both tables publish a JSON `ChangeEvent` through
//! `pg_notify` on channel `docbus_<queue>`, consumed with `PgListener`.
//! Notifications are not guaranteed delivery; the engine keeps polling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::traits::MessageStore;
use super::types::{CandidateQuery, CandidateRow, ChangeEvent, ChangeStream, PurgeCounts, WatchFilter};
use crate::config::is_valid_queue_name;
use crate::constants::lock_collection_name;
use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::messaging::message::{Msg, MsgId, MsgLock};

const NOTIFY_BUFFER: usize = 256;

/// Trigger function shared by all queues. Arguments: channel, collection name.
const NOTIFY_FUNCTION_SQL: &str = r#"
CREATE OR REPLACE FUNCTION docbus_notify() RETURNS trigger AS $fn$
DECLARE
    doc_key UUID;
    summary JSON := NULL;
BEGIN
    IF TG_OP = 'DELETE' THEN
        doc_key := OLD.id;
    ELSE
        doc_key := NEW.id;
    END IF;
    IF TG_OP = 'INSERT' AND TG_ARGV[1] = 'messages' THEN
        summary := json_build_object(
            '_id', NEW.id,
            'topic', NEW.topic,
            'sender', NEW.sender,
            'recipients', NEW.recipients,
            'priority', NEW.priority,
            'timestamp', NEW.ts,
            'exclusive', NEW.exclusive,
            'inAnswerTo', NEW.in_answer_to
        );
    END IF;
    PERFORM pg_notify(TG_ARGV[0], json_build_object(
        'collection', TG_ARGV[1],
        'operation', lower(TG_OP),
        'documentKey', doc_key,
        'summary', summary
    )::text);
    RETURN NULL;
END;
$fn$ LANGUAGE plpgsql;
"#;

/// PostgreSQL-backed store
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect a new pool
    pub async fn connect(database_url: &str, max_connections: u32) -> MessagingResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| MessagingError::store_connection(e.to_string()))?;
        info!(max_connections = max_connections, "Connected PostgreSQL message store");
        Ok(Self { pool })
    }

    /// Use an existing pool
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Notification channel of a queue
    pub fn channel_name(queue: &str) -> String {
        format!("docbus_{queue}")
    }

    fn tables(queue: &str) -> MessagingResult<(String, String)> {
        if !is_valid_queue_name(queue) {
            return Err(MessagingError::configuration(
                "postgres_store",
                format!("invalid queue name: {queue}"),
            ));
        }
        Ok((format!("\"{queue}\""), format!("\"{}\"", lock_collection_name(queue))))
    }

    fn schema_sql(queue: &str) -> MessagingResult<String> {
        let (messages, locks) = Self::tables(queue)?;
        let lock_table = lock_collection_name(queue);
        let channel = Self::channel_name(queue);
        Ok(format!(
            r#"
SELECT pg_advisory_xact_lock(hashtext('docbus_schema'));
CREATE TABLE IF NOT EXISTS {messages} (
    id UUID PRIMARY KEY,
    topic TEXT NOT NULL,
    sender TEXT,
    recipients TEXT[] NOT NULL DEFAULT '{{}}',
    in_answer_to UUID,
    exclusive BOOLEAN NOT NULL DEFAULT FALSE,
    processed_by TEXT[] NOT NULL DEFAULT '{{}}',
    priority INTEGER NOT NULL,
    ts TIMESTAMPTZ NOT NULL,
    delete_at TIMESTAMPTZ,
    body JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS "{queue}_order_idx" ON {messages} (priority, ts, id);
CREATE INDEX IF NOT EXISTS "{queue}_delete_at_idx" ON {messages} (delete_at);
CREATE TABLE IF NOT EXISTS {locks} (
    id UUID PRIMARY KEY,
    lock_id TEXT NOT NULL,
    locked_at TIMESTAMPTZ NOT NULL,
    delete_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS "{lock_table}_delete_at_idx" ON {locks} (delete_at);
{NOTIFY_FUNCTION_SQL}
DROP TRIGGER IF EXISTS "{queue}_notify" ON {messages};
CREATE TRIGGER "{queue}_notify" AFTER INSERT OR DELETE ON {messages}
    FOR EACH ROW EXECUTE FUNCTION docbus_notify('{channel}', 'messages');
DROP TRIGGER IF EXISTS "{lock_table}_notify" ON {locks};
CREATE TRIGGER "{lock_table}_notify" AFTER INSERT OR DELETE ON {locks}
    FOR EACH ROW EXECUTE FUNCTION docbus_notify('{channel}', 'locks');
"#
        ))
    }

    fn message_from_row(row: &PgRow) -> MessagingResult<Msg> {
        let body: serde_json::Value = row.try_get("body")?;
        let mut msg: Msg = serde_json::from_value(body)?;
        msg.processed_by = row.try_get("processed_by")?;
        msg.delete_at = row.try_get("delete_at")?;
        Ok(msg)
    }

    fn candidate_from_row(row: &PgRow) -> MessagingResult<CandidateRow> {
        let id: Uuid = row.try_get("id")?;
        let in_answer_to: Option<Uuid> = row.try_get("in_answer_to")?;
        Ok(CandidateRow {
            msg_id: MsgId::from_uuid(id),
            topic: row.try_get("topic")?,
            sender: row.try_get("sender")?,
            recipients: row.try_get("recipients")?,
            priority: row.try_get("priority")?,
            timestamp: row.try_get("ts")?,
            exclusive: row.try_get("exclusive")?,
            in_answer_to: in_answer_to.map(MsgId::from_uuid),
        })
    }
}

#[async_trait]
impl MessageStore for PostgresStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self), fields(queue = %queue))]
    async fn ensure_queue(&self, queue: &str) -> MessagingResult<()> {
        let ddl = Self::schema_sql(queue)?;
        // One simple-query batch runs as a single implicit transaction
        sqlx::raw_sql(&ddl).execute(&self.pool).await?;
        debug!(queue = %queue, "PostgreSQL queue tables ready");
        Ok(())
    }

    #[instrument(skip(self, msg), fields(queue = %queue, msg_id = %msg.msg_id, topic = %msg.topic))]
    async fn insert_message(&self, queue: &str, msg: &Msg) -> MessagingResult<()> {
        let (messages, _) = Self::tables(queue)?;
        let body = serde_json::to_value(msg)?;
        let sql = format!(
            "INSERT INTO {messages} (id, topic, sender, recipients, in_answer_to, exclusive, \
             processed_by, priority, ts, delete_at, body) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        );
        sqlx::query(&sql)
            .bind(*msg.msg_id.as_uuid())
            .bind(&msg.topic)
            .bind(&msg.sender)
            .bind(&msg.recipients)
            .bind(msg.in_answer_to.map(|id| *id.as_uuid()))
            .bind(msg.exclusive)
            .bind(&msg.processed_by)
            .bind(msg.priority)
            .bind(msg.timestamp)
            .bind(msg.delete_at)
            .bind(body)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_message(&self, queue: &str, id: MsgId) -> MessagingResult<Option<Msg>> {
        let (messages, _) = Self::tables(queue)?;
        let sql = format!("SELECT body, processed_by, delete_at FROM {messages} WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::message_from_row).transpose()
    }

    async fn find_candidates(
        &self,
        queue: &str,
        query: &CandidateQuery,
    ) -> MessagingResult<Vec<CandidateRow>> {
        let (messages, locks) = Self::tables(queue)?;
        let sql = format!(
            "SELECT m.id, m.topic, m.sender, m.recipients, m.priority, m.ts, m.exclusive, m.in_answer_to \
             FROM {messages} m \
             WHERE NOT (m.id = ANY($1)) \
               AND (m.sender IS NULL OR m.sender <> $2) \
               AND (cardinality(m.recipients) = 0 OR $2 = ANY(m.recipients)) \
               AND NOT (m.topic = ANY($3)) \
               AND ($4::text[] IS NULL OR m.topic = ANY($4) OR m.in_answer_to IS NOT NULL) \
               AND ( \
                 (m.exclusive AND cardinality(m.processed_by) = 0 \
                   AND NOT EXISTS (SELECT 1 FROM {locks} l WHERE l.id = m.id AND l.delete_at >= now())) \
                 OR (NOT m.exclusive AND NOT ($2 = ANY(m.processed_by))) \
               ) \
             ORDER BY m.priority, m.ts, m.id \
             LIMIT $5"
        );

        let exclude: Vec<Uuid> = query.exclude_ids.iter().map(|id| *id.as_uuid()).collect();
        let paused: Vec<String> = query.paused_topics.iter().cloned().collect();
        let topics: Option<Vec<String>> = query
            .topics
            .as_ref()
            .map(|topics| topics.iter().cloned().collect());

        let rows = sqlx::query(&sql)
            .bind(exclude)
            .bind(&query.node_id)
            .bind(paused)
            .bind(topics)
            .bind(query.limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::candidate_from_row).collect()
    }

    #[instrument(skip(self), fields(queue = %queue, msg_id = %id))]
    async fn add_processed_by(
        &self,
        queue: &str,
        id: MsgId,
        node_id: &str,
    ) -> MessagingResult<u64> {
        let (messages, _) = Self::tables(queue)?;
        let sql = format!(
            "UPDATE {messages} SET processed_by = array_append(processed_by, $2) \
             WHERE id = $1 AND NOT ($2 = ANY(processed_by))"
        );
        let result = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn set_message_delete_at(
        &self,
        queue: &str,
        id: MsgId,
        delete_at: DateTime<Utc>,
    ) -> MessagingResult<u64> {
        let (messages, _) = Self::tables(queue)?;
        let sql = format!("UPDATE {messages} SET delete_at = $2 WHERE id = $1");
        let result = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .bind(delete_at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_message(&self, queue: &str, id: MsgId) -> MessagingResult<u64> {
        let (messages, _) = Self::tables(queue)?;
        let sql = format!("DELETE FROM {messages} WHERE id = $1");
        let result = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_messages(&self, queue: &str) -> MessagingResult<u64> {
        let (messages, _) = Self::tables(queue)?;
        let sql = format!("SELECT COUNT(*) FROM {messages}");
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self), fields(queue = %queue))]
    async fn purge_expired(&self, queue: &str, now: DateTime<Utc>) -> MessagingResult<PurgeCounts> {
        let (messages, locks) = Self::tables(queue)?;
        let purged_messages = sqlx::query(&format!("DELETE FROM {messages} WHERE delete_at < $1"))
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let purged_locks = sqlx::query(&format!("DELETE FROM {locks} WHERE delete_at < $1"))
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(PurgeCounts {
            messages: purged_messages,
            locks: purged_locks,
        })
    }

    #[instrument(skip(self, lock), fields(queue = %queue, msg_id = %lock.id, holder = %lock.lock_id))]
    async fn insert_lock(&self, queue: &str, lock: &MsgLock) -> MessagingResult<()> {
        let (_, locks) = Self::tables(queue)?;
        // An expired lock is taken over in place; a live one wins the conflict
        let sql = format!(
            "INSERT INTO {locks} AS l (id, lock_id, locked_at, delete_at) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET lock_id = EXCLUDED.lock_id, \
               locked_at = EXCLUDED.locked_at, delete_at = EXCLUDED.delete_at \
             WHERE l.delete_at < now()"
        );
        let result = sqlx::query(&sql)
            .bind(*lock.id.as_uuid())
            .bind(&lock.lock_id)
            .bind(lock.locked_at)
            .bind(lock.delete_at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MessagingError::duplicate_key(
                lock_collection_name(queue),
                lock.id,
            ));
        }
        Ok(())
    }

    async fn delete_lock(
        &self,
        queue: &str,
        id: MsgId,
        holder: Option<&str>,
    ) -> MessagingResult<u64> {
        let (_, locks) = Self::tables(queue)?;
        let sql = format!("DELETE FROM {locks} WHERE id = $1 AND ($2::text IS NULL OR lock_id = $2)");
        let result = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn touch_lock(
        &self,
        queue: &str,
        id: MsgId,
        holder: &str,
        delete_at: DateTime<Utc>,
    ) -> MessagingResult<u64> {
        let (_, locks) = Self::tables(queue)?;
        let sql = format!("UPDATE {locks} SET delete_at = $3 WHERE id = $1 AND lock_id = $2");
        let result = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .bind(holder)
            .bind(delete_at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn find_lock(&self, queue: &str, id: MsgId) -> MessagingResult<Option<MsgLock>> {
        let (_, locks) = Self::tables(queue)?;
        let sql = format!("SELECT id, lock_id, locked_at, delete_at FROM {locks} WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> MessagingResult<MsgLock> {
            let id: Uuid = row.try_get("id")?;
            Ok(MsgLock {
                id: MsgId::from_uuid(id),
                lock_id: row.try_get("lock_id")?,
                locked_at: row.try_get("locked_at")?,
                delete_at: row.try_get("delete_at")?,
            })
        })
        .transpose()
    }

    fn supports_watch(&self) -> bool {
        true
    }

    async fn watch(&self, queue: &str, filter: WatchFilter) -> MessagingResult<ChangeStream> {
        Self::tables(queue)?;
        let channel = Self::channel_name(queue);

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| MessagingError::change_feed(e.to_string()))?;
        listener
            .listen(&channel)
            .await
            .map_err(|e| MessagingError::change_feed(e.to_string()))?;
        debug!(channel = %channel, "Listening for queue notifications");

        // Bridge the listener task to a stream
        let (tx, rx) = tokio::sync::mpsc::channel::<MessagingResult<ChangeEvent>>(NOTIFY_BUFFER);

        tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    _ = tx.closed() => break,
                    received = listener.recv() => received,
                };

                match notification {
                    Ok(notification) => {
                        match serde_json::from_str::<ChangeEvent>(notification.payload()) {
                            Ok(event) if filter.matches(&event) => {
                                if tx.send(Ok(event)).await.is_err() {
                                    break;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(
                                    channel = %notification.channel(),
                                    error = %e,
                                    "Ignoring malformed change notification"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        error!(channel = %channel, error = %e, "Notification listener failed");
                        let _ = tx
                            .send(Err(MessagingError::change_feed(e.to_string())))
                            .await;
                        break;
                    }
                }
            }
            debug!(channel = %channel, "Notification listener stopped");
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn health_check(&self) -> MessagingResult<bool> {
        let value: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(value == 1)
    }
}
