//! # In-Memory Store
//!
//! Thread-safe in-memory document store for tests and single-process use.
//!
//! ## Features
//!
//! - **Lock CAS**: lock inserts fail with `DuplicateKey` while a live lock exists
//! - **Add-to-set**: `processedBy` updates report a modified count like a document store
//! - **Change feed**: every mutation is published on a `tokio::sync::broadcast` channel
//! - **TTL emulation**: `purge_expired` removes rows whose `deleteAt` passed

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use super::traits::MessageStore;
use super::types::{
    CandidateQuery, CandidateRow, ChangeEvent, ChangeStream, Collection, OperationType,
    PurgeCounts, WatchFilter,
};
use crate::constants::lock_collection_name;
use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::messaging::message::{Msg, MsgId, MsgLock};

const EVENT_BUFFER: usize = 1024;

struct QueueData {
    messages: HashMap<MsgId, Msg>,
    locks: HashMap<MsgId, MsgLock>,
    events: broadcast::Sender<ChangeEvent>,
}

impl QueueData {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            messages: HashMap::new(),
            locks: HashMap::new(),
            events,
        }
    }

    fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn has_live_lock(&self, id: &MsgId, now: DateTime<Utc>) -> bool {
        self.locks
            .get(id)
            .map(|lock| !lock.is_expired_at(now))
            .unwrap_or(false)
    }
}

/// In-memory `MessageStore`.
///
/// Share one instance (`Arc<InMemoryStore>`) between several engines to
/// simulate nodes on a common database.
///
/// # Example
///
/// ```rust
/// use docbus::store::{InMemoryStore, MessageStore};
/// use docbus::Msg;
///
/// # async fn example() -> Result<(), docbus::MessagingError> {
/// let store = InMemoryStore::new();
/// store.ensure_queue("msg").await?;
///
/// let mut msg = Msg::new("ping", "hello", "");
/// msg.sender = Some("node-a".to_string());
/// store.insert_message("msg", &msg).await?;
/// assert_eq!(store.count_messages("msg").await?, 1);
/// # Ok(())
/// # }
/// ```
pub struct InMemoryStore {
    queues: RwLock<HashMap<String, QueueData>>,
    watch_enabled: bool,
    operations: AtomicU64,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("queues", &self.queues.read().len())
            .field("watch_enabled", &self.watch_enabled)
            .field("operations", &self.operations.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create a store with change feed support
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            watch_enabled: true,
            operations: AtomicU64::new(0),
        }
    }

    /// Create a store without change feed support (engines fall back to polling)
    pub fn without_watch() -> Self {
        Self {
            watch_enabled: false,
            ..Self::new()
        }
    }

    /// Snapshot of one message, bypassing the async interface (for tests)
    pub fn message(&self, queue: &str, id: MsgId) -> Option<Msg> {
        self.queues
            .read()
            .get(queue)
            .and_then(|q| q.messages.get(&id).cloned())
    }

    /// Number of lock rows in a queue (for tests)
    pub fn lock_count(&self, queue: &str) -> usize {
        self.queues
            .read()
            .get(queue)
            .map(|q| q.locks.len())
            .unwrap_or(0)
    }

    /// Total store operations served
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    fn read<R>(&self, queue: &str, f: impl FnOnce(Option<&QueueData>) -> R) -> R {
        self.operations.fetch_add(1, Ordering::Relaxed);
        let queues = self.queues.read();
        f(queues.get(queue))
    }

    fn write<R>(&self, queue: &str, f: impl FnOnce(&mut QueueData) -> R) -> R {
        self.operations.fetch_add(1, Ordering::Relaxed);
        let mut queues = self.queues.write();
        let data = queues
            .entry(queue.to_string())
            .or_insert_with(QueueData::new);
        f(data)
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    fn backend_name(&self) -> &'static str {
        "in_memory"
    }

    async fn ensure_queue(&self, queue: &str) -> MessagingResult<()> {
        self.write(queue, |_| ());
        debug!(queue = %queue, "In-memory queue ready");
        Ok(())
    }

    async fn insert_message(&self, queue: &str, msg: &Msg) -> MessagingResult<()> {
        self.write(queue, |data| {
            if data.messages.contains_key(&msg.msg_id) {
                return Err(MessagingError::duplicate_key(queue, msg.msg_id));
            }
            data.messages.insert(msg.msg_id, msg.clone());
            data.publish(ChangeEvent::message_inserted(msg));
            Ok(())
        })
    }

    async fn find_message(&self, queue: &str, id: MsgId) -> MessagingResult<Option<Msg>> {
        Ok(self.read(queue, |data| data.and_then(|q| q.messages.get(&id).cloned())))
    }

    async fn find_candidates(
        &self,
        queue: &str,
        query: &CandidateQuery,
    ) -> MessagingResult<Vec<CandidateRow>> {
        let now = Utc::now();
        let mut rows: Vec<CandidateRow> = self.read(queue, |data| {
            let Some(data) = data else {
                return Vec::new();
            };
            data.messages
                .values()
                .filter(|msg| !query.exclude_ids.contains(&msg.msg_id))
                .filter(|msg| !msg.is_sent_by(&query.node_id))
                .filter(|msg| msg.is_recipient(&query.node_id))
                .filter(|msg| query.accepts_topic(&msg.topic, msg.is_answer()))
                .filter(|msg| {
                    if msg.exclusive {
                        msg.processed_by.is_empty() && !data.has_live_lock(&msg.msg_id, now)
                    } else {
                        !msg.is_processed_by(&query.node_id)
                    }
                })
                .map(CandidateRow::from)
                .collect()
        });

        rows.sort_by(|a, b| {
            (a.priority, a.timestamp, a.msg_id).cmp(&(b.priority, b.timestamp, b.msg_id))
        });
        rows.truncate(query.limit);
        Ok(rows)
    }

    async fn add_processed_by(
        &self,
        queue: &str,
        id: MsgId,
        node_id: &str,
    ) -> MessagingResult<u64> {
        Ok(self.write(queue, |data| {
            let Some(msg) = data.messages.get_mut(&id) else {
                return 0;
            };
            if msg.is_processed_by(node_id) {
                return 0;
            }
            msg.processed_by.push(node_id.to_string());
            data.publish(ChangeEvent::new(
                Collection::Messages,
                OperationType::Update,
                id,
            ));
            1
        }))
    }

    async fn set_message_delete_at(
        &self,
        queue: &str,
        id: MsgId,
        delete_at: DateTime<Utc>,
    ) -> MessagingResult<u64> {
        Ok(self.write(queue, |data| {
            let Some(msg) = data.messages.get_mut(&id) else {
                return 0;
            };
            msg.delete_at = Some(delete_at);
            data.publish(ChangeEvent::new(
                Collection::Messages,
                OperationType::Update,
                id,
            ));
            1
        }))
    }

    async fn delete_message(&self, queue: &str, id: MsgId) -> MessagingResult<u64> {
        Ok(self.write(queue, |data| {
            if data.messages.remove(&id).is_none() {
                return 0;
            }
            data.publish(ChangeEvent::new(
                Collection::Messages,
                OperationType::Delete,
                id,
            ));
            1
        }))
    }

    async fn count_messages(&self, queue: &str) -> MessagingResult<u64> {
        Ok(self.read(queue, |data| {
            data.map(|q| q.messages.len() as u64).unwrap_or(0)
        }))
    }

    async fn purge_expired(&self, queue: &str, now: DateTime<Utc>) -> MessagingResult<PurgeCounts> {
        Ok(self.write(queue, |data| {
            let expired_messages: Vec<MsgId> = data
                .messages
                .values()
                .filter(|msg| msg.delete_at.map(|at| at < now).unwrap_or(false))
                .map(|msg| msg.msg_id)
                .collect();
            let expired_locks: Vec<MsgId> = data
                .locks
                .values()
                .filter(|lock| lock.is_expired_at(now))
                .map(|lock| lock.id)
                .collect();

            for id in &expired_messages {
                data.messages.remove(id);
                data.publish(ChangeEvent::new(
                    Collection::Messages,
                    OperationType::Delete,
                    *id,
                ));
            }
            for id in &expired_locks {
                data.locks.remove(id);
                data.publish(ChangeEvent::new(Collection::Locks, OperationType::Delete, *id));
            }

            PurgeCounts {
                messages: expired_messages.len() as u64,
                locks: expired_locks.len() as u64,
            }
        }))
    }

    async fn insert_lock(&self, queue: &str, lock: &MsgLock) -> MessagingResult<()> {
        let now = Utc::now();
        self.write(queue, |data| {
            if data.has_live_lock(&lock.id, now) {
                return Err(MessagingError::duplicate_key(
                    lock_collection_name(queue),
                    lock.id,
                ));
            }
            data.locks.insert(lock.id, lock.clone());
            data.publish(ChangeEvent::new(
                Collection::Locks,
                OperationType::Insert,
                lock.id,
            ));
            Ok(())
        })
    }

    async fn delete_lock(
        &self,
        queue: &str,
        id: MsgId,
        holder: Option<&str>,
    ) -> MessagingResult<u64> {
        Ok(self.write(queue, |data| {
            let owned = match (data.locks.get(&id), holder) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(lock), Some(holder)) => lock.is_held_by(holder),
            };
            if !owned {
                return 0;
            }
            data.locks.remove(&id);
            data.publish(ChangeEvent::new(Collection::Locks, OperationType::Delete, id));
            1
        }))
    }

    async fn touch_lock(
        &self,
        queue: &str,
        id: MsgId,
        holder: &str,
        delete_at: DateTime<Utc>,
    ) -> MessagingResult<u64> {
        Ok(self.write(queue, |data| match data.locks.get_mut(&id) {
            Some(lock) if lock.is_held_by(holder) => {
                lock.delete_at = delete_at;
                1
            }
            _ => 0,
        }))
    }

    async fn find_lock(&self, queue: &str, id: MsgId) -> MessagingResult<Option<MsgLock>> {
        Ok(self.read(queue, |data| data.and_then(|q| q.locks.get(&id).cloned())))
    }

    fn supports_watch(&self) -> bool {
        self.watch_enabled
    }

    async fn watch(&self, queue: &str, filter: WatchFilter) -> MessagingResult<ChangeStream> {
        if !self.watch_enabled {
            return Err(MessagingError::change_feed(
                "change feed disabled for this in-memory store",
            ));
        }
        let receiver = self.write(queue, |data| data.events.subscribe());
        let filter = Arc::new(filter);

        let stream = futures::stream::unfold(receiver, move |mut receiver| {
            let filter = Arc::clone(&filter);
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) if filter.matches(&event) => {
                            return Some((Ok(event), receiver));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            return Some((
                                Err(MessagingError::change_feed(format!(
                                    "subscriber lagged behind by {skipped} events"
                                ))),
                                receiver,
                            ));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn health_check(&self) -> MessagingResult<bool> {
        Ok(true)
    }
}
