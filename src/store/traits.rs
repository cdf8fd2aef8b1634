//! # Store Traits
//!
//! The document-store capability the engine is built on. Every cross-node
//! guarantee comes from two primitives offered here: an insert that fails on a
//! duplicate key (lock acquisition) and an atomic add-to-set on `processedBy`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{CandidateQuery, CandidateRow, ChangeStream, PurgeCounts, WatchFilter};
use crate::messaging::errors::MessagingResult;
use crate::messaging::message::{Msg, MsgId, MsgLock};

/// Backend-agnostic store operations, keyed by queue name.
///
/// A queue consists of the message collection `<queue>` and the lock
/// collection `<queue>_lck`.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Backend name for logging
    fn backend_name(&self) -> &'static str;

    /// Create the collections, indexes and triggers for a queue (idempotent)
    async fn ensure_queue(&self, queue: &str) -> MessagingResult<()>;

    /// Persist a new message. Fails with `DuplicateKey` if the id exists.
    async fn insert_message(&self, queue: &str, msg: &Msg) -> MessagingResult<()>;

    /// Authoritative read of one message
    async fn find_message(&self, queue: &str, id: MsgId) -> MessagingResult<Option<Msg>>;

    /// Routing fields of messages this node may process, sorted by
    /// `(priority, timestamp, id)` and capped at `query.limit`.
    ///
    /// Exclusive messages qualify only with an empty `processedBy` and no live
    /// lock; others only while `processedBy` lacks the node. Messages sent by
    /// the node itself or addressed to other recipients never qualify.
    async fn find_candidates(
        &self,
        queue: &str,
        query: &CandidateQuery,
    ) -> MessagingResult<Vec<CandidateRow>>;

    /// Atomic add-to-set on `processedBy`; returns the modified count
    /// (0 when the node is already present or the message is gone)
    async fn add_processed_by(&self, queue: &str, id: MsgId, node_id: &str)
        -> MessagingResult<u64>;

    /// Schedule removal of a message
    async fn set_message_delete_at(
        &self,
        queue: &str,
        id: MsgId,
        delete_at: DateTime<Utc>,
    ) -> MessagingResult<u64>;

    async fn delete_message(&self, queue: &str, id: MsgId) -> MessagingResult<u64>;

    async fn count_messages(&self, queue: &str) -> MessagingResult<u64>;

    /// Remove messages and locks whose `deleteAt` lies before `now`
    async fn purge_expired(&self, queue: &str, now: DateTime<Utc>) -> MessagingResult<PurgeCounts>;

    /// Insert-as-CAS. Fails with `DuplicateKey` while a live lock exists;
    /// an expired lock is replaced.
    async fn insert_lock(&self, queue: &str, lock: &MsgLock) -> MessagingResult<()>;

    /// Delete a lock, optionally only when held by `holder`
    async fn delete_lock(&self, queue: &str, id: MsgId, holder: Option<&str>)
        -> MessagingResult<u64>;

    /// Move the expiry of a lock held by `holder`
    async fn touch_lock(
        &self,
        queue: &str,
        id: MsgId,
        holder: &str,
        delete_at: DateTime<Utc>,
    ) -> MessagingResult<u64>;

    async fn find_lock(&self, queue: &str, id: MsgId) -> MessagingResult<Option<MsgLock>>;

    /// Whether `watch` is available
    fn supports_watch(&self) -> bool {
        false
    }

    /// Subscribe to store mutations of a queue
    async fn watch(&self, queue: &str, filter: WatchFilter) -> MessagingResult<ChangeStream>;

    /// Verify the backend is reachable
    async fn health_check(&self) -> MessagingResult<bool>;
}
