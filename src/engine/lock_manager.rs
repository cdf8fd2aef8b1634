//! # Lock Manager
//!
//! At-most-one processor for exclusive messages. Acquisition is a plain insert
//! into `<queue>_lck` keyed by the message id; the store's uniqueness check is
//! the compare-and-swap.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::messaging::errors::MessagingResult;
use crate::messaging::message::{Msg, MsgId, MsgLock};
use crate::resilience::with_retry;
use crate::store::MessageStore;

pub struct LockManager {
    store: Arc<dyn MessageStore>,
    queue_name: String,
    node_id: String,
    default_ttl: Duration,
    retry: RetryConfig,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("backend", &self.store.backend_name())
            .field("queue_name", &self.queue_name)
            .field("node_id", &self.node_id)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl LockManager {
    pub fn new(
        store: Arc<dyn MessageStore>,
        queue_name: impl Into<String>,
        node_id: impl Into<String>,
        default_ttl: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            queue_name: queue_name.into(),
            node_id: node_id.into(),
            default_ttl,
            retry,
        }
    }

    /// Lock expiry for `msg`: twice its TTL when it times out, else the default
    pub fn expiry_for(&self, msg: &Msg) -> DateTime<Utc> {
        let ttl = msg.lock_ttl(self.default_ttl);
        Utc::now() + chrono::Duration::milliseconds(ttl.as_millis() as i64)
    }

    /// Try to take the lock for `msg`; `false` when another node holds it
    pub async fn try_acquire(&self, msg: &Msg) -> MessagingResult<bool> {
        self.try_acquire_until(msg.msg_id, self.expiry_for(msg)).await
    }

    pub async fn try_acquire_until(
        &self,
        id: MsgId,
        expire_at: DateTime<Utc>,
    ) -> MessagingResult<bool> {
        let lock = MsgLock::new(id, self.node_id.clone(), expire_at);
        match self.store.insert_lock(&self.queue_name, &lock).await {
            Ok(()) => {
                debug!(msg_id = %id, node_id = %self.node_id, "Lock acquired");
                Ok(true)
            }
            Err(e) if e.is_duplicate_key() => {
                debug!(msg_id = %id, node_id = %self.node_id, "Lock held elsewhere");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the lock if this node holds it. Returns whether a row was removed.
    pub async fn release(&self, id: MsgId) -> bool {
        let result = with_retry(&self.retry, "delete_lock", || {
            self.store
                .delete_lock(&self.queue_name, id, Some(self.node_id.as_str()))
        })
        .await;
        match result {
            Ok(removed) => removed > 0,
            Err(e) => {
                // The lock's own TTL frees it eventually
                warn!(msg_id = %id, error = %e, "Failed to release lock");
                false
            }
        }
    }

    /// Delete the lock whoever holds it (message already gone)
    pub async fn release_any(&self, id: MsgId) -> bool {
        match self.store.delete_lock(&self.queue_name, id, None).await {
            Ok(removed) => removed > 0,
            Err(e) => {
                warn!(msg_id = %id, error = %e, "Failed to remove lock");
                false
            }
        }
    }

    /// Move the expiry of an owned lock
    pub async fn extend(&self, id: MsgId, delete_at: DateTime<Utc>) -> MessagingResult<bool> {
        let touched = with_retry(&self.retry, "touch_lock", || {
            self.store
                .touch_lock(&self.queue_name, id, &self.node_id, delete_at)
        })
        .await?;
        Ok(touched > 0)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}
