//! # Message Structures
//!
//! Storage representation of a message (`Msg`) and the per-message lock row
//! (`MsgLock`) used to arbitrate exclusive processing.
//!
//! Field names serialize the way the document store sees them: `_id` for the
//! identity and camelCase for everything else.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::{MessagingError, MessagingResult};
use crate::constants::{DEFAULT_PRIORITY, DEFAULT_TTL_MS};

/// Globally unique, time-sortable message identifier (UUID v7), generated client-side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(Uuid);

impl MsgId {
    /// Generate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MsgId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MsgId {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| MessagingError::invalid_message("msgId", e.to_string()))
    }
}

impl From<Uuid> for MsgId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// A message stored in the shared message collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Msg {
    #[serde(rename = "_id")]
    pub msg_id: MsgId,
    /// Routing key selecting listeners
    pub topic: String,
    /// Node identity of the sender, stamped at send time
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub sender_host: Option<String>,
    /// Explicit targets; empty means any subscriber of the topic
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub in_answer_to: Option<MsgId>,
    /// At most one node may successfully process an exclusive message
    #[serde(default)]
    pub exclusive: bool,
    /// Nodes that completed processing. Grows only through the store's add-to-set.
    #[serde(default)]
    pub processed_by: Vec<String>,
    pub timestamp: DateTime<Utc>,
    /// Time to live in milliseconds
    pub ttl: u64,
    pub timing_out: bool,
    #[serde(default)]
    pub delete_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delete_after_processing: bool,
    /// Delay in milliseconds before a processed message is removed; 0 deletes immediately
    #[serde(default)]
    pub delete_after_processing_time: u64,
    pub priority: i32,

    // Payload, opaque to the engine
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub map_value: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub list_value: Vec<serde_json::Value>,
}

impl Msg {
    /// Create a broadcast message with a text payload
    pub fn new(topic: impl Into<String>, msg: impl Into<String>, value: impl Into<String>) -> Self {
        Self::builder(topic).msg(msg).value(value).build()
    }

    /// Start building a message for `topic`
    pub fn builder(topic: impl Into<String>) -> MsgBuilder {
        MsgBuilder::new(topic)
    }

    pub fn is_answer(&self) -> bool {
        self.in_answer_to.is_some()
    }

    /// True when no explicit recipients restrict delivery
    pub fn is_broadcast(&self) -> bool {
        self.recipients.is_empty()
    }

    /// Whether `node_id` may receive this message
    pub fn is_recipient(&self, node_id: &str) -> bool {
        self.recipients.is_empty() || self.recipients.iter().any(|r| r == node_id)
    }

    pub fn is_processed_by(&self, node_id: &str) -> bool {
        self.processed_by.iter().any(|p| p == node_id)
    }

    pub fn is_sent_by(&self, node_id: &str) -> bool {
        self.sender.as_deref() == Some(node_id)
    }

    /// `timingOut && now - timestamp > ttl`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if !self.timing_out {
            return false;
        }
        let age_ms = now.signed_duration_since(self.timestamp).num_milliseconds();
        age_ms > self.ttl as i64
    }

    /// Age of the message in milliseconds (never negative)
    pub fn age_ms(&self) -> u64 {
        Utc::now()
            .signed_duration_since(self.timestamp)
            .num_milliseconds()
            .max(0) as u64
    }

    /// Expiry instant for a timing-out message: `timestamp + ttl`
    pub fn compute_delete_at(&self) -> Option<DateTime<Utc>> {
        if self.timing_out {
            Some(self.timestamp + chrono::Duration::milliseconds(self.ttl as i64))
        } else {
            None
        }
    }

    /// TTL for the lock guarding this message: twice the message TTL, or `fallback`
    pub fn lock_ttl(&self, fallback: Duration) -> Duration {
        if self.timing_out && self.ttl > 0 {
            Duration::from_millis(self.ttl.saturating_mul(2))
        } else {
            fallback
        }
    }

    /// Reject messages that must never be persisted
    pub fn validate(&self) -> MessagingResult<()> {
        if self.topic.trim().is_empty() {
            return Err(MessagingError::invalid_message(
                "topic",
                "topic must be set before sending",
            ));
        }
        match self.sender.as_deref() {
            None => Err(MessagingError::invalid_message(
                "sender",
                "sender identity is not set",
            )),
            Some(s) if s.trim().is_empty() => Err(MessagingError::invalid_message(
                "sender",
                "sender identity is empty",
            )),
            Some(_) => Ok(()),
        }
    }

    /// Build a reply correlated to this message, addressed to its sender.
    ///
    /// The reply gets a fresh id and is never exclusive.
    pub fn create_answer(&self) -> Msg {
        let mut answer = Msg::builder(self.topic.clone())
            .priority(self.priority)
            .build();
        answer.in_answer_to = Some(self.msg_id);
        answer.recipients = self.sender.iter().cloned().collect();
        answer
    }

    /// Turn a listener-provided reply into a proper answer to `self`.
    ///
    /// Keeps the reply's payload; routing and identity come from the request.
    pub fn correlate_answer(&self, mut answer: Msg) -> Msg {
        answer.msg_id = MsgId::new();
        answer.in_answer_to = Some(self.msg_id);
        answer.recipients = self.sender.iter().cloned().collect();
        answer.exclusive = false;
        answer.processed_by.clear();
        if answer.topic.trim().is_empty() {
            answer.topic = self.topic.clone();
        }
        answer
    }
}

/// Fluent builder for [`Msg`]
#[derive(Debug, Clone)]
pub struct MsgBuilder {
    msg: Msg,
}

impl MsgBuilder {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            msg: Msg {
                msg_id: MsgId::new(),
                topic: topic.into(),
                sender: None,
                sender_host: None,
                recipients: Vec::new(),
                in_answer_to: None,
                exclusive: false,
                processed_by: Vec::new(),
                timestamp: Utc::now(),
                ttl: DEFAULT_TTL_MS,
                timing_out: true,
                delete_at: None,
                delete_after_processing: false,
                delete_after_processing_time: 0,
                priority: DEFAULT_PRIORITY,
                msg: None,
                value: None,
                map_value: HashMap::new(),
                list_value: Vec::new(),
            },
        }
    }

    pub fn msg(mut self, msg: impl Into<String>) -> Self {
        self.msg.msg = Some(msg.into());
        self
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.msg.value = Some(value.into());
        self
    }

    pub fn map_entry(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.msg.map_value.insert(key.into(), value);
        self
    }

    pub fn list_entry(mut self, value: serde_json::Value) -> Self {
        self.msg.list_value.push(value);
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.msg.exclusive = exclusive;
        self
    }

    pub fn recipient(mut self, node_id: impl Into<String>) -> Self {
        self.msg.recipients.push(node_id.into());
        self
    }

    pub fn recipients<I, S>(mut self, node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.msg.recipients.extend(node_ids.into_iter().map(Into::into));
        self
    }

    /// Time to live in milliseconds; also turns timing out on
    pub fn ttl(mut self, ttl_ms: u64) -> Self {
        self.msg.ttl = ttl_ms;
        self.msg.timing_out = true;
        self
    }

    pub fn timing_out(mut self, timing_out: bool) -> Self {
        self.msg.timing_out = timing_out;
        self
    }

    /// Never expires: `ttl = 0`, `timingOut = false`
    pub fn never_expires(mut self) -> Self {
        self.msg.ttl = 0;
        self.msg.timing_out = false;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.msg.priority = priority;
        self
    }

    /// Delete the message once processed, after `delay_ms` (0 = immediately)
    pub fn delete_after_processing(mut self, delay_ms: u64) -> Self {
        self.msg.delete_after_processing = true;
        self.msg.delete_after_processing_time = delay_ms;
        self
    }

    pub fn in_answer_to(mut self, id: MsgId) -> Self {
        self.msg.in_answer_to = Some(id);
        self
    }

    pub fn build(self) -> Msg {
        self.msg
    }
}

/// Lock row guarding exclusive processing of one message.
///
/// Its `_id` equals the guarded message id; the store's primary key makes the
/// insert fail when a lock already exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsgLock {
    #[serde(rename = "_id")]
    pub id: MsgId,
    /// Node holding the lock
    pub lock_id: String,
    pub locked_at: DateTime<Utc>,
    /// Automatic release if the holder disappears
    pub delete_at: DateTime<Utc>,
}

impl MsgLock {
    pub fn new(id: MsgId, lock_id: impl Into<String>, delete_at: DateTime<Utc>) -> Self {
        Self {
            id,
            lock_id: lock_id.into(),
            locked_at: Utc::now(),
            delete_at,
        }
    }

    pub fn is_held_by(&self, node_id: &str) -> bool {
        self.lock_id == node_id
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.delete_at < now
    }
}
