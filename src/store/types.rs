//! Store-facing value types shared by every backend.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::messaging::errors::MessagingResult;
use crate::messaging::message::{Msg, MsgId};

/// The two collections a queue is made of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Messages,
    Locks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

/// Routing and ordering fields of a message, without payload.
///
/// Returned by candidate queries and embedded in insert notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRow {
    #[serde(rename = "_id")]
    pub msg_id: MsgId,
    pub topic: String,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
    pub priority: i32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub in_answer_to: Option<MsgId>,
}

impl From<&Msg> for CandidateRow {
    fn from(msg: &Msg) -> Self {
        Self {
            msg_id: msg.msg_id,
            topic: msg.topic.clone(),
            sender: msg.sender.clone(),
            recipients: msg.recipients.clone(),
            priority: msg.priority,
            timestamp: msg.timestamp,
            exclusive: msg.exclusive,
            in_answer_to: msg.in_answer_to,
        }
    }
}

/// One store mutation as delivered by a watch stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub collection: Collection,
    pub operation: OperationType,
    pub document_key: MsgId,
    /// Present for message inserts
    #[serde(default)]
    pub summary: Option<CandidateRow>,
}

impl ChangeEvent {
    pub fn message_inserted(msg: &Msg) -> Self {
        Self {
            collection: Collection::Messages,
            operation: OperationType::Insert,
            document_key: msg.msg_id,
            summary: Some(CandidateRow::from(msg)),
        }
    }

    pub fn new(collection: Collection, operation: OperationType, document_key: MsgId) -> Self {
        Self {
            collection,
            operation,
            document_key,
            summary: None,
        }
    }
}

/// Which events a watch stream delivers
#[derive(Debug, Clone, Default)]
pub struct WatchFilter {
    entries: Vec<(Collection, OperationType)>,
}

impl WatchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, collection: Collection, operation: OperationType) -> Self {
        if !self.entries.contains(&(collection, operation)) {
            self.entries.push((collection, operation));
        }
        self
    }

    /// Message inserts plus lock deletes
    pub fn engine_default() -> Self {
        Self::new()
            .with(Collection::Messages, OperationType::Insert)
            .with(Collection::Locks, OperationType::Delete)
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.entries.is_empty()
            || self
                .entries
                .iter()
                .any(|(c, o)| *c == event.collection && *o == event.operation)
    }
}

/// Poll filter: what this node may process right now
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub node_id: String,
    /// Ids already queued or in flight locally
    pub exclude_ids: HashSet<MsgId>,
    pub paused_topics: HashSet<String>,
    /// Topics with listeners; `None` when global listeners accept everything.
    /// Answers are always selected regardless of topic.
    pub topics: Option<HashSet<String>>,
    pub limit: usize,
}

impl CandidateQuery {
    pub fn new(node_id: impl Into<String>, limit: usize) -> Self {
        Self {
            node_id: node_id.into(),
            exclude_ids: HashSet::new(),
            paused_topics: HashSet::new(),
            topics: None,
            limit,
        }
    }

    /// Topic and pause part of the filter
    pub fn accepts_topic(&self, topic: &str, is_answer: bool) -> bool {
        if self.paused_topics.contains(topic) {
            return false;
        }
        is_answer
            || self
                .topics
                .as_ref()
                .map(|topics| topics.contains(topic))
                .unwrap_or(true)
    }
}

/// Rows removed by an expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeCounts {
    pub messages: u64,
    pub locks: u64,
}

/// Stream of change events; an `Err` item means the subscription is broken
pub type ChangeStream = BoxStream<'static, MessagingResult<ChangeEvent>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_filter_matching() {
        let filter = WatchFilter::engine_default();
        let id = MsgId::new();
        assert!(filter.matches(&ChangeEvent::new(Collection::Messages, OperationType::Insert, id)));
        assert!(filter.matches(&ChangeEvent::new(Collection::Locks, OperationType::Delete, id)));
        assert!(!filter.matches(&ChangeEvent::new(Collection::Messages, OperationType::Update, id)));
        assert!(!filter.matches(&ChangeEvent::new(Collection::Locks, OperationType::Insert, id)));
        assert!(WatchFilter::new().matches(&ChangeEvent::new(Collection::Locks, OperationType::Update, id)));
    }

    #[test]
    fn test_candidate_query_topic_filter() {
        let mut query = CandidateQuery::new("node-a", 10);
        assert!(query.accepts_topic("anything", false));

        query.topics = Some(["ping".to_string()].into_iter().collect());
        assert!(query.accepts_topic("ping", false));
        assert!(!query.accepts_topic("other", false));
        assert!(query.accepts_topic("other", true));

        query.paused_topics.insert("ping".to_string());
        assert!(!query.accepts_topic("ping", false));
        assert!(!query.accepts_topic("ping", true));
    }

    #[test]
    fn test_change_event_wire_shape() {
        let msg = Msg::new("ping", "m", "v");
        let event = ChangeEvent::message_inserted(&msg);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["collection"], "messages");
        assert_eq!(json["operation"], "insert");
        assert_eq!(json["summary"]["topic"], "ping");

        let parsed: ChangeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.document_key, msg.msg_id);
    }
}
