//! # Processing Queue
//!
//! Local, deduplicated, priority-ordered work queue fed by the change feed and
//! the poller. An id lives in at most one of three places: queued, in flight,
//! or deferred (recently rejected or failed, kept out of polls for a while).

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::messaging::message::{Msg, MsgId};
use crate::store::types::CandidateRow;

/// Ordering handle for one candidate message.
///
/// Ordered by `(priority, timestamp, msg_id)`; equal only when ids match.
#[derive(Debug, Clone, Copy)]
pub struct ProcessingQueueElement {
    pub priority: i32,
    pub timestamp: DateTime<Utc>,
    pub msg_id: MsgId,
}

impl ProcessingQueueElement {
    pub fn new(priority: i32, timestamp: DateTime<Utc>, msg_id: MsgId) -> Self {
        Self {
            priority,
            timestamp,
            msg_id,
        }
    }

    fn key(&self) -> (i32, DateTime<Utc>, MsgId) {
        (self.priority, self.timestamp, self.msg_id)
    }
}

impl From<&CandidateRow> for ProcessingQueueElement {
    fn from(row: &CandidateRow) -> Self {
        Self::new(row.priority, row.timestamp, row.msg_id)
    }
}

impl From<&Msg> for ProcessingQueueElement {
    fn from(msg: &Msg) -> Self {
        Self::new(msg.priority, msg.timestamp, msg.msg_id)
    }
}

impl PartialEq for ProcessingQueueElement {
    fn eq(&self, other: &Self) -> bool {
        self.msg_id == other.msg_id
    }
}

impl Eq for ProcessingQueueElement {}

impl Hash for ProcessingQueueElement {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.msg_id.hash(state);
    }
}

impl PartialOrd for ProcessingQueueElement {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProcessingQueueElement {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.msg_id == other.msg_id {
            return Ordering::Equal;
        }
        self.key().cmp(&other.key())
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ordered: BTreeSet<ProcessingQueueElement>,
    queued: HashSet<MsgId>,
    in_flight: HashSet<MsgId>,
    deferred: HashMap<MsgId, Instant>,
}

/// Local candidate queue plus in-flight bookkeeping
#[derive(Debug, Default)]
pub struct ProcessingQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl ProcessingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a candidate unless its id is already queued, in flight or deferred.
    /// Returns whether the element was added.
    pub fn push(&self, element: ProcessingQueueElement) -> bool {
        let added = {
            let mut state = self.state.lock();
            let id = element.msg_id;
            let deferred = state
                .deferred
                .get(&id)
                .map(|until| *until > Instant::now())
                .unwrap_or(false);
            if deferred || state.queued.contains(&id) || state.in_flight.contains(&id) {
                false
            } else {
                state.deferred.remove(&id);
                state.queued.insert(id);
                state.ordered.insert(element);
                true
            }
        };
        if added {
            self.available.notify_one();
        }
        added
    }

    /// Take the first element and mark it in flight
    pub fn pop(&self) -> Option<ProcessingQueueElement> {
        let mut state = self.state.lock();
        let element = state.ordered.pop_first()?;
        state.queued.remove(&element.msg_id);
        state.in_flight.insert(element.msg_id);
        Some(element)
    }

    /// Clear the in-flight marker of a finished message
    pub fn release(&self, id: MsgId) {
        self.state.lock().in_flight.remove(&id);
    }

    /// Keep `id` out of the queue until `until`
    pub fn defer(&self, id: MsgId, until: Instant) {
        self.state.lock().deferred.insert(id, until);
    }

    /// Ids to exclude from polls: queued, in flight, or still deferred.
    /// Elapsed deferrals are dropped on the way.
    pub fn known_ids(&self) -> HashSet<MsgId> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.deferred.retain(|_, until| *until > now);
        state
            .queued
            .iter()
            .chain(state.in_flight.iter())
            .chain(state.deferred.keys())
            .copied()
            .collect()
    }

    /// Queued plus in-flight count
    pub fn load(&self) -> usize {
        let state = self.state.lock();
        state.queued.len() + state.in_flight.len()
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn is_in_flight(&self, id: &MsgId) -> bool {
        self.state.lock().in_flight.contains(id)
    }

    /// Drop all queued, in-flight and deferred bookkeeping
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.ordered.clear();
        state.queued.clear();
        state.in_flight.clear();
        state.deferred.clear();
    }

    /// Resolves after the next successful push
    pub async fn notified(&self) {
        self.available.notified().await
    }
}
