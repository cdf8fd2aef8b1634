//! # Request/Answer Correlator
//!
//! Matches incoming answers (`inAnswerTo` set) to requests sent by this node.
//!
//! - **Blocking wait**: a collector is registered under the request id before
//!   the request is sent; the caller waits until enough answers arrived, the
//!   timeout elapses, or the engine shuts down.
//! - **Async callback**: a one-shot callback with a TTL, run on its own task
//!   when the first answer arrives. Unanswered callbacks are swept.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use super::message::{Msg, MsgId};

/// Callback fired with the first answer to a request
pub type AnswerCallback = Box<dyn FnOnce(Msg) + Send + Sync + 'static>;

/// Where an answer went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerRoute {
    /// Delivered to a blocked caller
    Waiting,
    /// Handed to an async callback
    Callback,
    /// Nobody here is waiting; process as an ordinary message
    Unmatched,
}

/// Answers collected for one outstanding request
#[derive(Debug)]
pub struct AnswerCollector {
    request_id: MsgId,
    expected: usize,
    answers: Mutex<Vec<Msg>>,
    arrived: Notify,
}

impl AnswerCollector {
    fn new(request_id: MsgId, expected: usize) -> Self {
        Self {
            request_id,
            expected: expected.max(1),
            answers: Mutex::new(Vec::new()),
            arrived: Notify::new(),
        }
    }

    fn push(&self, answer: Msg) {
        self.answers.lock().push(answer);
        self.arrived.notify_one();
    }

    pub fn request_id(&self) -> MsgId {
        self.request_id
    }

    pub fn len(&self) -> usize {
        self.answers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_complete(&self) -> bool {
        self.len() >= self.expected
    }

    fn take(&self) -> Vec<Msg> {
        std::mem::take(&mut *self.answers.lock())
    }
}

struct PendingCallback {
    expires_at: Instant,
    callback: AnswerCallback,
}

/// Outstanding requests of one engine instance
#[derive(Default)]
pub struct Correlator {
    waiting: DashMap<MsgId, Arc<AnswerCollector>>,
    callbacks: DashMap<MsgId, PendingCallback>,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("waiting", &self.waiting.len())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collector; must happen before the request is sent
    pub fn register_waiter(&self, request_id: MsgId, expected: usize) -> Arc<AnswerCollector> {
        let collector = Arc::new(AnswerCollector::new(request_id, expected));
        self.waiting.insert(request_id, Arc::clone(&collector));
        collector
    }

    pub fn remove_waiter(&self, request_id: MsgId) {
        self.waiting.remove(&request_id);
    }

    pub fn register_callback(&self, request_id: MsgId, ttl: Duration, callback: AnswerCallback) {
        self.callbacks.insert(
            request_id,
            PendingCallback {
                expires_at: Instant::now() + ttl,
                callback,
            },
        );
    }

    pub fn remove_callback(&self, request_id: MsgId) -> bool {
        self.callbacks.remove(&request_id).is_some()
    }

    /// Deliver an answer to a waiter, else to a callback
    pub fn route_answer(&self, answer: &Msg) -> AnswerRoute {
        let Some(request_id) = answer.in_answer_to else {
            return AnswerRoute::Unmatched;
        };

        if let Some(collector) = self.waiting.get(&request_id).map(|c| Arc::clone(&c)) {
            collector.push(answer.clone());
            debug!(request_id = %request_id, answer_id = %answer.msg_id, "Answer delivered to waiting caller");
            return AnswerRoute::Waiting;
        }

        if let Some((_, pending)) = self.callbacks.remove(&request_id) {
            if pending.expires_at <= Instant::now() {
                debug!(request_id = %request_id, "Answer arrived after callback expired");
                return AnswerRoute::Unmatched;
            }
            let answer = answer.clone();
            tokio::spawn(async move {
                (pending.callback)(answer);
            });
            debug!(request_id = %request_id, "Answer handed to async callback");
            return AnswerRoute::Callback;
        }

        AnswerRoute::Unmatched
    }

    /// Wait until the collector is complete, `timeout` elapses or shutdown is
    /// signalled. Returns whatever arrived and unregisters the collector.
    pub async fn wait(
        &self,
        collector: &AnswerCollector,
        timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Vec<Msg> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if collector.is_complete() || *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = collector.arrived.notified() => {}
                _ = tokio::time::sleep_until(deadline) => break,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.remove_waiter(collector.request_id);
        collector.take()
    }

    /// Drop callbacks whose TTL elapsed; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.callbacks.len();
        self.callbacks.retain(|request_id, pending| {
            let keep = pending.expires_at > now;
            if !keep {
                debug!(request_id = %request_id, "Async answer callback expired unanswered");
            }
            keep
        });
        before.saturating_sub(self.callbacks.len())
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Forget every outstanding request; blocked callers wake up
    pub fn clear(&self) {
        let waiters = self.waiting.len();
        for entry in self.waiting.iter() {
            entry.value().arrived.notify_one();
        }
        self.waiting.clear();
        let callbacks = self.callbacks.len();
        self.callbacks.clear();
        if waiters + callbacks > 0 {
            warn!(waiters = waiters, callbacks = callbacks, "Outstanding answer correlations dropped");
        }
    }
}
