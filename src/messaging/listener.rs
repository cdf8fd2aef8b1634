//! # Listener Registry
//!
//! Application handlers keyed by topic, plus global listeners that see every
//! topic. Listener lists are copy-on-write (`Arc<Vec<_>>`), so a dispatch
//! iterates a stable snapshot while registrations change the map.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use super::message::Msg;
use crate::constants::{keys, REJECTION_ANSWER_TEXT};
use crate::engine::poller::PollSignal;

/// Listener outcome; `Err` is an unexpected failure, logged by the dispatcher
pub type ListenerResult = Result<Disposition, anyhow::Error>;

/// What a listener decided about a message
#[derive(Debug)]
pub enum Disposition {
    /// Reply to the sender. Routing fields are filled in by the engine.
    Answer(Msg),
    /// Processed, nothing to say (an acknowledgement is synthesized in auto-answer mode)
    NoAnswer,
    /// Cannot process this message now
    Rejected(Rejection),
}

impl Disposition {
    pub fn answer(msg: Msg) -> Self {
        Self::Answer(msg)
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Rejected(Rejection::new(reason))
    }
}

/// Handler for messages of one or more topics
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    /// Name reported in status info
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn on_message(&self, msg: &Msg) -> ListenerResult;
}

/// What to do with a rejected message
#[derive(Debug, Clone, Default)]
pub struct RejectionAction {
    /// Sent back as an answer to the rejected message
    pub answer: Option<Msg>,
    /// Record this node in `processedBy`, ending its interest in the message
    pub mark_processed: bool,
}

/// Overrides the default rejection behavior for one rejection
pub trait RejectionHandler: Send + Sync {
    fn handle(&self, msg: &Msg, rejection: &Rejection) -> RejectionAction;
}

/// A listener's refusal to process a message
#[derive(Clone)]
pub struct Rejection {
    pub reason: String,
    /// Leave the message eligible for other nodes and later attempts
    pub continue_processing: bool,
    /// Notify the sender with a rejection answer
    pub send_answer: bool,
    pub handler: Option<Arc<dyn RejectionHandler>>,
}

impl std::fmt::Debug for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rejection")
            .field("reason", &self.reason)
            .field("continue_processing", &self.continue_processing)
            .field("send_answer", &self.send_answer)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl Rejection {
    /// Rejection that keeps the message available and sends nothing back
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            continue_processing: true,
            send_answer: false,
            handler: None,
        }
    }

    pub fn continue_processing(mut self, continue_processing: bool) -> Self {
        self.continue_processing = continue_processing;
        self
    }

    pub fn send_answer(mut self, send_answer: bool) -> Self {
        self.send_answer = send_answer;
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn RejectionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Custom handler's decision, or the default one
    pub fn resolve(&self, msg: &Msg) -> RejectionAction {
        match &self.handler {
            Some(handler) => handler.handle(msg, self),
            None => self.default_action(msg),
        }
    }

    /// Optional rejection answer; mark processed unless processing continues
    pub fn default_action(&self, msg: &Msg) -> RejectionAction {
        let answer = self.send_answer.then(|| {
            let mut answer = msg.create_answer();
            answer.msg = Some(REJECTION_ANSWER_TEXT.to_string());
            answer
                .map_value
                .insert(keys::REJECTED.to_string(), serde_json::Value::Bool(true));
            answer.map_value.insert(
                keys::REASON.to_string(),
                serde_json::Value::String(self.reason.clone()),
            );
            answer
        });
        RejectionAction {
            answer,
            mark_processed: !self.continue_processing,
        }
    }
}

/// Listener backed by an async closure
pub struct FnListener<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> MessageListener for FnListener<F>
where
    F: Fn(Msg) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ListenerResult> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_message(&self, msg: &Msg) -> ListenerResult {
        (self.f)(msg.clone()).await
    }
}

/// Wrap an async closure as a listener
///
/// ```rust
/// use docbus::messaging::listener::{listener_fn, Disposition, MessageListener};
///
/// let echo = listener_fn("echo", |msg| async move {
///     Ok(Disposition::Answer(docbus::Msg::builder(msg.topic).msg("pong").build()))
/// });
/// assert_eq!(echo.name(), "echo");
/// ```
pub fn listener_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn MessageListener>
where
    F: Fn(Msg) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ListenerResult> + Send + 'static,
{
    Arc::new(FnListener {
        name: name.into(),
        f,
    })
}

type ListenerList = Arc<Vec<Arc<dyn MessageListener>>>;

fn same_listener(a: &Arc<dyn MessageListener>, b: &Arc<dyn MessageListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Topic → listeners mapping with global listeners
pub struct ListenerRegistry {
    by_topic: DashMap<String, ListenerList>,
    global: RwLock<ListenerList>,
    poll_signal: Arc<PollSignal>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("topics", &self.topics())
            .field("global_listeners", &self.global_count())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn new(poll_signal: Arc<PollSignal>) -> Self {
        Self {
            by_topic: DashMap::new(),
            global: RwLock::new(Arc::new(Vec::new())),
            poll_signal,
        }
    }

    /// Register `listener` for `topic`. Registering the same handle twice is a no-op.
    pub fn add(&self, topic: &str, listener: Arc<dyn MessageListener>) {
        let mut entry = self
            .by_topic
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(Vec::new()));
        if entry.iter().any(|l| same_listener(l, &listener)) {
            return;
        }
        let mut next: Vec<_> = entry.iter().cloned().collect();
        next.push(listener);
        *entry = Arc::new(next);
        drop(entry);

        debug!(topic = %topic, "Listener registered");
        self.poll_signal.request();
    }

    /// Unregister one listener handle; returns whether it was registered
    pub fn remove(&self, topic: &str, listener: &Arc<dyn MessageListener>) -> bool {
        let removed = {
            let Some(mut entry) = self.by_topic.get_mut(topic) else {
                return false;
            };
            let before = entry.len();
            let next: Vec<_> = entry
                .iter()
                .filter(|l| !same_listener(l, listener))
                .cloned()
                .collect();
            let removed = next.len() != before;
            *entry = Arc::new(next);
            removed
        };
        self.by_topic.remove_if(topic, |_, list| list.is_empty());

        if removed {
            debug!(topic = %topic, "Listener unregistered");
            self.poll_signal.request();
        }
        removed
    }

    pub fn add_global(&self, listener: Arc<dyn MessageListener>) {
        {
            let mut global = self.global.write();
            if global.iter().any(|l| same_listener(l, &listener)) {
                return;
            }
            let mut next: Vec<_> = global.iter().cloned().collect();
            next.push(listener);
            *global = Arc::new(next);
        }
        self.poll_signal.request();
    }

    pub fn remove_global(&self, listener: &Arc<dyn MessageListener>) -> bool {
        let removed = {
            let mut global = self.global.write();
            let before = global.len();
            let next: Vec<_> = global
                .iter()
                .filter(|l| !same_listener(l, listener))
                .cloned()
                .collect();
            let removed = next.len() != before;
            *global = Arc::new(next);
            removed
        };
        if removed {
            self.poll_signal.request();
        }
        removed
    }

    /// Topic listeners followed by global listeners
    pub fn listeners_for(&self, topic: &str) -> Vec<Arc<dyn MessageListener>> {
        let mut listeners: Vec<_> = self
            .by_topic
            .get(topic)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default();
        let global = Arc::clone(&self.global.read());
        listeners.extend(global.iter().cloned());
        listeners
    }

    /// Whether anything would receive a message of `topic`
    pub fn is_interested(&self, topic: &str) -> bool {
        self.global_count() > 0 || self.by_topic.contains_key(topic)
    }

    /// Topics with listeners, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.by_topic.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }

    /// Poll filter; `None` while global listeners accept every topic
    pub fn topic_filter(&self) -> Option<HashSet<String>> {
        if self.global_count() > 0 {
            None
        } else {
            Some(self.by_topic.iter().map(|e| e.key().clone()).collect())
        }
    }

    pub fn global_count(&self) -> usize {
        self.global.read().len()
    }

    /// Names of all registered listeners, topic listeners first
    pub fn listener_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for topic in self.topics() {
            if let Some(list) = self.by_topic.get(&topic) {
                names.extend(list.iter().map(|l| format!("{topic}:{}", l.name())));
            }
        }
        names.extend(self.global.read().iter().map(|l| format!("*:{}", l.name())));
        names
    }
}
