//! # Engine
//!
//! The moving parts behind the [`Messaging`](crate::Messaging) façade:
//!
//! - [`change_feed`]: turns store notifications into candidates
//! - [`poller`]: authoritative periodic candidate query
//! - [`processing_queue`]: deduplicated priority queue and in-flight set
//! - [`dispatcher`]: per-message state machine and worker pool
//! - [`lock_manager`]: exclusive-processing locks
//! - [`sweeper`]: expiry and callback housekeeping
//!
//! Feed and poller only enqueue; listener code runs exclusively in the
//! dispatcher. All of them share one [`EngineContext`].

pub mod change_feed;
pub mod dispatcher;
pub mod lock_manager;
pub mod poller;
pub mod processing_queue;
pub mod stats;
pub mod sweeper;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::debug;

use crate::config::{MessagingConfig, RetryConfig};
use crate::constants::SELF_SENDER;
use crate::logging::log_message_operation;
use crate::messaging::correlator::Correlator;
use crate::messaging::errors::MessagingResult;
use crate::messaging::listener::ListenerRegistry;
use crate::messaging::message::{Msg, MsgId};
use crate::messaging::pause::PausedTopics;
use crate::store::MessageStore;

pub use lock_manager::LockManager;
pub use poller::PollSignal;
pub use processing_queue::{ProcessingQueue, ProcessingQueueElement};
pub use stats::{EngineStats, EngineStatsSnapshot};

/// Runtime-adjustable engine settings
#[derive(Debug)]
pub struct EngineSettings {
    window_size: AtomicUsize,
    poll_interval_ms: AtomicU64,
    pause_poll_interval_ms: AtomicU64,
    multithreaded: AtomicBool,
    use_change_feed: AtomicBool,
    auto_answer: AtomicBool,
    worker_threads: usize,
}

impl EngineSettings {
    pub fn from_config(config: &MessagingConfig) -> Self {
        Self {
            window_size: AtomicUsize::new(config.window_size),
            poll_interval_ms: AtomicU64::new(config.poll_interval_ms),
            pause_poll_interval_ms: AtomicU64::new(config.pause_poll_interval_ms),
            multithreaded: AtomicBool::new(config.multithreaded),
            use_change_feed: AtomicBool::new(config.use_change_feed),
            auto_answer: AtomicBool::new(config.auto_answer),
            worker_threads: config.worker_threads.max(1),
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size.load(Ordering::Relaxed)
    }

    pub fn set_window_size(&self, size: usize) {
        self.window_size.store(size.max(1), Ordering::Relaxed);
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_poll_interval(&self, interval: Duration) {
        let millis = (interval.as_millis() as u64).max(1);
        self.poll_interval_ms.store(millis, Ordering::Relaxed);
    }

    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_pause_poll_interval(&self, interval: Duration) {
        self.pause_poll_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn multithreaded(&self) -> bool {
        self.multithreaded.load(Ordering::Relaxed)
    }

    pub fn set_multithreaded(&self, enabled: bool) {
        self.multithreaded.store(enabled, Ordering::Relaxed);
    }

    pub fn use_change_feed(&self) -> bool {
        self.use_change_feed.load(Ordering::Relaxed)
    }

    pub fn set_use_change_feed(&self, enabled: bool) {
        self.use_change_feed.store(enabled, Ordering::Relaxed);
    }

    pub fn auto_answer(&self) -> bool {
        self.auto_answer.load(Ordering::Relaxed)
    }

    pub fn set_auto_answer(&self, enabled: bool) {
        self.auto_answer.store(enabled, Ordering::Relaxed);
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }
}

/// State shared by feed monitor, poller, dispatcher and façade
pub struct EngineContext {
    pub node_id: String,
    pub host: String,
    pub queue_name: String,
    pub store: Arc<dyn MessageStore>,
    pub settings: EngineSettings,
    pub config: MessagingConfig,
    pub retry: RetryConfig,
    pub queue: ProcessingQueue,
    pub poll_signal: Arc<PollSignal>,
    pub listeners: ListenerRegistry,
    pub paused: PausedTopics,
    pub correlator: Correlator,
    pub lock_manager: LockManager,
    pub stats: EngineStats,
    /// Active worker count
    pub active_workers: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("node_id", &self.node_id)
            .field("queue_name", &self.queue_name)
            .field("backend", &self.store.backend_name())
            .field("settings", &self.settings)
            .field("queued", &self.queue.queued_len())
            .field("in_flight", &self.queue.in_flight_len())
            .finish()
    }
}

impl EngineContext {
    pub fn new(
        node_id: String,
        host: String,
        store: Arc<dyn MessageStore>,
        config: MessagingConfig,
        retry: RetryConfig,
    ) -> Self {
        let poll_signal = Arc::new(PollSignal::new());
        let queue_name = config.queue_name.clone();
        let lock_manager = LockManager::new(
            Arc::clone(&store),
            queue_name.clone(),
            node_id.clone(),
            config.default_lock_ttl(),
            retry.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            settings: EngineSettings::from_config(&config),
            listeners: ListenerRegistry::new(Arc::clone(&poll_signal)),
            paused: PausedTopics::new(Arc::clone(&poll_signal)),
            queue: ProcessingQueue::new(),
            correlator: Correlator::new(),
            stats: EngineStats::default(),
            active_workers: AtomicUsize::new(0),
            node_id,
            host,
            queue_name,
            store,
            config,
            retry,
            poll_signal,
            lock_manager,
            shutdown,
        }
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn signal_shutdown(&self, value: bool) {
        self.shutdown.send_replace(value);
    }

    /// Stamp sender, host, timestamp and expiry onto an outgoing message
    pub fn prepare_outgoing(&self, mut msg: Msg, to_self: bool) -> Msg {
        if to_self {
            msg.sender = Some(SELF_SENDER.to_string());
            msg.recipients = vec![self.node_id.clone()];
        } else {
            msg.sender = Some(self.node_id.clone());
        }
        msg.sender_host = Some(self.host.clone());
        msg.timestamp = Utc::now();
        msg.processed_by.clear();
        msg.delete_at = msg.compute_delete_at();
        msg
    }

    /// Validate and persist a prepared message. Never retried: a retried
    /// insert could deliver twice.
    pub async fn persist(&self, msg: &Msg) -> MessagingResult<MsgId> {
        msg.validate()?;
        self.store.insert_message(&self.queue_name, msg).await?;
        EngineStats::incr(&self.stats.messages_sent);
        log_message_operation("send", &self.node_id, msg, "stored");
        Ok(msg.msg_id)
    }

    /// Prepare and persist
    pub async fn send(&self, msg: Msg) -> MessagingResult<MsgId> {
        let msg = self.prepare_outgoing(msg, false);
        self.persist(&msg).await
    }

    /// Window is full: queued plus in flight reached `window_size`
    pub fn is_saturated(&self) -> bool {
        self.queue.load() >= self.settings.window_size()
    }

    /// Keep a message out of local processing for one poll interval
    pub fn defer(&self, id: MsgId) {
        let until = std::time::Instant::now() + self.settings.poll_interval();
        self.queue.defer(id, until);
        debug!(msg_id = %id, "Message deferred locally");
    }
}
