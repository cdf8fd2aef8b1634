//! # Messaging Façade
//!
//! [`Messaging`] is the application-facing handle of one engine instance:
//! lifecycle (`start`/`terminate`), listener registration, sending, request
//! and answer correlation, topic pausing and runtime settings.
//!
//! Handles are cheap to clone and share one engine. Background loops run on
//! tasks spawned by [`Messaging::start`] and are joined by
//! [`Messaging::terminate`]; call `terminate` before dropping the last handle.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use docbus::{listener_fn, Disposition, InMemoryStore, Messaging, Msg};
//! use docbus::config::MessagingConfig;
//!
//! # async fn example() -> docbus::MessagingResult<()> {
//! let store = Arc::new(InMemoryStore::new());
//! let messaging = Messaging::new(store, MessagingConfig::default())?;
//! messaging.add_listener_for_topic(
//!     "ping",
//!     listener_fn("pong", |msg| async move {
//!         Ok(Disposition::answer(Msg::builder(msg.topic).msg("pong").build()))
//!     }),
//! );
//! messaging.start().await?;
//! messaging.send_message(Msg::new("ping", "hello", "")).await?;
//! messaging.terminate().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::errors::{MessagingError, MessagingResult};
use super::listener::MessageListener;
use super::message::{Msg, MsgId};
use super::registry::MessagingRegistry;
use super::status_info::{self, StatusInfoListener};
use crate::config::{DocbusConfig, MessagingConfig, RetryConfig};
use crate::constants::STATUS_INFO_TOPIC;
use crate::engine::{change_feed, dispatcher, poller, sweeper, EngineContext, EngineStatsSnapshot};
use crate::resilience::with_retry;
use crate::store::{self, MessageStore};

/// Background tasks of a started engine
struct EngineRuntime {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    workers: Arc<Semaphore>,
}

pub(crate) struct MessagingInner {
    ctx: Arc<EngineContext>,
    runtime: Mutex<Option<EngineRuntime>>,
    running: AtomicBool,
    registry: Option<Arc<MessagingRegistry>>,
}

impl std::fmt::Debug for MessagingInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingInner")
            .field("ctx", &self.ctx)
            .field("running", &self.running.load(Ordering::SeqCst))
            .field("has_registry", &self.registry.is_some())
            .finish()
    }
}

/// Handle to one messaging engine instance
#[derive(Debug, Clone)]
pub struct Messaging {
    inner: Arc<MessagingInner>,
}

/// Builder for [`Messaging`]
pub struct MessagingBuilder {
    store: Arc<dyn MessageStore>,
    config: MessagingConfig,
    retry: RetryConfig,
    registry: Option<Arc<MessagingRegistry>>,
    node_id: Option<String>,
    host: Option<String>,
}

impl std::fmt::Debug for MessagingBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingBuilder")
            .field("backend", &self.store.backend_name())
            .field("config", &self.config)
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl MessagingBuilder {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            config: MessagingConfig::default(),
            retry: RetryConfig::default(),
            registry: None,
            node_id: None,
            host: None,
        }
    }

    pub fn config(mut self, config: MessagingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Register with `registry` while running
    pub fn registry(mut self, registry: Arc<MessagingRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Explicit node identity; overrides `messaging.node_id`
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn build(self) -> MessagingResult<Messaging> {
        self.config.validate()?;
        self.retry.validate()?;

        let host = self.host.unwrap_or_else(local_host);
        let node_id = self
            .node_id
            .or_else(|| self.config.node_id.clone())
            .unwrap_or_else(|| generate_node_id(&host));
        if node_id.trim().is_empty() {
            return Err(MessagingError::configuration(
                "messaging",
                "node id must not be blank",
            ));
        }

        let status_info_enabled = self.config.status_info_enabled;
        let ctx = Arc::new(EngineContext::new(
            node_id,
            host,
            self.store,
            self.config,
            self.retry,
        ));
        if status_info_enabled {
            ctx.listeners.add(
                STATUS_INFO_TOPIC,
                Arc::new(StatusInfoListener::new(Arc::downgrade(&ctx))),
            );
        }

        info!(
            node_id = %ctx.node_id,
            queue = %ctx.queue_name,
            backend = ctx.store.backend_name(),
            "Messaging instance created"
        );

        Ok(Messaging {
            inner: Arc::new(MessagingInner {
                ctx,
                runtime: Mutex::new(None),
                running: AtomicBool::new(false),
                registry: self.registry,
            }),
        })
    }
}

fn local_host() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// `<host>-<pid>-<8 hex chars>`
fn generate_node_id(host: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{host}-{}-{}", std::process::id(), &suffix[..8])
}

impl Messaging {
    /// Engine over `store` with default retry settings
    pub fn new(store: Arc<dyn MessageStore>, config: MessagingConfig) -> MessagingResult<Self> {
        MessagingBuilder::new(store).config(config).build()
    }

    pub fn builder(store: Arc<dyn MessageStore>) -> MessagingBuilder {
        MessagingBuilder::new(store)
    }

    /// Connect the configured store and build an engine over it
    pub async fn from_config(config: &DocbusConfig) -> MessagingResult<Self> {
        config.validate()?;
        let store = store::connect(&config.store).await?;
        MessagingBuilder::new(store)
            .config(config.messaging.clone())
            .retry(config.retry.clone())
            .build()
    }

    pub(crate) fn from_inner(inner: Arc<MessagingInner>) -> Self {
        Self { inner }
    }

    fn ctx(&self) -> &Arc<EngineContext> {
        &self.inner.ctx
    }

    pub fn node_id(&self) -> &str {
        &self.ctx().node_id
    }

    pub fn queue_name(&self) -> &str {
        &self.ctx().queue_name
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> MessagingResult<()> {
        if !self.is_running() {
            return Err(MessagingError::NotRunning);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Prepare the store and spawn dispatcher, poller, change feed and
    /// sweeps. Starting a running engine is a no-op.
    #[instrument(skip(self), fields(node_id = %self.node_id()))]
    pub async fn start(&self) -> MessagingResult<()> {
        let mut runtime = self.inner.runtime.lock().await;
        if runtime.is_some() {
            debug!("Messaging already running");
            return Ok(());
        }

        let ctx = Arc::clone(self.ctx());
        with_retry(&ctx.retry, "ensure_queue", || {
            ctx.store.ensure_queue(&ctx.queue_name)
        })
        .await?;

        ctx.signal_shutdown(false);
        let workers = Arc::new(Semaphore::new(ctx.settings.worker_threads()));
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        tasks.push((
            "dispatcher",
            tokio::spawn(dispatcher::run(
                Arc::clone(&ctx),
                Arc::clone(&workers),
                ctx.shutdown_receiver(),
            )),
        ));
        tasks.push((
            "poller",
            tokio::spawn(poller::run(Arc::clone(&ctx), ctx.shutdown_receiver())),
        ));

        let feed = ctx.settings.use_change_feed() && ctx.store.supports_watch();
        if feed {
            tasks.push((
                "change_feed",
                tokio::spawn(change_feed::run(Arc::clone(&ctx), ctx.shutdown_receiver())),
            ));
        } else if ctx.settings.use_change_feed() {
            info!(
                backend = ctx.store.backend_name(),
                "Store has no change feed, relying on polling"
            );
        }

        tasks.push((
            "expiry_sweep",
            tokio::spawn(sweeper::run_expiry_sweep(
                Arc::clone(&ctx),
                ctx.shutdown_receiver(),
            )),
        ));
        tasks.push((
            "callback_sweep",
            tokio::spawn(sweeper::run_callback_sweep(
                Arc::clone(&ctx),
                ctx.shutdown_receiver(),
            )),
        ));

        *runtime = Some(EngineRuntime { tasks, workers });
        self.inner.running.store(true, Ordering::SeqCst);

        if let Some(registry) = &self.inner.registry {
            registry.register(&ctx.node_id, &self.inner);
        }

        info!(
            queue = %ctx.queue_name,
            change_feed = feed,
            multithreaded = ctx.settings.multithreaded(),
            window_size = ctx.settings.window_size(),
            "Messaging started"
        );
        Ok(())
    }

    /// Stop all background work and clear local bookkeeping. Safe to call
    /// repeatedly and on an engine that never started.
    #[instrument(skip(self), fields(node_id = %self.node_id()))]
    pub async fn terminate(&self) -> MessagingResult<()> {
        let mut guard = self.inner.runtime.lock().await;
        let Some(runtime) = guard.take() else {
            debug!("Messaging not running, nothing to terminate");
            return Ok(());
        };

        let ctx = Arc::clone(self.ctx());
        self.inner.running.store(false, Ordering::SeqCst);
        ctx.signal_shutdown(true);
        let timeout = ctx.config.shutdown_timeout();

        for (name, mut handle) in runtime.tasks {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "Background task stopped"),
                Ok(Err(e)) => error!(task = name, error = %e, "Background task ended abnormally"),
                Err(_) => {
                    warn!(task = name, timeout_ms = timeout.as_millis() as u64, "Background task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        // In-flight listener tasks hold worker permits
        let permits = ctx.settings.worker_threads() as u32;
        if tokio::time::timeout(timeout, runtime.workers.acquire_many(permits))
            .await
            .is_err()
        {
            warn!(
                active_workers = ctx.active_workers.load(Ordering::SeqCst),
                "In-flight listeners still running after shutdown timeout"
            );
        }

        ctx.queue.clear();
        ctx.correlator.clear();

        if let Some(registry) = &self.inner.registry {
            registry.unregister(&ctx.node_id);
        }

        info!("Messaging terminated");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Listeners
    // ---------------------------------------------------------------------

    pub fn add_listener_for_topic(&self, topic: &str, listener: Arc<dyn MessageListener>) {
        self.ctx().listeners.add(topic, listener);
    }

    /// Returns whether the listener was registered for `topic`
    pub fn remove_listener_for_topic(
        &self,
        topic: &str,
        listener: &Arc<dyn MessageListener>,
    ) -> bool {
        self.ctx().listeners.remove(topic, listener)
    }

    /// Listener invoked for every topic, after the topic's own listeners
    pub fn add_global_listener(&self, listener: Arc<dyn MessageListener>) {
        self.ctx().listeners.add_global(listener);
    }

    pub fn remove_global_listener(&self, listener: &Arc<dyn MessageListener>) -> bool {
        self.ctx().listeners.remove_global(listener)
    }

    // ---------------------------------------------------------------------
    // Sending
    // ---------------------------------------------------------------------

    /// Stamp and persist `msg`. Invalid messages fail here and are never stored.
    pub async fn send_message(&self, msg: Msg) -> MessagingResult<MsgId> {
        self.ctx().send(msg).await
    }

    /// Validate now, persist in the background
    pub fn queue_message(&self, msg: Msg) -> MessagingResult<MsgId> {
        let ctx = Arc::clone(self.ctx());
        let msg = ctx.prepare_outgoing(msg, false);
        msg.validate()?;
        let id = msg.msg_id;
        tokio::spawn(async move {
            if let Err(e) = ctx.persist(&msg).await {
                warn!(node_id = %ctx.node_id, msg_id = %msg.msg_id, error = %e, "Queued message could not be stored");
            }
        });
        Ok(id)
    }

    /// Message processed only by this node's own listeners
    pub async fn send_message_to_self(&self, msg: Msg) -> MessagingResult<MsgId> {
        let msg = self.ctx().prepare_outgoing(msg, true);
        self.ctx().persist(&msg).await
    }

    // ---------------------------------------------------------------------
    // Request / answer
    // ---------------------------------------------------------------------

    /// Send `msg` and wait for the first answer.
    ///
    /// On timeout returns `Ok(None)`, or `Err(Timeout)` when `throw_on_timeout`.
    pub async fn send_and_await_first_answer(
        &self,
        msg: Msg,
        timeout: Duration,
        throw_on_timeout: bool,
    ) -> MessagingResult<Option<Msg>> {
        let answers = self
            .send_and_await_answers(msg, 1, timeout, throw_on_timeout)
            .await?;
        Ok(answers.into_iter().next())
    }

    /// Send `msg` and wait for `count` answers.
    ///
    /// On timeout returns whatever arrived, or `Err(Timeout)` when
    /// `throw_on_timeout` and fewer than `count` answers came in.
    #[instrument(skip(self, msg), fields(node_id = %self.node_id(), topic = %msg.topic))]
    pub async fn send_and_await_answers(
        &self,
        msg: Msg,
        count: usize,
        timeout: Duration,
        throw_on_timeout: bool,
    ) -> MessagingResult<Vec<Msg>> {
        self.ensure_running()?;
        let ctx = self.ctx();
        let msg = ctx.prepare_outgoing(msg, false);
        msg.validate()?;

        let collector = ctx.correlator.register_waiter(msg.msg_id, count);
        if let Err(e) = ctx.persist(&msg).await {
            ctx.correlator.remove_waiter(msg.msg_id);
            return Err(e);
        }

        let answers = ctx
            .correlator
            .wait(&collector, timeout, ctx.shutdown_receiver())
            .await;

        if answers.len() < count.max(1) {
            if ctx.is_shutting_down() {
                return Err(MessagingError::ShuttingDown);
            }
            if throw_on_timeout {
                return Err(MessagingError::timeout(
                    format!("await answers to {}", msg.msg_id),
                    timeout.as_millis() as u64,
                ));
            }
            debug!(
                request_id = %msg.msg_id,
                expected = count,
                received = answers.len(),
                "Answer wait timed out"
            );
        }
        Ok(answers)
    }

    /// Send `msg`; `callback` runs on its own task with the first answer
    /// arriving within `timeout`. Unanswered callbacks are dropped.
    pub async fn send_and_await_async<F>(
        &self,
        msg: Msg,
        timeout: Duration,
        callback: F,
    ) -> MessagingResult<MsgId>
    where
        F: FnOnce(Msg) + Send + Sync + 'static,
    {
        let ctx = self.ctx();
        let msg = ctx.prepare_outgoing(msg, false);
        msg.validate()?;

        ctx.correlator
            .register_callback(msg.msg_id, timeout, Box::new(callback));
        match ctx.persist(&msg).await {
            Ok(id) => Ok(id),
            Err(e) => {
                ctx.correlator.remove_callback(msg.msg_id);
                Err(e)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Pausing
    // ---------------------------------------------------------------------

    /// Stop dispatching `topic`, including already queued candidates.
    /// Returns `false` if it was paused already.
    pub fn pause_topic_processing(&self, topic: &str) -> bool {
        self.ctx().paused.pause(topic)
    }

    /// Resume `topic`; returns how long it was paused, `None` if it was not
    pub fn unpause_topic_processing(&self, topic: &str) -> Option<u64> {
        self.ctx().paused.unpause(topic)
    }

    pub fn is_topic_paused(&self, topic: &str) -> bool {
        self.ctx().paused.is_paused(topic)
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    /// Locally queued plus in-flight messages
    pub fn get_pending_messages_count(&self) -> usize {
        self.ctx().queue.load()
    }

    /// Messages currently stored in the queue's collection
    pub async fn get_number_of_messages(&self) -> MessagingResult<u64> {
        let ctx = self.ctx();
        with_retry(&ctx.retry, "count_messages", || {
            ctx.store.count_messages(&ctx.queue_name)
        })
        .await
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.ctx().stats.snapshot()
    }

    /// This node's status info, as peers would receive it
    pub fn status_info(&self) -> HashMap<String, serde_json::Value> {
        status_info::collect(self.ctx())
    }

    /// Broadcast a status info request and collect the answers that arrive within `timeout`
    pub async fn request_status_info(&self, timeout: Duration) -> MessagingResult<Vec<Msg>> {
        let request = Msg::builder(STATUS_INFO_TOPIC)
            .msg("status")
            .ttl(timeout.as_millis() as u64)
            .build();
        self.send_and_await_answers(request, usize::MAX, timeout, false)
            .await
    }

    // ---------------------------------------------------------------------
    // Settings
    // ---------------------------------------------------------------------

    pub fn window_size(&self) -> usize {
        self.ctx().settings.window_size()
    }

    /// Takes effect on the next poll; values below 1 become 1
    pub fn set_window_size(&self, size: usize) {
        self.ctx().settings.set_window_size(size);
        self.ctx().poll_signal.request();
    }

    pub fn poll_interval(&self) -> Duration {
        self.ctx().settings.poll_interval()
    }

    pub fn set_poll_interval(&self, interval: Duration) {
        self.ctx().settings.set_poll_interval(interval);
    }

    pub fn pause_poll_interval(&self) -> Duration {
        self.ctx().settings.pause_poll_interval()
    }

    pub fn set_pause_poll_interval(&self, interval: Duration) {
        self.ctx().settings.set_pause_poll_interval(interval);
    }

    pub fn is_multithreaded(&self) -> bool {
        self.ctx().settings.multithreaded()
    }

    /// Only before `start`
    pub fn set_multithreaded(&self, enabled: bool) -> MessagingResult<()> {
        self.ensure_stopped("multithreaded")?;
        self.ctx().settings.set_multithreaded(enabled);
        Ok(())
    }

    pub fn uses_change_feed(&self) -> bool {
        self.ctx().settings.use_change_feed()
    }

    /// Only before `start`
    pub fn set_use_change_feed(&self, enabled: bool) -> MessagingResult<()> {
        self.ensure_stopped("use_change_feed")?;
        self.ctx().settings.set_use_change_feed(enabled);
        Ok(())
    }

    pub fn is_auto_answer(&self) -> bool {
        self.ctx().settings.auto_answer()
    }

    pub fn set_auto_answer(&self, enabled: bool) {
        self.ctx().settings.set_auto_answer(enabled);
    }

    fn ensure_stopped(&self, setting: &str) -> MessagingResult<()> {
        if self.is_running() {
            return Err(MessagingError::configuration(
                "messaging",
                format!("{setting} cannot be changed while running"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn quiet_config() -> MessagingConfig {
        MessagingConfig {
            multithreaded: false,
            poll_interval_ms: 20,
            ..MessagingConfig::default()
        }
    }

    #[test]
    fn test_generated_node_id_shape() {
        let id = generate_node_id("box");
        let parts: Vec<&str> = id.rsplitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[2], "box");
        assert_ne!(generate_node_id("box"), id);
    }

    #[test]
    fn test_builder_prefers_explicit_node_id() {
        let config = MessagingConfig {
            node_id: Some("from-config".to_string()),
            ..quiet_config()
        };
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryStore::new());

        let from_config = Messaging::new(Arc::clone(&store), config.clone()).unwrap();
        assert_eq!(from_config.node_id(), "from-config");

        let explicit = Messaging::builder(store)
            .config(config)
            .node_id("explicit")
            .build()
            .unwrap();
        assert_eq!(explicit.node_id(), "explicit");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = MessagingConfig {
            window_size: 0,
            ..MessagingConfig::default()
        };
        let err = Messaging::new(Arc::new(InMemoryStore::new()), config).unwrap_err();
        assert!(matches!(err, MessagingError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_lifecycle_is_idempotent() {
        let messaging = Messaging::new(Arc::new(InMemoryStore::new()), quiet_config()).unwrap();
        messaging.terminate().await.unwrap();

        messaging.start().await.unwrap();
        messaging.start().await.unwrap();
        assert!(messaging.is_running());
        assert!(messaging.set_multithreaded(true).is_err());

        messaging.terminate().await.unwrap();
        messaging.terminate().await.unwrap();
        assert!(!messaging.is_running());
        assert!(messaging.set_multithreaded(true).is_ok());
    }

    #[tokio::test]
    async fn test_await_requires_running_engine() {
        let messaging = Messaging::new(Arc::new(InMemoryStore::new()), quiet_config()).unwrap();
        let err = messaging
            .send_and_await_first_answer(Msg::new("ping", "m", ""), Duration::from_millis(10), false)
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::NotRunning));
    }

    #[tokio::test]
    async fn test_status_info_listener_registered_by_default() {
        let messaging = Messaging::new(Arc::new(InMemoryStore::new()), quiet_config()).unwrap();
        let info = messaging.status_info();
        assert_eq!(
            info[crate::constants::keys::LISTENER_TOPICS],
            serde_json::json!([STATUS_INFO_TOPIC])
        );

        let config = MessagingConfig {
            status_info_enabled: false,
            ..quiet_config()
        };
        let silent = Messaging::new(Arc::new(InMemoryStore::new()), config).unwrap();
        assert_eq!(
            silent.status_info()[crate::constants::keys::LISTENER_TOPICS],
            serde_json::json!([])
        );
    }
}
