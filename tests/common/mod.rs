//! Shared helpers for integration tests: simulated nodes over one shared
//! in-memory store.

#![allow(dead_code)]

pub mod strategies;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use docbus::config::{MessagingConfig, RetryConfig};
use docbus::{listener_fn, Disposition, InMemoryStore, MessageListener, MessageStore, Messaging};

/// Fast timers and inline dispatch so tests settle quickly and deterministically
pub fn test_config() -> MessagingConfig {
    MessagingConfig {
        multithreaded: false,
        poll_interval_ms: 25,
        pause_poll_interval_ms: 10,
        callback_sweep_interval_ms: 20,
        expiry_sweep_interval_ms: 50,
        shutdown_timeout_ms: 2_000,
        ..MessagingConfig::default()
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 10,
        multiplier: 2.0,
        jitter_percent: 0.0,
    }
}

/// A node (not yet started) on the shared store
pub fn node(store: &Arc<InMemoryStore>, node_id: &str) -> Messaging {
    node_with_config(store, node_id, test_config())
}

pub fn node_with_config(
    store: &Arc<InMemoryStore>,
    node_id: &str,
    config: MessagingConfig,
) -> Messaging {
    let store: Arc<dyn MessageStore> = store.clone();
    Messaging::builder(store)
        .config(config)
        .retry(fast_retry())
        .node_id(node_id)
        .host("test-host")
        .build()
        .expect("valid test configuration")
}

/// Listener that counts invocations and returns no answer
pub fn counting_listener(counter: &Arc<AtomicUsize>) -> Arc<dyn MessageListener> {
    let counter = Arc::clone(counter);
    listener_fn("counting", move |_msg| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Disposition::NoAnswer)
        }
    })
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub const SETTLE: Duration = Duration::from_secs(5);
