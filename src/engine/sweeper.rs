//! Housekeeping loops: purge expired messages and locks, drop async answer
//! callbacks whose TTL ran out.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::stats::EngineStats;
use super::EngineContext;
use crate::messaging::errors::MessagingResult;
use crate::store::types::PurgeCounts;

/// One purge pass over the queue's collections
pub async fn purge_once(ctx: &EngineContext) -> MessagingResult<PurgeCounts> {
    let counts = ctx.store.purge_expired(&ctx.queue_name, Utc::now()).await?;
    let total = counts.messages + counts.locks;
    if total > 0 {
        EngineStats::add(&ctx.stats.purged, total);
        debug!(
            node_id = %ctx.node_id,
            messages = counts.messages,
            locks = counts.locks,
            "Expired documents purged"
        );
    }
    // Freed locks can make exclusive messages available
    if counts.locks > 0 {
        ctx.poll_signal.request();
    }
    Ok(counts)
}

/// Periodic purge until shutdown
pub async fn run_expiry_sweep(ctx: Arc<EngineContext>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(ctx.config.expiry_sweep_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                if let Err(e) = purge_once(&ctx).await {
                    warn!(node_id = %ctx.node_id, error = %e, "Expiry sweep failed");
                }
            }
        }
    }

    info!(node_id = %ctx.node_id, "Expiry sweep stopped");
}

/// Periodic removal of unanswered async callbacks until shutdown
pub async fn run_callback_sweep(ctx: Arc<EngineContext>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(ctx.config.callback_sweep_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                let removed = ctx.correlator.sweep_expired();
                if removed > 0 {
                    debug!(node_id = %ctx.node_id, removed = removed, "Expired answer callbacks removed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MessagingConfig, RetryConfig};
    use crate::messaging::message::{Msg, MsgLock};
    use crate::store::{InMemoryStore, MessageStore};
    use std::time::Duration;

    #[tokio::test]
    async fn test_purge_once_removes_expired_and_requests_poll() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = EngineContext::new(
            "node-a".to_string(),
            "host".to_string(),
            Arc::clone(&store) as Arc<dyn MessageStore>,
            MessagingConfig::default(),
            RetryConfig::default(),
        );

        let mut old = Msg::builder("t").ttl(10).build();
        old.sender = Some("node-b".to_string());
        old.timestamp = Utc::now() - chrono::Duration::seconds(10);
        old.delete_at = old.compute_delete_at();
        store.insert_message("msg", &old).await.unwrap();

        let mut fresh = Msg::new("t", "m", "v");
        fresh.sender = Some("node-b".to_string());
        fresh.delete_at = fresh.compute_delete_at();
        store.insert_message("msg", &fresh).await.unwrap();

        let stale_lock = MsgLock::new(
            fresh.msg_id,
            "node-c",
            Utc::now() - chrono::Duration::seconds(1),
        );
        store.insert_lock("msg", &stale_lock).await.unwrap();

        ctx.poll_signal.take();
        let counts = purge_once(&ctx).await.unwrap();
        assert_eq!(counts.messages, 1);
        assert_eq!(counts.locks, 1);
        assert_eq!(ctx.poll_signal.pending(), 1);
        assert_eq!(ctx.stats.snapshot().purged, 2);
        assert!(store.message("msg", fresh.msg_id).is_some());
    }

    #[tokio::test]
    async fn test_callback_sweep_stops_on_shutdown() {
        let config = MessagingConfig {
            callback_sweep_interval_ms: 10,
            ..MessagingConfig::default()
        };
        let ctx = Arc::new(EngineContext::new(
            "node-a".to_string(),
            "host".to_string(),
            Arc::new(InMemoryStore::new()),
            config,
            RetryConfig::default(),
        ));
        ctx.correlator.register_callback(
            crate::messaging::message::MsgId::new(),
            Duration::from_millis(1),
            Box::new(|_answer| {}),
        );

        let handle = tokio::spawn(run_callback_sweep(Arc::clone(&ctx), ctx.shutdown_receiver()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.correlator.callback_count(), 0);

        ctx.signal_shutdown(true);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
