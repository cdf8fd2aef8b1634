//! # Poller
//!
//! Authoritative, periodic enumeration of processable messages. It is the
//! correctness fallback behind the change feed and the only source of work on
//! stores without one. A cycle runs on a jittered interval or as soon as a
//! poll is requested through [`PollSignal`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use super::processing_queue::ProcessingQueueElement;
use super::stats::EngineStats;
use super::EngineContext;
use crate::messaging::errors::MessagingResult;
use crate::resilience::with_retry;
use crate::store::types::CandidateQuery;

/// "Poll requested" counter with an efficient wake-up
#[derive(Debug, Default)]
pub struct PollSignal {
    requested: AtomicU64,
    notify: Notify,
}

impl PollSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a poll as soon as possible
    pub fn request(&self) {
        self.requested.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Reset the counter, returning how many requests were pending
    pub fn take(&self) -> u64 {
        self.requested.swap(0, Ordering::SeqCst)
    }

    pub fn pending(&self) -> u64 {
        self.requested.load(Ordering::SeqCst)
    }

    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

/// Interval with up to ±10% jitter so nodes drift apart
fn jittered(interval: Duration) -> Duration {
    let millis = interval.as_millis() as u64;
    let spread = millis / 10;
    if spread == 0 {
        return interval;
    }
    let offset = rand::thread_rng().gen_range(0..=spread * 2);
    Duration::from_millis(millis - spread + offset)
}

/// Poll loop; exits when the shutdown flag flips
pub async fn run(ctx: Arc<EngineContext>, mut shutdown: watch::Receiver<bool>) {
    info!(node_id = %ctx.node_id, queue = %ctx.queue_name, "Poller started");

    // Backlog is picked up right away
    ctx.poll_signal.request();

    loop {
        if *shutdown.borrow() {
            break;
        }

        if ctx.poll_signal.pending() == 0 {
            let interval = jittered(ctx.settings.poll_interval());
            tokio::select! {
                _ = shutdown.changed() => continue,
                _ = tokio::time::sleep(interval) => {}
                _ = ctx.poll_signal.notified() => {}
            }
        }
        ctx.poll_signal.take();

        if ctx.queue.load() >= ctx.settings.window_size() {
            EngineStats::incr(&ctx.stats.saturated);
            debug!(node_id = %ctx.node_id, load = ctx.queue.load(), "Window saturated, poll deferred");
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(ctx.settings.pause_poll_interval()) => {}
            }
            // Still owed once there is room again
            ctx.poll_signal.request();
            continue;
        }

        if let Err(e) = poll_once(&ctx).await {
            EngineStats::incr(&ctx.stats.poll_errors);
            warn!(node_id = %ctx.node_id, error = %e, "Poll cycle failed");
        }
    }

    info!(node_id = %ctx.node_id, "Poller stopped");
}

/// One poll cycle. Returns the number of newly queued candidates.
pub async fn poll_once(ctx: &EngineContext) -> MessagingResult<usize> {
    EngineStats::incr(&ctx.stats.poll_cycles);

    let window = ctx.settings.window_size();
    let limit = window.saturating_sub(ctx.queue.load());
    if limit == 0 {
        return Ok(0);
    }

    let query = CandidateQuery {
        node_id: ctx.node_id.clone(),
        exclude_ids: ctx.queue.known_ids(),
        paused_topics: ctx.paused.topics(),
        topics: ctx.listeners.topic_filter(),
        limit,
    };

    let rows = with_retry(&ctx.retry, "find_candidates", || {
        ctx.store.find_candidates(&ctx.queue_name, &query)
    })
    .await?;

    let found = rows.len();
    let mut added = 0;
    for row in &rows {
        if ctx.queue.push(ProcessingQueueElement::from(row)) {
            added += 1;
        }
    }
    EngineStats::add(&ctx.stats.polled_candidates, added as u64);

    // A full page means the collection was probably not drained
    if found >= limit {
        ctx.poll_signal.request();
    }

    if found > 0 {
        debug!(
            node_id = %ctx.node_id,
            found = found,
            added = added,
            limit = limit,
            "Poll cycle queued candidates"
        );
    }
    Ok(added)
}
