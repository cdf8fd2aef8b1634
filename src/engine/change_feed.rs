//! # Change Feed Monitor
//!
//! Low-latency path for new work. Watches message inserts and lock deletes:
//! an insert becomes a queued candidate straight from the event summary, a
//! lock delete nudges the poller because an exclusive message may be
//! available again. The feed is never the only source of truth, so on a
//! broken subscription it resubscribes with backoff and requests a poll to
//! cover anything missed meanwhile.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::processing_queue::ProcessingQueueElement;
use super::stats::EngineStats;
use super::EngineContext;
use crate::messaging::message::MsgId;
use crate::store::types::{ChangeEvent, Collection, OperationType, WatchFilter};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Bounded FIFO set of recently seen message ids
#[derive(Debug)]
pub struct SeenIds {
    capacity: usize,
    ids: HashSet<MsgId>,
    order: VecDeque<MsgId>,
}

impl SeenIds {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns `false` if the id was seen before
    pub fn insert(&mut self, id: MsgId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// What the monitor did with one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedAction {
    Queued,
    PollRequested,
    Duplicate,
    OwnMessage,
    NotRecipient,
    NoListener,
    Paused,
    Saturated,
    Ignored,
}

/// Apply one change event to the local queue
pub fn handle_event(ctx: &EngineContext, seen: &mut SeenIds, event: ChangeEvent) -> FeedAction {
    match (event.collection, event.operation) {
        (Collection::Locks, OperationType::Delete) => {
            ctx.poll_signal.request();
            FeedAction::PollRequested
        }
        (Collection::Messages, OperationType::Insert) => {
            if !seen.insert(event.document_key) {
                return FeedAction::Duplicate;
            }
            let Some(summary) = event.summary else {
                ctx.poll_signal.request();
                return FeedAction::PollRequested;
            };

            if summary.sender.as_deref() == Some(ctx.node_id.as_str()) {
                return FeedAction::OwnMessage;
            }
            if !summary.recipients.is_empty() && !summary.recipients.contains(&ctx.node_id) {
                return FeedAction::NotRecipient;
            }
            if summary.in_answer_to.is_none() && !ctx.listeners.is_interested(&summary.topic) {
                return FeedAction::NoListener;
            }
            if ctx.paused.is_paused(&summary.topic) {
                return FeedAction::Paused;
            }
            if ctx.is_saturated() {
                EngineStats::incr(&ctx.stats.saturated);
                ctx.poll_signal.request();
                return FeedAction::Saturated;
            }

            if ctx.queue.push(ProcessingQueueElement::from(&summary)) {
                EngineStats::incr(&ctx.stats.feed_candidates);
                debug!(msg_id = %summary.msg_id, topic = %summary.topic, "Feed candidate queued");
            }
            FeedAction::Queued
        }
        _ => FeedAction::Ignored,
    }
}

/// Sleep for `delay` unless shutdown comes first. Returns `true` on shutdown.
async fn backoff_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Subscription loop; resubscribes until shutdown
pub async fn run(ctx: Arc<EngineContext>, mut shutdown: watch::Receiver<bool>) {
    let mut seen = SeenIds::new(ctx.config.seen_ids_capacity);
    let mut backoff = INITIAL_BACKOFF;

    info!(node_id = %ctx.node_id, queue = %ctx.queue_name, "Change feed monitor started");

    'subscription: loop {
        if *shutdown.borrow() {
            break;
        }

        let mut stream = match ctx
            .store
            .watch(&ctx.queue_name, WatchFilter::engine_default())
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    node_id = %ctx.node_id,
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "Change feed subscription failed"
                );
                EngineStats::incr(&ctx.stats.feed_reconnects);
                if backoff_or_shutdown(backoff, &mut shutdown).await {
                    break;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        debug!(node_id = %ctx.node_id, "Change feed subscribed");
        backoff = INITIAL_BACKOFF;
        // Events between subscriptions are lost
        ctx.poll_signal.request();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break 'subscription;
                    }
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        handle_event(&ctx, &mut seen, event);
                    }
                    Some(Err(e)) => {
                        warn!(node_id = %ctx.node_id, error = %e, "Change feed broken, resubscribing");
                        break;
                    }
                    None => {
                        warn!(node_id = %ctx.node_id, "Change feed closed, resubscribing");
                        break;
                    }
                }
            }
        }

        EngineStats::incr(&ctx.stats.feed_reconnects);
        if backoff_or_shutdown(backoff, &mut shutdown).await {
            break;
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    info!(node_id = %ctx.node_id, "Change feed monitor stopped");
}
