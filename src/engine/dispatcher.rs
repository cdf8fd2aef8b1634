//! # Dispatcher
//!
//! Pops candidates off the [`ProcessingQueue`](super::ProcessingQueue) and
//! runs each one through the processing state machine:
//!
//! 1. re-read the message; the candidate may be stale
//! 2. eligibility checks (sender, recipients, `processedBy`, pause)
//! 3. expiry: delete the message and any lock
//! 4. answers go to the correlator first
//! 5. exclusive messages need the lock
//! 6. listeners run in registration order
//! 7. answers are sent, `processedBy` is updated, the delete policy applies
//!
//! With `multithreaded` on, each message runs on its own task bounded by a
//! semaphore of `worker_threads` permits; otherwise messages run inline on
//! the dispatcher task, one at a time.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, instrument, warn};

use super::processing_queue::ProcessingQueueElement;
use super::stats::EngineStats;
use super::EngineContext;
use crate::constants::{AUTO_ANSWER_TEXT, SELF_SENDER};
use crate::logging::log_message_operation;
use crate::messaging::correlator::AnswerRoute;
use crate::messaging::errors::MessagingResult;
use crate::messaging::listener::{Disposition, MessageListener, Rejection};
use crate::messaging::message::{Msg, MsgId};
use crate::resilience::with_retry;

/// Why a candidate was dropped without running listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Deleted since it was queued
    Missing,
    OwnMessage,
    AlreadyProcessed,
    NotRecipient,
    Paused,
    NoListener,
    /// Answer nobody here waits for or listens to; recorded as processed
    UnclaimedAnswer,
    /// Another node holds the exclusive lock
    LockConflict,
}

/// Result of processing one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Completed { answers: usize },
    Rejected { marked_processed: bool },
    Failed,
    Expired,
    AnswerRouted(AnswerRoute),
    Skipped(SkipReason),
}

/// Collected listener results for one message
#[derive(Debug, Default)]
struct ListenerRun {
    answers: Vec<Msg>,
    rejection: Option<Rejection>,
    failure: Option<String>,
}

/// Dispatch loop; exits when the shutdown flag flips. In-flight tasks keep
/// their permits until they finish, so `workers` can be drained on terminate.
pub async fn run(
    ctx: Arc<EngineContext>,
    workers: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        node_id = %ctx.node_id,
        multithreaded = ctx.settings.multithreaded(),
        worker_threads = ctx.settings.worker_threads(),
        "Dispatcher started"
    );

    'dispatch: loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = if ctx.settings.multithreaded() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                permit = Arc::clone(&workers).acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
            }
        } else {
            None
        };

        let element = loop {
            if let Some(element) = ctx.queue.pop() {
                break element;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break 'dispatch;
                    }
                }
                _ = ctx.queue.notified() => {}
            }
        };

        match permit {
            Some(permit) => {
                let task_ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    handle(&task_ctx, element).await;
                    drop(permit);
                });
            }
            None => {
                handle(&ctx, element).await;
            }
        }
    }

    info!(node_id = %ctx.node_id, "Dispatcher stopped");
}

/// Process one popped element and clear its in-flight marker
pub async fn handle(ctx: &EngineContext, element: ProcessingQueueElement) -> ProcessingOutcome {
    let id = element.msg_id;
    ctx.active_workers.fetch_add(1, Ordering::SeqCst);
    EngineStats::incr(&ctx.stats.dispatched);

    let outcome = match process(ctx, id).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(node_id = %ctx.node_id, msg_id = %id, error = %e, "Message processing aborted by store error");
            EngineStats::incr(&ctx.stats.store_errors);
            ctx.defer(id);
            ProcessingOutcome::Failed
        }
    };

    ctx.queue.release(id);
    ctx.active_workers.fetch_sub(1, Ordering::SeqCst);

    match outcome {
        ProcessingOutcome::Skipped(reason) => {
            EngineStats::incr(&ctx.stats.skipped);
            debug!(node_id = %ctx.node_id, msg_id = %id, reason = ?reason, "Candidate skipped");
        }
        ProcessingOutcome::Completed { .. } => EngineStats::incr(&ctx.stats.completed),
        ProcessingOutcome::AnswerRouted(_) => EngineStats::incr(&ctx.stats.answers_routed),
        _ => {}
    }
    outcome
}

/// The processing state machine for one message id
#[instrument(skip(ctx), fields(node_id = %ctx.node_id))]
pub async fn process(ctx: &EngineContext, id: MsgId) -> MessagingResult<ProcessingOutcome> {
    let Some(msg) = with_retry(&ctx.retry, "find_message", || {
        ctx.store.find_message(&ctx.queue_name, id)
    })
    .await?
    else {
        return Ok(ProcessingOutcome::Skipped(SkipReason::Missing));
    };

    if msg.is_sent_by(&ctx.node_id) {
        return Ok(ProcessingOutcome::Skipped(SkipReason::OwnMessage));
    }
    if (msg.exclusive && !msg.processed_by.is_empty()) || msg.is_processed_by(&ctx.node_id) {
        return Ok(ProcessingOutcome::Skipped(SkipReason::AlreadyProcessed));
    }
    if !msg.is_recipient(&ctx.node_id) {
        return Ok(ProcessingOutcome::Skipped(SkipReason::NotRecipient));
    }
    if msg.is_expired_at(Utc::now()) {
        expire(ctx, &msg).await;
        return Ok(ProcessingOutcome::Expired);
    }
    if ctx.paused.is_paused(&msg.topic) {
        return Ok(ProcessingOutcome::Skipped(SkipReason::Paused));
    }

    if msg.is_answer() {
        let route = ctx.correlator.route_answer(&msg);
        if route != AnswerRoute::Unmatched {
            mark_processed(ctx, &msg).await;
            apply_delete_policy(ctx, &msg, false).await;
            log_message_operation("answer", &ctx.node_id, &msg, "routed");
            return Ok(ProcessingOutcome::AnswerRouted(route));
        }
    }

    let listeners = ctx.listeners.listeners_for(&msg.topic);
    if listeners.is_empty() {
        if msg.is_answer() {
            // Answers match every poll filter; without this they would be offered forever
            mark_processed(ctx, &msg).await;
            return Ok(ProcessingOutcome::Skipped(SkipReason::UnclaimedAnswer));
        }
        return Ok(ProcessingOutcome::Skipped(SkipReason::NoListener));
    }

    let locked = if msg.exclusive {
        if !ctx.lock_manager.try_acquire(&msg).await? {
            EngineStats::incr(&ctx.stats.lock_conflicts);
            return Ok(ProcessingOutcome::Skipped(SkipReason::LockConflict));
        }
        true
    } else {
        false
    };

    // No `?` past this point: the lock must be settled on every path
    let run = invoke_listeners(ctx, &msg, &listeners).await;

    let outcome = if let Some(error) = run.failure {
        warn!(
            node_id = %ctx.node_id,
            msg_id = %msg.msg_id,
            topic = %msg.topic,
            error = %error,
            "Listener failed"
        );
        EngineStats::incr(&ctx.stats.listener_failures);
        let kept = apply_delete_policy(ctx, &msg, locked).await;
        if locked && !kept {
            ctx.lock_manager.release(msg.msg_id).await;
        }
        ctx.defer(msg.msg_id);
        log_message_operation("process", &ctx.node_id, &msg, "failed");
        ProcessingOutcome::Failed
    } else if let Some(rejection) = run.rejection {
        EngineStats::incr(&ctx.stats.rejected);
        let action = rejection.resolve(&msg);
        let mut replies = run.answers;
        replies.extend(action.answer);
        for answer in outgoing_replies(ctx, &msg, replies) {
            send_answer(ctx, &msg, answer).await;
        }
        let mut kept = false;
        if action.mark_processed {
            mark_processed(ctx, &msg).await;
            kept = apply_delete_policy(ctx, &msg, locked).await;
        } else {
            ctx.defer(msg.msg_id);
            ctx.poll_signal.request();
        }
        if locked && !kept {
            ctx.lock_manager.release(msg.msg_id).await;
        }
        debug!(
            node_id = %ctx.node_id,
            msg_id = %msg.msg_id,
            reason = %rejection.reason,
            marked_processed = action.mark_processed,
            "Message rejected"
        );
        log_message_operation("process", &ctx.node_id, &msg, "rejected");
        ProcessingOutcome::Rejected {
            marked_processed: action.mark_processed,
        }
    } else {
        let mut answers = run.answers;
        if answers.is_empty() && !msg.is_answer() && ctx.settings.auto_answer() {
            let mut ack = msg.create_answer();
            ack.msg = Some(AUTO_ANSWER_TEXT.to_string());
            answers.push(ack);
        }
        let answers = outgoing_replies(ctx, &msg, answers);
        let sent = answers.len();
        for answer in answers {
            send_answer(ctx, &msg, answer).await;
        }
        mark_processed(ctx, &msg).await;
        let kept = apply_delete_policy(ctx, &msg, locked).await;
        if locked && !kept {
            ctx.lock_manager.release(msg.msg_id).await;
        }
        log_message_operation("process", &ctx.node_id, &msg, "completed");
        ProcessingOutcome::Completed { answers: sent }
    };

    Ok(outcome)
}

/// Run listeners in order until one rejects or fails
async fn invoke_listeners(
    ctx: &EngineContext,
    msg: &Msg,
    listeners: &[Arc<dyn MessageListener>],
) -> ListenerRun {
    let mut run = ListenerRun::default();
    for listener in listeners {
        let result = AssertUnwindSafe(listener.on_message(msg))
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(Disposition::Answer(answer))) => {
                run.answers.push(msg.correlate_answer(answer));
            }
            Ok(Ok(Disposition::NoAnswer)) => {}
            Ok(Ok(Disposition::Rejected(rejection))) => {
                debug!(
                    node_id = %ctx.node_id,
                    listener = listener.name(),
                    msg_id = %msg.msg_id,
                    "Listener rejected message"
                );
                run.rejection = Some(rejection);
                break;
            }
            Ok(Err(e)) => {
                run.failure = Some(format!("{}: {e:#}", listener.name()));
                break;
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                run.failure = Some(format!("{} panicked: {detail}", listener.name()));
                break;
            }
        }
    }
    run
}

/// Replies to an answer are dropped: answers are never answered
fn outgoing_replies(ctx: &EngineContext, msg: &Msg, replies: Vec<Msg>) -> Vec<Msg> {
    if msg.is_answer() && !replies.is_empty() {
        debug!(
            node_id = %ctx.node_id,
            msg_id = %msg.msg_id,
            discarded = replies.len(),
            "Replies to an answer discarded"
        );
        return Vec::new();
    }
    replies
}

/// Send an answer to `request`. Answers to self-addressed messages stay local.
async fn send_answer(ctx: &EngineContext, request: &Msg, answer: Msg) {
    let to_self = request.sender.as_deref() == Some(SELF_SENDER);
    let answer = ctx.prepare_outgoing(answer, to_self);
    if let Err(e) = ctx.persist(&answer).await {
        warn!(
            node_id = %ctx.node_id,
            request_id = %request.msg_id,
            error = %e,
            "Failed to send answer"
        );
    }
}

async fn mark_processed(ctx: &EngineContext, msg: &Msg) {
    let result = with_retry(&ctx.retry, "add_processed_by", || {
        ctx.store
            .add_processed_by(&ctx.queue_name, msg.msg_id, &ctx.node_id)
    })
    .await;
    match result {
        Ok(0) => verify_processed(ctx, msg).await,
        Ok(_) => {}
        Err(e) => {
            warn!(node_id = %ctx.node_id, msg_id = %msg.msg_id, error = %e, "Failed to mark message processed");
            // Locally at least, do not pick it up again right away
            ctx.defer(msg.msg_id);
        }
    }
}

/// The add-to-set modified nothing. Fine if the message is gone or already
/// lists this node; otherwise the update was lost and is tried once more.
async fn verify_processed(ctx: &EngineContext, msg: &Msg) {
    let current = match ctx.store.find_message(&ctx.queue_name, msg.msg_id).await {
        Ok(current) => current,
        Err(e) => {
            warn!(node_id = %ctx.node_id, msg_id = %msg.msg_id, error = %e, "Could not re-read message after empty processedBy update");
            ctx.defer(msg.msg_id);
            return;
        }
    };
    match current {
        Some(current) if !current.is_processed_by(&ctx.node_id) => {
            warn!(
                node_id = %ctx.node_id,
                msg_id = %msg.msg_id,
                "processedBy update modified nothing but node is missing; retrying once"
            );
            match ctx
                .store
                .add_processed_by(&ctx.queue_name, msg.msg_id, &ctx.node_id)
                .await
            {
                Ok(n) if n > 0 => {}
                Ok(_) => {
                    warn!(node_id = %ctx.node_id, msg_id = %msg.msg_id, "processedBy still not recorded");
                    ctx.defer(msg.msg_id);
                }
                Err(e) => {
                    warn!(node_id = %ctx.node_id, msg_id = %msg.msg_id, error = %e, "processedBy retry failed");
                    ctx.defer(msg.msg_id);
                }
            }
        }
        _ => {
            debug!(node_id = %ctx.node_id, msg_id = %msg.msg_id, "processedBy unchanged; message gone or already marked");
        }
    }
}

/// Apply `deleteAfterProcessing`. Returns `true` when an exclusive lock was
/// extended to the scheduled delete time and must be kept.
async fn apply_delete_policy(ctx: &EngineContext, msg: &Msg, locked: bool) -> bool {
    if !msg.delete_after_processing {
        return false;
    }

    let delay = msg.delete_after_processing_time;
    if delay == 0 {
        let result = with_retry(&ctx.retry, "delete_message", || {
            ctx.store.delete_message(&ctx.queue_name, msg.msg_id)
        })
        .await;
        if let Err(e) = result {
            warn!(msg_id = %msg.msg_id, error = %e, "Failed to delete processed message");
        }
        return false;
    }

    let delete_at = Utc::now() + chrono::Duration::milliseconds(delay as i64);
    let result = with_retry(&ctx.retry, "set_message_delete_at", || {
        ctx.store
            .set_message_delete_at(&ctx.queue_name, msg.msg_id, delete_at)
    })
    .await;
    if let Err(e) = result {
        warn!(msg_id = %msg.msg_id, error = %e, "Failed to schedule message deletion");
        return false;
    }

    if !locked {
        return false;
    }
    match ctx.lock_manager.extend(msg.msg_id, delete_at).await {
        Ok(extended) => extended,
        Err(e) => {
            warn!(msg_id = %msg.msg_id, error = %e, "Failed to extend lock to delete time");
            false
        }
    }
}

/// Remove an expired message and whatever lock is left on it
async fn expire(ctx: &EngineContext, msg: &Msg) {
    let result = with_retry(&ctx.retry, "delete_message", || {
        ctx.store.delete_message(&ctx.queue_name, msg.msg_id)
    })
    .await;
    if let Err(e) = result {
        warn!(msg_id = %msg.msg_id, error = %e, "Failed to delete expired message");
    }
    ctx.lock_manager.release_any(msg.msg_id).await;
    EngineStats::incr(&ctx.stats.expired);
    log_message_operation("expire", &ctx.node_id, msg, "deleted");
}
