//! Listener for the reserved status info topic. Peers broadcast a request on
//! [`STATUS_INFO_TOPIC`] and every running engine answers with a snapshot of
//! its listeners, load and pause state.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Weak;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::listener::{Disposition, ListenerResult, MessageListener};
use super::message::Msg;
use crate::constants::{keys, STATUS_INFO_TOPIC};
use crate::engine::EngineContext;

/// Answers status info requests for one engine
#[derive(Debug)]
pub struct StatusInfoListener {
    ctx: Weak<EngineContext>,
}

impl StatusInfoListener {
    pub fn new(ctx: Weak<EngineContext>) -> Self {
        Self { ctx }
    }
}

/// Snapshot of an engine's introspection data
pub fn collect(ctx: &EngineContext) -> HashMap<String, Value> {
    let mut paused: Vec<String> = ctx.paused.topics().into_iter().collect();
    paused.sort();

    let mut info = HashMap::new();
    info.insert(keys::NODE_ID.to_string(), json!(ctx.node_id));
    info.insert(keys::HOST.to_string(), json!(ctx.host));
    info.insert(keys::LISTENER_TOPICS.to_string(), json!(ctx.listeners.topics()));
    info.insert(
        keys::LISTENER_NAMES.to_string(),
        json!(ctx.listeners.listener_names()),
    );
    info.insert(
        keys::GLOBAL_LISTENERS.to_string(),
        json!(ctx.listeners.global_count()),
    );
    info.insert(keys::QUEUED.to_string(), json!(ctx.queue.queued_len()));
    info.insert(keys::IN_FLIGHT.to_string(), json!(ctx.queue.in_flight_len()));
    info.insert(
        keys::WINDOW_SIZE.to_string(),
        json!(ctx.settings.window_size()),
    );
    info.insert(
        keys::MULTITHREADED.to_string(),
        json!(ctx.settings.multithreaded()),
    );
    info.insert(
        keys::WORKER_THREADS.to_string(),
        json!(ctx.settings.worker_threads()),
    );
    info.insert(
        keys::ACTIVE_WORKERS.to_string(),
        json!(ctx.active_workers.load(Ordering::SeqCst)),
    );
    info.insert(keys::PAUSED_TOPICS.to_string(), json!(paused));
    info.insert(
        keys::STATS.to_string(),
        serde_json::to_value(ctx.stats.snapshot()).unwrap_or(Value::Null),
    );
    info
}

#[async_trait]
impl MessageListener for StatusInfoListener {
    fn name(&self) -> &str {
        "status_info"
    }

    async fn on_message(&self, msg: &Msg) -> ListenerResult {
        if msg.is_answer() {
            return Ok(Disposition::NoAnswer);
        }
        let Some(ctx) = self.ctx.upgrade() else {
            return Ok(Disposition::NoAnswer);
        };
        let mut answer = Msg::builder(STATUS_INFO_TOPIC).msg("status").build();
        answer.map_value = collect(&ctx);
        debug!(node_id = %ctx.node_id, requester = ?msg.sender, "Answering status info request");
        Ok(Disposition::answer(answer))
    }
}
