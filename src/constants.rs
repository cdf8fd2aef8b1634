//! # Constants
//!
//! Collection naming, reserved topics and message defaults shared across the engine.

/// Default message collection (queue) name
pub const DEFAULT_QUEUE_NAME: &str = "msg";

/// Suffix appended to a queue name to form its lock collection
pub const LOCK_COLLECTION_SUFFIX: &str = "_lck";

/// Reserved topic answered by every node with runtime status
pub const STATUS_INFO_TOPIC: &str = "docbus.status_info";

/// Sender stamped on messages a node addresses to itself
pub const SELF_SENDER: &str = "self";

/// Lower value is processed first
pub const DEFAULT_PRIORITY: i32 = 1000;

/// Default message time to live in milliseconds
pub const DEFAULT_TTL_MS: u64 = 30_000;

/// Text of synthesized acknowledgements in auto-answer mode
pub const AUTO_ANSWER_TEXT: &str = "received";

/// Text of rejection notices sent back to the original sender
pub const REJECTION_ANSWER_TEXT: &str = "message rejected";

/// Map keys used in rejection notices and status answers
pub mod keys {
    pub const REJECTED: &str = "rejected";
    pub const REASON: &str = "reason";
    pub const NODE_ID: &str = "node_id";
    pub const HOST: &str = "host";
    pub const LISTENER_TOPICS: &str = "listener_topics";
    pub const LISTENER_NAMES: &str = "listener_names";
    pub const GLOBAL_LISTENERS: &str = "global_listeners";
    pub const QUEUED: &str = "queued";
    pub const IN_FLIGHT: &str = "in_flight";
    pub const WINDOW_SIZE: &str = "window_size";
    pub const MULTITHREADED: &str = "multithreaded";
    pub const WORKER_THREADS: &str = "worker_threads";
    pub const ACTIVE_WORKERS: &str = "active_workers";
    pub const PAUSED_TOPICS: &str = "paused_topics";
    pub const STATS: &str = "stats";
}

/// Name of the lock collection belonging to `queue_name`
pub fn lock_collection_name(queue_name: &str) -> String {
    format!("{queue_name}{LOCK_COLLECTION_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_collection_name() {
        assert_eq!(lock_collection_name(DEFAULT_QUEUE_NAME), "msg_lck");
        assert_eq!(lock_collection_name("orders"), "orders_lck");
    }
}
