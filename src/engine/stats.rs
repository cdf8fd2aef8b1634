//! Runtime counters for one engine instance.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic engine counters
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Candidates taken from the change feed
    pub feed_candidates: AtomicU64,
    /// Candidates taken from polls
    pub polled_candidates: AtomicU64,
    pub poll_cycles: AtomicU64,
    pub poll_errors: AtomicU64,
    /// Feed or poll skipped because the window was full
    pub saturated: AtomicU64,
    pub feed_reconnects: AtomicU64,
    pub dispatched: AtomicU64,
    pub completed: AtomicU64,
    pub rejected: AtomicU64,
    pub expired: AtomicU64,
    pub skipped: AtomicU64,
    pub lock_conflicts: AtomicU64,
    pub listener_failures: AtomicU64,
    /// Dispatches abandoned on a store error
    pub store_errors: AtomicU64,
    pub answers_routed: AtomicU64,
    pub messages_sent: AtomicU64,
    pub purged: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    pub feed_candidates: u64,
    pub polled_candidates: u64,
    pub poll_cycles: u64,
    pub poll_errors: u64,
    pub saturated: u64,
    pub feed_reconnects: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub rejected: u64,
    pub expired: u64,
    pub skipped: u64,
    pub lock_conflicts: u64,
    pub listener_failures: u64,
    pub store_errors: u64,
    pub answers_routed: u64,
    pub messages_sent: u64,
    pub purged: u64,
}

impl EngineStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStatsSnapshot {
            feed_candidates: load(&self.feed_candidates),
            polled_candidates: load(&self.polled_candidates),
            poll_cycles: load(&self.poll_cycles),
            poll_errors: load(&self.poll_errors),
            saturated: load(&self.saturated),
            feed_reconnects: load(&self.feed_reconnects),
            dispatched: load(&self.dispatched),
            completed: load(&self.completed),
            rejected: load(&self.rejected),
            expired: load(&self.expired),
            skipped: load(&self.skipped),
            lock_conflicts: load(&self.lock_conflicts),
            listener_failures: load(&self.listener_failures),
            store_errors: load(&self.store_errors),
            answers_routed: load(&self.answers_routed),
            messages_sent: load(&self.messages_sent),
            purged: load(&self.purged),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = EngineStats::default();
        EngineStats::incr(&stats.completed);
        EngineStats::incr(&stats.completed);
        EngineStats::add(&stats.purged, 5);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.completed, 2);
        assert_eq!(snapshot.purged, 5);
        assert_eq!(snapshot.rejected, 0);
    }
}
