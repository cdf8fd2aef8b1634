//! Paused topics. Candidates of a paused topic stay in the store and are
//! neither polled nor dispatched until the topic is unpaused.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::info;

use crate::engine::poller::PollSignal;

#[derive(Debug)]
pub struct PausedTopics {
    paused: DashMap<String, Instant>,
    poll_signal: Arc<PollSignal>,
}

impl PausedTopics {
    pub fn new(poll_signal: Arc<PollSignal>) -> Self {
        Self {
            paused: DashMap::new(),
            poll_signal,
        }
    }

    /// Returns `false` if the topic was already paused (the original pause time is kept)
    pub fn pause(&self, topic: &str) -> bool {
        let mut newly = false;
        self.paused.entry(topic.to_string()).or_insert_with(|| {
            newly = true;
            Instant::now()
        });
        if newly {
            info!(topic = %topic, "Topic processing paused");
            self.poll_signal.request();
        }
        newly
    }

    /// Resume a topic; returns how long it was paused in milliseconds
    pub fn unpause(&self, topic: &str) -> Option<u64> {
        let (_, since) = self.paused.remove(topic)?;
        let elapsed_ms = since.elapsed().as_millis() as u64;
        info!(topic = %topic, paused_ms = elapsed_ms, "Topic processing resumed");
        self.poll_signal.request();
        Some(elapsed_ms)
    }

    pub fn is_paused(&self, topic: &str) -> bool {
        self.paused.contains_key(topic)
    }

    pub fn topics(&self) -> HashSet<String> {
        self.paused.iter().map(|e| e.key().clone()).collect()
    }

    pub fn clear(&self) {
        self.paused.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pause_and_unpause() {
        let signal = Arc::new(PollSignal::new());
        let paused = PausedTopics::new(signal.clone());

        assert!(paused.pause("ping"));
        assert!(!paused.pause("ping"));
        assert!(paused.is_paused("ping"));
        assert_eq!(paused.topics().len(), 1);
        assert_eq!(signal.take(), 1);

        std::thread::sleep(Duration::from_millis(20));
        let elapsed = paused.unpause("ping").unwrap();
        assert!(elapsed >= 20);
        assert_eq!(signal.take(), 1);
        assert!(!paused.is_paused("ping"));
        assert_eq!(paused.unpause("ping"), None);
    }
}
