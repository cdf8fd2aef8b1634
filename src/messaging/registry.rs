//! Host-owned registry of running engine instances.
//!
//! An application that runs several engines in one process (for example one
//! per queue) can hand them the same `Arc<MessagingRegistry>` and look peers
//! up by node id. Engines register on `start` and unregister on `terminate`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use super::service::{Messaging, MessagingInner};

#[derive(Debug, Default)]
pub struct MessagingRegistry {
    instances: RwLock<HashMap<String, Weak<MessagingInner>>>,
}

impl MessagingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, node_id: &str, inner: &Arc<MessagingInner>) {
        self.instances
            .write()
            .insert(node_id.to_string(), Arc::downgrade(inner));
        debug!(node_id = %node_id, "Messaging instance registered");
    }

    pub(crate) fn unregister(&self, node_id: &str) {
        if self.instances.write().remove(node_id).is_some() {
            debug!(node_id = %node_id, "Messaging instance unregistered");
        }
    }

    /// Running instance with `node_id`, if it is still alive
    pub fn find_by_node_id(&self, node_id: &str) -> Option<Messaging> {
        self.instances
            .read()
            .get(node_id)
            .and_then(Weak::upgrade)
            .map(Messaging::from_inner)
    }

    /// All live registered instances
    pub fn running_instances(&self) -> Vec<Messaging> {
        self.instances
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .map(Messaging::from_inner)
            .collect()
    }

    /// Registered entries, including ones whose engine was dropped
    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }
}
