use crate::events::{ListenerId, Unsubscribe};
use crate::graph::NodeListener;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Subscription bookkeeping for one watched soul.
#[derive(Default)]
pub(crate) struct GraphNode {
    listeners: BTreeMap<ListenerId, NodeListener>,
    asked: bool,
    end_query: Option<Unsubscribe>,
}

impl GraphNode {
    pub fn add_listener(&mut self, id: ListenerId, listener: NodeListener) {
        self.listeners.insert(id, listener);
    }

    pub fn remove_listener(&mut self, id: ListenerId) {
        self.listeners.remove(&id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn listeners(&self) -> Vec<NodeListener> {
        self.listeners.values().map(Arc::clone).collect()
    }

    /// True the first time it is called; the caller must then ask.
    pub fn begin_ask(&mut self) -> bool {
        !std::mem::replace(&mut self.asked, true)
    }

    /// Record the handle that ends the outstanding query. Hands it back if
    /// one is already recorded.
    pub fn set_end_query(&mut self, end_query: Unsubscribe) -> Result<(), Unsubscribe> {
        if self.end_query.is_some() {
            return Err(end_query);
        }
        self.end_query = Some(end_query);
        Ok(())
    }

    pub fn into_end_query(self) -> Option<Unsubscribe> {
        self.end_query
    }
}
