use crate::error::Result;
use crate::storage::GraphAdapter;
use crate::types::{CHANGELOG_SOUL, ChangeSetEntry, GraphData, Node, State, iso_timestamp, machine_state};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::trace;

/// Changelog keys sort by time, then by `seq` within a millisecond. The
/// random suffix keeps keys from different processes distinct.
pub fn changelog_key(at: State, seq: u32) -> String {
    format!("{}-{:06}-{}", iso_timestamp(at), seq, uuid::Uuid::new_v4().simple())
}

/// Last millisecond used and how many keys were issued in it.
#[derive(Debug, Default)]
struct KeyClock {
    at: State,
    seq: u32,
}

impl KeyClock {
    /// Never goes backwards, even when the machine clock does.
    fn tick(&mut self) -> (State, String) {
        let now = machine_state();
        if now > self.at {
            self.at = now;
            self.seq = 0;
        } else {
            self.seq += 1;
        }
        (self.at, changelog_key(self.at, self.seq))
    }
}

/// Appends diffs under the changelog soul and announces them to live
/// subscribers.
///
/// Appends are serialized so subscribers see entries in key order.
#[derive(Clone)]
pub struct Changelog {
    internal: Arc<dyn GraphAdapter>,
    live: broadcast::Sender<ChangeSetEntry>,
    clock: Arc<Mutex<KeyClock>>,
}

impl Changelog {
    pub fn new(internal: Arc<dyn GraphAdapter>, capacity: usize) -> Self {
        let (live, _) = broadcast::channel(capacity.max(1));
        Self {
            internal,
            live,
            clock: Arc::new(Mutex::new(KeyClock::default())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeSetEntry> {
        self.live.subscribe()
    }

    pub async fn append(&self, diff: &GraphData) -> Result<ChangeSetEntry> {
        let mut clock = self.clock.lock().await;
        let (now, key) = clock.tick();
        let text = serde_json::to_string(diff)?;

        let mut graph = GraphData::new();
        graph.insert(
            CHANGELOG_SOUL.to_string(),
            Some(Node::new(CHANGELOG_SOUL).with(key.clone(), text, now)),
        );
        self.internal.put(&graph).await?;
        trace!(key = %key, souls = diff.len(), "Appended changelog entry");

        let entry = ChangeSetEntry {
            key,
            diff: diff.clone(),
        };
        // Nobody listening is fine.
        let _ = self.live.send(entry.clone());
        Ok(entry)
    }
}
