use crate::error::Result;
use crate::storage::GraphAdapter;
use crate::types::{CHANGELOG_SOUL, ChangeSetEntry, GetOpts, GraphData, Node};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Push subscription to changelog entries.
///
/// Dropping the feed stops the task producing it.
#[derive(Debug)]
pub struct ChangeFeed {
    rx: mpsc::UnboundedReceiver<ChangeSetEntry>,
    task: Option<JoinHandle<()>>,
}

impl ChangeFeed {
    pub fn new(rx: mpsc::UnboundedReceiver<ChangeSetEntry>, task: Option<JoinHandle<()>>) -> Self {
        Self { rx, task }
    }

    pub async fn recv(&mut self) -> Option<ChangeSetEntry> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeSetEntry> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Decode every changelog field of `node` with a key after `after`.
pub fn changelog_entries(node: &Node, after: &str) -> Vec<ChangeSetEntry> {
    node.fields
        .iter()
        .filter(|(key, _)| key.as_str() > after)
        .filter_map(|(key, value)| {
            let Some(text) = value.as_str() else {
                warn!(key = %key, "Changelog entry is not a string, skipping");
                return None;
            };
            match serde_json::from_str::<GraphData>(text) {
                Ok(diff) => Some(ChangeSetEntry {
                    key: key.clone(),
                    diff,
                }),
                Err(e) => {
                    warn!(key = %key, "Undecodable changelog entry: {}", e);
                    None
                }
            }
        })
        .collect()
}

/// Pull iterator over an adapter's changelog, in key order.
///
/// Pages with ranged reads starting at the last key seen, so it works over
/// any adapter that honours [`GetOpts`] ranges, local or remote.
pub struct ChangesetFeed {
    adapter: Arc<dyn GraphAdapter>,
    last_key: String,
    buffered: VecDeque<ChangeSetEntry>,
    exhausted: bool,
}

impl ChangesetFeed {
    pub fn new(adapter: Arc<dyn GraphAdapter>, from: impl Into<String>) -> Self {
        Self {
            adapter,
            last_key: from.into(),
            buffered: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Key of the last entry fetched from the adapter.
    pub fn last_key(&self) -> &str {
        &self.last_key
    }

    pub async fn next(&mut self) -> Result<Option<ChangeSetEntry>> {
        while self.buffered.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        Ok(self.buffered.pop_front())
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let opts = GetOpts::range(Some(self.last_key.clone()), None);
        let Some(node) = self.adapter.get(CHANGELOG_SOUL, Some(&opts)).await? else {
            self.exhausted = true;
            return Ok(());
        };

        let Some(max_key) = node
            .fields
            .keys()
            .filter(|k| k.as_str() > self.last_key.as_str())
            .next_back()
            .cloned()
        else {
            self.exhausted = true;
            return Ok(());
        };

        self.buffered.extend(changelog_entries(&node, &self.last_key));
        self.last_key = max_key;
        Ok(())
    }
}
