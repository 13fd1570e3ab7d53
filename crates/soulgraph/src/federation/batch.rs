use crate::crdt::{self, DiffOptions};
use crate::error::Result;
use crate::federation::{Changelog, PeerSet, push_to_peers};
use crate::storage::GraphAdapter;
use crate::types::GraphData;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Accumulates diffs from one source and writes them as a single put.
///
/// Queued diffs are CRDT-merged, so replaying or reordering entries before
/// a flush is harmless. A failed flush keeps everything queued.
pub struct BatchWriter {
    batch: Mutex<GraphData>,
    persist: Arc<dyn GraphAdapter>,
    changelog: Option<Changelog>,
    peers: Option<PeerSet>,
    diff_opts: DiffOptions,
}

impl BatchWriter {
    /// `peers` receive every flushed diff when present; leave out the source.
    pub fn new(
        persist: Arc<dyn GraphAdapter>,
        changelog: Option<Changelog>,
        peers: Option<PeerSet>,
        diff_opts: DiffOptions,
    ) -> Self {
        Self {
            batch: Mutex::new(GraphData::new()),
            persist,
            changelog,
            peers,
            diff_opts,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batch.lock().is_empty()
    }

    /// Merge `changes` into the batch, returning what advanced it.
    pub fn queue_diff(&self, changes: &GraphData) -> Option<GraphData> {
        let mut batch = self.batch.lock();
        let diff = crdt::diff(changes, &batch, &self.diff_opts)?;
        crdt::merge_graph(&mut batch, &diff);
        Some(diff)
    }

    /// Persist the batch. Returns the diff the store accepted.
    pub async fn write_batch(&self) -> Result<Option<GraphData>> {
        let to_write = std::mem::take(&mut *self.batch.lock());
        if to_write.is_empty() {
            return Ok(None);
        }

        let diff = match self.persist.put(&to_write).await {
            Ok(diff) => diff,
            Err(e) => {
                self.requeue(&to_write);
                return Err(e);
            }
        };
        debug!(souls = to_write.len(), changed = diff.as_ref().map_or(0, |d| d.len()), "Wrote batch");

        if let Some(diff) = &diff {
            if let Some(changelog) = &self.changelog
                && let Err(e) = changelog.append(diff).await
            {
                warn!("Failed to append batch to changelog: {}", e);
            }
            if let Some(peers) = &self.peers {
                push_to_peers(peers, diff, None).await;
            }
        }
        Ok(diff)
    }

    fn requeue(&self, failed: &GraphData) {
        let mut batch = self.batch.lock();
        if let Some(diff) = crdt::diff(failed, &batch, &self.diff_opts) {
            crdt::merge_graph(&mut batch, &diff);
        }
    }
}
