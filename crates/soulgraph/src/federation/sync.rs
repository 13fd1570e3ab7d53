use crate::error::{Error, Result};
use crate::federation::{BatchWriter, FederatedAdapter, millis};
use crate::storage::{ChangesetFeed, GraphAdapter};
use crate::types::{GetOpts, GraphData, Node, PEERSYNC_SOUL, iso_timestamp, machine_state};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const MIN_RETRY: Duration = Duration::from_millis(100);

/// Live link to one peer. Dropping it stops following the peer.
#[derive(Debug)]
pub struct PeerConnection {
    name: String,
    task: JoinHandle<()>,
}

impl PeerConnection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn disconnect(self) {}
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FederatedAdapter {
    /// Last changelog key replicated from `peer`, if any.
    pub async fn checkpoint(&self, peer: &str) -> Result<Option<String>> {
        let node = self
            .shared
            .internal
            .get(PEERSYNC_SOUL, Some(&GetOpts::single(peer)))
            .await?;
        Ok(node
            .and_then(|n| n.get(peer).and_then(|v| v.as_str().map(str::to_string)))
            .filter(|key| !key.is_empty()))
    }

    async fn save_checkpoint(&self, peer: &str, key: &str) -> Result<()> {
        let mut graph = GraphData::new();
        graph.insert(
            PEERSYNC_SOUL.to_string(),
            Some(Node::new(PEERSYNC_SOUL).with(peer, key, machine_state())),
        );
        self.shared.internal.put(&graph).await?;
        Ok(())
    }

    async fn start_key(&self, peer: &str) -> String {
        match self.checkpoint(peer).await {
            Ok(Some(key)) => key,
            Ok(None) => iso_timestamp(machine_state() - millis(self.shared.opts.back_sync)),
            Err(e) => {
                warn!(peer = %peer, "Failed to read sync checkpoint: {}", e);
                iso_timestamp(machine_state() - millis(self.shared.opts.back_sync))
            }
        }
    }

    /// Page through `peer`'s changelog after `from` into `batch`.
    async fn catch_up(&self, peer: &Arc<dyn GraphAdapter>, from: &str, batch: &BatchWriter) -> Result<String> {
        let mut feed = ChangesetFeed::new(Arc::clone(peer), from);
        let mut last_seen = from.to_string();
        while let Some(entry) = feed.next().await? {
            if entry.key > last_seen {
                batch.queue_diff(&entry.diff);
                last_seen = entry.key;
            }
        }
        Ok(last_seen)
    }

    /// Catch up with `name` from `from`, persist what arrived and advance
    /// the checkpoint. Returns the last key replicated.
    pub async fn sync_with_peer(&self, name: &str, from: &str) -> Result<String> {
        let peer = self.peer(name)?;
        let batch = self.batch_writer(name);
        let last_seen = self.catch_up(&peer, from, &batch).await?;

        if last_seen.as_str() > from {
            debug!(peer = %name, last_key = %last_seen, "Writing catch-up batch");
            batch.write_batch().await?;
            self.save_checkpoint(name, &last_seen).await?;
        }
        Ok(last_seen)
    }

    /// Catch up every peer that has no push feed. Failures are per peer.
    pub async fn sync_with_peers(&self) {
        let syncs = self
            .shared
            .peers
            .iter()
            .filter(|(_, peer)| !peer.supports_change_feed())
            .map(|(name, _)| async move {
                let from = self.start_key(name).await;
                if let Err(e) = self.sync_with_peer(name, &from).await {
                    warn!(peer = %name, "Error syncing with peer: {}", e);
                }
            });
        join_all(syncs).await;
    }

    /// Catch up with `name`, then follow its change feed.
    pub fn connect_to_peer(&self, name: &str, from: String) -> Result<PeerConnection> {
        let peer = self.peer(name)?;
        if !peer.supports_change_feed() {
            return Err(Error::Unsupported("on_change"));
        }

        let fed = self.clone();
        let peer_name = name.to_string();
        let retry = self.shared.opts.sync_interval.max(MIN_RETRY);
        let task = tokio::spawn(async move {
            let mut from = from;
            loop {
                if let Err(e) = fed.follow_peer(&peer_name, Arc::clone(&peer), from.clone()).await {
                    warn!(peer = %peer_name, "Peer link interrupted: {}", e);
                }
                tokio::time::sleep(retry).await;
                if let Ok(Some(key)) = fed.checkpoint(&peer_name).await {
                    from = key;
                }
            }
        });

        info!(peer = %name, "Connected to peer");
        Ok(PeerConnection {
            name: name.to_string(),
            task,
        })
    }

    /// Connect to every peer with a push feed, each from its checkpoint.
    pub async fn connect_to_peers(&self) -> Vec<PeerConnection> {
        let mut connections = Vec::new();
        for (name, peer) in &self.shared.peers {
            if !peer.supports_change_feed() {
                continue;
            }
            let from = self.start_key(name).await;
            match self.connect_to_peer(name, from) {
                Ok(connection) => connections.push(connection),
                Err(e) => warn!(peer = %name, "Unconnectable peer: {}", e),
            }
        }
        connections
    }

    async fn follow_peer(&self, name: &str, peer: Arc<dyn GraphAdapter>, from: String) -> Result<()> {
        let batch = self.batch_writer(name);
        let mut last_key = self.catch_up(&peer, &from, &batch).await?;
        if last_key > from {
            batch.write_batch().await?;
            self.save_checkpoint(name, &last_key).await?;
        }
        let mut synced = last_key.clone();

        let mut feed = peer.on_change(Some(last_key.as_str()))?;
        let interval = self.shared.opts.batch_interval;

        if interval.is_zero() {
            while let Some(entry) = feed.recv().await {
                if entry.key <= last_key {
                    continue;
                }
                batch.queue_diff(&entry.diff);
                last_key = entry.key;
                self.flush(name, &batch, &mut synced, &last_key).await;
            }
        } else {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    entry = feed.recv() => {
                        let Some(entry) = entry else { break };
                        if entry.key > last_key {
                            batch.queue_diff(&entry.diff);
                            last_key = entry.key;
                        }
                    }
                    _ = tick.tick() => self.flush(name, &batch, &mut synced, &last_key).await,
                }
            }
            self.flush(name, &batch, &mut synced, &last_key).await;
        }

        Err(Error::Closed)
    }

    /// Write the batch if anything arrived since the last flush. On failure
    /// the batch and the checkpoint stay put for the next attempt.
    async fn flush(&self, name: &str, batch: &BatchWriter, synced: &mut String, last_key: &str) {
        if synced.as_str() == last_key {
            return;
        }
        match batch.write_batch().await {
            Ok(_) => {
                *synced = last_key.to_string();
                if let Err(e) = self.save_checkpoint(name, last_key).await {
                    warn!(peer = %name, "Failed to save sync checkpoint: {}", e);
                }
            }
            Err(e) => warn!(peer = %name, "Batch flush failed, retrying next interval: {}", e),
        }
    }

    /// Periodically catch up peers without a push feed.
    pub fn spawn_sync_loop(&self) -> JoinHandle<()> {
        let fed = self.clone();
        let period = self.shared.opts.sync_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                fed.sync_with_peers().await;
            }
        })
    }

    /// Periodically drop changelog entries older than the retention window.
    pub fn spawn_prune_loop(&self) -> JoinHandle<()> {
        let fed = self.clone();
        let period = self.shared.opts.prune_interval.max(Duration::from_millis(1));
        let retention = millis(self.shared.opts.changelog_retention);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let before = machine_state() - retention;
                match fed.prune_changelog(before).await {
                    Ok(()) => info!(before = %iso_timestamp(before), "Pruned changelog"),
                    Err(e) => warn!("Changelog prune failed: {}", e),
                }
            }
        })
    }
}
