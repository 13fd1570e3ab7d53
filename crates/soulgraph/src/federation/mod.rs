//! Replication across a set of named peer adapters.
//!
//! A [`FederatedAdapter`] answers reads from its `internal` adapter after
//! pulling stale souls from peers, writes through a `persist` adapter, and
//! records every accepted diff in the changelog. Peers with a push feed are
//! followed live ([`FederatedAdapter::connect_to_peers`]); the rest are caught
//! up on a timer ([`FederatedAdapter::sync_with_peers`]).

mod batch;
mod changelog;
mod sync;

pub use batch::BatchWriter;
pub use changelog::{Changelog, changelog_key};
pub use sync::PeerConnection;

use crate::config::{CrdtConfig, FederationConfig};
use crate::crdt::DiffOptions;
use crate::error::{Error, Result};
use crate::storage::{ChangeFeed, ChangesetFeed, GraphAdapter};
use crate::types::{
    ChangeSetEntry, GetOpts, GraphData, Node, State, is_reserved_soul, iso_timestamp, machine_state, peer_soul,
};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Peer name (its base URL for remote peers) to adapter.
pub type PeerSet = BTreeMap<String, Arc<dyn GraphAdapter>>;

const LIVE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct FederatedOptions {
    /// How far back a peer without a checkpoint is caught up from.
    pub back_sync: Duration,
    /// A soul is pulled from a peer when its last pull is older than this.
    pub max_staleness: Duration,
    /// Flush period of live sync batches. Zero flushes on every event.
    pub batch_interval: Duration,
    pub sync_interval: Duration,
    pub prune_interval: Duration,
    pub changelog_retention: Duration,
    pub maintain_changelog: bool,
    pub put_to_peers: bool,
    pub diff: DiffOptions,
}

impl Default for FederatedOptions {
    fn default() -> Self {
        Self::from_config(&FederationConfig::default(), &CrdtConfig::default()).with_put_to_peers(false)
    }
}

impl FederatedOptions {
    pub fn from_config(federation: &FederationConfig, crdt: &CrdtConfig) -> Self {
        Self {
            back_sync: Duration::from_millis(federation.back_sync_ms),
            max_staleness: Duration::from_millis(federation.max_staleness_ms),
            batch_interval: Duration::from_millis(federation.batch_interval_ms),
            sync_interval: Duration::from_millis(federation.sync_interval_ms),
            prune_interval: Duration::from_millis(federation.prune_interval_ms),
            changelog_retention: Duration::from_millis(federation.changelog_retention_ms),
            maintain_changelog: federation.maintain_changelog,
            put_to_peers: federation.put_to_peers,
            diff: DiffOptions::with_grace(crdt.future_grace_ms),
        }
    }

    pub fn with_put_to_peers(mut self, put_to_peers: bool) -> Self {
        self.put_to_peers = put_to_peers;
        self
    }
}

fn millis(duration: Duration) -> State {
    State::try_from(duration.as_millis()).unwrap_or(State::MAX)
}

/// Push `diff` to every peer except `exclude`. Failures are logged.
pub(crate) async fn push_to_peers(peers: &PeerSet, diff: &GraphData, exclude: Option<&str>) {
    let pushes = peers
        .iter()
        .filter(|(name, _)| Some(name.as_str()) != exclude)
        .map(|(name, peer)| async move {
            if let Err(e) = peer.put(diff).await {
                warn!(peer = %name, "Failed to update peer: {}", e);
            }
        });
    join_all(pushes).await;
}

type PullLocks = Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>;

struct Shared {
    internal: Arc<dyn GraphAdapter>,
    persist: Arc<dyn GraphAdapter>,
    peers: PeerSet,
    changelog: Changelog,
    opts: FederatedOptions,
    pulls: PullLocks,
}

#[derive(Clone)]
pub struct FederatedAdapter {
    shared: Arc<Shared>,
}

impl FederatedAdapter {
    /// `persist` defaults to `internal` when both roles are served by one store.
    pub fn new(
        internal: Arc<dyn GraphAdapter>,
        persist: Option<Arc<dyn GraphAdapter>>,
        peers: PeerSet,
        opts: FederatedOptions,
    ) -> Self {
        let persist = persist.unwrap_or_else(|| Arc::clone(&internal));
        Self {
            shared: Arc::new(Shared {
                changelog: Changelog::new(Arc::clone(&internal), LIVE_CAPACITY),
                internal,
                persist,
                peers,
                opts,
                pulls: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn options(&self) -> &FederatedOptions {
        &self.shared.opts
    }

    pub fn peers(&self) -> &PeerSet {
        &self.shared.peers
    }

    pub fn internal(&self) -> &Arc<dyn GraphAdapter> {
        &self.shared.internal
    }

    fn peer(&self, name: &str) -> Result<Arc<dyn GraphAdapter>> {
        self.shared
            .peers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("unknown peer {}", name)))
    }

    fn other_peers(&self, name: &str) -> PeerSet {
        self.shared
            .peers
            .iter()
            .filter(|(peer, _)| peer.as_str() != name)
            .map(|(peer, adapter)| (peer.clone(), Arc::clone(adapter)))
            .collect()
    }

    /// Pull iterator over this node's own changelog.
    pub fn changeset_feed(&self, from: impl Into<String>) -> ChangesetFeed {
        ChangesetFeed::new(Arc::clone(&self.shared.internal), from)
    }

    /// Batch writer for diffs received from `source`.
    pub fn batch_writer(&self, source: &str) -> BatchWriter {
        let opts = &self.shared.opts;
        BatchWriter::new(
            Arc::clone(&self.shared.persist),
            opts.maintain_changelog.then(|| self.shared.changelog.clone()),
            opts.put_to_peers.then(|| self.other_peers(source)),
            opts.diff,
        )
    }

    /// Record `diff` in the changelog and forward it to peers, as configured.
    async fn propagate(&self, diff: &GraphData, source: Option<&str>) {
        let opts = &self.shared.opts;
        if opts.maintain_changelog
            && let Err(e) = self.shared.changelog.append(diff).await
        {
            warn!("Failed to append changelog entry: {}", e);
        }
        if opts.put_to_peers {
            push_to_peers(&self.shared.peers, diff, source).await;
        }
    }

    async fn update_from_peers(&self, soul: &str) {
        if is_reserved_soul(soul) || self.shared.peers.is_empty() {
            return;
        }
        let pulls = self.shared.peers.iter().map(|(name, peer)| async move {
            if let Err(e) = self.update_from_peer(name, peer, soul).await {
                warn!(peer = %name, soul = %soul, "Error updating from peer: {}", e);
            }
        });
        join_all(pulls).await;
    }

    fn pull_lock(&self, peer: &str, soul: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut pulls = self.shared.pulls.lock();
        Arc::clone(pulls.entry((peer.to_string(), soul.to_string())).or_default())
    }

    fn release_pull_lock(&self, peer: &str, soul: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut pulls = self.shared.pulls.lock();
        // Only the map and this holder remain.
        if Arc::strong_count(&lock) == 2 {
            pulls.remove(&(peer.to_string(), soul.to_string()));
        }
    }

    async fn update_from_peer(&self, name: &str, peer: &Arc<dyn GraphAdapter>, soul: &str) -> Result<()> {
        let lock = self.pull_lock(name, soul);
        let result = {
            let _pulling = lock.lock().await;
            self.pull_if_stale(name, peer, soul).await
        };
        self.release_pull_lock(name, soul, lock);
        result
    }

    async fn pull_if_stale(&self, name: &str, peer: &Arc<dyn GraphAdapter>, soul: &str) -> Result<()> {
        let status_soul = peer_soul(name);
        let now = machine_state();
        let last_pull = self
            .shared
            .internal
            .get(&status_soul, Some(&GetOpts::single(soul)))
            .await?
            .and_then(|status| status.state_of(soul))
            .unwrap_or(0);
        if now - last_pull < millis(self.shared.opts.max_staleness) {
            return Ok(());
        }

        // Mark the attempt first so a failing peer is retried after
        // `max_staleness`, not on every read.
        self.record_pull(name, soul, false, now).await?;

        trace!(peer = %name, soul = %soul, "Pulling stale soul");
        let node = peer.get(soul, None).await?;
        let Some(node) = node else {
            return Ok(());
        };
        let mut graph = GraphData::new();
        graph.insert(soul.to_string(), Some(node));
        match self.shared.persist.put(&graph).await {
            Ok(Some(diff)) => self.propagate(&diff, Some(name)).await,
            Ok(None) => {}
            Err(e) => warn!(peer = %name, soul = %soul, "Error updating from peer: {}", e),
        }
        // `true` outranks `false` at equal state.
        self.record_pull(name, soul, true, now).await
    }

    /// Note in `peers/<name>` when `soul` was last pulled and whether the peer had it.
    async fn record_pull(&self, name: &str, soul: &str, found: bool, at: State) -> Result<()> {
        let status_soul = peer_soul(name);
        let mut status = GraphData::new();
        status.insert(status_soul.clone(), Some(Node::new(status_soul).with(soul, found, at)));
        self.shared.internal.put(&status).await?;
        Ok(())
    }

    /// Replay this node's changelog after `from`, then follow it live.
    fn change_feed(&self, from: Option<&str>) -> ChangeFeed {
        let mut live = self.shared.changelog.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let internal = Arc::clone(&self.shared.internal);
        let from = from.map(str::to_string);

        let task = tokio::spawn(async move {
            let mut last = match from {
                Some(from) => match replay(&internal, &from, &tx).await {
                    Ok(last) => last,
                    Err(e) => {
                        warn!("Changelog replay failed: {}", e);
                        return;
                    }
                },
                None => iso_timestamp(machine_state()),
            };

            loop {
                match live.recv().await {
                    Ok(entry) => {
                        if entry.key <= last {
                            continue;
                        }
                        last = entry.key.clone();
                        if tx.send(entry).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Change feed lagged, replaying from {}", last);
                        match replay(&internal, &last, &tx).await {
                            Ok(key) => last = key,
                            Err(e) => {
                                warn!("Changelog replay failed: {}", e);
                                break;
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        ChangeFeed::new(rx, Some(task))
    }
}

/// Send every changelog entry after `from` to `tx`; returns the last key sent.
async fn replay(
    internal: &Arc<dyn GraphAdapter>,
    from: &str,
    tx: &mpsc::UnboundedSender<ChangeSetEntry>,
) -> Result<String> {
    let mut feed = ChangesetFeed::new(Arc::clone(internal), from);
    let mut last = from.to_string();
    while let Some(entry) = feed.next().await? {
        if entry.key.as_str() <= last.as_str() {
            continue;
        }
        last = entry.key.clone();
        tx.send(entry).map_err(|_| Error::Closed)?;
    }
    Ok(last)
}

#[async_trait]
impl GraphAdapter for FederatedAdapter {
    async fn get(&self, soul: &str, opts: Option<&GetOpts>) -> Result<Option<Node>> {
        self.update_from_peers(soul).await;
        self.shared.internal.get(soul, opts).await
    }

    async fn put(&self, graph: &GraphData) -> Result<Option<GraphData>> {
        let diff = self.shared.persist.put(graph).await?;
        if let Some(diff) = &diff {
            self.propagate(diff, None).await;
        }
        Ok(diff)
    }

    fn on_change(&self, from: Option<&str>) -> Result<ChangeFeed> {
        Ok(self.change_feed(from))
    }

    fn supports_change_feed(&self) -> bool {
        true
    }

    async fn prune_changelog(&self, before: State) -> Result<()> {
        self.shared.internal.prune_changelog(before).await
    }
}
