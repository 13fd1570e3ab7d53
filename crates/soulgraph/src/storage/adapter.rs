use crate::error::{Error, Result};
use crate::storage::ChangeFeed;
use crate::types::{GetOpts, GraphData, Node, State};
use async_trait::async_trait;

/// Durable or remote home of graph data.
///
/// `put` returns only the portion of the payload that actually advanced the
/// stored state, or `None` when nothing changed. Change feeds and changelog
/// pruning are optional capabilities; the defaults report them unsupported.
#[async_trait]
pub trait GraphAdapter: Send + Sync {
    async fn get(&self, soul: &str, opts: Option<&GetOpts>) -> Result<Option<Node>>;

    async fn put(&self, graph: &GraphData) -> Result<Option<GraphData>>;

    /// Push feed of changelog entries strictly after `from`.
    fn on_change(&self, _from: Option<&str>) -> Result<ChangeFeed> {
        Err(Error::Unsupported("on_change"))
    }

    fn supports_change_feed(&self) -> bool {
        false
    }

    /// Delete changelog entries recorded before `before` (ms).
    async fn prune_changelog(&self, _before: State) -> Result<()> {
        Err(Error::Unsupported("prune_changelog"))
    }
}

/// Blocking variants, for backends that never suspend.
pub trait SyncGraphAdapter: Send + Sync {
    fn get_sync(&self, soul: &str, opts: Option<&GetOpts>) -> Result<Option<Node>>;

    fn put_sync(&self, graph: &GraphData) -> Result<Option<GraphData>>;
}
