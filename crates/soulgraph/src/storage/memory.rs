use crate::crdt::{self, DiffOptions};
use crate::error::Result;
use crate::storage::{GraphAdapter, SyncGraphAdapter};
use crate::types::{CHANGELOG_SOUL, GetOpts, GraphData, Node, State, iso_timestamp};
use async_trait::async_trait;
use parking_lot::RwLock;

/// Volatile adapter holding the whole graph in a map.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    graph: RwLock<GraphData>,
    diff_opts: DiffOptions,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_diff_options(diff_opts: DiffOptions) -> Self {
        Self {
            graph: RwLock::new(GraphData::new()),
            diff_opts,
        }
    }

    /// Copy of everything stored.
    pub fn snapshot(&self) -> GraphData {
        self.graph.read().clone()
    }
}

impl SyncGraphAdapter for MemoryAdapter {
    fn get_sync(&self, soul: &str, opts: Option<&GetOpts>) -> Result<Option<Node>> {
        let graph = self.graph.read();
        let Some(Some(node)) = graph.get(soul) else {
            return Ok(None);
        };

        Ok(match opts.filter(|o| !o.is_empty()) {
            Some(opts) => Some(opts.filter(node)).filter(|n| !n.is_empty()),
            None => Some(node.clone()),
        })
    }

    fn put_sync(&self, data: &GraphData) -> Result<Option<GraphData>> {
        let mut graph = self.graph.write();
        let Some(mut diff) = crdt::diff(data, &graph, &self.diff_opts) else {
            return Ok(None);
        };
        diff.retain(|_, node| node.is_some());
        if diff.is_empty() {
            return Ok(None);
        }

        crdt::merge_graph(&mut graph, &diff);
        Ok(Some(diff))
    }
}

#[async_trait]
impl GraphAdapter for MemoryAdapter {
    async fn get(&self, soul: &str, opts: Option<&GetOpts>) -> Result<Option<Node>> {
        self.get_sync(soul, opts)
    }

    async fn put(&self, graph: &GraphData) -> Result<Option<GraphData>> {
        self.put_sync(graph)
    }

    async fn prune_changelog(&self, before: State) -> Result<()> {
        let cutoff = iso_timestamp(before);
        let mut graph = self.graph.write();
        if let Some(Some(changelog)) = graph.get_mut(CHANGELOG_SOUL) {
            changelog.fields.retain(|key, _| key.as_str() >= cutoff.as_str());
            let fields = &changelog.fields;
            changelog.meta.state.retain(|key, _| fields.contains_key(key));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn put_node(adapter: &MemoryAdapter, node: Node) -> Option<GraphData> {
        let mut graph = GraphData::new();
        graph.insert(node.soul().to_string(), Some(node));
        adapter.put_sync(&graph).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let adapter = MemoryAdapter::new();
        let diff = put_node(&adapter, Node::new("A").with("name", "x", 1));
        assert!(diff.is_some());

        let node = adapter.get_sync("A", None).unwrap().unwrap();
        assert_eq!(node.get("name"), Some(&Value::from("x")));
        assert!(adapter.get_sync("B", None).unwrap().is_none());
    }

    #[test]
    fn test_put_returns_only_advancing_fields() {
        let adapter = MemoryAdapter::new();
        put_node(&adapter, Node::new("A").with("a", 1, 10).with("b", 1, 10));

        let diff = put_node(&adapter, Node::new("A").with("a", 1, 10).with("b", 2, 11)).unwrap();
        assert_eq!(diff["A"].as_ref().unwrap().fields.len(), 1);

        assert!(put_node(&adapter, Node::new("A").with("a", 0, 9)).is_none());
    }

    #[test]
    fn test_absence_is_not_stored() {
        let adapter = MemoryAdapter::new();
        let mut graph = GraphData::new();
        graph.insert("A".into(), None);
        assert!(adapter.put_sync(&graph).unwrap().is_none());
        assert!(adapter.snapshot().is_empty());
    }

    #[test]
    fn test_ranged_get() {
        let adapter = MemoryAdapter::new();
        put_node(&adapter, Node::new("A").with("a", 1, 1).with("b", 2, 1).with("c", 3, 1));

        let node = adapter.get_sync("A", Some(&GetOpts::single("b"))).unwrap().unwrap();
        assert_eq!(node.len(), 1);

        let opts = GetOpts::range(Some("d".into()), None);
        assert!(adapter.get_sync("A", Some(&opts)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_changelog() {
        let adapter = MemoryAdapter::new();
        let old = format!("{}-a", iso_timestamp(1_000));
        let new = format!("{}-b", iso_timestamp(5_000));
        put_node(
            &adapter,
            Node::new(CHANGELOG_SOUL).with(old.clone(), "{}", 1).with(new.clone(), "{}", 1),
        );

        adapter.prune_changelog(2_000).await.unwrap();
        let changelog = adapter.get(CHANGELOG_SOUL, None).await.unwrap().unwrap();
        assert!(changelog.get(&old).is_none());
        assert!(changelog.get(&new).is_some());
        assert_eq!(changelog.meta.state.len(), 1);
    }
}
