use crate::events::ListenerId;
use crate::graph::{Graph, GraphInner, NodeListener};
use crate::types::{GraphData, Node, Value};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};

/// Terminal value of a resolved path.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Node(Node),
    Value(Value),
}

impl QueryValue {
    pub fn as_node(&self) -> Option<&Node> {
        match self {
            QueryValue::Node(node) => Some(node),
            QueryValue::Value(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            QueryValue::Value(value) => Some(value),
            QueryValue::Node(_) => None,
        }
    }
}

pub type QueryCallback = Arc<dyn Fn(Option<&QueryValue>, &str) + Send + Sync>;

/// Result of resolving a path against the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct PathData {
    /// Souls visited, root first.
    pub souls: Vec<String>,
    pub value: Option<QueryValue>,
    /// True once every soul needed is known (present or known absent).
    pub complete: bool,
}

enum Cursor<'a> {
    Missing,
    Node(&'a Node),
    Value(&'a Value),
}

/// Resolve `keys` (root soul first) by following edges through `graph`.
pub fn path_data(keys: &[String], graph: &GraphData) -> PathData {
    let Some((root, rest)) = keys.split_first() else {
        return PathData {
            souls: Vec::new(),
            value: None,
            complete: true,
        };
    };

    let node_at = |soul: &str| match graph.get(soul) {
        Some(Some(node)) => Cursor::Node(node),
        _ => Cursor::Missing,
    };

    let mut souls = vec![root.clone()];
    let mut complete = graph.contains_key(root);
    let mut cursor = node_at(root);

    for key in rest {
        let node = match cursor {
            Cursor::Node(node) => node,
            Cursor::Value(_) => {
                return PathData {
                    souls,
                    value: None,
                    complete: true,
                };
            }
            Cursor::Missing => {
                return PathData {
                    souls,
                    value: None,
                    complete,
                };
            }
        };

        cursor = match node.get(key) {
            Some(Value::Edge(edge)) => {
                souls.push(edge.soul.clone());
                complete = graph.contains_key(&edge.soul);
                node_at(&edge.soul)
            }
            Some(value) => {
                complete = true;
                Cursor::Value(value)
            }
            None => {
                complete = true;
                Cursor::Missing
            }
        };
    }

    let value = match cursor {
        Cursor::Node(node) => Some(QueryValue::Node(node.clone())),
        Cursor::Value(value) => Some(QueryValue::Value(value.clone())),
        Cursor::Missing => None,
    };
    PathData {
        souls,
        value,
        complete,
    }
}

/// Souls entering and leaving view between two resolutions.
pub fn diff_sets(previous: &[String], next: &[String]) -> (Vec<String>, Vec<String>) {
    let prev: HashSet<&String> = previous.iter().collect();
    let nxt: HashSet<&String> = next.iter().collect();
    let added = next.iter().filter(|s| !prev.contains(s)).cloned().collect();
    let removed = previous.iter().filter(|s| !nxt.contains(s)).cloned().collect();
    (added, removed)
}

pub(crate) enum QueryMode {
    /// Emit the terminal value when it resolves or changes.
    Value(QueryCallback),
    /// Observe every resolution.
    Path(Arc<dyn Fn(&PathData) + Send + Sync>),
}

struct QueryState {
    last_souls: Vec<String>,
    last_emitted: Option<Option<QueryValue>>,
    done: bool,
}

/// Live resolution of one path, re-run whenever a soul in view changes.
pub(crate) struct PathQuery {
    graph: Weak<GraphInner>,
    path: Vec<String>,
    id: ListenerId,
    mode: QueryMode,
    state: Mutex<QueryState>,
}

impl PathQuery {
    pub(crate) fn start(graph: &Graph, path: Vec<String>, mode: QueryMode) -> Arc<Self> {
        let query = Arc::new(PathQuery {
            graph: Arc::downgrade(&graph.inner),
            path,
            id: ListenerId::next(),
            mode,
            state: Mutex::new(QueryState {
                last_souls: Vec::new(),
                last_emitted: None,
                done: false,
            }),
        });
        query.update();
        query
    }

    fn listener(self: &Arc<Self>) -> NodeListener {
        let weak = Arc::downgrade(self);
        Arc::new(move |_: Option<&Node>, _: &str| {
            if let Some(query) = weak.upgrade() {
                query.update();
            }
        })
    }

    fn update(self: &Arc<Self>) {
        let Some(inner) = self.graph.upgrade() else {
            return;
        };
        let graph = Graph { inner };
        let data = graph.with_cache(|cache| path_data(&self.path, cache));

        let (added, removed, emit) = {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            let (added, removed) = diff_sets(&state.last_souls, &data.souls);
            state.last_souls = data.souls.clone();

            let emit = data.complete && state.last_emitted.as_ref() != Some(&data.value);
            if emit {
                state.last_emitted = Some(data.value.clone());
            }
            (added, removed, emit)
        };

        match &self.mode {
            QueryMode::Value(cb) if emit => {
                let key = self.path.last().map(String::as_str).unwrap_or_default();
                cb(data.value.as_ref(), key);
            }
            QueryMode::Value(_) => {}
            QueryMode::Path(cb) => cb(&data),
        }

        for soul in added {
            graph.listen_soul(&soul, self.id, self.listener());
        }
        for soul in removed {
            graph.unlisten_soul(&soul, self.id);
        }
    }

    pub(crate) fn end(&self) {
        let souls = {
            let mut state = self.state.lock();
            state.done = true;
            std::mem::take(&mut state.last_souls)
        };
        if let Some(inner) = self.graph.upgrade() {
            let graph = Graph { inner };
            for soul in souls {
                graph.unlisten_soul(&soul, self.id);
            }
        }
    }
}
