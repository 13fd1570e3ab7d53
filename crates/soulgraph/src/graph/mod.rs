//! Client-side graph store.
//!
//! The store caches only the souls somebody is listening to. Listening to a
//! soul for the first time asks every connected connector for it; the last
//! listener leaving forgets it again. Inbound data is diffed against the
//! cache with the CRDT and then run through the read middleware before it is
//! merged and listeners are told.
//!
//! Middleware stages run while the cache is locked and must not call back
//! into the store.

mod chain;
mod node;
mod query;

pub use chain::{Client, Link, UuidFn, WriteValue};
pub use query::{PathData, QueryCallback, QueryValue, diff_sets, path_data};

use crate::connector::{GetRequest, GraphConnector, GraphDataEvent, MsgCallback, PutRequest};
use crate::crdt::{self, DiffOptions};
use crate::error::{Error, Result};
use crate::events::{Event, ListenerId, Unsubscribe};
use crate::middleware::MiddlewareSystem;
use crate::types::{GraphData, Message, Node, Value, generate_message_id, machine_state};
use node::GraphNode;
use parking_lot::Mutex;
use query::{PathQuery, QueryMode};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace};

pub type NodeListener = Arc<dyn Fn(Option<&Node>, &str) + Send + Sync>;

pub struct GraphEvents {
    pub get: Event<GetRequest>,
    pub put: Event<PutRequest>,
    pub off: Event<String>,
    pub graph_data: Event<GraphDataEvent>,
}

/// Which directions a connector is wired for.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Receive this store's `get` requests.
    pub requests: bool,
    /// Receive this store's writes.
    pub puts: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            requests: true,
            puts: true,
        }
    }
}

struct Wiring {
    connector: Arc<dyn GraphConnector>,
    data_listener: ListenerId,
    off_listener: ListenerId,
    get_listener: Option<ListenerId>,
    put_listener: Option<ListenerId>,
}

#[derive(Default)]
struct GraphState {
    cache: GraphData,
    nodes: HashMap<String, GraphNode>,
}

pub(crate) struct GraphInner {
    events: GraphEvents,
    state: Mutex<GraphState>,
    read_middleware: MiddlewareSystem<GraphData, GraphData>,
    write_middleware: MiddlewareSystem<GraphData, GraphData>,
    connectors: Mutex<Vec<Wiring>>,
    diff_opts: DiffOptions,
}

#[derive(Clone)]
pub struct Graph {
    pub(crate) inner: Arc<GraphInner>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new(DiffOptions::default())
    }
}

impl Graph {
    pub fn new(diff_opts: DiffOptions) -> Self {
        Self {
            inner: Arc::new(GraphInner {
                events: GraphEvents {
                    get: Event::new("graph.get"),
                    put: Event::new("graph.put"),
                    off: Event::new("graph.off"),
                    graph_data: Event::new("graph.graph_data"),
                },
                state: Mutex::new(GraphState::default()),
                read_middleware: MiddlewareSystem::new("graph.read"),
                write_middleware: MiddlewareSystem::new("graph.write"),
                connectors: Mutex::new(Vec::new()),
                diff_opts,
            }),
        }
    }

    pub fn events(&self) -> &GraphEvents {
        &self.inner.events
    }

    /// Stages applied to inbound diffs, with the current cache as context.
    pub fn read_middleware(&self) -> &MiddlewareSystem<GraphData, GraphData> {
        &self.inner.read_middleware
    }

    /// Stages applied to local writes. A veto rejects the write.
    pub fn write_middleware(&self) -> &MiddlewareSystem<GraphData, GraphData> {
        &self.inner.write_middleware
    }

    pub(crate) fn with_cache<R>(&self, f: impl FnOnce(&GraphData) -> R) -> R {
        f(&self.inner.state.lock().cache)
    }

    /// Cached value of `soul`; `Some(None)` means known absent.
    pub fn cached(&self, soul: &str) -> Option<Option<Node>> {
        self.inner.state.lock().cache.get(soul).cloned()
    }

    pub fn is_watching(&self, soul: &str) -> bool {
        self.inner.state.lock().nodes.contains_key(soul)
    }

    pub fn listener_count(&self, soul: &str) -> usize {
        self.inner
            .state
            .lock()
            .nodes
            .get(soul)
            .map_or(0, GraphNode::listener_count)
    }

    pub fn connect(&self, connector: Arc<dyn GraphConnector>) {
        self.connect_with(connector, ConnectOptions::default());
    }

    pub fn connect_with(&self, connector: Arc<dyn GraphConnector>, opts: ConnectOptions) {
        let events = &self.inner.events;

        let weak_graph = Arc::downgrade(&self.inner);
        let data_listener = connector.core().events.graph_data.on(move |ev: &GraphDataEvent| {
            if let Some(inner) = weak_graph.upgrade() {
                Graph { inner }.receive_graph_data(ev.graph.clone(), ev.msg_id.clone(), ev.reply_to.clone());
            }
        });

        let weak = Arc::downgrade(&connector);
        let off_listener = events.off.on(move |msg_id: &String| {
            if let Some(connector) = weak.upgrade() {
                connector.off(msg_id);
            }
        });

        let get_listener = opts.requests.then(|| {
            let weak = Arc::downgrade(&connector);
            events.get.on(move |req: &GetRequest| {
                if let Some(connector) = weak.upgrade() {
                    connector.get(req.clone());
                }
            })
        });

        let put_listener = opts.puts.then(|| {
            let weak = Arc::downgrade(&connector);
            events.put.on(move |req: &PutRequest| {
                if let Some(connector) = weak.upgrade() {
                    connector.put(req.clone());
                }
            })
        });

        debug!(connector = %connector.name(), "Connected to graph");
        self.inner.connectors.lock().push(Wiring {
            connector,
            data_listener,
            off_listener,
            get_listener,
            put_listener,
        });
    }

    /// Unwire every connector named `name`.
    pub fn disconnect(&self, name: &str) -> bool {
        let removed: Vec<Wiring> = {
            let mut connectors = self.inner.connectors.lock();
            let (gone, kept) = std::mem::take(&mut *connectors)
                .into_iter()
                .partition(|w| w.connector.name() == name);
            *connectors = kept;
            gone
        };

        let events = &self.inner.events;
        for wiring in &removed {
            wiring.connector.core().events.graph_data.off(wiring.data_listener);
            events.off.off(wiring.off_listener);
            if let Some(id) = wiring.get_listener {
                events.get.off(id);
            }
            if let Some(id) = wiring.put_listener {
                events.put.off(id);
            }
        }
        !removed.is_empty()
    }

    pub fn connector_count(&self) -> usize {
        self.inner.connectors.lock().len()
    }

    /// Ask connectors for `soul`. Replies go to `cb` until unsubscribed.
    pub fn get(&self, soul: &str, cb: Option<MsgCallback>) -> Unsubscribe {
        let msg_id = generate_message_id();
        self.inner.events.get.trigger(&GetRequest {
            soul: soul.to_string(),
            key: None,
            msg_id: msg_id.clone(),
            cb,
        });
        self.off_handle(msg_id)
    }

    fn off_handle(&self, msg_id: String) -> Unsubscribe {
        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.events.off.trigger(&msg_id);
            }
        })
    }

    /// Write `data` locally and to every connector wired for puts.
    ///
    /// Fields without a state are stamped with the current time. A write
    /// that changes nothing in the cache is acknowledged without being sent.
    pub fn put(&self, mut data: GraphData, cb: Option<MsgCallback>) -> Unsubscribe {
        crdt::add_missing_state(&mut data, machine_state());

        let outcome = {
            let state = self.inner.state.lock();
            crdt::diff(&data, &state.cache, &self.inner.diff_opts)
                .map(|diff| self.inner.write_middleware.process(diff, &state.cache))
        };

        let diff = match outcome {
            None => {
                trace!("Put changed nothing");
                if let Some(cb) = cb {
                    cb(&Message {
                        ok: Some(true),
                        ..Default::default()
                    });
                }
                return Unsubscribe::noop();
            }
            Some(None) => {
                debug!("Put rejected by write middleware");
                if let Some(cb) = cb {
                    cb(&Message::error(None, "Write rejected"));
                }
                return Unsubscribe::noop();
            }
            Some(Some(diff)) => diff,
        };

        let msg_id = generate_message_id();
        self.inner.events.put.trigger(&PutRequest {
            graph: diff.clone(),
            msg_id: msg_id.clone(),
            reply_to: None,
            cb,
        });
        self.receive_graph_data(diff, Some(msg_id.clone()), None);
        self.off_handle(msg_id)
    }

    /// Merge inbound data into the cache and notify listeners.
    pub fn receive_graph_data(&self, data: GraphData, msg_id: Option<String>, reply_to: Option<String>) {
        let mut notify: Vec<(Vec<NodeListener>, String, Option<Node>)> = Vec::new();

        let diff = {
            let mut guard = self.inner.state.lock();
            let Some(diff) = crdt::diff(&data, &guard.cache, &self.inner.diff_opts) else {
                return;
            };
            let Some(diff) = self.inner.read_middleware.process(diff, &guard.cache) else {
                return;
            };

            let GraphState { cache, nodes } = &mut *guard;
            for (soul, node_diff) in &diff {
                let Some(node) = nodes.get(soul) else {
                    continue;
                };
                let entry = cache.entry(soul.clone()).or_insert(None);
                match (entry.as_mut(), node_diff) {
                    (Some(existing), Some(d)) => crdt::merge_node_in_place(existing, d),
                    (None, Some(d)) => *entry = Some(d.clone()),
                    (_, None) => {}
                }
                notify.push((node.listeners(), soul.clone(), entry.clone()));
            }
            diff
        };

        for (listeners, soul, node) in notify {
            for listener in listeners {
                listener(node.as_ref(), &soul);
            }
        }

        self.inner.events.graph_data.trigger(&GraphDataEvent {
            graph: diff,
            msg_id,
            reply_to,
        });
    }

    /// Register interest in `soul`. A cached value is delivered at once.
    pub fn listen_soul(&self, soul: &str, id: ListenerId, cb: NodeListener) {
        let (ask, cached) = {
            let mut guard = self.inner.state.lock();
            let GraphState { cache, nodes } = &mut *guard;
            let node = nodes.entry(soul.to_string()).or_default();
            node.add_listener(id, Arc::clone(&cb));
            (node.begin_ask(), cache.get(soul).cloned())
        };

        if let Some(cached) = cached {
            cb(cached.as_ref(), soul);
        }

        if ask {
            self.ask(soul);
        }
    }

    fn ask(&self, soul: &str) {
        let weak = Arc::downgrade(&self.inner);
        let requested = soul.to_string();
        let reply: MsgCallback = Arc::new(move |msg: &Message| {
            if msg.put.is_some() || msg.is_error() {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                let mut absent = GraphData::new();
                absent.insert(requested.clone(), None);
                Graph { inner }.receive_graph_data(absent, msg.id.clone(), msg.reply_to.clone());
            }
        });

        let end_query = self.get(soul, Some(reply));
        let leftover = match self.inner.state.lock().nodes.get_mut(soul) {
            Some(node) => node.set_end_query(end_query).err(),
            None => Some(end_query),
        };
        // The node went away before the query was recorded.
        if let Some(end_query) = leftover {
            end_query.unsubscribe();
        }
    }

    /// Drop one listener. The last one leaving ends the query and forgets
    /// the cached value.
    pub fn unlisten_soul(&self, soul: &str, id: ListenerId) {
        let end_query = {
            let mut guard = self.inner.state.lock();
            let GraphState { cache, nodes } = &mut *guard;
            let Some(node) = nodes.get_mut(soul) else {
                return;
            };
            node.remove_listener(id);
            if node.listener_count() > 0 {
                return;
            }
            cache.remove(soul);
            nodes.remove(soul).and_then(GraphNode::into_end_query)
        };

        if let Some(end_query) = end_query {
            end_query.unsubscribe();
        }
    }

    /// Follow `path` (root soul first) and report its terminal value
    /// whenever it resolves or changes.
    pub fn query(&self, path: Vec<String>, cb: QueryCallback) -> Unsubscribe {
        let query = PathQuery::start(self, path, QueryMode::Value(cb));
        Unsubscribe::new(move || query.end())
    }

    /// Souls traversed by `path` once it is fully resolved.
    pub async fn path_souls(&self, path: &[String]) -> Vec<String> {
        if path.len() <= 1 {
            return path.to_vec();
        }

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let query = PathQuery::start(
            self,
            path.to_vec(),
            QueryMode::Path(Arc::new(move |data: &PathData| {
                if data.complete
                    && let Some(tx) = tx.lock().take()
                {
                    let _ = tx.send(data.souls.clone());
                }
            })),
        );
        let souls = rx.await.unwrap_or_default();
        query.end();
        souls
    }

    /// Write `fields` onto the node at `path`, creating the missing
    /// intermediate nodes with souls from `uuid`.
    pub async fn put_path(
        &self,
        path: &[String],
        fields: BTreeMap<String, Value>,
        uuid: &UuidFn,
        cb: Option<MsgCallback>,
    ) -> Result<Unsubscribe> {
        if path.is_empty() {
            return Err(Error::Protocol("cannot write to an empty path".into()));
        }

        let souls = self.path_souls(path).await;
        let state = machine_state();
        let mut graph = GraphData::new();

        let mut target = souls.last().cloned().unwrap_or_else(|| path[0].clone());
        for depth in souls.len().max(1)..path.len() {
            let soul = uuid(&path[..=depth]);
            graph
                .entry(target.clone())
                .or_insert_with(|| Some(Node::new(target.clone())))
                .get_or_insert_with(|| Node::new(target.clone()))
                .set(path[depth].clone(), Value::edge(soul.clone()), state);
            target = soul;
        }

        let node = graph
            .entry(target.clone())
            .or_insert_with(|| Some(Node::new(target.clone())))
            .get_or_insert_with(|| Node::new(target.clone()));
        for (key, value) in fields {
            node.set(key, value, state);
        }

        Ok(self.put(graph, cb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collect() -> (Arc<Mutex<Vec<Option<Node>>>>, NodeListener) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let listener: NodeListener = Arc::new(move |node: Option<&Node>, _: &str| s.lock().push(node.cloned()));
        (seen, listener)
    }

    fn data(soul: &str, key: &str, value: &str, state: i64) -> GraphData {
        let mut g = GraphData::new();
        g.insert(soul.into(), Some(Node::new(soul).with(key, value, state)));
        g
    }

    #[test]
    fn test_first_listener_asks_once() {
        let graph = Graph::default();
        let asked = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&asked);
        graph.events().get.on(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });

        let (_, l1) = collect();
        let (_, l2) = collect();
        graph.listen_soul("A", ListenerId::next(), l1);
        graph.listen_soul("A", ListenerId::next(), l2);
        assert_eq!(asked.load(Ordering::SeqCst), 1);
        assert_eq!(graph.listener_count("A"), 2);
    }

    #[test]
    fn test_unwatched_data_is_not_cached() {
        let graph = Graph::default();
        graph.receive_graph_data(data("A", "x", "1", 1), None, None);
        assert_eq!(graph.cached("A"), None);
    }

    #[test]
    fn test_listener_receives_merged_node() {
        let graph = Graph::default();
        let (seen, listener) = collect();
        graph.listen_soul("A", ListenerId::next(), listener);

        graph.receive_graph_data(data("A", "x", "1", 1), None, None);
        graph.receive_graph_data(data("A", "y", "2", 1), None, None);
        // stale write is dropped by the CRDT before anyone sees it
        graph.receive_graph_data(data("A", "x", "0", 0), None, None);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        let last = seen[1].as_ref().unwrap();
        assert_eq!(last.get("x"), Some(&Value::from("1")));
        assert_eq!(last.get("y"), Some(&Value::from("2")));
    }

    #[test]
    fn test_last_listener_ends_query_and_evicts() {
        let graph = Graph::default();
        let offs = Arc::new(AtomicUsize::new(0));
        let o = Arc::clone(&offs);
        graph.events().off.on(move |_| {
            o.fetch_add(1, Ordering::SeqCst);
        });

        let (_, l1) = collect();
        let (_, l2) = collect();
        let (id1, id2) = (ListenerId::next(), ListenerId::next());
        graph.listen_soul("A", id1, l1);
        graph.listen_soul("A", id2, l2);
        graph.receive_graph_data(data("A", "x", "1", 1), None, None);

        graph.unlisten_soul("A", id1);
        assert!(graph.cached("A").is_some());
        assert_eq!(offs.load(Ordering::SeqCst), 0);

        graph.unlisten_soul("A", id2);
        assert_eq!(graph.cached("A"), None);
        assert!(!graph.is_watching("A"));
        assert_eq!(offs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_reply_marks_soul_absent() {
        let graph = Graph::default();
        let replies: Arc<Mutex<Vec<MsgCallback>>> = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&replies);
        graph.events().get.on(move |req: &GetRequest| {
            if let Some(cb) = &req.cb {
                r.lock().push(Arc::clone(cb));
            }
        });

        let (seen, listener) = collect();
        graph.listen_soul("A", ListenerId::next(), listener);
        let cb = replies.lock().pop().unwrap();
        cb(&Message::reply("whatever"));

        assert_eq!(graph.cached("A"), Some(None));
        assert_eq!(*seen.lock(), vec![None]);
    }

    #[test]
    fn test_write_veto_reports_rejection() {
        let graph = Graph::default();
        graph
            .write_middleware()
            .use_middleware(Arc::new(|_: GraphData, _: &GraphData| None));
        let sent = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&sent);
        graph.events().put.on(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&errors);
        graph.put(
            data("A", "x", "1", 1),
            Some(Arc::new(move |msg: &Message| e.lock().push(msg.err.clone()))),
        );

        assert_eq!(sent.load(Ordering::SeqCst), 0);
        assert_eq!(*errors.lock(), vec![Some("Write rejected".to_string())]);
    }

    #[test]
    fn test_put_stamps_missing_state() {
        let graph = Graph::default();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&sent);
        graph.events().put.on(move |req: &PutRequest| s.lock().push(req.graph.clone()));

        let mut g = GraphData::new();
        let mut node = Node::new("A");
        node.fields.insert("x".into(), Value::from(1));
        g.insert("A".into(), Some(node));
        graph.put(g, None);

        let sent = sent.lock();
        let node = sent[0]["A"].as_ref().unwrap();
        assert!(node.state_of("x").unwrap() > 0);
    }
}
