use crate::config::CrdtConfig;
use crate::connector::MsgCallback;
use crate::crdt::DiffOptions;
use crate::error::{Error, Result};
use crate::events::{ListenerId, Unsubscribe};
use crate::graph::{Graph, QueryValue};
use crate::types::Value;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Produces the soul of a node created while writing along `path`.
pub type UuidFn = Arc<dyn Fn(&[String]) -> String + Send + Sync>;

fn random_soul() -> UuidFn {
    Arc::new(|_: &[String]| uuid::Uuid::new_v4().to_string())
}

/// What a [`Link::put`] or [`Link::set`] writes.
#[derive(Clone)]
pub enum WriteValue {
    Scalar(Value),
    /// Edge to a known soul.
    Edge(String),
    /// Edge to whatever node another link resolves to.
    Chain(Link),
}

impl From<Value> for WriteValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Edge(edge) => WriteValue::Edge(edge.soul),
            value => WriteValue::Scalar(value),
        }
    }
}

macro_rules! scalar_from {
    ($($t:ty),*) => {
        $(impl From<$t> for WriteValue {
            fn from(value: $t) -> Self {
                WriteValue::Scalar(Value::from(value))
            }
        })*
    };
}

scalar_from!(&str, String, bool, i32, i64, u32, u64, usize, f64);

impl From<Link> for WriteValue {
    fn from(link: Link) -> Self {
        WriteValue::Chain(link)
    }
}

impl From<&Link> for WriteValue {
    fn from(link: &Link) -> Self {
        WriteValue::Chain(link.clone())
    }
}

/// Entry point of the chained query API.
#[derive(Clone)]
pub struct Client {
    graph: Graph,
    uuid: UuidFn,
}

impl Client {
    pub fn new(graph: Graph) -> Self {
        Self {
            graph,
            uuid: random_soul(),
        }
    }

    pub fn from_config(crdt: &CrdtConfig) -> Self {
        Self::new(Graph::new(DiffOptions::with_grace(crdt.future_grace_ms)))
    }

    /// Replace the generator used for souls of intermediate nodes.
    pub fn with_uuid(mut self, uuid: UuidFn) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Link rooted at `soul`.
    pub fn get(&self, soul: impl Into<String>) -> Link {
        self.link(vec![soul.into()])
    }

    pub fn link(&self, path: Vec<String>) -> Link {
        Link {
            client: self.clone(),
            path,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// A path through the graph, root soul first.
#[derive(Clone)]
pub struct Link {
    client: Client,
    path: Vec<String>,
    subscriptions: Arc<Mutex<Vec<(ListenerId, Unsubscribe)>>>,
}

impl Link {
    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn key(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    pub fn get(&self, key: impl Into<String>) -> Link {
        let mut path = self.path.clone();
        path.push(key.into());
        self.client.link(path)
    }

    /// The link `amount` steps up, if the path is that deep.
    pub fn back(&self, amount: usize) -> Option<Link> {
        let len = self.path.len().checked_sub(amount).filter(|len| *len > 0)?;
        Some(self.client.link(self.path[..len].to_vec()))
    }

    /// Watch the value at this path until [`Link::off`].
    pub fn on<F>(&self, cb: F) -> ListenerId
    where
        F: Fn(Option<&QueryValue>, &str) + Send + Sync + 'static,
    {
        let unsubscribe = self.client.graph.query(self.path.clone(), Arc::new(cb));
        let id = ListenerId::next();
        self.subscriptions.lock().push((id, unsubscribe));
        id
    }

    /// Stop every watch started through this link or its clones.
    pub fn off(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for (_, unsubscribe) in subscriptions {
            unsubscribe.unsubscribe();
        }
    }

    pub fn off_listener(&self, id: ListenerId) -> bool {
        let found = {
            let mut subscriptions = self.subscriptions.lock();
            subscriptions
                .iter()
                .position(|(sid, _)| *sid == id)
                .map(|idx| subscriptions.remove(idx))
        };
        match found {
            Some((_, unsubscribe)) => {
                unsubscribe.unsubscribe();
                true
            }
            None => false,
        }
    }

    /// First resolved value, or `None` if absent or nothing answered in `wait`.
    pub async fn once(&self, wait: Duration) -> Option<QueryValue> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let unsubscribe = self.client.graph.query(
            self.path.clone(),
            Arc::new(move |value: Option<&QueryValue>, _: &str| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(value.cloned());
                }
            }),
        );
        let value = tokio::time::timeout(wait, rx).await.ok().and_then(|r| r.ok()).flatten();
        unsubscribe.unsubscribe();
        value
    }

    /// Calls `cb` with the key when nothing exists at this path.
    pub async fn not<F>(&self, wait: Duration, cb: F)
    where
        F: FnOnce(&str),
    {
        if self.once(wait).await.is_none() {
            cb(self.key());
        }
    }

    /// Soul of the node this path resolves to.
    pub async fn soul(&self) -> Result<String> {
        let souls = self.client.graph.path_souls(&self.path).await;
        if souls.len() == self.path.len()
            && let Some(soul) = souls.last()
        {
            return Ok(soul.clone());
        }
        Err(Error::Protocol(format!("{} does not resolve to a node", self.path.join("."))))
    }

    async fn resolve(&self, value: WriteValue) -> Result<Value> {
        Ok(match value {
            WriteValue::Scalar(value) => value,
            WriteValue::Edge(soul) => Value::edge(soul),
            WriteValue::Chain(link) => Value::edge(link.soul().await?),
        })
    }

    /// Write `value` into the last key of this path.
    pub async fn put(&self, value: impl Into<WriteValue>, cb: Option<MsgCallback>) -> Result<Unsubscribe> {
        let Some((key, parent)) = self.path.split_last().filter(|(_, parent)| !parent.is_empty()) else {
            return Err(Error::Protocol("a root soul only accepts put_node".into()));
        };
        let value = self.resolve(value.into()).await?;
        let fields = BTreeMap::from([(key.clone(), value)]);
        self.client.graph.put_path(parent, fields, &self.client.uuid, cb).await
    }

    /// Merge `fields` into the node at this path, creating it if needed.
    pub async fn put_node<I, K, V>(&self, fields: I, cb: Option<MsgCallback>) -> Result<Unsubscribe>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<WriteValue>,
    {
        let mut resolved = BTreeMap::new();
        for (key, value) in fields {
            resolved.insert(key.into(), self.resolve(value.into()).await?);
        }
        self.client.graph.put_path(&self.path, resolved, &self.client.uuid, cb).await
    }

    /// Add `item` to the set at this path, keyed by the item's soul.
    pub async fn set(&self, item: impl Into<WriteValue>, cb: Option<MsgCallback>) -> Result<Unsubscribe> {
        let soul = match item.into() {
            WriteValue::Edge(soul) => soul,
            WriteValue::Chain(link) => link.soul().await?,
            WriteValue::Scalar(_) => return Err(Error::Protocol("set members must be nodes".into())),
        };
        let fields = BTreeMap::from([(soul.clone(), Value::edge(soul))]);
        self.client.graph.put_path(&self.path, fields, &self.client.uuid, cb).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let client = Client::new(Graph::default());
        let link = client.get("users").get("alice").get("name");
        assert_eq!(link.path(), ["users", "alice", "name"]);
        assert_eq!(link.key(), "name");
        assert_eq!(link.back(1).unwrap().path(), ["users", "alice"]);
        assert!(link.back(3).is_none());
    }

    #[test]
    fn test_write_value_conversions() {
        assert!(matches!(WriteValue::from("x"), WriteValue::Scalar(_)));
        assert!(matches!(WriteValue::from(Value::edge("A")), WriteValue::Edge(s) if s == "A"));
    }

    #[tokio::test]
    async fn test_root_put_is_refused() {
        let client = Client::new(Graph::default());
        assert!(client.get("A").put("x", None).await.is_err());
    }
}
