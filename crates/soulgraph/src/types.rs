use serde::{Deserialize, Deserializer, Serialize, de};
use std::collections::BTreeMap;
use std::fmt;

/// Last-write time of a field, in milliseconds.
pub type State = i64;

/// Soul -> node, or an explicit absence (`None`) for a soul known not to exist.
pub type GraphData = BTreeMap<String, Option<Node>>;

/// Append-only log of diffs, one field per event.
pub const CHANGELOG_SOUL: &str = "changelog";
/// Replication checkpoints, one field per peer name.
pub const PEERSYNC_SOUL: &str = "peersync";
/// Prefix of the per-peer staleness records.
pub const PEERS_PREFIX: &str = "peers/";

/// Soul of the staleness record kept for `peer`.
pub fn peer_soul(peer: &str) -> String {
    format!("{}{}", PEERS_PREFIX, peer)
}

/// Souls with protocol meaning that are never pulled from peers on read.
pub fn is_reserved_soul(soul: &str) -> bool {
    soul == CHANGELOG_SOUL || soul == PEERSYNC_SOUL || soul.starts_with(PEERS_PREFIX)
}

/// Current machine time in milliseconds since the epoch.
pub fn machine_state() -> State {
    chrono::Utc::now().timestamp_millis()
}

/// ISO-8601 rendering (UTC, millisecond precision) of a state.
///
/// Changelog keys start with this, so they sort by time.
pub fn iso_timestamp(ms: State) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Random identifier for wire messages.
pub fn generate_message_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Reference to another node: `{"#": soul}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    #[serde(rename = "#")]
    pub soul: String,
}

/// A field value: scalar, boolean, null, or an edge to another node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Edge(Edge),
}

impl Value {
    pub fn edge(soul: impl Into<String>) -> Self {
        Value::Edge(Edge { soul: soul.into() })
    }

    pub fn as_edge(&self) -> Option<&str> {
        match self {
            Value::Edge(edge) => Some(&edge.soul),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Canonical serialization used to break ties between equal-state writes.
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

macro_rules! number_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(n: $t) -> Self {
                Value::Number(n.into())
            }
        })*
    };
}

number_from!(i32, u32, u64, usize);

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

impl From<Edge> for Value {
    fn from(edge: Edge) -> Self {
        Value::Edge(edge)
    }
}

/// Node metadata: `{"#": soul, ">": {field: state}}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    #[serde(rename = "#", default)]
    pub soul: String,
    #[serde(rename = ">", default, deserialize_with = "de_state_vector")]
    pub state: BTreeMap<String, State>,
}

/// A soul's fields plus metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "_", default)]
    pub meta: NodeMeta,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Node {
    pub fn new(soul: impl Into<String>) -> Self {
        Self {
            meta: NodeMeta {
                soul: soul.into(),
                state: BTreeMap::new(),
            },
            fields: BTreeMap::new(),
        }
    }

    /// Builder form of [`Node::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>, state: State) -> Self {
        self.set(key, value, state);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>, state: State) {
        let key = key.into();
        self.meta.state.insert(key.clone(), state);
        self.fields.insert(key, value.into());
    }

    pub fn soul(&self) -> &str {
        &self.meta.soul
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn state_of(&self, key: &str) -> Option<State> {
        self.meta.state.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One changelog event: an ordering key and the diff recorded under it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSetEntry {
    pub key: String,
    pub diff: GraphData,
}

/// Partial-node read options.
///
/// `.` selects a single field; `>` and `<` bound a lexical range over field
/// names. Both range ends are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetOpts {
    #[serde(rename = ".", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(rename = ">", default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(rename = "<", default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl GetOpts {
    pub fn single(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn range(from: Option<String>, to: Option<String>) -> Self {
        Self {
            key: None,
            from,
            to,
        }
    }

    /// Lower and upper bound (inclusive). A single key bounds both ends.
    pub fn bounds(&self) -> (Option<&str>, Option<&str>) {
        match &self.key {
            Some(key) => (Some(key), Some(key)),
            None => (self.from.as_deref(), self.to.as_deref()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_none() && self.from.is_none() && self.to.is_none()
    }

    pub fn contains(&self, field: &str) -> bool {
        let (from, to) = self.bounds();
        from.is_none_or(|from| field >= from) && to.is_none_or(|to| field <= to)
    }

    /// Restrict a node to the fields selected by these options.
    pub fn filter(&self, node: &Node) -> Node {
        let mut result = Node::new(node.soul());
        for (key, value) in node.fields.iter().filter(|(k, _)| self.contains(k)) {
            if let Some(state) = node.state_of(key) {
                result.meta.state.insert(key.clone(), state);
            }
            result.fields.insert(key.clone(), value.clone());
        }
        result
    }
}

/// Body of a get request: `{"#": soul, ".": key}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetBody {
    #[serde(rename = "#")]
    pub soul: String,
    #[serde(rename = ".", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Wire message. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "#", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "@", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<GetBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub put: Option<GraphData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(
        default,
        deserialize_with = "de_ack",
        skip_serializing_if = "Option::is_none"
    )]
    pub ok: Option<bool>,
}

impl Message {
    pub fn get(soul: impl Into<String>) -> Self {
        Self {
            get: Some(GetBody {
                soul: soul.into(),
                key: None,
            }),
            ..Default::default()
        }
    }

    pub fn put(graph: GraphData) -> Self {
        Self {
            put: Some(graph),
            ..Default::default()
        }
    }

    pub fn reply(to: impl Into<String>) -> Self {
        Self {
            id: Some(generate_message_id()),
            reply_to: Some(to.into()),
            ..Default::default()
        }
    }

    pub fn error(to: Option<String>, err: impl Into<String>) -> Self {
        Self {
            id: Some(generate_message_id()),
            reply_to: to,
            err: Some(err.into()),
            ok: Some(false),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.err.is_some()
    }
}

/// Decode a wire frame holding one message or an array of messages.
pub fn decode_frame(text: &str) -> serde_json::Result<Vec<Message>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Frame {
        Batch(Vec<Message>),
        Single(Box<Message>),
    }

    Ok(match serde_json::from_str::<Frame>(text)? {
        Frame::Batch(msgs) => msgs,
        Frame::Single(msg) => vec![*msg],
    })
}

fn de_state_vector<'de, D>(deserializer: D) -> Result<BTreeMap<String, State>, D::Error>
where
    D: Deserializer<'de>,
{
    // States are whole milliseconds. Truncating a fractional state would
    // reorder writes that differ below a millisecond, so those are refused.
    let raw = BTreeMap::<String, serde_json::Number>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, n)| {
            let state = n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && *f >= State::MIN as f64 && *f <= State::MAX as f64)
                    .map(|f| f as State)
            });
            match state {
                Some(state) => Ok((key, state)),
                None => Err(<D::Error as de::Error>::custom(format!(
                    "state of {} is not a whole millisecond: {}",
                    key, n
                ))),
            }
        })
        .collect()
}

fn de_ack<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Bool(b)) => Some(b),
        Some(serde_json::Value::Number(n)) => Some(n.as_f64().is_some_and(|f| f != 0.0)),
        Some(_) => Some(true),
    })
}
