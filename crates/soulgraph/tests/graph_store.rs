use soulgraph::connector::MsgCallback;
use soulgraph::graph::UuidFn;
use soulgraph::storage::SyncGraphAdapter;
use soulgraph::{
    AdapterConnector, Client, Graph, GraphData, MemoryAdapter, Message, Node, QueryValue, Value,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn single(node: Node) -> GraphData {
    let mut graph = GraphData::new();
    graph.insert(node.soul().to_string(), Some(node));
    graph
}

/// Graph store backed by an in-memory adapter, seeded with `nodes`.
fn store(nodes: Vec<Node>) -> (Graph, Arc<MemoryAdapter>) {
    init_tracing();
    let memory = Arc::new(MemoryAdapter::new());
    for node in nodes {
        memory.put_sync(&single(node)).unwrap();
    }
    let graph = Graph::default();
    graph.connect(Arc::new(AdapterConnector::new("memory", memory.clone())));
    (graph, memory)
}

fn path(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

fn sequential_souls() -> UuidFn {
    Arc::new(|path: &[String]| format!("gen/{}", path.join("/")))
}

fn ack_channel() -> (MsgCallback, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cb: MsgCallback = Arc::new(move |msg: &Message| {
        let _ = tx.send(msg.clone());
    });
    (cb, rx)
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv()).await.expect("timed out").expect("channel closed")
}

#[tokio::test]
async fn test_query_resolves_through_edges() {
    let (graph, _memory) = store(vec![
        Node::new("alice").with("friend", Value::edge("bob"), 1),
        Node::new("bob").with("name", "Bob", 1),
    ]);
    let client = Client::new(graph);

    let name = client.get("alice").get("friend").get("name").once(WAIT).await;
    assert_eq!(name, Some(QueryValue::Value(Value::from("Bob"))));

    let friend = client.get("alice").get("friend").once(WAIT).await.unwrap();
    assert_eq!(friend.as_node().map(Node::soul), Some("bob"));
}

#[tokio::test]
async fn test_missing_path_resolves_to_none() {
    let (graph, _memory) = store(vec![Node::new("alice").with("name", "Alice", 1)]);
    let client = Client::new(graph);

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .get("alice")
        .get("nickname")
        .not(WAIT, move |key| {
            let _ = tx.send(key.to_string());
        })
        .await;
    assert_eq!(rx.try_recv().unwrap(), "nickname");

    assert!(client.get("nobody").get("name").once(WAIT).await.is_none());
}

#[tokio::test]
async fn test_query_follows_changed_edge() {
    let (graph, _memory) = store(vec![
        Node::new("alice").with("friend", Value::edge("bob"), 1),
        Node::new("bob").with("name", "Bob", 1),
        Node::new("carol").with("name", "Carol", 1),
    ]);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let stop = graph.query(
        path(&["alice", "friend", "name"]),
        Arc::new(move |value: Option<&QueryValue>, _: &str| {
            let _ = tx.send(value.cloned());
        }),
    );
    assert_eq!(next(&mut rx).await, Some(QueryValue::Value(Value::from("Bob"))));
    assert!(graph.is_watching("bob"));

    graph.put(single(Node::new("alice").with("friend", Value::edge("carol"), 2)), None);
    assert_eq!(next(&mut rx).await, Some(QueryValue::Value(Value::from("Carol"))));
    assert!(!graph.is_watching("bob"));
    assert!(graph.is_watching("carol"));

    stop.unsubscribe();
    assert!(!graph.is_watching("alice"));
    assert!(!graph.is_watching("carol"));
}

#[tokio::test]
async fn test_listeners_share_one_subscription() {
    let (graph, _memory) = store(vec![Node::new("alice").with("name", "Alice", 1)]);
    let client = Client::new(graph.clone());

    let first = client.get("alice").get("name");
    let second = client.get("alice");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let tx2 = tx.clone();
    first.on(move |v, _| {
        let _ = tx.send(v.cloned());
    });
    second.on(move |v, _| {
        let _ = tx2.send(v.cloned());
    });
    next(&mut rx).await;
    next(&mut rx).await;
    assert_eq!(graph.listener_count("alice"), 2);

    first.off();
    assert_eq!(graph.listener_count("alice"), 1);
    assert!(graph.cached("alice").is_some());

    second.off();
    assert!(!graph.is_watching("alice"));
    assert!(graph.cached("alice").is_none());
}

#[tokio::test]
async fn test_put_reaches_adapter_and_acks() {
    let (graph, memory) = store(vec![]);
    let (cb, mut acks) = ack_channel();

    graph.put(single(Node::new("A").with("a", 1, 1)), Some(cb));
    let ack = next(&mut acks).await;
    assert_eq!(ack.ok, Some(true));
    assert!(!ack.is_error());
    assert_eq!(memory.snapshot()["A"].as_ref().unwrap().get("a"), Some(&Value::from(1)));
}

#[tokio::test]
async fn test_write_middleware_can_veto() {
    let (graph, memory) = store(vec![]);
    graph
        .write_middleware()
        .use_middleware(Arc::new(|diff: GraphData, _: &GraphData| {
            (!diff.contains_key("forbidden")).then_some(diff)
        }));

    let (cb, mut acks) = ack_channel();
    graph.put(single(Node::new("forbidden").with("a", 1, 1)), Some(cb));
    let ack = next(&mut acks).await;
    assert_eq!(ack.err.as_deref(), Some("Write rejected"));
    assert!(memory.snapshot().get("forbidden").is_none());
}

#[tokio::test]
async fn test_read_middleware_transforms_inbound_data() {
    let (graph, _memory) = store(vec![Node::new("alice").with("name", "alice", 1)]);
    graph
        .read_middleware()
        .use_middleware(Arc::new(|mut diff: GraphData, _: &GraphData| {
            for node in diff.values_mut().flatten() {
                for value in node.fields.values_mut() {
                    let upper = value.as_str().map(str::to_uppercase);
                    if let Some(upper) = upper {
                        *value = Value::from(upper);
                    }
                }
            }
            Some(diff)
        }));

    let value = Client::new(graph).get("alice").get("name").once(WAIT).await;
    assert_eq!(value, Some(QueryValue::Value(Value::from("ALICE"))));
}

#[tokio::test]
async fn test_put_path_creates_intermediate_nodes() {
    let (graph, memory) = store(vec![]);
    let client = Client::new(graph).with_uuid(sequential_souls());

    let (cb, mut acks) = ack_channel();
    client
        .get("users")
        .get("alice")
        .get("address")
        .put_node([("city", "Paris")], Some(cb))
        .await
        .unwrap();
    assert_eq!(next(&mut acks).await.ok, Some(true));

    let snapshot = memory.snapshot();
    let users = snapshot["users"].as_ref().unwrap();
    assert_eq!(users.get("alice").and_then(Value::as_edge), Some("gen/users/alice"));
    let alice = snapshot["gen/users/alice"].as_ref().unwrap();
    assert_eq!(
        alice.get("address").and_then(Value::as_edge),
        Some("gen/users/alice/address")
    );
    let address = snapshot["gen/users/alice/address"].as_ref().unwrap();
    assert_eq!(address.get("city"), Some(&Value::from("Paris")));

    // An existing path is reused rather than re-created.
    let (cb, mut acks) = ack_channel();
    client
        .get("users")
        .get("alice")
        .get("address")
        .get("zip")
        .put("75001", Some(cb))
        .await
        .unwrap();
    next(&mut acks).await;
    let snapshot = memory.snapshot();
    assert_eq!(
        snapshot["gen/users/alice/address"].as_ref().unwrap().get("zip"),
        Some(&Value::from("75001"))
    );
    assert_eq!(snapshot.len(), 3);
}

#[tokio::test]
async fn test_set_links_members_by_soul() {
    let (graph, memory) = store(vec![
        Node::new("team").with("name", "core", 1),
        Node::new("bob").with("name", "Bob", 1),
    ]);
    let client = Client::new(graph);

    let (cb, mut acks) = ack_channel();
    client
        .get("team")
        .get("members")
        .set(&client.get("bob"), Some(cb))
        .await
        .unwrap();
    next(&mut acks).await;

    let soul = client.get("team").get("members").soul().await.unwrap();
    let members = memory.snapshot()[&soul].clone().unwrap();
    assert_eq!(members.get("bob").and_then(Value::as_edge), Some("bob"));

    assert!(client.get("team").set("plain", None).await.is_err());
}

#[tokio::test]
async fn test_root_link_rejects_scalar_put() {
    let (graph, _memory) = store(vec![]);
    let client = Client::new(graph);
    assert!(client.get("root").put("value", None).await.is_err());
}

#[tokio::test]
async fn test_disconnect_stops_requests() {
    let (graph, _memory) = store(vec![Node::new("alice").with("name", "Alice", 1)]);
    assert!(graph.disconnect("memory"));
    assert_eq!(graph.connector_count(), 0);

    let value = Client::new(graph).get("alice").get("name").once(Duration::from_millis(200)).await;
    assert!(value.is_none());
}
