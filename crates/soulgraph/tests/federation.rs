use async_trait::async_trait;
use soulgraph::federation::changelog_key;
use soulgraph::storage::SyncGraphAdapter;
use soulgraph::types::CHANGELOG_SOUL;
use soulgraph::{
    Error, FederatedAdapter, FederatedOptions, GetOpts, GraphAdapter, GraphData, MemoryAdapter, Node, PeerSet,
    Result, Value,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn single(node: Node) -> GraphData {
    let mut graph = GraphData::new();
    graph.insert(node.soul().to_string(), Some(node));
    graph
}

fn options() -> FederatedOptions {
    FederatedOptions {
        max_staleness: Duration::from_secs(3600),
        batch_interval: Duration::ZERO,
        sync_interval: Duration::from_millis(50),
        ..FederatedOptions::default()
    }
}

fn federated(peers: PeerSet, opts: FederatedOptions) -> (FederatedAdapter, Arc<MemoryAdapter>) {
    init_tracing();
    let memory = Arc::new(MemoryAdapter::new());
    let adapter = FederatedAdapter::new(memory.clone(), None, peers, opts);
    (adapter, memory)
}

fn one_peer(name: &str, peer: Arc<dyn GraphAdapter>) -> PeerSet {
    PeerSet::from([(name.to_string(), peer)])
}

async fn field(adapter: &dyn GraphAdapter, soul: &str, key: &str) -> Option<Value> {
    adapter
        .get(soul, Some(&GetOpts::single(key)))
        .await
        .unwrap()
        .and_then(|node| node.get(key).cloned())
}

/// Poll `adapter` until `soul.key` equals `expected`.
async fn eventually(adapter: &dyn GraphAdapter, soul: &str, key: &str, expected: Value) {
    let found = timeout(WAIT, async {
        loop {
            if field(adapter, soul, key).await.as_ref() == Some(&expected) {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(found.is_ok(), "{}.{} never became {}", soul, key, expected);
}

/// Memory adapter that counts reads and answers slowly.
struct SlowPeer {
    inner: MemoryAdapter,
    reads: AtomicUsize,
}

impl SlowPeer {
    fn new() -> Self {
        Self {
            inner: MemoryAdapter::new(),
            reads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl GraphAdapter for SlowPeer {
    async fn get(&self, soul: &str, opts: Option<&GetOpts>) -> Result<Option<Node>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(50)).await;
        self.inner.get(soul, opts).await
    }

    async fn put(&self, graph: &GraphData) -> Result<Option<GraphData>> {
        self.inner.put(graph).await
    }
}

/// Memory adapter that counts the writes it receives.
struct RecordingPeer {
    inner: MemoryAdapter,
    puts: AtomicUsize,
}

#[async_trait]
impl GraphAdapter for RecordingPeer {
    async fn get(&self, soul: &str, opts: Option<&GetOpts>) -> Result<Option<Node>> {
        self.inner.get(soul, opts).await
    }

    async fn put(&self, graph: &GraphData) -> Result<Option<GraphData>> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(graph).await
    }
}

/// Peer whose reads always fail.
#[derive(Default)]
struct UnreachablePeer {
    reads: AtomicUsize,
}

#[async_trait]
impl GraphAdapter for UnreachablePeer {
    async fn get(&self, _soul: &str, _opts: Option<&GetOpts>) -> Result<Option<Node>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Err(Error::Remote {
            status: 503,
            url: "http://unreachable".into(),
        })
    }

    async fn put(&self, _graph: &GraphData) -> Result<Option<GraphData>> {
        Err(Error::Closed)
    }
}

async fn changelog_len(node: &FederatedAdapter) -> usize {
    let mut feed = node.changeset_feed("");
    let mut count = 0;
    while feed.next().await.unwrap().is_some() {
        count += 1;
    }
    count
}

/// Peer whose changelog holds `diffs` in the given order.
fn peer_with_changelog(diffs: &[GraphData]) -> Arc<MemoryAdapter> {
    let peer = Arc::new(MemoryAdapter::new());
    let mut log = Node::new(CHANGELOG_SOUL);
    for (i, diff) in diffs.iter().enumerate() {
        let at = 1_000 + i as i64;
        log.set(changelog_key(at, 0), serde_json::to_string(diff).unwrap(), at);
    }
    peer.put_sync(&single(log)).unwrap();
    peer
}

#[tokio::test]
async fn test_reads_pull_stale_souls_from_peers() {
    let peer = Arc::new(MemoryAdapter::new());
    peer.put_sync(&single(Node::new("X").with("v", 1, 1))).unwrap();
    let (node, _) = federated(one_peer("a", peer.clone()), options());

    assert_eq!(field(&node, "X", "v").await, Some(Value::from(1)));

    // Pulled recently, so the newer remote value is not fetched yet.
    peer.put_sync(&single(Node::new("X").with("v", 2, 2))).unwrap();
    assert_eq!(field(&node, "X", "v").await, Some(Value::from(1)));

    let (eager, _) = federated(
        one_peer("a", peer.clone()),
        FederatedOptions {
            max_staleness: Duration::ZERO,
            ..options()
        },
    );
    assert_eq!(field(&eager, "X", "v").await, Some(Value::from(2)));
}

#[tokio::test]
async fn test_pull_status_is_recorded_per_peer() {
    let peer = Arc::new(MemoryAdapter::new());
    let (node, memory) = federated(one_peer("a", peer), options());

    assert!(node.get("missing", None).await.unwrap().is_none());
    let status = memory.snapshot()["peers/a"].clone().unwrap();
    assert_eq!(status.get("missing").and_then(Value::as_bool), Some(false));
    assert!(status.state_of("missing").is_some());
}

#[tokio::test]
async fn test_concurrent_reads_pull_once() {
    let peer = Arc::new(SlowPeer::new());
    peer.put(&single(Node::new("X").with("v", 1, 1))).await.unwrap();
    let (node, _) = federated(one_peer("a", peer.clone()), options());

    let reads = (0..8).map(|_| {
        let node = node.clone();
        tokio::spawn(async move { field(&node, "X", "v").await })
    });
    for read in futures::future::join_all(reads).await {
        assert_eq!(read.unwrap(), Some(Value::from(1)));
    }
    assert_eq!(peer.reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_writes_are_logged_and_replayed() {
    let (node, _) = federated(PeerSet::new(), options());

    node.put(&single(Node::new("A").with("v", 1, 1))).await.unwrap();
    node.put(&single(Node::new("B").with("v", 1, 1))).await.unwrap();
    // No change, no entry.
    node.put(&single(Node::new("B").with("v", 1, 1))).await.unwrap();

    let mut feed = node.changeset_feed("");
    let first = feed.next().await.unwrap().unwrap();
    let second = feed.next().await.unwrap().unwrap();
    assert!(feed.next().await.unwrap().is_none());
    assert!(first.key < second.key);
    assert!(first.diff.contains_key("A"));
    assert!(second.diff.contains_key("B"));

    // Resume after the first entry, then keep following live writes.
    let mut changes = node.on_change(Some(first.key.as_str())).unwrap();
    let replayed = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    assert_eq!(replayed.key, second.key);

    node.put(&single(Node::new("C").with("v", 1, 1))).await.unwrap();
    let live = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    assert!(live.key > second.key);
    assert!(live.diff.contains_key("C"));
}

#[tokio::test]
async fn test_sync_with_peer_catches_up_and_checkpoints() {
    let (origin, _) = federated(PeerSet::new(), options());
    origin.put(&single(Node::new("A").with("v", "one", 1))).await.unwrap();
    origin.put(&single(Node::new("B").with("v", "two", 1))).await.unwrap();

    let (replica, _) = federated(one_peer("origin", Arc::new(origin.clone())), options());
    let last = replica.sync_with_peer("origin", "").await.unwrap();

    assert_eq!(replica.checkpoint("origin").await.unwrap(), Some(last.clone()));
    assert_eq!(field(replica.internal().as_ref(), "A", "v").await, Some(Value::from("one")));
    assert_eq!(field(replica.internal().as_ref(), "B", "v").await, Some(Value::from("two")));

    // Nothing new: the checkpoint stays where it was.
    assert_eq!(replica.sync_with_peer("origin", &last).await.unwrap(), last);
    assert!(replica.sync_with_peer("nobody", "").await.is_err());
}

#[tokio::test]
async fn test_conflicting_writes_converge_after_sync() {
    let (left, _) = federated(PeerSet::new(), options());
    let (right, _) = federated(PeerSet::new(), options());

    left.put(&single(Node::new("doc").with("title", "left", 10).with("body", "old", 1)))
        .await
        .unwrap();
    right
        .put(&single(Node::new("doc").with("title", "right", 5).with("body", "new", 2)))
        .await
        .unwrap();

    let (left_view, _) = federated(one_peer("right", Arc::new(right.clone())), options());
    let (right_view, _) = federated(one_peer("left", Arc::new(left.clone())), options());
    // Each view starts from its own side's data, then pulls the other's log.
    for (view, own) in [(&left_view, &left), (&right_view, &right)] {
        let mut feed = own.changeset_feed("");
        while let Some(entry) = feed.next().await.unwrap() {
            view.internal().put(&entry.diff).await.unwrap();
        }
    }
    left_view.sync_with_peer("right", "").await.unwrap();
    right_view.sync_with_peer("left", "").await.unwrap();

    for view in [&left_view, &right_view] {
        let doc = view.internal().get("doc", None).await.unwrap().unwrap();
        assert_eq!(doc.get("title"), Some(&Value::from("left")));
        assert_eq!(doc.get("body"), Some(&Value::from("new")));
    }
}

#[tokio::test]
async fn test_connected_peer_streams_live_writes() {
    let (origin, _) = federated(PeerSet::new(), options());
    origin.put(&single(Node::new("A").with("v", 1, 1))).await.unwrap();

    let (replica, _) = federated(one_peer("origin", Arc::new(origin.clone())), options());
    let connection = replica.connect_to_peer("origin", String::new()).unwrap();
    eventually(replica.internal().as_ref(), "A", "v", Value::from(1)).await;

    origin.put(&single(Node::new("A").with("v", 2, 2))).await.unwrap();
    origin.put(&single(Node::new("B").with("v", 3, 3))).await.unwrap();
    eventually(replica.internal().as_ref(), "A", "v", Value::from(2)).await;
    eventually(replica.internal().as_ref(), "B", "v", Value::from(3)).await;
    assert!(replica.checkpoint("origin").await.unwrap().is_some());

    assert_eq!(connection.name(), "origin");
    assert!(!connection.is_finished());
    connection.disconnect();

    // Unfollowed peers no longer feed the replica.
    origin.put(&single(Node::new("C").with("v", 4, 4))).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert!(field(replica.internal().as_ref(), "C", "v").await.is_none());
}

#[tokio::test]
async fn test_batched_sync_flushes_on_interval() {
    let (origin, _) = federated(PeerSet::new(), options());
    let (replica, _) = federated(
        one_peer("origin", Arc::new(origin.clone())),
        FederatedOptions {
            batch_interval: Duration::from_millis(100),
            ..options()
        },
    );
    let _connection = replica.connect_to_peer("origin", String::new()).unwrap();

    for i in 0..5 {
        origin
            .put(&single(Node::new("counter").with("v", i, i as i64 + 1)))
            .await
            .unwrap();
    }
    eventually(replica.internal().as_ref(), "counter", "v", Value::from(4)).await;
}

#[tokio::test]
async fn test_put_to_peers_forwards_writes() {
    let peer = Arc::new(MemoryAdapter::new());
    let (node, _) = federated(
        one_peer("a", peer.clone()),
        options().with_put_to_peers(true),
    );

    node.put(&single(Node::new("A").with("v", 1, 1))).await.unwrap();
    assert_eq!(peer.snapshot()["A"].as_ref().unwrap().get("v"), Some(&Value::from(1)));
}

#[tokio::test]
async fn test_prune_drops_old_changelog_entries() {
    let (node, _) = federated(PeerSet::new(), options());
    node.put(&single(Node::new("A").with("v", 1, 1))).await.unwrap();

    node.prune_changelog(soulgraph::types::machine_state() + 1_000).await.unwrap();
    let mut feed = node.changeset_feed("");
    assert!(feed.next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_pulled_diff_is_forwarded_to_other_peers_only() {
    let source = Arc::new(RecordingPeer {
        inner: MemoryAdapter::new(),
        puts: AtomicUsize::new(0),
    });
    source.inner.put_sync(&single(Node::new("X").with("v", 1, 1))).unwrap();
    let other = Arc::new(MemoryAdapter::new());
    let peers = PeerSet::from([
        ("a".to_string(), source.clone() as Arc<dyn GraphAdapter>),
        ("b".to_string(), other.clone() as Arc<dyn GraphAdapter>),
    ]);
    let (node, _) = federated(peers, options().with_put_to_peers(true));

    assert_eq!(field(&node, "X", "v").await, Some(Value::from(1)));
    assert_eq!(other.snapshot()["X"].as_ref().unwrap().get("v"), Some(&Value::from(1)));
    assert_eq!(source.puts.load(Ordering::SeqCst), 0);
    assert_eq!(changelog_len(&node).await, 1);
}

#[tokio::test]
async fn test_concurrent_pulls_of_one_soul_log_once() {
    let a = Arc::new(MemoryAdapter::new());
    let b = Arc::new(MemoryAdapter::new());
    let doc = Node::new("A").with("v", "same", 7);
    a.put_sync(&single(doc.clone())).unwrap();
    b.put_sync(&single(doc.clone())).unwrap();
    let peers = PeerSet::from([
        ("a".to_string(), a.clone() as Arc<dyn GraphAdapter>),
        ("b".to_string(), b.clone() as Arc<dyn GraphAdapter>),
    ]);
    let (node, _) = federated(peers, options());

    let reads = (0..4).map(|_| {
        let node = node.clone();
        tokio::spawn(async move { field(&node, "A", "v").await })
    });
    for read in futures::future::join_all(reads).await {
        assert_eq!(read.unwrap(), Some(Value::from("same")));
    }

    assert_eq!(changelog_len(&node).await, 1);
    let stored = node.internal().get("A", None).await.unwrap().unwrap();
    assert_eq!(stored, a.get("A", None).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_catch_up_order_does_not_change_result() {
    let diffs = vec![
        single(Node::new("doc").with("title", "first", 10)),
        single(Node::new("doc").with("title", "second", 20).with("body", "x", 5)),
        single(Node::new("doc").with("body", "y", 5)),
        single(Node::new("other").with("v", 1, 1)),
    ];
    let mut reversed = diffs.clone();
    reversed.reverse();

    let mut results = Vec::new();
    for order in [diffs, reversed] {
        let (replica, _) = federated(one_peer("origin", peer_with_changelog(&order)), options());
        replica.sync_with_peer("origin", "").await.unwrap();
        let doc = replica.internal().get("doc", None).await.unwrap().unwrap();
        let other = replica.internal().get("other", None).await.unwrap().unwrap();
        results.push((doc, other));
    }

    assert_eq!(results[0], results[1]);
    let (doc, _) = &results[0];
    assert_eq!(doc.get("title"), Some(&Value::from("second")));
    assert_eq!(doc.get("body"), Some(&Value::from("y")));
}

#[tokio::test]
async fn test_failed_pull_waits_for_staleness() {
    let peer = Arc::new(UnreachablePeer::default());
    let (node, _) = federated(one_peer("down", peer.clone()), options());

    assert!(node.get("X", None).await.unwrap().is_none());
    assert!(node.get("X", None).await.unwrap().is_none());
    assert_eq!(peer.reads.load(Ordering::SeqCst), 1);
}
