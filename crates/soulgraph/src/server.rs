use crate::config::{Config, load_peers};
use crate::crdt::DiffOptions;
use crate::error::Result;
use crate::federation::{FederatedAdapter, FederatedOptions, PeerSet};
use crate::http::{AppState, HttpAdapter, serve};
use crate::storage::{GraphAdapter, SqliteAdapter};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

/// A full node: SQLite store, federation with its peers, HTTP surface.
pub struct Server {
    config: Config,
    storage: Arc<SqliteAdapter>,
    federation: FederatedAdapter,
}

impl Server {
    /// Open storage and build peer adapters. Failing to open storage is fatal.
    pub fn open(config: Config) -> Result<Self> {
        let db_path = &config.server.db_path;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening database at: {:?}", db_path);
        let storage = Arc::new(SqliteAdapter::open(
            db_path,
            &config.storage,
            DiffOptions::with_grace(config.crdt.future_grace_ms),
        )?);

        let timeout = Duration::from_millis(config.federation.peer_timeout_ms);
        let mut peers = PeerSet::new();
        for url in load_peers(&config.federation.peers_file)? {
            let adapter: Arc<dyn GraphAdapter> =
                Arc::new(HttpAdapter::new(&url, timeout)?.as_peer(config.server.name.as_str()));
            peers.insert(url, adapter);
        }

        let internal: Arc<dyn GraphAdapter> = storage.clone();
        let federation = FederatedAdapter::new(
            internal,
            None,
            peers,
            FederatedOptions::from_config(&config.federation, &config.crdt),
        );

        Ok(Self {
            config,
            storage,
            federation,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Arc<SqliteAdapter> {
        &self.storage
    }

    pub fn federation(&self) -> &FederatedAdapter {
        &self.federation
    }

    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.server.http_addr).await?;
        self.run(listener).await
    }

    /// Serve on `listener` while following peers and pruning the changelog.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        let state = AppState::new(
            Arc::new(self.federation.clone()),
            Duration::from_millis(self.config.server.sse_keepalive_ms),
        )
        .with_local(Arc::clone(self.federation.internal()));
        let http = tokio::spawn(serve(listener, state));

        let connections = self.federation.connect_to_peers().await;
        let sync = self.federation.spawn_sync_loop();
        let prune = self.federation.spawn_prune_loop();
        info!(
            name = %self.config.server.name,
            peers = self.federation.peers().len(),
            live = connections.len(),
            "Node running"
        );

        let result = match http.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e).into()),
        };
        sync.abort();
        prune.abort();
        drop(connections);
        result
    }
}
