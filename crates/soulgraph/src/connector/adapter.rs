use crate::connector::{ConnectorCore, GetRequest, GraphConnector, PutRequest};
use crate::events::Unsubscribe;
use crate::storage::GraphAdapter;
use crate::types::{GetOpts, GraphData, Message};
use std::sync::Arc;
use tracing::warn;

/// Exposes a [`GraphAdapter`] to the graph store as a connector.
///
/// Requests run on the Tokio runtime; replies come back through the input
/// queue exactly as they would from a remote peer.
pub struct AdapterConnector {
    core: Arc<ConnectorCore>,
    adapter: Arc<dyn GraphAdapter>,
}

impl AdapterConnector {
    pub fn new(name: impl Into<String>, adapter: Arc<dyn GraphAdapter>) -> Self {
        let core = ConnectorCore::new(name);
        core.set_connected(true, |_| {});
        Self {
            core: Arc::new(core),
            adapter,
        }
    }

    pub fn adapter(&self) -> &Arc<dyn GraphAdapter> {
        &self.adapter
    }
}

impl GraphConnector for AdapterConnector {
    fn core(&self) -> &ConnectorCore {
        &self.core
    }

    fn get(&self, req: GetRequest) -> Unsubscribe {
        if let Some(cb) = req.cb {
            self.core.register(&req.msg_id, cb);
        }

        let core = Arc::clone(&self.core);
        let adapter = Arc::clone(&self.adapter);
        let (soul, key, msg_id) = (req.soul, req.key, req.msg_id.clone());
        tokio::spawn(async move {
            let opts = key.map(GetOpts::single);
            let reply = match adapter.get(&soul, opts.as_ref()).await {
                Ok(node) => {
                    let mut msg = Message::reply(msg_id);
                    if let Some(node) = node {
                        let mut put = GraphData::new();
                        put.insert(soul, Some(node));
                        msg.put = Some(put);
                    }
                    msg
                }
                Err(e) => {
                    warn!(soul = %soul, "Adapter get failed: {}", e);
                    Message::error(Some(msg_id), "Error fetching node")
                }
            };
            core.ingest(vec![reply]);
        });

        self.core.unsubscribe_handle(req.msg_id)
    }

    fn put(&self, req: PutRequest) -> Unsubscribe {
        if let Some(cb) = req.cb {
            self.core.register(&req.msg_id, cb);
        }

        let core = Arc::clone(&self.core);
        let adapter = Arc::clone(&self.adapter);
        let (graph, msg_id) = (req.graph, req.msg_id.clone());
        tokio::spawn(async move {
            let reply = match adapter.put(&graph).await {
                Ok(_) => {
                    let mut msg = Message::reply(msg_id);
                    msg.ok = Some(true);
                    msg
                }
                Err(e) => {
                    warn!("Adapter put failed: {}", e);
                    Message::error(Some(msg_id), "Error saving put")
                }
            };
            core.ingest(vec![reply]);
        });

        self.core.unsubscribe_handle(req.msg_id)
    }
}
