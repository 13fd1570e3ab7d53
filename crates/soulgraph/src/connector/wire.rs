use crate::connector::{ConnectorCore, GetRequest, GraphConnector, MsgCallback, PutRequest, WireTransport};
use crate::events::Unsubscribe;
use crate::types::{GetBody, Message, decode_frame, generate_message_id};
use std::sync::Arc;
use tracing::{debug, warn};

/// Connector speaking the JSON wire protocol over a [`WireTransport`].
///
/// Starts disconnected; output queues until [`WireConnector::connect`].
pub struct WireConnector {
    core: ConnectorCore,
    transport: Arc<dyn WireTransport>,
}

impl WireConnector {
    pub fn new(name: impl Into<String>, transport: Arc<dyn WireTransport>) -> Self {
        Self {
            core: ConnectorCore::new(name),
            transport,
        }
    }

    pub fn connect(&self) {
        self.core.set_connected(true, |msg| self.transmit(msg));
    }

    pub fn disconnect(&self) {
        self.core.set_connected(false, |_| {});
    }

    fn transmit(&self, msg: Message) {
        if let Err(e) = self.transport.transmit(&msg) {
            warn!(connector = %self.core.name(), id = ?msg.id, "Failed to transmit message: {}", e);
        }
    }

    /// Send a request, routing replies to `cb` until unsubscribed.
    pub fn req(&self, mut msg: Message, cb: Option<MsgCallback>) -> Unsubscribe {
        let id = msg.id.get_or_insert_with(generate_message_id).clone();
        if let Some(cb) = cb {
            self.core.register(&id, cb);
        }
        self.core.send(vec![msg], |m| self.transmit(m));
        self.core.unsubscribe_handle(id)
    }

    pub fn ingest(&self, msgs: Vec<Message>) {
        self.core.ingest(msgs);
    }

    /// Ingest a raw frame: a single message or an array of them.
    pub fn ingest_frame(&self, text: &str) {
        match decode_frame(text) {
            Ok(msgs) => self.core.ingest(msgs),
            Err(e) => debug!(connector = %self.core.name(), "Dropping malformed frame: {}", e),
        }
    }
}

impl GraphConnector for WireConnector {
    fn core(&self) -> &ConnectorCore {
        &self.core
    }

    fn get(&self, req: GetRequest) -> Unsubscribe {
        let msg = Message {
            id: Some(req.msg_id),
            get: Some(GetBody {
                soul: req.soul,
                key: req.key,
            }),
            ..Default::default()
        };
        self.req(msg, req.cb)
    }

    fn put(&self, req: PutRequest) -> Unsubscribe {
        let msg = Message {
            id: Some(req.msg_id),
            reply_to: req.reply_to,
            put: Some(req.graph),
            ..Default::default()
        };
        self.req(msg, req.cb)
    }
}
