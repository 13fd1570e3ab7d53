//! Boundary between the graph store and whatever moves messages.
//!
//! A connector owns an input and an output [`ProcessQueue`], a connectivity
//! flag, and the table of callbacks awaiting replies. Inbound `put`s surface
//! as [`GraphDataEvent`]s; inbound replies are routed by `@` to the callback
//! registered under the request's message id.

mod adapter;
mod queue;
mod responder;
mod transport;
mod wire;

pub use adapter::AdapterConnector;
pub use queue::{DupePolicy, ProcessQueue, QueueItem};
pub use responder::WireResponder;
pub use transport::{ChannelTransport, WireTransport};
pub use wire::WireConnector;

use crate::events::{Event, Unsubscribe};
use crate::types::{GraphData, Message};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

pub type MsgCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// A request for one soul, as issued by the graph store.
#[derive(Clone)]
pub struct GetRequest {
    pub soul: String,
    pub key: Option<String>,
    pub msg_id: String,
    pub cb: Option<MsgCallback>,
}

/// Outbound write, as issued by the graph store.
#[derive(Clone)]
pub struct PutRequest {
    pub graph: GraphData,
    pub msg_id: String,
    pub reply_to: Option<String>,
    pub cb: Option<MsgCallback>,
}

/// Graph data that arrived through a connector.
#[derive(Debug, Clone)]
pub struct GraphDataEvent {
    pub graph: GraphData,
    pub msg_id: Option<String>,
    pub reply_to: Option<String>,
}

pub struct ConnectorEvents {
    pub graph_data: Event<GraphDataEvent>,
    pub receive_message: Event<Message>,
    pub connection: Event<bool>,
}

/// State shared by every connector implementation.
pub struct ConnectorCore {
    name: String,
    connected: AtomicBool,
    pub events: ConnectorEvents,
    pub input: ProcessQueue<Message>,
    pub output: ProcessQueue<Message>,
    callbacks: Arc<Mutex<HashMap<String, MsgCallback>>>,
}

impl ConnectorCore {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            events: ConnectorEvents {
                graph_data: Event::new(format!("{}.graph_data", name)),
                receive_message: Event::new(format!("{}.receive_message", name)),
                connection: Event::new(format!("{}.connection", name)),
            },
            input: ProcessQueue::new(format!("{}.input", name), DupePolicy::Skip),
            output: ProcessQueue::new(format!("{}.output", name), DupePolicy::Process),
            connected: AtomicBool::new(false),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Update connectivity. Becoming connected flushes queued output into `sink`.
    pub fn set_connected<F>(&self, connected: bool, sink: F)
    where
        F: FnMut(Message),
    {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if was != connected {
            self.events.connection.trigger(&connected);
        }
        if connected {
            self.output.process(sink);
        }
    }

    pub fn register(&self, msg_id: &str, cb: MsgCallback) {
        self.callbacks.lock().insert(msg_id.to_string(), cb);
    }

    /// Stop waiting for replies to `msg_id`.
    pub fn off(&self, msg_id: &str) -> bool {
        self.callbacks.lock().remove(msg_id).is_some()
    }

    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Handle that forgets the callback of `msg_id` when invoked.
    pub fn unsubscribe_handle(&self, msg_id: String) -> Unsubscribe {
        let callbacks = Arc::clone(&self.callbacks);
        Unsubscribe::new(move || {
            callbacks.lock().remove(&msg_id);
        })
    }

    /// Queue outbound messages; they reach `sink` only while connected.
    pub fn send<F>(&self, msgs: Vec<Message>, sink: F)
    where
        F: FnMut(Message),
    {
        self.output.enqueue_many(msgs);
        if self.is_connected() {
            self.output.process(sink);
        }
    }

    /// Feed inbound messages through the input queue.
    pub fn ingest(&self, msgs: Vec<Message>) {
        self.input.enqueue_many(msgs);
        self.input.process(|msg| self.on_processed_input(msg));
    }

    fn on_processed_input(&self, msg: Message) {
        trace!(connector = %self.name, id = ?msg.id, reply_to = ?msg.reply_to, "Processing message");

        if let Some(put) = &msg.put {
            self.events.graph_data.trigger(&GraphDataEvent {
                graph: put.clone(),
                msg_id: msg.id.clone(),
                reply_to: msg.reply_to.clone(),
            });
        }

        if let Some(reply_to) = &msg.reply_to {
            let cb = self.callbacks.lock().remove(reply_to);
            if let Some(cb) = cb {
                cb(&msg);
            }
        }

        self.events.receive_message.trigger(&msg);
    }
}

/// What the graph store needs from a connector.
pub trait GraphConnector: Send + Sync {
    fn core(&self) -> &ConnectorCore;

    fn get(&self, req: GetRequest) -> Unsubscribe;

    fn put(&self, req: PutRequest) -> Unsubscribe;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn is_connected(&self) -> bool {
        self.core().is_connected()
    }

    fn off(&self, msg_id: &str) {
        self.core().off(msg_id);
    }
}
