use crate::storage::GraphAdapter;
use crate::types::{GetOpts, GraphData, Message, decode_frame};
use std::sync::Arc;
use tracing::{debug, warn};

/// Answers wire-protocol requests against an adapter.
#[derive(Clone)]
pub struct WireResponder {
    adapter: Arc<dyn GraphAdapter>,
}

impl WireResponder {
    pub fn new(adapter: Arc<dyn GraphAdapter>) -> Self {
        Self { adapter }
    }

    /// Reply to one message; messages that ask for nothing get no reply.
    pub async fn handle(&self, msg: Message) -> Option<Message> {
        if let Some(get) = &msg.get {
            let opts = get.key.clone().map(GetOpts::single);
            return Some(match self.adapter.get(&get.soul, opts.as_ref()).await {
                Ok(node) => {
                    let mut reply = Message::reply(msg.id.clone().unwrap_or_default());
                    if let Some(node) = node {
                        let mut put = GraphData::new();
                        put.insert(get.soul.clone(), Some(node));
                        reply.put = Some(put);
                    }
                    reply
                }
                Err(e) => {
                    warn!(soul = %get.soul, "Failed to read node: {}", e);
                    Message::error(msg.id.clone(), "Error fetching node")
                }
            });
        }

        if let Some(put) = &msg.put {
            return Some(match self.adapter.put(put).await {
                Ok(_) => {
                    let mut reply = Message::reply(msg.id.clone().unwrap_or_default());
                    reply.ok = Some(true);
                    reply
                }
                Err(e) => {
                    warn!("Failed to save put: {}", e);
                    Message::error(msg.id.clone(), "Error saving put")
                }
            });
        }

        None
    }

    /// Reply to every message of a frame, in order.
    pub async fn handle_frame(&self, text: &str) -> Vec<Message> {
        let msgs = match decode_frame(text) {
            Ok(msgs) => msgs,
            Err(e) => {
                debug!("Malformed frame: {}", e);
                return vec![Message::error(None, format!("Malformed message: {}", e))];
            }
        };

        let mut replies = Vec::with_capacity(msgs.len());
        for msg in msgs {
            if let Some(reply) = self.handle(msg).await {
                replies.push(reply);
            }
        }
        replies
    }
}
