use crate::error::{Error, Result};
use crate::types::Message;
use tokio::sync::mpsc;

/// Moves serialized messages to the other side of a connection.
pub trait WireTransport: Send + Sync {
    fn transmit(&self, msg: &Message) -> Result<()>;
}

/// In-process transport backed by an unbounded channel.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Message>,
}

impl ChannelTransport {
    /// Transport plus the receiving end its messages arrive on.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl WireTransport for ChannelTransport {
    fn transmit(&self, msg: &Message) -> Result<()> {
        self.tx.send(msg.clone()).map_err(|_| Error::Closed)
    }
}
