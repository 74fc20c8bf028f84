use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tracing::trace;

use crate::msg::{Envelope, MessageKind, NodeId};

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("mailbox closed: every sender has been dropped")]
    Closed,
}

/// The address of a node: delivering a message means pushing an envelope
/// onto the target's queue. Cheap to clone, compared by id.
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fire-and-forget enqueue. A closed mailbox (the target's message
    /// loop has exited and dropped its receiver) is tolerated: one node's
    /// death must never crash another node's broadcast.
    pub fn deliver(&self, sender: &NodeHandle, kind: MessageKind) {
        let envelope = Envelope {
            sender: sender.clone(),
            kind,
        };
        if self.tx.send(envelope).is_err() {
            trace!(to = %self.name, "dropping message for closed mailbox");
        }
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeHandle {}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Unbounded FIFO of inbound messages for one node.
pub struct Mailbox {
    me: NodeHandle,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Mailbox {
    pub fn new(id: NodeId, name: &str) -> (NodeHandle, Mailbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = NodeHandle {
            id,
            name: Arc::from(name),
            tx,
        };
        let mailbox = Mailbox {
            me: handle.clone(),
            rx,
        };
        (handle, mailbox)
    }

    /// Dequeue the next message in arrival order, waiting at most `window`.
    /// Expiry is reported as a synthetic `Timeout` envelope the node sends
    /// itself. Cancel-safe, so the caller can race it against a shutdown
    /// signal.
    pub async fn receive(&mut self, window: Duration) -> Result<Envelope, MailboxError> {
        tokio::select! {
            msg = self.rx.recv() => msg.ok_or(MailboxError::Closed),
            _ = time::sleep(window) => Ok(Envelope {
                sender: self.me.clone(),
                kind: MessageKind::Timeout,
            }),
        }
    }
}
