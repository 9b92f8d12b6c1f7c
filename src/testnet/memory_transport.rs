use crate::error::{BlockchainError, Result};
use crate::network::{Message, Node, Transport};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};

/// Delivers messages by calling `Node::handle` directly. Every node appears to
/// the others as `127.0.0.1:<port>`.
#[derive(Default)]
pub struct MemoryTransport {
    nodes: RwLock<HashMap<String, Node>>,
    sent: Mutex<Vec<(u16, String, String)>>,
}

impl MemoryTransport {
    pub fn new() -> MemoryTransport {
        MemoryTransport::default()
    }

    pub fn register(&self, address: &str, node: Node) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_string(), node);
    }

    /// Unregister a node so messages to it fail like an unreachable peer
    pub fn disconnect(&self, address: &str) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
    }

    /// Every fire-and-forget send so far as (sender port, recipient, kind).
    /// The sender port is only known for messages that carry one.
    pub fn sent(&self) -> Vec<(u16, String, String)> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn node(&self, peer: &str) -> Result<Node> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
            .ok_or_else(|| BlockchainError::Network(format!("No node at {peer}")))
    }
}

impl Transport for MemoryTransport {
    fn request(&self, peer: &str, message: &Message) -> Result<Message> {
        self.node(peer)?
            .handle("127.0.0.1", message.clone())
            .ok_or_else(|| {
                BlockchainError::Network(format!("{peer} did not answer {}", message.kind()))
            })
    }

    fn send(&self, peer: &str, message: &Message) -> Result<()> {
        let node = self.node(peer)?;
        let from = match message {
            Message::NewBlock { port, .. } | Message::NewTx { port, .. } => *port,
            Message::Hello { port, .. } => *port,
            _ => 0,
        };
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).push((
            from,
            peer.to_string(),
            message.kind().to_string(),
        ));
        node.handle("127.0.0.1", message.clone());
        Ok(())
    }
}
