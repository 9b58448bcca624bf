//! In-process transport connecting two links back to back.

use super::{Link, Transport};
use crate::error::BusError;
use gea2_protocol::{Message, ProtocolError};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Delivers every sent message to the peer link's inbound stream.
pub struct MemoryTransport {
    peer: mpsc::UnboundedSender<Message>,
}

impl MemoryTransport {
    /// Creates two connected links.
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let a = Link::new(Arc::new(MemoryTransport { peer: b_tx }), a_rx);
        let b = Link::new(Arc::new(MemoryTransport { peer: a_tx }), b_rx);
        (a, b)
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn send(&self, message: &Message) -> Result<(), BusError> {
        if message.is_extended() {
            return Err(ProtocolError::CommandNotWireable(message.command).into());
        }
        self.peer
            .send(message.clone())
            .map_err(|_| BusError::Transport("peer link closed".to_string()))
    }
}
