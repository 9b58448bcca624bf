//! Transport contract and the registry that selects implementations by name.
//!
//! A transport moves whole wire messages. It never sees extended 16-bit
//! commands; the bus splits those before handing a message down.

mod memory;
mod tcp;

pub use memory::MemoryTransport;
pub use tcp::TcpTransport;

use crate::config::TransportConfig;
use crate::error::BusError;
use gea2_protocol::Message;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A boxed future, as returned by transport factories.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Stream of messages decoded by a transport.
pub type Inbound = mpsc::UnboundedReceiver<Message>;

/// Outbound half of a physical link.
pub trait Transport: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Queues one wire message for transmission.
    ///
    /// Fails immediately when the link cannot accept the message; delivery
    /// is otherwise best effort.
    fn send(&self, message: &Message) -> Result<(), BusError>;
}

/// An open link: the outbound transport and its inbound message stream.
pub struct Link {
    pub transport: Arc<dyn Transport>,
    pub inbound: Inbound,
}

impl Link {
    pub fn new(transport: Arc<dyn Transport>, inbound: Inbound) -> Self {
        Self { transport, inbound }
    }
}

/// Opens a link from configuration.
pub type TransportFactory = fn(TransportConfig) -> BoxFuture<'static, Result<Link, BusError>>;

/// Transport implementations keyed by name.
pub struct TransportRegistry {
    factories: BTreeMap<String, TransportFactory>,
}

impl TransportRegistry {
    /// Creates a registry with no transports.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Adds or replaces a transport factory.
    pub fn register(&mut self, name: impl Into<String>, factory: TransportFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn with(mut self, name: impl Into<String>, factory: TransportFactory) -> Self {
        self.register(name, factory);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered transport names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Opens the transport named by `config.kind`.
    pub async fn open(&self, config: &TransportConfig) -> Result<Link, BusError> {
        let factory = self
            .factories
            .get(&config.kind)
            .ok_or_else(|| BusError::UnknownTransport(config.kind.clone()))?;
        tracing::debug!("Opening {} transport", config.kind);
        factory(config.clone()).await
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::empty().with("tcp", tcp::open)
    }
}
