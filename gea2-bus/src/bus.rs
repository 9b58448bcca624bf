//! Abstract bus: addressing defaults, extended commands and reply correlation.
//!
//! The wire protocol has no request identifier. A reply is therefore the
//! first message published after the request that satisfies a
//! [`MessageFilter`]; earlier or non-matching messages are skipped.

use crate::config::{Config, DEFAULT_EVENT_CAPACITY};
use crate::error::BusError;
use crate::transport::{Link, Transport, TransportRegistry};
use gea2_protocol::{Address, Message, Outbound, DEFAULT_TIMEOUT_MS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// Aborts the owned tasks when dropped.
pub(crate) struct TaskGuard(Vec<JoinHandle<()>>);

impl TaskGuard {
    pub(crate) fn new(handles: Vec<JoinHandle<()>>) -> Self {
        Self(handles)
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Selects the inbound message that answers a request.
///
/// Unset fields match anything. A command above `0xFF` is matched in its
/// extended form: the wire command must equal the high byte and the first
/// data byte the low byte, which is then folded back into the command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub source: Option<Address>,
    pub command: Option<u8>,
    pub extension: Option<u8>,
}

impl MessageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter for the reply to `request`, given in its logical form.
    pub fn reply_to(request: &Message) -> Self {
        Self::new()
            .with_source(request.destination)
            .with_command(request.command)
    }

    pub fn with_source(mut self, source: Address) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_command(mut self, command: u16) -> Self {
        match u8::try_from(command) {
            Ok(command) => {
                self.command = Some(command);
                self.extension = None;
            }
            Err(_) => {
                self.command = Some((command >> 8) as u8);
                self.extension = Some((command & 0xFF) as u8);
            }
        }
        self
    }

    /// Returns the message as delivered to the waiter, or `None` on mismatch.
    pub fn accept(&self, message: &Message) -> Option<Message> {
        if self.source.is_some_and(|source| source != message.source) {
            return None;
        }
        if self
            .command
            .is_some_and(|command| u16::from(command) != message.command)
        {
            return None;
        }

        let mut message = message.clone();
        if let Some(low) = self.extension {
            if !message.fold_extended(low) {
                return None;
            }
        }
        Some(message)
    }
}

struct Inner {
    address: Address,
    transport: Arc<dyn Transport>,
    messages: broadcast::Sender<Message>,
    response_timeout: Duration,
    _pump: TaskGuard,
}

/// Transport-agnostic request/reply layer over one link.
///
/// Cloning is cheap; all clones share the link. The inbound pump stops when
/// the last clone is dropped.
#[derive(Clone)]
pub struct AbstractBus {
    inner: Arc<Inner>,
}

impl AbstractBus {
    /// Binds `address` to an open link with default timing.
    pub fn new(address: Address, link: Link) -> Self {
        Self::with_options(
            address,
            link,
            Duration::from_millis(DEFAULT_TIMEOUT_MS),
            DEFAULT_EVENT_CAPACITY,
        )
    }

    pub fn with_options(
        address: Address,
        link: Link,
        response_timeout: Duration,
        event_capacity: usize,
    ) -> Self {
        let (messages, _) = broadcast::channel(event_capacity);
        let Link {
            transport,
            mut inbound,
        } = link;

        let sender = messages.clone();
        let pump = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                tracing::debug!("rx {}", message);
                // No receivers is fine.
                let _ = sender.send(message);
            }
            tracing::info!("Transport inbound stream closed");
        });

        Self {
            inner: Arc::new(Inner {
                address,
                transport,
                messages,
                response_timeout,
                _pump: TaskGuard::new(vec![pump]),
            }),
        }
    }

    /// Opens the configured transport and binds the configured address.
    pub async fn bind(config: &Config, registry: &TransportRegistry) -> Result<Self, BusError> {
        config.validate()?;
        let link = registry.open(&config.transport).await?;
        tracing::info!(
            "Bound {:#04x} to {} transport",
            config.bus.source_address,
            config.transport.kind
        );
        Ok(Self::with_options(
            config.bus.source_address,
            link,
            config.bus.response_timeout(),
            config.bus.event_capacity,
        ))
    }

    /// The source address owned by this bus.
    pub fn address(&self) -> Address {
        self.inner.address
    }

    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }

    pub fn response_timeout(&self) -> Duration {
        self.inner.response_timeout
    }

    /// Subscribes to every inbound message from now on.
    pub fn messages(&self) -> broadcast::Receiver<Message> {
        self.inner.messages.subscribe()
    }

    /// Sends without waiting for a reply.
    ///
    /// Returns the resolved message in its logical (unsplit) form.
    pub fn transmit(&self, outbound: Outbound) -> Result<Message, BusError> {
        let message = outbound.resolve(self.inner.address);
        let (wire, _) = message.clone().split_extended();

        tracing::debug!("tx {}", wire);
        self.inner.transport.send(&wire)?;
        Ok(message)
    }

    /// Sends and waits for the reply with the default timeout.
    pub async fn send(&self, outbound: Outbound) -> Result<Message, BusError> {
        self.send_with_timeout(outbound, self.inner.response_timeout)
            .await
    }

    /// Sends and waits for the first later message from the destination
    /// carrying the same command.
    pub async fn send_with_timeout(
        &self,
        outbound: Outbound,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        // Subscribe before transmitting so a fast reply cannot be missed.
        let mut receiver = self.messages();
        let message = self.transmit(outbound)?;
        let filter = MessageFilter::reply_to(&message);
        wait_on(&mut receiver, &filter, timeout).await
    }

    /// Waits for an inbound message without sending anything.
    pub async fn wait(
        &self,
        filter: MessageFilter,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        let mut receiver = self.messages();
        wait_on(&mut receiver, &filter, timeout).await
    }
}

async fn wait_on(
    receiver: &mut broadcast::Receiver<Message>,
    filter: &MessageFilter,
    timeout: Duration,
) -> Result<Message, BusError> {
    let matched = async {
        loop {
            match receiver.recv().await {
                Ok(message) => {
                    if let Some(reply) = filter.accept(&message) {
                        return Ok(reply);
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Reply wait skipped {} messages", n);
                }
                Err(RecvError::Closed) => return Err(BusError::Closed),
            }
        }
    };

    tokio::time::timeout(timeout, matched).await.map_err(|_| {
        tracing::debug!("No reply matching {:?} within {:?}", filter, timeout);
        BusError::Timeout
    })?
}
