//! ERD bus: frame routing, per-ERD events and queued ERD operations.
//!
//! Inbound ERD frames are classified by exact length equations. Requests
//! become one [`ErdEvent`] per ERD, each with a responder whose answers are
//! aggregated into a single reply frame. Replies retire the outstanding
//! request of their operation class. Publications are acknowledged with an
//! empty frame and delivered to registered listeners.
//!
//! Requests and replies are only routed when addressed to this participant
//! or broadcast. Every inbound message is re-emitted on [`ErdBus::messages`]
//! once routing is done.

use crate::bus::{AbstractBus, MessageFilter, TaskGuard};
use crate::config::{Config, DEFAULT_EVENT_CAPACITY};
use crate::error::BusError;
use crate::listener::{ErdPublication, ListenerRegistry, PublishListener};
use crate::object::ErdObject;
use crate::queue::{OperationClass, QueuedDispatcher};
use crate::responder::{
    read_responders, subscribe_responders, write_responders, ErdReadResponder,
    ErdSubscribeResponder, ErdWriteResponder,
};
use crate::transport::TransportRegistry;
use bytes::Bytes;
use gea2_protocol::{
    encode_erd_ids, encode_records, encode_subscribe_request, Address, Erd, ErdCommand, ErdFrame,
    ErdList, ErdRecord, Message, Outbound, Serializer, SubscribeItem, BROADCAST_ADDRESS,
    DEFAULT_TIMEOUT_MS,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;

/// A request for one ERD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErdRequest {
    pub source: Address,
    pub destination: Address,
    pub erd: Erd,
}

/// A request to write one ERD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErdWriteRequest {
    pub source: Address,
    pub destination: Address,
    pub erd: Erd,
    pub data: Bytes,
}

/// A request to subscribe to one ERD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErdSubscribeRequest {
    pub source: Address,
    pub destination: Address,
    pub erd: Erd,
    /// Requested publication interval byte, passed through uninterpreted.
    pub time: u8,
}

/// Inbound ERD traffic addressed to this participant.
#[derive(Debug)]
pub enum ErdEvent {
    Read {
        request: ErdRequest,
        responder: ErdReadResponder,
    },
    Write {
        request: ErdWriteRequest,
        responder: ErdWriteResponder,
    },
    Subscribe {
        request: ErdSubscribeRequest,
        responder: ErdSubscribeResponder,
    },
    Publish(ErdPublication),
}

struct Router {
    bus: AbstractBus,
    read: QueuedDispatcher<Vec<ErdRecord>>,
    write: QueuedDispatcher<u8>,
    subscribe: QueuedDispatcher<u8>,
    publish: QueuedDispatcher<()>,
    events: Mutex<Option<mpsc::UnboundedSender<ErdEvent>>>,
    listeners: Arc<ListenerRegistry>,
}

impl Router {
    fn accepts(&self, message: &Message) -> bool {
        message.destination == self.bus.address() || message.destination == BROADCAST_ADDRESS
    }

    fn emit(&self, event: ErdEvent) {
        let sender = self.events.lock().clone();
        match sender {
            // An undelivered event drops its responder, which answers as an error.
            Some(sender) => {
                let _ = sender.send(event);
            }
            None => drop(event),
        }
    }

    fn route(&self, command: ErdCommand, message: &Message) {
        if !self.accepts(message) {
            tracing::debug!("Ignoring ERD frame for {:#04x}", message.destination);
            return;
        }

        let frame = match ErdFrame::classify(command, &message.data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping frame from {:#04x}: {}", message.source, e);
                return;
            }
        };

        let (source, destination) = (message.source, message.destination);

        match frame {
            ErdFrame::ReadRequest(erds) => {
                let responders = read_responders(&self.bus, message, &erds);
                for (erd, responder) in erds.into_iter().zip(responders) {
                    self.emit(ErdEvent::Read {
                        request: ErdRequest {
                            source,
                            destination,
                            erd,
                        },
                        responder,
                    });
                }
            }
            ErdFrame::ReadReply(records) => self.read.resolve(records),
            ErdFrame::WriteRequest(records) => {
                let erds: Vec<Erd> = records.iter().map(|record| record.erd).collect();
                let responders = write_responders(&self.bus, message, &erds);
                for (record, responder) in records.into_iter().zip(responders) {
                    self.emit(ErdEvent::Write {
                        request: ErdWriteRequest {
                            source,
                            destination,
                            erd: record.erd,
                            data: record.data,
                        },
                        responder,
                    });
                }
            }
            ErdFrame::WriteReply { count, erds } => {
                if erds.is_none() {
                    tracing::debug!("Count-only write reply from {:#04x}", source);
                }
                self.write.resolve(count);
            }
            ErdFrame::SubscribeRequest(items) => {
                let erds: Vec<Erd> = items.iter().map(|item| item.erd).collect();
                let responders = subscribe_responders(&self.bus, message, &erds);
                for (item, responder) in items.into_iter().zip(responders) {
                    self.emit(ErdEvent::Subscribe {
                        request: ErdSubscribeRequest {
                            source,
                            destination,
                            erd: item.erd,
                            time: item.time,
                        },
                        responder,
                    });
                }
            }
            ErdFrame::SubscribeReply(count) => self.subscribe.resolve(count),
            ErdFrame::PublishRequest(records) => {
                for record in records {
                    let publication = ErdPublication {
                        source,
                        destination,
                        erd: record.erd,
                        data: record.data,
                    };
                    self.listeners.notify(&publication);
                    self.emit(ErdEvent::Publish(publication));
                }

                let ack = Outbound::new(ErdCommand::PUBLISH).with_destination(source);
                if let Err(e) = self.bus.transmit(ack) {
                    tracing::warn!("Failed to acknowledge publish from {:#04x}: {}", source, e);
                }
            }
            ErdFrame::PublishAck => self.publish.resolve(()),
        }
    }
}

struct Inner {
    router: Arc<Router>,
    messages: broadcast::Sender<Message>,
    _tasks: TaskGuard,
}

/// Bus with ERD operations layered over an [`AbstractBus`].
///
/// Operations are queued per class at the moment they are called; the
/// returned futures only wait for completion.
#[derive(Clone)]
pub struct ErdBus {
    inner: Arc<Inner>,
}

impl ErdBus {
    pub fn new(bus: AbstractBus) -> Self {
        Self::with_options(
            bus,
            Duration::from_millis(DEFAULT_TIMEOUT_MS),
            DEFAULT_EVENT_CAPACITY,
        )
    }

    /// Uses `timeout` as the fixed reply window of every ERD queue.
    pub fn with_options(bus: AbstractBus, timeout: Duration, event_capacity: usize) -> Self {
        let inbound = bus.messages();
        let (messages, _) = broadcast::channel(event_capacity);

        let read = QueuedDispatcher::new(OperationClass::Read, bus.clone(), timeout);
        let write = QueuedDispatcher::new(OperationClass::Write, bus.clone(), timeout);
        let subscribe = QueuedDispatcher::new(OperationClass::Subscribe, bus.clone(), timeout);
        let publish = QueuedDispatcher::new(OperationClass::Publish, bus.clone(), timeout);

        let router = Arc::new(Router {
            bus,
            read,
            write,
            subscribe,
            publish,
            events: Mutex::new(None),
            listeners: ListenerRegistry::new(),
        });

        let inbound_task = tokio::spawn(run_inbound(router.clone(), inbound, messages.clone()));

        Self {
            inner: Arc::new(Inner {
                router,
                messages,
                _tasks: TaskGuard::new(vec![inbound_task]),
            }),
        }
    }

    /// Opens the configured transport and layers an ERD bus on it.
    pub async fn bind(config: &Config, registry: &TransportRegistry) -> Result<Self, BusError> {
        let bus = AbstractBus::bind(config, registry).await?;
        Ok(Self::with_options(
            bus,
            config.bus.erd_timeout(),
            config.bus.event_capacity,
        ))
    }

    /// The underlying abstract bus.
    pub fn bus(&self) -> &AbstractBus {
        &self.inner.router.bus
    }

    pub fn address(&self) -> Address {
        self.bus().address()
    }

    /// Takes over delivery of inbound ERD requests and publications.
    ///
    /// Only the most recent receiver gets events. Without a receiver every
    /// inbound request is answered with zero successes.
    pub fn events(&self) -> mpsc::UnboundedReceiver<ErdEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.inner.router.events.lock() = Some(sender);
        receiver
    }

    /// Every inbound message, after ERD routing.
    pub fn messages(&self) -> broadcast::Receiver<Message> {
        self.inner.messages.subscribe()
    }

    /// Calls `callback` for every publication of `erd` until the handle is dropped.
    pub fn on_publish(
        &self,
        erd: Erd,
        callback: impl Fn(&ErdPublication) + Send + Sync + 'static,
    ) -> PublishListener {
        self.inner.router.listeners.add(erd, callback)
    }

    /// Requests queued or in flight for one operation class.
    pub fn pending(&self, class: OperationClass) -> usize {
        let router = &self.inner.router;
        match class {
            OperationClass::Read => router.read.pending(),
            OperationClass::Write => router.write.pending(),
            OperationClass::Subscribe => router.subscribe.pending(),
            OperationClass::Publish => router.publish.pending(),
        }
    }

    /// Reads one or more ERDs; resolves with the records the peer returned.
    pub fn read(
        &self,
        destination: Address,
        erds: impl Into<ErdList>,
    ) -> impl Future<Output = Result<Vec<ErdRecord>, BusError>> + Send + 'static {
        self.read_list(destination, erds.into())
    }

    fn read_list(
        &self,
        destination: Address,
        erds: ErdList,
    ) -> impl Future<Output = Result<Vec<ErdRecord>, BusError>> + Send + 'static {
        let queued = non_empty(&erds, "read").and_then(|_| {
            let data = encode_erd_ids(erds.as_slice())?;
            Ok(self.inner.router.read.send(
                Outbound::new(ErdCommand::READ)
                    .with_destination(destination)
                    .with_data(data),
            ))
        });
        async move { queued?.await }
    }

    /// Writes one ERD; resolves with the peer's success count.
    pub fn write(
        &self,
        destination: Address,
        erd: Erd,
        data: impl Into<Bytes>,
    ) -> impl Future<Output = Result<u8, BusError>> + Send + 'static {
        self.write_many(destination, vec![ErdRecord::new(erd, data)])
    }

    pub fn write_many(
        &self,
        destination: Address,
        records: Vec<ErdRecord>,
    ) -> impl Future<Output = Result<u8, BusError>> + Send + 'static {
        let queued = encode_records(&records).map(|data| {
            self.inner.router.write.send(
                Outbound::new(ErdCommand::WRITE)
                    .with_destination(destination)
                    .with_data(data),
            )
        });
        async move { queued?.await }
    }

    /// Subscribes to one or more ERDs; resolves with the accepted count.
    pub fn subscribe(
        &self,
        destination: Address,
        erds: impl Into<ErdList>,
    ) -> impl Future<Output = Result<u8, BusError>> + Send + 'static {
        self.subscribe_list(destination, erds.into())
    }

    fn subscribe_list(
        &self,
        destination: Address,
        erds: ErdList,
    ) -> impl Future<Output = Result<u8, BusError>> + Send + 'static {
        let queued = non_empty(&erds, "subscribe").and_then(|_| {
            let items: Vec<SubscribeItem> = erds
                .as_slice()
                .iter()
                .map(|&erd| SubscribeItem { erd, time: 0 })
                .collect();
            let data = encode_subscribe_request(&items)?;
            Ok(self.inner.router.subscribe.send(
                Outbound::new(ErdCommand::SUBSCRIBE)
                    .with_destination(destination)
                    .with_data(data),
            ))
        });
        async move { queued?.await }
    }

    /// Publishes one ERD value; resolves when the peer acknowledges.
    pub fn publish(
        &self,
        destination: Address,
        erd: Erd,
        data: impl Into<Bytes>,
    ) -> impl Future<Output = Result<(), BusError>> + Send + 'static {
        self.publish_many(destination, vec![ErdRecord::new(erd, data)])
    }

    pub fn publish_many(
        &self,
        destination: Address,
        records: Vec<ErdRecord>,
    ) -> impl Future<Output = Result<(), BusError>> + Send + 'static {
        let queued = encode_records(&records).map(|data| {
            self.inner.router.publish.send(
                Outbound::new(ErdCommand::PUBLISH)
                    .with_destination(destination)
                    .with_data(data),
            )
        });
        async move { queued?.await }
    }

    /// Binds a destination, an ERD and a serializer into one object.
    pub fn create_erd<S: Serializer + 'static>(
        &self,
        address: Address,
        erd: Erd,
        serializer: Arc<S>,
    ) -> ErdObject<S> {
        ErdObject::new(self.clone(), address, erd, serializer)
    }

    pub async fn send(&self, outbound: Outbound) -> Result<Message, BusError> {
        self.bus().send(outbound).await
    }

    pub async fn send_with_timeout(
        &self,
        outbound: Outbound,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        self.bus().send_with_timeout(outbound, timeout).await
    }

    pub async fn wait(
        &self,
        filter: MessageFilter,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        self.bus().wait(filter, timeout).await
    }

    pub fn transmit(&self, outbound: Outbound) -> Result<Message, BusError> {
        self.bus().transmit(outbound)
    }
}

fn non_empty(erds: &ErdList, operation: &str) -> Result<(), BusError> {
    if erds.is_empty() {
        return Err(BusError::Unsupported(format!(
            "{} of an empty ERD list",
            operation
        )));
    }
    Ok(())
}

async fn run_inbound(
    router: Arc<Router>,
    mut inbound: broadcast::Receiver<Message>,
    messages: broadcast::Sender<Message>,
) {
    loop {
        let message = match inbound.recv().await {
            Ok(message) => message,
            Err(RecvError::Lagged(n)) => {
                tracing::warn!("ERD bus lagged, {} inbound messages lost", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if let Some(command) = ErdCommand::from_command(message.command) {
            router.route(command, &message);
        }

        let _ = messages.send(message);
    }
}
