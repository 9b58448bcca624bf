//! Appliance binding: version auto-responder, discovery and profiles.
//!
//! An [`ApplianceBus`] answers version queries with the configured
//! application version vector and surfaces version announcements from other
//! participants, handing each one to every attached [`Profile`]. When a query
//! arrives by broadcast, the querier is queried back so that both sides end
//! up discovering each other.

use crate::bus::{MessageFilter, TaskGuard};
use crate::config::{Config, DEFAULT_EVENT_CAPACITY};
use crate::erd::{ErdBus, ErdEvent};
use crate::error::BusError;
use crate::listener::{ErdPublication, PublishListener};
use crate::object::ErdObject;
use crate::transport::TransportRegistry;
use bytes::Bytes;
use gea2_protocol::{
    Address, Erd, ErdList, ErdRecord, Message, Outbound, Serializer, BROADCAST_ADDRESS,
    COMMAND_VERSION,
};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;

/// A version vector announced by another participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionAnnouncement {
    pub source: Address,
    pub destination: Address,
    pub version: Bytes,
}

impl fmt::Display for VersionAnnouncement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x} version ", self.source)?;
        for (i, byte) in self.version.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", byte)?;
        }
        Ok(())
    }
}

/// Maps ERDs of one appliance family to domain meaning.
pub trait Profile: Send + Sync {
    fn name(&self) -> &str;

    /// Called once when the profile is attached to a bus.
    fn attach(&self, _bus: &ApplianceBus) {}

    /// Called for every version announcement seen on the bus.
    fn on_version(&self, bus: &ApplianceBus, announcement: &VersionAnnouncement);
}

/// Creates a profile instance.
pub type ProfileFactory = fn() -> Arc<dyn Profile>;

/// Profile implementations keyed by name.
#[derive(Clone, Default)]
pub struct ProfileRegistry {
    factories: BTreeMap<String, ProfileFactory>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a profile factory.
    pub fn register(&mut self, name: impl Into<String>, factory: ProfileFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn with(mut self, name: impl Into<String>, factory: ProfileFactory) -> Self {
        self.register(name, factory);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered profile names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn create(&self, name: &str) -> Option<Arc<dyn Profile>> {
        self.factories.get(name).map(|factory| factory())
    }

    /// One instance of every registered profile, in name order.
    pub fn create_all(&self) -> Vec<Arc<dyn Profile>> {
        self.factories.values().map(|factory| factory()).collect()
    }
}

struct Inner {
    erd: ErdBus,
    version: Bytes,
    profiles: Vec<Arc<dyn Profile>>,
    versions: broadcast::Sender<VersionAnnouncement>,
    messages: broadcast::Sender<Message>,
    _responder: TaskGuard,
}

/// ERD bus that takes part in version discovery.
#[derive(Clone)]
pub struct ApplianceBus {
    inner: Arc<Inner>,
}

impl ApplianceBus {
    /// Starts answering version queries on `erd` with `version`.
    pub fn new(erd: ErdBus, version: impl Into<Bytes>, profiles: Vec<Arc<dyn Profile>>) -> Self {
        Self::with_capacity(erd, version.into(), profiles, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(
        erd: ErdBus,
        version: Bytes,
        profiles: Vec<Arc<dyn Profile>>,
        event_capacity: usize,
    ) -> Self {
        let inbound = erd.messages();
        let (versions, _) = broadcast::channel(event_capacity);
        let (messages, _) = broadcast::channel(event_capacity);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let responder = tokio::spawn(run_version_responder(
                weak.clone(),
                erd.clone(),
                version.clone(),
                inbound,
                versions.clone(),
                messages.clone(),
            ));

            Inner {
                erd,
                version,
                profiles,
                versions,
                messages,
                _responder: TaskGuard::new(vec![responder]),
            }
        });

        let bus = Self { inner };
        for profile in &bus.inner.profiles {
            tracing::debug!("Attaching profile {}", profile.name());
            profile.attach(&bus);
        }
        bus
    }

    /// Returns the underlying ERD bus.
    pub fn erd(&self) -> &ErdBus {
        &self.inner.erd
    }

    pub fn address(&self) -> Address {
        self.inner.erd.address()
    }

    /// The version vector this participant announces.
    pub fn version(&self) -> &Bytes {
        &self.inner.version
    }

    /// Names of the attached profiles.
    pub fn profiles(&self) -> Vec<&str> {
        self.inner.profiles.iter().map(|p| p.name()).collect()
    }

    /// Version announcements from other participants.
    pub fn versions(&self) -> broadcast::Receiver<VersionAnnouncement> {
        self.inner.versions.subscribe()
    }

    /// Inbound messages other than version traffic for this participant.
    pub fn messages(&self) -> broadcast::Receiver<Message> {
        self.inner.messages.subscribe()
    }

    /// Broadcasts an empty version query.
    pub fn discover(&self) -> Result<(), BusError> {
        tracing::info!("Broadcasting version query from {:#04x}", self.address());
        self.inner
            .erd
            .transmit(Outbound::new(COMMAND_VERSION).with_destination(BROADCAST_ADDRESS))?;
        Ok(())
    }

    pub fn events(&self) -> mpsc::UnboundedReceiver<ErdEvent> {
        self.inner.erd.events()
    }

    pub fn read(
        &self,
        destination: Address,
        erds: impl Into<ErdList>,
    ) -> impl Future<Output = Result<Vec<ErdRecord>, BusError>> + Send + 'static {
        self.inner.erd.read(destination, erds)
    }

    pub fn write(
        &self,
        destination: Address,
        erd: Erd,
        data: impl Into<Bytes>,
    ) -> impl Future<Output = Result<u8, BusError>> + Send + 'static {
        self.inner.erd.write(destination, erd, data)
    }

    pub fn write_many(
        &self,
        destination: Address,
        records: Vec<ErdRecord>,
    ) -> impl Future<Output = Result<u8, BusError>> + Send + 'static {
        self.inner.erd.write_many(destination, records)
    }

    pub fn subscribe(
        &self,
        destination: Address,
        erds: impl Into<ErdList>,
    ) -> impl Future<Output = Result<u8, BusError>> + Send + 'static {
        self.inner.erd.subscribe(destination, erds)
    }

    pub fn publish(
        &self,
        destination: Address,
        erd: Erd,
        data: impl Into<Bytes>,
    ) -> impl Future<Output = Result<(), BusError>> + Send + 'static {
        self.inner.erd.publish(destination, erd, data)
    }

    pub fn publish_many(
        &self,
        destination: Address,
        records: Vec<ErdRecord>,
    ) -> impl Future<Output = Result<(), BusError>> + Send + 'static {
        self.inner.erd.publish_many(destination, records)
    }

    pub fn on_publish(
        &self,
        erd: Erd,
        callback: impl Fn(&ErdPublication) + Send + Sync + 'static,
    ) -> PublishListener {
        self.inner.erd.on_publish(erd, callback)
    }

    pub fn create_erd<S: Serializer + 'static>(
        &self,
        address: Address,
        erd: Erd,
        serializer: Arc<S>,
    ) -> ErdObject<S> {
        self.inner.erd.create_erd(address, erd, serializer)
    }

    pub async fn send(&self, outbound: Outbound) -> Result<Message, BusError> {
        self.inner.erd.send(outbound).await
    }

    pub async fn send_with_timeout(
        &self,
        outbound: Outbound,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        self.inner.erd.send_with_timeout(outbound, timeout).await
    }

    pub async fn wait(
        &self,
        filter: MessageFilter,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        self.inner.erd.wait(filter, timeout).await
    }

    pub fn transmit(&self, outbound: Outbound) -> Result<Message, BusError> {
        self.inner.erd.transmit(outbound)
    }
}

/// Binds an appliance bus from configuration.
///
/// Every profile in `profiles` is instantiated and attached. A discovery
/// broadcast follows when `config.appliance.discover` is set.
pub async fn bind(
    config: &Config,
    transports: &TransportRegistry,
    profiles: &ProfileRegistry,
) -> Result<ApplianceBus, BusError> {
    let erd = ErdBus::bind(config, transports).await?;
    let bus = ApplianceBus::with_capacity(
        erd,
        Bytes::copy_from_slice(&config.appliance.version),
        profiles.create_all(),
        config.bus.event_capacity,
    );

    if config.appliance.discover {
        bus.discover()?;
    }
    Ok(bus)
}

async fn run_version_responder(
    owner: Weak<Inner>,
    erd: ErdBus,
    version: Bytes,
    mut inbound: broadcast::Receiver<Message>,
    versions: broadcast::Sender<VersionAnnouncement>,
    messages: broadcast::Sender<Message>,
) {
    let address = erd.address();

    loop {
        let message = match inbound.recv().await {
            Ok(message) => message,
            Err(RecvError::Lagged(n)) => {
                tracing::warn!("Version responder lagged, {} inbound messages lost", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let addressed = message.destination == address || message.is_broadcast();
        if message.command != COMMAND_VERSION || !addressed {
            let _ = messages.send(message);
            continue;
        }

        if message.data.is_empty() {
            answer_query(&erd, &version, &message);
            continue;
        }

        let announcement = VersionAnnouncement {
            source: message.source,
            destination: message.destination,
            version: message.data,
        };
        tracing::info!("Discovered {}", announcement);
        let _ = versions.send(announcement.clone());

        if let Some(inner) = owner.upgrade() {
            let bus = ApplianceBus { inner };
            for profile in &bus.inner.profiles {
                profile.on_version(&bus, &announcement);
            }
        }
    }
}

fn answer_query(erd: &ErdBus, version: &Bytes, query: &Message) {
    tracing::debug!("Answering version query from {:#04x}", query.source);

    let reply = Outbound::new(COMMAND_VERSION)
        .with_destination(query.source)
        .with_data(version.clone());
    if let Err(e) = erd.transmit(reply) {
        tracing::warn!(
            "Failed to answer version query from {:#04x}: {}",
            query.source,
            e
        );
        return;
    }

    if query.is_broadcast() {
        let back = Outbound::new(COMMAND_VERSION).with_destination(query.source);
        if let Err(e) = erd.transmit(back) {
            tracing::warn!("Failed to query {:#04x} back: {}", query.source, e);
        }
    }
}
