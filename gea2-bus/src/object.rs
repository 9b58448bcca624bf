//! Typed handle to one ERD on one peer.

use crate::erd::ErdBus;
use crate::error::BusError;
use crate::listener::PublishListener;
use gea2_protocol::{Address, Erd, ProtocolError, Serializer};
use std::fmt;
use std::sync::Arc;

/// An ERD bound to a destination and a serializer.
pub struct ErdObject<S> {
    bus: ErdBus,
    address: Address,
    erd: Erd,
    serializer: Arc<S>,
}

impl<S> Clone for ErdObject<S> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            address: self.address,
            erd: self.erd,
            serializer: self.serializer.clone(),
        }
    }
}

impl<S> fmt::Debug for ErdObject<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErdObject")
            .field("address", &format_args!("{:#04x}", self.address))
            .field("erd", &format_args!("{:#06x}", self.erd))
            .finish()
    }
}

impl<S: Serializer + 'static> ErdObject<S> {
    pub fn new(bus: ErdBus, address: Address, erd: Erd, serializer: Arc<S>) -> Self {
        Self {
            bus,
            address,
            erd,
            serializer,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn erd(&self) -> Erd {
        self.erd
    }

    /// Reads the ERD and decodes the first returned record.
    pub async fn read(&self) -> Result<S::Value, BusError> {
        let records = self.bus.read(self.address, self.erd).await?;
        let record = records.into_iter().next().ok_or_else(|| {
            BusError::Rejected(format!(
                "read of ERD {:#06x} on {:#04x} returned no data",
                self.erd, self.address
            ))
        })?;
        Ok(self.serializer.deserialize(&record.data)?)
    }

    /// Writes `value`; resolves true when the peer accepted it.
    pub async fn write(&self, value: &S::Value) -> Result<bool, BusError> {
        let data = self.serializer.serialize(value)?;
        let count = self.bus.write(self.address, self.erd, data).await?;
        Ok(count > 0)
    }

    /// Publishes `value` to the bound destination.
    pub async fn publish(&self, value: &S::Value) -> Result<(), BusError> {
        let data = self.serializer.serialize(value)?;
        self.bus.publish(self.address, self.erd, data).await
    }

    /// Subscribes and delivers every decoded publication of this ERD.
    ///
    /// The listener is registered before the request goes out so an
    /// immediate publication is not missed. It is removed again if the
    /// subscription fails or the peer accepts nothing.
    pub async fn subscribe<F>(&self, callback: F) -> Result<PublishListener, BusError>
    where
        F: Fn(Result<S::Value, ProtocolError>) + Send + Sync + 'static,
    {
        let serializer = self.serializer.clone();
        let listener = self.bus.on_publish(self.erd, move |publication| {
            callback(serializer.deserialize(&publication.data))
        });

        let accepted = self.bus.subscribe(self.address, self.erd).await?;
        if accepted == 0 {
            return Err(BusError::Rejected(format!(
                "subscription to ERD {:#06x} on {:#04x} was rejected",
                self.erd, self.address
            )));
        }
        Ok(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::AbstractBus;
    use crate::transport::{Link, MemoryTransport};
    use gea2_protocol::{AsciiSerializer, Endian, Message, ScalarSerializer};
    use parking_lot::Mutex;
    use tokio_test::assert_ok;

    fn setup() -> (ErdBus, Link) {
        let (link, peer) = MemoryTransport::pair();
        (ErdBus::new(AbstractBus::new(0xBB, link)), peer)
    }

    fn reply(command: u16, data: &[u8]) -> Message {
        Message::new(0xC0, 0xBB, command, data.to_vec())
    }

    #[tokio::test]
    async fn test_read_decodes_value() {
        let (bus, mut peer) = setup();
        let mode = bus.create_erd(0xC0, 0x4003, Arc::new(ScalarSerializer::<u8>::default()));

        let (value, _) = tokio::join!(mode.read(), async {
            let request = peer.inbound.recv().await.unwrap();
            assert_eq!(request.data.as_ref(), &[0x01, 0x40, 0x03]);
            peer.transport
                .send(&reply(0xF0, &[0x01, 0x40, 0x03, 0x01, 0x82]))
                .unwrap();
        });
        assert_eq!(assert_ok!(value), 130);
    }

    #[tokio::test]
    async fn test_read_without_data_is_rejected() {
        let (bus, mut peer) = setup();
        let mode = bus.create_erd(0xC0, 0x4003, Arc::new(ScalarSerializer::<u8>::default()));

        let (value, _) = tokio::join!(mode.read(), async {
            peer.inbound.recv().await.unwrap();
            peer.transport.send(&reply(0xF0, &[0x00])).unwrap();
        });
        assert!(matches!(value, Err(BusError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_read_length_mismatch() {
        let (bus, mut peer) = setup();
        let temperature = bus.create_erd(
            0xC0,
            0x1004,
            Arc::new(ScalarSerializer::<u16>::new(Endian::Big)),
        );

        let (value, _) = tokio::join!(temperature.read(), async {
            peer.inbound.recv().await.unwrap();
            peer.transport
                .send(&reply(0xF0, &[0x01, 0x10, 0x04, 0x01, 0x82]))
                .unwrap();
        });
        assert!(matches!(value, Err(BusError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_write_reports_acceptance() {
        let (bus, mut peer) = setup();
        let mode = bus.create_erd(0xC0, 0x4003, Arc::new(ScalarSerializer::<u8>::default()));

        let (accepted, _) = tokio::join!(mode.write(&140), async {
            let request = peer.inbound.recv().await.unwrap();
            assert_eq!(request.data.as_ref(), &[0x01, 0x40, 0x03, 0x01, 0x8C]);
            peer.transport
                .send(&reply(0xF1, &[0x01, 0x40, 0x03]))
                .unwrap();
        });
        assert!(assert_ok!(accepted));

        let (accepted, _) = tokio::join!(mode.write(&140), async {
            peer.inbound.recv().await.unwrap();
            peer.transport.send(&reply(0xF1, &[0x00])).unwrap();
        });
        assert!(!assert_ok!(accepted));
    }

    #[tokio::test]
    async fn test_subscribe_delivers_decoded_publications() {
        let (bus, mut peer) = setup();
        let model = bus.create_erd(0xC0, 0x0001, Arc::new(AsciiSerializer));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut messages = bus.messages();

        let sink = seen.clone();
        let (listener, _) = tokio::join!(
            model.subscribe(move |value| sink.lock().push(value.unwrap())),
            async {
                let request = peer.inbound.recv().await.unwrap();
                assert_eq!(request.command, 0xF2);
                peer.transport.send(&reply(0xF2, &[0x01])).unwrap();
            }
        );
        let listener = assert_ok!(listener);
        messages.recv().await.unwrap();

        peer.transport
            .send(&reply(0xF5, &[0x01, 0x00, 0x01, 0x02, b'G', b'E']))
            .unwrap();
        messages.recv().await.unwrap();
        assert_eq!(seen.lock().as_slice(), &["GE".to_string()]);

        drop(listener);
        peer.transport
            .send(&reply(0xF5, &[0x01, 0x00, 0x01, 0x02, b'X', b'Y']))
            .unwrap();
        messages.recv().await.unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_rejected_detaches_listener() {
        let (bus, mut peer) = setup();
        let mode = bus.create_erd(0xC0, 0x4003, Arc::new(ScalarSerializer::<u8>::default()));
        let calls = Arc::new(Mutex::new(0));
        let mut messages = bus.messages();

        let counter = calls.clone();
        let (result, _) = tokio::join!(
            mode.subscribe(move |_| *counter.lock() += 1),
            async {
                peer.inbound.recv().await.unwrap();
                peer.transport.send(&reply(0xF2, &[0x00])).unwrap();
            }
        );
        assert!(matches!(result, Err(BusError::Rejected(_))));
        messages.recv().await.unwrap();

        peer.transport
            .send(&reply(0xF5, &[0x01, 0x40, 0x03, 0x01, 0x01]))
            .unwrap();
        messages.recv().await.unwrap();
        assert_eq!(*calls.lock(), 0);
    }
}
