//! Aggregation of per-ERD answers into one reply frame.
//!
//! An inbound multi-item request is fanned out as one event per ERD, each
//! carrying its own responder. All responders of one request share an
//! aggregator that emits the reply exactly once, the moment the number of
//! successes plus errors reaches the item count. Answers may arrive in any
//! order and from any task.
//!
//! A responder dropped without an answer counts as an error, so the reply
//! is always sent.

use crate::bus::AbstractBus;
use bytes::Bytes;
use gea2_protocol::{
    encode_erd_ids, encode_records, encode_subscribe_reply, Erd, ErdRecord, Message, Outbound,
    ProtocolError,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

type Encode<T> = fn(&[T]) -> Result<Bytes, ProtocolError>;

struct Tally<T> {
    expected: usize,
    successes: Vec<T>,
    errors: usize,
    emitted: bool,
}

impl<T> Tally<T> {
    fn take_if_complete(&mut self) -> Option<Vec<T>> {
        if self.emitted || self.successes.len() + self.errors != self.expected {
            return None;
        }
        self.emitted = true;
        Some(std::mem::take(&mut self.successes))
    }
}

struct Aggregator<T> {
    bus: AbstractBus,
    source: gea2_protocol::Address,
    command: u16,
    encode: Encode<T>,
    tally: Mutex<Tally<T>>,
}

impl<T> Aggregator<T> {
    fn new(expected: usize, bus: &AbstractBus, request: &Message, encode: Encode<T>) -> Arc<Self> {
        let aggregator = Arc::new(Self {
            bus: bus.clone(),
            source: request.source,
            command: request.command,
            encode,
            tally: Mutex::new(Tally {
                expected,
                successes: Vec::with_capacity(expected),
                errors: 0,
                emitted: false,
            }),
        });

        let ready = aggregator.tally.lock().take_if_complete();
        if let Some(successes) = ready {
            aggregator.emit(successes);
        }
        aggregator
    }

    fn success(&self, item: T) {
        let ready = {
            let mut tally = self.tally.lock();
            if tally.emitted {
                tracing::warn!("Answer for {:#04x} after its reply was sent", self.command);
                return;
            }
            tally.successes.push(item);
            tally.take_if_complete()
        };
        if let Some(successes) = ready {
            self.emit(successes);
        }
    }

    fn error(&self) {
        let ready = {
            let mut tally = self.tally.lock();
            if tally.emitted {
                tracing::warn!("Answer for {:#04x} after its reply was sent", self.command);
                return;
            }
            tally.errors += 1;
            tally.take_if_complete()
        };
        if let Some(successes) = ready {
            self.emit(successes);
        }
    }

    fn emit(&self, successes: Vec<T>) {
        let data = match (self.encode)(&successes) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Cannot encode {:#04x} reply: {}", self.command, e);
                return;
            }
        };

        let outbound = Outbound::new(self.command)
            .with_destination(self.source)
            .with_data(data);
        if let Err(e) = self.bus.transmit(outbound) {
            tracing::warn!(
                "Failed to send {:#04x} reply to {:#04x}: {}",
                self.command,
                self.source,
                e
            );
        }
    }
}

/// Answers one ERD of an inbound read request.
pub struct ErdReadResponder {
    erd: Erd,
    aggregator: Option<Arc<Aggregator<ErdRecord>>>,
}

impl ErdReadResponder {
    pub fn erd(&self) -> Erd {
        self.erd
    }

    /// Supplies the ERD's value. Values over 255 bytes count as an error.
    pub fn success(mut self, data: impl Into<Bytes>) {
        let data = data.into();
        if let Some(aggregator) = self.aggregator.take() {
            if data.len() > u8::MAX as usize {
                tracing::warn!(
                    "ERD {:#06x} value of {} bytes does not fit a read reply",
                    self.erd,
                    data.len()
                );
                aggregator.error();
            } else {
                aggregator.success(ErdRecord::new(self.erd, data));
            }
        }
    }

    pub fn error(mut self) {
        if let Some(aggregator) = self.aggregator.take() {
            aggregator.error();
        }
    }
}

impl Drop for ErdReadResponder {
    fn drop(&mut self) {
        if let Some(aggregator) = self.aggregator.take() {
            tracing::debug!("Read of ERD {:#06x} dropped unanswered", self.erd);
            aggregator.error();
        }
    }
}

impl fmt::Debug for ErdReadResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErdReadResponder")
            .field("erd", &self.erd)
            .field("answered", &self.aggregator.is_none())
            .finish()
    }
}

/// Answers one ERD of an inbound write request.
pub struct ErdWriteResponder {
    erd: Erd,
    aggregator: Option<Arc<Aggregator<Erd>>>,
}

impl ErdWriteResponder {
    pub fn erd(&self) -> Erd {
        self.erd
    }

    pub fn success(mut self) {
        if let Some(aggregator) = self.aggregator.take() {
            aggregator.success(self.erd);
        }
    }

    pub fn error(mut self) {
        if let Some(aggregator) = self.aggregator.take() {
            aggregator.error();
        }
    }
}

impl Drop for ErdWriteResponder {
    fn drop(&mut self) {
        if let Some(aggregator) = self.aggregator.take() {
            tracing::debug!("Write of ERD {:#06x} dropped unanswered", self.erd);
            aggregator.error();
        }
    }
}

impl fmt::Debug for ErdWriteResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErdWriteResponder")
            .field("erd", &self.erd)
            .field("answered", &self.aggregator.is_none())
            .finish()
    }
}

/// Accepts or rejects one ERD of an inbound subscribe request.
pub struct ErdSubscribeResponder {
    erd: Erd,
    aggregator: Option<Arc<Aggregator<()>>>,
}

impl ErdSubscribeResponder {
    pub fn erd(&self) -> Erd {
        self.erd
    }

    pub fn success(mut self) {
        if let Some(aggregator) = self.aggregator.take() {
            aggregator.success(());
        }
    }

    pub fn error(mut self) {
        if let Some(aggregator) = self.aggregator.take() {
            aggregator.error();
        }
    }
}

impl Drop for ErdSubscribeResponder {
    fn drop(&mut self) {
        if let Some(aggregator) = self.aggregator.take() {
            tracing::debug!("Subscribe to ERD {:#06x} dropped unanswered", self.erd);
            aggregator.error();
        }
    }
}

impl fmt::Debug for ErdSubscribeResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErdSubscribeResponder")
            .field("erd", &self.erd)
            .field("answered", &self.aggregator.is_none())
            .finish()
    }
}

fn encode_write_reply(erds: &[Erd]) -> Result<Bytes, ProtocolError> {
    encode_erd_ids(erds)
}

fn encode_subscribe_count(accepted: &[()]) -> Result<Bytes, ProtocolError> {
    let count =
        u8::try_from(accepted.len()).map_err(|_| ProtocolError::TooManyItems(accepted.len()))?;
    Ok(encode_subscribe_reply(count))
}

/// Responders for every ERD of a read request, sharing one reply.
pub(crate) fn read_responders(
    bus: &AbstractBus,
    request: &Message,
    erds: &[Erd],
) -> Vec<ErdReadResponder> {
    let aggregator = Aggregator::new(erds.len(), bus, request, encode_records);
    erds.iter()
        .map(|&erd| ErdReadResponder {
            erd,
            aggregator: Some(aggregator.clone()),
        })
        .collect()
}

/// Responders for every ERD of a write request, sharing one reply.
pub(crate) fn write_responders(
    bus: &AbstractBus,
    request: &Message,
    erds: &[Erd],
) -> Vec<ErdWriteResponder> {
    let aggregator = Aggregator::new(erds.len(), bus, request, encode_write_reply);
    erds.iter()
        .map(|&erd| ErdWriteResponder {
            erd,
            aggregator: Some(aggregator.clone()),
        })
        .collect()
}

/// Responders for every ERD of a subscribe request, sharing one reply.
pub(crate) fn subscribe_responders(
    bus: &AbstractBus,
    request: &Message,
    erds: &[Erd],
) -> Vec<ErdSubscribeResponder> {
    let aggregator = Aggregator::new(erds.len(), bus, request, encode_subscribe_count);
    erds.iter()
        .map(|&erd| ErdSubscribeResponder {
            erd,
            aggregator: Some(aggregator.clone()),
        })
        .collect()
}
