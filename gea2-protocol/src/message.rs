//! Bus messages and the extended-command convention.
//!
//! The wire command field is 8 bits wide, but some device commands are
//! logically 16 bits. Those are carried as:
//!
//! ```text
//! +-----------------+------------------+------------------+
//! | command (high)  | data[0] (low)    | data[1..]        |
//! +-----------------+------------------+------------------+
//! ```
//!
//! [`Message::split_extended`] produces that wire form and
//! [`Message::fold_extended`] reverses it on the matching reply.

use crate::BROADCAST_ADDRESS;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// An 8-bit bus participant address.
pub type Address = u8;

/// A 16-bit identifier naming one addressable value on a remote device.
pub type Erd = u16;

/// A complete, fully addressed bus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source: Address,
    pub destination: Address,
    /// 8-bit on the wire; 16-bit once an extended reply has been folded.
    pub command: u16,
    pub data: Bytes,
}

impl Message {
    pub fn new(
        source: Address,
        destination: Address,
        command: u16,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            source,
            destination,
            command,
            data: data.into(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination == BROADCAST_ADDRESS
    }

    /// Returns whether the command needs the extended two-byte form.
    pub fn is_extended(&self) -> bool {
        self.command > 0xFF
    }

    /// Converts a logical 16-bit command into its wire form.
    ///
    /// Returns the wire message together with the low command byte that was
    /// moved into the data, or `None` when the command already fits.
    pub fn split_extended(self) -> (Message, Option<u8>) {
        if !self.is_extended() {
            return (self, None);
        }

        let high = self.command >> 8;
        let low = (self.command & 0xFF) as u8;

        let mut data = BytesMut::with_capacity(self.data.len() + 1);
        data.put_u8(low);
        data.put_slice(&self.data);

        let wire = Message {
            source: self.source,
            destination: self.destination,
            command: high,
            data: data.freeze(),
        };
        (wire, Some(low))
    }

    /// Folds a reply's leading data byte back into a 16-bit command.
    ///
    /// Only succeeds when the first data byte equals `low`; on success that
    /// byte is removed from the data. On failure the message is untouched.
    pub fn fold_extended(&mut self, low: u8) -> bool {
        if self.command > 0xFF || self.data.first() != Some(&low) {
            return false;
        }
        self.data.advance(1);
        self.command = (self.command << 8) | u16::from(low);
        true
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#04x} -> {:#04x} cmd={:#04x} data=[{}]",
            self.source,
            self.destination,
            self.command,
            hex::encode(&self.data)
        )
    }
}

/// A message about to be sent, with optional addressing.
///
/// Unset fields take their defaults when the message is resolved against a
/// bound bus: the bus's own address as source, broadcast as destination and
/// empty data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outbound {
    pub command: u16,
    pub source: Option<Address>,
    pub destination: Option<Address>,
    pub data: Option<Bytes>,
}

impl Outbound {
    pub fn new(command: u16) -> Self {
        Self {
            command,
            ..Default::default()
        }
    }

    pub fn with_destination(mut self, destination: Address) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_source(mut self, source: Address) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Fills unset fields using `bound` as the default source address.
    pub fn resolve(self, bound: Address) -> Message {
        Message {
            source: self.source.unwrap_or(bound),
            destination: self.destination.unwrap_or(BROADCAST_ADDRESS),
            command: self.command,
            data: self.data.unwrap_or_default(),
        }
    }
}
