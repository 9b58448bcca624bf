//! Encoder and decoder for GEA2 packets on byte streams.

use crate::error::ProtocolError;
use crate::message::Message;
use crate::packet::Packet;
use bytes::{Bytes, BytesMut};

/// Encodes wire messages into packets.
pub struct PacketEncoder;

impl PacketEncoder {
    /// Encodes a wire message. Extended commands must already be split.
    pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
        Ok(Packet::encode(message)?.freeze())
    }
}

/// Accumulates stream bytes and yields complete messages.
pub struct PacketDecoder {
    buffer: BytesMut,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next message from the buffer.
    pub fn decode(&mut self) -> Result<Option<Message>, ProtocolError> {
        Packet::decode(&mut self.buffer)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}
