//! Byte framing for GEA2 messages on stream transports.
//!
//! Packet layout (4 bytes header + data):
//!
//! ```text
//! +-------------+--------+--------+---------+-------------+
//! | destination | size   | source | command | data        |
//! | 1 byte      | 1 byte | 1 byte | 1 byte  | size - 8    |
//! +-------------+--------+--------+---------+-------------+
//! ```
//!
//! The size byte counts the data plus the eight bytes of link overhead a
//! physical GEA2 frame carries (header, checksum and delimiters), so it is
//! always `data.len() + 8`.

use crate::error::ProtocolError;
use crate::message::Message;
use bytes::{Buf, BufMut, BytesMut};

/// Size of the packet header in bytes.
pub const PACKET_HEADER_SIZE: usize = 4;

/// Link overhead included in the size byte.
pub const PACKET_OVERHEAD: usize = 8;

/// Largest data payload that fits the size byte.
pub const MAX_PACKET_DATA: usize = u8::MAX as usize - PACKET_OVERHEAD;

/// Encoder and decoder for the packet layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Packet;

impl Packet {
    /// Encodes a wire message.
    ///
    /// Extended commands must be split before encoding.
    pub fn encode(message: &Message) -> Result<BytesMut, ProtocolError> {
        let command = u8::try_from(message.command)
            .map_err(|_| ProtocolError::CommandNotWireable(message.command))?;

        if message.data.len() > MAX_PACKET_DATA {
            return Err(ProtocolError::PacketTooLarge {
                size: message.data.len(),
                max: MAX_PACKET_DATA,
            });
        }

        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + message.data.len());
        buf.put_u8(message.destination);
        buf.put_u8((message.data.len() + PACKET_OVERHEAD) as u8);
        buf.put_u8(message.source);
        buf.put_u8(command);
        buf.put_slice(&message.data);

        Ok(buf)
    }

    /// Decodes one packet from the front of `buf`.
    ///
    /// Returns `Ok(Some(message))` if a complete packet was decoded,
    /// `Ok(None)` if more data is needed, or `Err` when the size byte is
    /// impossible.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let size = buf[1];
        if (size as usize) < PACKET_OVERHEAD {
            return Err(ProtocolError::InvalidPacket(size));
        }

        let data_len = size as usize - PACKET_OVERHEAD;
        if buf.len() < PACKET_HEADER_SIZE + data_len {
            return Ok(None);
        }

        let destination = buf.get_u8();
        buf.advance(1);
        let source = buf.get_u8();
        let command = buf.get_u8();
        let data = buf.split_to(data_len).freeze();

        Ok(Some(Message {
            source,
            destination,
            command: u16::from(command),
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_encode_layout() {
        let message = Message::new(0xBB, 0xC0, 0xF0, vec![0x01, 0x40, 0x03]);
        let encoded = Packet::encode(&message).unwrap();
        assert_eq!(
            encoded.as_ref(),
            &[0xC0, 11, 0xBB, 0xF0, 0x01, 0x40, 0x03]
        );
    }

    #[test]
    fn test_packet_roundtrip() {
        let message = Message::new(0xC0, 0xBB, 0xF0, vec![0x01, 0x40, 0x03, 0x01, 0x82]);
        let mut buf = Packet::encode(&message).unwrap();
        let decoded = Packet::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_data() {
        let message = Message::new(0xBB, 0xFF, 0x01, Bytes::new());
        let mut buf = Packet::encode(&message).unwrap();
        assert_eq!(buf[1], 8);
        assert_eq!(Packet::decode(&mut buf).unwrap().unwrap(), message);
    }

    #[test]
    fn test_incomplete_packet() {
        let mut buf = BytesMut::from(&[0xC0u8][..]);
        assert!(Packet::decode(&mut buf).unwrap().is_none());

        // Header says three data bytes, only one present.
        let mut buf = BytesMut::from(&[0xC0u8, 11, 0xBB, 0xF0, 0x01][..]);
        assert!(Packet::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_invalid_size_byte() {
        let mut buf = BytesMut::from(&[0xC0u8, 3, 0xBB, 0xF0][..]);
        assert!(matches!(
            Packet::decode(&mut buf),
            Err(ProtocolError::InvalidPacket(3))
        ));
    }

    #[test]
    fn test_extended_command_rejected() {
        let message = Message::new(0xBB, 0xC0, 0xDE10, Bytes::new());
        assert!(matches!(
            Packet::encode(&message),
            Err(ProtocolError::CommandNotWireable(0xDE10))
        ));
    }

    #[test]
    fn test_packet_too_large() {
        let message = Message::new(0xBB, 0xC0, 0xF1, vec![0u8; MAX_PACKET_DATA + 1]);
        assert!(matches!(
            Packet::encode(&message),
            Err(ProtocolError::PacketTooLarge { .. })
        ));

        let message = Message::new(0xBB, 0xC0, 0xF1, vec![0u8; MAX_PACKET_DATA]);
        let mut buf = Packet::encode(&message).unwrap();
        assert_eq!(buf[1], 0xFF);
        assert_eq!(Packet::decode(&mut buf).unwrap().unwrap(), message);
    }

    #[test]
    fn test_multiple_packets_in_buffer() {
        let first = Message::new(0xBB, 0xC0, 0xF0, vec![0x01, 0x40, 0x03]);
        let second = Message::new(0xC0, 0xBB, 0xF5, Bytes::new());

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Packet::encode(&first).unwrap());
        buf.extend_from_slice(&Packet::encode(&second).unwrap());

        assert_eq!(Packet::decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(Packet::decode(&mut buf).unwrap().unwrap(), second);
        assert!(Packet::decode(&mut buf).unwrap().is_none());
    }
}
