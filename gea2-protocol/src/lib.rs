//! # gea2-protocol
//!
//! Wire-level building blocks for the GEA2 appliance bus.
//!
//! This crate provides:
//! - Endian-aware stream reader and writer
//! - Bus messages and the extended 16-bit command convention
//! - ERD read/write/subscribe/publish frame classification and encoding
//! - Value serializers, typed and dynamically selected
//! - Byte framing for stream transports

pub mod codec;
pub mod erd;
pub mod error;
pub mod message;
pub mod packet;
pub mod serializer;
pub mod stream;

pub use codec::{PacketDecoder, PacketEncoder};
pub use erd::{
    encode_erd_ids, encode_records, encode_subscribe_reply, encode_subscribe_request,
    ErdCommand, ErdFrame, ErdList, ErdRecord, SubscribeItem,
};
pub use error::ProtocolError;
pub use message::{Address, Erd, Message, Outbound};
pub use packet::{Packet, MAX_PACKET_DATA};
pub use serializer::{
    parse_unsigned, AsciiSerializer, DynamicSerializer, HexSerializer, RawSerializer, Scalar,
    ScalarSerializer, Serializer, Value, ValueKind,
};
pub use stream::{Endian, StreamReader, StreamWriter};

/// Destination address that every participant accepts.
pub const BROADCAST_ADDRESS: Address = 0xFF;

/// Version query and announcement command.
pub const COMMAND_VERSION: u16 = 0x01;

/// Default source address for a bus participant.
pub const DEFAULT_ADDRESS: Address = 0xBB;

/// Default reply timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 500;
