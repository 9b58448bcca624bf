//! Bus layers for GEA2 appliance communication.
//!
//! This crate provides:
//! - The transport contract and a registry of transports keyed by name
//! - [`AbstractBus`]: addressing, extended commands and reply correlation
//! - [`QueuedDispatcher`]: one outstanding request per operation class
//! - [`ErdBus`]: ERD read, write, subscribe and publish with inbound routing
//! - [`ErdObject`]: a typed ERD bound to one peer
//! - [`ApplianceBus`]: version auto-responder, discovery and profiles
//!
//! # Example
//!
//! ```rust,ignore
//! use gea2_bus::{Config, ProfileRegistry, TransportRegistry};
//! use gea2_protocol::ScalarSerializer;
//! use std::sync::Arc;
//!
//! let config = Config::load()?;
//! let transports = TransportRegistry::default();
//! let bus = gea2_bus::bind(&config, &transports, &ProfileRegistry::new()).await?;
//!
//! let mode = bus.create_erd(0xC0, 0x4003, Arc::new(ScalarSerializer::<u8>::default()));
//! println!("mode = {}", mode.read().await?);
//! ```

pub mod appliance;
pub mod bus;
pub mod config;
pub mod erd;
pub mod error;
pub mod listener;
pub mod object;
pub mod queue;
pub mod responder;
pub mod transport;

pub use appliance::{
    bind, ApplianceBus, Profile, ProfileFactory, ProfileRegistry, VersionAnnouncement,
};
pub use bus::{AbstractBus, MessageFilter};
pub use config::{ApplianceConfig, BusConfig, Config, ConfigError, TransportConfig};
pub use erd::{ErdBus, ErdEvent, ErdRequest, ErdSubscribeRequest, ErdWriteRequest};
pub use error::BusError;
pub use listener::{ErdPublication, PublishListener};
pub use object::ErdObject;
pub use queue::{OperationClass, QueuedDispatcher};
pub use responder::{ErdReadResponder, ErdSubscribeResponder, ErdWriteResponder};
pub use transport::{
    BoxFuture, Link, MemoryTransport, TcpTransport, Transport, TransportFactory, TransportRegistry,
};
