//! Channel provider implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Connection` trait. Broker-backed providers are hidden behind feature
//! flags and exposed only through constructor functions.
//!
//! Domain code must not depend on provider-specific types.

mod memory;
mod slot;

#[cfg(feature = "transport_lapin")]
mod amqp;

#[cfg(feature = "transport_lapin")]
pub use amqp::create_lapin_connection;

pub use memory::{
    //
    create_memory_connection,
    create_memory_connection_with_broker,
    BrokerStats,
    MemoryBroker,
};
