//! Fire-and-forget and correlated request/response calls over message-queue
//! work queues.
//!
//! A route is a named, durable work queue. [`RpcClient::send`] drops a
//! message on it and returns; [`RpcClient::call`] publishes a request tagged
//! with a fresh correlation id and a private reply queue, then waits for the
//! matching reply, a timeout, or a send failure, whichever happens first.
//! Every call releases its channel exactly once and never publishes its
//! request twice, even when the broker connection drops and recovers while
//! the call is in flight.
//!
//! The broker is reached through the [`Connection`] abstraction: an
//! in-process broker is always available (see [`MemoryBroker`]), AMQP 0-9-1
//! via lapin behind the `transport_lapin` feature.
//!

// Logging macros first, so every module below can use them.
mod macros;
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Import all sub modules once...
mod client;
mod domain;
mod service;
mod transport;
mod worker;

mod queues;
mod rpc_config;

mod correlation;
mod error;
mod lock;

pub mod protocol;

// Re-export main types
pub use client::RpcClient;
pub use worker::{spawn_worker, WorkerHandle};

pub use rpc_config::{RouteConfig, RpcConfig};
pub use service::{create_connection, RpcService};

pub use correlation::CorrelationId;
pub use error::{Result, RpcError};

pub use queues::{assert_reply_queue, assert_worker_queue};

pub use transport::{
    //
    create_memory_connection,
    create_memory_connection_with_broker,
    BrokerStats,
    MemoryBroker,
};

#[cfg(feature = "transport_lapin")]
pub use transport::create_lapin_connection;

// --- public re-exports
pub use domain::{
    //
    Channel,
    ChannelHandle,
    ChannelHandlePtr,
    ChannelPtr,
    ChannelSetup,
    Connection,
    ConnectionPtr,
    Consumer,
    Delivery,
    MessageProperties,
    QueueOptions,
};
