//! Domain layer public interface.
//!
//! Defines the channel-provider abstraction the RPC client and worker are
//! written against. Nothing here refers to a concrete broker or client
//! library; implementations live under `src/transport/`.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod channel;

pub use channel::{
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
