// src/domain/channel.rs

//! Channel provider abstractions.
//!
//! A [`Connection`] hands out logical channels. Each logical channel is
//! represented by a [`ChannelHandle`] and is configured by a caller-supplied
//! [`ChannelSetup`] routine. The provider runs that routine against a live
//! [`Channel`] once the channel is open, and runs it **again** every time it
//! has to recreate the underlying channel (for example after the broker
//! connection dropped and came back). Setup routines must therefore be
//! idempotent or guard their side effects themselves.
//!
//! Callers must not assume one physical connection per logical channel, nor
//! that the `Channel` passed to one setup invocation is still usable after
//! the next one.
//!
//! Inbound messages are delivered by message passing: [`Channel::consume`]
//! returns a [`Consumer`] whose `inbox` yields [`Delivery`] values until the
//! consumer is cancelled or its channel goes away.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{CorrelationId, Result};

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    /// Queue survives a broker restart.
    pub durable: bool,
    /// Queue is private to the declaring channel and dies with it.
    pub exclusive: bool,
    /// Queue is deleted once its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Durable, shared queue used as a route's work queue.
    pub fn worker() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Transient queue owned by a single call.
    pub fn reply() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Transport metadata attached to a message, outside of its payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<Arc<str>>,
    pub reply_to: Option<Arc<str>>,
}

impl MessageProperties {
    /// Metadata for a request that expects a reply on `reply_to`.
    pub fn request(correlation_id: &CorrelationId, reply_to: &str) -> Self {
        // ---
        Self {
            correlation_id: Some(correlation_id.to_shared()),
            reply_to: Some(Arc::from(reply_to)),
        }
    }

    /// Metadata for a reply to the request carrying `correlation_id`.
    pub fn reply(correlation_id: Arc<str>) -> Self {
        // ---
        Self {
            correlation_id: Some(correlation_id),
            reply_to: None,
        }
    }
}

/// A message handed to a consumer.
///
/// Must be settled with [`Channel::ack`] or [`Channel::nack`] on the channel
/// it was received from.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned tag, unique per channel.
    pub delivery_tag: u64,
    /// Queue the message was consumed from.
    pub queue: Arc<str>,
    /// Consumer the message was dispatched to.
    pub consumer_tag: Arc<str>,
    pub properties: MessageProperties,
    pub payload: Bytes,
    /// `true` if the message was delivered before and not acknowledged.
    pub redelivered: bool,
}

impl Delivery {
    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }
}

/// An active queue subscription.
///
/// The inbox closes when the consumer is cancelled, its queue is deleted or
/// its channel is closed.
pub struct Consumer {
    pub tag: String,
    pub inbox: mpsc::UnboundedReceiver<Delivery>,
}

/// A live broker channel, as seen by a [`ChannelSetup`] routine.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    // ---
    /// Declare `queue` (or assert that it exists) and return its name.
    ///
    /// An empty name asks the broker to generate one.
    async fn assert_queue(&self, queue: &str, options: QueueOptions) -> Result<String>;

    /// Publish `payload` to `queue` through the default exchange.
    async fn send_to_queue(
        &self,
        queue: &str,
        payload: Bytes,
        properties: MessageProperties,
    ) -> Result<()>;

    /// Start consuming `queue`.
    async fn consume(&self, queue: &str) -> Result<Consumer>;

    /// Stop the consumer identified by `consumer_tag`.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Acknowledge a delivery.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Reject a delivery, optionally putting it back on its queue.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()>;

    /// Delete `queue`, dropping its messages and consumers.
    async fn delete_queue(&self, queue: &str) -> Result<()>;

    /// Close the channel.
    async fn close(&self) -> Result<()>;
}

/// Shared channel pointer.
pub type ChannelPtr = Arc<dyn Channel>;

/// Routine that prepares a freshly opened channel.
///
/// Invoked at least once per connected handle, and once more after every
/// channel recreation. A failing setup is logged by the provider and retried
/// on the next recreation.
#[async_trait::async_trait]
pub trait ChannelSetup: Send + Sync {
    async fn setup(&self, channel: ChannelPtr) -> Result<()>;
}

/// Logical channel returned by [`Connection::create_channel`].
///
/// Survives reconnects: operations go to whichever underlying channel is
/// current.
#[async_trait::async_trait]
pub trait ChannelHandle: Send + Sync {
    // ---
    /// Publish on the current underlying channel.
    async fn send_to_queue(
        &self,
        queue: &str,
        payload: Bytes,
        properties: MessageProperties,
    ) -> Result<()>;

    /// Close the logical channel. Later calls are no-ops.
    async fn close(&self) -> Result<()>;
}

/// Shared channel handle pointer.
pub type ChannelHandlePtr = Arc<dyn ChannelHandle>;

/// Connection manager owning the broker connection.
///
/// The connection is shared and externally managed: it may drop and recover
/// at any time, re-running the setup of every open handle.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    // ---
    /// Open a logical channel prepared by `setup`.
    ///
    /// If the connection is up, `setup` has run once by the time this
    /// returns. Otherwise it runs when the connection recovers.
    async fn create_channel(&self, setup: Arc<dyn ChannelSetup>) -> Result<ChannelHandlePtr>;

    /// `true` while the broker connection is established.
    fn is_connected(&self) -> bool;

    /// Close every open handle and the connection itself.
    async fn close(&self) -> Result<()>;
}

/// Shared connection pointer.
///
/// An `Arc<dyn Connection>`: cheap to clone, all clones share the same
/// broker connection.
pub type ConnectionPtr = Arc<dyn Connection>;
