// src/transport/memory/channel.rs

use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;

use super::MemoryBroker;
use crate::lock::lock_ignore_poison;
use crate::transport::slot::{ChannelSlot, LiveChannel};
use crate::{
    // ---
    log_debug,
    log_error,
    Channel,
    ChannelHandle,
    ChannelHandlePtr,
    ChannelSetup,
    Connection,
    Consumer,
    Delivery,
    MessageProperties,
    QueueOptions,
    Result,
    RpcError,
};

/// One broker channel. Becomes unusable once closed or disconnected.
pub(super) struct MemoryChannel {
    id: u64,
    broker: Arc<MemoryBroker>,
}

impl MemoryChannel {
    pub(super) fn new(id: u64, broker: Arc<MemoryBroker>) -> Self {
        Self { id, broker }
    }
}

impl LiveChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.broker.is_channel_open(self.id)
    }
}

#[async_trait::async_trait]
impl Channel for MemoryChannel {
    // ---
    async fn assert_queue(&self, queue: &str, options: QueueOptions) -> Result<String> {
        self.broker.declare(self.id, queue, options)
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        payload: Bytes,
        properties: MessageProperties,
    ) -> Result<()> {
        self.broker.publish(self.id, queue, payload, properties)
    }

    async fn consume(&self, queue: &str) -> Result<Consumer> {
        self.broker.consume(self.id, queue)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.broker.cancel(self.id, consumer_tag)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.broker.settle(self.id, delivery, None)
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.broker.settle(self.id, delivery, Some(requeue))
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.broker.delete_queue(self.id, queue)
    }

    async fn close(&self) -> Result<()> {
        self.broker.close_channel(self.id);
        Ok(())
    }
}

/// Logical channel: re-opens a [`MemoryChannel`] and re-runs its setup after
/// every broker reconnect, until closed.
pub(super) struct MemoryChannelHandle {
    // ---
    broker: Arc<MemoryBroker>,
    setup: Arc<dyn ChannelSetup>,
    slot: ChannelSlot<MemoryChannel>,
}

impl MemoryChannelHandle {
    pub(super) fn new(broker: Arc<MemoryBroker>, setup: Arc<dyn ChannelSetup>) -> Self {
        Self {
            broker,
            setup,
            slot: ChannelSlot::new(),
        }
    }

    pub(super) fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }

    /// Open a fresh channel and run the setup routine against it, unless
    /// the current channel survived.
    ///
    /// Does nothing while the broker is disconnected; the next
    /// [`MemoryBroker::reconnect`] calls this again.
    pub(super) async fn open_and_setup(&self) {
        // ---
        let opened = self
            .slot
            .refresh(&*self.setup, || async {
                let id = self.broker.open_channel().ok_or(RpcError::ChannelClosed)?;
                Ok::<_, RpcError>(Arc::new(MemoryChannel::new(id, self.broker.clone())))
            })
            .await;

        match opened {
            Ok(_) => {}
            Err(RpcError::ChannelClosed) => {
                log_debug!("memory: broker disconnected, channel setup deferred");
            }
            Err(err) => {
                log_error!("memory: channel setup failed: {err}");
            }
        }
    }
}

#[async_trait::async_trait]
impl ChannelHandle for MemoryChannelHandle {
    // ---
    async fn send_to_queue(
        &self,
        queue: &str,
        payload: Bytes,
        properties: MessageProperties,
    ) -> Result<()> {
        // ---
        match self.slot.current() {
            Some(channel) => channel.send_to_queue(queue, payload, properties).await,
            None => Err(RpcError::ChannelClosed),
        }
    }

    async fn close(&self) -> Result<()> {
        self.broker.note_handle_close();
        self.slot.close().await
    }
}

/// Connection to a [`MemoryBroker`].
pub(super) struct MemoryConnection {
    broker: Arc<MemoryBroker>,
    handles: Mutex<Vec<Weak<MemoryChannelHandle>>>,
}

impl MemoryConnection {
    pub(super) fn new(broker: Arc<MemoryBroker>) -> Self {
        Self {
            broker,
            handles: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    // ---
    async fn create_channel(&self, setup: Arc<dyn ChannelSetup>) -> Result<ChannelHandlePtr> {
        // ---
        let handle = Arc::new(MemoryChannelHandle::new(self.broker.clone(), setup));

        self.broker.register_handle(Arc::downgrade(&handle));
        {
            let mut handles = lock_ignore_poison(&self.handles);
            handles.retain(|weak| weak.upgrade().is_some_and(|h| !h.is_closed()));
            handles.push(Arc::downgrade(&handle));
        }

        handle.open_and_setup().await;
        Ok(handle)
    }

    fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    async fn close(&self) -> Result<()> {
        // ---
        let handles: Vec<Arc<MemoryChannelHandle>> = lock_ignore_poison(&self.handles)
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();

        for handle in handles {
            if !handle.is_closed() {
                handle.close().await?;
            }
        }
        Ok(())
    }
}
