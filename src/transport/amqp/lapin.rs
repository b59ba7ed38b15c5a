//! AMQP channel provider using `lapin`.
//!
//! ## Concurrency model
//!
//! - One shared broker connection per [`LapinConnection`].
//! - Every logical channel ([`LapinChannelHandle`]) owns its own AMQP
//!   channel, recreated whenever it is lost.
//! - Each `consume()` spawns a forwarding task that turns the lapin consumer
//!   stream into the domain [`Consumer`] inbox. The task ends when the
//!   consumer is cancelled, the channel closes or the inbox is dropped.
//!
//! ## Connection behavior
//!
//! The first connection attempt happens in [`create_connection`] and its
//! failure is returned to the caller. Afterwards a supervisor task checks
//! the connection every `reconnect_delay`. When the connection is gone it
//! reconnects and re-runs the setup of every open handle; when only a
//! handle's channel died (for example after a failed declare) it recreates
//! just that channel.
//!
//! ## Message mapping
//!
//! - Publishing goes through the default exchange with the queue name as
//!   routing key.
//! - `correlation_id` and `reply_to` map to the AMQP basic properties of the
//!   same name.
//! - Acks and nacks are explicit; consumers never use auto-ack.

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties,
    ConnectionProperties,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::lock::lock_ignore_poison;
use crate::transport::slot::{ChannelSlot, LiveChannel, Refresh};
use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    Channel,
    ChannelHandle,
    ChannelHandlePtr,
    ChannelSetup,
    Connection,
    ConnectionPtr,
    Consumer,
    Delivery,
    MessageProperties,
    QueueOptions,
    Result,
    RpcConfig,
    RpcError,
};

fn transport_err(what: &str, err: lapin::Error) -> RpcError {
    RpcError::Transport(format!("amqp: {what} failed: {err}"))
}

/// A live AMQP channel.
struct LapinChannel {
    // ---
    name: Arc<str>,
    channel: lapin::Channel,
}

impl LiveChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

#[async_trait::async_trait]
impl Channel for LapinChannel {
    // ---
    async fn assert_queue(&self, queue: &str, options: QueueOptions) -> Result<String> {
        // ---
        let queue_opts = QueueDeclareOptions {
            passive: false,
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            nowait: false,
        };

        let declared = self
            .channel
            .queue_declare(queue.into(), queue_opts, FieldTable::default())
            .await
            .map_err(|e| transport_err("queue declare", e))?;

        let name = declared.name().as_str().to_string();
        log_debug!("[{}] Declared queue: {name}", self.name);
        Ok(name)
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        payload: Bytes,
        properties: MessageProperties,
    ) -> Result<()> {
        // ---
        let mut amqp_props = BasicProperties::default();
        if let Some(correlation_id) = properties.correlation_id.as_deref() {
            amqp_props = amqp_props.with_correlation_id(correlation_id.into());
        }
        if let Some(reply_to) = properties.reply_to.as_deref() {
            amqp_props = amqp_props.with_reply_to(reply_to.into());
        }

        self.channel
            .basic_publish(
                "".into(),    // default exchange
                queue.into(), // routing key = queue name
                BasicPublishOptions::default(),
                &payload,
                amqp_props,
            )
            .await
            .map_err(|e| transport_err("publish", e))?;

        log_debug!("[{}] Published to queue: {queue}", self.name);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Consumer> {
        // ---
        let tag = format!("{}-{}", self.name, uuid::Uuid::new_v4());

        let stream = self
            .channel
            .basic_consume(
                queue.into(),
                tag.as_str().into(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| transport_err("consume", e))?;

        log_debug!("[{}] Started consuming queue: {queue}", self.name);

        let (tx, inbox) = mpsc::unbounded_channel();
        let queue: Arc<str> = Arc::from(queue);
        let consumer_tag: Arc<str> = Arc::from(tag.as_str());
        let name = self.name.clone();

        tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut stream = stream;
            while let Some(delivery_result) = stream.next().await {
                match delivery_result {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            delivery_tag: delivery.delivery_tag,
                            queue: queue.clone(),
                            consumer_tag: consumer_tag.clone(),
                            properties: MessageProperties {
                                correlation_id: delivery
                                    .properties
                                    .correlation_id()
                                    .as_ref()
                                    .map(|id| Arc::from(id.as_str())),
                                reply_to: delivery
                                    .properties
                                    .reply_to()
                                    .as_ref()
                                    .map(|to| Arc::from(to.as_str())),
                            },
                            payload: Bytes::from(delivery.data),
                            redelivered: delivery.redelivered,
                        };
                        if tx.send(delivery).is_err() {
                            break;
                        }
                    }
                    Err(_e) => {
                        log_warn!("[{name}] Consumer error on {queue}: {_e}");
                        break;
                    }
                }
            }
            log_debug!("[{name}] Consumer task ended for queue: {queue}");
        });

        Ok(Consumer { tag, inbox })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag.into(), BasicCancelOptions::default())
            .await
            .map_err(|e| transport_err("cancel", e))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.channel
            .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| transport_err("ack", e))
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        // ---
        let options = BasicNackOptions {
            multiple: false,
            requeue,
        };
        self.channel
            .basic_nack(delivery.delivery_tag, options)
            .await
            .map_err(|e| transport_err("nack", e))
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        // ---
        self.channel
            .queue_delete(queue.into(), QueueDeleteOptions::default())
            .await
            .map_err(|e| transport_err("queue delete", e))?;
        log_debug!("[{}] Deleted queue: {queue}", self.name);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        if !self.is_open() {
            return Ok(());
        }
        self.channel
            .close(200, "Normal shutdown".into())
            .await
            .map_err(|e| transport_err("channel close", e))
    }
}

/// Logical channel that survives reconnects.
///
/// The first open in `create_channel` and the supervisor's recovery go
/// through the same [`ChannelSlot`], so they never both replace a channel:
/// whichever comes second finds the fresh channel live and keeps it.
struct LapinChannelHandle {
    // ---
    name: Arc<str>,
    setup: Arc<dyn ChannelSetup>,
    slot: ChannelSlot<LapinChannel>,
}

impl LapinChannelHandle {
    // ---
    fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }

    fn needs_channel(&self) -> bool {
        self.slot.needs_channel()
    }

    /// Open a fresh AMQP channel on `connection` and run the setup routine,
    /// unless the current channel is still open.
    async fn open_and_setup(&self, connection: &lapin::Connection) {
        // ---
        let opened = self
            .slot
            .refresh(&*self.setup, || async {
                let channel = connection
                    .create_channel()
                    .await
                    .map_err(|e| transport_err("channel creation", e))?;
                Ok::<_, RpcError>(Arc::new(LapinChannel {
                    name: self.name.clone(),
                    channel,
                }))
            })
            .await;

        match opened {
            Ok(Refresh::Opened) => {
                log_debug!("[{}] amqp: channel opened and set up", self.name);
            }
            Ok(Refresh::Kept) => {}
            Err(_err) => {
                log_error!("[{}] amqp: channel setup failed: {_err}", self.name);
            }
        }
    }
}

#[async_trait::async_trait]
impl ChannelHandle for LapinChannelHandle {
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
        self.slot.close().await
    }
}

/// State shared between the connection and its supervisor task.
struct Shared {
    // ---
    uri: String,
    name: Arc<str>,
    current: Mutex<Option<Arc<lapin::Connection>>>,
    handles: Mutex<Vec<Weak<LapinChannelHandle>>>,
    closed: AtomicBool,
}

impl Shared {
    fn connection(&self) -> Option<Arc<lapin::Connection>> {
        lock_ignore_poison(&self.current).clone()
    }

    fn is_connected(&self) -> bool {
        self.connection()
            .is_some_and(|connection| connection.status().connected())
    }

    fn live_handles(&self) -> Vec<Arc<LapinChannelHandle>> {
        // ---
        let mut handles = lock_ignore_poison(&self.handles);
        handles.retain(|weak| weak.upgrade().is_some_and(|h| !h.is_closed()));
        handles.iter().filter_map(Weak::upgrade).collect()
    }
}

/// AMQP connection manager.
pub struct LapinConnection {
    // ---
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl Connection for LapinConnection {
    // ---
    async fn create_channel(&self, setup: Arc<dyn ChannelSetup>) -> Result<ChannelHandlePtr> {
        // ---
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(RpcError::ChannelClosed);
        }

        let handle = Arc::new(LapinChannelHandle {
            name: self.shared.name.clone(),
            setup,
            slot: ChannelSlot::new(),
        });
        lock_ignore_poison(&self.shared.handles).push(Arc::downgrade(&handle));

        match self.shared.connection() {
            Some(connection) if connection.status().connected() => {
                handle.open_and_setup(&connection).await;
            }
            _ => {
                log_debug!(
                    "[{}] amqp: not connected, channel setup deferred",
                    self.shared.name
                );
            }
        }

        Ok(handle)
    }

    fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(supervisor) = lock_ignore_poison(&self.supervisor).take() {
            supervisor.abort();
        }

        for handle in self.shared.live_handles() {
            let _ = handle.close().await;
        }

        let current = lock_ignore_poison(&self.shared.current).take();
        if let Some(connection) = current {
            connection
                .close(200, "Normal shutdown".into())
                .await
                .map_err(|e| transport_err("connection close", e))?;
        }

        log_info!("[{}] AMQP connection closed", self.shared.name);
        Ok(())
    }
}

impl Drop for LapinConnection {
    fn drop(&mut self) {
        if let Some(supervisor) = lock_ignore_poison(&self.supervisor).take() {
            supervisor.abort();
        }
    }
}

/// Reconnect loop; exits once the connection is closed or dropped.
async fn supervise(shared: Weak<Shared>, delay: Duration) {
    // ---
    loop {
        tokio::time::sleep(delay).await;

        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }

        if !shared.is_connected() {
            log_warn!("[{}] AMQP connection lost, reconnecting", shared.name);
            match connect(&shared.uri, &shared.name).await {
                Ok(connection) => {
                    let connection = Arc::new(connection);
                    *lock_ignore_poison(&shared.current) = Some(connection.clone());
                    for handle in shared.live_handles() {
                        handle.open_and_setup(&connection).await;
                    }
                }
                Err(_err) => {
                    log_error!("[{}] {_err}", shared.name);
                }
            }
            continue;
        }

        let Some(connection) = shared.connection() else {
            continue;
        };
        for handle in shared.live_handles() {
            if handle.needs_channel() {
                log_debug!("[{}] recreating lost channel", shared.name);
                handle.open_and_setup(&connection).await;
            }
        }
    }
}

async fn connect(uri: &str, name: &str) -> Result<lapin::Connection> {
    // ---
    log_info!("Connecting to AMQP broker: {uri}");

    let properties = ConnectionProperties::default().with_connection_name(name.into());
    let connection = lapin::Connection::connect(uri, properties)
        .await
        .map_err(|e| transport_err("connection", e))?;

    log_info!("Connected to AMQP broker");
    Ok(connection)
}

/// Creates a lapin-based AMQP connection from the given configuration.
///
/// # Errors
///
/// Returns an error if:
/// - The broker URI is missing
/// - The first connection attempt fails
///
/// Later connection losses are recovered in the background.
pub async fn create_connection(config: &RpcConfig) -> Result<ConnectionPtr> {
    // ---
    let uri = config
        .uri
        .as_deref()
        .ok_or_else(|| RpcError::Config("AMQP provider requires a broker uri".to_string()))?;

    let connection = connect(uri, &config.connection_name).await.map_err(|e| {
        log_error!("{e}");
        e
    })?;

    let shared = Arc::new(Shared {
        uri: uri.to_string(),
        name: Arc::from(config.connection_name.as_str()),
        current: Mutex::new(Some(Arc::new(connection))),
        handles: Mutex::new(Vec::new()),
        closed: AtomicBool::new(false),
    });

    let supervisor = tokio::spawn(supervise(Arc::downgrade(&shared), config.reconnect_delay));

    Ok(Arc::new(LapinConnection {
        shared,
        supervisor: Mutex::new(Some(supervisor)),
    }))
}
