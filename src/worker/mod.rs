//! Route worker.
//!
//! Consumes a route's work queue and answers each request on the queue named
//! by its `reply_to`, tagged with the request's correlation id. Requests
//! without reply metadata (fire-and-forget sends) are handled and acked
//! without a reply.
mod handler;

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use handler::{wrap_handler, BoxedHandler};

use crate::protocol;
use crate::queues::assert_worker_queue;
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    ChannelHandlePtr,
    ChannelPtr,
    ChannelSetup,
    ConnectionPtr,
    Consumer,
    Delivery,
    MessageProperties,
    Result,
};

/// Running worker for one route.
///
/// Dropping the handle leaves the worker running; call
/// [`shutdown`](Self::shutdown) to stop it.
pub struct WorkerHandle {
    route: Arc<str>,
    handle: ChannelHandlePtr,
}

impl WorkerHandle {
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Close the worker's channel. Requests not yet acked go back to the
    /// work queue for other workers.
    pub async fn shutdown(self) -> Result<()> {
        // ---
        log_info!("worker on {} shutting down", self.route);
        self.handle.close().await
    }
}

/// Start a worker for `route`.
///
/// Each request is decoded as `Req` and handed to `handler` in its own task.
/// `Ok(resp)` is answered with `{success: true, result: resp}`, `Err(e)`
/// with `{success: false, result: e}`. A request that does not decode as
/// `Req` is answered with `{success: false, result: "<decode error>"}`.
///
/// The worker re-subscribes after every reconnect of `connection`.
///
/// # Example
///
/// ```no_run
/// # use mom_push::{create_memory_connection, spawn_worker};
/// # use serde::Deserialize;
/// #[derive(Deserialize)]
/// struct AddRequest { a: i32, b: i32 }
///
/// # async fn example() -> mom_push::Result<()> {
/// let connection = create_memory_connection().await?;
/// let worker = spawn_worker(&connection, "math.add", |req: AddRequest| async move {
///     Ok::<_, String>(req.a + req.b)
/// })
/// .await?;
/// # worker.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub async fn spawn_worker<F, Fut, Req, Resp, E>(
    connection: &ConnectionPtr,
    route: impl Into<String>,
    handler: F,
) -> Result<WorkerHandle>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Resp, E>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    E: Serialize + Send + 'static,
{
    // ---
    let route: Arc<str> = Arc::from(route.into());
    let setup = Arc::new(WorkerSetup {
        route: route.clone(),
        handler: wrap_handler(handler),
    });

    let handle = connection.create_channel(setup).await?;
    log_info!("worker listening on {route}");

    Ok(WorkerHandle { route, handle })
}

struct WorkerSetup {
    route: Arc<str>,
    handler: BoxedHandler,
}

#[async_trait::async_trait]
impl ChannelSetup for WorkerSetup {
    async fn setup(&self, channel: ChannelPtr) -> Result<()> {
        // ---
        assert_worker_queue(&*channel, &self.route).await?;
        let consumer = channel.consume(&self.route).await?;

        tokio::spawn(serve(
            self.route.clone(),
            self.handler.clone(),
            channel,
            consumer,
        ));
        Ok(())
    }
}

/// Dispatch loop for one channel setup; ends when the consumer's inbox
/// closes.
async fn serve(route: Arc<str>, handler: BoxedHandler, channel: ChannelPtr, mut consumer: Consumer) {
    // ---
    while let Some(delivery) = consumer.inbox.recv().await {
        let handler = handler.clone();
        let channel = channel.clone();
        tokio::spawn(handle_request(handler, channel, delivery));
    }
    log_debug!("worker consumer {} on {route} finished", consumer.tag);
}

async fn handle_request(handler: BoxedHandler, channel: ChannelPtr, delivery: Delivery) {
    // ---
    let reply = handler(delivery.payload.clone()).await;

    match (delivery.reply_to(), delivery.properties.correlation_id.clone()) {
        (Some(reply_to), Some(correlation_id)) => {
            let sent = match protocol::encode(&reply) {
                Ok(payload) => {
                    channel
                        .send_to_queue(reply_to, payload, MessageProperties::reply(correlation_id))
                        .await
                }
                Err(err) => Err(err),
            };
            if let Err(_err) = sent {
                log_error!("worker on {}: reply to {reply_to} failed: {_err}", delivery.queue);
            }
        }
        _ => {
            log_debug!("worker on {}: no reply requested", delivery.queue);
        }
    }

    if let Err(_err) = channel.ack(&delivery).await {
        log_warn!("worker on {}: ack failed: {_err}", delivery.queue);
    }
}
