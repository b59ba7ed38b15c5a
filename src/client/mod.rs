// src/client/mod.rs
//! Route client.
//!
//! This module contains [`RpcClient`], which submits payloads to one route's
//! work queue, either fire-and-forget ([`RpcClient::send`]) or as a
//! correlated call waiting for the worker's reply ([`RpcClient::call`]).
//!
//! # Architecture
//!
//! The client itself is immutable. Every call builds a [`PendingCall`] that
//! owns a fresh logical channel, a broker-named reply queue, a reply consumer
//! task and an optional timeout timer. No two calls share a channel, so
//! concurrent calls never contend on a lock; they are isolated by owning
//! separate resources.
//!
//! The connection is borrowed from the caller and may reconnect underneath
//! a call. The channel provider then re-runs the call's setup, which rebinds
//! a reply queue but never publishes the request a second time.

mod pending;

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use pending::PendingCall;

use crate::protocol;
use crate::queues::assert_worker_queue;
use crate::{
    // ---
    log_debug,
    log_error,
    log_warn,
    ChannelPtr,
    ChannelSetup,
    ConnectionPtr,
    MessageProperties,
    Result,
    RpcConfig,
    RpcError,
};

/// Client for a single route.
///
/// Cheap to clone (internally `Arc`-backed).
///
/// # Example
///
/// ```no_run
/// # use mom_push::{create_connection, RpcClient, RpcConfig};
/// # use serde::{Deserialize, Serialize};
/// # use std::time::Duration;
/// #[derive(Serialize)]
/// struct AddRequest { a: i32, b: i32 }
///
/// # async fn example() -> mom_push::Result<()> {
/// let config = RpcConfig::memory("calculator")
///     .with_route_ttl("math.add", Duration::from_secs(5));
/// let connection = create_connection(&config).await?;
///
/// let client = RpcClient::new(connection, "math.add", &config);
/// let sum: i32 = client.call(&AddRequest { a: 2, b: 3 }).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    // ---
    route: Arc<str>,
    time_to_live: Option<Duration>,
    connection: ConnectionPtr,
}

impl RpcClient {
    // ---
    /// Create a client for `route`, taking its time-to-live from `config`.
    pub fn new(connection: ConnectionPtr, route: impl Into<String>, config: &RpcConfig) -> Self {
        // ---
        let route = route.into();
        let time_to_live = config.time_to_live(&route);
        Self::with_time_to_live(connection, route, time_to_live)
    }

    /// Create a client with an explicit time-to-live.
    ///
    /// `None` or a zero duration makes calls wait for their reply
    /// indefinitely.
    pub fn with_time_to_live(
        connection: ConnectionPtr,
        route: impl Into<String>,
        time_to_live: Option<Duration>,
    ) -> Self {
        Self {
            route: Arc::from(route.into()),
            time_to_live: time_to_live.filter(|ttl| !ttl.is_zero()),
            connection,
        }
    }

    /// Name of the route (and of its work queue).
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Time-to-live applied by [`call`](Self::call).
    pub fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live
    }

    /// Submit `data` to the route's work queue without waiting for a reply.
    ///
    /// Best-effort: encoding and transport failures are logged, never
    /// returned, since there is no reply path on which a failure could be
    /// observed anyway. The scoped channel is closed before this returns.
    pub async fn send<T>(&self, data: &T)
    where
        T: Serialize,
    {
        // ---
        let setup = Arc::new(WorkerQueueSetup {
            route: self.route.clone(),
        });

        let handle = match self.connection.create_channel(setup).await {
            Ok(handle) => handle,
            Err(err) => {
                log_error!("error send messaging on {}: {err}", self.route);
                return;
            }
        };

        let sent = match protocol::encode(data) {
            Ok(payload) => {
                handle
                    .send_to_queue(&self.route, payload, MessageProperties::default())
                    .await
            }
            Err(err) => Err(err),
        };

        match sent {
            Ok(()) => {
                log_debug!("sent message to {}", self.route);
            }
            Err(err) => {
                log_error!("error send messaging on {}: {err}", self.route);
            }
        }

        if let Err(_err) = handle.close().await {
            log_warn!("closing send channel for {} failed: {_err}", self.route);
        }
    }

    /// Call the route and wait for the worker's reply.
    ///
    /// Uses the client's time-to-live; see [`call_with_ttl`](Self::call_with_ttl).
    pub async fn call<TReq, TResp>(&self, data: &TReq) -> Result<TResp>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        self.call_with_ttl(data, self.time_to_live).await
    }

    /// Call the route with an explicit time-to-live.
    ///
    /// Resolves with the worker's `result` decoded as `TResp` when the
    /// worker reports `success: true`.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Timeout`] if no matching reply arrives within
    ///   `time_to_live`; the reply queue is deleted best-effort
    /// - [`RpcError::Remote`] carrying the worker's `result` when it reports
    ///   `success: false`
    /// - [`RpcError::Transport`] if publishing the request fails
    /// - [`RpcError::Codec`] if the request cannot be encoded or the result
    ///   does not decode as `TResp`
    /// - [`RpcError::InvalidReply`] if the reply is not a `{success, result}`
    ///   document
    pub async fn call_with_ttl<TReq, TResp>(
        &self,
        data: &TReq,
        time_to_live: Option<Duration>,
    ) -> Result<TResp>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        // ---
        let payload = protocol::encode(data).map_err(|err| {
            log_error!("rpc call on {}: cannot encode request: {err}", self.route);
            err
        })?;

        let (call, outcome) = PendingCall::new(self.route.clone(), payload, time_to_live);
        let _guard = AbandonOnDrop(call.clone());

        log_debug!(
            "rpc call {} on {} (ttl {time_to_live:?})",
            call.correlation_id(),
            self.route
        );

        let handle = self.connection.create_channel(call.clone()).await?;
        call.attach(handle).await;

        let value = outcome.await.map_err(|_| RpcError::ChannelClosed)??;
        protocol::decode_value(value)
    }
}

/// Setup for fire-and-forget channels: only the work queue is needed.
struct WorkerQueueSetup {
    route: Arc<str>,
}

#[async_trait::async_trait]
impl ChannelSetup for WorkerQueueSetup {
    async fn setup(&self, channel: ChannelPtr) -> Result<()> {
        assert_worker_queue(&*channel, &self.route).await?;
        Ok(())
    }
}

/// Releases a call whose future is dropped before it settles.
struct AbandonOnDrop(Arc<PendingCall>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.abandon();
    }
}
