//! Service bootstrap.
//!
//! Picks the channel provider from the configuration and ties a connection,
//! its route clients and its workers together.

use std::future::Future;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::lock::lock_ignore_poison;
use crate::{
    // ---
    create_memory_connection,
    log_info,
    log_warn,
    spawn_worker,
    ConnectionPtr,
    Result,
    RpcClient,
    RpcConfig,
    RpcError,
    WorkerHandle,
};

/// Connect to the broker named by `config.uri`.
///
/// - absent or `memory://...`: the process-global in-memory broker
/// - `amqp://...` or `amqps://...`: the lapin provider (feature
///   `transport_lapin`)
///
/// # Errors
///
/// [`RpcError::Config`] for any other scheme, or for an AMQP uri when the
/// `transport_lapin` feature is disabled. Connection failures are returned
/// as [`RpcError::Transport`].
pub async fn create_connection(config: &RpcConfig) -> Result<ConnectionPtr> {
    // ---
    let uri = config.uri.as_deref().unwrap_or("memory://");

    if uri.starts_with("memory://") {
        return create_memory_connection().await;
    }

    if uri.starts_with("amqp://") || uri.starts_with("amqps://") {
        #[cfg(feature = "transport_lapin")]
        {
            return crate::transport::create_lapin_connection(config).await;
        }

        #[cfg(not(feature = "transport_lapin"))]
        {
            return Err(RpcError::Config(format!(
                "{uri} needs the `transport_lapin` feature"
            )));
        }
    }

    Err(RpcError::Config(format!("unsupported broker uri: {uri}")))
}

/// A connection plus the clients and workers built on it.
pub struct RpcService {
    // ---
    config: RpcConfig,
    connection: ConnectionPtr,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl RpcService {
    /// Connect using [`create_connection`].
    pub async fn connect(config: RpcConfig) -> Result<Self> {
        // ---
        let connection = create_connection(&config).await?;
        log_info!("service {} connected", config.connection_name);
        Ok(Self::with_connection(connection, config))
    }

    /// Build a service on an existing connection.
    pub fn with_connection(connection: ConnectionPtr, config: RpcConfig) -> Self {
        Self {
            config,
            connection,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionPtr {
        &self.connection
    }

    /// Client for `route`, with the route's configured time-to-live.
    pub fn client(&self, route: impl Into<String>) -> RpcClient {
        RpcClient::new(self.connection.clone(), route, &self.config)
    }

    /// Start a worker for `route`; see [`spawn_worker`].
    ///
    /// The worker is stopped by [`close`](Self::close).
    pub async fn add_worker<F, Fut, Req, Resp, E>(
        &self,
        route: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, E>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        E: Serialize + Send + 'static,
    {
        // ---
        let worker = spawn_worker(&self.connection, route, handler).await?;
        lock_ignore_poison(&self.workers).push(worker);
        Ok(())
    }

    pub fn is_connection_available(&self) -> bool {
        self.connection.is_connected()
    }

    /// Stop every worker, then close the connection.
    pub async fn close(&self) -> Result<()> {
        // ---
        let workers: Vec<WorkerHandle> = lock_ignore_poison(&self.workers).drain(..).collect();
        for worker in workers {
            let route = worker.route().to_string();
            if let Err(_err) = worker.shutdown().await {
                log_warn!("stopping worker on {route} failed: {_err}");
            }
        }
        self.connection.close().await
    }
}
