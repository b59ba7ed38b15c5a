//! Behavior of calls and workers across broker connection loss.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use mom_push::{
    //
    create_connection,
    create_memory_connection_with_broker,
    spawn_worker,
    MemoryBroker,
    Result,
    RpcClient,
    RpcConfig,
    RpcError,
};

#[derive(Debug, Serialize, Deserialize)]
struct Echo {
    text: String,
}

#[tokio::test]
async fn test_reconnect_does_not_resend_request() -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let connection = create_memory_connection_with_broker(broker.clone()).await?;
    let client = RpcClient::with_time_to_live(
        connection.clone(),
        "echo",
        Some(Duration::from_millis(200)),
    );

    let call = tokio::spawn(async move {
        client
            .call::<_, Echo>(&Echo {
                text: "once".into(),
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(broker.stats().setups_run, 1);

    broker.disconnect();
    broker.reconnect().await;
    broker.disconnect();
    broker.reconnect().await;

    // The setup ran again after every reconnect, the request went out once.
    let stats = broker.stats();
    assert_eq!(stats.setups_run, 3);
    assert_eq!(stats.published_to("echo"), 1);

    // The first reply queue died with the first connection, so the
    // reply can never arrive.
    let err = call.await.expect("call task panicked").unwrap_err();
    assert!(err.is_timeout(), "got {err:?}");

    let stats = broker.stats();
    assert_eq!(stats.published_to("echo"), 1);
    assert_eq!(stats.handle_closes, 1);

    connection.close().await
}

#[tokio::test]
async fn test_call_started_while_disconnected_is_sent_after_reconnect() -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let connection = create_memory_connection_with_broker(broker.clone()).await?;
    let worker = spawn_worker(&connection, "echo", |req: Echo| async move {
        Ok::<_, String>(req)
    })
    .await?;

    broker.disconnect();

    let client = RpcClient::with_time_to_live(
        connection.clone(),
        "echo",
        Some(Duration::from_secs(5)),
    );
    let call = tokio::spawn(async move {
        client
            .call::<_, Echo>(&Echo {
                text: "late".into(),
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(broker.stats().published_to("echo"), 0);

    broker.reconnect().await;

    let reply = call.await.expect("call task panicked")?;
    assert_eq!(reply.text, "late");
    assert_eq!(broker.stats().published_to("echo"), 1);

    worker.shutdown().await?;
    connection.close().await
}

#[tokio::test]
async fn test_worker_resubscribes_after_reconnect() -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let connection = create_memory_connection_with_broker(broker.clone()).await?;
    let worker = spawn_worker(&connection, "echo", |req: Echo| async move {
        Ok::<_, String>(req)
    })
    .await?;
    assert_eq!(broker.consumer_count("echo"), 1);

    broker.disconnect();
    assert_eq!(broker.consumer_count("echo"), 0);
    broker.reconnect().await;
    assert_eq!(broker.consumer_count("echo"), 1);

    let client = RpcClient::with_time_to_live(
        connection.clone(),
        "echo",
        Some(Duration::from_secs(5)),
    );
    let reply: Echo = client
        .call(&Echo {
            text: "back".into(),
        })
        .await?;
    assert_eq!(reply.text, "back");

    worker.shutdown().await?;
    assert_eq!(broker.consumer_count("echo"), 0);
    connection.close().await
}

#[tokio::test]
async fn test_unacked_request_goes_to_next_worker() -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let connection = create_memory_connection_with_broker(broker.clone()).await?;

    // Never finishes, so it never acks.
    let stuck = spawn_worker(&connection, "jobs", |_req: Echo| async move {
        std::future::pending::<std::result::Result<Echo, String>>().await
    })
    .await?;

    let client = RpcClient::with_time_to_live(
        connection.clone(),
        "jobs",
        Some(Duration::from_secs(5)),
    );
    let call = tokio::spawn(async move {
        client
            .call::<_, Echo>(&Echo {
                text: "retry me".into(),
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let healthy = spawn_worker(&connection, "jobs", |req: Echo| async move {
        Ok::<_, String>(req)
    })
    .await?;
    stuck.shutdown().await?;

    let reply = call.await.expect("call task panicked")?;
    assert_eq!(reply.text, "retry me");

    healthy.shutdown().await?;
    connection.close().await
}

#[tokio::test]
async fn test_create_connection_selects_provider() -> Result<()> {
    // ---
    init_logging();

    let connection = create_connection(&RpcConfig::memory("svc")).await?;
    assert!(connection.is_connected());
    connection.close().await?;

    let connection =
        create_connection(&RpcConfig::with_broker("memory://local", "svc")).await?;
    assert!(connection.is_connected());
    connection.close().await?;

    let err = create_connection(&RpcConfig::with_broker("mqtt://localhost:1883", "svc"))
        .await
        .err()
        .expect("mqtt uri accepted");
    assert!(matches!(err, RpcError::Config(_)), "got {err:?}");

    #[cfg(not(feature = "transport_lapin"))]
    {
        let err = create_connection(&RpcConfig::with_broker("amqp://localhost:5672", "svc"))
            .await
            .err()
            .expect("amqp uri accepted without the lapin feature");
        assert!(matches!(err, RpcError::Config(_)), "got {err:?}");
    }

    Ok(())
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
