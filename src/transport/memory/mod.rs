// src/transport/memory/mod.rs

//! In-memory channel provider.
//!
//! A pure in-process implementation of the domain-level [`Connection`]
//! contract, used for tests, local execution and as the reference for
//! provider semantics.
//!
//! ## Reference Semantics
//!
//! Other providers are expected to approximate this behavior as closely as
//! their broker allows:
//!
//! - `create_channel()` runs the setup routine before returning when the
//!   broker is connected, and again on every reconnect.
//! - A queue consumed by several channels dispatches round-robin; each
//!   message goes to exactly one consumer.
//! - Delivery is deterministic within a single process. Nothing is dropped
//!   due to timing or background IO, only by explicit deletes, closes and
//!   disconnects.
//!
//! ## Non-Goals
//!
//! No persistence, no exchanges other than the default one, no flow
//! control. The broker exists to make the RPC layer's behavior observable,
//! including under connection loss.

mod broker;
mod channel;

use std::sync::Arc;

use crate::{ConnectionPtr, Result};

pub use broker::{BrokerStats, MemoryBroker};
use channel::MemoryConnection;

/// Connect to the process-global in-memory broker.
///
/// All connections created this way share queues, so a worker and a client
/// in the same process find each other.
pub async fn create_memory_connection() -> Result<ConnectionPtr> {
    create_memory_connection_with_broker(MemoryBroker::global()).await
}

/// Connect to a specific broker.
///
/// Tests use this with a fresh [`MemoryBroker::new`] to stay isolated from
/// each other and to reach the broker's test controls.
pub async fn create_memory_connection_with_broker(
    broker: Arc<MemoryBroker>,
) -> Result<ConnectionPtr> {
    // ---
    Ok(Arc::new(MemoryConnection::new(broker)))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{
        ChannelHandlePtr, ChannelPtr, ChannelSetup, Consumer, MessageProperties, QueueOptions,
        RpcError,
    };
    use bson::doc;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Setup that hands every channel it is given to the test.
    #[derive(Default)]
    struct Capture {
        channels: Mutex<Vec<ChannelPtr>>,
    }

    #[async_trait::async_trait]
    impl ChannelSetup for Capture {
        async fn setup(&self, channel: ChannelPtr) -> Result<()> {
            self.channels.lock().unwrap().push(channel);
            Ok(())
        }
    }

    impl Capture {
        fn latest(&self) -> ChannelPtr {
            self.channels.lock().unwrap().last().unwrap().clone()
        }

        fn runs(&self) -> usize {
            self.channels.lock().unwrap().len()
        }
    }

    async fn open(broker: &Arc<MemoryBroker>) -> (ChannelHandlePtr, Arc<Capture>) {
        let connection = create_memory_connection_with_broker(broker.clone())
            .await
            .unwrap();
        let capture = Arc::new(Capture::default());
        let handle = connection.create_channel(capture.clone()).await.unwrap();
        (handle, capture)
    }

    async fn next(consumer: &mut Consumer) -> Option<crate::Delivery> {
        tokio::time::timeout(Duration::from_millis(50), consumer.inbox.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_setup_runs_on_create() {
        // ---
        let broker = MemoryBroker::new();
        let (_handle, capture) = open(&broker).await;

        assert_eq!(capture.runs(), 1);
        assert_eq!(broker.stats().handles_created, 1);
        assert_eq!(broker.stats().setups_run, 1);
    }

    #[tokio::test]
    async fn test_round_robin_between_consumers() {
        // ---
        let broker = MemoryBroker::new();
        let (_h1, c1) = open(&broker).await;
        let (_h2, c2) = open(&broker).await;
        let (ch1, ch2) = (c1.latest(), c2.latest());

        ch1.assert_queue("work", QueueOptions::worker()).await.unwrap();
        let mut a = ch1.consume("work").await.unwrap();
        let mut b = ch2.consume("work").await.unwrap();

        for n in 0u8..4 {
            ch1.send_to_queue("work", Bytes::from(vec![n]), MessageProperties::default())
                .await
                .unwrap();
        }

        let mut got_a = Vec::new();
        while let Some(d) = next(&mut a).await {
            got_a.push(d.payload[0]);
        }
        let mut got_b = Vec::new();
        while let Some(d) = next(&mut b).await {
            got_b.push(d.payload[0]);
        }

        assert_eq!(got_a, vec![0, 2]);
        assert_eq!(got_b, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_requeued_message_goes_to_other_consumer() {
        // ---
        let broker = MemoryBroker::new();
        let (_h1, c1) = open(&broker).await;
        let (_h2, c2) = open(&broker).await;
        let (ch1, ch2) = (c1.latest(), c2.latest());

        ch1.assert_queue("replies", QueueOptions::default()).await.unwrap();
        let mut a = ch1.consume("replies").await.unwrap();
        let mut b = ch2.consume("replies").await.unwrap();

        broker.inject("replies", Bytes::from_static(b"x"), MessageProperties::default());

        let first = next(&mut a).await.unwrap();
        assert!(!first.redelivered);
        ch1.nack(&first, true).await.unwrap();

        let second = next(&mut b).await.unwrap();
        assert!(second.redelivered);
        ch2.ack(&second).await.unwrap();

        assert!(next(&mut a).await.is_none());
        assert_eq!(broker.queue_depth("replies"), Some(0));
    }

    #[tokio::test]
    async fn test_rejected_message_parks_with_single_consumer() {
        // ---
        let broker = MemoryBroker::new();
        let (_h, c) = open(&broker).await;
        let ch = c.latest();

        ch.assert_queue("solo", QueueOptions::default()).await.unwrap();
        let mut consumer = ch.consume("solo").await.unwrap();

        broker.inject("solo", Bytes::from_static(b"x"), MessageProperties::default());
        let delivery = next(&mut consumer).await.unwrap();
        ch.nack(&delivery, true).await.unwrap();

        assert!(next(&mut consumer).await.is_none());
        assert_eq!(broker.queue_depth("solo"), Some(1));
    }

    #[tokio::test]
    async fn test_exclusive_queue_removed_with_channel() {
        // ---
        let broker = MemoryBroker::new();
        let (handle, c) = open(&broker).await;

        let name = c.latest().assert_queue("", QueueOptions::reply()).await.unwrap();
        assert!(name.starts_with("amq.gen-"));
        assert!(broker.queue_names().contains(&name));

        handle.close().await.unwrap();
        handle.close().await.unwrap();

        assert!(!broker.queue_names().contains(&name));
        assert_eq!(broker.stats().handle_closes, 2);
    }

    #[tokio::test]
    async fn test_exclusive_queue_locked_for_other_channels() {
        // ---
        let broker = MemoryBroker::new();
        let (_h1, c1) = open(&broker).await;
        let (_h2, c2) = open(&broker).await;

        let name = c1.latest().assert_queue("", QueueOptions::reply()).await.unwrap();
        let err = c2
            .latest()
            .assert_queue(&name, QueueOptions::reply())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_disconnect_invalidates_channels_until_reconnect() {
        // ---
        let broker = MemoryBroker::new();
        let (handle, capture) = open(&broker).await;
        let old = capture.latest();
        old.assert_queue("work", QueueOptions::worker()).await.unwrap();

        broker.disconnect();
        assert!(!broker.is_connected());

        let err = old
            .send_to_queue("work", Bytes::new(), MessageProperties::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ChannelClosed), "got {err:?}");

        broker.reconnect().await;
        assert_eq!(capture.runs(), 2);

        handle
            .send_to_queue("work", Bytes::new(), MessageProperties::default())
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("work"), Some(1));
    }

    #[tokio::test]
    async fn test_closed_handle_is_not_recovered() {
        // ---
        let broker = MemoryBroker::new();
        let (handle, capture) = open(&broker).await;
        handle.close().await.unwrap();

        broker.disconnect();
        broker.reconnect().await;

        assert_eq!(capture.runs(), 1);
        let err = handle
            .send_to_queue("work", Bytes::new(), MessageProperties::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_refused_sends_fail() {
        // ---
        let broker = MemoryBroker::new();
        let (handle, c) = open(&broker).await;
        c.latest()
            .assert_queue("log.event", QueueOptions::worker())
            .await
            .unwrap();

        broker.fail_sends_to("log.event");
        let err = handle
            .send_to_queue("log.event", Bytes::new(), MessageProperties::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)), "got {err:?}");

        broker.restore_sends_to("log.event");
        handle
            .send_to_queue("log.event", Bytes::new(), MessageProperties::default())
            .await
            .unwrap();
        assert_eq!(broker.stats().published_to("log.event"), 1);
    }

    #[tokio::test]
    async fn test_publish_to_missing_queue_is_dropped() {
        // ---
        let broker = MemoryBroker::new();
        let (handle, _c) = open(&broker).await;

        handle
            .send_to_queue("nowhere", Bytes::new(), MessageProperties::default())
            .await
            .unwrap();

        let stats = broker.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.published_to("nowhere"), 0);
        assert!(stats.published.is_empty());
    }

    #[tokio::test]
    async fn test_broker_state_bounded_after_many_calls() {
        // ---
        let broker = MemoryBroker::new();
        let connection = create_memory_connection_with_broker(broker.clone())
            .await
            .unwrap();
        let client = crate::RpcClient::with_time_to_live(
            connection.clone(),
            "jobs",
            Some(Duration::from_millis(5)),
        );

        for n in 0..1000 {
            client.send(&doc! { "n": n }).await;
        }
        // Nobody serves "jobs", so every call times out and deletes its
        // reply queue.
        for n in 0..70 {
            let err = client
                .call::<_, bson::Document>(&doc! { "n": n })
                .await
                .unwrap_err();
            assert!(err.is_timeout(), "got {err:?}");
        }

        let stats = broker.stats();
        assert_eq!(stats.handles_created, 1070);
        assert!(
            broker.registered_handles() <= 1,
            "registered {}",
            broker.registered_handles()
        );

        assert_eq!(stats.queues_deleted, 70);
        assert_eq!(stats.deleted_queues.len(), 64);
        assert!(stats.deleted_queues.iter().all(|q| q.starts_with("amq.gen-")));

        assert_eq!(stats.published_to("jobs"), 1070);
        assert_eq!(stats.published.len(), 1);
        assert_eq!(broker.queue_names(), vec!["jobs".to_string()]);

        connection.close().await.unwrap();
    }
}
