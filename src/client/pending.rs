// src/client/pending.rs

//! Per-call state machine.
//!
//! A [`PendingCall`] owns everything one correlated call needs: its
//! correlation id, the encoded request, its logical channel, the reply
//! consumer and the timeout timer.
//!
//! ```text
//!   Init ──send──▶ AwaitingReply ──▶ Resolved
//!     │                 │
//!     └─────────────────┴──────────▶ Rejected
//! ```
//!
//! Every trigger (matching reply, timer expiry, send failure, caller gone)
//! goes through [`PendingCall::settle`], which checks and updates the state
//! under one lock acquisition. The first trigger wins; the others observe a
//! terminal state and back off. Resources are released by the winner only,
//! so the channel is closed exactly once.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bson::Bson;
use bytes::Bytes;
use tokio::sync::oneshot;

use crate::lock::lock_ignore_poison;
use crate::protocol::{self, Reply};
use crate::queues::{assert_reply_queue, assert_worker_queue};
use crate::{
    // ---
    log_debug,
    log_error,
    log_warn,
    ChannelHandlePtr,
    ChannelPtr,
    ChannelSetup,
    Consumer,
    CorrelationId,
    Delivery,
    MessageProperties,
    Result,
    RpcError,
};

/// Final result of a call before it is decoded into the caller's type.
pub(crate) type Outcome = Result<Bson>;

/// Lifecycle of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallState {
    /// Created; the request has not been sent.
    Init,
    /// Request sent, waiting for the matching reply or the timer.
    AwaitingReply,
    Resolved,
    Rejected,
}

impl CallState {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, CallState::Resolved | CallState::Rejected)
    }
}

/// Reply queue bound by the most recent channel setup.
#[derive(Clone)]
struct ReplyBinding {
    channel: ChannelPtr,
    queue: String,
    consumer_tag: String,
}

struct CallInner {
    state: CallState,
    sent: bool,
    handle: Option<ChannelHandlePtr>,
    timer_cancel: Option<oneshot::Sender<()>>,
    reply: Option<ReplyBinding>,
    outcome_tx: Option<oneshot::Sender<Outcome>>,
}

pub(crate) struct PendingCall {
    // ---
    me: Weak<PendingCall>,
    route: Arc<str>,
    correlation_id: CorrelationId,
    payload: Bytes,
    time_to_live: Option<Duration>,
    inner: Mutex<CallInner>,
}

impl PendingCall {
    // ---
    /// Create a call and the receiver its outcome will be delivered on.
    ///
    /// A zero `time_to_live` means no timeout.
    pub(crate) fn new(
        route: Arc<str>,
        payload: Bytes,
        time_to_live: Option<Duration>,
    ) -> (Arc<Self>, oneshot::Receiver<Outcome>) {
        // ---
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let call = Arc::new_cyclic(|me| PendingCall {
            me: me.clone(),
            route,
            correlation_id: CorrelationId::generate(),
            payload,
            time_to_live: time_to_live.filter(|ttl| !ttl.is_zero()),
            inner: Mutex::new(CallInner {
                state: CallState::Init,
                sent: false,
                handle: None,
                timer_cancel: None,
                reply: None,
                outcome_tx: Some(outcome_tx),
            }),
        });

        (call, outcome_rx)
    }

    pub(crate) fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub(crate) fn state(&self) -> CallState {
        lock_ignore_poison(&self.inner).state
    }

    /// Hand the call its logical channel.
    ///
    /// If the call already settled while the channel was being created, the
    /// channel is closed right away instead.
    pub(crate) async fn attach(&self, handle: ChannelHandlePtr) {
        // ---
        let late = {
            let mut inner = lock_ignore_poison(&self.inner);
            if inner.state.is_terminal() {
                Some(handle)
            } else {
                inner.handle = Some(handle);
                None
            }
        };

        if let Some(handle) = late {
            release_handle(handle).await;
        }
    }

    /// Move the call to its terminal state.
    ///
    /// Returns `false` if another trigger settled the call first, in which
    /// case `outcome` is discarded and nothing is released.
    pub(crate) async fn settle(&self, outcome: Outcome) -> bool {
        // ---
        let (handle, reply, outcome_tx) = {
            let mut inner = lock_ignore_poison(&self.inner);
            if inner.state.is_terminal() {
                return false;
            }
            inner.state = if outcome.is_ok() {
                CallState::Resolved
            } else {
                CallState::Rejected
            };
            // Dropping the sender wakes the timer task, which then exits.
            inner.timer_cancel = None;
            (
                inner.handle.take(),
                inner.reply.take(),
                inner.outcome_tx.take(),
            )
        };

        if let Some(reply) = reply {
            if let Err(_err) = reply.channel.cancel(&reply.consumer_tag).await {
                log_debug!(
                    "call {}: cancel of reply consumer {} failed: {_err}",
                    self.correlation_id,
                    reply.consumer_tag
                );
            }
        }

        if let Some(handle) = handle {
            release_handle(handle).await;
        }

        if let Some(tx) = outcome_tx {
            if tx.send(outcome).is_err() {
                log_debug!("call {}: caller stopped waiting", self.correlation_id);
            }
        }

        true
    }

    /// Settle the call in the background if the caller gave up on it.
    pub(crate) fn abandon(&self) {
        // ---
        if self.state().is_terminal() {
            return;
        }
        let Some(call) = self.me.upgrade() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if call.settle(Err(RpcError::Abandoned)).await {
                        log_debug!("call {} abandoned by caller", call.correlation_id);
                    }
                });
            }
            Err(_) => {
                log_warn!(
                    "call {} dropped outside a runtime; its channel is left open",
                    self.correlation_id
                );
            }
        }
    }

    /// Setup routine body, run on every (re)created channel.
    async fn bind(&self, channel: ChannelPtr) -> Result<()> {
        // ---
        if self.state().is_terminal() {
            return Ok(());
        }

        assert_worker_queue(&*channel, &self.route).await?;
        let reply_queue = assert_reply_queue(&*channel, &self.route).await?;
        let consumer = channel.consume(&reply_queue).await?;

        let binding = ReplyBinding {
            channel: channel.clone(),
            queue: reply_queue.clone(),
            consumer_tag: consumer.tag.clone(),
        };

        let accepted = {
            let mut inner = lock_ignore_poison(&self.inner);
            if inner.state.is_terminal() {
                false
            } else {
                inner.reply = Some(binding);
                true
            }
        };

        let call = match self.me.upgrade() {
            Some(call) if accepted => call,
            _ => {
                let _ = channel.cancel(&consumer.tag).await;
                return Ok(());
            }
        };

        tokio::spawn(call.clone().consume_replies(channel.clone(), consumer));
        call.send_once(channel, &reply_queue).await;

        Ok(())
    }

    /// Publish the request unless an earlier setup already did.
    async fn send_once(self: &Arc<Self>, channel: ChannelPtr, reply_queue: &str) {
        // ---
        let timer = {
            let mut inner = lock_ignore_poison(&self.inner);
            if inner.state.is_terminal() || inner.sent {
                return;
            }
            // Marked before the publish is awaited: a setup re-run racing
            // with this send must not publish again.
            inner.sent = true;
            inner.state = CallState::AwaitingReply;

            self.time_to_live.map(|ttl| {
                let (cancel_tx, cancel_rx) = oneshot::channel();
                inner.timer_cancel = Some(cancel_tx);
                (ttl, cancel_rx)
            })
        };

        if let Some((ttl, cancelled)) = timer {
            tokio::spawn(self.clone().expire_after(ttl, cancelled));
        }

        log_debug!(
            "call {}: sending to {} (reply to {reply_queue})",
            self.correlation_id,
            self.route
        );

        let properties = MessageProperties::request(&self.correlation_id, reply_queue);
        if let Err(err) = channel
            .send_to_queue(&self.route, self.payload.clone(), properties)
            .await
        {
            log_error!("rpc call send to queue {} failed: {err}", self.route);
            self.settle(Err(err)).await;
        }
    }

    /// Timer task: reject with [`RpcError::Timeout`] unless cancelled first.
    async fn expire_after(self: Arc<Self>, ttl: Duration, cancelled: oneshot::Receiver<()>) {
        // ---
        tokio::select! {
            _ = tokio::time::sleep(ttl) => {}
            _ = cancelled => return,
        }

        let reply = {
            let inner = lock_ignore_poison(&self.inner);
            if inner.state.is_terminal() {
                return;
            }
            inner.reply.clone()
        };

        match &reply {
            Some(reply) => {
                log_warn!(
                    "call {} on {} timed out after {ttl:?}; deleting reply queue {}",
                    self.correlation_id,
                    self.route,
                    reply.queue
                );
                if let Err(_err) = reply.channel.delete_queue(&reply.queue).await {
                    log_debug!("delete of reply queue {} failed: {_err}", reply.queue);
                }
            }
            None => {
                log_warn!(
                    "call {} on {} timed out after {ttl:?}",
                    self.correlation_id,
                    self.route
                );
            }
        }

        self.settle(Err(RpcError::Timeout)).await;
    }

    /// Reply consumer task for one channel setup.
    ///
    /// Exits after the first matching reply, or when the consumer's inbox
    /// closes (cancelled, queue deleted, channel lost).
    async fn consume_replies(self: Arc<Self>, channel: ChannelPtr, mut consumer: Consumer) {
        // ---
        while let Some(delivery) = consumer.inbox.recv().await {
            if !self.correlation_id.matches(delivery.correlation_id()) {
                log_debug!(
                    "call {}: reply {:?} is not ours, requeueing",
                    self.correlation_id,
                    delivery.correlation_id()
                );
                if let Err(_err) = channel.nack(&delivery, true).await {
                    log_debug!("nack on {} failed: {_err}", delivery.queue);
                }
                continue;
            }

            self.disarm_timer();

            if let Err(_err) = channel.ack(&delivery).await {
                log_warn!("ack of reply on {} failed: {_err}", delivery.queue);
            }

            let outcome = decode_reply(&delivery);
            self.settle(outcome).await;
            break;
        }

        log_debug!(
            "call {}: reply consumer {} finished",
            self.correlation_id,
            consumer.tag
        );
    }

    fn disarm_timer(&self) {
        lock_ignore_poison(&self.inner).timer_cancel = None;
    }
}

#[async_trait::async_trait]
impl ChannelSetup for PendingCall {
    async fn setup(&self, channel: ChannelPtr) -> Result<()> {
        self.bind(channel).await
    }
}

fn decode_reply(delivery: &Delivery) -> Outcome {
    // ---
    match protocol::decode::<Reply>(&delivery.payload) {
        Ok(reply) => reply.into_outcome(),
        Err(err) => {
            log_error!(
                "error parsing rpc call response on {}: {err} ({} bytes)",
                delivery.queue,
                delivery.payload.len()
            );
            Err(RpcError::InvalidReply(err.to_string()))
        }
    }
}

async fn release_handle(handle: ChannelHandlePtr) {
    if let Err(_err) = handle.close().await {
        log_warn!("closing call channel failed: {_err}");
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{Channel, ChannelHandle, QueueOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Records every operation; replies are pushed through `consumers`.
    #[derive(Default)]
    struct RecordingChannel {
        fail_send: bool,
        sends: Mutex<Vec<(String, MessageProperties)>>,
        consumers: Mutex<Vec<mpsc::UnboundedSender<Delivery>>>,
        acked: Mutex<Vec<u64>>,
        nacked: Mutex<Vec<u64>>,
        deleted: Mutex<Vec<String>>,
        cancelled: Mutex<Vec<String>>,
    }

    impl RecordingChannel {
        fn deliver(&self, tag: u64, correlation_id: &str, reply: &Reply) {
            let delivery = Delivery {
                delivery_tag: tag,
                queue: Arc::from("reply-q"),
                consumer_tag: Arc::from("ctag-1"),
                properties: MessageProperties::reply(Arc::from(correlation_id)),
                payload: protocol::encode(reply).unwrap(),
                redelivered: false,
            };
            for tx in self.consumers.lock().unwrap().iter() {
                let _ = tx.send(delivery.clone());
            }
        }
    }

    #[async_trait::async_trait]
    impl Channel for RecordingChannel {
        async fn assert_queue(&self, queue: &str, _options: QueueOptions) -> Result<String> {
            Ok(if queue.is_empty() { "reply-q".into() } else { queue.into() })
        }

        async fn send_to_queue(
            &self,
            queue: &str,
            _payload: Bytes,
            properties: MessageProperties,
        ) -> Result<()> {
            if self.fail_send {
                return Err(RpcError::Transport("refused".into()));
            }
            self.sends.lock().unwrap().push((queue.into(), properties));
            Ok(())
        }

        async fn consume(&self, _queue: &str) -> Result<Consumer> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.consumers.lock().unwrap().push(tx);
            Ok(Consumer {
                tag: "ctag-1".into(),
                inbox: rx,
            })
        }

        async fn cancel(&self, consumer_tag: &str) -> Result<()> {
            self.cancelled.lock().unwrap().push(consumer_tag.into());
            self.consumers.lock().unwrap().clear();
            Ok(())
        }

        async fn ack(&self, delivery: &Delivery) -> Result<()> {
            self.acked.lock().unwrap().push(delivery.delivery_tag);
            Ok(())
        }

        async fn nack(&self, delivery: &Delivery, _requeue: bool) -> Result<()> {
            self.nacked.lock().unwrap().push(delivery.delivery_tag);
            Ok(())
        }

        async fn delete_queue(&self, queue: &str) -> Result<()> {
            self.deleted.lock().unwrap().push(queue.into());
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingHandle {
        closes: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ChannelHandle for CountingHandle {
        async fn send_to_queue(&self, _: &str, _: Bytes, _: MessageProperties) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn new_call(ttl: Option<Duration>) -> (Arc<PendingCall>, oneshot::Receiver<Outcome>) {
        PendingCall::new(Arc::from("math.add"), Bytes::from_static(b"\x05\0\0\0\0"), ttl)
    }

    #[tokio::test]
    async fn test_settle_is_idempotent_and_closes_once() {
        // ---
        let (call, rx) = new_call(None);
        let handle = Arc::new(CountingHandle::default());
        call.attach(handle.clone()).await;

        assert!(call.settle(Ok(Bson::Int32(5))).await);
        assert!(!call.settle(Err(RpcError::Timeout)).await);

        assert_eq!(call.state(), CallState::Resolved);
        assert_eq!(handle.closes.load(Ordering::SeqCst), 1);
        assert_eq!(rx.await.unwrap().unwrap(), Bson::Int32(5));
    }

    #[tokio::test]
    async fn test_attach_after_settle_closes_immediately() {
        // ---
        let (call, _rx) = new_call(None);
        assert!(call.settle(Err(RpcError::ChannelClosed)).await);

        let handle = Arc::new(CountingHandle::default());
        call.attach(handle.clone()).await;

        assert_eq!(call.state(), CallState::Rejected);
        assert_eq!(handle.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_repeated_setup_sends_once() {
        // ---
        let (call, _rx) = new_call(None);
        let channel = Arc::new(RecordingChannel::default());

        call.setup(channel.clone()).await.unwrap();
        call.setup(channel.clone()).await.unwrap();
        call.setup(channel.clone()).await.unwrap();

        let sends = channel.sends.lock().unwrap().clone();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, "math.add");
        assert_eq!(
            sends[0].1.correlation_id.as_deref(),
            Some(call.correlation_id().as_str())
        );
        assert_eq!(sends[0].1.reply_to.as_deref(), Some("reply-q"));
        assert_eq!(call.state(), CallState::AwaitingReply);
    }

    #[tokio::test]
    async fn test_send_failure_rejects() {
        // ---
        let (call, rx) = new_call(Some(Duration::from_secs(30)));
        let channel = Arc::new(RecordingChannel {
            fail_send: true,
            ..Default::default()
        });

        call.setup(channel).await.unwrap();

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)), "got {err:?}");
        assert_eq!(call.state(), CallState::Rejected);
    }

    #[tokio::test]
    async fn test_foreign_reply_is_requeued_and_ignored() {
        // ---
        let (call, mut rx) = new_call(None);
        let channel = Arc::new(RecordingChannel::default());
        call.setup(channel.clone()).await.unwrap();

        channel.deliver(1, "someone-else", &Reply::ok(Bson::Int32(1)));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*channel.nacked.lock().unwrap(), vec![1]);
        assert!(channel.acked.lock().unwrap().is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(call.state(), CallState::AwaitingReply);

        let id = call.correlation_id().to_string();
        channel.deliver(2, &id, &Reply::ok(Bson::Int32(5)));

        assert_eq!(rx.await.unwrap().unwrap(), Bson::Int32(5));
        assert_eq!(*channel.acked.lock().unwrap(), vec![2]);
        assert_eq!(*channel.cancelled.lock().unwrap(), vec!["ctag-1".to_string()]);
    }

    #[tokio::test]
    async fn test_unparseable_reply_rejects() {
        // ---
        let (call, rx) = new_call(None);
        let channel = Arc::new(RecordingChannel::default());
        call.setup(channel.clone()).await.unwrap();

        let garbage = Delivery {
            delivery_tag: 7,
            queue: Arc::from("reply-q"),
            consumer_tag: Arc::from("ctag-1"),
            properties: MessageProperties::reply(call.correlation_id().to_shared()),
            payload: Bytes::from_static(b"definitely not bson"),
            redelivered: false,
        };
        for tx in channel.consumers.lock().unwrap().iter() {
            tx.send(garbage.clone()).unwrap();
        }

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::InvalidReply(_)), "got {err:?}");
        assert_eq!(*channel.acked.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn test_timer_deletes_reply_queue_and_rejects() {
        // ---
        let (call, rx) = new_call(Some(Duration::from_millis(30)));
        let handle = Arc::new(CountingHandle::default());
        let channel = Arc::new(RecordingChannel::default());

        call.setup(channel.clone()).await.unwrap();
        call.attach(handle.clone()).await;

        let err = rx.await.unwrap().unwrap_err();
        assert!(err.is_timeout(), "got {err:?}");
        assert_eq!(*channel.deleted.lock().unwrap(), vec!["reply-q".to_string()]);
        assert_eq!(handle.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reply_before_timer_cancels_timeout() {
        // ---
        let (call, rx) = new_call(Some(Duration::from_millis(40)));
        let channel = Arc::new(RecordingChannel::default());
        call.setup(channel.clone()).await.unwrap();

        let id = call.correlation_id().to_string();
        channel.deliver(3, &id, &Reply::failed(Bson::String("div_by_zero".into())));

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(
            err.remote_payload(),
            Some(&Bson::String("div_by_zero".into()))
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(channel.deleted.lock().unwrap().is_empty());
        assert_eq!(call.state(), CallState::Rejected);
    }

    #[tokio::test]
    async fn test_abandon_settles_in_background() {
        // ---
        let (call, rx) = new_call(None);
        let handle = Arc::new(CountingHandle::default());
        call.attach(handle.clone()).await;
        drop(rx);

        call.abandon();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(call.state(), CallState::Rejected);
        assert_eq!(handle.closes.load(Ordering::SeqCst), 1);
    }
}
