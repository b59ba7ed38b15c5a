// src/transport/memory/broker.rs

//! In-process broker state.
//!
//! Models the subset of AMQP 0-9-1 queue semantics the RPC layer relies on:
//!
//! - publishing through the default exchange (routing key = queue name);
//!   messages to a missing queue are dropped,
//! - round-robin dispatch to consumers with explicit ack/nack,
//! - unacked messages return to their queue when the channel closes,
//! - exclusive queues die with the declaring channel, auto-delete queues
//!   when their last consumer goes away,
//! - a whole-broker disconnect that invalidates every open channel.
//!
//! One deliberate deviation: a message requeued by `nack` is never handed
//! back to a consumer that already rejected it. It waits for another
//! consumer instead of bouncing back to the same one in a tight loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::channel::MemoryChannelHandle;
use crate::lock::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_info,
    Consumer,
    Delivery,
    MessageProperties,
    QueueOptions,
    Result,
    RpcError,
};

/// Names kept in [`BrokerStats::deleted_queues`].
const RECENT_DELETES: usize = 64;

/// Counters collected by a [`MemoryBroker`].
///
/// Per-queue entries go away with their queue, so a long-running broker
/// does not accumulate one entry per call.
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    /// Messages enqueued per existing queue.
    pub published: HashMap<String, usize>,
    /// Messages published to a queue that did not exist.
    pub dropped: usize,
    /// Queues removed through an explicit delete.
    pub queues_deleted: usize,
    /// Names of the most recent explicit deletes, oldest first.
    pub deleted_queues: VecDeque<String>,
    /// Logical channels created through connections.
    pub handles_created: usize,
    /// Calls to `ChannelHandle::close`, repeated calls included.
    pub handle_closes: usize,
    /// Setup routines started.
    pub setups_run: usize,
}

impl BrokerStats {
    pub fn published_to(&self, queue: &str) -> usize {
        self.published.get(queue).copied().unwrap_or(0)
    }
}

/// Shared in-process broker.
///
/// Every connection created on the same broker sees the same queues, like
/// clients of one RabbitMQ node. Besides serving connections it offers test
/// controls: dropping and restoring the connection, refusing publishes to a
/// queue, injecting raw messages and reading counters.
///
/// # ⚠️  Testing Only - Subject to Change
///
/// The test controls exist for this crate's own tests and may change
/// without a deprecation cycle.
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

struct BrokerState {
    connected: bool,
    next_id: u64,
    queues: HashMap<String, MemoryQueue>,
    open_channels: HashSet<u64>,
    handles: Vec<Weak<MemoryChannelHandle>>,
    refused: HashSet<String>,
    stats: BrokerStats,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_open(&self, channel_id: u64) -> Result<()> {
        if self.connected && self.open_channels.contains(&channel_id) {
            Ok(())
        } else {
            Err(RpcError::ChannelClosed)
        }
    }

    fn enqueue(&mut self, queue: &str, payload: Bytes, properties: MessageProperties) {
        // ---
        let BrokerState {
            queues,
            next_id,
            stats,
            ..
        } = self;
        match queues.get_mut(queue) {
            Some(q) => {
                *stats.published.entry(queue.to_string()).or_default() += 1;
                q.ready.push_back(QueuedMessage::new(properties, payload));
                q.dispatch(queue, next_id);
            }
            None => {
                stats.dropped += 1;
                log_debug!("memory: no queue {queue}, message dropped");
            }
        }
    }

    fn remove_queue(&mut self, name: &str) -> bool {
        self.stats.published.remove(name);
        self.queues.remove(name).is_some()
    }

    /// Forget handles that were dropped or closed.
    fn prune_handles(&mut self) {
        self.handles
            .retain(|weak| weak.upgrade().is_some_and(|handle| !handle.is_closed()));
    }

    fn remove_consumers(&mut self, keep: impl Fn(&ConsumerSlot) -> bool) {
        // ---
        let mut emptied = Vec::new();
        for (name, q) in self.queues.iter_mut() {
            q.consumers.retain(|slot| keep(slot));
            if q.options.auto_delete && q.had_consumer && q.consumers.is_empty() {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            log_debug!("memory: auto-deleting queue {name}");
            self.remove_queue(&name);
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        // ---
        if !self.open_channels.remove(&channel_id) {
            return;
        }

        self.remove_consumers(|slot| slot.channel_id != channel_id);

        let mut owned = Vec::new();
        for (name, q) in self.queues.iter_mut() {
            q.return_unacked(channel_id);
            if q.owner == Some(channel_id) {
                owned.push(name.clone());
            }
        }
        for name in owned {
            self.remove_queue(&name);
        }

        self.dispatch_all();
    }

    fn dispatch_all(&mut self) {
        let BrokerState {
            queues, next_id, ..
        } = self;
        for (name, q) in queues.iter_mut() {
            q.dispatch(name, next_id);
        }
    }
}

struct QueuedMessage {
    properties: MessageProperties,
    payload: Bytes,
    redelivered: bool,
    rejected_by: HashSet<Arc<str>>,
}

impl QueuedMessage {
    fn new(properties: MessageProperties, payload: Bytes) -> Self {
        Self {
            properties,
            payload,
            redelivered: false,
            rejected_by: HashSet::new(),
        }
    }
}

struct ConsumerSlot {
    tag: Arc<str>,
    channel_id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct Unacked {
    channel_id: u64,
    message: QueuedMessage,
}

struct MemoryQueue {
    options: QueueOptions,
    owner: Option<u64>,
    ready: VecDeque<QueuedMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
    unacked: HashMap<u64, Unacked>,
    had_consumer: bool,
}

impl MemoryQueue {
    fn new(options: QueueOptions, owner: Option<u64>) -> Self {
        Self {
            options,
            owner,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
            unacked: HashMap::new(),
            had_consumer: false,
        }
    }

    /// Hand ready messages to consumers, round-robin.
    fn dispatch(&mut self, queue: &str, next_id: &mut u64) {
        // ---
        self.consumers.retain(|slot| !slot.tx.is_closed());

        let mut parked = VecDeque::new();
        while let Some(message) = self.ready.pop_front() {
            let count = self.consumers.len();
            let pick = (0..count)
                .map(|offset| (self.cursor + offset) % count)
                .find(|&index| !message.rejected_by.contains(&self.consumers[index].tag));

            let Some(index) = pick else {
                parked.push_back(message);
                continue;
            };

            self.cursor = (index + 1) % count;
            *next_id += 1;
            let delivery_tag = *next_id;

            let slot = &self.consumers[index];
            let delivery = Delivery {
                delivery_tag,
                queue: Arc::from(queue),
                consumer_tag: slot.tag.clone(),
                properties: message.properties.clone(),
                payload: message.payload.clone(),
                redelivered: message.redelivered,
            };

            if slot.tx.send(delivery).is_ok() {
                let channel_id = slot.channel_id;
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        channel_id,
                        message,
                    },
                );
            } else {
                parked.push_back(message);
            }
        }
        self.ready = parked;
    }

    fn return_unacked(&mut self, channel_id: u64) {
        // ---
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                self.ready.push_back(message);
            }
        }
    }
}

/// Process-global broker used by [`create_memory_connection`](super::create_memory_connection).
static GLOBAL_BROKER: OnceLock<Arc<MemoryBroker>> = OnceLock::new();

impl MemoryBroker {
    // ---
    /// Create a new, empty, connected broker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn global() -> Arc<Self> {
        GLOBAL_BROKER.get_or_init(MemoryBroker::new).clone()
    }

    /// `true` unless [`disconnect`](Self::disconnect) was called without a
    /// matching [`reconnect`](Self::reconnect).
    pub fn is_connected(&self) -> bool {
        lock_ignore_poison(&self.state).connected
    }

    /// Drop the connection: every open channel is closed, its consumers
    /// stop, its unacked messages are requeued and its exclusive queues
    /// are deleted.
    pub fn disconnect(&self) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.connected = false;

        let channels: Vec<u64> = state.open_channels.iter().copied().collect();
        for channel_id in channels {
            state.close_channel(channel_id);
        }
        log_info!("memory: broker disconnected");
    }

    /// Restore the connection and re-run the setup of every open logical
    /// channel, in creation order.
    pub async fn reconnect(&self) {
        // ---
        let handles: Vec<Arc<MemoryChannelHandle>> = {
            let mut state = lock_ignore_poison(&self.state);
            state.connected = true;
            state.prune_handles();
            state.handles.iter().filter_map(Weak::upgrade).collect()
        };
        log_info!("memory: broker reconnected, recovering {} channels", handles.len());

        for handle in handles {
            handle.open_and_setup().await;
        }
    }

    /// Make every publish to `queue` fail with a transport error.
    pub fn fail_sends_to(&self, queue: impl Into<String>) {
        lock_ignore_poison(&self.state).refused.insert(queue.into());
    }

    /// Undo [`fail_sends_to`](Self::fail_sends_to).
    pub fn restore_sends_to(&self, queue: &str) {
        lock_ignore_poison(&self.state).refused.remove(queue);
    }

    /// Publish a raw message, bypassing channels.
    pub fn inject(&self, queue: &str, payload: Bytes, properties: MessageProperties) {
        lock_ignore_poison(&self.state).enqueue(queue, payload, properties);
    }

    /// Snapshot of the broker counters.
    pub fn stats(&self) -> BrokerStats {
        lock_ignore_poison(&self.state).stats.clone()
    }

    /// Names of all existing queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let state = lock_ignore_poison(&self.state);
        let mut names: Vec<String> = state.queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Ready (undelivered) messages in `queue`, if it exists.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        lock_ignore_poison(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.len())
    }

    /// Active consumers on `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        lock_ignore_poison(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.iter().filter(|c| !c.tx.is_closed()).count())
    }

    /// Logical channels the broker still tracks for reconnect recovery.
    pub fn registered_handles(&self) -> usize {
        lock_ignore_poison(&self.state).handles.len()
    }

    // --- channel-facing operations

    pub(super) fn register_handle(&self, handle: Weak<MemoryChannelHandle>) {
        let mut state = lock_ignore_poison(&self.state);
        state.stats.handles_created += 1;
        state.prune_handles();
        state.handles.push(handle);
    }

    pub(super) fn note_handle_close(&self) {
        lock_ignore_poison(&self.state).stats.handle_closes += 1;
    }

    /// Open a channel; `None` while disconnected.
    pub(super) fn open_channel(&self) -> Option<u64> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if !state.connected {
            return None;
        }
        let channel_id = state.next_id();
        state.open_channels.insert(channel_id);
        state.stats.setups_run += 1;
        Some(channel_id)
    }

    pub(super) fn is_channel_open(&self, channel_id: u64) -> bool {
        lock_ignore_poison(&self.state).ensure_open(channel_id).is_ok()
    }

    pub(super) fn close_channel(&self, channel_id: u64) {
        lock_ignore_poison(&self.state).close_channel(channel_id);
    }

    pub(super) fn declare(
        &self,
        channel_id: u64,
        queue: &str,
        options: QueueOptions,
    ) -> Result<String> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.ensure_open(channel_id)?;

        let name = if queue.is_empty() {
            format!("amq.gen-{}", state.next_id())
        } else {
            queue.to_string()
        };

        let locked = state
            .queues
            .get(&name)
            .map(|existing| existing.options.exclusive && existing.owner != Some(channel_id));

        match locked {
            Some(true) => Err(RpcError::Transport(format!(
                "memory: queue {name} is locked by another channel"
            ))),
            Some(false) => Ok(name),
            None => {
                let owner = options.exclusive.then_some(channel_id);
                state
                    .queues
                    .insert(name.clone(), MemoryQueue::new(options, owner));
                Ok(name)
            }
        }
    }

    pub(super) fn publish(
        &self,
        channel_id: u64,
        queue: &str,
        payload: Bytes,
        properties: MessageProperties,
    ) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.ensure_open(channel_id)?;

        if state.refused.contains(queue) {
            return Err(RpcError::Transport(format!(
                "memory: publish to {queue} refused"
            )));
        }

        state.enqueue(queue, payload, properties);
        Ok(())
    }

    pub(super) fn consume(&self, channel_id: u64, queue: &str) -> Result<Consumer> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.ensure_open(channel_id)?;

        let tag: Arc<str> = Arc::from(format!("ctag-{}", state.next_id()));

        let BrokerState {
            queues, next_id, ..
        } = &mut *state;
        let q = queues
            .get_mut(queue)
            .ok_or_else(|| RpcError::Transport(format!("memory: no queue '{queue}'")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        q.consumers.push(ConsumerSlot {
            tag: tag.clone(),
            channel_id,
            tx,
        });
        q.had_consumer = true;
        q.dispatch(queue, next_id);

        Ok(Consumer {
            tag: tag.to_string(),
            inbox: rx,
        })
    }

    pub(super) fn cancel(&self, channel_id: u64, consumer_tag: &str) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.ensure_open(channel_id)?;
        state.remove_consumers(|slot| {
            !(slot.channel_id == channel_id && &*slot.tag == consumer_tag)
        });
        Ok(())
    }

    pub(super) fn settle(
        &self,
        channel_id: u64,
        delivery: &Delivery,
        requeue: Option<bool>,
    ) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.ensure_open(channel_id)?;

        let BrokerState {
            queues, next_id, ..
        } = &mut *state;

        let unknown = || {
            RpcError::Transport(format!(
                "memory: unknown delivery tag {}",
                delivery.delivery_tag
            ))
        };

        let q = queues.get_mut(&*delivery.queue).ok_or_else(unknown)?;
        match q.unacked.get(&delivery.delivery_tag) {
            Some(unacked) if unacked.channel_id == channel_id => {}
            _ => return Err(unknown()),
        }
        let Some(unacked) = q.unacked.remove(&delivery.delivery_tag) else {
            return Err(unknown());
        };

        // `None` is an ack; `Some(requeue)` a nack.
        if requeue == Some(true) {
            let mut message = unacked.message;
            message.redelivered = true;
            message.rejected_by.insert(delivery.consumer_tag.clone());
            q.ready.push_back(message);
            q.dispatch(&delivery.queue, next_id);
        }
        Ok(())
    }

    pub(super) fn delete_queue(&self, channel_id: u64, queue: &str) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.ensure_open(channel_id)?;

        let stats = &mut state.stats;
        stats.queues_deleted += 1;
        if stats.deleted_queues.len() == RECENT_DELETES {
            stats.deleted_queues.pop_front();
        }
        stats.deleted_queues.push_back(queue.to_string());

        if state.remove_queue(queue) {
            log_debug!("memory: deleted queue {queue}");
        }
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        // ---
        Self {
            state: Mutex::new(BrokerState {
                connected: true,
                next_id: 0,
                queues: HashMap::new(),
                open_channels: HashSet::new(),
                handles: Vec::new(),
                refused: HashSet::new(),
                stats: BrokerStats::default(),
            }),
        }
    }
}
