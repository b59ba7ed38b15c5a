// src/transport/slot.rs

//! Current underlying channel of a logical channel handle.
//!
//! Both providers keep one [`ChannelSlot`] per handle. Refreshes (first
//! open, reconnect recovery, replacement of a channel that died) are
//! serialized per slot, and a refresh that finds a live channel leaves it
//! alone. A channel that already carried a request is therefore never
//! replaced while it is healthy, which would drop its exclusive reply queue.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock::lock_ignore_poison;
use crate::{Channel, ChannelSetup, Result};

/// A provider channel that can tell whether it is still usable.
pub(super) trait LiveChannel: Channel {
    fn is_open(&self) -> bool;
}

/// Outcome of [`ChannelSlot::refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Refresh {
    /// A new channel was opened and set up.
    Opened,
    /// The current channel is still live, or the slot is closed.
    Kept,
}

pub(super) struct ChannelSlot<C> {
    // ---
    current: Mutex<Option<Arc<C>>>,
    opening: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl<C> ChannelSlot<C>
where
    C: LiveChannel + 'static,
{
    pub(super) fn new() -> Self {
        Self {
            current: Mutex::new(None),
            opening: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub(super) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(super) fn current(&self) -> Option<Arc<C>> {
        lock_ignore_poison(&self.current).clone()
    }

    /// `true` while the slot is open but has no live channel.
    pub(super) fn needs_channel(&self) -> bool {
        // ---
        if self.is_closed() {
            return false;
        }
        !lock_ignore_poison(&self.current)
            .as_ref()
            .is_some_and(|channel| channel.is_open())
    }

    /// Replace a missing or dead channel with one from `open`, then run
    /// `setup` against it.
    ///
    /// Concurrent refreshes wait for each other; the later ones find the
    /// fresh channel live and return [`Refresh::Kept`].
    ///
    /// # Errors
    ///
    /// Whatever `open` or `setup` fail with. A failed setup leaves the new
    /// channel in place.
    pub(super) async fn refresh<F, Fut>(&self, setup: &dyn ChannelSetup, open: F) -> Result<Refresh>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<C>>>,
    {
        // ---
        let _opening = self.opening.lock().await;
        if !self.needs_channel() {
            return Ok(Refresh::Kept);
        }

        let channel = open().await?;
        let previous = lock_ignore_poison(&self.current).replace(channel.clone());
        if let Some(previous) = previous {
            let _ = previous.close().await;
        }

        // close() may have raced with the replace above.
        if self.is_closed() {
            let current = lock_ignore_poison(&self.current).take();
            if let Some(current) = current {
                let _ = current.close().await;
            }
            return Ok(Refresh::Kept);
        }

        setup.setup(channel).await?;
        Ok(Refresh::Opened)
    }

    /// Close the slot and its current channel. Later calls are no-ops.
    pub(super) async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let current = lock_ignore_poison(&self.current).take();
        match current {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}
