//! Channel fan-out
//!
//! One channel, many listeners. Listeners can come and go while the host
//! keeps streaming; each message goes to the listeners registered at the
//! moment it arrives.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::args::{Arg, Args};
use crate::channel::{Channel, MessageHandler};
use crate::dispatcher::Dispatcher;
use crate::host::TransportError;
use crate::registry::{CallbackId, CallbackRegistry};

/// Identifies one listener on a [`ChannelFanout`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(u64);

type Listeners = Arc<RwLock<Vec<(ListenerKey, MessageHandler)>>>;

/// A channel that forwards every message to a set of listeners
pub struct ChannelFanout {
    channel: Channel,
    listeners: Listeners,
    next_key: AtomicU64,
}

impl ChannelFanout {
    pub(crate) fn open(
        registry: CallbackRegistry,
        dispatcher: Dispatcher,
    ) -> Result<Self, TransportError> {
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));
        let targets = Arc::clone(&listeners);

        let channel = Channel::open(
            registry,
            dispatcher,
            Arc::new(move |payload: Value| {
                // Snapshot so listeners may add or remove others mid-message
                let snapshot: Vec<MessageHandler> =
                    targets.read().iter().map(|(_, h)| Arc::clone(h)).collect();
                for handler in snapshot {
                    handler(payload.clone());
                }
            }),
        )?;

        Ok(Self {
            channel,
            listeners,
            next_key: AtomicU64::new(0),
        })
    }

    /// Add a listener
    pub fn add_listener(&self, handler: impl Fn(Value) + Send + Sync + 'static) -> ListenerKey {
        let key = ListenerKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((key, Arc::new(handler)));
        tracing::trace!(channel_id = %self.channel.id(), listener = key.0, "Fan-out listener added");
        key
    }

    /// Remove a listener; returns false if it wasn't registered
    pub fn remove_listener(&self, key: ListenerKey) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(k, _)| *k != key);
        listeners.len() != before
    }

    /// Number of registered listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// The underlying channel
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Registry id of the underlying channel
    #[must_use]
    pub fn id(&self) -> CallbackId {
        self.channel.id()
    }

    /// The underlying channel as an argument node
    pub fn as_arg(&self) -> Arg {
        self.channel.as_arg()
    }

    /// Free the channel locally and drop every listener
    pub fn close(&self) -> bool {
        self.listeners.write().clear();
        self.channel.close()
    }

    /// Send a teardown command, then free the channel and drop every listener
    pub fn close_with(&self, cmd: &str, args: &Args) -> Result<bool, TransportError> {
        let result = self.channel.close_with(cmd, args);
        self.listeners.write().clear();
        result
    }
}

impl fmt::Debug for ChannelFanout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelFanout")
            .field("channel", &self.channel)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl From<&ChannelFanout> for Arg {
    fn from(fanout: &ChannelFanout) -> Self {
        fanout.as_arg()
    }
}
