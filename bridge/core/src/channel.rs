//! Channels - Persistent Host→Guest Streams
//!
//! A [`Channel`] is a persistent registry entry the host may call any
//! number of times. It is embedded in a command's arguments through
//! [`Channel::as_arg`]; the host keeps calling it until the guest tears it
//! down.
//!
//! # Lifecycle
//!
//! ```text
//!   Attached ──as_arg()──► Registered ──close_with()──► Unregistering ──► Freed
//!      │                       │                                            ▲
//!      └───────────────────────┴──────────── close() / drop ────────────────┘
//! ```
//!
//! A channel can't be built without a handler, so nothing can reach it
//! before `onmessage` is set. Teardown always sends the host command first
//! and frees the slot second; a message that slips in between still finds
//! the entry, and one that arrives after is a stale delivery the registry
//! ignores.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::args::{Arg, Args, ChannelRef};
use crate::dispatcher::Dispatcher;
use crate::host::TransportError;
use crate::registry::{Callback, CallbackId, CallbackMode, CallbackRegistry};

/// Handler invoked for every message on a channel
pub type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Where a channel is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Handler set, not yet handed to the host
    Attached,
    /// Embedded in an outgoing command
    Registered,
    /// Teardown command in flight
    Unregistering,
    /// Registry slot released; terminal
    Freed,
}

struct ChannelShared {
    handler: RwLock<Option<MessageHandler>>,
    state: Mutex<ChannelState>,
}

impl ChannelShared {
    fn deliver(&self, id: CallbackId, payload: Value) {
        // Clone out so the handler may replace itself or close the channel
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler(payload),
            None => tracing::debug!(channel_id = %id, "Message for a closed channel dropped"),
        }
    }
}

/// A persistent, host-callable stream endpoint
pub struct Channel {
    id: CallbackId,
    registry: CallbackRegistry,
    dispatcher: Dispatcher,
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub(crate) fn open(
        registry: CallbackRegistry,
        dispatcher: Dispatcher,
        handler: MessageHandler,
    ) -> Result<Self, TransportError> {
        let id = registry.allocate(CallbackMode::Persistent)?;
        let shared = Arc::new(ChannelShared {
            handler: RwLock::new(Some(handler)),
            state: Mutex::new(ChannelState::Attached),
        });

        let relay = Arc::clone(&shared);
        registry.attach(
            id,
            Callback::persistent(move |payload| relay.deliver(id, payload)),
        );

        tracing::debug!(channel_id = %id, "Channel opened");
        Ok(Self {
            id,
            registry,
            dispatcher,
            shared,
        })
    }

    pub(crate) fn open_typed<T, F>(
        registry: CallbackRegistry,
        dispatcher: Dispatcher,
        handler: F,
    ) -> Result<Self, TransportError>
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        Self::open(registry, dispatcher, Arc::new(typed_handler(handler)))
    }

    /// Registry id of this channel
    #[must_use]
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.shared.state.lock()
    }

    /// Replace the message handler
    ///
    /// Returns false once the channel is freed.
    pub fn set_onmessage(&self, handler: impl Fn(Value) + Send + Sync + 'static) -> bool {
        if self.state() == ChannelState::Freed {
            return false;
        }
        *self.shared.handler.write() = Some(Arc::new(handler));
        true
    }

    /// A reference to embed in command arguments
    pub fn reference(&self) -> ChannelRef {
        let mut state = self.shared.state.lock();
        if *state == ChannelState::Attached {
            *state = ChannelState::Registered;
        }
        ChannelRef::new(self.id)
    }

    /// This channel as an argument node
    pub fn as_arg(&self) -> Arg {
        Arg::Channel(self.reference())
    }

    /// Free the slot locally without telling the host
    ///
    /// Returns false if the channel was already closed.
    pub fn close(&self) -> bool {
        if !self.begin_close() {
            return false;
        }
        self.finish_close();
        true
    }

    /// Send `cmd` to tell the host to stop, then free the slot
    ///
    /// The slot is freed even if the teardown command can't be delivered;
    /// the dispatch error is returned after. Closing an already-closed
    /// channel sends nothing.
    pub fn close_with(&self, cmd: &str, args: &Args) -> Result<bool, TransportError> {
        if !self.begin_close() {
            return Ok(false);
        }

        let sent = self.dispatcher.send(cmd, args);
        self.finish_close();

        match sent {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(channel_id = %self.id, cmd = %cmd, error = %e, "Teardown command failed");
                Err(e)
            }
        }
    }

    fn begin_close(&self) -> bool {
        let mut state = self.shared.state.lock();
        match *state {
            ChannelState::Unregistering | ChannelState::Freed => false,
            ChannelState::Attached | ChannelState::Registered => {
                *state = ChannelState::Unregistering;
                true
            }
        }
    }

    fn finish_close(&self) {
        self.registry.free(self.id);
        // Breaks any cycle a handler holds back onto its owner; dropped
        // outside the lock since that may release the owner itself
        let handler = self.shared.handler.write().take();
        drop(handler);
        *self.shared.state.lock() = ChannelState::Freed;
        tracing::debug!(channel_id = %self.id, "Channel freed");
    }
}

impl From<&Channel> for Arg {
    fn from(channel: &Channel) -> Self {
        channel.as_arg()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.begin_close() {
            self.finish_close();
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn typed_handler<T, F>(handler: F) -> impl Fn(Value) + Send + Sync + 'static
where
    T: DeserializeOwned,
    F: Fn(T) + Send + Sync + 'static,
{
    move |payload| match serde_json::from_value::<T>(payload) {
        Ok(message) => handler(message),
        Err(e) => tracing::warn!(error = %e, "Malformed channel message skipped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Host, IpcRequest};
    use serde_json::json;

    #[derive(Default)]
    struct RecordingHost {
        requests: Mutex<Vec<IpcRequest>>,
    }

    impl Host for RecordingHost {
        fn dispatch(&self, request: IpcRequest) -> Result<(), TransportError> {
            self.requests.lock().push(request);
            Ok(())
        }
    }

    fn setup() -> (CallbackRegistry, Dispatcher, Arc<RecordingHost>) {
        let host = Arc::new(RecordingHost::default());
        (
            CallbackRegistry::default(),
            Dispatcher::new(host.clone()),
            host,
        )
    }

    fn collecting() -> (Arc<Mutex<Vec<Value>>>, MessageHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Arc::new(move |payload: Value| sink.lock().push(payload)))
    }

    #[test]
    fn test_channel_receives_many_messages() {
        let (registry, dispatcher, _host) = setup();
        let (seen, handler) = collecting();
        let channel = Channel::open(registry.clone(), dispatcher, handler).unwrap();

        for n in 0..10 {
            assert!(registry.resolve(channel.id(), json!(n)));
        }
        assert_eq!(seen.lock().len(), 10);
        assert!(registry.is_live(channel.id()));
    }

    #[test]
    fn test_reference_marks_registered() {
        let (registry, dispatcher, _host) = setup();
        let (_, handler) = collecting();
        let channel = Channel::open(registry, dispatcher, handler).unwrap();

        assert_eq!(channel.state(), ChannelState::Attached);
        let arg = channel.as_arg();
        assert_eq!(arg, Arg::Channel(ChannelRef::new(channel.id())));
        assert_eq!(channel.state(), ChannelState::Registered);
    }

    #[test]
    fn test_close_with_sends_then_frees() {
        let (registry, dispatcher, host) = setup();
        let (_, handler) = collecting();
        let channel = Channel::open(registry.clone(), dispatcher, handler).unwrap();
        let id = channel.id();
        let _ = channel.as_arg();

        let args = Args::new().with("id", id.as_u32());
        assert!(channel.close_with("plugin:fs|unwatch", &args).unwrap());
        assert_eq!(channel.state(), ChannelState::Freed);
        assert!(!registry.is_live(id));

        // Second close is a no-op and sends nothing
        assert!(!channel.close_with("plugin:fs|unwatch", &args).unwrap());
        assert!(!channel.close());
        assert_eq!(host.requests.lock().len(), 1);

        // Late host message is absorbed
        assert!(!registry.resolve(id, json!("late")));
    }

    #[test]
    fn test_drop_frees_slot() {
        let (registry, dispatcher, host) = setup();
        let (_, handler) = collecting();
        let channel = Channel::open(registry.clone(), dispatcher, handler).unwrap();
        let id = channel.id();

        drop(channel);
        assert!(!registry.is_live(id));
        assert!(host.requests.lock().is_empty());
    }

    #[test]
    fn test_set_onmessage_replaces_handler() {
        let (registry, dispatcher, _host) = setup();
        let (first, handler) = collecting();
        let channel = Channel::open(registry.clone(), dispatcher, handler).unwrap();

        registry.resolve(channel.id(), json!(1));
        let second = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&second);
        assert!(channel.set_onmessage(move |payload| sink.lock().push(payload)));
        registry.resolve(channel.id(), json!(2));

        assert_eq!(*first.lock(), vec![json!(1)]);
        assert_eq!(*second.lock(), vec![json!(2)]);

        channel.close();
        assert!(!channel.set_onmessage(|_| {}));
    }

    #[test]
    fn test_typed_channel_skips_malformed() {
        #[derive(serde::Deserialize)]
        struct Progress {
            done: u64,
        }

        let (registry, dispatcher, _host) = setup();
        let total = Arc::new(Mutex::new(0u64));
        let sink = Arc::clone(&total);
        let channel = Channel::open_typed(registry.clone(), dispatcher, move |p: Progress| {
            *sink.lock() += p.done;
        })
        .unwrap();

        registry.resolve(channel.id(), json!({"done": 10}));
        registry.resolve(channel.id(), json!("garbage"));
        registry.resolve(channel.id(), json!({"done": 5}));
        assert_eq!(*total.lock(), 15);
    }
}
