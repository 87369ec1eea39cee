//! Bridge - the guest-facing surface
//!
//! Everything plugin code needs, over one registry and one host: one-shot
//! invocations, channels, listeners, events and resources. Plugin code never
//! touches the [`CallbackRegistry`] directly.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::args::{Arg, Args};
use crate::channel::Channel;
use crate::config::BridgeConfig;
use crate::delivery::{DeliveryLoop, Inbox};
use crate::dispatcher::Dispatcher;
use crate::fanout::ChannelFanout;
use crate::host::{Host, TransportError};
use crate::invoker::{Invocation, InvokeError, Invoker};
use crate::listener::{Event, Events, ListenerHandle};
use crate::registry::{CallbackId, CallbackRegistry};
use crate::resource::Resource;

/// Guest side of the command bridge
///
/// Cheap to clone; clones share one registry and host.
#[derive(Clone, Debug)]
pub struct Bridge {
    registry: CallbackRegistry,
    dispatcher: Dispatcher,
    invoker: Invoker,
    events: Events,
}

impl Bridge {
    /// Create a bridge over `host`
    ///
    /// Replies only reach handlers once the matching [`DeliveryLoop`] runs;
    /// see [`Bridge::delivery_loop`].
    #[must_use]
    pub fn new(host: Arc<dyn Host>, config: &BridgeConfig) -> Self {
        let registry = config.build_registry();
        let dispatcher = Dispatcher::new(host);
        let invoker = Invoker::new(registry.clone(), dispatcher.clone());
        let events = Events::new(
            registry.clone(),
            dispatcher.clone(),
            invoker.clone(),
            config.events.clone(),
        );

        tracing::debug!(
            id_allocation = %registry.strategy(),
            listen = %config.events.listen,
            "Bridge created"
        );

        Self {
            registry,
            dispatcher,
            invoker,
            events,
        }
    }

    /// Build the loop that feeds host deliveries from `inbox` to handlers
    #[must_use]
    pub fn delivery_loop(&self, inbox: Inbox) -> DeliveryLoop {
        DeliveryLoop::new(inbox, self.registry.clone())
    }

    /// Invoke a host command
    pub fn invoke(&self, cmd: impl Into<String>, args: Args) -> Invocation {
        self.invoker.invoke(cmd, args)
    }

    /// Invoke a host command and decode its success value
    pub fn invoke_as<T: DeserializeOwned>(
        &self,
        cmd: impl Into<String>,
        args: Args,
    ) -> impl Future<Output = Result<T, InvokeError>> {
        self.invoker.invoke_as(cmd, args)
    }

    /// Send a command without waiting for any reply
    ///
    /// Returns the channel ids embedded in `args`.
    pub fn send(&self, cmd: &str, args: &Args) -> Result<Vec<CallbackId>, TransportError> {
        self.dispatcher.send(cmd, args)
    }

    /// Open a channel
    pub fn channel(
        &self,
        handler: impl Fn(Value) + Send + Sync + 'static,
    ) -> Result<Channel, TransportError> {
        Channel::open(self.registry.clone(), self.dispatcher.clone(), Arc::new(handler))
    }

    /// Open a channel whose messages are decoded as `T`
    ///
    /// Messages that don't decode are logged and skipped.
    pub fn typed_channel<T, F>(&self, handler: F) -> Result<Channel, TransportError>
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        Channel::open_typed(self.registry.clone(), self.dispatcher.clone(), handler)
    }

    /// Open a channel that fans out to many listeners
    pub fn fanout(&self) -> Result<ChannelFanout, TransportError> {
        ChannelFanout::open(self.registry.clone(), self.dispatcher.clone())
    }

    /// Listen for an event
    pub async fn listen(
        &self,
        event: &str,
        handler: impl Fn(Event) + Send + Sync + 'static,
    ) -> Result<ListenerHandle, InvokeError> {
        self.events.listen(event, handler).await
    }

    /// Listen for one delivery of an event
    pub async fn once(
        &self,
        event: &str,
        handler: impl FnOnce(Event) + Send + 'static,
    ) -> Result<ListenerHandle, InvokeError> {
        self.events.once(event, handler).await
    }

    /// Register a listener through a plugin's own listener commands
    pub async fn add_plugin_listener(
        &self,
        plugin: &str,
        event: &str,
        handler: impl Fn(Value) + Send + Sync + 'static,
    ) -> Result<ListenerHandle, InvokeError> {
        self.events.add_plugin_listener(plugin, event, handler).await
    }

    /// Emit an event through the host
    pub async fn emit(&self, event: &str, payload: impl Into<Arg>) -> Result<(), InvokeError> {
        self.events.emit(event, payload).await
    }

    /// Wrap a host resource id
    #[must_use]
    pub fn resource(&self, rid: u32) -> Resource {
        Resource::new(rid, self.invoker.clone())
    }

    /// Whether a callback id is currently live
    #[must_use]
    pub fn is_live(&self, id: CallbackId) -> bool {
        self.registry.is_live(id)
    }

    /// Number of live callbacks
    #[must_use]
    pub fn live_callbacks(&self) -> usize {
        self.registry.live_count()
    }
}
