//! Event Listeners
//!
//! A listener is one persistent [`Channel`] registered with the host under
//! an event name, plus the command that unregisters it.
//!
//! # Architecture
//!
//! ```text
//!   listen("tick", h) ──► Channel(h) ──► invoke(listen_command, {event, handler})
//!                                              │ ack
//!                                              ▼
//!                                        ListenerHandle ── unlisten() / last drop
//!                                              │
//!                          send(unlisten_command, {event, channelId}), then free
//! ```
//!
//! Unlistening is idempotent: the unregister command goes out at most once
//! per handle, however many clones call [`ListenerHandle::unlisten`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::args::{Arg, Args};
use crate::channel::{Channel, MessageHandler};
use crate::dispatcher::{plugin_command, Dispatcher};
use crate::host::TransportError;
use crate::invoker::{InvokeError, Invoker};
use crate::registry::{CallbackId, CallbackRegistry};

/// Default command that registers an event listener
pub const LISTEN_COMMAND: &str = "plugin:event|listen";
/// Default command that unregisters an event listener
pub const UNLISTEN_COMMAND: &str = "plugin:event|unlisten";
/// Default command that emits an event
pub const EMIT_COMMAND: &str = "plugin:event|emit";

/// Command names used by the event facility
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCommands {
    /// Registers `{event, handler}`
    pub listen: String,
    /// Unregisters `{event, channelId}`
    pub unlisten: String,
    /// Emits `{event, payload}`
    pub emit: String,
}

impl Default for EventCommands {
    fn default() -> Self {
        Self {
            listen: LISTEN_COMMAND.to_string(),
            unlisten: UNLISTEN_COMMAND.to_string(),
            emit: EMIT_COMMAND.to_string(),
        }
    }
}

/// An event as seen by a listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name
    pub event: String,
    /// Event payload
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    /// Interpret a channel message for the listener on `event`
    ///
    /// Hosts normally send `{event, payload}`; anything else is taken as the
    /// bare payload.
    #[must_use]
    pub fn from_message(event: &str, message: Value) -> Self {
        let enveloped = message
            .as_object()
            .is_some_and(|o| o.get("event").is_some_and(Value::is_string) && o.contains_key("payload"));

        if enveloped {
            if let Ok(parsed) = serde_json::from_value::<Event>(message.clone()) {
                return parsed;
            }
        }
        Self {
            event: event.to_string(),
            payload: message,
        }
    }

    /// Decode the payload
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

struct ListenerInner {
    event: String,
    channel: Channel,
    unregister_command: String,
    unlistened: AtomicBool,
}

impl ListenerInner {
    fn unlisten(&self) -> Result<(), TransportError> {
        if self.unlistened.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        tracing::debug!(
            event = %self.event,
            channel_id = %self.channel.id(),
            cmd = %self.unregister_command,
            "Unlistening"
        );
        let args = Args::new()
            .with("event", self.event.as_str())
            .with("channelId", self.channel.id().as_u32());
        self.channel
            .close_with(&self.unregister_command, &args)
            .map(|_| ())
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        if let Err(e) = self.unlisten() {
            tracing::warn!(event = %self.event, error = %e, "Unlisten on drop failed");
        }
    }
}

/// Strong back-reference held by a `once` relay until it fires
#[derive(Default)]
struct OnceKeepAlive {
    fired: bool,
    listener: Option<Arc<ListenerInner>>,
}

/// Handle to a registered listener
///
/// Clones share the registration. Dropping the last clone of a
/// [`Events::listen`] handle unlistens; a [`Events::once`] listener stays
/// registered until its first delivery or an explicit unlisten.
#[derive(Clone)]
#[must_use = "dropping the last handle of a listener unregisters it"]
pub struct ListenerHandle(Arc<ListenerInner>);

impl ListenerHandle {
    /// Event name this listener is registered for
    #[must_use]
    pub fn event(&self) -> &str {
        &self.0.event
    }

    /// Id of the channel carrying the events
    #[must_use]
    pub fn channel_id(&self) -> CallbackId {
        self.0.channel.id()
    }

    /// Whether the listener is still registered
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.0.unlistened.load(Ordering::Acquire)
    }

    /// Unregister with the host and free the channel
    ///
    /// Only the first call sends anything.
    pub fn unlisten(&self) -> Result<(), TransportError> {
        self.0.unlisten()
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("event", &self.0.event)
            .field("channel_id", &self.0.channel.id())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Listener registration over one registry and dispatcher
#[derive(Clone, Debug)]
pub struct Events {
    registry: CallbackRegistry,
    dispatcher: Dispatcher,
    invoker: Invoker,
    commands: EventCommands,
}

impl Events {
    pub(crate) fn new(
        registry: CallbackRegistry,
        dispatcher: Dispatcher,
        invoker: Invoker,
        commands: EventCommands,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            invoker,
            commands,
        }
    }

    /// Command names in use
    #[must_use]
    pub fn commands(&self) -> &EventCommands {
        &self.commands
    }

    /// Listen for `event` until the handle is unlistened or dropped
    pub async fn listen(
        &self,
        event: &str,
        handler: impl Fn(Event) + Send + Sync + 'static,
    ) -> Result<ListenerHandle, InvokeError> {
        let name = event.to_string();
        let relay: MessageHandler = Arc::new(move |message: Value| handler(Event::from_message(&name, message)));
        self.register(
            &self.commands.listen,
            &self.commands.unlisten,
            event,
            relay,
        )
        .await
    }

    /// Listen for a single delivery of `event`
    ///
    /// The listener unlistens right after the handler returns, and also
    /// when it panics.
    pub async fn once(
        &self,
        event: &str,
        handler: impl FnOnce(Event) + Send + 'static,
    ) -> Result<ListenerHandle, InvokeError> {
        let keep_alive: Arc<Mutex<OnceKeepAlive>> = Arc::default();
        let pending = Mutex::new(Some(handler));

        let name = event.to_string();
        let relay_keep_alive = Arc::clone(&keep_alive);
        let relay: MessageHandler = Arc::new(move |message: Value| {
            let Some(handler) = pending.lock().take() else {
                return;
            };
            scopeguard::defer! {
                let listener = {
                    let mut state = relay_keep_alive.lock();
                    state.fired = true;
                    state.listener.take()
                };
                if let Some(inner) = listener {
                    if let Err(e) = inner.unlisten() {
                        tracing::warn!(event = %inner.event, error = %e, "Unlisten after once failed");
                    }
                }
            }
            handler(Event::from_message(&name, message));
        });

        let handle = self
            .register(
                &self.commands.listen,
                &self.commands.unlisten,
                event,
                relay,
            )
            .await?;

        let fired = {
            let mut state = keep_alive.lock();
            if !state.fired {
                // Released by the relay on first delivery, or by unlisten
                // dropping the relay
                state.listener = Some(Arc::clone(&handle.0));
            }
            state.fired
        };
        // Fired while the registration was still being acknowledged
        if fired {
            handle.unlisten()?;
        }
        Ok(handle)
    }

    /// Register a listener with a plugin's own listener commands
    ///
    /// Sends `plugin:<plugin>|registerListener {event, handler}`;
    /// unlistening sends `plugin:<plugin>|remove_listener {event, channelId}`.
    /// The handler receives raw payloads.
    pub async fn add_plugin_listener(
        &self,
        plugin: &str,
        event: &str,
        handler: impl Fn(Value) + Send + Sync + 'static,
    ) -> Result<ListenerHandle, InvokeError> {
        self.register(
            &plugin_command(plugin, "registerListener"),
            &plugin_command(plugin, "remove_listener"),
            event,
            Arc::new(handler),
        )
        .await
    }

    /// Emit an event through the host
    pub async fn emit(&self, event: &str, payload: impl Into<Arg>) -> Result<(), InvokeError> {
        let args = Args::new().with("event", event).with("payload", payload);
        self.invoker.invoke(self.commands.emit.clone(), args).await?;
        Ok(())
    }

    async fn register(
        &self,
        register_command: &str,
        unregister_command: &str,
        event: &str,
        handler: MessageHandler,
    ) -> Result<ListenerHandle, InvokeError> {
        let channel = Channel::open(self.registry.clone(), self.dispatcher.clone(), handler)?;
        let args = Args::new().with("event", event).with("handler", &channel);

        if let Err(e) = self.invoker.invoke(register_command, args).await {
            tracing::warn!(event = %event, cmd = %register_command, error = %e, "Listener registration failed");
            channel.close();
            return Err(e);
        }

        tracing::debug!(event = %event, channel_id = %channel.id(), "Listener registered");
        Ok(ListenerHandle(Arc::new(ListenerInner {
            event: event.to_string(),
            channel,
            unregister_command: unregister_command.to_string(),
            unlistened: AtomicBool::new(false),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_from_envelope() {
        let event = Event::from_message("tick", json!({"event": "tick", "payload": {"n": 1}}));
        assert_eq!(event.event, "tick");
        assert_eq!(event.payload, json!({"n": 1}));
    }

    #[test]
    fn test_event_from_bare_payload() {
        let event = Event::from_message("tick", json!(5));
        assert_eq!(event.event, "tick");
        assert_eq!(event.payload, json!(5));

        // An object lacking the envelope shape is a payload too
        let event = Event::from_message("tick", json!({"event": "other"}));
        assert_eq!(event.event, "tick");
        assert_eq!(event.payload, json!({"event": "other"}));
    }

    #[test]
    fn test_payload_as() {
        let event = Event::from_message("n", json!({"event": "n", "payload": 7}));
        assert_eq!(event.payload_as::<u32>().unwrap(), 7);
        assert!(event.payload_as::<String>().is_err());
    }

    #[test]
    fn test_default_commands() {
        let commands = EventCommands::default();
        assert_eq!(commands.listen, "plugin:event|listen");
        assert_eq!(commands.unlisten, "plugin:event|unlisten");
        assert_eq!(commands.emit, "plugin:event|emit");
    }
}
