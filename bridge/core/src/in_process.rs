//! In-Process Host
//!
//! A [`Host`] that runs in the guest's own process, for embedded mode and
//! tests. Commands are routed to handlers registered by name; the event
//! commands are handled by a built-in event bus.
//!
//! # Usage
//!
//! ```ignore
//! let (bridge, host, mut deliveries) = InProcessHost::connect(&BridgeConfig::default());
//!
//! host.register_command("plugin:demo|echo", |request| {
//!     request.responder.resolve(request.payload.clone());
//! });
//!
//! let reply = bridge.invoke("plugin:demo|echo", Args::new().with("value", 42u32));
//! deliveries.pump();
//! ```
//!
//! Replies never run guest handlers from inside `dispatch`: every answer
//! goes through the [`DeliverySink`] and waits for the delivery loop.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::args::ChannelRef;
use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::delivery::{delivery_channel, DeliveryLoop, DeliverySink};
use crate::host::{Host, IpcRequest, TransportError};
use crate::listener::EventCommands;
use crate::registry::CallbackId;

/// Handler for one host command
pub type CommandHandler = Arc<dyn Fn(HostRequest) + Send + Sync>;

/// Sends the outcome of one request back to the guest
#[derive(Clone, Debug)]
pub struct Responder {
    sink: DeliverySink,
    callback: Option<CallbackId>,
    error: Option<CallbackId>,
}

impl Responder {
    /// Fire the guest's resolve callback
    ///
    /// Returns false if the request carried no callback or the guest is gone.
    pub fn resolve(&self, value: Value) -> bool {
        self.callback
            .is_some_and(|id| self.sink.deliver(id, value))
    }

    /// Fire the guest's reject callback
    pub fn reject(&self, value: Value) -> bool {
        self.error.is_some_and(|id| self.sink.deliver(id, value))
    }
}

/// Host-side handle for streaming into a guest channel
#[derive(Clone, Debug)]
pub struct HostChannel {
    id: CallbackId,
    sink: DeliverySink,
}

impl HostChannel {
    /// Id of the guest channel
    #[must_use]
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Send one message; false once the guest is gone
    pub fn send(&self, message: Value) -> bool {
        self.sink.deliver(self.id, message)
    }
}

/// A command as seen by a host handler
#[derive(Clone, Debug)]
pub struct HostRequest {
    /// Command name
    pub cmd: String,
    /// Argument object, channel sentinels included
    pub payload: Value,
    /// Replies to the guest
    pub responder: Responder,
    sink: DeliverySink,
}

impl HostRequest {
    /// Decode one top-level argument
    pub fn arg<T: DeserializeOwned>(&self, key: &str) -> Result<T, serde_json::Error> {
        T::deserialize(self.payload.get(key).unwrap_or(&Value::Null))
    }

    /// Decode the whole argument object
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// The channel referenced by a top-level argument
    #[must_use]
    pub fn channel(&self, key: &str) -> Option<HostChannel> {
        self.channel_at(&format!("/{key}"))
    }

    /// The channel referenced at a JSON pointer, e.g. `/options/onEvent`
    #[must_use]
    pub fn channel_at(&self, pointer: &str) -> Option<HostChannel> {
        let sentinel = self.payload.pointer(pointer)?.as_str()?;
        let channel = ChannelRef::parse(sentinel)?;
        Some(HostChannel {
            id: channel.id(),
            sink: self.sink.clone(),
        })
    }
}

/// Embedded host with a command router and an event bus
pub struct InProcessHost {
    sink: DeliverySink,
    commands: RwLock<HashMap<String, CommandHandler>>,
    event_commands: EventCommands,
    /// event name → listening channels
    listeners: RwLock<HashMap<String, Vec<CallbackId>>>,
    /// (plugin, event) → listening channels
    plugin_listeners: RwLock<HashMap<(String, String), Vec<CallbackId>>>,
    history: Mutex<VecDeque<IpcRequest>>,
    history_limit: usize,
}

impl InProcessHost {
    /// Create a host that answers through `sink`
    #[must_use]
    pub fn new(sink: DeliverySink, config: &BridgeConfig) -> Self {
        Self {
            sink,
            commands: RwLock::new(HashMap::new()),
            event_commands: config.events.clone(),
            listeners: RwLock::new(HashMap::new()),
            plugin_listeners: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit: config.history_limit,
        }
    }

    /// Create a connected bridge, host and delivery loop
    ///
    /// Drive the loop with [`DeliveryLoop::pump`] or spawn it.
    #[must_use]
    pub fn connect(config: &BridgeConfig) -> (Bridge, Arc<Self>, DeliveryLoop) {
        let (sink, inbox) = delivery_channel();
        let host = Arc::new(Self::new(sink, config));
        let bridge = Bridge::new(host.clone(), config);
        let delivery_loop = bridge.delivery_loop(inbox);
        (bridge, host, delivery_loop)
    }

    /// Route `cmd` to `handler`, replacing any previous handler
    pub fn register_command(
        &self,
        cmd: impl Into<String>,
        handler: impl Fn(HostRequest) + Send + Sync + 'static,
    ) {
        let cmd = cmd.into();
        tracing::debug!(cmd = %cmd, "Host command registered");
        self.commands.write().insert(cmd, Arc::new(handler));
    }

    /// Emit an event to every guest listener
    ///
    /// Returns the number of listeners reached.
    pub fn emit(&self, event: &str, payload: Value) -> usize {
        let targets = self
            .listeners
            .read()
            .get(event)
            .cloned()
            .unwrap_or_default();
        let message = json!({ "event": event, "payload": payload });
        targets
            .into_iter()
            .filter(|id| self.sink.deliver(*id, message.clone()))
            .count()
    }

    /// Deliver a plugin event to the plugin's registered listeners
    pub fn trigger_plugin_event(&self, plugin: &str, event: &str, payload: Value) -> usize {
        let targets = self
            .plugin_listeners
            .read()
            .get(&(plugin.to_string(), event.to_string()))
            .cloned()
            .unwrap_or_default();
        targets
            .into_iter()
            .filter(|id| self.sink.deliver(*id, payload.clone()))
            .count()
    }

    /// Number of guest listeners on `event`
    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.read().get(event).map_or(0, Vec::len)
    }

    /// Recent requests, oldest first
    #[must_use]
    pub fn requests(&self) -> Vec<IpcRequest> {
        self.history.lock().iter().cloned().collect()
    }

    /// How many remembered requests named `cmd`
    #[must_use]
    pub fn count_of(&self, cmd: &str) -> usize {
        self.history.lock().iter().filter(|r| r.cmd == cmd).count()
    }

    fn record(&self, request: &IpcRequest) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        history.push_back(request.clone());
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    fn route(&self, request: HostRequest) {
        let cmd = request.cmd.as_str();

        if cmd == self.event_commands.listen {
            self.subscribe(&request, None);
        } else if cmd == self.event_commands.unlisten {
            self.unsubscribe(&request, None);
        } else if cmd == self.event_commands.emit {
            match request.arg::<String>("event") {
                Ok(event) => {
                    let payload = request.payload.get("payload").cloned().unwrap_or_default();
                    let reached = self.emit(&event, payload);
                    request.responder.resolve(json!(reached));
                }
                Err(e) => {
                    request.responder.reject(json!(e.to_string()));
                }
            }
        } else if let Some((plugin, "registerListener")) = split_plugin_command(cmd) {
            self.subscribe(&request, Some(plugin));
        } else if let Some((plugin, "remove_listener")) = split_plugin_command(cmd) {
            self.unsubscribe(&request, Some(plugin));
        } else {
            let handler = self.commands.read().get(cmd).cloned();
            match handler {
                Some(handler) => handler(request),
                None => {
                    tracing::warn!(cmd = %cmd, "Unknown command");
                    let message = format!("command {cmd} not found");
                    request.responder.reject(Value::String(message));
                }
            }
        }
    }

    fn subscribe(&self, request: &HostRequest, plugin: Option<&str>) {
        let (event, channel) = match (request.arg::<String>("event"), request.channel("handler")) {
            (Ok(event), Some(channel)) => (event, channel),
            _ => {
                request
                    .responder
                    .reject(json!("expected {event, handler} arguments"));
                return;
            }
        };

        tracing::debug!(event = %event, plugin = ?plugin, channel_id = %channel.id(), "Guest listener added");
        match plugin {
            Some(plugin) => self
                .plugin_listeners
                .write()
                .entry((plugin.to_string(), event))
                .or_default()
                .push(channel.id()),
            None => self
                .listeners
                .write()
                .entry(event)
                .or_default()
                .push(channel.id()),
        }
        request.responder.resolve(json!(channel.id().as_u32()));
    }

    fn unsubscribe(&self, request: &HostRequest, plugin: Option<&str>) {
        let (Ok(event), Ok(channel_id)) = (
            request.arg::<String>("event"),
            request.arg::<CallbackId>("channelId"),
        ) else {
            request
                .responder
                .reject(json!("expected {event, channelId} arguments"));
            return;
        };

        let removed = match plugin {
            Some(plugin) => remove_listener(
                &mut *self.plugin_listeners.write(),
                &(plugin.to_string(), event.clone()),
                channel_id,
            ),
            None => remove_listener(&mut *self.listeners.write(), &event, channel_id),
        };
        tracing::debug!(event = %event, plugin = ?plugin, channel_id = %channel_id, removed, "Guest listener removed");
        request.responder.resolve(Value::Null);
    }
}

fn remove_listener<K: std::hash::Hash + Eq>(
    table: &mut HashMap<K, Vec<CallbackId>>,
    key: &K,
    channel_id: CallbackId,
) -> bool {
    let Some(ids) = table.get_mut(key) else {
        return false;
    };
    let before = ids.len();
    ids.retain(|id| *id != channel_id);
    let removed = ids.len() != before;
    if ids.is_empty() {
        table.remove(key);
    }
    removed
}

/// Split `plugin:<plugin>|<command>` into its parts
fn split_plugin_command(cmd: &str) -> Option<(&str, &str)> {
    cmd.strip_prefix("plugin:")?.split_once('|')
}

impl Host for InProcessHost {
    fn dispatch(&self, request: IpcRequest) -> Result<(), TransportError> {
        if self.sink.is_closed() {
            return Err(TransportError::HostUnavailable);
        }
        if request.cmd.trim().is_empty() {
            return Err(TransportError::Dispatch("empty command name".to_string()));
        }
        self.record(&request);

        let IpcRequest {
            cmd,
            callback,
            error,
            payload,
        } = request;
        tracing::trace!(cmd = %cmd, "Host received command");

        self.route(HostRequest {
            cmd,
            payload,
            responder: Responder {
                sink: self.sink.clone(),
                callback,
                error,
            },
            sink: self.sink.clone(),
        });
        Ok(())
    }
}

impl fmt::Debug for InProcessHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessHost")
            .field("commands", &self.commands.read().len())
            .field("events", &self.listeners.read().len())
            .field("history_limit", &self.history_limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Args;
    use crate::invoker::InvokeError;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_plugin_command() {
        assert_eq!(
            split_plugin_command("plugin:fs|registerListener"),
            Some(("fs", "registerListener"))
        );
        assert_eq!(split_plugin_command("echo"), None);
    }

    #[tokio::test]
    async fn test_unknown_command_rejected() {
        let (bridge, _host, mut deliveries) = InProcessHost::connect(&BridgeConfig::default());

        let pending = bridge.invoke("plugin:nope|missing", Args::new());
        deliveries.pump();

        let err = pending.await.unwrap_err();
        assert_eq!(err.rejection(), Some(&json!("command plugin:nope|missing not found")));
        assert_eq!(bridge.live_callbacks(), 0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let config = {
            let mut config = BridgeConfig::default();
            config.history_limit = 2;
            config
        };
        let (bridge, host, _deliveries) = InProcessHost::connect(&config);

        for n in 0..5u32 {
            bridge.send(&format!("cmd{n}"), &Args::new()).unwrap();
        }

        let cmds: Vec<_> = host.requests().into_iter().map(|r| r.cmd).collect();
        assert_eq!(cmds, vec!["cmd3".to_string(), "cmd4".to_string()]);
        assert_eq!(host.count_of("cmd4"), 1);
        assert_eq!(host.count_of("cmd0"), 0);
    }

    #[test]
    fn test_dispatch_after_guest_gone() {
        let (sink, inbox) = delivery_channel();
        let host = InProcessHost::new(sink, &BridgeConfig::default());
        drop(inbox);

        let result = host.dispatch(IpcRequest {
            cmd: "plugin:demo|echo".to_string(),
            callback: None,
            error: None,
            payload: json!({}),
        });
        assert!(matches!(result, Err(TransportError::HostUnavailable)));
    }

    #[tokio::test]
    async fn test_empty_command_refused_at_dispatch() {
        let (bridge, host, _deliveries) = InProcessHost::connect(&BridgeConfig::default());

        let err = bridge.send("  ", &Args::new()).unwrap_err();
        assert!(matches!(err, TransportError::Dispatch(ref reason) if reason == "empty command name"));

        let err = bridge.invoke("", Args::new()).await.unwrap_err();
        assert!(matches!(
            err,
            InvokeError::Transport(TransportError::Dispatch(_))
        ));
        assert_eq!(bridge.live_callbacks(), 0);
        assert!(host.requests().is_empty());
    }

    #[test]
    fn test_host_request_nested_channel() {
        let (sink, _inbox) = delivery_channel();
        let request = HostRequest {
            cmd: "plugin:http|fetch".to_string(),
            payload: json!({"options": {"onChunk": "__CHANNEL__:9"}, "url": "x"}),
            responder: Responder {
                sink: sink.clone(),
                callback: None,
                error: None,
            },
            sink,
        };

        assert_eq!(request.channel_at("/options/onChunk").map(|c| c.id().as_u32()), Some(9));
        assert!(request.channel("url").is_none());
        assert!(request.channel("missing").is_none());
        assert_eq!(request.arg::<String>("url").unwrap(), "x");
    }
}
