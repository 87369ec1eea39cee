//! Dispatcher
//!
//! Turns a command name plus an [`Args`] tree into an [`IpcRequest`] and
//! hands it to the [`Host`]. The tree walk is where serialization meets
//! callback identity: every [`Arg::Channel`] node, however deep, is replaced
//! by its `"__CHANNEL__:<id>"` sentinel at the same path.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::args::{Arg, Args};
use crate::host::{Host, IpcRequest, TransportError};
use crate::registry::CallbackId;

/// Build a command name following the `plugin:<plugin>|<command>` convention
#[must_use]
pub fn plugin_command(plugin: &str, command: &str) -> String {
    format!("plugin:{plugin}|{command}")
}

/// Result of walking an argument tree
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedArgs {
    /// Argument object with channel sentinels substituted
    pub payload: Map<String, Value>,
    /// Channels found in the tree, in walk order
    pub channels: Vec<CallbackId>,
}

/// Walk an argument tree, substituting channel references
#[must_use]
pub fn encode_args(args: &Args) -> EncodedArgs {
    let mut channels = Vec::new();
    let payload = args
        .iter()
        .map(|(key, value)| (key.clone(), encode(value, &mut channels)))
        .collect();
    EncodedArgs { payload, channels }
}

fn encode(arg: &Arg, channels: &mut Vec<CallbackId>) -> Value {
    match arg {
        Arg::Null => Value::Null,
        Arg::Bool(b) => Value::Bool(*b),
        Arg::Number(n) => Value::Number(n.clone()),
        Arg::String(s) => Value::String(s.clone()),
        Arg::Array(items) => Value::Array(items.iter().map(|item| encode(item, channels)).collect()),
        Arg::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), encode(value, channels)))
                .collect(),
        ),
        Arg::Channel(channel) => {
            channels.push(channel.id());
            Value::String(channel.sentinel())
        }
    }
}

/// Sends commands to the host
#[derive(Clone)]
pub struct Dispatcher {
    host: Arc<dyn Host>,
}

impl Dispatcher {
    /// Create a dispatcher over a host
    #[must_use]
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self { host }
    }

    /// Send a fire-and-forget command
    ///
    /// Returns the channel ids embedded in the arguments.
    pub fn send(&self, cmd: &str, args: &Args) -> Result<Vec<CallbackId>, TransportError> {
        self.send_request(cmd, args, None, None)
    }

    /// Send a command whose outcome is delivered to `callback` or `error`
    pub fn send_with_callbacks(
        &self,
        cmd: &str,
        args: &Args,
        callback: CallbackId,
        error: CallbackId,
    ) -> Result<Vec<CallbackId>, TransportError> {
        self.send_request(cmd, args, Some(callback), Some(error))
    }

    fn send_request(
        &self,
        cmd: &str,
        args: &Args,
        callback: Option<CallbackId>,
        error: Option<CallbackId>,
    ) -> Result<Vec<CallbackId>, TransportError> {
        let EncodedArgs { payload, channels } = encode_args(args);

        tracing::debug!(
            cmd = %cmd,
            callback = ?callback,
            error = ?error,
            channels = channels.len(),
            "Dispatching command"
        );

        self.host.dispatch(IpcRequest {
            cmd: cmd.to_string(),
            callback,
            error,
            payload: Value::Object(payload),
        })?;

        Ok(channels)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::ChannelRef;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
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

    struct ClosedHost;

    impl Host for ClosedHost {
        fn dispatch(&self, _request: IpcRequest) -> Result<(), TransportError> {
            Err(TransportError::HostUnavailable)
        }
    }

    fn channel(raw: u32) -> ChannelRef {
        ChannelRef::new(CallbackId::from_raw(raw))
    }

    #[test]
    fn test_plugin_command() {
        assert_eq!(plugin_command("fs", "watch"), "plugin:fs|watch");
    }

    #[test]
    fn test_nested_channel_substituted_in_place() {
        let args = Args::new().with("options", Args::new().with("nested", channel(77)));
        let encoded = encode_args(&args);

        assert_eq!(
            Value::Object(encoded.payload),
            json!({"options": {"nested": "__CHANNEL__:77"}})
        );
        assert_eq!(encoded.channels, vec![CallbackId::from_raw(77)]);
    }

    #[test]
    fn test_channels_inside_arrays() {
        let args = Args::new()
            .with("top", channel(1))
            .with("list", vec![Arg::from(channel(2)), Arg::from("x")]);
        let encoded = encode_args(&args);

        assert_eq!(
            Value::Object(encoded.payload),
            json!({"list": ["__CHANNEL__:2", "x"], "top": "__CHANNEL__:1"})
        );
        // BTreeMap key order: "list" before "top"
        assert_eq!(
            encoded.channels,
            vec![CallbackId::from_raw(2), CallbackId::from_raw(1)]
        );
    }

    #[test]
    fn test_plain_args_untouched() {
        let args = Args::new()
            .with("value", 42u32)
            .with("label", "__not a channel")
            .with("missing", Option::<String>::None);
        let encoded = encode_args(&args);

        assert_eq!(
            Value::Object(encoded.payload),
            json!({"value": 42, "label": "__not a channel", "missing": null})
        );
        assert!(encoded.channels.is_empty());
    }

    #[test]
    fn test_send_with_callbacks_builds_request() {
        let host = Arc::new(RecordingHost::default());
        let dispatcher = Dispatcher::new(host.clone());

        let channels = dispatcher
            .send_with_callbacks(
                "plugin:demo|echo",
                &Args::new().with("value", 42u32),
                CallbackId::from_raw(10),
                CallbackId::from_raw(11),
            )
            .unwrap();
        assert!(channels.is_empty());

        let requests = host.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].cmd, "plugin:demo|echo");
        assert_eq!(requests[0].callback, Some(CallbackId::from_raw(10)));
        assert_eq!(requests[0].error, Some(CallbackId::from_raw(11)));
        assert_eq!(requests[0].payload, json!({"value": 42}));
    }

    #[test]
    fn test_send_surfaces_host_error() {
        let dispatcher = Dispatcher::new(Arc::new(ClosedHost));
        let result = dispatcher.send("plugin:demo|noop", &Args::new());
        assert!(matches!(result, Err(TransportError::HostUnavailable)));
    }
}
