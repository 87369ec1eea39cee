//! Demo host plugins
//!
//! A handful of host commands for the demo to drive:
//!
//! - `plugin:demo|echo` resolves with its own arguments
//! - `plugin:demo|start_ticker` streams `{tick}` into the `onTick` channel
//! - `plugin:demo|stop_ticker` stops the ticker feeding channel `id`

use std::sync::Arc;
use std::time::Duration;

use bridge_core::{plugin_command, HostRequest, InProcessHost};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::task::AbortHandle;

/// Default ticker period when the guest doesn't give one
const DEFAULT_INTERVAL_MS: u64 = 100;

/// Errors reported back to the guest as rejections
#[derive(Debug, Error)]
pub enum PluginError {
    /// A required channel argument was absent or not a channel reference
    #[error("missing channel argument '{0}'")]
    MissingChannel(&'static str),

    /// Arguments didn't decode
    #[error("invalid arguments: {0}")]
    InvalidArgs(#[from] serde_json::Error),

    /// The command needs a tokio runtime and none is running
    #[error("no async runtime available")]
    NoRuntime,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartTicker {
    #[serde(default)]
    interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StopTicker {
    id: u32,
}

/// Running tickers keyed by the guest channel they feed
#[derive(Debug, Default)]
pub struct DemoPlugins {
    tickers: DashMap<u32, AbortHandle>,
}

impl DemoPlugins {
    /// Register the demo commands on `host`
    pub fn install(host: &InProcessHost) -> Arc<Self> {
        let plugins = Arc::new(Self::default());

        host.register_command(plugin_command("demo", "echo"), |request| {
            request.responder.resolve(request.payload.clone());
        });

        let start = Arc::clone(&plugins);
        host.register_command(plugin_command("demo", "start_ticker"), move |request| {
            reply(&request, start.start_ticker(&request));
        });

        let stop = Arc::clone(&plugins);
        host.register_command(plugin_command("demo", "stop_ticker"), move |request| {
            reply(&request, stop.stop_ticker(&request).map(|stopped| json!(stopped)));
        });

        plugins
    }

    /// Number of tickers still running
    #[must_use]
    pub fn running(&self) -> usize {
        self.tickers.len()
    }

    fn start_ticker(&self, request: &HostRequest) -> Result<serde_json::Value, PluginError> {
        let channel = request
            .channel("onTick")
            .ok_or(PluginError::MissingChannel("onTick"))?;
        let args: StartTicker = request.args()?;
        let period_ms = args.interval_ms.unwrap_or(DEFAULT_INTERVAL_MS).max(1);
        let period = Duration::from_millis(period_ms);
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PluginError::NoRuntime)?;

        let id = channel.id().as_u32();
        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut tick: u64 = 0;
            loop {
                interval.tick().await;
                tick += 1;
                if !channel.send(json!({ "tick": tick })) {
                    tracing::debug!(channel_id = id, "Guest gone, ticker exiting");
                    break;
                }
            }
        });

        if let Some(previous) = self.tickers.insert(id, task.abort_handle()) {
            previous.abort();
        }
        tracing::info!(channel_id = id, period_ms, "Ticker started");
        Ok(json!(id))
    }

    fn stop_ticker(&self, request: &HostRequest) -> Result<bool, PluginError> {
        let StopTicker { id } = request.args()?;
        match self.tickers.remove(&id) {
            Some((_, handle)) => {
                handle.abort();
                tracing::info!(channel_id = id, "Ticker stopped");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn reply(request: &HostRequest, outcome: Result<serde_json::Value, PluginError>) {
    match outcome {
        Ok(value) => {
            request.responder.resolve(value);
        }
        Err(e) => {
            tracing::warn!(cmd = %request.cmd, error = %e, "Plugin command failed");
            request.responder.reject(json!(e.to_string()));
        }
    }
}
