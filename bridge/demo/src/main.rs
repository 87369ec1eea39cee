//! Bridge Demo - Embedded Host Walkthrough
//!
//! Runs the command bridge against an in-process host and exercises each
//! transport path once: a one-shot echo, a ticker streamed through a
//! fanned-out channel, and an event listen/emit/unlisten round.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults
//! bridge-demo
//!
//! # Stream more ticks, sequential callback ids
//! bridge-demo --ticks 20 --id-allocation sequential
//!
//! # With config file
//! bridge-demo --config ./bridge.toml
//!
//! # Verbose logging
//! RUST_LOG=debug bridge-demo
//! ```

mod plugins;

use std::path::PathBuf;

use anyhow::{Context, Result};
use bridge_core::{
    default_config_path, load_config_from_path, plugin_command, Args as CommandArgs, Bridge,
    ConfigOverrides, IdAllocation, InProcessHost,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

use plugins::DemoPlugins;

/// Bridge Demo - drive the command bridge against an embedded host
#[derive(Parser, Debug)]
#[command(name = "bridge-demo")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "BRIDGE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "BRIDGE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Number of ticker messages to stream before tearing down
    #[arg(short = 't', long, default_value_t = 5)]
    ticks: u32,

    /// Ticker period in milliseconds
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,

    /// Callback id allocation strategy (random, sequential)
    #[arg(long, value_name = "STRATEGY")]
    id_allocation: Option<IdAllocation>,
}

#[derive(Debug, Serialize)]
struct EchoRequest {
    value: u32,
}

#[derive(Debug, Deserialize)]
struct EchoReply {
    value: u32,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("bridge_demo={level},bridge_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

async fn run_echo(bridge: &Bridge) -> Result<()> {
    let request = CommandArgs::from_serialize(&EchoRequest { value: 42 })
        .context("failed to encode echo request")?;
    let reply: EchoReply = bridge
        .invoke_as(plugin_command("demo", "echo"), request)
        .await
        .context("echo failed")?;

    info!(value = reply.value, "Echo round trip complete");
    Ok(())
}

async fn run_ticker(bridge: &Bridge, ticks: u32, interval_ms: u64) -> Result<()> {
    let fanout = bridge.fanout().context("failed to open ticker channel")?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    fanout.add_listener(|message| tracing::debug!(%message, "Tick"));
    fanout.add_listener(move |message| {
        let _ = tx.send(message);
    });

    bridge
        .invoke(
            plugin_command("demo", "start_ticker"),
            CommandArgs::new()
                .with("onTick", &fanout)
                .with("intervalMs", interval_ms),
        )
        .await
        .context("start_ticker failed")?;

    for _ in 0..ticks {
        let Some(message) = rx.recv().await else {
            anyhow::bail!("ticker channel closed early");
        };
        info!(tick = %message["tick"], "Received tick");
    }

    let stop = CommandArgs::new().with("id", fanout.id().as_u32());
    fanout
        .close_with(&plugin_command("demo", "stop_ticker"), &stop)
        .context("stop_ticker failed")?;
    info!(ticks, "Ticker torn down");
    Ok(())
}

async fn run_events(bridge: &Bridge) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = bridge
        .listen("demo://greeting", move |event| {
            let _ = tx.send(event);
        })
        .await
        .context("listen failed")?;

    let _first = bridge
        .once("demo://greeting", |event| {
            info!(payload = %event.payload, "First greeting (once)");
        })
        .await
        .context("once failed")?;

    for name in ["ada", "grace"] {
        bridge
            .emit("demo://greeting", json!({ "name": name }))
            .await
            .context("emit failed")?;
    }

    for _ in 0..2 {
        if let Some(event) = rx.recv().await {
            info!(event = %event.event, payload = %event.payload, "Greeting received");
        }
    }

    listener.unlisten().context("unlisten failed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Bridge demo starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(strategy) = args.id_allocation {
        overrides = overrides.with_id_allocation(strategy);
    }
    overrides.apply(&mut config);
    config.validate().context("invalid configuration")?;

    info!(
        source = %config.source(),
        id_allocation = %config.id_allocation,
        "Configuration loaded"
    );

    let (bridge, host, deliveries) = InProcessHost::connect(&config);
    let plugins = DemoPlugins::install(&host);
    let delivery_task = deliveries.spawn();

    run_echo(&bridge).await?;
    run_ticker(&bridge, args.ticks, args.interval_ms).await?;
    run_events(&bridge).await?;

    info!(
        live_callbacks = bridge.live_callbacks(),
        running_tickers = plugins.running(),
        requests = host.requests().len(),
        "Demo complete"
    );

    delivery_task.abort();
    Ok(())
}
