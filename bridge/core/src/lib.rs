//! Bridge Core - Command & Channel Transport
//!
//! The one narrow asynchronous bridge between sandboxed guest code and a
//! privileged host. Guest code invokes host commands and gets back either a
//! single reply or an ongoing stream of messages; plugin wrappers are thin
//! typed pass-throughs over it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          GUEST                                    │
//! │                                                                   │
//! │   plugin code ──► Bridge ─┬─ Invoker ──── invoke() ──► Invocation │
//! │                           ├─ Channel / ChannelFanout               │
//! │                           ├─ Events (listen / once / emit)         │
//! │                           └─ Resource                              │
//! │                                  │                                 │
//! │                      CallbackRegistry (id → handler)               │
//! │                          ▲               │                         │
//! │                          │          Dispatcher                     │
//! │                    DeliveryLoop          │ IpcRequest              │
//! └──────────────────────────┼───────────────┼─────────────────────────┘
//!                            │ (id, payload) │
//!                       DeliverySink         ▼
//! ┌──────────────────────────┴────────────────────────────────────────┐
//! │                  HOST (Host::dispatch, any thread)                 │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Bridge`]: Everything plugin code uses
//! - [`Invocation`]: A pending one-shot result (a future)
//! - [`Channel`]: A persistent host→guest stream
//! - [`ListenerHandle`]: A registered event listener
//! - [`Host`]: The dispatch boundary; [`InProcessHost`] implements it in-process
//!
//! # Quick Start
//!
//! ```ignore
//! use bridge_core::{Args, BridgeConfig, InProcessHost};
//!
//! let (bridge, host, deliveries) = InProcessHost::connect(&BridgeConfig::default());
//! host.register_command("plugin:demo|echo", |request| {
//!     request.responder.resolve(request.payload.clone());
//! });
//! deliveries.spawn();
//!
//! let reply = bridge
//!     .invoke("plugin:demo|echo", Args::new().with("value", 42u32))
//!     .await?;
//! ```
//!
//! # Module Overview
//!
//! - [`registry`]: Callback id allocation and the id → handler table
//! - [`args`]: Argument trees and channel references
//! - [`dispatcher`]: Channel substitution and the send path
//! - [`invoker`]: One-shot request/response
//! - [`channel`]: Persistent streams
//! - [`fanout`]: One channel, many listeners
//! - [`listener`]: Event listen/unlisten/emit
//! - [`resource`]: Host resources addressed by id
//! - [`delivery`]: Marshalling host replies onto the guest loop
//! - [`host`]: The host boundary
//! - [`in_process`]: Embedded host
//! - [`config`]: TOML/env configuration

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod args;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod fanout;
pub mod host;
pub mod in_process;
pub mod invoker;
pub mod listener;
pub mod registry;
pub mod resource;

// Re-exports for convenience
pub use args::{Arg, Args, ChannelRef, CHANNEL_PREFIX};
pub use bridge::Bridge;
pub use channel::{Channel, ChannelState, MessageHandler};
pub use delivery::{delivery_channel, Delivery, DeliveryLoop, DeliverySink, Inbox};
pub use dispatcher::{encode_args, plugin_command, Dispatcher, EncodedArgs};
pub use fanout::{ChannelFanout, ListenerKey};
pub use host::{Host, IpcRequest, TransportError};
pub use in_process::{CommandHandler, HostChannel, HostRequest, InProcessHost, Responder};
pub use invoker::{Invocation, InvocationIds, InvokeError, Invoker};
pub use listener::{Event, EventCommands, Events, ListenerHandle};
pub use registry::{
    Callback, CallbackId, CallbackMode, CallbackRegistry, IdAllocation, RegistryError,
};
pub use resource::Resource;

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, BridgeConfig, BridgeToml,
    ConfigError, ConfigOverrides, ConfigSource,
};
