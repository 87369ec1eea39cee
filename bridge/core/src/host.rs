//! Host Boundary
//!
//! The one call surface that crosses from guest to host. Everything the
//! guest asks for becomes an [`IpcRequest`] handed to [`Host::dispatch`];
//! everything the host answers comes back as a delivery addressed to a
//! [`CallbackId`] (see [`crate::delivery`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::registry::{CallbackId, RegistryError};

/// A command on its way to the host
///
/// One-shot form carries `callback`/`error` ids; fire-and-forget commands
/// (teardown, unlisten) carry neither. Channel references inside `payload`
/// have already been replaced by their sentinel strings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IpcRequest {
    /// Command name, `plugin:<plugin>|<command>` by convention
    pub cmd: String,
    /// Id to deliver the success value to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<CallbackId>,
    /// Id to deliver the failure value to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallbackId>,
    /// Substituted argument object
    pub payload: Value,
}

impl IpcRequest {
    /// Whether the guest expects a reply
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        self.callback.is_some() || self.error.is_some()
    }
}

/// Errors that can occur while handing a command to the host
#[derive(Debug, Error)]
pub enum TransportError {
    /// The host side is gone
    #[error("Host unavailable")]
    HostUnavailable,

    /// The host refused the request before executing it
    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    /// No callback id could be allocated
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// The privileged side of the bridge
///
/// `dispatch` is fire-and-forget: it returns once the request is handed
/// over, never waiting for the command to run. Replies travel back through
/// the [`crate::delivery::DeliverySink`] the host was built with, from
/// whatever thread the host likes.
pub trait Host: Send + Sync {
    /// Hand a request to the host
    fn dispatch(&self, request: IpcRequest) -> Result<(), TransportError>;
}
