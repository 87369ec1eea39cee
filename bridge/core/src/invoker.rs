//! Invoker - One-Shot Request/Response
//!
//! Each [`Invoker::invoke`] reserves two one-shot callbacks (resolve and
//! reject), sends the command, and returns an [`Invocation`] future that
//! completes with whichever side the host fires.
//!
//! # State Machine
//!
//! ```text
//!                 resolve fired
//!   Pending ────────────────────────► Resolved ──┐
//!      │  │       reject fired                   │
//!      │  └─────────────────────────► Rejected ──┼──► sibling id freed
//!      │                                         │
//!      │ future dropped / cancelled              │
//!      └──────► Abandoned ── late reply ─────────┘   (reply discarded)
//! ```
//!
//! The fired id is already gone (one-shot); the settle step frees the
//! sibling so a pair never leaks half of itself. An abandoned invocation
//! keeps both ids reserved until the host answers: freeing them early would
//! let a newer invocation reuse an id and receive the stale reply.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::args::Args;
use crate::dispatcher::Dispatcher;
use crate::host::TransportError;
use crate::registry::{Callback, CallbackId, CallbackMode, CallbackRegistry};

/// Why an invocation did not produce a value
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The host fired the reject callback
    #[error("Command rejected: {0}")]
    Rejected(Value),

    /// The command never reached the host
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The reply side went away without an outcome
    #[error("Invocation dropped before completion")]
    Dropped,

    /// The success value did not match the expected type
    #[error("Failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),
}

impl InvokeError {
    /// The host's rejection payload, if this is a host-reported failure
    #[must_use]
    pub fn rejection(&self) -> Option<&Value> {
        match self {
            Self::Rejected(payload) => Some(payload),
            _ => None,
        }
    }
}

type Reply = Result<Value, InvokeError>;

/// Where a pending call stands
#[derive(Debug)]
enum InvocationState {
    Pending(oneshot::Sender<Reply>),
    Abandoned,
    Resolved,
    Rejected,
    Failed,
}

/// The resolve/reject id pair of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationIds {
    /// Fired with the success value
    pub resolve: CallbackId,
    /// Fired with the failure value
    pub reject: CallbackId,
}

/// Builds one-shot calls over a registry and dispatcher
#[derive(Clone, Debug)]
pub struct Invoker {
    registry: CallbackRegistry,
    dispatcher: Dispatcher,
}

impl Invoker {
    /// Create an invoker
    #[must_use]
    pub fn new(registry: CallbackRegistry, dispatcher: Dispatcher) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }

    /// Send a command and return its pending result
    ///
    /// The command is dispatched before this returns; awaiting the
    /// [`Invocation`] only waits for the reply.
    pub fn invoke(&self, cmd: impl Into<String>, args: Args) -> Invocation {
        let cmd = cmd.into();
        let (reply_tx, reply_rx) = oneshot::channel();
        let state = Arc::new(Mutex::new(InvocationState::Pending(reply_tx)));

        let ids = match self.allocate_pair() {
            Ok(ids) => ids,
            Err(e) => {
                fail(&state, e.into());
                return Invocation::settled(cmd, state, reply_rx, self.dispatcher.clone());
            }
        };

        self.registry.attach(
            ids.resolve,
            Callback::once(settle_handler(
                Arc::clone(&state),
                self.registry.clone(),
                ids.reject,
                true,
            )),
        );
        self.registry.attach(
            ids.reject,
            Callback::once(settle_handler(
                Arc::clone(&state),
                self.registry.clone(),
                ids.resolve,
                false,
            )),
        );

        if let Err(e) = self
            .dispatcher
            .send_with_callbacks(&cmd, &args, ids.resolve, ids.reject)
        {
            tracing::warn!(cmd = %cmd, error = %e, "Dispatch failed, releasing callback ids");
            self.registry.free(ids.resolve);
            self.registry.free(ids.reject);
            fail(&state, e.into());
        }

        Invocation {
            cmd,
            ids: Some(ids),
            state,
            reply: reply_rx,
            dispatcher: self.dispatcher.clone(),
        }
    }

    /// Send a command and decode its success value
    pub fn invoke_as<T: DeserializeOwned>(
        &self,
        cmd: impl Into<String>,
        args: Args,
    ) -> impl Future<Output = Result<T, InvokeError>> {
        let invocation = self.invoke(cmd, args);
        async move {
            let value = invocation.await?;
            serde_json::from_value(value).map_err(InvokeError::Decode)
        }
    }

    fn allocate_pair(&self) -> Result<InvocationIds, TransportError> {
        let resolve = self.registry.allocate(CallbackMode::OneShot)?;
        match self.registry.allocate(CallbackMode::OneShot) {
            Ok(reject) => Ok(InvocationIds { resolve, reject }),
            Err(e) => {
                self.registry.free(resolve);
                Err(e.into())
            }
        }
    }
}

/// Build the handler for one side of the pair
///
/// `sibling` is the other side's id, freed as the cleanup step.
fn settle_handler(
    state: Arc<Mutex<InvocationState>>,
    registry: CallbackRegistry,
    sibling: CallbackId,
    success: bool,
) -> impl FnOnce(Value) + Send + 'static {
    move |payload| {
        let next = if success {
            InvocationState::Resolved
        } else {
            InvocationState::Rejected
        };
        let previous = std::mem::replace(&mut *state.lock(), next);

        registry.free(sibling);

        match previous {
            InvocationState::Pending(reply) => {
                let outcome = if success {
                    Ok(payload)
                } else {
                    Err(InvokeError::Rejected(payload))
                };
                if reply.send(outcome).is_err() {
                    tracing::debug!("Invocation receiver gone before reply");
                }
            }
            InvocationState::Abandoned => {
                tracing::debug!(success, "Reply for abandoned invocation discarded");
            }
            InvocationState::Resolved | InvocationState::Rejected | InvocationState::Failed => {
                tracing::debug!("Invocation already settled, reply discarded");
            }
        }
    }
}

fn fail(state: &Mutex<InvocationState>, error: InvokeError) {
    let previous = std::mem::replace(&mut *state.lock(), InvocationState::Failed);
    if let InvocationState::Pending(reply) = previous {
        // The receiver is still held by the Invocation being built
        let _ = reply.send(Err(error));
    }
}

/// A pending command result
///
/// Await it for the outcome. Dropping it before the reply abandons the
/// call: the reply is discarded when it arrives, and only then are its ids
/// released.
#[must_use = "an invocation does nothing visible unless awaited"]
pub struct Invocation {
    cmd: String,
    ids: Option<InvocationIds>,
    state: Arc<Mutex<InvocationState>>,
    reply: oneshot::Receiver<Reply>,
    dispatcher: Dispatcher,
}

impl Invocation {
    fn settled(
        cmd: String,
        state: Arc<Mutex<InvocationState>>,
        reply: oneshot::Receiver<Reply>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            cmd,
            ids: None,
            state,
            reply,
            dispatcher,
        }
    }

    /// The command this invocation sent
    #[must_use]
    pub fn command(&self) -> &str {
        &self.cmd
    }

    /// The resolve/reject ids, if allocation succeeded
    #[must_use]
    pub fn ids(&self) -> Option<InvocationIds> {
        self.ids
    }

    /// Whether no outcome has arrived yet
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), InvocationState::Pending(_))
    }

    /// Stop waiting for the result
    ///
    /// Same as dropping the invocation.
    pub fn cancel(self) {
        drop(self);
    }

    /// Stop waiting and ask the host to cancel the command
    ///
    /// Sends `cancel_cmd` with `{ "requestId": <resolve id> }`. Best effort:
    /// the command may already have finished, and a reply that still
    /// arrives is absorbed.
    pub fn cancel_with(self, cancel_cmd: &str) {
        if let (Some(ids), true) = (self.ids, self.is_pending()) {
            let args = Args::new().with("requestId", ids.resolve.as_u32());
            if let Err(e) = self.dispatcher.send(cancel_cmd, &args) {
                tracing::debug!(cmd = %cancel_cmd, error = %e, "Cancel request not delivered");
            }
        }
        drop(self);
    }
}

impl Future for Invocation {
    type Output = Result<Value, InvokeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.reply).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(InvokeError::Dropped)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if matches!(*state, InvocationState::Pending(_)) {
            *state = InvocationState::Abandoned;
            tracing::debug!(cmd = %self.cmd, "Invocation abandoned before reply");
        }
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("cmd", &self.cmd)
            .field("ids", &self.ids)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}
