//! Delivery Marshalling
//!
//! The host may answer from any thread. Answers are queued on an unbounded
//! tokio channel and drained by a single [`DeliveryLoop`], so every handler
//! runs on the guest's own logical thread and never needs its own locking.
//!
//! ```text
//!   host thread A ──┐
//!   host thread B ──┼── DeliverySink ──► Inbox ──► DeliveryLoop ──► CallbackRegistry::resolve
//!   dispatch()   ───┘      (clone)        (FIFO)     (guest task)
//! ```
//!
//! A single queue keeps per-channel order equal to the host's send order.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::registry::{CallbackId, CallbackRegistry};

/// A host→guest message addressed to one callback
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Target callback
    pub id: CallbackId,
    /// Payload handed to the callback
    pub payload: Value,
}

/// Host-side handle for sending deliveries to the guest
#[derive(Clone, Debug)]
pub struct DeliverySink {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl DeliverySink {
    /// Queue a delivery
    ///
    /// Returns false once the guest side has gone away.
    pub fn deliver(&self, id: CallbackId, payload: Value) -> bool {
        self.tx.send(Delivery { id, payload }).is_ok()
    }

    /// Whether the guest side has gone away
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Guest-side end of the delivery queue
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

/// Create a connected sink/inbox pair
///
/// Give the sink to the host and the inbox to
/// [`crate::Bridge::delivery_loop`].
#[must_use]
pub fn delivery_channel() -> (DeliverySink, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DeliverySink { tx }, Inbox { rx })
}

/// Drains the inbox into the registry
#[derive(Debug)]
pub struct DeliveryLoop {
    inbox: Inbox,
    registry: CallbackRegistry,
}

impl DeliveryLoop {
    pub(crate) fn new(inbox: Inbox, registry: CallbackRegistry) -> Self {
        Self { inbox, registry }
    }

    /// Deliver everything queued right now, without waiting
    ///
    /// Returns the number of deliveries processed (stale ones included).
    pub fn pump(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(delivery) = self.inbox.rx.try_recv() {
            self.deliver(delivery);
            processed += 1;
        }
        processed
    }

    /// Deliver until every sink has been dropped
    pub async fn run(mut self) {
        while let Some(delivery) = self.inbox.rx.recv().await {
            self.deliver(delivery);
        }
        tracing::debug!("Delivery inbox closed, loop exiting");
    }

    /// Run the loop on the current tokio runtime
    ///
    /// On a current-thread runtime this keeps every handler on the same
    /// thread as the code that awaits the results.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn deliver(&self, delivery: Delivery) {
        let Delivery { id, payload } = delivery;
        let registry = &self.registry;
        if catch_unwind(AssertUnwindSafe(|| registry.resolve(id, payload))).is_err() {
            tracing::error!(callback_id = %id, "Callback handler panicked");
        }
    }
}
