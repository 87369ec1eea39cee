//! Host-side resources addressed by id

use std::sync::atomic::{AtomicBool, Ordering};

use crate::args::Args;
use crate::invoker::{InvokeError, Invoker};

/// Command that releases a host resource
pub const RESOURCE_CLOSE_COMMAND: &str = "plugin:resources|close";

/// A resource the host owns and the guest refers to by `rid`
#[derive(Debug)]
pub struct Resource {
    rid: u32,
    invoker: Invoker,
    closed: AtomicBool,
}

impl Resource {
    pub(crate) fn new(rid: u32, invoker: Invoker) -> Self {
        Self {
            rid,
            invoker,
            closed: AtomicBool::new(false),
        }
    }

    /// Host resource id
    #[must_use]
    pub fn rid(&self) -> u32 {
        self.rid
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Ask the host to release the resource
    ///
    /// Only the first call reaches the host; later calls return `Ok`.
    pub async fn close(&self) -> Result<(), InvokeError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!(rid = self.rid, "Closing resource");
        self.invoker
            .invoke(RESOURCE_CLOSE_COMMAND, Args::new().with("rid", self.rid))
            .await?;
        Ok(())
    }
}
