//! Callback Registry - Identifier Allocation and Handler Table
//!
//! Every reply the host sends back to the guest is addressed by a numeric
//! [`CallbackId`]. The registry owns the table mapping those ids to handler
//! closures and is the only place ids are handed out or retired.
//!
//! # Entry Lifecycle
//!
//! ```text
//!   allocate(mode)          attach(id, callback)          resolve(id, payload)
//!  ───────────────► Reserved ────────────────────► Live ────────────────────► (OneShot: removed)
//!                      │                            │                         (Persistent: stays)
//!                      └────────── free(id) ────────┴──► removed (idempotent)
//! ```
//!
//! Allocation never overwrites a live entry: a candidate id that is already
//! in the table is skipped, whichever [`IdAllocation`] strategy is in use.
//!
//! # Thread Safety
//!
//! The table lives behind `Arc<Mutex<>>` so clones of the registry share it.
//! Handlers are always run after the lock is released, which lets a handler
//! free its sibling, open a new channel, or resolve another id.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Identifier of a registry entry, embedded in outgoing commands
///
/// Unique among live entries only; a freed id may be handed out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackId(u32);

impl CallbackId {
    /// Create an id from a raw value (host side decoding, tests)
    #[must_use]
    pub const fn from_raw(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw numeric value
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether an entry survives its first invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallbackMode {
    /// Consumed by exactly one invocation
    OneShot,
    /// Invocable until explicitly freed
    Persistent,
}

/// How candidate ids are drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdAllocation {
    /// Random 32-bit values, retried on collision with a live id
    #[default]
    Random,
    /// Wrapping counter, skipping ids that are still live
    Sequential,
}

impl FromStr for IdAllocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "sequential" => Ok(Self::Sequential),
            other => Err(format!("unknown id allocation strategy '{other}'")),
        }
    }
}

impl fmt::Display for IdAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Random => write!(f, "random"),
            Self::Sequential => write!(f, "sequential"),
        }
    }
}

/// Errors raised by the registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No free id was found within the attempt budget
    #[error("no free callback id after {attempts} attempts")]
    Exhausted {
        /// Number of candidates tried
        attempts: u32,
    },
}

/// Handler closure stored in the registry
pub enum Callback {
    /// Runs once, then the entry is gone
    OneShot(Box<dyn FnOnce(Value) + Send>),
    /// Runs on every delivery while the entry is live
    Persistent(Arc<dyn Fn(Value) + Send + Sync>),
}

impl Callback {
    /// Wrap a closure as a one-shot callback
    pub fn once(handler: impl FnOnce(Value) + Send + 'static) -> Self {
        Self::OneShot(Box::new(handler))
    }

    /// Wrap a closure as a persistent callback
    pub fn persistent(handler: impl Fn(Value) + Send + Sync + 'static) -> Self {
        Self::Persistent(Arc::new(handler))
    }

    /// The mode this callback must be registered with
    #[must_use]
    pub fn mode(&self) -> CallbackMode {
        match self {
            Self::OneShot(_) => CallbackMode::OneShot,
            Self::Persistent(_) => CallbackMode::Persistent,
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Callback").field(&self.mode()).finish()
    }
}

enum Slot {
    Reserved(CallbackMode),
    OneShot(Box<dyn FnOnce(Value) + Send>),
    Persistent(Arc<dyn Fn(Value) + Send + Sync>),
}

impl From<Callback> for Slot {
    fn from(callback: Callback) -> Self {
        match callback {
            Callback::OneShot(handler) => Self::OneShot(handler),
            Callback::Persistent(handler) => Self::Persistent(handler),
        }
    }
}

/// A handler taken out of the table, ready to run without the lock held
enum Fire {
    OneShot(Box<dyn FnOnce(Value) + Send>),
    Persistent(Arc<dyn Fn(Value) + Send + Sync>),
}

struct RegistryInner {
    entries: HashMap<CallbackId, Slot>,
    /// Next candidate for [`IdAllocation::Sequential`]
    next: u32,
}

/// Keyed table of live callbacks
///
/// Cheap to clone; all clones share one table.
#[derive(Clone)]
pub struct CallbackRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    strategy: IdAllocation,
    max_attempts: u32,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new(IdAllocation::default(), Self::DEFAULT_MAX_ATTEMPTS)
    }
}

impl CallbackRegistry {
    /// Default number of candidates tried before giving up
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 64;

    /// Create an empty registry
    #[must_use]
    pub fn new(strategy: IdAllocation, max_attempts: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                entries: HashMap::new(),
                next: 1,
            })),
            strategy,
            max_attempts: max_attempts.max(1),
        }
    }

    /// The allocation strategy in use
    #[must_use]
    pub fn strategy(&self) -> IdAllocation {
        self.strategy
    }

    /// Reserve a fresh id for an entry of the given mode
    ///
    /// The slot counts as live immediately, so it can't be handed out twice,
    /// but deliveries are ignored until a handler is attached.
    pub fn allocate(&self, mode: CallbackMode) -> Result<CallbackId, RegistryError> {
        let mut inner = self.inner.lock();

        for _ in 0..self.max_attempts {
            let candidate = match self.strategy {
                IdAllocation::Random => rand::thread_rng().gen::<u32>(),
                IdAllocation::Sequential => {
                    let candidate = inner.next;
                    inner.next = inner.next.wrapping_add(1);
                    candidate
                }
            };

            let id = CallbackId(candidate);
            if let Entry::Vacant(slot) = inner.entries.entry(id) {
                slot.insert(Slot::Reserved(mode));
                tracing::trace!(callback_id = %id, ?mode, "Callback id allocated");
                return Ok(id);
            }
        }

        tracing::warn!(
            attempts = self.max_attempts,
            live = inner.entries.len(),
            "Callback id allocation exhausted"
        );
        Err(RegistryError::Exhausted {
            attempts: self.max_attempts,
        })
    }

    /// Attach a handler to a reserved id
    ///
    /// Returns false if the id is not reserved (already freed, already
    /// attached) or the callback's mode differs from the reservation.
    pub fn attach(&self, id: CallbackId, callback: Callback) -> bool {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.entries.get_mut(&id) else {
            return false;
        };

        let mode = callback.mode();
        if !matches!(slot, Slot::Reserved(reserved) if *reserved == mode) {
            tracing::warn!(callback_id = %id, ?mode, "Refusing to attach to a non-reserved slot");
            return false;
        }

        *slot = Slot::from(callback);
        true
    }

    /// Allocate and attach in one step
    pub fn register(&self, callback: Callback) -> Result<CallbackId, RegistryError> {
        let id = self.allocate(callback.mode())?;
        self.attach(id, callback);
        Ok(id)
    }

    /// Deliver a payload to an entry
    ///
    /// One-shot entries are removed before their handler runs. Unknown ids
    /// are ignored: the host may deliver late, after a teardown already
    /// freed the entry. Returns whether a handler ran.
    pub fn resolve(&self, id: CallbackId, payload: Value) -> bool {
        let fire = {
            let mut inner = self.inner.lock();
            match inner.entries.get(&id) {
                None => None,
                Some(Slot::Reserved(_)) => {
                    tracing::warn!(callback_id = %id, "Delivery to a callback with no handler attached");
                    return false;
                }
                Some(Slot::Persistent(handler)) => Some(Fire::Persistent(Arc::clone(handler))),
                Some(Slot::OneShot(_)) => match inner.entries.remove(&id) {
                    Some(Slot::OneShot(handler)) => Some(Fire::OneShot(handler)),
                    _ => None,
                },
            }
        };

        match fire {
            Some(Fire::OneShot(handler)) => {
                handler(payload);
                true
            }
            Some(Fire::Persistent(handler)) => {
                handler(payload);
                true
            }
            None => {
                tracing::debug!(callback_id = %id, "Stale delivery ignored");
                false
            }
        }
    }

    /// Remove an entry without running it
    ///
    /// Freeing an id that is not live is a no-op. Returns whether an entry
    /// was removed.
    pub fn free(&self, id: CallbackId) -> bool {
        let removed = self.inner.lock().entries.remove(&id).is_some();
        if removed {
            tracing::trace!(callback_id = %id, "Callback id freed");
        }
        removed
    }

    /// Check whether an id is currently live (reserved or attached)
    #[must_use]
    pub fn is_live(&self, id: CallbackId) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    /// Number of live entries
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Snapshot of all live ids
    #[must_use]
    pub fn live_ids(&self) -> Vec<CallbackId> {
        self.inner.lock().entries.keys().copied().collect()
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CallbackRegistry")
            .field("strategy", &self.strategy)
            .field("live", &inner.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn(Value) + Send + Sync + Clone + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&count);
        (count, move |_| {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_callback_id_display() {
        assert_eq!(CallbackId::from_raw(42).to_string(), "42");
    }

    #[test]
    fn test_id_allocation_from_str() {
        assert_eq!("random".parse::<IdAllocation>(), Ok(IdAllocation::Random));
        assert_eq!(
            " Sequential ".parse::<IdAllocation>(),
            Ok(IdAllocation::Sequential)
        );
        assert!("fibonacci".parse::<IdAllocation>().is_err());
    }

    #[test]
    fn test_allocations_are_distinct_random() {
        let registry = CallbackRegistry::new(IdAllocation::Random, 64);
        let ids: HashSet<_> = (0..5_000)
            .map(|_| registry.allocate(CallbackMode::OneShot).unwrap())
            .collect();
        assert_eq!(ids.len(), 5_000);
        assert_eq!(registry.live_count(), 5_000);
    }

    #[test]
    fn test_allocations_are_distinct_sequential() {
        let registry = CallbackRegistry::new(IdAllocation::Sequential, 64);
        let ids: HashSet<_> = (0..5_000)
            .map(|_| registry.allocate(CallbackMode::Persistent).unwrap())
            .collect();
        assert_eq!(ids.len(), 5_000);
    }

    #[test]
    fn test_sequential_skips_live_ids_after_wraparound() {
        let registry = CallbackRegistry::new(IdAllocation::Sequential, 8);
        let first = registry.allocate(CallbackMode::OneShot).unwrap();
        assert_eq!(first.as_u32(), 1);

        // Wind the counter back around so it lands on the live id again
        registry.inner.lock().next = 1;
        let second = registry.allocate(CallbackMode::OneShot).unwrap();
        assert_ne!(first, second);
        assert_eq!(second.as_u32(), 2);
    }

    #[test]
    fn test_allocation_exhausted() {
        let registry = CallbackRegistry::new(IdAllocation::Sequential, 3);
        {
            let mut inner = registry.inner.lock();
            for raw in 1..=3 {
                inner
                    .entries
                    .insert(CallbackId(raw), Slot::Reserved(CallbackMode::OneShot));
            }
            inner.next = 1;
        }

        let result = registry.allocate(CallbackMode::OneShot);
        assert_eq!(result, Err(RegistryError::Exhausted { attempts: 3 }));
    }

    #[test]
    fn test_one_shot_fires_once() {
        let registry = CallbackRegistry::default();
        let (count, handler) = counter();
        let id = registry.register(Callback::once(handler)).unwrap();

        assert!(registry.resolve(id, Value::Null));
        assert!(!registry.resolve(id, Value::Null));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!registry.is_live(id));
    }

    #[test]
    fn test_persistent_fires_until_freed() {
        let registry = CallbackRegistry::default();
        let (count, handler) = counter();
        let id = registry.register(Callback::persistent(handler)).unwrap();

        for _ in 0..10 {
            assert!(registry.resolve(id, Value::Null));
        }
        assert!(registry.free(id));
        assert!(!registry.resolve(id, Value::Null));
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_free_is_idempotent() {
        let registry = CallbackRegistry::default();
        let id = registry.allocate(CallbackMode::OneShot).unwrap();
        assert!(registry.free(id));
        assert!(!registry.free(id));
        assert!(!registry.free(CallbackId::from_raw(7)));
    }

    #[test]
    fn test_reserved_slot_ignores_delivery() {
        let registry = CallbackRegistry::default();
        let id = registry.allocate(CallbackMode::Persistent).unwrap();
        assert!(!registry.resolve(id, Value::Null));
        assert!(registry.is_live(id));
    }

    #[test]
    fn test_attach_rejects_mode_mismatch() {
        let registry = CallbackRegistry::default();
        let id = registry.allocate(CallbackMode::OneShot).unwrap();
        let (_, handler) = counter();
        assert!(!registry.attach(id, Callback::persistent(handler.clone())));
        assert!(registry.attach(id, Callback::once(handler.clone())));
        // Second attach to an already-attached slot is refused
        assert!(!registry.attach(id, Callback::once(handler)));
    }

    #[test]
    fn test_handler_may_free_other_entries() {
        let registry = CallbackRegistry::default();
        let sibling = registry.allocate(CallbackMode::OneShot).unwrap();
        let inner_registry = registry.clone();
        let id = registry
            .register(Callback::once(move |_| {
                inner_registry.free(sibling);
            }))
            .unwrap();

        assert!(registry.resolve(id, Value::Null));
        assert!(!registry.is_live(sibling));
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_clone_is_shared() {
        let registry1 = CallbackRegistry::default();
        let registry2 = registry1.clone();
        let id = registry1.allocate(CallbackMode::OneShot).unwrap();
        assert!(registry2.is_live(id));
        assert_eq!(registry2.live_ids(), vec![id]);
    }
}
