//! Observers: the unit of registration in the dispatch engine.
//!
//! An [`Observer`] couples a filter set to a trigger policy and a delivery
//! bridge. The hot accumulator state and the read-mostly metadata live under
//! two independent locks, because timeout ticking and event recording happen
//! on different execution paths and must not serialize against metadata
//! reads.
//!
//! Lock discipline (do not change without auditing every call site): a
//! thread holds at most one of `meta` and `state` at a time; the bridge's
//! own lock may be taken while holding `state` (the fire path) but `state`
//! is never taken while holding a bridge lock.

pub mod bridge;
pub mod filter;
pub mod registry;
pub mod trigger;
mod watcher;

pub use bridge::{DeliveryBridge, DeliverySink, EventGroup, HostRegistry, SinkCapabilities};
pub use filter::{EventFilter, RESERVED_OS_EVENTS};
pub use registry::ObserverRegistry;
pub use trigger::{TriggerCondition, TriggerSnapshot, TriggerState};
pub use watcher::Watcher;

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::types::{EventPack, ObserverId};

struct ObserverMeta {
    filters: Vec<EventFilter>,
    condition: TriggerCondition,
}

/// A registered entity matching events and accumulating trigger state.
pub struct Observer {
    name: String,
    /// Store-assigned sequence; zero until registration.
    seq: AtomicU64,
    /// Read-mostly metadata (filters, configured condition).
    meta: RwLock<ObserverMeta>,
    /// Hot accumulator, mutated on every matched event and timer tick.
    state: Mutex<TriggerState>,
    bridge: RwLock<Option<Arc<DeliveryBridge>>>,
}

impl Observer {
    pub fn new(
        name: impl Into<String>,
        filters: Vec<EventFilter>,
        condition: TriggerCondition,
    ) -> Self {
        Self {
            name: name.into(),
            seq: AtomicU64::new(0),
            meta: RwLock::new(ObserverMeta { filters, condition }),
            state: Mutex::new(TriggerState::default()),
            bridge: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registration id, once assigned by the registry.
    pub fn id(&self) -> Option<ObserverId> {
        ObserverId::new(self.seq.load(Ordering::Acquire))
    }

    pub(crate) fn assign_id(&self, id: ObserverId) {
        self.seq.store(id.value(), Ordering::Release);
    }

    pub fn filters(&self) -> Vec<EventFilter> {
        self.meta.read().filters.clone()
    }

    pub(crate) fn replace_filters(&self, filters: Vec<EventFilter>) {
        self.meta.write().filters = filters;
    }

    pub fn condition(&self) -> TriggerCondition {
        self.meta.read().condition
    }

    pub fn set_condition(&self, condition: TriggerCondition) {
        self.meta.write().condition = condition;
    }

    /// Seed the live accumulator, used when rehydrating a pending backlog.
    pub(crate) fn seed_state(&self, state: TriggerState) {
        *self.state.lock() = state;
    }

    /// True when the event passes at least one filter.
    ///
    /// An observer with no filters accepts every event; an observer that
    /// should accept nothing carries a single empty (never-matching) filter.
    pub fn verify_event(&self, event: &EventPack) -> bool {
        let meta = self.meta.read();
        meta.filters.is_empty() || meta.filters.iter().any(|f| f.matches(event))
    }

    pub fn attach_bridge(&self, bridge: Arc<DeliveryBridge>) {
        *self.bridge.write() = Some(bridge);
    }

    pub fn bridge(&self) -> Option<Arc<DeliveryBridge>> {
        self.bridge.read().clone()
    }

    /// Drop and invalidate the bridge, severing future deliveries.
    pub(crate) fn teardown_bridge(&self) {
        if let Some(bridge) = self.bridge.write().take() {
            bridge.detach();
        }
    }

    /// Account one matched event; fires the trigger sink when a row or size
    /// threshold crosses. Mutation, fire-check and reset are one critical
    /// section under the accumulator lock, so concurrent fires serialize.
    pub fn record_event(&self, event_size: usize) {
        let condition = self.condition();
        let mut state = self.state.lock();
        if let Some(snapshot) = state.record(event_size, &condition) {
            self.fire(snapshot);
        }
    }

    /// Advance the timeout accumulator by `step` elapsed ticks.
    pub fn process_timeout(&self, step: i32) {
        let condition = self.condition();
        let mut state = self.state.lock();
        if let Some(snapshot) = state.tick(step, &condition) {
            self.fire(snapshot);
        }
    }

    /// Startup lifecycle signal.
    pub fn process_startup(&self) {
        let condition = self.condition();
        let mut state = self.state.lock();
        if let Some(snapshot) = state.on_startup(&condition) {
            self.fire(snapshot);
        }
    }

    /// Background lifecycle signal.
    pub fn process_background(&self) {
        let condition = self.condition();
        let mut state = self.state.lock();
        if let Some(snapshot) = state.on_background(&condition) {
            self.fire(snapshot);
        }
    }

    /// Identity over name, filters and condition; two registrations with the
    /// same hash are the same observer config.
    pub fn identity_hash(&self) -> u64 {
        let meta = self.meta.read();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.name.hash(&mut hasher);
        meta.filters.hash(&mut hasher);
        meta.condition.hash(&mut hasher);
        hasher.finish()
    }

    // Absent or torn-down sink makes this a silent no-op: recording must
    // never be blocked by the absence of a consumer.
    fn fire(&self, snapshot: TriggerSnapshot) {
        if let Some(bridge) = self.bridge() {
            bridge.trigger(snapshot);
        }
    }
}
