//! Lifetime-safe callback delivery across runtime boundaries.
//!
//! A delivery sink belongs to a hosting execution context (a binding
//! runtime, an embedder thread, a test harness) that may be torn down
//! asynchronously, concurrently with an in-flight delivery. The bridge holds
//! only a generation-counted handle to its host: the [`HostRegistry`] keeps a
//! `host -> generation` table, a bridge remembers the generation it was bound
//! at, and every invoke re-checks the generation under the bridge lock. A
//! teardown bumps the generation and then drains each bound bridge's lock, so
//! once [`HostRegistry::teardown_host`] returns no sink of that host can run
//! again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::debug_event;
use crate::error::{Error, Result};
use crate::observer::TriggerSnapshot;
use crate::store::StoredEvent;
use crate::types::HostId;

bitflags! {
    /// Delivery capabilities a sink implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SinkCapabilities: u8 {
        const TRIGGER = 1 << 0;
        const RECEIVE = 1 << 1;
    }
}

/// Matching events for one event name, as handed to a receive sink.
#[derive(Debug, Clone)]
pub struct EventGroup {
    pub name: String,
    pub events: Vec<Arc<StoredEvent>>,
}

/// Polymorphic delivery capability interface.
///
/// One trait covers trigger-only, receive-only and combined sinks; binding
/// layers implement only the capability they need and report it via
/// [`capabilities`](Self::capabilities). Callbacks run under the bridge lock
/// and must not re-enter the bridge or tear down their own host.
pub trait DeliverySink: Send + Sync {
    fn capabilities(&self) -> SinkCapabilities;

    /// Threshold crossing notification with the counters as of the fire.
    fn on_trigger(&self, _snapshot: TriggerSnapshot) {}

    /// Structured delivery of a matched batch, grouped by event name.
    ///
    /// Returns true when the consumer accepted the batch; accepted events
    /// are removed from the pending backlog asynchronously.
    fn on_receive(&self, _domain: &str, _groups: &[EventGroup]) -> bool {
        false
    }
}

/// Runtime-lifetime-safe wrapper around a delivery sink.
///
/// Exclusively owned by its watcher. All operations serialize on the
/// per-bridge lock; bridges of different watchers never contend.
pub struct DeliveryBridge {
    host: HostId,
    generation: u64,
    hosts: Arc<HostRegistry>,
    sink: Mutex<Option<Arc<dyn DeliverySink>>>,
}

impl DeliveryBridge {
    /// Capabilities of the bound sink, or empty after detach/teardown.
    pub fn capabilities(&self) -> SinkCapabilities {
        self.sink
            .lock()
            .as_ref()
            .map_or(SinkCapabilities::empty(), |sink| sink.capabilities())
    }

    /// Invoke the trigger sink; silently a no-op when the sink is missing,
    /// lacks the capability, or its host generation is stale.
    pub fn trigger(&self, snapshot: TriggerSnapshot) -> bool {
        let guard = self.sink.lock();
        let Some(sink) = guard.as_ref() else {
            return false;
        };
        if !self.host_live() {
            debug_event!("bridge", "stale host on trigger", "{}", self.host);
            return false;
        }
        if !sink.capabilities().contains(SinkCapabilities::TRIGGER) {
            return false;
        }
        sink.on_trigger(snapshot);
        true
    }

    /// Invoke the receive sink with a name-grouped batch.
    ///
    /// Returns true only when the sink ran and accepted the batch.
    pub fn receive(&self, domain: &str, groups: &[EventGroup]) -> bool {
        let guard = self.sink.lock();
        let Some(sink) = guard.as_ref() else {
            return false;
        };
        if !self.host_live() {
            debug_event!("bridge", "stale host on receive", "{}", self.host);
            return false;
        }
        if !sink.capabilities().contains(SinkCapabilities::RECEIVE) {
            return false;
        }
        sink.on_receive(domain, groups)
    }

    /// Drop the sink reference; later invokes become no-ops.
    pub(crate) fn detach(&self) {
        self.sink.lock().take();
    }

    // The generation check happens while the sink lock is held, making the
    // check atomic with the invocation relative to teardown_host.
    fn host_live(&self) -> bool {
        self.hosts.generation(self.host) == Some(self.generation)
    }
}

/// Process-wide table of hosting execution contexts and their bridges.
///
/// Constructed once and injected; never a singleton, so tests build fresh
/// instances.
#[derive(Default)]
pub struct HostRegistry {
    next_host: AtomicU64,
    generations: DashMap<u64, u64>,
    /// host -> bridges bound to it, for teardown invalidation.
    records: Mutex<Vec<(HostId, std::sync::Weak<DeliveryBridge>)>>,
}

impl HostRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Announce a hosting context and obtain its handle.
    pub fn create_host(&self) -> HostId {
        let id = self.next_host.fetch_add(1, Ordering::Relaxed) + 1;
        self.generations.insert(id, 0);
        HostId::from_raw(id)
    }

    /// Current generation of a host, or None once fully removed.
    pub fn generation(&self, host: HostId) -> Option<u64> {
        self.generations.get(&host.value()).map(|entry| *entry)
    }

    /// Bind a sink owned by `host`, producing the bridge a watcher holds.
    ///
    /// The association is weak: binding never extends the host's life, and
    /// the bridge dies with its watcher regardless of the host.
    pub fn bind(
        self: &Arc<Self>,
        host: HostId,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Arc<DeliveryBridge>> {
        let generation = self
            .generation(host)
            .ok_or_else(|| Error::NotFound(format!("host {host}")))?;
        let bridge = Arc::new(DeliveryBridge {
            host,
            generation,
            hosts: Arc::clone(self),
            sink: Mutex::new(Some(sink)),
        });
        self.records
            .lock()
            .push((host, Arc::downgrade(&bridge)));
        Ok(bridge)
    }

    /// Invalidate every bridge bound to `host`.
    ///
    /// Bumps the host generation first, then drains each bound bridge's
    /// lock: an invoke that checked the old generation is still in flight,
    /// so acquiring its lock here blocks until it finishes. After this
    /// returns, no invoke for the host can succeed.
    pub fn teardown_host(&self, host: HostId) {
        if let Some(mut generation) = self.generations.get_mut(&host.value()) {
            *generation += 1;
        }

        let bound: Vec<Arc<DeliveryBridge>> = {
            let mut records = self.records.lock();
            let bound = records
                .iter()
                .filter(|(h, _)| *h == host)
                .filter_map(|(_, weak)| weak.upgrade())
                .collect();
            records.retain(|(h, weak)| *h != host && weak.strong_count() > 0);
            bound
        };
        for bridge in bound {
            bridge.detach();
        }
        debug_event!("bridge", "host torn down", "{host}");
    }
}
