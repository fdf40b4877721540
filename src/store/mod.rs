//! Durable event store interface.
//!
//! The store itself is an external collaborator: this module defines the
//! trait surface the dispatch core consumes, plus an in-process
//! [`MemoryStore`] used by tests and by embedders that do not persist events.
//!
//! An event is written once and associated with every observer whose filters
//! matched it at dispatch time. Consumption (receive delivery or package
//! extraction) deletes the association, never the event record itself.

mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;

use crate::error::Result;
use crate::types::{EventPack, ObserverId};

/// One persisted event, with its serialized form cached for size accounting.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    /// Monotonically increasing sequence assigned at insert.
    pub seq: u64,
    pub event: EventPack,
    /// Canonical JSON of the event, computed once at insert.
    pub payload: String,
}

impl StoredEvent {
    /// Byte size of the event as counted by trigger and budget accounting.
    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }
}

/// Abstract durable store consumed by the dispatch core.
///
/// Implementations must be safe to call from multiple threads; the dispatch
/// path calls `insert_event`/`insert_association` and must never block for
/// long, so implementations should keep those cheap or internally queued.
pub trait EventStore: Send + Sync {
    /// Persist an event and return it with its assigned sequence.
    fn insert_event(&self, event: EventPack) -> Result<Arc<StoredEvent>>;

    /// Return the sequence for an observer name, creating one if absent.
    ///
    /// Re-registering a known name returns the existing sequence so a
    /// restarted observer keeps its pending backlog.
    fn register_observer(&self, name: &str) -> Result<ObserverId>;

    /// Look up the sequence for an observer name without creating one.
    fn observer_seq(&self, name: &str) -> Result<Option<ObserverId>>;

    /// Delete an observer record and all of its pending associations.
    fn delete_observer(&self, observer: ObserverId) -> Result<()>;

    /// Mark an event pending for an observer.
    fn insert_association(&self, observer: ObserverId, event_seq: u64) -> Result<()>;

    /// All events pending for an observer, in storage order (oldest first).
    fn query_pending(&self, observer: ObserverId) -> Result<Vec<Arc<StoredEvent>>>;

    /// Remove the pending association for the given events, all-or-nothing.
    ///
    /// The event records themselves are kept; deletion is scoped to this
    /// observer's consumption record.
    fn delete_association(&self, observer: ObserverId, event_seqs: &[u64]) -> Result<()>;
}
