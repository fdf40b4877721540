//! In-memory reference implementation of [`EventStore`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::types::{EventPack, ObserverId};

use super::{EventStore, StoredEvent};

/// Non-durable store keeping events and associations in process memory.
///
/// Sequence counters start at 1 and never recycle, mirroring what a durable
/// backend with autoincrement rows provides.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_event_seq: u64,
    next_observer_seq: u64,
    events: BTreeMap<u64, Arc<StoredEvent>>,
    observers: HashMap<String, u64>,
    /// observer seq -> pending event seqs, ordered oldest first.
    pending: HashMap<u64, BTreeSet<u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of event records currently held (consumed or not).
    pub fn event_count(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// Number of events still pending for an observer.
    pub fn pending_count(&self, observer: ObserverId) -> usize {
        self.inner
            .lock()
            .pending
            .get(&observer.value())
            .map_or(0, BTreeSet::len)
    }
}

impl EventStore for MemoryStore {
    fn insert_event(&self, event: EventPack) -> Result<Arc<StoredEvent>> {
        let payload = event.to_json_string();
        let mut inner = self.inner.lock();
        inner.next_event_seq += 1;
        let seq = inner.next_event_seq;
        let stored = Arc::new(StoredEvent {
            seq,
            event,
            payload,
        });
        inner.events.insert(seq, Arc::clone(&stored));
        Ok(stored)
    }

    fn register_observer(&self, name: &str) -> Result<ObserverId> {
        let mut inner = self.inner.lock();
        if let Some(&seq) = inner.observers.get(name) {
            return ObserverId::new(seq)
                .ok_or_else(|| Error::storage("register_observer", "zero observer seq"));
        }
        inner.next_observer_seq += 1;
        let seq = inner.next_observer_seq;
        inner.observers.insert(name.to_string(), seq);
        ObserverId::new(seq).ok_or_else(|| Error::storage("register_observer", "zero observer seq"))
    }

    fn observer_seq(&self, name: &str) -> Result<Option<ObserverId>> {
        Ok(self
            .inner
            .lock()
            .observers
            .get(name)
            .and_then(|&seq| ObserverId::new(seq)))
    }

    fn delete_observer(&self, observer: ObserverId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.observers.retain(|_, &mut seq| seq != observer.value());
        inner.pending.remove(&observer.value());
        Ok(())
    }

    fn insert_association(&self, observer: ObserverId, event_seq: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.events.contains_key(&event_seq) {
            return Err(Error::storage(
                "insert_association",
                format!("unknown event seq {event_seq}"),
            ));
        }
        inner
            .pending
            .entry(observer.value())
            .or_default()
            .insert(event_seq);
        Ok(())
    }

    fn query_pending(&self, observer: ObserverId) -> Result<Vec<Arc<StoredEvent>>> {
        let inner = self.inner.lock();
        let Some(seqs) = inner.pending.get(&observer.value()) else {
            return Ok(Vec::new());
        };
        Ok(seqs
            .iter()
            .filter_map(|seq| inner.events.get(seq).cloned())
            .collect())
    }

    fn delete_association(&self, observer: ObserverId, event_seqs: &[u64]) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(pending) = inner.pending.get_mut(&observer.value()) else {
            return Ok(());
        };
        for seq in event_seqs {
            pending.remove(seq);
        }
        Ok(())
    }
}
