//! Byte-bounded extraction of a watcher's pending backlog.
//!
//! A [`PackageHolder`] is the per-watcher pull cursor: each `take_next`
//! drains the oldest pending events that fit the byte budget and removes
//! them from the watcher's pending set atomically with the extraction. This
//! is the one consumer-facing path allowed to block briefly on synchronous
//! store I/O.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::debug_event;
use crate::error::{Error, Result};
use crate::store::{EventStore, StoredEvent};
use crate::types::ObserverId;

/// Default byte budget per package: 512 KiB.
pub const DEFAULT_BYTE_BUDGET: usize = 512 * 1024;

/// One extracted batch of events.
#[derive(Debug, Clone)]
pub struct EventPackage {
    /// Monotonic per-holder package number, starting at 0.
    pub package_id: i32,
    /// Number of events taken.
    pub row: usize,
    /// Total payload bytes taken.
    pub size: usize,
    /// Serialized form of each taken event.
    pub data: Vec<String>,
    pub events: Vec<Arc<StoredEvent>>,
}

/// Per-watcher paginated extraction cursor.
///
/// Created alongside the watcher and destroyed with it. Concurrent
/// `take_next` calls serialize on the holder lock so two consumers can never
/// extract the same events.
pub struct PackageHolder {
    observer: ObserverId,
    store: Arc<dyn EventStore>,
    inner: Mutex<HolderState>,
}

struct HolderState {
    byte_budget: usize,
    next_package_id: i32,
}

impl PackageHolder {
    pub fn new(store: Arc<dyn EventStore>, observer: ObserverId) -> Self {
        Self::with_byte_budget(store, observer, DEFAULT_BYTE_BUDGET)
    }

    pub fn with_byte_budget(
        store: Arc<dyn EventStore>,
        observer: ObserverId,
        byte_budget: usize,
    ) -> Self {
        Self {
            observer,
            store,
            inner: Mutex::new(HolderState {
                byte_budget,
                next_package_id: 0,
            }),
        }
    }

    /// Resolve a holder for a watcher name known to the store.
    pub fn for_name(store: Arc<dyn EventStore>, name: &str) -> Result<Self> {
        let observer = store
            .observer_seq(name)?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        Ok(Self::new(store, observer))
    }

    pub fn observer(&self) -> ObserverId {
        self.observer
    }

    /// Replace the byte budget for subsequent takes.
    pub fn set_byte_budget(&self, bytes: i64) -> Result<()> {
        if bytes < 0 {
            return Err(Error::InvalidArgument(format!(
                "negative byte budget: {bytes}"
            )));
        }
        self.inner.lock().byte_budget = bytes as usize;
        Ok(())
    }

    pub fn byte_budget(&self) -> usize {
        self.inner.lock().byte_budget
    }

    /// Extract the next package of pending events within the byte budget.
    ///
    /// Events are taken oldest first; accumulation stops at the first event
    /// that would exceed the budget. An event alone larger than the budget
    /// is never taken: it stays pending until the budget is raised or the
    /// event is otherwise removed. Taken events are unmarked pending
    /// all-or-nothing; a failed delete aborts the whole take.
    pub fn take_next(&self) -> Result<EventPackage> {
        let mut inner = self.inner.lock();

        let pending = self.store.query_pending(self.observer)?;
        if pending.is_empty() {
            return Err(Error::NoData);
        }

        let mut taken = Vec::new();
        let mut data = Vec::new();
        let mut event_seqs = Vec::new();
        let mut total = 0usize;
        for record in pending {
            let size = record.size_bytes();
            if total + size > inner.byte_budget {
                debug_event!(
                    "package",
                    "budget reached",
                    "observer={} total={total} next={size}",
                    self.observer
                );
                break;
            }
            total += size;
            data.push(record.payload.clone());
            event_seqs.push(record.seq);
            taken.push(record);
        }
        if taken.is_empty() {
            return Err(Error::NoData);
        }

        // All-or-nothing: either the package is returned and the events are
        // consumed, or neither happens.
        self.store.delete_association(self.observer, &event_seqs)?;

        let package_id = inner.next_package_id;
        inner.next_package_id += 1;
        Ok(EventPackage {
            package_id,
            row: taken.len(),
            size: total,
            data,
            events: taken,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{EventPack, EventType};

    /// Event whose serialized payload is exactly `size` bytes.
    fn sized_event(store: &MemoryStore, size: usize) -> Arc<StoredEvent> {
        let probe = EventPack::new("app", "X", EventType::Fault).to_json_string();
        let padding = size
            .checked_sub(probe.len() + r#","params":{"pad":""}"#.len())
            .expect("size too small for event envelope");
        let mut params = serde_json::Map::new();
        params.insert(
            "pad".to_string(),
            serde_json::Value::String("x".repeat(padding)),
        );
        let event = EventPack::new("app", "X", EventType::Fault).with_params(params);
        let stored = store.insert_event(event).unwrap();
        assert_eq!(stored.size_bytes(), size);
        stored
    }

    fn holder_with_events(sizes: &[usize], budget: usize) -> (Arc<MemoryStore>, PackageHolder) {
        let store = Arc::new(MemoryStore::new());
        let observer = store.register_observer("w").unwrap();
        for &size in sizes {
            let stored = sized_event(&store, size);
            store.insert_association(observer, stored.seq).unwrap();
        }
        let holder =
            PackageHolder::with_byte_budget(Arc::clone(&store) as Arc<dyn EventStore>, observer, budget);
        (store, holder)
    }

    #[test]
    fn test_take_next_respects_byte_budget() {
        let (store, holder) = holder_with_events(&[100, 100, 150], 250);

        let first = holder.take_next().unwrap();
        assert_eq!(first.package_id, 0);
        assert_eq!(first.row, 2);
        assert_eq!(first.size, 200);
        assert_eq!(store.pending_count(holder.observer()), 1);

        let second = holder.take_next().unwrap();
        assert_eq!(second.package_id, 1);
        assert_eq!(second.row, 1);
        assert_eq!(second.size, 150);

        assert!(matches!(holder.take_next(), Err(Error::NoData)));
    }

    #[test]
    fn test_oversized_event_is_never_taken() {
        let (store, holder) = holder_with_events(&[100, 100, 350], 250);

        let first = holder.take_next().unwrap();
        assert_eq!(first.row, 2);

        // The 350-byte event exceeds the budget alone: it stays pending and
        // every take reports NoData until the budget is raised.
        assert!(matches!(holder.take_next(), Err(Error::NoData)));
        assert!(matches!(holder.take_next(), Err(Error::NoData)));
        assert_eq!(store.pending_count(holder.observer()), 1);

        holder.set_byte_budget(400).unwrap();
        let third = holder.take_next().unwrap();
        assert_eq!(third.row, 1);
        assert_eq!(third.size, 350);
    }

    #[test]
    fn test_no_pending_reports_no_data() {
        let (_store, holder) = holder_with_events(&[], 250);
        assert!(matches!(holder.take_next(), Err(Error::NoData)));
    }

    #[test]
    fn test_negative_budget_rejected() {
        let (_store, holder) = holder_with_events(&[], 250);
        assert!(matches!(
            holder.set_byte_budget(-1),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(holder.byte_budget(), 250);
    }

    #[test]
    fn test_package_data_matches_payloads() {
        let (_store, holder) = holder_with_events(&[120, 130], 512);
        let package = holder.take_next().unwrap();
        assert_eq!(package.data.len(), 2);
        assert_eq!(package.data[0], package.events[0].payload);
        assert_eq!(package.size, 250);
    }
}
