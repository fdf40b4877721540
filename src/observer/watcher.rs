//! Watchers: observers with persistable filters and dual delivery.

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

use super::bridge::EventGroup;
use super::filter::EventFilter;
use super::trigger::TriggerCondition;
use super::Observer;

/// An [`Observer`] that can serialize its filter set for persistence and
/// receive structured (name-grouped) deliveries in addition to trigger
/// notifications.
pub struct Watcher {
    observer: Observer,
    /// Lazily computed JSON of the filter set, invalidated on replacement.
    filters_json: Mutex<Option<String>>,
}

impl Watcher {
    pub fn new(
        name: impl Into<String>,
        filters: Vec<EventFilter>,
        condition: TriggerCondition,
    ) -> Self {
        Self {
            observer: Observer::new(name, filters, condition),
            filters_json: Mutex::new(None),
        }
    }

    /// Serialized filter set, cached until the filters are replaced.
    pub fn filters_json(&self) -> String {
        let mut cached = self.filters_json.lock();
        if let Some(json) = cached.as_ref() {
            return json.clone();
        }
        // Filters hold only strings and integers, serialization cannot fail.
        let json = serde_json::to_string(&self.observer.filters()).unwrap_or_default();
        *cached = Some(json.clone());
        json
    }

    /// Replace the filter set from its serialized form.
    pub fn set_filters_json(&self, json: &str) -> Result<()> {
        let filters: Vec<EventFilter> = serde_json::from_str(json)?;
        self.observer.replace_filters(filters);
        *self.filters_json.lock() = Some(json.to_string());
        Ok(())
    }

    /// Replace the filter set, invalidating the serialized cache.
    pub fn set_filters(&self, filters: Vec<EventFilter>) {
        self.observer.replace_filters(filters);
        *self.filters_json.lock() = None;
    }

    /// Bitmask of reserved OS events covered by any of this watcher's
    /// filters; feeds the ingestion subscription mask.
    pub fn os_event_mask(&self) -> u64 {
        self.observer
            .filters()
            .iter()
            .fold(0, |mask, filter| mask | filter.reserved_event_mask())
    }

    /// True when any filter targets the reserved OS domain.
    pub fn has_os_domain(&self) -> bool {
        self.observer
            .filters()
            .iter()
            .any(|filter| filter.domain == crate::types::OS_DOMAIN)
    }

    /// Deliver a matched batch to the receive sink, grouped by event name.
    ///
    /// Returns true when the consumer accepted the batch.
    pub fn deliver(&self, domain: &str, events: &[Arc<crate::store::StoredEvent>]) -> bool {
        let Some(bridge) = self.observer.bridge() else {
            return false;
        };
        let groups = EventGroup::group_by_name(events);
        bridge.receive(domain, &groups)
    }
}

impl Deref for Watcher {
    type Target = Observer;

    fn deref(&self) -> &Observer {
        &self.observer
    }
}

impl EventGroup {
    /// Group a batch by event name, preserving first-seen order.
    pub fn group_by_name(events: &[Arc<crate::store::StoredEvent>]) -> Vec<EventGroup> {
        let mut groups: indexmap::IndexMap<String, Vec<Arc<crate::store::StoredEvent>>> =
            indexmap::IndexMap::new();
        for event in events {
            groups
                .entry(event.event.name.clone())
                .or_default()
                .push(Arc::clone(event));
        }
        groups
            .into_iter()
            .map(|(name, events)| EventGroup { name, events })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EventStore, MemoryStore};
    use crate::types::{EventPack, EventType, EventTypeMask, OS_DOMAIN};

    fn watcher_with_filters(filters: Vec<EventFilter>) -> Watcher {
        Watcher::new("w", filters, TriggerCondition::default())
    }

    #[test]
    fn test_filters_json_cache_invalidated_on_replace() {
        let watcher = watcher_with_filters(vec![EventFilter::new("app")]);
        let first = watcher.filters_json();
        assert!(first.contains("app"));

        watcher.set_filters(vec![EventFilter::new("os")]);
        let second = watcher.filters_json();
        assert!(second.contains("os"));
        assert!(!second.contains("app"));
    }

    #[test]
    fn test_set_filters_json_round_trip() {
        let source = watcher_with_filters(vec![
            EventFilter::new("app").with_names(["APP_CRASH"]),
            EventFilter::new(OS_DOMAIN).with_types(EventTypeMask::FAULT),
        ]);
        let json = source.filters_json();

        let restored = watcher_with_filters(Vec::new());
        restored.set_filters_json(&json).unwrap();
        assert_eq!(restored.filters(), source.filters());
        assert_eq!(restored.filters_json(), json);
    }

    #[test]
    fn test_set_filters_json_rejects_malformed() {
        let watcher = watcher_with_filters(vec![EventFilter::new("app")]);
        assert!(watcher.set_filters_json("not json").is_err());
        // The previous filters survive a failed replacement.
        assert_eq!(watcher.filters().len(), 1);
    }

    #[test]
    fn test_os_event_mask_ors_filters() {
        let watcher = watcher_with_filters(vec![
            EventFilter::new(OS_DOMAIN).with_names(["APP_CRASH"]),
            EventFilter::new(OS_DOMAIN).with_names(["APP_LAUNCH"]),
        ]);
        assert_eq!(watcher.os_event_mask(), (1 << 0) | (1 << 2));
        assert!(watcher.has_os_domain());
    }

    #[test]
    fn test_group_by_name_preserves_order() {
        let store = MemoryStore::new();
        let mut events = Vec::new();
        for name in ["B", "A", "B", "C"] {
            events.push(
                store
                    .insert_event(EventPack::new("app", name, EventType::Fault))
                    .unwrap(),
            );
        }
        let groups = EventGroup::group_by_name(&events);
        let names: Vec<_> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, ["B", "A", "C"]);
        assert_eq!(groups[0].events.len(), 2);
    }
}
