//! Event filters: the pure predicate deciding which events an observer sees.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::{EventPack, EventType, EventTypeMask, OS_DOMAIN};

/// Reserved OS-produced events, as `(name, type, bit)` triples.
///
/// The bit positions form the subscription mask persisted on the ingestion
/// directory, so external producers can skip writing files nobody reads.
pub const RESERVED_OS_EVENTS: &[(&str, EventType, u32)] = &[
    ("APP_CRASH", EventType::Fault, 0),
    ("APP_FREEZE", EventType::Fault, 1),
    ("APP_LAUNCH", EventType::Behavior, 2),
    ("SCROLL_JANK", EventType::Fault, 3),
    ("CPU_USAGE_HIGH", EventType::Fault, 4),
    ("BATTERY_USAGE", EventType::Statistic, 5),
    ("RESOURCE_OVERLIMIT", EventType::Fault, 6),
    ("ADDRESS_SANITIZER", EventType::Fault, 7),
    ("MAIN_THREAD_JANK", EventType::Fault, 8),
];

/// Filtering predicate over `(domain, name, type)`.
///
/// Empty `names` accepts any name; an empty type mask accepts any type. A
/// filter with an empty domain never matches anything: filters must be
/// domain-scoped, and the empty filter doubles as an explicit
/// "deliver nothing" marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub domain: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub names: BTreeSet<String>,
    #[serde(default, with = "mask_bits", skip_serializing_if = "EventTypeMask::is_empty")]
    pub types: EventTypeMask,
}

impl EventFilter {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            names: BTreeSet::new(),
            types: EventTypeMask::empty(),
        }
    }

    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_types(mut self, types: EventTypeMask) -> Self {
        self.types = types;
        self
    }

    /// True when the event passes this filter.
    pub fn matches(&self, event: &EventPack) -> bool {
        if self.domain.is_empty() || self.domain != event.domain {
            return false;
        }
        if !self.names.is_empty() && !self.names.contains(&event.name) {
            return false;
        }
        self.types.accepts(event.event_type)
    }

    /// Bitmask of reserved OS events this filter covers.
    ///
    /// Evaluates [`matches`](Self::matches) against the static reserved-event
    /// table; only `os`-domain filters can produce a non-zero mask.
    pub fn reserved_event_mask(&self) -> u64 {
        let mut mask = 0u64;
        for &(name, event_type, bit) in RESERVED_OS_EVENTS {
            let probe = EventPack::new(OS_DOMAIN, name, event_type);
            if self.matches(&probe) {
                mask |= 1 << bit;
            }
        }
        mask
    }
}

/// Serialize the type mask as its raw bits, matching the persisted
/// filter format (`types` is an unsigned integer).
mod mask_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::types::EventTypeMask;

    pub fn serialize<S: Serializer>(mask: &EventTypeMask, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u32(mask.bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<EventTypeMask, D::Error> {
        let bits = u32::deserialize(de)?;
        Ok(EventTypeMask::from_bits_truncate(bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(domain: &str, name: &str, event_type: EventType) -> EventPack {
        EventPack::new(domain, name, event_type)
    }

    #[test]
    fn test_domain_must_match() {
        let filter = EventFilter::new("app");
        assert!(filter.matches(&event("app", "ANY", EventType::Fault)));
        assert!(!filter.matches(&event("other", "ANY", EventType::Fault)));
    }

    #[test]
    fn test_empty_domain_never_matches() {
        let filter = EventFilter::default();
        assert!(!filter.matches(&event("app", "ANY", EventType::Fault)));
        assert!(!filter.matches(&event("", "ANY", EventType::Fault)));
    }

    #[test]
    fn test_names_restrict_when_present() {
        let filter = EventFilter::new("app").with_names(["APP_CRASH", "APP_FREEZE"]);
        assert!(filter.matches(&event("app", "APP_CRASH", EventType::Fault)));
        assert!(!filter.matches(&event("app", "APP_LAUNCH", EventType::Fault)));
    }

    #[test]
    fn test_type_mask_restricts_when_present() {
        let filter = EventFilter::new("app").with_types(EventTypeMask::FAULT);
        assert!(filter.matches(&event("app", "X", EventType::Fault)));
        assert!(!filter.matches(&event("app", "X", EventType::Behavior)));
    }

    #[test]
    fn test_reserved_mask_covers_named_events() {
        let filter = EventFilter::new(OS_DOMAIN).with_names(["APP_CRASH", "APP_FREEZE"]);
        assert_eq!(filter.reserved_event_mask(), 0b11);

        // A filter on another domain covers no reserved events.
        let filter = EventFilter::new("app");
        assert_eq!(filter.reserved_event_mask(), 0);
    }

    #[test]
    fn test_reserved_mask_honors_type_mask() {
        // BATTERY_USAGE is a statistic; a fault-only os filter excludes it.
        let filter = EventFilter::new(OS_DOMAIN).with_types(EventTypeMask::FAULT);
        let mask = filter.reserved_event_mask();
        assert_eq!(mask & (1 << 5), 0);
        assert_ne!(mask & 1, 0);
    }

    #[test]
    fn test_filter_json_round_trip() {
        let filter = EventFilter::new("app")
            .with_names(["A", "B"])
            .with_types(EventTypeMask::FAULT | EventTypeMask::SECURITY);
        let json = serde_json::to_string(&filter).unwrap();
        let parsed: EventFilter = serde_json::from_str(&json).unwrap();
        assert_eq!(filter, parsed);
    }
}
