//! Core event model shared across the crate.
//!
//! An [`EventPack`] is one structured telemetry record: a domain, a name, an
//! event type and a JSON parameter map. Identifiers are newtypes so an
//! observer sequence can never be confused with an event sequence.

use std::num::NonZeroU64;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Reserved domain for events produced outside the process.
pub const OS_DOMAIN: &str = "os";

/// Reserved key inside `params` carrying a correlation id.
///
/// Extracted into [`EventPack::correlation_id`] during parsing and never
/// treated as a generic parameter.
pub const CORRELATION_ID_PARAM: &str = "correlation_id";

/// Category of a telemetry event.
///
/// The discriminants are part of the ingested file format (`eventType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EventType {
    Fault = 1,
    Statistic = 2,
    Security = 3,
    Behavior = 4,
}

impl EventType {
    /// Bit of this type inside an [`EventTypeMask`] (`1 << discriminant`).
    pub fn mask(self) -> EventTypeMask {
        EventTypeMask::from_bits_truncate(1 << (self as u32))
    }
}

impl From<EventType> for u8 {
    fn from(value: EventType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for EventType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EventType::Fault),
            2 => Ok(EventType::Statistic),
            3 => Ok(EventType::Security),
            4 => Ok(EventType::Behavior),
            other => Err(format!("invalid event type: {other}")),
        }
    }
}

bitflags! {
    /// Event types a filter accepts, stored in bits (`1 << type`).
    ///
    /// An empty mask accepts every type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventTypeMask: u32 {
        const FAULT = 1 << 1;
        const STATISTIC = 1 << 2;
        const SECURITY = 1 << 3;
        const BEHAVIOR = 1 << 4;
    }
}

impl EventTypeMask {
    /// True when the mask accepts the given type (empty mask = any).
    pub fn accepts(self, event_type: EventType) -> bool {
        self.is_empty() || self.intersects(event_type.mask())
    }
}

/// Sequence number of a registered observer.
///
/// Assigned by the event store on registration; stable across process
/// restarts for the same observer name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObserverId(NonZeroU64);

impl ObserverId {
    pub fn new(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(Self)
    }

    pub fn value(&self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a hosting execution context (a binding runtime, a test harness).
///
/// Only an identifier: holding a `HostId` never extends the host's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostId(u64);

impl HostId {
    pub(crate) fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One structured telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPack {
    pub domain: String,
    pub name: String,
    #[serde(rename = "eventType")]
    pub event_type: EventType,
    /// Milliseconds since the Unix epoch, stamped at construction.
    #[serde(default)]
    pub time: i64,
    /// Correlation id extracted from the reserved params key.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl EventPack {
    pub fn new(
        domain: impl Into<String>,
        name: impl Into<String>,
        event_type: EventType,
    ) -> Self {
        Self {
            domain: domain.into(),
            name: name.into(),
            event_type,
            time: chrono::Utc::now().timestamp_millis(),
            correlation_id: None,
            params: serde_json::Map::new(),
        }
    }

    /// Attach a parameter map, extracting the reserved correlation id key.
    pub fn with_params(mut self, mut params: serde_json::Map<String, serde_json::Value>) -> Self {
        if let Some(value) = params.remove(CORRELATION_ID_PARAM) {
            self.correlation_id = value.as_str().map(str::to_owned);
        }
        self.params = params;
        self
    }

    /// Canonical JSON used for size accounting and package payloads.
    pub fn to_json_string(&self) -> String {
        // All fields are JSON-native, serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_mask_bits() {
        assert_eq!(EventType::Fault.mask().bits(), 1 << 1);
        assert_eq!(EventType::Behavior.mask().bits(), 1 << 4);
    }

    #[test]
    fn test_empty_mask_accepts_any_type() {
        let mask = EventTypeMask::empty();
        assert!(mask.accepts(EventType::Fault));
        assert!(mask.accepts(EventType::Behavior));
    }

    #[test]
    fn test_mask_accepts_only_set_bits() {
        let mask = EventTypeMask::FAULT | EventTypeMask::SECURITY;
        assert!(mask.accepts(EventType::Fault));
        assert!(mask.accepts(EventType::Security));
        assert!(!mask.accepts(EventType::Statistic));
    }

    #[test]
    fn test_with_params_extracts_correlation_id() {
        let mut params = serde_json::Map::new();
        params.insert(
            CORRELATION_ID_PARAM.to_string(),
            serde_json::Value::String("abc-123".to_string()),
        );
        params.insert("detail".to_string(), serde_json::json!(42));

        let event = EventPack::new("app", "APP_CRASH", EventType::Fault).with_params(params);
        assert_eq!(event.correlation_id.as_deref(), Some("abc-123"));
        assert!(!event.params.contains_key(CORRELATION_ID_PARAM));
        assert!(event.params.contains_key("detail"));
    }

    #[test]
    fn test_observer_id_rejects_zero() {
        assert!(ObserverId::new(0).is_none());
        assert_eq!(ObserverId::new(7).unwrap().value(), 7);
    }
}
