//! Parsing of externally-written event files.
//!
//! An ingested file is newline-delimited JSON: one object per line with
//! string `domain` and `name`, integer `eventType` and an optional `params`
//! object. The reserved `correlation_id` key inside `params` is lifted into
//! its own field. Parse failures are per-line and non-fatal: one bad line
//! never discards the rest of the file.

use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::types::{EventPack, EventType};

const DOMAIN_PROPERTY: &str = "domain";
const NAME_PROPERTY: &str = "name";
const EVENT_TYPE_PROPERTY: &str = "eventType";
const PARAMS_PROPERTY: &str = "params";

/// Parse one NDJSON line into an event.
///
/// Returns None for malformed JSON, missing/empty mandatory fields or an
/// unknown event type.
pub fn parse_event_line(line: &str) -> Option<EventPack> {
    let value: Value = serde_json::from_str(line).ok()?;
    let object = value.as_object()?;

    let domain = object.get(DOMAIN_PROPERTY)?.as_str()?;
    let name = object.get(NAME_PROPERTY)?.as_str()?;
    if domain.is_empty() || name.is_empty() {
        return None;
    }
    let raw_type = object.get(EVENT_TYPE_PROPERTY)?.as_u64()?;
    let event_type = EventType::try_from(u8::try_from(raw_type).ok()?).ok()?;

    let mut event = EventPack::new(domain, name, event_type);
    if let Some(Value::Object(params)) = object.get(PARAMS_PROPERTY) {
        event = event.with_params(params.clone());
    }
    Some(event)
}

/// Parse every line of an event file, skipping malformed lines.
///
/// A completely unparseable file yields zero events; the caller still
/// deletes the file for at-most-once ingestion.
pub fn parse_event_file(path: &Path) -> Vec<EventPack> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!("[ingest] cannot read {}: {e}", path.display());
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_event_line(line) {
            Some(event) => events.push(event),
            None => {
                tracing::warn!(
                    "[ingest] skipping malformed line {} in {}",
                    line_no + 1,
                    path.display()
                );
            }
        }
    }
    events
}
