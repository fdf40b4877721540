//! Application telemetry event observing and dispatch.
//!
//! Producers hand structured events to an [`ObserverRegistry`]; registered
//! watchers match them against domain-scoped filters, accumulate trigger
//! state (row count, byte size, timeout, lifecycle signals) and deliver
//! batches through lifetime-safe [`DeliveryBridge`]s to consumers hosted in
//! runtimes that may be torn down at any moment. Consumers can also pull
//! the pending backlog in byte-bounded packages, and an [`OsEventListener`]
//! ingests event files written outside the process into the same pipeline.

pub mod config;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod observer;
pub mod package;
pub mod store;
pub mod types;

pub use config::Settings;
pub use error::{Error, Result};
pub use ingest::{DirAttributes, FileAttributes, OsEventListener};
pub use observer::{
    DeliveryBridge, DeliverySink, EventFilter, EventGroup, HostRegistry, Observer,
    ObserverRegistry, SinkCapabilities, TriggerCondition, TriggerSnapshot, Watcher,
};
pub use package::{EventPackage, PackageHolder};
pub use store::{EventStore, MemoryStore, StoredEvent};
pub use types::{EventPack, EventType, EventTypeMask, HostId, ObserverId};
