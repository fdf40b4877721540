//! Process-wide observer registry and event dispatch.
//!
//! The registry owns the one piece of global mutable state: the table of
//! registered watchers. All mutation goes through [`register`] and
//! [`unregister`] under the table lock; per-observer accumulator state uses
//! each observer's own lock, so unrelated observers never serialize against
//! each other.
//!
//! Dispatch is fire-and-forget for producers: it never fails, never blocks
//! on a consumer, and pushes consumption-side store deletes to a dedicated
//! worker thread.
//!
//! [`register`]: ObserverRegistry::register
//! [`unregister`]: ObserverRegistry::unregister

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select, unbounded};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::package::PackageHolder;
use crate::store::{EventStore, StoredEvent};
use crate::types::{EventPack, ObserverId};
use crate::{debug_event, log_event};

use super::trigger::TriggerState;
use super::watcher::Watcher;

/// Consumption-side work pushed off the dispatch path.
enum ConsumeJob {
    /// Delete the pending association for delivered events.
    Delete {
        observer: ObserverId,
        event_seqs: Vec<u64>,
    },
    Shutdown,
}

struct Registered {
    watcher: Arc<Watcher>,
    holder: Arc<PackageHolder>,
}

/// Process-wide table of registered watchers.
///
/// Constructed once per process (or per test) and injected into everything
/// that dispatches or registers; there is no implicit singleton.
pub struct ObserverRegistry {
    store: Arc<dyn EventStore>,
    table: RwLock<HashMap<ObserverId, Registered>>,
    consume_tx: Sender<ConsumeJob>,
    consume_worker: Mutex<Option<JoinHandle<()>>>,
    ticker: Mutex<Option<TickerHandle>>,
    default_byte_budget: usize,
}

struct TickerHandle {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl ObserverRegistry {
    pub fn new(store: Arc<dyn EventStore>) -> Arc<Self> {
        Self::with_byte_budget(store, crate::package::DEFAULT_BYTE_BUDGET)
    }

    /// Build a registry whose package holders start with the given budget.
    pub fn with_byte_budget(store: Arc<dyn EventStore>, byte_budget: usize) -> Arc<Self> {
        let (consume_tx, consume_rx) = unbounded();
        let worker_store = Arc::clone(&store);
        let worker = std::thread::Builder::new()
            .name("appevent-consume".to_string())
            .spawn(move || consume_loop(worker_store, consume_rx))
            .expect("failed to spawn consume worker");

        Arc::new(Self {
            store,
            table: RwLock::new(HashMap::new()),
            consume_tx,
            consume_worker: Mutex::new(Some(worker)),
            ticker: Mutex::new(None),
            default_byte_budget: byte_budget,
        })
    }

    /// Register a watcher and return its store-backed sequence id.
    ///
    /// Re-registering the identical config under a known name is an
    /// idempotent no-op returning the existing id; a *different* config
    /// under a registered name is rejected. When the store already knows the
    /// name, the live accumulator is rehydrated from the pending backlog so
    /// thresholds keep counting across restarts.
    pub fn register(&self, watcher: Arc<Watcher>) -> Result<ObserverId> {
        if watcher.name().is_empty() {
            return Err(Error::InvalidArgument("observer name is empty".to_string()));
        }

        let mut table = self.table.write();
        if let Some(existing) = table.values().find(|r| r.watcher.name() == watcher.name()) {
            if existing.watcher.identity_hash() == watcher.identity_hash() {
                // Safe: a registered watcher always has an id.
                return existing
                    .watcher
                    .id()
                    .ok_or_else(|| Error::NotFound(watcher.name().to_string()));
            }
            return Err(Error::AlreadyRegistered(watcher.name().to_string()));
        }

        let known = self.store.observer_seq(watcher.name())?;
        let id = match known {
            Some(id) => {
                let pending = self.store.query_pending(id)?;
                if !pending.is_empty() {
                    let mut state = TriggerState::default();
                    state.row = pending.len() as i32;
                    state.size = pending
                        .iter()
                        .map(|e| e.size_bytes() as i32)
                        .fold(0, i32::saturating_add);
                    watcher.seed_state(state);
                    debug_event!(
                        "registry",
                        "rehydrated backlog",
                        "observer={id} row={} size={}",
                        pending.len(),
                        state.size
                    );
                }
                id
            }
            None => self.store.register_observer(watcher.name())?,
        };

        watcher.assign_id(id);
        let holder = Arc::new(PackageHolder::with_byte_budget(
            Arc::clone(&self.store),
            id,
            self.default_byte_budget,
        ));
        table.insert(
            id,
            Registered {
                watcher: Arc::clone(&watcher),
                holder,
            },
        );
        log_event!("registry", "registered", "observer={id} name={}", watcher.name());
        Ok(id)
    }

    /// Remove a watcher by id, delete its store record and tear down its
    /// bridge so no in-flight or future dispatch touches it.
    pub fn unregister(&self, id: ObserverId) -> Result<()> {
        let mut table = self.table.write();
        if !table.contains_key(&id) {
            return Err(Error::NotFound(format!("observer {id}")));
        }
        self.store.delete_observer(id)?;
        if let Some(removed) = table.remove(&id) {
            removed.watcher.teardown_bridge();
        }
        log_event!("registry", "unregistered", "observer={id}");
        Ok(())
    }

    /// Remove a watcher by name.
    pub fn unregister_name(&self, name: &str) -> Result<()> {
        let id = {
            let table = self.table.read();
            table
                .values()
                .find(|r| r.watcher.name() == name)
                .and_then(|r| r.watcher.id())
        };
        match id {
            Some(id) => self.unregister(id),
            None => Err(Error::NotFound(name.to_string())),
        }
    }

    /// Number of registered watchers.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Registered watcher by name.
    pub fn watcher(&self, name: &str) -> Option<Arc<Watcher>> {
        self.table
            .read()
            .values()
            .find(|r| r.watcher.name() == name)
            .map(|r| Arc::clone(&r.watcher))
    }

    /// The extraction cursor created alongside a watcher.
    pub fn package_holder(&self, id: ObserverId) -> Result<Arc<PackageHolder>> {
        self.table
            .read()
            .get(&id)
            .map(|r| Arc::clone(&r.holder))
            .ok_or_else(|| Error::NotFound(format!("observer {id}")))
    }

    /// Pull the next byte-bounded package for a watcher.
    pub fn take_next(&self, id: ObserverId) -> Result<crate::package::EventPackage> {
        self.package_holder(id)?.take_next()
    }

    /// Replace the byte budget for a watcher's subsequent takes.
    pub fn set_byte_budget(&self, id: ObserverId, bytes: i64) -> Result<()> {
        self.package_holder(id)?.set_byte_budget(bytes)
    }

    /// Route a batch of events to every matching observer.
    ///
    /// Never fails: events the store refuses are dropped with a diagnostic
    /// and do not block the rest of the batch. Registrations added while a
    /// dispatch is in flight do not retroactively see this batch.
    pub fn dispatch(&self, events: Vec<EventPack>) {
        if events.is_empty() {
            return;
        }

        // Persist up front; the store assigns each event its sequence.
        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            match self.store.insert_event(event) {
                Ok(record) => stored.push(record),
                Err(e) => {
                    tracing::warn!("[registry] dropping event, insert failed: {e}");
                }
            }
        }
        if stored.is_empty() {
            return;
        }

        // Group by domain once; receive deliveries are per-domain batches.
        let mut by_domain: IndexMap<String, Vec<Arc<StoredEvent>>> = IndexMap::new();
        for record in stored {
            by_domain
                .entry(record.event.domain.clone())
                .or_default()
                .push(record);
        }

        // The read lock is held for the whole routing loop: an unregister
        // (write lock) either happens before this dispatch and is never
        // seen, or after it and the dispatch applies in full. Sinks run
        // under this lock and must hand work off instead of blocking.
        let table = self.table.read();
        for registered in table.values() {
            for (domain, group) in &by_domain {
                self.dispatch_group(&registered.watcher, domain, group);
            }
        }
    }

    fn dispatch_group(&self, watcher: &Watcher, domain: &str, group: &[Arc<StoredEvent>]) {
        let Some(id) = watcher.id() else {
            return;
        };

        let matched: Vec<Arc<StoredEvent>> = group
            .iter()
            .filter(|record| watcher.verify_event(&record.event))
            .cloned()
            .collect();
        if matched.is_empty() {
            return;
        }

        // Associate before recording: a fired trigger may immediately pull
        // the backlog, which must include these events.
        let mut event_seqs = Vec::with_capacity(matched.len());
        let mut recorded = Vec::with_capacity(matched.len());
        for record in &matched {
            match self.store.insert_association(id, record.seq) {
                Ok(()) => {
                    event_seqs.push(record.seq);
                    recorded.push(Arc::clone(record));
                }
                Err(e) => {
                    tracing::warn!(
                        "[registry] skipping event seq={} for observer={id}: {e}",
                        record.seq
                    );
                }
            }
        }
        if recorded.is_empty() {
            return;
        }

        for record in &recorded {
            watcher.record_event(record.size_bytes());
        }

        // Receive delivery is independent of the trigger thresholds: a
        // receive-capable watcher wants every matching event in near-real
        // time. Accepted batches are consumed off the dispatch path.
        if watcher.deliver(domain, &recorded) {
            let _ = self.consume_tx.send(ConsumeJob::Delete {
                observer: id,
                event_seqs,
            });
        }
    }

    /// Periodic timeout accounting across all registered observers.
    pub fn tick(&self, step: i32) {
        let table = self.table.read();
        for registered in table.values() {
            registered.watcher.process_timeout(step);
        }
    }

    /// Startup lifecycle signal for all registered observers.
    pub fn on_startup(&self) {
        let table = self.table.read();
        for registered in table.values() {
            registered.watcher.process_startup();
        }
    }

    /// Background lifecycle signal for all registered observers.
    pub fn on_background(&self) {
        let table = self.table.read();
        for registered in table.values() {
            registered.watcher.process_background();
        }
    }

    /// Start a background thread calling [`tick`](Self::tick) once per
    /// `interval`. Stopped automatically when the registry drops.
    pub fn start_ticker(self: &Arc<Self>, interval: Duration) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = unbounded::<()>();
        let tick_rx = crossbeam_channel::tick(interval);
        let registry = Arc::downgrade(self);
        let thread = std::thread::Builder::new()
            .name("appevent-ticker".to_string())
            .spawn(move || {
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(tick_rx) -> _ => {
                            let Some(registry) = registry.upgrade() else {
                                break;
                            };
                            registry.tick(1);
                        }
                    }
                }
            })
            .expect("failed to spawn ticker thread");
        *ticker = Some(TickerHandle { stop_tx, thread });
        log_event!("registry", "ticker started", "{interval:?}");
    }
}

impl Drop for ObserverRegistry {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.lock().take() {
            let _ = ticker.stop_tx.send(());
            // The last Arc can die on the ticker thread itself (it upgrades
            // a Weak per tick); joining there would self-deadlock.
            if ticker.thread.thread().id() != std::thread::current().id() {
                let _ = ticker.thread.join();
            }
        }
        let _ = self.consume_tx.send(ConsumeJob::Shutdown);
        if let Some(worker) = self.consume_worker.lock().take() {
            let _ = worker.join();
        }
    }
}

/// Best-effort consumption: a failed delete stays pending and is retried on
/// the next delivery, never surfaced to the producer.
fn consume_loop(store: Arc<dyn EventStore>, rx: Receiver<ConsumeJob>) {
    while let Ok(job) = rx.recv() {
        match job {
            ConsumeJob::Delete {
                observer,
                event_seqs,
            } => {
                if let Err(e) = store.delete_association(observer, &event_seqs) {
                    tracing::warn!(
                        "[consume] failed to delete {} associations for observer={observer}: {e}",
                        event_seqs.len()
                    );
                } else {
                    debug_event!(
                        "consume",
                        "deleted",
                        "observer={observer} events={}",
                        event_seqs.len()
                    );
                }
            }
            ConsumeJob::Shutdown => break,
        }
    }
}
