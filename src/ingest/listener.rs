//! Directory listener ingesting externally-produced event files.
//!
//! The OS (or any out-of-process producer) drops newline-delimited JSON
//! files into the ingestion directory. The listener drains pre-existing
//! files at init, then watches the directory and feeds each completed file
//! through the regular dispatch flow, deleting it afterwards so every file
//! is ingested at most once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::unbounded;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher as _};
use parking_lot::Mutex;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::observer::ObserverRegistry;
use crate::store::{EventStore, StoredEvent};
use crate::{debug_event, log_event};

use super::attrs::{DirAttributes, LISTENED_MASK_ATTR};
use super::parser::parse_event_file;

/// Ingestion adapter for events written outside the process.
pub struct OsEventListener {
    events_dir: PathBuf,
    enabled: bool,
    store: Arc<dyn EventStore>,
    registry: Arc<ObserverRegistry>,
    attrs: Arc<dyn DirAttributes>,
    /// Subscription bitmask over the reserved OS events.
    mask: AtomicU64,
    /// Events drained from files that predate this process.
    history: Mutex<Vec<Arc<StoredEvent>>>,
    watch: Mutex<Option<WatchGuard>>,
}

struct WatchGuard {
    // Dropping the watcher drops its callback and disconnects the channel,
    // which ends the listener thread.
    _watcher: notify::RecommendedWatcher,
    thread: JoinHandle<()>,
}

impl OsEventListener {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn EventStore>,
        registry: Arc<ObserverRegistry>,
        attrs: Arc<dyn DirAttributes>,
    ) -> Self {
        Self {
            events_dir: settings.ingestion_dir(),
            enabled: settings.ingestion.enabled,
            store,
            registry,
            attrs,
            mask: AtomicU64::new(0),
            history: Mutex::new(Vec::new()),
            watch: Mutex::new(None),
        }
    }

    /// Restore persisted state and drain files that predate this process.
    ///
    /// Pre-existing files are parsed, inserted into the store as history and
    /// deleted; they do not flow through dispatch (observers of that era are
    /// gone), but remain inspectable via [`history`](Self::history).
    pub fn init(&self) -> Result<()> {
        if !self.events_dir.is_dir() {
            debug_event!("ingest", "no event dir yet", "{}", self.events_dir.display());
            return Ok(());
        }

        if let Some(value) = self.attrs.get(&self.events_dir, LISTENED_MASK_ATTR)? {
            match value.parse::<u64>() {
                Ok(mask) => self.mask.store(mask, Ordering::SeqCst),
                Err(_) => {
                    tracing::warn!("[ingest] ignoring malformed mask attribute: {value:?}");
                }
            }
        }

        let files = Self::event_files(&self.events_dir);
        let mut drained = 0usize;
        for file in &files {
            for event in parse_event_file(file) {
                match self.store.insert_event(event) {
                    Ok(stored) => {
                        self.history.lock().push(stored);
                        drained += 1;
                    }
                    Err(e) => {
                        tracing::warn!("[ingest] failed to store history event: {e}");
                    }
                }
            }
        }
        for file in &files {
            let _ = std::fs::remove_file(file);
        }
        if drained > 0 {
            log_event!("ingest", "drained history", "{drained} events from {} files", files.len());
        }
        Ok(())
    }

    /// Begin watching the ingestion directory.
    ///
    /// Refused while the global ingestion flag is off: the directory tree is
    /// removed and ingestion stays off until re-enabled and reinitialized.
    pub fn start_listening(&self) -> Result<()> {
        if !self.enabled {
            self.remove_event_dir()?;
            return Err(Error::IngestionDisabled);
        }

        std::fs::create_dir_all(&self.events_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // The external producer runs under another uid; group rwx.
            std::fs::set_permissions(
                &self.events_dir,
                std::fs::Permissions::from_mode(0o770),
            )?;
        }
        // The attribute may have been lost with a removed directory.
        self.persist_mask(self.mask.load(Ordering::SeqCst))?;

        let mut watch = self.watch.lock();
        if watch.is_some() {
            return Ok(());
        }

        let (tx, rx) = unbounded();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        })
        .map_err(|e| Error::storage("notify", e))?;
        watcher
            .watch(&self.events_dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::storage("notify", e))?;

        let registry = Arc::clone(&self.registry);
        let thread = std::thread::Builder::new()
            .name("appevent-ingest".to_string())
            .spawn(move || {
                while let Ok(res) = rx.recv() {
                    match res {
                        Ok(event) => {
                            if !is_file_complete(&event.kind) {
                                continue;
                            }
                            for path in event.paths {
                                if is_event_file(&path) {
                                    ingest_file(&registry, &path);
                                }
                            }
                        }
                        Err(e) => {
                            tracing::error!("[ingest] watch error: {e}");
                        }
                    }
                }
            })
            .expect("failed to spawn ingest thread");

        *watch = Some(WatchGuard {
            _watcher: watcher,
            thread,
        });
        log_event!("ingest", "listening", "{}", self.events_dir.display());
        Ok(())
    }

    /// Stop the directory watch, if running.
    pub fn stop_listening(&self) {
        if let Some(guard) = self.watch.lock().take() {
            drop(guard._watcher);
            let _ = guard.thread.join();
            log_event!("ingest", "stopped");
        }
    }

    /// OR the given bits into the subscription mask and persist it.
    pub fn add_listened_events(&self, mask: u64) -> Result<()> {
        let merged = self.mask.fetch_or(mask, Ordering::SeqCst) | mask;
        self.persist_mask(merged)
    }

    /// Replace the subscription mask and persist it.
    pub fn set_listened_events(&self, mask: u64) -> Result<()> {
        self.mask.store(mask, Ordering::SeqCst);
        self.persist_mask(mask)
    }

    pub fn listened_events(&self) -> u64 {
        self.mask.load(Ordering::SeqCst)
    }

    /// Events drained from pre-existing files at init.
    pub fn history(&self) -> Vec<Arc<StoredEvent>> {
        self.history.lock().clone()
    }

    pub fn events_dir(&self) -> &Path {
        &self.events_dir
    }

    /// Recursively delete the ingestion directory.
    pub fn remove_event_dir(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.events_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // Mask format: unsigned integer as decimal text, so the producer side
    // can read the same attribute without linking this crate.
    fn persist_mask(&self, mask: u64) -> Result<()> {
        if self.events_dir.is_dir() {
            self.attrs
                .set(&self.events_dir, LISTENED_MASK_ATTR, &mask.to_string())?;
        }
        Ok(())
    }

    fn event_files(dir: &Path) -> Vec<PathBuf> {
        walkdir::WalkDir::new(dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| is_event_file(path))
            .collect()
    }
}

impl Drop for OsEventListener {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

/// Only react to completed files: close-after-write or a rename into the
/// directory. Reacting to creation would read half-written files.
fn is_file_complete(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Access(AccessKind::Close(AccessMode::Write))
            | EventKind::Modify(ModifyKind::Name(RenameMode::To))
    )
}

/// Dotfiles are attribute sidecars, not event payloads.
fn is_event_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| !name.starts_with('.'))
}

/// Parse, dispatch and delete one notified file (at-most-once: the file is
/// removed even when every line was malformed).
fn ingest_file(registry: &ObserverRegistry, path: &Path) {
    let events = parse_event_file(path);
    let count = events.len();
    if count > 0 {
        registry.dispatch(events);
    }
    let _ = std::fs::remove_file(path);
    debug_event!("ingest", "ingested", "{} ({count} events)", path.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::attrs::FileAttributes;
    use crate::store::MemoryStore;

    fn listener_in(dir: &Path, enabled: bool) -> (Arc<MemoryStore>, Arc<ObserverRegistry>, OsEventListener) {
        let mut settings = Settings::default();
        settings.ingestion.dir = Some(dir.to_path_buf());
        settings.ingestion.enabled = enabled;
        let store = Arc::new(MemoryStore::new());
        let registry = ObserverRegistry::new(Arc::clone(&store) as Arc<dyn EventStore>);
        let listener = OsEventListener::new(
            &settings,
            Arc::clone(&store) as Arc<dyn EventStore>,
            Arc::clone(&registry),
            Arc::new(FileAttributes),
        );
        (store, registry, listener)
    }

    #[test]
    fn test_init_without_dir_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let (_store, _registry, listener) = listener_in(&tmp.path().join("missing"), true);
        listener.init().unwrap();
        assert!(listener.history().is_empty());
        assert_eq!(listener.listened_events(), 0);
    }

    #[test]
    fn test_init_drains_existing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("pending.ndjson");
        std::fs::write(
            &file,
            concat!(
                r#"{"domain":"os","name":"APP_CRASH","eventType":1}"#,
                "\n",
                "broken line\n",
                r#"{"domain":"os","name":"APP_FREEZE","eventType":1}"#,
                "\n",
            ),
        )
        .unwrap();

        let (store, _registry, listener) = listener_in(tmp.path(), true);
        listener.init().unwrap();

        assert_eq!(listener.history().len(), 2);
        assert_eq!(store.event_count(), 2);
        assert!(!file.exists());
    }

    #[test]
    fn test_init_restores_persisted_mask() {
        let tmp = tempfile::tempdir().unwrap();
        let attrs = FileAttributes;
        attrs.set(tmp.path(), LISTENED_MASK_ATTR, "21").unwrap();

        let (_store, _registry, listener) = listener_in(tmp.path(), true);
        listener.init().unwrap();
        assert_eq!(listener.listened_events(), 21);
    }

    #[test]
    fn test_disabled_start_removes_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("osevents");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("stale.ndjson"), "junk").unwrap();

        let (_store, _registry, listener) = listener_in(&dir, false);
        assert!(matches!(
            listener.start_listening(),
            Err(Error::IngestionDisabled)
        ));
        assert!(!dir.exists());
    }

    #[test]
    fn test_mask_merge_and_replace_persist() {
        let tmp = tempfile::tempdir().unwrap();
        let (_store, _registry, listener) = listener_in(tmp.path(), true);
        listener.init().unwrap();

        listener.add_listened_events(0b0101).unwrap();
        listener.add_listened_events(0b0011).unwrap();
        assert_eq!(listener.listened_events(), 0b0111);

        listener.set_listened_events(0b1000).unwrap();
        assert_eq!(listener.listened_events(), 0b1000);

        let attrs = FileAttributes;
        assert_eq!(
            attrs.get(tmp.path(), LISTENED_MASK_ATTR).unwrap().as_deref(),
            Some("8")
        );
    }

    #[test]
    fn test_ingest_file_deletes_even_when_unparseable() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, registry, _listener) = listener_in(tmp.path(), true);
        let file = tmp.path().join("junk.ndjson");
        std::fs::write(&file, "complete garbage\nmore garbage\n").unwrap();

        ingest_file(&registry, &file);
        assert!(!file.exists());
        assert_eq!(store.event_count(), 0);
    }
}
