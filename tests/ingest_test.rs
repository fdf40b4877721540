//! End-to-end ingestion: files written into the watched directory flow
//! through parsing, the store and dispatch, and are deleted afterwards.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use appevent::{
    DeliverySink, EventFilter, EventGroup, EventStore, FileAttributes, HostRegistry, MemoryStore,
    ObserverRegistry, OsEventListener, Settings, SinkCapabilities, TriggerCondition, Watcher,
};

struct CountingSink {
    received: AtomicUsize,
}

impl DeliverySink for CountingSink {
    fn capabilities(&self) -> SinkCapabilities {
        SinkCapabilities::RECEIVE
    }

    fn on_receive(&self, _domain: &str, groups: &[EventGroup]) -> bool {
        let events: usize = groups.iter().map(|g| g.events.len()).sum();
        self.received.fetch_add(events, Ordering::SeqCst);
        true
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    registry: Arc<ObserverRegistry>,
    listener: OsEventListener,
}

fn fixture(dir: &Path, enabled: bool) -> Fixture {
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
    Fixture {
        store,
        registry,
        listener,
    }
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

#[test]
fn test_watched_file_is_ingested_at_most_once() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("osevents");
    let fx = fixture(&dir, true);
    fx.listener.init().unwrap();
    fx.listener.start_listening().unwrap();

    // Three valid lines, two malformed: exactly three events must land.
    let file = dir.join("batch.ndjson");
    std::fs::write(
        &file,
        concat!(
            r#"{"domain":"os","name":"APP_CRASH","eventType":1}"#,
            "\n",
            "malformed\n",
            r#"{"domain":"os","name":"APP_FREEZE","eventType":1}"#,
            "\n",
            r#"{"domain":"os","name":"BATTERY_USAGE","eventType":2}"#,
            "\n",
            r#"{"oops":true}"#,
            "\n",
        ),
    )
    .unwrap();

    let store = Arc::clone(&fx.store);
    assert!(
        wait_until(Duration::from_secs(10), move || store.event_count() == 3),
        "expected exactly 3 stored events"
    );
    assert!(
        wait_until(Duration::from_secs(10), || !file.exists()),
        "source file must be deleted after ingestion"
    );
    // Nothing else appeared later (at-most-once).
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(fx.store.event_count(), 3);
}

#[test]
fn test_ingested_events_reach_matching_watcher() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("osevents");
    let fx = fixture(&dir, true);

    let hosts = HostRegistry::new();
    let sink = Arc::new(CountingSink {
        received: AtomicUsize::new(0),
    });
    let watcher = Arc::new(Watcher::new(
        "os-watcher",
        vec![EventFilter::new("os").with_names(["APP_CRASH"])],
        TriggerCondition::default(),
    ));
    let host = hosts.create_host();
    watcher
        .attach_bridge(hosts.bind(host, Arc::clone(&sink) as Arc<dyn DeliverySink>).unwrap());
    fx.registry.register(Arc::clone(&watcher)).unwrap();

    fx.listener.init().unwrap();
    fx.listener.start_listening().unwrap();

    std::fs::write(
        dir.join("crashes.ndjson"),
        concat!(
            r#"{"domain":"os","name":"APP_CRASH","eventType":1,"params":{"correlation_id":"r1"}}"#,
            "\n",
            r#"{"domain":"os","name":"APP_FREEZE","eventType":1}"#,
            "\n",
        ),
    )
    .unwrap();

    let sink_check = Arc::clone(&sink);
    assert!(
        wait_until(Duration::from_secs(10), move || {
            sink_check.received.load(Ordering::SeqCst) == 1
        }),
        "only the APP_CRASH event matches the watcher's filter"
    );
}

#[test]
fn test_mask_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("osevents");

    {
        let fx = fixture(&dir, true);
        fx.listener.init().unwrap();
        fx.listener.start_listening().unwrap();
        fx.listener.add_listened_events(0b101).unwrap();
    }

    // A fresh listener (fresh process) restores the persisted mask.
    let fx = fixture(&dir, true);
    fx.listener.init().unwrap();
    assert_eq!(fx.listener.listened_events(), 0b101);
}

#[test]
fn test_disabled_listener_removes_directory_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("osevents");
    std::fs::create_dir_all(dir.join("nested")).unwrap();
    std::fs::write(dir.join("stale.ndjson"), "junk").unwrap();

    let fx = fixture(&dir, false);
    fx.listener.init().unwrap();
    assert!(fx.listener.start_listening().is_err());
    assert!(!dir.exists());
}
