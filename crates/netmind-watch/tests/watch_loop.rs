// End-to-end watch engine behavior with a scripted probe: change chains,
// single-poll-in-flight, expiry and stop semantics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use netmind_core::events::{EventFilter, EventKind, EventLog};
use netmind_core::settings::ConfigStore;
use netmind_core::types::{ConversationId, RuleId, TargetRef};
use netmind_plugin::ExecutionError;
use netmind_store::types::{DeviceObservation, ServiceStatus, ServiceType, WatchRuleRecord};
use netmind_store::{db, ConversationStore, DeviceCatalog};
use netmind_watch::{Observation, WatchDeps, WatchHandle, WatchManager, WatchProbe};

struct Fixture {
    handle: WatchHandle,
    change_rx: tokio::sync::mpsc::Receiver<netmind_watch::ChangeEvent>,
    events: Arc<EventLog>,
    catalog: Arc<DeviceCatalog>,
    store: Arc<ConversationStore>,
    shutdown_tx: watch::Sender<bool>,
}

struct ScriptedProbe {
    /// Successive observations; the last one repeats forever.
    contents: Mutex<VecDeque<Vec<u8>>>,
    delay: Duration,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    polls: AtomicUsize,
}

impl ScriptedProbe {
    fn new(contents: Vec<&str>, delay: Duration) -> Self {
        Self {
            contents: Mutex::new(contents.into_iter().map(|s| s.as_bytes().to_vec()).collect()),
            delay,
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl WatchProbe for ScriptedProbe {
    async fn observe(
        &self,
        _rule: &WatchRuleRecord,
        _cancel: &CancellationToken,
    ) -> Result<Observation, ExecutionError> {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        self.polls.fetch_add(1, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        let content = {
            let mut contents = self.contents.lock().unwrap();
            if contents.len() > 1 {
                contents.pop_front().unwrap()
            } else {
                contents.front().cloned().unwrap_or_default()
            }
        };
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        Ok(Observation {
            content,
            content_type: "text/plain".to_string(),
            status: ServiceStatus::Online,
            metadata: serde_json::Map::new(),
            needs_config: false,
        })
    }
}

async fn fixture(probe: Arc<dyn WatchProbe>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("watch.db");
    std::mem::forget(dir);

    let catalog = Arc::new(DeviceCatalog::new(db::open(&path).unwrap()));
    let store = Arc::new(ConversationStore::spawn(
        db::open_existing(&path).unwrap(),
        db::open_existing(&path).unwrap(),
    ));
    let events = Arc::new(EventLog::new());
    let config = Arc::new(ConfigStore::in_memory(None));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, change_rx) = WatchManager::start(
        WatchDeps {
            config,
            events: Arc::clone(&events),
            catalog: Arc::clone(&catalog),
            store: Arc::clone(&store),
            probe,
        },
        shutdown_rx,
    );

    Fixture {
        handle,
        change_rx,
        events,
        catalog,
        store,
        shutdown_tx,
    }
}

async fn device_rule(fix: &Fixture, poll_ms: u64, expires_in: ChronoDuration) -> WatchRuleRecord {
    let conversation = ConversationId::new();
    fix.store.touch_conversation(&conversation).await.unwrap();
    let device = fix
        .catalog
        .upsert_device(&DeviceObservation {
            ip: "192.168.1.100".into(),
            ..Default::default()
        })
        .unwrap();
    WatchRuleRecord {
        id: RuleId::new(),
        conversation_id: conversation,
        target: TargetRef::device(device.id),
        intent: "camera:describe".into(),
        started_at: Utc::now(),
        expires_at: Utc::now() + expires_in,
        poll_interval_ms: poll_ms,
        change_threshold: 0.2,
        active: true,
        last_polled: None,
        last_change: None,
    }
}

#[tokio::test(start_paused = true)]
async fn change_chain_is_persisted_and_events_are_monotonic() {
    let probe = Arc::new(ScriptedProbe::new(
        vec![
            "alpha beta gamma delta epsilon zeta eta theta",
            "totally different words describing another page entirely now",
            "yet another full rewrite with nothing shared between them",
        ],
        Duration::from_millis(0),
    ));
    let mut fix = fixture(probe).await;
    let rule = device_rule(&fix, 10, ChronoDuration::hours(1)).await;
    let target = rule.target.clone();
    fix.handle.add_rule(rule).await.unwrap();

    // first poll is the baseline, the next two are full rewrites
    let first = tokio::time::timeout(Duration::from_secs(30), fix.change_rx.recv())
        .await
        .expect("first change event")
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(30), fix.change_rx.recv())
        .await
        .expect("second change event")
        .unwrap();

    assert!(second.detected_at > first.detected_at, "events not monotonic");
    assert!(first.change_score > 0.9);

    // snapshot chaining: consecutive snapshots are hash-equal or linked
    let snapshots = fix.catalog.snapshots(&target, 10).unwrap();
    assert!(snapshots.len() >= 3);
    let changes = fix.catalog.changes_for_target(&target, 10).unwrap();
    for pair in snapshots.windows(2) {
        let (newer, older) = (&pair[0], &pair[1]);
        let linked = changes.iter().any(|c| {
            c.current_snapshot_id == newer.id
                && c.previous_snapshot_id.as_deref() == Some(older.id.as_str())
        });
        assert!(newer.hash == older.hash || linked, "unlinked snapshot pair");
    }

    // change_detected also reached the event log
    let logged = fix.events.filter(&EventFilter {
        kind: Some(EventKind::ChangeDetected),
        since: None,
    });
    assert!(logged.len() >= 2);

    let _ = fix.shutdown_tx.send(true);
}

#[tokio::test(start_paused = true)]
async fn at_most_one_poll_in_flight_per_rule() {
    let probe = Arc::new(ScriptedProbe::new(
        vec!["steady content"],
        Duration::from_secs(5),
    ));
    let probe_ref = Arc::clone(&probe);
    let fix = fixture(probe).await;
    // poll interval far shorter than the probe latency
    let rule = device_rule(&fix, 1, ChronoDuration::hours(1)).await;
    fix.handle.add_rule(rule).await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(probe_ref.polls.load(Ordering::SeqCst) >= 2, "engine stopped polling");
    assert_eq!(
        probe_ref.max_concurrent.load(Ordering::SeqCst),
        1,
        "overlapping polls for one rule"
    );

    let _ = fix.shutdown_tx.send(true);
}

#[tokio::test(start_paused = true)]
async fn rule_expires_and_is_deactivated() {
    let probe = Arc::new(ScriptedProbe::new(vec!["x"], Duration::from_millis(0)));
    let fix = fixture(probe).await;
    let rule = device_rule(&fix, 50, ChronoDuration::seconds(3)).await;
    let id = rule.id.clone();
    fix.handle.add_rule(rule).await.unwrap();

    tokio::time::sleep(Duration::from_secs(6)).await;

    assert!(fix.handle.list().await.unwrap().is_empty());
    let persisted = fix.store.get_rule(&id).unwrap().unwrap();
    assert!(!persisted.active);
    let expired_events = fix.events.filter(&EventFilter {
        kind: Some(EventKind::WatchExpired),
        since: None,
    });
    assert_eq!(expired_events.len(), 1);

    let _ = fix.shutdown_tx.send(true);
}

#[tokio::test(start_paused = true)]
async fn stopped_rule_retains_change_logs() {
    let probe = Arc::new(ScriptedProbe::new(
        vec![
            "first page content words one two three four five",
            "completely new body with entirely unrelated vocabulary inside",
        ],
        Duration::from_millis(0),
    ));
    let mut fix = fixture(probe).await;
    let rule = device_rule(&fix, 10, ChronoDuration::hours(1)).await;
    let id = rule.id.clone();
    fix.handle.add_rule(rule).await.unwrap();

    // wait for one change, then stop
    tokio::time::timeout(Duration::from_secs(30), fix.change_rx.recv())
        .await
        .expect("change event")
        .unwrap();
    fix.handle.stop(&id).await.unwrap();

    assert!(fix.handle.list().await.unwrap().is_empty());
    let logs = fix.handle.logs(&id).unwrap();
    assert!(!logs.is_empty(), "change logs lost after stop");

    // stopping again reports the rule as gone
    assert!(fix.handle.stop(&id).await.is_err());

    let _ = fix.shutdown_tx.send(true);
}

struct NeedsConfigProbe;

#[async_trait]
impl WatchProbe for NeedsConfigProbe {
    async fn observe(
        &self,
        _rule: &WatchRuleRecord,
        _cancel: &CancellationToken,
    ) -> Result<Observation, ExecutionError> {
        Ok(Observation {
            content: Vec::new(),
            content_type: "text/html".to_string(),
            status: ServiceStatus::Unknown,
            metadata: serde_json::Map::new(),
            needs_config: true,
        })
    }
}

#[tokio::test(start_paused = true)]
async fn credential_missing_poll_marks_service_unknown_without_snapshot() {
    let fix = fixture(Arc::new(NeedsConfigProbe)).await;
    let conversation = ConversationId::new();
    fix.store.touch_conversation(&conversation).await.unwrap();

    let device = fix
        .catalog
        .upsert_device(&DeviceObservation {
            ip: "192.168.1.44".into(),
            ..Default::default()
        })
        .unwrap();
    let service = fix
        .catalog
        .upsert_service(&device.id, ServiceType::Rtsp, 554, None, None)
        .unwrap();
    fix.catalog
        .set_service_status(&service.id, ServiceStatus::Online)
        .unwrap();

    let target = TargetRef::service(service.id.clone());
    let rule = WatchRuleRecord {
        id: RuleId::new(),
        conversation_id: conversation,
        target: target.clone(),
        intent: "camera:describe".into(),
        started_at: Utc::now(),
        expires_at: Utc::now() + ChronoDuration::hours(1),
        poll_interval_ms: 10,
        change_threshold: 0.15,
        active: true,
        last_polled: None,
        last_change: None,
    };
    fix.handle.add_rule(rule).await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;

    // status observation lands even though the probe had no credentials
    let service = fix.catalog.get_service(&service.id).unwrap().unwrap();
    assert_eq!(service.status, ServiceStatus::Unknown);
    // but no snapshot is taken and the rule keeps running
    assert!(fix.catalog.snapshots(&target, 10).unwrap().is_empty());
    assert_eq!(fix.handle.list().await.unwrap().len(), 1);

    let _ = fix.shutdown_tx.send(true);
}
