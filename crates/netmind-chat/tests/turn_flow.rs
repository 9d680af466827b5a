// Full turn lifecycle against scripted plugins: ping flow, scope
// filtering, cancel-on-new-turn, duplicate dedup, auto-watch and change
// notification injection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Duration;

use netmind_chat::{
    AutoWatchIntegrator, ChatOrchestrator, Dispatcher, OrchestratorDeps, PlainTextAdapter,
};
use netmind_core::config::NetmindConfig;
use netmind_core::events::EventLog;
use netmind_core::settings::ConfigStore;
use netmind_core::types::{ConversationId, IntentKind, Scope, Utterance};
use netmind_intent::IntentRouter;
use netmind_plugin::{
    ContentBlock, ExecutionContext, ExecutionError, ExecutionOutput, Plugin, PluginContext,
    PluginRegistry, PluginServices,
};
use netmind_store::types::{DeviceObservation, ServiceType};
use netmind_store::{db, ConversationStore, DeviceCatalog};
use netmind_watch::{PluginProbe, WatchDeps, WatchManager};

struct Fixture {
    orchestrator: Arc<ChatOrchestrator>,
    store: Arc<ConversationStore>,
    catalog: Arc<DeviceCatalog>,
    events: Arc<EventLog>,
    config: Arc<ConfigStore>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<PluginRegistry>,
    base_ctx: PluginContext,
    _shutdown: watch::Sender<bool>,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chat.db");
    std::mem::forget(dir);

    let events = Arc::new(EventLog::new());
    let config = Arc::new(ConfigStore::in_memory(Some(Arc::clone(&events))));
    NetmindConfig::default().seed_settings(&config);

    let catalog = Arc::new(DeviceCatalog::new(db::open(&path).unwrap()));
    let store = Arc::new(ConversationStore::spawn(
        db::open_existing(&path).unwrap(),
        db::open_existing(&path).unwrap(),
    ));

    let services = Arc::new(PluginServices {
        config: Arc::clone(&config),
        events: Arc::clone(&events),
        catalog: Arc::clone(&catalog),
        conversations: Arc::clone(&store),
        llm: None,
    });
    let base_ctx = PluginContext::new(true, services);

    let registry = Arc::new(PluginRegistry::new());
    for plugin in plugins() {
        registry.register(plugin, &base_ctx).await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let probe = Arc::new(PluginProbe::new(Arc::clone(&registry), base_ctx.clone()));
    let (watch_handle, change_rx) = WatchManager::start(
        WatchDeps {
            config: Arc::clone(&config),
            events: Arc::clone(&events),
            catalog: Arc::clone(&catalog),
            store: Arc::clone(&store),
            probe,
        },
        shutdown_rx,
    );

    let autowatch = Arc::new(AutoWatchIntegrator::new(
        Arc::clone(&config),
        Arc::clone(&events),
        Arc::clone(&catalog),
        Arc::clone(&store),
        watch_handle.clone(),
    ));
    Arc::clone(&autowatch).spawn_change_listener(change_rx);

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&events),
        Arc::clone(&config),
    ));

    let orchestrator = Arc::new(ChatOrchestrator::new(OrchestratorDeps {
        router: IntentRouter::new(Arc::clone(&config), Arc::clone(&registry), None),
        dispatcher: Arc::clone(&dispatcher),
        store: Arc::clone(&store),
        events: Arc::clone(&events),
        autowatch,
        watch: watch_handle,
        adapter: Arc::new(PlainTextAdapter),
        base_ctx: base_ctx.clone(),
        initial_scope: Scope::Local,
    }));

    Fixture {
        orchestrator,
        store,
        catalog,
        events,
        config,
        dispatcher,
        registry,
        base_ctx,
        _shutdown: shutdown_tx,
    }
}

fn plugins() -> Vec<Arc<dyn Plugin>> {
    vec![
        Arc::new(PingPlugin {
            executions: AtomicUsize::new(0),
        }),
        Arc::new(ScanPlugin),
        Arc::new(DescribePlugin {
            calls: AtomicUsize::new(0),
        }),
        Arc::new(SlowFetchPlugin),
    ]
}

struct PingPlugin {
    executions: AtomicUsize,
}

#[async_trait]
impl Plugin for PingPlugin {
    fn id(&self) -> &str {
        "ping"
    }
    fn supported_intents(&self) -> &[IntentKind] {
        &[IntentKind::NetworkPing]
    }
    async fn execute(
        &self,
        _text: &str,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, ExecutionError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        // stay suspended briefly so duplicate submissions can overlap
        tokio::time::sleep(Duration::from_millis(80)).await;
        ctx.check_cancelled()?;
        let ip = ctx.entities.ip.clone().unwrap_or_default();
        Ok(ExecutionOutput::success(vec![ContentBlock::text(format!(
            "{ip} Dostępny (4/4 pakiety)"
        ))]))
    }
}

struct ScanPlugin;

#[async_trait]
impl Plugin for ScanPlugin {
    fn id(&self) -> &str {
        "net-scan"
    }
    fn supported_intents(&self) -> &[IntentKind] {
        &[IntentKind::NetworkScan]
    }
    async fn execute(
        &self,
        _text: &str,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let catalog = &ctx.plugin.services.catalog;
        let device = catalog
            .upsert_device(&DeviceObservation {
                ip: "192.168.1.100".into(),
                hostname: Some("cam-hall".into()),
                ..Default::default()
            })
            .map_err(|e| ExecutionError::Internal(e.to_string()))?;
        catalog
            .upsert_service(&device.id, ServiceType::Onvif, 80, None, None)
            .map_err(|e| ExecutionError::Internal(e.to_string()))?;
        let mut output = ExecutionOutput::success(vec![ContentBlock::text(
            "Znaleziono 1 urządzenie: 192.168.1.100 (cam-hall)",
        )]);
        output.metadata.device_count = Some(1);
        Ok(output)
    }
}

struct DescribePlugin {
    calls: AtomicUsize,
}

#[async_trait]
impl Plugin for DescribePlugin {
    fn id(&self) -> &str {
        "onvif-camera"
    }
    fn supported_intents(&self) -> &[IntentKind] {
        &[IntentKind::CameraDescribe, IntentKind::CameraOnvif]
    }
    async fn execute(
        &self,
        _text: &str,
        _ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, ExecutionError> {
        // every call shows a completely different scene, so consecutive
        // watch polls always cross the change threshold
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutionOutput::success(vec![ContentBlock::text(format!(
            "scena numer {n}: zupełnie inne obiekty przedmioty kolory światła cienie wariant {n}"
        ))]))
    }
}

struct SlowFetchPlugin;

#[async_trait]
impl Plugin for SlowFetchPlugin {
    fn id(&self) -> &str {
        "http-fetch"
    }
    fn supported_intents(&self) -> &[IntentKind] {
        &[IntentKind::BrowseUrl, IntentKind::BrowseSearch]
    }
    async fn execute(
        &self,
        _text: &str,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, ExecutionError> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(25)) => {
                Ok(ExecutionOutput::success(vec![ContentBlock::text("strona pobrana")]))
            }
            _ = ctx.cancel.cancelled() => Err(ExecutionError::Cancelled),
        }
    }
}

fn utter(conversation: &ConversationId, text: &str) -> Utterance {
    Utterance::text_input(conversation.clone(), text)
}

#[tokio::test(start_paused = true)]
async fn ping_flow_end_to_end() {
    let fix = fixture().await;
    let conversation = ConversationId::new();
    let outcome = fix
        .orchestrator
        .turn(utter(&conversation, "ping 192.168.1.1"))
        .await
        .unwrap();

    assert_eq!(outcome.classification.intent, IntentKind::NetworkPing);
    assert_eq!(
        outcome.classification.entities.ip.as_deref(),
        Some("192.168.1.1")
    );
    assert!(outcome.assistant_message.text.contains("192.168.1.1"));
    assert!(outcome.assistant_message.text.contains("Dostępny"));
    assert_eq!(outcome.assistant_message.metadata["loading"], false);
    assert!(outcome
        .quick_actions
        .iter()
        .any(|a| a.label == "Skanuj porty 192.168.1.1"));
}

#[tokio::test(start_paused = true)]
async fn internet_scope_rejects_lan_scan() {
    let fix = fixture().await;
    fix.orchestrator.set_scope(Scope::Internet);
    let conversation = ConversationId::new();
    let outcome = fix
        .orchestrator
        .turn(utter(&conversation, "skanuj sieć"))
        .await
        .unwrap();

    assert!(outcome.result.is_none());
    assert!(matches!(
        outcome.error,
        Some(ExecutionError::NoPlugin { .. })
    ));
    let text = &outcome.assistant_message.text;
    assert!(text.contains("internet"), "unexpected message: {text}");
    assert!(text.to_lowercase().contains("zakres"));
    // no probe ran
    assert!(fix.catalog.list_devices().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn new_turn_cancels_in_flight_turn() {
    let fix = fixture().await;
    let conversation = ConversationId::new();

    let orch = Arc::clone(&fix.orchestrator);
    let conv = conversation.clone();
    let first = tokio::spawn(async move { orch.turn(utter(&conv, "https://slow.example")).await });

    // let the first turn reach its dispatch before interrupting
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = fix
        .orchestrator
        .turn(utter(&conversation, "ping 8.8.8.8"))
        .await
        .unwrap();
    let first = first.await.unwrap().unwrap();

    assert!(matches!(first.error, Some(ExecutionError::Cancelled)));
    assert!(first.assistant_message.text.contains("Anulowano"));
    assert!(second.assistant_message.text.contains("8.8.8.8"));

    // no placeholder is left loading once the next turn has begun
    let messages = fix.store.messages(&conversation, 50).unwrap();
    assert_eq!(messages.len(), 4);
    for message in &messages {
        assert_ne!(message.metadata["loading"], true, "{}", message.id);
    }
}

#[tokio::test(start_paused = true)]
async fn duplicate_submission_is_deduplicated() {
    let fix = fixture().await;
    let classification = {
        let router = IntentRouter::new(
            Arc::clone(&fix.config),
            Arc::clone(&fix.registry),
            None,
        );
        router.route("ping 10.0.0.1").await
    };

    let cancel = tokio_util::sync::CancellationToken::new();
    let (a, b) = tokio::join!(
        fix.dispatcher
            .dispatch(&classification, Scope::Local, &fix.base_ctx, &cancel),
        fix.dispatcher
            .dispatch(&classification, Scope::Local, &fix.base_ctx, &cancel),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let cached_count = [&a, &b]
        .iter()
        .filter(|r| r.output.metadata.cached)
        .count();
    assert_eq!(cached_count, 1, "exactly one result is the cached copy");
    assert_eq!(a.output.text(), b.output.text());
    assert!(!fix.events.is_empty());
}

#[tokio::test(start_paused = true)]
async fn repeat_camera_query_arms_a_watch_and_extends_it() {
    let fix = fixture().await;
    let conversation = ConversationId::new();

    // scan observes the camera device
    fix.orchestrator
        .turn(utter(&conversation, "skanuj sieć"))
        .await
        .unwrap();
    assert!(!fix.catalog.list_devices().unwrap().is_empty());

    // first describe within the window creates the rule
    let outcome = fix
        .orchestrator
        .turn(utter(&conversation, "co widać na 192.168.1.100"))
        .await
        .unwrap();
    let rule_id = outcome.watch_rule.expect("watch rule created");

    let rule = fix.store.get_rule(&rule_id).unwrap().unwrap();
    assert_eq!(rule.poll_interval_ms, 30_000, "camera poll cadence");
    assert!((rule.change_threshold - 0.10).abs() < f64::EPSILON);
    let ttl = rule.expires_at - rule.started_at;
    assert_eq!(ttl.num_seconds(), 3_600);

    // the second identical query extends rather than duplicates
    let outcome = fix
        .orchestrator
        .turn(utter(&conversation, "co widać na 192.168.1.100"))
        .await
        .unwrap();
    assert_eq!(outcome.watch_rule.as_ref(), Some(&rule_id));
    assert_eq!(fix.orchestrator.watch_list().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn change_event_injects_assistant_message() {
    let fix = fixture().await;
    let conversation = ConversationId::new();

    fix.orchestrator
        .turn(utter(&conversation, "skanuj sieć"))
        .await
        .unwrap();
    fix.orchestrator
        .turn(utter(&conversation, "co widać na 192.168.1.100"))
        .await
        .unwrap();
    let before = fix.store.messages(&conversation, 100).unwrap().len();

    // two poll cycles at camera cadence produce at least one change
    tokio::time::sleep(Duration::from_secs(95)).await;

    let messages = fix.store.messages(&conversation, 100).unwrap();
    assert!(messages.len() > before, "no watch message injected");
    let injected = messages
        .iter()
        .rev()
        .find(|m| m.metadata["watch"] == true)
        .expect("watch-injected assistant message");
    assert!(injected.text.contains("changed") || injected.text.contains("now"));
    assert!(injected.metadata["change_record_id"].is_string());
}

#[tokio::test(start_paused = true)]
async fn demo_and_test_queries_never_arm_watches() {
    let fix = fixture().await;
    let conversation = ConversationId::new();

    fix.orchestrator
        .turn(utter(&conversation, "skanuj sieć"))
        .await
        .unwrap();
    let outcome = fix
        .orchestrator
        .turn(utter(&conversation, "co widać na 192.168.1.100 (test)"))
        .await
        .unwrap();

    assert_eq!(outcome.classification.intent, IntentKind::CameraDescribe);
    assert!(outcome.watch_rule.is_none());
    assert!(fix.orchestrator.watch_list().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn configured_whitelist_overrides_default_auto_watch() {
    let fix = fixture().await;
    fix.config
        .set("watch.auto.intent_whitelist", "mqtt:read")
        .unwrap();
    let conversation = ConversationId::new();

    fix.orchestrator
        .turn(utter(&conversation, "skanuj sieć"))
        .await
        .unwrap();
    let outcome = fix
        .orchestrator
        .turn(utter(&conversation, "co widać na 192.168.1.100"))
        .await
        .unwrap();

    // camera:describe is out of the configured whitelist, so the repeat
    // query no longer arms a watch
    assert_eq!(outcome.classification.intent, IntentKind::CameraDescribe);
    assert!(outcome.watch_rule.is_none());
    assert!(fix.orchestrator.watch_list().await.unwrap().is_empty());
}
