//! Plugin selection and budgeted execution.
//!
//! Selection: intent lookup → scope filter → `can_handle` narrowing →
//! priority order. Execution runs under a budget with a child
//! cancellation token; identical concurrent executions (same plugin +
//! primary entity) are deduplicated by sharing the first result.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use netmind_core::config::DEFAULT_DISPATCH_BUDGET_MS;
use netmind_core::events::{EventKind, EventLog};
use netmind_core::settings::ConfigStore;
use netmind_core::types::{IntentKind, Scope};
use netmind_intent::Classification;
use netmind_plugin::{
    DispatchResult, ExecutionContext, ExecutionError, ExecutionStatus, Plugin, PluginContext,
    PluginRegistry,
};

type SharedOutcome = Option<Result<DispatchResult, ExecutionError>>;
type InFlightSlot = watch::Receiver<SharedOutcome>;

pub struct Dispatcher {
    registry: Arc<PluginRegistry>,
    events: Arc<EventLog>,
    config: Arc<ConfigStore>,
    in_flight: DashMap<String, InFlightSlot>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<PluginRegistry>,
        events: Arc<EventLog>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            registry,
            events,
            config,
            in_flight: DashMap::new(),
        }
    }

    /// Select a plugin for the classification under `scope` and execute
    /// it. The cancellation token is the turn's token; execution gets a
    /// child of it.
    pub async fn dispatch(
        &self,
        classification: &Classification,
        scope: Scope,
        base: &PluginContext,
        cancel: &CancellationToken,
    ) -> Result<DispatchResult, ExecutionError> {
        let plugin = self.select(classification, scope, base)?;
        let plugin_id = plugin.id().to_string();

        // Privileged-runtime gate: a browser-incompatible plugin cannot
        // run without the native runtime.
        if !plugin.browser_compatible() && !base.runtime_privileged {
            return Err(ExecutionError::RuntimeRequired { plugin_id });
        }

        let dedup_key = format!(
            "{plugin_id}:{}",
            classification
                .entities
                .primary()
                .unwrap_or(classification.raw_text.as_str())
        );

        // Duplicate in flight: recover by surfacing the first execution's
        // result, marked cached.
        if let Some(slot) = self.in_flight.get(&dedup_key) {
            let rx = slot.clone();
            drop(slot);
            debug!(key = %dedup_key, "duplicate execution deduplicated");
            self.events.append(
                EventKind::ErrorOccurred,
                serde_json::json!({
                    "code": ExecutionError::DuplicateInFlight { key: dedup_key.clone() }.code(),
                    "recovered": true,
                    "key": dedup_key,
                }),
            );
            return wait_for_shared(rx).await;
        }

        let (result_tx, result_rx) = watch::channel(None);
        self.in_flight.insert(dedup_key.clone(), result_rx);

        let outcome = self
            .execute(plugin, classification, scope, base, cancel)
            .await;

        // Publish to any deduplicated waiter, then retire the slot.
        let _ = result_tx.send(Some(outcome.clone()));
        self.in_flight.remove(&dedup_key);

        outcome
    }

    fn select(
        &self,
        classification: &Classification,
        scope: Scope,
        base: &PluginContext,
    ) -> Result<Arc<dyn Plugin>, ExecutionError> {
        let intent = classification.intent;
        let candidates = self.registry.by_intent(intent);
        if candidates.is_empty() {
            return Err(ExecutionError::NoPlugin { intent, scope });
        }

        let mut scoped: Vec<Arc<dyn Plugin>> = candidates
            .into_iter()
            .filter(|p| scope.allows(p.id()))
            .collect();
        if scoped.is_empty() {
            return Err(ExecutionError::NoPlugin { intent, scope });
        }

        if scoped.len() > 1 {
            let handled: Vec<Arc<dyn Plugin>> = scoped
                .iter()
                .filter(|p| p.can_handle(&classification.raw_text, base))
                .cloned()
                .collect();
            if !handled.is_empty() {
                scoped = handled;
            }
        }

        // priority desc; stable sort keeps registration order on ties
        scoped.sort_by_key(|p| std::cmp::Reverse(p.priority()));
        Ok(scoped.remove(0))
    }

    async fn execute(
        &self,
        plugin: Arc<dyn Plugin>,
        classification: &Classification,
        scope: Scope,
        base: &PluginContext,
        cancel: &CancellationToken,
    ) -> Result<DispatchResult, ExecutionError> {
        let plugin_id = plugin.id().to_string();
        let budget = self.budget_for(classification.intent);
        let child = cancel.child_token();

        let ctx = ExecutionContext {
            plugin: base.clone(),
            scope,
            intent: classification.intent,
            entities: classification.entities.clone(),
            cancel: child.clone(),
        };

        self.events.append(
            EventKind::ScanStarted,
            serde_json::json!({
                "plugin_id": plugin_id,
                "intent": classification.intent.as_str(),
            }),
        );

        let started = Instant::now();
        let outcome = tokio::select! {
            r = timeout(budget, plugin.execute(&classification.raw_text, &ctx)) => {
                match r {
                    Ok(inner) => inner,
                    Err(_) => {
                        // timeout is cancellation with a distinct reason
                        child.cancel();
                        Err(ExecutionError::Timeout { ms: budget.as_millis() as u64 })
                    }
                }
            }
            _ = child.cancelled() => Err(ExecutionError::Cancelled),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(mut output) => {
                output.metadata.duration_ms = duration_ms;
                let status = output.status;
                self.events.append(
                    EventKind::ScanCompleted,
                    serde_json::json!({
                        "plugin_id": plugin_id,
                        "intent": classification.intent.as_str(),
                        "duration_ms": duration_ms,
                        "status": status,
                    }),
                );
                if status == ExecutionStatus::Error {
                    self.events.append(
                        EventKind::ErrorOccurred,
                        serde_json::json!({
                            "plugin_id": plugin_id,
                            "intent": classification.intent.as_str(),
                            "message": output.text(),
                        }),
                    );
                } else {
                    info!(plugin_id = %plugin_id, duration_ms, "dispatch complete");
                }
                Ok(DispatchResult {
                    plugin_id,
                    output,
                })
            }
            Err(e) => {
                warn!(plugin_id = %plugin_id, duration_ms, "dispatch failed: {e}");
                self.events.append(
                    EventKind::ScanCompleted,
                    serde_json::json!({
                        "plugin_id": plugin_id,
                        "intent": classification.intent.as_str(),
                        "duration_ms": duration_ms,
                        "status": "error",
                    }),
                );
                self.events.append(
                    EventKind::ErrorOccurred,
                    serde_json::json!({
                        "plugin_id": plugin_id,
                        "code": e.code(),
                        "message": e.to_string(),
                    }),
                );
                Err(e)
            }
        }
    }

    fn budget_for(&self, intent: IntentKind) -> Duration {
        let ms = self
            .config
            .get_u64(&format!("dispatch.budget_ms.{}", intent.as_str()))
            .or_else(|| self.config.get_u64("dispatch.budget_ms"))
            .unwrap_or(DEFAULT_DISPATCH_BUDGET_MS);
        Duration::from_millis(ms)
    }
}

/// Await the first execution's published outcome; successes are marked
/// cached.
async fn wait_for_shared(mut rx: InFlightSlot) -> Result<DispatchResult, ExecutionError> {
    loop {
        let published = rx.borrow().clone();
        match published {
            Some(Ok(mut result)) => {
                result.output.metadata.cached = true;
                return Ok(result);
            }
            Some(Err(e)) => return Err(e),
            None => {
                if rx.changed().await.is_err() {
                    return Err(ExecutionError::Internal(
                        "deduplicated execution ended without a result".to_string(),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use netmind_core::types::Entities;
    use netmind_intent::Classification;
    use netmind_plugin::{ContentBlock, ExecutionOutput, PluginServices};
    use netmind_store::{db, ConversationStore, DeviceCatalog};

    use super::*;

    fn base_context() -> PluginContext {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.db");
        std::mem::forget(dir);
        let catalog = DeviceCatalog::new(db::open(&path).unwrap());
        let conversations = ConversationStore::spawn(
            db::open_existing(&path).unwrap(),
            db::open_existing(&path).unwrap(),
        );
        let services = Arc::new(PluginServices {
            config: Arc::new(ConfigStore::in_memory(None)),
            events: Arc::new(EventLog::new()),
            catalog: Arc::new(catalog),
            conversations: Arc::new(conversations),
            llm: None,
        });
        PluginContext::new(true, services)
    }

    struct StubPlugin {
        id: &'static str,
        intents: Vec<IntentKind>,
        priority: i32,
        browser_compatible: bool,
        delay_ms: u64,
    }

    impl StubPlugin {
        fn new(id: &'static str, intent: IntentKind) -> Self {
            Self {
                id,
                intents: vec![intent],
                priority: 0,
                browser_compatible: true,
                delay_ms: 0,
            }
        }
    }

    #[async_trait]
    impl Plugin for StubPlugin {
        fn id(&self) -> &str {
            self.id
        }
        fn supported_intents(&self) -> &[IntentKind] {
            &self.intents
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn browser_compatible(&self) -> bool {
            self.browser_compatible
        }
        async fn execute(
            &self,
            _text: &str,
            ctx: &ExecutionContext,
        ) -> Result<ExecutionOutput, ExecutionError> {
            if self.delay_ms > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(self.delay_ms)) => {}
                    _ = ctx.cancel.cancelled() => return Err(ExecutionError::Cancelled),
                }
            }
            Ok(ExecutionOutput::success(vec![ContentBlock::text(self.id)]))
        }
    }

    fn classification(intent: IntentKind, text: &str) -> Classification {
        Classification {
            intent,
            confidence: 0.95,
            entities: Entities::default(),
            raw_text: text.to_string(),
        }
    }

    async fn dispatcher_with(plugins: Vec<StubPlugin>) -> (Dispatcher, PluginContext) {
        let ctx = base_context();
        let registry = Arc::new(PluginRegistry::new());
        for plugin in plugins {
            registry.register(Arc::new(plugin), &ctx).await;
        }
        let dispatcher = Dispatcher::new(
            registry,
            Arc::new(EventLog::new()),
            Arc::clone(&ctx.services.config),
        );
        (dispatcher, ctx)
    }

    #[tokio::test]
    async fn selected_plugin_is_always_in_scope_allow_set() {
        let (dispatcher, ctx) =
            dispatcher_with(vec![StubPlugin::new("net-scan", IntentKind::NetworkScan)]).await;
        let c = classification(IntentKind::NetworkScan, "skanuj sieć");

        for scope in [
            Scope::Local,
            Scope::Network,
            Scope::Internet,
            Scope::Vpn,
            Scope::Tor,
            Scope::Remote,
        ] {
            let cancel = CancellationToken::new();
            match dispatcher.dispatch(&c, scope, &ctx, &cancel).await {
                Ok(result) => {
                    assert!(
                        scope.allows(&result.plugin_id),
                        "{scope} executed out-of-scope plugin {}",
                        result.plugin_id
                    );
                }
                Err(ExecutionError::NoPlugin { .. }) => {
                    assert!(!scope.allows("net-scan"));
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
    }

    #[tokio::test]
    async fn higher_priority_wins_ties_break_by_registration() {
        let mut low = StubPlugin::new("ping", IntentKind::NetworkPing);
        low.priority = 1;
        let mut high = StubPlugin::new("arp", IntentKind::NetworkPing);
        high.priority = 5;
        let (dispatcher, ctx) = dispatcher_with(vec![low, high]).await;

        let c = classification(IntentKind::NetworkPing, "ping 10.0.0.1");
        let cancel = CancellationToken::new();
        let result = dispatcher
            .dispatch(&c, Scope::Local, &ctx, &cancel)
            .await
            .unwrap();
        assert_eq!(result.plugin_id, "arp");
    }

    #[tokio::test]
    async fn browser_incompatible_plugin_needs_privileged_runtime() {
        let mut native_only = StubPlugin::new("ping", IntentKind::NetworkPing);
        native_only.browser_compatible = false;
        let (dispatcher, ctx) = dispatcher_with(vec![native_only]).await;

        let unprivileged = PluginContext::new(false, Arc::clone(&ctx.services));
        let c = classification(IntentKind::NetworkPing, "ping 10.0.0.1");
        let cancel = CancellationToken::new();
        let err = dispatcher
            .dispatch(&c, Scope::Local, &unprivileged, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::RuntimeRequired { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_overrun_times_out() {
        let mut slow = StubPlugin::new("ping", IntentKind::NetworkPing);
        slow.delay_ms = 60_000;
        let (dispatcher, ctx) = dispatcher_with(vec![slow]).await;
        ctx.services
            .config
            .set("dispatch.budget_ms.network:ping", 100u64)
            .unwrap();

        let c = classification(IntentKind::NetworkPing, "ping 10.0.0.1");
        let cancel = CancellationToken::new();
        let err = dispatcher
            .dispatch(&c, Scope::Local, &ctx, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout { ms: 100 }));
    }
}
