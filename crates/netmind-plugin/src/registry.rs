//! Plugin registry: intent → capable plugins, under scope and
//! capability filtering done by the dispatcher.

use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use netmind_core::types::IntentKind;

use crate::context::PluginContext;
use crate::contract::Plugin;

struct Entry {
    plugin: Arc<dyn Plugin>,
    disabled: bool,
}

/// Holds plugin instances keyed by id, preserving registration order.
///
/// Mutations are rare (startup, marketplace install/uninstall) and never
/// block readers for long; the entry list is small.
pub struct PluginRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Register a plugin, invoking its `initialize` with the process-wide
    /// context. Initialization failure keeps the plugin registered but
    /// disabled. Re-registering an id replaces the previous instance in
    /// place (the old one is disposed).
    pub async fn register(&self, plugin: Arc<dyn Plugin>, ctx: &PluginContext) {
        let id = plugin.id().to_string();
        let disabled = match plugin.initialize(ctx).await {
            Ok(()) => false,
            Err(e) => {
                warn!(plugin_id = %id, "plugin initialization failed, disabling: {e}");
                true
            }
        };

        let replaced = {
            let mut entries = self.entries.write().unwrap();
            match entries.iter_mut().find(|e| e.plugin.id() == id) {
                Some(slot) => {
                    let old = std::mem::replace(&mut slot.plugin, plugin);
                    slot.disabled = disabled;
                    Some(old)
                }
                None => {
                    entries.push(Entry { plugin, disabled });
                    None
                }
            }
        };

        if let Some(old) = replaced {
            old.dispose().await;
            info!(plugin_id = %id, "plugin replaced");
        } else {
            info!(plugin_id = %id, disabled, "plugin registered");
        }
    }

    /// Remove a plugin and dispose it. Returns false if the id is unknown.
    pub async fn unregister(&self, id: &str) -> bool {
        let removed = {
            let mut entries = self.entries.write().unwrap();
            let mut removed = None;
            entries.retain_mut(|e| {
                if e.plugin.id() == id {
                    removed = Some(Arc::clone(&e.plugin));
                    false
                } else {
                    true
                }
            });
            removed
        };
        match removed {
            Some(plugin) => {
                plugin.dispose().await;
                info!(plugin_id = %id, "plugin unregistered");
                true
            }
            None => false,
        }
    }

    /// Enabled plugins supporting `intent`, in registration order.
    pub fn by_intent(&self, intent: IntentKind) -> Vec<Arc<dyn Plugin>> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .filter(|e| !e.disabled && e.plugin.supported_intents().contains(&intent))
            .map(|e| Arc::clone(&e.plugin))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .find(|e| e.plugin.id() == id)
            .map(|e| Arc::clone(&e.plugin))
    }

    pub fn is_disabled(&self, id: &str) -> bool {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .any(|e| e.plugin.id() == id && e.disabled)
    }

    pub fn all(&self) -> Vec<Arc<dyn Plugin>> {
        let entries = self.entries.read().unwrap();
        entries.iter().map(|e| Arc::clone(&e.plugin)).collect()
    }

    /// (plugin id, keyword hints) for every enabled plugin — classifier
    /// context.
    pub fn keyword_hints(&self) -> Vec<(String, Vec<String>)> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .filter(|e| !e.disabled)
            .map(|e| {
                (
                    e.plugin.id().to_string(),
                    e.plugin
                        .keyword_hints()
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                )
            })
            .collect()
    }

    /// Dispose every plugin in reverse registration order (shutdown).
    pub async fn dispose_all(&self) {
        let plugins: Vec<Arc<dyn Plugin>> = {
            let entries = self.entries.read().unwrap();
            entries.iter().rev().map(|e| Arc::clone(&e.plugin)).collect()
        };
        for plugin in plugins {
            plugin.dispose().await;
        }
        info!("all plugins disposed");
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use netmind_core::events::EventLog;
    use netmind_core::settings::ConfigStore;
    use netmind_store::{db, ConversationStore, DeviceCatalog};

    use super::*;
    use crate::context::PluginServices;
    use crate::contract::{ExecutionOutput, ContentBlock};
    use crate::error::ExecutionError;
    use crate::ExecutionContext;

    fn test_context() -> PluginContext {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let catalog = DeviceCatalog::new(db::open(&path).unwrap());
        let conversations = ConversationStore::spawn(
            db::open_existing(&path).unwrap(),
            db::open_existing(&path).unwrap(),
        );
        std::mem::forget(dir);
        let services = Arc::new(PluginServices {
            config: Arc::new(ConfigStore::in_memory(None)),
            events: Arc::new(EventLog::new()),
            catalog: Arc::new(catalog),
            conversations: Arc::new(conversations),
            llm: None,
        });
        PluginContext::new(true, services)
    }

    struct FakePlugin {
        id: String,
        intents: Vec<IntentKind>,
        fail_init: bool,
        disposed: Arc<AtomicUsize>,
        dispose_log: Option<Arc<Mutex<Vec<String>>>>,
    }

    impl FakePlugin {
        fn new(id: &str, intents: Vec<IntentKind>) -> Self {
            Self {
                id: id.to_string(),
                intents,
                fail_init: false,
                disposed: Arc::new(AtomicUsize::new(0)),
                dispose_log: None,
            }
        }
    }

    #[async_trait]
    impl Plugin for FakePlugin {
        fn id(&self) -> &str {
            &self.id
        }

        fn supported_intents(&self) -> &[IntentKind] {
            &self.intents
        }

        async fn initialize(&self, _ctx: &PluginContext) -> Result<(), ExecutionError> {
            if self.fail_init {
                Err(ExecutionError::Internal("boom".into()))
            } else {
                Ok(())
            }
        }

        async fn execute(
            &self,
            _text: &str,
            _ctx: &ExecutionContext,
        ) -> Result<ExecutionOutput, ExecutionError> {
            Ok(ExecutionOutput::success(vec![ContentBlock::text("ok")]))
        }

        async fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
            if let Some(log) = &self.dispose_log {
                log.lock().unwrap().push(self.id.clone());
            }
        }
    }

    #[tokio::test]
    async fn by_intent_returns_registration_order() {
        let registry = PluginRegistry::new();
        let ctx = test_context();
        registry
            .register(
                Arc::new(FakePlugin::new("ping", vec![IntentKind::NetworkPing])),
                &ctx,
            )
            .await;
        registry
            .register(
                Arc::new(FakePlugin::new("ping-alt", vec![IntentKind::NetworkPing])),
                &ctx,
            )
            .await;

        let plugins = registry.by_intent(IntentKind::NetworkPing);
        let ids: Vec<_> = plugins.iter().map(|p| p.id().to_string()).collect();
        assert_eq!(ids, vec!["ping", "ping-alt"]);
    }

    #[tokio::test]
    async fn failed_init_marks_disabled_not_removed() {
        let registry = PluginRegistry::new();
        let ctx = test_context();
        let mut plugin = FakePlugin::new("broken", vec![IntentKind::NetworkPing]);
        plugin.fail_init = true;
        registry.register(Arc::new(plugin), &ctx).await;

        assert!(registry.get("broken").is_some());
        assert!(registry.is_disabled("broken"));
        assert!(registry.by_intent(IntentKind::NetworkPing).is_empty());
    }

    #[tokio::test]
    async fn reregister_replaces_and_disposes_old() {
        let registry = PluginRegistry::new();
        let ctx = test_context();
        let first = FakePlugin::new("ping", vec![IntentKind::NetworkPing]);
        let disposed = Arc::clone(&first.disposed);
        registry.register(Arc::new(first), &ctx).await;
        registry
            .register(
                Arc::new(FakePlugin::new("ping", vec![IntentKind::NetworkPing])),
                &ctx,
            )
            .await;

        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert_eq!(registry.all().len(), 1);
    }

    #[tokio::test]
    async fn dispose_all_runs_in_reverse_order() {
        let registry = PluginRegistry::new();
        let ctx = test_context();
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in ["a", "b", "c"] {
            let mut plugin = FakePlugin::new(id, vec![IntentKind::ChatAsk]);
            plugin.dispose_log = Some(Arc::clone(&log));
            registry.register(Arc::new(plugin), &ctx).await;
        }
        registry.dispose_all().await;
        assert_eq!(*log.lock().unwrap(), vec!["c", "b", "a"]);
    }
}
