//! Target observation for watch polls.
//!
//! The manager does not know protocols: it asks a [`WatchProbe`] for an
//! [`Observation`] and handles diffing, persistence and events. The
//! default probe dispatches back through the plugin registry, invoking
//! whatever plugin serves the rule's originating intent.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use netmind_core::types::{Entities, IntentKind, Scope, TargetKind};
use netmind_plugin::{
    ContentBlock, ExecutionContext, ExecutionError, ExecutionStatus, PluginContext, PluginRegistry,
};
use netmind_store::types::{ServiceStatus, WatchRuleRecord};

/// One observation of a watch target.
#[derive(Debug, Clone)]
pub struct Observation {
    pub content: Vec<u8>,
    pub content_type: String,
    pub status: ServiceStatus,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// The probe could not proceed without configuration (credentials,
    /// endpoint). The poll is recorded but produces no snapshot.
    pub needs_config: bool,
}

#[async_trait]
pub trait WatchProbe: Send + Sync {
    async fn observe(
        &self,
        rule: &WatchRuleRecord,
        cancel: &CancellationToken,
    ) -> Result<Observation, ExecutionError>;
}

/// Probe that re-dispatches through the plugin registry using the rule's
/// originating intent.
pub struct PluginProbe {
    registry: Arc<PluginRegistry>,
    context: PluginContext,
}

impl PluginProbe {
    pub fn new(registry: Arc<PluginRegistry>, context: PluginContext) -> Self {
        Self { registry, context }
    }

    /// Resolve target facts into entities so the plugin sees the same
    /// shape a routed utterance would produce.
    fn entities_for(&self, rule: &WatchRuleRecord) -> Entities {
        let mut entities = Entities::default();
        let catalog = &self.context.services.catalog;
        match rule.target.kind {
            TargetKind::Service => {
                if let Ok(Some(service)) = catalog.get_service(&rule.target.id) {
                    entities.port = Some(service.port);
                    if let Ok(Some(device)) = catalog.get_device(&service.device_id) {
                        entities.ip = Some(device.ip);
                    }
                    if let Some(path) = service.path {
                        if let Some(ip) = &entities.ip {
                            entities.url = Some(format!(
                                "{}://{}:{}{}",
                                service.service_type, ip, service.port, path
                            ));
                        }
                    }
                }
            }
            TargetKind::Device => {
                if let Ok(Some(device)) = catalog.get_device(&rule.target.id) {
                    entities.ip = Some(device.ip);
                    entities.mac = device.mac;
                }
            }
        }
        entities
    }
}

#[async_trait]
impl WatchProbe for PluginProbe {
    async fn observe(
        &self,
        rule: &WatchRuleRecord,
        cancel: &CancellationToken,
    ) -> Result<Observation, ExecutionError> {
        let intent = IntentKind::from_str(&rule.intent)
            .map_err(|_| ExecutionError::Internal(format!("bad rule intent: {}", rule.intent)))?;

        let scope: Scope = self
            .context
            .services
            .config
            .get_str("scope.active")
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        let plugin = self
            .registry
            .by_intent(intent)
            .into_iter()
            .find(|p| scope.allows(p.id()))
            .ok_or(ExecutionError::NoPlugin { intent, scope })?;

        let ctx = ExecutionContext {
            plugin: self.context.clone(),
            scope,
            intent,
            entities: self.entities_for(rule),
            cancel: cancel.clone(),
        };

        let text = format!("poll {}", rule.target);
        debug!(rule_id = %rule.id, plugin_id = %plugin.id(), "watch poll dispatch");
        let output = plugin.execute(&text, &ctx).await?;

        let needs_config = output
            .blocks
            .iter()
            .any(|b| matches!(b, ContentBlock::ConfigPrompt { .. }));

        let content_type = output
            .metadata
            .extra
            .get("content_type")
            .and_then(|v| v.as_str())
            .unwrap_or("text/html")
            .to_string();

        // A config-prompted probe observed nothing about availability.
        let status = if needs_config {
            ServiceStatus::Unknown
        } else {
            match output.status {
                ExecutionStatus::Success | ExecutionStatus::Partial => ServiceStatus::Online,
                ExecutionStatus::Error => ServiceStatus::Offline,
            }
        };

        Ok(Observation {
            content: output.text().into_bytes(),
            content_type,
            status,
            metadata: output.metadata.extra,
            needs_config,
        })
    }
}
