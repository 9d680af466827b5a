//! Explicit service bundle threaded through every plugin call.
//!
//! There are no ambient globals: everything a plugin may touch —
//! settings, the event log, persistence, an optional LLM — arrives
//! through [`PluginContext`]. Per-execution facts (scope, intent,
//! entities, cancellation) ride on [`ExecutionContext`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use netmind_core::events::EventLog;
use netmind_core::settings::ConfigStore;
use netmind_core::types::{Entities, IntentKind, Scope};
use netmind_store::{ConversationStore, DeviceCatalog};

use crate::error::ExecutionError;
use crate::llm::LlmClient;

/// Bridge to the privileged host runtime (raw sockets, subprocesses).
/// Absent in unprivileged contexts.
#[async_trait]
pub trait NativeBridge: Send + Sync {
    async fn invoke(
        &self,
        command: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ExecutionError>;
}

/// Shared services available to every plugin.
pub struct PluginServices {
    pub config: Arc<ConfigStore>,
    pub events: Arc<EventLog>,
    pub catalog: Arc<DeviceCatalog>,
    pub conversations: Arc<ConversationStore>,
    /// Absent when no LLM provider is configured.
    pub llm: Option<Arc<dyn LlmClient>>,
}

/// Process-wide context handed to plugins at registration and selection
/// time.
#[derive(Clone)]
pub struct PluginContext {
    /// Whether the privileged runtime is available. Plugins with
    /// `browser_compatible() == false` cannot run without it.
    pub runtime_privileged: bool,
    pub native: Option<Arc<dyn NativeBridge>>,
    pub services: Arc<PluginServices>,
}

impl PluginContext {
    pub fn new(runtime_privileged: bool, services: Arc<PluginServices>) -> Self {
        Self {
            runtime_privileged,
            native: None,
            services,
        }
    }

    pub fn with_native(mut self, bridge: Arc<dyn NativeBridge>) -> Self {
        self.native = Some(bridge);
        self
    }

    /// Invoke a native host command. Fails with `RuntimeRequired` when no
    /// bridge is attached.
    pub async fn invoke_native(
        &self,
        command: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ExecutionError> {
        match &self.native {
            Some(bridge) => bridge.invoke(command, args).await,
            None => Err(ExecutionError::RuntimeRequired {
                plugin_id: command.to_string(),
            }),
        }
    }
}

/// Per-execution context: the plugin context plus the facts of this one
/// dispatch.
#[derive(Clone)]
pub struct ExecutionContext {
    pub plugin: PluginContext,
    /// Scope captured at turn start; mid-turn scope changes do not affect
    /// an in-flight dispatch.
    pub scope: Scope,
    pub intent: IntentKind,
    pub entities: Entities,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cooperative cancellation check for plugins between suspension
    /// points.
    pub fn check_cancelled(&self) -> Result<(), ExecutionError> {
        if self.cancel.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            Ok(())
        }
    }
}
