use thiserror::Error;

use netmind_core::types::{IntentKind, Scope};

/// Errors surfaced by plugin selection and execution.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// The chosen plugin needs the privileged runtime (raw sockets,
    /// subprocesses) and it is absent.
    #[error("Plugin '{plugin_id}' requires the privileged runtime")]
    RuntimeRequired { plugin_id: String },

    /// Execution exceeded its budget. Timeout is cancellation with a
    /// distinct reason; plugins observe it at their next suspension.
    #[error("Execution timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// An identical execution (plugin + primary entity) is already in
    /// flight. Recovered by surfacing the in-flight result.
    #[error("Duplicate execution in flight: {key}")]
    DuplicateInFlight { key: String },

    /// The turn was cancelled (new utterance or explicit cancel).
    #[error("Execution cancelled")]
    Cancelled,

    /// An external service answered with a non-success status.
    #[error("Upstream error from {service}: {reason}")]
    Upstream { service: String, reason: String },

    /// No registered plugin can serve this intent in the active scope.
    #[error("No plugin available for {intent} in scope {scope}")]
    NoPlugin { intent: IntentKind, scope: Scope },

    /// The plugin failed to initialize and is registered but disabled.
    #[error("Plugin '{plugin_id}' is disabled")]
    PluginDisabled { plugin_id: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecutionError {
    /// Short error class rendered to users alongside the human summary.
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::RuntimeRequired { .. } => "RUNTIME_REQUIRED",
            ExecutionError::Timeout { .. } => "TIMEOUT",
            ExecutionError::DuplicateInFlight { .. } => "DUPLICATE_IN_FLIGHT",
            ExecutionError::Cancelled => "CANCELLED",
            ExecutionError::Upstream { .. } => "UPSTREAM_ERROR",
            ExecutionError::NoPlugin { .. } => "NO_PLUGIN",
            ExecutionError::PluginDisabled { .. } => "PLUGIN_DISABLED",
            ExecutionError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
