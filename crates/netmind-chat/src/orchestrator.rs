//! The turn lifecycle.
//!
//! One turn: append the user message, park a loading placeholder, route,
//! dispatch under the scope captured at turn start, render, summarize,
//! consider auto-watch, attach quick actions. A new utterance cancels
//! the in-flight turn and finalizes its placeholder before starting.

use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use netmind_core::events::{EventKind, EventLog};
use netmind_core::types::{ConversationId, IntentKind, RuleId, Scope, Utterance};
use netmind_intent::{Classification, IntentRouter};
use netmind_plugin::{DispatchResult, ExecutionError, LlmClient, PluginContext};
use netmind_store::types::{ChangeRecord, MessagePatch, NewMessage, Role, StoredMessage, WatchRuleRecord};
use netmind_store::ConversationStore;
use netmind_watch::WatchHandle;

use crate::autowatch::AutoWatchIntegrator;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::quick_actions::{self, QuickAction};
use crate::render::PresentationAdapter;
use crate::summary::{summarize_for_speech, BULK_TEXT_THRESHOLD};

const PLACEHOLDER_TEXT: &str = "…";
const CANCEL_TEXT: &str = "Anulowano: nowe polecenie przerwało to zapytanie.";

pub struct OrchestratorDeps {
    pub router: IntentRouter,
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<ConversationStore>,
    pub events: Arc<EventLog>,
    pub autowatch: Arc<AutoWatchIntegrator>,
    pub watch: WatchHandle,
    pub adapter: Arc<dyn PresentationAdapter>,
    pub base_ctx: PluginContext,
    pub initial_scope: Scope,
}

struct InFlightTurn {
    cancel: CancellationToken,
    placeholder_id: String,
}

/// Everything a programmatic caller learns about one finished turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub conversation_id: ConversationId,
    pub user_message: StoredMessage,
    pub assistant_message: StoredMessage,
    pub classification: Classification,
    pub result: Option<DispatchResult>,
    pub error: Option<ExecutionError>,
    pub watch_rule: Option<RuleId>,
    pub quick_actions: Vec<QuickAction>,
}

pub struct ChatOrchestrator {
    router: IntentRouter,
    dispatcher: Arc<Dispatcher>,
    store: Arc<ConversationStore>,
    events: Arc<EventLog>,
    autowatch: Arc<AutoWatchIntegrator>,
    watch: WatchHandle,
    adapter: Arc<dyn PresentationAdapter>,
    base_ctx: PluginContext,
    scope: RwLock<Scope>,
    turn_state: tokio::sync::Mutex<Option<InFlightTurn>>,
}

impl ChatOrchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        Self {
            router: deps.router,
            dispatcher: deps.dispatcher,
            store: deps.store,
            events: deps.events,
            autowatch: deps.autowatch,
            watch: deps.watch,
            adapter: deps.adapter,
            base_ctx: deps.base_ctx,
            scope: RwLock::new(deps.initial_scope),
            turn_state: tokio::sync::Mutex::new(None),
        }
    }

    /// Run one full turn. Returns after quick actions are attached; watch
    /// polls and change notifications continue in the background.
    pub async fn turn(&self, utterance: Utterance) -> Result<TurnOutcome> {
        let scope = *self.scope.read().unwrap();
        let conversation = utterance.conversation_id.clone();

        // Serialize turn setup: cancel the previous turn, settle its
        // placeholder, then park ours.
        let (user_message, placeholder, cancel) = {
            let mut state = self.turn_state.lock().await;
            if let Some(prev) = state.take() {
                prev.cancel.cancel();
                self.finalize_cancelled(&prev.placeholder_id).await;
            }

            let user_message = self
                .store
                .append_message(NewMessage::plain(
                    conversation.clone(),
                    Role::User,
                    utterance.text.clone(),
                ))
                .await?;
            self.append_message_event(&user_message);

            let placeholder = self
                .store
                .append_message(NewMessage {
                    conversation_id: conversation.clone(),
                    role: Role::Assistant,
                    text: PLACEHOLDER_TEXT.to_string(),
                    blocks: serde_json::Value::Array(Vec::new()),
                    metadata: serde_json::json!({"loading": true}),
                })
                .await?;
            self.append_message_event(&placeholder);

            let cancel = CancellationToken::new();
            *state = Some(InFlightTurn {
                cancel: cancel.clone(),
                placeholder_id: placeholder.id.clone(),
            });
            (user_message, placeholder, cancel)
        };

        let classification = self.router.route(&utterance.text).await;
        info!(
            intent = %classification.intent,
            confidence = classification.confidence,
            "utterance routed"
        );

        // Annotate the placeholder with the detected intent while it loads.
        let annotated = self
            .store
            .update_message(
                &placeholder.id,
                MessagePatch {
                    metadata: Some(serde_json::json!({
                        "loading": true,
                        "intent": classification.intent.as_str(),
                    })),
                    ..Default::default()
                },
            )
            .await;
        if let Ok(msg) = annotated {
            self.append_update_event(&msg);
        }

        let dispatch_outcome = if cancel.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            self.dispatcher
                .dispatch(&classification, scope, &self.base_ctx, &cancel)
                .await
        };

        let (final_text, blocks, result, error) = match dispatch_outcome {
            Ok(result) => {
                let rendered = self.adapter.render(&result);
                let text = if rendered.text.is_empty() {
                    "Gotowe.".to_string()
                } else {
                    rendered.text
                };
                let blocks =
                    serde_json::to_value(&rendered.blocks).unwrap_or(serde_json::Value::Null);
                (text, blocks, Some(result), None)
            }
            Err(e) => (
                error_text(&e),
                serde_json::Value::Array(Vec::new()),
                None,
                Some(e),
            ),
        };

        let mut metadata = serde_json::json!({
            "loading": false,
            "intent": classification.intent.as_str(),
        });
        if let Some(result) = &result {
            metadata["plugin_id"] = serde_json::json!(result.plugin_id);
            metadata["duration_ms"] = serde_json::json!(result.output.metadata.duration_ms);
            if result.output.metadata.cached {
                metadata["cached"] = serde_json::json!(true);
            }
        }
        if let Some(error) = &error {
            metadata["error"] = serde_json::json!(error.code());
            if matches!(error, ExecutionError::Cancelled) {
                metadata["cancelled"] = serde_json::json!(true);
            }
        }

        // TTS summary for bulk results, when an LLM is wired in.
        if error.is_none() && final_text.len() > BULK_TEXT_THRESHOLD {
            if let Some(llm) = self.llm() {
                if let Some(summary) = summarize_for_speech(&llm, &final_text).await {
                    self.events.append(
                        EventKind::SummaryGenerated,
                        serde_json::json!({
                            "message_id": placeholder.id,
                            "chars": summary.len(),
                        }),
                    );
                    metadata["tts_summary"] = serde_json::json!(summary);
                }
            }
        }

        let assistant = self
            .store
            .update_message(
                &placeholder.id,
                MessagePatch {
                    text: Some(final_text),
                    blocks: Some(blocks),
                    metadata: Some(metadata),
                },
            )
            .await?;
        self.append_update_event(&assistant);

        if let Some(error) = &error {
            self.events.append(
                EventKind::ErrorOccurred,
                serde_json::json!({
                    "source": "orchestrator",
                    "code": error.code(),
                    "message": error.to_string(),
                    "conversation_id": conversation.as_str(),
                }),
            );
        }

        // Auto-watch and quick actions only make sense for turns that
        // actually produced something.
        let cancelled = matches!(error, Some(ExecutionError::Cancelled));
        let watch_rule = if error.is_none() {
            let force = classification.intent == IntentKind::MonitorStart;
            match self
                .autowatch
                .after_turn(&conversation, &classification, force)
                .await
            {
                Ok(rule) => rule,
                Err(e) => {
                    warn!("auto-watch consideration failed: {e}");
                    None
                }
            }
        } else {
            None
        };

        let (assistant, actions) = if cancelled {
            (assistant, Vec::new())
        } else {
            let actions = quick_actions::resolve(
                classification.intent,
                &classification.entities,
                &assistant.text,
            );
            if actions.is_empty() {
                (assistant, actions)
            } else {
                let mut md = assistant.metadata.clone();
                md["quick_actions"] =
                    serde_json::to_value(&actions).unwrap_or(serde_json::Value::Null);
                let updated = self
                    .store
                    .update_message(
                        &assistant.id,
                        MessagePatch {
                            metadata: Some(md),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.append_update_event(&updated);
                (updated, actions)
            }
        };

        // Release the turn slot if this turn still owns it.
        {
            let mut state = self.turn_state.lock().await;
            if state
                .as_ref()
                .is_some_and(|t| t.placeholder_id == assistant.id)
            {
                *state = None;
            }
        }

        Ok(TurnOutcome {
            conversation_id: conversation,
            user_message,
            assistant_message: assistant,
            classification,
            result,
            error,
            watch_rule,
            quick_actions: actions,
        })
    }

    /// Explicitly cancel the in-flight turn, if any.
    pub async fn cancel_turn(&self) {
        let mut state = self.turn_state.lock().await;
        if let Some(prev) = state.take() {
            prev.cancel.cancel();
            self.finalize_cancelled(&prev.placeholder_id).await;
        }
    }

    /// Scope applies from the next turn; an in-flight dispatch keeps the
    /// scope captured at its start.
    pub fn set_scope(&self, scope: Scope) {
        *self.scope.write().unwrap() = scope;
        if let Err(e) = self
            .base_ctx
            .services
            .config
            .set("scope.active", scope.as_str())
        {
            warn!("scope persistence failed: {e}");
        }
        info!(scope = %scope, "scope changed");
    }

    pub fn scope(&self) -> Scope {
        *self.scope.read().unwrap()
    }

    pub async fn watch_list(&self) -> Result<Vec<WatchRuleRecord>> {
        Ok(self.watch.list().await?)
    }

    pub async fn watch_stop(&self, id: &RuleId) -> Result<()> {
        Ok(self.watch.stop(id).await?)
    }

    pub fn watch_logs(&self, id: &RuleId) -> Result<Vec<ChangeRecord>> {
        Ok(self.watch.logs(id)?)
    }

    fn llm(&self) -> Option<Arc<dyn LlmClient>> {
        self.base_ctx.services.llm.clone()
    }

    /// Settle a cancelled turn's placeholder so no message is left
    /// loading.
    async fn finalize_cancelled(&self, placeholder_id: &str) {
        let still_loading = self
            .store
            .get_message(placeholder_id)
            .ok()
            .flatten()
            .is_some_and(|m| m.metadata["loading"] == serde_json::Value::Bool(true));
        if !still_loading {
            return;
        }
        match self
            .store
            .update_message(
                placeholder_id,
                MessagePatch {
                    text: Some(CANCEL_TEXT.to_string()),
                    metadata: Some(serde_json::json!({
                        "loading": false,
                        "cancelled": true,
                    })),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(msg) => self.append_update_event(&msg),
            Err(e) => warn!(message_id = %placeholder_id, "cancel finalization failed: {e}"),
        }
    }

    fn append_message_event(&self, message: &StoredMessage) {
        self.events.append(
            EventKind::MessageAdded,
            serde_json::json!({
                "message_id": message.id,
                "conversation_id": message.conversation_id.as_str(),
                "role": message.role.as_str(),
            }),
        );
    }

    fn append_update_event(&self, message: &StoredMessage) {
        self.events.append(
            EventKind::MessageUpdated,
            serde_json::json!({
                "message_id": message.id,
                "conversation_id": message.conversation_id.as_str(),
                "loading": message.metadata["loading"],
            }),
        );
    }
}

/// User-visible rendering of a failed stage: error class plus a short
/// human summary.
fn error_text(error: &ExecutionError) -> String {
    let human = match error {
        ExecutionError::NoPlugin { intent, scope } => format!(
            "Bieżący zakres '{scope}' nie pozwala na operację {intent}. \
             Zmień zakres, aby kontynuować."
        ),
        ExecutionError::RuntimeRequired { plugin_id } => format!(
            "Ta operacja wymaga uprzywilejowanego środowiska (plugin '{plugin_id}'). \
             Uruchom aplikację natywnie, aby jej użyć."
        ),
        ExecutionError::Timeout { ms } => {
            format!("Przekroczono limit czasu ({} s). Spróbuj ponownie.", ms / 1000)
        }
        ExecutionError::Cancelled => return CANCEL_TEXT.to_string(),
        ExecutionError::DuplicateInFlight { .. } => {
            "To zapytanie już trwa; wynik pojawi się za chwilę.".to_string()
        }
        ExecutionError::Upstream { service, reason } => {
            format!("Usługa {service} zgłosiła błąd: {reason}")
        }
        ExecutionError::PluginDisabled { plugin_id } => {
            format!("Plugin '{plugin_id}' jest wyłączony.")
        }
        ExecutionError::Internal(reason) => format!("Błąd wewnętrzny: {reason}"),
    };
    format!("[{}] {}", error.code(), human)
}
