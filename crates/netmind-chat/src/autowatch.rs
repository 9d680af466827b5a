//! Auto-watch integration.
//!
//! Repeat queries of the same target within a time window quietly turn
//! into watch rules; detected changes come back as assistant messages in
//! the conversation that asked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use netmind_core::config::{
    default_auto_exclusions, default_auto_intent_whitelist, DEFAULT_AUTO_WATCH_WINDOW_MS,
    DEFAULT_WATCH_DURATION_MS,
};
use netmind_core::events::{EventKind, EventLog};
use netmind_core::settings::ConfigStore;
use netmind_core::types::{ConversationId, IntentKind, RuleId, TargetRef};
use netmind_intent::Classification;
use netmind_store::types::{NewMessage, Role, Service, ServiceType, WatchRuleRecord};
use netmind_store::{ConversationStore, DeviceCatalog};
use netmind_watch::types::{poll_interval_for, threshold_for};
use netmind_watch::{ChangeEvent, WatchHandle};

use crate::error::Result;
use crate::quick_actions::{QuickAction, QuickActionKind};

/// How fresh a scan observation must be to count as a target query
/// (minutes).
const SCAN_FRESHNESS_MIN: i64 = 2;

pub struct AutoWatchIntegrator {
    config: Arc<ConfigStore>,
    events: Arc<EventLog>,
    catalog: Arc<DeviceCatalog>,
    store: Arc<ConversationStore>,
    watch: WatchHandle,
    /// Target id → when it was last queried.
    recent: Mutex<HashMap<String, Instant>>,
}

impl AutoWatchIntegrator {
    pub fn new(
        config: Arc<ConfigStore>,
        events: Arc<EventLog>,
        catalog: Arc<DeviceCatalog>,
        store: Arc<ConversationStore>,
        watch: WatchHandle,
    ) -> Self {
        Self {
            config,
            events,
            catalog,
            store,
            watch,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Consider creating (or extending) a watch rule after a completed
    /// turn. `force` corresponds to an explicit monitoring request and
    /// skips the repeat-query window.
    pub async fn after_turn(
        &self,
        conversation: &ConversationId,
        classification: &Classification,
        force: bool,
    ) -> Result<Option<RuleId>> {
        if !force && !self.enabled() {
            return Ok(None);
        }

        // A network scan counts as a query of every device it observed.
        if classification.intent == IntentKind::NetworkScan {
            self.note_scan_results();
            return Ok(None);
        }

        let tag = classification.intent.as_str();
        if !force && !self.intent_whitelist().iter().any(|w| w == tag) {
            return Ok(None);
        }

        if self.is_excluded(&classification.raw_text) {
            debug!("auto-watch skipped: exclusion pattern matched");
            return Ok(None);
        }

        let Some((target, service)) = self.resolve_target(classification) else {
            return Ok(None);
        };

        let window = Duration::from_millis(
            self.config
                .get_u64("watch.auto.time_window_ms")
                .unwrap_or(DEFAULT_AUTO_WATCH_WINDOW_MS),
        );
        let prior = self.note_query(&target, service.as_ref(), window);
        if !force && !prior {
            return Ok(None);
        }

        let duration = ChronoDuration::milliseconds(
            self.config
                .get_u64("watch.default_duration_ms")
                .unwrap_or(DEFAULT_WATCH_DURATION_MS) as i64,
        );
        let now = Utc::now();
        let expires_at = now + duration;

        // Idempotence: a second query extends the existing rule.
        if let Some(existing) = self.store.active_rules_for_target(&target)?.into_iter().next() {
            self.watch.extend(&existing.id, expires_at).await?;
            info!(rule_id = %existing.id, target = %target, "auto-watch extended");
            return Ok(Some(existing.id));
        }

        let tuning_type = service
            .as_ref()
            .map(|s| tuning_type_of(s.service_type))
            .unwrap_or("device");
        let rule = WatchRuleRecord {
            id: RuleId::new(),
            conversation_id: conversation.clone(),
            target: target.clone(),
            intent: probe_intent_for(classification.intent, service.as_ref()).to_string(),
            started_at: now,
            expires_at,
            poll_interval_ms: poll_interval_for(&self.config, tuning_type),
            change_threshold: threshold_for(&self.config, tuning_type),
            active: true,
            last_polled: None,
            last_change: None,
        };
        let id = rule.id.clone();
        self.watch.add_rule(rule).await?;
        info!(rule_id = %id, target = %target, "auto-watch created");
        Ok(Some(id))
    }

    /// Consume change events and inject assistant messages into the
    /// originating conversations.
    pub fn spawn_change_listener(
        self: Arc<Self>,
        mut change_rx: mpsc::Receiver<ChangeEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = change_rx.recv().await {
                if let Err(e) = self.inject_change_message(&event).await {
                    warn!(rule_id = %event.rule_id, "change message injection failed: {e}");
                }
            }
            debug!("change listener stopped");
        })
    }

    async fn inject_change_message(&self, event: &ChangeEvent) -> Result<()> {
        let mut text = event.summary.clone();
        if !event.preview.is_empty() {
            text.push('\n');
            text.push_str(event.preview.trim());
        }

        let actions = vec![
            QuickAction {
                id: format!("watch-stop:{}", event.rule_id),
                label: "Zatrzymaj monitor".to_string(),
                kind: QuickActionKind::Execute {
                    query: format!("stop monitor {}", event.rule_id),
                },
            },
            QuickAction {
                id: format!("watch-logs:{}", event.rule_id),
                label: "Pokaż logi".to_string(),
                kind: QuickActionKind::Execute {
                    query: format!("logi monitora {}", event.rule_id),
                },
            },
            QuickAction {
                id: format!("watch-open:{}", event.target),
                label: "Otwórz".to_string(),
                kind: QuickActionKind::Execute {
                    query: format!("pokaż {}", event.target),
                },
            },
        ];

        let message = self
            .store
            .append_message(NewMessage {
                conversation_id: event.conversation_id.clone(),
                role: Role::Assistant,
                text,
                blocks: serde_json::Value::Array(Vec::new()),
                metadata: serde_json::json!({
                    "watch": true,
                    "rule_id": event.rule_id.as_str(),
                    "change_record_id": event.change_record_id,
                    "change_type": event.change_type,
                    "change_score": event.change_score,
                    "quick_actions": actions,
                }),
            })
            .await?;

        self.events.append(
            EventKind::MessageAdded,
            serde_json::json!({
                "message_id": message.id,
                "conversation_id": message.conversation_id.as_str(),
                "role": "assistant",
                "watch": true,
            }),
        );
        Ok(())
    }

    fn enabled(&self) -> bool {
        self.config.get_bool("watch.auto.enabled").unwrap_or(true)
    }

    /// Intent tags whose target queries may arm a watch. Stored as a
    /// comma-separated list under `watch.auto.intent_whitelist`.
    fn intent_whitelist(&self) -> Vec<String> {
        match self.config.get_str("watch.auto.intent_whitelist") {
            Some(raw) => split_csv(&raw),
            None => default_auto_intent_whitelist(),
        }
    }

    /// Query fragments that never create watches, word-prefix matched so
    /// "test" and "testy" trigger but "latest" does not. Stored as a
    /// comma-separated list under `watch.auto.exclusions`.
    fn is_excluded(&self, text: &str) -> bool {
        let patterns = match self.config.get_str("watch.auto.exclusions") {
            Some(raw) => split_csv(&raw),
            None => default_auto_exclusions(),
        };
        let lower = text.to_lowercase();
        lower
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
            .any(|w| patterns.iter().any(|e| w.starts_with(e.as_str())))
    }

    /// Record one query of `target` (and its parent device); returns
    /// whether a prior query fell inside the window.
    fn note_query(&self, target: &TargetRef, service: Option<&Service>, window: Duration) -> bool {
        let now = Instant::now();
        let mut recent = self.recent.lock().unwrap();
        let mut keys = vec![target.to_string()];
        if let Some(service) = service {
            keys.push(TargetRef::device(service.device_id.clone()).to_string());
        }
        let prior = keys
            .iter()
            .filter_map(|k| recent.get(k))
            .any(|t| now.duration_since(*t) <= window);
        recent.insert(target.to_string(), now);
        prior
    }

    /// Mark every freshly observed device as recently queried, so that a
    /// follow-up question about one of them arms a watch.
    fn note_scan_results(&self) {
        let now = Instant::now();
        let cutoff = Utc::now() - ChronoDuration::minutes(SCAN_FRESHNESS_MIN);
        let devices = match self.catalog.list_devices() {
            Ok(d) => d,
            Err(e) => {
                warn!("scan bookkeeping failed: {e}");
                return;
            }
        };
        let mut recent = self.recent.lock().unwrap();
        for device in devices.iter().filter(|d| d.last_seen >= cutoff) {
            recent.insert(TargetRef::device(device.id.clone()).to_string(), now);
        }
        debug!(count = devices.len(), "scan results noted for auto-watch");
    }

    /// Map the utterance to a concrete catalog target. Prefers a service
    /// matching the intent; falls back to the device itself.
    fn resolve_target(
        &self,
        classification: &Classification,
    ) -> Option<(TargetRef, Option<Service>)> {
        let ip = classification.entities.ip.as_deref()?;
        let device = self.catalog.get_device_by_ip(ip).ok()??;
        let services = self.catalog.list_services(&device.id).ok()?;

        let preference: &[ServiceType] = match classification.intent {
            IntentKind::CameraDescribe
            | IntentKind::CameraOnvif
            | IntentKind::CameraSnapshot
            | IntentKind::CameraHealth => {
                &[ServiceType::Onvif, ServiceType::Rtsp, ServiceType::Http]
            }
            IntentKind::MqttRead => &[ServiceType::Mqtt],
            IntentKind::RestRead => &[ServiceType::Api, ServiceType::Http, ServiceType::Https],
            _ => &[],
        };

        for wanted in preference {
            if let Some(service) = services.iter().find(|s| s.service_type == *wanted) {
                return Some((TargetRef::service(service.id.clone()), Some(service.clone())));
            }
        }
        Some((TargetRef::device(device.id), None))
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Service-type name used for interval/threshold tuning keys.
fn tuning_type_of(service_type: ServiceType) -> &'static str {
    match service_type {
        ServiceType::Onvif => "camera",
        other => other.as_str(),
    }
}

/// The intent a watch poll will dispatch with. Originating intents that
/// are routable stay as-is; otherwise pick by service type.
fn probe_intent_for(intent: IntentKind, service: Option<&Service>) -> &'static str {
    match intent {
        IntentKind::MonitorStart => match service.map(|s| s.service_type) {
            Some(ServiceType::Onvif) | Some(ServiceType::Rtsp) => IntentKind::CameraDescribe.as_str(),
            Some(ServiceType::Mqtt) => IntentKind::MqttRead.as_str(),
            Some(ServiceType::Api) => IntentKind::RestRead.as_str(),
            Some(ServiceType::Http) | Some(ServiceType::Https) => IntentKind::BrowseUrl.as_str(),
            _ => IntentKind::NetworkPing.as_str(),
        },
        other => other.as_str(),
    }
}
