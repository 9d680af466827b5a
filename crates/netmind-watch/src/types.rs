use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use netmind_core::settings::ConfigStore;
use netmind_core::types::{ConversationId, RuleId, TargetRef};
use netmind_store::types::ChangeType;

/// Lifecycle of a rule inside the scheduler. `Stopped` and `Expired` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    Pending,
    Scheduled,
    Polling,
    Stopped,
    Expired,
}

/// Emitted when a poll detects a significant change. Delivered both to
/// the event log and over the manager's change channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub rule_id: RuleId,
    pub conversation_id: ConversationId,
    pub target: TargetRef,
    pub change_type: ChangeType,
    pub change_score: f64,
    pub summary: String,
    pub change_record_id: String,
    /// First bytes of the new content, for message previews.
    pub preview: String,
    pub detected_at: DateTime<Utc>,
}

/// Built-in poll cadence per service type (milliseconds).
pub fn default_poll_interval_ms(service_type: &str) -> u64 {
    match service_type {
        "camera" | "onvif" => 30_000,
        "http" | "https" => 60_000,
        "rtsp" => 15_000,
        "mqtt" => 120_000,
        "api" => 30_000,
        "device" => 60_000,
        _ => 60_000,
    }
}

/// Built-in change threshold per service type.
pub fn default_threshold(service_type: &str) -> f64 {
    match service_type {
        "camera" | "onvif" => 0.10,
        "http" | "https" => 0.20,
        "rtsp" => 0.15,
        "mqtt" => 0.30,
        _ => 0.20,
    }
}

/// Poll interval for a service type, honoring config overrides
/// (`watch.service_interval.<type>`).
pub fn poll_interval_for(config: &ConfigStore, service_type: &str) -> u64 {
    config
        .get_u64(&format!("watch.service_interval.{service_type}"))
        .unwrap_or_else(|| default_poll_interval_ms(service_type))
}

/// Change threshold for a service type, honoring config overrides
/// (`watch.service_threshold.<type>`).
pub fn threshold_for(config: &ConfigStore, service_type: &str) -> f64 {
    config
        .get_f64(&format!("watch.service_threshold.{service_type}"))
        .unwrap_or_else(|| default_threshold(service_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_tuned_defaults() {
        assert_eq!(default_poll_interval_ms("camera"), 30_000);
        assert_eq!(default_poll_interval_ms("rtsp"), 15_000);
        assert_eq!(default_poll_interval_ms("mqtt"), 120_000);
        assert_eq!(default_threshold("camera"), 0.10);
        assert_eq!(default_threshold("http"), 0.20);
    }

    #[test]
    fn config_override_wins() {
        let config = ConfigStore::in_memory(None);
        config.set("watch.service_interval.camera", 5_000u64).unwrap();
        assert_eq!(poll_interval_for(&config, "camera"), 5_000);
        assert_eq!(poll_interval_for(&config, "rtsp"), 15_000);
    }
}
