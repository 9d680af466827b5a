use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::settings::ConfigStore;
use crate::types::Scope;

// Engine-wide defaults. Overridable per rule or via settings keys.
pub const DEFAULT_WATCH_DURATION_MS: u64 = 3_600_000; // 1 hour
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_CHANGE_THRESHOLD: f64 = 0.2;
pub const DEFAULT_MAX_CONCURRENT_WATCHES: u64 = 50;
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 300_000; // 5 minutes
pub const DEFAULT_AUTO_WATCH_WINDOW_MS: u64 = 3_600_000; // 1 hour
pub const DEFAULT_DISPATCH_BUDGET_MS: u64 = 30_000;
pub const DEFAULT_SNAPSHOT_RETENTION_DAYS: i64 = 30;
pub const DEFAULT_SNAPSHOTS_KEPT_PER_TARGET: usize = 20;

/// Top-level bootstrap config (netmind.toml + NETMIND_* env overrides).
///
/// This seeds the runtime [`ConfigStore`]; live settings changes go
/// through that store, not through this struct.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetmindConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scope: ScopeConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    pub llm: Option<LlmConfig>,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Path of the runtime settings backing file.
    #[serde(default = "default_settings_path")]
    pub settings_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            settings_path: default_settings_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScopeConfig {
    #[serde(default)]
    pub active: Scope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_watch_duration")]
    pub default_duration_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub default_poll_interval_ms: u64,
    #[serde(default = "default_threshold")]
    pub default_threshold: f64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_ms: u64,
    #[serde(default)]
    pub auto: AutoWatchConfig,
    /// Poll interval overrides per service type, e.g. `camera = 30000`.
    #[serde(default)]
    pub service_interval: HashMap<String, u64>,
    /// Change-threshold overrides per service type, e.g. `camera = 0.10`.
    #[serde(default)]
    pub service_threshold: HashMap<String, f64>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            default_duration_ms: DEFAULT_WATCH_DURATION_MS,
            default_poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            default_threshold: DEFAULT_CHANGE_THRESHOLD,
            max_concurrent: DEFAULT_MAX_CONCURRENT_WATCHES,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            auto: AutoWatchConfig::default(),
            service_interval: HashMap::new(),
            service_threshold: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoWatchConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_auto_window")]
    pub time_window_ms: u64,
    /// Intent tags whose target queries may arm a watch. Every default
    /// is a member of the closed intent set.
    #[serde(default = "default_auto_intent_whitelist")]
    pub intent_whitelist: Vec<String>,
    /// Query fragments that never arm a watch (word-prefix match).
    #[serde(default = "default_auto_exclusions")]
    pub exclusions: Vec<String>,
}

impl Default for AutoWatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            time_window_ms: DEFAULT_AUTO_WATCH_WINDOW_MS,
            intent_whitelist: default_auto_intent_whitelist(),
            exclusions: default_auto_exclusions(),
        }
    }
}

pub fn default_auto_intent_whitelist() -> Vec<String> {
    ["camera:describe", "camera:health", "camera:onvif", "mqtt:read", "rest:read"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn default_auto_exclusions() -> Vec<String> {
    ["demo", "test"].iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// Consult the LLM classifier when rule confidence is low.
    #[serde(default)]
    pub use_classifier: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AudioConfig {
    #[serde(default)]
    pub mic_enabled: bool,
    #[serde(default)]
    pub stt_enabled: bool,
    #[serde(default)]
    pub tts_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_watch_duration() -> u64 {
    DEFAULT_WATCH_DURATION_MS
}
fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_threshold() -> f64 {
    DEFAULT_CHANGE_THRESHOLD
}
fn default_max_concurrent() -> u64 {
    DEFAULT_MAX_CONCURRENT_WATCHES
}
fn default_cleanup_interval() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_MS
}
fn default_auto_window() -> u64 {
    DEFAULT_AUTO_WATCH_WINDOW_MS
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.netmind/netmind.db")
}
fn default_settings_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.netmind/settings.json")
}
fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.netmind/netmind.toml")
}

impl NetmindConfig {
    /// Load config from a TOML file with NETMIND_* env var overrides
    /// (double underscore separates nesting: NETMIND_DATABASE__PATH).
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: NetmindConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("NETMIND_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Seed the runtime settings store with this bootstrap state.
    ///
    /// Only keys not already present are written, so explicit runtime
    /// settings survive a restart with a different TOML.
    pub fn seed_settings(&self, store: &ConfigStore) {
        let seed = |key: &str, value: crate::settings::SettingValue| {
            if store.get(key).is_none() {
                if let Err(e) = store.set(key, value) {
                    tracing::warn!(key, "failed to seed setting: {e}");
                }
            }
        };

        seed("scope.active", self.scope.active.as_str().into());
        seed("watch.default_duration_ms", self.watch.default_duration_ms.into());
        seed(
            "watch.default_poll_interval_ms",
            self.watch.default_poll_interval_ms.into(),
        );
        seed("watch.default_threshold", self.watch.default_threshold.into());
        seed("watch.max_concurrent", self.watch.max_concurrent.into());
        seed("watch.cleanup_interval_ms", self.watch.cleanup_interval_ms.into());
        seed("watch.auto.enabled", self.watch.auto.enabled.into());
        seed("watch.auto.time_window_ms", self.watch.auto.time_window_ms.into());
        seed(
            "watch.auto.intent_whitelist",
            self.watch.auto.intent_whitelist.join(",").into(),
        );
        seed(
            "watch.auto.exclusions",
            self.watch.auto.exclusions.join(",").into(),
        );
        for (service, interval) in &self.watch.service_interval {
            seed(&format!("watch.service_interval.{service}"), (*interval).into());
        }
        for (service, threshold) in &self.watch.service_threshold {
            seed(&format!("watch.service_threshold.{service}"), (*threshold).into());
        }
        if let Some(llm) = &self.llm {
            seed("llm.api_key", llm.api_key.as_str().into());
            seed("llm.model", llm.model.as_str().into());
            seed("llm.use_classifier", llm.use_classifier.into());
        }
        seed("mic_enabled", self.audio.mic_enabled.into());
        seed("stt_enabled", self.audio.stt_enabled.into());
        seed("tts_enabled", self.audio.tts_enabled.into());
        seed("log.level", self.log.level.as_str().into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = NetmindConfig::default();
        assert_eq!(cfg.scope.active, Scope::Local);
        assert_eq!(cfg.watch.default_duration_ms, 3_600_000);
        assert_eq!(cfg.watch.max_concurrent, 50);
        assert!(cfg.llm.is_none());
    }

    #[test]
    fn auto_watch_whitelist_defaults_are_routable_tags() {
        for tag in default_auto_intent_whitelist() {
            assert!(
                tag.parse::<crate::types::IntentKind>().is_ok(),
                "whitelist default '{tag}' is not a closed-set intent"
            );
        }
    }

    #[test]
    fn seed_does_not_clobber_existing_settings() {
        let store = ConfigStore::in_memory(None);
        store.set("scope.active", "internet").unwrap();

        NetmindConfig::default().seed_settings(&store);
        assert_eq!(store.get_str("scope.active"), Some("internet".into()));
        // but missing keys are filled in
        assert_eq!(store.get_u64("watch.max_concurrent"), Some(50));
    }
}
