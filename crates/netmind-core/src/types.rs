use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a conversation (UUIDv7 — time-sortable for easier
/// log correlation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a watch rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId(pub String);

impl RuleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RuleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What a watch rule or snapshot points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Device,
    Service,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Device => write!(f, "device"),
            TargetKind::Service => write!(f, "service"),
        }
    }
}

impl std::str::FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "device" => Ok(TargetKind::Device),
            "service" => Ok(TargetKind::Service),
            other => Err(format!("unknown target kind: {other}")),
        }
    }
}

/// Reference to a device or service row in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    pub kind: TargetKind,
    pub id: String,
}

impl TargetRef {
    pub fn device(id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Device,
            id: id.into(),
        }
    }

    pub fn service(id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Service,
            id: id.into(),
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Process-wide policy restricting which plugins may run and how far
/// probes may reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Local,
    Network,
    Internet,
    Vpn,
    Tor,
    Remote,
}

/// Plugin ids with raw-socket / LAN reach. Excluded outside local-ish scopes.
const LAN_PROBES: &[&str] = &[
    "ping",
    "port-scan",
    "arp",
    "net-scan",
    "onvif-camera",
    "rtsp-capture",
    "mqtt",
    "ssh",
];

/// Plugin ids that only speak outbound web protocols.
const WEB: &[&str] = &["http-fetch", "rest", "websocket", "sse", "graphql"];

/// Always-available plugin ids (no network exposure of their own).
const CORE: &[&str] = &["chat", "voice", "logs", "monitor", "marketplace"];

impl Scope {
    /// The allow-set of plugin ids published by this scope.
    ///
    /// Local and Network expose the full probe surface; Internet and Tor
    /// drop everything that touches the LAN; Remote keeps ssh for jump
    /// hosts; Vpn behaves like a remote LAN.
    pub fn allow_set(&self) -> Vec<&'static str> {
        let mut set: Vec<&'static str> = Vec::new();
        match self {
            Scope::Local | Scope::Network | Scope::Vpn => {
                set.extend_from_slice(LAN_PROBES);
                set.extend_from_slice(WEB);
            }
            Scope::Internet => set.extend_from_slice(WEB),
            Scope::Tor => set.extend_from_slice(&["http-fetch"]),
            Scope::Remote => {
                set.push("ssh");
                set.extend_from_slice(WEB);
            }
        }
        set.extend_from_slice(CORE);
        set
    }

    pub fn allows(&self, plugin_id: &str) -> bool {
        self.allow_set().contains(&plugin_id)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Local => "local",
            Scope::Network => "network",
            Scope::Internet => "internet",
            Scope::Vpn => "vpn",
            Scope::Tor => "tor",
            Scope::Remote => "remote",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local" => Ok(Scope::Local),
            "network" => Ok(Scope::Network),
            "internet" => Ok(Scope::Internet),
            "vpn" => Ok(Scope::Vpn),
            "tor" => Ok(Scope::Tor),
            "remote" => Ok(Scope::Remote),
            other => Err(format!("unknown scope: {other}")),
        }
    }
}

/// Closed set of routable intent tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntentKind {
    #[serde(rename = "network:ping")]
    NetworkPing,
    #[serde(rename = "network:port-scan")]
    NetworkPortScan,
    #[serde(rename = "network:arp")]
    NetworkArp,
    #[serde(rename = "network:scan")]
    NetworkScan,
    #[serde(rename = "camera:onvif")]
    CameraOnvif,
    #[serde(rename = "camera:snapshot")]
    CameraSnapshot,
    #[serde(rename = "camera:ptz")]
    CameraPtz,
    #[serde(rename = "camera:health")]
    CameraHealth,
    #[serde(rename = "camera:describe")]
    CameraDescribe,
    #[serde(rename = "browse:url")]
    BrowseUrl,
    #[serde(rename = "browse:search")]
    BrowseSearch,
    #[serde(rename = "ssh:exec")]
    SshExec,
    #[serde(rename = "ssh:text2cmd")]
    SshText2Cmd,
    #[serde(rename = "mqtt:read")]
    MqttRead,
    #[serde(rename = "mqtt:send")]
    MqttSend,
    #[serde(rename = "rest:read")]
    RestRead,
    #[serde(rename = "rest:send")]
    RestSend,
    #[serde(rename = "ws:open")]
    WsOpen,
    #[serde(rename = "ws:send")]
    WsSend,
    #[serde(rename = "sse:open")]
    SseOpen,
    #[serde(rename = "graphql:query")]
    GraphqlQuery,
    #[serde(rename = "monitor:start")]
    MonitorStart,
    #[serde(rename = "monitor:stop")]
    MonitorStop,
    #[serde(rename = "monitor:list")]
    MonitorList,
    #[serde(rename = "monitor:logs")]
    MonitorLogs,
    #[serde(rename = "monitor:config")]
    MonitorConfig,
    #[serde(rename = "marketplace:browse")]
    MarketplaceBrowse,
    #[serde(rename = "marketplace:install")]
    MarketplaceInstall,
    #[serde(rename = "marketplace:uninstall")]
    MarketplaceUninstall,
    #[serde(rename = "marketplace:search")]
    MarketplaceSearch,
    #[serde(rename = "voice:command")]
    VoiceCommand,
    #[serde(rename = "logs:download")]
    LogsDownload,
    #[serde(rename = "logs:clear")]
    LogsClear,
    #[serde(rename = "logs:level")]
    LogsLevel,
    #[serde(rename = "chat:ask")]
    ChatAsk,
    #[serde(rename = "chat:fallback")]
    ChatFallback,
}

impl IntentKind {
    /// Every tag in declaration order.
    pub const ALL: &'static [IntentKind] = &[
        IntentKind::NetworkPing,
        IntentKind::NetworkPortScan,
        IntentKind::NetworkArp,
        IntentKind::NetworkScan,
        IntentKind::CameraOnvif,
        IntentKind::CameraSnapshot,
        IntentKind::CameraPtz,
        IntentKind::CameraHealth,
        IntentKind::CameraDescribe,
        IntentKind::BrowseUrl,
        IntentKind::BrowseSearch,
        IntentKind::SshExec,
        IntentKind::SshText2Cmd,
        IntentKind::MqttRead,
        IntentKind::MqttSend,
        IntentKind::RestRead,
        IntentKind::RestSend,
        IntentKind::WsOpen,
        IntentKind::WsSend,
        IntentKind::SseOpen,
        IntentKind::GraphqlQuery,
        IntentKind::MonitorStart,
        IntentKind::MonitorStop,
        IntentKind::MonitorList,
        IntentKind::MonitorLogs,
        IntentKind::MonitorConfig,
        IntentKind::MarketplaceBrowse,
        IntentKind::MarketplaceInstall,
        IntentKind::MarketplaceUninstall,
        IntentKind::MarketplaceSearch,
        IntentKind::VoiceCommand,
        IntentKind::LogsDownload,
        IntentKind::LogsClear,
        IntentKind::LogsLevel,
        IntentKind::ChatAsk,
        IntentKind::ChatFallback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::NetworkPing => "network:ping",
            IntentKind::NetworkPortScan => "network:port-scan",
            IntentKind::NetworkArp => "network:arp",
            IntentKind::NetworkScan => "network:scan",
            IntentKind::CameraOnvif => "camera:onvif",
            IntentKind::CameraSnapshot => "camera:snapshot",
            IntentKind::CameraPtz => "camera:ptz",
            IntentKind::CameraHealth => "camera:health",
            IntentKind::CameraDescribe => "camera:describe",
            IntentKind::BrowseUrl => "browse:url",
            IntentKind::BrowseSearch => "browse:search",
            IntentKind::SshExec => "ssh:exec",
            IntentKind::SshText2Cmd => "ssh:text2cmd",
            IntentKind::MqttRead => "mqtt:read",
            IntentKind::MqttSend => "mqtt:send",
            IntentKind::RestRead => "rest:read",
            IntentKind::RestSend => "rest:send",
            IntentKind::WsOpen => "ws:open",
            IntentKind::WsSend => "ws:send",
            IntentKind::SseOpen => "sse:open",
            IntentKind::GraphqlQuery => "graphql:query",
            IntentKind::MonitorStart => "monitor:start",
            IntentKind::MonitorStop => "monitor:stop",
            IntentKind::MonitorList => "monitor:list",
            IntentKind::MonitorLogs => "monitor:logs",
            IntentKind::MonitorConfig => "monitor:config",
            IntentKind::MarketplaceBrowse => "marketplace:browse",
            IntentKind::MarketplaceInstall => "marketplace:install",
            IntentKind::MarketplaceUninstall => "marketplace:uninstall",
            IntentKind::MarketplaceSearch => "marketplace:search",
            IntentKind::VoiceCommand => "voice:command",
            IntentKind::LogsDownload => "logs:download",
            IntentKind::LogsClear => "logs:clear",
            IntentKind::LogsLevel => "logs:level",
            IntentKind::ChatAsk => "chat:ask",
            IntentKind::ChatFallback => "chat:fallback",
        }
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for IntentKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        IntentKind::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown intent tag: {s}"))
    }
}

/// Entities extracted from an utterance.
///
/// All fields are optional; extractors fill what they find and leave the
/// rest untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entities {
    pub ip: Option<String>,
    /// `/24` prefix derived from `ip`, e.g. `192.168.1.0/24`.
    pub subnet: Option<String>,
    pub mac: Option<String>,
    pub url: Option<String>,
    /// Search query text, when the url token was `?`-prefixed.
    pub search: Option<String>,
    pub port: Option<u16>,
    pub duration_ms: Option<u64>,
    pub threshold: Option<f64>,
    pub percent: Option<f64>,
    /// Free text following a recognized verb ("pokaż <rest>").
    pub text: Option<String>,
}

impl Entities {
    /// Fill any unset field from `other`. Used to merge classifier output
    /// under already-extracted concrete entities.
    pub fn merge_missing(&mut self, other: Entities) {
        macro_rules! take {
            ($field:ident) => {
                if self.$field.is_none() {
                    self.$field = other.$field;
                }
            };
        }
        take!(ip);
        take!(subnet);
        take!(mac);
        take!(url);
        take!(search);
        take!(port);
        take!(duration_ms);
        take!(threshold);
        take!(percent);
        take!(text);
    }

    /// The most specific entity identifying the utterance target, used for
    /// dedup keys and watch-target resolution.
    pub fn primary(&self) -> Option<&str> {
        self.ip
            .as_deref()
            .or(self.url.as_deref())
            .or(self.mac.as_deref())
            .or(self.subnet.as_deref())
            .or(self.text.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.primary().is_none()
            && self.port.is_none()
            && self.duration_ms.is_none()
            && self.threshold.is_none()
            && self.percent.is_none()
            && self.search.is_none()
    }
}

/// Where an utterance came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UtteranceSource {
    #[default]
    Text,
    Voice,
}

/// A raw user utterance as handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub text: String,
    pub conversation_id: ConversationId,
    pub source: UtteranceSource,
    pub received_at: DateTime<Utc>,
    /// Whether the privileged runtime (raw sockets, subprocesses) is
    /// available to plugins for this utterance.
    pub runtime_privileged: bool,
}

impl Utterance {
    pub fn text_input(conversation_id: ConversationId, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            conversation_id,
            source: UtteranceSource::Text,
            received_at: Utc::now(),
            runtime_privileged: true,
        }
    }
}
