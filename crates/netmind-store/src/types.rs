use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use netmind_core::types::{ConversationId, RuleId, TargetKind, TargetRef};

/// Service protocol type, as probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Http,
    Https,
    Rtsp,
    Mqtt,
    Ssh,
    Api,
    Onvif,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Http => "http",
            ServiceType::Https => "https",
            ServiceType::Rtsp => "rtsp",
            ServiceType::Mqtt => "mqtt",
            ServiceType::Ssh => "ssh",
            ServiceType::Api => "api",
            ServiceType::Onvif => "onvif",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "http" => Ok(ServiceType::Http),
            "https" => Ok(ServiceType::Https),
            "rtsp" => Ok(ServiceType::Rtsp),
            "mqtt" => Ok(ServiceType::Mqtt),
            "ssh" => Ok(ServiceType::Ssh),
            "api" => Ok(ServiceType::Api),
            "onvif" => Ok(ServiceType::Onvif),
            other => Err(format!("unknown service type: {other}")),
        }
    }
}

/// Last observed availability of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Online => "online",
            ServiceStatus::Offline => "offline",
            ServiceStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "online" => Ok(ServiceStatus::Online),
            "offline" => Ok(ServiceStatus::Offline),
            "unknown" => Ok(ServiceStatus::Unknown),
            other => Err(format!("unknown service status: {other}")),
        }
    }
}

/// A device observed on the network. Never deleted automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub ip: String,
    pub hostname: Option<String>,
    pub mac: Option<String>,
    pub vendor: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw facts from one discovery pass, used to create or refresh a device.
#[derive(Debug, Clone, Default)]
pub struct DeviceObservation {
    pub ip: String,
    pub hostname: Option<String>,
    pub mac: Option<String>,
    pub vendor: Option<String>,
}

/// Stable device id derived from ip + mac when available. The id is
/// assigned at first discovery and kept on later observations even if a
/// mac shows up afterwards (the ip row is the anchor).
pub fn derive_device_id(ip: &str, mac: Option<&str>) -> String {
    match mac {
        Some(mac) => format!("dev-{}-{}", ip, mac.to_lowercase().replace(':', "")),
        None => format!("dev-{ip}"),
    }
}

/// A probed service on a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub device_id: String,
    pub service_type: ServiceType,
    pub port: u16,
    pub path: Option<String>,
    pub status: ServiceStatus,
    pub last_checked: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

impl Service {
    pub fn target_ref(&self) -> TargetRef {
        TargetRef::service(self.id.clone())
    }
}

/// One canonicalized observation of a target's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSnapshot {
    pub id: String,
    pub device_id: Option<String>,
    pub service_id: Option<String>,
    pub content: Vec<u8>,
    pub content_type: String,
    /// Stable hash of the canonical form (hex sha-256).
    pub hash: String,
    pub size: u64,
    pub captured_at: DateTime<Utc>,
}

impl ContentSnapshot {
    pub fn target_ref(&self) -> TargetRef {
        match (&self.service_id, &self.device_id) {
            (Some(s), _) => TargetRef::service(s.clone()),
            (None, Some(d)) => TargetRef::device(d.clone()),
            (None, None) => unreachable!("snapshot without a target"),
        }
    }
}

/// Input for [`crate::DeviceCatalog::insert_snapshot`].
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub target: TargetRef,
    pub content: Vec<u8>,
    pub content_type: String,
    pub hash: String,
    pub captured_at: DateTime<Utc>,
}

/// The kind of delta a change record captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Content,
    Status,
    Metadata,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Content => "content",
            ChangeType::Status => "status",
            ChangeType::Metadata => "metadata",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "content" => Ok(ChangeType::Content),
            "status" => Ok(ChangeType::Status),
            "metadata" => Ok(ChangeType::Metadata),
            other => Err(format!("unknown change type: {other}")),
        }
    }
}

/// Durable link between two consecutive snapshots of the same target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: String,
    pub device_id: Option<String>,
    pub service_id: Option<String>,
    pub previous_snapshot_id: Option<String>,
    pub current_snapshot_id: String,
    pub change_type: ChangeType,
    pub change_score: f64,
    pub detected_at: DateTime<Utc>,
    pub summary: String,
}

/// Input for [`crate::DeviceCatalog::insert_change`].
#[derive(Debug, Clone)]
pub struct NewChange {
    pub target: TargetRef,
    pub previous_snapshot_id: Option<String>,
    pub current_snapshot_id: String,
    pub change_type: ChangeType,
    pub change_score: f64,
    pub summary: String,
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A conversation row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// A persisted conversation message. Content blocks and metadata are
/// stored as JSON so the store stays agnostic of the plugin vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub blocks: serde_json::Value,
    pub metadata: serde_json::Value,
}

/// Input for appending a message; id and timestamp are assigned by the
/// single writer so ordering stays deterministic.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub role: Role,
    pub text: String,
    pub blocks: serde_json::Value,
    pub metadata: serde_json::Value,
}

impl NewMessage {
    pub fn plain(conversation_id: ConversationId, role: Role, text: impl Into<String>) -> Self {
        Self {
            conversation_id,
            role,
            text: text.into(),
            blocks: serde_json::Value::Array(Vec::new()),
            metadata: serde_json::json!({}),
        }
    }
}

/// Fields of a message that may change after the fact (loading → final).
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub text: Option<String>,
    pub blocks: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

/// A persisted watch rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchRuleRecord {
    pub id: RuleId,
    pub conversation_id: ConversationId,
    pub target: TargetRef,
    pub intent: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub poll_interval_ms: u64,
    pub change_threshold: f64,
    pub active: bool,
    pub last_polled: Option<DateTime<Utc>>,
    pub last_change: Option<DateTime<Utc>>,
}

impl WatchRuleRecord {
    pub fn target_kind(&self) -> TargetKind {
        self.target.kind
    }
}
