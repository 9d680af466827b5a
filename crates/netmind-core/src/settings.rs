//! Runtime typed key/value settings store.
//!
//! Hierarchical string keys (`llm.api_key`, `watch.default_poll_interval_ms`,
//! `scope.active`) map to typed values. Writes persist to a JSON backing
//! file, publish a `settings_changed` event with the full diff, and only
//! then become observable to getters. Reads never fail.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::events::{EventKind, EventLog};

/// A typed setting value. Serialized as plain JSON (self-describing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Num(f64),
    Str(String),
    Map(serde_json::Map<String, serde_json::Value>),
}

impl SettingValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            SettingValue::Num(n) if *n >= 0.0 => Some(*n as u64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        SettingValue::Bool(v)
    }
}

impl From<f64> for SettingValue {
    fn from(v: f64) -> Self {
        SettingValue::Num(v)
    }
}

impl From<u64> for SettingValue {
    fn from(v: u64) -> Self {
        SettingValue::Num(v as f64)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        SettingValue::Str(v.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(v: String) -> Self {
        SettingValue::Str(v)
    }
}

/// One mutated key with its before/after values.
#[derive(Debug, Clone, Serialize)]
pub struct SettingChange {
    pub key: String,
    pub old: Option<SettingValue>,
    pub new: Option<SettingValue>,
}

/// Full diff of a single mutation, handed to subscribers and attached to
/// the `settings_changed` event payload.
#[derive(Debug, Clone, Serialize)]
pub struct SettingsDiff {
    pub changes: Vec<SettingChange>,
}

type SettingsCallback = Arc<dyn Fn(&SettingsDiff) + Send + Sync>;

struct SettingsSubscriber {
    id: u64,
    prefix: String,
    callback: SettingsCallback,
}

/// Typed configuration store with scoped get/set and change subscribers.
pub struct ConfigStore {
    values: RwLock<HashMap<String, SettingValue>>,
    subscribers: RwLock<Vec<SettingsSubscriber>>,
    next_sub_id: Mutex<u64>,
    /// Serializes mutations so persist + notify + swap stay ordered.
    write_lock: Mutex<()>,
    path: Option<PathBuf>,
    events: Option<Arc<EventLog>>,
}

impl ConfigStore {
    /// In-memory store with no backing file (tests, ephemeral sessions).
    pub fn in_memory(events: Option<Arc<EventLog>>) -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            next_sub_id: Mutex::new(1),
            write_lock: Mutex::new(()),
            path: None,
            events,
        }
    }

    /// Open a store backed by `path`, loading existing values if the file
    /// exists. A missing or unreadable file starts empty (reads never fail).
    pub fn open(path: impl AsRef<Path>, events: Option<Arc<EventLog>>) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, SettingValue>>(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), "settings file unreadable, starting empty: {e}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            values: RwLock::new(values),
            subscribers: RwLock::new(Vec::new()),
            next_sub_id: Mutex::new(1),
            write_lock: Mutex::new(()),
            path: Some(path),
            events,
        }
    }

    /// Look up a key. Absent keys return `None`; reads never fail.
    pub fn get(&self, key: &str) -> Option<SettingValue> {
        self.values.read().unwrap().get(key).cloned()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.as_u64())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    /// Write a key. The change event is published before the new value is
    /// observable to getters; on backing-file failure the prior value is
    /// kept and `ConfigIo` is returned.
    pub fn set(&self, key: &str, value: impl Into<SettingValue>) -> Result<()> {
        let value = value.into();
        let _guard = self.write_lock.lock().unwrap();

        let old = self.values.read().unwrap().get(key).cloned();
        if old.as_ref() == Some(&value) {
            return Ok(()); // no-op write, no event
        }

        // Persist the candidate state first: a failed write must leave the
        // observable store untouched.
        if let Some(path) = &self.path {
            let mut candidate = self.values.read().unwrap().clone();
            candidate.insert(key.to_string(), value.clone());
            persist(path, &candidate)?;
        }

        let diff = SettingsDiff {
            changes: vec![SettingChange {
                key: key.to_string(),
                old,
                new: Some(value.clone()),
            }],
        };

        if let Some(events) = &self.events {
            let payload = serde_json::to_value(&diff).unwrap_or(serde_json::Value::Null);
            events.append(EventKind::SettingsChanged, payload);
        }
        self.notify(&diff);

        self.values
            .write()
            .unwrap()
            .insert(key.to_string(), value);
        debug!(key, "setting updated");
        Ok(())
    }

    /// Subscribe to changes on keys starting with `prefix` (empty prefix
    /// matches everything).
    pub fn subscribe(&self, prefix: &str, callback: SettingsCallback) -> u64 {
        let mut next = self.next_sub_id.lock().unwrap();
        let id = *next;
        *next += 1;
        self.subscribers.write().unwrap().push(SettingsSubscriber {
            id,
            prefix: prefix.to_string(),
            callback,
        });
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().unwrap().retain(|s| s.id != id);
    }

    /// Snapshot of every key currently set (diagnostics, CLI dump).
    pub fn snapshot(&self) -> HashMap<String, SettingValue> {
        self.values.read().unwrap().clone()
    }

    fn notify(&self, diff: &SettingsDiff) {
        let subs = self.subscribers.read().unwrap();
        for sub in subs.iter() {
            let relevant = diff
                .changes
                .iter()
                .any(|c| c.key.starts_with(&sub.prefix));
            if relevant {
                (sub.callback)(diff);
            }
        }
    }
}

/// Atomic write: temp file in the same directory, then rename over.
fn persist(path: &Path, values: &HashMap<String, SettingValue>) -> Result<()> {
    let io_err = |source: std::io::Error| CoreError::ConfigIo {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let bytes = serde_json::to_vec_pretty(values)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}
