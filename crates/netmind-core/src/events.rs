//! Append-only in-process event log.
//!
//! Every domain event flows through one [`EventLog`]: message lifecycle,
//! scans, watch activity, settings changes. Subscribers are invoked
//! synchronously in the appender's context and see events in append
//! order; components that need to append in reaction to an event must
//! hand the event off to their own channel instead of calling back into
//! the log from the callback.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Closed set of domain event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageAdded,
    MessageUpdated,
    BrowseRequested,
    ContentFetched,
    SummaryGenerated,
    ErrorOccurred,
    SettingsChanged,
    ScanStarted,
    ScanCompleted,
    ChangeDetected,
    WatchCreated,
    WatchExpired,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MessageAdded => "message_added",
            EventKind::MessageUpdated => "message_updated",
            EventKind::BrowseRequested => "browse_requested",
            EventKind::ContentFetched => "content_fetched",
            EventKind::SummaryGenerated => "summary_generated",
            EventKind::ErrorOccurred => "error_occurred",
            EventKind::SettingsChanged => "settings_changed",
            EventKind::ScanStarted => "scan_started",
            EventKind::ScanCompleted => "scan_completed",
            EventKind::ChangeDetected => "change_detected",
            EventKind::WatchCreated => "watch_created",
            EventKind::WatchExpired => "watch_expired",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single appended event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Monotonically increasing, assigned at append.
    pub seq: u64,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Filter for [`EventLog::filter`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kind: Option<EventKind>,
    /// Only events with `seq > since`.
    pub since: Option<u64>,
}

type EventCallback = Arc<dyn Fn(&DomainEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    callback: EventCallback,
}

struct LogInner {
    events: Vec<DomainEvent>,
    next_seq: u64,
    subscribers: Vec<Subscriber>,
    next_sub_id: u64,
}

/// Strictly append-only event sequence with synchronous fan-out.
///
/// Retention is unbounded in memory for the session; durable message
/// history lives in the conversation store, not here.
pub struct EventLog {
    inner: Mutex<LogInner>,
}

/// Handle returned by [`EventLog::subscribe_all`]; pass back to
/// [`EventLog::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

impl EventLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LogInner {
                events: Vec::new(),
                next_seq: 1,
                subscribers: Vec::new(),
                next_sub_id: 1,
            }),
        }
    }

    /// Append an event, assign its sequence number, and deliver it to all
    /// subscribers before returning.
    ///
    /// Callbacks run under the log lock: they must be fast, must not
    /// panic, and must not append (use a channel hand-off to react).
    pub fn append(&self, kind: EventKind, payload: serde_json::Value) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let event = DomainEvent {
            seq,
            kind,
            payload,
            timestamp: Utc::now(),
        };
        trace!(seq, kind = %kind, "event appended");
        inner.events.push(event.clone());
        for sub in &inner.subscribers {
            (sub.callback)(&event);
        }
        seq
    }

    /// Return events matching the filter, in append order.
    pub fn filter(&self, filter: &EventFilter) -> Vec<DomainEvent> {
        let inner = self.inner.lock().unwrap();
        inner
            .events
            .iter()
            .filter(|e| filter.kind.is_none_or(|k| e.kind == k))
            .filter(|e| filter.since.is_none_or(|s| e.seq > s))
            .cloned()
            .collect()
    }

    /// Register a callback invoked for every future event.
    pub fn subscribe_all(&self, callback: EventCallback) -> SubscriptionId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_sub_id;
        inner.next_sub_id += 1;
        inner.subscribers.push(Subscriber { id, callback });
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|s| s.id != id.0);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence number of the last appended event (0 when empty).
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().unwrap().next_seq - 1
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
