//! The watch scheduler.
//!
//! A single engine task owns the rule table; external callers talk to it
//! through [`WatchHandle`] commands. Polls run concurrently up to
//! `watch.max_concurrent`, with at most one in flight per rule, and
//! their outcomes flow back to the engine task for diffing and
//! persistence so the snapshot → change-record → event chain stays
//! ordered per rule.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use netmind_core::config::{
    DEFAULT_CLEANUP_INTERVAL_MS, DEFAULT_MAX_CONCURRENT_WATCHES, DEFAULT_SNAPSHOTS_KEPT_PER_TARGET,
    DEFAULT_SNAPSHOT_RETENTION_DAYS,
};
use netmind_core::events::{EventKind, EventLog};
use netmind_core::settings::ConfigStore;
use netmind_core::types::{RuleId, TargetKind, TargetRef};
use netmind_plugin::ExecutionError;
use netmind_store::types::{ChangeRecord, ChangeType, NewChange, NewSnapshot, ServiceStatus, WatchRuleRecord};
use netmind_store::{ConversationStore, DeviceCatalog};

use crate::detector::ChangeDetector;
use crate::error::{Result, WatchError};
use crate::probe::{Observation, WatchProbe};
use crate::types::{ChangeEvent, RuleState};

/// Preview length attached to change events, in characters.
const PREVIEW_CHARS: usize = 200;
/// Minimum spacing of error events per rule.
const ERROR_EVENT_SPACING: Duration = Duration::from_secs(600);
/// Engine tick cadence.
const TICK: Duration = Duration::from_secs(1);

pub struct WatchDeps {
    pub config: Arc<ConfigStore>,
    pub events: Arc<EventLog>,
    pub catalog: Arc<DeviceCatalog>,
    pub store: Arc<ConversationStore>,
    pub probe: Arc<dyn WatchProbe>,
}

enum Command {
    Add(WatchRuleRecord, oneshot::Sender<Result<()>>),
    Stop(RuleId, oneshot::Sender<Result<()>>),
    Extend(RuleId, DateTime<Utc>, oneshot::Sender<Result<()>>),
    List(oneshot::Sender<Vec<WatchRuleRecord>>),
}

/// Shared handle for rule management while the engine loop runs.
#[derive(Clone)]
pub struct WatchHandle {
    cmd_tx: mpsc::Sender<Command>,
    store: Arc<ConversationStore>,
    catalog: Arc<DeviceCatalog>,
    events: Arc<EventLog>,
}

impl WatchHandle {
    /// Persist and activate a rule. The engine starts polling it on its
    /// next tick.
    pub async fn add_rule(&self, rule: WatchRuleRecord) -> Result<()> {
        self.store.insert_rule(rule.clone()).await?;
        self.events.append(
            EventKind::WatchCreated,
            serde_json::json!({
                "rule_id": rule.id.as_str(),
                "conversation_id": rule.conversation_id.as_str(),
                "target": rule.target.to_string(),
                "poll_interval_ms": rule.poll_interval_ms,
                "expires_at": rule.expires_at.to_rfc3339(),
            }),
        );
        self.send(|tx| Command::Add(rule, tx)).await
    }

    /// Stop a rule. Its change history stays queryable via [`Self::logs`].
    pub async fn stop(&self, id: &RuleId) -> Result<()> {
        self.send(|tx| Command::Stop(id.clone(), tx)).await
    }

    /// Push a rule's expiry forward (auto-watch re-query).
    pub async fn extend(&self, id: &RuleId, expires_at: DateTime<Utc>) -> Result<()> {
        self.store.extend_rule(id, expires_at).await?;
        self.send(|tx| Command::Extend(id.clone(), expires_at, tx))
            .await
    }

    /// Active rules, as the engine sees them.
    pub async fn list(&self) -> Result<Vec<WatchRuleRecord>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::List(tx))
            .await
            .map_err(|_| WatchError::EngineGone)?;
        rx.await.map_err(|_| WatchError::EngineGone)
    }

    /// Change records observed under a rule, newest first. Works for
    /// stopped rules too.
    pub fn logs(&self, id: &RuleId) -> Result<Vec<ChangeRecord>> {
        let rule = self
            .store
            .get_rule(id)?
            .ok_or_else(|| WatchError::RuleNotFound(id.to_string()))?;
        Ok(self.catalog.changes_for_target(&rule.target, 100)?)
    }

    async fn send(&self, make: impl FnOnce(oneshot::Sender<Result<()>>) -> Command) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| WatchError::EngineGone)?;
        rx.await.map_err(|_| WatchError::EngineGone)?
    }
}

struct ActiveRule {
    record: WatchRuleRecord,
    state: RuleState,
    next_poll_at: Instant,
}

struct PollOutcome {
    rule_id: RuleId,
    result: std::result::Result<Observation, ExecutionError>,
}

pub struct WatchManager;

impl WatchManager {
    /// Spawn the engine task. Returns the management handle and the
    /// change-event stream consumed by the conversation integrator.
    pub fn start(
        deps: WatchDeps,
        shutdown: watch::Receiver<bool>,
    ) -> (WatchHandle, mpsc::Receiver<ChangeEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (change_tx, change_rx) = mpsc::channel(64);
        let (poll_tx, poll_rx) = mpsc::channel(64);

        let handle = WatchHandle {
            cmd_tx,
            store: Arc::clone(&deps.store),
            catalog: Arc::clone(&deps.catalog),
            events: Arc::clone(&deps.events),
        };

        let engine = Engine {
            deps,
            rules: HashMap::new(),
            in_flight: HashSet::new(),
            last_error_event: HashMap::new(),
            detector: ChangeDetector::new(),
            cmd_rx,
            poll_tx,
            poll_rx,
            change_tx,
            cancel: CancellationToken::new(),
        };
        tokio::spawn(engine.run(shutdown));

        (handle, change_rx)
    }
}

struct Engine {
    deps: WatchDeps,
    rules: HashMap<RuleId, ActiveRule>,
    in_flight: HashSet<RuleId>,
    last_error_event: HashMap<RuleId, Instant>,
    detector: ChangeDetector,
    cmd_rx: mpsc::Receiver<Command>,
    poll_tx: mpsc::Sender<PollOutcome>,
    poll_rx: mpsc::Receiver<PollOutcome>,
    change_tx: mpsc::Sender<ChangeEvent>,
    /// Cancels every in-flight poll at shutdown.
    cancel: CancellationToken,
}

impl Engine {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("watch engine started");
        self.restore_persisted_rules().await;

        let mut tick = interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_cleanup = Instant::now() + self.cleanup_interval();

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.on_tick().await;
                    if Instant::now() >= next_cleanup {
                        self.cleanup_sweep().await;
                        next_cleanup = Instant::now() + self.cleanup_interval();
                    }
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    self.handle_command(cmd).await;
                }
                Some(outcome) = self.poll_rx.recv() => {
                    self.handle_outcome(outcome).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("watch engine shutting down");
                        self.cancel.cancel();
                        break;
                    }
                }
            }
        }
    }

    /// Reload active rules on startup; rules that expired while the
    /// process was down are deactivated immediately.
    async fn restore_persisted_rules(&mut self) {
        let persisted = match self.deps.store.list_rules(true) {
            Ok(rules) => rules,
            Err(e) => {
                error!("failed to load persisted watch rules: {e}");
                return;
            }
        };
        let now = Utc::now();
        for rule in persisted {
            if now >= rule.expires_at {
                self.expire_rule(rule).await;
            } else {
                debug!(rule_id = %rule.id, "watch rule restored");
                self.rules.insert(
                    rule.id.clone(),
                    ActiveRule {
                        record: rule,
                        state: RuleState::Scheduled,
                        next_poll_at: Instant::now(),
                    },
                );
            }
        }
        if !self.rules.is_empty() {
            info!(count = self.rules.len(), "watch rules restored");
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Add(record, reply) => {
                let id = record.id.clone();
                self.rules.insert(
                    id.clone(),
                    ActiveRule {
                        record,
                        state: RuleState::Scheduled,
                        next_poll_at: Instant::now(),
                    },
                );
                debug!(rule_id = %id, "watch rule activated");
                let _ = reply.send(Ok(()));
            }
            Command::Stop(id, reply) => {
                let result = match self.rules.remove(&id) {
                    Some(_) => self
                        .deps
                        .store
                        .set_rule_active(&id, false)
                        .await
                        .map_err(WatchError::Store),
                    None => Err(WatchError::RuleNotFound(id.to_string())),
                };
                if result.is_ok() {
                    info!(rule_id = %id, "watch rule stopped");
                }
                let _ = reply.send(result);
            }
            Command::Extend(id, expires_at, reply) => {
                let result = match self.rules.get_mut(&id) {
                    Some(active) => {
                        active.record.expires_at = expires_at;
                        debug!(rule_id = %id, "watch rule extended");
                        Ok(())
                    }
                    None => Err(WatchError::RuleNotFound(id.to_string())),
                };
                let _ = reply.send(result);
            }
            Command::List(reply) => {
                let mut rules: Vec<WatchRuleRecord> =
                    self.rules.values().map(|a| a.record.clone()).collect();
                rules.sort_by(|a, b| a.started_at.cmp(&b.started_at));
                let _ = reply.send(rules);
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let now_utc = Utc::now();

        // expiry pass
        let expired: Vec<RuleId> = self
            .rules
            .iter()
            .filter(|(_, a)| now_utc >= a.record.expires_at)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(active) = self.rules.remove(&id) {
                self.expire_rule(active.record).await;
            }
        }

        // poll pass, bounded by max_concurrent
        let max_concurrent = self
            .deps
            .config
            .get_u64("watch.max_concurrent")
            .unwrap_or(DEFAULT_MAX_CONCURRENT_WATCHES) as usize;

        let due: Vec<RuleId> = self
            .rules
            .iter()
            .filter(|(id, a)| {
                a.state == RuleState::Scheduled
                    && a.next_poll_at <= now
                    && !self.in_flight.contains(*id)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in due {
            if self.in_flight.len() >= max_concurrent {
                // excess rules wait for their next tick
                break;
            }
            self.spawn_poll(&id);
        }
    }

    fn spawn_poll(&mut self, id: &RuleId) {
        let Some(active) = self.rules.get_mut(id) else {
            return;
        };
        active.state = RuleState::Polling;
        self.in_flight.insert(id.clone());

        let record = active.record.clone();
        let probe = Arc::clone(&self.deps.probe);
        let poll_tx = self.poll_tx.clone();
        let cancel = self.cancel.child_token();
        let rule_id = id.clone();

        tokio::spawn(async move {
            let result = probe.observe(&record, &cancel).await;
            if poll_tx.send(PollOutcome { rule_id, result }).await.is_err() {
                warn!("watch engine gone, dropping poll outcome");
            }
        });
    }

    async fn handle_outcome(&mut self, outcome: PollOutcome) {
        self.in_flight.remove(&outcome.rule_id);
        let Some(active) = self.rules.get_mut(&outcome.rule_id) else {
            // rule stopped or expired while the poll was in flight
            return;
        };
        active.state = RuleState::Scheduled;
        active.next_poll_at =
            Instant::now() + Duration::from_millis(active.record.poll_interval_ms);

        let record = active.record.clone();
        let polled_at = Utc::now();

        match outcome.result {
            Err(e) => {
                self.rate_limited_error(&record, &format!("poll failed: {e}"));
                self.mark_polled(&record.id, polled_at, None).await;
            }
            Ok(obs) if obs.needs_config => {
                // credential-missing poll: status goes unknown, no
                // snapshot is taken, the rule stays active
                if record.target.kind == TargetKind::Service {
                    if let Err(e) = self
                        .deps
                        .catalog
                        .set_service_status(&record.target.id, ServiceStatus::Unknown)
                    {
                        warn!(rule_id = %record.id, "status bookkeeping failed: {e}");
                    }
                }
                self.rate_limited_error(
                    &record,
                    "poll needs configuration (credentials missing); rule stays active",
                );
                self.mark_polled(&record.id, polled_at, None).await;
            }
            Ok(obs) => {
                let changed_at = self.process_observation(&record, obs, polled_at).await;
                if let Some(active) = self.rules.get_mut(&record.id) {
                    active.record.last_change = changed_at.or(active.record.last_change);
                }
                self.mark_polled(&record.id, polled_at, changed_at).await;
            }
        }
        if let Some(active) = self.rules.get_mut(&outcome.rule_id) {
            active.record.last_polled = Some(polled_at);
        }
    }

    /// Diff the observation against the prior snapshot; persist and emit
    /// when the change is significant. Returns the change detection time
    /// when an event was emitted.
    async fn process_observation(
        &mut self,
        record: &WatchRuleRecord,
        obs: Observation,
        polled_at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        // status transition first: it overrides content scoring
        let transition = match record.target.kind {
            TargetKind::Service => {
                match self
                    .deps
                    .catalog
                    .set_service_status(&record.target.id, obs.status)
                {
                    Ok(prev) => self.detector.score_status(prev, obs.status),
                    Err(e) => {
                        warn!(rule_id = %record.id, "status bookkeeping failed: {e}");
                        None
                    }
                }
            }
            TargetKind::Device => None,
        };

        let hash = self.detector.hash(&obs.content, &obs.content_type);
        let prev_snap = match self.deps.catalog.latest_snapshot(&record.target) {
            Ok(s) => s,
            Err(e) => {
                error!(rule_id = %record.id, "snapshot lookup failed: {e}");
                return None;
            }
        };

        let (score, change_type) = match &prev_snap {
            None => {
                // first observation: baseline snapshot, change only on a
                // status transition
                match transition {
                    Some(t) => t,
                    None => {
                        self.persist_snapshot(record, &obs, &hash, polled_at);
                        return None;
                    }
                }
            }
            Some(prev) => {
                if prev.hash == hash && transition.is_none() {
                    return None;
                }
                match transition {
                    Some(t) => t,
                    None => self
                        .detector
                        .score(&prev.content, &obs.content, &obs.content_type),
                }
            }
        };

        // threshold ties use >=
        let significant = score >= record.change_threshold || change_type == ChangeType::Status;
        if !significant {
            debug!(
                rule_id = %record.id,
                score,
                threshold = record.change_threshold,
                "change below threshold, skipped"
            );
            return None;
        }

        let snapshot = self.persist_snapshot(record, &obs, &hash, polled_at)?;
        let summary = build_summary(&record.target, change_type, score, obs.status);
        let change = match self.deps.catalog.insert_change(NewChange {
            target: record.target.clone(),
            previous_snapshot_id: prev_snap.map(|s| s.id),
            current_snapshot_id: snapshot.id.clone(),
            change_type,
            change_score: score,
            summary: summary.clone(),
        }) {
            Ok(c) => c,
            Err(e) => {
                error!(rule_id = %record.id, "change record insert failed: {e}");
                return None;
            }
        };

        let event = ChangeEvent {
            rule_id: record.id.clone(),
            conversation_id: record.conversation_id.clone(),
            target: record.target.clone(),
            change_type,
            change_score: score,
            summary,
            change_record_id: change.id.clone(),
            preview: preview_of(&obs.content),
            detected_at: change.detected_at,
        };
        self.deps.events.append(
            EventKind::ChangeDetected,
            serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
        );
        // try_send never stalls the engine; a full consumer loses the
        // notification but the change record is already durable
        if self.change_tx.try_send(event).is_err() {
            warn!(rule_id = %record.id, "change channel full or closed, notification dropped");
        }
        Some(change.detected_at)
    }

    fn persist_snapshot(
        &self,
        record: &WatchRuleRecord,
        obs: &Observation,
        hash: &str,
        captured_at: DateTime<Utc>,
    ) -> Option<netmind_store::types::ContentSnapshot> {
        let snapshot = self
            .deps
            .catalog
            .insert_snapshot(NewSnapshot {
                target: record.target.clone(),
                content: obs.content.clone(),
                content_type: obs.content_type.clone(),
                hash: hash.to_string(),
                captured_at,
            })
            .map_err(|e| error!(rule_id = %record.id, "snapshot insert failed: {e}"))
            .ok()?;
        let _ = self
            .deps
            .catalog
            .trim_snapshots(&record.target, DEFAULT_SNAPSHOTS_KEPT_PER_TARGET);
        Some(snapshot)
    }

    async fn mark_polled(
        &self,
        id: &RuleId,
        polled_at: DateTime<Utc>,
        changed_at: Option<DateTime<Utc>>,
    ) {
        if let Err(e) = self
            .deps
            .store
            .mark_rule_polled(id, polled_at, changed_at)
            .await
        {
            warn!(rule_id = %id, "poll bookkeeping failed: {e}");
        }
    }

    /// Emit at most one `error_occurred` per rule per ten minutes.
    fn rate_limited_error(&mut self, record: &WatchRuleRecord, message: &str) {
        let now = Instant::now();
        let recent = self
            .last_error_event
            .get(&record.id)
            .is_some_and(|t| now.duration_since(*t) < ERROR_EVENT_SPACING);
        if recent {
            debug!(rule_id = %record.id, "watch error suppressed (rate limit): {message}");
            return;
        }
        self.last_error_event.insert(record.id.clone(), now);
        warn!(rule_id = %record.id, "{message}");
        self.deps.events.append(
            EventKind::ErrorOccurred,
            serde_json::json!({
                "source": "watch",
                "rule_id": record.id.as_str(),
                "target": record.target.to_string(),
                "message": message,
            }),
        );
    }

    async fn expire_rule(&mut self, rule: WatchRuleRecord) {
        info!(rule_id = %rule.id, "watch rule expired");
        if let Err(e) = self.deps.store.set_rule_active(&rule.id, false).await {
            warn!(rule_id = %rule.id, "expiry persistence failed: {e}");
        }
        self.deps.events.append(
            EventKind::WatchExpired,
            serde_json::json!({
                "rule_id": rule.id.as_str(),
                "conversation_id": rule.conversation_id.as_str(),
                "target": rule.target.to_string(),
            }),
        );
    }

    async fn cleanup_sweep(&mut self) {
        let retention = DEFAULT_SNAPSHOT_RETENTION_DAYS;
        match self.deps.catalog.prune_snapshots_older_than(retention) {
            Ok(_) => {}
            Err(e) => warn!("snapshot prune failed: {e}"),
        }
        // drop stale error-rate entries for rules that no longer exist
        self.last_error_event
            .retain(|id, _| self.rules.contains_key(id));
        debug!(active_rules = self.rules.len(), "cleanup sweep complete");
    }

    fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(
            self.deps
                .config
                .get_u64("watch.cleanup_interval_ms")
                .unwrap_or(DEFAULT_CLEANUP_INTERVAL_MS),
        )
    }
}

fn build_summary(
    target: &TargetRef,
    change_type: ChangeType,
    score: f64,
    status: ServiceStatus,
) -> String {
    match change_type {
        ChangeType::Status => format!("{target} is now {status}"),
        ChangeType::Content => {
            format!("content of {target} changed by {:.0}%", score * 100.0)
        }
        ChangeType::Metadata => format!("metadata of {target} changed"),
    }
}

fn preview_of(content: &[u8]) -> String {
    let text = String::from_utf8_lossy(content);
    text.chars().take(PREVIEW_CHARS).collect()
}
