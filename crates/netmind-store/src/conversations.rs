//! Conversation store: conversations, messages, watch rules.
//!
//! All writes go through a single-writer queue task that owns its own
//! connection, which keeps message ordering deterministic (timestamps
//! within a conversation never decrease). Reads run concurrently on a
//! separate connection.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use netmind_core::types::{ConversationId, RuleId, TargetRef};

use crate::error::{Result, StoreError};
use crate::types::*;

/// A queued write, executed in submission order by the writer task.
type WriteJob = Box<dyn FnOnce(&Connection) + Send>;

const WRITE_QUEUE_DEPTH: usize = 256;

pub struct ConversationStore {
    read_conn: Mutex<Connection>,
    write_tx: mpsc::Sender<WriteJob>,
}

impl ConversationStore {
    /// Start the writer task. `write_conn` is owned by the queue task;
    /// `read_conn` serves concurrent reads.
    pub fn spawn(write_conn: Connection, read_conn: Connection) -> Self {
        let (write_tx, mut rx) = mpsc::channel::<WriteJob>(WRITE_QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job(&write_conn);
            }
            debug!("conversation writer task stopped");
        });
        Self {
            read_conn: Mutex::new(read_conn),
            write_tx,
        }
    }

    async fn enqueue<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: WriteJob = Box::new(move |conn| {
            let _ = tx.send(f(conn));
        });
        self.write_tx
            .send(job)
            .await
            .map_err(|_| StoreError::WriterGone("write queue closed".into()))?;
        rx.await
            .map_err(|_| StoreError::WriterGone("writer dropped reply".into()))?
    }

    // --- conversations -----------------------------------------------------

    /// Create the conversation row if absent and bump `last_activity_at`.
    pub async fn touch_conversation(&self, id: &ConversationId) -> Result<Conversation> {
        let id = id.clone();
        self.enqueue(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO conversations (id, started_at, last_activity_at)
                 VALUES (?1, ?2, ?2)
                 ON CONFLICT(id) DO UPDATE SET last_activity_at = ?2",
                rusqlite::params![id.as_str(), now],
            )?;
            conn.query_row(
                "SELECT id, started_at, last_activity_at, metadata
                 FROM conversations WHERE id = ?1",
                [id.as_str()],
                row_to_conversation,
            )
            .map_err(Into::into)
        })
        .await
    }

    // --- messages ----------------------------------------------------------

    /// Append a message. The writer assigns the id and a timestamp that
    /// never decreases within the conversation, and bumps the
    /// conversation's activity clock.
    pub async fn append_message(&self, new: NewMessage) -> Result<StoredMessage> {
        self.enqueue(move |conn| {
            let now_dt = Utc::now();
            let conv = new.conversation_id.as_str();
            conn.execute(
                "INSERT INTO conversations (id, started_at, last_activity_at)
                 VALUES (?1, ?2, ?2)
                 ON CONFLICT(id) DO UPDATE SET last_activity_at = ?2",
                rusqlite::params![conv, now_dt.to_rfc3339()],
            )?;

            // Clamp to the newest existing timestamp so ordering within the
            // conversation never goes backwards, even across clock skips.
            let last: Option<String> = conn
                .query_row(
                    "SELECT MAX(timestamp) FROM messages WHERE conversation_id = ?1",
                    [conv],
                    |row| row.get(0),
                )
                .ok()
                .flatten();
            let timestamp = match last.and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }) {
                Some(prev) if prev > now_dt => prev,
                _ => now_dt,
            };

            let id = format!("msg-{}", Uuid::new_v4());
            conn.execute(
                "INSERT INTO messages
                    (id, conversation_id, role, text, timestamp, blocks, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    id,
                    conv,
                    new.role.as_str(),
                    new.text,
                    timestamp.to_rfc3339(),
                    new.blocks.to_string(),
                    new.metadata.to_string()
                ],
            )?;

            Ok(StoredMessage {
                id,
                conversation_id: new.conversation_id,
                role: new.role,
                text: new.text,
                timestamp,
                blocks: new.blocks,
                metadata: new.metadata,
            })
        })
        .await
    }

    /// Apply a patch (loading → final transitions). `None` fields keep the
    /// stored value.
    pub async fn update_message(&self, id: &str, patch: MessagePatch) -> Result<StoredMessage> {
        let id = id.to_string();
        self.enqueue(move |conn| {
            let n = conn.execute(
                "UPDATE messages SET
                    text     = COALESCE(?1, text),
                    blocks   = COALESCE(?2, blocks),
                    metadata = COALESCE(?3, metadata)
                 WHERE id = ?4",
                rusqlite::params![
                    patch.text,
                    patch.blocks.map(|b| b.to_string()),
                    patch.metadata.map(|m| m.to_string()),
                    id
                ],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("message {id}")));
            }
            conn.query_row(
                "SELECT id, conversation_id, role, text, timestamp, blocks, metadata
                 FROM messages WHERE id = ?1",
                [&id],
                row_to_message,
            )
            .map_err(Into::into)
        })
        .await
    }

    pub fn get_message(&self, id: &str) -> Result<Option<StoredMessage>> {
        let conn = self.read_conn.lock().unwrap();
        match conn.query_row(
            "SELECT id, conversation_id, role, text, timestamp, blocks, metadata
             FROM messages WHERE id = ?1",
            [id],
            row_to_message,
        ) {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Messages for a conversation, oldest first.
    pub fn messages(&self, conversation: &ConversationId, limit: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.read_conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, text, timestamp, blocks, metadata
             FROM messages WHERE conversation_id = ?1
             ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![conversation.as_str(), limit as i64],
            row_to_message,
        )?;
        let mut msgs: Vec<_> = rows.filter_map(|r| r.ok()).collect();
        msgs.reverse();
        Ok(msgs)
    }

    // --- watch rules -------------------------------------------------------

    pub async fn insert_rule(&self, rule: WatchRuleRecord) -> Result<()> {
        self.enqueue(move |conn| {
            conn.execute(
                "INSERT INTO watch_rules
                    (id, conversation_id, target_id, target_type, intent, started_at,
                     expires_at, poll_interval_ms, change_threshold, active,
                     last_polled, last_change)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    rule.id.as_str(),
                    rule.conversation_id.as_str(),
                    rule.target.id,
                    rule.target.kind.to_string(),
                    rule.intent,
                    rule.started_at.to_rfc3339(),
                    rule.expires_at.to_rfc3339(),
                    rule.poll_interval_ms as i64,
                    rule.change_threshold,
                    rule.active as i64,
                    rule.last_polled.map(|t| t.to_rfc3339()),
                    rule.last_change.map(|t| t.to_rfc3339()),
                ],
            )?;
            info!(rule_id = %rule.id, target = %rule.target, "watch rule persisted");
            Ok(())
        })
        .await
    }

    pub fn get_rule(&self, id: &RuleId) -> Result<Option<WatchRuleRecord>> {
        let conn = self.read_conn.lock().unwrap();
        match conn.query_row(
            &format!("{RULE_SELECT} WHERE id = ?1"),
            [id.as_str()],
            row_to_rule,
        ) {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Rules, optionally only those still active.
    pub fn list_rules(&self, active_only: bool) -> Result<Vec<WatchRuleRecord>> {
        let conn = self.read_conn.lock().unwrap();
        let sql = if active_only {
            format!("{RULE_SELECT} WHERE active = 1 ORDER BY started_at")
        } else {
            format!("{RULE_SELECT} ORDER BY started_at")
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_rule)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Active rules for one target (auto-watch extension check).
    pub fn active_rules_for_target(&self, target: &TargetRef) -> Result<Vec<WatchRuleRecord>> {
        let conn = self.read_conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{RULE_SELECT} WHERE active = 1 AND target_id = ?1 AND target_type = ?2"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![target.id, target.kind.to_string()],
            row_to_rule,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Deactivate a rule (stop or expiry). The row is kept so change logs
    /// stay reachable after the rule is gone from listings.
    pub async fn set_rule_active(&self, id: &RuleId, active: bool) -> Result<()> {
        let id = id.clone();
        self.enqueue(move |conn| {
            let n = conn.execute(
                "UPDATE watch_rules SET active = ?1 WHERE id = ?2",
                rusqlite::params![active as i64, id.as_str()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("watch rule {id}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn extend_rule(&self, id: &RuleId, expires_at: DateTime<Utc>) -> Result<()> {
        let id = id.clone();
        self.enqueue(move |conn| {
            let n = conn.execute(
                "UPDATE watch_rules SET expires_at = ?1, active = 1 WHERE id = ?2",
                rusqlite::params![expires_at.to_rfc3339(), id.as_str()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("watch rule {id}")));
            }
            debug!(rule_id = %id, "watch rule expiry extended");
            Ok(())
        })
        .await
    }

    pub async fn mark_rule_polled(
        &self,
        id: &RuleId,
        polled_at: DateTime<Utc>,
        changed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let id = id.clone();
        self.enqueue(move |conn| {
            let n = conn.execute(
                "UPDATE watch_rules SET
                    last_polled = ?1,
                    last_change = COALESCE(?2, last_change)
                 WHERE id = ?3",
                rusqlite::params![
                    polled_at.to_rfc3339(),
                    changed_at.map(|t| t.to_rfc3339()),
                    id.as_str()
                ],
            )?;
            if n == 0 {
                warn!(rule_id = %id, "poll bookkeeping for unknown rule");
            }
            Ok(())
        })
        .await
    }
}

const RULE_SELECT: &str = "SELECT id, conversation_id, target_id, target_type, intent, \
     started_at, expires_at, poll_interval_ms, change_threshold, active, \
     last_polled, last_change FROM watch_rules";

fn ts(s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id: String = row.get(0)?;
    let metadata: String = row.get(3)?;
    Ok(Conversation {
        id: ConversationId(id),
        started_at: ts(row.get(1)?)?,
        last_activity_at: ts(row.get(2)?)?,
        metadata: serde_json::from_str(&metadata)
            .unwrap_or(serde_json::Value::Object(Default::default())),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let conv: String = row.get(1)?;
    let role: String = row.get(2)?;
    let blocks: String = row.get(5)?;
    let metadata: String = row.get(6)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: ConversationId(conv),
        role: role.parse().unwrap_or(Role::System),
        text: row.get(3)?,
        timestamp: ts(row.get(4)?)?,
        blocks: serde_json::from_str(&blocks).unwrap_or(serde_json::Value::Array(Vec::new())),
        metadata: serde_json::from_str(&metadata)
            .unwrap_or(serde_json::Value::Object(Default::default())),
    })
}

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<WatchRuleRecord> {
    let id: String = row.get(0)?;
    let conv: String = row.get(1)?;
    let target_id: String = row.get(2)?;
    let target_type: String = row.get(3)?;
    let last_polled: Option<String> = row.get(10)?;
    let last_change: Option<String> = row.get(11)?;
    Ok(WatchRuleRecord {
        id: RuleId(id),
        conversation_id: ConversationId(conv),
        target: TargetRef {
            kind: target_type
                .parse()
                .unwrap_or(netmind_core::types::TargetKind::Service),
            id: target_id,
        },
        intent: row.get(4)?,
        started_at: ts(row.get(5)?)?,
        expires_at: ts(row.get(6)?)?,
        poll_interval_ms: row.get::<_, i64>(7)? as u64,
        change_threshold: row.get(8)?,
        active: row.get::<_, i64>(9)? != 0,
        last_polled: last_polled.map(ts).transpose()?,
        last_change: last_change.map(ts).transpose()?,
    })
}
