//! Persistent mutation queue and local-to-server id mappings.
//!
//! Rows are replayed in insertion order (`seq`). A row leaves the table only
//! when it has been synced or explicitly discarded; rows that exhaust their
//! retries, or that the server rejects outright, move to the dead-letter
//! state (`status = 'failed'`) where the UI can inspect, retry or discard
//! them.

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::entities::EntityKind;
use crate::error::{SyncError, SyncResult};
use crate::local_id::{collect_local_ids, is_local_id};

pub const DEFAULT_RETRY_DELAY_MS: i64 = 5_000;
pub const MAX_RETRY_DELAY_MS: i64 = 300_000;
pub const DEFAULT_MAX_RETRIES: u32 = 5;

const ITEM_COLUMNS: &str = "seq, id, operation, entity_type, target_id, local_id, payload, status,
     retry_count, max_retries, retry_delay_ms, next_retry_at, last_error, created_at";

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("Unknown queue operation: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    /// Dead-lettered: no longer replayed until retried by hand.
    Failed,
}

impl ItemStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Failed => "failed",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(format!("Unknown queue status: {other}")),
        }
    }
}

/// One queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub seq: i64,
    pub id: String,
    #[serde(rename = "type")]
    pub op: Operation,
    pub entity: EntityKind,
    /// Record targeted by an update/delete.
    pub target_id: Option<String>,
    pub data: Value,
    /// Placeholder id handed to the UI; only set on creates.
    pub local_id: Option<String>,
    /// Enqueue time, unix milliseconds.
    pub timestamp: i64,
    pub retries: u32,
    pub max_retries: u32,
    pub retry_delay_ms: i64,
    pub status: ItemStatus,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now_ms)
    }

    /// Identity of the record this item mutates: the local id for a create,
    /// the target id otherwise, translated through `mappings` so a record
    /// keeps one key before and after its create syncs. Items sharing a key
    /// must apply in order.
    pub fn entity_key(&self, mappings: &HashMap<String, String>) -> Option<String> {
        let id = match self.op {
            Operation::Create => self.local_id.as_deref(),
            Operation::Update | Operation::Delete => self.target_id.as_deref(),
        }?;
        let id = mappings.get(id).map(String::as_str).unwrap_or(id);
        Some(format!("{}:{id}", self.entity))
    }

    /// Local ids this item depends on, i.e. that must be mapped to server
    /// ids before it can be dispatched. A create's own local id is excluded.
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps = Vec::new();
        if let Some(target) = self.target_id.as_deref().filter(|t| is_local_id(t)) {
            deps.push(target.to_string());
        }
        for id in collect_local_ids(&self.data) {
            if self.local_id.as_deref() != Some(id.as_str()) && !deps.contains(&id) {
                deps.push(id);
            }
        }
        deps
    }

    pub fn references(&self, local_id: &str) -> bool {
        self.dependencies().iter().any(|d| d == local_id)
    }
}

/// A mutation about to be queued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueItem {
    pub op: Operation,
    pub entity: EntityKind,
    pub target_id: Option<String>,
    pub local_id: Option<String>,
    pub data: Value,
}

impl NewQueueItem {
    pub fn create(entity: EntityKind, local_id: impl Into<String>, data: Value) -> Self {
        Self {
            op: Operation::Create,
            entity,
            target_id: None,
            local_id: Some(local_id.into()),
            data,
        }
    }

    pub fn update(entity: EntityKind, target_id: impl Into<String>, data: Value) -> Self {
        Self {
            op: Operation::Update,
            entity,
            target_id: Some(target_id.into()),
            local_id: None,
            data,
        }
    }

    pub fn delete(entity: EntityKind, target_id: impl Into<String>) -> Self {
        Self {
            op: Operation::Delete,
            entity,
            target_id: Some(target_id.into()),
            local_id: None,
            data: Value::Null,
        }
    }

    fn check_invariants(&self) -> SyncResult<()> {
        match self.op {
            Operation::Create => {
                let Some(local_id) = self.local_id.as_deref() else {
                    return Err(SyncError::InvalidQueueItem(
                        "create requires a local id".into(),
                    ));
                };
                if !is_local_id(local_id) {
                    return Err(SyncError::InvalidQueueItem(format!(
                        "{local_id} is not a local id"
                    )));
                }
                if self.target_id.is_some() {
                    return Err(SyncError::InvalidQueueItem(
                        "create cannot target an existing record".into(),
                    ));
                }
            }
            Operation::Update | Operation::Delete => {
                if self.local_id.is_some() {
                    return Err(SyncError::InvalidQueueItem(format!(
                        "{} cannot carry a local id",
                        self.op
                    )));
                }
                if self.target_id.as_deref().map_or(true, |t| t.trim().is_empty()) {
                    return Err(SyncError::InvalidQueueItem(format!(
                        "{} requires a target id",
                        self.op
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub pending: i64,
    pub failed: i64,
}

/// What happened to an item after a failed replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { next_retry_at: i64 },
    DeadLettered,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    let op: String = row.get(2)?;
    let entity: String = row.get(3)?;
    let payload: String = row.get(6)?;
    let status: String = row.get(7)?;
    Ok(QueueItem {
        seq: row.get(0)?,
        id: row.get(1)?,
        op: op.parse().map_err(|e| conversion_error(2, e))?,
        entity: entity.parse().map_err(|e| conversion_error(3, e))?,
        target_id: row.get(4)?,
        local_id: row.get(5)?,
        data: serde_json::from_str(&payload).map_err(|e| conversion_error(6, e.to_string()))?,
        status: status.parse().map_err(|e| conversion_error(7, e))?,
        retries: row.get(8)?,
        max_retries: row.get(9)?,
        retry_delay_ms: row.get(10)?,
        next_retry_at: row.get(11)?,
        last_error: row.get(12)?,
        timestamp: row.get(13)?,
    })
}

fn query_items(db: &DbState, where_clause: &str) -> SyncResult<Vec<QueueItem>> {
    let conn = db.conn.lock()?;
    let sql = format!("SELECT {ITEM_COLUMNS} FROM sync_queue WHERE {where_clause} ORDER BY seq ASC");
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map([], row_to_item)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(items)
}

// ---------------------------------------------------------------------------
// Queue operations
// ---------------------------------------------------------------------------

/// Append a mutation to the queue.
pub fn enqueue(
    db: &DbState,
    item: NewQueueItem,
    max_retries: u32,
    base_delay_ms: i64,
) -> SyncResult<QueueItem> {
    item.check_invariants()?;

    let id = Uuid::new_v4().to_string();
    let timestamp = now_ms();
    let payload = serde_json::to_string(&item.data)?;
    let seq = {
        let conn = db.conn.lock()?;
        conn.execute(
            "INSERT INTO sync_queue (
                 id, operation, entity_type, target_id, local_id, payload,
                 status, retry_count, max_retries, retry_delay_ms, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?8, ?9)",
            params![
                id,
                item.op.as_str(),
                item.entity.as_str(),
                item.target_id,
                item.local_id,
                payload,
                max_retries,
                base_delay_ms,
                timestamp
            ],
        )?;
        conn.last_insert_rowid()
    };

    debug!(
        queue_id = %id,
        seq,
        op = %item.op,
        entity = %item.entity,
        "mutation queued"
    );

    Ok(QueueItem {
        seq,
        id,
        op: item.op,
        entity: item.entity,
        target_id: item.target_id,
        data: item.data,
        local_id: item.local_id,
        timestamp,
        retries: 0,
        max_retries,
        retry_delay_ms: base_delay_ms,
        status: ItemStatus::Pending,
        next_retry_at: None,
        last_error: None,
    })
}

/// Items still awaiting replay, oldest first.
pub fn pending_items(db: &DbState) -> SyncResult<Vec<QueueItem>> {
    query_items(db, "status = 'pending'")
}

/// Dead-lettered items, oldest first.
pub fn dead_letters(db: &DbState) -> SyncResult<Vec<QueueItem>> {
    query_items(db, "status = 'failed'")
}

pub fn all_items(db: &DbState) -> SyncResult<Vec<QueueItem>> {
    query_items(db, "1 = 1")
}

pub fn get_item(db: &DbState, id: &str) -> SyncResult<Option<QueueItem>> {
    let conn = db.conn.lock()?;
    let sql = format!("SELECT {ITEM_COLUMNS} FROM sync_queue WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], row_to_item).optional()?)
}

/// Remove a synced item. Returns whether a row was deleted.
pub fn remove(db: &DbState, id: &str) -> SyncResult<bool> {
    let conn = db.conn.lock()?;
    let deleted = conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
    Ok(deleted > 0)
}

fn deterministic_jitter_ms(seed: i64) -> i64 {
    (seed.unsigned_abs() % 700) as i64 + 50
}

/// Record a failed replay.
///
/// Transient failures are rescheduled with exponential backoff (doubling
/// from the item's current delay, capped at [`MAX_RETRY_DELAY_MS`]) until
/// `max_retries` is reached. Permanent failures dead-letter immediately.
pub fn record_failure(
    db: &DbState,
    item: &QueueItem,
    error: &str,
    permanent: bool,
    now_ms: i64,
) -> SyncResult<FailureOutcome> {
    let new_count = item.retries + 1;
    let exhausted = permanent || new_count >= item.max_retries;
    let conn = db.conn.lock()?;

    if exhausted {
        conn.execute(
            "UPDATE sync_queue
             SET status = 'failed',
                 retry_count = ?1,
                 next_retry_at = NULL,
                 last_error = ?2,
                 updated_at = datetime('now')
             WHERE id = ?3",
            params![new_count, error, item.id],
        )?;
        warn!(
            queue_id = %item.id,
            entity = %item.entity,
            op = %item.op,
            retries = new_count,
            error,
            "queued mutation dead-lettered"
        );
        return Ok(FailureOutcome::DeadLettered);
    }

    let delay = item.retry_delay_ms.clamp(1_000, MAX_RETRY_DELAY_MS);
    let next_retry_at = now_ms + delay + deterministic_jitter_ms(item.seq);
    let next_delay = (delay * 2).min(MAX_RETRY_DELAY_MS);
    conn.execute(
        "UPDATE sync_queue
         SET retry_count = ?1,
             next_retry_at = ?2,
             retry_delay_ms = ?3,
             last_error = ?4,
             updated_at = datetime('now')
         WHERE id = ?5",
        params![new_count, next_retry_at, next_delay, error, item.id],
    )?;
    Ok(FailureOutcome::Retrying { next_retry_at })
}

/// Move an item to the dead-letter list without counting a retry.
pub fn dead_letter(db: &DbState, id: &str, reason: &str) -> SyncResult<bool> {
    let conn = db.conn.lock()?;
    let updated = conn.execute(
        "UPDATE sync_queue
         SET status = 'failed', next_retry_at = NULL, last_error = ?1, updated_at = datetime('now')
         WHERE id = ?2 AND status = 'pending'",
        params![reason, id],
    )?;
    Ok(updated > 0)
}

/// Requeue a dead-lettered item with a fresh retry budget. Requeueing a
/// create also requeues the dependents that were dead-lettered with it, so
/// the chain replays together once the create syncs.
pub fn retry_dead_letter(db: &DbState, id: &str, base_delay_ms: i64) -> SyncResult<bool> {
    let Some(item) = get_item(db, id)? else {
        return Ok(false);
    };
    if item.status != ItemStatus::Failed {
        return Ok(false);
    }

    let mut revived = vec![item.id.clone()];
    if let Some(local_id) = item.local_id.as_deref() {
        let mut frontier = vec![local_id.to_string()];
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(current) = frontier.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            for dep in dependents_of(db, &current)? {
                if dep.status != ItemStatus::Failed {
                    continue;
                }
                if let Some(dep_local) = dep.local_id.clone() {
                    frontier.push(dep_local);
                }
                if !revived.contains(&dep.id) {
                    revived.push(dep.id);
                }
            }
        }
    }

    let conn = db.conn.lock()?;
    for revived_id in &revived {
        conn.execute(
            "UPDATE sync_queue
             SET status = 'pending',
                 retry_count = 0,
                 retry_delay_ms = ?1,
                 next_retry_at = NULL,
                 updated_at = datetime('now')
             WHERE id = ?2 AND status = 'failed'",
            params![base_delay_ms, revived_id],
        )?;
    }
    info!(
        queue_id = id,
        requeued = revived.len(),
        "dead-lettered mutation requeued"
    );
    Ok(true)
}

/// Queued items (any status) that depend on `local_id`.
pub fn dependents_of(db: &DbState, local_id: &str) -> SyncResult<Vec<QueueItem>> {
    Ok(all_items(db)?
        .into_iter()
        .filter(|item| item.references(local_id))
        .collect())
}

/// Drop an item for good. Discarding a create also discards everything
/// that depends on its local id, since those can never resolve. Returns the
/// ids removed.
pub fn discard(db: &DbState, id: &str) -> SyncResult<Vec<String>> {
    let Some(item) = get_item(db, id)? else {
        return Ok(Vec::new());
    };

    let mut doomed = vec![item.id.clone()];
    if let Some(local_id) = item.local_id.as_deref() {
        let mut frontier = vec![local_id.to_string()];
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(current) = frontier.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            for dep in dependents_of(db, &current)? {
                if let Some(dep_local) = dep.local_id.clone() {
                    frontier.push(dep_local);
                }
                if !doomed.contains(&dep.id) {
                    doomed.push(dep.id);
                }
            }
        }
    }

    let conn = db.conn.lock()?;
    for doomed_id in &doomed {
        conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![doomed_id])?;
    }
    info!(queue_id = id, removed = doomed.len(), "queued mutation discarded");
    Ok(doomed)
}

pub fn counts(db: &DbState) -> SyncResult<QueueCounts> {
    let conn = db.conn.lock()?;
    let (pending, failed) = conn.query_row(
        "SELECT
             COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
             COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
         FROM sync_queue",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(QueueCounts { pending, failed })
}

pub fn is_empty(db: &DbState) -> SyncResult<bool> {
    let counts = counts(db)?;
    Ok(counts.pending == 0 && counts.failed == 0)
}

// ---------------------------------------------------------------------------
// Id mappings
// ---------------------------------------------------------------------------

pub fn record_mapping(
    db: &DbState,
    local_id: &str,
    server_id: &str,
    entity: EntityKind,
) -> SyncResult<()> {
    let conn = db.conn.lock()?;
    conn.execute(
        "INSERT INTO id_mappings (local_id, server_id, entity_type, resolved_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(local_id) DO UPDATE SET
            server_id = excluded.server_id,
            resolved_at = excluded.resolved_at",
        params![local_id, server_id, entity.as_str()],
    )?;
    Ok(())
}

pub fn load_mappings(db: &DbState) -> SyncResult<HashMap<String, String>> {
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare("SELECT local_id, server_id FROM id_mappings")?;
    let mappings = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<HashMap<String, String>>>()?;
    Ok(mappings)
}

pub fn resolve_mapping(db: &DbState, local_id: &str) -> SyncResult<Option<String>> {
    let conn = db.conn.lock()?;
    Ok(conn
        .query_row(
            "SELECT server_id FROM id_mappings WHERE local_id = ?1",
            params![local_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Drop mappings older than `min_age_secs` that no queued item references.
/// The grace period lets UI state still holding a placeholder id resolve it.
pub fn retire_mappings(db: &DbState, min_age_secs: i64) -> SyncResult<usize> {
    let referenced: HashSet<String> = all_items(db)?
        .iter()
        .flat_map(|item| item.dependencies())
        .collect();

    let conn = db.conn.lock()?;
    let candidates: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT local_id FROM id_mappings
             WHERE julianday(resolved_at) <= julianday('now') - (?1 / 86400.0)",
        )?;
        let rows = stmt
            .query_map(params![min_age_secs], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let mut retired = 0;
    for local_id in candidates.iter().filter(|l| !referenced.contains(*l)) {
        retired += conn.execute(
            "DELETE FROM id_mappings WHERE local_id = ?1",
            params![local_id],
        )?;
    }
    if retired > 0 {
        debug!(retired, "retired local id mappings");
    }
    Ok(retired)
}
