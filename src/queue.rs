//! Local pending-mutation queue.
//!
//! Durable FIFO of writes not yet confirmed by the remote store, backed by the
//! `sync_queue` table. Ordering is per entity (customer); entries for
//! different customers may be replayed in any order. A confirmed entry is
//! deleted; a permanently failing one moves to `sync_dead_letter`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{self, DbState};
use crate::error::{CoreError, CoreResult};
use crate::models::{LoyaltyRecord, Order, OrderStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    CreateOrder,
    TransitionStatus,
    LedgerAdjust,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::CreateOrder => "create_order",
            MutationKind::TransitionStatus => "transition_status",
            MutationKind::LedgerAdjust => "ledger_adjust",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_order" => Ok(MutationKind::CreateOrder),
            "transition_status" => Ok(MutationKind::TransitionStatus),
            "ledger_adjust" => Ok(MutationKind::LedgerAdjust),
            other => Err(format!("unknown mutation kind '{other}'")),
        }
    }
}

/// Everything needed to replay one mutation against the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationPayload {
    /// Full order as created locally, placeholder sequence number included.
    CreateOrder { order: Order },
    TransitionStatus {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
        /// Remote fields written by the transition.
        fields: Value,
    },
    /// Snapshot of the ledger after the change plus the change itself.
    LedgerAdjust {
        customer_id: String,
        record: LoyaltyRecord,
        valet_delta: i64,
        credit_delta: i64,
        order_id: Option<String>,
    },
}

impl MutationPayload {
    pub fn kind(&self) -> MutationKind {
        match self {
            MutationPayload::CreateOrder { .. } => MutationKind::CreateOrder,
            MutationPayload::TransitionStatus { .. } => MutationKind::TransitionStatus,
            MutationPayload::LedgerAdjust { .. } => MutationKind::LedgerAdjust,
        }
    }

    pub fn order_id(&self) -> Option<&str> {
        match self {
            MutationPayload::CreateOrder { order } => Some(&order.id),
            MutationPayload::TransitionStatus { order_id, .. } => Some(order_id),
            MutationPayload::LedgerAdjust { order_id, .. } => order_id.as_deref(),
        }
    }
}

/// Queue key for everything touching one customer.
pub fn customer_key(customer_id: &str) -> String {
    format!("customer:{customer_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub seq: i64,
    pub op_id: String,
    pub kind: MutationKind,
    pub entity_key: String,
    pub order_id: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl PendingMutation {
    pub fn decode(&self) -> CoreResult<MutationPayload> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub op_id: String,
    pub kind: MutationKind,
    pub entity_key: String,
    pub order_id: Option<String>,
    pub payload: Value,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Entries ready for replay, plus how many were held back behind a
/// not-yet-due entry of the same entity.
#[derive(Debug, Clone, Default)]
pub struct DueEntries {
    pub ready: Vec<PendingMutation>,
    pub blocked: usize,
}

/// Append one mutation. Runs on the caller's connection so it can share a
/// transaction with the local write it describes.
pub fn enqueue_in(
    conn: &Connection,
    op_id: &str,
    entity_key: &str,
    payload: &MutationPayload,
    retry_base_delay_ms: i64,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let kind = payload.kind();
    let body = serde_json::to_string(payload)?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO sync_queue
            (op_id, kind, entity_key, order_id, payload, attempts, retry_delay_ms, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)",
        params![
            op_id,
            kind.as_str(),
            entity_key,
            payload.order_id(),
            body,
            retry_base_delay_ms,
            db::ts(now),
        ],
    )?;
    if inserted == 0 {
        debug!(op_id, "Mutation already queued, skipping");
    } else {
        info!(op_id, kind = %kind, entity = entity_key, "Mutation queued for sync");
    }
    Ok(())
}

fn deterministic_jitter_ms(seed: i64) -> i64 {
    (seed.unsigned_abs() % 700) as i64 + 50
}

fn map_pending(row: &rusqlite::Row<'_>) -> rusqlite::Result<(PendingMutation, String)> {
    let kind: String = row.get(2)?;
    let payload: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let next_retry_at: Option<String> = row.get(9)?;
    let kind = kind.parse::<MutationKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;
    Ok((
        PendingMutation {
            seq: row.get(0)?,
            op_id: row.get(1)?,
            kind,
            entity_key: row.get(3)?,
            order_id: row.get(4)?,
            payload: Value::Null,
            created_at: db::parse_ts(&created_at)?,
            attempts: row.get(7)?,
            last_error: row.get(8)?,
            next_retry_at: db::parse_opt_ts(next_retry_at)?,
        },
        payload,
    ))
}

const PENDING_COLUMNS: &str = "seq, op_id, kind, entity_key, order_id, payload, created_at,
     attempts, last_error, next_retry_at";

pub struct PendingQueue {
    db: Arc<DbState>,
    retry_base_delay_ms: i64,
    retry_max_delay_ms: i64,
}

impl PendingQueue {
    pub fn new(db: Arc<DbState>, config: &Config) -> Self {
        let base = config.retry_base_delay_ms.max(1_000);
        Self {
            db,
            retry_base_delay_ms: base,
            retry_max_delay_ms: config.retry_max_delay_ms.max(base),
        }
    }

    pub fn retry_base_delay_ms(&self) -> i64 {
        self.retry_base_delay_ms
    }

    /// Append one mutation in its own transaction.
    pub fn enqueue(
        &self,
        op_id: &str,
        entity_key: &str,
        payload: &MutationPayload,
    ) -> CoreResult<()> {
        let conn = self.db.conn.lock()?;
        enqueue_in(
            &conn,
            op_id,
            entity_key,
            payload,
            self.retry_base_delay_ms,
            Utc::now(),
        )
    }

    /// All queued entries in FIFO order.
    pub fn entries(&self) -> CoreResult<Vec<PendingMutation>> {
        let conn = self.db.conn.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PENDING_COLUMNS} FROM sync_queue ORDER BY seq ASC"
        ))?;
        let rows = stmt
            .query_map([], map_pending)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut entries = Vec::with_capacity(rows.len());
        for (mut entry, raw) in rows {
            entry.payload = serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(op_id = %entry.op_id, error = %e, "Queued payload is not valid JSON");
                Value::String(raw)
            });
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Entries whose retry time has come, in FIFO order. An entity whose
    /// earliest entry is still backing off contributes nothing.
    pub fn due_entries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        entity_key: Option<&str>,
    ) -> CoreResult<DueEntries> {
        let mut due = DueEntries::default();
        let mut held: HashSet<String> = HashSet::new();

        for entry in self.entries()? {
            if entity_key.is_some_and(|key| key != entry.entity_key) {
                continue;
            }
            if held.contains(&entry.entity_key) {
                due.blocked += 1;
                continue;
            }
            if !entry.is_due(now) {
                held.insert(entry.entity_key.clone());
                due.blocked += 1;
                continue;
            }
            if due.ready.len() >= limit {
                break;
            }
            due.ready.push(entry);
        }
        Ok(due)
    }

    /// Remove an acknowledged entry.
    pub fn confirm(&self, op_id: &str) -> CoreResult<bool> {
        let conn = self.db.conn.lock()?;
        let removed = conn.execute("DELETE FROM sync_queue WHERE op_id = ?1", params![op_id])?;
        if removed > 0 {
            debug!(op_id, "Queue entry confirmed");
        }
        Ok(removed > 0)
    }

    /// Record a recoverable failure and schedule the next attempt with
    /// exponential backoff.
    pub fn record_failure(&self, op_id: &str, error: &str) -> CoreResult<()> {
        let conn = self.db.conn.lock()?;
        let current: Option<(i64, i64, i64)> = conn
            .query_row(
                "SELECT seq, attempts, retry_delay_ms FROM sync_queue WHERE op_id = ?1",
                params![op_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((seq, attempts, delay_ms)) = current else {
            return Err(CoreError::not_found("queue entry", op_id));
        };

        let delay_ms = delay_ms.clamp(self.retry_base_delay_ms, self.retry_max_delay_ms);
        let next_retry_at =
            Utc::now() + ChronoDuration::milliseconds(delay_ms + deterministic_jitter_ms(seq));
        let next_delay = (delay_ms * 2).min(self.retry_max_delay_ms);

        conn.execute(
            "UPDATE sync_queue
             SET attempts = ?1,
                 last_error = ?2,
                 next_retry_at = ?3,
                 retry_delay_ms = ?4
             WHERE op_id = ?5",
            params![attempts + 1, error, db::ts(next_retry_at), next_delay, op_id],
        )?;
        warn!(
            op_id,
            attempts = attempts + 1,
            retry_in_ms = delay_ms,
            error,
            "Sync attempt failed, will retry"
        );
        Ok(())
    }

    /// Move an entry to the dead-letter list for operator review.
    pub fn dead_letter(&self, op_id: &str, error: &str) -> CoreResult<()> {
        let mut conn = self.db.conn.lock()?;
        let tx = conn.transaction()?;
        let moved = tx.execute(
            "INSERT OR REPLACE INTO sync_dead_letter
                (op_id, kind, entity_key, order_id, payload, attempts, last_error, created_at, dead_lettered_at)
             SELECT op_id, kind, entity_key, order_id, payload, attempts + 1, ?2, created_at, ?3
             FROM sync_queue WHERE op_id = ?1",
            params![op_id, error, db::ts(Utc::now())],
        )?;
        if moved == 0 {
            return Err(CoreError::not_found("queue entry", op_id));
        }
        tx.execute("DELETE FROM sync_queue WHERE op_id = ?1", params![op_id])?;
        tx.commit()?;
        warn!(op_id, error, "Mutation moved to dead-letter list");
        Ok(())
    }

    pub fn list_dead_letters(&self) -> CoreResult<Vec<DeadLetter>> {
        let conn = self.db.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT op_id, kind, entity_key, order_id, payload, attempts, last_error,
                    created_at, dead_lettered_at
             FROM sync_dead_letter ORDER BY dead_lettered_at ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let kind: String = row.get(1)?;
                let payload: String = row.get(4)?;
                let created_at: String = row.get(7)?;
                let dead_lettered_at: String = row.get(8)?;
                Ok(DeadLetter {
                    op_id: row.get(0)?,
                    kind: kind.parse().map_err(|e: String| {
                        rusqlite::Error::FromSqlConversionFailure(
                            1,
                            rusqlite::types::Type::Text,
                            e.into(),
                        )
                    })?,
                    entity_key: row.get(2)?,
                    order_id: row.get(3)?,
                    payload: serde_json::from_str(&payload).unwrap_or(Value::String(payload)),
                    attempts: row.get(5)?,
                    last_error: row.get(6)?,
                    created_at: db::parse_ts(&created_at)?,
                    dead_lettered_at: db::parse_ts(&dead_lettered_at)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Put a dead-lettered entry back at the tail of the queue with a fresh
    /// attempt count.
    pub fn requeue_dead_letter(&self, op_id: &str) -> CoreResult<()> {
        let mut conn = self.db.conn.lock()?;
        let tx = conn.transaction()?;
        let moved = tx.execute(
            "INSERT INTO sync_queue
                (op_id, kind, entity_key, order_id, payload, attempts, last_error, retry_delay_ms, created_at)
             SELECT op_id, kind, entity_key, order_id, payload, 0, last_error, ?2, created_at
             FROM sync_dead_letter WHERE op_id = ?1",
            params![op_id, self.retry_base_delay_ms],
        )?;
        if moved == 0 {
            return Err(CoreError::not_found("dead letter", op_id));
        }
        tx.execute("DELETE FROM sync_dead_letter WHERE op_id = ?1", params![op_id])?;
        tx.commit()?;
        info!(op_id, "Dead-lettered mutation requeued");
        Ok(())
    }

    /// Number of unconfirmed entries.
    pub fn backlog(&self) -> CoreResult<i64> {
        let conn = self.db.conn.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?)
    }

    pub fn dead_letter_count(&self) -> CoreResult<i64> {
        let conn = self.db.conn.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM sync_dead_letter", [], |row| {
            row.get(0)
        })?)
    }

    pub fn oldest_pending_at(&self) -> CoreResult<Option<DateTime<Utc>>> {
        let conn = self.db.conn.lock()?;
        let raw: Option<String> =
            conn.query_row("SELECT MIN(created_at) FROM sync_queue", [], |row| row.get(0))?;
        Ok(db::parse_opt_ts(raw)?)
    }
}

/// Whether anything is still queued for this entity.
pub fn has_pending_for(conn: &Connection, entity_key: &str) -> CoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE entity_key = ?1",
        params![entity_key],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Whether anything is still queued for this order.
pub fn has_pending_for_order(conn: &Connection, order_id: &str) -> CoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE order_id = ?1",
        params![order_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
