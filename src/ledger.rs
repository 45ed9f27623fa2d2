//! Per-customer loyalty ledger.
//!
//! Every nine valets earn one free credit. Accrual resets at the start of each
//! calendar month in the shop's timezone (to the valets of the order that triggers the reset, not to
//! zero); credits and redemptions carry over. A credit-funded order consumes
//! one credit and does not accrue.
//!
//! The ledger assumes at-most-once invocation per order. Exactly-once is the
//! caller's job: the order service applies the ledger in the same local
//! transaction that flips the order's `ledger_applied` flag, and replays are
//! de-duplicated by op id.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use crate::config::Config;
use crate::db::{self, DbState};
use crate::error::{CoreError, CoreResult, RemoteError, ValidationError};
use crate::locks::KeyedLocks;
use crate::models::{LedgerEffect, LedgerResult, LoyaltyRecord, YearMonth};

/// Valets needed for one free credit.
pub const VALETS_PER_CREDIT: i64 = 9;

/// Accrue `valet_count` valets in `month`. Pure; returns the new record.
pub fn accrue(record: &LoyaltyRecord, valet_count: i64, month: YearMonth) -> LedgerResult {
    let rolled_over = record.last_reset_month != Some(month);
    let before = if rolled_over {
        0
    } else {
        record.cumulative_valets
    };
    let after = before + valet_count;
    let credits_granted = after / VALETS_PER_CREDIT - before / VALETS_PER_CREDIT;

    let mut next = record.clone();
    next.cumulative_valets = after;
    next.free_credits += credits_granted;
    next.last_reset_month = Some(month);

    LedgerResult {
        record: next,
        effect: LedgerEffect::Accrued,
        valet_delta: after - record.cumulative_valets,
        credits_granted,
        rolled_over,
    }
}

/// Consume one free credit. Pure; fails without touching the record.
pub fn redeem(record: &LoyaltyRecord) -> CoreResult<LedgerResult> {
    if record.free_credits < 1 {
        return Err(CoreError::InsufficientCredit {
            customer_id: record.customer_id.clone(),
            available: record.free_credits,
        });
    }
    let mut next = record.clone();
    next.free_credits -= 1;
    next.redeemed_count += 1;
    Ok(LedgerResult {
        record: next,
        effect: LedgerEffect::Redeemed,
        valet_delta: 0,
        credits_granted: 0,
        rolled_over: false,
    })
}

pub struct LoyaltyLedger {
    db: Arc<DbState>,
    locks: KeyedLocks,
    utc_offset_minutes: i32,
}

impl LoyaltyLedger {
    pub fn new(db: Arc<DbState>, config: &Config) -> Self {
        Self {
            db,
            locks: KeyedLocks::new(),
            utc_offset_minutes: config.shop_utc_offset_minutes,
        }
    }

    /// Loyalty month of `at` in the shop's timezone.
    pub fn month_of(&self, at: DateTime<Utc>) -> YearMonth {
        YearMonth::of_local(at, self.utc_offset_minutes)
    }

    /// Exclusive access to one customer's ledger.
    pub async fn lock_customer(&self, customer_id: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(customer_id).await
    }

    /// Apply the ledger effect of one completed order.
    pub async fn apply_order_completion(
        &self,
        customer_id: &str,
        valet_count: i64,
        use_free_credit: bool,
        now: DateTime<Utc>,
    ) -> CoreResult<LedgerResult> {
        let _guard = self.lock_customer(customer_id).await;
        let mut conn = self.db.conn.lock()?;
        let tx = conn.transaction()?;
        let month = self.month_of(now);
        let result = apply_in(&tx, customer_id, valet_count, use_free_credit, month, now)?;
        tx.commit()?;
        Ok(result)
    }

    /// Spend one credit outside of an order completion.
    pub async fn redeem_credit(
        &self,
        customer_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<LedgerResult> {
        self.apply_order_completion(customer_id, 0, true, now).await
    }

    pub fn get_record(&self, customer_id: &str) -> CoreResult<LoyaltyRecord> {
        let conn = self.db.conn.lock()?;
        Ok(load_record(&conn, customer_id)?.unwrap_or_else(|| LoyaltyRecord::empty(customer_id)))
    }
}

/// Replace the cached record wholesale (cache rebuild from the remote store).
/// The caller must hold the customer lock.
pub(crate) fn replace_in(conn: &Connection, record: &LoyaltyRecord) -> CoreResult<()> {
    store_record(conn, record, Utc::now())?;
    info!(customer_id = %record.customer_id, "Loyalty record replaced from remote");
    Ok(())
}

/// Remote representation of a ledger snapshot.
pub(crate) fn remote_fields(
    record: &LoyaltyRecord,
    customer_remote_id: &str,
    valet_delta: i64,
    credit_delta: i64,
) -> Value {
    json!({
        "customer_id": customer_remote_id,
        "local_customer_id": record.customer_id,
        "cumulative_valets": record.cumulative_valets,
        "free_credits": record.free_credits,
        "redeemed_count": record.redeemed_count,
        "last_reset_month": record.last_reset_month.map(|m| m.to_string()),
        "last_valet_delta": valet_delta,
        "last_credit_delta": credit_delta,
    })
}

/// Parse a remote ledger row back into a local record.
pub(crate) fn record_from_remote(customer_id: &str, row: &Value) -> CoreResult<LoyaltyRecord> {
    let int = |field: &str| -> CoreResult<i64> {
        row.get(field)
            .and_then(Value::as_i64)
            .ok_or_else(|| RemoteError::Decode(format!("loyalty row missing '{field}'")).into())
    };
    let last_reset_month = match row.get("last_reset_month").and_then(Value::as_str) {
        Some(raw) => Some(
            raw.parse::<YearMonth>()
                .map_err(RemoteError::Decode)?,
        ),
        None => None,
    };
    let record = LoyaltyRecord {
        customer_id: customer_id.to_string(),
        cumulative_valets: int("cumulative_valets")?,
        free_credits: int("free_credits")?,
        redeemed_count: int("redeemed_count")?,
        last_reset_month,
    };
    if record.free_credits < 0 {
        return Err(RemoteError::Decode("negative free_credits in remote ledger".to_string()).into());
    }
    Ok(record)
}

/// Apply one completion inside an open transaction. The caller must hold the
/// customer lock.
pub(crate) fn apply_in(
    conn: &Connection,
    customer_id: &str,
    valet_count: i64,
    use_free_credit: bool,
    month: YearMonth,
    now: DateTime<Utc>,
) -> CoreResult<LedgerResult> {
    if valet_count < 0 {
        return Err(ValidationError::InvalidQuantity(customer_id.to_string()).into());
    }

    let current = load_record(conn, customer_id)?.unwrap_or_else(|| LoyaltyRecord::empty(customer_id));
    let result = if use_free_credit {
        redeem(&current)?
    } else {
        accrue(&current, valet_count, month)
    };

    store_record(conn, &result.record, now)?;
    debug!(
        customer_id,
        effect = ?result.effect,
        cumulative = result.record.cumulative_valets,
        credits = result.record.free_credits,
        granted = result.credits_granted,
        rolled_over = result.rolled_over,
        "Loyalty ledger updated"
    );
    Ok(result)
}

pub(crate) fn load_record(conn: &Connection, customer_id: &str) -> CoreResult<Option<LoyaltyRecord>> {
    let record = conn
        .query_row(
            "SELECT customer_id, cumulative_valets, free_credits, redeemed_count, last_reset_month
             FROM loyalty_ledger WHERE customer_id = ?1",
            params![customer_id],
            |row| {
                Ok(LoyaltyRecord {
                    customer_id: row.get(0)?,
                    cumulative_valets: row.get(1)?,
                    free_credits: row.get(2)?,
                    redeemed_count: row.get(3)?,
                    last_reset_month: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

fn store_record(conn: &Connection, record: &LoyaltyRecord, now: DateTime<Utc>) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO loyalty_ledger
            (customer_id, cumulative_valets, free_credits, redeemed_count, last_reset_month, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(customer_id) DO UPDATE SET
            cumulative_valets = excluded.cumulative_valets,
            free_credits = excluded.free_credits,
            redeemed_count = excluded.redeemed_count,
            last_reset_month = excluded.last_reset_month,
            updated_at = excluded.updated_at",
        params![
            record.customer_id,
            record.cumulative_valets,
            record.free_credits,
            record.redeemed_count,
            record.last_reset_month,
            db::ts(now),
        ],
    )?;
    Ok(())
}
