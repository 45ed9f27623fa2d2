//! Order number allocation.
//!
//! Numbers come from a single remote counter. When that path fails the
//! allocator degrades to "highest known + 1" and finally to a number derived
//! from the wall clock. The tier is returned with every number and stored on
//! the order so degraded numbers can be audited later.

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{self, DbState};
use crate::error::{CoreResult, ValidationError};
use crate::models::NumberingTier;
use crate::remote::{with_timeout, Filter, RemoteStore, TABLE_ORDERS};

const COUNTER_CATEGORY: &str = "orders";
const COUNTER_KEY: &str = "order_counter";
const MAX_WIDTH: usize = 18;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedNumber {
    pub value: String,
    pub tier: NumberingTier,
}

pub struct SequenceAllocator {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteStore>,
    counter_key: String,
    width: usize,
    timeout: Duration,
    /// Shared by `next_number`, exclusive for reset/set.
    admin: RwLock<()>,
    /// Serializes the degraded "last known + 1" path on this terminal.
    fallback: AsyncMutex<()>,
}

impl SequenceAllocator {
    pub fn new(db: Arc<DbState>, remote: Arc<dyn RemoteStore>, config: &Config) -> Self {
        Self {
            db,
            remote,
            counter_key: config.sequence_counter_key.clone(),
            width: config.sequence_width.clamp(1, MAX_WIDTH),
            timeout: config.remote_timeout(),
            admin: RwLock::new(()),
            fallback: AsyncMutex::new(()),
        }
    }

    pub fn format(&self, n: i64) -> String {
        format!("{:0width$}", n.max(0), width = self.width)
    }

    /// Allocate the next order number, degrading through the fallback tiers.
    pub async fn next_number(&self) -> CoreResult<AllocatedNumber> {
        let _shared = self.admin.read().await;

        let atomic_err = match with_timeout(
            self.timeout,
            self.remote.atomic_increment(&self.counter_key),
        )
        .await
        {
            Ok(n) => {
                self.record_last_issued(n)?;
                return Ok(AllocatedNumber {
                    value: self.format(n),
                    tier: NumberingTier::Atomic,
                });
            }
            Err(e) => e,
        };

        warn!(error = %atomic_err, "Atomic sequence increment failed, using fallback numbering");
        let _fallback = self.fallback.lock().await;

        if let Some(highest) = self.highest_known().await? {
            let n = highest + 1;
            self.record_last_issued(n)?;
            warn!(number = n, "Allocated best-effort sequence number (last known + 1)");
            return Ok(AllocatedNumber {
                value: self.format(n),
                tier: NumberingTier::LastKnownPlusOne,
            });
        }

        let value = self.timestamp_number();
        warn!(number = %value, "Allocated timestamp-derived sequence number; needs manual reconciliation");
        Ok(AllocatedNumber {
            value,
            tier: NumberingTier::Timestamp,
        })
    }

    /// Allocate strictly from the remote counter; no fallback.
    pub async fn next_atomic(&self) -> CoreResult<String> {
        let _shared = self.admin.read().await;
        let n = with_timeout(self.timeout, self.remote.atomic_increment(&self.counter_key)).await?;
        self.record_last_issued(n)?;
        Ok(self.format(n))
    }

    pub async fn reset_sequence(&self) -> CoreResult<()> {
        self.set_sequence(0).await
    }

    /// Set the counter so the next allocation returns `n + 1`.
    pub async fn set_sequence(&self, n: i64) -> CoreResult<()> {
        if n < 0 {
            return Err(ValidationError::InvalidSequence(n.to_string()).into());
        }
        let _exclusive = self.admin.write().await;
        with_timeout(self.timeout, self.remote.set_counter(&self.counter_key, n)).await?;
        let conn = self.db.conn.lock()?;
        db::set_setting(&conn, COUNTER_CATEGORY, COUNTER_KEY, &n.to_string())?;
        info!(counter = %self.counter_key, value = n, "Order sequence set");
        Ok(())
    }

    /// Current counter value as seen by this terminal (last atomic or
    /// last-known number handed out).
    pub fn current_value(&self) -> CoreResult<i64> {
        let conn = self.db.conn.lock()?;
        Ok(db::get_setting(&conn, COUNTER_CATEGORY, COUNTER_KEY)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0))
    }

    fn record_last_issued(&self, n: i64) -> CoreResult<()> {
        let conn = self.db.conn.lock()?;
        let current = db::get_setting(&conn, COUNTER_CATEGORY, COUNTER_KEY)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        if n > current {
            db::set_setting(&conn, COUNTER_CATEGORY, COUNTER_KEY, &n.to_string())?;
        }
        Ok(())
    }

    /// Highest non-timestamp number seen remotely or locally.
    async fn highest_known(&self) -> CoreResult<Option<i64>> {
        let filter = Filter::new()
            .eq("numbering_tier", NumberingTier::Atomic.as_str())
            .order_by_desc("sequence_number")
            .limit(1);
        let remote_highest = match with_timeout(
            self.timeout,
            self.remote.query(TABLE_ORDERS, &filter),
        )
        .await
        {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.get("sequence_number"))
                .and_then(Value::as_str)
                .and_then(parse_sequence),
            Err(e) => {
                warn!(error = %e, "Remote highest-order lookup failed, using local mirror");
                None
            }
        };

        let local_highest = {
            let conn = self.db.conn.lock()?;
            let from_orders: Option<i64> = conn.query_row(
                "SELECT MAX(CAST(sequence_number AS INTEGER)) FROM orders
                 WHERE numbering_tier != ?1",
                params![NumberingTier::Timestamp.as_str()],
                |row| row.get(0),
            )?;
            let from_counter = db::get_setting(&conn, COUNTER_CATEGORY, COUNTER_KEY)
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|n| *n > 0);
            from_orders.max(from_counter)
        };

        Ok(remote_highest.max(local_highest))
    }

    fn timestamp_number(&self) -> String {
        let modulus = 10_i64.pow(self.width as u32);
        self.format(Utc::now().timestamp().rem_euclid(modulus))
    }
}

fn parse_sequence(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    trimmed.parse().ok()
}
