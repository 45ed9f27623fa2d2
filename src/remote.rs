//! Remote store contract and an in-process implementation.
//!
//! The hosted backend is the source of truth. The core needs four primitives
//! from it: a linearizable counter, upsert by natural key, conditional update
//! and read-only queries. Every write carries the mutation's `op_id` so a
//! retried submission is applied at most once.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::error::{RemoteError, RemoteResult};
use crate::models::OrderStatus;

pub const TABLE_ORDERS: &str = "orders";
pub const TABLE_CUSTOMERS: &str = "customers";
pub const TABLE_LOYALTY: &str = "loyalty_records";

// ---------------------------------------------------------------------------
// Request/response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NaturalKey {
    pub field: String,
    pub value: String,
}

impl NaturalKey {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Optimistic precondition for a conditional update: `field` must currently
/// equal `expected`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Precondition {
    pub field: String,
    pub expected: Value,
}

impl Precondition {
    pub fn status(status: OrderStatus) -> Self {
        Self {
            field: "status".to_string(),
            expected: Value::String(status.as_str().to_string()),
        }
    }
}

/// Acknowledgement of an upsert; `row` is the record as stored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertAck {
    pub record_id: String,
    pub row: Value,
    #[serde(default)]
    pub deduplicated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    Applied,
    Conflict { current: Option<Value> },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub eq: Vec<(String, Value)>,
    pub order_by: Option<String>,
    pub descending: bool,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.eq.push((field.into(), value.into()));
        self
    }

    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self.descending = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, row: &Value) -> bool {
        self.eq
            .iter()
            .all(|(field, expected)| row.get(field) == Some(expected))
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Increment a counter and return the new value. Must be linearizable.
    async fn atomic_increment(&self, counter_key: &str) -> RemoteResult<i64>;

    /// Overwrite a counter (administrative).
    async fn set_counter(&self, counter_key: &str, value: i64) -> RemoteResult<()>;

    async fn upsert_by_natural_key(
        &self,
        table: &str,
        key: &NaturalKey,
        fields: Value,
        op_id: &str,
    ) -> RemoteResult<UpsertAck>;

    async fn conditional_update(
        &self,
        table: &str,
        id: &str,
        precondition: &Precondition,
        fields: Value,
        op_id: &str,
    ) -> RemoteResult<UpdateOutcome>;

    async fn query(&self, table: &str, filter: &Filter) -> RemoteResult<Vec<Value>>;

    /// Lightweight reachability check.
    async fn health_check(&self) -> RemoteResult<()>;
}

/// Bound a remote call. An elapsed timer is reported as `RemoteError::Timeout`,
/// which callers treat as "outcome unknown" and queue for replay.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> RemoteResult<T>
where
    F: Future<Output = RemoteResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout),
    }
}

// ---------------------------------------------------------------------------
// In-process implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum AppliedOp {
    Upsert(UpsertAck),
    Update(UpdateOutcome),
}

#[derive(Debug, Default)]
struct MemoryInner {
    counters: HashMap<String, i64>,
    tables: HashMap<String, BTreeMap<String, Value>>,
    applied: HashMap<String, AppliedOp>,
    applications: HashMap<String, usize>,
    next_id: u64,
    /// Error reported for the next write after it has been applied.
    next_ack_fault: Option<RemoteError>,
}

/// In-memory remote store with op-id de-duplication and fault switches.
#[derive(Debug)]
pub struct MemoryRemoteStore {
    inner: Mutex<MemoryInner>,
    online: AtomicBool,
    atomic_available: AtomicBool,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            online: AtomicBool::new(true),
            atomic_available: AtomicBool::new(true),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Make only the counter primitive fail, leaving writes available.
    pub fn set_atomic_available(&self, available: bool) {
        self.atomic_available.store(available, Ordering::SeqCst);
    }

    /// Apply the next write but report a timeout to the caller.
    pub fn lose_next_ack(&self) {
        self.lock().next_ack_fault = Some(RemoteError::Timeout);
    }

    /// Apply the next write but answer with an unreadable response.
    pub fn garble_next_ack(&self) {
        self.lock().next_ack_fault =
            Some(RemoteError::Decode("truncated response body".to_string()));
    }

    /// How many times the write identified by `op_id` took effect.
    pub fn applications(&self, op_id: &str) -> usize {
        self.lock().applications.get(op_id).copied().unwrap_or(0)
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Value> {
        self.lock().tables.get(table).and_then(|t| t.get(id)).cloned()
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn counter(&self, key: &str) -> i64 {
        self.lock().counters.get(key).copied().unwrap_or(0)
    }

    /// Overwrite fields of a stored row directly, bypassing op-id tracking
    /// (simulates another terminal editing the record).
    pub fn patch_row(&self, table: &str, id: &str, fields: Value) {
        let mut inner = self.lock();
        if let Some(row) = inner.tables.get_mut(table).and_then(|t| t.get_mut(id)) {
            merge_fields(row, &fields);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_online(&self) -> RemoteResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Unavailable("memory store offline".to_string()))
        }
    }

    fn finish<T>(inner: &mut MemoryInner, value: T) -> RemoteResult<T> {
        match inner.next_ack_fault.take() {
            Some(err) => Err(err),
            None => Ok(value),
        }
    }
}

fn merge_fields(row: &mut Value, fields: &Value) {
    if let (Value::Object(target), Value::Object(source)) = (row, fields) {
        for (k, v) in source {
            if k != "id" {
                target.insert(k.clone(), v.clone());
            }
        }
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => CmpOrdering::Greater,
        (None, Some(_)) => CmpOrdering::Less,
        _ => CmpOrdering::Equal,
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn atomic_increment(&self, counter_key: &str) -> RemoteResult<i64> {
        self.ensure_online()?;
        if !self.atomic_available.load(Ordering::SeqCst) {
            return Err(RemoteError::Transient(
                "atomic increment unavailable".to_string(),
            ));
        }
        let mut inner = self.lock();
        let counter = inner.counters.entry(counter_key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn set_counter(&self, counter_key: &str, value: i64) -> RemoteResult<()> {
        self.ensure_online()?;
        self.lock().counters.insert(counter_key.to_string(), value);
        Ok(())
    }

    async fn upsert_by_natural_key(
        &self,
        table: &str,
        key: &NaturalKey,
        fields: Value,
        op_id: &str,
    ) -> RemoteResult<UpsertAck> {
        self.ensure_online()?;
        let mut inner = self.lock();

        if let Some(AppliedOp::Upsert(ack)) = inner.applied.get(op_id) {
            debug!(op_id, table, "memory store: duplicate upsert ignored");
            let mut ack = ack.clone();
            ack.deduplicated = true;
            if let Some(current) = inner.tables.get(table).and_then(|t| t.get(&ack.record_id)) {
                ack.row = current.clone();
            }
            return Self::finish(&mut inner, ack);
        }

        let key_value = Value::String(key.value.clone());
        let existing_id = inner.tables.get(table).and_then(|rows| {
            rows.iter()
                .find(|(_, row)| row.get(&key.field) == Some(&key_value))
                .map(|(id, _)| id.clone())
        });

        let record_id = match existing_id {
            Some(id) => id,
            None => {
                inner.next_id += 1;
                format!("{table}-{}", inner.next_id)
            }
        };

        let rows = inner.tables.entry(table.to_string()).or_default();
        let row = rows.entry(record_id.clone()).or_insert_with(|| {
            let mut fresh = Map::new();
            fresh.insert("id".to_string(), Value::String(record_id.clone()));
            fresh.insert(key.field.clone(), key_value.clone());
            fresh.insert("version".to_string(), Value::from(0));
            Value::Object(fresh)
        });
        merge_fields(row, &fields);
        let version = row.get("version").and_then(Value::as_i64).unwrap_or(0) + 1;
        row["version"] = Value::from(version);

        let ack = UpsertAck {
            record_id,
            row: row.clone(),
            deduplicated: false,
        };
        inner
            .applied
            .insert(op_id.to_string(), AppliedOp::Upsert(ack.clone()));
        *inner.applications.entry(op_id.to_string()).or_insert(0) += 1;
        Self::finish(&mut inner, ack)
    }

    async fn conditional_update(
        &self,
        table: &str,
        id: &str,
        precondition: &Precondition,
        fields: Value,
        op_id: &str,
    ) -> RemoteResult<UpdateOutcome> {
        self.ensure_online()?;
        let mut inner = self.lock();

        if let Some(AppliedOp::Update(outcome)) = inner.applied.get(op_id) {
            debug!(op_id, table, id, "memory store: duplicate update ignored");
            let outcome = outcome.clone();
            return Self::finish(&mut inner, outcome);
        }

        let row = inner
            .tables
            .get_mut(table)
            .and_then(|t| t.get_mut(id))
            .ok_or_else(|| RemoteError::Rejected(format!("{table} record {id} not found")))?;

        if row.get(&precondition.field) != Some(&precondition.expected) {
            return Ok(UpdateOutcome::Conflict {
                current: Some(row.clone()),
            });
        }

        merge_fields(row, &fields);
        let version = row.get("version").and_then(Value::as_i64).unwrap_or(0) + 1;
        row["version"] = Value::from(version);

        inner
            .applied
            .insert(op_id.to_string(), AppliedOp::Update(UpdateOutcome::Applied));
        *inner.applications.entry(op_id.to_string()).or_insert(0) += 1;
        Self::finish(&mut inner, UpdateOutcome::Applied)
    }

    async fn query(&self, table: &str, filter: &Filter) -> RemoteResult<Vec<Value>> {
        self.ensure_online()?;
        let inner = self.lock();
        let mut rows: Vec<Value> = inner
            .tables
            .get(table)
            .map(|t| t.values().filter(|row| filter.matches(row)).cloned().collect())
            .unwrap_or_default();

        if let Some(field) = &filter.order_by {
            rows.sort_by(|a, b| {
                let ord = compare_values(a.get(field), b.get(field));
                if filter.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn health_check(&self) -> RemoteResult<()> {
        self.ensure_online()
    }
}
