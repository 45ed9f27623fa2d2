//! Sync reconciler.
//!
//! Replays the pending queue against the remote store. Entries are submitted
//! with their original op id so a retried write is applied at most once.
//! Ordering is FIFO per customer: when an entry fails recoverably, the rest
//! of that customer's entries wait for the next pass.
//!
//! Conflict policy: fields the remote store computes (the confirmed sequence
//! number) overwrite local values; fields only this terminal knows (line item
//! options, ledger counters) are pushed as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::customers;
use crate::db::DbState;
use crate::error::{CoreError, CoreResult, RemoteError};
use crate::ledger;
use crate::models::{LoyaltyRecord, NumberingTier, Order, OrderStatus, TransitionCheck};
use crate::orders;
use crate::queue::{MutationPayload, PendingMutation, PendingQueue};
use crate::remote::{
    with_timeout, NaturalKey, Precondition, RemoteStore, UpdateOutcome, TABLE_LOYALTY,
    TABLE_ORDERS,
};
use crate::sequence::SequenceAllocator;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub confirmed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Entries held back behind an earlier entry of the same customer.
    pub blocked: usize,
}

/// Snapshot for operator-facing sync displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub pending: i64,
    pub dead_lettered: i64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub is_online: bool,
}

#[derive(Debug, Default)]
struct SyncMeta {
    last_sync_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    is_online: bool,
}

enum Disposition {
    Retry,
    DeadLetter,
    /// Local storage failed; abort the pass.
    Abort,
}

/// Whether the remote store answered before `err` was produced.
fn remote_responded(err: &CoreError) -> bool {
    matches!(
        err,
        CoreError::Remote(e) if !matches!(e, RemoteError::Unavailable(_) | RemoteError::Timeout)
    )
}

fn classify(err: &CoreError) -> Disposition {
    match err {
        CoreError::Remote(e) if e.is_transient() => Disposition::Retry,
        CoreError::Database(_) | CoreError::Io(_) | CoreError::LockPoisoned => Disposition::Abort,
        _ => Disposition::DeadLetter,
    }
}

pub struct Reconciler {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteStore>,
    allocator: Arc<SequenceAllocator>,
    queue: Arc<PendingQueue>,
    timeout: Duration,
    batch_size: usize,
    /// One pass at a time, whether from the loop or an immediate flush.
    pass: AsyncMutex<()>,
    meta: Mutex<SyncMeta>,
}

impl Reconciler {
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<dyn RemoteStore>,
        allocator: Arc<SequenceAllocator>,
        queue: Arc<PendingQueue>,
        config: &Config,
    ) -> Self {
        Self {
            db,
            remote,
            allocator,
            queue,
            timeout: config.remote_timeout(),
            batch_size: config.sync_batch_size.max(1),
            pass: AsyncMutex::new(()),
            meta: Mutex::new(SyncMeta::default()),
        }
    }

    /// Replay every due entry once.
    pub async fn reconcile_once(&self) -> CoreResult<SyncReport> {
        self.run_pass(None).await
    }

    /// Replay the due entries of one entity (e.g. right after a live write).
    pub async fn flush_entity(&self, entity_key: &str) -> CoreResult<SyncReport> {
        self.run_pass(Some(entity_key)).await
    }

    /// Run a pass now. Same as `reconcile_once`, logged as operator-triggered.
    pub async fn force_sync(&self) -> CoreResult<SyncReport> {
        let report = self.reconcile_once().await?;
        info!(
            confirmed = report.confirmed,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            "Force sync complete"
        );
        Ok(report)
    }

    /// Ask the remote store for health and record reachability.
    pub async fn check_reachability(&self) -> bool {
        let online = with_timeout(self.timeout, self.remote.health_check())
            .await
            .is_ok();
        if let Ok(mut meta) = self.meta.lock() {
            meta.is_online = online;
        }
        online
    }

    pub fn status(&self) -> CoreResult<SyncStatus> {
        let (last_sync_at, last_error, is_online) = {
            let meta = self.meta.lock()?;
            (meta.last_sync_at, meta.last_error.clone(), meta.is_online)
        };
        Ok(SyncStatus {
            pending: self.queue.backlog()?,
            dead_lettered: self.queue.dead_letter_count()?,
            oldest_pending_at: self.queue.oldest_pending_at()?,
            last_sync_at,
            last_error,
            is_online,
        })
    }

    async fn run_pass(&self, entity_key: Option<&str>) -> CoreResult<SyncReport> {
        let _pass = self.pass.lock().await;
        let now = Utc::now();
        let due = self.queue.due_entries(now, self.batch_size, entity_key)?;
        let mut report = SyncReport {
            blocked: due.blocked,
            ..SyncReport::default()
        };
        if due.ready.is_empty() {
            return Ok(report);
        }

        let mut failed_entities: HashSet<String> = HashSet::new();
        let mut last_error: Option<String> = None;
        let mut reached_remote = false;

        for entry in due.ready {
            if failed_entities.contains(&entry.entity_key) {
                report.blocked += 1;
                continue;
            }
            match self.submit(&entry).await {
                Ok(()) => {
                    self.queue.confirm(&entry.op_id)?;
                    report.confirmed += 1;
                    reached_remote = true;
                    debug!(op_id = %entry.op_id, kind = %entry.kind, "Mutation confirmed");
                }
                Err(err) => {
                    reached_remote |= remote_responded(&err);
                    match classify(&err) {
                        Disposition::Retry => {
                            self.queue.record_failure(&entry.op_id, &err.to_string())?;
                            failed_entities.insert(entry.entity_key.clone());
                            report.retried += 1;
                            last_error = Some(err.to_string());
                        }
                        Disposition::DeadLetter => {
                            error!(op_id = %entry.op_id, kind = %entry.kind, error = %err, "Mutation cannot be applied, needs operator review");
                            self.queue.dead_letter(&entry.op_id, &err.to_string())?;
                            report.dead_lettered += 1;
                            last_error = Some(err.to_string());
                        }
                        Disposition::Abort => {
                            self.record_pass(reached_remote, Some(err.to_string()));
                            return Err(err);
                        }
                    }
                }
            }
        }

        self.record_pass(reached_remote, last_error);
        if report.confirmed > 0 || report.retried > 0 || report.dead_lettered > 0 {
            info!(
                confirmed = report.confirmed,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                blocked = report.blocked,
                "Sync pass complete"
            );
        }
        Ok(report)
    }

    fn record_pass(&self, reached_remote: bool, last_error: Option<String>) {
        if let Ok(mut meta) = self.meta.lock() {
            if reached_remote {
                meta.last_sync_at = Some(Utc::now());
                meta.is_online = true;
            }
            meta.last_error = last_error;
        }
    }

    async fn submit(&self, entry: &PendingMutation) -> CoreResult<()> {
        match entry.decode()? {
            MutationPayload::CreateOrder { order } => self.submit_create(&entry.op_id, order).await,
            MutationPayload::TransitionStatus {
                order_id,
                from,
                to,
                fields,
                ..
            } => {
                self.submit_transition(&entry.op_id, &order_id, from, to, fields)
                    .await
            }
            MutationPayload::LedgerAdjust {
                customer_id,
                record,
                valet_delta,
                credit_delta,
                ..
            } => {
                self.submit_ledger(&entry.op_id, &customer_id, &record, valet_delta, credit_delta)
                    .await
            }
        }
    }

    async fn resolve_customer(&self, customer_id: &str) -> CoreResult<String> {
        let customer = {
            let conn = self.db.conn.lock()?;
            customers::get(&conn, customer_id)?
                .ok_or_else(|| CoreError::not_found("customer", customer_id))?
        };
        customers::ensure_remote(&self.db, self.remote.as_ref(), self.timeout, &customer).await
    }

    async fn submit_create(&self, op_id: &str, order: Order) -> CoreResult<()> {
        let customer_remote_id = self.resolve_customer(&order.customer_id).await?;

        let mut outgoing = order.clone();
        if outgoing.numbering_tier.is_degraded() {
            outgoing.sequence_number = self.allocator.next_atomic().await?;
            outgoing.numbering_tier = NumberingTier::Atomic;
        }

        let ack = with_timeout(
            self.timeout,
            self.remote.upsert_by_natural_key(
                TABLE_ORDERS,
                &NaturalKey::new("local_id", order.id.clone()),
                orders::order_fields(&outgoing, &customer_remote_id),
                op_id,
            ),
        )
        .await?;

        // Remote wins for the number it assigned.
        let confirmed_number = ack
            .row
            .get("sequence_number")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| outgoing.sequence_number.clone());
        let confirmed_tier = ack
            .row
            .get("numbering_tier")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse::<NumberingTier>().ok())
            .unwrap_or(outgoing.numbering_tier);

        let conn = self.db.conn.lock()?;
        orders::mark_confirmed(
            &conn,
            &order.id,
            &confirmed_number,
            confirmed_tier,
            &ack.record_id,
        )?;
        if confirmed_number != order.sequence_number {
            info!(
                order_id = %order.id,
                placeholder = %order.sequence_number,
                confirmed = %confirmed_number,
                "Placeholder sequence number replaced"
            );
        }
        Ok(())
    }

    async fn submit_transition(
        &self,
        op_id: &str,
        order_id: &str,
        from: OrderStatus,
        to: OrderStatus,
        fields: Value,
    ) -> CoreResult<()> {
        let remote_id = {
            let conn = self.db.conn.lock()?;
            let order = orders::find_order(&conn, order_id)?
                .ok_or_else(|| CoreError::not_found("order", order_id))?;
            order.remote_id.ok_or_else(|| {
                CoreError::Conflict(format!("order {order_id} was never created remotely"))
            })?
        };

        let outcome = with_timeout(
            self.timeout,
            self.remote.conditional_update(
                TABLE_ORDERS,
                &remote_id,
                &Precondition::status(from),
                fields,
                op_id,
            ),
        )
        .await?;

        match outcome {
            UpdateOutcome::Applied => Ok(()),
            UpdateOutcome::Conflict { current } => match orders::remote_status(current.as_ref()) {
                Some(remote) if remote.check_transition(to) == TransitionCheck::AlreadyApplied => {
                    info!(order_id, remote_status = %remote, target = %to, "Transition already present remotely");
                    Ok(())
                }
                remote => {
                    let remote = remote.map_or("unknown".to_string(), |s| s.to_string());
                    warn!(order_id, remote_status = %remote, from = %from, to = %to, "Remote order diverged");
                    Err(RemoteError::Conflict(format!(
                        "order {order_id} is {remote} remotely, cannot apply {from} -> {to}"
                    ))
                    .into())
                }
            },
        }
    }

    async fn submit_ledger(
        &self,
        op_id: &str,
        customer_id: &str,
        record: &LoyaltyRecord,
        valet_delta: i64,
        credit_delta: i64,
    ) -> CoreResult<()> {
        let customer_remote_id = self.resolve_customer(customer_id).await?;
        with_timeout(
            self.timeout,
            self.remote.upsert_by_natural_key(
                TABLE_LOYALTY,
                &NaturalKey::new("customer_id", customer_remote_id.clone()),
                ledger::remote_fields(record, &customer_remote_id, valet_delta, credit_delta),
                op_id,
            ),
        )
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Background sync loop
// ---------------------------------------------------------------------------

/// Spawn the background loop: every `interval`, check the remote store and,
/// when it is reachable, run one reconciliation pass. Stops when `token` is
/// cancelled.
pub fn start_sync_loop(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "Sync loop started");
        let mut previous_online: Option<bool> = None;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let online = reconciler.check_reachability().await;
            if !online {
                if previous_online != Some(false) {
                    info!("Remote store unreachable; keeping queue pending");
                }
                previous_online = Some(false);
                continue;
            }
            if previous_online == Some(false) {
                info!("Remote store reachable again; resuming queued sync");
            }
            previous_online = Some(true);

            if let Err(e) = reconciler.reconcile_once().await {
                warn!(error = %e, "Sync pass failed");
            }
        }
        info!("Sync loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{CustomerRef, LineItem, SaveState};
    use crate::orders::{CreateOrderRequest, OrderService, TransitionExtra};
    use crate::remote::MemoryRemoteStore;
    use serde_json::json;

    fn service(remote: Arc<MemoryRemoteStore>) -> OrderService {
        let db = Arc::new(db::open_in_memory().unwrap());
        let config = Config {
            remote_timeout_ms: 500,
            ..Config::default()
        };
        OrderService::new(db, remote, &config)
    }

    fn request(phone: &str, quantity: i64) -> CreateOrderRequest {
        CreateOrderRequest::new(
            CustomerRef::new(phone, None),
            vec![LineItem::new("coat", quantity, 900)],
        )
    }

    #[tokio::test]
    async fn test_offline_order_gets_confirmed_number_on_reconcile() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_online(false);
        let svc = service(remote.clone());

        let created = svc.create_order(request("5550100", 1)).await.unwrap();
        assert_eq!(created.save_state, SaveState::SavedOffline);
        assert!(created.order.pending_sync);
        assert_eq!(created.order.numbering_tier, NumberingTier::Timestamp);

        remote.set_online(true);
        let report = svc.reconciler().reconcile_once().await.unwrap();
        assert_eq!(report.confirmed, 1);

        let order = svc.get_order(&created.order.id).unwrap();
        assert!(!order.pending_sync);
        assert_eq!(order.sequence_number, "000001");
        assert_eq!(order.numbering_tier, NumberingTier::Atomic);
        assert!(order.remote_id.is_some());
        assert_eq!(svc.get_sync_backlog().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_lifecycle_replays_in_order() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_online(false);
        let svc = service(remote.clone());

        let order = svc.create_order(request("5550100", 9)).await.unwrap().order;
        for target in [OrderStatus::Processing, OrderStatus::Ready, OrderStatus::Delivered] {
            let outcome = svc
                .transition(&order.id, target, TransitionExtra::default())
                .await
                .unwrap();
            assert_eq!(outcome.save_state, SaveState::SavedOffline);
        }
        assert_eq!(svc.get_sync_backlog().unwrap(), 5);
        assert_eq!(svc.loyalty_record(&order.customer_id).unwrap().free_credits, 1);

        remote.set_online(true);
        let report = svc.reconciler().reconcile_once().await.unwrap();
        assert_eq!(report.confirmed, 5);

        let remote_id = svc.get_order(&order.id).unwrap().remote_id.unwrap();
        let row = remote.row(TABLE_ORDERS, &remote_id).unwrap();
        assert_eq!(row["status"], "delivered");
        assert_eq!(row["is_paid"], true);
        assert_eq!(remote.rows(TABLE_LOYALTY)[0]["free_credits"], 1);
    }

    #[tokio::test]
    async fn test_lost_ack_is_applied_once() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let svc = service(remote.clone());
        svc.create_order(request("5550100", 1)).await.unwrap();

        remote.lose_next_ack();
        let req = request("5550100", 2);
        let op_id = req.op_id.clone();
        let created = svc.create_order(req).await.unwrap();
        assert_eq!(created.save_state, SaveState::SavedOffline);
        assert_eq!(remote.applications(&op_id), 1);

        let report = svc.reconciler().reconcile_once().await.unwrap();
        assert_eq!(report.confirmed, 1);
        assert_eq!(remote.applications(&op_id), 1);
        assert_eq!(remote.rows(TABLE_ORDERS).len(), 2);

        let order = svc.get_order(&created.order.id).unwrap();
        assert_eq!(order.sequence_number, "000002");
        assert!(!order.pending_sync);
    }

    #[tokio::test]
    async fn test_failure_blocks_rest_of_customer_queue() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_online(false);
        let svc = service(remote.clone());

        let order = svc.create_order(request("5550100", 1)).await.unwrap().order;
        svc.transition(&order.id, OrderStatus::Processing, TransitionExtra::default())
            .await
            .unwrap();
        svc.create_order(request("5550111", 1)).await.unwrap();

        let report = svc.reconciler().reconcile_once().await.unwrap();
        assert_eq!(report.retried, 2);
        assert_eq!(report.blocked, 1);
        assert_eq!(report.confirmed, 0);

        let status = svc.sync_status().unwrap();
        assert_eq!(status.pending, 3);
        assert!(status.last_error.is_some());
        assert!(status.oldest_pending_at.is_some());

        remote.set_online(true);
        let report = svc.reconciler().reconcile_once().await.unwrap();
        assert_eq!(report.confirmed, 0, "entries are still backing off");
        assert_eq!(report.blocked, 3);
    }

    #[tokio::test]
    async fn test_diverged_transition_is_dead_lettered_and_requeueable() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let svc = service(remote.clone());
        let order = svc.create_order(request("5550100", 1)).await.unwrap().order;
        let remote_id = order.remote_id.clone().unwrap();

        remote.set_online(false);
        svc.transition(&order.id, OrderStatus::Processing, TransitionExtra::default())
            .await
            .unwrap();
        remote.set_online(true);
        remote.patch_row(TABLE_ORDERS, &remote_id, json!({ "status": "cancelled" }));

        let report = svc.reconciler().reconcile_once().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(svc.get_sync_backlog().unwrap(), 0);

        let letters = svc.queue().list_dead_letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].last_error.as_deref().unwrap().contains("cancelled"));

        remote.patch_row(TABLE_ORDERS, &remote_id, json!({ "status": "pending" }));
        svc.queue().requeue_dead_letter(&letters[0].op_id).unwrap();
        let report = svc.reconciler().force_sync().await.unwrap();
        assert_eq!(report.confirmed, 1);
        assert_eq!(remote.row(TABLE_ORDERS, &remote_id).unwrap()["status"], "processing");
    }

    #[tokio::test]
    async fn test_transition_with_lost_ack_is_replayed_once() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let svc = service(remote.clone());
        let order = svc.create_order(request("5550100", 1)).await.unwrap().order;
        let remote_id = order.remote_id.clone().unwrap();

        remote.lose_next_ack();
        let extra = TransitionExtra {
            op_id: Some("op-processing".to_string()),
            ..TransitionExtra::default()
        };
        let outcome = svc
            .transition(&order.id, OrderStatus::Processing, extra)
            .await
            .unwrap();
        assert_eq!(outcome.save_state, SaveState::SavedOffline);
        assert_eq!(remote.applications("op-processing"), 1);
        assert_eq!(svc.get_sync_backlog().unwrap(), 1);

        let report = svc.reconciler().reconcile_once().await.unwrap();
        assert_eq!(report.confirmed, 1);
        assert_eq!(remote.applications("op-processing"), 1);
        assert_eq!(remote.row(TABLE_ORDERS, &remote_id).unwrap()["status"], "processing");
        assert_eq!(svc.get_sync_backlog().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_ack_during_replay_is_retried_not_dead_lettered() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_online(false);
        let svc = service(remote.clone());
        svc.create_order(request("5550100", 1)).await.unwrap();

        remote.set_online(true);
        remote.garble_next_ack();
        let report = svc.reconciler().reconcile_once().await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.dead_lettered, 0);
        assert_eq!(svc.get_sync_backlog().unwrap(), 1);
        assert!(svc.queue().list_dead_letters().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_locally_failing_entry_does_not_mark_store_reachable() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let svc = service(remote.clone());
        svc.queue()
            .enqueue(
                "op-orphan",
                "customer:ghost",
                &MutationPayload::TransitionStatus {
                    order_id: "missing-order".to_string(),
                    from: OrderStatus::Pending,
                    to: OrderStatus::Processing,
                    at: Utc::now(),
                    fields: json!({ "status": "processing" }),
                },
            )
            .unwrap();

        let report = svc.reconciler().reconcile_once().await.unwrap();
        assert_eq!(report.dead_lettered, 1);

        let status = svc.sync_status().unwrap();
        assert!(status.last_sync_at.is_none());
        assert!(!status.is_online);
        assert!(status.last_error.unwrap().contains("missing-order"));
    }

    #[tokio::test]
    async fn test_sync_loop_drains_queue_and_stops_on_cancel() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_online(false);
        let svc = service(remote.clone());
        svc.create_order(request("5550100", 1)).await.unwrap();

        let token = CancellationToken::new();
        let handle = start_sync_loop(svc.reconciler(), Duration::from_millis(10), token.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(svc.get_sync_backlog().unwrap(), 1);
        assert!(!svc.sync_status().unwrap().is_online);

        remote.set_online(true);
        let mut drained = false;
        for _ in 0..100 {
            if svc.get_sync_backlog().unwrap() == 0 {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(drained, "sync loop should drain the queue once online");
        let status = svc.sync_status().unwrap();
        assert!(status.is_online);
        assert!(status.last_sync_at.is_some());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
