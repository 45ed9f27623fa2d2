//! Order intake and lifecycle.
//!
//! `OrderService` is the entry point for callers: it creates tickets, moves
//! them through `Pending -> Processing -> Ready -> Delivered` (or `Cancelled`),
//! applies the loyalty ledger on delivery and decides per call whether a write
//! reaches the remote store now or waits in the pending queue.
//!
//! Transitions on one order are serialized through a per-order lock; delivery
//! additionally takes the customer's ledger lock (always order first, then
//! customer).

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::customers;
use crate::db::{self, DbState};
use crate::error::{CoreError, CoreResult, ValidationError};
use crate::ledger::{self, LoyaltyLedger};
use crate::locks::KeyedLocks;
use crate::models::{
    normalize_phone, Customer, CustomerRef, LedgerResult, LineItem, LoyaltyRecord, NumberingTier,
    Order, OrderStatus, PaymentMethod, SaveState, TransitionCheck,
};
use crate::queue::{self, customer_key, MutationPayload, PendingQueue};
use crate::remote::{
    with_timeout, Filter, NaturalKey, Precondition, RemoteStore, UpdateOutcome, TABLE_LOYALTY,
    TABLE_ORDERS,
};
use crate::sequence::SequenceAllocator;
use crate::sync::{Reconciler, SyncStatus};

/// Fresh idempotency key for a user action.
pub fn new_op_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Requests and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    /// Generated once when the user submits the ticket; reused on every retry.
    pub op_id: String,
    pub customer: CustomerRef,
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub use_free_credit: bool,
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
}

impl CreateOrderRequest {
    pub fn new(customer: CustomerRef, line_items: Vec<LineItem>) -> Self {
        Self {
            op_id: new_op_id(),
            customer,
            line_items,
            use_free_credit: false,
            payment_method: None,
        }
    }

    pub fn with_op_id(mut self, op_id: impl Into<String>) -> Self {
        self.op_id = op_id.into();
        self
    }

    pub fn with_free_credit(mut self) -> Self {
        self.use_free_credit = true;
        self
    }

    pub fn with_payment_method(mut self, method: PaymentMethod) -> Self {
        self.payment_method = Some(method);
        self
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.line_items.is_empty() {
            return Err(ValidationError::EmptyOrder);
        }
        if let Some(bad) = self
            .line_items
            .iter()
            .find(|item| item.quantity <= 0 || item.unit_price < 0)
        {
            return Err(ValidationError::InvalidQuantity(bad.service.clone()));
        }
        if normalize_phone(&self.customer.phone).is_empty() {
            return Err(ValidationError::MissingCustomerPhone);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderOutcome {
    pub order: Order,
    pub save_state: SaveState,
    /// The request's op id matched an order created earlier.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionExtra {
    pub cancel_reason: Option<String>,
    pub payment_method: Option<PaymentMethod>,
    /// Idempotency key for this transition; generated when absent.
    pub op_id: Option<String>,
}

impl TransitionExtra {
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self {
            cancel_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn paid_with(method: PaymentMethod) -> Self {
        Self {
            payment_method: Some(method),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub order: Order,
    pub save_state: SaveState,
    /// False when the order was already at (or past) the target.
    pub applied: bool,
    pub ledger: Option<LedgerResult>,
    /// A free-credit delivery found no credit left and accrued normally.
    pub credit_fallback: bool,
}

// ---------------------------------------------------------------------------
// Local order rows
// ---------------------------------------------------------------------------

const ORDER_COLUMNS: &str = "id, op_id, sequence_number, numbering_tier, customer_id, status,
     line_items, is_paid, payment_method, total_amount, uses_free_credit, created_at,
     updated_at, delivered_at, cancel_reason, pending_sync, remote_id, version";

fn map_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
    let line_items: String = row.get(6)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;
    let delivered_at: Option<String> = row.get(13)?;
    Ok(Order {
        id: row.get(0)?,
        op_id: row.get(1)?,
        sequence_number: row.get(2)?,
        numbering_tier: row.get(3)?,
        customer_id: row.get(4)?,
        status: row.get(5)?,
        line_items: serde_json::from_str(&line_items).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?,
        is_paid: row.get(7)?,
        payment_method: row.get(8)?,
        total_amount: row.get(9)?,
        uses_free_credit: row.get(10)?,
        created_at: db::parse_ts(&created_at)?,
        updated_at: db::parse_ts(&updated_at)?,
        delivered_at: db::parse_opt_ts(delivered_at)?,
        cancel_reason: row.get(14)?,
        pending_sync: row.get(15)?,
        remote_id: row.get(16)?,
        version: row.get(17)?,
    })
}

/// Look an order up by local id, falling back to its remote id.
pub(crate) fn find_order(conn: &Connection, id: &str) -> CoreResult<Option<Order>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE id = ?1 OR remote_id = ?1
                 ORDER BY (id = ?1) DESC LIMIT 1"
            ),
            params![id],
            map_order,
        )
        .optional()?)
}

fn find_by_op_id(conn: &Connection, op_id: &str) -> CoreResult<Option<Order>> {
    Ok(conn
        .query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE op_id = ?1"),
            params![op_id],
            map_order,
        )
        .optional()?)
}

fn insert_order(conn: &Connection, order: &Order) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO orders
            (id, op_id, sequence_number, numbering_tier, customer_id, status, line_items,
             is_paid, payment_method, total_amount, uses_free_credit, ledger_applied,
             created_at, updated_at, delivered_at, cancel_reason, pending_sync, remote_id, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            order.id,
            order.op_id,
            order.sequence_number,
            order.numbering_tier,
            order.customer_id,
            order.status,
            serde_json::to_string(&order.line_items)?,
            order.is_paid,
            order.payment_method,
            order.total_amount,
            order.uses_free_credit,
            db::ts(order.created_at),
            db::ts(order.updated_at),
            order.delivered_at.map(db::ts),
            order.cancel_reason,
            order.pending_sync,
            order.remote_id,
            order.version,
        ],
    )?;
    Ok(())
}

/// Write the fields a transition may change, guarded by the version read
/// under the order lock.
fn update_transition(
    conn: &Connection,
    order: &Order,
    expected_version: i64,
    mark_ledger_applied: bool,
) -> CoreResult<()> {
    let updated = conn.execute(
        "UPDATE orders
         SET status = ?1,
             is_paid = ?2,
             payment_method = ?3,
             total_amount = ?4,
             uses_free_credit = ?5,
             delivered_at = ?6,
             cancel_reason = ?7,
             updated_at = ?8,
             version = ?9,
             ledger_applied = CASE WHEN ?10 THEN 1 ELSE ledger_applied END
         WHERE id = ?11 AND version = ?12",
        params![
            order.status,
            order.is_paid,
            order.payment_method,
            order.total_amount,
            order.uses_free_credit,
            order.delivered_at.map(db::ts),
            order.cancel_reason,
            db::ts(order.updated_at),
            order.version,
            mark_ledger_applied,
            order.id,
            expected_version,
        ],
    )?;
    if updated == 0 {
        return Err(CoreError::Conflict(format!(
            "order {} changed while being updated",
            order.id
        )));
    }
    Ok(())
}

fn ledger_applied(conn: &Connection, order_id: &str) -> CoreResult<bool> {
    Ok(conn.query_row(
        "SELECT ledger_applied FROM orders WHERE id = ?1",
        params![order_id],
        |row| row.get(0),
    )?)
}

/// Record the remote store's acknowledgement of a queued creation. The
/// confirmed sequence number replaces the local placeholder.
pub(crate) fn mark_confirmed(
    conn: &Connection,
    order_id: &str,
    sequence_number: &str,
    tier: NumberingTier,
    remote_id: &str,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE orders
         SET sequence_number = ?1, numbering_tier = ?2, remote_id = ?3, pending_sync = 0
         WHERE id = ?4",
        params![sequence_number, tier, remote_id, order_id],
    )?;
    Ok(())
}

/// Remote representation of a whole order.
pub(crate) fn order_fields(order: &Order, customer_remote_id: &str) -> Value {
    json!({
        "local_id": order.id,
        "op_id": order.op_id,
        "sequence_number": order.sequence_number,
        "numbering_tier": order.numbering_tier,
        "customer_id": customer_remote_id,
        "status": order.status,
        "line_items": order.line_items,
        "is_paid": order.is_paid,
        "payment_method": order.payment_method,
        "total_amount": order.total_amount,
        "uses_free_credit": order.uses_free_credit,
        "created_at": order.created_at,
        "updated_at": order.updated_at,
        "delivered_at": order.delivered_at,
        "cancel_reason": order.cancel_reason,
    })
}

/// Remote fields written by a status transition.
pub(crate) fn transition_fields(order: &Order) -> Value {
    json!({
        "status": order.status,
        "is_paid": order.is_paid,
        "payment_method": order.payment_method,
        "total_amount": order.total_amount,
        "uses_free_credit": order.uses_free_credit,
        "delivered_at": order.delivered_at,
        "cancel_reason": order.cancel_reason,
        "updated_at": order.updated_at,
    })
}

pub(crate) fn remote_status(row: Option<&Value>) -> Option<OrderStatus> {
    row?.get("status")?.as_str()?.parse().ok()
}

fn gross_total(items: &[LineItem]) -> i64 {
    items
        .iter()
        .fold(0_i64, |acc, item| acc.saturating_add(item.line_total()))
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct OrderService {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteStore>,
    allocator: Arc<SequenceAllocator>,
    ledger: Arc<LoyaltyLedger>,
    queue: Arc<PendingQueue>,
    reconciler: Arc<Reconciler>,
    locks: KeyedLocks,
    timeout: Duration,
}

impl OrderService {
    pub fn new(db: Arc<DbState>, remote: Arc<dyn RemoteStore>, config: &Config) -> Self {
        let allocator = Arc::new(SequenceAllocator::new(db.clone(), remote.clone(), config));
        let ledger = Arc::new(LoyaltyLedger::new(db.clone(), config));
        let queue = Arc::new(PendingQueue::new(db.clone(), config));
        let reconciler = Arc::new(Reconciler::new(
            db.clone(),
            remote.clone(),
            allocator.clone(),
            queue.clone(),
            config,
        ));
        Self {
            db,
            remote,
            allocator,
            ledger,
            queue,
            reconciler,
            locks: KeyedLocks::new(),
            timeout: config.remote_timeout(),
        }
    }

    pub fn allocator(&self) -> &Arc<SequenceAllocator> {
        &self.allocator
    }

    pub fn ledger(&self) -> &Arc<LoyaltyLedger> {
        &self.ledger
    }

    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    /// Handle for `sync::start_sync_loop`.
    pub fn reconciler(&self) -> Arc<Reconciler> {
        self.reconciler.clone()
    }

    // -- creation ----------------------------------------------------------

    pub async fn create_order(&self, request: CreateOrderRequest) -> CoreResult<CreateOrderOutcome> {
        request.validate()?;
        let _op_guard = self.locks.lock(&format!("op:{}", request.op_id)).await;

        let now = Utc::now();
        let (customer, queued_ahead) = {
            let conn = self.db.conn.lock()?;
            if let Some(existing) = find_by_op_id(&conn, &request.op_id)? {
                info!(op_id = %request.op_id, order_id = %existing.id, "Duplicate create request, returning existing order");
                let save_state = if existing.pending_sync {
                    SaveState::SavedOffline
                } else {
                    SaveState::Confirmed
                };
                return Ok(CreateOrderOutcome {
                    order: existing,
                    save_state,
                    deduplicated: true,
                });
            }
            let customer = customers::resolve_local(&conn, &request.customer, now)?;
            let queued_ahead = queue::has_pending_for(&conn, &customer_key(&customer.id))?;
            (customer, queued_ahead)
        };

        if request.use_free_credit {
            let record = self.ledger.get_record(&customer.id)?;
            if record.free_credits < 1 {
                return Err(CoreError::InsufficientCredit {
                    customer_id: customer.id,
                    available: record.free_credits,
                });
            }
        }

        let number = self.allocator.next_number().await?;
        let (total_amount, payment_method) = if request.use_free_credit {
            (
                0,
                Some(request.payment_method.unwrap_or(PaymentMethod::LoyaltyCredit)),
            )
        } else {
            (gross_total(&request.line_items), request.payment_method)
        };

        let mut order = Order {
            id: Uuid::new_v4().to_string(),
            op_id: request.op_id.clone(),
            sequence_number: number.value,
            numbering_tier: number.tier,
            customer_id: customer.id.clone(),
            status: OrderStatus::Pending,
            line_items: request.line_items,
            is_paid: false,
            payment_method,
            total_amount,
            uses_free_credit: request.use_free_credit,
            created_at: now,
            updated_at: now,
            delivered_at: None,
            cancel_reason: None,
            pending_sync: true,
            remote_id: None,
            version: 1,
        };

        // Degraded numbers are placeholders; the reconciler swaps them for an
        // atomic number before the order reaches the remote store.
        if !queued_ahead && !order.numbering_tier.is_degraded() {
            self.push_new_order(&mut order, &customer).await?;
        }

        {
            let mut conn = self.db.conn.lock()?;
            let tx = conn.transaction()?;
            insert_order(&tx, &order)?;
            if order.pending_sync {
                queue::enqueue_in(
                    &tx,
                    &order.op_id,
                    &customer_key(&order.customer_id),
                    &MutationPayload::CreateOrder {
                        order: order.clone(),
                    },
                    self.queue.retry_base_delay_ms(),
                    now,
                )?;
            }
            tx.commit()?;
        }

        let save_state = if order.pending_sync {
            SaveState::SavedOffline
        } else {
            SaveState::Confirmed
        };
        info!(
            order_id = %order.id,
            sequence_number = %order.sequence_number,
            tier = order.numbering_tier.as_str(),
            save_state = ?save_state,
            "Order created"
        );
        Ok(CreateOrderOutcome {
            order,
            save_state,
            deduplicated: false,
        })
    }

    /// Try to write a new order straight to the remote store. Recoverable
    /// failures leave `order.pending_sync` set; permanent ones are returned.
    async fn push_new_order(&self, order: &mut Order, customer: &Customer) -> CoreResult<()> {
        let customer_remote_id =
            match customers::ensure_remote(&self.db, self.remote.as_ref(), self.timeout, customer)
                .await
            {
                Ok(id) => id,
                Err(CoreError::Remote(e)) if e.is_transient() => {
                    warn!(order_id = %order.id, error = %e, "Customer not resolvable remotely, saving order offline");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

        let result = with_timeout(
            self.timeout,
            self.remote.upsert_by_natural_key(
                TABLE_ORDERS,
                &NaturalKey::new("local_id", order.id.clone()),
                order_fields(order, &customer_remote_id),
                &order.op_id,
            ),
        )
        .await;

        match result {
            Ok(ack) => {
                if let Some(confirmed) = ack.row.get("sequence_number").and_then(Value::as_str) {
                    order.sequence_number = confirmed.to_string();
                }
                order.remote_id = Some(ack.record_id);
                order.pending_sync = false;
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!(order_id = %order.id, error = %e, "Remote create failed, saving order offline");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // -- lifecycle ---------------------------------------------------------

    /// Move an order to `target`. Replays of an already-applied transition
    /// succeed without side effects.
    pub async fn transition(
        &self,
        order_id: &str,
        target: OrderStatus,
        extra: TransitionExtra,
    ) -> CoreResult<TransitionOutcome> {
        let local_id = self.get_order(order_id)?.id;
        let order_guard = self.locks.lock(&local_id).await;
        let current = self.get_order(&local_id)?;

        match current.status.check_transition(target) {
            TransitionCheck::Invalid => {
                return Err(ValidationError::InvalidTransition {
                    from: current.status,
                    to: target,
                }
                .into());
            }
            TransitionCheck::AlreadyApplied => {
                debug!(order_id = %current.id, status = %current.status, target = %target, "Transition already applied");
                let save_state = self.save_state_of(&current)?;
                return Ok(TransitionOutcome {
                    order: current,
                    save_state,
                    applied: false,
                    ledger: None,
                    credit_fallback: false,
                });
            }
            TransitionCheck::Apply => {}
        }

        let cancel_reason = extra
            .cancel_reason
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string);
        if target == OrderStatus::Cancelled && cancel_reason.is_none() {
            return Err(ValidationError::MissingCancelReason.into());
        }

        let delivering = target == OrderStatus::Delivered;
        let customer_guard = if delivering {
            Some(self.ledger.lock_customer(&current.customer_id).await)
        } else {
            None
        };

        let now = Utc::now();
        let op_id = extra.op_id.clone().unwrap_or_else(new_op_id);
        let mut next = current.clone();
        next.status = target;
        next.updated_at = now;
        next.version += 1;

        let mut credit_fallback = false;
        let (queue_locally, apply_ledger) = {
            let conn = self.db.conn.lock()?;
            match target {
                OrderStatus::Delivered => {
                    next.is_paid = true;
                    next.delivered_at = Some(now);
                    if next.uses_free_credit {
                        let available = ledger::load_record(&conn, &next.customer_id)?
                            .map_or(0, |r| r.free_credits);
                        if available < 1 {
                            warn!(order_id = %next.id, customer_id = %next.customer_id, "No free credit left at delivery, accruing normally");
                            next.uses_free_credit = false;
                            next.total_amount = gross_total(&next.line_items);
                            if next.payment_method == Some(PaymentMethod::LoyaltyCredit) {
                                next.payment_method = None;
                            }
                            credit_fallback = true;
                        }
                    }
                    if !next.uses_free_credit {
                        if let Some(method) = extra.payment_method {
                            next.payment_method = Some(method);
                        }
                    }
                }
                OrderStatus::Cancelled => next.cancel_reason = cancel_reason,
                _ => {}
            }
            let queue_locally = current.pending_sync
                || current.remote_id.is_none()
                || queue::has_pending_for(&conn, &customer_key(&current.customer_id))?;
            let apply_ledger = delivering && !ledger_applied(&conn, &current.id)?;
            (queue_locally, apply_ledger)
        };

        let mut save_state = SaveState::SavedOffline;
        if let (false, Some(remote_id)) = (queue_locally, current.remote_id.as_deref()) {
            let result = with_timeout(
                self.timeout,
                self.remote.conditional_update(
                    TABLE_ORDERS,
                    remote_id,
                    &Precondition::status(current.status),
                    transition_fields(&next),
                    &op_id,
                ),
            )
            .await;
            match result {
                Ok(UpdateOutcome::Applied) => save_state = SaveState::Confirmed,
                Ok(UpdateOutcome::Conflict { current: row }) => match remote_status(row.as_ref()) {
                    Some(remote) if remote.check_transition(target) == TransitionCheck::AlreadyApplied => {
                        warn!(order_id = %current.id, remote_status = %remote, target = %target, "Order already advanced remotely, mirroring");
                        save_state = SaveState::Confirmed;
                    }
                    remote => {
                        let remote = remote.map_or("unknown".to_string(), |s| s.to_string());
                        return Err(CoreError::Conflict(format!(
                            "order {} is {remote} remotely, cannot move to {target}",
                            current.id
                        )));
                    }
                },
                Err(e) if e.is_transient() => {
                    warn!(order_id = %current.id, error = %e, "Remote transition failed, queueing");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let ledger_result = {
            let mut conn = self.db.conn.lock()?;
            let tx = conn.transaction()?;

            // The remote row being delivered already says nothing about the
            // ledger; `ledger_applied` is the only guard, so apply it here.
            let ledger_result = if apply_ledger {
                Some(ledger::apply_in(
                    &tx,
                    &next.customer_id,
                    next.valet_count(),
                    next.uses_free_credit,
                    self.ledger.month_of(now),
                    now,
                )?)
            } else {
                None
            };

            update_transition(&tx, &next, current.version, delivering)?;

            let entity = customer_key(&next.customer_id);
            if save_state == SaveState::SavedOffline {
                queue::enqueue_in(
                    &tx,
                    &op_id,
                    &entity,
                    &MutationPayload::TransitionStatus {
                        order_id: next.id.clone(),
                        from: current.status,
                        to: target,
                        at: now,
                        fields: transition_fields(&next),
                    },
                    self.queue.retry_base_delay_ms(),
                    now,
                )?;
            }
            if let Some(result) = &ledger_result {
                queue::enqueue_in(
                    &tx,
                    &format!("{op_id}:ledger"),
                    &entity,
                    &MutationPayload::LedgerAdjust {
                        customer_id: next.customer_id.clone(),
                        record: result.record.clone(),
                        valet_delta: result.valet_delta,
                        credit_delta: result.credit_delta(),
                        order_id: Some(next.id.clone()),
                    },
                    self.queue.retry_base_delay_ms(),
                    now,
                )?;
            }
            tx.commit()?;
            ledger_result
        };

        info!(
            order_id = %next.id,
            from = %current.status,
            to = %target,
            save_state = ?save_state,
            "Order transitioned"
        );

        drop(customer_guard);
        drop(order_guard);

        if ledger_result.is_some() && save_state == SaveState::Confirmed {
            self.flush_customer(&next.customer_id).await;
        }

        Ok(TransitionOutcome {
            order: next,
            save_state,
            applied: true,
            ledger: ledger_result,
            credit_fallback,
        })
    }

    // -- loyalty -----------------------------------------------------------

    /// Spend one free credit for `customer_id` outside an order.
    pub async fn redeem_credit(&self, customer_id: &str) -> CoreResult<LedgerResult> {
        let now = Utc::now();
        let (result, queued_ahead) = {
            let _guard = self.ledger.lock_customer(customer_id).await;
            let mut conn = self.db.conn.lock()?;
            if customers::get(&conn, customer_id)?.is_none() {
                return Err(CoreError::not_found("customer", customer_id));
            }
            let entity = customer_key(customer_id);
            let queued_ahead = queue::has_pending_for(&conn, &entity)?;

            let tx = conn.transaction()?;
            let result = ledger::apply_in(&tx, customer_id, 0, true, self.ledger.month_of(now), now)?;
            queue::enqueue_in(
                &tx,
                &new_op_id(),
                &entity,
                &MutationPayload::LedgerAdjust {
                    customer_id: customer_id.to_string(),
                    record: result.record.clone(),
                    valet_delta: 0,
                    credit_delta: result.credit_delta(),
                    order_id: None,
                },
                self.queue.retry_base_delay_ms(),
                now,
            )?;
            tx.commit()?;
            (result, queued_ahead)
        };

        info!(customer_id, free_credits = result.record.free_credits, "Free credit redeemed");
        if !queued_ahead {
            self.flush_customer(customer_id).await;
        }
        Ok(result)
    }

    pub fn loyalty_record(&self, customer_id: &str) -> CoreResult<LoyaltyRecord> {
        self.ledger.get_record(customer_id)
    }

    /// Replace the cached ledger record with the remote one. Refused while
    /// local ledger changes for the customer are still queued.
    pub async fn refresh_ledger_from_remote(&self, customer_id: &str) -> CoreResult<LoyaltyRecord> {
        let _guard = self.ledger.lock_customer(customer_id).await;
        let customer = {
            let conn = self.db.conn.lock()?;
            if queue::has_pending_for(&conn, &customer_key(customer_id))? {
                return Err(CoreError::Conflict(format!(
                    "customer {customer_id} has unsynced changes"
                )));
            }
            customers::get(&conn, customer_id)?
                .ok_or_else(|| CoreError::not_found("customer", customer_id))?
        };

        let remote_id =
            customers::ensure_remote(&self.db, self.remote.as_ref(), self.timeout, &customer)
                .await?;
        let rows = with_timeout(
            self.timeout,
            self.remote.query(
                TABLE_LOYALTY,
                &Filter::new().eq("customer_id", remote_id.as_str()).limit(1),
            ),
        )
        .await?;
        let record = match rows.first() {
            Some(row) => ledger::record_from_remote(customer_id, row)?,
            None => LoyaltyRecord::empty(customer_id),
        };

        let conn = self.db.conn.lock()?;
        ledger::replace_in(&conn, &record)?;
        Ok(record)
    }

    async fn flush_customer(&self, customer_id: &str) {
        let entity = customer_key(customer_id);
        match self.reconciler.flush_entity(&entity).await {
            Ok(report) => debug!(customer_id, confirmed = report.confirmed, "Flushed customer queue"),
            Err(e) => warn!(customer_id, error = %e, "Immediate sync failed; left queued"),
        }
    }

    // -- queries -----------------------------------------------------------

    /// Order by local id or remote id.
    pub fn get_order(&self, order_id: &str) -> CoreResult<Order> {
        let conn = self.db.conn.lock()?;
        find_order(&conn, order_id)?.ok_or_else(|| CoreError::not_found("order", order_id))
    }

    pub fn list_orders_for_customer(&self, customer_id: &str) -> CoreResult<Vec<Order>> {
        let conn = self.db.conn.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE customer_id = ?1
             ORDER BY created_at ASC, sequence_number ASC"
        ))?;
        let orders = stmt
            .query_map(params![customer_id], map_order)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(orders)
    }

    pub fn find_customer_by_phone(&self, phone: &str) -> CoreResult<Option<Customer>> {
        let conn = self.db.conn.lock()?;
        customers::find_by_phone(&conn, phone)
    }

    /// Count of mutations not yet confirmed by the remote store.
    pub fn get_sync_backlog(&self) -> CoreResult<i64> {
        self.queue.backlog()
    }

    pub fn sync_status(&self) -> CoreResult<SyncStatus> {
        self.reconciler.status()
    }

    fn save_state_of(&self, order: &Order) -> CoreResult<SaveState> {
        let conn = self.db.conn.lock()?;
        if order.pending_sync || queue::has_pending_for_order(&conn, &order.id)? {
            Ok(SaveState::SavedOffline)
        } else {
            Ok(SaveState::Confirmed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;
    use crate::models::LedgerEffect;

    fn service(remote: Arc<MemoryRemoteStore>) -> OrderService {
        let db = Arc::new(db::open_in_memory().unwrap());
        let config = Config {
            remote_timeout_ms: 500,
            ..Config::default()
        };
        OrderService::new(db, remote, &config)
    }

    fn shirts(quantity: i64) -> Vec<LineItem> {
        vec![LineItem::new("shirt", quantity, 300)]
    }

    fn request(phone: &str, quantity: i64) -> CreateOrderRequest {
        CreateOrderRequest::new(CustomerRef::new(phone, Some("Ana")), shirts(quantity))
    }

    async fn deliver(svc: &OrderService, order_id: &str) -> TransitionOutcome {
        svc.transition(order_id, OrderStatus::Processing, TransitionExtra::default())
            .await
            .unwrap();
        svc.transition(order_id, OrderStatus::Ready, TransitionExtra::default())
            .await
            .unwrap();
        svc.transition(
            order_id,
            OrderStatus::Delivered,
            TransitionExtra::paid_with(PaymentMethod::Cash),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_online_create_is_confirmed() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let svc = service(remote.clone());

        let outcome = svc.create_order(request("555-0100", 2)).await.unwrap();
        assert_eq!(outcome.save_state, SaveState::Confirmed);
        assert!(!outcome.order.pending_sync);
        assert_eq!(outcome.order.sequence_number, "000001");
        assert_eq!(outcome.order.total_amount, 600);
        assert!(outcome.order.remote_id.is_some());
        assert_eq!(svc.get_sync_backlog().unwrap(), 0);
        assert_eq!(remote.rows(TABLE_ORDERS).len(), 1);
    }

    #[tokio::test]
    async fn test_create_validation_never_queues() {
        let svc = service(Arc::new(MemoryRemoteStore::new()));

        let empty = CreateOrderRequest::new(CustomerRef::new("5550100", None), vec![]);
        assert!(svc.create_order(empty).await.unwrap_err().is_validation());

        let zero = request("5550100", 0);
        assert!(svc.create_order(zero).await.unwrap_err().is_validation());

        let no_phone = request("", 1);
        assert!(svc.create_order(no_phone).await.unwrap_err().is_validation());

        assert_eq!(svc.get_sync_backlog().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_repeated_create_with_same_op_id_is_deduplicated() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let svc = service(remote.clone());
        let req = request("5550100", 1).with_op_id("intent-1");

        let first = svc.create_order(req.clone()).await.unwrap();
        let second = svc.create_order(req).await.unwrap();

        assert!(second.deduplicated);
        assert_eq!(first.order.id, second.order.id);
        assert_eq!(remote.applications("intent-1"), 1);
        assert_eq!(remote.counter("order_sequence"), 1);
    }

    #[tokio::test]
    async fn test_unreadable_create_ack_is_saved_offline_and_replayed_once() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let svc = service(remote.clone());
        svc.create_order(request("5550100", 1)).await.unwrap();

        remote.garble_next_ack();
        let req = request("5550100", 2);
        let op_id = req.op_id.clone();
        let created = svc.create_order(req).await.unwrap();
        assert_eq!(created.save_state, SaveState::SavedOffline);
        assert_eq!(remote.applications(&op_id), 1);
        assert!(svc.get_order(&created.order.id).unwrap().pending_sync);
        assert_eq!(svc.get_sync_backlog().unwrap(), 1);

        let report = svc.reconciler().reconcile_once().await.unwrap();
        assert_eq!(report.confirmed, 1);
        assert_eq!(remote.applications(&op_id), 1);
        assert_eq!(remote.rows(TABLE_ORDERS).len(), 2);
        assert!(!svc.get_order(&created.order.id).unwrap().pending_sync);
    }

    #[tokio::test]
    async fn test_offline_create_is_queued_with_placeholder() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_online(false);
        let svc = service(remote);

        let outcome = svc.create_order(request("5550100", 1)).await.unwrap();
        assert_eq!(outcome.save_state, SaveState::SavedOffline);
        assert!(outcome.order.pending_sync);
        assert!(outcome.order.numbering_tier.is_degraded());
        assert_eq!(svc.get_sync_backlog().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_full_lifecycle_applies_ledger_once() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let svc = service(remote.clone());
        let created = svc.create_order(request("5550100", 9)).await.unwrap().order;

        let delivered = deliver(&svc, &created.id).await;
        assert_eq!(delivered.save_state, SaveState::Confirmed);
        assert!(delivered.order.is_paid);
        let delivered_at = delivered.order.delivered_at.unwrap();
        let ledger = delivered.ledger.unwrap();
        assert_eq!(ledger.credits_granted, 1);

        let replay = svc
            .transition(&created.id, OrderStatus::Delivered, TransitionExtra::default())
            .await
            .unwrap();
        assert!(!replay.applied);
        assert!(replay.ledger.is_none());
        assert_eq!(replay.order.delivered_at, Some(delivered_at));

        let record = svc.loyalty_record(&created.customer_id).unwrap();
        assert_eq!(record.cumulative_valets, 9);
        assert_eq!(record.free_credits, 1);

        // Ledger snapshot was pushed immediately after delivery.
        assert_eq!(svc.get_sync_backlog().unwrap(), 0);
        assert_eq!(remote.rows(TABLE_LOYALTY).len(), 1);
        assert_eq!(remote.rows(TABLE_LOYALTY)[0]["free_credits"], 1);
    }

    #[tokio::test]
    async fn test_skipping_a_step_is_rejected() {
        let svc = service(Arc::new(MemoryRemoteStore::new()));
        let order = svc.create_order(request("5550100", 1)).await.unwrap().order;

        let err = svc
            .transition(&order.id, OrderStatus::Delivered, TransitionExtra::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Validation(ValidationError::InvalidTransition {
                from: OrderStatus::Pending,
                to: OrderStatus::Delivered
            })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_order_is_final() {
        let svc = service(Arc::new(MemoryRemoteStore::new()));
        let order = svc.create_order(request("5550100", 1)).await.unwrap().order;

        let missing_reason = svc
            .transition(&order.id, OrderStatus::Cancelled, TransitionExtra::default())
            .await
            .unwrap_err();
        assert!(missing_reason.is_validation());

        let cancelled = svc
            .transition(&order.id, OrderStatus::Cancelled, TransitionExtra::cancel("customer left"))
            .await
            .unwrap();
        assert_eq!(cancelled.order.cancel_reason.as_deref(), Some("customer left"));

        for target in [
            OrderStatus::Pending,
            OrderStatus::Processing,
            OrderStatus::Ready,
            OrderStatus::Delivered,
        ] {
            let err = svc
                .transition(&order.id, target, TransitionExtra::default())
                .await
                .unwrap_err();
            assert!(err.is_validation(), "{target} should be rejected");
        }

        let again = svc
            .transition(&order.id, OrderStatus::Cancelled, TransitionExtra::cancel("dup"))
            .await
            .unwrap();
        assert!(!again.applied);
        assert_eq!(again.order.cancel_reason.as_deref(), Some("customer left"));
    }

    #[tokio::test]
    async fn test_free_credit_order_redeems_on_delivery() {
        let svc = service(Arc::new(MemoryRemoteStore::new()));
        let first = svc.create_order(request("5550100", 9)).await.unwrap().order;
        deliver(&svc, &first.id).await;

        let free = svc
            .create_order(request("5550100", 4).with_free_credit())
            .await
            .unwrap()
            .order;
        assert_eq!(free.total_amount, 0);
        assert_eq!(free.payment_method, Some(PaymentMethod::LoyaltyCredit));

        let delivered = deliver(&svc, &free.id).await;
        let ledger = delivered.ledger.unwrap();
        assert_eq!(ledger.effect, LedgerEffect::Redeemed);
        assert!(!delivered.credit_fallback);

        let record = svc.loyalty_record(&free.customer_id).unwrap();
        assert_eq!(record.free_credits, 0);
        assert_eq!(record.redeemed_count, 1);
        assert_eq!(record.cumulative_valets, 9);
    }

    #[tokio::test]
    async fn test_free_credit_without_credit_is_rejected_at_intake() {
        let svc = service(Arc::new(MemoryRemoteStore::new()));
        let err = svc
            .create_order(request("5550100", 1).with_free_credit())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientCredit { available: 0, .. }));
        assert_eq!(svc.get_sync_backlog().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spent_credit_falls_back_to_accrual_at_delivery() {
        let svc = service(Arc::new(MemoryRemoteStore::new()));
        let first = svc.create_order(request("5550100", 9)).await.unwrap().order;
        deliver(&svc, &first.id).await;

        let free = svc
            .create_order(request("5550100", 2).with_free_credit())
            .await
            .unwrap()
            .order;
        svc.redeem_credit(&free.customer_id).await.unwrap();

        let delivered = deliver(&svc, &free.id).await;
        assert!(delivered.credit_fallback);
        assert!(!delivered.order.uses_free_credit);
        assert_eq!(delivered.order.total_amount, 600);
        assert_eq!(delivered.order.payment_method, Some(PaymentMethod::Cash));
        assert_eq!(delivered.ledger.unwrap().effect, LedgerEffect::Accrued);
        assert_eq!(svc.loyalty_record(&free.customer_id).unwrap().cumulative_valets, 11);
    }

    #[tokio::test]
    async fn test_redeem_credit_rejected_without_mutation() {
        let svc = service(Arc::new(MemoryRemoteStore::new()));
        let order = svc.create_order(request("5550100", 3)).await.unwrap().order;
        deliver(&svc, &order.id).await;
        let before = svc.loyalty_record(&order.customer_id).unwrap();
        let backlog = svc.get_sync_backlog().unwrap();

        let err = svc.redeem_credit(&order.customer_id).await.unwrap_err();
        assert!(matches!(err, CoreError::InsufficientCredit { .. }));
        assert_eq!(svc.loyalty_record(&order.customer_id).unwrap(), before);
        assert_eq!(svc.get_sync_backlog().unwrap(), backlog);

        assert!(matches!(
            svc.redeem_credit("nobody").await.unwrap_err(),
            CoreError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_apply_ledger_once() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let svc = Arc::new(service(remote));
        let order = svc.create_order(request("5550100", 9)).await.unwrap().order;
        svc.transition(&order.id, OrderStatus::Processing, TransitionExtra::default())
            .await
            .unwrap();
        svc.transition(&order.id, OrderStatus::Ready, TransitionExtra::default())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let svc = svc.clone();
            let id = order.id.clone();
            handles.push(tokio::spawn(async move {
                svc.transition(&id, OrderStatus::Delivered, TransitionExtra::default())
                    .await
                    .unwrap()
            }));
        }
        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap().applied {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(svc.loyalty_record(&order.customer_id).unwrap().free_credits, 1);
    }

    #[tokio::test]
    async fn test_remote_cancel_conflicts_with_local_progress() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let svc = service(remote.clone());
        let order = svc.create_order(request("5550100", 1)).await.unwrap().order;
        let remote_id = order.remote_id.clone().unwrap();
        remote.patch_row(TABLE_ORDERS, &remote_id, json!({ "status": "cancelled" }));

        let err = svc
            .transition(&order.id, OrderStatus::Processing, TransitionExtra::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert_eq!(svc.get_order(&order.id).unwrap().status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_remote_already_advanced_is_mirrored() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let svc = service(remote.clone());
        let order = svc.create_order(request("5550100", 1)).await.unwrap().order;
        let remote_id = order.remote_id.clone().unwrap();
        remote.patch_row(TABLE_ORDERS, &remote_id, json!({ "status": "processing" }));

        let outcome = svc
            .transition(&order.id, OrderStatus::Processing, TransitionExtra::default())
            .await
            .unwrap();
        assert_eq!(outcome.save_state, SaveState::Confirmed);
        assert_eq!(svc.get_order(&remote_id).unwrap().status, OrderStatus::Processing);
    }

    #[tokio::test]
    async fn test_delivery_mirrored_from_remote_still_accrues_once() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let svc = service(remote.clone());
        let order = svc.create_order(request("5550100", 9)).await.unwrap().order;
        let remote_id = order.remote_id.clone().unwrap();
        svc.transition(&order.id, OrderStatus::Processing, TransitionExtra::default())
            .await
            .unwrap();
        svc.transition(&order.id, OrderStatus::Ready, TransitionExtra::default())
            .await
            .unwrap();
        remote.patch_row(TABLE_ORDERS, &remote_id, json!({ "status": "delivered" }));

        let outcome = svc
            .transition(
                &order.id,
                OrderStatus::Delivered,
                TransitionExtra::paid_with(PaymentMethod::Cash),
            )
            .await
            .unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.save_state, SaveState::Confirmed);
        assert_eq!(outcome.ledger.unwrap().credits_granted, 1);

        let record = svc.loyalty_record(&order.customer_id).unwrap();
        assert_eq!(record.free_credits, 1);
        assert_eq!(record.cumulative_valets, 9);
        assert_eq!(svc.get_sync_backlog().unwrap(), 0);
        assert_eq!(remote.rows(TABLE_LOYALTY)[0]["free_credits"], 1);

        let replay = svc
            .transition(&order.id, OrderStatus::Delivered, TransitionExtra::default())
            .await
            .unwrap();
        assert!(!replay.applied);
        assert!(replay.ledger.is_none());
        assert_eq!(svc.loyalty_record(&order.customer_id).unwrap().free_credits, 1);
    }

    #[tokio::test]
    async fn test_lookup_by_remote_id_and_customer() {
        let svc = service(Arc::new(MemoryRemoteStore::new()));
        let a = svc.create_order(request("5550100", 1)).await.unwrap().order;
        let b = svc.create_order(request("555 0100", 2)).await.unwrap().order;
        svc.create_order(request("5550199", 1)).await.unwrap();

        let by_remote = svc.get_order(a.remote_id.as_deref().unwrap()).unwrap();
        assert_eq!(by_remote.id, a.id);

        let listed = svc.list_orders_for_customer(&a.customer_id).unwrap();
        let ids: Vec<&str> = listed.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str()]);

        assert!(matches!(
            svc.get_order("missing").unwrap_err(),
            CoreError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_refresh_ledger_from_remote() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let svc = service(remote.clone());
        let order = svc.create_order(request("5550100", 9)).await.unwrap().order;
        deliver(&svc, &order.id).await;

        let remote_row = remote.rows(TABLE_LOYALTY).remove(0);
        let row_id = remote_row["id"].as_str().unwrap().to_string();
        remote.patch_row(TABLE_LOYALTY, &row_id, json!({ "free_credits": 3 }));

        let record = svc.refresh_ledger_from_remote(&order.customer_id).await.unwrap();
        assert_eq!(record.free_credits, 3);
        assert_eq!(svc.loyalty_record(&order.customer_id).unwrap().free_credits, 3);
    }
}
