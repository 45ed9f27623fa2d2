//! Domain types shared by the allocator, ledger, order service and sync engine.

use chrono::{DateTime, Datelike, FixedOffset, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Order status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Processing,
    Ready,
    Delivered,
    Cancelled,
}

/// Every allowed outward transition. Anything not listed is rejected unless it
/// is a replay of a state the order has already passed.
const TRANSITIONS: &[(OrderStatus, OrderStatus)] = &[
    (OrderStatus::Pending, OrderStatus::Processing),
    (OrderStatus::Processing, OrderStatus::Ready),
    (OrderStatus::Ready, OrderStatus::Delivered),
    (OrderStatus::Pending, OrderStatus::Cancelled),
    (OrderStatus::Processing, OrderStatus::Cancelled),
    (OrderStatus::Ready, OrderStatus::Cancelled),
];

/// Result of checking a requested transition against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCheck {
    Apply,
    /// The order is already at (or past) the target; report success, change nothing.
    AlreadyApplied,
    Invalid,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Ready => "ready",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// Position along the forward chain; `Cancelled` is off the chain.
    fn rank(&self) -> Option<u8> {
        match self {
            OrderStatus::Pending => Some(0),
            OrderStatus::Processing => Some(1),
            OrderStatus::Ready => Some(2),
            OrderStatus::Delivered => Some(3),
            OrderStatus::Cancelled => None,
        }
    }

    pub fn check_transition(&self, to: OrderStatus) -> TransitionCheck {
        if TRANSITIONS.contains(&(*self, to)) {
            return TransitionCheck::Apply;
        }
        if *self == to {
            return TransitionCheck::AlreadyApplied;
        }
        match (self.rank(), to.rank()) {
            (Some(current), Some(target)) if target < current => TransitionCheck::AlreadyApplied,
            _ => TransitionCheck::Invalid,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "processing" => Ok(OrderStatus::Processing),
            "ready" => Ok(OrderStatus::Ready),
            "delivered" => Ok(OrderStatus::Delivered),
            "cancelled" | "canceled" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Payment method
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    BankTransfer,
    LoyaltyCredit,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::LoyaltyCredit => "loyalty_credit",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cash" => Ok(PaymentMethod::Cash),
            "card" => Ok(PaymentMethod::Card),
            "bank_transfer" | "transfer" => Ok(PaymentMethod::BankTransfer),
            "loyalty_credit" => Ok(PaymentMethod::LoyaltyCredit),
            other => Err(format!("unknown payment method '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Numbering tier
// ---------------------------------------------------------------------------

/// Which allocation path produced a sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberingTier {
    /// Remote atomic increment; unique.
    Atomic,
    /// Highest known number + 1; best effort under concurrency.
    LastKnownPlusOne,
    /// Derived from the wall clock; needs manual reconciliation.
    Timestamp,
}

impl NumberingTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            NumberingTier::Atomic => "atomic",
            NumberingTier::LastKnownPlusOne => "last_known_plus_one",
            NumberingTier::Timestamp => "timestamp",
        }
    }

    pub fn is_degraded(&self) -> bool {
        !matches!(self, NumberingTier::Atomic)
    }
}

impl FromStr for NumberingTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "atomic" => Ok(NumberingTier::Atomic),
            "last_known_plus_one" => Ok(NumberingTier::LastKnownPlusOne),
            "timestamp" => Ok(NumberingTier::Timestamp),
            other => Err(format!("unknown numbering tier '{other}'")),
        }
    }
}

macro_rules! impl_text_sql {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let raw = value.as_str()?;
                raw.parse::<$ty>()
                    .map_err(|e| FromSqlError::Other(e.into()))
            }
        }
    };
}

impl_text_sql!(OrderStatus);
impl_text_sql!(PaymentMethod);
impl_text_sql!(NumberingTier);

// ---------------------------------------------------------------------------
// Calendar month marker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    pub fn of(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    /// Calendar month of `at` on a wall clock `offset_minutes` east of UTC.
    /// An offset chrono cannot represent falls back to UTC.
    pub fn of_local(at: DateTime<Utc>, offset_minutes: i32) -> Self {
        match FixedOffset::east_opt(offset_minutes.saturating_mul(60)) {
            Some(tz) => {
                let local = at.with_timezone(&tz);
                Self {
                    year: local.year(),
                    month: local.month(),
                }
            }
            None => Self::of(at),
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("invalid year-month '{s}'"))?;
        let year = year
            .parse::<i32>()
            .map_err(|e| format!("invalid year in '{s}': {e}"))?;
        let month = month
            .parse::<u32>()
            .map_err(|e| format!("invalid month in '{s}': {e}"))?;
        if !(1..=12).contains(&month) {
            return Err(format!("month out of range in '{s}'"));
        }
        Ok(Self { year, month })
    }
}

impl ToSql for YearMonth {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for YearMonth {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse::<YearMonth>()
            .map_err(|e| FromSqlError::Other(e.into()))
    }
}

// ---------------------------------------------------------------------------
// Orders and customers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub service: String,
    pub quantity: i64,
    /// Unit price in minor currency units.
    pub unit_price: i64,
    /// Client-selected options (starch, fold, express...). Local state wins on sync.
    #[serde(default)]
    pub options: Vec<String>,
}

impl LineItem {
    pub fn new(service: impl Into<String>, quantity: i64, unit_price: i64) -> Self {
        Self {
            service: service.into(),
            quantity,
            unit_price,
            options: Vec::new(),
        }
    }

    pub fn line_total(&self) -> i64 {
        self.quantity.saturating_mul(self.unit_price)
    }
}

/// One garment-care ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    /// Creation idempotency key, carried through every retry.
    pub op_id: String,
    pub sequence_number: String,
    pub numbering_tier: NumberingTier,
    pub customer_id: String,
    pub status: OrderStatus,
    pub line_items: Vec<LineItem>,
    pub is_paid: bool,
    pub payment_method: Option<PaymentMethod>,
    pub total_amount: i64,
    pub uses_free_credit: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub pending_sync: bool,
    pub remote_id: Option<String>,
    pub version: i64,
}

impl Order {
    /// Number of valet units this order counts toward the loyalty threshold.
    pub fn valet_count(&self) -> i64 {
        self.line_items.iter().map(|item| item.quantity).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    /// Normalised (digits only) phone number; the natural key.
    pub phone: String,
    pub name: Option<String>,
    pub remote_id: Option<String>,
}

/// Caller-supplied reference used to resolve or create a customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRef {
    pub phone: String,
    pub name: Option<String>,
}

impl CustomerRef {
    pub fn new(phone: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            phone: phone.into(),
            name: name.map(str::to_string),
        }
    }
}

pub fn normalize_phone(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

// ---------------------------------------------------------------------------
// Loyalty
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoyaltyRecord {
    pub customer_id: String,
    pub cumulative_valets: i64,
    pub free_credits: i64,
    pub redeemed_count: i64,
    pub last_reset_month: Option<YearMonth>,
}

impl LoyaltyRecord {
    pub fn empty(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            cumulative_valets: 0,
            free_credits: 0,
            redeemed_count: 0,
            last_reset_month: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEffect {
    Accrued,
    Redeemed,
}

/// Outcome of one ledger mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerResult {
    pub record: LoyaltyRecord,
    pub effect: LedgerEffect,
    pub valet_delta: i64,
    pub credits_granted: i64,
    pub rolled_over: bool,
}

impl LedgerResult {
    pub fn credit_delta(&self) -> i64 {
        match self.effect {
            LedgerEffect::Accrued => self.credits_granted,
            LedgerEffect::Redeemed => -1,
        }
    }
}

/// Whether a mutation reached the remote store or is waiting in the local queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveState {
    Confirmed,
    SavedOffline,
}
