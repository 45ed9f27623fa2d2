//! Error taxonomy for the order/ledger core.
//!
//! Remote failures are split into recoverable ones (queued and retried by the
//! reconciler) and permanent ones (rejected or dead-lettered). Validation
//! failures never reach the queue.

use thiserror::Error;

use crate::models::OrderStatus;

/// Failure talking to the remote store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote store unreachable: {0}")]
    Unavailable(String),

    #[error("remote store call timed out")]
    Timeout,

    #[error("transient remote failure: {0}")]
    Transient(String),

    #[error("remote store rejected the request: {0}")]
    Rejected(String),

    #[error("remote precondition failed: {0}")]
    Conflict(String),

    #[error("invalid response from remote store: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether the failure may succeed on a later attempt.
    ///
    /// Timeouts and unreadable responses are ambiguous (the write may or may
    /// not have landed); they are treated as recoverable and rely on op-id
    /// de-duplication on replay.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Unavailable(_)
                | RemoteError::Timeout
                | RemoteError::Transient(_)
                | RemoteError::Decode(_)
        )
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Synchronous rejection of a caller request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("order has no line items")]
    EmptyOrder,

    #[error("line item '{0}' has a non-positive quantity")]
    InvalidQuantity(String),

    #[error("customer phone number is required")]
    MissingCustomerPhone,

    #[error("a cancellation reason is required")]
    MissingCancelReason,

    #[error("transition {from} -> {to} is not allowed")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("invalid sequence value: {0}")]
    InvalidSequence(String),
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("customer {customer_id} has {available} free credits, cannot redeem")]
    InsufficientCredit { customer_id: String, available: i64 },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflicting remote state: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("local database lock poisoned")]
    LockPoisoned,
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoreError::Validation(_) | CoreError::InsufficientCredit { .. }
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for CoreError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        CoreError::LockPoisoned
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
