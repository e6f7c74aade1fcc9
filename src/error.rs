//! Error taxonomy for the POS core.
//!
//! Business operations (`checkout`, `adjust_stock`) fail atomically: any
//! variant returned from an atomic block means the whole transaction rolled
//! back. Sync-cycle row serialization problems are the one recoverable case;
//! they are skipped per row and surfaced in the cycle summary instead.

use crate::money::Money;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PosError>;

#[derive(Debug, Error)]
pub enum PosError {
    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Schema or business-rule violation (negative quantity, empty cart,
    /// blank note, inactive product, malformed amount, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The cart asked for more units than are on hand.
    #[error("insufficient stock for \"{product}\": available {available}, requested {requested}")]
    InsufficientStock {
        product: String,
        available: i64,
        requested: i64,
    },

    /// Amount paid does not cover the order total.
    #[error("insufficient payment: total {total}, paid {paid}")]
    InsufficientPayment { total: Money, paid: Money },

    /// Duplicate sku/barcode/username/phone, etc.
    #[error("unique constraint conflict: {0}")]
    UniqueConstraint(String),

    /// A failure inside an atomic block; the transaction was rolled back.
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    /// Network or auth failure talking to the remote replica. A table batch
    /// is never partially applied; already-synced tables stay committed.
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// A row could not be made remote-safe (or a remote row could not be
    /// decoded back into the local schema).
    #[error("sync serialization failed: {0}")]
    Serialization(String),

    /// Filesystem problem while opening or resetting the store.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(rusqlite::Error),
}

impl From<rusqlite::Error> for PosError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, ref message) = err {
            if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                let detail = message
                    .clone()
                    .unwrap_or_else(|| "constraint violation".to_string());
                // UNIQUE conflicts get their own taxonomy entry; other
                // constraint classes (FK, CHECK) abort the transaction.
                if detail.contains("UNIQUE") {
                    return PosError::UniqueConstraint(detail);
                }
                return PosError::TransactionAborted(detail);
            }
        }
        PosError::Database(err)
    }
}

impl PosError {
    /// Lock poisoning means a previous writer panicked mid-mutation; treat
    /// the store as unusable for this call rather than limping on.
    pub(crate) fn poisoned_lock() -> Self {
        PosError::TransactionAborted("store lock poisoned".to_string())
    }
}
