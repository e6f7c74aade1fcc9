//! Inventory ledger engine.
//!
//! Every stock mutation in the system goes through this module: manual
//! adjustments via [`adjust_stock`], checkout deductions via the crate-
//! internal [`write_stock_change`]. Each mutation updates the product row
//! (version-bumped) and appends exactly one `inventory_logs` row inside the
//! same transaction, so summing `change_amount` over a product's ledger
//! always reproduces its current `stock`.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::info;

use crate::db::DbState;
use crate::error::{PosError, Result};
use crate::versioning::{new_row_id, BUMP_CLAUSE};

/// Manual adjustment kinds. Sales are written by the order processor only
/// and are not accepted through [`adjust_stock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockAdjustmentType {
    /// Goods received: `quantity` is added to stock.
    Restock,
    /// Physical count: `quantity` is the counted true stock, the delta is
    /// derived.
    Correction,
    /// Breakage or spoilage: `quantity` is removed from stock.
    Damage,
}

impl StockAdjustmentType {
    fn as_str(self) -> &'static str {
        match self {
            StockAdjustmentType::Restock => "restock",
            StockAdjustmentType::Correction => "correction",
            StockAdjustmentType::Damage => "damage",
        }
    }
}

impl FromStr for StockAdjustmentType {
    type Err = PosError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "restock" => Ok(StockAdjustmentType::Restock),
            "correction" => Ok(StockAdjustmentType::Correction),
            "damage" => Ok(StockAdjustmentType::Damage),
            other => Err(PosError::InvalidArgument(format!(
                "unknown stock adjustment type {other:?}"
            ))),
        }
    }
}

/// One ledger row as returned by [`get_history`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryLogEntry {
    pub id: String,
    pub change_amount: i64,
    pub final_stock: i64,
    pub entry_type: String,
    pub note: Option<String>,
    pub reference_id: Option<String>,
    pub user_name: Option<String>,
    pub created_at: String,
}

/// Manually adjust a product's stock. Returns the new on-hand count.
///
/// The whole adjustment is one transaction: read current stock, compute the
/// delta by type, write the product, append the ledger row. A correction to
/// the already-current count is a no-op success with no ledger row.
pub fn adjust_stock(
    state: &DbState,
    product_id: &str,
    adjustment: StockAdjustmentType,
    quantity: i64,
    note: &str,
    user_id: &str,
) -> Result<i64> {
    if quantity < 0 {
        return Err(PosError::InvalidArgument(format!(
            "quantity must be non-negative, got {quantity}"
        )));
    }
    if note.trim().is_empty() {
        return Err(PosError::InvalidArgument(
            "adjustment note cannot be empty".to_string(),
        ));
    }

    // Local mutations and sync cycles are mutually exclusive.
    let _gate = state
        .sync_gate
        .lock()
        .map_err(|_| PosError::poisoned_lock())?;
    let mut conn = state.conn.lock().map_err(|_| PosError::poisoned_lock())?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let (current_stock, product_name) = tx
        .query_row(
            "SELECT stock, name FROM products WHERE id = ?1 AND deleted_at IS NULL",
            params![product_id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?
        .ok_or_else(|| PosError::NotFound {
            entity: "product",
            id: product_id.to_string(),
        })?;

    let change_amount = match adjustment {
        StockAdjustmentType::Restock => quantity,
        StockAdjustmentType::Damage => -quantity,
        StockAdjustmentType::Correction => quantity - current_stock,
    };

    if change_amount == 0 {
        // Nothing changed; the audit trail records mutations, not reads.
        return Ok(current_stock);
    }

    let final_stock = current_stock + change_amount;
    if final_stock < 0 {
        return Err(PosError::InsufficientStock {
            product: product_name,
            available: current_stock,
            requested: quantity,
        });
    }

    write_stock_change(
        &tx,
        product_id,
        final_stock,
        change_amount,
        adjustment.as_str(),
        Some(note),
        None,
        Some(user_id),
    )?;

    tx.commit()?;
    info!(
        product_id,
        r#type = adjustment.as_str(),
        change_amount,
        final_stock,
        "Stock adjusted"
    );
    Ok(final_stock)
}

/// Write one stock mutation: product update plus ledger append. Runs inside
/// the caller's transaction; the caller has already validated the delta.
#[allow(clippy::too_many_arguments)]
pub(crate) fn write_stock_change(
    conn: &Connection,
    product_id: &str,
    final_stock: i64,
    change_amount: i64,
    entry_type: &str,
    note: Option<&str>,
    reference_id: Option<&str>,
    user_id: Option<&str>,
) -> Result<()> {
    conn.execute(
        &format!("UPDATE products SET stock = ?1, {BUMP_CLAUSE} WHERE id = ?2"),
        params![final_stock, product_id],
    )?;
    conn.execute(
        "INSERT INTO inventory_logs
            (id, product_id, change_amount, final_stock, type, note, reference_id, user_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            new_row_id(),
            product_id,
            change_amount,
            final_stock,
            entry_type,
            note,
            reference_id,
            user_id,
        ],
    )?;
    Ok(())
}

/// The most recent `limit` ledger rows for a product, newest first, with
/// the acting user's display name joined in.
pub fn get_history(state: &DbState, product_id: &str, limit: u32) -> Result<Vec<InventoryLogEntry>> {
    let conn = state.conn.lock().map_err(|_| PosError::poisoned_lock())?;

    let mut stmt = conn.prepare(
        "SELECT il.id, il.change_amount, il.final_stock, il.type, il.note,
                il.reference_id, u.name, il.created_at
         FROM inventory_logs il
         LEFT JOIN users u ON u.id = il.user_id
         WHERE il.product_id = ?1
         ORDER BY il.created_at DESC, il.id DESC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![product_id, limit], |row| {
            Ok(InventoryLogEntry {
                id: row.get(0)?,
                change_amount: row.get(1)?,
                final_stock: row.get(2)?,
                entry_type: row.get(3)?,
                note: row.get(4)?,
                reference_id: row.get(5)?,
                user_name: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
