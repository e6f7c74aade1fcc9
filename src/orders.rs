//! Transactional order processor.
//!
//! [`checkout`] is the heart of the core: one atomic transaction spanning
//! the order header, its item and payment rows, the per-line stock
//! deductions, and their ledger entries. Any validation failure rolls the
//! whole thing back; there is no partial sale.
//!
//! Client-supplied prices are UI hints only. Every amount on the order is
//! computed from the catalog rows as they exist inside the transaction and
//! snapshotted onto the order items, so later catalog edits never rewrite
//! history.

use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::DbState;
use crate::error::{PosError, Result};
use crate::inventory;
use crate::money::{Money, TaxRate};
use crate::store;
use crate::versioning::{new_row_id, now_rfc3339};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    DineIn,
    TakeAway,
}

impl OrderType {
    fn as_str(self) -> &'static str {
        match self {
            OrderType::DineIn => "dine_in",
            OrderType::TakeAway => "take_away",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Debit,
    Qris,
    /// Settled across several legs; the payload must carry them.
    Split,
}

impl PaymentMethod {
    fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Debit => "debit",
            PaymentMethod::Qris => "qris",
            PaymentMethod::Split => "split",
        }
    }
}

/// One settlement leg of a split payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentLeg {
    pub method: PaymentMethod,
    pub amount: Money,
    pub reference_id: Option<String>,
}

/// One cart line. `client_price` is what the UI displayed; it is never
/// used for arithmetic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: String,
    pub quantity: i64,
    pub client_price: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutPayload {
    pub cart: Vec<CartLine>,
    pub order_type: OrderType,
    pub payment_method: PaymentMethod,
    pub amount_paid: Money,
    /// Required (non-empty, summing to `amount_paid`) when
    /// `payment_method` is `Split`; must be empty otherwise.
    #[serde(default)]
    pub split_legs: Vec<PaymentLeg>,
    pub member_id: Option<String>,
    pub discount_id: Option<String>,
    pub table_number: Option<String>,
    pub customer_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutReceipt {
    pub order_id: String,
    pub queue_number: i64,
    pub subtotal: Money,
    pub discount_amount: Money,
    pub tax_amount: Money,
    pub total_amount: Money,
    pub change: Money,
}

/// A cart line joined with its authoritative catalog row.
struct PricedLine {
    product_id: String,
    name: String,
    sku: Option<String>,
    quantity: i64,
    price: Money,
    cost_price: Money,
    stock: i64,
}

/// Execute a checkout as a single atomic transaction.
pub fn checkout(state: &DbState, payload: &CheckoutPayload, cashier_id: &str) -> Result<CheckoutReceipt> {
    validate_payload(payload)?;

    let _gate = state
        .sync_gate
        .lock()
        .map_err(|_| PosError::poisoned_lock())?;
    let mut conn = state.conn.lock().map_err(|_| PosError::poisoned_lock())?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let cashier_exists: bool = tx
        .query_row(
            "SELECT 1 FROM users WHERE id = ?1 AND deleted_at IS NULL",
            params![cashier_id],
            |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false);
    if !cashier_exists {
        return Err(PosError::NotFound {
            entity: "cashier",
            id: cashier_id.to_string(),
        });
    }

    // 1-2. Load and validate every line against the live catalog.
    let lines = price_cart(&tx, &payload.cart)?;

    // 3. Totals from authoritative prices.
    let mut subtotal = Money::ZERO;
    for line in &lines {
        let line_total = line.price.times(line.quantity).ok_or_else(|| {
            PosError::InvalidArgument(format!("cart total overflows on \"{}\"", line.name))
        })?;
        subtotal = subtotal.checked_add(line_total).ok_or_else(|| {
            PosError::InvalidArgument(format!("cart subtotal overflows at \"{}\"", line.name))
        })?;
    }

    // 4. Tax, discount, change.
    let (tax_name, tax_rate) = store::active_tax(&tx)?;
    let tax_amount = subtotal.apply_rate(tax_rate);
    let discount_amount = resolve_discount(&tx, payload.discount_id.as_deref(), subtotal)?;
    let total_amount = subtotal + tax_amount - discount_amount;

    let change = payload.amount_paid - total_amount;
    if change.is_negative() {
        return Err(PosError::InsufficientPayment {
            total: total_amount,
            paid: payload.amount_paid,
        });
    }

    // 5-6. Persist the order graph and deduct stock.
    let order_id = new_row_id();
    let queue_number = next_queue_number(&tx)?;

    tx.execute(
        "INSERT INTO orders
            (id, member_id, discount_id, cashier_id, subtotal, discount_amount,
             tax_amount, total_amount, tax_name_snapshot, tax_rate_snapshot,
             order_type, payment_method, amount_paid, change, table_number,
             customer_name, queue_number, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                 ?15, ?16, ?17, 'completed')",
        params![
            order_id,
            payload.member_id,
            payload.discount_id,
            cashier_id,
            subtotal.minor(),
            discount_amount.minor(),
            tax_amount.minor(),
            total_amount.minor(),
            tax_name,
            tax_rate.bps(),
            payload.order_type.as_str(),
            payload.payment_method.as_str(),
            payload.amount_paid.minor(),
            change.minor(),
            payload.table_number,
            payload.customer_name,
            queue_number,
        ],
    )?;

    for line in &lines {
        tx.execute(
            "INSERT INTO order_items
                (id, order_id, product_id, product_name_snapshot, sku_snapshot,
                 quantity, price_at_time, cost_price_at_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new_row_id(),
                order_id,
                line.product_id,
                line.name,
                line.sku,
                line.quantity,
                line.price.minor(),
                line.cost_price.minor(),
            ],
        )?;

        inventory::write_stock_change(
            &tx,
            &line.product_id,
            line.stock - line.quantity,
            -line.quantity,
            "sale",
            None,
            Some(&order_id),
            Some(cashier_id),
        )?;
    }

    match payload.payment_method {
        PaymentMethod::Split => {
            for leg in &payload.split_legs {
                tx.execute(
                    "INSERT INTO order_payments (id, order_id, payment_method, amount, reference_id)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        new_row_id(),
                        order_id,
                        leg.method.as_str(),
                        leg.amount.minor(),
                        leg.reference_id,
                    ],
                )?;
            }
        }
        method => {
            tx.execute(
                "INSERT INTO order_payments (id, order_id, payment_method, amount)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    new_row_id(),
                    order_id,
                    method.as_str(),
                    payload.amount_paid.minor(),
                ],
            )?;
        }
    }

    // 7. All or nothing.
    tx.commit()?;

    info!(
        order_id,
        queue_number,
        total = %total_amount,
        "Checkout completed"
    );

    Ok(CheckoutReceipt {
        order_id,
        queue_number,
        subtotal,
        discount_amount,
        tax_amount,
        total_amount,
        change,
    })
}

fn validate_payload(payload: &CheckoutPayload) -> Result<()> {
    if payload.cart.is_empty() {
        return Err(PosError::InvalidArgument("cart is empty".to_string()));
    }
    for line in &payload.cart {
        if line.quantity <= 0 {
            return Err(PosError::InvalidArgument(format!(
                "quantity for product {} must be positive, got {}",
                line.product_id, line.quantity
            )));
        }
    }
    if payload.amount_paid.is_negative() {
        return Err(PosError::InvalidArgument(
            "amount paid cannot be negative".to_string(),
        ));
    }

    match payload.payment_method {
        PaymentMethod::Split => {
            if payload.split_legs.is_empty() {
                return Err(PosError::InvalidArgument(
                    "split payment requires at least one leg".to_string(),
                ));
            }
            let mut legs_total = Money::ZERO;
            for leg in &payload.split_legs {
                if matches!(leg.method, PaymentMethod::Split) {
                    return Err(PosError::InvalidArgument(
                        "a split leg cannot itself be split".to_string(),
                    ));
                }
                if leg.amount <= Money::ZERO {
                    return Err(PosError::InvalidArgument(
                        "split leg amounts must be positive".to_string(),
                    ));
                }
                legs_total += leg.amount;
            }
            if legs_total != payload.amount_paid {
                return Err(PosError::InvalidArgument(format!(
                    "split legs sum to {legs_total} but amount paid is {}",
                    payload.amount_paid
                )));
            }
        }
        _ if !payload.split_legs.is_empty() => {
            return Err(PosError::InvalidArgument(
                "split legs given for a non-split payment".to_string(),
            ));
        }
        _ => {}
    }
    Ok(())
}

fn price_cart(tx: &Transaction<'_>, cart: &[CartLine]) -> Result<Vec<PricedLine>> {
    let mut lines = Vec::with_capacity(cart.len());
    for cart_line in cart {
        let row = tx
            .query_row(
                "SELECT name, sku, price, cost_price, stock, is_active
                 FROM products WHERE id = ?1 AND deleted_at IS NULL",
                params![cart_line.product_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        let (name, sku, price, cost_price, stock, is_active) =
            row.ok_or_else(|| PosError::NotFound {
                entity: "product",
                id: cart_line.product_id.clone(),
            })?;

        if is_active == 0 {
            return Err(PosError::InvalidArgument(format!(
                "product \"{name}\" is inactive and cannot be sold"
            )));
        }
        if stock < cart_line.quantity {
            return Err(PosError::InsufficientStock {
                product: name,
                available: stock,
                requested: cart_line.quantity,
            });
        }

        lines.push(PricedLine {
            product_id: cart_line.product_id.clone(),
            name,
            sku,
            quantity: cart_line.quantity,
            price: Money::from_minor(price),
            cost_price: Money::from_minor(cost_price),
            stock,
        });
    }
    Ok(lines)
}

/// Discount amount for the order, clamped so the total never goes negative.
fn resolve_discount(
    tx: &Transaction<'_>,
    discount_id: Option<&str>,
    subtotal: Money,
) -> Result<Money> {
    let Some(discount_id) = discount_id else {
        return Ok(Money::ZERO);
    };

    let row = tx
        .query_row(
            "SELECT type, value, is_active, start_date, end_date FROM discounts
             WHERE id = ?1 AND deleted_at IS NULL",
            params![discount_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()?;

    let (kind, value, is_active, start_date, end_date) =
        row.ok_or_else(|| PosError::NotFound {
            entity: "discount",
            id: discount_id.to_string(),
        })?;
    if is_active == 0 {
        return Err(PosError::InvalidArgument(format!(
            "discount {discount_id} is not active"
        )));
    }

    // Validity window. RFC 3339 UTC strings compare lexicographically.
    let now = now_rfc3339();
    if let Some(start) = &start_date {
        if now.as_str() < start.as_str() {
            return Err(PosError::InvalidArgument(format!(
                "discount {discount_id} is not valid until {start}"
            )));
        }
    }
    if let Some(end) = &end_date {
        if now.as_str() > end.as_str() {
            return Err(PosError::InvalidArgument(format!(
                "discount {discount_id} expired at {end}"
            )));
        }
    }

    let amount = match kind.as_str() {
        "PERCENTAGE" => {
            if !(0..=10_000).contains(&value) {
                return Err(PosError::InvalidArgument(format!(
                    "discount rate {value} bps is outside 0..=10000"
                )));
            }
            subtotal.apply_rate(TaxRate::from_bps(value as u32))
        }
        "FIXED" => {
            if value < 0 {
                return Err(PosError::InvalidArgument(format!(
                    "fixed discount amount {value} cannot be negative"
                )));
            }
            Money::from_minor(value)
        }
        other => {
            return Err(PosError::InvalidArgument(format!(
                "unknown discount type {other:?}"
            )))
        }
    };
    Ok(amount.min(subtotal))
}

/// Daily queue number, restarting at 1 each day.
fn next_queue_number(tx: &Transaction<'_>) -> Result<i64> {
    let next: i64 = tx.query_row(
        "SELECT COALESCE(MAX(queue_number), 0) + 1 FROM orders
         WHERE date(created_at) = date('now')",
        [],
        |row| row.get(0),
    )?;
    Ok(next)
}
