//! Push/pull sync engine.
//!
//! Runs on demand, never continuously. A cycle walks [`SYNC_TABLES`] in
//! dependency order while holding the store's sync gate, so local business
//! mutations and sync never interleave. Each table's remote write is one
//! atomic batch; local rows are marked clean only after the remote
//! acknowledges. Conflicts resolve last-writer-by-version-wins with no
//! merge; two divergent offline edits to the same row will silently
//! overwrite each other.
//!
//! A cycle is cancellable between tables. Cancelling never rolls back a
//! table batch the remote already committed; the summary reports the cycle
//! as partial instead.

use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::db::{self, DbState};
use crate::error::{PosError, Result};
use crate::remote::{RemoteStatement, RemoteStore, SqlValue};
use crate::schema::{self, TableDesc, SYNC_TABLES};
use crate::versioning::now_rfc3339;

/// Cross-thread handle for cancelling an in-flight cycle.
#[derive(Debug, Default)]
pub struct SyncState {
    cancel: AtomicBool,
}

impl SyncState {
    pub fn new() -> Self {
        SyncState::default()
    }

    /// Ask the current (or next) cycle to stop after the table in flight.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }
}

/// Outcome of one push or pull cycle.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncSummary {
    /// Rows pushed to (or pulled from) the remote.
    pub count: usize,
    /// Rows skipped because they could not be made remote-safe (or decoded
    /// back). Never fatal to the cycle; surfaced here instead.
    pub skipped: usize,
    /// True when the cycle was cancelled partway; completed table batches
    /// stay committed.
    pub cancelled: bool,
}

/// Push every dirty local row to the remote store.
///
/// Per table: select `sync_status = 0` rows, serialize them through the
/// column descriptors, write one upsert batch, and only then
/// mark those rows clean. A failed batch leaves its rows dirty for the
/// next cycle; tables already pushed stay clean.
pub fn push(state: &DbState, remote: &mut dyn RemoteStore, sync: &SyncState) -> Result<SyncSummary> {
    let _gate = state
        .sync_gate
        .lock()
        .map_err(|_| PosError::poisoned_lock())?;

    let result = push_locked(state, remote, sync);
    sync.clear();
    // The remote connection is released at the end of every cycle, even a
    // failed one.
    if let Err(close_err) = remote.close() {
        warn!("Failed to close remote connection: {close_err}");
    }
    result
}

fn push_locked(
    state: &DbState,
    remote: &mut dyn RemoteStore,
    sync: &SyncState,
) -> Result<SyncSummary> {
    let mut summary = SyncSummary::default();

    for table in SYNC_TABLES {
        if sync.cancel_requested() {
            info!(table = table.name, "Push cancelled before table");
            summary.cancelled = true;
            return Ok(summary);
        }

        let (statements, ids, skipped) = collect_dirty(state, table)?;
        summary.skipped += skipped;
        if statements.is_empty() {
            continue;
        }

        debug!(table = table.name, rows = statements.len(), "Pushing table");
        remote.batch(&statements)?;

        // Remote acknowledged; now (and only now) mark the rows clean.
        let conn = state.conn.lock().map_err(|_| PosError::poisoned_lock())?;
        let placeholders = (1..=ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute(
            &format!(
                "UPDATE {} SET sync_status = 1 WHERE id IN ({placeholders})",
                table.name
            ),
            params_from_iter(&ids),
        )?;
        summary.count += ids.len();
    }

    let conn = state.conn.lock().map_err(|_| PosError::poisoned_lock())?;
    db::set_setting(&conn, "sync", "last_push_at", &now_rfc3339())?;

    info!(
        count = summary.count,
        skipped = summary.skipped,
        "Push complete"
    );
    Ok(summary)
}

/// Serialize a table's dirty rows. Rows that cannot be made remote-safe,
/// or that are missing their primary key, are skipped with a warning.
fn collect_dirty(
    state: &DbState,
    table: &TableDesc,
) -> Result<(Vec<RemoteStatement>, Vec<String>, usize)> {
    let conn = state.conn.lock().map_err(|_| PosError::poisoned_lock())?;

    let mut stmt = conn.prepare(&table.select_dirty_sql())?;
    let mut rows = stmt.query([])?;

    let upsert_sql = table.upsert_sql();
    let mut statements = Vec::new();
    let mut ids = Vec::new();
    let mut skipped = 0usize;

    'rows: while let Some(row) = rows.next()? {
        let mut args = Vec::with_capacity(table.columns.len());
        for (idx, column) in table.columns.iter().enumerate() {
            match schema::to_remote(column, row.get_ref(idx)?) {
                Ok(value) => args.push(value),
                Err(err) => {
                    warn!(table = table.name, column = column.name, "Skipping row: {err}");
                    skipped += 1;
                    continue 'rows;
                }
            }
        }

        // Defensive: a row without a primary key can never be upserted
        // remotely and would poison the whole batch.
        let id = match &args[0] {
            SqlValue::Text(id) => id.clone(),
            _ => {
                warn!(table = table.name, "Skipping row with missing primary key");
                skipped += 1;
                continue;
            }
        };

        statements.push(RemoteStatement {
            sql: upsert_sql.clone(),
            args,
        });
        ids.push(id);
    }

    Ok((statements, ids, skipped))
}

/// Pull remote rows newer than the local per-table version watermark.
///
/// Per table: read `max(version)` locally, fetch remote rows above it in
/// ascending version order, and upsert each one with `sync_status = 1`.
/// Ascending order means an interrupted pull still leaves the watermark at
/// a safe resume point.
pub fn pull(state: &DbState, remote: &mut dyn RemoteStore, sync: &SyncState) -> Result<SyncSummary> {
    let _gate = state
        .sync_gate
        .lock()
        .map_err(|_| PosError::poisoned_lock())?;

    let result = pull_locked(state, remote, sync);
    sync.clear();
    if let Err(close_err) = remote.close() {
        warn!("Failed to close remote connection: {close_err}");
    }
    result
}

fn pull_locked(
    state: &DbState,
    remote: &mut dyn RemoteStore,
    sync: &SyncState,
) -> Result<SyncSummary> {
    let mut summary = SyncSummary::default();

    for table in SYNC_TABLES {
        if sync.cancel_requested() {
            info!(table = table.name, "Pull cancelled before table");
            summary.cancelled = true;
            return Ok(summary);
        }

        let watermark: i64 = {
            let conn = state.conn.lock().map_err(|_| PosError::poisoned_lock())?;
            conn.query_row(
                &format!("SELECT COALESCE(MAX(version), 0) FROM {}", table.name),
                [],
                |row| row.get(0),
            )?
        };

        let remote_rows = remote.execute(
            &table.select_newer_sql(),
            &[SqlValue::Integer(watermark)],
        )?;
        if remote_rows.is_empty() {
            continue;
        }
        debug!(
            table = table.name,
            rows = remote_rows.len(),
            watermark,
            "Pulling table"
        );

        let mut conn = state.conn.lock().map_err(|_| PosError::poisoned_lock())?;
        let tx = conn.transaction()?;
        let upsert_sql = table.upsert_sql();

        'rows: for remote_row in &remote_rows {
            if remote_row.len() != table.columns.len() {
                warn!(
                    table = table.name,
                    expected = table.columns.len(),
                    got = remote_row.len(),
                    "Skipping remote row with wrong column count"
                );
                summary.skipped += 1;
                continue;
            }

            let mut values = Vec::with_capacity(table.columns.len());
            for (column, value) in table.columns.iter().zip(remote_row) {
                // Pulled rows match the remote by definition.
                if column.name == "sync_status" {
                    values.push(Value::Integer(1));
                    continue;
                }
                match schema::from_remote(column, value) {
                    Ok(value) => values.push(value),
                    Err(err) => {
                        warn!(table = table.name, column = column.name, "Skipping row: {err}");
                        summary.skipped += 1;
                        continue 'rows;
                    }
                }
            }

            tx.execute(&upsert_sql, params_from_iter(&values))?;
            summary.count += 1;
        }

        tx.commit()?;
    }

    let conn = state.conn.lock().map_err(|_| PosError::poisoned_lock())?;
    db::set_setting(&conn, "sync", "last_pull_at", &now_rfc3339())?;

    info!(
        count = summary.count,
        skipped = summary.skipped,
        "Pull complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{self, StockAdjustmentType};
    use crate::money::Money;
    use crate::orders::{self, CartLine, CheckoutPayload, OrderType, PaymentMethod};
    use crate::remote::SqliteRemote;
    use crate::testutil::{seed_product, seed_user, test_state};
    use crate::versioning::BUMP_CLAUSE;

    fn seeded_state() -> DbState {
        let state = test_state();
        {
            let conn = state.conn.lock().unwrap();
            seed_user(&conn, "u1", "Ayu");
            seed_product(&conn, "P1", "Kopi Susu", 1_000_000, 5);
        }
        state
    }

    fn checkout_once(state: &DbState) {
        let payload = CheckoutPayload {
            cart: vec![CartLine {
                product_id: "P1".to_string(),
                quantity: 1,
                client_price: Money::ZERO,
            }],
            order_type: OrderType::TakeAway,
            payment_method: PaymentMethod::Cash,
            amount_paid: "11100".parse().unwrap(),
            split_legs: Vec::new(),
            member_id: None,
            discount_id: None,
            table_number: None,
            customer_name: None,
        };
        orders::checkout(state, &payload, "u1").expect("checkout");
    }

    fn dirty_count(state: &DbState, table: &str) -> i64 {
        let conn = state.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE sync_status = 0"),
            [],
            |r| r.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_push_marks_rows_clean_and_is_idempotent() {
        let state = seeded_state();
        checkout_once(&state);
        assert!(dirty_count(&state, "orders") > 0);

        let mut remote = SqliteRemote::in_memory().expect("replica");
        let sync = SyncState::new();

        let first = push(&state, &mut remote, &sync).expect("first push");
        assert!(first.count > 0);
        assert_eq!(first.skipped, 0);
        assert!(!first.cancelled);
        for table in ["users", "products", "orders", "order_items", "inventory_logs"] {
            assert_eq!(dirty_count(&state, table), 0, "{table} should be clean");
        }

        let batches_after_first = remote.batches_applied;
        let second = push(&state, &mut remote, &sync).expect("second push");
        assert_eq!(second.count, 0);
        assert_eq!(
            remote.batches_applied, batches_after_first,
            "a clean store must perform zero remote writes"
        );

        let conn = state.conn.lock().unwrap();
        assert!(db::get_setting(&conn, "sync", "last_push_at").is_some());
    }

    #[test]
    fn test_round_trip_reproduces_business_columns() {
        let state = seeded_state();
        inventory::adjust_stock(&state, "P1", StockAdjustmentType::Restock, 3, "delivery", "u1")
            .expect("adjust");
        checkout_once(&state);

        let mut remote = SqliteRemote::in_memory().expect("replica");
        let sync = SyncState::new();
        push(&state, &mut remote, &sync).expect("push");

        // Second replica starts empty and pulls everything.
        let other = test_state();
        let pulled = pull(&other, &mut remote, &sync).expect("pull");
        assert!(pulled.count > 0);

        let source = state.conn.lock().unwrap();
        let target = other.conn.lock().unwrap();
        for (table, columns) in [
            ("users", "id, name, username, role"),
            ("products", "id, name, sku, price, cost_price, stock"),
            (
                "orders",
                "id, subtotal, tax_amount, total_amount, queue_number, status",
            ),
            (
                "order_items",
                "id, order_id, product_name_snapshot, quantity, price_at_time",
            ),
            (
                "inventory_logs",
                "id, product_id, change_amount, final_stock, type",
            ),
        ] {
            let dump = |conn: &rusqlite::Connection| -> Vec<String> {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {columns} FROM {table} ORDER BY id"
                    ))
                    .unwrap();
                let width = stmt.column_count();
                stmt.query_map([], |row| {
                    let mut parts = Vec::new();
                    for i in 0..width {
                        parts.push(format!("{:?}", row.get_ref(i).unwrap()));
                    }
                    Ok(parts.join("|"))
                })
                .unwrap()
                .map(|r| r.unwrap())
                .collect()
            };
            assert_eq!(dump(&source), dump(&target), "mismatch in {table}");
        }

        // Pulled rows are clean: they match the remote by construction.
        drop(target);
        assert_eq!(dirty_count(&other, "orders"), 0);
    }

    #[test]
    fn test_pull_is_idempotent() {
        let state = seeded_state();
        checkout_once(&state);

        let mut remote = SqliteRemote::in_memory().expect("replica");
        let sync = SyncState::new();
        push(&state, &mut remote, &sync).expect("push");

        let other = test_state();
        let first = pull(&other, &mut remote, &sync).expect("first pull");
        assert!(first.count > 0);

        let second = pull(&other, &mut remote, &sync).expect("second pull");
        assert_eq!(second.count, 0, "nothing new to pull the second time");
    }

    #[test]
    fn test_cancel_stops_before_first_table() {
        let state = seeded_state();
        checkout_once(&state);

        let mut remote = SqliteRemote::in_memory().expect("replica");
        let sync = SyncState::new();
        sync.request_cancel();

        let summary = push(&state, &mut remote, &sync).expect("cancelled push");
        assert!(summary.cancelled);
        assert_eq!(summary.count, 0);
        assert_eq!(remote.batches_applied, 0);
        assert!(dirty_count(&state, "orders") > 0, "rows must stay dirty");

        // The flag is consumed; the next cycle runs normally.
        let summary = push(&state, &mut remote, &sync).expect("second push");
        assert!(!summary.cancelled);
        assert!(summary.count > 0);
    }

    #[test]
    fn test_failed_batch_leaves_rows_dirty() {
        let state = seeded_state();
        checkout_once(&state);

        let mut remote = SqliteRemote::in_memory().expect("replica");
        remote
            .connection()
            .execute_batch("DROP TABLE users;")
            .expect("sabotage replica");

        let sync = SyncState::new();
        let result = push(&state, &mut remote, &sync);
        assert!(result.is_err(), "push into a broken replica must fail");
        assert!(dirty_count(&state, "users") > 0);
        assert!(dirty_count(&state, "orders") > 0);
    }

    #[test]
    fn test_unserializable_row_is_skipped_not_fatal() {
        let state = seeded_state();
        {
            let conn = state.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO categories (id, name, slug, created_at)
                 VALUES ('c-bad', 'Broken', 'broken', 'not-a-timestamp')",
                [],
            )
            .expect("seed bad row");
            conn.execute(
                "INSERT INTO categories (id, name, slug) VALUES ('c-ok', 'Fine', 'fine')",
                [],
            )
            .expect("seed good row");
        }

        let mut remote = SqliteRemote::in_memory().expect("replica");
        let sync = SyncState::new();
        let summary = push(&state, &mut remote, &sync).expect("push");
        assert_eq!(summary.skipped, 1);

        let pushed = remote
            .execute("SELECT id FROM categories ORDER BY id", &[])
            .expect("select");
        assert_eq!(pushed.len(), 1, "only the good category row goes over");

        // The bad row stays dirty for a future fix.
        let conn = state.conn.lock().unwrap();
        let bad_dirty: i64 = conn
            .query_row(
                "SELECT sync_status FROM categories WHERE id = 'c-bad'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(bad_dirty, 0);
    }

    #[test]
    fn test_row_missing_primary_key_is_skipped() {
        let state = seeded_state();
        {
            let conn = state.conn.lock().unwrap();
            // SQLite rowid tables permit NULL in a TEXT PRIMARY KEY.
            conn.execute(
                "INSERT INTO categories (id, name, slug) VALUES (NULL, 'Ghost', 'ghost')",
                [],
            )
            .expect("seed pk-less row");
        }

        let mut remote = SqliteRemote::in_memory().expect("replica");
        let sync = SyncState::new();
        let summary = push(&state, &mut remote, &sync).expect("push");
        assert_eq!(summary.skipped, 1);
    }

    #[test]
    fn test_push_of_header_edit_keeps_remote_children() {
        let state = seeded_state();
        checkout_once(&state);
        checkout_once(&state);

        let mut remote = SqliteRemote::in_memory().expect("replica");
        let sync = SyncState::new();
        push(&state, &mut remote, &sync).expect("initial push");

        // Dirty one order header only; its items stay clean.
        {
            let conn = state.conn.lock().unwrap();
            conn.execute(
                &format!(
                    "UPDATE orders SET status = 'cancelled', {BUMP_CLAUSE}
                     WHERE id = (SELECT id FROM orders LIMIT 1)"
                ),
                [],
            )
            .expect("edit header");
        }
        let summary = push(&state, &mut remote, &sync).expect("header push");
        assert_eq!(summary.count, 1);

        let items = remote
            .execute("SELECT COUNT(*) FROM order_items", &[])
            .expect("count");
        assert_eq!(
            items[0][0],
            SqlValue::Integer(2),
            "re-pushing a header must not delete its remote items"
        );
    }

    #[test]
    fn test_pull_of_header_edit_keeps_child_rows() {
        let state = seeded_state();
        checkout_once(&state);
        checkout_once(&state);

        let mut remote = SqliteRemote::in_memory().expect("replica");
        let sync = SyncState::new();
        push(&state, &mut remote, &sync).expect("push");

        let other = test_state();
        pull(&other, &mut remote, &sync).expect("initial pull");

        // The header changes upstream; its items do not.
        {
            let conn = state.conn.lock().unwrap();
            conn.execute(
                &format!(
                    "UPDATE orders SET status = 'cancelled', {BUMP_CLAUSE}
                     WHERE id = (SELECT id FROM orders LIMIT 1)"
                ),
                [],
            )
            .expect("edit header");
        }
        push(&state, &mut remote, &sync).expect("push edit");

        let pulled = pull(&other, &mut remote, &sync).expect("pull edit");
        assert_eq!(pulled.count, 1, "only the edited header comes down");

        let conn = other.conn.lock().unwrap();
        let (items, payments): (i64, i64) = conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM order_items),
                        (SELECT COUNT(*) FROM order_payments)",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(
            (items, payments),
            (2, 2),
            "pulling an updated order header must not delete its children"
        );
        let cancelled: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM orders WHERE status = 'cancelled'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(cancelled, 1, "the header edit itself must land");
    }

    #[test]
    fn test_local_mutation_after_pull_becomes_dirty_again() {
        let state = seeded_state();
        checkout_once(&state);

        let mut remote = SqliteRemote::in_memory().expect("replica");
        let sync = SyncState::new();
        push(&state, &mut remote, &sync).expect("push");

        // Clean rows everywhere; a fresh adjustment dirties the product and
        // the next push sends only that delta.
        inventory::adjust_stock(&state, "P1", StockAdjustmentType::Damage, 1, "broke", "u1")
            .expect("adjust");
        let summary = push(&state, &mut remote, &sync).expect("incremental push");
        assert_eq!(summary.count, 2, "product update plus one new ledger row");

        let stock = remote
            .execute("SELECT stock FROM products WHERE id = 'P1'", &[])
            .expect("remote stock");
        assert_eq!(stock[0][0], SqlValue::Integer(3));
    }
}
