//! Shared fixtures for in-module tests.

use rusqlite::{params, Connection};

use crate::db::{self, DbState};

/// Fully migrated in-memory store with defaults seeded.
pub(crate) fn test_state() -> DbState {
    db::open_in_memory_for_test()
}

pub(crate) fn seed_user(conn: &Connection, id: &str, name: &str) {
    conn.execute(
        "INSERT INTO users (id, name, username, password, role)
         VALUES (?1, ?2, ?3, 'x', 'cashier')",
        params![id, name, format!("user-{id}")],
    )
    .expect("seed user");
}

pub(crate) fn seed_product(conn: &Connection, id: &str, name: &str, price_minor: i64, stock: i64) {
    conn.execute(
        "INSERT INTO products (id, name, sku, price, cost_price, stock)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, name, format!("SKU-{id}"), price_minor, price_minor / 2, stock],
    )
    .expect("seed product");
}

pub(crate) fn seed_ingredient(
    conn: &Connection,
    id: &str,
    name: &str,
    cost_per_unit_minor: i64,
    calories_per_100: f64,
) {
    conn.execute(
        "INSERT INTO ingredients (id, name, unit, cost_per_unit, calories)
         VALUES (?1, ?2, 'gr', ?3, ?4)",
        params![id, name, cost_per_unit_minor, calories_per_100],
    )
    .expect("seed ingredient");
}

/// Sum of ledger deltas for one product, the replay total.
pub(crate) fn ledger_sum(conn: &Connection, product_id: &str) -> i64 {
    conn.query_row(
        "SELECT COALESCE(SUM(change_amount), 0) FROM inventory_logs WHERE product_id = ?1",
        params![product_id],
        |row| row.get(0),
    )
    .expect("ledger sum")
}

pub(crate) fn product_stock(conn: &Connection, product_id: &str) -> i64 {
    conn.query_row(
        "SELECT stock FROM products WHERE id = ?1",
        params![product_id],
        |row| row.get(0),
    )
    .expect("product stock")
}
