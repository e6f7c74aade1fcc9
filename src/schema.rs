//! Sync table registry.
//!
//! One [`TableDesc`] per syncable table, listing every column with its wire
//! kind. The sync engine never introspects the database at runtime; these
//! descriptors are the single source of truth for which tables sync, in
//! which order, and how each value crosses the wire:
//!
//! - `Timestamp`: RFC 3339 text locally, epoch milliseconds remotely
//! - `Boolean`: INTEGER locally, normalised to 0/1 remotely
//! - everything else passes through as-is; blobs and kind mismatches are
//!   JSON-encoded text as a last resort
//!
//! Order matters: [`SYNC_TABLES`] lists parents before children so pulled
//! rows never hit a missing foreign key.

use chrono::{DateTime, SecondsFormat};
use rusqlite::types::{Value, ValueRef};

use crate::error::{PosError, Result};
use crate::remote::SqlValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
    Boolean,
    Timestamp,
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnDesc {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub nullable: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TableDesc {
    pub name: &'static str,
    pub columns: &'static [ColumnDesc],
}

const fn text(name: &'static str) -> ColumnDesc {
    ColumnDesc {
        name,
        kind: ColumnKind::Text,
        nullable: false,
    }
}

const fn text_null(name: &'static str) -> ColumnDesc {
    ColumnDesc {
        name,
        kind: ColumnKind::Text,
        nullable: true,
    }
}

const fn integer(name: &'static str) -> ColumnDesc {
    ColumnDesc {
        name,
        kind: ColumnKind::Integer,
        nullable: false,
    }
}

const fn integer_null(name: &'static str) -> ColumnDesc {
    ColumnDesc {
        name,
        kind: ColumnKind::Integer,
        nullable: true,
    }
}

const fn real(name: &'static str) -> ColumnDesc {
    ColumnDesc {
        name,
        kind: ColumnKind::Real,
        nullable: false,
    }
}

const fn boolean(name: &'static str) -> ColumnDesc {
    ColumnDesc {
        name,
        kind: ColumnKind::Boolean,
        nullable: false,
    }
}

const fn timestamp(name: &'static str) -> ColumnDesc {
    ColumnDesc {
        name,
        kind: ColumnKind::Timestamp,
        nullable: false,
    }
}

const fn timestamp_null(name: &'static str) -> ColumnDesc {
    ColumnDesc {
        name,
        kind: ColumnKind::Timestamp,
        nullable: true,
    }
}

// Appends the versioning columns every syncable table carries, so each
// descriptor only spells out its business columns.
macro_rules! table {
    ($name:literal, [$($col:expr),* $(,)?]) => {
        TableDesc {
            name: $name,
            columns: &[
                $($col,)*
                timestamp("created_at"),
                timestamp("updated_at"),
                timestamp_null("deleted_at"),
                integer("version"),
                boolean("sync_status"),
            ],
        }
    };
}

/// Every syncable table, parents before children. The sync engine walks
/// this list front-to-back for both push and pull.
pub const SYNC_TABLES: &[TableDesc] = &[
    table!(
        "users",
        [
            text("id"),
            text("name"),
            text("username"),
            text("password"),
            text("role"),
            text_null("avatar_url"),
            boolean("is_active"),
        ]
    ),
    table!(
        "categories",
        [
            text("id"),
            text("name"),
            text_null("description"),
            text("slug"),
        ]
    ),
    table!(
        "products",
        [
            text("id"),
            text_null("category_id"),
            text("name"),
            text_null("description"),
            text_null("image_url"),
            text_null("barcode"),
            text_null("sku"),
            integer("price"),
            integer("cost_price"),
            integer("stock"),
            integer("min_stock"),
            text_null("unit"),
            boolean("is_active"),
            boolean("has_recipe"),
        ]
    ),
    table!(
        "ingredients",
        [
            text("id"),
            text("name"),
            text_null("unit"),
            integer("cost_per_unit"),
            real("calories"),
            real("protein"),
            real("carbs"),
            real("sugar"),
            real("fat"),
            real("sodium"),
            boolean("is_gluten_free"),
            boolean("contains_dairy"),
            boolean("contains_nuts"),
        ]
    ),
    table!(
        "product_recipes",
        [
            text("id"),
            text("product_id"),
            text("ingredient_id"),
            real("quantity"),
        ]
    ),
    table!(
        "members",
        [
            text("id"),
            text("name"),
            text("phone"),
            text_null("email"),
            integer("points"),
            text_null("tier"),
        ]
    ),
    table!(
        "discounts",
        [
            text("id"),
            text("code"),
            text("name"),
            text("type"),
            integer("value"),
            timestamp_null("start_date"),
            timestamp_null("end_date"),
            boolean("is_active"),
        ]
    ),
    table!(
        "taxes",
        [
            text("id"),
            text("name"),
            integer("rate"),
            boolean("is_active"),
        ]
    ),
    table!(
        "orders",
        [
            text("id"),
            text_null("member_id"),
            text_null("discount_id"),
            text_null("cashier_id"),
            integer("subtotal"),
            integer("discount_amount"),
            integer("tax_amount"),
            integer("total_amount"),
            text_null("tax_name_snapshot"),
            integer_null("tax_rate_snapshot"),
            text("order_type"),
            text("payment_method"),
            integer("amount_paid"),
            integer("change"),
            text_null("table_number"),
            text_null("customer_name"),
            integer("queue_number"),
            text("status"),
        ]
    ),
    table!(
        "order_items",
        [
            text("id"),
            text("order_id"),
            text_null("product_id"),
            text("product_name_snapshot"),
            text_null("sku_snapshot"),
            integer("quantity"),
            integer("price_at_time"),
            integer("cost_price_at_time"),
        ]
    ),
    table!(
        "order_payments",
        [
            text("id"),
            text("order_id"),
            text("payment_method"),
            integer("amount"),
            text_null("reference_id"),
        ]
    ),
    table!(
        "inventory_logs",
        [
            text("id"),
            text("product_id"),
            integer("change_amount"),
            integer("final_stock"),
            text("type"),
            text_null("note"),
            text_null("reference_id"),
            text_null("user_id"),
        ]
    ),
    table!(
        "shifts",
        [
            text("id"),
            text("cashier_id"),
            timestamp("start_time"),
            timestamp_null("end_time"),
            integer("start_cash"),
            integer_null("expected_end_cash"),
            integer_null("actual_end_cash"),
            integer_null("difference"),
            text("status"),
        ]
    ),
    table!(
        "store_settings",
        [
            text("id"),
            text("name"),
            text_null("description"),
            text_null("address"),
            text_null("phone"),
            text_null("email"),
            text_null("website"),
            text_null("logo_url"),
            text_null("currency"),
            text_null("receipt_footer"),
        ]
    ),
];

impl TableDesc {
    /// Look a table up by name.
    pub fn by_name(name: &str) -> Option<&'static TableDesc> {
        SYNC_TABLES.iter().find(|t| t.name == name)
    }

    fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| c.name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn placeholder_list(&self) -> String {
        (1..=self.columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Push: select every dirty row, all columns in descriptor order.
    pub fn select_dirty_sql(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE sync_status = 0",
            self.column_list(),
            self.name
        )
    }

    /// Pull: select remote rows newer than the local watermark, oldest first
    /// so a partial pull still leaves a consistent watermark.
    pub fn select_newer_sql(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE version > ?1 ORDER BY version ASC",
            self.column_list(),
            self.name
        )
    }

    /// Full-row upsert, last writer wins. Conflicts update in place:
    /// `INSERT OR REPLACE` is a delete-plus-reinsert, and with foreign keys
    /// on it would cascade-delete the row's children.
    pub fn upsert_sql(&self) -> String {
        let updates = self
            .columns
            .iter()
            .skip(1)
            .map(|c| format!("{0} = excluded.{0}", c.name))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {updates}",
            self.name,
            self.column_list(),
            self.placeholder_list()
        )
    }
}

// ---------------------------------------------------------------------------
// Wire conversion
// ---------------------------------------------------------------------------

fn json_fallback(column: &ColumnDesc, value: ValueRef<'_>) -> Result<SqlValue> {
    let json = match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(r) => serde_json::Value::from(r),
        ValueRef::Text(t) => serde_json::Value::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::from(b.to_vec()),
    };
    let encoded = serde_json::to_string(&json)
        .map_err(|e| PosError::Serialization(format!("column {}: {e}", column.name)))?;
    Ok(SqlValue::Text(encoded))
}

/// Convert one local SQLite value into its remote-safe form.
pub fn to_remote(column: &ColumnDesc, value: ValueRef<'_>) -> Result<SqlValue> {
    match (column.kind, value) {
        (_, ValueRef::Null) => Ok(SqlValue::Null),
        (ColumnKind::Timestamp, ValueRef::Text(t)) => {
            let text = std::str::from_utf8(t).map_err(|_| {
                PosError::Serialization(format!("column {}: non-utf8 timestamp", column.name))
            })?;
            let parsed = DateTime::parse_from_rfc3339(text).map_err(|e| {
                PosError::Serialization(format!(
                    "column {}: bad timestamp {text:?}: {e}",
                    column.name
                ))
            })?;
            Ok(SqlValue::Integer(parsed.timestamp_millis()))
        }
        (ColumnKind::Boolean, ValueRef::Integer(i)) => {
            Ok(SqlValue::Integer(if i != 0 { 1 } else { 0 }))
        }
        (ColumnKind::Integer, ValueRef::Integer(i)) => Ok(SqlValue::Integer(i)),
        (ColumnKind::Real, ValueRef::Real(r)) => Ok(SqlValue::Real(r)),
        (ColumnKind::Real, ValueRef::Integer(i)) => Ok(SqlValue::Real(i as f64)),
        (ColumnKind::Text, ValueRef::Text(t)) => {
            Ok(SqlValue::Text(String::from_utf8_lossy(t).into_owned()))
        }
        // Blob or kind mismatch: carry the value as JSON text rather than
        // losing the row.
        (_, other) => json_fallback(column, other),
    }
}

/// Convert one remote value back into local storage form.
pub fn from_remote(column: &ColumnDesc, value: &SqlValue) -> Result<Value> {
    match (column.kind, value) {
        (_, SqlValue::Null) => Ok(Value::Null),
        (ColumnKind::Timestamp, SqlValue::Integer(ms)) => {
            let stamp = DateTime::from_timestamp_millis(*ms).ok_or_else(|| {
                PosError::Serialization(format!(
                    "column {}: epoch millis {ms} out of range",
                    column.name
                ))
            })?;
            Ok(Value::Text(
                stamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            ))
        }
        // Older remotes may already store text timestamps; keep them as-is.
        (ColumnKind::Timestamp, SqlValue::Text(t)) => Ok(Value::Text(t.clone())),
        (ColumnKind::Boolean, SqlValue::Integer(i)) => {
            Ok(Value::Integer(if *i != 0 { 1 } else { 0 }))
        }
        (ColumnKind::Integer, SqlValue::Integer(i)) => Ok(Value::Integer(*i)),
        (ColumnKind::Real, SqlValue::Real(r)) => Ok(Value::Real(*r)),
        (ColumnKind::Real, SqlValue::Integer(i)) => Ok(Value::Real(*i as f64)),
        (ColumnKind::Text, SqlValue::Text(t)) => Ok(Value::Text(t.clone())),
        // JSON widening on the remote side: numbers into text columns.
        (ColumnKind::Text, SqlValue::Integer(i)) => Ok(Value::Text(i.to_string())),
        (kind, other) => Err(PosError::Serialization(format!(
            "column {}: cannot store {other:?} as {kind:?}",
            column.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn migrated_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        db::migrate_replica(&conn).expect("migrate");
        conn
    }

    #[test]
    fn test_descriptors_match_live_schema() {
        let conn = migrated_conn();

        for table in SYNC_TABLES {
            let mut stmt = conn
                .prepare(&format!("PRAGMA table_info({})", table.name))
                .expect("table_info");
            let live: Vec<String> = stmt
                .query_map([], |row| row.get::<_, String>(1))
                .expect("query")
                .filter_map(|r| r.ok())
                .collect();

            let described: Vec<String> = table
                .columns
                .iter()
                .map(|c| c.name.to_string())
                .collect();
            assert_eq!(
                described, live,
                "descriptor for {} out of step with migrations",
                table.name
            );
        }
    }

    #[test]
    fn test_parents_precede_children() {
        let position = |name: &str| {
            SYNC_TABLES
                .iter()
                .position(|t| t.name == name)
                .unwrap_or_else(|| panic!("{name} missing from SYNC_TABLES"))
        };

        for (child, parent) in [
            ("products", "categories"),
            ("product_recipes", "products"),
            ("product_recipes", "ingredients"),
            ("orders", "users"),
            ("orders", "members"),
            ("orders", "discounts"),
            ("order_items", "orders"),
            ("order_items", "products"),
            ("order_payments", "orders"),
            ("inventory_logs", "products"),
            ("inventory_logs", "users"),
            ("shifts", "users"),
        ] {
            assert!(
                position(parent) < position(child),
                "{parent} must sync before {child}"
            );
        }
    }

    #[test]
    fn test_timestamp_round_trip() {
        let col = timestamp("created_at");

        let remote =
            to_remote(&col, ValueRef::Text(b"2025-03-01T10:30:00.250Z")).expect("to remote");
        assert_eq!(remote, SqlValue::Integer(1_740_825_000_250));

        let local = from_remote(&col, &remote).expect("from remote");
        assert_eq!(local, Value::Text("2025-03-01T10:30:00.250Z".to_string()));
    }

    #[test]
    fn test_boolean_normalised_to_zero_or_one() {
        let col = boolean("is_active");
        assert_eq!(
            to_remote(&col, ValueRef::Integer(7)).expect("to remote"),
            SqlValue::Integer(1)
        );
        assert_eq!(
            from_remote(&col, &SqlValue::Integer(-3)).expect("from remote"),
            Value::Integer(1)
        );
        assert_eq!(
            from_remote(&col, &SqlValue::Integer(0)).expect("from remote"),
            Value::Integer(0)
        );
    }

    #[test]
    fn test_blob_falls_back_to_json_text() {
        let col = text_null("note");
        let remote = to_remote(&col, ValueRef::Blob(&[1, 2, 3])).expect("to remote");
        assert_eq!(remote, SqlValue::Text("[1,2,3]".to_string()));
    }

    #[test]
    fn test_bad_timestamp_is_a_serialization_error() {
        let col = timestamp("updated_at");
        let err = to_remote(&col, ValueRef::Text(b"yesterday")).expect_err("must fail");
        assert!(matches!(err, PosError::Serialization(_)));
    }

    #[test]
    fn test_upsert_sql_shape() {
        let taxes = TableDesc::by_name("taxes").expect("taxes");
        assert_eq!(
            taxes.upsert_sql(),
            "INSERT INTO taxes (id, name, rate, is_active, created_at, updated_at, \
             deleted_at, version, sync_status) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, rate = excluded.rate, \
             is_active = excluded.is_active, created_at = excluded.created_at, \
             updated_at = excluded.updated_at, deleted_at = excluded.deleted_at, \
             version = excluded.version, sync_status = excluded.sync_status"
        );
    }

    #[test]
    fn test_upsert_keeps_child_rows_on_conflict() {
        let conn = migrated_conn();
        conn.execute_batch(
            "INSERT INTO orders (id, total_amount, amount_paid) VALUES ('ord-1', 1000, 1000);
             INSERT INTO order_items (id, order_id, product_name_snapshot, quantity, price_at_time)
                VALUES ('oi-1', 'ord-1', 'Kopi', 1, 1000);",
        )
        .expect("seed order graph");

        let orders = TableDesc::by_name("orders").expect("orders");
        let mut select = conn
            .prepare(&format!(
                "SELECT {} FROM orders WHERE id = 'ord-1'",
                orders
                    .columns
                    .iter()
                    .map(|c| c.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
            .expect("prepare");
        let mut values: Vec<Value> = select
            .query_row([], |row| {
                (0..orders.columns.len())
                    .map(|i| row.get::<_, Value>(i))
                    .collect()
            })
            .expect("read row");
        // Rewrite the header as a pulled remote row would.
        values[orders
            .columns
            .iter()
            .position(|c| c.name == "status")
            .unwrap()] = Value::Text("cancelled".to_string());

        conn.execute(&orders.upsert_sql(), rusqlite::params_from_iter(&values))
            .expect("upsert existing header");

        let items: i64 = conn
            .query_row("SELECT COUNT(*) FROM order_items", [], |r| r.get(0))
            .unwrap();
        assert_eq!(items, 1, "conflicting upsert must not cascade to children");
    }
}
