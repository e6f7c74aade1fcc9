//! Local SQLite layer for the POS core.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, the shared
//! [`DbState`] handle injected into every component, and the non-synced
//! `local_settings` key/value helpers used for sync-cycle bookkeeping.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{PosError, Result};
use crate::store;

/// Shared database handle with an explicit lifecycle: opened once at process
/// start, shared by reference across components, closed on drop at shutdown.
pub struct DbState {
    pub conn: Mutex<Connection>,
    /// Table-set intent lock: a push/pull cycle holds this for its whole
    /// duration, and local business mutations acquire it around their
    /// transactions, so a mutation never reads a half-migrated watermark.
    pub sync_gate: Mutex<()>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Default used for every `created_at`/`updated_at` column: RFC 3339 UTC
/// with millisecond precision, matching `versioning::now_rfc3339`.
const NOW_SQL: &str = "strftime('%Y-%m-%dT%H:%M:%fZ','now')";

/// Initialize the database at `{data_dir}/pos.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// runs pending migrations, and seeds the default store profile and tax.
/// On corruption or open failure, deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir).map_err(|e| PosError::Storage(format!("create data dir: {e}")))?;

    let db_path = data_dir.join("pos.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;
    store::init_defaults(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        sync_gate: Mutex::new(()),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: catalog, sales, and ledger tables.
///
/// Every syncable table carries the versioning columns (`version`,
/// `sync_status`) plus RFC 3339 `created_at`/`updated_at` and a soft-delete
/// `deleted_at` — syncable rows are never physically removed; deletion is a
/// state transition the sync engine propagates like any other update.
/// Monetary columns are INTEGER minor units; rates are INTEGER basis points.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "
        -- local_settings (category/key/value store, NOT synced)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            updated_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            UNIQUE(setting_category, setting_key)
        );

        -- users
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            username TEXT UNIQUE NOT NULL,
            password TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'cashier' CHECK (role IN ('admin', 'cashier')),
            avatar_url TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            updated_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            deleted_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            sync_status INTEGER NOT NULL DEFAULT 0
        );

        -- categories
        CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            slug TEXT UNIQUE NOT NULL,
            created_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            updated_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            deleted_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            sync_status INTEGER NOT NULL DEFAULT 0
        );

        -- products (stock is the authoritative on-hand count)
        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            category_id TEXT REFERENCES categories(id) ON DELETE SET NULL,
            name TEXT NOT NULL,
            description TEXT,
            image_url TEXT,
            barcode TEXT UNIQUE,
            sku TEXT UNIQUE,
            price INTEGER NOT NULL DEFAULT 0,
            cost_price INTEGER NOT NULL DEFAULT 0,
            stock INTEGER NOT NULL DEFAULT 0,
            min_stock INTEGER NOT NULL DEFAULT 5,
            unit TEXT DEFAULT 'pcs',
            is_active INTEGER NOT NULL DEFAULT 1,
            has_recipe INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            updated_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            deleted_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            sync_status INTEGER NOT NULL DEFAULT 0
        );

        -- members (loyalty)
        CREATE TABLE IF NOT EXISTS members (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phone TEXT UNIQUE NOT NULL,
            email TEXT,
            points INTEGER NOT NULL DEFAULT 0,
            tier TEXT DEFAULT 'Silver',
            created_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            updated_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            deleted_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            sync_status INTEGER NOT NULL DEFAULT 0
        );

        -- discounts (value is bps for PERCENTAGE, minor units for FIXED)
        CREATE TABLE IF NOT EXISTS discounts (
            id TEXT PRIMARY KEY,
            code TEXT UNIQUE NOT NULL,
            name TEXT NOT NULL,
            type TEXT NOT NULL CHECK (type IN ('PERCENTAGE', 'FIXED')),
            value INTEGER NOT NULL,
            start_date TEXT,
            end_date TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            updated_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            deleted_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            sync_status INTEGER NOT NULL DEFAULT 0
        );

        -- taxes (rate in basis points: 1100 = 11%)
        CREATE TABLE IF NOT EXISTS taxes (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            rate INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            updated_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            deleted_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            sync_status INTEGER NOT NULL DEFAULT 0
        );

        -- orders (header; snapshots the tax applied at transaction time)
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            member_id TEXT REFERENCES members(id) ON DELETE SET NULL,
            discount_id TEXT REFERENCES discounts(id) ON DELETE SET NULL,
            cashier_id TEXT REFERENCES users(id),
            subtotal INTEGER NOT NULL DEFAULT 0,
            discount_amount INTEGER NOT NULL DEFAULT 0,
            tax_amount INTEGER NOT NULL DEFAULT 0,
            total_amount INTEGER NOT NULL,
            tax_name_snapshot TEXT,
            tax_rate_snapshot INTEGER,
            order_type TEXT NOT NULL DEFAULT 'dine_in'
                CHECK (order_type IN ('dine_in', 'take_away')),
            payment_method TEXT NOT NULL DEFAULT 'cash'
                CHECK (payment_method IN ('cash', 'debit', 'qris', 'split')),
            amount_paid INTEGER NOT NULL,
            change INTEGER NOT NULL DEFAULT 0,
            table_number TEXT,
            customer_name TEXT,
            queue_number INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'completed', 'cancelled')),
            created_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            updated_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            deleted_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            sync_status INTEGER NOT NULL DEFAULT 0
        );

        -- order_items (immutable price/name snapshots at transaction time)
        CREATE TABLE IF NOT EXISTS order_items (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            product_id TEXT REFERENCES products(id) ON DELETE SET NULL,
            product_name_snapshot TEXT NOT NULL,
            sku_snapshot TEXT,
            quantity INTEGER NOT NULL,
            price_at_time INTEGER NOT NULL,
            cost_price_at_time INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            updated_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            deleted_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            sync_status INTEGER NOT NULL DEFAULT 0
        );

        -- order_payments (one row per settlement leg; split pay = many rows)
        CREATE TABLE IF NOT EXISTS order_payments (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            payment_method TEXT NOT NULL,
            amount INTEGER NOT NULL,
            reference_id TEXT,
            created_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            updated_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            deleted_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            sync_status INTEGER NOT NULL DEFAULT 0
        );

        -- inventory_logs (append-only stock ledger; never updated)
        CREATE TABLE IF NOT EXISTS inventory_logs (
            id TEXT PRIMARY KEY,
            product_id TEXT NOT NULL REFERENCES products(id),
            change_amount INTEGER NOT NULL,
            final_stock INTEGER NOT NULL,
            type TEXT NOT NULL CHECK (type IN ('sale', 'restock', 'correction', 'damage')),
            note TEXT,
            reference_id TEXT,
            user_id TEXT REFERENCES users(id),
            created_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            updated_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            deleted_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            sync_status INTEGER NOT NULL DEFAULT 0
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_products_name ON products(name);
        CREATE INDEX IF NOT EXISTS idx_products_category ON products(category_id);
        CREATE INDEX IF NOT EXISTS idx_products_active ON products(is_active);
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_orders_member ON orders(member_id);
        CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);
        CREATE INDEX IF NOT EXISTS idx_order_items_product ON order_items(product_id);
        CREATE INDEX IF NOT EXISTS idx_order_payments_order ON order_payments(order_id);
        CREATE INDEX IF NOT EXISTS idx_inventory_logs_product ON inventory_logs(product_id);
        CREATE INDEX IF NOT EXISTS idx_inventory_logs_created_at ON inventory_logs(created_at);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key
            ON local_settings(setting_category, setting_key);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        "
    ))
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        PosError::from(e)
    })?;

    info!("Applied migration v1 (catalog, sales, ledger tables)");
    Ok(())
}

/// Migration v2: recipe engine, shifts, and store settings tables.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "
        -- ingredients (cost per unit in minor units; nutrition per 100 units)
        CREATE TABLE IF NOT EXISTS ingredients (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            unit TEXT DEFAULT 'gr',
            cost_per_unit INTEGER NOT NULL DEFAULT 0,
            calories REAL NOT NULL DEFAULT 0,
            protein REAL NOT NULL DEFAULT 0,
            carbs REAL NOT NULL DEFAULT 0,
            sugar REAL NOT NULL DEFAULT 0,
            fat REAL NOT NULL DEFAULT 0,
            sodium REAL NOT NULL DEFAULT 0,
            is_gluten_free INTEGER NOT NULL DEFAULT 1,
            contains_dairy INTEGER NOT NULL DEFAULT 0,
            contains_nuts INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            updated_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            deleted_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            sync_status INTEGER NOT NULL DEFAULT 0
        );

        -- product_recipes (bridging table; quantity in the ingredient's unit)
        CREATE TABLE IF NOT EXISTS product_recipes (
            id TEXT PRIMARY KEY,
            product_id TEXT NOT NULL REFERENCES products(id) ON DELETE CASCADE,
            ingredient_id TEXT NOT NULL REFERENCES ingredients(id) ON DELETE RESTRICT,
            quantity REAL NOT NULL,
            created_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            updated_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            deleted_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            sync_status INTEGER NOT NULL DEFAULT 0
        );

        -- shifts (cash drawer sessions)
        CREATE TABLE IF NOT EXISTS shifts (
            id TEXT PRIMARY KEY,
            cashier_id TEXT NOT NULL REFERENCES users(id),
            start_time TEXT NOT NULL,
            end_time TEXT,
            start_cash INTEGER NOT NULL,
            expected_end_cash INTEGER,
            actual_end_cash INTEGER,
            difference INTEGER,
            status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'closed')),
            created_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            updated_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            deleted_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            sync_status INTEGER NOT NULL DEFAULT 0
        );

        -- store_settings (singleton row STORE_MAIN)
        CREATE TABLE IF NOT EXISTS store_settings (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL DEFAULT 'Smart POS Store',
            description TEXT,
            address TEXT,
            phone TEXT,
            email TEXT,
            website TEXT,
            logo_url TEXT,
            currency TEXT DEFAULT 'IDR',
            receipt_footer TEXT DEFAULT 'Terima kasih atas kunjungan Anda!',
            created_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            updated_at TEXT NOT NULL DEFAULT ({NOW_SQL}),
            deleted_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            sync_status INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_ingredients_name ON ingredients(name);
        CREATE INDEX IF NOT EXISTS idx_product_recipes_product ON product_recipes(product_id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (2);
        "
    ))
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        PosError::from(e)
    })?;

    info!("Applied migration v2 (recipe engine, shifts, store settings)");
    Ok(())
}

/// Migration v3: dirty-row scan indexes for the sync engine's per-table
/// `sync_status = 0` selects.
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_users_sync_status ON users(sync_status);
        CREATE INDEX IF NOT EXISTS idx_categories_sync_status ON categories(sync_status);
        CREATE INDEX IF NOT EXISTS idx_products_sync_status ON products(sync_status);
        CREATE INDEX IF NOT EXISTS idx_ingredients_sync_status ON ingredients(sync_status);
        CREATE INDEX IF NOT EXISTS idx_product_recipes_sync_status ON product_recipes(sync_status);
        CREATE INDEX IF NOT EXISTS idx_members_sync_status ON members(sync_status);
        CREATE INDEX IF NOT EXISTS idx_discounts_sync_status ON discounts(sync_status);
        CREATE INDEX IF NOT EXISTS idx_taxes_sync_status ON taxes(sync_status);
        CREATE INDEX IF NOT EXISTS idx_orders_sync_status ON orders(sync_status);
        CREATE INDEX IF NOT EXISTS idx_order_items_sync_status ON order_items(sync_status);
        CREATE INDEX IF NOT EXISTS idx_order_payments_sync_status ON order_payments(sync_status);
        CREATE INDEX IF NOT EXISTS idx_inventory_logs_sync_status ON inventory_logs(sync_status);
        CREATE INDEX IF NOT EXISTS idx_shifts_sync_status ON shifts(sync_status);
        CREATE INDEX IF NOT EXISTS idx_store_settings_sync_status ON store_settings(sync_status);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        PosError::from(e)
    })?;

    info!("Applied migration v3 (sync_status indexes)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single local (non-synced) setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a local setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Open a fully migrated in-memory store (test helper, not public API).
#[cfg(test)]
pub(crate) fn open_in_memory_for_test() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .expect("pragma setup");
    run_migrations(&conn).expect("run_migrations should succeed in test");
    store::init_defaults(&conn).expect("seed defaults");
    DbState {
        conn: Mutex::new(conn),
        sync_gate: Mutex::new(()),
        db_path: PathBuf::from(":memory:"),
    }
}

/// Migrate an arbitrary connection to the current schema. The sync engine's
/// SQLite-backed remote replica uses this to provision itself.
pub fn migrate_replica(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    run_migrations(conn)
}

// ===========================================================================
// Tests
// ===========================================================================
