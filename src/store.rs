//! Store profile and tax configuration.
//!
//! `store_settings` is a singleton table: one row with the fixed id
//! `STORE_MAIN`, created on first launch and updated in place (versioned,
//! so the profile syncs like any other row). The active tax drives the
//! checkout total; exactly the rate seeded here applies until an admin
//! changes it.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PosError, Result};
use crate::money::TaxRate;
use crate::versioning::{new_row_id, BUMP_CLAUSE};

/// Fixed id of the singleton store profile row.
pub const STORE_SETTINGS_ID: &str = "STORE_MAIN";

/// Default tax seeded on first launch: PPN 11%.
const DEFAULT_TAX_NAME: &str = "PPN";
const DEFAULT_TAX_BPS: u32 = 1100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreProfile {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub logo_url: Option<String>,
    pub currency: Option<String>,
    pub receipt_footer: Option<String>,
}

/// Editable subset of the store profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreProfileUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub logo_url: Option<String>,
    pub currency: Option<String>,
    pub receipt_footer: Option<String>,
}

/// Seed the singleton store profile and the default tax if absent.
/// Idempotent; runs on every startup after migrations.
pub fn init_defaults(conn: &Connection) -> Result<()> {
    let seeded_profile = conn.execute(
        "INSERT OR IGNORE INTO store_settings (id) VALUES (?1)",
        params![STORE_SETTINGS_ID],
    )?;
    if seeded_profile > 0 {
        info!("Seeded default store profile ({STORE_SETTINGS_ID})");
    }

    let has_tax: i64 = conn.query_row("SELECT COUNT(*) FROM taxes", [], |row| row.get(0))?;
    if has_tax == 0 {
        conn.execute(
            "INSERT INTO taxes (id, name, rate, is_active) VALUES (?1, ?2, ?3, 1)",
            params![new_row_id(), DEFAULT_TAX_NAME, DEFAULT_TAX_BPS],
        )?;
        info!("Seeded default tax {DEFAULT_TAX_NAME} ({DEFAULT_TAX_BPS} bps)");
    }

    Ok(())
}

/// Read the store profile.
pub fn get_settings(conn: &Connection) -> Result<StoreProfile> {
    conn.query_row(
        "SELECT id, name, description, address, phone, email, website,
                logo_url, currency, receipt_footer
         FROM store_settings WHERE id = ?1",
        params![STORE_SETTINGS_ID],
        |row| {
            Ok(StoreProfile {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                address: row.get(3)?,
                phone: row.get(4)?,
                email: row.get(5)?,
                website: row.get(6)?,
                logo_url: row.get(7)?,
                currency: row.get(8)?,
                receipt_footer: row.get(9)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| PosError::NotFound {
        entity: "store profile",
        id: STORE_SETTINGS_ID.to_string(),
    })
}

/// Update the store profile. Only fields present in the payload change;
/// the row is versioned like any other syncable row.
pub fn update_settings(conn: &Connection, update: &StoreProfileUpdate) -> Result<StoreProfile> {
    if let Some(name) = &update.name {
        if name.trim().is_empty() {
            return Err(PosError::InvalidArgument(
                "store name cannot be empty".to_string(),
            ));
        }
    }

    let changed = conn.execute(
        &format!(
            "UPDATE store_settings SET
                name = COALESCE(?1, name),
                description = COALESCE(?2, description),
                address = COALESCE(?3, address),
                phone = COALESCE(?4, phone),
                email = COALESCE(?5, email),
                website = COALESCE(?6, website),
                logo_url = COALESCE(?7, logo_url),
                currency = COALESCE(?8, currency),
                receipt_footer = COALESCE(?9, receipt_footer),
                {BUMP_CLAUSE}
             WHERE id = ?10"
        ),
        params![
            update.name,
            update.description,
            update.address,
            update.phone,
            update.email,
            update.website,
            update.logo_url,
            update.currency,
            update.receipt_footer,
            STORE_SETTINGS_ID,
        ],
    )?;
    if changed == 0 {
        return Err(PosError::NotFound {
            entity: "store profile",
            id: STORE_SETTINGS_ID.to_string(),
        });
    }

    get_settings(conn)
}

/// The currently active tax as `(name, rate)`. Falls back to the default
/// PPN rate when no tax row is active, so checkout never runs untaxed by
/// accident.
pub fn active_tax(conn: &Connection) -> Result<(String, TaxRate)> {
    let row = conn
        .query_row(
            "SELECT name, rate FROM taxes
             WHERE is_active = 1 AND deleted_at IS NULL
             ORDER BY updated_at DESC LIMIT 1",
            [],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;

    Ok(match row {
        Some((name, bps)) => (name, TaxRate::from_bps(bps as u32)),
        None => (
            DEFAULT_TAX_NAME.to_string(),
            TaxRate::from_bps(DEFAULT_TAX_BPS),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::versioning::row_version;

    #[test]
    fn test_init_defaults_seeds_once() {
        let state = db::open_in_memory_for_test();
        let conn = state.conn.lock().unwrap();

        // open_in_memory_for_test already ran init_defaults; run again
        init_defaults(&conn).expect("idempotent");

        let profiles: i64 = conn
            .query_row("SELECT COUNT(*) FROM store_settings", [], |r| r.get(0))
            .unwrap();
        let taxes: i64 = conn
            .query_row("SELECT COUNT(*) FROM taxes", [], |r| r.get(0))
            .unwrap();
        assert_eq!((profiles, taxes), (1, 1));

        let (name, rate) = active_tax(&conn).expect("active tax");
        assert_eq!(name, "PPN");
        assert_eq!(rate, TaxRate::from_bps(1100));
    }

    #[test]
    fn test_update_settings_bumps_version() {
        let state = db::open_in_memory_for_test();
        let conn = state.conn.lock().unwrap();

        let update = StoreProfileUpdate {
            name: Some("Warung Kopi Kita".to_string()),
            currency: Some("IDR".to_string()),
            ..Default::default()
        };
        let profile = update_settings(&conn, &update).expect("update");
        assert_eq!(profile.name, "Warung Kopi Kita");
        // untouched fields keep their defaults
        assert_eq!(
            profile.receipt_footer.as_deref(),
            Some("Terima kasih atas kunjungan Anda!")
        );

        let (version, clean) =
            row_version(&conn, "store_settings", STORE_SETTINGS_ID).expect("version");
        assert_eq!(version, 2);
        assert!(!clean, "profile edit must mark the row dirty");
    }

    #[test]
    fn test_update_rejects_blank_name() {
        let state = db::open_in_memory_for_test();
        let conn = state.conn.lock().unwrap();

        let update = StoreProfileUpdate {
            name: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            update_settings(&conn, &update),
            Err(PosError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_active_tax_falls_back_when_none_active() {
        let state = db::open_in_memory_for_test();
        let conn = state.conn.lock().unwrap();

        conn.execute("UPDATE taxes SET is_active = 0", [])
            .expect("deactivate");

        let (name, rate) = active_tax(&conn).expect("fallback");
        assert_eq!(name, "PPN");
        assert_eq!(rate.bps(), 1100);
    }
}
