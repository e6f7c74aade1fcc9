//! Versioning layer shared by every syncable table.
//!
//! Every syncable row carries `version` (monotonic counter, starts at 1),
//! `sync_status` (0 = dirty, 1 = confirmed remote), and RFC 3339 text
//! timestamps. The contract: any mutation must, inside the same transaction
//! as the business change, bump `version` by exactly 1, clear `sync_status`,
//! and refresh `updated_at`. Mutating code embeds [`BUMP_CLAUSE`] in its
//! UPDATE statements; only the sync engine ever sets `sync_status = 1`.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::error::Result;

/// SET-clause fragment applied by every mutating UPDATE. Parameterless so it
/// composes with any numbered-placeholder statement; the timestamp format
/// matches [`now_rfc3339`].
pub const BUMP_CLAUSE: &str =
    "version = version + 1, sync_status = 0, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')";

/// New time-sortable row id (UUID v7), so creation order is recoverable
/// from the identifier alone.
pub fn new_row_id() -> String {
    Uuid::now_v7().to_string()
}

/// Current UTC instant as millisecond-precision RFC 3339 text, the local
/// on-disk timestamp format.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Read back `(version, sync_status)` for one row. Used by the sync engine's
/// bookkeeping and by tests asserting the monotonicity invariant after every
/// mutating call.
pub fn row_version(conn: &Connection, table: &str, id: &str) -> Result<(i64, bool)> {
    // `table` is always one of our compile-time table names, never input.
    let (version, clean): (i64, i64) = conn.query_row(
        &format!("SELECT version, sync_status FROM {table} WHERE id = ?1"),
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok((version, clean != 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_ids_are_time_sortable() {
        let ids: Vec<String> = (0..50).map(|_| new_row_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted, "uuid v7 ids must sort in creation order");
    }

    #[test]
    fn test_bump_clause_increments_and_dirties() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE widgets (
                id TEXT PRIMARY KEY,
                name TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                sync_status INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT
            );
            INSERT INTO widgets (id, name, sync_status, updated_at)
                VALUES ('w1', 'a', 1, '2024-01-01T00:00:00.000Z');",
        )
        .expect("setup");

        conn.execute(
            &format!("UPDATE widgets SET name = ?1, {BUMP_CLAUSE} WHERE id = ?2"),
            params!["b", "w1"],
        )
        .expect("update");

        let (version, clean) = row_version(&conn, "widgets", "w1").expect("row_version");
        assert_eq!(version, 2, "version bumps by exactly 1");
        assert!(!clean, "mutation must clear sync_status");

        let stamped: String = conn
            .query_row("SELECT updated_at FROM widgets WHERE id = 'w1'", [], |r| {
                r.get(0)
            })
            .expect("read updated_at");
        chrono::DateTime::parse_from_rfc3339(&stamped).expect("bump writes rfc3339");
    }

    #[test]
    fn test_timestamps_are_rfc3339_millis() {
        let ts = now_rfc3339();
        chrono::DateTime::parse_from_rfc3339(&ts).expect("parse");
        assert!(ts.ends_with('Z'));
    }
}
