//! Remote replica boundary.
//!
//! The sync engine talks to the remote store through [`RemoteStore`], which
//! exposes exactly the surface the engine needs: `execute` for pull queries,
//! `batch` for atomic per-table push writes, and an explicit `close` at the
//! end of each cycle. Two implementations ship: [`HttpRemote`] for the
//! hosted SQL endpoint and [`SqliteRemote`] for file-based replicas (and the
//! engine's own tests).

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, ToSql, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::db;
use crate::error::{PosError, Result};

/// Default timeout for remote requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A remote-safe scalar. Dates travel as epoch-millisecond integers,
/// booleans as 0/1, everything unrepresentable is JSON-encoded text before
/// it gets here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    /// Convert a local SQLite value. Blobs have no remote-safe scalar form
    /// and are left to the caller's JSON fallback.
    pub fn from_value_ref(value: ValueRef<'_>) -> Option<SqlValue> {
        match value {
            ValueRef::Null => Some(SqlValue::Null),
            ValueRef::Integer(i) => Some(SqlValue::Integer(i)),
            ValueRef::Real(r) => Some(SqlValue::Real(r)),
            ValueRef::Text(t) => Some(SqlValue::Text(String::from_utf8_lossy(t).into_owned())),
            ValueRef::Blob(_) => None,
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(r) => ToSqlOutput::Owned(Value::Real(*r)),
            SqlValue::Text(t) => ToSqlOutput::Borrowed(ValueRef::Text(t.as_bytes())),
        })
    }
}

/// One parameterized statement of a push batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStatement {
    pub sql: String,
    pub args: Vec<SqlValue>,
}

/// The remote SQL-capable store consumed by the sync engine.
pub trait RemoteStore {
    /// Run one query and return its rows (column order as selected).
    fn execute(&mut self, sql: &str, args: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>>;

    /// Apply a batch of write statements as a single atomic call: either
    /// every statement applies or none do.
    fn batch(&mut self, statements: &[RemoteStatement]) -> Result<()>;

    /// Release the connection. Called once at the end of each sync cycle.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the remote endpoint URL:
/// - strip trailing slashes
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_remote_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> PosError {
    if err.is_connect() {
        return PosError::RemoteUnavailable(format!("cannot reach remote store at {url}"));
    }
    if err.is_timeout() {
        return PosError::RemoteUnavailable(format!("connection to {url} timed out"));
    }
    if err.is_builder() {
        return PosError::RemoteUnavailable(format!("invalid remote store URL: {url}"));
    }
    PosError::RemoteUnavailable(format!("network error communicating with {url}: {err}"))
}

fn status_error(url: &str, status: reqwest::StatusCode) -> PosError {
    let msg = match status.as_u16() {
        401 | 403 => format!("remote store rejected credentials ({status})"),
        404 => format!("remote store endpoint not found at {url}"),
        500..=599 => format!("remote store error ({status})"),
        _ => format!("unexpected remote response ({status})"),
    };
    PosError::RemoteUnavailable(msg)
}

// ---------------------------------------------------------------------------
// HTTP remote
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    sql: &'a str,
    args: &'a [SqlValue],
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    rows: Vec<Vec<SqlValue>>,
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    statements: &'a [RemoteStatement],
    mode: &'a str,
}

/// Remote store over the hosted HTTP SQL endpoint, authenticated with a
/// bearer token. Requests carry bounded timeouts; any transport or auth
/// failure maps to [`PosError::RemoteUnavailable`].
pub struct HttpRemote {
    base_url: String,
    auth_token: String,
    client: reqwest::blocking::Client,
}

impl HttpRemote {
    pub fn new(url: &str, auth_token: &str) -> Result<Self> {
        let base_url = normalize_remote_url(url);
        let client = reqwest::blocking::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .no_proxy()
            .build()
            .map_err(|e| PosError::RemoteUnavailable(format!("build http client: {e}")))?;
        Ok(HttpRemote {
            base_url,
            auth_token: auth_token.to_string(),
            client,
        })
    }

    fn post_json<T: Serialize>(&self, path: &str, body: &T) -> Result<reqwest::blocking::Response> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.auth_token)
            .json(body)
            .send()
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        if !response.status().is_success() {
            return Err(status_error(&self.base_url, response.status()));
        }
        Ok(response)
    }
}

impl RemoteStore for HttpRemote {
    fn execute(&mut self, sql: &str, args: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>> {
        debug!(sql, "remote execute");
        let response = self.post_json("/v1/execute", &ExecuteRequest { sql, args })?;
        let parsed: ExecuteResponse = response
            .json()
            .map_err(|e| PosError::RemoteUnavailable(format!("malformed remote response: {e}")))?;
        Ok(parsed.rows)
    }

    fn batch(&mut self, statements: &[RemoteStatement]) -> Result<()> {
        debug!(count = statements.len(), "remote batch write");
        self.post_json(
            "/v1/batch",
            &BatchRequest {
                statements,
                mode: "write",
            },
        )?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // reqwest pools connections internally; dropping the client at the
        // end of the cycle is sufficient.
        info!("remote connection closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQLite-backed remote
// ---------------------------------------------------------------------------

/// A replica living in another SQLite database. `batch` is one transaction,
/// matching the atomic-call contract of the HTTP endpoint.
pub struct SqliteRemote {
    conn: Connection,
    /// Number of write batches applied. Lets callers (and the idempotence
    /// tests) observe that a no-op push performed zero remote writes.
    pub batches_applied: u64,
}

impl SqliteRemote {
    /// Open (and migrate) a file-based replica.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        db::migrate_replica(&conn)?;
        Ok(SqliteRemote {
            conn,
            batches_applied: 0,
        })
    }

    /// Fresh in-memory replica with the full schema.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        db::migrate_replica(&conn)?;
        Ok(SqliteRemote {
            conn,
            batches_applied: 0,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl RemoteStore for SqliteRemote {
    fn execute(&mut self, sql: &str, args: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>> {
        let is_query = sql.trim_start().to_ascii_uppercase().starts_with("SELECT");
        if !is_query {
            self.conn.execute(sql, rusqlite::params_from_iter(args))?;
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(sql)?;
        let column_count = stmt.column_count();
        let mut rows = stmt.query(rusqlite::params_from_iter(args))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                let value = SqlValue::from_value_ref(row.get_ref(idx)?).ok_or_else(|| {
                    PosError::Serialization(format!("blob in replica result column {idx}"))
                })?;
                values.push(value);
            }
            out.push(values);
        }
        Ok(out)
    }

    fn batch(&mut self, statements: &[RemoteStatement]) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        for statement in statements {
            tx.execute(&statement.sql, rusqlite::params_from_iter(&statement.args))?;
        }
        tx.commit()?;
        self.batches_applied += 1;
        Ok(())
    }
}
