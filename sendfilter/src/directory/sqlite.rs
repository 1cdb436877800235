use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OpenFlags, ToSql};
use tokio::sync::Mutex;
use tracing::debug;

use super::sql::{email_param, RejectionQuery};
use super::AccountDirectory;
use crate::activity::{AccountActivityPredicate, Backend, SQLITE_LOWER_FUNCTION};
use crate::address::EmailAddress;
use crate::error::FilterError;
use crate::reason::RejectionReason;

/// Timestamps are stored and compared in this form.
pub const SQLITE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Account directory backed by the host application's SQLite database.
///
/// Queries run on the blocking pool, one at a time.
#[derive(Clone)]
pub struct SqliteDirectory {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDirectory {
    /// Opens an existing database read-only. `backend` must be SQLite.
    pub async fn open(path: impl AsRef<Path>, backend: Backend) -> Result<Self, FilterError> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || {
            Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        })
        .await
        .map_err(|e| FilterError::directory(e.to_string()))?
        .map_err(|e| FilterError::directory(e.to_string()))?;

        Self::from_connection(conn, backend)
    }

    /// Wraps `conn` and registers the Unicode lower-casing function the
    /// rendered queries call.
    pub fn from_connection(conn: Connection, backend: Backend) -> Result<Self, FilterError> {
        ensure_sqlite(backend)?;
        conn.create_scalar_function(
            SQLITE_LOWER_FUNCTION,
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| Ok(ctx.get::<Option<String>>(0)?.map(|email| email.to_lowercase())),
        )
        .map_err(|e| FilterError::directory(e.to_string()))?;

        Ok(SqliteDirectory {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T, FilterError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| FilterError::directory(e.to_string()))?
        .map_err(|e| FilterError::directory(e.to_string()))
    }
}

fn ensure_sqlite(backend: Backend) -> Result<(), FilterError> {
    match backend {
        Backend::Sqlite => Ok(()),
        other => Err(FilterError::UnsupportedBackend {
            backend: other.to_string(),
        }),
    }
}

#[async_trait]
impl AccountDirectory for SqliteDirectory {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    async fn find_rejections(
        &self,
        emails: &BTreeSet<EmailAddress>,
        predicate: &AccountActivityPredicate,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<EmailAddress, RejectionReason>, FilterError> {
        if emails.is_empty() || !predicate.checks().any() {
            return Ok(BTreeMap::new());
        }

        ensure_sqlite(predicate.backend())?;
        let query = RejectionQuery::render(predicate, emails.len());
        let now = now.format(SQLITE_TIMESTAMP_FORMAT).to_string();
        let binds: Vec<(String, String)> = emails
            .iter()
            .enumerate()
            .map(|(index, email)| (email_param(index), email.as_str().to_string()))
            .chain(query.binds_now.then(|| (":now".to_string(), now)))
            .collect();

        debug!(addresses = emails.len(), "querying account directory");

        let rows = self
            .with_conn(move |conn| {
                let params: Vec<(&str, &dyn ToSql)> = binds
                    .iter()
                    .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
                    .collect();
                let mut stmt = conn.prepare(&query.sql)?;
                let rows = stmt.query_map(params.as_slice(), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        let mut rejected = BTreeMap::new();
        for (email, reason) in rows {
            let Some(reason) = reason else { continue };
            let reason = reason
                .parse::<RejectionReason>()
                .map_err(FilterError::directory)?;
            rejected.insert(EmailAddress::new(&email), reason);
        }
        Ok(rejected)
    }
}
