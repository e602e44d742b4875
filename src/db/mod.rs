//! MySQL access layer
//!
//! Owns the connection pool and every statement the engine runs. Raw driver
//! errors never leave this module; they are converted to [`SyncError`] (with
//! transience decided per MySQL error code) and each operation is bounded by
//! a statement timeout that classifies as transient.
//!
//! Split by concern: queue claiming and state transitions in [`queue`],
//! sheet-to-db applies in [`writer`], with the `sync_log` (ledger L2) and
//! `id_mapping` stores here.

pub mod queue;
pub mod writer;

use std::future::Future;
use std::time::Duration;

use log::info;
use mysql_async::prelude::*;
use mysql_async::{Opts, Pool};

use crate::config::PairConfig;
use crate::error::{Result, SyncError};
use crate::types::{Direction, Fingerprint};

/// Per-statement deadline; a hit classifies as transient
const STATEMENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound a DB operation by the statement timeout
pub(crate) async fn with_timeout<T, F>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(STATEMENT_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Db {
            message: format!("db statement exceeded {:?}", STATEMENT_TIMEOUT),
            transient: true,
        }),
    }
}

/// Quote an identifier from configuration for interpolation into SQL
pub(crate) fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Shared MySQL handle
#[derive(Clone)]
pub struct Db {
    pool: Pool,
    db_name: String,
}

impl Db {
    /// Build a pool from a `mysql://` URL; the URL must name a database
    pub fn connect(url: &str) -> Result<Db> {
        let opts = Opts::from_url(url)
            .map_err(|e| SyncError::Config(format!("invalid db_url: {}", e)))?;
        let db_name = opts
            .db_name()
            .map(str::to_owned)
            .ok_or_else(|| SyncError::Config("db_url must name a database".into()))?;
        Ok(Db {
            pool: Pool::new(opts),
            db_name,
        })
    }

    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Close the pool cooperatively
    pub async fn disconnect(self) -> Result<()> {
        self.pool.disconnect().await?;
        Ok(())
    }

    /// Startup verification backing `--test`: connectivity, engine tables,
    /// per-pair target tables and their capture triggers.
    pub async fn check(&self, pairs: &[PairConfig]) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.query_drop("SELECT 1").await?;

        for table in ["sync_queue", "sync_log", "id_mapping"] {
            let count: u64 = conn
                .exec_first(
                    "SELECT COUNT(*) FROM information_schema.tables \
                     WHERE table_schema = ? AND table_name = ?",
                    (self.db_name.as_str(), table),
                )
                .await?
                .unwrap_or(0);
            if count == 0 {
                return Err(SyncError::Fatal(format!(
                    "required table '{}' is missing from database '{}'",
                    table, self.db_name
                )));
            }
        }

        for pair in pairs {
            let count: u64 = conn
                .exec_first(
                    "SELECT COUNT(*) FROM information_schema.tables \
                     WHERE table_schema = ? AND table_name = ?",
                    (self.db_name.as_str(), pair.db_table.as_str()),
                )
                .await?
                .unwrap_or(0);
            if count == 0 {
                return Err(SyncError::Fatal(format!(
                    "pair {}: target table '{}' does not exist",
                    pair.name(),
                    pair.db_table
                )));
            }
            let triggers: u64 = conn
                .exec_first(
                    "SELECT COUNT(*) FROM information_schema.triggers \
                     WHERE trigger_schema = ? AND event_object_table = ?",
                    (self.db_name.as_str(), pair.db_table.as_str()),
                )
                .await?
                .unwrap_or(0);
            if triggers == 0 {
                return Err(SyncError::Fatal(format!(
                    "pair {}: no capture triggers installed on '{}'",
                    pair.name(),
                    pair.db_table
                )));
            }
        }

        info!("db check passed for {} pair(s)", pairs.len());
        Ok(())
    }

    /// Ledger L2 lookup: has this fingerprint been applied in this
    /// direction within the window?
    pub async fn sync_log_recent(
        &self,
        fingerprint: &Fingerprint,
        direction: Direction,
        window: Duration,
    ) -> Result<bool> {
        with_timeout(async {
            let mut conn = self.pool.get_conn().await?;
            let count: u64 = conn
                .exec_first(
                    "SELECT COUNT(*) FROM sync_log \
                     WHERE sync_hash = ? AND direction = ? \
                     AND created_at >= NOW() - INTERVAL ? SECOND",
                    (fingerprint.as_str(), direction.as_str(), window.as_secs()),
                )
                .await?
                .unwrap_or(0);
            Ok(count > 0)
        })
        .await
    }

    /// Ledger L2 insert for the db-to-sheet direction; the sheet-to-db
    /// direction rides the writer's transaction instead.
    pub async fn sync_log_insert(
        &self,
        fingerprint: &Fingerprint,
        direction: Direction,
    ) -> Result<()> {
        with_timeout(async {
            let mut conn = self.pool.get_conn().await?;
            conn.exec_drop(
                "INSERT INTO sync_log (sync_hash, direction, created_at) VALUES (?, ?, NOW())",
                (fingerprint.as_str(), direction.as_str()),
            )
            .await?;
            Ok(())
        })
        .await
    }

    /// Look up the sheet external id for a key value
    pub async fn id_map_get(&self, pair: &str, key_value: &str) -> Result<Option<String>> {
        with_timeout(async {
            let mut conn = self.pool.get_conn().await?;
            let id: Option<String> = conn
                .exec_first(
                    "SELECT external_id FROM id_mapping WHERE pair = ? AND key_value = ?",
                    (pair, key_value),
                )
                .await?;
            Ok(id)
        })
        .await
    }

    /// Record (or refresh) a key ↔ external id association
    pub async fn id_map_put(&self, pair: &str, key_value: &str, external_id: &str) -> Result<()> {
        with_timeout(async {
            let mut conn = self.pool.get_conn().await?;
            conn.exec_drop(
                "INSERT INTO id_mapping (pair, key_value, external_id) VALUES (?, ?, ?) \
                 ON DUPLICATE KEY UPDATE external_id = VALUES(external_id)",
                (pair, key_value, external_id),
            )
            .await?;
            Ok(())
        })
        .await
    }

    /// Drop a mapping after the sheet record is gone
    pub async fn id_map_delete(&self, pair: &str, key_value: &str) -> Result<()> {
        with_timeout(async {
            let mut conn = self.pool.get_conn().await?;
            conn.exec_drop(
                "DELETE FROM id_mapping WHERE pair = ? AND key_value = ?",
                (pair, key_value),
            )
            .await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_backticks() {
        assert_eq!(quote_ident("users"), "`users`");
        assert_eq!(quote_ident("weird`name"), "`weird``name`");
    }

    #[test]
    fn test_connect_requires_database() {
        assert!(Db::connect("mysql://root@localhost:3306").is_err());
        assert!(Db::connect("not-a-url").is_err());
        assert!(Db::connect("mysql://root@localhost:3306/appdb").is_ok());
    }
}
