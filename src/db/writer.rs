//! Sheet-to-db applies
//!
//! Each change from the poller lands in a single transaction that first
//! inserts the `sync_log` entry and then runs the DML stamped with
//! `_sync_source = 'sheet'`. The capture trigger suppresses its echo either
//! by seeing the source marker (INSERT/UPDATE) or by finding the fresh
//! `sync_log` hash (DELETE, which has no NEW row to inspect).

use mysql_async::prelude::*;
use mysql_async::{Params, TxOpts, Value as SqlValue};

use super::{quote_ident, with_timeout, Db};
use crate::core::fingerprint::{SYNC_SOURCE_COLUMN, SYNC_SOURCE_SHEET};
use crate::error::{Result, SyncError};
use crate::types::{Direction, Fingerprint, Record, Value};

/// Render an engine value as a statement parameter
pub(crate) fn value_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::NULL,
        Value::String(s) => SqlValue::from(s.as_str()),
        Value::Integer(i) => SqlValue::from(*i),
        Value::Float(f) => SqlValue::from(*f),
        Value::Bool(b) => SqlValue::from(i64::from(*b)),
        Value::Timestamp(ts) => SqlValue::from(ts.format("%Y-%m-%d %H:%M:%S").to_string()),
        // Multi-select stored as a JSON array string
        Value::StringList(items) => {
            SqlValue::from(serde_json::to_string(items).unwrap_or_default())
        }
    }
}

const LEDGER_INSERT: &str =
    "INSERT INTO sync_log (sync_hash, direction, created_at) VALUES (?, ?, NOW())";

impl Db {
    /// INSERT a new row for a sheet-created record.
    ///
    /// A duplicate key surfaces as [`SyncError::Conflict`]; the poller
    /// compensates with an update.
    pub async fn apply_create(
        &self,
        table: &str,
        record: &Record,
        fingerprint: &Fingerprint,
    ) -> Result<()> {
        let columns: Vec<&String> = record.keys().collect();
        let mut column_sql: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        column_sql.push(quote_ident(SYNC_SOURCE_COLUMN));
        let placeholders = vec!["?"; column_sql.len()].join(", ");

        let mut params: Vec<SqlValue> = record.values().map(value_to_sql).collect();
        params.push(SqlValue::from(SYNC_SOURCE_SHEET));

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            column_sql.join(", "),
            placeholders
        );

        with_timeout(async {
            let mut conn = self.pool().get_conn().await?;
            let mut tx = conn.start_transaction(TxOpts::default()).await?;
            tx.exec_drop(
                LEDGER_INSERT,
                (fingerprint.as_str(), Direction::SheetToDb.as_str()),
            )
            .await?;
            tx.exec_drop(sql, Params::Positional(params)).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// UPDATE the row identified by the key field.
    ///
    /// Returns [`SyncError::NotFound`] when no such row exists so the caller
    /// can degrade to an insert.
    pub async fn apply_update(
        &self,
        table: &str,
        key_field: &str,
        key: &Value,
        record: &Record,
        fingerprint: &Fingerprint,
    ) -> Result<()> {
        let mut assignments: Vec<String> = record
            .keys()
            .map(|c| format!("{} = ?", quote_ident(c)))
            .collect();
        assignments.push(format!("{} = ?", quote_ident(SYNC_SOURCE_COLUMN)));

        let mut params: Vec<SqlValue> = record.values().map(value_to_sql).collect();
        params.push(SqlValue::from(SYNC_SOURCE_SHEET));
        params.push(value_to_sql(key));

        let update_sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote_ident(table),
            assignments.join(", "),
            quote_ident(key_field)
        );
        let exists_sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?",
            quote_ident(table),
            quote_ident(key_field)
        );

        with_timeout(async {
            let mut conn = self.pool().get_conn().await?;
            let mut tx = conn.start_transaction(TxOpts::default()).await?;
            // affected_rows cannot distinguish "absent" from "unchanged",
            // so existence is checked explicitly inside the transaction
            let present: u64 = tx
                .exec_first(&exists_sql, Params::Positional(vec![value_to_sql(key)]))
                .await?
                .unwrap_or(0);
            if present == 0 {
                tx.rollback().await?;
                return Err(SyncError::NotFound(format!(
                    "{}.{} = {} has no row",
                    table,
                    key_field,
                    key.key_repr()
                )));
            }
            tx.exec_drop(
                LEDGER_INSERT,
                (fingerprint.as_str(), Direction::SheetToDb.as_str()),
            )
            .await?;
            tx.exec_drop(update_sql, Params::Positional(params)).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// DELETE the row identified by the key field.
    ///
    /// Deleting an absent row is a no-op success. The `sync_log` insert must
    /// precede the DELETE inside the transaction: it is the only echo
    /// suppression the delete trigger has.
    pub async fn apply_delete(
        &self,
        table: &str,
        key_field: &str,
        key: &Value,
        fingerprint: &Fingerprint,
    ) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            quote_ident(table),
            quote_ident(key_field)
        );

        with_timeout(async {
            let mut conn = self.pool().get_conn().await?;
            let mut tx = conn.start_transaction(TxOpts::default()).await?;
            tx.exec_drop(
                LEDGER_INSERT,
                (fingerprint.as_str(), Direction::SheetToDb.as_str()),
            )
            .await?;
            tx.exec_drop(&sql, Params::Positional(vec![value_to_sql(key)])).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_value_to_sql_shapes() {
        assert_eq!(value_to_sql(&Value::Null), SqlValue::NULL);
        assert_eq!(value_to_sql(&Value::Integer(7)), SqlValue::Int(7));
        assert_eq!(value_to_sql(&Value::Bool(true)), SqlValue::Int(1));
        match value_to_sql(&Value::String("x".into())) {
            SqlValue::Bytes(b) => assert_eq!(b, b"x"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_timestamp_renders_mysql_datetime() {
        let ts = chrono::Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        match value_to_sql(&Value::Timestamp(ts)) {
            SqlValue::Bytes(b) => assert_eq!(b, b"2024-01-02 03:04:05"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_string_list_renders_json() {
        match value_to_sql(&Value::StringList(vec!["a".into(), "b".into()])) {
            SqlValue::Bytes(b) => assert_eq!(b, br#"["a","b"]"#),
            other => panic!("unexpected {:?}", other),
        }
    }
}
