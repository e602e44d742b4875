//! `sync_queue` claiming and state transitions
//!
//! Rows move `pending → processing → (completed | failed)`. Claiming selects
//! the oldest eligible rows and flips them to `processing` inside one
//! transaction, so concurrent consumers never double-claim, and FIFO order
//! by `created_at` carries per-record INSERT→UPDATE→DELETE ordering.

use chrono::{NaiveDateTime, TimeZone, Utc};
use log::warn;
use mysql_async::prelude::*;
use mysql_async::{Params, Row, TxOpts, Value as SqlValue};
use std::time::Duration;

use super::{with_timeout, Db};
use crate::error::Result;
use crate::types::{ChangeAction, QueueRow};

const CLAIM_COLUMNS: &str = "id, table_name, record_id, action, old_json, new_json, sync_hash, \
     retry_count, DATE_FORMAT(created_at, '%Y-%m-%d %H:%i:%s') AS created_at";

fn parse_row(mut row: Row) -> Option<QueueRow> {
    let id: u64 = row.take("id")?;
    let table: String = row.take("table_name")?;
    let record_id: String = row.take("record_id")?;
    let action_raw: String = row.take("action")?;
    let action = match ChangeAction::from_queue_str(&action_raw) {
        Some(action) => action,
        None => {
            warn!("queue row {} has unknown action '{}'", id, action_raw);
            return None;
        }
    };
    let created_at = row
        .take::<String, _>("created_at")
        .and_then(|s| NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S").ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or_else(Utc::now);
    Some(QueueRow {
        id,
        table,
        record_id,
        action,
        old_json: row.take::<Option<String>, _>("old_json").flatten(),
        new_json: row.take::<Option<String>, _>("new_json").flatten(),
        sync_hash: row.take::<Option<String>, _>("sync_hash").flatten(),
        retry_count: row.take("retry_count").unwrap_or(0),
        created_at,
    })
}

impl Db {
    /// Claim up to `batch_size` pending rows, oldest first, restricted to
    /// `tables`.
    ///
    /// Workers shard the queue by table so changes to one record are never
    /// in flight on two workers at once; a paused pair's table is simply
    /// left out of its worker's set. Rows with an unparseable action are
    /// marked failed instead of being returned.
    pub async fn claim_batch(
        &self,
        batch_size: u32,
        retry_max: u32,
        tables: &[String],
    ) -> Result<Vec<QueueRow>> {
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let (rows, bad_ids) = with_timeout(async {
            let mut conn = self.pool().get_conn().await?;
            let mut tx = conn.start_transaction(TxOpts::default()).await?;

            let placeholders = vec!["?"; tables.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM sync_queue \
                 WHERE status = 'pending' AND retry_count < ? \
                 AND (next_attempt_at IS NULL OR next_attempt_at <= NOW()) \
                 AND table_name IN ({}) \
                 ORDER BY created_at ASC, id ASC LIMIT ? FOR UPDATE",
                CLAIM_COLUMNS, placeholders
            );
            let mut params: Vec<SqlValue> = vec![retry_max.into()];
            params.extend(tables.iter().map(|t| SqlValue::from(t.as_str())));
            params.push(batch_size.into());

            let raw: Vec<Row> = tx.exec(sql, Params::Positional(params)).await?;
            if raw.is_empty() {
                tx.rollback().await?;
                return Ok((Vec::new(), Vec::new()));
            }

            let mut claimed = Vec::new();
            let mut bad_ids: Vec<u64> = Vec::new();
            let mut all_ids: Vec<SqlValue> = Vec::new();
            for row in raw {
                // Peek the id before the destructive parse
                let id: u64 = row.get("id").unwrap_or(0);
                all_ids.push(id.into());
                match parse_row(row) {
                    Some(parsed) => claimed.push(parsed),
                    None => bad_ids.push(id),
                }
            }

            let placeholders = vec!["?"; all_ids.len()].join(", ");
            tx.exec_drop(
                format!(
                    "UPDATE sync_queue SET status = 'processing', processed_at = NOW() \
                     WHERE id IN ({})",
                    placeholders
                ),
                Params::Positional(all_ids),
            )
            .await?;
            tx.commit().await?;
            Ok((claimed, bad_ids))
        })
        .await?;

        for id in bad_ids {
            self.mark_failed(id, "unrecognized action").await?;
        }
        Ok(rows)
    }

    /// Terminal success; `note` records skip reasons like `loop_suppressed`
    pub async fn mark_completed(&self, id: u64, note: Option<&str>) -> Result<()> {
        with_timeout(async {
            let mut conn = self.pool().get_conn().await?;
            conn.exec_drop(
                "UPDATE sync_queue SET status = 'completed', processed_at = NOW(), error = ? \
                 WHERE id = ?",
                (note, id),
            )
            .await?;
            Ok(())
        })
        .await
    }

    /// Return a row to pending with a bumped retry count and a backoff delay
    pub async fn mark_retry(
        &self,
        id: u64,
        retry_count: u32,
        delay: Duration,
        error: &str,
    ) -> Result<()> {
        with_timeout(async {
            let mut conn = self.pool().get_conn().await?;
            conn.exec_drop(
                "UPDATE sync_queue SET status = 'pending', retry_count = ?, \
                 next_attempt_at = DATE_ADD(NOW(), INTERVAL ? SECOND), error = ? \
                 WHERE id = ?",
                (retry_count, delay.as_secs(), error, id),
            )
            .await?;
            Ok(())
        })
        .await
    }

    /// Terminal failure, preserving the error message for `--status`
    pub async fn mark_failed(&self, id: u64, error: &str) -> Result<()> {
        with_timeout(async {
            let mut conn = self.pool().get_conn().await?;
            conn.exec_drop(
                "UPDATE sync_queue SET status = 'failed', processed_at = NOW(), error = ? \
                 WHERE id = ?",
                (error, id),
            )
            .await?;
            Ok(())
        })
        .await
    }

    /// Current number of pending rows (the `queue_depth` gauge)
    pub async fn pending_depth(&self) -> Result<u64> {
        with_timeout(async {
            let mut conn = self.pool().get_conn().await?;
            let depth: u64 = conn
                .query_first("SELECT COUNT(*) FROM sync_queue WHERE status = 'pending'")
                .await?
                .unwrap_or(0);
            Ok(depth)
        })
        .await
    }

    /// Startup recovery: rows claimed by a previous run that never finished
    /// go back to pending.
    pub async fn recover_stale_claims(&self, stale_after: Duration) -> Result<u64> {
        with_timeout(async {
            let mut conn = self.pool().get_conn().await?;
            conn.exec_drop(
                "UPDATE sync_queue SET status = 'pending' \
                 WHERE status = 'processing' \
                 AND processed_at < NOW() - INTERVAL ? SECOND",
                (stale_after.as_secs(),),
            )
            .await?;
            Ok(conn.affected_rows())
        })
        .await
    }
}
