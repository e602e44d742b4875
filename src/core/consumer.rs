//! DB-side queue consumption
//!
//! Drains trigger-populated `sync_queue` rows and applies them to the sheet.
//! The trigger's `sync_hash` is advisory: the fingerprint is always
//! recomputed from the row payload so both directions hash identically.
//! External ids resolve through `id_mapping`, then a sheet query by key,
//! and finally degrade to an insert; deletes of already-absent records
//! complete as no-ops.

use chrono::Utc;
use log::{debug, error, info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{PairConfig, SyncConfig};
use crate::core::ledger::Ledger;
use crate::core::mapping::Mapper;
use crate::db::Db;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::sheet::client::SheetClient;
use crate::types::{ChangeAction, Direction, QueueRow, Record};

/// Exponential backoff with ±20% jitter: `min(base * 2^n, cap)`
pub fn backoff_delay(retry_count: u32, base: Duration, cap: Duration) -> Duration {
    let raw = base.as_secs_f64() * 2f64.powi(retry_count.min(30) as i32);
    let capped = raw.min(cap.as_secs_f64());
    let jitter = 0.8 + rand::thread_rng().gen::<f64>() * 0.4;
    Duration::from_secs_f64(capped * jitter)
}

/// How one claimed row ended
enum RowOutcome {
    Applied,
    LoopSuppressed,
    AlreadyAbsent,
}

/// Consumer-side view of one pair, keyed by its DB table
struct PairRoute {
    pair_name: String,
    sheet_db: String,
    sheet_table: String,
    mapper: Mapper,
}

impl PairRoute {
    fn new(pair: &PairConfig) -> PairRoute {
        PairRoute {
            pair_name: pair.name(),
            sheet_db: pair.sheet_db.clone(),
            sheet_table: pair.sheet_table.clone(),
            mapper: Mapper::from_pair(pair),
        }
    }
}

/// Per-row results attributed to pairs, fed into the health windows
#[derive(Debug, Default)]
pub struct DrainOutcome {
    pub claimed: usize,
    /// (pair name, row succeeded) per processed row
    pub results: Vec<(String, bool)>,
}

/// Shared queue consumer; safe to drive from several worker tasks
pub struct QueueConsumer {
    db: Db,
    sheet: Arc<dyn SheetClient>,
    ledger: Arc<Ledger>,
    routes: HashMap<String, PairRoute>,
    retry_max: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl QueueConsumer {
    pub fn new(
        config: &SyncConfig,
        db: Db,
        sheet: Arc<dyn SheetClient>,
        ledger: Arc<Ledger>,
    ) -> QueueConsumer {
        let routes = config
            .pairs
            .iter()
            .map(|pair| (pair.db_table.clone(), PairRoute::new(pair)))
            .collect();
        QueueConsumer {
            db,
            sheet,
            ledger,
            routes,
            retry_max: config.retry_max,
            backoff_base: Duration::from_secs(config.backoff_base_s),
            backoff_cap: Duration::from_secs(config.backoff_cap_s),
        }
    }

    /// Claim one batch restricted to `tables` and process every row.
    /// Callers pass the tables their worker shard owns, minus paused pairs.
    pub async fn drain_once(&self, batch_size: u32, tables: &[String]) -> Result<DrainOutcome> {
        let rows = self
            .db
            .claim_batch(batch_size, self.retry_max, tables)
            .await?;
        let mut outcome = DrainOutcome {
            claimed: rows.len(),
            results: Vec::with_capacity(rows.len()),
        };

        for row in rows {
            let route = match self.routes.get(&row.table) {
                Some(route) => route,
                None => {
                    error!("queue row {}: no pair configured for table '{}'", row.id, row.table);
                    metrics::record_failure(Direction::DbToSheet, crate::error::ErrorKind::Mapping);
                    self.db.mark_failed(row.id, "no pair configured for table").await?;
                    continue;
                }
            };

            match self.handle_row(route, &row).await {
                Ok(RowOutcome::Applied) => {
                    self.db.mark_completed(row.id, None).await?;
                    let latency = (Utc::now() - row.created_at).to_std().unwrap_or_default();
                    metrics::record_success(Direction::DbToSheet, latency);
                    outcome.results.push((route.pair_name.clone(), true));
                }
                Ok(RowOutcome::LoopSuppressed) => {
                    self.db.mark_completed(row.id, Some("loop_suppressed")).await?;
                    metrics::record_skip("loop_suppressed");
                    outcome.results.push((route.pair_name.clone(), true));
                }
                Ok(RowOutcome::AlreadyAbsent) => {
                    self.db.mark_completed(row.id, Some("already_absent")).await?;
                    metrics::record_skip("already_absent");
                    outcome.results.push((route.pair_name.clone(), true));
                }
                Err(e) => {
                    metrics::record_failure(Direction::DbToSheet, e.kind());
                    outcome.results.push((route.pair_name.clone(), false));
                    self.dispose_failure(&row, e).await?;
                }
            }
        }

        Ok(outcome)
    }

    /// Retry transient failures with backoff; everything else is terminal
    async fn dispose_failure(&self, row: &QueueRow, e: SyncError) -> Result<()> {
        // Quota pressure is not the row's fault: requeue without touching
        // the retry budget, honoring Retry-After when the sheet sent one
        if let SyncError::RateLimited { retry_after } = &e {
            let delay = (*retry_after).unwrap_or(self.backoff_base);
            warn!(
                "queue row {}: sheet rate limited, requeueing in {:?}",
                row.id, delay
            );
            return self
                .db
                .mark_retry(row.id, row.retry_count, delay, "sheet rate limited")
                .await;
        }
        if e.is_transient() {
            let attempts = row.retry_count + 1;
            if attempts < self.retry_max {
                let delay = backoff_delay(row.retry_count, self.backoff_base, self.backoff_cap);
                warn!(
                    "queue row {}: attempt {} failed ({}), retrying in {:?}",
                    row.id, attempts, e, delay
                );
                self.db
                    .mark_retry(row.id, attempts, delay, &e.to_string())
                    .await
            } else {
                error!("queue row {}: failed after {} attempts: {}", row.id, attempts, e);
                self.db.mark_failed(row.id, &e.to_string()).await
            }
        } else {
            error!("queue row {}: permanent failure: {}", row.id, e);
            self.db.mark_failed(row.id, &e.to_string()).await
        }
    }

    /// Translate one queue row into the matching sheet write
    async fn handle_row(&self, route: &PairRoute, row: &QueueRow) -> Result<RowOutcome> {
        let mapper = &route.mapper;

        let payload_json = match row.action {
            ChangeAction::Create | ChangeAction::Update => row
                .new_json
                .as_deref()
                .ok_or_else(|| SyncError::Mapping("queue row has no new_json".into()))?,
            ChangeAction::Delete => row
                .old_json
                .as_deref()
                .ok_or_else(|| SyncError::Mapping("queue row has no old_json".into()))?,
        };
        let record = mapper.record_from_row_json(payload_json)?;
        let fingerprint = mapper.fingerprint(&record);

        if let Some(trigger_hash) = &row.sync_hash {
            if trigger_hash != fingerprint.as_str() {
                debug!(
                    "queue row {}: trigger hash {} differs from recomputed {}, using recomputed",
                    row.id, trigger_hash, fingerprint
                );
            }
        }

        // Our own sheet-to-db write coming back through the trigger
        if self
            .ledger
            .should_skip_with_db(&self.db, &fingerprint, Direction::SheetToDb)
            .await?
        {
            return Ok(RowOutcome::LoopSuppressed);
        }

        let key = mapper
            .key_of(&record)
            .map(|v| v.key_repr())
            .unwrap_or_else(|_| row.record_id.clone());

        let outcome = match row.action {
            ChangeAction::Create => {
                let fields = mapper.db_to_sheet(&record);
                let external_id = self
                    .sheet
                    .create_record(&route.sheet_db, &route.sheet_table, &fields)
                    .await?;
                self.db.id_map_put(&route.pair_name, &key, &external_id).await?;
                RowOutcome::Applied
            }
            ChangeAction::Update => {
                let fields = mapper.db_to_sheet(&record);
                match self.resolve_external_id(route, &record, &key).await? {
                    Some(external_id) => {
                        match self
                            .sheet
                            .update_record(&route.sheet_db, &route.sheet_table, &external_id, &fields)
                            .await
                        {
                            Err(SyncError::NotFound(_)) => {
                                // Stale mapping: the sheet record is gone
                                info!(
                                    "queue row {}: stale external id {}, degrading to create",
                                    row.id, external_id
                                );
                                let external_id = self
                                    .sheet
                                    .create_record(&route.sheet_db, &route.sheet_table, &fields)
                                    .await?;
                                self.db.id_map_put(&route.pair_name, &key, &external_id).await?;
                            }
                            other => other?,
                        }
                        RowOutcome::Applied
                    }
                    None => {
                        info!(
                            "queue row {}: no sheet record for key '{}', degrading to create",
                            row.id, key
                        );
                        let external_id = self
                            .sheet
                            .create_record(&route.sheet_db, &route.sheet_table, &fields)
                            .await?;
                        self.db.id_map_put(&route.pair_name, &key, &external_id).await?;
                        RowOutcome::Applied
                    }
                }
            }
            ChangeAction::Delete => {
                match self.resolve_external_id(route, &record, &key).await? {
                    Some(external_id) => {
                        match self
                            .sheet
                            .delete_record(&route.sheet_db, &route.sheet_table, &external_id)
                            .await
                        {
                            Err(SyncError::NotFound(_)) => {
                                self.db.id_map_delete(&route.pair_name, &key).await?;
                                return Ok(RowOutcome::AlreadyAbsent);
                            }
                            other => other?,
                        }
                        self.db.id_map_delete(&route.pair_name, &key).await?;
                        RowOutcome::Applied
                    }
                    None => return Ok(RowOutcome::AlreadyAbsent),
                }
            }
        };

        self.ledger.remember(&fingerprint, Direction::DbToSheet);
        self.db.sync_log_insert(&fingerprint, Direction::DbToSheet).await?;
        Ok(outcome)
    }

    /// `id_mapping` lookup with a sheet-query fallback by key equality
    async fn resolve_external_id(
        &self,
        route: &PairRoute,
        record: &Record,
        key: &str,
    ) -> Result<Option<String>> {
        if let Some(external_id) = self.db.id_map_get(&route.pair_name, key).await? {
            return Ok(Some(external_id));
        }

        let sheet_field = route.mapper.sheet_key_field()?;
        let key_json = record
            .get(route.mapper.key_field())
            .map(|v| v.to_sheet_json())
            .unwrap_or_else(|| serde_json::Value::String(key.to_string()));
        let hits = self
            .sheet
            .query(&route.sheet_db, &route.sheet_table, sheet_field, &key_json)
            .await?;
        match hits.into_iter().next() {
            Some(hit) => {
                self.db.id_map_put(&route.pair_name, key, &hit.id).await?;
                Ok(Some(hit.id))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_exponentially_within_jitter() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(300);
        for n in 0..5u32 {
            let expected = 2f64 * 2f64.powi(n as i32);
            let delay = backoff_delay(n, base, cap).as_secs_f64();
            assert!(delay >= expected * 0.8 - f64::EPSILON, "n={} delay={}", n, delay);
            assert!(delay <= expected * 1.2 + f64::EPSILON, "n={} delay={}", n, delay);
        }
    }

    #[test]
    fn test_backoff_respects_cap() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(300);
        for n in [10u32, 20, 30, 60] {
            let delay = backoff_delay(n, base, cap).as_secs_f64();
            assert!(delay <= 300.0 * 1.2 + f64::EPSILON);
        }
    }

    #[test]
    fn test_backoff_is_jittered() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(300);
        let samples: Vec<f64> = (0..32)
            .map(|_| backoff_delay(3, base, cap).as_secs_f64())
            .collect();
        let all_equal = samples.windows(2).all(|w| w[0] == w[1]);
        assert!(!all_equal, "expected jitter to vary delays");
    }
}
