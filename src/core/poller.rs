//! Sheet-side change detection
//!
//! The sheet has no change push, so each pair is polled: read every record,
//! project it through the field map, and diff fingerprints against the last
//! snapshot. Creates and updates apply in sheet order, deletes last. The
//! very first poll of a pair initializes the snapshot without emitting
//! events; operators force a full resync with `--reset-snapshot`.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;

use crate::config::PairConfig;
use crate::core::ledger::Ledger;
use crate::core::mapping::Mapper;
use crate::core::snapshot::{SnapEntry, Snapshot, SnapshotStore};
use crate::db::Db;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::sheet::client::{list_all, SheetClient};
use crate::types::{ChangeAction, ChangeEvent, Direction, Fingerprint, Record, Value};

/// A sheet record after projection through the field map
#[derive(Debug, Clone)]
pub struct MappedRecord {
    pub external_id: String,
    pub key_value: Value,
    pub record: Record,
    pub fingerprint: Fingerprint,
}

/// Diff the current sheet contents against the snapshot.
///
/// Pure so the detection logic is testable without a DB: creates and updates
/// come out in sheet order, deletes (snapshot entries not seen in the read)
/// come last in id order.
pub fn compute_changes(
    pair: &str,
    current: &[MappedRecord],
    snapshot: &Snapshot,
) -> Vec<ChangeEvent> {
    let detected_at = Utc::now();
    let mut events = Vec::new();

    for mapped in current {
        match snapshot.get(&mapped.external_id) {
            None => events.push(ChangeEvent {
                pair: pair.to_string(),
                action: ChangeAction::Create,
                external_id: mapped.external_id.clone(),
                key_value: mapped.key_value.clone(),
                payload: mapped.record.clone(),
                fingerprint: mapped.fingerprint.clone(),
                detected_at,
            }),
            Some(entry) if entry.fingerprint != mapped.fingerprint => {
                events.push(ChangeEvent {
                    pair: pair.to_string(),
                    action: ChangeAction::Update,
                    external_id: mapped.external_id.clone(),
                    key_value: mapped.key_value.clone(),
                    payload: mapped.record.clone(),
                    fingerprint: mapped.fingerprint.clone(),
                    detected_at,
                })
            }
            Some(_) => {}
        }
    }

    let mut deleted: Vec<(&String, &SnapEntry)> = snapshot
        .iter()
        .filter(|(id, _)| !current.iter().any(|m| &m.external_id == *id))
        .collect();
    deleted.sort_by_key(|(id, _)| id.clone());
    for (external_id, entry) in deleted {
        events.push(ChangeEvent {
            pair: pair.to_string(),
            action: ChangeAction::Delete,
            external_id: external_id.clone(),
            key_value: Value::String(entry.key.clone()),
            payload: Record::new(),
            fingerprint: entry.fingerprint.clone(),
            detected_at,
        });
    }

    events
}

/// Counts from one poll cycle, fed into the pair's health window
#[derive(Debug, Default, Clone, Copy)]
pub struct TickOutcome {
    pub applied: u64,
    pub skipped: u64,
    pub transient_failures: u64,
    pub permanent_failures: u64,
}

/// One pair's poll/diff/apply pipeline; owns that pair's snapshot
pub struct PairPoller {
    pair: PairConfig,
    name: String,
    mapper: Mapper,
    sheet: Arc<dyn SheetClient>,
    db: Db,
    ledger: Arc<Ledger>,
    store: SnapshotStore,
    snapshot: Snapshot,
    initialized: bool,
}

impl PairPoller {
    /// Load the persisted snapshot if one exists; its presence decides
    /// whether the first poll is a cold start.
    pub fn new(
        pair: PairConfig,
        sheet: Arc<dyn SheetClient>,
        db: Db,
        ledger: Arc<Ledger>,
        store: SnapshotStore,
    ) -> Result<PairPoller> {
        let name = pair.name();
        let mapper = Mapper::from_pair(&pair);
        let (snapshot, initialized) = match store.load(&name)? {
            Some(snapshot) => {
                info!(
                    "{}: resuming from persisted snapshot ({} records)",
                    name,
                    snapshot.len()
                );
                (snapshot, true)
            }
            None => (Snapshot::new(), false),
        };
        Ok(PairPoller {
            pair,
            name,
            mapper,
            sheet,
            db,
            ledger,
            store,
            snapshot,
            initialized,
        })
    }

    pub fn pair_name(&self) -> &str {
        &self.name
    }

    /// One full poll cycle. A top-level error (the sheet read failed) leaves
    /// the snapshot untouched so the next tick retries from the same state.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        let mut outcome = TickOutcome::default();

        let records = list_all(
            self.sheet.as_ref(),
            &self.pair.sheet_db,
            &self.pair.sheet_table,
        )
        .await?;

        // Project through the field map; records that fail to map keep
        // their previous snapshot entry so they are neither re-created nor
        // mistaken for deletions.
        let mut mapped = Vec::with_capacity(records.len());
        let mut unmappable: Vec<String> = Vec::new();
        for record in &records {
            match self.mapper.sheet_to_db(&record.fields) {
                Ok((key_value, projected)) => {
                    let fingerprint = self.mapper.fingerprint(&projected);
                    mapped.push(MappedRecord {
                        external_id: record.id.clone(),
                        key_value,
                        record: projected,
                        fingerprint,
                    });
                }
                Err(e) => {
                    error!("{}: record {} does not map: {}", self.name, record.id, e);
                    metrics::record_failure(Direction::SheetToDb, e.kind());
                    outcome.permanent_failures += 1;
                    unmappable.push(record.id.clone());
                }
            }
        }

        if !self.initialized {
            // Cold start: prime the snapshot, emit nothing
            self.snapshot = mapped
                .iter()
                .map(|m| {
                    (
                        m.external_id.clone(),
                        SnapEntry {
                            fingerprint: m.fingerprint.clone(),
                            key: m.key_value.key_repr(),
                        },
                    )
                })
                .collect();
            self.initialized = true;
            outcome.skipped += mapped.len() as u64;
            for _ in &mapped {
                metrics::record_skip("cold_start_identical");
            }
            self.store.save(&self.name, &self.snapshot)?;
            info!(
                "{}: cold start, snapshot primed with {} records",
                self.name,
                mapped.len()
            );
            return Ok(outcome);
        }

        // Unmappable records are still present on the sheet: they must not
        // surface as deletions
        let events: Vec<ChangeEvent> = compute_changes(&self.name, &mapped, &self.snapshot)
            .into_iter()
            .filter(|e| !(e.action == ChangeAction::Delete && unmappable.contains(&e.external_id)))
            .collect();

        if !events.is_empty() {
            debug!("{}: {} change(s) detected", self.name, events.len());
        }

        for event in events {
            // The engine's own db-to-sheet writes come back as sheet edits;
            // the ledger identifies them so only the snapshot advances.
            if self
                .ledger
                .should_skip_with_db(&self.db, &event.fingerprint, Direction::DbToSheet)
                .await?
            {
                metrics::record_skip("loop_suppressed");
                outcome.skipped += 1;
                self.absorb(&event);
                continue;
            }

            match self.apply(&event).await {
                Ok(()) => {
                    self.ledger.remember(&event.fingerprint, Direction::SheetToDb);
                    let latency = (Utc::now() - event.detected_at)
                        .to_std()
                        .unwrap_or_default();
                    metrics::record_success(Direction::SheetToDb, latency);
                    outcome.applied += 1;
                    self.absorb(&event);
                }
                Err(e) if e.is_transient() => {
                    // Snapshot stays put; the same diff re-emerges next tick
                    warn!(
                        "{}: transient failure applying {} {}: {}",
                        self.name, event.action, event.external_id, e
                    );
                    metrics::record_failure(Direction::SheetToDb, e.kind());
                    outcome.transient_failures += 1;
                }
                Err(e) => {
                    // Permanent: advance the snapshot so one bad record
                    // cannot wedge the pair
                    error!(
                        "{}: dropping {} {}: {}",
                        self.name, event.action, event.external_id, e
                    );
                    metrics::record_failure(Direction::SheetToDb, e.kind());
                    outcome.permanent_failures += 1;
                    self.absorb(&event);
                }
            }
        }

        self.store.save(&self.name, &self.snapshot)?;
        Ok(outcome)
    }

    /// Record an event's end state into the in-memory snapshot
    fn absorb(&mut self, event: &ChangeEvent) {
        match event.action {
            ChangeAction::Create | ChangeAction::Update => {
                self.snapshot.insert(
                    event.external_id.clone(),
                    SnapEntry {
                        fingerprint: event.fingerprint.clone(),
                        key: event.key_value.key_repr(),
                    },
                );
            }
            ChangeAction::Delete => {
                self.snapshot.remove(&event.external_id);
            }
        }
    }

    /// Apply one event to the DB, with the degrade paths of the error
    /// policy: conflicting create compensates with an update, update of a
    /// missing row becomes an insert, delete of a missing row is success.
    async fn apply(&self, event: &ChangeEvent) -> Result<()> {
        let table = &self.pair.db_table;
        let key_field = self.mapper.key_field();
        match event.action {
            ChangeAction::Create => {
                match self
                    .db
                    .apply_create(table, &event.payload, &event.fingerprint)
                    .await
                {
                    Err(SyncError::Conflict(msg)) => {
                        warn!(
                            "{}: insert conflict for {} ({}), compensating with update",
                            self.name, event.external_id, msg
                        );
                        self.db
                            .apply_update(
                                table,
                                key_field,
                                &event.key_value,
                                &event.payload,
                                &event.fingerprint,
                            )
                            .await?;
                    }
                    other => other?,
                }
                self.db
                    .id_map_put(&self.name, &event.key_value.key_repr(), &event.external_id)
                    .await?;
                Ok(())
            }
            ChangeAction::Update => {
                match self
                    .db
                    .apply_update(
                        table,
                        key_field,
                        &event.key_value,
                        &event.payload,
                        &event.fingerprint,
                    )
                    .await
                {
                    Err(SyncError::NotFound(_)) => {
                        warn!(
                            "{}: update target {} missing, degrading to insert",
                            self.name, event.external_id
                        );
                        self.db
                            .apply_create(table, &event.payload, &event.fingerprint)
                            .await?;
                    }
                    other => other?,
                }
                self.db
                    .id_map_put(&self.name, &event.key_value.key_repr(), &event.external_id)
                    .await?;
                Ok(())
            }
            ChangeAction::Delete => {
                self.db
                    .apply_delete(table, key_field, &event.key_value, &event.fingerprint)
                    .await?;
                self.db
                    .id_map_delete(&self.name, &event.key_value.key_repr())
                    .await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn mapped(id: &str, key: &str, fp: &str) -> MappedRecord {
        MappedRecord {
            external_id: id.to_string(),
            key_value: Value::String(key.to_string()),
            record: Record::new(),
            fingerprint: Fingerprint::from_hex(fp.to_string()),
        }
    }

    fn snap(entries: &[(&str, &str, &str)]) -> Snapshot {
        entries
            .iter()
            .map(|(id, key, fp)| {
                (
                    id.to_string(),
                    SnapEntry {
                        fingerprint: Fingerprint::from_hex(fp.to_string()),
                        key: key.to_string(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_new_record_is_create() {
        let events = compute_changes("p", &[mapped("r1", "k1", "aa")], &Snapshot::new());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, ChangeAction::Create);
        assert_eq!(events[0].external_id, "r1");
    }

    #[test]
    fn test_changed_fingerprint_is_update() {
        let snapshot = snap(&[("r1", "k1", "aa")]);
        let events = compute_changes("p", &[mapped("r1", "k1", "bb")], &snapshot);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, ChangeAction::Update);
    }

    #[test]
    fn test_identical_fingerprint_is_noop() {
        let snapshot = snap(&[("r1", "k1", "aa")]);
        let events = compute_changes("p", &[mapped("r1", "k1", "aa")], &snapshot);
        assert!(events.is_empty());
    }

    #[test]
    fn test_missing_record_is_delete_with_key() {
        let snapshot = snap(&[("r1", "k1", "aa")]);
        let events = compute_changes("p", &[], &snapshot);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, ChangeAction::Delete);
        assert_eq!(events[0].key_value, Value::String("k1".into()));
        assert_eq!(events[0].fingerprint.as_str(), "aa");
    }

    #[test]
    fn test_deletes_come_last_in_id_order() {
        let snapshot = snap(&[("gone-b", "k2", "bb"), ("gone-a", "k1", "aa")]);
        let events = compute_changes("p", &[mapped("new", "k3", "cc")], &snapshot);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].action, ChangeAction::Create);
        assert_eq!(events[1].external_id, "gone-a");
        assert_eq!(events[2].external_id, "gone-b");
    }

    #[test]
    fn test_creates_and_updates_keep_sheet_order() {
        let snapshot = snap(&[("r2", "k2", "old")]);
        let events = compute_changes(
            "p",
            &[
                mapped("r1", "k1", "aa"),
                mapped("r2", "k2", "new"),
                mapped("r3", "k3", "cc"),
            ],
            &snapshot,
        );
        let order: Vec<&str> = events.iter().map(|e| e.external_id.as_str()).collect();
        assert_eq!(order, vec!["r1", "r2", "r3"]);
    }
}
