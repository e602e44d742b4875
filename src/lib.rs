//! sheetsync - bidirectional sheet ↔ MySQL synchronization engine
//!
//! Keeps a collaborative table service and a relational database in
//! eventually consistent agreement for a configured set of table pairs,
//! without either side echoing the engine's own writes back as new events.
//!
//! Architecture Overview:
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Sheet service                          │
//! └─────────────────────────────────────────────────────────────┘
//!        │ poll (full read)                    ▲ record CRUD
//!        ▼                                     │
//! ┌──────────────────┐                ┌──────────────────┐
//! │   Poller / Diff  │                │  Queue Consumer  │
//! │  (per pair)      │                │  (worker pool)   │
//! └──────────────────┘                └──────────────────┘
//!        │          ╲                ╱         ▲
//!        │           ╲──────────────╱          │
//!        │            Anti-loop Ledger         │
//!        │           ╱  (fingerprints) ╲       │
//!        ▼          ╱                   ╲      │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    MySQL (tables, sync_queue,               │
//! │                     sync_log, id_mapping)                   │
//! └─────────────────────────────────────────────────────────────┘

use std::sync::Arc;
use std::time::Duration;

use log::info;

pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod metrics;
pub mod sheet;
pub mod types;

use crate::config::SyncConfig;
use crate::core::ledger::Ledger;
use crate::core::scheduler;
use crate::core::snapshot::SnapshotStore;
use crate::db::Db;
use crate::error::Result;
use crate::sheet::client::{RateLimitedSheet, SheetClient};
use crate::sheet::http::HttpSheetClient;
use crate::sheet::rate_limit::TokenBucket;

/// The engine: owns every component, lifecycle tied to [`Engine::run`]
pub struct Engine {
    config: SyncConfig,
    db: Db,
    sheet: Arc<dyn SheetClient>,
    ledger: Arc<Ledger>,
    snapshots: SnapshotStore,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine from a validated configuration, with the HTTP sheet
    /// client behind the shared rate limiter.
    pub fn new(config: SyncConfig) -> Result<Engine> {
        config.validate()?;
        let bucket = Arc::new(TokenBucket::new(config.rate_limit_qps));
        let http = HttpSheetClient::new(&config.sheet.base_url, &config.sheet.token)?;
        let sheet: Arc<dyn SheetClient> = Arc::new(RateLimitedSheet::new(http, bucket));
        Engine::with_sheet_client(config, sheet)
    }

    /// Build an engine around an arbitrary sheet client (tests use the mock)
    pub fn with_sheet_client(config: SyncConfig, sheet: Arc<dyn SheetClient>) -> Result<Engine> {
        config.validate()?;
        let db = Db::connect(&config.db_url)?;
        let ledger = Arc::new(Ledger::new(Duration::from_secs(config.window_s))?);
        let snapshots = SnapshotStore::new(config.snapshot_dir.clone())?;
        Ok(Engine {
            config,
            db,
            sheet,
            ledger,
            snapshots,
        })
    }

    /// Verify both sides are reachable and the DB contract is in place:
    /// engine tables, per-pair target tables, capture triggers, and a
    /// first-page read of every sheet table.
    pub async fn check(&self) -> Result<()> {
        self.db.check(&self.config.pairs).await?;
        for pair in &self.config.pairs {
            self.sheet
                .list_records(&pair.sheet_db, &pair.sheet_table, None)
                .await?;
            info!("sheet check passed for {}", pair.name());
        }
        Ok(())
    }

    /// Run until shutdown: verify the environment, start the metrics
    /// endpoint, then hand the components to the scheduler.
    pub async fn run(self) -> Result<()> {
        self.db.check(&self.config.pairs).await?;
        metrics::install(&self.config.metrics_addr)?;
        info!(
            "metrics endpoint listening on {}",
            self.config.metrics_addr
        );
        scheduler::run(
            self.config,
            self.db,
            self.sheet,
            self.ledger,
            self.snapshots,
        )
        .await
    }
}
