//! Scheduler and supervisor
//!
//! Owns the task lifetimes: one poller per pair, the queue consumer pool,
//! the ledger pruner, and the stats publisher. All tasks watch a shared
//! shutdown channel and must return within the configured grace period.
//!
//! Self-protection: a pair whose recent failure rate crosses the configured
//! threshold is paused for a while (its poller skips ticks and its table is
//! excluded from queue claims), and a sustained queue backlog widens the
//! consumer batch up to the cap.

use log::{error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::SyncConfig;
use crate::core::consumer::QueueConsumer;
use crate::core::ledger::Ledger;
use crate::core::poller::PairPoller;
use crate::core::snapshot::SnapshotStore;
use crate::db::Db;
use crate::error::{Result, SyncError};
use crate::metrics as engine_metrics;
use crate::sheet::client::SheetClient;
use crate::types::Direction;

/// Sliding window over which failure rates are computed
const HEALTH_WINDOW: Duration = Duration::from_secs(300);

/// Outcomes needed before a failure rate is trusted
const HEALTH_MIN_SAMPLES: usize = 5;

/// Consumer idle tick
const CONSUME_INTERVAL: Duration = Duration::from_secs(1);

/// Backlog must persist this long before the batch widens
const QUEUE_ALARM_HOLD: Duration = Duration::from_secs(60);

/// Rolling success/failure window and pause state for one pair
pub struct PairHealth {
    outcomes: Mutex<VecDeque<(Instant, bool)>>,
    paused: Mutex<Option<(Instant, String)>>,
}

impl PairHealth {
    pub fn new() -> PairHealth {
        PairHealth {
            outcomes: Mutex::new(VecDeque::new()),
            paused: Mutex::new(None),
        }
    }

    pub fn record(&self, ok: bool) {
        let mut outcomes = self.outcomes.lock().unwrap();
        let now = Instant::now();
        outcomes.push_back((now, ok));
        while let Some((at, _)) = outcomes.front() {
            if now.duration_since(*at) > HEALTH_WINDOW {
                outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    /// Failure fraction over the window; `None` until enough samples exist
    pub fn failure_rate(&self) -> Option<f64> {
        let mut outcomes = self.outcomes.lock().unwrap();
        let now = Instant::now();
        while let Some((at, _)) = outcomes.front() {
            if now.duration_since(*at) > HEALTH_WINDOW {
                outcomes.pop_front();
            } else {
                break;
            }
        }
        if outcomes.len() < HEALTH_MIN_SAMPLES {
            return None;
        }
        let failures = outcomes.iter().filter(|(_, ok)| !*ok).count();
        Some(failures as f64 / outcomes.len() as f64)
    }

    pub fn pause(&self, for_duration: Duration, reason: String) {
        let until = Instant::now() + for_duration;
        *self.paused.lock().unwrap() = Some((until, reason));
        // A pause forgives the window; the pair restarts with a clean slate
        self.outcomes.lock().unwrap().clear();
    }

    /// Whether the pair is paused right now; expired pauses clear lazily
    pub fn is_paused(&self) -> bool {
        let mut paused = self.paused.lock().unwrap();
        match &*paused {
            Some((until, _)) if Instant::now() < *until => true,
            Some(_) => {
                *paused = None;
                false
            }
            None => false,
        }
    }

    pub fn pause_reason(&self) -> Option<String> {
        self.paused
            .lock()
            .unwrap()
            .as_ref()
            .map(|(_, reason)| reason.clone())
    }
}

impl Default for PairHealth {
    fn default() -> Self {
        Self::new()
    }
}

struct Shared {
    health: HashMap<String, Arc<PairHealth>>,
    /// pair name → db table, for translating pauses into claim exclusions
    pair_tables: Vec<(String, String)>,
    effective_batch: AtomicU32,
    pause_on_error_rate: f64,
    pause_for: Duration,
}

impl Shared {
    fn paused_tables(&self) -> Vec<String> {
        self.pair_tables
            .iter()
            .filter(|(pair, _)| {
                self.health
                    .get(pair)
                    .map(|h| h.is_paused())
                    .unwrap_or(false)
            })
            .map(|(_, table)| table.clone())
            .collect()
    }

    /// Pause the pair when its failure rate crosses the threshold
    fn maybe_pause(&self, pair: &str) {
        let Some(health) = self.health.get(pair) else { return };
        if health.is_paused() {
            return;
        }
        if let Some(rate) = health.failure_rate() {
            if rate > self.pause_on_error_rate {
                let reason = format!("failure rate {:.0}% over 5m", rate * 100.0);
                warn!("pausing pair {} for {:?}: {}", pair, self.pause_for, reason);
                health.pause(self.pause_for, reason);
            }
        }
    }
}

/// Run the engine until shutdown. Spawns every worker, supervises them, and
/// converts worker panics into a fatal error.
pub async fn run(
    config: SyncConfig,
    db: Db,
    sheet: Arc<dyn SheetClient>,
    ledger: Arc<Ledger>,
    snapshots: SnapshotStore,
) -> Result<()> {
    let recovered = db
        .recover_stale_claims(Duration::from_secs(config.stale_claim_s))
        .await?;
    if recovered > 0 {
        info!("recovered {} stale queue claim(s) from a previous run", recovered);
    }

    let shared = Arc::new(Shared {
        health: config
            .pairs
            .iter()
            .map(|p| (p.name(), Arc::new(PairHealth::new())))
            .collect(),
        pair_tables: config
            .pairs
            .iter()
            .map(|p| (p.name(), p.db_table.clone()))
            .collect(),
        effective_batch: AtomicU32::new(config.batch_size),
        pause_on_error_rate: config.pause_on_error_rate,
        pause_for: Duration::from_secs(config.pause_s),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx.clone());

    let mut tasks: JoinSet<()> = JoinSet::new();

    // One poller task per pair
    for pair in &config.pairs {
        let interval = Duration::from_secs(config.pair_poll_interval(pair));
        let poller = PairPoller::new(
            pair.clone(),
            Arc::clone(&sheet),
            db.clone(),
            Arc::clone(&ledger),
            snapshots.clone(),
        )?;
        let shared = Arc::clone(&shared);
        let mut shutdown = shutdown_rx.clone();
        tasks.spawn(poll_loop(poller, interval, shared, async move {
            let _ = shutdown.changed().await;
        }));
    }

    // Queue consumer pool, sharded by table so per-record order holds
    let consumer = Arc::new(QueueConsumer::new(
        &config,
        db.clone(),
        Arc::clone(&sheet),
        Arc::clone(&ledger),
    ));
    let mut all_tables: Vec<String> = config.pairs.iter().map(|p| p.db_table.clone()).collect();
    all_tables.sort();
    all_tables.dedup();
    for worker in 0..config.consumer_workers {
        let worker_tables: Vec<String> = all_tables
            .iter()
            .enumerate()
            .filter(|(i, _)| i % config.consumer_workers == worker)
            .map(|(_, t)| t.clone())
            .collect();
        if worker_tables.is_empty() {
            continue;
        }
        let consumer = Arc::clone(&consumer);
        let shared = Arc::clone(&shared);
        let mut shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(CONSUME_INTERVAL) => {}
                }
                let batch = shared.effective_batch.load(Ordering::Relaxed);
                let paused = shared.paused_tables();
                let tables: Vec<String> = worker_tables
                    .iter()
                    .filter(|t| !paused.contains(t))
                    .cloned()
                    .collect();
                if tables.is_empty() {
                    continue;
                }
                match consumer.drain_once(batch, &tables).await {
                    Ok(outcome) => {
                        for (pair, ok) in &outcome.results {
                            if let Some(health) = shared.health.get(pair) {
                                health.record(*ok);
                            }
                            if !*ok {
                                shared.maybe_pause(pair);
                            }
                        }
                    }
                    Err(e) => {
                        warn!("consumer worker {}: claim failed: {}", worker, e);
                        engine_metrics::record_failure(Direction::DbToSheet, e.kind());
                    }
                }
            }
        });
    }

    // Ledger pruner
    {
        let ledger = Arc::clone(&ledger);
        let mut shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                engine_metrics::set_ledger_entries(ledger.prune());
            }
        });
    }

    // Stats publisher and queue-depth alarm
    {
        let db = db.clone();
        let shared = Arc::clone(&shared);
        let mut shutdown = shutdown_rx.clone();
        let alarm_depth = config.queue_alarm_depth;
        let batch_size = config.batch_size;
        let batch_cap = config.batch_cap;
        tasks.spawn(async move {
            let mut over_since: Option<Instant> = None;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
                match db.pending_depth().await {
                    Ok(depth) => {
                        engine_metrics::set_queue_depth(depth);
                        if depth > alarm_depth {
                            let since = *over_since.get_or_insert_with(Instant::now);
                            if since.elapsed() >= QUEUE_ALARM_HOLD
                                && shared.effective_batch.load(Ordering::Relaxed) != batch_cap
                            {
                                warn!(
                                    "queue depth {} above {} for {:?}, widening batch to {}",
                                    depth, alarm_depth, QUEUE_ALARM_HOLD, batch_cap
                                );
                                shared.effective_batch.store(batch_cap, Ordering::Relaxed);
                            }
                        } else {
                            if over_since.take().is_some()
                                && shared.effective_batch.load(Ordering::Relaxed) != batch_size
                            {
                                info!("queue backlog drained, batch back to {}", batch_size);
                                shared.effective_batch.store(batch_size, Ordering::Relaxed);
                            }
                        }
                    }
                    Err(e) => warn!("queue depth probe failed: {}", e),
                }
                for (pair, health) in &shared.health {
                    engine_metrics::set_pair_paused(pair, health.is_paused());
                }
            }
        });
    }

    info!(
        "engine running: {} pair(s), {} consumer worker(s)",
        config.pairs.len(),
        config.consumer_workers
    );

    // Supervise until every task exits; a panic anywhere is fatal
    let grace = Duration::from_secs(config.shutdown_grace_s);
    let mut fatal: Option<SyncError> = None;
    while let Some(joined) = tasks.join_next().await {
        if let Err(join_error) = joined {
            if join_error.is_panic() {
                error!("worker task panicked: {}", join_error);
                fatal = Some(SyncError::Fatal(format!(
                    "worker task panicked: {}",
                    join_error
                )));
            }
            let _ = shutdown_tx.send(true);
        }
        if *shutdown_rx.borrow() {
            // Drain the remaining tasks within the grace period
            let deadline = tokio::time::sleep(grace);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    joined = tasks.join_next() => match joined {
                        Some(Err(e)) if e.is_panic() => {
                            error!("worker task panicked during shutdown: {}", e);
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = &mut deadline => {
                        warn!("shutdown grace {:?} elapsed, aborting remaining tasks", grace);
                        tasks.abort_all();
                        break;
                    }
                }
            }
            break;
        }
    }

    db.disconnect().await?;
    match fatal {
        Some(e) => Err(e),
        None => {
            info!("engine stopped cleanly");
            Ok(())
        }
    }
}

/// One pair's poll loop: fixed cadence, overlapping ticks skipped
async fn poll_loop(
    mut poller: PairPoller,
    interval: Duration,
    shared: Arc<Shared>,
    shutdown: impl std::future::Future<Output = ()>,
) {
    let name = poller.pair_name().to_string();
    let health = shared.health.get(&name).cloned();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Some(health) = &health {
            if health.is_paused() {
                continue;
            }
        }

        let started = Instant::now();
        match poller.tick().await {
            Ok(outcome) => {
                if let Some(health) = &health {
                    for _ in 0..outcome.applied {
                        health.record(true);
                    }
                    for _ in 0..(outcome.transient_failures + outcome.permanent_failures) {
                        health.record(false);
                    }
                }
            }
            Err(e) => {
                warn!("{}: poll failed: {}", name, e);
                engine_metrics::record_failure(Direction::SheetToDb, e.kind());
                if let Some(health) = &health {
                    health.record(false);
                }
            }
        }

        // A poll that ran past its own interval consumed later ticks
        let elapsed = started.elapsed();
        if elapsed > interval {
            let missed = (elapsed.as_secs_f64() / interval.as_secs_f64()) as u64;
            for _ in 0..missed {
                engine_metrics::record_poll_overrun();
            }
            warn!("{}: poll took {:?}, skipped {} tick(s)", name, elapsed, missed);
        }

        shared.maybe_pause(&name);
    }
    info!("{}: poller stopped", name);
}

fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("cannot install SIGTERM handler: {}", e);
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => info!("received ctrl-c, shutting down"),
                _ = terminate.recv() => info!("received SIGTERM, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received ctrl-c, shutting down");
        }
        let _ = shutdown_tx.send(true);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_needs_minimum_samples() {
        let health = PairHealth::new();
        health.record(false);
        health.record(false);
        assert!(health.failure_rate().is_none());
    }

    #[test]
    fn test_failure_rate_computation() {
        let health = PairHealth::new();
        for _ in 0..9 {
            health.record(true);
        }
        health.record(false);
        let rate = health.failure_rate().unwrap();
        assert!((rate - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pause_expires() {
        let health = PairHealth::new();
        health.pause(Duration::from_millis(10), "test".into());
        assert!(health.is_paused());
        std::thread::sleep(Duration::from_millis(20));
        assert!(!health.is_paused());
        assert!(health.pause_reason().is_none());
    }

    #[test]
    fn test_pause_clears_window() {
        let health = PairHealth::new();
        for _ in 0..10 {
            health.record(false);
        }
        assert!(health.failure_rate().is_some());
        health.pause(Duration::from_secs(60), "test".into());
        assert!(health.failure_rate().is_none());
    }
}
