//! Anti-loop ledger
//!
//! Records every write the engine itself applied, keyed by content
//! fingerprint and direction. Before applying a change, each pipeline asks
//! whether the same content was just written from the opposite direction; a
//! hit means the change is the engine's own echo and must be dropped.
//!
//! Storage is two-tier: a sharded in-process map (L1) answers almost every
//! query; the `sync_log` table (L2, owned by [`crate::db`]) is consulted only
//! when L1 cannot exonerate a write, e.g. right after a restart.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::debug;

use crate::error::{Result, SyncError};
use crate::types::{Direction, Fingerprint};

const SHARD_COUNT: usize = 16;
const MAX_ENTRIES: usize = 10_000;

/// Sharded in-memory ledger with a sliding window.
///
/// Locks are per shard and never held across an await point.
pub struct Ledger {
    shards: Vec<Mutex<HashMap<(Fingerprint, Direction), Instant>>>,
    window: Duration,
    max_per_shard: usize,
}

impl Ledger {
    /// Create a ledger. Windows outside [2 s, 120 s] are rejected: shorter
    /// cannot cover a sheet round-trip, longer starts dropping genuine
    /// user re-edits of identical content.
    pub fn new(window: Duration) -> Result<Ledger> {
        if window < Duration::from_secs(2) || window > Duration::from_secs(120) {
            return Err(SyncError::Config(format!(
                "anti-loop window must be within [2s, 120s], got {:?}",
                window
            )));
        }
        Ok(Self::with_capacity(window, MAX_ENTRIES))
    }

    fn with_capacity(window: Duration, max_entries: usize) -> Ledger {
        Ledger {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            window,
            max_per_shard: (max_entries / SHARD_COUNT).max(1),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn shard_index(&self, fingerprint: &Fingerprint) -> usize {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        fingerprint.hash(&mut hasher);
        (hasher.finish() as usize) % SHARD_COUNT
    }

    /// Record that the engine just applied this write
    pub fn remember(&self, fingerprint: &Fingerprint, direction: Direction) {
        self.remember_at(fingerprint, direction, Instant::now());
    }

    fn remember_at(&self, fingerprint: &Fingerprint, direction: Direction, at: Instant) {
        let mut shard = self.shards[self.shard_index(fingerprint)].lock().unwrap();
        Self::prune_shard(&mut shard, self.window);
        if shard.len() >= self.max_per_shard {
            // Evict the oldest entry to stay within the cap
            if let Some(oldest) = shard
                .iter()
                .min_by_key(|(_, at)| *at)
                .map(|(key, _)| key.clone())
            {
                shard.remove(&oldest);
            }
        }
        shard.insert((fingerprint.clone(), direction), at);
    }

    /// True iff an entry with this fingerprint and direction exists within
    /// the window. Callers pass the direction *opposite* to the write they
    /// are about to apply.
    pub fn should_skip(&self, fingerprint: &Fingerprint, direction: Direction) -> bool {
        let mut shard = self.shards[self.shard_index(fingerprint)].lock().unwrap();
        Self::prune_shard(&mut shard, self.window);
        shard.contains_key(&(fingerprint.clone(), direction))
    }

    /// L1 check, falling back to the `sync_log` table when L1 misses.
    pub async fn should_skip_with_db(
        &self,
        db: &crate::db::Db,
        fingerprint: &Fingerprint,
        direction: Direction,
    ) -> Result<bool> {
        if self.should_skip(fingerprint, direction) {
            return Ok(true);
        }
        let hit = db.sync_log_recent(fingerprint, direction, self.window).await?;
        if hit {
            debug!(
                "ledger L2 hit for {} {}",
                fingerprint, direction
            );
            // Promote so repeated queries stay in-process
            self.remember(fingerprint, direction);
        }
        Ok(hit)
    }

    fn prune_shard(shard: &mut HashMap<(Fingerprint, Direction), Instant>, window: Duration) {
        let now = Instant::now();
        shard.retain(|_, at| now.duration_since(*at) <= window);
    }

    /// Drop expired entries across all shards; returns entries remaining
    pub fn prune(&self) -> usize {
        let mut remaining = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            Self::prune_shard(&mut shard, self.window);
            remaining += shard.len();
        }
        remaining
    }

    /// Current entry count (after pruning)
    pub fn len(&self) -> usize {
        self.prune()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(s: &str) -> Fingerprint {
        Fingerprint::from_hex(s.to_string())
    }

    #[test]
    fn test_window_bounds_enforced() {
        assert!(Ledger::new(Duration::from_secs(1)).is_err());
        assert!(Ledger::new(Duration::from_secs(121)).is_err());
        assert!(Ledger::new(Duration::from_secs(2)).is_ok());
        assert!(Ledger::new(Duration::from_secs(120)).is_ok());
    }

    #[test]
    fn test_remember_then_skip() {
        let ledger = Ledger::new(Duration::from_secs(10)).unwrap();
        let fp = fingerprint("abc");
        ledger.remember(&fp, Direction::SheetToDb);
        assert!(ledger.should_skip(&fp, Direction::SheetToDb));
    }

    #[test]
    fn test_direction_is_part_of_the_key() {
        let ledger = Ledger::new(Duration::from_secs(10)).unwrap();
        let fp = fingerprint("abc");
        ledger.remember(&fp, Direction::SheetToDb);
        assert!(!ledger.should_skip(&fp, Direction::DbToSheet));
    }

    #[test]
    fn test_unknown_fingerprint_not_skipped() {
        let ledger = Ledger::new(Duration::from_secs(10)).unwrap();
        assert!(!ledger.should_skip(&fingerprint("missing"), Direction::SheetToDb));
    }

    #[test]
    fn test_entries_expire() {
        let ledger = Ledger::new(Duration::from_secs(10)).unwrap();
        let fp = fingerprint("old");
        // Back-date the entry past the window
        ledger.remember_at(
            &fp,
            Direction::SheetToDb,
            Instant::now() - Duration::from_secs(11),
        );
        assert!(!ledger.should_skip(&fp, Direction::SheetToDb));
        assert_eq!(ledger.len(), 0);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let ledger = Ledger::with_capacity(Duration::from_secs(60), SHARD_COUNT);
        // One slot per shard: a second entry landing in the same shard
        // evicts the older one
        let now = Instant::now();
        for i in 0..64u64 {
            ledger.remember_at(
                &fingerprint(&format!("fp{}", i)),
                Direction::SheetToDb,
                now + Duration::from_millis(i),
            );
        }
        assert!(ledger.len() <= SHARD_COUNT);
    }

    #[test]
    fn test_prune_reports_remaining() {
        let ledger = Ledger::new(Duration::from_secs(10)).unwrap();
        ledger.remember(&fingerprint("a"), Direction::SheetToDb);
        ledger.remember(&fingerprint("b"), Direction::DbToSheet);
        assert_eq!(ledger.prune(), 2);
    }
}
