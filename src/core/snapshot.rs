//! Per-pair snapshot persistence
//!
//! The poller's last-observed view of a pair's sheet side: external record
//! id → content fingerprint, plus the record's key value so a disappeared
//! record can still be deleted on the DB side. Held in memory by the poller
//! and persisted here so a restart does not replay the whole sheet.
//!
//! File format: an 8-byte header (magic + version), then one length-prefixed
//! bincode record per entry. Files are replaced atomically via a temp file
//! rename so a crash mid-save never leaves a torn snapshot.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{Result, SyncError};
use crate::types::Fingerprint;

/// What the poller remembers about one sheet record
#[derive(Debug, Clone, PartialEq)]
pub struct SnapEntry {
    pub fingerprint: Fingerprint,
    /// Key-field value in its string representation
    pub key: String,
}

/// In-memory snapshot of one pair: external_id → last applied content
pub type Snapshot = HashMap<String, SnapEntry>;

const MAGIC: &[u8; 6] = b"SSNAP\x02";

#[derive(Serialize, Deserialize)]
struct FileEntry {
    external_id: String,
    fingerprint: String,
    key: String,
}

/// Directory of per-pair snapshot files
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Open (creating if needed) the snapshot directory
    pub fn new(dir: PathBuf) -> Result<SnapshotStore> {
        std::fs::create_dir_all(&dir)?;
        Ok(SnapshotStore { dir })
    }

    /// File path for a pair; pair names contain `:` which is kept out of
    /// file names
    fn path_for(&self, pair: &str) -> PathBuf {
        let stem: String = pair
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.snap", stem))
    }

    /// Load a pair's persisted snapshot, `None` when absent
    pub fn load(&self, pair: &str) -> Result<Option<Snapshot>> {
        let path = self.path_for(pair);
        let mut file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut header = [0u8; 6];
        file.read_exact(&mut header)?;
        if &header != MAGIC {
            return Err(SyncError::Internal(format!(
                "snapshot {} has an unrecognized header",
                path.display()
            )));
        }

        let mut snapshot = Snapshot::new();
        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut record = vec![0u8; len];
            file.read_exact(&mut record)?;
            let entry: FileEntry = bincode::deserialize(&record)
                .map_err(|e| SyncError::Internal(format!("corrupt snapshot entry: {}", e)))?;
            snapshot.insert(
                entry.external_id,
                SnapEntry {
                    fingerprint: Fingerprint::from_hex(entry.fingerprint),
                    key: entry.key,
                },
            );
        }
        debug!("loaded snapshot for {} ({} records)", pair, snapshot.len());
        Ok(Some(snapshot))
    }

    /// Persist a pair's snapshot atomically
    pub fn save(&self, pair: &str, snapshot: &Snapshot) -> Result<()> {
        let path = self.path_for(pair);
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(MAGIC)?;
        for (external_id, entry) in snapshot {
            let record = bincode::serialize(&FileEntry {
                external_id: external_id.clone(),
                fingerprint: entry.fingerprint.as_str().to_string(),
                key: entry.key.clone(),
            })
            .map_err(|e| SyncError::Internal(format!("snapshot encode: {}", e)))?;
            tmp.write_all(&(record.len() as u32).to_le_bytes())?;
            tmp.write_all(&record)?;
        }
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| SyncError::Io(e.error))?;
        debug!("saved snapshot for {} ({} records)", pair, snapshot.len());
        Ok(())
    }

    /// Remove a pair's snapshot file, forcing a full resync on next start.
    /// Returns whether a file existed.
    pub fn clear(&self, pair: &str) -> Result<bool> {
        let path = self.path_for(pair);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
