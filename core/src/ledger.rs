//! Durable record of every file already processed.
//!
//! The ledger is a JSON array of entries, read fully at startup and
//! rewritten fully at shutdown. Membership is keyed by file path and is the
//! single source of idempotence: a path in the ledger is never reprocessed,
//! re-archived, or re-notified. The rewrite goes through a temp file in the
//! target directory followed by an atomic rename, so a crash mid-write
//! leaves the previous ledger intact.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{DnaError, Result};

/// One processed file. Append-only; entries are never removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub file: PathBuf,
    pub user: String,
    pub email: String,
    pub group_id: String,
    pub observation_id: String,
    pub target: String,
    pub size: u64,
    /// File mtime, ISO-8601.
    pub timestamp: String,
}

/// In-memory ledger bound to its backing file.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    entries: Vec<LedgerEntry>,
    /// Path -> position in `entries`.
    index: HashMap<PathBuf, usize>,
    /// Paths appended this run; owner backfill is limited to these.
    fresh: HashSet<PathBuf>,
}

impl Ledger {
    /// Load the ledger at `path`. A missing file is an empty ledger; an
    /// unreadable one is logged and treated as empty so the run can still
    /// make forward progress (files will be reclassified, and archive
    /// existence checks keep that idempotent).
    pub fn load(path: &Path) -> Self {
        let entries: Vec<LedgerEntry> = match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("ledger at {} is unreadable, starting empty: {err}", path.display());
                    Vec::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                warn!("cannot read ledger at {}: {err}", path.display());
                Vec::new()
            }
        };
        let index = entries
            .iter()
            .enumerate()
            .map(|(pos, entry)| (entry.file.clone(), pos))
            .collect();
        debug!("loaded {} ledger entries from {}", entries.len(), path.display());
        Self {
            path: path.to_path_buf(),
            entries,
            index,
            fresh: HashSet::new(),
        }
    }

    /// Whether `path` was already processed in this or any prior run.
    pub fn contains(&self, path: &Path) -> bool {
        self.index.contains_key(path)
    }

    /// The stored entry for `path`, if any.
    pub fn entry_for(&self, path: &Path) -> Option<&LedgerEntry> {
        self.index.get(path).map(|pos| &self.entries[*pos])
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry for a newly classified file. Duplicate paths are
    /// rejected; the caller must check `contains` first.
    pub fn append(&mut self, entry: LedgerEntry) -> Result<()> {
        if self.index.contains_key(&entry.file) {
            return Err(DnaError::Ledger {
                path: entry.file,
                message: "duplicate ledger entry".to_string(),
            });
        }
        self.index.insert(entry.file.clone(), self.entries.len());
        self.fresh.insert(entry.file.clone());
        self.entries.push(entry);
        Ok(())
    }

    /// Backfill the owner on entries appended this run for the given paths.
    /// Durable history is never touched: only not-yet-persisted entries
    /// qualify.
    pub fn assign_owner(&mut self, files: &[PathBuf], user: &str, email: &str) {
        for entry in &mut self.entries {
            if self.fresh.contains(&entry.file) && files.contains(&entry.file) {
                entry.user = user.to_string();
                entry.email = email.to_string();
            }
        }
    }

    /// Rewrite the backing file atomically (temp file + rename).
    pub fn persist(&self) -> Result<()> {
        let dir = self.path.parent().ok_or_else(|| DnaError::Ledger {
            path: self.path.clone(),
            message: "ledger path has no parent directory".to_string(),
        })?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut tmp, &self.entries)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|err| DnaError::Ledger {
            path: self.path.clone(),
            message: format!("atomic rename failed: {}", err.error),
        })?;
        debug!("persisted {} ledger entries to {}", self.entries.len(), self.path.display());
        Ok(())
    }
}

/// ISO-8601 mtime of `path`, falling back to now when the filesystem does
/// not report one.
pub fn file_timestamp(path: &Path) -> String {
    let stamp = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    stamp.to_rfc3339()
}
