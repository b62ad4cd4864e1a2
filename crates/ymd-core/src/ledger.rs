//! Durable record of materialized items.
//!
//! The ledger maps remote item ids to the local file each one was placed
//! at, plus a per-playlist sync record. It is loaded once per run, mutated
//! in memory by the coordinating thread only, and persisted with a
//! write-then-rename so a crash mid-save never damages committed state.
//!
//! On disk it is a single JSON document:
//!
//! ```json
//! {
//!   "version": 1,
//!   "last_sync": "2026-01-15T10:00:00Z",
//!   "tracks": { "<item_id>": { "local_path": "...", "title": "...", ... } },
//!   "playlists": { "<playlist_id>": { "display_name": "...", "track_count": 3, ... } }
//! }
//! ```
//!
//! Unknown fields are ignored, and the key names written by earlier
//! releases (`filepath`, `name`, `last_sync`) are still accepted.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{LedgerError, Result};
use crate::track::TrackDescriptor;

/// Current on-disk schema version.
pub const LEDGER_VERSION: u32 = 1;

/// One materialized item. Only ever created after a full pipeline success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Remote item id. Filled from the map key on load.
    #[serde(default, skip_serializing)]
    pub item_id: String,
    /// Where the file was placed.
    #[serde(alias = "filepath")]
    pub local_path: PathBuf,
    /// Title at download time.
    #[serde(default)]
    pub title: String,
    /// Artist at download time.
    #[serde(default)]
    pub artist: String,
    /// Album at download time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    /// When the item was placed.
    #[serde(default = "epoch")]
    pub downloaded_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Entry for `descriptor` placed at `local_path`, timestamped now.
    #[must_use]
    pub fn new(descriptor: &TrackDescriptor, local_path: impl Into<PathBuf>) -> Self {
        Self {
            item_id: descriptor.item_id.clone(),
            local_path: local_path.into(),
            title: descriptor.title.clone(),
            artist: descriptor.artist.clone(),
            album: descriptor.album.clone(),
            downloaded_at: Utc::now(),
        }
    }
}

/// Last completed batch for a playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistSyncRecord {
    /// Provider playlist id. Filled from the map key on load.
    #[serde(default, skip_serializing)]
    pub playlist_id: String,
    /// Display name at sync time.
    #[serde(alias = "name", default)]
    pub display_name: String,
    /// Remote track count at sync time.
    #[serde(default)]
    pub track_count: usize,
    /// When the batch completed.
    #[serde(alias = "last_sync", default = "epoch")]
    pub last_synced_at: DateTime<Utc>,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

const fn default_version() -> u32 {
    LEDGER_VERSION
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerDocument {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    tracks: BTreeMap<String, LedgerEntry>,
    #[serde(default)]
    playlists: BTreeMap<String, PlaylistSyncRecord>,
}

/// The download ledger, bound to its backing file.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    doc: LedgerDocument,
}

impl Ledger {
    /// Empty ledger that will be saved at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            doc: LedgerDocument {
                version: LEDGER_VERSION,
                ..LedgerDocument::default()
            },
        }
    }

    /// Load the ledger at `path`.
    ///
    /// A missing file gives an empty ledger.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Corrupt`] if the file exists but does not parse, and
    /// [`LedgerError::ReadFailed`] if it cannot be read. A damaged ledger is
    /// never treated as empty.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            debug!("No ledger at {}, starting empty", path.display());
            return Ok(Self::new(path));
        }

        let content = fs::read_to_string(&path).map_err(|e| LedgerError::ReadFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let mut doc: LedgerDocument =
            serde_json::from_str(&content).map_err(|e| LedgerError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        for (id, entry) in &mut doc.tracks {
            entry.item_id.clone_from(id);
        }
        for (id, record) in &mut doc.playlists {
            record.playlist_id.clone_from(id);
        }

        info!(
            "Loaded ledger {} ({} tracks, {} playlists)",
            path.display(),
            doc.tracks.len(),
            doc.playlists.len()
        );
        Ok(Self { path, doc })
    }

    /// Persist the full ledger atomically.
    ///
    /// The document is written to a temporary file next to the target,
    /// flushed, then renamed over it.
    ///
    /// # Errors
    ///
    /// [`LedgerError::WriteFailed`]. The in-memory ledger stays usable.
    pub fn save(&self) -> Result<()> {
        let write_failed = |reason: String| LedgerError::WriteFailed {
            path: self.path.clone(),
            reason,
        };

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| write_failed(e.to_string()))?;

        let mut content =
            serde_json::to_string_pretty(&self.doc).map_err(|e| write_failed(e.to_string()))?;
        content.push('\n');

        let mut temp = NamedTempFile::new_in(&parent).map_err(|e| write_failed(e.to_string()))?;
        temp.write_all(content.as_bytes())
            .map_err(|e| write_failed(e.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| write_failed(e.to_string()))?;
        temp.persist(&self.path)
            .map_err(|e| write_failed(e.error.to_string()))?;

        debug!(
            "Saved ledger {} ({} tracks)",
            self.path.display(),
            self.doc.tracks.len()
        );
        Ok(())
    }

    /// Backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `item_id` has been materialized.
    #[must_use]
    pub fn has(&self, item_id: &str) -> bool {
        self.doc.tracks.contains_key(item_id)
    }

    /// Entry for `item_id`.
    #[must_use]
    pub fn get(&self, item_id: &str) -> Option<&LedgerEntry> {
        self.doc.tracks.get(item_id)
    }

    /// Insert or overwrite the entry for its item id. Returns the previous entry.
    pub fn record(&mut self, entry: LedgerEntry) -> Option<LedgerEntry> {
        self.doc.tracks.insert(entry.item_id.clone(), entry)
    }

    /// Drop the entry for `item_id`.
    pub fn remove(&mut self, item_id: &str) -> Option<LedgerEntry> {
        self.doc.tracks.remove(item_id)
    }

    /// Candidates without an entry, in input order.
    #[must_use]
    pub fn new_items(&self, candidates: &[TrackDescriptor]) -> Vec<TrackDescriptor> {
        candidates
            .iter()
            .filter(|d| !self.has(&d.item_id))
            .cloned()
            .collect()
    }

    /// Entries whose file is not in `live_paths`.
    #[must_use]
    pub fn orphans(&self, live_paths: &HashSet<PathBuf>) -> Vec<&LedgerEntry> {
        self.doc
            .tracks
            .values()
            .filter(|e| !live_paths.contains(&e.local_path))
            .collect()
    }

    /// Live files that no entry points at, sorted.
    #[must_use]
    pub fn untracked_files(&self, live_paths: &HashSet<PathBuf>) -> Vec<PathBuf> {
        let tracked: HashSet<&Path> = self
            .doc
            .tracks
            .values()
            .map(|e| e.local_path.as_path())
            .collect();
        let mut untracked: Vec<PathBuf> = live_paths
            .iter()
            .filter(|p| !tracked.contains(p.as_path()))
            .cloned()
            .collect();
        untracked.sort();
        untracked
    }

    /// Entries whose item is no longer in any remote playlist.
    #[must_use]
    pub fn stale_items(&self, current_remote_ids: &HashSet<String>) -> Vec<&LedgerEntry> {
        self.doc
            .tracks
            .values()
            .filter(|e| !current_remote_ids.contains(&e.item_id))
            .collect()
    }

    /// Record that a playlist batch completed.
    pub fn mark_playlist_synced(&mut self, id: &str, name: &str, count: usize) {
        self.doc.playlists.insert(
            id.to_string(),
            PlaylistSyncRecord {
                playlist_id: id.to_string(),
                display_name: name.to_string(),
                track_count: count,
                last_synced_at: Utc::now(),
            },
        );
    }

    /// Sync record for a playlist.
    #[must_use]
    pub fn playlist(&self, id: &str) -> Option<&PlaylistSyncRecord> {
        self.doc.playlists.get(id)
    }

    /// All playlist records, by id.
    pub fn playlists(&self) -> impl Iterator<Item = &PlaylistSyncRecord> {
        self.doc.playlists.values()
    }

    /// All entries, by item id.
    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.doc.tracks.values()
    }

    /// Stamp the end of a run.
    pub fn touch_last_sync(&mut self) {
        self.doc.last_sync = Some(Utc::now());
    }

    /// End of the last completed run.
    #[must_use]
    pub const fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.doc.last_sync
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.doc.tracks.len()
    }

    /// Whether there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.doc.tracks.is_empty()
    }

    /// Schema version of the loaded document.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.doc.version
    }
}
