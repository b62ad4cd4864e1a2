//! Library cleanup against the ledger.
//!
//! Sync never deletes anything. This module is the collaborator that does:
//! - [`scan_library`] lists the audio files actually on disk
//! - [`find_orphans`] diffs that listing against the ledger in both directions
//! - [`remove_stale`] deletes files for items the provider no longer lists
//!
//! # Example
//!
//! ```rust,ignore
//! use ymd_core::cleanup::{remove_stale, CleanupOptions};
//! use ymd_core::fs::RealFileSystem;
//!
//! let report = remove_stale(&mut ledger, &RealFileSystem, &root, &remote_ids, &CleanupOptions::dry_run())?;
//! println!("Would delete {} files", report.removed.len());
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Error, FileSystemError, Result};
use crate::fs::FileSystem;
use crate::ledger::{Ledger, LedgerEntry};

/// Extensions treated as library audio files.
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "m4a", "mp4", "aac", "opus", "ogg", "webm", "flac", "wav",
];

/// Options for [`remove_stale`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupOptions {
    /// Report what would be deleted without touching anything.
    pub dry_run: bool,
}

impl CleanupOptions {
    /// Options for a dry run.
    #[must_use]
    pub const fn dry_run() -> Self {
        Self { dry_run: true }
    }
}

/// Both directions of the ledger/disk diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanReport {
    /// Ledger entries whose file is gone.
    pub missing_files: Vec<LedgerEntry>,
    /// Audio files on disk with no ledger entry.
    pub untracked_files: Vec<PathBuf>,
    /// The zero-byte subset of `untracked_files`. Placement reserves its
    /// path with an empty file before moving the audio in, so these are
    /// left behind by a run killed in between.
    pub empty_files: Vec<PathBuf>,
}

impl OrphanReport {
    /// Whether ledger and disk agree.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.missing_files.is_empty() && self.untracked_files.is_empty()
    }
}

/// Outcome of [`remove_stale`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Items whose file was (or would be) deleted.
    pub removed: Vec<(String, PathBuf)>,
    /// Stale items whose file was already gone; their entries are dropped.
    pub already_missing: Vec<String>,
    /// Directories left empty and removed.
    pub pruned_dirs: Vec<PathBuf>,
    /// Files that could not be deleted, with the reason. Their entries stay.
    pub errors: Vec<(PathBuf, String)>,
    /// Whether this was a dry run.
    pub dry_run: bool,
}

impl CleanupReport {
    /// One-line human readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let verb = if self.dry_run { "Would remove" } else { "Removed" };
        format!(
            "{} {} stale files ({} already missing, {} directories pruned, {} errors)",
            verb,
            self.removed.len(),
            self.already_missing.len(),
            self.pruned_dirs.len(),
            self.errors.len()
        )
    }
}

/// Audio files under `root`, sorted, skipping anything under `ignore`.
///
/// # Errors
///
/// Returns [`FileSystemError::NotFound`] if `root` is not a directory.
pub fn scan_library(root: &Path, ignore: &[PathBuf]) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(Error::FileSystem(FileSystemError::NotFound {
            path: root.to_path_buf(),
        }));
    }

    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !ignore.iter().any(|skip| e.path() == skip))
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file() && is_audio_file(e.path()))
        .map(walkdir::DirEntry::into_path)
        .collect();
    files.sort();

    debug!("Found {} audio files under {}", files.len(), root.display());
    Ok(files)
}

/// Whether `path` has one of the [`AUDIO_EXTENSIONS`].
#[must_use]
pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            AUDIO_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Diff the ledger against `live_paths`.
#[must_use]
pub fn find_orphans(ledger: &Ledger, live_paths: &HashSet<PathBuf>) -> OrphanReport {
    let untracked_files = ledger.untracked_files(live_paths);
    let empty_files: Vec<PathBuf> = untracked_files
        .iter()
        .filter(|p| std::fs::metadata(p).is_ok_and(|m| m.is_file() && m.len() == 0))
        .cloned()
        .collect();
    if !empty_files.is_empty() {
        warn!(
            "{} empty untracked files, likely from an interrupted placement",
            empty_files.len()
        );
    }

    OrphanReport {
        missing_files: ledger.orphans(live_paths).into_iter().cloned().collect(),
        untracked_files,
        empty_files,
    }
}

/// Delete files of ledger entries absent from `current_remote_ids`.
///
/// Emptied parent directories are pruned up to, but never including,
/// `library_root`. Entries are removed and the ledger saved unless this is
/// a dry run.
///
/// # Errors
///
/// Returns an error if the ledger cannot be saved. Per-file failures are
/// collected in the report.
pub fn remove_stale(
    ledger: &mut Ledger,
    fs: &dyn FileSystem,
    library_root: &Path,
    current_remote_ids: &HashSet<String>,
    options: &CleanupOptions,
) -> Result<CleanupReport> {
    let mut report = CleanupReport {
        dry_run: options.dry_run,
        ..CleanupReport::default()
    };

    let stale: Vec<LedgerEntry> = ledger
        .stale_items(current_remote_ids)
        .into_iter()
        .cloned()
        .collect();
    info!("{} ledger entries no longer listed remotely", stale.len());

    let mut dropped = Vec::new();
    for entry in stale {
        if !fs.is_file(&entry.local_path) {
            debug!("{} already gone from {}", entry.item_id, entry.local_path.display());
            report.already_missing.push(entry.item_id.clone());
            dropped.push(entry.item_id);
            continue;
        }

        if options.dry_run {
            report.removed.push((entry.item_id, entry.local_path));
            continue;
        }

        match fs.remove_file(&entry.local_path) {
            Ok(()) => {
                if let Some(parent) = entry.local_path.parent() {
                    prune_empty_dirs(fs, parent, library_root, &mut report.pruned_dirs);
                }
                report
                    .removed
                    .push((entry.item_id.clone(), entry.local_path));
                dropped.push(entry.item_id);
            }
            Err(e) => {
                warn!("Failed to delete {}: {}", entry.local_path.display(), e);
                report.errors.push((entry.local_path, e.to_string()));
            }
        }
    }

    if !options.dry_run && !dropped.is_empty() {
        for item_id in &dropped {
            ledger.remove(item_id);
        }
        ledger.save()?;
    }

    info!("{}", report.summary());
    Ok(report)
}

/// Remove `dir` and its ancestors while they are empty and below `root`.
fn prune_empty_dirs(fs: &dyn FileSystem, dir: &Path, root: &Path, pruned: &mut Vec<PathBuf>) {
    let mut current = Some(dir);
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        match fs.read_dir(dir) {
            Ok(children) if children.is_empty() => {
                if let Err(e) = fs.remove_dir(dir) {
                    warn!("Failed to remove empty directory {}: {}", dir.display(), e);
                    break;
                }
                pruned.push(dir.to_path_buf());
            }
            _ => break,
        }
        current = dir.parent();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::fs::RealFileSystem;
    use crate::fs::mock::MemoryFileSystem;
    use crate::track::TrackDescriptor;
    use tempfile::TempDir;

    fn entry(id: &str, path: &Path) -> LedgerEntry {
        let descriptor = TrackDescriptor::new(id, "Title", "Artist", "PL").expect("valid");
        LedgerEntry::new(&descriptor, path)
    }

    #[test]
    fn test_scan_library_filters_and_ignores() {
        let temp_dir = TempDir::new().expect("Should create temp dir");
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("Rock/Queen")).expect("mkdir");
        std::fs::create_dir_all(root.join(".tmp/abc")).expect("mkdir");
        std::fs::write(root.join("Rock/Queen/a.mp3"), b"x").expect("write");
        std::fs::write(root.join("Rock/Queen/cover.jpg"), b"x").expect("write");
        std::fs::write(root.join("b.M4A"), b"x").expect("write");
        std::fs::write(root.join(".tmp/abc/c.mp3"), b"x").expect("write");
        std::fs::write(root.join(".sync_state.json"), b"{}").expect("write");

        let files = scan_library(root, &[root.join(".tmp"), root.join(".sync_state.json")])
            .expect("scan");

        assert_eq!(
            files,
            vec![root.join("Rock/Queen/a.mp3"), root.join("b.M4A")]
        );
    }

    #[test]
    fn test_scan_missing_root() {
        let temp_dir = TempDir::new().expect("Should create temp dir");
        assert!(scan_library(&temp_dir.path().join("nope"), &[]).is_err());
    }

    #[test]
    fn test_find_orphans_both_directions() {
        let temp_dir = TempDir::new().expect("Should create temp dir");
        let mut ledger = Ledger::new(temp_dir.path().join("state.json"));
        ledger.record(entry("kept", Path::new("/lib/kept.mp3")));
        ledger.record(entry("gone", Path::new("/lib/gone.mp3")));

        let live: HashSet<PathBuf> = [PathBuf::from("/lib/kept.mp3"), PathBuf::from("/lib/manual.mp3")]
            .into_iter()
            .collect();
        let report = find_orphans(&ledger, &live);

        assert_eq!(report.missing_files.len(), 1);
        assert_eq!(report.missing_files[0].item_id, "gone");
        assert_eq!(report.untracked_files, vec![PathBuf::from("/lib/manual.mp3")]);
        assert!(report.empty_files.is_empty());
        assert!(!report.is_empty());
    }

    #[test]
    fn test_find_orphans_flags_empty_placeholders() {
        let temp_dir = TempDir::new().expect("Should create temp dir");
        let root = temp_dir.path();
        let placed = root.join("Queen - What.mp3");
        let reserved = root.join("Queen - What (1).mp3");
        std::fs::write(&placed, b"audio").expect("write");
        std::fs::write(&reserved, b"").expect("write");
        let manual = root.join("manual.mp3");
        std::fs::write(&manual, b"x").expect("write");

        let mut ledger = Ledger::new(root.join("state.json"));
        ledger.record(entry("q1", &placed));
        let live: HashSet<PathBuf> = scan_library(root, &[]).expect("scan").into_iter().collect();

        let report = find_orphans(&ledger, &live);

        assert_eq!(report.untracked_files.len(), 2);
        assert_eq!(report.empty_files, vec![reserved]);
    }

    #[test]
    fn test_remove_stale_prunes_and_saves() {
        let temp_dir = TempDir::new().expect("Should create temp dir");
        let fs = MemoryFileSystem::new();
        let root = Path::new("/lib");
        fs.add_file("/lib/Rock/Queen/old.mp3", b"x");
        fs.add_file("/lib/Rock/Cash/keep.mp3", b"x");

        let ledger_path = temp_dir.path().join("state.json");
        let mut ledger = Ledger::new(&ledger_path);
        ledger.record(entry("old", Path::new("/lib/Rock/Queen/old.mp3")));
        ledger.record(entry("keep", Path::new("/lib/Rock/Cash/keep.mp3")));
        ledger.record(entry("vanished", Path::new("/lib/Pop/x.mp3")));

        let remote: HashSet<String> = ["keep".to_string()].into_iter().collect();
        let report = remove_stale(&mut ledger, &fs, root, &remote, &CleanupOptions::default())
            .expect("cleanup");

        assert_eq!(report.removed.len(), 1);
        assert_eq!(report.already_missing, vec!["vanished".to_string()]);
        assert_eq!(report.pruned_dirs, vec![PathBuf::from("/lib/Rock/Queen")]);
        assert!(report.errors.is_empty());
        assert_eq!(fs.list_all_files(), vec![PathBuf::from("/lib/Rock/Cash/keep.mp3")]);
        assert!(fs.is_dir(Path::new("/lib/Rock")));

        assert_eq!(ledger.len(), 1);
        let reloaded = Ledger::load(&ledger_path).expect("reload");
        assert!(reloaded.has("keep"));
        assert!(!reloaded.has("old"));
    }

    #[test]
    fn test_remove_stale_dry_run_changes_nothing() {
        let temp_dir = TempDir::new().expect("Should create temp dir");
        let fs = MemoryFileSystem::new();
        fs.add_file("/lib/a/old.mp3", b"x");
        let ledger_path = temp_dir.path().join("state.json");
        let mut ledger = Ledger::new(&ledger_path);
        ledger.record(entry("old", Path::new("/lib/a/old.mp3")));

        let report = remove_stale(
            &mut ledger,
            &fs,
            Path::new("/lib"),
            &HashSet::new(),
            &CleanupOptions::dry_run(),
        )
        .expect("cleanup");

        assert!(report.dry_run);
        assert_eq!(report.removed.len(), 1);
        assert!(report.summary().starts_with("Would remove 1"));
        assert!(fs.is_file(Path::new("/lib/a/old.mp3")));
        assert!(ledger.has("old"));
        assert!(!ledger_path.exists());
    }

    #[test]
    fn test_remove_stale_on_real_disk() {
        let temp_dir = TempDir::new().expect("Should create temp dir");
        let root = temp_dir.path().join("lib");
        let file = root.join("Pop/Artist/song.opus");
        std::fs::create_dir_all(file.parent().expect("parent")).expect("mkdir");
        std::fs::write(&file, b"x").expect("write");

        let mut ledger = Ledger::new(temp_dir.path().join("state.json"));
        ledger.record(entry("song", &file));

        let report = remove_stale(
            &mut ledger,
            &RealFileSystem::new(),
            &root,
            &HashSet::new(),
            &CleanupOptions::default(),
        )
        .expect("cleanup");

        assert_eq!(report.pruned_dirs.len(), 2);
        assert!(root.is_dir());
        assert!(!root.join("Pop").exists());
        assert!(ledger.is_empty());
    }
}
