//! Playlist sync coordinator.
//!
//! The coordinator walks the selected playlists one at a time on the calling
//! thread. For each one it diffs the catalog against the ledger, hands the new
//! items to the [`DownloadOrchestrator`], folds the successes back into the
//! ledger once the whole batch has drained and persists the ledger before
//! moving on. A crash therefore loses at most the playlist in progress.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn};

use crate::config::DEFAULT_MAX_CONCURRENT_DOWNLOADS;
use crate::error::Result;
use crate::ledger::{Ledger, LedgerEntry};
use crate::orchestrator::{DownloadOrchestrator, ItemProgress};
use crate::pipeline::{ItemContext, PipelineOutcome, PipelineStage};
use crate::provider::{CatalogProvider, PlaylistSummary};

// =============================================================================
// Options
// =============================================================================

/// A playlist the user chose to sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistSelection {
    /// Provider playlist id.
    pub id: String,
    /// Name recorded in the ledger and used for the playlist layout.
    pub display_name: String,
}

impl PlaylistSelection {
    /// Create a selection.
    #[must_use]
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

impl From<&PlaylistSummary> for PlaylistSelection {
    fn from(summary: &PlaylistSummary) -> Self {
        Self::new(summary.id.clone(), summary.title.clone())
    }
}

/// Knobs for one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Items in flight per playlist batch.
    pub concurrency_limit: usize,
    /// Re-download items the ledger already records.
    pub force: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            force: false,
        }
    }
}

impl SyncOptions {
    /// Options with the given concurrency.
    #[must_use]
    pub fn with_concurrency(concurrency_limit: usize) -> Self {
        Self {
            concurrency_limit,
            ..Self::default()
        }
    }

    /// Set the force flag.
    #[must_use]
    pub const fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

// =============================================================================
// Report
// =============================================================================

/// An item that reached a terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// Item id.
    pub item_id: String,
    /// Stage that failed.
    pub stage: PipelineStage,
    /// Rendered error.
    pub reason: String,
}

/// Accounting for one playlist.
///
/// Every descriptor the catalog returned lands in exactly one of
/// `already_present`, `succeeded`, `skipped` or `failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistReport {
    /// Provider playlist id.
    pub playlist_id: String,
    /// Display name.
    pub display_name: String,
    /// Descriptors returned by the catalog.
    pub total: usize,
    /// Descriptors already recorded in the ledger.
    pub already_present: usize,
    /// Items placed in this run, with their paths.
    pub succeeded: Vec<(String, PathBuf)>,
    /// Items skipped by the orchestrator, with the reason.
    pub skipped: Vec<(String, String)>,
    /// Items that failed.
    pub failed: Vec<ItemFailure>,
    /// Catalog error that prevented the playlist from being processed.
    pub catalog_error: Option<String>,
    /// Whether the playlist was marked synced.
    pub synced: bool,
}

impl PlaylistReport {
    fn new(selection: &PlaylistSelection) -> Self {
        Self {
            playlist_id: selection.id.clone(),
            display_name: selection.display_name.clone(),
            ..Self::default()
        }
    }

    /// Items handed to the orchestrator.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.skipped.len() + self.failed.len()
    }
}

/// Result of a sync run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    /// One report per processed playlist, in processing order.
    pub playlists: Vec<PlaylistReport>,
    /// Whether the run stopped early because of cancellation.
    pub was_cancelled: bool,
    /// Wall time in seconds.
    pub duration_secs: f64,
}

impl SyncReport {
    /// Descriptors seen across all playlists.
    #[must_use]
    pub fn total(&self) -> usize {
        self.playlists.iter().map(|p| p.total).sum()
    }

    /// Items handed to the orchestrator.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.playlists.iter().map(PlaylistReport::attempted).sum()
    }

    /// Items placed in this run.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.playlists.iter().map(|p| p.succeeded.len()).sum()
    }

    /// Descriptors already in the ledger.
    #[must_use]
    pub fn already_present(&self) -> usize {
        self.playlists.iter().map(|p| p.already_present).sum()
    }

    /// Items skipped by the orchestrator.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.playlists.iter().map(|p| p.skipped.len()).sum()
    }

    /// Ids placed in this run, in processing order.
    #[must_use]
    pub fn succeeded_ids(&self) -> Vec<&str> {
        self.playlists
            .iter()
            .flat_map(|p| p.succeeded.iter().map(|(id, _)| id.as_str()))
            .collect()
    }

    /// Every item failure, in processing order.
    #[must_use]
    pub fn failures(&self) -> Vec<&ItemFailure> {
        self.playlists.iter().flat_map(|p| &p.failed).collect()
    }

    /// Playlists whose tracks could not be listed.
    #[must_use]
    pub fn catalog_errors(&self) -> Vec<(&str, &str)> {
        self.playlists
            .iter()
            .filter_map(|p| p.catalog_error.as_deref().map(|e| (p.playlist_id.as_str(), e)))
            .collect()
    }

    /// Whether every processed playlist synced without item failures.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.was_cancelled && self.playlists.iter().all(|p| p.synced && p.failed.is_empty())
    }

    /// One-line human readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.was_cancelled {
            format!(
                "Sync cancelled: {} tracks downloaded before cancellation",
                self.succeeded()
            )
        } else {
            format!(
                "Sync completed: {} playlists, {} attempted, {} downloaded, {} already present, {} skipped, {} failed in {:.2}s",
                self.playlists.len(),
                self.attempted(),
                self.succeeded(),
                self.already_present(),
                self.skipped(),
                self.failures().len(),
                self.duration_secs
            )
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Drives playlist syncs against a ledger.
pub struct SyncCoordinator {
    catalog: Arc<dyn CatalogProvider>,
    orchestrator: DownloadOrchestrator,
}

impl fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(catalog: Arc<dyn CatalogProvider>, orchestrator: DownloadOrchestrator) -> Self {
        Self {
            catalog,
            orchestrator,
        }
    }

    /// The orchestrator, e.g. to grab its cancellation token.
    #[must_use]
    pub const fn orchestrator(&self) -> &DownloadOrchestrator {
        &self.orchestrator
    }

    /// Sync `selections` into `ledger`.
    ///
    /// # Errors
    ///
    /// Returns an error only when the ledger cannot be persisted. Item and
    /// catalog failures are reported in the [`SyncReport`].
    pub fn sync(
        &self,
        ledger: &mut Ledger,
        selections: &[PlaylistSelection],
        options: &SyncOptions,
    ) -> Result<SyncReport> {
        self.sync_observed(ledger, selections, options, None::<fn(&str, &ItemProgress)>)
    }

    /// [`sync`](Self::sync) with a progress observer receiving the playlist
    /// id and each item state change. The observer runs on the calling
    /// thread.
    ///
    /// # Errors
    ///
    /// Returns an error only when the ledger cannot be persisted.
    pub fn sync_observed<F>(
        &self,
        ledger: &mut Ledger,
        selections: &[PlaylistSelection],
        options: &SyncOptions,
        mut observer: Option<F>,
    ) -> Result<SyncReport>
    where
        F: FnMut(&str, &ItemProgress),
    {
        let started = Instant::now();
        let mut report = SyncReport::default();
        let mut seen = HashSet::new();

        info!(
            "Starting sync of {} playlist(s) into {}",
            selections.len(),
            ledger.path().display()
        );

        for selection in selections {
            if !seen.insert(selection.id.as_str()) {
                debug!("Playlist {} selected twice, ignoring repeat", selection.id);
                continue;
            }
            if self.orchestrator.is_cancelled() {
                report.was_cancelled = true;
                break;
            }

            let span = info_span!("playlist", playlist_id = %selection.id);
            let _enter = span.enter();

            let playlist = self.sync_playlist(ledger, selection, options, &mut observer)?;
            report.playlists.push(playlist);

            if self.orchestrator.is_cancelled() {
                warn!("Sync cancelled during {}", selection.id);
                report.was_cancelled = true;
                break;
            }
        }

        if !report.was_cancelled {
            ledger.touch_last_sync();
            ledger.save()?;
        }
        self.remove_empty_staging_root();

        report.duration_secs = started.elapsed().as_secs_f64();
        info!("{}", report.summary());
        Ok(report)
    }

    fn sync_playlist<F>(
        &self,
        ledger: &mut Ledger,
        selection: &PlaylistSelection,
        options: &SyncOptions,
        observer: &mut Option<F>,
    ) -> Result<PlaylistReport>
    where
        F: FnMut(&str, &ItemProgress),
    {
        let mut report = PlaylistReport::new(selection);

        let descriptors = match self.catalog.list_tracks(&selection.id) {
            Ok(descriptors) => descriptors,
            Err(e) => {
                error!("Could not list tracks of {}: {}", selection.id, e);
                report.catalog_error = Some(e.to_string());
                return Ok(report);
            }
        };
        report.total = descriptors.len();

        let pending = if options.force {
            descriptors.clone()
        } else {
            ledger.new_items(&descriptors)
        };
        report.already_present = descriptors.len() - pending.len();
        info!(
            "{}: {} tracks, {} new",
            selection.display_name,
            descriptors.len(),
            pending.len()
        );

        if !pending.is_empty() {
            let context = ItemContext::for_playlist(selection.display_name.clone());
            let outcomes = self.orchestrator.run_batch_with(
                &pending,
                options.concurrency_limit,
                &context,
                observer
                    .as_mut()
                    .map(|observe| move |p: &ItemProgress| observe(&selection.id, p)),
            );

            for (descriptor, outcome) in pending.iter().zip(outcomes) {
                match outcome {
                    PipelineOutcome::Success(path) => {
                        ledger.record(LedgerEntry::new(descriptor, path.clone()));
                        report.succeeded.push((descriptor.item_id.clone(), path));
                    }
                    PipelineOutcome::Skipped(reason) => {
                        report.skipped.push((descriptor.item_id.clone(), reason));
                    }
                    PipelineOutcome::Failed { stage, error } => {
                        report.failed.push(ItemFailure {
                            item_id: descriptor.item_id.clone(),
                            stage,
                            reason: error.to_string(),
                        });
                    }
                }
            }
        }

        if self.orchestrator.is_cancelled() {
            info!(
                "Committing {} finished item(s) of cancelled {}",
                report.succeeded.len(),
                selection.id
            );
        } else {
            ledger.mark_playlist_synced(&selection.id, &selection.display_name, descriptors.len());
            report.synced = true;
        }

        if let Err(e) = ledger.save() {
            error!("Failed to persist ledger after {}: {}", selection.id, e);
            return Err(e);
        }
        Ok(report)
    }

    fn remove_empty_staging_root(&self) {
        let fs = self.orchestrator.pipeline().file_system();
        let root = &self.orchestrator.pipeline().settings().staging_root;
        if !fs.is_dir(root) {
            return;
        }
        match fs.read_dir(root) {
            Ok(children) if children.is_empty() => {
                if let Err(e) = fs.remove_dir(root) {
                    debug!("Could not remove staging root {}: {}", root.display(), e);
                }
            }
            Ok(_) => debug!("Staging root {} not empty, leaving it", root.display()),
            Err(e) => debug!("Could not list staging root {}: {}", root.display(), e),
        }
    }
}
