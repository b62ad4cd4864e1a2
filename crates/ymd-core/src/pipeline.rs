//! Per-item pipeline: fetch, tag, place.
//!
//! Each item moves through [`ItemState`]s on a single worker thread. Any
//! stage failure, including a panic inside a capability, is turned into a
//! [`PipelineOutcome::Failed`] value at this boundary so one bad item never
//! takes down the rest of its batch. The ledger is not touched here; the
//! caller commits successes.
//!
//! Items that could collide in the library share a [placement
//! key](ItemPipeline::placement_key). The orchestrator uses it to hold an
//! item's place stage until earlier items with the same key are done, so
//! which one gets " (1)" follows submission order.
//!
//! Every item gets its own staging directory under the staging root, named
//! from a digest of its id, and that directory is removed when the item
//! finishes either way.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, info_span, warn};

use crate::config::{AppConfig, AudioFormat, OrganizeBy};
use crate::error::{DownloadError, Error, FileSystemError, OrganizationError, Result};
use crate::fs::{FileSystem, RealFileSystem};
use crate::provider::{FetchedFile, Fetcher, Tagger};
use crate::sanitize::{self, SegmentKind};
use crate::tagger::AudioTagger;
use crate::track::{TrackDescriptor, TrackTags, UNKNOWN_ALBUM};

/// Highest disambiguator tried before placement gives up.
pub const MAX_DISAMBIGUATION_ATTEMPTS: u32 = 999;

/// Base-name characters that extension and disambiguator truncation may
/// cut: the longest extension, its dot, and " (999)".
const PLACEMENT_KEY_MARGIN: usize = sanitize::MAX_EXTENSION_LENGTH + 7;

/// Directory name used by the playlist layout when no name is known.
pub const UNKNOWN_PLAYLIST: &str = "Unknown Playlist";

/// Stage an item failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    /// Download into staging.
    Fetch,
    /// Metadata write.
    Tag,
    /// Move into the library.
    Place,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch => write!(f, "fetch"),
            Self::Tag => write!(f, "tag"),
            Self::Place => write!(f, "place"),
        }
    }
}

/// Lifecycle of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemState {
    /// Not started.
    Pending,
    /// Fetch in progress.
    Fetching,
    /// Staged file available.
    Fetched,
    /// Tag write in progress.
    Tagging,
    /// Tags written.
    Tagged,
    /// Move in progress.
    Placing,
    /// In the library. Terminal.
    Placed,
    /// Failed at a stage. Terminal.
    Failed(PipelineStage),
}

impl ItemState {
    /// Whether no further transitions follow.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Placed | Self::Failed(_))
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Fetching => write!(f, "fetching"),
            Self::Fetched => write!(f, "fetched"),
            Self::Tagging => write!(f, "tagging"),
            Self::Tagged => write!(f, "tagged"),
            Self::Placing => write!(f, "placing"),
            Self::Placed => write!(f, "placed"),
            Self::Failed(stage) => write!(f, "failed at {stage}"),
        }
    }
}

/// Result of running one item.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// Placed at this path.
    Success(PathBuf),
    /// Not attempted.
    Skipped(String),
    /// Failed at `stage`.
    Failed {
        /// Stage that failed.
        stage: PipelineStage,
        /// Cause.
        error: Error,
    },
}

impl PipelineOutcome {
    /// Whether the item was placed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Placed path, for successes.
    #[must_use]
    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Self::Success(path) => Some(path),
            _ => None,
        }
    }

    /// Stage and error, for failures.
    #[must_use]
    pub const fn failure(&self) -> Option<(PipelineStage, &Error)> {
        match self {
            Self::Failed { stage, error } => Some((*stage, error)),
            _ => None,
        }
    }

    fn failed(stage: PipelineStage, error: Error) -> Self {
        Self::Failed { stage, error }
    }
}

/// Settings the pipeline needs from [`AppConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Library root.
    pub download_dir: PathBuf,
    /// Parent of the per-item staging directories.
    pub staging_root: PathBuf,
    /// Directory layout.
    pub organize_by: OrganizeBy,
    /// Preferred rendition.
    pub preferred_format: AudioFormat,
    /// Fallback rendition.
    pub fallback_format: AudioFormat,
    /// Filename bound, extension included.
    pub max_filename_length: usize,
    /// Directory segment bound.
    pub max_segment_length: usize,
    /// Genre used when a descriptor has none.
    pub default_genre: String,
}

impl From<&AppConfig> for PipelineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            download_dir: config.download_dir.clone(),
            staging_root: config.staging_dir(),
            organize_by: config.organize_by,
            preferred_format: config.audio_format,
            fallback_format: config.fallback_format,
            max_filename_length: config.max_filename_length,
            max_segment_length: config.max_segment_length,
            default_genre: config.default_genre.clone(),
        }
    }
}

/// Per-batch context shared by every item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemContext {
    /// Display name of the playlist being synced, for the playlist layout.
    pub playlist_name: Option<String>,
}

impl ItemContext {
    /// Context for a named playlist.
    #[must_use]
    pub fn for_playlist(name: impl Into<String>) -> Self {
        Self {
            playlist_name: Some(name.into()),
        }
    }
}

/// Runs fetch, tag and place for single items.
#[derive(Clone)]
pub struct ItemPipeline {
    fetcher: Arc<dyn Fetcher>,
    tagger: Arc<dyn Tagger>,
    fs: Arc<dyn FileSystem>,
    settings: PipelineSettings,
}

impl fmt::Debug for ItemPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemPipeline")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ItemPipeline {
    /// Create a pipeline over the given capabilities.
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        tagger: Arc<dyn Tagger>,
        fs: Arc<dyn FileSystem>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            fetcher,
            tagger,
            fs,
            settings,
        }
    }

    /// Pipeline over the real file system and [`AudioTagger`], configured
    /// from `config`.
    pub fn from_config(fetcher: Arc<dyn Fetcher>, config: &AppConfig) -> Self {
        Self::new(
            fetcher,
            Arc::new(AudioTagger::new()),
            Arc::new(RealFileSystem::new()),
            PipelineSettings::from(config),
        )
    }

    /// Pipeline settings.
    #[must_use]
    pub const fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// File system used for placement.
    #[must_use]
    pub fn file_system(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Run one item to a terminal state.
    pub fn run(&self, descriptor: &TrackDescriptor, context: &ItemContext) -> PipelineOutcome {
        self.run_observed(descriptor, context, &|_| {})
    }

    /// Run one item, reporting every state change to `observe`.
    pub fn run_observed(
        &self,
        descriptor: &TrackDescriptor,
        context: &ItemContext,
        observe: &dyn Fn(ItemState),
    ) -> PipelineOutcome {
        self.run_gated(descriptor, context, observe, &|| {})
    }

    /// Run one item, calling `before_place` once tagging succeeded and
    /// before the place stage starts. The call may block.
    pub fn run_gated(
        &self,
        descriptor: &TrackDescriptor,
        context: &ItemContext,
        observe: &dyn Fn(ItemState),
        before_place: &dyn Fn(),
    ) -> PipelineOutcome {
        let span = info_span!("item", item_id = %descriptor.item_id);
        let _enter = span.enter();

        let staging_dir = self.staging_dir_for(&descriptor.item_id);
        let transition = |state: ItemState| {
            debug!("{} -> {}", descriptor.item_id, state);
            observe(state);
        };

        let outcome = self.run_stages(descriptor, context, &staging_dir, &transition, before_place);

        match &outcome {
            PipelineOutcome::Success(path) => {
                info!("Placed {} at {}", descriptor.item_id, path.display());
            }
            PipelineOutcome::Failed { stage, error } => {
                warn!("{} failed at {}: {}", descriptor.item_id, stage, error);
                transition(ItemState::Failed(*stage));
            }
            PipelineOutcome::Skipped(_) => {}
        }

        self.remove_staging(&staging_dir);
        outcome
    }

    /// Staging directory for an item: the first 16 hex digits of SHA-256(id).
    #[must_use]
    pub fn staging_dir_for(&self, item_id: &str) -> PathBuf {
        let digest = Sha256::digest(item_id.as_bytes());
        let name: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
        self.settings.staging_root.join(name)
    }

    /// Library directory an item is placed in.
    #[must_use]
    pub fn destination_dir(&self, descriptor: &TrackDescriptor, context: &ItemContext) -> PathBuf {
        let max = self.settings.max_segment_length;
        let segment = |raw: &str| sanitize::sanitize(raw, SegmentKind::Segment, max);
        let root = &self.settings.download_dir;

        match self.settings.organize_by {
            OrganizeBy::GenreArtist => {
                let genre = descriptor
                    .genre
                    .as_deref()
                    .unwrap_or(&self.settings.default_genre);
                root.join(segment(genre)).join(segment(&descriptor.artist))
            }
            OrganizeBy::ArtistAlbum => {
                let album = descriptor.album.as_deref().unwrap_or(UNKNOWN_ALBUM);
                root.join(segment(&descriptor.artist)).join(segment(album))
            }
            OrganizeBy::Playlist => {
                let name = context.playlist_name.as_deref().unwrap_or(UNKNOWN_PLAYLIST);
                root.join(segment(name))
            }
        }
    }

    /// Base filename, `Artist - Title.ext`, before any disambiguation.
    #[must_use]
    pub fn destination_filename(&self, descriptor: &TrackDescriptor, staged: &Path) -> String {
        let max = self.settings.max_filename_length;
        let artist = sanitize::sanitize(
            &descriptor.artist,
            SegmentKind::Segment,
            self.settings.max_segment_length,
        );
        let title = sanitize::sanitize(&descriptor.title, SegmentKind::Segment, max);
        let base = format!("{artist} - {title}");

        match staged_extension(staged) {
            Some(ext) => sanitize::sanitize(&format!("{base}.{ext}"), SegmentKind::Filename, max),
            None => sanitize::sanitize(&base, SegmentKind::Segment, max),
        }
    }

    /// Key shared by every item that could be placed at the same path.
    ///
    /// Made of the destination directory and a case-folded prefix of the
    /// base name that no extension or disambiguator truncation reaches, so
    /// items with different keys never compete for a path. Equal keys do
    /// not imply a collision.
    #[must_use]
    pub fn placement_key(&self, descriptor: &TrackDescriptor, context: &ItemContext) -> String {
        let base = self.destination_filename(descriptor, Path::new(""));
        let keep = self
            .settings
            .max_filename_length
            .saturating_sub(PLACEMENT_KEY_MARGIN)
            .max(1);
        let prefix: String = sanitize::without_disambiguator(&base)
            .chars()
            .take(keep)
            .collect();

        self.destination_dir(descriptor, context)
            .join(prefix.trim_end_matches(['.', ' ']))
            .to_string_lossy()
            .to_lowercase()
    }

    fn run_stages(
        &self,
        descriptor: &TrackDescriptor,
        context: &ItemContext,
        staging_dir: &Path,
        transition: &dyn Fn(ItemState),
        before_place: &dyn Fn(),
    ) -> PipelineOutcome {
        transition(ItemState::Fetching);
        let fetched = match self.fetch(descriptor, staging_dir) {
            Ok(fetched) => fetched,
            Err(e) => return PipelineOutcome::failed(PipelineStage::Fetch, e),
        };
        transition(ItemState::Fetched);

        transition(ItemState::Tagging);
        let tags = TrackTags::from_descriptor(descriptor, &self.settings.default_genre);
        let staged = fetched.path;
        let cover_art = fetched.cover_art;
        if let Err(e) = guarded(|| self.tagger.apply_metadata(&staged, &tags, cover_art)) {
            return PipelineOutcome::failed(PipelineStage::Tag, e);
        }
        transition(ItemState::Tagged);

        before_place();
        transition(ItemState::Placing);
        match guarded(|| self.place(descriptor, context, &staged)) {
            Ok(path) => {
                transition(ItemState::Placed);
                PipelineOutcome::Success(path)
            }
            Err(e) => PipelineOutcome::failed(PipelineStage::Place, e),
        }
    }

    fn fetch(
        &self,
        descriptor: &TrackDescriptor,
        staging_dir: &Path,
    ) -> Result<FetchedFile> {
        self.fs.create_dir_all(staging_dir)?;

        let fetched = guarded(|| {
            self.fetcher.fetch(
                &descriptor.item_id,
                staging_dir,
                self.settings.preferred_format,
                self.settings.fallback_format,
            )
        })?;

        if !self.fs.is_file(&fetched.path) {
            return Err(DownloadError::NoOutput {
                item_id: descriptor.item_id.clone(),
                staging_dir: staging_dir.to_path_buf(),
            }
            .into());
        }
        Ok(fetched)
    }

    fn place(
        &self,
        descriptor: &TrackDescriptor,
        context: &ItemContext,
        staged: &Path,
    ) -> Result<PathBuf> {
        if !self.fs.is_file(staged) {
            return Err(OrganizationError::SourceMissing {
                path: staged.to_path_buf(),
            }
            .into());
        }

        let dir = self.destination_dir(descriptor, context);
        self.fs.create_dir_all(&dir).map_err(|e| OrganizationError::CreateDirFailed {
            path: dir.clone(),
            reason: e.to_string(),
        })?;

        let filename = self.destination_filename(descriptor, staged);
        let destination = self.reserve(&dir, &filename, staged)?;
        if destination == staged {
            return Ok(destination);
        }

        if let Err(e) = self.move_into_place(staged, &destination) {
            if let Err(cleanup) = self.fs.remove_file(&destination) {
                warn!("Could not release {}: {}", destination.display(), cleanup);
            }
            return Err(e);
        }
        Ok(destination)
    }

    /// Claim a free path in `dir`, adding " (n)" to the stem on collision.
    fn reserve(&self, dir: &Path, filename: &str, staged: &Path) -> Result<PathBuf> {
        let max = self.settings.max_filename_length;

        for attempt in 0..=MAX_DISAMBIGUATION_ATTEMPTS {
            let candidate = if attempt == 0 {
                dir.join(filename)
            } else {
                dir.join(sanitize::with_disambiguator(filename, attempt, max))
            };

            if candidate == staged {
                return Ok(candidate);
            }

            match self.fs.create_new(&candidate) {
                Ok(()) => {
                    if attempt > 0 {
                        debug!("Collision on {}, using {}", filename, candidate.display());
                    }
                    return Ok(candidate);
                }
                Err(Error::FileSystem(FileSystemError::AlreadyExists { .. })) => {}
                Err(e) => {
                    return Err(OrganizationError::MoveFailed {
                        from: staged.to_path_buf(),
                        to: candidate,
                        reason: e.to_string(),
                    }
                    .into());
                }
            }
        }

        Err(OrganizationError::NoFreePath {
            dir: dir.to_path_buf(),
            stem: filename.to_string(),
            attempts: MAX_DISAMBIGUATION_ATTEMPTS,
        }
        .into())
    }

    /// Rename over the reserved placeholder, copying across devices.
    fn move_into_place(&self, staged: &Path, destination: &Path) -> Result<()> {
        let move_failed = |e: &Error| OrganizationError::MoveFailed {
            from: staged.to_path_buf(),
            to: destination.to_path_buf(),
            reason: e.to_string(),
        };

        match self.fs.rename(staged, destination) {
            Ok(()) => Ok(()),
            Err(Error::FileSystem(FileSystemError::RenameFailed {
                cross_device: true,
                ..
            })) => {
                debug!(
                    "{} is on another device, copying instead",
                    destination.display()
                );
                self.fs
                    .copy(staged, destination)
                    .map_err(|e| move_failed(&e))?;
                if let Err(e) = self.fs.remove_file(staged) {
                    warn!("Copied but could not remove {}: {}", staged.display(), e);
                }
                Ok(())
            }
            Err(e) => Err(move_failed(&e).into()),
        }
    }

    fn remove_staging(&self, staging_dir: &Path) {
        if self.fs.exists(staging_dir)
            && let Err(e) = self.fs.remove_dir_all(staging_dir)
        {
            warn!("Could not remove staging dir {}: {}", staging_dir.display(), e);
        }
    }
}

/// Run a capability call, turning a panic into [`Error::Panicked`].
fn guarded<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(Error::Panicked(message))
    })
}

/// Lowercase extension of a staged file, if it is a plausible one.
fn staged_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .filter(|e| {
            !e.is_empty()
                && e.len() <= sanitize::MAX_EXTENSION_LENGTH
                && e.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .map(str::to_ascii_lowercase)
}
