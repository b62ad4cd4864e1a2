//! Capability traits consumed by the pipeline and the sync coordinator.
//!
//! The concrete codecs and the remote catalog live behind these traits:
//!
//! - [`Fetcher`] - pulls one item into a staging directory
//! - [`Tagger`] - writes metadata into a staged file
//! - [`CatalogProvider`] - lists playlists and their tracks
//!
//! [`StaticCatalog`] is an in-memory provider for offline runs and tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AudioFormat;
use crate::error::{CatalogError, Result};
use crate::track::{TrackDescriptor, TrackTags};

/// Embedded artwork returned alongside a fetched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverArt {
    /// Raw image bytes.
    pub data: Vec<u8>,
    /// MIME type, e.g. `image/jpeg`.
    pub mime_type: String,
}

/// Output of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    /// Staged audio file.
    pub path: PathBuf,
    /// Artwork, if the provider offered one.
    pub cover_art: Option<CoverArt>,
}

impl FetchedFile {
    /// A fetched file without artwork.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cover_art: None,
        }
    }

    /// Attach artwork.
    #[must_use]
    pub fn with_cover_art(mut self, cover_art: CoverArt) -> Self {
        self.cover_art = Some(cover_art);
        self
    }
}

/// Fetch capability.
///
/// Each call is treated as atomic. Any retries happen inside the
/// implementation and are invisible to the caller.
#[cfg_attr(test, mockall::automock)]
pub trait Fetcher: Send + Sync {
    /// Download `item_id` into `staging_dir`, trying `preferred` first and
    /// `fallback` when the preferred rendition is not offered.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::DownloadError`] when nothing usable was fetched.
    fn fetch(
        &self,
        item_id: &str,
        staging_dir: &Path,
        preferred: AudioFormat,
        fallback: AudioFormat,
    ) -> Result<FetchedFile>;
}

/// Metadata transform capability.
#[cfg_attr(test, mockall::automock)]
pub trait Tagger: Send + Sync {
    /// Write `tags` (and `cover_art`, where the format allows) into `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::MetadataError`] when tags cannot be written.
    fn apply_metadata(
        &self,
        path: &Path,
        tags: &TrackTags,
        cover_art: Option<CoverArt>,
    ) -> Result<()>;
}

/// A playlist as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistSummary {
    /// Provider playlist id.
    pub id: String,
    /// Display name.
    pub title: String,
    /// Number of tracks the provider reports.
    pub track_count: usize,
}

/// Remote catalog capability.
#[cfg_attr(test, mockall::automock)]
pub trait CatalogProvider: Send + Sync {
    /// Playlists available to the user.
    fn list_playlists(&self) -> Result<Vec<PlaylistSummary>>;

    /// Current tracks of a playlist, in provider order.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::PlaylistNotFound`] for unknown ids.
    fn list_tracks(&self, playlist_id: &str) -> Result<Vec<TrackDescriptor>>;

    /// Tracks matching a free-text query.
    fn search(&self, query: &str) -> Result<Vec<TrackDescriptor>>;
}

/// In-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    playlists: Vec<(PlaylistSummary, Vec<TrackDescriptor>)>,
}

impl StaticCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a playlist.
    #[must_use]
    pub fn with_playlist(
        mut self,
        id: impl Into<String>,
        title: impl Into<String>,
        tracks: Vec<TrackDescriptor>,
    ) -> Self {
        self.insert_playlist(id, title, tracks);
        self
    }

    /// Add or replace a playlist in place.
    pub fn insert_playlist(
        &mut self,
        id: impl Into<String>,
        title: impl Into<String>,
        tracks: Vec<TrackDescriptor>,
    ) {
        let summary = PlaylistSummary {
            id: id.into(),
            title: title.into(),
            track_count: tracks.len(),
        };
        if let Some(slot) = self.playlists.iter_mut().find(|(s, _)| s.id == summary.id) {
            *slot = (summary, tracks);
        } else {
            self.playlists.push((summary, tracks));
        }
    }
}

impl CatalogProvider for StaticCatalog {
    fn list_playlists(&self) -> Result<Vec<PlaylistSummary>> {
        Ok(self.playlists.iter().map(|(s, _)| s.clone()).collect())
    }

    fn list_tracks(&self, playlist_id: &str) -> Result<Vec<TrackDescriptor>> {
        self.playlists
            .iter()
            .find(|(s, _)| s.id == playlist_id)
            .map(|(_, tracks)| tracks.clone())
            .ok_or_else(|| {
                CatalogError::PlaylistNotFound {
                    playlist_id: playlist_id.to_string(),
                }
                .into()
            })
    }

    fn search(&self, query: &str) -> Result<Vec<TrackDescriptor>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        let matches: Vec<TrackDescriptor> = self
            .playlists
            .iter()
            .flat_map(|(_, tracks)| tracks)
            .filter(|t| {
                t.title.to_lowercase().contains(&needle)
                    || t.artist.to_lowercase().contains(&needle)
                    || t.album
                        .as_deref()
                        .is_some_and(|a| a.to_lowercase().contains(&needle))
            })
            .filter(|t| seen.insert(t.item_id.clone()))
            .cloned()
            .collect();

        debug!("Search '{}' matched {} tracks", query, matches.len());
        Ok(matches)
    }
}
