//! Track descriptors and the metadata derived from them.
//!
//! Provider records are loosely typed. They are validated once, here, into
//! a [`TrackDescriptor`]; every later stage works with named fields only.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CatalogError, Result};

/// Title used when the provider supplies none.
pub const UNKNOWN_TITLE: &str = "Unknown Title";

/// Artist used when the provider supplies none.
pub const UNKNOWN_ARTIST: &str = "Unknown Artist";

/// Album used for layouts that need one when the provider supplies none.
pub const UNKNOWN_ALBUM: &str = "Unknown Album";

/// One remote item as reported by the catalog provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackDescriptor {
    /// Stable provider id, unique across the catalog.
    pub item_id: String,
    /// Track title.
    pub title: String,
    /// Artist credit (several artists joined with ", ").
    pub artist: String,
    /// Album name, if known.
    #[serde(default)]
    pub album: Option<String>,
    /// Genre, if known.
    #[serde(default)]
    pub genre: Option<String>,
    /// Playlist this descriptor was listed under.
    pub playlist_id: String,
    /// Duration in seconds, if known.
    #[serde(default)]
    pub duration_secs: Option<u32>,
}

impl TrackDescriptor {
    /// Create a descriptor. Empty titles and artists get placeholders.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidTrack`] if `item_id` is blank.
    pub fn new(
        item_id: impl Into<String>,
        title: impl Into<String>,
        artist: impl Into<String>,
        playlist_id: impl Into<String>,
    ) -> Result<Self> {
        let item_id = item_id.into().trim().to_string();
        if item_id.is_empty() {
            return Err(CatalogError::InvalidTrack {
                reason: "item id is empty".to_string(),
            }
            .into());
        }

        Ok(Self {
            item_id,
            title: non_empty_or(title.into(), UNKNOWN_TITLE),
            artist: non_empty_or(artist.into(), UNKNOWN_ARTIST),
            album: None,
            genre: None,
            playlist_id: playlist_id.into(),
            duration_secs: None,
        })
    }

    /// Set the album. Blank values are ignored.
    #[must_use]
    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = non_blank(album.into());
        self
    }

    /// Set the genre. Blank values are ignored.
    #[must_use]
    pub fn with_genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = non_blank(genre.into());
        self
    }

    /// Set the duration.
    #[must_use]
    pub const fn with_duration(mut self, secs: u32) -> Self {
        self.duration_secs = Some(secs);
        self
    }
}

/// Metadata handed to the tagger for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackTags {
    /// Title.
    pub title: String,
    /// Artist.
    pub artist: String,
    /// Album, if known.
    pub album: Option<String>,
    /// Genre, already defaulted.
    pub genre: String,
}

impl TrackTags {
    /// Tags for `descriptor`, using `default_genre` when it has none.
    #[must_use]
    pub fn from_descriptor(descriptor: &TrackDescriptor, default_genre: &str) -> Self {
        Self {
            title: descriptor.title.clone(),
            artist: descriptor.artist.clone(),
            album: descriptor.album.clone(),
            genre: descriptor
                .genre
                .clone()
                .unwrap_or_else(|| default_genre.to_string()),
        }
    }
}

/// Validate a raw provider record into a descriptor.
///
/// Expects the shape YouTube Music returns for playlist entries:
/// `videoId`, `title`, `artists: [{name}]`, `album: {name}`, optional
/// `category` and a `duration` like `"3:45"`.
///
/// # Errors
///
/// Returns [`CatalogError::InvalidTrack`] when `videoId` is missing or blank.
pub fn normalize_track(raw: &Value, playlist_id: &str) -> Result<TrackDescriptor> {
    let item_id = raw
        .get("videoId")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if item_id.trim().is_empty() {
        let title = raw.get("title").and_then(Value::as_str).unwrap_or("?");
        return Err(CatalogError::InvalidTrack {
            reason: format!("record '{title}' has no videoId"),
        }
        .into());
    }

    let artist = raw
        .get("artists")
        .and_then(Value::as_array)
        .map(|artists| {
            artists
                .iter()
                .filter_map(|a| a.get("name").and_then(Value::as_str))
                .filter(|name| !name.trim().is_empty())
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();

    let title = raw
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut descriptor = TrackDescriptor::new(item_id, title, artist, playlist_id)?;

    if let Some(album) = raw
        .get("album")
        .and_then(|a| a.get("name"))
        .and_then(Value::as_str)
    {
        descriptor = descriptor.with_album(album);
    }
    if let Some(genre) = raw.get("category").and_then(Value::as_str) {
        descriptor = descriptor.with_genre(genre);
    }
    if let Some(secs) = raw
        .get("duration_seconds")
        .and_then(Value::as_u64)
        .and_then(|s| u32::try_from(s).ok())
        .or_else(|| {
            raw.get("duration")
                .and_then(Value::as_str)
                .and_then(parse_duration)
        })
    {
        descriptor = descriptor.with_duration(secs);
    }

    Ok(descriptor)
}

/// Parse `"ss"`, `"m:ss"` or `"h:mm:ss"` into seconds.
#[must_use]
pub fn parse_duration(text: &str) -> Option<u32> {
    let parts: Vec<&str> = text.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    parts.iter().try_fold(0u32, |acc, part| {
        let value: u32 = part.trim().parse().ok()?;
        acc.checked_mul(60)?.checked_add(value)
    })
}

fn non_empty_or(value: String, fallback: &str) -> String {
    non_blank(value).unwrap_or_else(|| fallback.to_string())
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == value.len() {
        Some(value)
    } else {
        Some(trimmed.to_string())
    }
}
