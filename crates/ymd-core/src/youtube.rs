//! `YouTube` fetcher built on `rusty_ytdl`.
//!
//! The pipeline calls [`Fetcher::fetch`] from plain worker threads, so the
//! async `rusty_ytdl` API is driven through a runtime owned by the fetcher,
//! or through the caller's runtime when one is already active.
//!
//! Rendition choice: audio-only streams in the preferred container, then
//! the fallback container, then the combined video+audio stream when the
//! video offers no audio-only rendition at all. `rusty_ytdl` does not hand
//! out thumbnail bytes, so no cover art is attached.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusty_ytdl::{Video, VideoOptions, VideoQuality, VideoSearchOptions};
use tracing::{debug, info};

use crate::config::AudioFormat;
use crate::error::{DownloadError, Error, Result};
use crate::provider::{FetchedFile, Fetcher};

const WATCH_URL: &str = "https://www.youtube.com/watch?v=";

/// MIME essence of an MP4 audio stream.
const MP4_AUDIO: &str = "audio/mp4";
/// MIME essence of a WebM (Opus) audio stream.
const WEBM_AUDIO: &str = "audio/webm";

/// A stream the video offers, reduced to what rendition choice needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedFormat {
    /// MIME essence, e.g. `audio/mp4`.
    pub essence: String,
    /// Stream carries audio.
    pub has_audio: bool,
    /// Stream carries video.
    pub has_video: bool,
}

/// What to stream and how to name it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendition {
    /// Audio-only stream with the given MIME essence.
    AudioOnly {
        /// MIME essence to filter on.
        essence: String,
        /// File extension for the staged file.
        extension: &'static str,
    },
    /// Combined video+audio stream, staged as MP4.
    Combined,
}

impl Rendition {
    /// Extension of the staged file.
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::AudioOnly { extension, .. } => *extension,
            Self::Combined => "mp4",
        }
    }
}

fn extension_for(essence: &str) -> &'static str {
    match essence {
        MP4_AUDIO => "m4a",
        WEBM_AUDIO => "webm",
        "audio/mpeg" => "mp3",
        _ => "bin",
    }
}

fn essence_for(format: AudioFormat) -> Option<&'static str> {
    match format {
        AudioFormat::Best => None,
        AudioFormat::M4a => Some(MP4_AUDIO),
        AudioFormat::Opus => Some(WEBM_AUDIO),
        AudioFormat::Mp3 => Some("audio/mpeg"),
    }
}

/// Pick a rendition among `offered`.
///
/// `Best` takes MP4 audio when offered (it can be tagged in place) and any
/// other audio-only stream otherwise. Returns `None` when audio-only
/// streams exist but match neither format.
#[must_use]
pub fn choose_rendition(
    offered: &[OfferedFormat],
    preferred: AudioFormat,
    fallback: AudioFormat,
) -> Option<Rendition> {
    let audio_only: Vec<&str> = offered
        .iter()
        .filter(|f| f.has_audio && !f.has_video)
        .map(|f| f.essence.as_str())
        .collect();

    if audio_only.is_empty() {
        return offered
            .iter()
            .any(|f| f.has_audio && f.has_video)
            .then_some(Rendition::Combined);
    }

    [preferred, fallback].into_iter().find_map(|format| {
        let essence = match essence_for(format) {
            Some(wanted) => audio_only.iter().copied().find(|e| *e == wanted)?,
            None => audio_only
                .iter()
                .copied()
                .find(|e| *e == MP4_AUDIO)
                .or_else(|| audio_only.first().copied())?,
        };
        Some(Rendition::AudioOnly {
            essence: essence.to_string(),
            extension: extension_for(essence),
        })
    })
}

/// [`Fetcher`] streaming `YouTube` audio with `rusty_ytdl`.
#[derive(Debug)]
pub struct RustyYtdlFetcher {
    runtime: tokio::runtime::Runtime,
}

impl RustyYtdlFetcher {
    /// Create a fetcher with its own multi-threaded runtime.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the runtime cannot be built.
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        Ok(Self { runtime })
    }

    async fn fetch_async(
        item_id: &str,
        staging_dir: &Path,
        preferred: AudioFormat,
        fallback: AudioFormat,
    ) -> Result<FetchedFile> {
        let url = format!("{WATCH_URL}{item_id}");
        let unavailable = |reason: String| {
            Error::Download(DownloadError::Unavailable {
                item_id: item_id.to_string(),
                reason,
            })
        };
        let failed = |reason: String| {
            Error::Download(DownloadError::FetchFailed {
                item_id: item_id.to_string(),
                reason,
            })
        };

        let info = Video::new(&url)
            .map_err(|e| unavailable(format!("invalid video: {e}")))?
            .get_info()
            .await
            .map_err(|e| unavailable(format!("failed to get video info: {e}")))?;

        let offered: Vec<OfferedFormat> = info
            .formats
            .iter()
            .map(|f| OfferedFormat {
                essence: f.mime_type.mime.essence_str().to_string(),
                has_audio: f.has_audio,
                has_video: f.has_video,
            })
            .collect();
        debug!("{} offers {} formats", item_id, offered.len());

        let rendition = choose_rendition(&offered, preferred, fallback).ok_or_else(|| {
            unavailable(format!("no {preferred} or {fallback} rendition offered"))
        })?;

        let options = match &rendition {
            Rendition::AudioOnly { essence, .. } => {
                let essence = essence.clone();
                VideoOptions {
                    quality: VideoQuality::Highest,
                    filter: VideoSearchOptions::Custom(Arc::new(move |f| {
                        f.has_audio && !f.has_video && f.mime_type.mime.essence_str() == essence
                    })),
                    ..Default::default()
                }
            }
            Rendition::Combined => VideoOptions {
                quality: VideoQuality::Lowest,
                filter: VideoSearchOptions::VideoAudio,
                ..Default::default()
            },
        };

        let video = Video::new_with_options(&url, options)
            .map_err(|e| unavailable(format!("invalid video: {e}")))?;
        let stream = video
            .stream()
            .await
            .map_err(|e| failed(format!("failed to open stream: {e}")))?;

        let output_path: PathBuf = staging_dir.join(format!("{item_id}.{}", rendition.extension()));
        let mut file = std::fs::File::create(&output_path)?;

        let mut total_bytes = 0u64;
        while let Some(chunk) = stream
            .chunk()
            .await
            .map_err(|e| failed(format!("failed to download chunk: {e}")))?
        {
            total_bytes += chunk.len() as u64;
            file.write_all(&chunk)?;
        }
        file.sync_all()?;

        info!(
            "Fetched {} bytes for {} -> {}",
            total_bytes,
            item_id,
            output_path.display()
        );
        Ok(FetchedFile::new(output_path))
    }
}

impl Fetcher for RustyYtdlFetcher {
    fn fetch(
        &self,
        item_id: &str,
        staging_dir: &Path,
        preferred: AudioFormat,
        fallback: AudioFormat,
    ) -> Result<FetchedFile> {
        let work = Self::fetch_async(item_id, staging_dir, preferred, fallback);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => tokio::task::block_in_place(|| handle.block_on(work)),
            Err(_) => self.runtime.block_on(work),
        }
    }
}
