//! Application configuration management.
//!
//! Handles loading, saving, and validating the settings that drive a sync
//! run: where the library lives, which formats to request, how files are
//! organized and how hard the storage device limits filenames.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ConfigError, Error, FileSystemError, Result};

/// Default maximum filename length (characters, extension included).
pub const DEFAULT_MAX_FILENAME_LENGTH: usize = 120;

/// Default maximum directory segment length (characters).
pub const DEFAULT_MAX_SEGMENT_LENGTH: usize = 80;

/// Default number of items processed in parallel.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

/// Minimum allowed concurrent downloads.
pub const MIN_CONCURRENT_DOWNLOADS: usize = 1;

/// Maximum allowed concurrent downloads.
pub const MAX_CONCURRENT_DOWNLOADS: usize = 16;

/// Default ledger file name inside the download directory.
pub const DEFAULT_LEDGER_FILE_NAME: &str = ".sync_state.json";

/// Default staging directory name inside the download directory.
pub const DEFAULT_STAGING_DIR_NAME: &str = ".tmp";

/// Audio rendition requested from the fetch capability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Best rendition the provider offers, whatever the container.
    #[default]
    Best,
    /// MP3.
    Mp3,
    /// AAC in an MP4 container.
    M4a,
    /// Opus.
    Opus,
}

impl AudioFormat {
    /// File extension associated with this format, if fixed.
    #[must_use]
    pub const fn extension(self) -> Option<&'static str> {
        match self {
            Self::Best => None,
            Self::Mp3 => Some("mp3"),
            Self::M4a => Some("m4a"),
            Self::Opus => Some("opus"),
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Best => write!(f, "best"),
            Self::Mp3 => write!(f, "mp3"),
            Self::M4a => write!(f, "m4a"),
            Self::Opus => write!(f, "opus"),
        }
    }
}

/// Directory layout used when placing files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrganizeBy {
    /// `<genre>/<artist>/`
    #[default]
    GenreArtist,
    /// `<artist>/<album>/`
    ArtistAlbum,
    /// `<playlist name>/`
    Playlist,
}

impl std::fmt::Display for OrganizeBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GenreArtist => write!(f, "genre_artist"),
            Self::ArtistAlbum => write!(f, "artist_album"),
            Self::Playlist => write!(f, "playlist"),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    /// Library root where organized files are placed.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Preferred audio rendition.
    #[serde(default)]
    pub audio_format: AudioFormat,
    /// Rendition requested when the preferred one is not offered.
    #[serde(default = "default_fallback_format")]
    pub fallback_format: AudioFormat,
    /// Directory layout.
    #[serde(default)]
    pub organize_by: OrganizeBy,
    /// Maximum filename length, extension included.
    #[serde(default = "default_max_filename_length")]
    pub max_filename_length: usize,
    /// Maximum length of each directory segment.
    #[serde(default = "default_max_segment_length")]
    pub max_segment_length: usize,
    /// Worker pool size for a playlist batch.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,
    /// Genre written and used for layout when the provider supplies none.
    #[serde(default = "default_genre")]
    pub default_genre: String,
    /// Ledger file name inside `download_dir`.
    #[serde(default = "default_ledger_file_name")]
    pub ledger_file_name: String,
    /// Staging directory name inside `download_dir`.
    #[serde(default = "default_staging_dir_name")]
    pub staging_dir_name: String,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

const fn default_fallback_format() -> AudioFormat {
    AudioFormat::Mp3
}

const fn default_max_filename_length() -> usize {
    DEFAULT_MAX_FILENAME_LENGTH
}

const fn default_max_segment_length() -> usize {
    DEFAULT_MAX_SEGMENT_LENGTH
}

const fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_DOWNLOADS
}

fn default_genre() -> String {
    "Unknown".to_string()
}

fn default_ledger_file_name() -> String {
    DEFAULT_LEDGER_FILE_NAME.to_string()
}

fn default_staging_dir_name() -> String {
    DEFAULT_STAGING_DIR_NAME.to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            audio_format: AudioFormat::default(),
            fallback_format: default_fallback_format(),
            organize_by: OrganizeBy::default(),
            max_filename_length: DEFAULT_MAX_FILENAME_LENGTH,
            max_segment_length: DEFAULT_MAX_SEGMENT_LENGTH,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            default_genre: default_genre(),
            ledger_file_name: default_ledger_file_name(),
            staging_dir_name: default_staging_dir_name(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location, or defaults if absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&default_config_path())
    }

    /// Load configuration from `path`.
    ///
    /// A missing file yields the defaults. A present file is parsed and
    /// validated; unknown fields are ignored.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            Error::FileSystem(FileSystemError::ReadFailed {
                path: path.to_path_buf(),
                reason: format!("Failed to read config file: {e}"),
            })
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate()?;

        info!("Loaded config from {}", path.display());
        debug!("Download directory: {}", config.download_dir.display());
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&default_config_path())
    }

    /// Save configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| {
                Error::FileSystem(FileSystemError::CreateDirFailed {
                    path: parent.to_path_buf(),
                    reason: format!("Failed to create config directory: {e}"),
                })
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content + "\n").map_err(|e| {
            Error::FileSystem(FileSystemError::WriteFailed {
                path: path.to_path_buf(),
                reason: format!("Failed to write config file: {e}"),
            })
        })?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Check every setting against its allowed range.
    pub fn validate(&self) -> Result<()> {
        check_range("max_filename_length", self.max_filename_length, 16, 255)?;
        check_range("max_segment_length", self.max_segment_length, 8, 255)?;
        check_range(
            "max_concurrent_downloads",
            self.max_concurrent_downloads,
            MIN_CONCURRENT_DOWNLOADS,
            MAX_CONCURRENT_DOWNLOADS,
        )?;

        if self.default_genre.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "default_genre",
                reason: "must not be empty".to_string(),
            }
            .into());
        }

        check_plain_name("ledger_file_name", &self.ledger_file_name)?;
        check_plain_name("staging_dir_name", &self.staging_dir_name)?;

        if self.ledger_file_name == self.staging_dir_name {
            return Err(ConfigError::InvalidValue {
                field: "staging_dir_name",
                reason: "must differ from ledger_file_name".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Path of the ledger store.
    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.download_dir.join(&self.ledger_file_name)
    }

    /// Root of the per-item staging directories.
    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.download_dir.join(&self.staging_dir_name)
    }
}

fn check_range(field: &'static str, value: usize, min: usize, max: usize) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            min,
            max,
            value,
        }
        .into())
    }
}

fn check_plain_name(field: &'static str, name: &str) -> Result<()> {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && Path::new(name).components().count() == 1;

    if plain {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field,
            reason: format!("'{name}' must be a plain file name"),
        }
        .into())
    }
}

/// Default path of the config file.
#[must_use]
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("ymd")
        .join("config.json")
}
