//! Error types for ymd core operations.
//!
//! Errors are grouped by the stage or component that raises them so callers
//! can classify a failure without string matching:
//!
//! - [`DownloadError`] - the fetch stage
//! - [`MetadataError`] - the tag stage
//! - [`OrganizationError`] - the place stage
//! - [`LedgerError`] - loading and persisting the download ledger
//! - [`CatalogError`] - the catalog provider boundary
//! - [`ConfigError`] - configuration validation
//! - [`FileSystemError`] - the filesystem abstraction

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while fetching a remote item.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The remote item cannot be fetched at all (removed, private, region locked).
    #[error("Item {item_id} unavailable: {reason}")]
    Unavailable {
        /// Remote item id.
        item_id: String,
        /// Provider supplied reason.
        reason: String,
    },

    /// The transfer started but did not complete.
    #[error("Fetch failed for {item_id}: {reason}")]
    FetchFailed {
        /// Remote item id.
        item_id: String,
        /// Failure reason.
        reason: String,
    },

    /// The fetch capability reported success but produced no file.
    #[error("Fetch for {item_id} produced no file in {staging_dir}")]
    NoOutput {
        /// Remote item id.
        item_id: String,
        /// Staging directory that was searched.
        staging_dir: PathBuf,
    },

    /// The download was cancelled.
    #[error("Download cancelled")]
    Cancelled,
}

/// Errors raised while writing tags into a staged file.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The staged file is missing.
    #[error("File not found for tagging: {path}")]
    FileNotFound {
        /// Expected file path.
        path: PathBuf,
    },

    /// The container format cannot carry tags.
    #[error("Unsupported format for tagging: {path}")]
    UnsupportedFormat {
        /// File path.
        path: PathBuf,
    },

    /// Existing tags could not be read.
    #[error("Failed to read tags from {path}: {reason}")]
    ReadFailed {
        /// File path.
        path: PathBuf,
        /// Failure reason.
        reason: String,
    },

    /// Tags could not be written back.
    #[error("Failed to write tags to {path}: {reason}")]
    WriteFailed {
        /// File path.
        path: PathBuf,
        /// Failure reason.
        reason: String,
    },
}

/// Errors raised while placing a tagged file into the library.
#[derive(Debug, Error)]
pub enum OrganizationError {
    /// The staged file vanished before it could be placed.
    #[error("Source file not found: {path}")]
    SourceMissing {
        /// Staged file path.
        path: PathBuf,
    },

    /// The destination directory could not be created.
    #[error("Cannot create destination directory {path}: {reason}")]
    CreateDirFailed {
        /// Directory path.
        path: PathBuf,
        /// Failure reason.
        reason: String,
    },

    /// The file could not be moved or copied into place.
    #[error("Failed to move {from} to {to}: {reason}")]
    MoveFailed {
        /// Staged file path.
        from: PathBuf,
        /// Destination path.
        to: PathBuf,
        /// Failure reason.
        reason: String,
    },

    /// Every disambiguated name up to the attempt cap was taken.
    #[error("No free destination for '{stem}' in {dir} after {attempts} attempts")]
    NoFreePath {
        /// Destination directory.
        dir: PathBuf,
        /// Filename stem that kept colliding.
        stem: String,
        /// Number of candidates tried.
        attempts: u32,
    },
}

/// Errors raised by the download ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The store exists but cannot be parsed. Never treated as an empty ledger.
    #[error("Ledger at {path} is corrupt: {reason}")]
    Corrupt {
        /// Store path.
        path: PathBuf,
        /// Parser diagnostic.
        reason: String,
    },

    /// The store exists but could not be read.
    #[error("Failed to read ledger {path}: {reason}")]
    ReadFailed {
        /// Store path.
        path: PathBuf,
        /// Failure reason.
        reason: String,
    },

    /// The store could not be written or atomically replaced.
    #[error("Failed to persist ledger {path}: {reason}")]
    WriteFailed {
        /// Store path.
        path: PathBuf,
        /// Failure reason.
        reason: String,
    },
}

/// Errors raised at the catalog provider boundary.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The playlist does not exist or is not accessible.
    #[error("Playlist not found: {playlist_id}")]
    PlaylistNotFound {
        /// Requested playlist id.
        playlist_id: String,
    },

    /// A provider record could not be turned into a descriptor.
    #[error("Invalid track record: {reason}")]
    InvalidTrack {
        /// Validation failure.
        reason: String,
    },

    /// The provider request itself failed.
    #[error("Catalog request failed: {reason}")]
    RequestFailed {
        /// Failure reason.
        reason: String,
    },
}

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A numeric setting is outside its allowed range.
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        /// Setting name.
        field: &'static str,
        /// Lower bound (inclusive).
        min: usize,
        /// Upper bound (inclusive).
        max: usize,
        /// Rejected value.
        value: usize,
    },

    /// A setting has an invalid value.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Setting name.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse config file {path}: {reason}")]
    ParseFailed {
        /// Config file path.
        path: PathBuf,
        /// Parser diagnostic.
        reason: String,
    },
}

/// Filesystem abstraction errors.
#[derive(Debug, Error)]
pub enum FileSystemError {
    /// Path does not exist.
    #[error("Path not found: {path}")]
    NotFound {
        /// Missing path.
        path: PathBuf,
    },

    /// Path already exists where exclusive creation was requested.
    #[error("Path already exists: {path}")]
    AlreadyExists {
        /// Existing path.
        path: PathBuf,
    },

    /// Read failed.
    #[error("Failed to read {path}: {reason}")]
    ReadFailed {
        /// Path.
        path: PathBuf,
        /// Failure reason.
        reason: String,
    },

    /// Write failed.
    #[error("Failed to write {path}: {reason}")]
    WriteFailed {
        /// Path.
        path: PathBuf,
        /// Failure reason.
        reason: String,
    },

    /// Directory creation failed.
    #[error("Failed to create directory {path}: {reason}")]
    CreateDirFailed {
        /// Path.
        path: PathBuf,
        /// Failure reason.
        reason: String,
    },

    /// Delete failed.
    #[error("Failed to delete {path}: {reason}")]
    DeleteFailed {
        /// Path.
        path: PathBuf,
        /// Failure reason.
        reason: String,
    },

    /// Copy failed.
    #[error("Failed to copy {source_path} to {destination}: {reason}")]
    CopyFailed {
        /// Source path.
        source_path: PathBuf,
        /// Destination path.
        destination: PathBuf,
        /// Failure reason.
        reason: String,
    },

    /// Rename failed.
    #[error("Failed to rename {from} to {to}: {reason}")]
    RenameFailed {
        /// Source path.
        from: PathBuf,
        /// Destination path.
        to: PathBuf,
        /// Failure reason.
        reason: String,
        /// Whether the failure was caused by crossing a storage boundary.
        cross_device: bool,
    },
}

/// Broad error category, for programmatic handling by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Fetch stage failure.
    Download,
    /// Tag stage failure.
    Metadata,
    /// Place stage failure.
    Organization,
    /// Ledger load/save failure.
    Ledger,
    /// Catalog provider failure.
    Catalog,
    /// Configuration failure.
    Configuration,
    /// Filesystem failure outside a pipeline stage.
    FileSystem,
    /// Serialization failure.
    Serialization,
    /// A capability panicked.
    Internal,
}

/// Errors that can occur in ymd core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Fetch stage error.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// Tag stage error.
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// Place stage error.
    #[error(transparent)]
    Organization(#[from] OrganizationError),

    /// Ledger error.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Catalog error.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Filesystem error.
    #[error(transparent)]
    FileSystem(#[from] FileSystemError),

    /// A capability panicked while processing an item.
    #[error("Capability panicked: {0}")]
    Panicked(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Download(_) => ErrorKind::Download,
            Self::Metadata(_) => ErrorKind::Metadata,
            Self::Organization(_) => ErrorKind::Organization,
            Self::Ledger(_) => ErrorKind::Ledger,
            Self::Catalog(_) => ErrorKind::Catalog,
            Self::Config(_) => ErrorKind::Configuration,
            Self::FileSystem(_) | Self::Io(_) => ErrorKind::FileSystem,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Panicked(_) => ErrorKind::Internal,
        }
    }

    /// Whether a later attempt has a reasonable chance of succeeding.
    ///
    /// Only transient fetch and catalog failures qualify. The pipeline never
    /// retries within a run; this is advisory for reporting.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Download(DownloadError::FetchFailed { reason, .. })
            | Self::Catalog(CatalogError::RequestFailed { reason }) => is_transient(reason),
            Self::Download(DownloadError::NoOutput { .. }) => true,
            _ => false,
        }
    }
}

/// Whether a failure message looks like a transient network condition.
fn is_transient(reason: &str) -> bool {
    const PATTERNS: [&str; 9] = [
        "403",
        "429",
        "http error",
        "connection",
        "timeout",
        "timed out",
        "network",
        "temporar",
        "rate limit",
    ];
    let lower = reason.to_lowercase();
    PATTERNS.iter().any(|p| lower.contains(p))
}
