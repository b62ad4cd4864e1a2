//! `ymd` Core Library
//!
//! This crate provides the core of `ymd`, an incremental playlist sync that
//! materializes remote tracks as an organized local library:
//! - Path sanitizing for constrained filesystems
//! - A durable download ledger with atomic saves
//! - A per-item fetch, tag and place pipeline
//! - A bounded-concurrency batch orchestrator
//! - The playlist sync coordinator and a ledger-driven cleanup
//!
//! Fetching, tagging and catalog access are capabilities behind traits in
//! [`provider`]. [`tagger::AudioTagger`] is the concrete tagger; the
//! `youtube` feature adds a `rusty_ytdl` based fetcher.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ymd_core::{AppConfig, DownloadOrchestrator, ItemPipeline, Ledger, SyncCoordinator};
//! use ymd_core::{PlaylistSelection, SyncOptions};
//!
//! let config = AppConfig::load()?;
//! let pipeline = ItemPipeline::from_config(fetcher, &config);
//! let coordinator = SyncCoordinator::new(catalog, DownloadOrchestrator::new(pipeline));
//!
//! let mut ledger = Ledger::load(config.ledger_path())?;
//! let report = coordinator.sync(
//!     &mut ledger,
//!     &[PlaylistSelection::new("PL123", "Favorites")],
//!     &SyncOptions::with_concurrency(config.max_concurrent_downloads),
//! )?;
//! println!("{}", report.summary());
//! ```

pub mod cleanup;
pub mod config;
pub mod error;
pub mod fs;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod provider;
pub mod sanitize;
pub mod sync;
pub mod tagger;
pub mod track;
#[cfg(feature = "youtube")]
pub mod youtube;

pub use cleanup::{
    AUDIO_EXTENSIONS, CleanupOptions, CleanupReport, OrphanReport, find_orphans, is_audio_file,
    remove_stale, scan_library,
};
pub use config::{
    AppConfig, AudioFormat, DEFAULT_MAX_CONCURRENT_DOWNLOADS, DEFAULT_MAX_FILENAME_LENGTH,
    DEFAULT_MAX_SEGMENT_LENGTH, MAX_CONCURRENT_DOWNLOADS, MIN_CONCURRENT_DOWNLOADS, OrganizeBy,
    default_config_path,
};
pub use error::{
    CatalogError, ConfigError, DownloadError, Error, ErrorKind, FileSystemError, LedgerError,
    MetadataError, OrganizationError, Result,
};
pub use fs::{FileSystem, RealFileSystem};
pub use ledger::{LEDGER_VERSION, Ledger, LedgerEntry, PlaylistSyncRecord};
pub use logging::{LogRotation, LoggingConfig, LoggingError, LoggingGuard};
pub use orchestrator::{CANCELLED_REASON, DownloadOrchestrator, ItemProgress};
pub use pipeline::{
    ItemContext, ItemPipeline, ItemState, MAX_DISAMBIGUATION_ATTEMPTS, PipelineOutcome,
    PipelineSettings, PipelineStage,
};
pub use provider::{
    CatalogProvider, CoverArt, FetchedFile, Fetcher, PlaylistSummary, StaticCatalog, Tagger,
};
pub use sanitize::{PLACEHOLDER, SegmentKind, sanitize};
pub use sync::{
    ItemFailure, PlaylistReport, PlaylistSelection, SyncCoordinator, SyncOptions, SyncReport,
};
pub use tagger::AudioTagger;
pub use track::{TrackDescriptor, TrackTags, normalize_track, parse_duration};
#[cfg(feature = "youtube")]
pub use youtube::RustyYtdlFetcher;
