//! Structured logging for sync runs.
//!
//! Console output is human readable and filtered by `RUST_LOG` when set.
//! File output is JSON, rotated by [`tracing_appender`] and optional, so
//! that short-lived tools can log to the console only.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Crate targets that get their own filter directives.
const OWN_TARGETS: [&str; 2] = ["ymd", "ymd_core"];

/// Logging configuration options.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Directory for rotated JSON log files. `None` disables file output.
    pub log_directory: Option<PathBuf>,
    /// Log file name prefix (`"ymd"` -> `ymd.2026-01-15`).
    pub log_file_prefix: String,
    /// Maximum level for our own targets on the console.
    pub console_level: Level,
    /// Maximum level for our own targets in the log file.
    pub file_level: Level,
    /// How often to rotate log files.
    pub rotation: LogRotation,
    /// Emit ANSI colors on the console.
    pub console_ansi: bool,
    /// Include file and line on the console.
    pub include_file_line: bool,
    /// Include the target module on the console.
    pub include_target: bool,
    /// Log span open/close events (one span per item and per playlist).
    pub log_span_events: bool,
}

/// Log rotation frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    /// Every minute.
    Minutely,
    /// Every hour.
    Hourly,
    /// Every day.
    Daily,
    /// Single file.
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Minutely => Self::MINUTELY,
            LogRotation::Hourly => Self::HOURLY,
            LogRotation::Daily => Self::DAILY,
            LogRotation::Never => Self::NEVER,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::production()
    }
}

impl LoggingConfig {
    /// Verbose configuration with span events and hourly rotation.
    #[must_use]
    pub fn development() -> Self {
        Self {
            log_directory: Some(default_log_directory()),
            log_file_prefix: "ymd".to_string(),
            console_level: Level::DEBUG,
            file_level: Level::TRACE,
            rotation: LogRotation::Hourly,
            console_ansi: true,
            include_file_line: true,
            include_target: true,
            log_span_events: true,
        }
    }

    /// Quiet console, daily JSON files.
    #[must_use]
    pub fn production() -> Self {
        Self {
            log_directory: Some(default_log_directory()),
            log_file_prefix: "ymd".to_string(),
            console_level: Level::INFO,
            file_level: Level::DEBUG,
            rotation: LogRotation::Daily,
            console_ansi: true,
            include_file_line: false,
            include_target: false,
            log_span_events: false,
        }
    }

    /// Console only, no files written.
    #[must_use]
    pub fn console_only() -> Self {
        Self {
            log_directory: None,
            ..Self::production()
        }
    }

    /// Development config in debug builds, production config otherwise.
    #[must_use]
    pub fn auto() -> Self {
        if cfg!(debug_assertions) {
            Self::development()
        } else {
            Self::production()
        }
    }

    /// Set the log directory (enables file output).
    #[must_use]
    pub fn with_log_directory(mut self, path: PathBuf) -> Self {
        self.log_directory = Some(path);
        self
    }

    /// Set the log file prefix.
    #[must_use]
    pub fn with_log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.log_file_prefix = prefix.into();
        self
    }

    /// Set the console level.
    #[must_use]
    pub const fn with_console_level(mut self, level: Level) -> Self {
        self.console_level = level;
        self
    }

    /// Set the file level.
    #[must_use]
    pub const fn with_file_level(mut self, level: Level) -> Self {
        self.file_level = level;
        self
    }

    /// Set the rotation frequency.
    #[must_use]
    pub const fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }
}

/// Keeps the non-blocking file writer alive. Dropping it flushes pending lines.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails if the log directory cannot be created, a filter directive is
/// invalid, or a global subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError> {
    let span_events = if config.log_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let console_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => own_filter("warn", config.console_level)?,
    };

    let console_layer = fmt::layer()
        .with_ansi(config.console_ansi)
        .with_target(config.include_target)
        .with_file(config.include_file_line)
        .with_line_number(config.include_file_line)
        .with_span_events(span_events.clone())
        .with_filter(console_filter);

    let (file_layer, file_guard) = match &config.log_directory {
        Some(dir) => {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    LoggingError::DirectoryCreationFailed {
                        path: dir.clone(),
                        reason: e.to_string(),
                    }
                })?;
            }

            let appender =
                RollingFileAppender::new(config.rotation.into(), dir, &config.log_file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(span_events)
                .json()
                .with_filter(own_filter("info", config.file_level)?);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// Install the global subscriber using [`LoggingConfig::auto`].
pub fn init_auto() -> Result<LoggingGuard, LoggingError> {
    init(&LoggingConfig::auto())
}

/// Filter with `base` for dependencies and `level` for our own targets.
fn own_filter(base: &str, level: Level) -> Result<EnvFilter, LoggingError> {
    let mut filter = EnvFilter::new(base);
    for target in OWN_TARGETS {
        let directive = format!("{target}={}", level_to_directive(level));
        let parsed = directive
            .parse()
            .map_err(|e| LoggingError::InvalidDirective {
                directive: directive.clone(),
                reason: format!("{e}"),
            })?;
        filter = filter.add_directive(parsed);
    }
    Ok(filter)
}

/// Default log directory under the platform data dir.
#[must_use]
pub fn default_log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ymd")
        .join("logs")
}

const fn level_to_directive(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}

/// Errors from logging initialization.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// The log directory could not be created.
    #[error("Failed to create log directory {path}: {reason}")]
    DirectoryCreationFailed {
        /// Directory path.
        path: PathBuf,
        /// Failure reason.
        reason: String,
    },

    /// A filter directive did not parse.
    #[error("Invalid log directive '{directive}': {reason}")]
    InvalidDirective {
        /// Directive text.
        directive: String,
        /// Parser diagnostic.
        reason: String,
    },

    /// A global subscriber is already installed.
    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_production() {
        let config = LoggingConfig::default();
        assert_eq!(config.console_level, Level::INFO);
        assert_eq!(config.file_level, Level::DEBUG);
        assert_eq!(config.rotation, LogRotation::Daily);
        assert!(config.log_directory.is_some());
    }

    #[test]
    fn test_development_config() {
        let config = LoggingConfig::development();
        assert_eq!(config.console_level, Level::DEBUG);
        assert_eq!(config.rotation, LogRotation::Hourly);
        assert!(config.log_span_events);
    }

    #[test]
    fn test_console_only_has_no_directory() {
        let config = LoggingConfig::console_only();
        assert!(config.log_directory.is_none());
        assert_eq!(config.console_level, Level::INFO);
    }

    #[test]
    fn test_config_builder() {
        let config = LoggingConfig::console_only()
            .with_console_level(Level::WARN)
            .with_file_level(Level::INFO)
            .with_rotation(LogRotation::Never)
            .with_log_file_prefix("sync")
            .with_log_directory(PathBuf::from("/tmp/ymd-logs"));

        assert_eq!(config.console_level, Level::WARN);
        assert_eq!(config.file_level, Level::INFO);
        assert_eq!(config.rotation, LogRotation::Never);
        assert_eq!(config.log_file_prefix, "sync");
        assert_eq!(config.log_directory, Some(PathBuf::from("/tmp/ymd-logs")));
    }

    #[test]
    fn test_own_filter_builds() {
        let filter = own_filter("warn", Level::TRACE).expect("valid directives");
        let rendered = filter.to_string();
        assert!(rendered.contains("ymd_core=trace"));
    }

    #[test]
    fn test_default_log_directory() {
        let dir = default_log_directory();
        assert!(dir.ends_with("ymd/logs"));
    }
}
