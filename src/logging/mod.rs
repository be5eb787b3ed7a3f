//! Logging setup for hostforge binaries and tests
//!
//! The library itself only emits `tracing` events. Binaries (and tests that
//! want output) install a subscriber through this module, once per process.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: standard tracing filter, takes precedence (e.g. "hostforge=trace")
//! - `HOSTFORGE_LOG_LEVEL`: simple level (error, warn, info, debug, trace)
//! - `HOSTFORGE_LOG_FORMAT`: console format ("human" or "json")
//! - `HOSTFORGE_LOG_FILE`: optional path, receives JSON lines in addition to the console

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Outcome of the one and only subscriber installation
static TRACING_INITIALIZED: OnceCell<Result<(), String>> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "HOSTFORGE_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "HOSTFORGE_LOG_FORMAT";
const LOG_FILE_ENV: &str = "HOSTFORGE_LOG_FILE";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("failed to open log file {path}: {reason}")]
    FileOpenFailed { path: PathBuf, reason: String },

    /// Another subscriber was installed first (possibly outside this module)
    #[error("subscriber installation failed: {0}")]
    InstallFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Subscriber settings
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include file and line in console output
    pub with_file_info: bool,
    /// Emit an event when spans close (with timing)
    pub with_span_events: bool,
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    pub fn with_span_events(mut self, with_span_events: bool) -> Self {
        self.with_span_events = with_span_events;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Settings from `HOSTFORGE_LOG_*`; unknown values fall back to defaults
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(level) = std::env::var(LOG_LEVEL_ENV).ok().and_then(|s| LogLevel::from_str(&s)) {
            config.level = level;
        }
        if let Some(format) = std::env::var(LOG_FORMAT_ENV).ok().and_then(|s| LogFormat::from_str(&s)) {
            config.format = format;
        }
        if let Ok(path) = std::env::var(LOG_FILE_ENV) {
            if !path.is_empty() {
                config.log_file = Some(PathBuf::from(path));
            }
        }
        config
    }
}

/// Install a subscriber from the environment, ignoring failures
///
/// Idempotent; later calls are no-ops.
pub fn init_logging_default() {
    if let Err(e) = init_logging_from_env() {
        eprintln!("hostforge: logging disabled: {}", e);
    }
}

/// Install a subscriber configured by `HOSTFORGE_LOG_*` and `RUST_LOG`
///
/// Idempotent: only the first call in a process installs anything, and every
/// call reports that first outcome.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    init_with_config(&LoggingConfig::from_env())
}

/// Install a subscriber with explicit settings (first call wins)
pub fn init_with_config(config: &LoggingConfig) -> Result<(), LoggingError> {
    TRACING_INITIALIZED
        .get_or_init(|| install(config).map_err(|e| e.to_string()))
        .clone()
        .map_err(LoggingError::InstallFailed)
}

/// Check whether a subscriber was installed through this module
pub fn is_initialized() -> bool {
    matches!(TRACING_INITIALIZED.get(), Some(Ok(())))
}

fn install(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_env_filter(config.level)?;
    let file_layer = match &config.log_file {
        Some(path) => Some(json_file_layer(path)?),
        None => None,
    };
    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    let installed = match config.format {
        LogFormat::Human => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(config.with_file_info)
                    .with_line_number(config.with_file_info)
                    .with_span_events(span_events(config.with_span_events)),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_file(config.with_file_info)
                    .with_line_number(config.with_file_info)
                    .with_span_events(span_events(config.with_span_events)),
            )
            .try_init(),
    };
    installed.map_err(|e| LoggingError::InstallFailed(e.to_string()))
}

fn span_events(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// JSON lines appended to `path`, parent directories created as needed
fn json_file_layer<S>(path: &Path) -> Result<impl Layer<S>, LoggingError>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let open_failed = |e: std::io::Error| LoggingError::FileOpenFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(open_failed)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(open_failed)?;

    Ok(fmt::layer()
        .json()
        .with_writer(Mutex::new(file))
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false))
}

/// `RUST_LOG` wins; otherwise the configured level applies to every target
fn build_env_filter(level: LogLevel) -> Result<EnvFilter, LoggingError> {
    match std::env::var("RUST_LOG") {
        Ok(rust_log) if !rust_log.is_empty() => {
            EnvFilter::try_new(rust_log).map_err(|e| LoggingError::InvalidFilter(e.to_string()))
        }
        _ => Ok(EnvFilter::new(level.as_filter_str())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::from_str("error"), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_str("Warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str(" trace "), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_str("verbose"), None);
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!(LogFormat::from_str("pretty"), Some(LogFormat::Human));
        assert_eq!(LogFormat::from_str("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::from_str("xml"), None);
    }

    #[test]
    fn test_logging_config_builder() {
        let config = LoggingConfig::new()
            .with_level(LogLevel::Debug)
            .with_format(LogFormat::Json)
            .with_file_info(true)
            .with_span_events(true)
            .with_log_file("/tmp/hostforge.log");

        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.with_file_info);
        assert!(config.with_span_events);
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/hostforge.log")));
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        std::env::set_var(LOG_LEVEL_ENV, "debug");
        std::env::set_var(LOG_FORMAT_ENV, "json");
        std::env::remove_var(LOG_FILE_ENV);
        let config = LoggingConfig::from_env();
        std::env::remove_var(LOG_LEVEL_ENV);
        std::env::remove_var(LOG_FORMAT_ENV);

        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.log_file.is_none());
    }

    #[test]
    fn test_json_file_layer_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hostforge.jsonl");
        let layer = json_file_layer::<tracing_subscriber::Registry>(&path);
        assert!(layer.is_ok());
        assert!(path.exists());
    }

    #[test]
    fn test_json_file_layer_reports_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"x").unwrap();
        match json_file_layer::<tracing_subscriber::Registry>(&blocker.join("log.jsonl")) {
            Err(LoggingError::FileOpenFailed { path, .. }) => {
                assert_eq!(path, blocker.join("log.jsonl"))
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("opened a log file under a regular file"),
        }
    }

    #[test]
    #[serial]
    fn test_init_is_idempotent() {
        init_logging_default();
        let first = is_initialized();
        init_logging_default();
        assert_eq!(is_initialized(), first);
        assert!(TRACING_INITIALIZED.get().is_some());
    }
}
