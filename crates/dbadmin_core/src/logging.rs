//! Structured logging setup for binaries and tests embedding the crate.
//!
//! The library itself only emits `tracing` events. This module wires a subscriber with
//! daily rotating files next to console output, a build-type dependent default filter,
//! and a console-only fallback when the log directory cannot be used. `DBADMIN_LOG`
//! (then `RUST_LOG`) overrides the filter.

use crate::config::ConfigSource;

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Directory for log files.
pub const KEY_LOG_DIR: &str = "DBADMIN_LOG_DIR";
/// Filter directives, e.g. `info,dbadmin_core=debug`.
pub const KEY_LOG_FILTER: &str = "DBADMIN_LOG";

const FILE_PREFIX: &str = "dbadmin";

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Console only, no files. Defaults to whether stdout is a terminal.
    pub console_only: bool,
    /// Filter directives overriding the environment and defaults
    pub log_filter: Option<String>,
}

impl LogConfig {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir, console_only: atty::is(atty::Stream::Stdout), log_filter: None }
    }

    /// Read the log directory and filter from a configuration source.
    pub fn from_source(source: &dyn ConfigSource) -> Self {
        let dir = source.get_string(KEY_LOG_DIR).map(PathBuf::from).unwrap_or_else(log_dir);
        let mut config = Self::new(dir);
        config.log_filter = source.get_string(KEY_LOG_FILTER);
        config
    }

    /// Set custom log filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// Force console-only output.
    pub fn console_only(mut self, console_only: bool) -> Self {
        self.console_only = console_only;
        self
    }
}

/// Keeps the file writer alive. Dropping it flushes pending log entries.
pub struct LoggingGuard {
    file_writer: Option<WorkerGuard>,
}

impl LoggingGuard {
    /// Whether log entries are also written to a file.
    pub fn writes_file(&self) -> bool {
        self.file_writer.is_some()
    }
}

/// Install the global subscriber.
///
/// Falls back to console-only when the log directory cannot be used. A subscriber that
/// is already installed stays in place.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    if config.console_only {
        return init_console(config.log_filter.as_deref());
    }

    match init_console_and_file(&config) {
        Ok(guard) => LoggingGuard { file_writer: Some(guard) },
        Err(e) => {
            eprintln!(
                "Warning: file logging unavailable in {}: {e}. Using console only.",
                config.log_dir.display()
            );
            init_console(config.log_filter.as_deref())
        }
    }
}

/// Install the global subscriber with the default directory and filter.
pub fn init_logging_default() -> LoggingGuard {
    init_logging(LogConfig::new(log_dir()))
}

fn init_console(filter: Option<&str>) -> LoggingGuard {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(filter))
        .with_ansi(true)
        .with_target(false)
        .try_init();

    LoggingGuard { file_writer: None }
}

fn init_console_and_file(config: &LogConfig) -> Result<WorkerGuard, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.log_dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(FILE_PREFIX)
        .filename_suffix("log")
        .build(&config.log_dir)?;
    let (file, guard) = tracing_appender::non_blocking(appender);

    // Info and above also reach stdout
    let writer = std::io::stdout.with_max_level(tracing::Level::INFO).and(file);

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(env_filter(config.log_filter.as_deref()))
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .map_err(|e| -> Box<dyn std::error::Error> { e })?;

    Ok(guard)
}

/// Explicit filter, then `DBADMIN_LOG`, then `RUST_LOG`, then the build default.
fn env_filter(explicit: Option<&str>) -> EnvFilter {
    let fallback = || EnvFilter::new(default_log_filter());
    match explicit {
        Some(directives) => EnvFilter::try_new(directives).unwrap_or_else(|_| fallback()),
        None => EnvFilter::try_from_env(KEY_LOG_FILTER)
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| fallback()),
    }
}

/// Default filter for the current build type.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "debug,dbadmin_core=trace,tokio_postgres=warn,deadpool=warn"
    } else {
        "info,tokio_postgres=warn,deadpool=warn"
    }
}

/// Default log directory under the platform's local data dir.
pub fn log_dir() -> PathBuf {
    dirs::data_local_dir().unwrap_or_else(std::env::temp_dir).join("dbadmin").join("logs")
}
