//! Logging utilities
//!
//! Provides logging configuration and helpers.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Log level configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    /// `-v` selects debug, `-vv` and more select trace
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => LogLevel::Info,
            1 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// Filter directive for the given level, unless `directive` overrides it
pub fn filter_for(level: LogLevel, directive: Option<&str>) -> EnvFilter {
    directive
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(format!("batchtest={}", level.to_tracing_level())))
}

/// Initialize the logger with specified level.
///
/// `directive` is a full filter such as `batchtest=debug,tokio=warn` and takes
/// precedence over `level` when it parses. Logs go to stderr so formatted
/// results on stdout stay machine-readable.
pub fn init_logger(level: LogLevel, directive: Option<&str>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_for(level, directive))
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
