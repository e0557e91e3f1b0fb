//! Logging utilities with structured JSON output support.
//!
//! Initialisation is idempotent: when a global subscriber is already installed (by the
//! embedding process or an earlier call) the existing one is kept.

use tracing_subscriber::{fmt, EnvFilter};

/// Logging format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format (default)
    Pretty,
    /// JSON format for log aggregation
    Json,
    /// Compact single-line format
    Compact,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pretty" => Some(LogFormat::Pretty),
            "json" => Some(LogFormat::Json),
            "compact" => Some(LogFormat::Compact),
            _ => None,
        }
    }
}

/// Initialize logging with the default pretty format.
pub fn init_logging() -> bool {
    init_logging_with_format(LogFormat::Pretty)
}

/// Initialize logging with the specified format.
///
/// Set `RUST_LOG` to control the level. Returns `false` if a subscriber was already set.
pub fn init_logging_with_format(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = match format {
        LogFormat::Pretty => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(false)
            .with_line_number(false)
            .try_init(),
        LogFormat::Json => fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .flatten_event(true)
            .try_init(),
        LogFormat::Compact => fmt()
            .with_env_filter(filter)
            .compact()
            .with_target(false)
            .try_init(),
    };
    installed.is_ok()
}
