//! Logging initialisation via tracing-subscriber.
//!
//! Call [`init`] once, after the host config and CLI flags are resolved.
//! Assembly runs inside `module` spans, so every event a task logs carries
//! the module name and assembly id.

use std::fs::OpenOptions;
use std::path::Path;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::error::AppError;

/// Resolved logging settings.
#[derive(Debug, Clone, Copy)]
pub struct LogSettings<'a> {
    /// A bare level (`debug`) or an `EnvFilter` directive list
    /// (`info,wireup::assembly=trace`).
    pub filter: &'a str,
    /// Set when the filter came from `-v` flags; it then beats `RUST_LOG`.
    pub from_cli: bool,
    /// Append to this file instead of writing to stderr.
    pub file: Option<&'a Path>,
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over a configured filter when it is set and valid, and
/// never wins over `-v` flags.
pub fn init(settings: &LogSettings<'_>) -> Result<(), AppError> {
    let filter = build_filter(settings)?;

    let (writer, ansi) = match settings.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path).map_err(|e| {
                AppError::Logger(format!("failed to open log file '{}': {e}", path.display()))
            })?;
            (BoxMakeWriter::new(file), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .try_init()
        .map_err(|e| AppError::Logger(format!("failed to set subscriber: {e}")))
}

fn build_filter(settings: &LogSettings<'_>) -> Result<EnvFilter, AppError> {
    if !settings.from_cli {
        if let Ok(env) = EnvFilter::try_from_default_env() {
            return Ok(env);
        }
    }
    parse_filter(settings.filter)
}

/// Parse a level or directive list. Blank filters are rejected rather than
/// silencing everything.
pub fn parse_filter(filter: &str) -> Result<EnvFilter, AppError> {
    if filter.trim().is_empty() {
        return Err(AppError::Logger("log filter must not be empty".into()));
    }
    EnvFilter::builder()
        .parse(filter)
        .map_err(|e| AppError::Logger(format!("invalid log filter '{filter}': {e}")))
}

/// Level selected by repeated `-v` flags, if any.
pub fn verbosity_level(count: u8) -> Option<&'static str> {
    match count {
        0 => None,
        1 => Some("info"),
        2 => Some("debug"),
        _ => Some("trace"),
    }
}
