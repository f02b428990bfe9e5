//! Host configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory,
//! then applies `WIREUP_DOCUMENT`, `WIREUP_DOCUMENT_FORMAT` and
//! `WIREUP_LOG_LEVEL` env overrides.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::document::Format;
use crate::error::AppError;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Fully-resolved engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Assembly document to load (already expanded, no `~`).
    pub document: PathBuf,
    /// Forced document syntax; `None` detects it from the extension.
    pub document_format: Option<Format>,
    pub log_level: String,
    /// Append logs here instead of stderr.
    pub log_file: Option<PathBuf>,
    /// `None` disables the assembly timeout.
    pub assemble_timeout: Option<Duration>,
    /// Start runnable modules after assembly.
    pub run: bool,
    /// Time modules get to stop after shutdown before they are aborted.
    pub shutdown_grace: Duration,
}

/// Values that take precedence over the file. Tests pass these directly
/// instead of mutating env vars.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub document: Option<String>,
    pub document_format: Option<String>,
    pub log_level: Option<String>,
}

impl Overrides {
    pub fn from_env() -> Self {
        Self {
            document: env::var("WIREUP_DOCUMENT").ok(),
            document_format: env::var("WIREUP_DOCUMENT_FORMAT").ok(),
            log_level: env::var("WIREUP_LOG_LEVEL").ok(),
        }
    }
}

/// Raw TOML shape: `serde` target before resolution.
#[derive(Deserialize)]
struct RawConfig {
    engine: RawEngine,
}

#[derive(Deserialize)]
struct RawEngine {
    document: String,
    /// `auto`, `toml` or `json`.
    #[serde(default)]
    document_format: Option<String>,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    log_file: Option<String>,
    #[serde(default = "default_timeout_secs")]
    assemble_timeout_secs: u64,
    #[serde(default = "default_true")]
    run: bool,
    #[serde(default = "default_grace_secs")]
    shutdown_grace_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_grace_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

/// Load config from `config/default.toml`, then apply env-var overrides.
pub fn load() -> Result<Config, AppError> {
    load_from(Path::new(DEFAULT_CONFIG_PATH), &Overrides::from_env())
}

/// Internal loader: accepts an explicit path and overrides.
pub fn load_from(path: &Path, overrides: &Overrides) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let e = parsed.engine;
    let document = expand_home(overrides.document.as_deref().unwrap_or(&e.document));
    let log_level = overrides.log_level.as_deref().unwrap_or(&e.log_level).to_string();
    let assemble_timeout =
        (e.assemble_timeout_secs > 0).then(|| Duration::from_secs(e.assemble_timeout_secs));
    let format_setting = overrides.document_format.as_deref().or(e.document_format.as_deref());
    let document_format = match format_setting {
        None => None,
        Some(s) if s.eq_ignore_ascii_case("auto") => None,
        Some(s) => Some(s.parse::<Format>()?),
    };

    Ok(Config {
        document,
        document_format,
        log_level,
        log_file: e.log_file.as_deref().map(expand_home),
        assemble_timeout,
        run: e.run,
        shutdown_grace: Duration::from_secs(e.shutdown_grace_secs),
    })
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
