//! Configuration loading for lookgen services
//!
//! TOML file + environment overrides. Resolution priority for every value:
//! 1. Environment variable (highest)
//! 2. TOML config file
//! 3. Compiled default
//!
//! Secrets (the generation service API key) additionally resolve from the
//! database `settings` table first; that tier lives in lookgen-engine since
//! it needs a pool.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default SQLite database file, relative to the working directory
pub const DEFAULT_DATABASE_PATH: &str = "lookgen.db";

/// Default HTTP listen port for lookgen-engine
pub const DEFAULT_LISTEN_PORT: u16 = 5810;

/// Logging configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter: trace, debug, info, warn, error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// TOML configuration file contents (`lookgen.toml`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// SQLite database file path
    pub database_path: Option<String>,
    /// HTTP listen port
    pub listen_port: Option<u16>,
    /// Generation service base URL
    pub generation_url: Option<String>,
    /// Generation service API key (lowest-priority tier; DB and ENV win)
    pub generation_api_key: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Resolve the config file path
///
/// `LOOKGEN_CONFIG` env var, falling back to `lookgen.toml` in the working
/// directory.
pub fn config_path() -> PathBuf {
    std::env::var("LOOKGEN_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("lookgen.toml"))
}

/// Load TOML configuration, returning defaults when the file is absent
///
/// A missing file is not an error (every value has an ENV or compiled
/// fallback); a file that exists but fails to parse is.
pub fn load_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No config file, using defaults");
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Write TOML configuration back to disk (best-effort settings sync)
pub fn write_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Resolve database path: `LOOKGEN_DATABASE` → TOML → default
pub fn resolve_database_path(config: &TomlConfig) -> PathBuf {
    if let Ok(path) = std::env::var("LOOKGEN_DATABASE") {
        return PathBuf::from(path);
    }
    config
        .database_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH))
}

/// Resolve listen port: `LOOKGEN_PORT` → TOML → default
pub fn resolve_listen_port(config: &TomlConfig) -> u16 {
    if let Ok(port) = std::env::var("LOOKGEN_PORT") {
        if let Ok(port) = port.parse() {
            return port;
        }
        tracing::warn!("LOOKGEN_PORT is not a valid port number, ignoring");
    }
    config.listen_port.unwrap_or(DEFAULT_LISTEN_PORT)
}
