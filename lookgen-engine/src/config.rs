//! Generation service endpoint resolution
//!
//! Three-tier lookup, first match wins:
//! 1. Database settings (`generation.url`, `generation.api_key`)
//! 2. Environment (`LOOKGEN_GENERATION_URL`, `LOOKGEN_GENERATION_API_KEY`)
//! 3. TOML config file
//!
//! A value found lower in the chain is written back to the database so
//! subsequent startups resolve from tier 1.

use sqlx::SqlitePool;

use lookgen_common::config::TomlConfig;
use lookgen_common::{Error, Result};

use crate::db::settings;

const URL_KEY: &str = "generation.url";
const API_KEY_KEY: &str = "generation.api_key";

pub const ENV_GENERATION_URL: &str = "LOOKGEN_GENERATION_URL";
pub const ENV_GENERATION_API_KEY: &str = "LOOKGEN_GENERATION_API_KEY";

/// Resolved connection parameters for the generation service
#[derive(Debug, Clone)]
pub struct GenerationEndpoint {
    pub url: String,
    /// Empty string when the service runs unauthenticated
    pub api_key: String,
}

/// Resolve the generation service endpoint
///
/// Fails with setup guidance when no URL is configured anywhere; a missing
/// API key resolves to empty rather than failing.
pub async fn resolve_generation_endpoint(
    pool: &SqlitePool,
    toml_config: &TomlConfig,
) -> Result<GenerationEndpoint> {
    let url = resolve_value(
        pool,
        URL_KEY,
        ENV_GENERATION_URL,
        toml_config.generation_url.as_deref(),
    )
    .await?;

    let url = match url {
        Some(url) => url,
        None => {
            return Err(Error::Config(format!(
                "No generation service URL configured. Set one of:\n\
                 1. Database setting '{}'\n\
                 2. Environment variable {}\n\
                 3. 'generation_url' in the TOML config file",
                URL_KEY, ENV_GENERATION_URL
            )));
        }
    };

    let api_key = resolve_value(
        pool,
        API_KEY_KEY,
        ENV_GENERATION_API_KEY,
        toml_config.generation_api_key.as_deref(),
    )
    .await?
    .unwrap_or_default();

    Ok(GenerationEndpoint { url, api_key })
}

async fn resolve_value(
    pool: &SqlitePool,
    db_key: &str,
    env_key: &str,
    toml_value: Option<&str>,
) -> Result<Option<String>> {
    if let Some(value) = settings::get_setting(pool, db_key).await? {
        if !value.is_empty() {
            return Ok(Some(value));
        }
    }

    let fallback = match std::env::var(env_key) {
        Ok(value) if !value.is_empty() => {
            tracing::info!(key = db_key, "Resolved from environment");
            Some(value)
        }
        _ => toml_value
            .filter(|v| !v.is_empty())
            .map(|v| {
                tracing::info!(key = db_key, "Resolved from TOML config");
                v.to_string()
            }),
    };

    if let Some(ref value) = fallback {
        settings::set_setting(pool, db_key, value).await?;
    }

    Ok(fallback)
}
