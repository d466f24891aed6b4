//! Engine tunables from the settings table
//!
//! Key/value TEXT table with compiled defaults. Operators adjust values at
//! runtime; loops read a snapshot when a batch starts.

use sqlx::SqlitePool;

use lookgen_common::Result;

use crate::models::Slot;
use crate::planner::SlotCapacity;

/// Runtime tunables for the dispatch and progress loops
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Max concurrent generation calls across a batch
    pub max_concurrency: usize,
    /// Dispatch loop tick interval (ms)
    pub dispatch_interval_ms: u64,
    /// Progress tracker tick interval (ms)
    pub progress_interval_ms: u64,
    /// Age after which a GENERATING Output is flagged stalled (s)
    pub stall_threshold_secs: i64,
    /// Dispatch attempts per Output before it is failed as
    /// transport-exhausted
    pub max_dispatch_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            dispatch_interval_ms: 3000,
            progress_interval_ms: 2000,
            stall_threshold_secs: 300,
            max_dispatch_attempts: 20,
        }
    }
}

/// Read a string setting
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

/// Write a string setting
pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

async fn get_i64(pool: &SqlitePool, key: &str, default: i64) -> Result<i64> {
    Ok(get_setting(pool, key)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(default))
}

/// Load the engine settings snapshot, falling back to defaults
pub async fn engine_settings(pool: &SqlitePool) -> Result<EngineSettings> {
    let defaults = EngineSettings::default();

    Ok(EngineSettings {
        max_concurrency: get_i64(pool, "engine.max_concurrency", defaults.max_concurrency as i64)
            .await?
            .max(1) as usize,
        dispatch_interval_ms: get_i64(
            pool,
            "engine.dispatch_interval_ms",
            defaults.dispatch_interval_ms as i64,
        )
        .await?
        .max(100) as u64,
        progress_interval_ms: get_i64(
            pool,
            "engine.progress_interval_ms",
            defaults.progress_interval_ms as i64,
        )
        .await?
        .max(100) as u64,
        stall_threshold_secs: get_i64(
            pool,
            "engine.stall_threshold_secs",
            defaults.stall_threshold_secs,
        )
        .await?,
        max_dispatch_attempts: get_i64(
            pool,
            "engine.max_dispatch_attempts",
            defaults.max_dispatch_attempts as i64,
        )
        .await?
        .max(1) as u32,
    })
}

/// Pose-template availability per Slot (`templates.<slot>` keys, default 1)
pub async fn slot_capacity(pool: &SqlitePool) -> Result<SlotCapacity> {
    let mut capacity = SlotCapacity::uniform(1);
    for slot in Slot::ALL {
        let key = format!("templates.{}", slot.as_str());
        if let Some(value) = get_setting(pool, &key).await? {
            if let Ok(count) = value.parse::<u32>() {
                capacity = capacity.with(slot, count);
            }
        }
    }
    Ok(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_pool;

    #[tokio::test]
    async fn defaults_apply_when_unset() {
        let pool = init_memory_pool().await.unwrap();
        let settings = engine_settings(&pool).await.unwrap();
        assert_eq!(settings.max_concurrency, 3);
        assert_eq!(settings.stall_threshold_secs, 300);
    }

    #[tokio::test]
    async fn stored_values_override_defaults() {
        let pool = init_memory_pool().await.unwrap();
        set_setting(&pool, "engine.max_concurrency", "5")
            .await
            .unwrap();
        set_setting(&pool, "engine.dispatch_interval_ms", "500")
            .await
            .unwrap();

        let settings = engine_settings(&pool).await.unwrap();
        assert_eq!(settings.max_concurrency, 5);
        assert_eq!(settings.dispatch_interval_ms, 500);
    }

    #[tokio::test]
    async fn slot_capacity_reads_template_counts() {
        let pool = init_memory_pool().await.unwrap();
        set_setting(&pool, "templates.profile", "0").await.unwrap();
        set_setting(&pool, "templates.hero", "4").await.unwrap();

        let capacity = slot_capacity(&pool).await.unwrap();
        assert_eq!(capacity.available(Slot::Profile), 0);
        assert_eq!(capacity.available(Slot::Hero), 4);
        assert_eq!(capacity.available(Slot::Detail), 1);
    }
}
