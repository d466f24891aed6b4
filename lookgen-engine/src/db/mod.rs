//! Database access for lookgen-engine
//!
//! **[GEN-DB-010]** SQLite store for batches, jobs and outputs, plus
//! read-only access to the looks/views catalog maintained upstream. All
//! coordination between the dispatch loop, progress tracker and run
//! controller happens through these tables; writes are idempotent by id.

pub mod batches;
pub mod jobs;
pub mod looks;
pub mod outputs;
pub mod settings;

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Maximum id-list size per bulk query
///
/// The backing store caps filter lists around 30 ids; every bulk read in
/// this module chunks its id set accordingly so callers never see the limit.
pub(crate) const FILTER_CHUNK: usize = 30;

/// Build a `?, ?, ...` placeholder list for an id chunk
pub(crate) fn placeholders(count: usize) -> String {
    let mut s = String::with_capacity(count * 3);
    for i in 0..count {
        if i > 0 {
            s.push_str(", ");
        }
        s.push('?');
    }
    s
}

/// Initialize database connection pool
///
/// Connects with mode=rwc and creates missing tables.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    init_tables(&pool).await?;

    Ok(pool)
}

/// Initialize an in-memory pool (tests)
///
/// Pinned to one connection: each `sqlite::memory:` connection is its own
/// database, so a larger pool would hand out empty ones.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Create engine tables if they don't exist
async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS looks (
            look_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            talent_ref TEXT,
            first_seen_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS views (
            view_id TEXT PRIMARY KEY,
            look_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            reference_image_url TEXT NOT NULL,
            has_crop INTEGER NOT NULL DEFAULT 0,
            has_match INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_batches (
            batch_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            look_ids TEXT NOT NULL,
            required_options INTEGER NOT NULL,
            force_regenerate INTEGER NOT NULL DEFAULT 0,
            warnings TEXT NOT NULL DEFAULT '[]',
            progress_queued INTEGER NOT NULL DEFAULT 0,
            progress_running INTEGER NOT NULL DEFAULT 0,
            progress_done INTEGER NOT NULL DEFAULT 0,
            progress_failed INTEGER NOT NULL DEFAULT 0,
            progress_total INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            ended_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            job_id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            look_id TEXT NOT NULL,
            status TEXT NOT NULL,
            total INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Unique key makes createOutputs idempotent: re-inserting the same
    // (job, view, slot, attempt) is ignored, never duplicated.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outputs (
            output_id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            look_id TEXT NOT NULL,
            view TEXT NOT NULL,
            slot TEXT NOT NULL,
            attempt_index INTEGER NOT NULL,
            status TEXT NOT NULL,
            artifact_url TEXT,
            error TEXT,
            dispatch_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (job_id, view, slot, attempt_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_outputs_job_status ON outputs (job_id, status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_batch ON jobs (batch_id)")
        .execute(pool)
        .await?;

    tracing::info!("Database tables initialized (settings, looks, views, run_batches, jobs, outputs)");

    Ok(())
}
