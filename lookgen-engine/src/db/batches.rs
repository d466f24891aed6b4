//! Run batch persistence
//!
//! **[GEN-WF-020]** Batch rows are upserted whole; JSON columns carry the
//! Look selection and the prerequisite warnings captured at plan time.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use lookgen_common::{Error, Result};

use crate::models::{BatchProgress, BatchState, RunBatch};
use crate::planner::BlockedCandidate;

/// Save (insert or update) a run batch
pub async fn save_batch(pool: &SqlitePool, batch: &RunBatch) -> Result<()> {
    let look_ids = serde_json::to_string(&batch.look_ids)
        .map_err(|e| Error::Internal(format!("Failed to serialize look_ids: {}", e)))?;
    let warnings = serde_json::to_string(&batch.warnings)
        .map_err(|e| Error::Internal(format!("Failed to serialize warnings: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO run_batches (
            batch_id, state, look_ids, required_options, force_regenerate,
            warnings, progress_queued, progress_running, progress_done,
            progress_failed, progress_total, started_at, ended_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(batch_id) DO UPDATE SET
            state = excluded.state,
            warnings = excluded.warnings,
            progress_queued = excluded.progress_queued,
            progress_running = excluded.progress_running,
            progress_done = excluded.progress_done,
            progress_failed = excluded.progress_failed,
            progress_total = excluded.progress_total,
            ended_at = excluded.ended_at
        "#,
    )
    .bind(batch.batch_id.to_string())
    .bind(batch.state.as_str())
    .bind(&look_ids)
    .bind(batch.required_options as i64)
    .bind(batch.force_regenerate as i64)
    .bind(&warnings)
    .bind(batch.progress.queued as i64)
    .bind(batch.progress.running as i64)
    .bind(batch.progress.done as i64)
    .bind(batch.progress.failed as i64)
    .bind(batch.progress.total as i64)
    .bind(batch.started_at.to_rfc3339())
    .bind(batch.ended_at.map(|dt| dt.to_rfc3339()))
    .execute(pool)
    .await?;

    Ok(())
}

fn batch_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<RunBatch> {
    let batch_id: String = row.get("batch_id");
    let batch_id = Uuid::parse_str(&batch_id)
        .map_err(|e| Error::Internal(format!("Failed to parse batch_id: {}", e)))?;

    let state: String = row.get("state");
    let state = parse_state(&state)?;

    let look_ids: String = row.get("look_ids");
    let look_ids: Vec<Uuid> = serde_json::from_str(&look_ids)
        .map_err(|e| Error::Internal(format!("Failed to deserialize look_ids: {}", e)))?;

    let warnings: String = row.get("warnings");
    let warnings: Vec<BlockedCandidate> = serde_json::from_str(&warnings)
        .map_err(|e| Error::Internal(format!("Failed to deserialize warnings: {}", e)))?;

    let started_at: String = row.get("started_at");
    let started_at = chrono::DateTime::parse_from_rfc3339(&started_at)
        .map_err(|e| Error::Internal(format!("Failed to parse started_at: {}", e)))?
        .with_timezone(&chrono::Utc);

    let ended_at: Option<String> = row.get("ended_at");
    let ended_at = ended_at
        .map(|s| chrono::DateTime::parse_from_rfc3339(&s))
        .transpose()
        .map_err(|e| Error::Internal(format!("Failed to parse ended_at: {}", e)))?
        .map(|dt| dt.with_timezone(&chrono::Utc));

    Ok(RunBatch {
        batch_id,
        state,
        look_ids,
        required_options: row.get::<i64, _>("required_options") as u32,
        force_regenerate: row.get::<i64, _>("force_regenerate") != 0,
        warnings,
        progress: BatchProgress {
            queued: row.get::<i64, _>("progress_queued") as u32,
            running: row.get::<i64, _>("progress_running") as u32,
            done: row.get::<i64, _>("progress_done") as u32,
            failed: row.get::<i64, _>("progress_failed") as u32,
            total: row.get::<i64, _>("progress_total") as u32,
        },
        started_at,
        ended_at,
    })
}

fn parse_state(s: &str) -> Result<BatchState> {
    match s {
        "PLANNING" => Ok(BatchState::Planning),
        "DISPATCHING" => Ok(BatchState::Dispatching),
        "COMPLETED" => Ok(BatchState::Completed),
        "PARTIAL" => Ok(BatchState::Partial),
        "FAILED" => Ok(BatchState::Failed),
        "CANCELLED" => Ok(BatchState::Cancelled),
        other => Err(Error::Internal(format!("Unknown batch state: {}", other))),
    }
}

/// Load a run batch by id
pub async fn load_batch(pool: &SqlitePool, batch_id: Uuid) -> Result<Option<RunBatch>> {
    let row = sqlx::query("SELECT * FROM run_batches WHERE batch_id = ?")
        .bind(batch_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(batch_from_row).transpose()
}

/// List batches still in a non-terminal state, most recent first
///
/// Resume reattaches to these after a process restart.
pub async fn list_active(pool: &SqlitePool) -> Result<Vec<RunBatch>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM run_batches
        WHERE state NOT IN ('COMPLETED', 'PARTIAL', 'FAILED', 'CANCELLED')
        ORDER BY started_at DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(batch_from_row).collect()
}

/// Start time of the most recent batch, if any ran before
///
/// Looks first seen after this are classified new-since-last-run.
pub async fn latest_started_at(pool: &SqlitePool) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    let started: Option<String> =
        sqlx::query_scalar("SELECT MAX(started_at) FROM run_batches")
            .fetch_one(pool)
            .await?;

    started
        .map(|s| {
            chrono::DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .map_err(|e| Error::Internal(format!("Failed to parse started_at: {}", e)))
        })
        .transpose()
}
