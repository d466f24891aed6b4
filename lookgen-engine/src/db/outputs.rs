//! Output persistence, the fine-grained face of the store
//!
//! **[GEN-DB-020]** Outputs are the rows the dispatch loop and progress
//! tracker read and write. Three properties the control loop leans on:
//!
//! - `create_outputs` is idempotent: the unique (job, view, slot, attempt)
//!   key turns duplicate inserts into no-ops.
//! - `update_status` against a missing id is a no-op, so a late write from
//!   an in-flight generation landing after cancellation is harmless.
//! - Every bulk read by id set chunks at [`FILTER_CHUNK`](super::FILTER_CHUNK).

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use lookgen_common::{Error, Result};

use super::{placeholders, FILTER_CHUNK};
use crate::models::{Output, OutputStatus, Slot, StatusCounts, ViewKind};

/// Key for one Output to create
#[derive(Debug, Clone, Copy)]
pub struct OutputSpec {
    pub view: ViewKind,
    pub slot: Slot,
    pub attempt_index: u32,
}

/// Create pending Outputs for a Job (idempotent)
///
/// Returns the number of rows actually inserted; re-running with the same
/// specs inserts nothing.
pub async fn create_outputs(
    pool: &SqlitePool,
    job_id: Uuid,
    look_id: Uuid,
    specs: &[OutputSpec],
) -> Result<u32> {
    let now = Utc::now().to_rfc3339();
    let mut created = 0u32;

    for spec in specs {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO outputs (
                output_id, job_id, look_id, view, slot, attempt_index,
                status, dispatch_count, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(job_id.to_string())
        .bind(look_id.to_string())
        .bind(spec.view.as_str())
        .bind(spec.slot.as_str())
        .bind(spec.attempt_index as i64)
        .bind(OutputStatus::Pending.as_str())
        .bind(&now)
        .bind(&now)
        .execute(pool)
        .await?;

        created += result.rows_affected() as u32;
    }

    Ok(created)
}

fn output_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Output> {
    let parse_uuid = |field: &str, value: String| {
        Uuid::parse_str(&value)
            .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", field, e)))
    };
    let parse_time = |field: &str, value: String| {
        chrono::DateTime::parse_from_rfc3339(&value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", field, e)))
    };

    let view: String = row.get("view");
    let slot: String = row.get("slot");
    let status: String = row.get("status");

    Ok(Output {
        output_id: parse_uuid("output_id", row.get("output_id"))?,
        job_id: parse_uuid("job_id", row.get("job_id"))?,
        look_id: parse_uuid("look_id", row.get("look_id"))?,
        view: ViewKind::from_str(&view)?,
        slot: Slot::from_str(&slot)?,
        attempt_index: row.get::<i64, _>("attempt_index") as u32,
        status: OutputStatus::from_str(&status)?,
        artifact_url: row.get("artifact_url"),
        error: row.get("error"),
        dispatch_count: row.get::<i64, _>("dispatch_count") as u32,
        created_at: parse_time("created_at", row.get("created_at"))?,
        updated_at: parse_time("updated_at", row.get("updated_at"))?,
    })
}

/// Pending Outputs across a Job id set, oldest first, up to `limit`
pub async fn list_pending(
    pool: &SqlitePool,
    job_ids: &[Uuid],
    limit: usize,
) -> Result<Vec<Output>> {
    let mut outputs = Vec::new();

    for chunk in job_ids.chunks(FILTER_CHUNK) {
        if outputs.len() >= limit {
            break;
        }
        let sql = format!(
            "SELECT * FROM outputs WHERE status = 'PENDING' AND job_id IN ({}) \
             ORDER BY created_at, attempt_index LIMIT ?",
            placeholders(chunk.len())
        );
        let mut query = sqlx::query(&sql);
        for id in chunk {
            query = query.bind(id.to_string());
        }
        query = query.bind((limit - outputs.len()) as i64);

        let rows = query.fetch_all(pool).await?;
        for row in &rows {
            outputs.push(output_from_row(row)?);
        }
    }

    Ok(outputs)
}

/// Update one Output's status
///
/// Returns false when no row matched (deleted by cancellation); callers
/// treat that as a benign no-op.
pub async fn update_status(
    pool: &SqlitePool,
    output_id: Uuid,
    status: OutputStatus,
    artifact_url: Option<&str>,
    error: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE outputs
        SET status = ?, artifact_url = ?, error = ?, updated_at = ?
        WHERE output_id = ?
        "#,
    )
    .bind(status.as_str())
    .bind(artifact_url)
    .bind(error)
    .bind(Utc::now().to_rfc3339())
    .bind(output_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Move a pending Output to GENERATING
///
/// Guarded on the current status: returns false if the row is gone or was
/// already picked up, so two dispatchers can never both claim it.
pub async fn mark_generating(pool: &SqlitePool, output_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE outputs SET status = 'GENERATING', updated_at = ? \
         WHERE output_id = ? AND status = 'PENDING'",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(output_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Increment an Output's dispatch counter, returning the new value
pub async fn record_dispatch(pool: &SqlitePool, output_id: Uuid) -> Result<u32> {
    sqlx::query("UPDATE outputs SET dispatch_count = dispatch_count + 1 WHERE output_id = ?")
        .bind(output_id.to_string())
        .execute(pool)
        .await?;

    let count: Option<i64> =
        sqlx::query_scalar("SELECT dispatch_count FROM outputs WHERE output_id = ?")
            .bind(output_id.to_string())
            .fetch_optional(pool)
            .await?;

    Ok(count.unwrap_or(0) as u32)
}

/// Aggregate status counts across a Job id set
pub async fn aggregate_counts(pool: &SqlitePool, job_ids: &[Uuid]) -> Result<StatusCounts> {
    let by_job = aggregate_counts_by_job(pool, job_ids).await?;
    let mut total = StatusCounts::default();
    for counts in by_job.values() {
        total.pending += counts.pending;
        total.generating += counts.generating;
        total.completed += counts.completed;
        total.failed += counts.failed;
    }
    Ok(total)
}

/// Per-Job status counts across a Job id set
pub async fn aggregate_counts_by_job(
    pool: &SqlitePool,
    job_ids: &[Uuid],
) -> Result<HashMap<Uuid, StatusCounts>> {
    let mut by_job: HashMap<Uuid, StatusCounts> = HashMap::new();

    for chunk in job_ids.chunks(FILTER_CHUNK) {
        let sql = format!(
            "SELECT job_id, status, COUNT(*) AS n FROM outputs \
             WHERE job_id IN ({}) GROUP BY job_id, status",
            placeholders(chunk.len())
        );
        let mut query = sqlx::query(&sql);
        for id in chunk {
            query = query.bind(id.to_string());
        }

        let rows = query.fetch_all(pool).await?;
        for row in rows {
            let job_id: String = row.get("job_id");
            let job_id = Uuid::parse_str(&job_id)
                .map_err(|e| Error::Internal(format!("Failed to parse job_id: {}", e)))?;
            let status: String = row.get("status");
            let n = row.get::<i64, _>("n") as u32;

            let counts = by_job.entry(job_id).or_default();
            match OutputStatus::from_str(&status)? {
                OutputStatus::Pending => counts.pending += n,
                OutputStatus::Generating => counts.generating += n,
                OutputStatus::Completed => counts.completed += n,
                OutputStatus::Failed => counts.failed += n,
            }
        }
    }

    Ok(by_job)
}

/// Completed-Output counts per (View, Slot) for one Look, used as plan input
pub async fn completed_counts_for_look(
    pool: &SqlitePool,
    look_id: Uuid,
) -> Result<HashMap<(ViewKind, Slot), u32>> {
    let rows = sqlx::query(
        "SELECT view, slot, COUNT(*) AS n FROM outputs \
         WHERE look_id = ? AND status = 'COMPLETED' GROUP BY view, slot",
    )
    .bind(look_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut counts = HashMap::new();
    for row in rows {
        let view: String = row.get("view");
        let slot: String = row.get("slot");
        counts.insert(
            (ViewKind::from_str(&view)?, Slot::from_str(&slot)?),
            row.get::<i64, _>("n") as u32,
        );
    }

    Ok(counts)
}

/// Open (pending or generating) Output counts per (View, Slot) for one Look
///
/// Fill-missing subtracts these so work already on its way is not
/// requested twice.
pub async fn open_counts_for_look(
    pool: &SqlitePool,
    look_id: Uuid,
) -> Result<HashMap<(ViewKind, Slot), u32>> {
    let rows = sqlx::query(
        "SELECT view, slot, COUNT(*) AS n FROM outputs \
         WHERE look_id = ? AND status IN ('PENDING', 'GENERATING') GROUP BY view, slot",
    )
    .bind(look_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut counts = HashMap::new();
    for row in rows {
        let view: String = row.get("view");
        let slot: String = row.get("slot");
        counts.insert(
            (ViewKind::from_str(&view)?, Slot::from_str(&slot)?),
            row.get::<i64, _>("n") as u32,
        );
    }

    Ok(counts)
}

/// Highest attempt index for a (Job, View, Slot), if any Outputs exist
pub async fn max_attempt_index(
    pool: &SqlitePool,
    job_id: Uuid,
    view: ViewKind,
    slot: Slot,
) -> Result<Option<u32>> {
    let max: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(attempt_index) FROM outputs WHERE job_id = ? AND view = ? AND slot = ?",
    )
    .bind(job_id.to_string())
    .bind(view.as_str())
    .bind(slot.as_str())
    .fetch_one(pool)
    .await?;

    Ok(max.map(|m| m as u32))
}

/// All failed Outputs in a batch (retry input)
pub async fn list_failed_for_batch(pool: &SqlitePool, batch_id: Uuid) -> Result<Vec<Output>> {
    let rows = sqlx::query(
        "SELECT * FROM outputs WHERE status = 'FAILED' \
         AND job_id IN (SELECT job_id FROM jobs WHERE batch_id = ?)",
    )
    .bind(batch_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(output_from_row).collect()
}

/// Delete Outputs by id
pub async fn delete_by_ids(pool: &SqlitePool, output_ids: &[Uuid]) -> Result<u64> {
    let mut deleted = 0u64;

    for chunk in output_ids.chunks(FILTER_CHUNK) {
        let sql = format!(
            "DELETE FROM outputs WHERE output_id IN ({})",
            placeholders(chunk.len())
        );
        let mut query = sqlx::query(&sql);
        for id in chunk {
            query = query.bind(id.to_string());
        }
        deleted += query.execute(pool).await?.rows_affected();
    }

    Ok(deleted)
}

/// Delete every non-terminal Output in a batch (cancel path)
///
/// Completed and failed rows are retained.
pub async fn delete_non_terminal_for_batch(pool: &SqlitePool, batch_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM outputs WHERE status IN ('PENDING', 'GENERATING') \
         AND job_id IN (SELECT job_id FROM jobs WHERE batch_id = ?)",
    )
    .bind(batch_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Outputs generating for longer than the stall threshold
///
/// Read-only: stalled rows stay GENERATING until operator action.
pub async fn list_stalled_for_batch(
    pool: &SqlitePool,
    batch_id: Uuid,
    stalled_before: DateTime<Utc>,
) -> Result<Vec<Output>> {
    let rows = sqlx::query(
        "SELECT * FROM outputs WHERE status = 'GENERATING' AND updated_at < ? \
         AND job_id IN (SELECT job_id FROM jobs WHERE batch_id = ?)",
    )
    .bind(stalled_before.to_rfc3339())
    .bind(batch_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(output_from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory_pool, jobs};
    use crate::models::Job;

    async fn seeded_job(pool: &SqlitePool) -> Job {
        let job = Job::new(Uuid::new_v4(), Uuid::new_v4(), 2);
        jobs::create_job(pool, &job).await.unwrap();
        job
    }

    fn spec(attempt: u32) -> OutputSpec {
        OutputSpec {
            view: ViewKind::Front,
            slot: Slot::Hero,
            attempt_index: attempt,
        }
    }

    #[tokio::test]
    async fn create_outputs_is_idempotent() {
        let pool = init_memory_pool().await.unwrap();
        let job = seeded_job(&pool).await;

        let specs = vec![spec(0), spec(1)];
        let first = create_outputs(&pool, job.job_id, job.look_id, &specs)
            .await
            .unwrap();
        assert_eq!(first, 2);

        let second = create_outputs(&pool, job.job_id, job.look_id, &specs)
            .await
            .unwrap();
        assert_eq!(second, 0);

        let pending = list_pending(&pool, &[job.job_id], 10).await.unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn update_status_on_missing_row_is_noop() {
        let pool = init_memory_pool().await.unwrap();
        let affected = update_status(
            &pool,
            Uuid::new_v4(),
            OutputStatus::Completed,
            Some("https://cdn.test/a.png"),
            None,
        )
        .await
        .unwrap();
        assert!(!affected);
    }

    #[tokio::test]
    async fn mark_generating_claims_exactly_once() {
        let pool = init_memory_pool().await.unwrap();
        let job = seeded_job(&pool).await;
        create_outputs(&pool, job.job_id, job.look_id, &[spec(0)])
            .await
            .unwrap();
        let output = &list_pending(&pool, &[job.job_id], 1).await.unwrap()[0];

        assert!(mark_generating(&pool, output.output_id).await.unwrap());
        assert!(!mark_generating(&pool, output.output_id).await.unwrap());
    }

    #[tokio::test]
    async fn aggregates_count_by_status() {
        let pool = init_memory_pool().await.unwrap();
        let job = seeded_job(&pool).await;
        create_outputs(&pool, job.job_id, job.look_id, &[spec(0), spec(1), spec(2)])
            .await
            .unwrap();

        let outputs = list_pending(&pool, &[job.job_id], 10).await.unwrap();
        update_status(
            &pool,
            outputs[0].output_id,
            OutputStatus::Completed,
            Some("https://cdn.test/a.png"),
            None,
        )
        .await
        .unwrap();
        update_status(
            &pool,
            outputs[1].output_id,
            OutputStatus::Failed,
            None,
            Some("blurry face"),
        )
        .await
        .unwrap();

        let counts = aggregate_counts(&pool, &[job.job_id]).await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.total(), 3);

        let completed = completed_counts_for_look(&pool, job.look_id).await.unwrap();
        assert_eq!(completed.get(&(ViewKind::Front, Slot::Hero)), Some(&1));
    }

    #[tokio::test]
    async fn stall_query_sees_only_old_generating_rows() {
        let pool = init_memory_pool().await.unwrap();
        let batch_id = Uuid::new_v4();
        let job = Job::new(batch_id, Uuid::new_v4(), 1);
        jobs::create_job(&pool, &job).await.unwrap();
        create_outputs(&pool, job.job_id, job.look_id, &[spec(0)])
            .await
            .unwrap();
        let output = &list_pending(&pool, &[job.job_id], 1).await.unwrap()[0];
        mark_generating(&pool, output.output_id).await.unwrap();

        // Threshold in the past: freshly updated row is not stalled
        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        let stalled = list_stalled_for_batch(&pool, batch_id, cutoff).await.unwrap();
        assert!(stalled.is_empty());

        // Threshold in the future: now it is
        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let stalled = list_stalled_for_batch(&pool, batch_id, cutoff).await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].output_id, output.output_id);
    }
}
