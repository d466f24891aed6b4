//! Job persistence
//!
//! A Job is created once per reconciliation decision; afterwards only its
//! status changes and its `total` may grow (fill-missing). `total` never
//! decreases.

use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use lookgen_common::{Error, Result};

use crate::models::{Job, JobStatus};

/// Insert a new Job row
pub async fn create_job(pool: &SqlitePool, job: &Job) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO jobs (job_id, batch_id, look_id, status, total, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(job.job_id.to_string())
    .bind(job.batch_id.to_string())
    .bind(job.look_id.to_string())
    .bind(job.status.as_str())
    .bind(job.total as i64)
    .bind(job.created_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let job_id: String = row.get("job_id");
    let batch_id: String = row.get("batch_id");
    let look_id: String = row.get("look_id");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");

    Ok(Job {
        job_id: Uuid::parse_str(&job_id)
            .map_err(|e| Error::Internal(format!("Failed to parse job_id: {}", e)))?,
        batch_id: Uuid::parse_str(&batch_id)
            .map_err(|e| Error::Internal(format!("Failed to parse batch_id: {}", e)))?,
        look_id: Uuid::parse_str(&look_id)
            .map_err(|e| Error::Internal(format!("Failed to parse look_id: {}", e)))?,
        status: JobStatus::from_str(&status)?,
        total: row.get::<i64, _>("total") as u32,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| Error::Internal(format!("Failed to parse created_at: {}", e)))?
            .with_timezone(&chrono::Utc),
    })
}

/// All Jobs belonging to a batch
pub async fn list_for_batch(pool: &SqlitePool, batch_id: Uuid) -> Result<Vec<Job>> {
    let rows = sqlx::query("SELECT * FROM jobs WHERE batch_id = ? ORDER BY created_at")
        .bind(batch_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter().map(job_from_row).collect()
}

/// Job ids for a batch (dispatch/tracker tick input)
pub async fn job_ids_for_batch(pool: &SqlitePool, batch_id: Uuid) -> Result<Vec<Uuid>> {
    let rows = sqlx::query_scalar::<_, String>("SELECT job_id FROM jobs WHERE batch_id = ?")
        .bind(batch_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|s| {
            Uuid::parse_str(s).map_err(|e| Error::Internal(format!("Failed to parse job_id: {}", e)))
        })
        .collect()
}

/// Distinct Looks that have ever had a Job (default fill-missing scope)
pub async fn look_ids_with_jobs(pool: &SqlitePool) -> Result<Vec<Uuid>> {
    let rows = sqlx::query_scalar::<_, String>("SELECT DISTINCT look_id FROM jobs")
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|s| {
            Uuid::parse_str(s)
                .map_err(|e| Error::Internal(format!("Failed to parse look_id: {}", e)))
        })
        .collect()
}

/// Most recent non-terminal Job for a Look, if any (fill-missing reuse)
pub async fn active_job_for_look(pool: &SqlitePool, look_id: Uuid) -> Result<Option<Job>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM jobs
        WHERE look_id = ? AND status NOT IN ('COMPLETED', 'FAILED', 'PARTIAL', 'CANCELED')
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(look_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Update one Job's status
pub async fn update_status(pool: &SqlitePool, job_id: Uuid, status: JobStatus) -> Result<()> {
    sqlx::query("UPDATE jobs SET status = ? WHERE job_id = ?")
        .bind(status.as_str())
        .bind(job_id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

/// Set every Job in a batch to the given status (cancel path)
pub async fn set_status_for_batch(
    pool: &SqlitePool,
    batch_id: Uuid,
    status: JobStatus,
) -> Result<u64> {
    let result = sqlx::query("UPDATE jobs SET status = ? WHERE batch_id = ?")
        .bind(status.as_str())
        .bind(batch_id.to_string())
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Grow a Job's expected total (fill-missing); totals never shrink
pub async fn increase_total(pool: &SqlitePool, job_id: Uuid, additional: u32) -> Result<()> {
    sqlx::query("UPDATE jobs SET total = total + ? WHERE job_id = ?")
        .bind(additional as i64)
        .bind(job_id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_pool;

    #[tokio::test]
    async fn create_and_list() {
        let pool = init_memory_pool().await.unwrap();
        let batch_id = Uuid::new_v4();
        let job = Job::new(batch_id, Uuid::new_v4(), 3);
        create_job(&pool, &job).await.unwrap();

        let jobs = list_for_batch(&pool, batch_id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, job.job_id);
        assert_eq!(jobs[0].status, JobStatus::Pending);
        assert_eq!(jobs[0].total, 3);
    }

    #[tokio::test]
    async fn status_and_total_updates() {
        let pool = init_memory_pool().await.unwrap();
        let job = Job::new(Uuid::new_v4(), Uuid::new_v4(), 2);
        create_job(&pool, &job).await.unwrap();

        update_status(&pool, job.job_id, JobStatus::Running)
            .await
            .unwrap();
        increase_total(&pool, job.job_id, 2).await.unwrap();

        let jobs = list_for_batch(&pool, job.batch_id).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Running);
        assert_eq!(jobs[0].total, 4);
    }

    #[tokio::test]
    async fn active_job_lookup_skips_terminal() {
        let pool = init_memory_pool().await.unwrap();
        let look_id = Uuid::new_v4();

        let done = Job::new(Uuid::new_v4(), look_id, 1);
        create_job(&pool, &done).await.unwrap();
        update_status(&pool, done.job_id, JobStatus::Completed)
            .await
            .unwrap();

        assert!(active_job_for_look(&pool, look_id)
            .await
            .unwrap()
            .is_none());

        let open = Job::new(Uuid::new_v4(), look_id, 1);
        create_job(&pool, &open).await.unwrap();
        let found = active_job_for_look(&pool, look_id).await.unwrap().unwrap();
        assert_eq!(found.job_id, open.job_id);
    }
}
