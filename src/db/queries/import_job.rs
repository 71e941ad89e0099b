//! Import job queries
//!
//! Writes issued on behalf of an invocation are fenced on `lease`; callers
//! read `rows_affected() == 1` as "this invocation still owns the job".

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::types::{Checkpoint, CheckpointUpdate, ImportJob, ImportJobStatus, JobCounts};

const JOB_COLUMNS: &str = "id, user_id, company_id, establishment_id, file_path, file_size, file_name, \
     status, progress, total_lines, bytes_processed, chunk_number, counts, checkpoint, lease, \
     error_message, started_at, completed_at";

#[derive(sqlx::FromRow)]
struct ImportJobRow {
    id: Uuid,
    user_id: Uuid,
    company_id: Uuid,
    establishment_id: Option<Uuid>,
    file_path: String,
    file_size: i64,
    file_name: String,
    status: String,
    progress: i32,
    total_lines: i64,
    bytes_processed: i64,
    chunk_number: i32,
    counts: Json<JobCounts>,
    checkpoint: Option<Json<serde_json::Value>>,
    lease: i64,
    error_message: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ImportJobRow> for ImportJob {
    type Error = anyhow::Error;

    fn try_from(row: ImportJobRow) -> Result<Self> {
        let checkpoint = row.checkpoint.and_then(|Json(value)| {
            serde_json::from_value::<Checkpoint>(value)
                .map_err(|e| warn!("Ignoring unreadable checkpoint of job {}: {}", row.id, e))
                .ok()
        });

        Ok(ImportJob {
            id: row.id,
            user_id: row.user_id,
            company_id: row.company_id,
            establishment_id: row.establishment_id,
            file_path: row.file_path,
            file_size: row.file_size,
            file_name: row.file_name,
            status: row.status.parse()?,
            progress: row.progress,
            total_lines: row.total_lines,
            bytes_processed: row.bytes_processed,
            chunk_number: row.chunk_number,
            counts: row.counts.0,
            checkpoint,
            lease: row.lease,
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

/// Get a job by id
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<ImportJob>> {
    let row: Option<ImportJobRow> =
        sqlx::query_as(&format!("SELECT {} FROM import_jobs WHERE id = $1", JOB_COLUMNS))
            .bind(job_id)
            .fetch_optional(pool)
            .await?;

    row.map(ImportJob::try_from).transpose()
}

pub async fn get_status(pool: &PgPool, job_id: Uuid) -> Result<Option<ImportJobStatus>> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM import_jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    status.map(|s| s.parse()).transpose()
}

/// Claim the job for a new invocation
pub async fn begin_invocation(pool: &PgPool, job_id: Uuid) -> Result<Option<ImportJob>> {
    let row: Option<ImportJobRow> = sqlx::query_as(&format!(
        r#"
        UPDATE import_jobs
        SET status = 'processing',
            chunk_number = chunk_number + 1,
            lease = lease + 1,
            started_at = COALESCE(started_at, NOW()),
            error_message = NULL,
            updated_at = NOW()
        WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
        RETURNING {}
        "#,
        JOB_COLUMNS
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.map(ImportJob::try_from).transpose()
}

pub async fn update_progress(
    pool: &PgPool,
    job_id: Uuid,
    lease: i64,
    progress: i32,
    total_lines: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE import_jobs
        SET progress = GREATEST(progress, $3), total_lines = $4, updated_at = NOW()
        WHERE id = $1 AND lease = $2
        "#,
    )
    .bind(job_id)
    .bind(lease)
    .bind(progress)
    .bind(total_lines)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn save_checkpoint(pool: &PgPool, job_id: Uuid, lease: i64, update: &CheckpointUpdate) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE import_jobs
        SET bytes_processed = $3,
            total_lines = $4,
            progress = GREATEST(progress, $5),
            counts = $6,
            checkpoint = $7,
            updated_at = NOW()
        WHERE id = $1 AND lease = $2
        "#,
    )
    .bind(job_id)
    .bind(lease)
    .bind(update.bytes_processed)
    .bind(update.total_lines)
    .bind(update.progress)
    .bind(Json(&update.counts))
    .bind(Json(&update.checkpoint))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn set_status(pool: &PgPool, job_id: Uuid, lease: i64, status: ImportJobStatus) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE import_jobs
        SET status = $3, updated_at = NOW()
        WHERE id = $1 AND lease = $2 AND status NOT IN ('completed', 'failed', 'cancelled')
        "#,
    )
    .bind(job_id)
    .bind(lease)
    .bind(status.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn complete_job(
    pool: &PgPool,
    job_id: Uuid,
    lease: i64,
    bytes_processed: i64,
    total_lines: i64,
    counts: &JobCounts,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE import_jobs
        SET status = 'completed',
            progress = 100,
            bytes_processed = $3,
            total_lines = $4,
            counts = $5,
            checkpoint = NULL,
            completed_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND lease = $2 AND status NOT IN ('failed', 'cancelled')
        "#,
    )
    .bind(job_id)
    .bind(lease)
    .bind(bytes_processed)
    .bind(total_lines)
    .bind(Json(counts))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn fail_job(pool: &PgPool, job_id: Uuid, lease: i64, message: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE import_jobs
        SET status = 'failed', error_message = $3, completed_at = NOW(), updated_at = NOW()
        WHERE id = $1 AND lease = $2 AND status NOT IN ('completed', 'cancelled')
        "#,
    )
    .bind(job_id)
    .bind(lease)
    .bind(message)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn cancel_job(pool: &PgPool, job_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE import_jobs
        SET status = 'cancelled', completed_at = NOW(), updated_at = NOW()
        WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}
