//! Persistence seams of the import pipeline
//!
//! `JobStore` owns the coordination record, `LedgerSink` receives parsed
//! rows and `SummaryRefresher` rebuilds the dashboard aggregates. Postgres
//! implementations live in `db::store`; `MemoryStore` backs local replays
//! and tests.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{
    CheckpointUpdate, EstablishmentRecord, ImportJob, ImportJobStatus, JobCounts, OperationRow,
    ParticipantRow,
};

/// Row-write failure, split by whether a plain insert may still succeed
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The conflict target is unusable (missing unique index, integrity rule)
    #[error("constraint violation: {0}")]
    Constraint(String),
    /// Anything else; the invocation aborts
    #[error("database error: {0}")]
    Backend(String),
}

/// Durable job record operations.
///
/// Writes made on behalf of an invocation carry its `lease`; they return
/// `false` when a newer invocation has taken the job over.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load_job(&self, job_id: Uuid) -> Result<Option<ImportJob>>;

    async fn job_status(&self, job_id: Uuid) -> Result<Option<ImportJobStatus>>;

    /// Enter `processing` for a new invocation: bump `chunk_number` and
    /// `lease`, set `started_at` once. `None` if the job is gone or terminal.
    async fn begin_invocation(&self, job_id: Uuid) -> Result<Option<ImportJob>>;

    async fn update_progress(
        &self,
        job_id: Uuid,
        lease: i64,
        progress: i32,
        total_lines: i64,
    ) -> Result<bool>;

    async fn save_checkpoint(&self, job_id: Uuid, lease: i64, update: &CheckpointUpdate) -> Result<bool>;

    /// Non-terminal status change, refused once the job is terminal
    async fn set_status(&self, job_id: Uuid, lease: i64, status: ImportJobStatus) -> Result<bool>;

    /// `completed` with progress 100; refused if the job was cancelled or failed
    async fn complete(
        &self,
        job_id: Uuid,
        lease: i64,
        bytes_processed: i64,
        total_lines: i64,
        counts: &JobCounts,
    ) -> Result<bool>;

    /// `failed` with a message, unless already completed or cancelled
    async fn fail(&self, job_id: Uuid, lease: i64, message: &str) -> Result<bool>;

    /// `cancelled`, unless already terminal. `true` if the status changed.
    async fn cancel(&self, job_id: Uuid) -> Result<bool>;
}

/// Destination tables for parsed rows
#[async_trait]
pub trait LedgerSink: Send + Sync {
    /// Find or create the establishment for `(company, tax id)`.
    /// Returns the id and whether a row was created.
    async fn resolve_establishment(
        &self,
        company_id: Uuid,
        record: &EstablishmentRecord,
    ) -> Result<(Uuid, bool), SinkError>;

    /// Upsert on `(establishment_id, code)`; counts inserted or changed rows
    async fn upsert_participants(&self, rows: &[ParticipantRow]) -> Result<u64, SinkError>;

    async fn insert_participants(&self, rows: &[ParticipantRow]) -> Result<u64, SinkError>;

    /// Insert-or-ignore on the operation natural key; counts inserted rows
    async fn upsert_operations(&self, job_id: Uuid, rows: &[OperationRow]) -> Result<u64, SinkError>;

    async fn insert_operations(&self, job_id: Uuid, rows: &[OperationRow]) -> Result<u64, SinkError>;
}

/// Rebuilds derived summaries for a company after an import
#[async_trait]
pub trait SummaryRefresher: Send + Sync {
    async fn refresh(&self, company_id: Uuid) -> Result<()>;
}
