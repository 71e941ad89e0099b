//! Postgres-backed pipeline stores

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::services::ledger::{JobStore, LedgerSink, SinkError, SummaryRefresher};
use crate::types::{
    CheckpointUpdate, EstablishmentRecord, ImportJob, ImportJobStatus, JobCounts, OperationRow,
    ParticipantRow,
};

/// Implements every pipeline store on one connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn load_job(&self, job_id: Uuid) -> Result<Option<ImportJob>> {
        queries::import_job::get_job(&self.pool, job_id).await
    }

    async fn job_status(&self, job_id: Uuid) -> Result<Option<ImportJobStatus>> {
        queries::import_job::get_status(&self.pool, job_id).await
    }

    async fn begin_invocation(&self, job_id: Uuid) -> Result<Option<ImportJob>> {
        queries::import_job::begin_invocation(&self.pool, job_id).await
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        lease: i64,
        progress: i32,
        total_lines: i64,
    ) -> Result<bool> {
        queries::import_job::update_progress(&self.pool, job_id, lease, progress, total_lines).await
    }

    async fn save_checkpoint(&self, job_id: Uuid, lease: i64, update: &CheckpointUpdate) -> Result<bool> {
        queries::import_job::save_checkpoint(&self.pool, job_id, lease, update).await
    }

    async fn set_status(&self, job_id: Uuid, lease: i64, status: ImportJobStatus) -> Result<bool> {
        queries::import_job::set_status(&self.pool, job_id, lease, status).await
    }

    async fn complete(
        &self,
        job_id: Uuid,
        lease: i64,
        bytes_processed: i64,
        total_lines: i64,
        counts: &JobCounts,
    ) -> Result<bool> {
        queries::import_job::complete_job(&self.pool, job_id, lease, bytes_processed, total_lines, counts).await
    }

    async fn fail(&self, job_id: Uuid, lease: i64, message: &str) -> Result<bool> {
        queries::import_job::fail_job(&self.pool, job_id, lease, message).await
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        queries::import_job::cancel_job(&self.pool, job_id).await
    }
}

#[async_trait]
impl LedgerSink for PgStore {
    async fn resolve_establishment(
        &self,
        company_id: Uuid,
        record: &EstablishmentRecord,
    ) -> Result<(Uuid, bool), SinkError> {
        queries::ledger::resolve_establishment(&self.pool, company_id, record).await
    }

    async fn upsert_participants(&self, rows: &[ParticipantRow]) -> Result<u64, SinkError> {
        queries::ledger::upsert_participants(&self.pool, rows).await
    }

    async fn insert_participants(&self, rows: &[ParticipantRow]) -> Result<u64, SinkError> {
        queries::ledger::insert_participants(&self.pool, rows).await
    }

    async fn upsert_operations(&self, job_id: Uuid, rows: &[OperationRow]) -> Result<u64, SinkError> {
        queries::ledger::upsert_operations(&self.pool, job_id, rows).await
    }

    async fn insert_operations(&self, job_id: Uuid, rows: &[OperationRow]) -> Result<u64, SinkError> {
        queries::ledger::insert_operations(&self.pool, job_id, rows).await
    }
}

#[async_trait]
impl SummaryRefresher for PgStore {
    async fn refresh(&self, company_id: Uuid) -> Result<()> {
        queries::ledger::refresh_summaries(&self.pool, company_id).await
    }
}
