//! In-process store for local replays and tests
//!
//! Mirrors the Postgres semantics that matter to the pipeline: lease
//! fencing, terminal-status guards, natural-key conflicts and
//! rows-affected counting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::types::{
    CheckpointUpdate, EstablishmentRecord, ImportJob, ImportJobStatus, JobCounts, OperationKey,
    OperationRow, ParticipantRow,
};

use super::store::{JobStore, LedgerSink, SinkError, SummaryRefresher};

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, ImportJob>,
    establishments: HashMap<(Uuid, String), (Uuid, EstablishmentRecord)>,
    participants: HashMap<(Uuid, String), ParticipantRow>,
    operations: HashMap<OperationKey, (Uuid, OperationRow)>,
    refreshed: Vec<Uuid>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    reject_upserts: AtomicBool,
    break_writes: AtomicBool,
    fail_refresh: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_job(&self, job: ImportJob) {
        self.state.lock().jobs.insert(job.id, job);
    }

    pub fn job(&self, job_id: Uuid) -> Option<ImportJob> {
        self.state.lock().jobs.get(&job_id).cloned()
    }

    /// Overwrite a job's status, as another actor would
    pub fn force_status(&self, job_id: Uuid, status: ImportJobStatus) {
        if let Some(job) = self.state.lock().jobs.get_mut(&job_id) {
            job.status = status;
        }
    }

    /// Operation rows sorted by natural key fields
    pub fn operations(&self) -> Vec<OperationRow> {
        let mut rows: Vec<OperationRow> = self
            .state
            .lock()
            .operations
            .values()
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by(|a, b| {
            (&a.document_number, &a.cfop, a.competence_month)
                .cmp(&(&b.document_number, &b.cfop, b.competence_month))
        });
        rows
    }

    pub fn establishment_count(&self) -> usize {
        self.state.lock().establishments.len()
    }

    /// Companies whose summaries were refreshed, in call order
    pub fn refreshed(&self) -> Vec<Uuid> {
        self.state.lock().refreshed.clone()
    }

    /// Make keyed upserts fail with a constraint error
    pub fn reject_upserts(&self, on: bool) {
        self.reject_upserts.store(on, Ordering::SeqCst);
    }

    /// Make every row write fail with a backend error
    pub fn break_writes(&self, on: bool) {
        self.break_writes.store(on, Ordering::SeqCst);
    }

    pub fn fail_refresh(&self, on: bool) {
        self.fail_refresh.store(on, Ordering::SeqCst);
    }

    fn check_writes(&self, upsert: bool) -> Result<(), SinkError> {
        if self.break_writes.load(Ordering::SeqCst) {
            return Err(SinkError::Backend("connection reset by peer".to_string()));
        }
        if upsert && self.reject_upserts.load(Ordering::SeqCst) {
            return Err(SinkError::Constraint(
                "there is no unique or exclusion constraint matching the ON CONFLICT specification"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn write_participants(&self, rows: &[ParticipantRow]) -> u64 {
        let mut state = self.state.lock();
        let mut written = 0;
        for row in rows {
            let changed = state.participants.get(&row.key()) != Some(row);
            if changed {
                state.participants.insert(row.key(), row.clone());
                written += 1;
            }
        }
        written
    }
}

/// Lease-fenced mutation of a live job
fn with_lease<F>(state: &mut MemoryState, job_id: Uuid, lease: i64, apply: F) -> bool
where
    F: FnOnce(&mut ImportJob) -> bool,
{
    match state.jobs.get_mut(&job_id) {
        Some(job) if job.lease == lease => apply(job),
        _ => false,
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn load_job(&self, job_id: Uuid) -> Result<Option<ImportJob>> {
        Ok(self.job(job_id))
    }

    async fn job_status(&self, job_id: Uuid) -> Result<Option<ImportJobStatus>> {
        Ok(self.state.lock().jobs.get(&job_id).map(|job| job.status))
    }

    async fn begin_invocation(&self, job_id: Uuid) -> Result<Option<ImportJob>> {
        let mut state = self.state.lock();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status.is_terminal() {
            return Ok(None);
        }
        job.status = ImportJobStatus::Processing;
        job.chunk_number += 1;
        job.lease += 1;
        job.error_message = None;
        job.started_at.get_or_insert_with(Utc::now);
        Ok(Some(job.clone()))
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        lease: i64,
        progress: i32,
        total_lines: i64,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        Ok(with_lease(&mut state, job_id, lease, |job| {
            job.progress = job.progress.max(progress);
            job.total_lines = total_lines;
            true
        }))
    }

    async fn save_checkpoint(&self, job_id: Uuid, lease: i64, update: &CheckpointUpdate) -> Result<bool> {
        let mut state = self.state.lock();
        Ok(with_lease(&mut state, job_id, lease, |job| {
            job.bytes_processed = update.bytes_processed;
            job.total_lines = update.total_lines;
            job.progress = job.progress.max(update.progress);
            job.counts = update.counts.clone();
            job.checkpoint = Some(update.checkpoint.clone());
            true
        }))
    }

    async fn set_status(&self, job_id: Uuid, lease: i64, status: ImportJobStatus) -> Result<bool> {
        let mut state = self.state.lock();
        Ok(with_lease(&mut state, job_id, lease, |job| {
            if job.status.is_terminal() {
                return false;
            }
            job.status = status;
            true
        }))
    }

    async fn complete(
        &self,
        job_id: Uuid,
        lease: i64,
        bytes_processed: i64,
        total_lines: i64,
        counts: &JobCounts,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        Ok(with_lease(&mut state, job_id, lease, |job| {
            if matches!(job.status, ImportJobStatus::Failed | ImportJobStatus::Cancelled) {
                return false;
            }
            job.status = ImportJobStatus::Completed;
            job.progress = 100;
            job.bytes_processed = bytes_processed;
            job.total_lines = total_lines;
            job.counts = counts.clone();
            job.checkpoint = None;
            job.completed_at = Some(Utc::now());
            true
        }))
    }

    async fn fail(&self, job_id: Uuid, lease: i64, message: &str) -> Result<bool> {
        let mut state = self.state.lock();
        Ok(with_lease(&mut state, job_id, lease, |job| {
            if matches!(job.status, ImportJobStatus::Completed | ImportJobStatus::Cancelled) {
                return false;
            }
            job.status = ImportJobStatus::Failed;
            job.error_message = Some(message.to_string());
            job.completed_at = Some(Utc::now());
            true
        }))
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let mut state = self.state.lock();
        match state.jobs.get_mut(&job_id) {
            Some(job) if !job.status.is_terminal() => {
                job.status = ImportJobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl LedgerSink for MemoryStore {
    async fn resolve_establishment(
        &self,
        company_id: Uuid,
        record: &EstablishmentRecord,
    ) -> Result<(Uuid, bool), SinkError> {
        self.check_writes(false)?;
        let mut state = self.state.lock();
        let key = (company_id, record.tax_id.clone());
        if let Some((id, _)) = state.establishments.get(&key) {
            return Ok((*id, false));
        }
        let id = Uuid::new_v4();
        state.establishments.insert(key, (id, record.clone()));
        Ok((id, true))
    }

    async fn upsert_participants(&self, rows: &[ParticipantRow]) -> Result<u64, SinkError> {
        self.check_writes(true)?;
        Ok(self.write_participants(rows))
    }

    async fn insert_participants(&self, rows: &[ParticipantRow]) -> Result<u64, SinkError> {
        self.check_writes(false)?;
        Ok(self.write_participants(rows))
    }

    async fn upsert_operations(&self, job_id: Uuid, rows: &[OperationRow]) -> Result<u64, SinkError> {
        self.check_writes(true)?;
        let mut state = self.state.lock();
        let mut inserted = 0;
        for row in rows {
            if !state.operations.contains_key(&row.key()) {
                state.operations.insert(row.key(), (job_id, row.clone()));
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn insert_operations(&self, job_id: Uuid, rows: &[OperationRow]) -> Result<u64, SinkError> {
        self.check_writes(false)?;
        let mut state = self.state.lock();
        for row in rows {
            state.operations.insert(row.key(), (job_id, row.clone()));
        }
        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl SummaryRefresher for MemoryStore {
    async fn refresh(&self, company_id: Uuid) -> Result<()> {
        if self.fail_refresh.load(Ordering::SeqCst) {
            anyhow::bail!("summary refresh timed out");
        }
        self.state.lock().refreshed.push(company_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Checkpoint, ParsingContext};

    fn pending_job(store: &MemoryStore) -> Uuid {
        let job = ImportJob::new(Uuid::new_v4(), Uuid::new_v4(), "uploads/efd.txt", 100);
        let id = job.id;
        store.insert_job(job);
        id
    }

    #[tokio::test]
    async fn test_begin_invocation_bumps_lease_and_chunk() {
        let store = MemoryStore::new();
        let id = pending_job(&store);

        let first = store.begin_invocation(id).await.unwrap().unwrap();
        let second = store.begin_invocation(id).await.unwrap().unwrap();

        assert_eq!(first.lease + 1, second.lease);
        assert_eq!(second.chunk_number, 2);
        assert_eq!(second.status, ImportJobStatus::Processing);
        assert_eq!(first.started_at, second.started_at);
    }

    #[tokio::test]
    async fn test_stale_lease_writes_are_refused() {
        let store = MemoryStore::new();
        let id = pending_job(&store);
        let stale = store.begin_invocation(id).await.unwrap().unwrap().lease;
        store.begin_invocation(id).await.unwrap();

        let update = CheckpointUpdate {
            bytes_processed: 10,
            total_lines: 1,
            progress: 10,
            counts: JobCounts::default(),
            checkpoint: Checkpoint::new(ParsingContext::default()),
        };
        assert!(!store.save_checkpoint(id, stale, &update).await.unwrap());
        assert!(!store.update_progress(id, stale, 50, 2).await.unwrap());
        assert_eq!(store.job(id).unwrap().bytes_processed, 0);
    }

    #[tokio::test]
    async fn test_stale_lease_cannot_fail_job() {
        let store = MemoryStore::new();
        let id = pending_job(&store);
        let stale = store.begin_invocation(id).await.unwrap().unwrap().lease;
        let current = store.begin_invocation(id).await.unwrap().unwrap().lease;

        assert!(!store.fail(id, stale, "stale").await.unwrap());
        assert_eq!(store.job(id).unwrap().status, ImportJobStatus::Processing);

        assert!(store.fail(id, current, "boom").await.unwrap());
        let job = store.job(id).unwrap();
        assert_eq!(job.status, ImportJobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_cancelled_job_never_completes() {
        let store = MemoryStore::new();
        let id = pending_job(&store);
        let lease = store.begin_invocation(id).await.unwrap().unwrap().lease;

        assert!(store.cancel(id).await.unwrap());
        assert!(!store.complete(id, lease, 100, 5, &JobCounts::default()).await.unwrap());
        assert!(!store.fail(id, lease, "boom").await.unwrap());

        assert_eq!(store.job(id).unwrap().status, ImportJobStatus::Cancelled);
        assert!(store.begin_invocation(id).await.unwrap().is_none());
    }
}
