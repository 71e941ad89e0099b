//! Import job types
//!
//! `ImportJob` is the durable coordination record shared with the dashboard:
//! the upload step creates it, the pipeline mutates it, the UI polls it.
//! Display counters (`JobCounts`) and the resumable parsing snapshot
//! (`Checkpoint`) are stored in separate columns.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ledger::Checkpoint;

// ==========================================================================
// Job status
// ==========================================================================

/// Lifecycle of an import job.
///
/// `pending → processing → (refreshing_views) → completed | failed | cancelled`.
/// `processing` is re-entered once per chunk invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportJobStatus {
    Pending,
    Processing,
    /// Used by the upload step while it prepares the file; never entered here
    Generating,
    RefreshingViews,
    Completed,
    Failed,
    Cancelled,
}

impl ImportJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportJobStatus::Pending => "pending",
            ImportJobStatus::Processing => "processing",
            ImportJobStatus::Generating => "generating",
            ImportJobStatus::RefreshingViews => "refreshing_views",
            ImportJobStatus::Completed => "completed",
            ImportJobStatus::Failed => "failed",
            ImportJobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states never transition further
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ImportJobStatus::Completed | ImportJobStatus::Failed | ImportJobStatus::Cancelled
        )
    }
}

impl fmt::Display for ImportJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportJobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ImportJobStatus::Pending),
            "processing" => Ok(ImportJobStatus::Processing),
            "generating" => Ok(ImportJobStatus::Generating),
            "refreshing_views" => Ok(ImportJobStatus::RefreshingViews),
            "completed" => Ok(ImportJobStatus::Completed),
            "failed" => Ok(ImportJobStatus::Failed),
            "cancelled" => Ok(ImportJobStatus::Cancelled),
            other => anyhow::bail!("unknown import job status '{}'", other),
        }
    }
}

// ==========================================================================
// Counters
// ==========================================================================

/// UI-facing counters, one per destination entity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobCounts {
    pub establishments: u64,
    pub participants: u64,
    pub operations: u64,
    pub skipped_lines: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_success: Option<bool>,
}

// ==========================================================================
// Import job
// ==========================================================================

/// Durable import job row. Serializes to the wire shape the dashboard reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub company_id: Uuid,
    pub establishment_id: Option<Uuid>,
    pub file_path: String,
    pub file_size: i64,
    pub file_name: String,
    pub status: ImportJobStatus,
    pub progress: i32,
    pub total_lines: i64,
    pub bytes_processed: i64,
    pub chunk_number: i32,
    pub counts: JobCounts,
    #[serde(skip)]
    pub checkpoint: Option<Checkpoint>,
    #[serde(skip)]
    pub lease: i64,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportJob {
    /// Fresh pending job, as the upload step would create it
    pub fn new(user_id: Uuid, company_id: Uuid, file_path: impl Into<String>, file_size: i64) -> Self {
        let file_path = file_path.into();
        let file_name = file_path
            .rsplit('/')
            .next()
            .unwrap_or(file_path.as_str())
            .to_string();
        Self {
            id: Uuid::new_v4(),
            user_id,
            company_id,
            establishment_id: None,
            file_path,
            file_size,
            file_name,
            status: ImportJobStatus::Pending,
            progress: 0,
            total_lines: 0,
            bytes_processed: 0,
            chunk_number: 0,
            counts: JobCounts::default(),
            checkpoint: None,
            lease: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Checkpoint write issued by the pipeline at chunk boundaries
#[derive(Debug, Clone)]
pub struct CheckpointUpdate {
    pub bytes_processed: i64,
    pub total_lines: i64,
    pub progress: i32,
    pub counts: JobCounts,
    pub checkpoint: Checkpoint,
}

// ==========================================================================
// Queue + NATS payloads
// ==========================================================================

/// Continuation task carried by the work queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkTask {
    pub job_id: Uuid,
    /// Consecutive transient-failure retries that led to this task
    #[serde(default)]
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the task may run; set for delayed retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
}

impl ChunkTask {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            attempt: 0,
            enqueued_at: Utc::now(),
            not_before: None,
        }
    }

    pub fn retry(job_id: Uuid, attempt: u32) -> Self {
        Self {
            job_id,
            attempt,
            enqueued_at: Utc::now(),
            not_before: None,
        }
    }

    /// Hold the task back until `delay` after its enqueue time
    pub fn delayed_by(mut self, delay: Duration) -> Self {
        self.not_before = chrono::Duration::from_std(delay)
            .ok()
            .map(|delay| self.enqueued_at + delay);
        self
    }

    /// Time left before the task may run, if any
    pub fn wait_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let not_before = self.not_before?;
        (not_before - now).to_std().ok().filter(|left| !left.is_zero())
    }
}

/// Payload of `ledger.import.process`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessImportRequest {
    pub job_id: Uuid,
}

/// Payload of `ledger.import.cancel`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelImportRequest {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelImportResponse {
    pub job_id: Uuid,
    pub cancelled: bool,
    pub message: String,
}

/// Success body of an invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationReply {
    pub success: bool,
    pub message: String,
    pub counts: JobCounts,
}

/// Status update published after each persisted progress change
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJobStatusUpdate {
    pub job_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub status: ImportJobStatus,
    pub progress: i32,
    pub total_lines: i64,
    pub bytes_processed: i64,
    pub chunk_number: i32,
    pub counts: JobCounts,
}
