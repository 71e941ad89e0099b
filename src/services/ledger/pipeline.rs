//! Chunked, resumable import of one ledger file
//!
//! Every invocation resumes from the job's persisted byte cursor and parsing
//! context, streams lines until end of file or until its budget runs out,
//! then either completes the job or checkpoints and enqueues a continuation.
//!
//! Invariants:
//! - buffers are flushed before every checkpoint, so persisted rows always
//!   cover everything before the persisted cursor
//! - every state write carries the invocation's lease; a refused write means
//!   a newer invocation owns the job and this one stops without side effects
//! - progress stays at or below 95 until completion and never decreases

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::services::cancellation::{CancellationRegistry, JobGuard};
use crate::types::{
    Checkpoint, CheckpointUpdate, ChunkTask, ImportJob, ImportJobStatus, ImportJobStatusUpdate,
    JobCounts, ParsingContext,
};

use super::accumulator::{OperationBatch, ParticipantBatch};
use super::dispatcher::{dispatch, oversized, Emission, LineOutcome};
use super::fetcher::{FetchError, FetchOutcome, LedgerSource};
use super::framer::LineFramer;
use super::progress::{estimate_progress, Cadence, Tick};
use super::scheduler::{ChunkBudget, ContinuationScheduler};
use super::store::{JobStore, LedgerSink, SinkError, SummaryRefresher};

/// Subject prefix for per-job status updates
pub const STATUS_PREFIX: &str = "ledger.job.import.status";

/// Collaborators of the pipeline
#[derive(Clone)]
pub struct PipelineDeps {
    pub jobs: Arc<dyn JobStore>,
    pub sink: Arc<dyn LedgerSink>,
    pub refresher: Arc<dyn SummaryRefresher>,
    pub source: Arc<dyn LedgerSource>,
    pub scheduler: Arc<dyn ContinuationScheduler>,
    /// Status updates are published here when set
    pub status: Option<async_nats::Client>,
}

/// How an invocation ended
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    NotFound,
    /// The job was already terminal
    Skipped { status: ImportJobStatus },
    /// Budget exhausted; a continuation was enqueued
    Continued { counts: JobCounts },
    Completed { counts: JobCounts },
    Cancelled,
    /// Transient failure; a delayed retry was enqueued
    Retrying { attempt: u32, counts: JobCounts },
    /// A newer invocation took the job over
    Superseded,
    Failed { error: String },
}

#[derive(Debug, thiserror::Error)]
enum ChunkError {
    #[error("{0}")]
    Transient(String),
    #[error(transparent)]
    Fetch(FetchError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<FetchError> for ChunkError {
    fn from(e: FetchError) -> Self {
        if e.is_transient() {
            ChunkError::Transient(e.to_string())
        } else {
            ChunkError::Fetch(e)
        }
    }
}

enum ChunkEnd {
    Eof,
    Budget,
    Cancelled,
    Superseded,
}

pub struct ImportPipeline {
    deps: PipelineDeps,
    config: PipelineConfig,
    cadence: Cadence,
    cancellation: CancellationRegistry,
}

impl ImportPipeline {
    pub fn new(deps: PipelineDeps, config: PipelineConfig, cancellation: CancellationRegistry) -> Self {
        let cadence = Cadence::new(config.progress_interval_lines, config.checkpoint_interval_lines);
        Self {
            deps,
            config,
            cadence,
            cancellation,
        }
    }

    pub fn cancellation(&self) -> &CancellationRegistry {
        &self.cancellation
    }

    /// Run one invocation of the job named by `task`
    pub async fn invoke(&self, task: &ChunkTask) -> Result<Invocation> {
        let job_id = task.job_id;

        let Some(job) = self.deps.jobs.load_job(job_id).await? else {
            warn!("Import job {} not found", job_id);
            return Ok(Invocation::NotFound);
        };
        if job.status.is_terminal() {
            info!("Import job {} is already {}, nothing to do", job_id, job.status);
            return Ok(Invocation::Skipped { status: job.status });
        }

        let Some(job) = self.deps.jobs.begin_invocation(job_id).await? else {
            return Ok(match self.deps.jobs.job_status(job_id).await? {
                Some(status) => Invocation::Skipped { status },
                None => Invocation::NotFound,
            });
        };

        let guard = self.cancellation.register(job_id, job.user_id);
        info!(
            "Import job {} chunk {} starting at byte {} of {} (attempt {})",
            job_id, job.chunk_number, job.bytes_processed, job.file_size, task.attempt
        );
        self.publish_status(&job, ImportJobStatus::Processing).await;

        let mut run = ChunkRun::new(self, &guard, job);
        let outcome = run.execute().await;
        run.log_summary();
        self.settle(task, run, outcome).await
    }

    async fn settle(
        &self,
        task: &ChunkTask,
        mut run: ChunkRun<'_>,
        outcome: Result<ChunkEnd, ChunkError>,
    ) -> Result<Invocation> {
        let job_id = run.job.id;
        let lease = run.job.lease;

        match outcome {
            Ok(ChunkEnd::Budget) => {
                info!(
                    "Import job {} chunk {} stopped after {} lines in {:?}, continuing",
                    job_id,
                    run.job.chunk_number,
                    run.lines,
                    run.budget.elapsed()
                );
                if let Err(e) = self.deps.scheduler.schedule(ChunkTask::new(job_id), None).await {
                    return self.fail(job_id, lease, format!("failed to enqueue continuation: {}", e)).await;
                }
                Ok(Invocation::Continued { counts: run.counts })
            }
            Ok(ChunkEnd::Eof) => self.complete(&mut run).await,
            Ok(ChunkEnd::Cancelled) => {
                self.deps.jobs.cancel(job_id).await?;
                info!("Import job {} cancelled after {} lines", job_id, run.total_lines);
                Ok(Invocation::Cancelled)
            }
            Ok(ChunkEnd::Superseded) => {
                warn!("Import job {} was taken over by a newer invocation", job_id);
                Ok(Invocation::Superseded)
            }
            Err(ChunkError::Transient(message)) => {
                let resumable = run.job.checkpoint.is_some() || run.checkpointed;
                let attempt = task.attempt + 1;
                if !resumable || attempt > self.config.max_transient_retries {
                    return self.fail(job_id, lease, message).await;
                }
                // Only the lease holder may start a retry chain
                if !self
                    .deps
                    .jobs
                    .set_status(job_id, lease, ImportJobStatus::Processing)
                    .await?
                {
                    return self.lost_ownership(job_id).await;
                }

                let delay = self.config.transient_retry_delay.saturating_mul(attempt);
                warn!(
                    "Import job {} hit a transient error ({}), retry {}/{} in {:?}",
                    job_id, message, attempt, self.config.max_transient_retries, delay
                );
                if let Err(e) = self
                    .deps
                    .scheduler
                    .schedule(ChunkTask::retry(job_id, attempt), Some(delay))
                    .await
                {
                    return self.fail(job_id, lease, format!("{} (retry not enqueued: {})", message, e)).await;
                }
                Ok(Invocation::Retrying {
                    attempt,
                    counts: run.counts,
                })
            }
            Err(e) => self.fail(job_id, lease, e.to_string()).await,
        }
    }

    async fn complete(&self, run: &mut ChunkRun<'_>) -> Result<Invocation> {
        let job = &run.job;

        if !self
            .deps
            .jobs
            .set_status(job.id, job.lease, ImportJobStatus::RefreshingViews)
            .await?
        {
            return self.lost_ownership(job.id).await;
        }
        self.publish_status(job, ImportJobStatus::RefreshingViews).await;

        let refreshed = match self.deps.refresher.refresh(job.company_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Summary refresh for company {} failed: {}", job.company_id, e);
                false
            }
        };
        run.counts.refresh_success = Some(refreshed);

        if !self
            .deps
            .jobs
            .complete(job.id, job.lease, run.bytes_processed, run.total_lines, &run.counts)
            .await?
        {
            return self.lost_ownership(job.id).await;
        }

        let mut done = job.clone();
        done.progress = 100;
        done.total_lines = run.total_lines;
        done.bytes_processed = run.bytes_processed;
        done.counts = run.counts.clone();
        self.publish_status(&done, ImportJobStatus::Completed).await;

        if let Err(e) = self.deps.source.remove(&job.file_path).await {
            warn!("Could not remove '{}' after import: {}", job.file_path, e);
        }

        info!(
            "Import job {} completed: {} lines, {} establishments, {} participants, {} operations, {} skipped",
            job.id,
            run.total_lines,
            run.counts.establishments,
            run.counts.participants,
            run.counts.operations,
            run.counts.skipped_lines
        );
        Ok(Invocation::Completed {
            counts: run.counts.clone(),
        })
    }

    async fn lost_ownership(&self, job_id: Uuid) -> Result<Invocation> {
        Ok(match self.deps.jobs.job_status(job_id).await? {
            Some(ImportJobStatus::Cancelled) | None => Invocation::Cancelled,
            _ => Invocation::Superseded,
        })
    }

    async fn fail(&self, job_id: Uuid, lease: i64, error: String) -> Result<Invocation> {
        if !self.deps.jobs.fail(job_id, lease, &error).await? {
            debug!("Import job {} failure ({}) dropped, lease {} is stale", job_id, error, lease);
            return self.lost_ownership(job_id).await;
        }
        warn!("Import job {} failed: {}", job_id, error);
        Ok(Invocation::Failed { error })
    }

    async fn publish_status(&self, job: &ImportJob, status: ImportJobStatus) {
        let Some(client) = &self.deps.status else {
            return;
        };
        let update = ImportJobStatusUpdate {
            job_id: job.id,
            timestamp: chrono::Utc::now(),
            status,
            progress: job.progress,
            total_lines: job.total_lines,
            bytes_processed: job.bytes_processed,
            chunk_number: job.chunk_number,
            counts: job.counts.clone(),
        };
        let subject = format!("{}.{}", STATUS_PREFIX, job.id);
        match serde_json::to_vec(&update) {
            Ok(payload) => {
                if let Err(e) = client.publish(subject, payload.into()).await {
                    warn!("Failed to publish status for job {}: {}", job.id, e);
                }
            }
            Err(e) => warn!("Failed to encode status for job {}: {}", job.id, e),
        }
    }
}

fn classify(context: &mut ParsingContext, bytes: &[u8], too_long: bool) -> LineOutcome {
    if too_long {
        oversized(context, bytes)
    } else {
        dispatch(context, bytes)
    }
}

/// State of a single invocation
struct ChunkRun<'a> {
    pipeline: &'a ImportPipeline,
    guard: &'a JobGuard,
    job: ImportJob,
    context: ParsingContext,
    counts: JobCounts,
    operations: OperationBatch,
    participants: ParticipantBatch,
    /// Absolute offset just past the last dispatched line
    bytes_processed: i64,
    total_lines: i64,
    /// Lines dispatched by this invocation
    lines: u64,
    progress: i32,
    checkpointed: bool,
    budget: ChunkBudget,
    /// Counters when the invocation started, for the chunk summary
    counts_at_start: JobCounts,
    bytes_at_start: i64,
}

impl<'a> ChunkRun<'a> {
    fn new(pipeline: &'a ImportPipeline, guard: &'a JobGuard, job: ImportJob) -> Self {
        let config = &pipeline.config;
        let restored = job.checkpoint.clone().and_then(Checkpoint::into_context);

        let (context, bytes_processed, total_lines, counts) = match restored {
            Some(context) => (context, job.bytes_processed, job.total_lines, job.counts.clone()),
            None if job.bytes_processed > 0 => {
                warn!(
                    "Import job {} has no usable checkpoint at byte {}, restarting from the beginning",
                    job.id, job.bytes_processed
                );
                (ParsingContext::default(), 0, 0, JobCounts::default())
            }
            None => (ParsingContext::default(), 0, 0, job.counts.clone()),
        };

        Self {
            pipeline,
            guard,
            operations: OperationBatch::new(job.id, config.batch_size),
            participants: ParticipantBatch::new(config.batch_size),
            progress: job.progress,
            budget: ChunkBudget::new(config.chunk_time_budget, config.chunk_max_lines),
            context,
            counts_at_start: counts.clone(),
            bytes_at_start: bytes_processed,
            counts,
            bytes_processed,
            total_lines,
            lines: 0,
            checkpointed: false,
            job,
        }
    }

    async fn execute(&mut self) -> Result<ChunkEnd, ChunkError> {
        let source = Arc::clone(&self.pipeline.deps.source);
        let opened = source
            .open(&self.job.file_path, self.bytes_processed as u64)
            .await?;

        let (mut body, skip) = match opened {
            FetchOutcome::Stream { body, skip } => (body, skip),
            FetchOutcome::AlreadyConsumed => {
                debug!("Import job {} has no bytes left past {}", self.job.id, self.bytes_processed);
                return Ok(ChunkEnd::Eof);
            }
        };

        let mut framer = LineFramer::with_max_line(self.pipeline.config.max_line_bytes);
        framer.skip_bytes(skip);
        let stall_timeout = self.pipeline.config.read_stall_timeout;

        loop {
            let wait = stall_timeout.min(self.budget.remaining());
            let chunk = match tokio::time::timeout(wait, body.next()).await {
                Ok(Some(chunk)) => chunk?,
                Ok(None) => break,
                Err(_) if self.budget.remaining().is_zero() => {
                    debug!("Import job {} budget ran out waiting for data", self.job.id);
                    return self.stop_for_budget().await;
                }
                Err(_) => {
                    return Err(FetchError::Transport {
                        message: format!("no data received for {:?}", wait),
                        transient: true,
                    }
                    .into())
                }
            };

            framer.push(&chunk);
            while let Some(line) = framer.next_line() {
                let consumed = line.consumed;
                let outcome = classify(&mut self.context, line.bytes, line.oversized);
                if let Some(end) = self.after_line(outcome, consumed).await? {
                    return Ok(end);
                }
            }
        }

        if let Some(line) = framer.finish() {
            let consumed = line.consumed;
            let outcome = classify(&mut self.context, line.bytes, line.oversized);
            if let Some(end) = self.after_line(outcome, consumed).await? {
                return Ok(end);
            }
        }

        self.flush().await?;
        Ok(ChunkEnd::Eof)
    }

    fn log_summary(&self) {
        let start = &self.counts_at_start;
        info!(
            "Import job {} chunk {}: {} lines, {} bytes, {} operations, {} participants, {} establishments in {:?}",
            self.job.id,
            self.job.chunk_number,
            self.lines,
            self.bytes_processed - self.bytes_at_start,
            self.counts.operations.saturating_sub(start.operations),
            self.counts.participants.saturating_sub(start.participants),
            self.counts.establishments.saturating_sub(start.establishments),
            self.budget.elapsed()
        );
        let skipped = self.counts.skipped_lines.saturating_sub(start.skipped_lines);
        if skipped > 0 {
            warn!(
                "Import job {} chunk {} skipped {} malformed line(s)",
                self.job.id, self.job.chunk_number, skipped
            );
        }
    }

    /// Apply a dispatched line, then run the periodic duties
    async fn after_line(&mut self, outcome: LineOutcome, consumed: usize) -> Result<Option<ChunkEnd>, ChunkError> {
        self.apply(outcome).await?;
        self.bytes_processed += consumed as i64;
        self.total_lines += 1;
        self.lines += 1;

        let tick = self.pipeline.cadence.tick(self.lines);
        if tick != Tick::None && self.is_cancelled().await? {
            self.operations.discard();
            self.participants.discard();
            return Ok(Some(ChunkEnd::Cancelled));
        }

        if self.budget.exhausted(self.lines) {
            return self.stop_for_budget().await.map(Some);
        }

        let kept = match tick {
            Tick::None => true,
            Tick::Progress => self.report_progress().await?,
            Tick::Checkpoint => self.checkpoint().await?,
        };
        Ok((!kept).then_some(ChunkEnd::Superseded))
    }

    /// Checkpoint so the continuation resumes here
    async fn stop_for_budget(&mut self) -> Result<ChunkEnd, ChunkError> {
        Ok(if self.checkpoint().await? {
            ChunkEnd::Budget
        } else {
            ChunkEnd::Superseded
        })
    }

    async fn apply(&mut self, outcome: LineOutcome) -> Result<(), ChunkError> {
        let sink = Arc::clone(&self.pipeline.deps.sink);

        match outcome {
            LineOutcome::Ignored | LineOutcome::Updated => {}
            LineOutcome::Rejected(reason) => {
                tracing::trace!("Line {} rejected: {}", self.total_lines + 1, reason);
            }
            LineOutcome::Malformed { tag, reason } => {
                self.counts.skipped_lines += 1;
                debug!(
                    "Import job {} skipped malformed {} at line {}: {}",
                    self.job.id,
                    tag.code(),
                    self.total_lines + 1,
                    reason
                );
            }
            LineOutcome::Emit(Emission::Establishment(record)) => {
                let (id, created) = sink.resolve_establishment(self.job.company_id, &record).await?;
                if created {
                    self.counts.establishments += 1;
                    debug!("Created establishment {} for tax id {}", id, record.tax_id);
                }
                self.context.bind_establishment(&record.tax_id, id);
            }
            LineOutcome::Emit(Emission::Participant(row)) => {
                self.participants.push(row);
                if self.participants.is_full() {
                    self.counts.participants += self.participants.flush(sink.as_ref()).await?;
                }
            }
            LineOutcome::Emit(Emission::Operation(row)) => {
                self.operations.push(row);
                if self.operations.is_full() {
                    self.counts.operations += self.operations.flush(sink.as_ref()).await?;
                }
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        let sink = Arc::clone(&self.pipeline.deps.sink);
        self.counts.participants += self.participants.flush(sink.as_ref()).await?;
        self.counts.operations += self.operations.flush(sink.as_ref()).await?;
        Ok(())
    }

    async fn is_cancelled(&self) -> Result<bool> {
        if self.guard.is_cancelled() {
            return Ok(true);
        }
        let status = self.pipeline.deps.jobs.job_status(self.job.id).await?;
        Ok(matches!(status, Some(ImportJobStatus::Cancelled) | None))
    }

    fn snapshot(&mut self) -> &ImportJob {
        self.progress = estimate_progress(
            self.job.file_size,
            self.bytes_processed,
            self.total_lines,
            self.progress,
        );
        self.job.progress = self.progress;
        self.job.total_lines = self.total_lines;
        self.job.bytes_processed = self.bytes_processed;
        self.job.counts = self.counts.clone();
        &self.job
    }

    /// Persist the progress estimate; `false` if the lease was lost
    async fn report_progress(&mut self) -> Result<bool> {
        let jobs = Arc::clone(&self.pipeline.deps.jobs);
        let job = self.snapshot().clone();

        let kept = jobs
            .update_progress(job.id, job.lease, job.progress, job.total_lines)
            .await?;
        if kept {
            self.pipeline.publish_status(&job, ImportJobStatus::Processing).await;
        }
        Ok(kept)
    }

    /// Flush buffers and persist cursor, counters and context together
    async fn checkpoint(&mut self) -> Result<bool, ChunkError> {
        self.flush().await?;

        let jobs = Arc::clone(&self.pipeline.deps.jobs);
        let job = self.snapshot().clone();
        let update = CheckpointUpdate {
            bytes_processed: job.bytes_processed,
            total_lines: job.total_lines,
            progress: job.progress,
            counts: job.counts.clone(),
            checkpoint: Checkpoint::new(self.context.clone()),
        };

        let kept = jobs.save_checkpoint(job.id, job.lease, &update).await?;
        if kept {
            self.checkpointed = true;
            debug!(
                "Import job {} checkpoint at byte {} (line {}, {}%)",
                job.id, job.bytes_processed, job.total_lines, job.progress
            );
            self.pipeline.publish_status(&job, ImportJobStatus::Processing).await;
        }
        Ok(kept)
    }
}
