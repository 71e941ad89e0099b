//! Ledger import JetStream processor
//!
//! Continuations travel through a JetStream work queue so a chunk survives
//! worker restarts. Each message names a job; the worker runs one pipeline
//! invocation for it.
//!
//! ## Streams
//! - `LEDGER_IMPORT_CHUNKS` - continuation and retry tasks

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_nats::jetstream::{self, AckKind, Context as JsContext};
use async_nats::Client;
use chrono::Utc;
use futures::StreamExt;
use sqlx::PgPool;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{PipelineConfig, StorageConfig};
use crate::db::PgStore;
use crate::services::cancellation::{CancelError, CancellationRegistry, CANCELLATION};
use crate::services::ledger::{
    HttpLedgerSource, ImportPipeline, Invocation, JetStreamScheduler, JobStore, PipelineDeps,
    CHUNK_SUBJECT,
};
use crate::types::{ChunkTask, ImportJobStatus};

const STREAM_NAME: &str = "LEDGER_IMPORT_CHUNKS";
const CONSUMER_NAME: &str = "ledger_chunk_workers";

/// Redelivery deadline of an unacked task; kept alive by heartbeats
const ACK_WAIT: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Deliveries include deferrals of delayed retries
const MAX_DELIVER: i64 = 20;
const ERROR_REDELIVERY_DELAY: Duration = Duration::from_secs(15);

/// Import processor wiring the pipeline to Postgres, storage and JetStream
pub struct ImportProcessor {
    js: JsContext,
    jobs: Arc<dyn JobStore>,
    pipeline: Arc<ImportPipeline>,
}

impl ImportProcessor {
    /// Create the processor, initializing the JetStream stream
    pub async fn new(
        client: Client,
        pool: PgPool,
        storage: &StorageConfig,
        config: PipelineConfig,
    ) -> Result<Self> {
        let js = jetstream::new(client.clone());

        let stream_config = jetstream::stream::Config {
            name: STREAM_NAME.to_string(),
            subjects: vec![CHUNK_SUBJECT.to_string()],
            max_messages: 10_000,
            max_age: Duration::from_secs(7 * 24 * 3600),
            retention: jetstream::stream::RetentionPolicy::WorkQueue,
            ..Default::default()
        };
        js.get_or_create_stream(stream_config).await?;
        info!("JetStream import stream '{}' ready", STREAM_NAME);

        let store = Arc::new(PgStore::new(pool));
        let source = HttpLedgerSource::new(
            &storage.url,
            &storage.service_key,
            &storage.bucket,
            config.signed_url_ttl,
        )?;

        let deps = PipelineDeps {
            jobs: store.clone(),
            sink: store.clone(),
            refresher: store.clone(),
            source: Arc::new(source),
            scheduler: Arc::new(JetStreamScheduler::new(js.clone())),
            status: Some(client),
        };

        Ok(Self {
            js,
            jobs: store,
            pipeline: Arc::new(ImportPipeline::new(deps, config, CANCELLATION.clone())),
        })
    }

    pub fn pipeline(&self) -> Arc<ImportPipeline> {
        Arc::clone(&self.pipeline)
    }

    pub fn jobs(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.jobs)
    }

    /// Run one invocation for a task
    pub async fn invoke(&self, task: ChunkTask) -> Result<Invocation> {
        self.pipeline.invoke(&task).await
    }

    /// Consume continuation tasks, one invocation at a time.
    ///
    /// A task is acked only after its invocation returns; heartbeats keep it
    /// leased meanwhile, so a worker that dies mid-chunk leaves the task to
    /// be redelivered and resumed from the job's checkpoint.
    pub async fn start_processing(self: Arc<Self>) -> Result<()> {
        let stream = self.js.get_stream(STREAM_NAME).await?;

        let consumer_config = jetstream::consumer::pull::Config {
            durable_name: Some(CONSUMER_NAME.to_string()),
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ack_wait: ACK_WAIT,
            max_deliver: MAX_DELIVER,
            filter_subject: CHUNK_SUBJECT.to_string(),
            ..Default::default()
        };
        let consumer = stream.get_or_create_consumer(CONSUMER_NAME, consumer_config).await?;
        info!("JetStream import consumer '{}' ready", CONSUMER_NAME);

        let mut messages = consumer.messages().await?;
        while let Some(msg) = messages.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    error!("Error receiving import task: {}", e);
                    continue;
                }
            };

            let task: ChunkTask = match serde_json::from_slice(&msg.payload) {
                Ok(task) => task,
                Err(e) => {
                    warn!("Dropping malformed import task: {}", e);
                    if let Err(e) = msg.ack_with(AckKind::Term).await {
                        error!("Failed to terminate malformed import task: {:?}", e);
                    }
                    continue;
                }
            };

            // Delayed retries wait in the stream, not in this process
            if let Some(wait) = task.wait_remaining(Utc::now()) {
                debug!("Import task for job {} not due for {:?}", task.job_id, wait);
                if let Err(e) = msg.ack_with(AckKind::Nak(Some(wait))).await {
                    error!("Failed to defer import task for job {}: {:?}", task.job_id, e);
                }
                continue;
            }

            let started = Instant::now();
            let invocation = self.pipeline.invoke(&task);
            tokio::pin!(invocation);
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;

            let result = loop {
                tokio::select! {
                    result = &mut invocation => break result,
                    _ = heartbeat.tick() => {
                        if let Err(e) = msg.ack_with(AckKind::Progress).await {
                            warn!("Failed to extend lease of import task for job {}: {:?}", task.job_id, e);
                        }
                    }
                }
            };

            match result {
                Ok(outcome) => {
                    info!(
                        "Import task for job {} finished in {}ms: {}",
                        task.job_id,
                        started.elapsed().as_millis(),
                        describe(&outcome)
                    );
                    if let Err(e) = msg.ack().await {
                        error!("Failed to ack import task for job {}: {:?}", task.job_id, e);
                    }
                }
                Err(e) => {
                    // Store or broker trouble: let JetStream redeliver (up to max_deliver)
                    error!("Import task for job {} errored: {:#}", task.job_id, e);
                    if let Err(e) = msg.ack_with(AckKind::Nak(Some(ERROR_REDELIVERY_DELAY))).await {
                        error!("Failed to nak import task for job {}: {:?}", task.job_id, e);
                    }
                }
            }
        }

        Ok(())
    }
}

/// One-line summary of an invocation, for logs and replies
pub fn describe(outcome: &Invocation) -> String {
    match outcome {
        Invocation::NotFound => "job not found".to_string(),
        Invocation::Skipped { status } => format!("job already {}", status),
        Invocation::Continued { counts } => {
            format!("chunk processed ({} operations so far), continuing", counts.operations)
        }
        Invocation::Completed { counts } => format!(
            "import completed: {} operations, {} participants, {} establishments",
            counts.operations, counts.participants, counts.establishments
        ),
        Invocation::Cancelled => "import cancelled".to_string(),
        Invocation::Retrying { attempt, .. } => {
            format!("transient failure, retry {} scheduled", attempt)
        }
        Invocation::Superseded => "superseded by a newer invocation".to_string(),
        Invocation::Failed { error } => format!("import failed: {}", error),
    }
}

/// Result of a cancel request
#[derive(Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    NotFound,
    /// Caller does not own the job
    Forbidden,
    Cancelled,
    /// Nothing to cancel; the job is already terminal
    AlreadyFinished(ImportJobStatus),
}

/// Mark the job cancelled and signal a running invocation in this process
pub async fn cancel_import(
    jobs: &dyn JobStore,
    registry: &CancellationRegistry,
    job_id: Uuid,
    caller: Option<Uuid>,
) -> Result<CancelOutcome> {
    let Some(job) = jobs.load_job(job_id).await? else {
        return Ok(CancelOutcome::NotFound);
    };
    if caller.map_or(false, |c| c != job.user_id) {
        return Ok(CancelOutcome::Forbidden);
    }
    if job.status.is_terminal() {
        return Ok(CancelOutcome::AlreadyFinished(job.status));
    }

    if !jobs.cancel(job_id).await? {
        let status = jobs.job_status(job_id).await?.unwrap_or(job.status);
        return Ok(CancelOutcome::AlreadyFinished(status));
    }
    match registry.cancel(&job_id, job.user_id) {
        Ok(true) => info!("Signalled running invocation of job {}", job_id),
        Ok(false) => {}
        Err(CancelError::NotOwner) => warn!("Cancel token of job {} has a different owner", job_id),
    }
    info!("Import job {} cancelled", job_id);
    Ok(CancelOutcome::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ledger::MemoryStore;
    use crate::types::{ImportJob, JobCounts};

    fn store_with_job() -> (MemoryStore, ImportJob) {
        let store = MemoryStore::new();
        let job = ImportJob::new(Uuid::new_v4(), Uuid::new_v4(), "uploads/efd.txt", 10);
        store.insert_job(job.clone());
        (store, job)
    }

    #[tokio::test]
    async fn test_owner_cancels_running_job() {
        let (store, job) = store_with_job();
        let registry = CancellationRegistry::default();
        let guard = registry.register(job.id, job.user_id);

        let outcome = cancel_import(&store, &registry, job.id, Some(job.user_id)).await.unwrap();

        assert_eq!(outcome, CancelOutcome::Cancelled);
        assert!(guard.is_cancelled());
        assert_eq!(store.job(job.id).unwrap().status, ImportJobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_other_user_is_forbidden() {
        let (store, job) = store_with_job();
        let registry = CancellationRegistry::default();

        let outcome = cancel_import(&store, &registry, job.id, Some(Uuid::new_v4())).await.unwrap();

        assert_eq!(outcome, CancelOutcome::Forbidden);
        assert_eq!(store.job(job.id).unwrap().status, ImportJobStatus::Pending);
    }

    #[tokio::test]
    async fn test_finished_job_is_not_cancelled() {
        let (store, job) = store_with_job();
        store.force_status(job.id, ImportJobStatus::Completed);

        let outcome = cancel_import(&store, &CancellationRegistry::default(), job.id, None)
            .await
            .unwrap();

        assert_eq!(outcome, CancelOutcome::AlreadyFinished(ImportJobStatus::Completed));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let store = MemoryStore::new();
        let outcome = cancel_import(&store, &CancellationRegistry::default(), Uuid::new_v4(), None)
            .await
            .unwrap();
        assert_eq!(outcome, CancelOutcome::NotFound);
    }

    #[test]
    fn test_heartbeat_renews_before_ack_wait() {
        assert!(HEARTBEAT_INTERVAL * 2 < ACK_WAIT);
        assert!(ERROR_REDELIVERY_DELAY < ACK_WAIT);
    }

    #[test]
    fn test_describe_outcomes() {
        assert_eq!(describe(&Invocation::NotFound), "job not found");
        assert_eq!(
            describe(&Invocation::Skipped { status: ImportJobStatus::Completed }),
            "job already completed"
        );
        let counts = JobCounts {
            operations: 3,
            participants: 2,
            establishments: 1,
            ..Default::default()
        };
        assert_eq!(
            describe(&Invocation::Completed { counts }),
            "import completed: 3 operations, 2 participants, 1 establishments"
        );
    }
}
