//! Offline replay of a ledger file
//!
//! Runs the import pipeline in-process against a local file, with the
//! in-memory store and the local continuation queue, and reports what a
//! real import would have written. No database, storage or NATS is used.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::services::cancellation::CancellationRegistry;
use crate::services::import_processor::describe;
use crate::services::ledger::{ImportPipeline, LocalFileSource, LocalScheduler, MemoryStore, PipelineDeps};
use crate::types::{ChunkTask, ImportJob, ImportJobStatus, JobCounts};

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub file: PathBuf,
    pub company_id: Option<Uuid>,
    /// Overrides the per-invocation line budget
    pub max_lines: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaySummary {
    pub job_id: Uuid,
    pub status: ImportJobStatus,
    pub invocations: u32,
    pub total_lines: i64,
    pub bytes_processed: i64,
    pub counts: JobCounts,
    pub operation_rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u128,
}

/// Import `options.file` to the end, following every continuation
pub async fn replay_file(options: &ReplayOptions, mut config: PipelineConfig) -> Result<ReplaySummary> {
    let started = Instant::now();
    if let Some(max_lines) = options.max_lines {
        config.chunk_max_lines = max_lines.max(1);
    }

    let metadata = tokio::fs::metadata(&options.file)
        .await
        .with_context(|| format!("cannot read {}", options.file.display()))?;
    let path = options.file.to_string_lossy().to_string();

    let store = Arc::new(MemoryStore::new());
    let job = ImportJob::new(
        Uuid::nil(),
        options.company_id.unwrap_or_else(Uuid::nil),
        path.clone(),
        metadata.len() as i64,
    );
    let job_id = job.id;
    store.insert_job(job);

    let (scheduler, mut queue) = LocalScheduler::new();
    let deps = PipelineDeps {
        jobs: store.clone(),
        sink: store.clone(),
        refresher: store.clone(),
        source: Arc::new(LocalFileSource::new(None, false)),
        scheduler: Arc::new(scheduler),
        status: None,
    };
    let pipeline = ImportPipeline::new(deps, config, CancellationRegistry::default());
    info!("Replaying {} ({} bytes) as job {}", path, metadata.len(), job_id);

    let mut invocations = 0u32;
    let mut next = Some((ChunkTask::new(job_id), None));
    while let Some((task, delay)) = next.take() {
        if let Some(delay) = delay {
            debug!("Waiting {:?} before retry {}", delay, task.attempt);
            tokio::time::sleep(delay).await;
        }
        invocations += 1;
        let outcome = pipeline.invoke(&task).await?;
        debug!("Invocation {}: {}", invocations, describe(&outcome));
        next = queue.try_recv().ok();
    }

    let job = store
        .job(job_id)
        .with_context(|| format!("replay job {} disappeared", job_id))?;
    let summary = ReplaySummary {
        job_id,
        status: job.status,
        invocations,
        total_lines: job.total_lines,
        bytes_processed: job.bytes_processed,
        counts: job.counts,
        operation_rows: store.operations().len(),
        error: job.error_message,
        elapsed_ms: started.elapsed().as_millis(),
    };
    info!(
        "Replay of {} finished: {} after {} invocation(s)",
        path, summary.status, summary.invocations
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::services::ledger::dispatcher::tests::{item, DOCUMENT, ESTABLISHMENT, HEADER, PARTICIPANT};

    fn write_ledger(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("efd.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        for line in [
            HEADER.to_string(),
            ESTABLISHMENT.to_string(),
            PARTICIPANT.to_string(),
            DOCUMENT.to_string(),
            item("1500,00", "1556", "270,00"),
            item("80,00", "5102", "0"),
            "|9999|6|".to_string(),
        ] {
            writeln!(file, "{}", line).unwrap();
        }
        path
    }

    #[tokio::test]
    async fn test_replay_follows_continuations() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_ledger(&dir);
        let options = ReplayOptions {
            file: file.clone(),
            company_id: None,
            max_lines: Some(2),
        };

        let summary = replay_file(&options, PipelineConfig::default()).await.unwrap();

        assert_eq!(summary.status, ImportJobStatus::Completed);
        assert!(summary.invocations >= 4);
        assert_eq!(summary.total_lines, 7);
        assert_eq!(summary.bytes_processed, std::fs::metadata(&file).unwrap().len() as i64);
        assert_eq!(summary.counts.operations, 1);
        assert_eq!(summary.counts.establishments, 1);
        assert_eq!(summary.operation_rows, 1);
        assert!(summary.error.is_none());
        // Replays never delete the input
        assert!(file.exists());
    }

    #[tokio::test]
    async fn test_replay_of_missing_file() {
        let options = ReplayOptions {
            file: PathBuf::from("/nonexistent/efd.txt"),
            company_id: None,
            max_lines: None,
        };
        assert!(replay_file(&options, PipelineConfig::default()).await.is_err());
    }
}
