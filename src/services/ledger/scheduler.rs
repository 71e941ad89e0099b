//! Continuation scheduling
//!
//! An invocation that stops on its budget, or hits a transient failure after
//! a checkpoint, hands the job to a fresh invocation through a scheduler.

use std::time::{Duration, Instant};

use anyhow::Result;
use async_nats::jetstream::Context as JsContext;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::ChunkTask;

/// Work-queue subject carrying `ChunkTask`s
pub const CHUNK_SUBJECT: &str = "ledger.jobs.import.chunk";

/// Per-invocation limits
#[derive(Debug, Clone)]
pub struct ChunkBudget {
    started: Instant,
    time_budget: Duration,
    max_lines: u64,
}

impl ChunkBudget {
    pub fn new(time_budget: Duration, max_lines: u64) -> Self {
        Self {
            started: Instant::now(),
            time_budget,
            max_lines: max_lines.max(1),
        }
    }

    /// Whether the invocation should stop after `lines` lines
    pub fn exhausted(&self, lines: u64) -> bool {
        lines >= self.max_lines || self.started.elapsed() >= self.time_budget
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Wall-clock time left before the budget runs out
    pub fn remaining(&self) -> Duration {
        self.time_budget.saturating_sub(self.started.elapsed())
    }
}

#[async_trait]
pub trait ContinuationScheduler: Send + Sync {
    /// Enqueue `task`, delivered no earlier than `delay` from now
    async fn schedule(&self, task: ChunkTask, delay: Option<Duration>) -> Result<()>;
}

/// Publishes continuations to the JetStream work queue
pub struct JetStreamScheduler {
    js: JsContext,
}

impl JetStreamScheduler {
    pub fn new(js: JsContext) -> Self {
        Self { js }
    }
}

#[async_trait]
impl ContinuationScheduler for JetStreamScheduler {
    /// Publishes right away. A delayed task carries its `not_before` and the
    /// consumer NAKs it with the remaining delay, so the wait is held by
    /// JetStream rather than by this process.
    async fn schedule(&self, task: ChunkTask, delay: Option<Duration>) -> Result<()> {
        let task = match delay {
            Some(delay) => task.delayed_by(delay),
            None => task,
        };
        let payload = serde_json::to_vec(&task)?;
        self.js.publish(CHUNK_SUBJECT, payload.into()).await?.await?;

        match delay {
            Some(delay) => debug!("Retry for job {} enqueued, due in {:?}", task.job_id, delay),
            None => debug!("Continuation for job {} enqueued", task.job_id),
        }
        Ok(())
    }
}

/// In-process queue, drained by the local replay driver and tests
pub struct LocalScheduler {
    tx: mpsc::UnboundedSender<(ChunkTask, Option<Duration>)>,
}

impl LocalScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(ChunkTask, Option<Duration>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ContinuationScheduler for LocalScheduler {
    async fn schedule(&self, task: ChunkTask, delay: Option<Duration>) -> Result<()> {
        self.tx
            .send((task, delay))
            .map_err(|_| anyhow::anyhow!("local continuation queue closed"))?;
        Ok(())
    }
}
