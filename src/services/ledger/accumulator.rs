//! Buffered row writers
//!
//! Rows are deduplicated by natural key inside the buffer (last one wins)
//! and written in bulk. A flush first tries the keyed upsert; when the
//! conflict target is rejected it falls back to a plain insert.

use std::collections::HashMap;
use std::hash::Hash;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{OperationKey, OperationRow, ParticipantRow};

use super::store::{LedgerSink, SinkError};

/// Row with a natural key used for in-buffer deduplication
pub trait KeyedRow {
    type Key: Eq + Hash;

    fn natural_key(&self) -> Self::Key;
}

impl KeyedRow for OperationRow {
    type Key = OperationKey;

    fn natural_key(&self) -> OperationKey {
        self.key()
    }
}

impl KeyedRow for ParticipantRow {
    type Key = (Uuid, String);

    fn natural_key(&self) -> (Uuid, String) {
        self.key()
    }
}

/// Insertion-ordered buffer, at most one row per key
#[derive(Debug)]
pub struct Batch<R: KeyedRow> {
    rows: Vec<R>,
    index: HashMap<R::Key, usize>,
    capacity: usize,
}

impl<R: KeyedRow> Batch<R> {
    pub fn new(capacity: usize) -> Self {
        Self {
            rows: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Add a row, replacing a buffered row with the same key
    pub fn push(&mut self, row: R) {
        let key = row.natural_key();
        match self.index.get(&key) {
            Some(&slot) => self.rows[slot] = row,
            None => {
                self.index.insert(key, self.rows.len());
                self.rows.push(row);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.capacity
    }

    /// Drain the buffer
    pub fn take(&mut self) -> Vec<R> {
        self.index.clear();
        std::mem::take(&mut self.rows)
    }

    /// Drop buffered rows without writing them
    pub fn discard(&mut self) {
        self.index.clear();
        self.rows.clear();
    }
}

/// Operations buffered for one import job
#[derive(Debug)]
pub struct OperationBatch {
    job_id: Uuid,
    rows: Batch<OperationRow>,
}

impl OperationBatch {
    pub fn new(job_id: Uuid, capacity: usize) -> Self {
        Self {
            job_id,
            rows: Batch::new(capacity),
        }
    }

    pub fn push(&mut self, row: OperationRow) {
        self.rows.push(row);
    }

    pub fn is_full(&self) -> bool {
        self.rows.is_full()
    }

    pub fn discard(&mut self) {
        self.rows.discard();
    }

    /// Write buffered rows; returns how many were newly inserted
    pub async fn flush(&mut self, sink: &dyn LedgerSink) -> Result<u64, SinkError> {
        if self.rows.is_empty() {
            return Ok(0);
        }
        let rows = self.rows.take();

        let written = match sink.upsert_operations(self.job_id, &rows).await {
            Ok(count) => count,
            Err(SinkError::Constraint(reason)) => {
                warn!(
                    "Operation upsert rejected for job {} ({}), falling back to insert",
                    self.job_id, reason
                );
                sink.insert_operations(self.job_id, &rows).await?
            }
            Err(e) => return Err(e),
        };

        debug!("Flushed {} operations ({} new)", rows.len(), written);
        Ok(written)
    }
}

/// Participants buffered for one import job
#[derive(Debug)]
pub struct ParticipantBatch {
    rows: Batch<ParticipantRow>,
}

impl ParticipantBatch {
    pub fn new(capacity: usize) -> Self {
        Self {
            rows: Batch::new(capacity),
        }
    }

    pub fn push(&mut self, row: ParticipantRow) {
        self.rows.push(row);
    }

    pub fn is_full(&self) -> bool {
        self.rows.is_full()
    }

    pub fn discard(&mut self) {
        self.rows.discard();
    }

    /// Write buffered rows; returns how many were inserted or changed
    pub async fn flush(&mut self, sink: &dyn LedgerSink) -> Result<u64, SinkError> {
        if self.rows.is_empty() {
            return Ok(0);
        }
        let rows = self.rows.take();

        let written = match sink.upsert_participants(&rows).await {
            Ok(count) => count,
            Err(SinkError::Constraint(reason)) => {
                warn!("Participant upsert rejected ({}), falling back to insert", reason);
                sink.insert_participants(&rows).await?
            }
            Err(e) => return Err(e),
        };

        debug!("Flushed {} participants ({} written)", rows.len(), written);
        Ok(written)
    }
}
