//! Fiscal-ledger import pipeline
//!
//! `fetcher` streams the stored file from a byte offset, `framer` cuts it
//! into lines, `dispatcher` turns lines into rows, `accumulator` batches the
//! writes and `pipeline` drives one budgeted invocation end to end.

pub mod accumulator;
pub mod dispatcher;
pub mod fetcher;
pub mod framer;
pub mod memory;
pub mod pipeline;
pub mod progress;
pub mod records;
pub mod scheduler;
pub mod store;

pub use fetcher::{FetchError, HttpLedgerSource, LedgerSource, LocalFileSource};
pub use memory::MemoryStore;
pub use pipeline::{ImportPipeline, Invocation, PipelineDeps, STATUS_PREFIX};
pub use scheduler::{ContinuationScheduler, JetStreamScheduler, LocalScheduler, CHUNK_SUBJECT};
pub use store::{JobStore, LedgerSink, SinkError, SummaryRefresher};
