//! Configuration management

use std::str::FromStr;
use std::time::Duration;

use anyhow::{self, Context, Result};

/// Connection settings for the worker service
#[derive(Debug, Clone)]
pub struct Config {
    /// NATS server URL
    pub nats_url: String,

    /// PostgreSQL connection string
    pub database_url: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let nats_url = std::env::var("NATS_URL")
            .unwrap_or_else(|_| "nats://localhost:4222".to_string());

        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set")?;

        Ok(Self {
            nats_url,
            database_url,
        })
    }
}

/// Object storage holding the uploaded ledger files
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Storage API base, e.g. `https://<project>.supabase.co/storage/v1`
    pub url: String,
    pub service_key: String,
    pub bucket: String,
}

impl StorageConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let url = lookup("STORAGE_URL").context("STORAGE_URL must be set")?;
        let service_key = lookup("STORAGE_SERVICE_KEY").context("STORAGE_SERVICE_KEY must be set")?;
        let bucket = lookup("STORAGE_BUCKET").unwrap_or_else(|| "fiscal-ledgers".to_string());

        Ok(Self {
            url,
            service_key,
            bucket,
        })
    }
}

/// Tuning knobs of the chunked import pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Wall-clock budget of one invocation
    pub chunk_time_budget: Duration,
    /// Line budget of one invocation
    pub chunk_max_lines: u64,
    /// Rows buffered per destination before a bulk write
    pub batch_size: usize,
    /// Lines between progress writes and cancellation polls
    pub progress_interval_lines: u64,
    /// Lines between checkpoints
    pub checkpoint_interval_lines: u64,
    /// Lifetime of the signed download URL
    pub signed_url_ttl: Duration,
    /// Base delay of a transient-failure retry, multiplied by the attempt
    pub transient_retry_delay: Duration,
    pub max_transient_retries: u32,
    /// Longest wait for the next body read before the stream counts as dead
    pub read_stall_timeout: Duration,
    /// Longer lines are skipped as malformed
    pub max_line_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_time_budget: Duration::from_secs(50),
            chunk_max_lines: 400_000,
            batch_size: 500,
            progress_interval_lines: 5_000,
            checkpoint_interval_lines: 50_000,
            signed_url_ttl: Duration::from_secs(600),
            transient_retry_delay: Duration::from_secs(5),
            max_transient_retries: 5,
            read_stall_timeout: Duration::from_secs(30),
            max_line_bytes: 64 * 1024,
        }
    }
}

/// Bind parameters per operation row; Postgres allows 65535 per statement
const OPERATION_BIND_COUNT: usize = 16;

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            chunk_time_budget: Duration::from_secs(parse_or(
                &lookup,
                "CHUNK_TIME_BUDGET_SECS",
                defaults.chunk_time_budget.as_secs(),
            )?),
            chunk_max_lines: parse_or(&lookup, "CHUNK_MAX_LINES", defaults.chunk_max_lines)?,
            batch_size: parse_or(&lookup, "BATCH_SIZE", defaults.batch_size)?,
            progress_interval_lines: parse_or(
                &lookup,
                "PROGRESS_INTERVAL_LINES",
                defaults.progress_interval_lines,
            )?,
            checkpoint_interval_lines: parse_or(
                &lookup,
                "CHECKPOINT_INTERVAL_LINES",
                defaults.checkpoint_interval_lines,
            )?,
            signed_url_ttl: Duration::from_secs(parse_or(
                &lookup,
                "SIGNED_URL_TTL_SECS",
                defaults.signed_url_ttl.as_secs(),
            )?),
            transient_retry_delay: Duration::from_secs(parse_or(
                &lookup,
                "TRANSIENT_RETRY_DELAY_SECS",
                defaults.transient_retry_delay.as_secs(),
            )?),
            max_transient_retries: parse_or(
                &lookup,
                "MAX_TRANSIENT_RETRIES",
                defaults.max_transient_retries,
            )?,
            read_stall_timeout: Duration::from_secs(parse_or(
                &lookup,
                "READ_STALL_TIMEOUT_SECS",
                defaults.read_stall_timeout.as_secs(),
            )?),
            max_line_bytes: parse_or(&lookup, "MAX_LINE_BYTES", defaults.max_line_bytes)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_max_lines == 0 {
            anyhow::bail!("CHUNK_MAX_LINES must be greater than zero");
        }
        if self.batch_size == 0 || self.batch_size * OPERATION_BIND_COUNT > u16::MAX as usize {
            anyhow::bail!(
                "BATCH_SIZE must be between 1 and {} (current: {})",
                u16::MAX as usize / OPERATION_BIND_COUNT,
                self.batch_size
            );
        }
        if self.progress_interval_lines == 0 || self.checkpoint_interval_lines == 0 {
            anyhow::bail!("PROGRESS_INTERVAL_LINES and CHECKPOINT_INTERVAL_LINES must be greater than zero");
        }
        if self.read_stall_timeout.is_zero() {
            anyhow::bail!("READ_STALL_TIMEOUT_SECS must be greater than zero");
        }
        if self.max_line_bytes == 0 {
            anyhow::bail!("MAX_LINE_BYTES must be greater than zero");
        }
        if self.checkpoint_interval_lines < self.progress_interval_lines {
            tracing::warn!(
                "CHECKPOINT_INTERVAL_LINES ({}) is below PROGRESS_INTERVAL_LINES ({})",
                self.checkpoint_interval_lines,
                self.progress_interval_lines
            );
        }
        Ok(())
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}': {}", key, raw, e)),
        _ => Ok(default),
    }
}
