//! Ledger file sources
//!
//! A source opens the stored file at a byte offset and yields its bytes as a
//! stream. `HttpLedgerSource` talks to the storage service through a
//! short-lived signed URL and a `Range` request; `LocalFileSource` reads
//! from disk for replays.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::services::retry::{is_transient_message, retry_with_backoff};

/// Raw file bytes, in arbitrary chunk sizes
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, FetchError>>;

const SIGNED_URL_ATTEMPTS: u32 = 3;
const SIGNED_URL_BACKOFF: Duration = Duration::from_millis(500);
const READ_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("failed to create signed URL for '{path}': {message}")]
    SignedUrl { path: String, message: String },

    #[error("download failed with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("stream error: {message}")]
    Transport { message: String, transient: bool },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Failures worth a delayed retry from the last checkpoint
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::SignedUrl { message, .. } => is_transient_message(message),
            FetchError::Status { status, .. } => matches!(status, 408 | 429 | 500..=599),
            FetchError::Transport { transient, .. } => *transient,
            FetchError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::Interrupted
            ),
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        let message = error_chain(&e);
        let transient = e.is_timeout()
            || e.is_connect()
            || e.is_body()
            || e.is_decode()
            || is_transient_message(&message);
        FetchError::Transport { message, transient }
    }
}

/// Error text including its sources, which is where hyper reports resets
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

/// Result of opening a source at an offset
pub enum FetchOutcome {
    /// Bytes from the requested offset on. `skip` is non-zero when the
    /// server ignored the range and the stream starts at byte zero.
    Stream { body: ByteStream, skip: u64 },
    /// The offset is at or past the end of the file
    AlreadyConsumed,
}

#[async_trait]
pub trait LedgerSource: Send + Sync {
    async fn open(&self, path: &str, offset: u64) -> Result<FetchOutcome, FetchError>;

    /// Delete the file once the import completed
    async fn remove(&self, path: &str) -> anyhow::Result<()>;
}

// ==========================================================================
// Storage service over HTTP
// ==========================================================================

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "signedURL", alias = "signedUrl")]
    signed_url: String,
}

/// Object storage reachable over HTTP (Supabase storage API)
pub struct HttpLedgerSource {
    client: reqwest::Client,
    storage_url: String,
    service_key: String,
    bucket: String,
    url_ttl: Duration,
}

impl HttpLedgerSource {
    pub fn new(storage_url: &str, service_key: &str, bucket: &str, url_ttl: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            storage_url: storage_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
            bucket: bucket.to_string(),
            url_ttl,
        })
    }

    fn object_path(&self, path: &str) -> String {
        let encoded: Vec<String> = path
            .trim_start_matches('/')
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/{}", urlencoding::encode(&self.bucket), encoded.join("/"))
    }

    async fn request_signed_url(&self, path: &str) -> Result<String, FetchError> {
        let url = format!("{}/object/sign/{}", self.storage_url, self.object_path(path));
        let failure = |message: String| FetchError::SignedUrl {
            path: path.to_string(),
            message,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .json(&serde_json::json!({ "expiresIn": self.url_ttl.as_secs() }))
            .send()
            .await
            .map_err(|e| failure(error_chain(&e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(failure(format!("HTTP {}: {}", status.as_u16(), body)));
        }

        let signed: SignedUrlResponse = response.json().await.map_err(|e| failure(error_chain(&e)))?;
        Ok(absolute_signed_url(&self.storage_url, &signed.signed_url))
    }

    async fn signed_url(&self, path: &str) -> Result<String, FetchError> {
        retry_with_backoff(
            "signed url",
            SIGNED_URL_ATTEMPTS,
            SIGNED_URL_BACKOFF,
            |_: &FetchError| true,
            move || self.request_signed_url(path),
        )
        .await
    }
}

/// How the reply to a ranged GET is consumed
#[derive(Debug, PartialEq, Eq)]
enum RangeReply {
    /// Stream the body, dropping `skip` leading bytes
    Body { skip: u64 },
    /// The requested offset is past the end of the object
    PastEnd,
    Rejected,
}

fn classify_range_reply(status: u16, offset: u64) -> RangeReply {
    match status {
        206 => RangeReply::Body { skip: 0 },
        // Range ignored: the body starts at byte zero
        200 => RangeReply::Body { skip: offset },
        416 => RangeReply::PastEnd,
        _ => RangeReply::Rejected,
    }
}

/// The storage API answers with a path relative to its base URL
fn absolute_signed_url(storage_url: &str, signed: &str) -> String {
    if signed.starts_with("http://") || signed.starts_with("https://") {
        signed.to_string()
    } else {
        format!("{}/{}", storage_url, signed.trim_start_matches('/'))
    }
}

#[async_trait]
impl LedgerSource for HttpLedgerSource {
    async fn open(&self, path: &str, offset: u64) -> Result<FetchOutcome, FetchError> {
        let url = self.signed_url(path).await?;

        let mut request = self.client.get(&url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }
        let response = request.send().await.map_err(FetchError::from_reqwest)?;

        let status = response.status().as_u16();
        let skip = match classify_range_reply(status, offset) {
            RangeReply::Body { skip } => {
                if skip > 0 {
                    warn!("Storage ignored range request for '{}', skipping {} bytes", path, skip);
                }
                skip
            }
            RangeReply::PastEnd => {
                debug!("Range {}- past end of '{}'", offset, path);
                return Ok(FetchOutcome::AlreadyConsumed);
            }
            RangeReply::Rejected => {
                let body = response.text().await.unwrap_or_default();
                return Err(FetchError::Status { status, body });
            }
        };

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(FetchError::from_reqwest))
            .boxed();
        Ok(FetchOutcome::Stream { body, skip })
    }

    async fn remove(&self, path: &str) -> anyhow::Result<()> {
        let url = format!("{}/object/{}", self.storage_url, self.object_path(path));
        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("storage delete returned HTTP {}", response.status().as_u16());
        }
        info!("Removed '{}' from storage", path);
        Ok(())
    }
}

// ==========================================================================
// Local filesystem
// ==========================================================================

/// Reads files from disk, relative to `root` when one is set
pub struct LocalFileSource {
    root: Option<PathBuf>,
    remove_on_complete: bool,
}

impl LocalFileSource {
    pub fn new(root: Option<PathBuf>, remove_on_complete: bool) -> Self {
        Self {
            root,
            remove_on_complete,
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(path),
            None => PathBuf::from(path),
        }
    }
}

#[async_trait]
impl LedgerSource for LocalFileSource {
    async fn open(&self, path: &str, offset: u64) -> Result<FetchOutcome, FetchError> {
        let mut file = tokio::fs::File::open(self.resolve(path)).await?;
        let len = file.metadata().await?.len();
        if offset > 0 && offset >= len {
            return Ok(FetchOutcome::AlreadyConsumed);
        }
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let body = stream::unfold(Some(file), |state| async move {
            let mut file = state?;
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(buf), Some(file)))
                }
                Err(e) => Some((Err(FetchError::Io(e)), None)),
            }
        })
        .boxed();
        Ok(FetchOutcome::Stream { body, skip: 0 })
    }

    async fn remove(&self, path: &str) -> anyhow::Result<()> {
        if self.remove_on_complete {
            tokio::fs::remove_file(self.resolve(path)).await?;
        }
        Ok(())
    }
}

// ==========================================================================
// In-memory source for tests
// ==========================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Serves byte buffers in fixed-size chunks and can break mid-stream
    #[derive(Default)]
    pub struct MemorySource {
        files: Mutex<HashMap<String, Vec<u8>>>,
        chunk_size: usize,
        ignore_range: bool,
        /// Go silent after the first chunk, never ending the stream
        stall: bool,
        /// Absolute offset at which the next opened stream fails, once
        break_at: Mutex<Option<u64>>,
        pub removed: Mutex<Vec<String>>,
        pub opened_at: Mutex<Vec<u64>>,
    }

    impl MemorySource {
        pub fn new(chunk_size: usize) -> Self {
            Self {
                chunk_size: chunk_size.max(1),
                ..Default::default()
            }
        }

        pub fn ignoring_range(chunk_size: usize) -> Self {
            Self {
                ignore_range: true,
                ..Self::new(chunk_size)
            }
        }

        pub fn stalling(chunk_size: usize) -> Self {
            Self {
                stall: true,
                ..Self::new(chunk_size)
            }
        }

        pub fn put(&self, path: &str, bytes: impl Into<Vec<u8>>) {
            self.files.lock().insert(path.to_string(), bytes.into());
        }

        /// Fail the next stream with a connection reset once it reaches `offset`
        pub fn break_once_at(&self, offset: u64) {
            *self.break_at.lock() = Some(offset);
        }
    }

    #[async_trait]
    impl LedgerSource for MemorySource {
        async fn open(&self, path: &str, offset: u64) -> Result<FetchOutcome, FetchError> {
            self.opened_at.lock().push(offset);
            let data = self.files.lock().get(path).cloned().ok_or(FetchError::Status {
                status: 404,
                body: "Object not found".to_string(),
            })?;
            if offset > 0 && offset >= data.len() as u64 {
                return Ok(FetchOutcome::AlreadyConsumed);
            }

            let (start, skip) = if self.ignore_range { (0, offset) } else { (offset, 0) };
            let break_at = self.break_at.lock().take();

            let mut items: Vec<Result<Vec<u8>, FetchError>> = Vec::new();
            let mut position = start as usize;
            while position < data.len() {
                let end = (position + self.chunk_size).min(data.len());
                if let Some(limit) = break_at {
                    if end as u64 > limit && position as u64 >= offset {
                        items.push(Err(FetchError::Transport {
                            message: "error decoding response body: connection reset by peer".to_string(),
                            transient: true,
                        }));
                        break;
                    }
                }
                items.push(Ok(data[position..end].to_vec()));
                position = end;
            }
            if self.stall {
                items.truncate(1);
                return Ok(FetchOutcome::Stream {
                    body: stream::iter(items).chain(stream::pending()).boxed(),
                    skip,
                });
            }
            Ok(FetchOutcome::Stream {
                body: stream::iter(items).boxed(),
                skip,
            })
        }

        async fn remove(&self, path: &str) -> anyhow::Result<()> {
            self.removed.lock().push(path.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn collect(outcome: FetchOutcome) -> (Vec<u8>, u64) {
        match outcome {
            FetchOutcome::Stream { mut body, skip } => {
                let mut bytes = Vec::new();
                while let Some(chunk) = body.next().await {
                    bytes.extend(chunk.unwrap());
                }
                (bytes, skip)
            }
            FetchOutcome::AlreadyConsumed => panic!("expected a stream"),
        }
    }

    #[tokio::test]
    async fn test_local_source_reads_from_offset() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"|0000|a|\n|0140|b|\n").unwrap();
        let path = file.path().to_string_lossy().to_string();
        let source = LocalFileSource::new(None, false);

        let (bytes, skip) = collect(source.open(&path, 9).await.unwrap()).await;
        assert_eq!(bytes, b"|0140|b|\n");
        assert_eq!(skip, 0);
    }

    #[tokio::test]
    async fn test_local_source_past_end_is_already_consumed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"|0000|a|\n").unwrap();
        let path = file.path().to_string_lossy().to_string();
        let source = LocalFileSource::new(None, false);

        assert!(matches!(source.open(&path, 9).await.unwrap(), FetchOutcome::AlreadyConsumed));
    }

    #[tokio::test]
    async fn test_local_source_missing_file_is_not_transient() {
        let source = LocalFileSource::new(None, false);
        let err = match source.open("/nonexistent/efd.txt", 0).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Status { status: 503, body: String::new() }.is_transient());
        assert!(!FetchError::Status { status: 403, body: String::new() }.is_transient());
        assert!(FetchError::Transport { message: "reset".into(), transient: true }.is_transient());
        assert!(FetchError::SignedUrl { path: "a".into(), message: "operation timed out".into() }.is_transient());
        assert!(!FetchError::SignedUrl { path: "a".into(), message: "HTTP 400: bad".into() }.is_transient());
    }

    #[test]
    fn test_partial_content_streams_from_offset() {
        assert_eq!(classify_range_reply(206, 4096), RangeReply::Body { skip: 0 });
    }

    #[test]
    fn test_full_body_from_start() {
        assert_eq!(classify_range_reply(200, 0), RangeReply::Body { skip: 0 });
    }

    #[test]
    fn test_ignored_range_skips_to_offset() {
        assert_eq!(classify_range_reply(200, 4096), RangeReply::Body { skip: 4096 });
    }

    #[test]
    fn test_unsatisfiable_range_is_past_end() {
        assert_eq!(classify_range_reply(416, 4096), RangeReply::PastEnd);
    }

    #[test]
    fn test_missing_object_is_rejected() {
        assert_eq!(classify_range_reply(404, 0), RangeReply::Rejected);
        assert!(!FetchError::Status { status: 404, body: String::new() }.is_transient());
    }

    #[test]
    fn test_unavailable_storage_is_rejected_and_transient() {
        assert_eq!(classify_range_reply(503, 4096), RangeReply::Rejected);
        assert!(FetchError::Status { status: 503, body: String::new() }.is_transient());
    }

    #[test]
    fn test_absolute_signed_url() {
        let base = "https://storage.example.com/storage/v1";
        assert_eq!(
            absolute_signed_url(base, "/object/sign/fiscal-ledgers/a.txt?token=x"),
            "https://storage.example.com/storage/v1/object/sign/fiscal-ledgers/a.txt?token=x"
        );
        assert_eq!(absolute_signed_url(base, "https://cdn.example.com/a"), "https://cdn.example.com/a");
    }

    #[test]
    fn test_object_path_encodes_segments() {
        let source =
            HttpLedgerSource::new("https://s.example.com/", "key", "fiscal-ledgers", Duration::from_secs(60)).unwrap();
        assert_eq!(
            source.object_path("acme/efd março.txt"),
            "fiscal-ledgers/acme/efd%20mar%C3%A7o.txt"
        );
    }

    #[tokio::test]
    async fn test_memory_source_simulates_ignored_range() {
        let source = testing::MemorySource::ignoring_range(4);
        source.put("f", b"0123456789".to_vec());

        let (bytes, skip) = collect(source.open("f", 6).await.unwrap()).await;
        assert_eq!(bytes, b"0123456789");
        assert_eq!(skip, 6);
    }
}
