use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::api::IngestError;

/// One fetched snapshot, still opaque. The coordinator assigns the arrival
/// sequence number and hands the payload to the normalizer.
#[derive(Clone, Debug)]
pub struct SourceBatch {
    /// Durable batch identity, also the provenance tag of its records.
    pub id: String,
    pub payload: Bytes,
    /// Cursor to persist as the watermark once this batch is acknowledged.
    pub next_cursor: String,
}

/// Result of polling the raw source.
#[derive(Clone, Debug)]
pub enum Fetch {
    Batch(SourceBatch),
    /// Nothing more right now. A clean pause, not an error: poll again later.
    EndOfStream,
}

/// The raw-record source seam. Errors from implementations are transient by
/// contract and retried under the coordinator's backoff policy.
#[async_trait]
pub trait RecordSource {
    async fn fetch_batch(&self, cursor: &str) -> Result<Fetch, IngestError>;
}

/// Source backed by a fixed list of snapshots, for tests and local runs.
pub struct StaticSource {
    batches: Vec<(String, Bytes)>,
}

impl StaticSource {
    pub fn new(batches: Vec<(String, Bytes)>) -> Self {
        Self { batches }
    }
}

#[async_trait]
impl RecordSource for StaticSource {
    async fn fetch_batch(&self, cursor: &str) -> Result<Fetch, IngestError> {
        let index: usize = cursor.parse().unwrap_or(0);
        match self.batches.get(index) {
            Some((id, payload)) => Ok(Fetch::Batch(SourceBatch {
                id: id.clone(),
                payload: payload.clone(),
                next_cursor: (index + 1).to_string(),
            })),
            None => Ok(Fetch::EndOfStream),
        }
    }
}

/// Source that fails every fetch, for exercising the retry-exhaustion path.
#[derive(Default)]
pub struct FailingSource {
    attempts: Mutex<u32>,
}

impl FailingSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attempts(&self) -> u32 {
        *self.attempts.lock().await
    }
}

#[async_trait]
impl RecordSource for FailingSource {
    async fn fetch_batch(&self, _cursor: &str) -> Result<Fetch, IngestError> {
        let mut attempts = self.attempts.lock().await;
        *attempts += 1;
        Err(IngestError::TransientSource("injected fetch failure".to_string()))
    }
}
