use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::api::IngestError;
use crate::record::{CanonicalRecord, EntityState, RecordKey};

/// Outcome of an idempotent batch write. Re-writing a batch with the same
/// provenance tag reports every record as deduplicated instead of storing
/// twice. `failed` carries the precise keys that did not persist so the
/// coordinator can retry only those.
#[derive(Debug, Default, PartialEq)]
pub struct BatchAck {
    pub stored: usize,
    pub deduplicated: usize,
    pub failed: Vec<(RecordKey, String)>,
}

impl BatchAck {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Durable ingestion watermark, written together with batch acknowledgment.
/// On restart the coordinator resumes from `cursor`; the last in-flight batch
/// may be replayed, which the write-once record key makes harmless.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Checkpoint {
    pub cursor: String,
    pub batch_seq: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Filter for range scans. Empty means all entities.
#[derive(Clone, Debug, Default)]
pub struct RangeFilter {
    pub entity_id: Option<String>,
}

impl RangeFilter {
    pub fn entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
        }
    }
}

/// Persistence seam of the pipeline. Only the coordinator writes records and
/// states; the aggregation engine and the query handlers read.
///
/// Range scans are ordered by `(timestamp, entity_id, batch_id)` ascending
/// over the half-open window `[start, end)`, and restart from an exclusive
/// `after` cursor, so callers can page through arbitrarily large windows.
#[async_trait]
pub trait Store {
    async fn put_batch(&self, records: &[CanonicalRecord]) -> Result<BatchAck, IngestError>;

    async fn upsert_state(&self, state: EntityState) -> Result<(), IngestError>;

    async fn get_latest(&self, entity_id: &str) -> Result<Option<EntityState>, IngestError>;

    async fn query_range(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        filter: &RangeFilter,
        after: Option<&RecordKey>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, IngestError>;

    /// Known entity ids, ascending, paginated.
    async fn list_entities(&self, limit: usize, offset: usize) -> Result<Vec<String>, IngestError>;

    async fn read_checkpoint(&self) -> Result<Option<Checkpoint>, IngestError>;

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), IngestError>;
}
