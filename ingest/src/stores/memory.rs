use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::api::IngestError;
use crate::record::{CanonicalRecord, EntityState, RecordKey};
use crate::store::{BatchAck, Checkpoint, RangeFilter, Store};

/// Time-index key. Ordering gives the scan order of `query_range`.
type TimeKey = (OffsetDateTime, String, String);

#[derive(Default)]
struct Inner {
    /// All stored records, keyed by (timestamp, entity_id, batch_id). The
    /// key doubles as the write-once guard.
    records: BTreeMap<TimeKey, CanonicalRecord>,
    /// Merged per-entity state, keyed by entity id (ascending for listings).
    states: BTreeMap<String, EntityState>,
    checkpoint: Option<Checkpoint>,
    /// Entities whose writes are made to fail, for fault-injection tests.
    poisoned: HashSet<String>,
    /// Remaining write calls to fail wholesale, simulating a store outage.
    failing_writes: u32,
}

/// In-memory store for tests and local runs: same contract as the SQLite
/// store, no infrastructure.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write touching `entity_id` fail until cleared. Lets tests
    /// exercise partial-batch acks and targeted retries.
    pub async fn poison_entity(&self, entity_id: &str) {
        self.inner.write().await.poisoned.insert(entity_id.to_string());
    }

    pub async fn heal_entity(&self, entity_id: &str) {
        self.inner.write().await.poisoned.remove(entity_id);
    }

    /// Fail the next `count` write calls with a transient error, simulating
    /// a store that is briefly unreachable.
    pub async fn fail_writes(&self, count: u32) {
        self.inner.write().await.failing_writes = count;
    }

    pub async fn record_count(&self) -> usize {
        self.inner.read().await.records.len()
    }
}

fn time_key(record: &CanonicalRecord) -> TimeKey {
    (
        record.timestamp,
        record.entity_id.clone(),
        record.batch.id.clone(),
    )
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_batch(&self, records: &[CanonicalRecord]) -> Result<BatchAck, IngestError> {
        let mut inner = self.inner.write().await;
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(IngestError::TransientStore(
                "injected store outage".to_string(),
            ));
        }
        let mut ack = BatchAck::default();

        for record in records {
            if inner.poisoned.contains(&record.entity_id) {
                ack.failed
                    .push((record.key(), "injected write failure".to_string()));
                continue;
            }
            let key = time_key(record);
            if inner.records.contains_key(&key) {
                ack.deduplicated += 1;
            } else {
                inner.records.insert(key, record.clone());
                ack.stored += 1;
            }
        }

        Ok(ack)
    }

    async fn upsert_state(&self, state: EntityState) -> Result<(), IngestError> {
        let mut inner = self.inner.write().await;
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(IngestError::TransientStore(
                "injected store outage".to_string(),
            ));
        }
        inner.states.insert(state.entity_id.clone(), state);
        Ok(())
    }

    async fn get_latest(&self, entity_id: &str) -> Result<Option<EntityState>, IngestError> {
        Ok(self.inner.read().await.states.get(entity_id).cloned())
    }

    async fn query_range(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        filter: &RangeFilter,
        after: Option<&RecordKey>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, IngestError> {
        if start >= end {
            return Err(IngestError::InvalidWindow);
        }
        let inner = self.inner.read().await;

        let results = inner
            .records
            .range((start, String::new(), String::new())..)
            .take_while(|((ts, _, _), _)| *ts < end)
            .filter(|((ts, entity, batch), _)| match after {
                Some(cursor) => {
                    (*ts, entity, batch)
                        > (cursor.timestamp, &cursor.entity_id, &cursor.batch_id)
                }
                None => true,
            })
            .filter(|((_, entity, _), _)| match &filter.entity_id {
                Some(id) => entity == id,
                None => true,
            })
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect();

        Ok(results)
    }

    async fn list_entities(&self, limit: usize, offset: usize) -> Result<Vec<String>, IngestError> {
        let inner = self.inner.read().await;
        Ok(inner
            .states
            .keys()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn read_checkpoint(&self) -> Result<Option<Checkpoint>, IngestError> {
        Ok(self.inner.read().await.checkpoint.clone())
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), IngestError> {
        self.inner.write().await.checkpoint = Some(checkpoint.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use time::OffsetDateTime;

    use super::MemoryStore;
    use crate::record::{BatchTag, CanonicalRecord, FieldValue};
    use crate::store::{RangeFilter, Store};

    fn record(entity: &str, ts: i64, batch: &str) -> CanonicalRecord {
        CanonicalRecord {
            entity_id: entity.to_string(),
            timestamp: OffsetDateTime::from_unix_timestamp(ts).unwrap(),
            fields: BTreeMap::from([("gs".to_string(), FieldValue::Float(100.0))]),
            batch: BatchTag {
                id: batch.to_string(),
                seq: 1,
            },
        }
    }

    fn ts(seconds: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(seconds).unwrap()
    }

    #[tokio::test]
    async fn put_batch_is_idempotent() {
        let store = MemoryStore::new();
        let batch = vec![record("aaa", 10, "b1"), record("bbb", 10, "b1")];

        let first = store.put_batch(&batch).await.unwrap();
        assert_eq!(first.stored, 2);
        assert_eq!(first.deduplicated, 0);

        let second = store.put_batch(&batch).await.unwrap();
        assert_eq!(second.stored, 0);
        assert_eq!(second.deduplicated, 2);
        assert_eq!(store.record_count().await, 2);
    }

    #[tokio::test]
    async fn partial_failure_reports_failing_keys_only() {
        let store = MemoryStore::new();
        store.poison_entity("bbb").await;

        let batch = vec![record("aaa", 10, "b1"), record("bbb", 10, "b1")];
        let ack = store.put_batch(&batch).await.unwrap();
        assert_eq!(ack.stored, 1);
        assert_eq!(ack.failed.len(), 1);
        assert_eq!(ack.failed[0].0.entity_id, "bbb");

        // Retrying just the failed records succeeds after the fault clears
        store.heal_entity("bbb").await;
        let retry: Vec<_> = batch
            .iter()
            .filter(|r| ack.failed.iter().any(|(k, _)| *k == r.key()))
            .cloned()
            .collect();
        let ack = store.put_batch(&retry).await.unwrap();
        assert_eq!(ack.stored, 1);
        assert_eq!(store.record_count().await, 2);
    }

    #[tokio::test]
    async fn range_scan_is_half_open_and_restartable() {
        let store = MemoryStore::new();
        let batch: Vec<_> = (0..10).map(|i| record("aaa", i, "b1")).collect();
        store.put_batch(&batch).await.unwrap();

        // Record at t=10 must not appear in [0, 10)
        store.put_batch(&[record("aaa", 10, "b1")]).await.unwrap();
        let all = store
            .query_range(ts(0), ts(10), &RangeFilter::default(), None, 100)
            .await
            .unwrap();
        assert_eq!(all.len(), 10);

        // Restart from a cursor: no overlap, no gap
        let first = store
            .query_range(ts(0), ts(10), &RangeFilter::default(), None, 4)
            .await
            .unwrap();
        let cursor = first.last().unwrap().key();
        let rest = store
            .query_range(ts(0), ts(10), &RangeFilter::default(), Some(&cursor), 100)
            .await
            .unwrap();
        assert_eq!(first.len() + rest.len(), 10);
        assert_eq!(rest[0].timestamp, ts(4));
    }

    #[tokio::test]
    async fn rejects_empty_window() {
        let store = MemoryStore::new();
        let result = store
            .query_range(ts(10), ts(10), &RangeFilter::default(), None, 100)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn filters_by_entity() {
        let store = MemoryStore::new();
        store
            .put_batch(&[record("aaa", 1, "b1"), record("bbb", 2, "b1")])
            .await
            .unwrap();

        let rows = store
            .query_range(ts(0), ts(10), &RangeFilter::entity("bbb"), None, 100)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity_id, "bbb");
    }
}
