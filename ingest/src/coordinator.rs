use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use health::HealthHandle;

use crate::api::IngestError;
use crate::merge;
use crate::record::{self, BatchTag, CanonicalRecord};
use crate::retry::RetryPolicy;
use crate::source::{Fetch, RecordSource};
use crate::store::{Checkpoint, Store};

/// Lifecycle of one ingestion attempt. `Failed` is reachable from any
/// non-terminal stage; cancellation is only honored before `Persisting`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchStage {
    Fetched,
    Normalizing,
    Merging,
    Persisting,
    Acknowledged,
    Failed,
}

impl std::fmt::Display for BatchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStage::Fetched => write!(f, "fetched"),
            BatchStage::Normalizing => write!(f, "normalizing"),
            BatchStage::Merging => write!(f, "merging"),
            BatchStage::Persisting => write!(f, "persisting"),
            BatchStage::Acknowledged => write!(f, "acknowledged"),
            BatchStage::Failed => write!(f, "failed"),
        }
    }
}

/// What happened to an acknowledged batch, for logs and tests.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchReport {
    pub batch_id: String,
    pub stage: BatchStage,
    pub stored: usize,
    pub deduplicated: usize,
    pub rejected: usize,
}

/// A batch that exhausted its retries or hit a non-retryable error. Kept
/// around so operators can see it; never silently dropped.
#[derive(Clone, Debug, PartialEq)]
pub struct FailedBatch {
    pub batch_id: String,
    pub stage: BatchStage,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Ingested(BatchReport),
    /// The source reported end of stream: a clean pause, poll again later.
    Idle,
}

#[derive(Clone, Copy, Debug)]
pub struct CoordinatorOptions {
    pub retry_policy: RetryPolicy,
    /// Maximum attempts per stage, including the first one.
    pub retry_limit: u32,
    /// Merge/persist parallelism. Records are partitioned by entity-id hash
    /// so that work on the same entity is never concurrent.
    pub partitions: usize,
    /// Records per store write.
    pub batch_size: usize,
    pub poll_interval: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            retry_limit: 3,
            partitions: 8,
            batch_size: 500,
            poll_interval: Duration::from_secs(30),
        }
    }
}

struct Position {
    cursor: String,
    next_seq: u64,
    resumed: bool,
}

/// Drives fetch → normalize → merge → persist → acknowledge for each batch,
/// owning the batch lifecycle exclusively.
pub struct Coordinator {
    source: Arc<dyn RecordSource + Send + Sync>,
    store: Arc<dyn Store + Send + Sync>,
    options: CoordinatorOptions,
    position: Mutex<Position>,
    failed: Mutex<Vec<FailedBatch>>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl Coordinator {
    pub fn new(
        source: Arc<dyn RecordSource + Send + Sync>,
        store: Arc<dyn Store + Send + Sync>,
        options: CoordinatorOptions,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            source,
            store,
            options,
            position: Mutex::new(Position {
                cursor: String::new(),
                next_seq: 1,
                resumed: false,
            }),
            failed: Mutex::new(Vec::new()),
            cancel_tx,
            cancel_rx,
        }
    }

    /// Request cancellation. In-flight batches stop before persisting;
    /// a batch already persisting runs to acknowledged or failed.
    pub fn cancel(&self) {
        _ = self.cancel_tx.send(true);
    }

    fn cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Batches that reached `Failed`, oldest first.
    pub async fn failed_batches(&self) -> Vec<FailedBatch> {
        self.failed.lock().await.clone()
    }

    /// Poll the source forever, reporting liveness on every iteration.
    pub async fn run(&self, liveness: HealthHandle) {
        loop {
            if self.cancelled() {
                info!("ingestion loop cancelled, stopping");
                return;
            }
            liveness.report_healthy();

            match self.run_once().await {
                Ok(RunOutcome::Ingested(report)) => {
                    info!(
                        batch = report.batch_id,
                        stored = report.stored,
                        deduplicated = report.deduplicated,
                        rejected = report.rejected,
                        "batch acknowledged"
                    );
                }
                Ok(RunOutcome::Idle) => {
                    tokio::time::sleep(self.options.poll_interval).await;
                }
                Err(IngestError::Cancelled) => return,
                Err(error) => {
                    // Already recorded in failed_batches; pause before retrying
                    tracing::error!("batch failed: {}", error);
                    tokio::time::sleep(self.options.poll_interval).await;
                }
            }
        }
    }

    /// Ingest at most one batch from the source.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<RunOutcome, IngestError> {
        let (cursor, seq) = self.resume_position().await?;

        if self.cancelled() {
            return Err(IngestError::Cancelled);
        }

        let fetched = with_retry(&self.options, "fetch", &format!("cursor={cursor}"), || {
            self.source.fetch_batch(&cursor)
        })
        .await;
        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(error) => {
                self.record_failure(format!("cursor={cursor}"), BatchStage::Fetched, &error)
                    .await;
                return Err(error);
            }
        };

        let batch = match fetched {
            Fetch::EndOfStream => return Ok(RunOutcome::Idle),
            Fetch::Batch(batch) => batch,
        };
        let tag = BatchTag {
            id: batch.id.clone(),
            seq,
        };

        // Normalizing: cancellation is still side-effect free here
        if self.cancelled() {
            return Err(IngestError::Cancelled);
        }

        let raw = match record::snapshot_from_bytes(batch.payload.clone(), &tag) {
            Ok(raw) => raw,
            Err(error) => {
                self.record_failure(batch.id.clone(), BatchStage::Normalizing, &error)
                    .await;
                return Err(error);
            }
        };

        let mut records = Vec::with_capacity(raw.len());
        let mut rejected = 0usize;
        for raw_record in &raw {
            match record::normalize(raw_record) {
                Ok(canonical) => records.push(canonical),
                Err(rejection) => {
                    rejected += 1;
                    warn!(
                        batch = rejection.batch_id,
                        reason = %rejection.reason,
                        "rejected raw record"
                    );
                    counter!(
                        "ingest_records_rejected_total",
                        "reason" => rejection.reason.to_string()
                    )
                    .increment(1);
                }
            }
        }

        // Merging and persisting, partitioned by entity-id hash so writes to
        // the same entity stay serialized without a global lock.
        let result = self.merge_and_persist(records).await;
        let (stored, deduplicated) = match result {
            Ok(outcome) => outcome,
            Err(error) => {
                let stage = match &error {
                    IngestError::Conflict { .. } => BatchStage::Merging,
                    _ => BatchStage::Persisting,
                };
                self.record_failure(batch.id.clone(), stage, &error).await;
                return Err(error);
            }
        };

        // Acknowledge: the watermark is durable before the cursor advances
        let checkpoint = Checkpoint {
            cursor: batch.next_cursor.clone(),
            batch_seq: seq,
            updated_at: OffsetDateTime::now_utc(),
        };
        if let Err(error) = with_retry(&self.options, "checkpoint", &batch.id, || {
            self.store.write_checkpoint(&checkpoint)
        })
        .await
        {
            self.record_failure(batch.id.clone(), BatchStage::Persisting, &error)
                .await;
            return Err(error);
        }

        {
            let mut position = self.position.lock().await;
            position.cursor = batch.next_cursor;
            position.next_seq = seq + 1;
        }

        counter!("ingest_batches_acknowledged_total").increment(1);
        counter!("ingest_records_stored_total").increment(stored as u64);

        Ok(RunOutcome::Ingested(BatchReport {
            batch_id: batch.id,
            stage: BatchStage::Acknowledged,
            stored,
            deduplicated,
            rejected,
        }))
    }

    /// Current cursor and batch sequence, resuming from the durable
    /// checkpoint on the first call after startup.
    async fn resume_position(&self) -> Result<(String, u64), IngestError> {
        let mut position = self.position.lock().await;
        if !position.resumed {
            if let Some(checkpoint) = self.store.read_checkpoint().await? {
                info!(
                    cursor = checkpoint.cursor,
                    batch_seq = checkpoint.batch_seq,
                    "resuming from checkpoint"
                );
                position.cursor = checkpoint.cursor;
                position.next_seq = checkpoint.batch_seq + 1;
            }
            position.resumed = true;
        }
        Ok((position.cursor.clone(), position.next_seq))
    }

    async fn merge_and_persist(
        &self,
        records: Vec<CanonicalRecord>,
    ) -> Result<(usize, usize), IngestError> {
        let partitions = self.options.partitions.max(1);
        let mut partitioned: Vec<Vec<CanonicalRecord>> = vec![Vec::new(); partitions];
        for record in records {
            let mut hasher = DefaultHasher::new();
            record.entity_id.hash(&mut hasher);
            partitioned[(hasher.finish() as usize) % partitions].push(record);
        }

        let mut set = JoinSet::new();
        for partition in partitioned.into_iter().filter(|p| !p.is_empty()) {
            let store = self.store.clone();
            let options = self.options;
            set.spawn(async move { persist_partition(store, partition, options).await });
        }

        let mut stored = 0;
        let mut deduplicated = 0;
        while let Some(joined) = set.join_next().await {
            let (s, d) = joined
                .map_err(|e| IngestError::TransientStore(format!("partition task panicked: {e}")))??;
            stored += s;
            deduplicated += d;
        }
        Ok((stored, deduplicated))
    }

    async fn record_failure(&self, batch_id: String, stage: BatchStage, error: &IngestError) {
        counter!("ingest_batches_failed_total").increment(1);
        self.failed.lock().await.push(FailedBatch {
            batch_id,
            stage,
            error: error.to_string(),
        });
    }
}

/// Run `op` up to `retry_limit` times, backing off between transient
/// failures. Non-transient errors propagate immediately.
async fn with_retry<T, F, Fut>(
    options: &CoordinatorOptions,
    stage: &'static str,
    batch_id: &str,
    mut op: F,
) -> Result<T, IngestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IngestError>>,
{
    let limit = options.retry_limit.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < limit => {
                let backoff = options.retry_policy.time_until_next_retry(attempt);
                warn!(
                    stage,
                    batch = batch_id,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "transient failure, retrying: {}",
                    error
                );
                tokio::time::sleep(backoff).await;
            }
            Err(error) if error.is_transient() => {
                return Err(IngestError::ExhaustedRetries {
                    batch_id: batch_id.to_string(),
                    stage,
                    attempts: attempt,
                });
            }
            Err(error) => return Err(error),
        }
    }
}

/// Merge and persist one partition. Records are grouped by entity and folded
/// in timestamp order; transient store errors get the same bounded backoff
/// as every other stage, and persisted records that fail are retried alone,
/// so a partial write never forces a rewrite of the whole partition.
async fn persist_partition(
    store: Arc<dyn Store + Send + Sync>,
    records: Vec<CanonicalRecord>,
    options: CoordinatorOptions,
) -> Result<(usize, usize), IngestError> {
    let batch_id = records[0].batch.id.clone();

    let mut by_entity: BTreeMap<String, Vec<CanonicalRecord>> = BTreeMap::new();
    for record in &records {
        by_entity
            .entry(record.entity_id.clone())
            .or_default()
            .push(record.clone());
    }

    for (entity_id, mut observations) in by_entity {
        observations.sort_by(|a, b| {
            (a.timestamp, a.batch.seq).cmp(&(b.timestamp, b.batch.seq))
        });

        let mut state = with_retry(&options, "persist", &batch_id, || {
            store.get_latest(&entity_id)
        })
        .await?;
        for observation in &observations {
            state = Some(merge::merge(state, observation)?);
        }
        if let Some(state) = state {
            with_retry(&options, "persist", &batch_id, || {
                store.upsert_state(state.clone())
            })
            .await?;
        }
    }

    let mut stored = 0;
    let mut deduplicated = 0;
    for chunk in records.chunks(options.batch_size.max(1)) {
        let mut pending: Vec<CanonicalRecord> = chunk.to_vec();
        let limit = options.retry_limit.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let ack = match store.put_batch(&pending).await {
                Ok(ack) => ack,
                Err(error) if error.is_transient() && attempt < limit => {
                    warn!(
                        batch = batch_id,
                        attempt,
                        "transient store failure, retrying: {}",
                        error
                    );
                    tokio::time::sleep(options.retry_policy.time_until_next_retry(attempt))
                        .await;
                    continue;
                }
                Err(error) if error.is_transient() => {
                    return Err(IngestError::ExhaustedRetries {
                        batch_id,
                        stage: "persist",
                        attempts: attempt,
                    });
                }
                Err(error) => return Err(error),
            };
            stored += ack.stored;
            deduplicated += ack.deduplicated;
            if ack.is_complete() {
                break;
            }
            if attempt >= limit {
                let first = &ack.failed[0];
                return Err(IngestError::ExhaustedRetries {
                    batch_id: first.0.batch_id.clone(),
                    stage: "persist",
                    attempts: attempt,
                });
            }
            // Retry only the records the store reported as failed
            pending.retain(|record| {
                ack.failed.iter().any(|(key, _)| *key == record.key())
            });
            tokio::time::sleep(options.retry_policy.time_until_next_retry(attempt)).await;
        }
    }

    Ok((stored, deduplicated))
}
