use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use time::OffsetDateTime;

use crate::api::IngestError;
use crate::record::{BatchTag, CanonicalRecord, EntityState, RecordKey};
use crate::store::{BatchAck, Checkpoint, RangeFilter, Store};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    entity_id TEXT NOT NULL,
    ts_ns     INTEGER NOT NULL,
    batch_id  TEXT NOT NULL,
    batch_seq INTEGER NOT NULL,
    fields    TEXT NOT NULL,
    PRIMARY KEY (entity_id, ts_ns, batch_id)
);
CREATE INDEX IF NOT EXISTS records_by_time ON records (ts_ns, entity_id, batch_id);
CREATE TABLE IF NOT EXISTS entity_states (
    entity_id TEXT PRIMARY KEY,
    state     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS checkpoints (
    name       TEXT PRIMARY KEY,
    cursor     TEXT NOT NULL,
    batch_seq  INTEGER NOT NULL,
    updated_ns INTEGER NOT NULL
);
"#;

/// SQLite-backed store. The composite primary key is the write-once guard
/// (`INSERT OR IGNORE` turns duplicate batches into no-ops) and
/// `records_by_time` backs the range scans.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and apply the schema. A single connection is enough: SQLite
    /// serializes writers anyway, and it keeps `sqlite::memory:` databases
    /// coherent across calls.
    pub async fn connect(url: &str) -> Result<Self, IngestError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(store_error)?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(store_error)?;

        tracing::info!(url, "connected to sqlite store");
        Ok(Self { pool })
    }
}

fn store_error(error: sqlx::Error) -> IngestError {
    IngestError::TransientStore(error.to_string())
}

fn ts_ns(timestamp: OffsetDateTime) -> i64 {
    timestamp.unix_timestamp_nanos() as i64
}

fn from_ts_ns(ns: i64) -> Result<OffsetDateTime, IngestError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ns))
        .map_err(|e| IngestError::TransientStore(format!("corrupt timestamp in store: {e}")))
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CanonicalRecord, IngestError> {
    let fields: String = row.try_get("fields").map_err(store_error)?;
    Ok(CanonicalRecord {
        entity_id: row.try_get("entity_id").map_err(store_error)?,
        timestamp: from_ts_ns(row.try_get("ts_ns").map_err(store_error)?)?,
        fields: serde_json::from_str(&fields)?,
        batch: BatchTag {
            id: row.try_get("batch_id").map_err(store_error)?,
            seq: row.try_get::<i64, _>("batch_seq").map_err(store_error)? as u64,
        },
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn put_batch(&self, records: &[CanonicalRecord]) -> Result<BatchAck, IngestError> {
        let mut ack = BatchAck::default();

        for record in records {
            let fields = serde_json::to_string(&record.fields)?;
            let result = sqlx::query(
                r#"
INSERT OR IGNORE INTO records (entity_id, ts_ns, batch_id, batch_seq, fields)
VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&record.entity_id)
            .bind(ts_ns(record.timestamp))
            .bind(&record.batch.id)
            .bind(record.batch.seq as i64)
            .bind(fields)
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) if done.rows_affected() == 0 => ack.deduplicated += 1,
                Ok(_) => ack.stored += 1,
                Err(error) => ack.failed.push((record.key(), error.to_string())),
            }
        }

        Ok(ack)
    }

    async fn upsert_state(&self, state: EntityState) -> Result<(), IngestError> {
        let body = serde_json::to_string(&state)?;
        sqlx::query(
            r#"
INSERT INTO entity_states (entity_id, state)
VALUES ($1, $2)
ON CONFLICT (entity_id) DO UPDATE SET state = excluded.state
            "#,
        )
        .bind(&state.entity_id)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    async fn get_latest(&self, entity_id: &str) -> Result<Option<EntityState>, IngestError> {
        let row = sqlx::query("SELECT state FROM entity_states WHERE entity_id = $1")
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;

        match row {
            Some(row) => {
                let body: String = row.try_get("state").map_err(store_error)?;
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
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

        let rows = match after {
            Some(cursor) => {
                sqlx::query(
                    r#"
SELECT entity_id, ts_ns, batch_id, batch_seq, fields
FROM records
WHERE ts_ns >= $1 AND ts_ns < $2
  AND ($3 IS NULL OR entity_id = $3)
  AND (ts_ns, entity_id, batch_id) > ($4, $5, $6)
ORDER BY ts_ns, entity_id, batch_id
LIMIT $7
                    "#,
                )
                .bind(ts_ns(start))
                .bind(ts_ns(end))
                .bind(filter.entity_id.as_deref())
                .bind(ts_ns(cursor.timestamp))
                .bind(&cursor.entity_id)
                .bind(&cursor.batch_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
SELECT entity_id, ts_ns, batch_id, batch_seq, fields
FROM records
WHERE ts_ns >= $1 AND ts_ns < $2
  AND ($3 IS NULL OR entity_id = $3)
ORDER BY ts_ns, entity_id, batch_id
LIMIT $4
                    "#,
                )
                .bind(ts_ns(start))
                .bind(ts_ns(end))
                .bind(filter.entity_id.as_deref())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(store_error)?;

        rows.iter().map(record_from_row).collect()
    }

    async fn list_entities(&self, limit: usize, offset: usize) -> Result<Vec<String>, IngestError> {
        let rows = sqlx::query(
            "SELECT entity_id FROM entity_states ORDER BY entity_id LIMIT $1 OFFSET $2",
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter()
            .map(|row| row.try_get("entity_id").map_err(store_error))
            .collect()
    }

    async fn read_checkpoint(&self) -> Result<Option<Checkpoint>, IngestError> {
        let row = sqlx::query(
            "SELECT cursor, batch_seq, updated_ns FROM checkpoints WHERE name = 'ingest'",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        match row {
            Some(row) => Ok(Some(Checkpoint {
                cursor: row.try_get("cursor").map_err(store_error)?,
                batch_seq: row.try_get::<i64, _>("batch_seq").map_err(store_error)? as u64,
                updated_at: from_ts_ns(row.try_get("updated_ns").map_err(store_error)?)?,
            })),
            None => Ok(None),
        }
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), IngestError> {
        sqlx::query(
            r#"
INSERT INTO checkpoints (name, cursor, batch_seq, updated_ns)
VALUES ('ingest', $1, $2, $3)
ON CONFLICT (name) DO UPDATE
SET cursor = excluded.cursor,
    batch_seq = excluded.batch_seq,
    updated_ns = excluded.updated_ns
            "#,
        )
        .bind(&checkpoint.cursor)
        .bind(checkpoint.batch_seq as i64)
        .bind(ts_ns(checkpoint.updated_at))
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(())
    }
}
