use std::collections::BTreeMap;
use std::io::prelude::*;

use bytes::{Buf, Bytes};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::api::{IngestError, RejectionReason};

/// Provenance tag shared by every record of one ingestion attempt.
/// `seq` is assigned by the coordinator in arrival order and breaks
/// equal-timestamp merge ties; `id` is the durable write-once key component.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BatchTag {
    pub id: String,
    pub seq: u64,
}

/// Field values are a tagged variant rather than raw JSON so that shape
/// validation happens once, at the normalizer boundary.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", content = "value")]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    Text(String),
    Bool(bool),
}

impl FieldValue {
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Float(_) => "float",
            FieldValue::Int(_) => "int",
            FieldValue::Text(_) => "text",
            FieldValue::Bool(_) => "bool",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(f) => Some(*f),
            FieldValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

/// A single normalized observation. `entity_id` and `timestamp` are
/// non-optional by construction: raw records missing either are rejected
/// before this type exists.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct CanonicalRecord {
    pub entity_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub fields: BTreeMap<String, FieldValue>,
    pub batch: BatchTag,
}

impl CanonicalRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            entity_id: self.entity_id.clone(),
            timestamp: self.timestamp,
            batch_id: self.batch.id.clone(),
        }
    }
}

/// Write-once identity of a stored record, also the keyset cursor for
/// restartable range scans (ordered by timestamp, then entity, then batch).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub struct RecordKey {
    pub entity_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub batch_id: String,
}

/// One field of a merged `EntityState`, carrying enough provenance to decide
/// last-writer-wins against any later observation.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ObservedField {
    pub value: FieldValue,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
    pub batch_seq: u64,
}

/// Current best-known state of one entity, maintained by the merge engine.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct EntityState {
    pub entity_id: String,
    pub fields: BTreeMap<String, ObservedField>,
}

impl EntityState {
    pub fn new(entity_id: String) -> Self {
        Self {
            entity_id,
            fields: BTreeMap::new(),
        }
    }

    /// Timestamp of the newest observation contributing to this state.
    pub fn last_seen(&self) -> Option<OffsetDateTime> {
        self.fields.values().map(|f| f.observed_at).max()
    }
}

/// One aircraft object lifted out of a readsb-hist snapshot, not yet
/// validated. Discarded after normalization.
#[derive(Clone, Debug)]
pub struct RawRecord {
    pub payload: Value,
    /// The snapshot's `now` field, epoch seconds. Absent or unparseable
    /// values surface as per-record rejections, not batch failures.
    pub timestamp: Option<f64>,
    pub batch: BatchTag,
}

/// A raw record the normalizer refused, with its reason code. Emitted for
/// observability only.
#[derive(Clone, Debug, PartialEq)]
pub struct Rejection {
    pub reason: RejectionReason,
    pub batch_id: String,
}

#[derive(Deserialize)]
struct RawSnapshot {
    now: Option<f64>,
    #[serde(default)]
    aircraft: Vec<Value>,
}

/// Decode one snapshot file into raw records. Files are usually gzipped but
/// the upstream archive also serves plain JSON, so fall back on gzip errors.
pub fn snapshot_from_bytes(bytes: Bytes, batch: &BatchTag) -> Result<Vec<RawRecord>, IngestError> {
    tracing::debug!(len = bytes.len(), batch = %batch.id, "decoding snapshot");

    let payload = {
        let mut decoder = GzDecoder::new(bytes.clone().reader());
        let mut decoded = String::new();
        match decoder.read_to_string(&mut decoded) {
            Ok(_) => decoded,
            Err(_) => String::from_utf8(bytes.into()).map_err(|e| {
                tracing::error!("failed to decode snapshot body: {}", e);
                IngestError::SnapshotDecodingError(String::from("invalid body encoding"))
            })?,
        }
    };

    let snapshot: RawSnapshot = serde_json::from_str(&payload)?;
    let timestamp = snapshot.now;
    Ok(snapshot
        .aircraft
        .into_iter()
        .map(|payload| RawRecord {
            payload,
            timestamp,
            batch: batch.clone(),
        })
        .collect())
}

/// Parse a raw aircraft object into a canonical record, or reject it with a
/// reason code. Rejections never abort the batch.
pub fn normalize(raw: &RawRecord) -> Result<CanonicalRecord, Rejection> {
    let reject = |reason| Rejection {
        reason,
        batch_id: raw.batch.id.clone(),
    };

    let entity_id = raw
        .payload
        .get("hex")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| reject(RejectionReason::MissingEntityId))?;

    let seconds = raw
        .timestamp
        .ok_or_else(|| reject(RejectionReason::MissingTimestamp))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(reject(RejectionReason::UnparseableTimestamp));
    }
    let timestamp = OffsetDateTime::from_unix_timestamp_nanos((seconds * 1e9) as i128)
        .map_err(|_| reject(RejectionReason::UnparseableTimestamp))?;

    let mut fields = BTreeMap::new();

    if let Some(lat) = numeric_field(&raw.payload, "lat") {
        if !(-90.0..=90.0).contains(&lat) {
            return Err(reject(RejectionReason::InvalidFieldValue));
        }
        fields.insert("lat".to_string(), FieldValue::Float(lat));
    }
    if let Some(lon) = numeric_field(&raw.payload, "lon") {
        if !(-180.0..=180.0).contains(&lon) {
            return Err(reject(RejectionReason::InvalidFieldValue));
        }
        fields.insert("lon".to_string(), FieldValue::Float(lon));
    }
    // alt_baro is "ground" while taxiing; only the numeric readings are kept
    if let Some(alt) = numeric_field(&raw.payload, "alt_baro") {
        fields.insert("alt_baro".to_string(), FieldValue::Float(alt));
    }
    if let Some(gs) = numeric_field(&raw.payload, "gs") {
        if gs < 0.0 {
            return Err(reject(RejectionReason::InvalidFieldValue));
        }
        fields.insert("gs".to_string(), FieldValue::Float(gs));
    }
    if let Some(emergency) = text_field(&raw.payload, "emergency") {
        if emergency != "none" {
            fields.insert("emergency".to_string(), FieldValue::Text(emergency));
        }
    }
    if let Some(registration) = text_field(&raw.payload, "r") {
        fields.insert("registration".to_string(), FieldValue::Text(registration));
    }
    if let Some(kind) = text_field(&raw.payload, "t") {
        fields.insert("type".to_string(), FieldValue::Text(kind));
    }

    Ok(CanonicalRecord {
        entity_id,
        timestamp,
        fields,
        batch: raw.batch.clone(),
    })
}

/// Sources encode some numeric fields as strings; accept both.
fn numeric_field(payload: &Value, name: &str) -> Option<f64> {
    match payload.get(name)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn text_field(payload: &Value, name: &str) -> Option<String> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use std::io::prelude::*;

    use bytes::Bytes;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;

    use super::{normalize, snapshot_from_bytes, BatchTag, FieldValue, RawRecord};
    use crate::api::RejectionReason;

    fn batch() -> BatchTag {
        BatchTag {
            id: "day=20231101/000000Z".to_string(),
            seq: 1,
        }
    }

    fn raw(payload: serde_json::Value) -> RawRecord {
        RawRecord {
            payload,
            timestamp: Some(1698796800.0),
            batch: batch(),
        }
    }

    #[test]
    fn decodes_gzipped_snapshot() {
        let body = json!({
            "now": 1698796800.0,
            "aircraft": [
                {"hex": "a1b2c3", "lat": 41.3, "lon": 2.1},
                {"hex": "06a153", "lat": 50.0, "lon": 8.5},
            ]
        })
        .to_string();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let records = snapshot_from_bytes(Bytes::from(compressed), &batch()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].timestamp, Some(1698796800.0));
    }

    #[test]
    fn falls_back_to_plain_json() {
        let body = json!({"now": 10.0, "aircraft": [{"hex": "a1b2c3"}]}).to_string();
        let records = snapshot_from_bytes(Bytes::from(body), &batch()).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn rejects_garbage_payload() {
        let result = snapshot_from_bytes(Bytes::from_static(b"not json"), &batch());
        assert!(result.is_err());
    }

    #[test]
    fn normalizes_full_record() {
        let record = normalize(&raw(json!({
            "hex": "A1B2C3",
            "lat": 41.29,
            "lon": 2.08,
            "alt_baro": 32000,
            "gs": "412.5",
            "r": "EC-ABC",
            "t": "A320",
            "emergency": "none",
        })))
        .unwrap();

        assert_eq!(record.entity_id, "a1b2c3");
        assert_eq!(record.fields.get("lat"), Some(&FieldValue::Float(41.29)));
        assert_eq!(record.fields.get("gs"), Some(&FieldValue::Float(412.5)));
        assert_eq!(
            record.fields.get("registration"),
            Some(&FieldValue::Text("EC-ABC".to_string()))
        );
        // "none" means no emergency, the field is omitted entirely
        assert!(!record.fields.contains_key("emergency"));
    }

    #[test]
    fn rejects_missing_entity_id() {
        let rejection = normalize(&raw(json!({"lat": 1.0, "lon": 2.0}))).unwrap_err();
        assert_eq!(rejection.reason, RejectionReason::MissingEntityId);
    }

    #[test]
    fn rejects_missing_timestamp() {
        let mut record = raw(json!({"hex": "a1b2c3"}));
        record.timestamp = None;
        let rejection = normalize(&record).unwrap_err();
        assert_eq!(rejection.reason, RejectionReason::MissingTimestamp);
    }

    #[test]
    fn rejects_unparseable_timestamp() {
        let mut record = raw(json!({"hex": "a1b2c3"}));
        record.timestamp = Some(f64::NAN);
        let rejection = normalize(&record).unwrap_err();
        assert_eq!(rejection.reason, RejectionReason::UnparseableTimestamp);
    }

    #[test]
    fn rejects_out_of_range_position() {
        let rejection =
            normalize(&raw(json!({"hex": "a1b2c3", "lat": 93.0, "lon": 2.0}))).unwrap_err();
        assert_eq!(rejection.reason, RejectionReason::InvalidFieldValue);

        let rejection =
            normalize(&raw(json!({"hex": "a1b2c3", "lat": 41.0, "lon": -181.0}))).unwrap_err();
        assert_eq!(rejection.reason, RejectionReason::InvalidFieldValue);
    }

    #[test]
    fn skips_non_numeric_altitude() {
        let record = normalize(&raw(json!({"hex": "a1b2c3", "alt_baro": "ground"}))).unwrap();
        assert!(!record.fields.contains_key("alt_baro"));
    }
}
