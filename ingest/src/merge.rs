use metrics::counter;

use crate::api::IngestError;
use crate::record::{CanonicalRecord, EntityState, ObservedField};

/// Fold one canonical record into the best-known state of its entity.
///
/// Conflict resolution is last-writer-wins per field: the observation with
/// the later timestamp supplies each field independently, so an out-of-order
/// arrival only fills fields not already covered by a newer observation.
/// Equal timestamps are broken by batch arrival order (`batch.seq`).
///
/// Merging is idempotent: replaying a record that already contributed its
/// `(timestamp, value)` pairs leaves the state unchanged, which is what makes
/// at-least-once redelivery of the last in-flight batch safe.
pub fn merge(
    existing: Option<EntityState>,
    incoming: &CanonicalRecord,
) -> Result<EntityState, IngestError> {
    let mut state =
        existing.unwrap_or_else(|| EntityState::new(incoming.entity_id.clone()));
    debug_assert_eq!(state.entity_id, incoming.entity_id);

    for (name, value) in &incoming.fields {
        match state.fields.get(name) {
            Some(current) => {
                if current.value.kind() != value.kind() {
                    counter!("ingest_merge_conflicts_total").increment(1);
                    return Err(IngestError::Conflict {
                        entity_id: incoming.entity_id.clone(),
                        field: name.clone(),
                        detail: format!(
                            "incompatible value kinds {} and {}",
                            current.value.kind(),
                            value.kind()
                        ),
                    });
                }

                let wins = incoming.timestamp > current.observed_at
                    || (incoming.timestamp == current.observed_at
                        && incoming.batch.seq > current.batch_seq);
                if wins {
                    state.fields.insert(
                        name.clone(),
                        ObservedField {
                            value: value.clone(),
                            observed_at: incoming.timestamp,
                            batch_seq: incoming.batch.seq,
                        },
                    );
                }
            }
            None => {
                state.fields.insert(
                    name.clone(),
                    ObservedField {
                        value: value.clone(),
                        observed_at: incoming.timestamp,
                        batch_seq: incoming.batch.seq,
                    },
                );
            }
        }
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use time::OffsetDateTime;

    use super::merge;
    use crate::api::IngestError;
    use crate::record::{BatchTag, CanonicalRecord, FieldValue};

    fn record(
        ts: i64,
        seq: u64,
        fields: Vec<(&str, FieldValue)>,
    ) -> CanonicalRecord {
        CanonicalRecord {
            entity_id: "a1b2c3".to_string(),
            timestamp: OffsetDateTime::from_unix_timestamp(ts).unwrap(),
            fields: BTreeMap::from_iter(
                fields.into_iter().map(|(k, v)| (k.to_string(), v)),
            ),
            batch: BatchTag {
                id: format!("batch-{seq}"),
                seq,
            },
        }
    }

    #[test]
    fn later_timestamp_wins_regardless_of_arrival_order() {
        let older = record(5, 1, vec![("gs", FieldValue::Float(100.0))]);
        let newer = record(10, 2, vec![("gs", FieldValue::Float(200.0))]);

        let forward = merge(Some(merge(None, &older).unwrap()), &newer).unwrap();
        let backward = merge(Some(merge(None, &newer).unwrap()), &older).unwrap();

        assert_eq!(forward, backward);
        assert_eq!(
            forward.fields.get("gs").unwrap().value,
            FieldValue::Float(200.0)
        );
    }

    #[test]
    fn out_of_order_arrival_fills_uncovered_fields_only() {
        let newer = record(10, 1, vec![("gs", FieldValue::Float(200.0))]);
        let older = record(
            5,
            2,
            vec![
                ("gs", FieldValue::Float(100.0)),
                ("alt_baro", FieldValue::Float(32000.0)),
            ],
        );

        let state = merge(Some(merge(None, &newer).unwrap()), &older).unwrap();

        // gs stays from the newer observation, alt_baro is backfilled
        assert_eq!(
            state.fields.get("gs").unwrap().value,
            FieldValue::Float(200.0)
        );
        assert_eq!(
            state.fields.get("alt_baro").unwrap().value,
            FieldValue::Float(32000.0)
        );
    }

    #[test]
    fn equal_timestamps_break_ties_by_batch_arrival() {
        let first = record(10, 1, vec![("gs", FieldValue::Float(100.0))]);
        let second = record(10, 2, vec![("gs", FieldValue::Float(200.0))]);

        let state = merge(Some(merge(None, &first).unwrap()), &second).unwrap();
        assert_eq!(
            state.fields.get("gs").unwrap().value,
            FieldValue::Float(200.0)
        );

        // And the earlier batch never claws a field back
        let state = merge(Some(state), &first).unwrap();
        assert_eq!(
            state.fields.get("gs").unwrap().value,
            FieldValue::Float(200.0)
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let observation = record(
            10,
            1,
            vec![
                ("lat", FieldValue::Float(41.3)),
                ("lon", FieldValue::Float(2.1)),
            ],
        );

        let once = merge(None, &observation).unwrap();
        let twice = merge(Some(once.clone()), &observation).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn incompatible_field_kinds_conflict() {
        let numeric = record(10, 1, vec![("alt_baro", FieldValue::Float(32000.0))]);
        let textual = record(
            15,
            2,
            vec![("alt_baro", FieldValue::Text("ground".to_string()))],
        );

        let state = merge(None, &numeric).unwrap();
        let err = merge(Some(state), &textual).unwrap_err();
        assert!(matches!(err, IngestError::Conflict { .. }));
    }
}
