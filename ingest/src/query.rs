use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::instrument;

use crate::aggregate::{AggregateKind, AggregateResult, EntityCount, EntityStats, Window};
use crate::api::IngestError;
use crate::record::{EntityState, FieldValue};
use crate::router;
use crate::store::RangeFilter;

/// Page size used when walking the store for offset-style pagination.
const SCAN_PAGE: usize = 1024;

fn window_from(start: Option<f64>, end: Option<f64>) -> Result<Window, IngestError> {
    let start = match start {
        Some(seconds) => parse_seconds(seconds)?,
        None => OffsetDateTime::UNIX_EPOCH,
    };
    let end = match end {
        Some(seconds) => parse_seconds(seconds)?,
        // Effectively unbounded
        None => OffsetDateTime::from_unix_timestamp(253_402_300_799)
            .expect("static timestamp is valid"),
    };
    Window::new(start, end)
}

fn parse_seconds(seconds: f64) -> Result<OffsetDateTime, IngestError> {
    if !seconds.is_finite() {
        return Err(IngestError::InvalidWindow);
    }
    OffsetDateTime::from_unix_timestamp_nanos((seconds * 1e9) as i128)
        .map_err(|_| IngestError::InvalidWindow)
}

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_num_results")]
    pub num_results: usize,
    #[serde(default)]
    pub page: usize,
}

impl PageQuery {
    /// Page size; zero falls back to the default instead of an unbounded scan.
    fn limit(&self) -> usize {
        if self.num_results == 0 {
            default_num_results()
        } else {
            self.num_results
        }
    }

    fn offset(&self) -> usize {
        self.page.saturating_mul(self.limit())
    }
}

fn default_num_results() -> usize {
    100
}

#[derive(Deserialize)]
pub struct WindowQuery {
    pub start: Option<f64>,
    pub end: Option<f64>,
}

#[derive(Deserialize)]
pub struct TopQuery {
    #[serde(default = "default_k")]
    pub k: usize,
    pub start: Option<f64>,
    pub end: Option<f64>,
}

fn default_k() -> usize {
    10
}

#[derive(Debug, Serialize)]
pub struct AircraftSummary {
    pub icao: String,
    pub registration: Option<String>,
    #[serde(rename = "type")]
    pub aircraft_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Position {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub lat: f64,
    pub lon: f64,
}

pub async fn index() -> &'static str {
    "bdi-api"
}

fn text(state: &EntityState, field: &str) -> Option<String> {
    match state.fields.get(field).map(|f| &f.value) {
        Some(FieldValue::Text(s)) => Some(s.clone()),
        _ => None,
    }
}

/// All known aircraft, ascending by icao.
#[instrument(skip_all)]
pub async fn list_aircraft(
    State(state): State<router::State>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<AircraftSummary>>, IngestError> {
    let entities = state
        .store
        .list_entities(page.limit(), page.offset())
        .await?;

    let mut aircraft = Vec::with_capacity(entities.len());
    for icao in entities {
        let summary = match state.store.get_latest(&icao).await? {
            Some(current) => AircraftSummary {
                registration: text(&current, "registration"),
                aircraft_type: text(&current, "type"),
                icao,
            },
            None => AircraftSummary {
                icao,
                registration: None,
                aircraft_type: None,
            },
        };
        aircraft.push(summary);
    }
    Ok(Json(aircraft))
}

/// Known positions of one aircraft, ascending by time. Unknown aircraft
/// yield an empty list, matching the store's view of "never observed".
#[instrument(skip_all)]
pub async fn positions(
    State(state): State<router::State>,
    Path(icao): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<Position>>, IngestError> {
    let icao = icao.trim().to_lowercase();
    let window = window_from(None, None)?;
    let filter = RangeFilter::entity(icao);

    let limit = page.limit();
    let mut skip = page.offset();
    let mut results = Vec::with_capacity(limit);
    let mut cursor = None;
    'scan: loop {
        let batch = state
            .store
            .query_range(window.start, window.end, &filter, cursor.as_ref(), SCAN_PAGE)
            .await?;
        for record in &batch {
            let (lat, lon) = match (
                record.fields.get("lat").and_then(|v| v.as_f64()),
                record.fields.get("lon").and_then(|v| v.as_f64()),
            ) {
                (Some(lat), Some(lon)) => (lat, lon),
                // Metadata-only observations carry no position
                _ => continue,
            };
            if skip > 0 {
                skip -= 1;
                continue;
            }
            results.push(Position {
                timestamp: record.timestamp,
                lat,
                lon,
            });
            if results.len() == limit {
                break 'scan;
            }
        }
        if batch.len() < SCAN_PAGE {
            break;
        }
        cursor = batch.last().map(|r| r.key());
    }

    Ok(Json(results))
}

/// Statistics over every observation of one aircraft.
#[instrument(skip_all)]
pub async fn stats(
    State(state): State<router::State>,
    Path(icao): Path<String>,
) -> Result<Json<EntityStats>, IngestError> {
    let icao = icao.trim().to_lowercase();
    let result = state
        .aggregator
        .aggregate(
            AggregateKind::EntityStats { entity_id: icao },
            window_from(None, None)?,
        )
        .await?;
    match result {
        AggregateResult::Stats(stats) => Ok(Json(stats)),
        _ => Err(IngestError::TransientStore(
            "unexpected aggregate result shape".to_string(),
        )),
    }
}

/// Merged best-known state of one aircraft.
#[instrument(skip_all)]
pub async fn latest(
    State(state): State<router::State>,
    Path(icao): Path<String>,
) -> Result<Json<EntityState>, IngestError> {
    let icao = icao.trim().to_lowercase();
    match state.store.get_latest(&icao).await? {
        Some(current) => Ok(Json(current)),
        None => Err(IngestError::EntityNotFound),
    }
}

/// The k busiest aircraft by observation count in the window.
#[instrument(skip_all)]
pub async fn top(
    State(state): State<router::State>,
    Query(query): Query<TopQuery>,
) -> Result<Json<Vec<EntityCount>>, IngestError> {
    let window = window_from(query.start, query.end)?;
    let result = state
        .aggregator
        .aggregate(AggregateKind::TopKByCount { k: query.k }, window)
        .await?;
    match result {
        AggregateResult::Counts(counts) => Ok(Json(counts)),
        _ => Err(IngestError::TransientStore(
            "unexpected aggregate result shape".to_string(),
        )),
    }
}

/// Exact observation count per aircraft in the window.
#[instrument(skip_all)]
pub async fn counts(
    State(state): State<router::State>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Vec<EntityCount>>, IngestError> {
    let window = window_from(query.start, query.end)?;
    let result = state
        .aggregator
        .aggregate(AggregateKind::CountPerEntity, window)
        .await?;
    match result {
        AggregateResult::Counts(counts) => Ok(Json(counts)),
        _ => Err(IngestError::TransientStore(
            "unexpected aggregate result shape".to_string(),
        )),
    }
}
