use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::api::IngestError;
use crate::merge;
use crate::record::EntityState;
use crate::store::{RangeFilter, Store};

/// Page size used when walking the store's restartable range scans.
const SCAN_PAGE: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    /// Exact observation count per entity in the window, ascending entity id.
    CountPerEntity,
    /// The k busiest entities by observation count; ties by ascending
    /// entity id for determinism.
    TopKByCount { k: usize },
    /// Best-known state of every entity observed before the window end.
    LatestSnapshot,
    /// Per-aircraft statistics recovered from the observations in the window.
    EntityStats { entity_id: String },
}

/// Half-open query window `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Window {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl Window {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self, IngestError> {
        if start >= end {
            return Err(IngestError::InvalidWindow);
        }
        Ok(Self { start, end })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EntityCount {
    pub entity_id: String,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EntityStats {
    pub entity_id: String,
    pub max_altitude_baro: Option<f64>,
    pub max_ground_speed: Option<f64>,
    pub had_emergency: bool,
}

/// A computed, read-only snapshot. Never persisted; recomputed per query or
/// served from the short-lived cache below.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AggregateResult {
    Counts(Vec<EntityCount>),
    Snapshot(Vec<EntityState>),
    Stats(EntityStats),
}

/// Computes windowed aggregates over the store. Results are cached per
/// `(kind, window)` for `stale_bound`, which bounds how stale a repeated
/// query may be while keeping reads off the writers' path.
pub struct Aggregator {
    store: Arc<dyn Store + Send + Sync>,
    stale_bound: Duration,
    cache: Mutex<HashMap<(AggregateKind, Window), (Instant, AggregateResult)>>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn Store + Send + Sync>, stale_bound: Duration) -> Self {
        Self {
            store,
            stale_bound,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn aggregate(
        &self,
        kind: AggregateKind,
        window: Window,
    ) -> Result<AggregateResult, IngestError> {
        let cache_key = (kind.clone(), window);
        {
            let cache = self.cache.lock().await;
            if let Some((computed_at, result)) = cache.get(&cache_key) {
                if computed_at.elapsed() < self.stale_bound {
                    counter!("ingest_aggregate_cache_hits_total").increment(1);
                    return Ok(result.clone());
                }
            }
        }

        let result = match &kind {
            AggregateKind::CountPerEntity => self.count_per_entity(window, None).await?,
            AggregateKind::TopKByCount { k } => self.top_k(window, *k).await?,
            AggregateKind::LatestSnapshot => self.latest_snapshot(window).await?,
            AggregateKind::EntityStats { entity_id } => {
                self.entity_stats(window, entity_id).await?
            }
        };

        counter!("ingest_aggregate_computed_total").increment(1);
        let mut cache = self.cache.lock().await;
        // Expired entries are dead weight; drop them so arbitrary caller
        // windows cannot grow the map without bound
        cache.retain(|_, (computed_at, _)| computed_at.elapsed() < self.stale_bound);
        cache.insert(cache_key, (Instant::now(), result.clone()));
        Ok(result)
    }

    async fn count_per_entity(
        &self,
        window: Window,
        filter_entity: Option<&str>,
    ) -> Result<AggregateResult, IngestError> {
        let filter = match filter_entity {
            Some(entity_id) => RangeFilter::entity(entity_id),
            None => RangeFilter::default(),
        };

        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut cursor = None;
        loop {
            let page = self
                .store
                .query_range(window.start, window.end, &filter, cursor.as_ref(), SCAN_PAGE)
                .await?;
            for record in &page {
                *counts.entry(record.entity_id.clone()).or_default() += 1;
            }
            if page.len() < SCAN_PAGE {
                break;
            }
            cursor = page.last().map(|r| r.key());
        }

        Ok(AggregateResult::Counts(
            counts
                .into_iter()
                .map(|(entity_id, count)| EntityCount { entity_id, count })
                .collect(),
        ))
    }

    async fn top_k(&self, window: Window, k: usize) -> Result<AggregateResult, IngestError> {
        let AggregateResult::Counts(mut counts) = self.count_per_entity(window, None).await?
        else {
            unreachable!("count_per_entity returns Counts");
        };

        // Ties by ascending entity id; already ascending, so a stable sort
        // on count alone keeps the order deterministic.
        counts.sort_by_key(|c| Reverse(c.count));
        counts.truncate(k);
        Ok(AggregateResult::Counts(counts))
    }

    async fn latest_snapshot(&self, window: Window) -> Result<AggregateResult, IngestError> {
        let mut states: BTreeMap<String, EntityState> = BTreeMap::new();
        let mut cursor = None;
        loop {
            let page = self
                .store
                .query_range(
                    window.start,
                    window.end,
                    &RangeFilter::default(),
                    cursor.as_ref(),
                    SCAN_PAGE,
                )
                .await?;
            for record in &page {
                let existing = states.remove(&record.entity_id);
                let merged = merge::merge(existing, record)?;
                states.insert(record.entity_id.clone(), merged);
            }
            if page.len() < SCAN_PAGE {
                break;
            }
            cursor = page.last().map(|r| r.key());
        }

        Ok(AggregateResult::Snapshot(states.into_values().collect()))
    }

    async fn entity_stats(
        &self,
        window: Window,
        entity_id: &str,
    ) -> Result<AggregateResult, IngestError> {
        let filter = RangeFilter::entity(entity_id);
        let mut stats = EntityStats {
            entity_id: entity_id.to_string(),
            max_altitude_baro: None,
            max_ground_speed: None,
            had_emergency: false,
        };

        let mut cursor = None;
        loop {
            let page = self
                .store
                .query_range(window.start, window.end, &filter, cursor.as_ref(), SCAN_PAGE)
                .await?;
            for record in &page {
                if let Some(alt) = record.fields.get("alt_baro").and_then(|v| v.as_f64()) {
                    stats.max_altitude_baro =
                        Some(stats.max_altitude_baro.map_or(alt, |m| m.max(alt)));
                }
                if let Some(gs) = record.fields.get("gs").and_then(|v| v.as_f64()) {
                    stats.max_ground_speed =
                        Some(stats.max_ground_speed.map_or(gs, |m| m.max(gs)));
                }
                if record.fields.contains_key("emergency") {
                    stats.had_emergency = true;
                }
            }
            if page.len() < SCAN_PAGE {
                break;
            }
            cursor = page.last().map(|r| r.key());
        }

        Ok(AggregateResult::Stats(stats))
    }
}
