use std::future::ready;
use std::sync::Arc;

use axum::{
    routing::get,
    Router,
};
use health::HealthRegistry;
use tower_http::trace::TraceLayer;

use crate::aggregate::Aggregator;
use crate::metrics::{setup_metrics_recorder, track_metrics};
use crate::query;
use crate::store::Store;

#[derive(Clone)]
pub struct State {
    pub store: Arc<dyn Store + Send + Sync>,
    pub aggregator: Arc<Aggregator>,
}

pub fn router<S: Store + Send + Sync + 'static>(
    store: Arc<S>,
    aggregator: Arc<Aggregator>,
    liveness: HealthRegistry,
    metrics: bool,
) -> Router {
    let state = State {
        store,
        aggregator,
    };

    let router = Router::new()
        .route("/", get(query::index))
        .route("/api/v1/aircraft", get(query::list_aircraft))
        .route("/api/v1/aircraft/:icao/positions", get(query::positions))
        .route("/api/v1/aircraft/:icao/stats", get(query::stats))
        .route("/api/v1/aircraft/:icao/latest", get(query::latest))
        .route("/api/v1/aggregates/top", get(query::top))
        .route("/api/v1/aggregates/count", get(query::counts))
        .route(
            "/_liveness",
            get(move || ready(liveness.get_status())),
        )
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when ingest is used as a library (during tests etc)
    // does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
