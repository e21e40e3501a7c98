use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use health::HealthRegistry;
use ingest::aggregate::Aggregator;
use ingest::coordinator::{Coordinator, CoordinatorOptions};
use ingest::router::router;
use ingest::source::StaticSource;
use ingest::stores::memory::MemoryStore;

/// Ingest two snapshots and expose the query surface over the memory store.
async fn test_app() -> (axum::Router, HealthRegistry) {
    let snapshots = vec![
        (
            "000000Z".to_string(),
            Bytes::from(
                json!({
                    "now": 1_000.0,
                    "aircraft": [
                        {"hex": "aaa111", "lat": 40.0, "lon": 2.0, "gs": 400.0,
                         "alt_baro": 30000, "r": "EC-AAA", "t": "A320"},
                        {"hex": "bbb222", "lat": 41.0, "lon": 3.0, "gs": 380.0},
                    ]
                })
                .to_string(),
            ),
        ),
        (
            "000500Z".to_string(),
            Bytes::from(
                json!({
                    "now": 1_300.0,
                    "aircraft": [
                        {"hex": "aaa111", "lat": 40.5, "lon": 2.5, "gs": 410.0,
                         "alt_baro": 32000, "emergency": "general"},
                        {"hex": "bbb222", "lat": 41.5, "lon": 3.5, "gs": 390.0},
                    ]
                })
                .to_string(),
            ),
        ),
    ];

    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(
        Arc::new(StaticSource::new(snapshots)),
        store.clone(),
        CoordinatorOptions::default(),
    );
    coordinator.run_once().await.unwrap();
    coordinator.run_once().await.unwrap();

    let aggregator = Arc::new(Aggregator::new(store.clone(), Duration::ZERO));
    let liveness = HealthRegistry::new("liveness");
    let app = router(store, aggregator, liveness.clone(), false);
    (app, liveness)
}

async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn index_responds() {
    let (app, _) = test_app().await;
    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"bdi-api");
}

#[tokio::test]
async fn lists_aircraft_ascending_with_metadata() {
    let (app, _) = test_app().await;
    let (status, body) = get_json(&app, "/api/v1/aircraft").await;
    assert_eq!(status, StatusCode::OK);

    let aircraft = body.as_array().unwrap();
    assert_eq!(aircraft.len(), 2);
    assert_eq!(aircraft[0]["icao"], "aaa111");
    assert_eq!(aircraft[0]["registration"], "EC-AAA");
    assert_eq!(aircraft[0]["type"], "A320");
    assert_eq!(aircraft[1]["icao"], "bbb222");
    assert_eq!(aircraft[1]["registration"], Value::Null);
}

#[tokio::test]
async fn pages_aircraft_listing() {
    let (app, _) = test_app().await;
    let (status, body) = get_json(&app, "/api/v1/aircraft?num_results=1&page=1").await;
    assert_eq!(status, StatusCode::OK);

    let aircraft = body.as_array().unwrap();
    assert_eq!(aircraft.len(), 1);
    assert_eq!(aircraft[0]["icao"], "bbb222");
}

#[tokio::test]
async fn positions_are_time_ascending() {
    let (app, _) = test_app().await;
    let (status, body) = get_json(&app, "/api/v1/aircraft/AAA111/positions").await;
    assert_eq!(status, StatusCode::OK);

    let positions = body.as_array().unwrap();
    assert_eq!(positions.len(), 2);
    assert_eq!(positions[0]["lat"], 40.0);
    assert_eq!(positions[1]["lat"], 40.5);
}

#[tokio::test]
async fn degenerate_paging_parameters_are_clamped() {
    let (app, _) = test_app().await;

    // num_results=0 falls back to the default page size, not an unbounded
    // scan of the whole history
    let (status, body) = get_json(&app, "/api/v1/aircraft/aaa111/positions?num_results=0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (status, body) =
        get_json(&app, "/api/v1/aircraft/aaa111/positions?num_results=0&page=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 0);

    // Absurd page numbers must not overflow the offset computation
    let uri = format!(
        "/api/v1/aircraft/aaa111/positions?num_results=1000&page={}",
        usize::MAX
    );
    let (status, body) = get_json(&app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 0);

    let (status, body) = get_json(&app, "/api/v1/aircraft?num_results=0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn positions_of_unknown_aircraft_are_empty() {
    let (app, _) = test_app().await;
    let (status, body) = get_json(&app, "/api/v1/aircraft/zzz999/positions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn stats_aggregate_over_all_observations() {
    let (app, _) = test_app().await;
    let (status, body) = get_json(&app, "/api/v1/aircraft/aaa111/stats").await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(body["max_altitude_baro"], 32000.0);
    assert_eq!(body["max_ground_speed"], 410.0);
    assert_eq!(body["had_emergency"], true);
}

#[tokio::test]
async fn latest_returns_merged_state_or_404() {
    let (app, _) = test_app().await;

    let (status, body) = get_json(&app, "/api/v1/aircraft/aaa111/latest").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entity_id"], "aaa111");
    assert_eq!(body["fields"]["gs"]["value"]["value"], 410.0);

    let (status, _) = get_json(&app, "/api/v1/aircraft/zzz999/latest").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn top_k_is_deterministic_on_ties() {
    let (app, _) = test_app().await;

    // Both aircraft have two observations; ascending icao breaks the tie
    let (status, body) = get_json(&app, "/api/v1/aggregates/top?k=1").await;
    assert_eq!(status, StatusCode::OK);
    let top = body.as_array().unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0]["entity_id"], "aaa111");
    assert_eq!(top[0]["count"], 2);
}

#[tokio::test]
async fn counts_respect_half_open_windows() {
    let (app, _) = test_app().await;

    // Only the first snapshot (t=1000) falls inside [0, 1300)
    let (status, body) = get_json(&app, "/api/v1/aggregates/count?start=0&end=1300").await;
    assert_eq!(status, StatusCode::OK);
    let counts = body.as_array().unwrap();
    assert_eq!(counts.len(), 2);
    assert_eq!(counts[0]["count"], 1);
    assert_eq!(counts[1]["count"], 1);
}

#[tokio::test]
async fn invalid_windows_are_bad_requests() {
    let (app, _) = test_app().await;
    let (status, _) = get_json(&app, "/api/v1/aggregates/count?start=10&end=10").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn liveness_tracks_registered_components() {
    let (app, liveness) = test_app().await;

    // No component registered yet: not alive
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/_liveness")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let handle = liveness.register("coordinator".to_string(), time::Duration::seconds(30));
    handle.report_healthy();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/_liveness")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
