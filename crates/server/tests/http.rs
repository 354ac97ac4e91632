// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Integration tests for the query API.
//!
//! Uses `axum_test::TestServer`, so no real TCP is needed. The store runs
//! in memory; collector sessions spawned by the supervisor fail their
//! upstream connects harmlessly in the background.

use std::sync::Arc;

use axum::http::StatusCode;
use axum_test::TestServer;
use chrono::{Duration, Utc};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use clashtrack::cache::RealtimeCache;
use clashtrack::collector::supervisor::Supervisor;
use clashtrack::config::Config;
use clashtrack::geoip::NoopGeoIp;
use clashtrack::model::{hour_bucket, DimensionKey, StatPatch};
use clashtrack::state::AppState;
use clashtrack::store::Store;
use clashtrack::transport::build_router;

fn test_state() -> Arc<AppState> {
    let config = Config::parse_from(["clashtrack"]);
    let shutdown = CancellationToken::new();
    let geoip = Arc::new(NoopGeoIp);
    let store = Arc::new(Store::open_in_memory(geoip.clone()).expect("in-memory store"));
    let cache = Arc::new(RealtimeCache::new());
    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        geoip,
        shutdown.clone(),
    ));
    Arc::new(AppState { config, store, cache, supervisor, shutdown })
}

fn test_server(state: Arc<AppState>) -> TestServer {
    TestServer::new(build_router(state)).expect("create test server")
}

/// Flush one hourly row directly into the store.
fn seed_hourly(state: &AppState, backend_id: i64, bucket: &str, upload: u64, download: u64) {
    let row = clashtrack::cache::FlushRow {
        bucket: bucket.to_owned(),
        key: DimensionKey::Hourly,
        upload,
        download,
        connections: 1,
        last_seen: Utc::now(),
        geo: None,
    };
    state
        .store
        .flush_rows(backend_id, clashtrack::model::Dimension::Hourly, &[row])
        .map_err(|e| format!("{e}"))
        .expect("seed hourly row");
}

async fn create_backend(server: &TestServer, name: &str) -> i64 {
    let resp = server
        .post("/api/backends")
        .json(&serde_json::json!({ "name": name, "url": "http://127.0.0.1:1" }))
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    body["id"].as_i64().unwrap_or_default()
}

// -- Health -------------------------------------------------------------------

#[tokio::test]
async fn health_returns_ok() {
    let server = test_server(test_state());
    let resp = server.get("/health").await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "ok");
}

// -- Backends CRUD ------------------------------------------------------------

#[tokio::test]
async fn create_duplicate_delete_recreate() {
    let server = test_server(test_state());

    let resp = server
        .post("/api/backends")
        .json(&serde_json::json!({ "name": "b", "url": "http://127.0.0.1:1" }))
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    let id = body["id"].as_i64().unwrap_or_default();
    assert_eq!(body["isActive"], true, "first backend becomes active");

    // Duplicate name → 409.
    let resp = server
        .post("/api/backends")
        .json(&serde_json::json!({ "name": "b", "url": "http://127.0.0.1:2" }))
        .await;
    resp.assert_status(StatusCode::CONFLICT);

    // Delete then re-create → 200.
    let resp = server.delete(&format!("/api/backends/{id}")).await;
    resp.assert_status_ok();
    let resp = server
        .post("/api/backends")
        .json(&serde_json::json!({ "name": "b", "url": "http://127.0.0.1:1" }))
        .await;
    resp.assert_status_ok();
}

#[tokio::test]
async fn backends_list_elides_tokens() {
    let server = test_server(test_state());
    let resp = server
        .post("/api/backends")
        .json(&serde_json::json!({
            "name": "secret",
            "url": "http://127.0.0.1:1",
            "token": "hunter2"
        }))
        .await;
    resp.assert_status_ok();

    let resp = server.get("/api/backends").await;
    resp.assert_status_ok();
    let list: Vec<serde_json::Value> = resp.json();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["hasToken"], true);
    assert!(list[0].get("token").is_none(), "token must never be serialized");
}

#[tokio::test]
async fn activate_moves_the_active_flag() {
    let state = test_state();
    let server = test_server(Arc::clone(&state));
    let first = create_backend(&server, "one").await;
    let second = create_backend(&server, "two").await;

    let resp = server.post(&format!("/api/backends/{second}/activate")).await;
    resp.assert_status_ok();

    let resp = server.get("/api/backends/active").await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["id"].as_i64(), Some(second));

    let resp = server.get(&format!("/api/backends/{first}")).await;
    let body: serde_json::Value = resp.json();
    assert_eq!(body["isActive"], false);
}

#[tokio::test]
async fn listening_toggle_flips_state() {
    let state = test_state();
    let server = test_server(Arc::clone(&state));
    let id = create_backend(&server, "toggly").await;

    let resp = server.post(&format!("/api/backends/{id}/listening")).await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["listening"], false);

    let resp = server.post(&format!("/api/backends/{id}/listening")).await;
    let body: serde_json::Value = resp.json();
    assert_eq!(body["listening"], true);
}

#[tokio::test]
async fn update_is_partial_and_404s_on_unknown() {
    let server = test_server(test_state());
    let id = create_backend(&server, "editable").await;

    let resp = server
        .put(&format!("/api/backends/{id}"))
        .json(&serde_json::json!({ "enabled": false }))
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["enabled"], false);
    assert_eq!(body["name"], "editable");

    let resp = server.put("/api/backends/999").json(&serde_json::json!({ "name": "x" })).await;
    resp.assert_status(StatusCode::NOT_FOUND);
}

// -- Stats parameter validation -----------------------------------------------

#[tokio::test]
async fn stats_404_without_active_backend() {
    let server = test_server(test_state());
    let resp = server.get("/api/stats/summary").await;
    resp.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stats_404_for_unknown_backend() {
    let server = test_server(test_state());
    let resp = server.get("/api/stats/summary").add_query_param("backendId", 42).await;
    resp.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn lone_start_is_400() {
    let state = test_state();
    let server = test_server(Arc::clone(&state));
    let _ = create_backend(&server, "windowed").await;

    let resp = server
        .get("/api/stats/summary")
        .add_query_param("start", "2026-08-01T00:00:00Z")
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn inverted_range_is_400() {
    let state = test_state();
    let server = test_server(Arc::clone(&state));
    let _ = create_backend(&server, "windowed2").await;

    let resp = server
        .get("/api/stats/summary")
        .add_query_param("start", "2026-08-02T00:00:00Z")
        .add_query_param("end", "2026-08-01T00:00:00Z")
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
}

// -- Overlay behavior (S4) ----------------------------------------------------

#[tokio::test]
async fn summary_overlays_pending_deltas_for_recent_windows() {
    let state = test_state();
    let server = test_server(Arc::clone(&state));
    let id = create_backend(&server, "overlaid").await;

    let now = Utc::now();
    let two_hours_ago = hour_bucket(now - Duration::hours(2));
    seed_hourly(&state, id, &two_hours_ago, 0, 1000);

    let patch = StatPatch { upload: 0, download: 250, connections: 1, last_seen: now, geo: None };
    state.cache.apply(id, &hour_bucket(now), DimensionKey::Hourly, &patch);

    // Window ending now-ish: store + cache.
    let resp = server
        .get("/api/stats/summary")
        .add_query_param("backendId", id)
        .add_query_param("start", (now - Duration::hours(3)).to_rfc3339())
        .add_query_param("end", (now + Duration::seconds(1)).to_rfc3339())
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["totalDownload"], 1250);
    assert_eq!(body["overlaid"], true);

    // Historical window: store only.
    let resp = server
        .get("/api/stats/summary")
        .add_query_param("backendId", id)
        .add_query_param("start", (now - Duration::hours(3)).to_rfc3339())
        .add_query_param("end", (now - Duration::minutes(10)).to_rfc3339())
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["totalDownload"], 1000);
    assert_eq!(body["overlaid"], false);
}

// -- Pagination ---------------------------------------------------------------

#[tokio::test]
async fn domains_pagination_arithmetic() {
    let state = test_state();
    let server = test_server(Arc::clone(&state));
    let id = create_backend(&server, "paged").await;

    let bucket = hour_bucket(Utc::now());
    let rows: Vec<clashtrack::cache::FlushRow> = (0..12)
        .map(|i| clashtrack::cache::FlushRow {
            bucket: bucket.clone(),
            key: DimensionKey::Domain { host: format!("host{i:02}.example") },
            upload: 1,
            download: i,
            connections: 1,
            last_seen: Utc::now(),
            geo: None,
        })
        .collect();
    state
        .store
        .flush_rows(id, clashtrack::model::Dimension::Domain, &rows)
        .map_err(|e| format!("{e}"))
        .expect("seed domains");

    let resp = server
        .get("/api/stats/domains")
        .add_query_param("backendId", id)
        .add_query_param("offset", 10)
        .add_query_param("limit", 5)
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    let total = body["total"].as_u64().unwrap_or_default();
    let data = body["data"].as_array().map(Vec::len).unwrap_or_default();
    assert_eq!(total, 12);
    assert!(data <= 5);
    assert!(10 + data as u64 <= total);
}

// -- Cleanup (S6) -------------------------------------------------------------

#[tokio::test]
async fn cleanup_wipe_isolates_backends() {
    let state = test_state();
    let server = test_server(Arc::clone(&state));
    let one = create_backend(&server, "wipe-me").await;
    let two = create_backend(&server, "keep-me").await;

    let bucket = hour_bucket(Utc::now());
    seed_hourly(&state, one, &bucket, 10, 10);
    seed_hourly(&state, two, &bucket, 20, 20);
    let patch =
        StatPatch { upload: 1, download: 1, connections: 0, last_seen: Utc::now(), geo: None };
    state.cache.apply(one, &bucket, DimensionKey::Hourly, &patch);

    let resp = server
        .post("/api/db/cleanup")
        .json(&serde_json::json!({ "days": 0, "backendId": one }))
        .await;
    resp.assert_status_ok();

    assert!(state.cache.is_empty(one), "realtime cache must be empty after wipe");
    let totals_one = state.store.totals(one, &None).map_err(|e| format!("{e}")).unwrap_or_default();
    let totals_two = state.store.totals(two, &None).map_err(|e| format!("{e}")).unwrap_or_default();
    assert_eq!(totals_one.total_download, 0);
    assert_eq!(totals_two.total_download, 20);
}

// -- Retention ----------------------------------------------------------------

#[tokio::test]
async fn retention_round_trip_and_validation() {
    let server = test_server(test_state());

    let resp = server.get("/api/db/retention").await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["connectionLogsDays"], 7);

    // Out-of-bounds rejected.
    let resp = server
        .put("/api/db/retention")
        .json(&serde_json::json!({
            "connectionLogsDays": 0,
            "hourlyStatsDays": 90,
            "autoCleanup": true
        }))
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);

    // Valid config sticks.
    let resp = server
        .put("/api/db/retention")
        .json(&serde_json::json!({
            "connectionLogsDays": 14,
            "hourlyStatsDays": 30,
            "autoCleanup": false
        }))
        .await;
    resp.assert_status_ok();
    let resp = server.get("/api/db/retention").await;
    let body: serde_json::Value = resp.json();
    assert_eq!(body["connectionLogsDays"], 14);
    assert_eq!(body["autoCleanup"], false);
}

// -- Admin --------------------------------------------------------------------

#[tokio::test]
async fn db_stats_reports_tables() {
    let server = test_server(test_state());
    let resp = server.get("/api/db/stats").await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    let tables = body["tables"].as_array().map(Vec::len).unwrap_or_default();
    assert!(tables >= 12);
}

#[tokio::test]
async fn global_stats_cover_all_backends() {
    let state = test_state();
    let server = test_server(Arc::clone(&state));
    let one = create_backend(&server, "g1").await;
    let two = create_backend(&server, "g2").await;

    let bucket = hour_bucket(Utc::now());
    seed_hourly(&state, one, &bucket, 0, 100);
    seed_hourly(&state, two, &bucket, 0, 50);

    let resp = server.get("/api/stats/global").await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["totalDownload"], 150);
    assert_eq!(body["backends"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn adhoc_test_endpoint_rejects_unreachable_upstream() {
    let server = test_server(test_state());
    let resp = server
        .post("/api/backends/test")
        .json(&serde_json::json!({ "url": "http://127.0.0.1:1" }))
        .await;
    resp.assert_status(StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = resp.json();
    assert!(body["error"].as_str().map(|s| !s.is_empty()).unwrap_or(false));
}
