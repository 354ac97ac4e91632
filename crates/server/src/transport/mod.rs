// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP transport for the query API.

pub mod backends;
pub mod db;
pub mod query;
pub mod stats;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use crate::state::AppState;

/// `GET /health`
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Build the axum `Router` with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health (no prefix, used by supervisors)
        .route("/health", get(health))
        // Stats
        .route("/api/stats/summary", get(stats::summary))
        .route("/api/stats/global", get(stats::global))
        .route("/api/stats/domains", get(stats::domains))
        .route("/api/stats/domains/proxy-stats", get(stats::domain_proxy_stats))
        .route("/api/stats/domains/ip-details", get(stats::domain_ip_details))
        .route("/api/stats/ips", get(stats::ips))
        .route("/api/stats/ips/proxy-stats", get(stats::ip_proxy_stats))
        .route("/api/stats/ips/domain-details", get(stats::ip_domain_details))
        .route("/api/stats/proxies", get(stats::proxies))
        .route("/api/stats/proxies/domains", get(stats::proxy_domains))
        .route("/api/stats/proxies/ips", get(stats::proxy_ips))
        .route("/api/stats/rules", get(stats::rules))
        .route("/api/stats/rules/domains", get(stats::rule_domains))
        .route("/api/stats/rules/proxy-stats", get(stats::rule_proxy_stats))
        .route("/api/stats/countries", get(stats::countries))
        .route("/api/stats/devices", get(stats::devices))
        .route("/api/stats/hourly", get(stats::hourly))
        .route("/api/stats/trend", get(stats::trend))
        .route("/api/stats/trend/aggregated", get(stats::trend_aggregated))
        .route("/api/stats/connections", get(stats::connections))
        // Backends
        .route("/api/backends", get(backends::list).post(backends::create))
        .route("/api/backends/active", get(backends::active))
        .route("/api/backends/listening", get(backends::listening))
        .route("/api/backends/test", post(backends::test_adhoc))
        .route(
            "/api/backends/{id}",
            get(backends::get).put(backends::update).delete(backends::delete),
        )
        .route("/api/backends/{id}/activate", post(backends::activate))
        .route("/api/backends/{id}/listening", post(backends::set_listening))
        .route("/api/backends/{id}/test", post(backends::test_by_id))
        .route("/api/backends/{id}/clear-data", post(backends::clear_data))
        // Database administration
        .route("/api/db/stats", get(db::stats))
        .route("/api/db/cleanup", post(db::cleanup))
        .route("/api/db/vacuum", post(db::vacuum))
        .route("/api/db/retention", get(db::get_retention).put(db::put_retention))
        // Middleware
        .layer(CorsLayer::permissive())
        .with_state(state)
}
