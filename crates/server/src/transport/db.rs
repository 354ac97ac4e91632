// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Database administration: stats, cleanup, vacuum, retention settings.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;
use crate::store::retention::RetentionConfig;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    pub days: u32,
    #[serde(default)]
    pub backend_id: Option<i64>,
}

/// `GET /api/db/stats`
pub async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store = Arc::clone(&state.store);
    match tokio::task::spawn_blocking(move || store.db_stats()).await {
        Ok(Ok(body)) => Json(body).into_response(),
        Ok(Err(e)) => {
            tracing::error!(err = %format!("{e:#}"), "db stats failed");
            ApiError::Internal.to_http_response("db stats failed").into_response()
        }
        Err(e) => {
            tracing::error!(err = %e, "db stats task failed");
            ApiError::Internal.to_http_response("db stats failed").into_response()
        }
    }
}

/// `POST /api/db/cleanup` — `days = 0` wipes aggregates (per backend or
/// everywhere); otherwise prunes connection logs older than `days`.
pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CleanupRequest>,
) -> impl IntoResponse {
    if req.days > 365 {
        return ApiError::BadRequest.to_http_response("days must be within 0..=365").into_response();
    }
    if let Some(id) = req.backend_id {
        match state.store.get_backend(id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                return ApiError::NotFound.to_http_response("backend not found").into_response()
            }
            Err(e) => {
                tracing::error!(err = %format!("{e:#}"), "backend lookup failed");
                return ApiError::Internal.to_http_response("query failed").into_response();
            }
        }
    }

    // A full wipe also empties the matching realtime buckets so pending
    // deltas cannot resurrect the data on the next flush.
    if req.days == 0 {
        match req.backend_id {
            Some(id) => state.cache.clear_backend(id),
            None => {
                if let Ok(backends) = state.store.list_backends() {
                    for backend in backends {
                        state.cache.clear_backend(backend.id);
                    }
                }
            }
        }
    }

    let store = Arc::clone(&state.store);
    let result =
        tokio::task::spawn_blocking(move || store.cleanup_old_data(req.backend_id, req.days)).await;
    match result {
        Ok(Ok(counts)) => Json(serde_json::json!({ "deleted": counts })).into_response(),
        Ok(Err(e)) => {
            tracing::error!(err = %format!("{e:#}"), "cleanup failed");
            ApiError::Internal.to_http_response("cleanup failed").into_response()
        }
        Err(e) => {
            tracing::error!(err = %e, "cleanup task failed");
            ApiError::Internal.to_http_response("cleanup failed").into_response()
        }
    }
}

/// `POST /api/db/vacuum`
pub async fn vacuum(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store = Arc::clone(&state.store);
    match tokio::task::spawn_blocking(move || store.vacuum()).await {
        Ok(Ok(())) => Json(serde_json::json!({ "vacuumed": true })).into_response(),
        Ok(Err(e)) => {
            tracing::error!(err = %format!("{e:#}"), "vacuum failed");
            ApiError::Internal.to_http_response("vacuum failed").into_response()
        }
        Err(e) => {
            tracing::error!(err = %e, "vacuum task failed");
            ApiError::Internal.to_http_response("vacuum failed").into_response()
        }
    }
}

/// `GET /api/db/retention`
pub async fn get_retention(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.get_retention() {
        Ok(config) => Json(config).into_response(),
        Err(e) => {
            tracing::error!(err = %format!("{e:#}"), "retention read failed");
            ApiError::Internal.to_http_response("retention read failed").into_response()
        }
    }
}

/// `PUT /api/db/retention`
pub async fn put_retention(
    State(state): State<Arc<AppState>>,
    Json(config): Json<RetentionConfig>,
) -> impl IntoResponse {
    if let Err(msg) = config.validate() {
        return ApiError::BadRequest.to_http_response(msg).into_response();
    }
    match state.store.set_retention(&config) {
        Ok(()) => Json(config).into_response(),
        Err(e) => {
            tracing::error!(err = %format!("{e:#}"), "retention update failed");
            ApiError::Internal.to_http_response("retention update failed").into_response()
        }
    }
}
