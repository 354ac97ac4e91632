// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Backend management handlers. Every mutation re-syncs the supervisor so
//! collector sessions follow the table.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::collector::protocol::ws_endpoint;
use crate::collector::session::{self, HealthView};
use crate::error::ApiError;
use crate::model::Backend;
use crate::state::AppState;
use crate::store::backends::{is_duplicate_name, BackendPatch};

// -- Request/Response types ---------------------------------------------------

/// Backend as served to clients: token elided, `hasToken` added.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendView {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub has_token: bool,
    pub enabled: bool,
    pub listening: bool,
    pub is_active: bool,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthView>,
}

impl BackendView {
    fn from_backend(backend: Backend, health: Option<HealthView>) -> Self {
        Self {
            id: backend.id,
            name: backend.name,
            url: backend.url,
            has_token: backend.token.is_some(),
            enabled: backend.enabled,
            listening: backend.listening,
            is_active: backend.is_active,
            created_at: backend.created_at,
            health,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateBackendRequest {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateBackendRequest {
    pub name: Option<String>,
    pub url: Option<String>,
    pub token: Option<String>,
    pub enabled: Option<bool>,
    pub listening: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ListeningRequest {
    pub listening: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct TestRequest {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResponse {
    pub success: bool,
    pub latency_ms: u64,
}

// -- Handlers -----------------------------------------------------------------

/// `GET /api/backends`
pub async fn list(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let backends = match state.store.list_backends() {
        Ok(list) => list,
        Err(e) => {
            tracing::error!(err = %format!("{e:#}"), "listing backends failed");
            return ApiError::Internal.to_http_response("query failed").into_response();
        }
    };
    let mut health = state.supervisor.health_all().await;
    let views: Vec<BackendView> = backends
        .into_iter()
        .map(|b| {
            let h = health.remove(&b.id);
            BackendView::from_backend(b, h)
        })
        .collect();
    Json(views).into_response()
}

/// `GET /api/backends/active`
pub async fn active(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.get_active_backend() {
        Ok(Some(backend)) => {
            let health = state.supervisor.health(backend.id).await;
            Json(BackendView::from_backend(backend, health)).into_response()
        }
        Ok(None) => ApiError::NotFound.to_http_response("no active backend").into_response(),
        Err(e) => {
            tracing::error!(err = %format!("{e:#}"), "active backend lookup failed");
            ApiError::Internal.to_http_response("query failed").into_response()
        }
    }
}

/// `GET /api/backends/listening`
pub async fn listening(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list_listening_backends() {
        Ok(backends) => {
            let mut health = state.supervisor.health_all().await;
            let views: Vec<BackendView> = backends
                .into_iter()
                .map(|b| {
                    let h = health.remove(&b.id);
                    BackendView::from_backend(b, h)
                })
                .collect();
            Json(views).into_response()
        }
        Err(e) => {
            tracing::error!(err = %format!("{e:#}"), "listening backends lookup failed");
            ApiError::Internal.to_http_response("query failed").into_response()
        }
    }
}

/// `GET /api/backends/{id}`
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.get_backend(id) {
        Ok(Some(backend)) => {
            let health = state.supervisor.health(id).await;
            Json(BackendView::from_backend(backend, health)).into_response()
        }
        Ok(None) => ApiError::NotFound.to_http_response("backend not found").into_response(),
        Err(e) => {
            tracing::error!(err = %format!("{e:#}"), "backend lookup failed");
            ApiError::Internal.to_http_response("query failed").into_response()
        }
    }
}

/// `POST /api/backends` — 409 on duplicate name; first one becomes active.
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateBackendRequest>,
) -> impl IntoResponse {
    let name = req.name.trim();
    let url = req.url.trim().trim_end_matches('/');
    if name.is_empty() || url.is_empty() {
        return ApiError::BadRequest.to_http_response("name and url are required").into_response();
    }

    match state.store.create_backend(name, url, req.token.as_deref().filter(|t| !t.is_empty())) {
        Ok(backend) => {
            if let Err(e) = state.supervisor.sync().await {
                tracing::warn!(err = %format!("{e:#}"), "supervisor sync after create failed");
            }
            tracing::info!(backend_id = backend.id, name = %backend.name, "backend created");
            Json(BackendView::from_backend(backend, None)).into_response()
        }
        Err(e) if is_duplicate_name(&e) => ApiError::Conflict
            .to_http_response(format!("backend name already exists: {name}"))
            .into_response(),
        Err(e) => {
            tracing::error!(err = %format!("{e:#}"), "backend create failed");
            ApiError::Internal.to_http_response("create failed").into_response()
        }
    }
}

/// `PUT /api/backends/{id}` — partial update.
pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateBackendRequest>,
) -> impl IntoResponse {
    let patch = BackendPatch {
        name: req.name.map(|n| n.trim().to_owned()),
        url: req.url.map(|u| u.trim().trim_end_matches('/').to_owned()),
        token: req.token,
        enabled: req.enabled,
        listening: req.listening,
    };
    match state.store.update_backend(id, &patch) {
        Ok(Some(backend)) => {
            if let Err(e) = state.supervisor.sync().await {
                tracing::warn!(err = %format!("{e:#}"), "supervisor sync after update failed");
            }
            let health = state.supervisor.health(id).await;
            Json(BackendView::from_backend(backend, health)).into_response()
        }
        Ok(None) => ApiError::NotFound.to_http_response("backend not found").into_response(),
        Err(e) if is_duplicate_name(&e) => {
            ApiError::Conflict.to_http_response("backend name already exists").into_response()
        }
        Err(e) => {
            tracing::error!(err = %format!("{e:#}"), "backend update failed");
            ApiError::Internal.to_http_response("update failed").into_response()
        }
    }
}

/// `DELETE /api/backends/{id}` — cascades to all aggregate rows.
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.delete_backend(id) {
        Ok(true) => {
            state.cache.clear_backend(id);
            if let Err(e) = state.supervisor.sync().await {
                tracing::warn!(err = %format!("{e:#}"), "supervisor sync after delete failed");
            }
            tracing::info!(backend_id = id, "backend deleted");
            Json(serde_json::json!({ "id": id, "removed": true })).into_response()
        }
        Ok(false) => ApiError::NotFound.to_http_response("backend not found").into_response(),
        Err(e) => {
            tracing::error!(err = %format!("{e:#}"), "backend delete failed");
            ApiError::Internal.to_http_response("delete failed").into_response()
        }
    }
}

/// `POST /api/backends/{id}/activate` — at most one active backend.
pub async fn activate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.set_active_backend(id) {
        Ok(Some(backend)) => {
            let health = state.supervisor.health(id).await;
            Json(BackendView::from_backend(backend, health)).into_response()
        }
        Ok(None) => ApiError::NotFound.to_http_response("backend not found").into_response(),
        Err(e) => {
            tracing::error!(err = %format!("{e:#}"), "backend activate failed");
            ApiError::Internal.to_http_response("activate failed").into_response()
        }
    }
}

/// `POST /api/backends/{id}/listening` — toggle (or set) live ingestion
/// without forgetting credentials.
pub async fn set_listening(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    body: Option<Json<ListeningRequest>>,
) -> impl IntoResponse {
    let current = match state.store.get_backend(id) {
        Ok(Some(backend)) => backend,
        Ok(None) => {
            return ApiError::NotFound.to_http_response("backend not found").into_response()
        }
        Err(e) => {
            tracing::error!(err = %format!("{e:#}"), "backend lookup failed");
            return ApiError::Internal.to_http_response("query failed").into_response();
        }
    };
    let target = body.and_then(|Json(b)| b.listening).unwrap_or(!current.listening);

    match state.store.set_listening(id, target) {
        Ok(Some(backend)) => {
            if let Err(e) = state.supervisor.sync().await {
                tracing::warn!(err = %format!("{e:#}"), "supervisor sync after listening toggle failed");
            }
            let health = state.supervisor.health(id).await;
            Json(BackendView::from_backend(backend, health)).into_response()
        }
        Ok(None) => ApiError::NotFound.to_http_response("backend not found").into_response(),
        Err(e) => {
            tracing::error!(err = %format!("{e:#}"), "listening toggle failed");
            ApiError::Internal.to_http_response("update failed").into_response()
        }
    }
}

/// `POST /api/backends/{id}/test` — open a real WS subscription, 5 s cap.
pub async fn test_by_id(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let backend = match state.store.get_backend(id) {
        Ok(Some(backend)) => backend,
        Ok(None) => {
            return ApiError::NotFound.to_http_response("backend not found").into_response()
        }
        Err(e) => {
            tracing::error!(err = %format!("{e:#}"), "backend lookup failed");
            return ApiError::Internal.to_http_response("query failed").into_response();
        }
    };
    run_ws_test(&backend.url, backend.token.as_deref()).await
}

/// `POST /api/backends/test` — test arbitrary connection parameters.
pub async fn test_adhoc(
    State(_state): State<Arc<AppState>>,
    Json(req): Json<TestRequest>,
) -> impl IntoResponse {
    if req.url.trim().is_empty() {
        return ApiError::BadRequest.to_http_response("url is required").into_response();
    }
    run_ws_test(req.url.trim(), req.token.as_deref().filter(|t| !t.is_empty())).await
}

async fn run_ws_test(url: &str, token: Option<&str>) -> axum::response::Response {
    let endpoint = ws_endpoint(url);
    let started = Instant::now();
    match session::connect(&endpoint, token).await {
        Ok(_stream) => {
            let latency_ms = started.elapsed().as_millis() as u64;
            Json(TestResponse { success: true, latency_ms }).into_response()
        }
        Err(e) => ApiError::UpstreamError
            .to_http_response(format!("upstream unreachable: {e:#}"))
            .into_response(),
    }
}

/// `POST /api/backends/{id}/clear-data` — wipe aggregates and the live
/// cache; the running session keeps its baselines.
pub async fn clear_data(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
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

    // Clear the cache first so a concurrent flush cannot re-persist rows
    // drained before the wipe.
    state.cache.clear_backend(id);

    let store = Arc::clone(&state.store);
    let result = tokio::task::spawn_blocking(move || store.cleanup_old_data(Some(id), 0)).await;
    match result {
        Ok(Ok(counts)) => {
            tracing::info!(backend_id = id, "backend data cleared");
            Json(serde_json::json!({ "backendId": id, "deleted": counts })).into_response()
        }
        Ok(Err(e)) => {
            tracing::error!(err = %format!("{e:#}"), "clear-data failed");
            ApiError::Internal.to_http_response("clear failed").into_response()
        }
        Err(e) => {
            tracing::error!(err = %e, "clear-data task failed");
            ApiError::Internal.to_http_response("clear failed").into_response()
        }
    }
}
