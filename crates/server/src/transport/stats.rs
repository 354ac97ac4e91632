// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stats query handlers. Reads come from the store; when the requested
//! window is close enough to now, pending realtime deltas are overlaid.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::cache::overlay;
use crate::error::ApiError;
use crate::model::{
    rfc3339, BucketStatRow, ChainStatRow, DomainStatRow, IpStatRow, RuleStatRow, Totals,
};
use crate::state::AppState;
use crate::store::queries::PageParams;
use crate::transport::query::{overlay_applies, parse_window, resolve_backend_id, RangeQuery, Window};

const TOP_N: usize = 10;
const DEFAULT_DETAIL_LIMIT: i64 = 10;
const DEFAULT_TREND_MINUTES: i64 = 1440;

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedQuery {
    pub backend_id: Option<i64>,
    pub start: Option<String>,
    pub end: Option<String>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub limit: i64,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainDrillQuery {
    pub domain: String,
    pub backend_id: Option<i64>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<i64>,
    #[serde(rename = "sourceIP")]
    pub source_ip: Option<String>,
    pub source_chain: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpDrillQuery {
    pub ip: String,
    pub backend_id: Option<i64>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<i64>,
    #[serde(rename = "sourceIP")]
    pub source_ip: Option<String>,
    pub source_chain: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainDrillQuery {
    pub chain: String,
    pub backend_id: Option<i64>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDrillQuery {
    pub rule: String,
    pub backend_id: Option<i64>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendQuery {
    pub backend_id: Option<i64>,
    pub minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionsQuery {
    pub backend_id: Option<i64>,
    #[serde(default)]
    pub offset: i64,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TodayDelta {
    pub upload: u64,
    pub download: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryResponse {
    pub backend_id: i64,
    #[serde(flatten)]
    pub totals: Totals,
    pub top_domains: Vec<DomainStatRow>,
    pub top_ips: Vec<IpStatRow>,
    pub proxy_stats: Vec<ChainStatRow>,
    pub rule_stats: Vec<RuleStatRow>,
    pub hourly_stats: Vec<BucketStatRow>,
    pub today: TodayDelta,
    pub overlaid: bool,
}

// -- Helpers ------------------------------------------------------------------

/// Resolve backend + window, or produce the error response early.
fn resolve(
    state: &AppState,
    backend_id: Option<i64>,
    start: &Option<String>,
    end: &Option<String>,
) -> Result<(i64, Window), axum::response::Response> {
    let backend_id = resolve_backend_id(&state.store, backend_id)
        .map_err(|(kind, msg)| kind.to_http_response(msg).into_response())?;
    let window = parse_window(start, end)
        .map_err(|(kind, msg)| kind.to_http_response(msg).into_response())?;
    Ok((backend_id, window))
}

fn internal(e: anyhow::Error) -> axum::response::Response {
    tracing::error!(err = %format!("{e:#}"), "stats query failed");
    ApiError::Internal.to_http_response("query failed").into_response()
}

fn bucket_window(window: &Window) -> overlay::BucketWindow<'_> {
    window.buckets.as_ref().map(|(s, e)| (s.as_str(), e.as_str()))
}

// -- Handlers -----------------------------------------------------------------

/// `GET /api/stats/summary`
pub async fn summary(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RangeQuery>,
) -> impl IntoResponse {
    let (backend_id, window) = match resolve(&state, q.backend_id, &q.start, &q.end) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let now = Utc::now();

    let result = (|| -> anyhow::Result<SummaryResponse> {
        let mut totals = state.store.totals(backend_id, &window.buckets)?;
        let mut top_domains = state.store.top_domains(backend_id, &window.buckets, TOP_N as i64)?;
        let mut top_ips = state.store.top_ips(backend_id, &window.buckets, TOP_N as i64)?;
        let mut proxy_stats = state.store.proxy_totals(backend_id, &window.buckets)?;
        let mut rule_stats = state.store.rule_totals(backend_id, &window.buckets)?;
        let mut hourly_stats = state.store.hourly_series(backend_id, &window.buckets, 24)?;

        let overlaid = overlay_applies(&window, state.config.realtime_tolerance(), now);
        if overlaid {
            let snapshot = state.cache.snapshot(backend_id);
            let bw = bucket_window(&window);
            overlay::merge_totals(&snapshot, bw, &mut totals);
            top_domains = overlay::merge_top_domains(&snapshot, bw, top_domains, TOP_N);
            top_ips = overlay::merge_top_ips(&snapshot, bw, top_ips, TOP_N);
            proxy_stats = overlay::merge_proxy_stats(&snapshot, bw, proxy_stats);
            rule_stats = overlay::merge_rule_stats(&snapshot, bw, rule_stats);
            hourly_stats = overlay::merge_trend(&snapshot, bw, hourly_stats);
        }

        let db_today = state.store.today_totals(backend_id, now)?;
        let (cached_upload, cached_download) = state.cache.today_delta(backend_id, now);
        let today = TodayDelta {
            upload: db_today.total_upload + cached_upload,
            download: db_today.total_download + cached_download,
        };

        Ok(SummaryResponse {
            backend_id,
            totals,
            top_domains,
            top_ips,
            proxy_stats,
            rule_stats,
            hourly_stats,
            today,
            overlaid,
        })
    })();

    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => internal(e),
    }
}

/// `GET /api/stats/global` — all backends, store only.
pub async fn global(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.global_stats() {
        Ok(body) => Json(body).into_response(),
        Err(e) => internal(e),
    }
}

/// `GET /api/stats/domains` — paginated, store only.
pub async fn domains(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PagedQuery>,
) -> impl IntoResponse {
    let (backend_id, window) = match resolve(&state, q.backend_id, &q.start, &q.end) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let page = PageParams {
        offset: q.offset,
        limit: q.limit,
        sort_by: q.sort_by,
        sort_order: q.sort_order,
        search: q.search,
    };
    match state.store.list_domains(backend_id, &window.buckets, &page) {
        Ok(body) => Json(body).into_response(),
        Err(e) => internal(e),
    }
}

/// `GET /api/stats/ips` — paginated, store only.
pub async fn ips(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PagedQuery>,
) -> impl IntoResponse {
    let (backend_id, window) = match resolve(&state, q.backend_id, &q.start, &q.end) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let page = PageParams {
        offset: q.offset,
        limit: q.limit,
        sort_by: q.sort_by,
        sort_order: q.sort_order,
        search: q.search,
    };
    match state.store.list_ips(backend_id, &window.buckets, &page) {
        Ok(body) => Json(body).into_response(),
        Err(e) => internal(e),
    }
}

/// `GET /api/stats/domains/proxy-stats`
pub async fn domain_proxy_stats(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DomainDrillQuery>,
) -> impl IntoResponse {
    let (backend_id, window) = match resolve(&state, q.backend_id, &q.start, &q.end) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.store.domain_chain_stats(
        backend_id,
        &q.domain,
        &window.buckets,
        q.source_ip.as_deref(),
        q.source_chain.as_deref(),
    ) {
        Ok(body) => Json(body).into_response(),
        Err(e) => internal(e),
    }
}

/// `GET /api/stats/domains/ip-details`
pub async fn domain_ip_details(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DomainDrillQuery>,
) -> impl IntoResponse {
    let (backend_id, window) = match resolve(&state, q.backend_id, &q.start, &q.end) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let limit = q.limit.unwrap_or(DEFAULT_DETAIL_LIMIT);
    match state.store.domain_ip_details(backend_id, &q.domain, &window.buckets, limit) {
        Ok(body) => Json(body).into_response(),
        Err(e) => internal(e),
    }
}

/// `GET /api/stats/ips/proxy-stats`
pub async fn ip_proxy_stats(
    State(state): State<Arc<AppState>>,
    Query(q): Query<IpDrillQuery>,
) -> impl IntoResponse {
    let (backend_id, window) = match resolve(&state, q.backend_id, &q.start, &q.end) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.store.ip_chain_stats(
        backend_id,
        &q.ip,
        &window.buckets,
        q.source_ip.as_deref(),
        q.source_chain.as_deref(),
    ) {
        Ok(body) => Json(body).into_response(),
        Err(e) => internal(e),
    }
}

/// `GET /api/stats/ips/domain-details`
pub async fn ip_domain_details(
    State(state): State<Arc<AppState>>,
    Query(q): Query<IpDrillQuery>,
) -> impl IntoResponse {
    let (backend_id, window) = match resolve(&state, q.backend_id, &q.start, &q.end) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let limit = q.limit.unwrap_or(DEFAULT_DETAIL_LIMIT);
    match state.store.ip_domain_details(backend_id, &q.ip, &window.buckets, limit) {
        Ok(body) => Json(body).into_response(),
        Err(e) => internal(e),
    }
}

/// `GET /api/stats/proxies` — chain totals with overlay.
pub async fn proxies(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RangeQuery>,
) -> impl IntoResponse {
    let (backend_id, window) = match resolve(&state, q.backend_id, &q.start, &q.end) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.store.proxy_totals(backend_id, &window.buckets) {
        Ok(mut body) => {
            if overlay_applies(&window, state.config.realtime_tolerance(), Utc::now()) {
                let snapshot = state.cache.snapshot(backend_id);
                body = overlay::merge_proxy_stats(&snapshot, bucket_window(&window), body);
            }
            Json(body).into_response()
        }
        Err(e) => internal(e),
    }
}

/// `GET /api/stats/proxies/domains`
pub async fn proxy_domains(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ChainDrillQuery>,
) -> impl IntoResponse {
    let (backend_id, window) = match resolve(&state, q.backend_id, &q.start, &q.end) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let limit = q.limit.unwrap_or(DEFAULT_DETAIL_LIMIT);
    match state.store.chain_domains(backend_id, &q.chain, &window.buckets, limit) {
        Ok(body) => Json(body).into_response(),
        Err(e) => internal(e),
    }
}

/// `GET /api/stats/proxies/ips`
pub async fn proxy_ips(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ChainDrillQuery>,
) -> impl IntoResponse {
    let (backend_id, window) = match resolve(&state, q.backend_id, &q.start, &q.end) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let limit = q.limit.unwrap_or(DEFAULT_DETAIL_LIMIT);
    match state.store.chain_ips(backend_id, &q.chain, &window.buckets, limit) {
        Ok(body) => Json(body).into_response(),
        Err(e) => internal(e),
    }
}

/// `GET /api/stats/rules` — rule totals with overlay.
pub async fn rules(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RangeQuery>,
) -> impl IntoResponse {
    let (backend_id, window) = match resolve(&state, q.backend_id, &q.start, &q.end) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.store.rule_totals(backend_id, &window.buckets) {
        Ok(mut body) => {
            if overlay_applies(&window, state.config.realtime_tolerance(), Utc::now()) {
                let snapshot = state.cache.snapshot(backend_id);
                body = overlay::merge_rule_stats(&snapshot, bucket_window(&window), body);
            }
            Json(body).into_response()
        }
        Err(e) => internal(e),
    }
}

/// `GET /api/stats/rules/domains`
pub async fn rule_domains(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RuleDrillQuery>,
) -> impl IntoResponse {
    let (backend_id, window) = match resolve(&state, q.backend_id, &q.start, &q.end) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let limit = q.limit.unwrap_or(DEFAULT_DETAIL_LIMIT);
    match state.store.rule_domains(backend_id, &q.rule, &window.buckets, limit) {
        Ok(body) => Json(body).into_response(),
        Err(e) => internal(e),
    }
}

/// `GET /api/stats/rules/proxy-stats`
pub async fn rule_proxy_stats(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RuleDrillQuery>,
) -> impl IntoResponse {
    let (backend_id, window) = match resolve(&state, q.backend_id, &q.start, &q.end) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.store.rule_chain_stats(backend_id, &q.rule, &window.buckets) {
        Ok(body) => Json(body).into_response(),
        Err(e) => internal(e),
    }
}

/// `GET /api/stats/countries`
pub async fn countries(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RangeQuery>,
) -> impl IntoResponse {
    let (backend_id, window) = match resolve(&state, q.backend_id, &q.start, &q.end) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.store.country_totals(backend_id, &window.buckets) {
        Ok(mut body) => {
            if overlay_applies(&window, state.config.realtime_tolerance(), Utc::now()) {
                let snapshot = state.cache.snapshot(backend_id);
                body = overlay::merge_country_stats(&snapshot, bucket_window(&window), body);
            }
            Json(body).into_response()
        }
        Err(e) => internal(e),
    }
}

/// `GET /api/stats/devices`
pub async fn devices(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RangeQuery>,
) -> impl IntoResponse {
    let (backend_id, window) = match resolve(&state, q.backend_id, &q.start, &q.end) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.store.device_totals(backend_id, &window.buckets) {
        Ok(mut body) => {
            if overlay_applies(&window, state.config.realtime_tolerance(), Utc::now()) {
                let snapshot = state.cache.snapshot(backend_id);
                body = overlay::merge_device_stats(&snapshot, bucket_window(&window), body);
            }
            Json(body).into_response()
        }
        Err(e) => internal(e),
    }
}

/// `GET /api/stats/hourly`
pub async fn hourly(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RangeQuery>,
) -> impl IntoResponse {
    let (backend_id, window) = match resolve(&state, q.backend_id, &q.start, &q.end) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.store.hourly_series(backend_id, &window.buckets, 24) {
        Ok(mut body) => {
            if overlay_applies(&window, state.config.realtime_tolerance(), Utc::now()) {
                let snapshot = state.cache.snapshot(backend_id);
                body = overlay::merge_trend(&snapshot, bucket_window(&window), body);
            }
            Json(body).into_response()
        }
        Err(e) => internal(e),
    }
}

/// `GET /api/stats/trend` — recent hour buckets, always overlaid.
pub async fn trend(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TrendQuery>,
) -> impl IntoResponse {
    let backend_id = match resolve_backend_id(&state.store, q.backend_id) {
        Ok(id) => id,
        Err((kind, msg)) => return kind.to_http_response(msg).into_response(),
    };
    let now = Utc::now();
    let minutes = q.minutes.unwrap_or(DEFAULT_TREND_MINUTES).clamp(60, 60 * 24 * 31);
    let start = rfc3339(now - chrono::Duration::minutes(minutes));
    let end = rfc3339(now + chrono::Duration::hours(1));
    let buckets = Some((start, end));

    match state.store.hourly_series(backend_id, &buckets, minutes / 60 + 1) {
        Ok(mut body) => {
            let snapshot = state.cache.snapshot(backend_id);
            let bw = buckets.as_ref().map(|(s, e)| (s.as_str(), e.as_str()));
            body = overlay::merge_trend(&snapshot, bw, body);
            Json(body).into_response()
        }
        Err(e) => internal(e),
    }
}

/// `GET /api/stats/trend/aggregated` — same shape, summed across backends.
pub async fn trend_aggregated(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TrendQuery>,
) -> impl IntoResponse {
    let now = Utc::now();
    let minutes = q.minutes.unwrap_or(DEFAULT_TREND_MINUTES).clamp(60, 60 * 24 * 31);
    let start = rfc3339(now - chrono::Duration::minutes(minutes));
    let end = rfc3339(now + chrono::Duration::hours(1));
    let buckets = Some((start, end));

    let backends = match state.store.list_backends() {
        Ok(list) => list,
        Err(e) => return internal(e),
    };

    let mut merged: Vec<BucketStatRow> = Vec::new();
    for backend in backends {
        let series = match state.store.hourly_series(backend.id, &buckets, minutes / 60 + 1) {
            Ok(series) => series,
            Err(e) => return internal(e),
        };
        let snapshot = state.cache.snapshot(backend.id);
        let bw = buckets.as_ref().map(|(s, e)| (s.as_str(), e.as_str()));
        let series = overlay::merge_trend(&snapshot, bw, series);
        merged = sum_bucket_series(merged, series);
    }
    Json(merged).into_response()
}

fn sum_bucket_series(mut base: Vec<BucketStatRow>, other: Vec<BucketStatRow>) -> Vec<BucketStatRow> {
    for row in other {
        match base.iter_mut().find(|b| b.time_bucket == row.time_bucket) {
            Some(found) => {
                found.upload += row.upload;
                found.download += row.download;
                found.connections += row.connections;
            }
            None => base.push(row),
        }
    }
    base.sort_by(|a, b| a.time_bucket.cmp(&b.time_bucket));
    base
}

/// `GET /api/stats/connections` — recent closed connections.
pub async fn connections(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ConnectionsQuery>,
) -> impl IntoResponse {
    let backend_id = match resolve_backend_id(&state.store, q.backend_id) {
        Ok(id) => id,
        Err((kind, msg)) => return kind.to_http_response(msg).into_response(),
    };
    let limit = q.limit.unwrap_or(100);
    match state.store.connection_log(backend_id, limit, q.offset) {
        Ok(body) => Json(body).into_response(),
        Err(e) => internal(e),
    }
}
