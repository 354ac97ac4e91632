// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use super::*;
use crate::geoip::NoopGeoIp;

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 1, 14, 30, 0).single().unwrap_or_default()
}

// ── window validation ─────────────────────────────────────────────────

#[test]
fn absent_window_is_all_time() {
    let window = parse_window(&None, &None).unwrap_or_default();
    assert!(window.instants.is_none());
    assert!(window.buckets.is_none());
}

#[test]
fn lone_start_is_rejected() {
    let result = parse_window(&Some("2026-08-01T00:00:00Z".into()), &None);
    assert!(matches!(result, Err((ApiError::BadRequest, _))));
}

#[test]
fn inverted_window_is_rejected() {
    let result = parse_window(
        &Some("2026-08-01T12:00:00Z".into()),
        &Some("2026-08-01T00:00:00Z".into()),
    );
    assert!(matches!(result, Err((ApiError::BadRequest, _))));
}

#[test]
fn garbage_datetime_is_rejected() {
    let result = parse_window(&Some("yesterday".into()), &Some("today".into()));
    assert!(matches!(result, Err((ApiError::BadRequest, _))));
}

#[test]
fn valid_window_normalizes_to_utc_buckets() {
    let window = parse_window(
        &Some("2026-08-01T10:00:00+02:00".into()),
        &Some("2026-08-01T14:00:00+02:00".into()),
    )
    .unwrap_or_default();
    let (start, end) = window.buckets.unwrap_or_default();
    assert_eq!(start, "2026-08-01T08:00:00Z");
    assert_eq!(end, "2026-08-01T12:00:00Z");
}

#[test]
fn window_start_floors_to_covering_hour_bucket() {
    // A query starting mid-hour still covers the bucket that hour's
    // traffic lives in.
    let window = parse_window(
        &Some("2026-08-01T14:45:00Z".into()),
        &Some("2026-08-01T14:50:00Z".into()),
    )
    .unwrap_or_default();
    let (start, end) = window.buckets.unwrap_or_default();
    assert_eq!(start, "2026-08-01T14:00:00Z");
    assert_eq!(end, "2026-08-01T14:50:00Z");
}

// ── overlay decision ──────────────────────────────────────────────────

#[test]
fn overlay_applies_without_window() {
    assert!(overlay_applies(&Window::default(), Duration::from_secs(120), now()));
}

#[test]
fn overlay_applies_when_end_is_recent() {
    let window = parse_window(
        &Some("2026-08-01T14:00:00Z".into()),
        &Some("2026-08-01T14:29:00Z".into()),
    )
    .unwrap_or_default();
    assert!(overlay_applies(&window, Duration::from_secs(120), now()));
}

#[test]
fn overlay_off_for_historical_window() {
    let window = parse_window(
        &Some("2026-08-01T12:00:00Z".into()),
        &Some("2026-08-01T13:00:00Z".into()),
    )
    .unwrap_or_default();
    assert!(!overlay_applies(&window, Duration::from_secs(120), now()));
}

#[test]
fn overlay_applies_exactly_at_tolerance() {
    let window = parse_window(
        &Some("2026-08-01T14:00:00Z".into()),
        &Some("2026-08-01T14:28:00Z".into()),
    )
    .unwrap_or_default();
    assert!(overlay_applies(&window, Duration::from_secs(120), now()));
}

// ── backend resolution ────────────────────────────────────────────────

#[test]
fn resolve_prefers_explicit_backend() -> anyhow::Result<()> {
    let store = crate::store::Store::open_in_memory(Arc::new(NoopGeoIp))?;
    let a = store.create_backend("a", "http://a:9090", None)?;
    let b = store.create_backend("b", "http://b:9090", None)?;
    assert!(a.is_active);

    let resolved = resolve_backend_id(&store, Some(b.id));
    assert!(matches!(resolved, Ok(id) if id == b.id));
    Ok(())
}

#[test]
fn resolve_falls_back_to_active() -> anyhow::Result<()> {
    let store = crate::store::Store::open_in_memory(Arc::new(NoopGeoIp))?;
    let a = store.create_backend("a", "http://a:9090", None)?;

    let resolved = resolve_backend_id(&store, None);
    assert!(matches!(resolved, Ok(id) if id == a.id));
    Ok(())
}

#[test]
fn resolve_404s_with_no_active_backend() -> anyhow::Result<()> {
    let store = crate::store::Store::open_in_memory(Arc::new(NoopGeoIp))?;
    let resolved = resolve_backend_id(&store, None);
    assert!(matches!(resolved, Err((ApiError::NotFound, _))));
    Ok(())
}

#[test]
fn resolve_404s_for_unknown_id() -> anyhow::Result<()> {
    let store = crate::store::Store::open_in_memory(Arc::new(NoopGeoIp))?;
    let resolved = resolve_backend_id(&store, Some(99));
    assert!(matches!(resolved, Err((ApiError::NotFound, _))));
    Ok(())
}
