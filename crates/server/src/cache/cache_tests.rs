// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::cache::overlay;
use crate::model::{hour_bucket, DomainStatRow, StatPatch, Totals};
use chrono::TimeZone;

fn at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 1, 14, 30, 0).single().unwrap_or_default()
}

fn patch(upload: u64, download: u64, connections: u64) -> StatPatch {
    StatPatch { upload, download, connections, last_seen: at(), geo: None }
}

// ── apply / drain ─────────────────────────────────────────────────────

#[test]
fn apply_merges_additively() {
    let cache = RealtimeCache::new();
    let bucket = hour_bucket(at());
    cache.apply(1, &bucket, DimensionKey::Domain { host: "a.example".into() }, &patch(10, 20, 1));
    cache.apply(1, &bucket, DimensionKey::Domain { host: "a.example".into() }, &patch(5, 5, 0));

    let snapshot = cache.snapshot(1);
    assert_eq!(snapshot.len(), 1);
    let (_, stat) = &snapshot[0];
    assert_eq!(stat.upload, 15);
    assert_eq!(stat.download, 25);
    assert_eq!(stat.connections, 1);
}

#[test]
fn drain_clears_and_groups_by_flush_order() {
    let cache = RealtimeCache::new();
    let bucket = hour_bucket(at());
    cache.apply(1, &bucket, DimensionKey::Proxy { chain: "P > R".into() }, &patch(1, 1, 1));
    cache.apply(1, &bucket, DimensionKey::Hourly, &patch(1, 1, 1));
    cache.apply(1, &bucket, DimensionKey::Domain { host: "a".into() }, &patch(1, 1, 1));

    let batch = cache.drain(1).map(|b| b.dimensions).unwrap_or_default();
    let dims: Vec<Dimension> = batch.iter().map(|(d, _)| *d).collect();
    assert_eq!(dims, vec![Dimension::Hourly, Dimension::Domain, Dimension::Proxy]);

    assert!(cache.is_empty(1));
    assert!(cache.drain(1).is_none());
}

#[test]
fn drain_is_isolated_per_backend() {
    let cache = RealtimeCache::new();
    let bucket = hour_bucket(at());
    cache.apply(1, &bucket, DimensionKey::Hourly, &patch(1, 2, 1));
    cache.apply(2, &bucket, DimensionKey::Hourly, &patch(3, 4, 1));

    let _ = cache.drain(1);
    assert!(cache.is_empty(1));
    assert!(!cache.is_empty(2));
}

#[test]
fn restore_puts_failed_rows_back() {
    let cache = RealtimeCache::new();
    let bucket = hour_bucket(at());
    cache.apply(1, &bucket, DimensionKey::Rule { rule: "MATCH".into() }, &patch(7, 9, 1));

    let batch = cache.drain(1);
    assert!(cache.is_empty(1));
    if let Some(batch) = batch {
        for (_, rows) in batch.dimensions {
            cache.restore(1, rows);
        }
    }

    let snapshot = cache.snapshot(1);
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].1.upload, 7);
    assert_eq!(snapshot[0].1.download, 9);
}

#[test]
fn clear_backend_wipes_without_flush() {
    let cache = RealtimeCache::new();
    let bucket = hour_bucket(at());
    cache.apply(1, &bucket, DimensionKey::Hourly, &patch(1, 1, 1));
    cache.clear_backend(1);
    assert!(cache.is_empty(1));
    assert_eq!(cache.today_delta(1, at()), (0, 0));
}

// ── today counter ─────────────────────────────────────────────────────

#[test]
fn today_tracks_hourly_applies() {
    let cache = RealtimeCache::new();
    let bucket = hour_bucket(at());
    cache.apply(1, &bucket, DimensionKey::Hourly, &patch(100, 200, 1));
    // Non-hourly dimensions never feed the day counter.
    cache.apply(1, &bucket, DimensionKey::Domain { host: "a".into() }, &patch(100, 200, 1));

    assert_eq!(cache.today_delta(1, at()), (100, 200));
}

#[test]
fn today_resets_on_day_rollover() {
    let cache = RealtimeCache::new();
    let bucket = hour_bucket(at());
    cache.apply(1, &bucket, DimensionKey::Hourly, &patch(100, 200, 1));

    let tomorrow = at() + chrono::Duration::days(1);
    assert_eq!(cache.today_delta(1, tomorrow), (0, 0));
}

// ── overlay ───────────────────────────────────────────────────────────

#[test]
fn merge_totals_counts_only_hourly() {
    let cache = RealtimeCache::new();
    let bucket = hour_bucket(at());
    cache.apply(1, &bucket, DimensionKey::Hourly, &patch(10, 20, 2));
    cache.apply(1, &bucket, DimensionKey::Domain { host: "a".into() }, &patch(10, 20, 2));

    let snapshot = cache.snapshot(1);
    let mut totals = Totals { total_upload: 1, total_download: 1000, total_connections: 1 };
    overlay::merge_totals(&snapshot, None, &mut totals);
    assert_eq!(totals.total_upload, 11);
    assert_eq!(totals.total_download, 1020);
    assert_eq!(totals.total_connections, 3);
}

#[test]
fn merge_totals_respects_window() {
    let cache = RealtimeCache::new();
    cache.apply(1, "2026-08-01T14:00:00Z", DimensionKey::Hourly, &patch(10, 10, 1));

    let snapshot = cache.snapshot(1);
    let mut totals = Totals::default();
    overlay::merge_totals(
        &snapshot,
        Some(("2026-08-01T00:00:00Z", "2026-08-01T12:00:00Z")),
        &mut totals,
    );
    assert_eq!(totals.total_download, 0, "bucket outside the window must not leak in");
}

#[test]
fn merge_top_domains_appends_resorts_truncates() {
    let cache = RealtimeCache::new();
    let bucket = hour_bucket(at());
    cache.apply(1, &bucket, DimensionKey::Domain { host: "hot.example".into() }, &patch(0, 900, 1));
    cache.apply(1, &bucket, DimensionKey::Domain { host: "db.example".into() }, &patch(0, 50, 0));

    let base = vec![
        DomainStatRow {
            host: "db.example".into(),
            upload: 0,
            download: 500,
            connections: 3,
            last_seen: None,
            ips_seen: 2,
            chains_seen: 1,
        },
        DomainStatRow {
            host: "cold.example".into(),
            upload: 0,
            download: 100,
            connections: 1,
            last_seen: None,
            ips_seen: 1,
            chains_seen: 1,
        },
    ];

    let snapshot = cache.snapshot(1);
    let merged = overlay::merge_top_domains(&snapshot, None, base, 2);
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].host, "hot.example");
    assert_eq!(merged[0].download, 900);
    assert_eq!(merged[1].host, "db.example");
    assert_eq!(merged[1].download, 550);
}

#[test]
fn merge_trend_overlays_matching_bucket() {
    let cache = RealtimeCache::new();
    cache.apply(1, "2026-08-01T14:00:00Z", DimensionKey::Hourly, &patch(5, 10, 1));

    let base = vec![crate::model::BucketStatRow {
        time_bucket: "2026-08-01T14:00:00Z".into(),
        upload: 100,
        download: 1000,
        connections: 4,
    }];
    let snapshot = cache.snapshot(1);
    let merged = overlay::merge_trend(&snapshot, None, base);
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].upload, 105);
    assert_eq!(merged[0].download, 1010);
}
