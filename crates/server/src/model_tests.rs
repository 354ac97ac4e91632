// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use chrono::TimeZone;

fn identity() -> ConnIdentity {
    ConnIdentity {
        host: "a.example".into(),
        dest_ip: "93.184.216.34".into(),
        chain: "Proxy > RULE".into(),
        rule: "RULE".into(),
        source_ip: "192.168.1.10".into(),
        network: "tcp".into(),
        geo: Some(GeoInfo { country_code: "US".into(), location: "United States".into() }),
    }
}

// ── fan_out ───────────────────────────────────────────────────────────

#[test]
fn fan_out_covers_every_dimension_with_geo() {
    let at = Utc.with_ymd_and_hms(2026, 8, 1, 14, 30, 0).single().unwrap_or_default();
    let patches = fan_out(&identity(), 100, 1000, true, at);

    let dims: Vec<Dimension> = patches.iter().map(|(k, _)| k.dimension()).collect();
    assert_eq!(dims.len(), 11);
    for dim in Dimension::FLUSH_ORDER {
        assert!(dims.contains(&dim), "missing {dim:?}");
    }
}

#[test]
fn fan_out_skips_country_without_geo() {
    let mut id = identity();
    id.geo = None;
    let patches = fan_out(&id, 1, 2, false, Utc::now());
    assert!(patches.iter().all(|(k, _)| k.dimension() != Dimension::Country));
    assert_eq!(patches.len(), 10);
}

#[test]
fn fan_out_counts_connection_only_when_new() {
    let at = Utc::now();
    let fresh = fan_out(&identity(), 0, 0, true, at);
    assert!(fresh.iter().all(|(_, p)| p.connections == 1));

    let update = fan_out(&identity(), 10, 20, false, at);
    assert!(update.iter().all(|(_, p)| p.connections == 0));
}

#[test]
fn fan_out_carries_geo_only_on_ip_key() {
    let patches = fan_out(&identity(), 1, 1, true, Utc::now());
    for (key, patch) in &patches {
        match key {
            DimensionKey::Ip { .. } => assert!(patch.geo.is_some()),
            _ => assert!(patch.geo.is_none()),
        }
    }
}

// ── time helpers ──────────────────────────────────────────────────────

#[test]
fn hour_bucket_floors_to_utc_hour() {
    let at = Utc.with_ymd_and_hms(2026, 8, 1, 14, 59, 59).single().unwrap_or_default();
    assert_eq!(hour_bucket(at), "2026-08-01T14:00:00Z");
}

#[test]
fn day_floor_is_utc_midnight() {
    let at = Utc.with_ymd_and_hms(2026, 8, 1, 23, 59, 59).single().unwrap_or_default();
    assert_eq!(day_floor(at), "2026-08-01T00:00:00Z");
}

#[test]
fn dimension_flush_order_starts_hourly_ends_joins() {
    assert_eq!(Dimension::FLUSH_ORDER[0], Dimension::Hourly);
    assert_eq!(Dimension::FLUSH_ORDER[10], Dimension::RuleDomain);
}
