// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

// ── backoff ───────────────────────────────────────────────────────────

#[test]
fn backoff_grows_exponentially_within_jitter() {
    for _ in 0..50 {
        let first = backoff_delay(1).as_millis() as u64;
        assert!((800..=1200).contains(&first), "1st attempt out of range: {first}");

        let third = backoff_delay(3).as_millis() as u64;
        assert!((3200..=4800).contains(&third), "3rd attempt out of range: {third}");
    }
}

#[test]
fn backoff_caps_at_thirty_seconds() {
    for attempts in [6, 10, 32, u32::MAX] {
        let delay = backoff_delay(attempts).as_millis() as u64;
        assert!(delay <= 36_000, "cap plus jitter exceeded: {delay}");
        assert!(delay >= 24_000, "cap minus jitter undershot: {delay}");
    }
}

// ── health ────────────────────────────────────────────────────────────

#[test]
fn health_starts_unknown() {
    let health = SessionHealth::default();
    assert_eq!(health.status(Utc::now()), SessionStatus::Unknown);
}

#[test]
fn health_is_healthy_with_recent_frame() {
    let health = SessionHealth::default();
    health.mark_connected();
    let now = Utc::now();
    health.mark_frame(now);
    assert_eq!(health.status(now), SessionStatus::Healthy);
}

#[test]
fn health_degrades_without_frames() {
    let health = SessionHealth::default();
    health.mark_connected();
    let now = Utc::now();
    health.mark_frame(now);

    let later = now + chrono::Duration::seconds(61);
    assert_eq!(health.status(later), SessionStatus::Unhealthy);
}

#[test]
fn health_unhealthy_after_disconnect() {
    let health = SessionHealth::default();
    health.mark_connected();
    let now = Utc::now();
    health.mark_frame(now);
    health.mark_disconnected();
    assert_eq!(health.status(now), SessionStatus::Unhealthy);
}

// ── first-frame priming ───────────────────────────────────────────────

fn test_backend() -> Backend {
    Backend {
        id: 1,
        name: "t".to_owned(),
        url: "http://127.0.0.1:1".to_owned(),
        token: None,
        enabled: true,
        listening: true,
        is_active: true,
        created_at: "2026-08-01T00:00:00Z".to_owned(),
    }
}

fn frame_with(id: &str, upload: u64, download: u64) -> ConnectionsFrame {
    serde_json::from_value(serde_json::json!({
        "connections": [{
            "id": id,
            "upload": upload,
            "download": download,
            "chains": ["P", "R"],
            "rule": "R",
            "metadata": {
                "host": "a.example",
                "destinationIP": "1.2.3.4",
                "sourceIP": "192.168.1.10",
                "network": "tcp"
            }
        }]
    }))
    .unwrap_or_default()
}

/// Connections already open when a session starts are baselines only;
/// resuming listening must not re-count bytes a previous session counted.
#[tokio::test]
async fn first_frame_primes_baselines_without_counting() {
    let geoip: crate::geoip::SharedGeoIp = Arc::new(crate::geoip::NoopGeoIp);
    let store =
        Arc::new(crate::store::Store::open_in_memory(Arc::clone(&geoip)).expect("in-memory store"));
    let cache = Arc::new(crate::cache::RealtimeCache::new());
    let backend = test_backend();
    let mut delta = DeltaComputer::new(geoip);
    let mut primed = false;

    // First frame: 150 bytes already on the wire from a prior session.
    process_frame(&backend, &store, &cache, &mut delta, &mut primed, &frame_with("c1", 150, 1500), Utc::now());
    assert!(cache.is_empty(backend.id), "priming frame must not contribute deltas");
    assert!(primed);

    // Movement after priming counts normally.
    process_frame(&backend, &store, &cache, &mut delta, &mut primed, &frame_with("c1", 170, 1600), Utc::now());
    let snapshot = cache.snapshot(backend.id);
    let hourly = snapshot
        .iter()
        .find(|(k, _)| k.key == crate::model::DimensionKey::Hourly)
        .map(|(_, stat)| (stat.upload, stat.download));
    assert_eq!(hourly, Some((20, 100)));
}

#[test]
fn health_view_carries_error_and_counts() {
    let health = SessionHealth::default();
    health.mark_decode_error("frame decode: oops");
    health.mark_decode_error("frame decode: again");

    let view = health.view(Utc::now());
    assert_eq!(view.status, "unhealthy");
    assert_eq!(view.decode_errors, 2);
    assert_eq!(view.last_error.as_deref(), Some("frame decode: again"));
    assert!(view.last_frame_at.is_none());
}
