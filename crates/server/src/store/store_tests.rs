// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use super::*;
use crate::cache::FlushRow;
use crate::geoip::{NoopGeoIp, StaticGeoIp};
use crate::model::{Dimension, DimensionKey, GeoInfo};
use crate::store::backends::BackendPatch;
use crate::store::queries::PageParams;
use crate::store::retention::RetentionConfig;

fn test_store() -> Store {
    Store::open_in_memory(Arc::new(NoopGeoIp)).expect("in-memory store")
}

fn at() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 1, 14, 0, 0).single().unwrap_or_default()
}

fn row(key: DimensionKey, upload: u64, download: u64, connections: u64) -> FlushRow {
    FlushRow {
        bucket: "2026-08-01T14:00:00Z".into(),
        key,
        upload,
        download,
        connections,
        last_seen: at(),
        geo: None,
    }
}

fn seed_backend(store: &Store, name: &str) -> i64 {
    store.create_backend(name, "http://router:9090", None).expect("create backend").id
}

// ── backends ──────────────────────────────────────────────────────────

#[test]
fn first_backend_becomes_active() -> anyhow::Result<()> {
    let store = test_store();
    let first = store.create_backend("one", "http://a:9090", None)?;
    let second = store.create_backend("two", "http://b:9090", Some("tok"))?;

    assert!(first.is_active);
    assert!(!second.is_active);
    Ok(())
}

#[test]
fn duplicate_name_is_constraint_error() {
    let store = test_store();
    seed_backend(&store, "dup");
    let err = match store.create_backend("dup", "http://b:9090", None) {
        Err(e) => e,
        Ok(_) => return assert!(false, "duplicate insert must fail"),
    };
    assert!(backends::is_duplicate_name(&err));
}

#[test]
fn activate_clears_previous_active() -> anyhow::Result<()> {
    let store = test_store();
    let a = seed_backend(&store, "a");
    let b = seed_backend(&store, "b");

    store.set_active_backend(b)?;
    let backends = store.list_backends()?;
    let active: Vec<i64> = backends.iter().filter(|x| x.is_active).map(|x| x.id).collect();
    assert_eq!(active, vec![b]);
    assert!(store.get_backend(a)?.map(|x| !x.is_active).unwrap_or(false));
    Ok(())
}

#[test]
fn update_backend_is_partial() -> anyhow::Result<()> {
    let store = test_store();
    let id = seed_backend(&store, "edit-me");

    let patch = BackendPatch { listening: Some(false), ..Default::default() };
    let updated = store.update_backend(id, &patch)?;
    let backend = updated.ok_or_else(|| anyhow::anyhow!("backend missing"))?;
    assert!(!backend.listening);
    assert_eq!(backend.name, "edit-me");
    assert_eq!(backend.url, "http://router:9090");
    Ok(())
}

#[test]
fn delete_backend_cascades_to_aggregates() -> anyhow::Result<()> {
    let store = test_store();
    let id = seed_backend(&store, "doomed");
    if let Err(e) = store.flush_rows(id, Dimension::Hourly, &[row(DimensionKey::Hourly, 1, 2, 1)]) {
        anyhow::bail!("flush failed: {e}");
    }

    assert!(store.delete_backend(id)?);
    let totals = store.totals(id, &None)?;
    assert_eq!(totals.total_download, 0);
    Ok(())
}

// ── aggregate upserts ─────────────────────────────────────────────────

#[test]
fn flush_rows_upsert_is_additive() -> anyhow::Result<()> {
    let store = test_store();
    let id = seed_backend(&store, "adds");
    let key = || DimensionKey::Domain { host: "a.example".into() };

    for _ in 0..2 {
        if let Err(e) = store.flush_rows(id, Dimension::Domain, &[row(key(), 100, 1000, 1)]) {
            anyhow::bail!("flush failed: {e}");
        }
    }

    let rows = store.top_domains(id, &None, 10)?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].upload, 200);
    assert_eq!(rows[0].download, 2000);
    assert_eq!(rows[0].connections, 2);
    Ok(())
}

#[test]
fn ip_upsert_consults_geoip_when_absent() -> anyhow::Result<()> {
    let geoip = StaticGeoIp::new([(
        "93.184.216.34".to_owned(),
        GeoInfo { country_code: "US".into(), location: "United States".into() },
    )]);
    let store = Store::open_in_memory(Arc::new(geoip))?;
    let id = seed_backend(&store, "geo");

    let flush = store.flush_rows(
        id,
        Dimension::Ip,
        &[row(DimensionKey::Ip { dest_ip: "93.184.216.34".into() }, 1, 1, 1)],
    );
    if let Err(e) = flush {
        anyhow::bail!("flush failed: {e}");
    }

    let rows = store.top_ips(id, &None, 10)?;
    assert_eq!(rows[0].country_code.as_deref(), Some("US"));
    Ok(())
}

#[test]
fn unresolved_geo_persists_as_empty() -> anyhow::Result<()> {
    let store = test_store();
    let id = seed_backend(&store, "no-geo");
    let flush = store.flush_rows(
        id,
        Dimension::Ip,
        &[row(DimensionKey::Ip { dest_ip: "10.0.0.1".into() }, 1, 1, 1)],
    );
    if let Err(e) = flush {
        anyhow::bail!("flush failed: {e}");
    }

    let rows = store.top_ips(id, &None, 10)?;
    assert!(rows[0].country_code.is_none());
    Ok(())
}

#[test]
fn windowed_totals_are_half_open() -> anyhow::Result<()> {
    let store = test_store();
    let id = seed_backend(&store, "windows");
    for (bucket, download) in
        [("2026-08-01T13:00:00Z", 10u64), ("2026-08-01T14:00:00Z", 20), ("2026-08-01T15:00:00Z", 40)]
    {
        let mut r = row(DimensionKey::Hourly, 0, download, 1);
        r.bucket = bucket.to_owned();
        if let Err(e) = store.flush_rows(id, Dimension::Hourly, &[r]) {
            anyhow::bail!("flush failed: {e}");
        }
    }

    let window =
        Some(("2026-08-01T13:00:00Z".to_owned(), "2026-08-01T15:00:00Z".to_owned()));
    let totals = store.totals(id, &window)?;
    // 15:00 bucket is excluded: [start, end).
    assert_eq!(totals.total_download, 30);
    Ok(())
}

// ── pagination ────────────────────────────────────────────────────────

#[test]
fn pagination_total_and_bounds() -> anyhow::Result<()> {
    let store = test_store();
    let id = seed_backend(&store, "paged");
    let rows: Vec<FlushRow> = (0..25)
        .map(|i| row(DimensionKey::Domain { host: format!("host{i:02}.example") }, 1, i, 1))
        .collect();
    if let Err(e) = store.flush_rows(id, Dimension::Domain, &rows) {
        anyhow::bail!("flush failed: {e}");
    }

    let page = store.list_domains(
        id,
        &None,
        &PageParams { offset: 20, limit: 10, ..Default::default() },
    )?;
    assert_eq!(page.total, 25);
    assert!(page.data.len() <= 10);
    assert!(20 + page.data.len() as u64 <= page.total);
    Ok(())
}

#[test]
fn pagination_unknown_sort_falls_back_to_download_desc() -> anyhow::Result<()> {
    let store = test_store();
    let id = seed_backend(&store, "sorted");
    for (host, download) in [("low.example", 10u64), ("high.example", 900), ("mid.example", 90)] {
        let r = row(DimensionKey::Domain { host: host.into() }, 0, download, 1);
        if let Err(e) = store.flush_rows(id, Dimension::Domain, &[r]) {
            anyhow::bail!("flush failed: {e}");
        }
    }

    let page = store.list_domains(
        id,
        &None,
        &PageParams { limit: 10, sort_by: Some("bogus".into()), ..Default::default() },
    )?;
    let hosts: Vec<&str> = page.data.iter().map(|d| d.host.as_str()).collect();
    assert_eq!(hosts, vec!["high.example", "mid.example", "low.example"]);
    Ok(())
}

#[test]
fn search_filters_domains() -> anyhow::Result<()> {
    let store = test_store();
    let id = seed_backend(&store, "searched");
    for host in ["cdn.example", "api.example", "cdn.other"] {
        let r = row(DimensionKey::Domain { host: host.into() }, 1, 1, 1);
        if let Err(e) = store.flush_rows(id, Dimension::Domain, &[r]) {
            anyhow::bail!("flush failed: {e}");
        }
    }

    let page = store.list_domains(
        id,
        &None,
        &PageParams { limit: 10, search: Some("cdn".into()), ..Default::default() },
    )?;
    assert_eq!(page.total, 2);
    Ok(())
}

#[test]
fn seen_counts_come_from_join_tables() -> anyhow::Result<()> {
    let store = test_store();
    let id = seed_backend(&store, "seen");

    // One host reached over two IPs and two chains.
    let domain_rows = vec![row(DimensionKey::Domain { host: "a.example".into() }, 1, 1, 2)];
    let domain_ip_rows = vec![
        row(DimensionKey::DomainIp { host: "a.example".into(), dest_ip: "1.1.1.1".into() }, 1, 1, 1),
        row(DimensionKey::DomainIp { host: "a.example".into(), dest_ip: "2.2.2.2".into() }, 1, 1, 1),
    ];
    let domain_chain_rows = vec![
        row(
            DimensionKey::DomainChain {
                host: "a.example".into(),
                chain: "P1 > R".into(),
                source_ip: "192.168.1.10".into(),
            },
            1,
            1,
            1,
        ),
        row(
            DimensionKey::DomainChain {
                host: "a.example".into(),
                chain: "P2 > R".into(),
                source_ip: "192.168.1.10".into(),
            },
            1,
            1,
            1,
        ),
    ];
    let ip_rows = vec![row(DimensionKey::Ip { dest_ip: "1.1.1.1".into() }, 1, 1, 1)];
    let ip_chain_rows = vec![row(
        DimensionKey::IpChain {
            dest_ip: "1.1.1.1".into(),
            chain: "P1 > R".into(),
            source_ip: "192.168.1.10".into(),
        },
        1,
        1,
        1,
    )];
    for (dim, rows) in [
        (Dimension::Domain, domain_rows),
        (Dimension::DomainIp, domain_ip_rows),
        (Dimension::DomainChain, domain_chain_rows),
        (Dimension::Ip, ip_rows),
        (Dimension::IpChain, ip_chain_rows),
    ] {
        if let Err(e) = store.flush_rows(id, dim, &rows) {
            anyhow::bail!("flush failed: {e}");
        }
    }

    let domains = store.top_domains(id, &None, 10)?;
    assert_eq!(domains[0].ips_seen, 2);
    assert_eq!(domains[0].chains_seen, 2);

    let ips = store.top_ips(id, &None, 10)?;
    assert_eq!(ips[0].domains_seen, 1);
    assert_eq!(ips[0].chains_seen, 1);

    let by_chain = store.chain_domains(id, "P1 > R", &None, 10)?;
    assert_eq!(by_chain[0].host, "a.example");
    assert_eq!(by_chain[0].ips_seen, 2);
    assert_eq!(by_chain[0].chains_seen, 2);
    Ok(())
}

// ── drill-down joins ──────────────────────────────────────────────────

#[test]
fn domain_chain_stats_filters_by_source_ip() -> anyhow::Result<()> {
    let store = test_store();
    let id = seed_backend(&store, "drill");
    let rows = vec![
        row(
            DimensionKey::DomainChain {
                host: "a.example".into(),
                chain: "P1 > RULE".into(),
                source_ip: "192.168.1.10".into(),
            },
            10,
            100,
            1,
        ),
        row(
            DimensionKey::DomainChain {
                host: "a.example".into(),
                chain: "P2 > RULE".into(),
                source_ip: "192.168.1.11".into(),
            },
            20,
            200,
            1,
        ),
    ];
    if let Err(e) = store.flush_rows(id, Dimension::DomainChain, &rows) {
        anyhow::bail!("flush failed: {e}");
    }

    let all = store.domain_chain_stats(id, "a.example", &None, None, None)?;
    assert_eq!(all.len(), 2);

    let filtered =
        store.domain_chain_stats(id, "a.example", &None, Some("192.168.1.10"), None)?;
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].chain, "P1 > RULE");
    Ok(())
}

// ── retention ─────────────────────────────────────────────────────────

#[test]
fn retention_bounds_validate() {
    let bad = RetentionConfig { connection_logs_days: 0, hourly_stats_days: 90, auto_cleanup: true };
    assert!(bad.validate().is_err());
    let bad = RetentionConfig {
        connection_logs_days: 7,
        hourly_stats_days: 366,
        auto_cleanup: true,
    };
    assert!(bad.validate().is_err());
    let ok = RetentionConfig { connection_logs_days: 7, hourly_stats_days: 90, auto_cleanup: true };
    assert!(ok.validate().is_ok());
}

#[test]
fn wipe_clears_one_backend_only() -> anyhow::Result<()> {
    let store = test_store();
    let a = seed_backend(&store, "wipe-a");
    let b = seed_backend(&store, "keep-b");
    for id in [a, b] {
        if let Err(e) = store.flush_rows(id, Dimension::Hourly, &[row(DimensionKey::Hourly, 5, 5, 1)])
        {
            anyhow::bail!("flush failed: {e}");
        }
    }

    let counts = store.cleanup_old_data(Some(a), 0)?;
    assert!(counts.iter().any(|c| c.table == "hourly_stats" && c.deleted == 1));

    assert_eq!(store.totals(a, &None)?.total_download, 0);
    assert_eq!(store.totals(b, &None)?.total_download, 5);
    Ok(())
}

#[test]
fn global_stats_sums_across_backends() -> anyhow::Result<()> {
    let store = test_store();
    let a = seed_backend(&store, "g-a");
    let b = seed_backend(&store, "g-b");
    for (id, download) in [(a, 100u64), (b, 50)] {
        if let Err(e) =
            store.flush_rows(id, Dimension::Hourly, &[row(DimensionKey::Hourly, 0, download, 1)])
        {
            anyhow::bail!("flush failed: {e}");
        }
    }

    let global = store.global_stats()?;
    assert_eq!(global.total.total_download, 150);
    assert_eq!(global.backends.len(), 2);
    Ok(())
}
