// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Overlay math: additively merge pending cache rows onto store results.
//!
//! Each `merge_*` function consumes a DB-sorted list plus a cache
//! snapshot, folds in the pending rows keyed by the same dimension,
//! re-sorts, and truncates.  New dimensions implement the same shape.

use std::collections::HashMap;

use crate::cache::{PendingStat, StatKey};
use crate::model::{
    rfc3339, BucketStatRow, ChainStatRow, CountryStatRow, DeviceStatRow, DimensionKey,
    DomainStatRow, IpStatRow, RuleStatRow, Totals,
};

/// Half-open `[start, end)` window over RFC 3339 bucket strings. `None`
/// spans all time.
pub type BucketWindow<'a> = Option<(&'a str, &'a str)>;

fn in_window(bucket: &str, window: BucketWindow<'_>) -> bool {
    match window {
        Some((start, end)) => bucket >= start && bucket < end,
        None => true,
    }
}

/// Sum of one backend's pending hourly rows within the window.
///
/// Only the hourly dimension counts toward totals; every delta touches it
/// exactly once, so the sum is not inflated by the fan-out.
pub fn pending_totals(snapshot: &[(StatKey, PendingStat)], window: BucketWindow<'_>) -> Totals {
    let mut totals = Totals::default();
    for (stat_key, stat) in snapshot {
        if stat_key.key == DimensionKey::Hourly && in_window(&stat_key.bucket, window) {
            totals.total_upload += stat.upload;
            totals.total_download += stat.download;
            totals.total_connections += stat.connections;
        }
    }
    totals
}

/// Increment a DB summary's totals by the cached aggregates.
pub fn merge_totals(
    snapshot: &[(StatKey, PendingStat)],
    window: BucketWindow<'_>,
    base: &mut Totals,
) {
    let pending = pending_totals(snapshot, window);
    base.total_upload += pending.total_upload;
    base.total_download += pending.total_download;
    base.total_connections += pending.total_connections;
}

/// Pending sums grouped by a per-key name extractor.
fn pending_by_name<F>(
    snapshot: &[(StatKey, PendingStat)],
    window: BucketWindow<'_>,
    name_of: F,
) -> HashMap<String, PendingStat>
where
    F: Fn(&DimensionKey) -> Option<&str>,
{
    let mut grouped: HashMap<String, PendingStat> = HashMap::new();
    for (stat_key, stat) in snapshot {
        if !in_window(&stat_key.bucket, window) {
            continue;
        }
        let Some(name) = name_of(&stat_key.key) else { continue };
        let entry = grouped.entry(name.to_owned()).or_default();
        entry.upload += stat.upload;
        entry.download += stat.download;
        entry.connections += stat.connections;
        entry.last_seen = match (entry.last_seen, stat.last_seen) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if entry.geo.is_none() {
            entry.geo = stat.geo.clone();
        }
    }
    grouped
}

/// Merge cached domain rows onto a DB top list, re-sort, truncate.
pub fn merge_top_domains(
    snapshot: &[(StatKey, PendingStat)],
    window: BucketWindow<'_>,
    mut base: Vec<DomainStatRow>,
    top_n: usize,
) -> Vec<DomainStatRow> {
    let mut pending = pending_by_name(snapshot, window, |key| match key {
        DimensionKey::Domain { host } => Some(host.as_str()),
        _ => None,
    });

    for row in &mut base {
        if let Some(stat) = pending.remove(&row.host) {
            row.upload += stat.upload;
            row.download += stat.download;
            row.connections += stat.connections;
            if let Some(at) = stat.last_seen {
                row.last_seen = Some(rfc3339(at));
            }
        }
    }
    for (host, stat) in pending {
        base.push(DomainStatRow {
            host,
            upload: stat.upload,
            download: stat.download,
            connections: stat.connections,
            last_seen: stat.last_seen.map(rfc3339),
            ips_seen: 0,
            chains_seen: 0,
        });
    }
    base.sort_by(|a, b| b.download.cmp(&a.download));
    base.truncate(top_n);
    base
}

/// Merge cached IP rows onto a DB top list, re-sort, truncate.
pub fn merge_top_ips(
    snapshot: &[(StatKey, PendingStat)],
    window: BucketWindow<'_>,
    mut base: Vec<IpStatRow>,
    top_n: usize,
) -> Vec<IpStatRow> {
    let mut pending = pending_by_name(snapshot, window, |key| match key {
        DimensionKey::Ip { dest_ip } => Some(dest_ip.as_str()),
        _ => None,
    });

    for row in &mut base {
        if let Some(stat) = pending.remove(&row.ip) {
            row.upload += stat.upload;
            row.download += stat.download;
            row.connections += stat.connections;
            if let Some(at) = stat.last_seen {
                row.last_seen = Some(rfc3339(at));
            }
        }
    }
    for (ip, stat) in pending {
        let (country_code, location) = match stat.geo {
            Some(geo) => (Some(geo.country_code), Some(geo.location)),
            None => (None, None),
        };
        base.push(IpStatRow {
            ip,
            upload: stat.upload,
            download: stat.download,
            connections: stat.connections,
            last_seen: stat.last_seen.map(rfc3339),
            country_code,
            location,
            domains_seen: 0,
            chains_seen: 0,
        });
    }
    base.sort_by(|a, b| b.download.cmp(&a.download));
    base.truncate(top_n);
    base
}

/// Merge cached proxy-chain rows onto DB results.
pub fn merge_proxy_stats(
    snapshot: &[(StatKey, PendingStat)],
    window: BucketWindow<'_>,
    mut base: Vec<ChainStatRow>,
) -> Vec<ChainStatRow> {
    let mut pending = pending_by_name(snapshot, window, |key| match key {
        DimensionKey::Proxy { chain } => Some(chain.as_str()),
        _ => None,
    });

    for row in &mut base {
        if let Some(stat) = pending.remove(&row.chain) {
            row.upload += stat.upload;
            row.download += stat.download;
            row.connections += stat.connections;
        }
    }
    for (chain, stat) in pending {
        base.push(ChainStatRow {
            chain,
            upload: stat.upload,
            download: stat.download,
            connections: stat.connections,
        });
    }
    base.sort_by(|a, b| b.download.cmp(&a.download));
    base
}

/// Merge cached rule rows onto DB results.
pub fn merge_rule_stats(
    snapshot: &[(StatKey, PendingStat)],
    window: BucketWindow<'_>,
    mut base: Vec<RuleStatRow>,
) -> Vec<RuleStatRow> {
    let mut pending = pending_by_name(snapshot, window, |key| match key {
        DimensionKey::Rule { rule } => Some(rule.as_str()),
        _ => None,
    });

    for row in &mut base {
        if let Some(stat) = pending.remove(&row.rule) {
            row.upload += stat.upload;
            row.download += stat.download;
            row.connections += stat.connections;
        }
    }
    for (rule, stat) in pending {
        base.push(RuleStatRow {
            rule,
            upload: stat.upload,
            download: stat.download,
            connections: stat.connections,
        });
    }
    base.sort_by(|a, b| b.download.cmp(&a.download));
    base
}

/// Merge cached device rows onto DB results.
pub fn merge_device_stats(
    snapshot: &[(StatKey, PendingStat)],
    window: BucketWindow<'_>,
    mut base: Vec<DeviceStatRow>,
) -> Vec<DeviceStatRow> {
    let mut pending = pending_by_name(snapshot, window, |key| match key {
        DimensionKey::Device { source_ip } => Some(source_ip.as_str()),
        _ => None,
    });

    for row in &mut base {
        if let Some(stat) = pending.remove(&row.source_ip) {
            row.upload += stat.upload;
            row.download += stat.download;
            row.connections += stat.connections;
        }
    }
    for (source_ip, stat) in pending {
        base.push(DeviceStatRow {
            source_ip,
            upload: stat.upload,
            download: stat.download,
            connections: stat.connections,
        });
    }
    base.sort_by(|a, b| b.download.cmp(&a.download));
    base
}

/// Merge cached country rows onto DB results.
pub fn merge_country_stats(
    snapshot: &[(StatKey, PendingStat)],
    window: BucketWindow<'_>,
    mut base: Vec<CountryStatRow>,
) -> Vec<CountryStatRow> {
    let mut pending = pending_by_name(snapshot, window, |key| match key {
        DimensionKey::Country { code } => Some(code.as_str()),
        _ => None,
    });

    for row in &mut base {
        if let Some(stat) = pending.remove(&row.country_code) {
            row.upload += stat.upload;
            row.download += stat.download;
            row.connections += stat.connections;
        }
    }
    for (country_code, stat) in pending {
        base.push(CountryStatRow {
            country_code,
            upload: stat.upload,
            download: stat.download,
            connections: stat.connections,
        });
    }
    base.sort_by(|a, b| b.download.cmp(&a.download));
    base
}

/// Overlay the cached hourly series onto DB time buckets. Buckets sort
/// ascending; missing buckets are appended.
pub fn merge_trend(
    snapshot: &[(StatKey, PendingStat)],
    window: BucketWindow<'_>,
    mut base: Vec<BucketStatRow>,
) -> Vec<BucketStatRow> {
    let mut pending: HashMap<String, PendingStat> = HashMap::new();
    for (stat_key, stat) in snapshot {
        if stat_key.key != DimensionKey::Hourly || !in_window(&stat_key.bucket, window) {
            continue;
        }
        let entry = pending.entry(stat_key.bucket.clone()).or_default();
        entry.upload += stat.upload;
        entry.download += stat.download;
        entry.connections += stat.connections;
    }

    for row in &mut base {
        if let Some(stat) = pending.remove(&row.time_bucket) {
            row.upload += stat.upload;
            row.download += stat.download;
            row.connections += stat.connections;
        }
    }
    for (time_bucket, stat) in pending {
        base.push(BucketStatRow {
            time_bucket,
            upload: stat.upload,
            download: stat.download,
            connections: stat.connections,
        });
    }
    base.sort_by(|a, b| a.time_bucket.cmp(&b.time_bucket));
    base
}
