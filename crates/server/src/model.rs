// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared domain types: backends, connection identity, dimension tags.
//!
//! Every aggregate the system maintains is addressed by a typed
//! [`DimensionKey`] plus a UTC-hour time bucket.  The collector fans each
//! traffic delta out into one `(DimensionKey, StatPatch)` pair per
//! dimension; the realtime cache and the store consume the same pairs.

use chrono::{DateTime, SecondsFormat, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// One observed Clash (or compatible) router instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub token: Option<String>,
    pub enabled: bool,
    pub listening: bool,
    pub is_active: bool,
    pub created_at: String,
}

/// GeoIP lookup result for a destination address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country_code: String,
    pub location: String,
}

/// Immutable descriptors of a connection, frozen at first sight.
///
/// Upstream sometimes mutates `host`/`rule`/`chains` mid-connection (e.g.
/// when a proxy group switches); aggregates stay keyed by the identity the
/// connection first appeared with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnIdentity {
    pub host: String,
    pub dest_ip: String,
    /// Canonical proxy chain, `"<proxy> > … > <rule>"`.
    pub chain: String,
    pub rule: String,
    pub source_ip: String,
    pub network: String,
    pub geo: Option<GeoInfo>,
}

/// Aggregate dimension tag. Also fixes the flush order: partial flush
/// failures leave the most-used dimensions consistent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimension {
    Hourly,
    Domain,
    Ip,
    Proxy,
    Rule,
    Device,
    Country,
    DomainChain,
    DomainIp,
    IpChain,
    RuleDomain,
}

impl Dimension {
    /// All dimensions in flush order (hourly first, join tables last).
    pub const FLUSH_ORDER: [Dimension; 11] = [
        Dimension::Hourly,
        Dimension::Domain,
        Dimension::Ip,
        Dimension::Proxy,
        Dimension::Rule,
        Dimension::Device,
        Dimension::Country,
        Dimension::DomainChain,
        Dimension::DomainIp,
        Dimension::IpChain,
        Dimension::RuleDomain,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            Dimension::Hourly => "hourly_stats",
            Dimension::Domain => "domain_stats",
            Dimension::Ip => "ip_stats",
            Dimension::Proxy => "proxy_stats",
            Dimension::Rule => "rule_stats",
            Dimension::Device => "device_stats",
            Dimension::Country => "country_stats",
            Dimension::DomainChain => "domain_chain_stats",
            Dimension::DomainIp => "domain_ip_stats",
            Dimension::IpChain => "ip_chain_stats",
            Dimension::RuleDomain => "rule_domain_stats",
        }
    }
}

/// Typed aggregate key within one `(backend, time_bucket)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DimensionKey {
    Hourly,
    Domain { host: String },
    Ip { dest_ip: String },
    Proxy { chain: String },
    Rule { rule: String },
    Device { source_ip: String },
    Country { code: String },
    DomainChain { host: String, chain: String, source_ip: String },
    DomainIp { host: String, dest_ip: String },
    IpChain { dest_ip: String, chain: String, source_ip: String },
    RuleDomain { rule: String, host: String, chain: String },
}

impl DimensionKey {
    pub fn dimension(&self) -> Dimension {
        match self {
            Self::Hourly => Dimension::Hourly,
            Self::Domain { .. } => Dimension::Domain,
            Self::Ip { .. } => Dimension::Ip,
            Self::Proxy { .. } => Dimension::Proxy,
            Self::Rule { .. } => Dimension::Rule,
            Self::Device { .. } => Dimension::Device,
            Self::Country { .. } => Dimension::Country,
            Self::DomainChain { .. } => Dimension::DomainChain,
            Self::DomainIp { .. } => Dimension::DomainIp,
            Self::IpChain { .. } => Dimension::IpChain,
            Self::RuleDomain { .. } => Dimension::RuleDomain,
        }
    }
}

/// Additive update for one aggregate row.
#[derive(Debug, Clone)]
pub struct StatPatch {
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
    pub last_seen: DateTime<Utc>,
    /// Only populated for IP-keyed rows.
    pub geo: Option<GeoInfo>,
}

/// Fan a single connection delta out into every dimension it touches.
///
/// `connections` increments only when the delta introduces a new
/// connection; byte counters carry the clamped non-negative delta.
pub fn fan_out(
    identity: &ConnIdentity,
    upload: u64,
    download: u64,
    is_new: bool,
    at: DateTime<Utc>,
) -> Vec<(DimensionKey, StatPatch)> {
    let conns = u64::from(is_new);
    let patch = |geo: Option<GeoInfo>| StatPatch {
        upload,
        download,
        connections: conns,
        last_seen: at,
        geo,
    };

    let mut out = Vec::with_capacity(11);
    out.push((DimensionKey::Hourly, patch(None)));
    out.push((DimensionKey::Domain { host: identity.host.clone() }, patch(None)));
    out.push((
        DimensionKey::Ip { dest_ip: identity.dest_ip.clone() },
        patch(identity.geo.clone()),
    ));
    out.push((DimensionKey::Proxy { chain: identity.chain.clone() }, patch(None)));
    out.push((DimensionKey::Rule { rule: identity.rule.clone() }, patch(None)));
    out.push((DimensionKey::Device { source_ip: identity.source_ip.clone() }, patch(None)));
    if let Some(ref geo) = identity.geo {
        if !geo.country_code.is_empty() {
            out.push((DimensionKey::Country { code: geo.country_code.clone() }, patch(None)));
        }
    }
    out.push((
        DimensionKey::DomainChain {
            host: identity.host.clone(),
            chain: identity.chain.clone(),
            source_ip: identity.source_ip.clone(),
        },
        patch(None),
    ));
    out.push((
        DimensionKey::DomainIp { host: identity.host.clone(), dest_ip: identity.dest_ip.clone() },
        patch(None),
    ));
    out.push((
        DimensionKey::IpChain {
            dest_ip: identity.dest_ip.clone(),
            chain: identity.chain.clone(),
            source_ip: identity.source_ip.clone(),
        },
        patch(None),
    ));
    out.push((
        DimensionKey::RuleDomain {
            rule: identity.rule.clone(),
            host: identity.host.clone(),
            chain: identity.chain.clone(),
        },
        patch(None),
    ));
    out
}

// -- Query row shapes ---------------------------------------------------------
//
// Shared between store reads, realtime overlay, and the HTTP layer. The
// wire contract is camelCase (dashboard-facing).

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub total_upload: u64,
    pub total_download: u64,
    pub total_connections: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainStatRow {
    pub host: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    #[serde(default)]
    pub ips_seen: u64,
    #[serde(default)]
    pub chains_seen: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpStatRow {
    pub ip: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub domains_seen: u64,
    #[serde(default)]
    pub chains_seen: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStatRow {
    pub chain: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleStatRow {
    pub rule: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatRow {
    pub source_ip: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountryStatRow {
    pub country_code: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketStatRow {
    pub time_bucket: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
}

// -- Time helpers -------------------------------------------------------------

/// Floor a timestamp to its UTC hour, RFC 3339 (`2026-08-01T14:00:00Z`).
pub fn hour_bucket(at: DateTime<Utc>) -> String {
    let floored = at
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at);
    floored.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// UTC midnight of the given instant, RFC 3339.
pub fn day_floor(at: DateTime<Utc>) -> String {
    let date = at.date_naive();
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// RFC 3339 with seconds precision, UTC.
pub fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;
