// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Upstream Clash wire format and URL/chain normalization.
//!
//! Each WebSocket text frame is one JSON snapshot of the currently open
//! connections.  The top-level totals are informational; the per-connection
//! array is authoritative.

use serde::Deserialize;

use crate::geoip::SharedGeoIp;
use crate::model::ConnIdentity;

/// One `/connections` frame.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionsFrame {
    #[serde(default)]
    pub upload_total: u64,
    #[serde(default)]
    pub download_total: u64,
    #[serde(default)]
    pub connections: Vec<ConnectionSnapshot>,
}

/// One currently-open connection as reported upstream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub id: String,
    #[serde(default)]
    pub upload: u64,
    #[serde(default)]
    pub download: u64,
    #[serde(default)]
    pub start: String,
    /// Proxy chain, proxy-first as reported upstream.
    #[serde(default)]
    pub chains: Vec<String>,
    #[serde(default)]
    pub rule: String,
    #[serde(default)]
    pub rule_payload: String,
    #[serde(default)]
    pub metadata: ConnectionMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionMetadata {
    #[serde(default)]
    pub host: String,
    #[serde(default, rename = "destinationIP")]
    pub destination_ip: String,
    #[serde(default, rename = "destinationPort")]
    pub destination_port: String,
    #[serde(default, rename = "sourceIP")]
    pub source_ip: String,
    #[serde(default, rename = "sourcePort")]
    pub source_port: String,
    #[serde(default)]
    pub network: String,
    #[serde(default, rename = "type")]
    pub conn_type: String,
    #[serde(default)]
    pub process: Option<String>,
}

/// Canonical chain string: upstream order joined with `" > "`.
/// An empty chain means direct routing.
pub fn canonical_chain(chains: &[String]) -> String {
    if chains.is_empty() {
        "DIRECT".to_owned()
    } else {
        chains.join(" > ")
    }
}

/// First chain segment, `"DIRECT"` when the chain is empty.
pub fn landing_proxy(chains: &[String]) -> &str {
    chains.first().map(String::as_str).unwrap_or("DIRECT")
}

/// Freeze a connection's identity from the snapshot that introduced it.
pub fn identity_from(snap: &ConnectionSnapshot, geoip: &SharedGeoIp) -> ConnIdentity {
    let host = if snap.metadata.host.is_empty() {
        snap.metadata.destination_ip.clone()
    } else {
        snap.metadata.host.clone()
    };
    let geo = if snap.metadata.destination_ip.is_empty() {
        None
    } else {
        geoip.lookup(&snap.metadata.destination_ip)
    };
    ConnIdentity {
        host,
        dest_ip: snap.metadata.destination_ip.clone(),
        chain: canonical_chain(&snap.chains),
        rule: snap.rule.clone(),
        source_ip: snap.metadata.source_ip.clone(),
        network: snap.metadata.network.clone(),
        geo,
    }
}

/// Build the upstream subscription URL from a configured base URL.
///
/// Converts `http(s)://` to `ws(s)://` and appends `/connections` when the
/// path does not already carry it.
pub fn ws_endpoint(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    let mut url = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_owned()
    } else {
        format!("ws://{trimmed}")
    };
    if !url.ends_with("/connections") {
        url.push_str("/connections");
    }
    url
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
