// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Delta computer: successive upstream snapshots → byte-accurate deltas.
//!
//! Owned exclusively by its collector session.  State is reset with the
//! session, so after a restart every open upstream connection becomes a
//! fresh baseline with zero emitted delta beyond its initial counters.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::collector::protocol::{identity_from, ConnectionSnapshot};
use crate::geoip::SharedGeoIp;
use crate::model::ConnIdentity;

/// Entries unseen for this long are dropped, whatever upstream claims.
const STALE_AFTER_MINUTES: i64 = 30;

struct ConnState {
    last_upload: u64,
    last_download: u64,
    last_seen_at: DateTime<Utc>,
    started_at: Option<String>,
    identity: Arc<ConnIdentity>,
}

/// One emitted traffic event.
#[derive(Debug, Clone)]
pub struct ConnDelta {
    pub id: String,
    pub identity: Arc<ConnIdentity>,
    /// Non-negative byte increments since the previous snapshot.
    pub upload: u64,
    pub download: u64,
    pub is_new: bool,
    pub is_closed: bool,
    /// Final counters, for the connection record on close.
    pub total_upload: u64,
    pub total_download: u64,
    pub started_at: Option<String>,
}

/// Per-backend snapshot differ.
pub struct DeltaComputer {
    geoip: SharedGeoIp,
    states: HashMap<String, ConnState>,
}

impl DeltaComputer {
    pub fn new(geoip: SharedGeoIp) -> Self {
        Self { geoip, states: HashMap::new() }
    }

    /// Number of currently tracked connections.
    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    /// Diff one snapshot of open connections against the tracked state.
    pub fn observe(
        &mut self,
        connections: &[ConnectionSnapshot],
        now: DateTime<Utc>,
    ) -> Vec<ConnDelta> {
        let mut out = Vec::with_capacity(connections.len());
        let mut present: HashSet<&str> = HashSet::with_capacity(connections.len());

        for conn in connections {
            present.insert(conn.id.as_str());
            match self.states.get_mut(&conn.id) {
                None => {
                    // New connection: its initial counters are the first
                    // delta (typically zero, but never assumed so).
                    let identity = Arc::new(identity_from(conn, &self.geoip));
                    let started_at =
                        if conn.start.is_empty() { None } else { Some(conn.start.clone()) };
                    self.states.insert(
                        conn.id.clone(),
                        ConnState {
                            last_upload: conn.upload,
                            last_download: conn.download,
                            last_seen_at: now,
                            started_at: started_at.clone(),
                            identity: Arc::clone(&identity),
                        },
                    );
                    out.push(ConnDelta {
                        id: conn.id.clone(),
                        identity,
                        upload: conn.upload,
                        download: conn.download,
                        is_new: true,
                        is_closed: false,
                        total_upload: conn.upload,
                        total_download: conn.download,
                        started_at,
                    });
                }
                Some(state) => {
                    state.last_seen_at = now;
                    let (upload, download) = if conn.upload < state.last_upload
                        || conn.download < state.last_download
                    {
                        // Upstream counter went backwards (restart or id
                        // reuse): new baseline, zero delta.
                        (0, 0)
                    } else {
                        (conn.upload - state.last_upload, conn.download - state.last_download)
                    };
                    state.last_upload = conn.upload;
                    state.last_download = conn.download;
                    out.push(ConnDelta {
                        id: conn.id.clone(),
                        identity: Arc::clone(&state.identity),
                        upload,
                        download,
                        is_new: false,
                        is_closed: false,
                        total_upload: conn.upload,
                        total_download: conn.download,
                        started_at: state.started_at.clone(),
                    });
                }
            }
        }

        // Connections absent from the snapshot closed upstream.
        let closed: Vec<String> = self
            .states
            .keys()
            .filter(|id| !present.contains(id.as_str()))
            .cloned()
            .collect();
        for id in closed {
            if let Some(state) = self.states.remove(&id) {
                out.push(ConnDelta {
                    id,
                    identity: state.identity,
                    upload: 0,
                    download: 0,
                    is_new: false,
                    is_closed: true,
                    total_upload: state.last_upload,
                    total_download: state.last_download,
                    started_at: state.started_at,
                });
            }
        }

        // Stale sweep: drop entries no snapshot has mentioned in 30 min.
        let cutoff = now - Duration::minutes(STALE_AFTER_MINUTES);
        self.states.retain(|_, state| state.last_seen_at >= cutoff);

        out
    }
}

#[cfg(test)]
#[path = "delta_tests.rs"]
mod tests;
