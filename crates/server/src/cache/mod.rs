// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Realtime cache: per-backend aggregates the store has not seen yet.
//!
//! Two jobs: provide the "live" increment overlaid onto store reads, and
//! buffer writes for the flusher.  One mutex per backend guards both the
//! additive merges and the drain; overlay math runs on snapshot copies
//! outside the lock.

pub mod overlay;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::model::{day_floor, Dimension, DimensionKey, GeoInfo, StatPatch};

/// Pending (un-flushed) totals for one aggregate row.
#[derive(Debug, Clone, Default)]
pub struct PendingStat {
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
    pub last_seen: Option<DateTime<Utc>>,
    pub geo: Option<GeoInfo>,
}

/// Cache key: UTC-hour bucket plus the typed dimension key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatKey {
    pub bucket: String,
    pub key: DimensionKey,
}

/// Day-scoped byte counter for the fast summary path.
#[derive(Debug, Clone, Default)]
struct TodayCounter {
    day: String,
    upload: u64,
    download: u64,
}

#[derive(Default)]
struct BackendBucket {
    pending: HashMap<StatKey, PendingStat>,
    today: TodayCounter,
}

/// One drained row, ready for the store's UPSERT.
#[derive(Debug, Clone)]
pub struct FlushRow {
    pub bucket: String,
    pub key: DimensionKey,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
    pub last_seen: DateTime<Utc>,
    pub geo: Option<GeoInfo>,
}

/// Everything pending for one backend, grouped in flush order.
#[derive(Debug)]
pub struct FlushBatch {
    pub backend_id: i64,
    pub dimensions: Vec<(Dimension, Vec<FlushRow>)>,
}

/// Shared realtime cache across all backends.
#[derive(Default)]
pub struct RealtimeCache {
    buckets: Mutex<HashMap<i64, Arc<Mutex<BackendBucket>>>>,
}

impl RealtimeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn backend(&self, backend_id: i64) -> Arc<Mutex<BackendBucket>> {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(buckets.entry(backend_id).or_default())
    }

    /// Additive merge of one dimension patch into the backend's bucket.
    pub fn apply(&self, backend_id: i64, bucket: &str, key: DimensionKey, patch: &StatPatch) {
        let slot = self.backend(backend_id);
        let mut inner = slot.lock().unwrap_or_else(PoisonError::into_inner);

        // The hourly patch arrives exactly once per delta; it also feeds
        // the day counter.
        if key == DimensionKey::Hourly {
            let day = day_floor(patch.last_seen);
            if inner.today.day != day {
                inner.today = TodayCounter { day, upload: 0, download: 0 };
            }
            inner.today.upload += patch.upload;
            inner.today.download += patch.download;
        }

        let entry = inner
            .pending
            .entry(StatKey { bucket: bucket.to_owned(), key })
            .or_default();
        entry.upload += patch.upload;
        entry.download += patch.download;
        entry.connections += patch.connections;
        entry.last_seen = match entry.last_seen {
            Some(prev) if prev >= patch.last_seen => Some(prev),
            _ => Some(patch.last_seen),
        };
        if entry.geo.is_none() {
            entry.geo = patch.geo.clone();
        }
    }

    /// Bytes observed since the last UTC midnight (and not yet rolled over).
    pub fn today_delta(&self, backend_id: i64, now: DateTime<Utc>) -> (u64, u64) {
        let slot = self.backend(backend_id);
        let inner = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.today.day == day_floor(now) {
            (inner.today.upload, inner.today.download)
        } else {
            (0, 0)
        }
    }

    /// Copy of all pending rows for overlay computation.
    pub fn snapshot(&self, backend_id: i64) -> Vec<(StatKey, PendingStat)> {
        let slot = self.backend(backend_id);
        let inner = slot.lock().unwrap_or_else(PoisonError::into_inner);
        inner.pending.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Atomically snapshot and clear the backend's pending rows.
    ///
    /// Returns `None` when nothing is pending. Only the flusher calls this.
    pub fn drain(&self, backend_id: i64) -> Option<FlushBatch> {
        let slot = self.backend(backend_id);
        let mut inner = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.pending.is_empty() {
            return None;
        }
        let pending = std::mem::take(&mut inner.pending);
        drop(inner);

        let mut by_dim: HashMap<Dimension, Vec<FlushRow>> = HashMap::new();
        for (stat_key, stat) in pending {
            let dim = stat_key.key.dimension();
            by_dim.entry(dim).or_default().push(FlushRow {
                bucket: stat_key.bucket,
                key: stat_key.key,
                upload: stat.upload,
                download: stat.download,
                connections: stat.connections,
                last_seen: stat.last_seen.unwrap_or_else(Utc::now),
                geo: stat.geo,
            });
        }

        let dimensions = Dimension::FLUSH_ORDER
            .into_iter()
            .filter_map(|dim| by_dim.remove(&dim).map(|rows| (dim, rows)))
            .collect();
        Some(FlushBatch { backend_id, dimensions })
    }

    /// Put drained rows back after a failed flush so the next pass retries.
    pub fn restore(&self, backend_id: i64, rows: Vec<FlushRow>) {
        for row in rows {
            let patch = StatPatch {
                upload: row.upload,
                download: row.download,
                connections: row.connections,
                last_seen: row.last_seen,
                geo: row.geo,
            };
            // Bypass the day counter: these bytes were already counted
            // when first applied.
            let slot = self.backend(backend_id);
            let mut inner = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = inner
                .pending
                .entry(StatKey { bucket: row.bucket, key: row.key })
                .or_default();
            entry.upload += patch.upload;
            entry.download += patch.download;
            entry.connections += patch.connections;
            entry.last_seen = match entry.last_seen {
                Some(prev) if prev >= patch.last_seen => Some(prev),
                _ => Some(patch.last_seen),
            };
            if entry.geo.is_none() {
                entry.geo = patch.geo;
            }
        }
    }

    /// Wipe a backend's pending rows and day counter without flushing.
    pub fn clear_backend(&self, backend_id: i64) {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets.remove(&backend_id);
    }

    /// Backends that currently hold pending rows.
    pub fn backends_with_pending(&self) -> Vec<i64> {
        let buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets
            .iter()
            .filter(|(_, slot)| {
                !slot.lock().unwrap_or_else(PoisonError::into_inner).pending.is_empty()
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// True when the backend has no pending rows.
    pub fn is_empty(&self, backend_id: i64) -> bool {
        let slot = self.backend(backend_id);
        let inner = slot.lock().unwrap_or_else(PoisonError::into_inner);
        inner.pending.is_empty()
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
