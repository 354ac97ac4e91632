// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Flusher: periodically persists the realtime cache into the store.
//!
//! Dimensions flush in a fixed order so partial failures leave the
//! most-used tables consistent first.  Busy/locked writes retry with
//! exponential backoff; rows that still cannot be written go back into
//! the cache for the next pass.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cache::{FlushRow, RealtimeCache};
use crate::model::Dimension;
use crate::store::{Store, StoreWriteError};

const MAX_WRITE_ATTEMPTS: u32 = 5;
const RETRY_BASE: Duration = Duration::from_millis(50);
/// Cadence of the automatic retention pass, piggybacked on the flush loop.
const RETENTION_SWEEP_EVERY: Duration = Duration::from_secs(3600);

pub struct Flusher {
    store: Arc<Store>,
    cache: Arc<RealtimeCache>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl Flusher {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<RealtimeCache>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self { store, cache, interval, shutdown }
    }

    /// Run until shutdown, then flush one final time synchronously.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_retention = tokio::time::Instant::now();

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = timer.tick() => {}
                }

                flush_all(&self.store, &self.cache).await;

                if last_retention.elapsed() >= RETENTION_SWEEP_EVERY {
                    last_retention = tokio::time::Instant::now();
                    let store = Arc::clone(&self.store);
                    let swept = tokio::task::spawn_blocking(move || store.auto_cleanup_pass()).await;
                    match swept {
                        Ok(Ok(counts)) if !counts.is_empty() => {
                            tracing::info!(tables = counts.len(), "retention sweep removed old rows");
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::warn!(err = %format!("{e:#}"), "retention sweep failed"),
                        Err(e) => tracing::warn!(err = %e, "retention sweep task failed"),
                    }
                }
            }

            // Final drain so a graceful stop leaves the cache empty.
            flush_all(&self.store, &self.cache).await;
            tracing::debug!("flusher stopped");
        })
    }
}

/// Drain and persist every backend with pending rows.
pub async fn flush_all(store: &Arc<Store>, cache: &Arc<RealtimeCache>) {
    for backend_id in cache.backends_with_pending() {
        flush_backend(store, cache, backend_id).await;
    }
}

/// Drain one backend and write each dimension in its own transaction.
pub async fn flush_backend(store: &Arc<Store>, cache: &Arc<RealtimeCache>, backend_id: i64) {
    let Some(batch) = cache.drain(backend_id) else { return };

    for (dim, rows) in batch.dimensions {
        let store = Arc::clone(store);
        let outcome = tokio::task::spawn_blocking(move || {
            write_with_retry(&store, backend_id, dim, &rows).map_err(|e| (e, rows))
        })
        .await;

        match outcome {
            Ok(Ok(discarded)) => {
                if discarded > 0 {
                    tracing::warn!(
                        backend_id,
                        dimension = dim.table(),
                        discarded,
                        "aggregate rows discarded during flush"
                    );
                }
            }
            Ok(Err((err, rows))) => {
                tracing::warn!(
                    backend_id,
                    dimension = dim.table(),
                    err = %err,
                    "flush failed; returning rows to cache"
                );
                cache.restore(backend_id, rows);
            }
            Err(join_err) => {
                // Rows are lost only if the blocking task itself died;
                // surface loudly.
                tracing::error!(backend_id, err = %join_err, "flush task failed");
            }
        }
    }
}

/// Busy/locked retried with exponential backoff; other errors return
/// immediately.
fn write_with_retry(
    store: &Store,
    backend_id: i64,
    dim: Dimension,
    rows: &[FlushRow],
) -> Result<usize, StoreWriteError> {
    let mut delay = RETRY_BASE;
    let mut attempt = 1u32;
    loop {
        match store.flush_rows(backend_id, dim, rows) {
            Ok(discarded) => return Ok(discarded),
            Err(StoreWriteError::Busy) if attempt < MAX_WRITE_ATTEMPTS => {
                std::thread::sleep(delay);
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
