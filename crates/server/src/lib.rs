// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Clashtrack: traffic statistics collector for Clash-compatible routers.
//!
//! Subscribes to each configured backend's `/connections` WebSocket
//! stream, turns successive snapshots into byte-accurate deltas,
//! aggregates them per dimension in a realtime cache, periodically
//! flushes the cache into SQLite, and serves a query API that overlays
//! pending deltas onto store reads for near-real-time dashboards.

pub mod cache;
pub mod collector;
pub mod config;
pub mod error;
pub mod flush;
pub mod geoip;
pub mod model;
pub mod state;
pub mod store;
pub mod transport;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::cache::RealtimeCache;
use crate::collector::supervisor::Supervisor;
use crate::config::Config;
use crate::flush::Flusher;
use crate::geoip::{NoopGeoIp, SharedGeoIp};
use crate::state::AppState;
use crate::store::Store;
use crate::transport::build_router;

/// Run the collector server until shutdown.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let geoip: SharedGeoIp = Arc::new(NoopGeoIp);
    run_with_geoip(config, geoip).await
}

/// Run with an injected GeoIP resolver.
pub async fn run_with_geoip(config: Config, geoip: SharedGeoIp) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.api_port);
    let shutdown = CancellationToken::new();

    let store = Arc::new(Store::open(&config.db_path, Arc::clone(&geoip))?);
    let cache = Arc::new(RealtimeCache::new());
    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&geoip),
        shutdown.clone(),
    ));

    // Start sessions for every enabled+listening backend.
    supervisor.sync().await?;

    let flusher = Flusher::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        config.flush_interval(),
        shutdown.clone(),
    );
    let flusher_handle = flusher.spawn();

    // Ctrl-C triggers the shared shutdown token.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        store: Arc::clone(&store),
        cache: Arc::clone(&cache),
        supervisor: Arc::clone(&supervisor),
        shutdown: shutdown.clone(),
    });

    tracing::info!("clashtrack listening on {addr} (db: {})", config.db_path.display());
    let router = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown.clone().cancelled_owned()).await?;

    // Drain: stop sessions first so their last frames land in the cache,
    // then flush whatever remains.
    shutdown.cancel();
    supervisor.stop_all().await;
    if tokio::time::timeout(std::time::Duration::from_secs(10), flusher_handle).await.is_err() {
        tracing::warn!("flusher did not finish its final pass in time");
    }
    flush::flush_all(&store, &cache).await;
    tracing::info!("clashtrack stopped");
    Ok(())
}
