// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Supervisor: reconciles running sessions with the backends table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::cache::RealtimeCache;
use crate::collector::session::{spawn_session, HealthView, SessionHandle};
use crate::geoip::SharedGeoIp;
use crate::store::Store;

/// How long a stopping session may drain in-flight work.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the set of collector sessions, one per enabled+listening backend.
pub struct Supervisor {
    store: Arc<Store>,
    cache: Arc<RealtimeCache>,
    geoip: SharedGeoIp,
    shutdown: CancellationToken,
    sessions: tokio::sync::Mutex<HashMap<i64, SessionHandle>>,
}

impl Supervisor {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<RealtimeCache>,
        geoip: SharedGeoIp,
        shutdown: CancellationToken,
    ) -> Self {
        Self { store, cache, geoip, shutdown, sessions: tokio::sync::Mutex::new(HashMap::new()) }
    }

    /// Reconcile running sessions with the desired set.
    ///
    /// Called at startup and after every mutating backends API call. All
    /// mutations serialize on the sessions mutex.
    pub async fn sync(&self) -> anyhow::Result<()> {
        let desired: HashMap<i64, _> = self
            .store
            .list_listening_backends()?
            .into_iter()
            .map(|b| (b.id, b))
            .collect();

        let mut sessions = self.sessions.lock().await;

        // Stop sessions that are no longer desired, or whose connection
        // parameters changed (they restart below with fresh baselines).
        let stale: Vec<i64> = sessions
            .iter()
            .filter(|(id, handle)| match desired.get(id) {
                None => true,
                Some(b) => b.url != handle.backend.url || b.token != handle.backend.token,
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(handle) = sessions.remove(&id) {
                tracing::info!(backend_id = id, "stopping collector session");
                stop_handle(handle).await;
            }
        }

        // Start what is missing.
        for (id, backend) in desired {
            if !sessions.contains_key(&id) {
                tracing::info!(backend_id = id, name = %backend.name, "starting collector session");
                let handle = spawn_session(
                    backend,
                    Arc::clone(&self.store),
                    Arc::clone(&self.cache),
                    Arc::clone(&self.geoip),
                    &self.shutdown,
                );
                sessions.insert(id, handle);
            }
        }
        Ok(())
    }

    /// Stop every session, draining in-flight frames.
    pub async fn stop_all(&self) {
        let mut sessions = self.sessions.lock().await;
        let handles: Vec<SessionHandle> = sessions.drain().map(|(_, h)| h).collect();
        drop(sessions);
        for handle in handles {
            stop_handle(handle).await;
        }
    }

    pub async fn running_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Health of one backend's session, if running.
    pub async fn health(&self, backend_id: i64) -> Option<HealthView> {
        let sessions = self.sessions.lock().await;
        sessions.get(&backend_id).map(|h| h.health.view(Utc::now()))
    }

    /// Health of every running session.
    pub async fn health_all(&self) -> HashMap<i64, HealthView> {
        let now = Utc::now();
        let sessions = self.sessions.lock().await;
        sessions.iter().map(|(id, h)| (*id, h.health.view(now))).collect()
    }
}

async fn stop_handle(handle: SessionHandle) {
    handle.cancel.cancel();
    if tokio::time::timeout(STOP_TIMEOUT, handle.join).await.is_err() {
        tracing::warn!(
            backend_id = handle.backend.id,
            "session did not stop within {STOP_TIMEOUT:?}; abandoning"
        );
    }
}
