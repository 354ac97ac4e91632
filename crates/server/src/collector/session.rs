// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Collector session: one live `/connections` subscription per backend.
//!
//! State machine: Idle → Connecting → Open ⇄ Backoff, terminal Stopped.
//! Reconnects with exponential backoff (1 s base, 30 s cap, ±20 % jitter).
//! A panic while handling a frame is caught and treated as a transport
//! error; the process is never affected.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::{FutureExt, StreamExt};
use rand::Rng;
use serde::Serialize;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::cache::RealtimeCache;
use crate::collector::delta::DeltaComputer;
use crate::collector::protocol::{self, ConnectionsFrame};
use crate::geoip::SharedGeoIp;
use crate::model::{fan_out, hour_bucket, rfc3339, Backend};
use crate::store::Store;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const BASE_BACKOFF_MS: u64 = 1_000;
const MAX_BACKOFF_MS: u64 = 30_000;
/// A session is healthy only while a frame arrived this recently.
const HEALTHY_FRAME_WINDOW: Duration = Duration::from_secs(60);

/// Reported upstream connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

/// Shared health fields for one session.
#[derive(Default)]
pub struct SessionHealth {
    attempted: AtomicBool,
    connected: AtomicBool,
    /// Epoch millis of the last decoded frame; 0 = never.
    last_frame_ms: AtomicU64,
    decode_errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl SessionHealth {
    fn mark_connected(&self) {
        self.attempted.store(true, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    fn mark_frame(&self, at: DateTime<Utc>) {
        self.last_frame_ms.store(at.timestamp_millis().max(0) as u64, Ordering::Relaxed);
    }

    fn mark_error(&self, message: impl Into<String>) {
        self.attempted.store(true, Ordering::Relaxed);
        let mut guard = self.last_error.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(message.into());
    }

    fn mark_decode_error(&self, message: impl Into<String>) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        self.mark_error(message);
    }

    pub fn status(&self, now: DateTime<Utc>) -> SessionStatus {
        if !self.attempted.load(Ordering::Relaxed) {
            return SessionStatus::Unknown;
        }
        let last_frame = self.last_frame_ms.load(Ordering::Relaxed);
        let fresh = last_frame > 0
            && now.timestamp_millis().max(0) as u64
                <= last_frame + HEALTHY_FRAME_WINDOW.as_millis() as u64;
        if self.connected.load(Ordering::Relaxed) && fresh {
            SessionStatus::Healthy
        } else {
            SessionStatus::Unhealthy
        }
    }

    pub fn view(&self, now: DateTime<Utc>) -> HealthView {
        let last_frame = self.last_frame_ms.load(Ordering::Relaxed);
        let last_frame_at = (last_frame > 0)
            .then(|| Utc.timestamp_millis_opt(last_frame as i64).single().map(rfc3339))
            .flatten();
        let last_error =
            self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone();
        HealthView {
            status: self.status(now).as_str().to_owned(),
            last_frame_at,
            last_error,
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// Health fields surfaced on the backends API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthView {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_frame_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub decode_errors: u64,
}

/// Handle held by the supervisor for one running session.
pub struct SessionHandle {
    pub backend: Backend,
    pub cancel: CancellationToken,
    pub health: Arc<SessionHealth>,
    pub join: tokio::task::JoinHandle<()>,
}

/// Start a session task for the backend.
pub fn spawn_session(
    backend: Backend,
    store: Arc<Store>,
    cache: Arc<RealtimeCache>,
    geoip: SharedGeoIp,
    parent: &CancellationToken,
) -> SessionHandle {
    let cancel = parent.child_token();
    let health = Arc::new(SessionHealth::default());
    let join = tokio::spawn(run(
        backend.clone(),
        store,
        cache,
        geoip,
        cancel.clone(),
        Arc::clone(&health),
    ));
    SessionHandle { backend, cancel, health, join }
}

/// Backoff delay: `min(base × 2^(attempts-1), max)`, jittered ±20 %.
fn backoff_delay(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    let base = BASE_BACKOFF_MS.saturating_mul(1u64 << exp).min(MAX_BACKOFF_MS);
    let jitter = rand::rng().random_range(0.8..=1.2);
    Duration::from_millis((base as f64 * jitter) as u64)
}

enum FrameLoopEnd {
    Cancelled,
    Disconnected,
}

async fn run(
    backend: Backend,
    store: Arc<Store>,
    cache: Arc<RealtimeCache>,
    geoip: SharedGeoIp,
    cancel: CancellationToken,
    health: Arc<SessionHealth>,
) {
    let endpoint = protocol::ws_endpoint(&backend.url);
    let mut delta = DeltaComputer::new(Arc::clone(&geoip));
    // Open connections in the session's first frame become baselines with
    // zero contributed delta, so toggling listening never double-counts.
    let mut primed = false;
    let mut attempts: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match connect(&endpoint, backend.token.as_deref()).await {
            Ok(stream) => {
                attempts = 0;
                health.mark_connected();
                tracing::info!(backend_id = backend.id, url = %endpoint, "upstream connected");

                let frames = read_frames(
                    stream,
                    &backend,
                    &store,
                    &cache,
                    &mut delta,
                    &mut primed,
                    &health,
                    &cancel,
                );
                let outcome = std::panic::AssertUnwindSafe(frames).catch_unwind().await;
                health.mark_disconnected();

                match outcome {
                    Ok(FrameLoopEnd::Cancelled) => break,
                    Ok(FrameLoopEnd::Disconnected) => {}
                    Err(_) => {
                        health.mark_error("panic while handling upstream frame");
                        tracing::error!(
                            backend_id = backend.id,
                            "frame handler panicked; resubscribing"
                        );
                    }
                }
            }
            Err(e) => {
                health.mark_error(format!("{e:#}"));
                tracing::warn!(backend_id = backend.id, err = %format!("{e:#}"), "upstream connect failed");
            }
        }

        if cancel.is_cancelled() {
            break;
        }
        attempts = attempts.saturating_add(1);
        let delay = backoff_delay(attempts);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!(backend_id = backend.id, "session stopped");
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Open the upstream subscription with a bounded handshake.
pub async fn connect(endpoint: &str, token: Option<&str>) -> anyhow::Result<WsStream> {
    let mut request = endpoint.into_client_request()?;
    if let Some(token) = token {
        request
            .headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
    }
    let (stream, _) =
        tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| anyhow::anyhow!("handshake timed out after {HANDSHAKE_TIMEOUT:?}"))??;
    Ok(stream)
}

#[allow(clippy::too_many_arguments)]
async fn read_frames(
    stream: WsStream,
    backend: &Backend,
    store: &Arc<Store>,
    cache: &Arc<RealtimeCache>,
    delta: &mut DeltaComputer,
    primed: &mut bool,
    health: &SessionHealth,
    cancel: &CancellationToken,
) -> FrameLoopEnd {
    let (_, mut read) = stream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return FrameLoopEnd::Cancelled,

            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ConnectionsFrame>(text.as_str()) {
                        Ok(frame) => {
                            let now = Utc::now();
                            health.mark_frame(now);
                            process_frame(backend, store, cache, delta, primed, &frame, now);
                        }
                        Err(e) => {
                            // Counted and dropped; the subscription is
                            // re-established through backoff.
                            health.mark_decode_error(format!("frame decode: {e}"));
                            tracing::warn!(
                                backend_id = backend.id,
                                err = %e,
                                "undecodable upstream frame"
                            );
                            return FrameLoopEnd::Disconnected;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!(backend_id = backend.id, "upstream closed");
                    return FrameLoopEnd::Disconnected;
                }
                Some(Err(e)) => {
                    health.mark_error(e.to_string());
                    tracing::warn!(backend_id = backend.id, err = %e, "upstream read error");
                    return FrameLoopEnd::Disconnected;
                }
                _ => {} // ping/pong/binary ignored
            }
        }
    }
}

/// Diff the snapshot and fan the resulting deltas into the cache.
fn process_frame(
    backend: &Backend,
    store: &Arc<Store>,
    cache: &Arc<RealtimeCache>,
    delta: &mut DeltaComputer,
    primed: &mut bool,
    frame: &ConnectionsFrame,
    now: DateTime<Utc>,
) {
    let deltas = delta.observe(&frame.connections, now);
    if !*primed {
        // First frame of the session: baselines only.
        *primed = true;
        return;
    }

    let bucket = hour_bucket(now);
    for d in deltas {
        if d.upload == 0 && d.download == 0 && !d.is_new && !d.is_closed {
            continue;
        }

        for (key, patch) in fan_out(&d.identity, d.upload, d.download, d.is_new, now) {
            cache.apply(backend.id, &bucket, key, &patch);
        }

        if d.is_closed {
            // Best-effort, off the frame path.
            let store = Arc::clone(store);
            let backend_id = backend.id;
            let closed_at = rfc3339(now);
            tokio::task::spawn_blocking(move || {
                if let Err(e) = store.record_connection(
                    backend_id,
                    &d.id,
                    &d.identity,
                    d.total_upload,
                    d.total_download,
                    d.started_at.as_deref(),
                    &closed_at,
                ) {
                    tracing::warn!(backend_id, err = %format!("{e:#}"), "connection record write failed");
                }
            });
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
