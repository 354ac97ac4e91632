// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::RealtimeCache;
use crate::collector::supervisor::Supervisor;
use crate::config::Config;
use crate::store::Store;

/// Shared application state behind every handler.
pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub cache: Arc<RealtimeCache>,
    pub supervisor: Arc<Supervisor>,
    pub shutdown: CancellationToken,
}
