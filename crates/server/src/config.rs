// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Floor for the realtime overlay tolerance; lower configured values clamp.
const MIN_TOLERANCE_MS: u64 = 10_000;

/// Configuration for the clashtrack collector server.
#[derive(Debug, Clone, clap::Parser)]
pub struct Config {
    /// Host to bind the query API on.
    #[arg(long, default_value = "127.0.0.1", env = "API_HOST")]
    pub host: String,

    /// Port for the query API.
    #[arg(long, default_value_t = 3001, env = "API_PORT")]
    pub api_port: u16,

    /// Reserved port for collector WebSocket exposure (not used by core logic).
    #[arg(long, default_value_t = 3002, env = "COLLECTOR_WS_PORT")]
    pub collector_ws_port: u16,

    /// Path to the SQLite database file.
    #[arg(long, default_value = "./stats.db", env = "DB_PATH")]
    pub db_path: std::path::PathBuf,

    /// How close to now (ms) a query window's end must be for the realtime
    /// overlay to apply.
    #[arg(long, default_value_t = 120_000, env = "REALTIME_RANGE_END_TOLERANCE_MS")]
    pub realtime_range_end_tolerance_ms: u64,

    /// Flush interval in milliseconds.
    #[arg(long, default_value_t = 5_000, env = "FLUSH_INTERVAL_MS")]
    pub flush_interval_ms: u64,
}

impl Config {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Overlay tolerance, clamped to the 10 s minimum.
    pub fn realtime_tolerance(&self) -> Duration {
        Duration::from_millis(self.realtime_range_end_tolerance_ms.max(MIN_TOLERANCE_MS))
    }
}
