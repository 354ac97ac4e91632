// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Idempotent schema. Applied on every startup; `IF NOT EXISTS` throughout.

use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backends (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    url         TEXT NOT NULL,
    token       TEXT,
    enabled     INTEGER NOT NULL DEFAULT 1,
    listening   INTEGER NOT NULL DEFAULT 1,
    is_active   INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL
);

-- Short-lived per-connection log, pruned by retention.
CREATE TABLE IF NOT EXISTS connections (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    backend_id  INTEGER NOT NULL REFERENCES backends(id) ON DELETE CASCADE,
    conn_id     TEXT NOT NULL,
    host        TEXT NOT NULL,
    dest_ip     TEXT NOT NULL,
    chain       TEXT NOT NULL,
    rule        TEXT NOT NULL,
    source_ip   TEXT NOT NULL,
    network     TEXT NOT NULL,
    upload      INTEGER NOT NULL DEFAULT 0,
    download    INTEGER NOT NULL DEFAULT 0,
    started_at  TEXT,
    closed_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_connections_backend_closed
    ON connections(backend_id, closed_at);

CREATE TABLE IF NOT EXISTS hourly_stats (
    backend_id  INTEGER NOT NULL REFERENCES backends(id) ON DELETE CASCADE,
    time_bucket TEXT NOT NULL,
    upload      INTEGER NOT NULL DEFAULT 0,
    download    INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    last_seen   TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (backend_id, time_bucket)
);

CREATE TABLE IF NOT EXISTS domain_stats (
    backend_id  INTEGER NOT NULL REFERENCES backends(id) ON DELETE CASCADE,
    host        TEXT NOT NULL,
    time_bucket TEXT NOT NULL,
    upload      INTEGER NOT NULL DEFAULT 0,
    download    INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    last_seen   TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (backend_id, host, time_bucket)
);
CREATE INDEX IF NOT EXISTS idx_domain_stats_bucket
    ON domain_stats(backend_id, time_bucket);

CREATE TABLE IF NOT EXISTS ip_stats (
    backend_id   INTEGER NOT NULL REFERENCES backends(id) ON DELETE CASCADE,
    dest_ip      TEXT NOT NULL,
    time_bucket  TEXT NOT NULL,
    upload       INTEGER NOT NULL DEFAULT 0,
    download     INTEGER NOT NULL DEFAULT 0,
    connections  INTEGER NOT NULL DEFAULT 0,
    last_seen    TEXT NOT NULL DEFAULT '',
    country_code TEXT NOT NULL DEFAULT '',
    location     TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (backend_id, dest_ip, time_bucket)
);
CREATE INDEX IF NOT EXISTS idx_ip_stats_bucket
    ON ip_stats(backend_id, time_bucket);

CREATE TABLE IF NOT EXISTS proxy_stats (
    backend_id  INTEGER NOT NULL REFERENCES backends(id) ON DELETE CASCADE,
    chain       TEXT NOT NULL,
    time_bucket TEXT NOT NULL,
    upload      INTEGER NOT NULL DEFAULT 0,
    download    INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    last_seen   TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (backend_id, chain, time_bucket)
);

CREATE TABLE IF NOT EXISTS rule_stats (
    backend_id  INTEGER NOT NULL REFERENCES backends(id) ON DELETE CASCADE,
    rule        TEXT NOT NULL,
    time_bucket TEXT NOT NULL,
    upload      INTEGER NOT NULL DEFAULT 0,
    download    INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    last_seen   TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (backend_id, rule, time_bucket)
);

CREATE TABLE IF NOT EXISTS device_stats (
    backend_id  INTEGER NOT NULL REFERENCES backends(id) ON DELETE CASCADE,
    source_ip   TEXT NOT NULL,
    time_bucket TEXT NOT NULL,
    upload      INTEGER NOT NULL DEFAULT 0,
    download    INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    last_seen   TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (backend_id, source_ip, time_bucket)
);

CREATE TABLE IF NOT EXISTS country_stats (
    backend_id   INTEGER NOT NULL REFERENCES backends(id) ON DELETE CASCADE,
    country_code TEXT NOT NULL,
    time_bucket  TEXT NOT NULL,
    upload       INTEGER NOT NULL DEFAULT 0,
    download     INTEGER NOT NULL DEFAULT 0,
    connections  INTEGER NOT NULL DEFAULT 0,
    last_seen    TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (backend_id, country_code, time_bucket)
);

-- Cross-dimension join tables: drill-down queries answer in one scan
-- instead of read-modify-write of serialized sets.
CREATE TABLE IF NOT EXISTS domain_chain_stats (
    backend_id  INTEGER NOT NULL REFERENCES backends(id) ON DELETE CASCADE,
    host        TEXT NOT NULL,
    chain       TEXT NOT NULL,
    source_ip   TEXT NOT NULL,
    time_bucket TEXT NOT NULL,
    upload      INTEGER NOT NULL DEFAULT 0,
    download    INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    last_seen   TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (backend_id, host, chain, source_ip, time_bucket)
);

CREATE TABLE IF NOT EXISTS domain_ip_stats (
    backend_id  INTEGER NOT NULL REFERENCES backends(id) ON DELETE CASCADE,
    host        TEXT NOT NULL,
    dest_ip     TEXT NOT NULL,
    time_bucket TEXT NOT NULL,
    upload      INTEGER NOT NULL DEFAULT 0,
    download    INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    last_seen   TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (backend_id, host, dest_ip, time_bucket)
);

CREATE TABLE IF NOT EXISTS ip_chain_stats (
    backend_id  INTEGER NOT NULL REFERENCES backends(id) ON DELETE CASCADE,
    dest_ip     TEXT NOT NULL,
    chain       TEXT NOT NULL,
    source_ip   TEXT NOT NULL,
    time_bucket TEXT NOT NULL,
    upload      INTEGER NOT NULL DEFAULT 0,
    download    INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    last_seen   TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (backend_id, dest_ip, chain, source_ip, time_bucket)
);

CREATE TABLE IF NOT EXISTS rule_domain_stats (
    backend_id  INTEGER NOT NULL REFERENCES backends(id) ON DELETE CASCADE,
    rule        TEXT NOT NULL,
    host        TEXT NOT NULL,
    chain       TEXT NOT NULL,
    time_bucket TEXT NOT NULL,
    upload      INTEGER NOT NULL DEFAULT 0,
    download    INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    last_seen   TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (backend_id, rule, host, chain, time_bucket)
);

CREATE TABLE IF NOT EXISTS retention_config (
    id                   INTEGER PRIMARY KEY CHECK (id = 1),
    connection_logs_days INTEGER NOT NULL DEFAULT 7,
    hourly_stats_days    INTEGER NOT NULL DEFAULT 90,
    auto_cleanup         INTEGER NOT NULL DEFAULT 1
);
"#;

pub fn create_all(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)?;
    // Seed the retention singleton.
    conn.execute(
        "INSERT OR IGNORE INTO retention_config (id, connection_logs_days, hourly_stats_days, auto_cleanup)
         VALUES (1, 7, 90, 1)",
        [],
    )?;
    Ok(())
}

/// Aggregate tables in cleanup/reporting order.
pub const AGGREGATE_TABLES: [&str; 11] = [
    "hourly_stats",
    "domain_stats",
    "ip_stats",
    "proxy_stats",
    "rule_stats",
    "device_stats",
    "country_stats",
    "domain_chain_stats",
    "domain_ip_stats",
    "ip_chain_stats",
    "rule_domain_stats",
];
