// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Embedded relational store: sole owner of persistent state.
//!
//! A single rusqlite connection (WAL, foreign keys on) behind a mutex.
//! SQLite serializes writers internally; every method here is short and
//! synchronous, so handlers call them directly and only long-running
//! maintenance operations go through `spawn_blocking`.

pub mod aggregates;
pub mod backends;
pub mod queries;
pub mod retention;
mod schema;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use rusqlite::Connection;

use crate::geoip::SharedGeoIp;

/// Write failure classification for the flusher's retry policy.
#[derive(Debug)]
pub enum StoreWriteError {
    /// SQLITE_BUSY / SQLITE_LOCKED, retryable with backoff.
    Busy,
    /// Anything else, not retryable.
    Other(anyhow::Error),
}

impl std::fmt::Display for StoreWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Busy => f.write_str("database busy"),
            Self::Other(e) => write!(f, "{e:#}"),
        }
    }
}

pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

pub(crate) fn is_constraint(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Shared store handle.
pub struct Store {
    conn: Mutex<Connection>,
    geoip: SharedGeoIp,
    path: PathBuf,
    /// Aggregate rows dropped on integrity errors since startup.
    discarded_rows: AtomicU64,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path, geoip: SharedGeoIp) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        Self::init(conn, geoip, path.to_owned())
    }

    /// In-memory store for tests.
    pub fn open_in_memory(geoip: SharedGeoIp) -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        Self::init(conn, geoip, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, geoip: SharedGeoIp, path: PathBuf) -> anyhow::Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;
        conn.busy_timeout(std::time::Duration::from_millis(250))?;
        schema::create_all(&conn).context("applying schema")?;
        Ok(Self { conn: Mutex::new(conn), geoip, path, discarded_rows: AtomicU64::new(0) })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn geoip(&self) -> &SharedGeoIp {
        &self.geoip
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn note_discarded(&self, n: u64) {
        self.discarded_rows.fetch_add(n, Ordering::Relaxed);
    }

    /// Aggregate rows discarded on integrity errors since startup.
    pub fn discarded_rows(&self) -> u64 {
        self.discarded_rows.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
