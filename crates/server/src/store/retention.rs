// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retention config, data cleanup, and database maintenance.

use chrono::{Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::model::rfc3339;
use crate::store::{schema, Store};

/// Singleton retention settings row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionConfig {
    pub connection_logs_days: u32,
    pub hourly_stats_days: u32,
    pub auto_cleanup: bool,
}

impl RetentionConfig {
    /// Bounds: connection logs 1–90 days, hourly stats 7–365 days.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=90).contains(&self.connection_logs_days) {
            return Err(format!(
                "connectionLogsDays must be within 1..=90, got {}",
                self.connection_logs_days
            ));
        }
        if !(7..=365).contains(&self.hourly_stats_days) {
            return Err(format!(
                "hourlyStatsDays must be within 7..=365, got {}",
                self.hourly_stats_days
            ));
        }
        Ok(())
    }
}

/// Rows removed from one table during cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableCount {
    pub table: String,
    pub deleted: u64,
}

/// Current size of one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRows {
    pub table: String,
    pub rows: u64,
}

/// Per-table row counts plus database file size.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbStats {
    pub path: String,
    pub file_size_bytes: u64,
    pub tables: Vec<TableRows>,
}

impl Store {
    pub fn get_retention(&self) -> anyhow::Result<RetentionConfig> {
        let conn = self.lock();
        let config = conn.query_row(
            "SELECT connection_logs_days, hourly_stats_days, auto_cleanup
             FROM retention_config WHERE id = 1",
            [],
            |row| {
                Ok(RetentionConfig {
                    connection_logs_days: row.get(0)?,
                    hourly_stats_days: row.get(1)?,
                    auto_cleanup: row.get::<_, i64>(2)? != 0,
                })
            },
        )?;
        Ok(config)
    }

    /// Persist validated retention settings.
    pub fn set_retention(&self, config: &RetentionConfig) -> anyhow::Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE retention_config
             SET connection_logs_days = ?1, hourly_stats_days = ?2, auto_cleanup = ?3
             WHERE id = 1",
            params![
                config.connection_logs_days,
                config.hourly_stats_days,
                config.auto_cleanup as i64
            ],
        )?;
        Ok(())
    }

    /// Delete old data.
    ///
    /// `days > 0` prunes connection records older than `days`. `days == 0`
    /// wipes every aggregate and connection row for the backend (or all
    /// backends when `backend_id` is `None`). Returns per-table counts.
    pub fn cleanup_old_data(
        &self,
        backend_id: Option<i64>,
        days: u32,
    ) -> anyhow::Result<Vec<TableCount>> {
        let mut counts = Vec::new();
        let conn = self.lock();

        if days == 0 {
            for table in schema::AGGREGATE_TABLES {
                let deleted = match backend_id {
                    Some(id) => conn.execute(
                        &format!("DELETE FROM {table} WHERE backend_id = ?1"),
                        params![id],
                    )?,
                    None => conn.execute(&format!("DELETE FROM {table}"), [])?,
                };
                counts.push(TableCount { table: table.to_owned(), deleted: deleted as u64 });
            }
            let deleted = match backend_id {
                Some(id) => {
                    conn.execute("DELETE FROM connections WHERE backend_id = ?1", params![id])?
                }
                None => conn.execute("DELETE FROM connections", [])?,
            };
            counts.push(TableCount { table: "connections".to_owned(), deleted: deleted as u64 });
            return Ok(counts);
        }

        let cutoff = rfc3339(Utc::now() - Duration::days(i64::from(days)));
        let deleted = match backend_id {
            Some(id) => conn.execute(
                "DELETE FROM connections WHERE backend_id = ?1 AND closed_at < ?2",
                params![id, cutoff],
            )?,
            None => conn.execute("DELETE FROM connections WHERE closed_at < ?1", params![cutoff])?,
        };
        counts.push(TableCount { table: "connections".to_owned(), deleted: deleted as u64 });
        Ok(counts)
    }

    /// One automatic retention pass per the stored config: connection logs
    /// by `connection_logs_days`, aggregate buckets by `hourly_stats_days`.
    pub fn auto_cleanup_pass(&self) -> anyhow::Result<Vec<TableCount>> {
        let config = self.get_retention()?;
        if !config.auto_cleanup {
            return Ok(Vec::new());
        }
        let mut counts = self.cleanup_old_data(None, config.connection_logs_days)?;

        let cutoff = rfc3339(Utc::now() - Duration::days(i64::from(config.hourly_stats_days)));
        let conn = self.lock();
        for table in schema::AGGREGATE_TABLES {
            let deleted = conn.execute(
                &format!("DELETE FROM {table} WHERE time_bucket < ?1"),
                params![cutoff],
            )?;
            if deleted > 0 {
                counts.push(TableCount { table: table.to_owned(), deleted: deleted as u64 });
            }
        }
        Ok(counts)
    }

    pub fn vacuum(&self) -> anyhow::Result<()> {
        let conn = self.lock();
        conn.execute("VACUUM", [])?;
        Ok(())
    }

    pub fn db_stats(&self) -> anyhow::Result<DbStats> {
        let conn = self.lock();
        let mut tables = Vec::new();
        for table in schema::AGGREGATE_TABLES.iter().chain(["connections", "backends"].iter()) {
            let rows: u64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
            tables.push(TableRows { table: (*table).to_owned(), rows });
        }
        let page_count: u64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: u64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok(DbStats {
            path: self.path().display().to_string(),
            file_size_bytes: page_count * page_size,
            tables,
        })
    }
}
