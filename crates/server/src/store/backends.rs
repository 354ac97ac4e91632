// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Backend CRUD. Deleting a backend cascades to all its aggregate rows.

use anyhow::Context;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::model::{rfc3339, Backend};
use crate::store::Store;

/// Partial update for `PUT /api/backends/:id`.
///
/// `token: Some("")` clears the stored token; `None` leaves it untouched.
#[derive(Debug, Clone, Default)]
pub struct BackendPatch {
    pub name: Option<String>,
    pub url: Option<String>,
    pub token: Option<String>,
    pub enabled: Option<bool>,
    pub listening: Option<bool>,
}

fn backend_from_row(row: &Row<'_>) -> rusqlite::Result<Backend> {
    Ok(Backend {
        id: row.get("id")?,
        name: row.get("name")?,
        url: row.get("url")?,
        token: row.get("token")?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        listening: row.get::<_, i64>("listening")? != 0,
        is_active: row.get::<_, i64>("is_active")? != 0,
        created_at: row.get("created_at")?,
    })
}

const BACKEND_COLS: &str = "id, name, url, token, enabled, listening, is_active, created_at";

/// True when the error is SQLite's UNIQUE violation on `backends.name`.
pub fn is_duplicate_name(err: &anyhow::Error) -> bool {
    err.downcast_ref::<rusqlite::Error>().is_some_and(crate::store::is_constraint)
}

impl Store {
    /// Create a backend. The first backend ever created becomes active.
    pub fn create_backend(
        &self,
        name: &str,
        url: &str,
        token: Option<&str>,
    ) -> anyhow::Result<Backend> {
        let conn = self.lock();
        let existing: i64 = conn.query_row("SELECT COUNT(*) FROM backends", [], |r| r.get(0))?;
        let is_active = existing == 0;
        conn.execute(
            "INSERT INTO backends (name, url, token, enabled, listening, is_active, created_at)
             VALUES (?1, ?2, ?3, 1, 1, ?4, ?5)",
            params![name, url, token, is_active as i64, rfc3339(Utc::now())],
        )
        .map_err(anyhow::Error::from)?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {BACKEND_COLS} FROM backends WHERE id = ?1"),
            params![id],
            backend_from_row,
        )
        .context("re-reading created backend")
    }

    pub fn list_backends(&self) -> anyhow::Result<Vec<Backend>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {BACKEND_COLS} FROM backends ORDER BY id"))?;
        let rows = stmt.query_map([], backend_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_backend(&self, id: i64) -> anyhow::Result<Option<Backend>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {BACKEND_COLS} FROM backends WHERE id = ?1"),
                params![id],
                backend_from_row,
            )
            .optional()?)
    }

    pub fn get_active_backend(&self) -> anyhow::Result<Option<Backend>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {BACKEND_COLS} FROM backends WHERE is_active = 1 LIMIT 1"),
                [],
                backend_from_row,
            )
            .optional()?)
    }

    /// Backends whose sessions should be running.
    pub fn list_listening_backends(&self) -> anyhow::Result<Vec<Backend>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {BACKEND_COLS} FROM backends WHERE enabled = 1 AND listening = 1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([], backend_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Apply a partial update. Returns the updated backend, or `None` when
    /// the id is unknown.
    pub fn update_backend(&self, id: i64, patch: &BackendPatch) -> anyhow::Result<Option<Backend>> {
        {
            let conn = self.lock();
            let mut sets: Vec<String> = Vec::new();
            let mut values: Vec<rusqlite::types::Value> = Vec::new();
            if let Some(ref name) = patch.name {
                sets.push(format!("name = ?{}", values.len() + 1));
                values.push(rusqlite::types::Value::Text(name.clone()));
            }
            if let Some(ref url) = patch.url {
                sets.push(format!("url = ?{}", values.len() + 1));
                values.push(rusqlite::types::Value::Text(url.clone()));
            }
            if let Some(ref token) = patch.token {
                sets.push(format!("token = ?{}", values.len() + 1));
                if token.is_empty() {
                    values.push(rusqlite::types::Value::Null);
                } else {
                    values.push(rusqlite::types::Value::Text(token.clone()));
                }
            }
            if let Some(enabled) = patch.enabled {
                sets.push(format!("enabled = ?{}", values.len() + 1));
                values.push(rusqlite::types::Value::Integer(enabled as i64));
            }
            if let Some(listening) = patch.listening {
                sets.push(format!("listening = ?{}", values.len() + 1));
                values.push(rusqlite::types::Value::Integer(listening as i64));
            }
            if !sets.is_empty() {
                let sql = format!(
                    "UPDATE backends SET {} WHERE id = ?{}",
                    sets.join(", "),
                    values.len() + 1
                );
                values.push(rusqlite::types::Value::Integer(id));
                conn.execute(&sql, rusqlite::params_from_iter(values))
                    .map_err(anyhow::Error::from)?;
            }
        }
        self.get_backend(id)
    }

    /// Delete a backend; aggregate rows go with it via cascade.
    pub fn delete_backend(&self, id: i64) -> anyhow::Result<bool> {
        let conn = self.lock();
        let n = conn.execute("DELETE FROM backends WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Make `id` the active backend, clearing any previous one.
    pub fn set_active_backend(&self, id: i64) -> anyhow::Result<Option<Backend>> {
        {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            let known: i64 =
                tx.query_row("SELECT COUNT(*) FROM backends WHERE id = ?1", params![id], |r| {
                    r.get(0)
                })?;
            if known == 0 {
                return Ok(None);
            }
            tx.execute("UPDATE backends SET is_active = 0 WHERE is_active = 1", [])?;
            tx.execute("UPDATE backends SET is_active = 1 WHERE id = ?1", params![id])?;
            tx.commit()?;
        }
        self.get_backend(id)
    }

    pub fn set_listening(&self, id: i64, listening: bool) -> anyhow::Result<Option<Backend>> {
        {
            let conn = self.lock();
            conn.execute(
                "UPDATE backends SET listening = ?1 WHERE id = ?2",
                params![listening as i64, id],
            )?;
        }
        self.get_backend(id)
    }
}
