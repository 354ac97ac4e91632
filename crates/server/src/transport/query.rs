// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Query-parameter plumbing shared by the stats handlers: time-range
//! validation, backend resolution, and the overlay decision.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::ApiError;
use crate::model::{hour_bucket, rfc3339};
use crate::store::queries::OwnedWindow;
use crate::store::Store;

/// Common query parameters for stats endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeQuery {
    pub backend_id: Option<i64>,
    pub start: Option<String>,
    pub end: Option<String>,
}

/// A validated time window in instants plus its bucket-string form.
#[derive(Debug, Clone, Default)]
pub struct Window {
    pub instants: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub buckets: OwnedWindow,
}

/// Validate `start`/`end`: both or neither, ISO-8601, `start <= end`.
pub fn parse_window(
    start: &Option<String>,
    end: &Option<String>,
) -> Result<Window, (ApiError, String)> {
    match (start, end) {
        (None, None) => Ok(Window::default()),
        (Some(_), None) | (None, Some(_)) => Err((
            ApiError::BadRequest,
            "start and end must be provided together".to_owned(),
        )),
        (Some(start), Some(end)) => {
            let start = parse_instant(start)?;
            let end = parse_instant(end)?;
            if start > end {
                return Err((ApiError::BadRequest, "start must not exceed end".to_owned()));
            }
            // Buckets are hour floors: a bucket overlaps the window when
            // it starts before `end` and its hour covers `start`, so the
            // start bound floors to its hour.
            Ok(Window {
                instants: Some((start, end)),
                buckets: Some((hour_bucket(start), rfc3339(end))),
            })
        }
    }
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>, (ApiError, String)> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| (ApiError::BadRequest, format!("invalid ISO-8601 datetime: {value}")))
}

/// The realtime overlay applies only when the window's end is within the
/// tolerance of now. An absent window spans all time and includes now.
pub fn overlay_applies(window: &Window, tolerance: Duration, now: DateTime<Utc>) -> bool {
    match window.instants {
        None => true,
        Some((_, end)) => {
            let tolerance =
                chrono::Duration::milliseconds(tolerance.as_millis().min(i64::MAX as u128) as i64);
            end >= now - tolerance
        }
    }
}

/// Resolve the target backend: explicit id (must exist) or the active one.
pub fn resolve_backend_id(
    store: &Store,
    requested: Option<i64>,
) -> Result<i64, (ApiError, String)> {
    match requested {
        Some(id) => match store.get_backend(id) {
            Ok(Some(_)) => Ok(id),
            Ok(None) => Err((ApiError::NotFound, format!("unknown backend {id}"))),
            Err(e) => Err((ApiError::Internal, format!("{e:#}"))),
        },
        None => match store.get_active_backend() {
            Ok(Some(backend)) => Ok(backend.id),
            Ok(None) => Err((ApiError::NotFound, "no active backend".to_owned())),
            Err(e) => Err((ApiError::Internal, format!("{e:#}"))),
        },
    }
}

#[cfg(test)]
#[path = "query_tests.rs"]
mod tests;
