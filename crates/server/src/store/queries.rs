// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed read queries over the aggregate tables.
//!
//! Windowed queries are half-open `[start, end)` against `time_bucket`
//! (RFC 3339 strings compare lexicographically). Pagination caps `limit`
//! at 500 and falls back to download-descending for unknown sort columns.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter};
use serde::{Deserialize, Serialize};

use crate::model::{
    day_floor, BucketStatRow, ChainStatRow, CountryStatRow, DeviceStatRow, DomainStatRow,
    IpStatRow, RuleStatRow, Totals,
};
use crate::store::Store;

/// Owned `[start, end)` bucket window; `None` spans all time.
pub type OwnedWindow = Option<(String, String)>;

pub const MAX_PAGE_LIMIT: i64 = 500;

/// Pagination + sorting for list queries.
#[derive(Debug, Clone, Default)]
pub struct PageParams {
    pub offset: i64,
    pub limit: i64,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub search: Option<String>,
}

impl PageParams {
    fn limit(&self) -> i64 {
        if self.limit <= 0 {
            50
        } else {
            self.limit.min(MAX_PAGE_LIMIT)
        }
    }

    fn offset(&self) -> i64 {
        self.offset.max(0)
    }
}

/// Paginated result envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: u64,
}

/// One row of the short-lived connection log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionLogRow {
    pub id: i64,
    pub connection_id: String,
    pub host: String,
    pub ip: String,
    pub chain: String,
    pub rule: String,
    pub source_ip: String,
    pub network: String,
    pub upload: u64,
    pub download: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    pub closed_at: String,
}

/// Per-backend slice of the global summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalBackendTotals {
    pub backend_id: i64,
    pub name: String,
    #[serde(flatten)]
    pub totals: Totals,
}

/// Cross-backend aggregate (no realtime overlay).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    #[serde(flatten)]
    pub total: Totals,
    pub backends: Vec<GlobalBackendTotals>,
}

fn push_window(sql: &mut String, values: &mut Vec<Value>, window: &OwnedWindow) {
    if let Some((start, end)) = window {
        sql.push_str(" AND time_bucket >= ? AND time_bucket < ?");
        values.push(Value::Text(start.clone()));
        values.push(Value::Text(end.clone()));
    }
}

/// Build an ORDER BY clause from a whitelist of `(api name, sql alias)`.
fn order_clause(sort_by: Option<&str>, sort_order: Option<&str>, allowed: &[(&str, &str)]) -> String {
    let col = sort_by
        .and_then(|name| allowed.iter().find(|(api, _)| *api == name))
        .map(|(_, sql)| *sql)
        .unwrap_or("download");
    let dir = match sort_order {
        Some("asc") => "ASC",
        _ => "DESC",
    };
    format!(" ORDER BY {col} {dir}")
}

/// Correlated subqueries counting a domain's distinct join-table
/// partners. `outer` aliases a table exposing `backend_id` and `host`.
fn domain_seen_counts(outer: &str) -> String {
    format!(
        "(SELECT COUNT(DISTINCT s.dest_ip) FROM domain_ip_stats s \
           WHERE s.backend_id = {outer}.backend_id AND s.host = {outer}.host) AS ips_seen, \
         (SELECT COUNT(DISTINCT s.chain) FROM domain_chain_stats s \
           WHERE s.backend_id = {outer}.backend_id AND s.host = {outer}.host) AS chains_seen"
    )
}

/// Correlated subqueries counting an IP's distinct join-table partners.
/// `outer` aliases a table exposing `backend_id` and `dest_ip`.
fn ip_seen_counts(outer: &str) -> String {
    format!(
        "(SELECT COUNT(DISTINCT s.host) FROM domain_ip_stats s \
           WHERE s.backend_id = {outer}.backend_id AND s.dest_ip = {outer}.dest_ip) AS domains_seen, \
         (SELECT COUNT(DISTINCT s.chain) FROM ip_chain_stats s \
           WHERE s.backend_id = {outer}.backend_id AND s.dest_ip = {outer}.dest_ip) AS chains_seen"
    )
}

/// Shape shared by every keyed-totals scan.
struct KeyedRow {
    key: String,
    upload: u64,
    download: u64,
    connections: u64,
    last_seen: Option<String>,
}

impl Store {
    fn keyed_rows(&self, sql: &str, values: Vec<Value>) -> anyhow::Result<Vec<KeyedRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok(KeyedRow {
                key: row.get(0)?,
                upload: row.get(1)?,
                download: row.get(2)?,
                connections: row.get(3)?,
                last_seen: row.get::<_, Option<String>>(4)?.filter(|s| !s.is_empty()),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Byte/connection totals from the hourly dimension.
    pub fn totals(&self, backend_id: i64, window: &OwnedWindow) -> anyhow::Result<Totals> {
        let mut sql = String::from(
            "SELECT COALESCE(SUM(upload), 0), COALESCE(SUM(download), 0), COALESCE(SUM(connections), 0)
             FROM hourly_stats WHERE backend_id = ?",
        );
        let mut values = vec![Value::Integer(backend_id)];
        push_window(&mut sql, &mut values, window);

        let conn = self.lock();
        let totals = conn.query_row(&sql, params_from_iter(values), |row| {
            Ok(Totals {
                total_upload: row.get(0)?,
                total_download: row.get(1)?,
                total_connections: row.get(2)?,
            })
        })?;
        Ok(totals)
    }

    /// Totals since the last UTC midnight.
    pub fn today_totals(&self, backend_id: i64, now: DateTime<Utc>) -> anyhow::Result<Totals> {
        let midnight = day_floor(now);
        let conn = self.lock();
        let totals = conn.query_row(
            "SELECT COALESCE(SUM(upload), 0), COALESCE(SUM(download), 0), COALESCE(SUM(connections), 0)
             FROM hourly_stats WHERE backend_id = ?1 AND time_bucket >= ?2",
            params![backend_id, midnight],
            |row| {
                Ok(Totals {
                    total_upload: row.get(0)?,
                    total_download: row.get(1)?,
                    total_connections: row.get(2)?,
                })
            },
        )?;
        Ok(totals)
    }

    pub fn top_domains(
        &self,
        backend_id: i64,
        window: &OwnedWindow,
        top_n: i64,
    ) -> anyhow::Result<Vec<DomainStatRow>> {
        let mut sql = format!(
            "SELECT d.host, SUM(d.upload), SUM(d.download), SUM(d.connections), MAX(d.last_seen), {}
             FROM domain_stats d WHERE d.backend_id = ?",
            domain_seen_counts("d"),
        );
        let mut values = vec![Value::Integer(backend_id)];
        push_window(&mut sql, &mut values, window);
        sql.push_str(" GROUP BY d.host ORDER BY SUM(d.download) DESC LIMIT ?");
        values.push(Value::Integer(top_n));

        self.domain_rows(&sql, values)
    }

    pub fn top_ips(
        &self,
        backend_id: i64,
        window: &OwnedWindow,
        top_n: i64,
    ) -> anyhow::Result<Vec<IpStatRow>> {
        let mut sql = format!(
            "SELECT i.dest_ip, SUM(i.upload), SUM(i.download), SUM(i.connections), MAX(i.last_seen),
                    MAX(i.country_code), MAX(i.location), {}
             FROM ip_stats i WHERE i.backend_id = ?",
            ip_seen_counts("i"),
        );
        let mut values = vec![Value::Integer(backend_id)];
        push_window(&mut sql, &mut values, window);
        sql.push_str(" GROUP BY i.dest_ip ORDER BY SUM(i.download) DESC LIMIT ?");
        values.push(Value::Integer(top_n));

        self.ip_rows(&sql, values)
    }

    /// Expects columns: host, upload, download, connections, last_seen,
    /// ips_seen, chains_seen (the [`domain_seen_counts`] pair).
    fn domain_rows(&self, sql: &str, values: Vec<Value>) -> anyhow::Result<Vec<DomainStatRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok(DomainStatRow {
                host: row.get(0)?,
                upload: row.get(1)?,
                download: row.get(2)?,
                connections: row.get(3)?,
                last_seen: row.get::<_, Option<String>>(4)?.filter(|s| !s.is_empty()),
                ips_seen: row.get(5)?,
                chains_seen: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Expects columns: dest_ip, upload, download, connections, last_seen,
    /// country_code, location, domains_seen, chains_seen (the
    /// [`ip_seen_counts`] pair).
    fn ip_rows(&self, sql: &str, values: Vec<Value>) -> anyhow::Result<Vec<IpStatRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok(IpStatRow {
                ip: row.get(0)?,
                upload: row.get(1)?,
                download: row.get(2)?,
                connections: row.get(3)?,
                last_seen: row.get::<_, Option<String>>(4)?.filter(|s| !s.is_empty()),
                country_code: row.get::<_, Option<String>>(5)?.filter(|s| !s.is_empty()),
                location: row.get::<_, Option<String>>(6)?.filter(|s| !s.is_empty()),
                domains_seen: row.get(7)?,
                chains_seen: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn proxy_totals(
        &self,
        backend_id: i64,
        window: &OwnedWindow,
    ) -> anyhow::Result<Vec<ChainStatRow>> {
        let mut sql = String::from(
            "SELECT chain, SUM(upload), SUM(download), SUM(connections), MAX(last_seen)
             FROM proxy_stats WHERE backend_id = ?",
        );
        let mut values = vec![Value::Integer(backend_id)];
        push_window(&mut sql, &mut values, window);
        sql.push_str(" GROUP BY chain ORDER BY SUM(download) DESC");

        Ok(self
            .keyed_rows(&sql, values)?
            .into_iter()
            .map(|r| ChainStatRow {
                chain: r.key,
                upload: r.upload,
                download: r.download,
                connections: r.connections,
            })
            .collect())
    }

    pub fn rule_totals(
        &self,
        backend_id: i64,
        window: &OwnedWindow,
    ) -> anyhow::Result<Vec<RuleStatRow>> {
        let mut sql = String::from(
            "SELECT rule, SUM(upload), SUM(download), SUM(connections), MAX(last_seen)
             FROM rule_stats WHERE backend_id = ?",
        );
        let mut values = vec![Value::Integer(backend_id)];
        push_window(&mut sql, &mut values, window);
        sql.push_str(" GROUP BY rule ORDER BY SUM(download) DESC");

        Ok(self
            .keyed_rows(&sql, values)?
            .into_iter()
            .map(|r| RuleStatRow {
                rule: r.key,
                upload: r.upload,
                download: r.download,
                connections: r.connections,
            })
            .collect())
    }

    pub fn device_totals(
        &self,
        backend_id: i64,
        window: &OwnedWindow,
    ) -> anyhow::Result<Vec<DeviceStatRow>> {
        let mut sql = String::from(
            "SELECT source_ip, SUM(upload), SUM(download), SUM(connections), MAX(last_seen)
             FROM device_stats WHERE backend_id = ?",
        );
        let mut values = vec![Value::Integer(backend_id)];
        push_window(&mut sql, &mut values, window);
        sql.push_str(" GROUP BY source_ip ORDER BY SUM(download) DESC");

        Ok(self
            .keyed_rows(&sql, values)?
            .into_iter()
            .map(|r| DeviceStatRow {
                source_ip: r.key,
                upload: r.upload,
                download: r.download,
                connections: r.connections,
            })
            .collect())
    }

    pub fn country_totals(
        &self,
        backend_id: i64,
        window: &OwnedWindow,
    ) -> anyhow::Result<Vec<CountryStatRow>> {
        let mut sql = String::from(
            "SELECT country_code, SUM(upload), SUM(download), SUM(connections), MAX(last_seen)
             FROM country_stats WHERE backend_id = ?",
        );
        let mut values = vec![Value::Integer(backend_id)];
        push_window(&mut sql, &mut values, window);
        sql.push_str(" GROUP BY country_code ORDER BY SUM(download) DESC");

        Ok(self
            .keyed_rows(&sql, values)?
            .into_iter()
            .map(|r| CountryStatRow {
                country_code: r.key,
                upload: r.upload,
                download: r.download,
                connections: r.connections,
            })
            .collect())
    }

    /// Most recent hourly buckets, ascending, capped at `limit`.
    pub fn hourly_series(
        &self,
        backend_id: i64,
        window: &OwnedWindow,
        limit: i64,
    ) -> anyhow::Result<Vec<BucketStatRow>> {
        let mut sql = String::from(
            "SELECT time_bucket, upload, download, connections
             FROM hourly_stats WHERE backend_id = ?",
        );
        let mut values = vec![Value::Integer(backend_id)];
        push_window(&mut sql, &mut values, window);
        sql.push_str(" ORDER BY time_bucket DESC LIMIT ?");
        values.push(Value::Integer(limit));

        let mut rows = {
            let conn = self.lock();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values), |row| {
                Ok(BucketStatRow {
                    time_bucket: row.get(0)?,
                    upload: row.get(1)?,
                    download: row.get(2)?,
                    connections: row.get(3)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        rows.reverse();
        Ok(rows)
    }

    pub fn list_domains(
        &self,
        backend_id: i64,
        window: &OwnedWindow,
        page: &PageParams,
    ) -> anyhow::Result<Page<DomainStatRow>> {
        let mut filter = String::from(" WHERE d.backend_id = ?");
        let mut values = vec![Value::Integer(backend_id)];
        if let Some((start, end)) = window {
            filter.push_str(" AND d.time_bucket >= ? AND d.time_bucket < ?");
            values.push(Value::Text(start.clone()));
            values.push(Value::Text(end.clone()));
        }
        if let Some(ref search) = page.search {
            if !search.is_empty() {
                filter.push_str(" AND d.host LIKE ?");
                values.push(Value::Text(format!("%{search}%")));
            }
        }

        let total: u64 = {
            let conn = self.lock();
            conn.query_row(
                &format!("SELECT COUNT(DISTINCT d.host) FROM domain_stats d{filter}"),
                params_from_iter(values.clone()),
                |row| row.get(0),
            )?
        };

        let order = order_clause(
            page.sort_by.as_deref(),
            page.sort_order.as_deref(),
            &[
                ("upload", "upload"),
                ("download", "download"),
                ("connections", "connections"),
                ("lastSeen", "last_seen"),
                ("host", "host"),
            ],
        );
        let sql = format!(
            "SELECT d.host, SUM(d.upload) AS upload, SUM(d.download) AS download,
                    SUM(d.connections) AS connections, MAX(d.last_seen) AS last_seen, {}
             FROM domain_stats d{filter} GROUP BY d.host{order} LIMIT ? OFFSET ?",
            domain_seen_counts("d"),
        );
        values.push(Value::Integer(page.limit()));
        values.push(Value::Integer(page.offset()));

        let data = self.domain_rows(&sql, values)?;
        Ok(Page { data, total })
    }

    pub fn list_ips(
        &self,
        backend_id: i64,
        window: &OwnedWindow,
        page: &PageParams,
    ) -> anyhow::Result<Page<IpStatRow>> {
        let mut filter = String::from(" WHERE i.backend_id = ?");
        let mut values = vec![Value::Integer(backend_id)];
        if let Some((start, end)) = window {
            filter.push_str(" AND i.time_bucket >= ? AND i.time_bucket < ?");
            values.push(Value::Text(start.clone()));
            values.push(Value::Text(end.clone()));
        }
        if let Some(ref search) = page.search {
            if !search.is_empty() {
                filter.push_str(" AND i.dest_ip LIKE ?");
                values.push(Value::Text(format!("%{search}%")));
            }
        }

        let total: u64 = {
            let conn = self.lock();
            conn.query_row(
                &format!("SELECT COUNT(DISTINCT i.dest_ip) FROM ip_stats i{filter}"),
                params_from_iter(values.clone()),
                |row| row.get(0),
            )?
        };

        let order = order_clause(
            page.sort_by.as_deref(),
            page.sort_order.as_deref(),
            &[
                ("upload", "upload"),
                ("download", "download"),
                ("connections", "connections"),
                ("lastSeen", "last_seen"),
                ("ip", "dest_ip"),
            ],
        );
        let sql = format!(
            "SELECT i.dest_ip, SUM(i.upload) AS upload, SUM(i.download) AS download,
                    SUM(i.connections) AS connections, MAX(i.last_seen) AS last_seen,
                    MAX(i.country_code), MAX(i.location), {}
             FROM ip_stats i{filter} GROUP BY i.dest_ip{order} LIMIT ? OFFSET ?",
            ip_seen_counts("i"),
        );
        values.push(Value::Integer(page.limit()));
        values.push(Value::Integer(page.offset()));

        let data = self.ip_rows(&sql, values)?;
        Ok(Page { data, total })
    }

    /// Chains serving one domain, optionally filtered by source device/chain.
    pub fn domain_chain_stats(
        &self,
        backend_id: i64,
        host: &str,
        window: &OwnedWindow,
        source_ip: Option<&str>,
        source_chain: Option<&str>,
    ) -> anyhow::Result<Vec<ChainStatRow>> {
        let mut sql = String::from(
            "SELECT chain, SUM(upload), SUM(download), SUM(connections), MAX(last_seen)
             FROM domain_chain_stats WHERE backend_id = ? AND host = ?",
        );
        let mut values = vec![Value::Integer(backend_id), Value::Text(host.to_owned())];
        push_window(&mut sql, &mut values, window);
        if let Some(ip) = source_ip {
            sql.push_str(" AND source_ip = ?");
            values.push(Value::Text(ip.to_owned()));
        }
        if let Some(chain) = source_chain {
            sql.push_str(" AND chain = ?");
            values.push(Value::Text(chain.to_owned()));
        }
        sql.push_str(" GROUP BY chain ORDER BY SUM(download) DESC");

        Ok(self
            .keyed_rows(&sql, values)?
            .into_iter()
            .map(|r| ChainStatRow {
                chain: r.key,
                upload: r.upload,
                download: r.download,
                connections: r.connections,
            })
            .collect())
    }

    /// Destination IPs behind one domain, with representative geo.
    pub fn domain_ip_details(
        &self,
        backend_id: i64,
        host: &str,
        window: &OwnedWindow,
        limit: i64,
    ) -> anyhow::Result<Vec<IpStatRow>> {
        let mut sql = format!(
            "SELECT j.dest_ip, SUM(j.upload), SUM(j.download), SUM(j.connections), MAX(j.last_seen),
                    (SELECT MAX(i.country_code) FROM ip_stats i
                      WHERE i.backend_id = j.backend_id AND i.dest_ip = j.dest_ip),
                    (SELECT MAX(i.location) FROM ip_stats i
                      WHERE i.backend_id = j.backend_id AND i.dest_ip = j.dest_ip), {}
             FROM domain_ip_stats j WHERE j.backend_id = ? AND j.host = ?",
            ip_seen_counts("j"),
        );
        let mut values = vec![Value::Integer(backend_id), Value::Text(host.to_owned())];
        if let Some((start, end)) = window {
            sql.push_str(" AND j.time_bucket >= ? AND j.time_bucket < ?");
            values.push(Value::Text(start.clone()));
            values.push(Value::Text(end.clone()));
        }
        sql.push_str(" GROUP BY j.dest_ip ORDER BY SUM(j.download) DESC LIMIT ?");
        values.push(Value::Integer(limit));

        self.ip_rows(&sql, values)
    }

    /// Domains observed on one destination IP.
    pub fn ip_domain_details(
        &self,
        backend_id: i64,
        dest_ip: &str,
        window: &OwnedWindow,
        limit: i64,
    ) -> anyhow::Result<Vec<DomainStatRow>> {
        let mut sql = format!(
            "SELECT d.host, SUM(d.upload), SUM(d.download), SUM(d.connections), MAX(d.last_seen), {}
             FROM domain_ip_stats d WHERE d.backend_id = ? AND d.dest_ip = ?",
            domain_seen_counts("d"),
        );
        let mut values = vec![Value::Integer(backend_id), Value::Text(dest_ip.to_owned())];
        push_window(&mut sql, &mut values, window);
        sql.push_str(" GROUP BY d.host ORDER BY SUM(d.download) DESC LIMIT ?");
        values.push(Value::Integer(limit));

        self.domain_rows(&sql, values)
    }

    /// Chains serving one destination IP, optionally filtered.
    pub fn ip_chain_stats(
        &self,
        backend_id: i64,
        dest_ip: &str,
        window: &OwnedWindow,
        source_ip: Option<&str>,
        source_chain: Option<&str>,
    ) -> anyhow::Result<Vec<ChainStatRow>> {
        let mut sql = String::from(
            "SELECT chain, SUM(upload), SUM(download), SUM(connections), MAX(last_seen)
             FROM ip_chain_stats WHERE backend_id = ? AND dest_ip = ?",
        );
        let mut values = vec![Value::Integer(backend_id), Value::Text(dest_ip.to_owned())];
        push_window(&mut sql, &mut values, window);
        if let Some(ip) = source_ip {
            sql.push_str(" AND source_ip = ?");
            values.push(Value::Text(ip.to_owned()));
        }
        if let Some(chain) = source_chain {
            sql.push_str(" AND chain = ?");
            values.push(Value::Text(chain.to_owned()));
        }
        sql.push_str(" GROUP BY chain ORDER BY SUM(download) DESC");

        Ok(self
            .keyed_rows(&sql, values)?
            .into_iter()
            .map(|r| ChainStatRow {
                chain: r.key,
                upload: r.upload,
                download: r.download,
                connections: r.connections,
            })
            .collect())
    }

    /// Domains routed through one chain.
    pub fn chain_domains(
        &self,
        backend_id: i64,
        chain: &str,
        window: &OwnedWindow,
        limit: i64,
    ) -> anyhow::Result<Vec<DomainStatRow>> {
        let mut sql = format!(
            "SELECT d.host, SUM(d.upload), SUM(d.download), SUM(d.connections), MAX(d.last_seen), {}
             FROM domain_chain_stats d WHERE d.backend_id = ? AND d.chain = ?",
            domain_seen_counts("d"),
        );
        let mut values = vec![Value::Integer(backend_id), Value::Text(chain.to_owned())];
        push_window(&mut sql, &mut values, window);
        sql.push_str(" GROUP BY d.host ORDER BY SUM(d.download) DESC LIMIT ?");
        values.push(Value::Integer(limit));

        self.domain_rows(&sql, values)
    }

    /// Destination IPs routed through one chain.
    pub fn chain_ips(
        &self,
        backend_id: i64,
        chain: &str,
        window: &OwnedWindow,
        limit: i64,
    ) -> anyhow::Result<Vec<IpStatRow>> {
        let mut sql = format!(
            "SELECT j.dest_ip, SUM(j.upload), SUM(j.download), SUM(j.connections), MAX(j.last_seen),
                    (SELECT MAX(i.country_code) FROM ip_stats i
                      WHERE i.backend_id = j.backend_id AND i.dest_ip = j.dest_ip),
                    (SELECT MAX(i.location) FROM ip_stats i
                      WHERE i.backend_id = j.backend_id AND i.dest_ip = j.dest_ip), {}
             FROM ip_chain_stats j WHERE j.backend_id = ? AND j.chain = ?",
            ip_seen_counts("j"),
        );
        let mut values = vec![Value::Integer(backend_id), Value::Text(chain.to_owned())];
        if let Some((start, end)) = window {
            sql.push_str(" AND j.time_bucket >= ? AND j.time_bucket < ?");
            values.push(Value::Text(start.clone()));
            values.push(Value::Text(end.clone()));
        }
        sql.push_str(" GROUP BY j.dest_ip ORDER BY SUM(j.download) DESC LIMIT ?");
        values.push(Value::Integer(limit));

        self.ip_rows(&sql, values)
    }

    /// Domains matched by one rule.
    pub fn rule_domains(
        &self,
        backend_id: i64,
        rule: &str,
        window: &OwnedWindow,
        limit: i64,
    ) -> anyhow::Result<Vec<DomainStatRow>> {
        let mut sql = format!(
            "SELECT d.host, SUM(d.upload), SUM(d.download), SUM(d.connections), MAX(d.last_seen), {}
             FROM rule_domain_stats d WHERE d.backend_id = ? AND d.rule = ?",
            domain_seen_counts("d"),
        );
        let mut values = vec![Value::Integer(backend_id), Value::Text(rule.to_owned())];
        push_window(&mut sql, &mut values, window);
        sql.push_str(" GROUP BY d.host ORDER BY SUM(d.download) DESC LIMIT ?");
        values.push(Value::Integer(limit));

        self.domain_rows(&sql, values)
    }

    /// Chains used by traffic matched by one rule.
    pub fn rule_chain_stats(
        &self,
        backend_id: i64,
        rule: &str,
        window: &OwnedWindow,
    ) -> anyhow::Result<Vec<ChainStatRow>> {
        let mut sql = String::from(
            "SELECT chain, SUM(upload), SUM(download), SUM(connections), MAX(last_seen)
             FROM rule_domain_stats WHERE backend_id = ? AND rule = ?",
        );
        let mut values = vec![Value::Integer(backend_id), Value::Text(rule.to_owned())];
        push_window(&mut sql, &mut values, window);
        sql.push_str(" GROUP BY chain ORDER BY SUM(download) DESC");

        Ok(self
            .keyed_rows(&sql, values)?
            .into_iter()
            .map(|r| ChainStatRow {
                chain: r.key,
                upload: r.upload,
                download: r.download,
                connections: r.connections,
            })
            .collect())
    }

    /// Recent closed connections, newest first.
    pub fn connection_log(
        &self,
        backend_id: i64,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Page<ConnectionLogRow>> {
        let conn = self.lock();
        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM connections WHERE backend_id = ?1",
            params![backend_id],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT id, conn_id, host, dest_ip, chain, rule, source_ip, network,
                    upload, download, started_at, closed_at
             FROM connections WHERE backend_id = ?1
             ORDER BY closed_at DESC, id DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(
            params![backend_id, limit.clamp(1, MAX_PAGE_LIMIT), offset.max(0)],
            |row| {
                Ok(ConnectionLogRow {
                    id: row.get(0)?,
                    connection_id: row.get(1)?,
                    host: row.get(2)?,
                    ip: row.get(3)?,
                    chain: row.get(4)?,
                    rule: row.get(5)?,
                    source_ip: row.get(6)?,
                    network: row.get(7)?,
                    upload: row.get(8)?,
                    download: row.get(9)?,
                    started_at: row.get(10)?,
                    closed_at: row.get(11)?,
                })
            },
        )?;
        let data = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Page { data, total })
    }

    /// Aggregate across all backends. No realtime overlay at this level.
    pub fn global_stats(&self) -> anyhow::Result<GlobalStats> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT b.id, b.name,
                    COALESCE(SUM(h.upload), 0), COALESCE(SUM(h.download), 0),
                    COALESCE(SUM(h.connections), 0)
             FROM backends b
             LEFT JOIN hourly_stats h ON h.backend_id = b.id
             GROUP BY b.id ORDER BY b.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(GlobalBackendTotals {
                backend_id: row.get(0)?,
                name: row.get(1)?,
                totals: Totals {
                    total_upload: row.get(2)?,
                    total_download: row.get(3)?,
                    total_connections: row.get(4)?,
                },
            })
        })?;
        let backends = rows.collect::<rusqlite::Result<Vec<_>>>()?;

        let mut total = Totals::default();
        for b in &backends {
            total.total_upload += b.totals.total_upload;
            total.total_download += b.totals.total_download;
            total.total_connections += b.totals.total_connections;
        }
        Ok(GlobalStats { total, backends })
    }
}
