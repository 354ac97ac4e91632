// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Batched aggregate writes: one transaction per dimension, additive
//! UPSERT per row.

use rusqlite::params;

use crate::cache::FlushRow;
use crate::model::{rfc3339, ConnIdentity, Dimension, DimensionKey};
use crate::store::{is_busy, is_constraint, Store, StoreWriteError};

fn upsert_sql(dim: Dimension) -> &'static str {
    match dim {
        Dimension::Hourly => {
            "INSERT INTO hourly_stats (backend_id, time_bucket, upload, download, connections, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(backend_id, time_bucket) DO UPDATE SET
               upload = upload + excluded.upload,
               download = download + excluded.download,
               connections = connections + excluded.connections,
               last_seen = max(last_seen, excluded.last_seen)"
        }
        Dimension::Domain => {
            "INSERT INTO domain_stats (backend_id, host, time_bucket, upload, download, connections, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(backend_id, host, time_bucket) DO UPDATE SET
               upload = upload + excluded.upload,
               download = download + excluded.download,
               connections = connections + excluded.connections,
               last_seen = max(last_seen, excluded.last_seen)"
        }
        Dimension::Ip => {
            "INSERT INTO ip_stats (backend_id, dest_ip, time_bucket, upload, download, connections, last_seen, country_code, location)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(backend_id, dest_ip, time_bucket) DO UPDATE SET
               upload = upload + excluded.upload,
               download = download + excluded.download,
               connections = connections + excluded.connections,
               last_seen = max(last_seen, excluded.last_seen),
               country_code = CASE WHEN country_code = '' THEN excluded.country_code ELSE country_code END,
               location = CASE WHEN location = '' THEN excluded.location ELSE location END"
        }
        Dimension::Proxy => {
            "INSERT INTO proxy_stats (backend_id, chain, time_bucket, upload, download, connections, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(backend_id, chain, time_bucket) DO UPDATE SET
               upload = upload + excluded.upload,
               download = download + excluded.download,
               connections = connections + excluded.connections,
               last_seen = max(last_seen, excluded.last_seen)"
        }
        Dimension::Rule => {
            "INSERT INTO rule_stats (backend_id, rule, time_bucket, upload, download, connections, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(backend_id, rule, time_bucket) DO UPDATE SET
               upload = upload + excluded.upload,
               download = download + excluded.download,
               connections = connections + excluded.connections,
               last_seen = max(last_seen, excluded.last_seen)"
        }
        Dimension::Device => {
            "INSERT INTO device_stats (backend_id, source_ip, time_bucket, upload, download, connections, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(backend_id, source_ip, time_bucket) DO UPDATE SET
               upload = upload + excluded.upload,
               download = download + excluded.download,
               connections = connections + excluded.connections,
               last_seen = max(last_seen, excluded.last_seen)"
        }
        Dimension::Country => {
            "INSERT INTO country_stats (backend_id, country_code, time_bucket, upload, download, connections, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(backend_id, country_code, time_bucket) DO UPDATE SET
               upload = upload + excluded.upload,
               download = download + excluded.download,
               connections = connections + excluded.connections,
               last_seen = max(last_seen, excluded.last_seen)"
        }
        Dimension::DomainChain => {
            "INSERT INTO domain_chain_stats (backend_id, host, chain, source_ip, time_bucket, upload, download, connections, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(backend_id, host, chain, source_ip, time_bucket) DO UPDATE SET
               upload = upload + excluded.upload,
               download = download + excluded.download,
               connections = connections + excluded.connections,
               last_seen = max(last_seen, excluded.last_seen)"
        }
        Dimension::DomainIp => {
            "INSERT INTO domain_ip_stats (backend_id, host, dest_ip, time_bucket, upload, download, connections, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(backend_id, host, dest_ip, time_bucket) DO UPDATE SET
               upload = upload + excluded.upload,
               download = download + excluded.download,
               connections = connections + excluded.connections,
               last_seen = max(last_seen, excluded.last_seen)"
        }
        Dimension::IpChain => {
            "INSERT INTO ip_chain_stats (backend_id, dest_ip, chain, source_ip, time_bucket, upload, download, connections, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(backend_id, dest_ip, chain, source_ip, time_bucket) DO UPDATE SET
               upload = upload + excluded.upload,
               download = download + excluded.download,
               connections = connections + excluded.connections,
               last_seen = max(last_seen, excluded.last_seen)"
        }
        Dimension::RuleDomain => {
            "INSERT INTO rule_domain_stats (backend_id, rule, host, chain, time_bucket, upload, download, connections, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(backend_id, rule, host, chain, time_bucket) DO UPDATE SET
               upload = upload + excluded.upload,
               download = download + excluded.download,
               connections = connections + excluded.connections,
               last_seen = max(last_seen, excluded.last_seen)"
        }
    }
}

impl Store {
    /// Write one dimension's drained rows in a single transaction.
    ///
    /// Busy/locked maps to [`StoreWriteError::Busy`] for the flusher's
    /// backoff. Integrity errors discard the offending row, keep the rest
    /// of the batch, and bump the discard counter. Returns the number of
    /// discarded rows.
    pub fn flush_rows(
        &self,
        backend_id: i64,
        dim: Dimension,
        rows: &[FlushRow],
    ) -> Result<usize, StoreWriteError> {
        let classify = |e: rusqlite::Error| {
            if is_busy(&e) {
                StoreWriteError::Busy
            } else {
                StoreWriteError::Other(e.into())
            }
        };

        let mut conn = self.lock();
        let tx = conn.transaction().map_err(classify)?;
        let mut discarded = 0usize;
        {
            let mut stmt = tx.prepare_cached(upsert_sql(dim)).map_err(classify)?;
            for row in rows {
                let last_seen = rfc3339(row.last_seen);
                let result = match &row.key {
                    DimensionKey::Hourly => stmt.execute(params![
                        backend_id,
                        row.bucket,
                        row.upload,
                        row.download,
                        row.connections,
                        last_seen,
                    ]),
                    DimensionKey::Domain { host } => stmt.execute(params![
                        backend_id,
                        host,
                        row.bucket,
                        row.upload,
                        row.download,
                        row.connections,
                        last_seen,
                    ]),
                    DimensionKey::Ip { dest_ip } => {
                        // Absent country: ask the collaborator; a null
                        // result persists as empty.
                        let geo = match row.geo.clone() {
                            Some(geo) => Some(geo),
                            None => self.geoip().lookup(dest_ip),
                        };
                        let (code, location) = match geo {
                            Some(g) => (g.country_code, g.location),
                            None => (String::new(), String::new()),
                        };
                        stmt.execute(params![
                            backend_id,
                            dest_ip,
                            row.bucket,
                            row.upload,
                            row.download,
                            row.connections,
                            last_seen,
                            code,
                            location,
                        ])
                    }
                    DimensionKey::Proxy { chain } => stmt.execute(params![
                        backend_id,
                        chain,
                        row.bucket,
                        row.upload,
                        row.download,
                        row.connections,
                        last_seen,
                    ]),
                    DimensionKey::Rule { rule } => stmt.execute(params![
                        backend_id,
                        rule,
                        row.bucket,
                        row.upload,
                        row.download,
                        row.connections,
                        last_seen,
                    ]),
                    DimensionKey::Device { source_ip } => stmt.execute(params![
                        backend_id,
                        source_ip,
                        row.bucket,
                        row.upload,
                        row.download,
                        row.connections,
                        last_seen,
                    ]),
                    DimensionKey::Country { code } => stmt.execute(params![
                        backend_id,
                        code,
                        row.bucket,
                        row.upload,
                        row.download,
                        row.connections,
                        last_seen,
                    ]),
                    DimensionKey::DomainChain { host, chain, source_ip } => stmt.execute(params![
                        backend_id,
                        host,
                        chain,
                        source_ip,
                        row.bucket,
                        row.upload,
                        row.download,
                        row.connections,
                        last_seen,
                    ]),
                    DimensionKey::DomainIp { host, dest_ip } => stmt.execute(params![
                        backend_id,
                        host,
                        dest_ip,
                        row.bucket,
                        row.upload,
                        row.download,
                        row.connections,
                        last_seen,
                    ]),
                    DimensionKey::IpChain { dest_ip, chain, source_ip } => stmt.execute(params![
                        backend_id,
                        dest_ip,
                        chain,
                        source_ip,
                        row.bucket,
                        row.upload,
                        row.download,
                        row.connections,
                        last_seen,
                    ]),
                    DimensionKey::RuleDomain { rule, host, chain } => stmt.execute(params![
                        backend_id,
                        rule,
                        host,
                        chain,
                        row.bucket,
                        row.upload,
                        row.download,
                        row.connections,
                        last_seen,
                    ]),
                };

                match result {
                    Ok(_) => {}
                    Err(e) if is_busy(&e) => return Err(StoreWriteError::Busy),
                    Err(e) if is_constraint(&e) => {
                        discarded += 1;
                        tracing::warn!(
                            backend_id,
                            dimension = dim.table(),
                            err = %e,
                            "discarding aggregate row on integrity error"
                        );
                    }
                    Err(e) => return Err(StoreWriteError::Other(e.into())),
                }
            }
        }
        tx.commit().map_err(classify)?;
        if discarded > 0 {
            self.note_discarded(discarded as u64);
        }
        Ok(discarded)
    }

    /// Persist the final record of a closed connection.
    pub fn record_connection(
        &self,
        backend_id: i64,
        conn_id: &str,
        identity: &ConnIdentity,
        upload: u64,
        download: u64,
        started_at: Option<&str>,
        closed_at: &str,
    ) -> anyhow::Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO connections
               (backend_id, conn_id, host, dest_ip, chain, rule, source_ip, network, upload, download, started_at, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                backend_id,
                conn_id,
                identity.host,
                identity.dest_ip,
                identity.chain,
                identity.rule,
                identity.source_ip,
                identity.network,
                upload,
                download,
                started_at,
                closed_at,
            ],
        )?;
        Ok(())
    }
}
