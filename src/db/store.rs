//! SQLite database store implementation.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Result as SqlResult};
use thiserror::Error;
use uuid::Uuid;

use super::models::*;
use super::{PersistenceBridge, ReplyHistory};
use crate::endpoint::Protocol;
use crate::probe::{Reply, ReplyDetail, ReplyStatus};

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }
}

impl PersistenceBridge for Store {
    fn load_endpoints(&self) -> Result<Vec<EndpointRecord>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, protocol, address_or_url, description, group_name, enabled, ping_every_seconds, timeout_seconds, buffer_size, ttl, dont_fragment, created_at FROM endpoints ORDER BY position",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, i64>(9)?,
                    row.get::<_, bool>(10)?,
                    row.get::<_, String>(11)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, protocol, address, description, group, enabled, ping, timeout, buffer, ttl, df, created) in rows {
            let id = Uuid::parse_str(&id).map_err(|e| DbError::Corrupt(format!("endpoint id {}: {}", id, e)))?;
            let protocol: Protocol = protocol
                .parse()
                .map_err(|e| DbError::Corrupt(format!("endpoint {}: {}", id, e)))?;
            records.push(EndpointRecord {
                id,
                protocol,
                address_or_url: address,
                description,
                group,
                enabled,
                ping_every_seconds: ping,
                timeout_seconds: timeout,
                buffer_size: buffer.max(0) as usize,
                ttl: ttl.clamp(1, 255) as u8,
                dont_fragment: df,
                created_at: parse_db_time(&created).unwrap_or_else(Utc::now),
            });
        }
        Ok(records)
    }

    fn save_endpoints(&self, endpoints: &[EndpointRecord]) -> Result<(), DbError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM endpoints", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO endpoints (id, position, protocol, address_or_url, description, group_name, enabled, ping_every_seconds, timeout_seconds, buffer_size, ttl, dont_fragment, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            for (position, e) in endpoints.iter().enumerate() {
                stmt.execute(params![
                    e.id.to_string(),
                    position as i64,
                    e.protocol.as_str(),
                    e.address_or_url,
                    e.description,
                    e.group,
                    e.enabled,
                    e.ping_every_seconds,
                    e.timeout_seconds,
                    e.buffer_size as i64,
                    e.ttl,
                    e.dont_fragment,
                    format_db_time(e.created_at),
                ])?;
            }
        }
        // History of endpoints that no longer exist goes with them
        tx.execute("DELETE FROM replies WHERE endpoint_id NOT IN (SELECT id FROM endpoints)", [])?;
        tx.commit()?;
        Ok(())
    }

    fn load_reply_history(&self) -> Result<ReplyHistory, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT endpoint_id, succeeded, status, target, sent_at, elapsed_ms, error_message, detail FROM replies ORDER BY endpoint_id, seq",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut history = ReplyHistory::new();
        for (endpoint_id, succeeded, status, target, sent_at, elapsed, message, detail) in rows {
            let Ok(id) = Uuid::parse_str(&endpoint_id) else {
                tracing::warn!("Skipping reply with invalid endpoint id {}", endpoint_id);
                continue;
            };
            let status: ReplyStatus = match serde_json::from_str(&status) {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!("Skipping reply with unreadable status for endpoint {}: {}", id, e);
                    continue;
                }
            };
            let detail: ReplyDetail = match serde_json::from_str(&detail) {
                Ok(detail) => detail,
                Err(e) => {
                    tracing::warn!("Skipping reply with unreadable detail for endpoint {}: {}", id, e);
                    continue;
                }
            };
            let target = target.and_then(|t| t.parse::<SocketAddr>().ok());
            let sent_at = parse_db_time(&sent_at).unwrap_or_else(Utc::now);
            let elapsed = elapsed.unwrap_or(f64::INFINITY);

            match Reply::from_parts(succeeded, status, target, sent_at, elapsed, message, detail) {
                Some(reply) => history.entry(id).or_default().push(reply),
                None => tracing::warn!("Skipping inconsistent reply for endpoint {}", id),
            }
        }
        Ok(history)
    }

    fn save_reply_history(&self, history: &ReplyHistory) -> Result<(), DbError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM replies", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO replies (endpoint_id, seq, succeeded, status, target, sent_at, elapsed_ms, error_message, detail) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (id, replies) in history {
                let id = id.to_string();
                for (seq, reply) in replies.iter().enumerate() {
                    let elapsed = reply.elapsed_ms();
                    stmt.execute(params![
                        id,
                        seq as i64,
                        reply.succeeded(),
                        serde_json::to_string(&reply.status())?,
                        reply.target().map(|t| t.to_string()),
                        format_db_time(reply.sent_at()),
                        elapsed.is_finite().then_some(elapsed),
                        reply.error_message(),
                        serde_json::to_string(reply.detail())?,
                    ])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn format_db_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    let formats = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];
    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeDefaults;
    use crate::endpoint::parse_line;
    use crate::probe::IcmpStatus;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn record(line: &str) -> EndpointRecord {
        EndpointRecord::from(&parse_line(line, &ProbeDefaults::default()).unwrap())
    }

    #[test]
    fn test_endpoint_save_and_load() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        assert!(store.load_endpoints().unwrap().is_empty());

        let records = vec![
            record("8.8.8.8,Google DNS,DNS"),
            record("tcp://example.com:443|10|2|0"),
            record("https://example.com/health"),
        ];
        store.save_endpoints(&records).unwrap();
        // Saving twice is an idempotent overwrite
        store.save_endpoints(&records).unwrap();

        let loaded = store.load_endpoints().unwrap();
        assert_eq!(loaded.len(), 3);
        for (saved, loaded) in records.iter().zip(&loaded) {
            assert_eq!(saved.id, loaded.id);
            assert_eq!(saved.protocol, loaded.protocol);
            assert_eq!(saved.address_or_url, loaded.address_or_url);
            assert_eq!(saved.description, loaded.description);
            assert_eq!(saved.ping_every_seconds, loaded.ping_every_seconds);
            assert_eq!(saved.created_at, loaded.created_at);
        }
    }

    #[test]
    fn test_reply_history_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let endpoint = record("10.0.0.1");
        store.save_endpoints(std::slice::from_ref(&endpoint)).unwrap();

        let now = Utc::now();
        let target: SocketAddr = "10.0.0.1:0".parse().unwrap();
        let replies = vec![
            Reply::timed_out(Some(target), now, Duration::from_secs(1)),
            Reply::icmp(
                IcmpStatus::Success,
                Some(target),
                now,
                Duration::from_micros(4_250),
                ReplyDetail::Icmp { buffer_len: 32, ttl: Some(60) },
            ),
        ];
        let mut history = ReplyHistory::new();
        history.insert(endpoint.id, replies.clone());
        store.save_reply_history(&history).unwrap();

        let loaded = store.load_reply_history().unwrap();
        assert_eq!(loaded.get(&endpoint.id), Some(&replies));
        assert_eq!(loaded[&endpoint.id][0].elapsed_ms(), f64::INFINITY);
    }

    #[test]
    fn test_corrupt_reply_rows_skipped() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let endpoint = record("10.0.0.1");
        store.save_endpoints(std::slice::from_ref(&endpoint)).unwrap();

        let now = Utc::now();
        let replies = vec![
            Reply::cancelled(None, now),
            Reply::timed_out(None, now, Duration::from_secs(1)),
            Reply::cancelled(None, now),
        ];
        let mut history = ReplyHistory::new();
        history.insert(endpoint.id, replies);
        store.save_reply_history(&history).unwrap();

        store.conn().execute("UPDATE replies SET status = 'garbage' WHERE seq = 0", []).unwrap();
        store.conn().execute("UPDATE replies SET detail = '{' WHERE seq = 2", []).unwrap();

        let loaded = store.load_reply_history().unwrap();
        let kept = &loaded[&endpoint.id];
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].status(), ReplyStatus::TimedOut);
        assert_eq!(store.load_endpoints().unwrap().len(), 1);
    }

    #[test]
    fn test_removed_endpoint_history_purged() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let a = record("10.0.0.1");
        let b = record("10.0.0.2");
        store.save_endpoints(&[a.clone(), b.clone()]).unwrap();

        let reply = Reply::cancelled(None, Utc::now());
        let mut history = ReplyHistory::new();
        history.insert(a.id, vec![reply.clone()]);
        history.insert(b.id, vec![reply]);
        store.save_reply_history(&history).unwrap();

        store.save_endpoints(std::slice::from_ref(&a)).unwrap();
        let loaded = store.load_reply_history().unwrap();
        assert_eq!(loaded.get(&a.id).map(Vec::len), Some(1));
        assert!(!loaded.contains_key(&b.id));
    }

    #[test]
    fn test_parse_db_time_formats() {
        assert!(parse_db_time("2024-01-01T10:00:00.123456789Z").is_some());
        assert!(parse_db_time("2024-01-01 10:00:00.5").is_some());
        assert!(parse_db_time("2024-01-01 10:00:00").is_some());
        assert!(parse_db_time("yesterday").is_none());
    }
}
