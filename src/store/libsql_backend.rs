//! libSQL backend: async `LedgerStore` implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! RFC 3339 UTC with microsecond precision so text comparison orders them.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    ActivityRecord, ErrorRecord, LedgerStore, RecentActivity, RegisteredProcess,
    RegisteredWorker, Registration,
};

const WORKER_LOG: &str = r#""~worker_log""#;
const ERROR_LOG: &str = r#""~error_log""#;

/// Ledger on one long-lived libSQL connection.
pub struct LibSqlLedger {
    // Owns the database `conn` was opened from.
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlLedger {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Ledger database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Retention shared by both logs: nothing is deleted while the newest
    /// row is still inside the window.
    async fn prune_table(
        &self,
        table: &str,
        column: &str,
        cutoff_days: u32,
    ) -> Result<usize, DatabaseError> {
        let cutoff = format_ts(&(Utc::now() - chrono::Duration::days(i64::from(cutoff_days))));
        let conn = self.conn();

        let mut rows = conn
            .query(&format!("SELECT MAX({column}) FROM {table}"), ())
            .await
            .map_err(|e| DatabaseError::Query(format!("prune {table}: {e}")))?;
        let newest: Option<String> = match rows.next().await {
            Ok(Some(row)) => row.get::<String>(0).ok(),
            Ok(None) => None,
            Err(e) => return Err(DatabaseError::Query(format!("prune {table}: {e}"))),
        };

        match newest {
            Some(newest) if newest < cutoff => {}
            _ => return Ok(0),
        }

        let count = conn
            .execute(
                &format!("DELETE FROM {table} WHERE {column} < ?1"),
                params![cutoff],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune {table}: {e}")))?;

        if count > 0 {
            info!(count, cutoff_days, table, "Pruned old ledger rows");
        }
        Ok(count as usize)
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

/// Map a libsql Row to an ErrorRecord.
///
/// Column order matches ERROR_COLUMNS.
fn row_to_error(row: &libsql::Row) -> Result<ErrorRecord, libsql::Error> {
    let timestamp: String = row.get(2)?;
    let pid: i64 = row.get(8)?;
    Ok(ErrorRecord {
        process_name: row.get(0)?,
        key_fingerprint: row.get(1)?,
        timestamp: parse_datetime(&timestamp),
        key: row.get(3)?,
        error_message: row.get(4)?,
        error_stack: row.get::<String>(5).ok(),
        host: row.get(6)?,
        user: row.get(7)?,
        pid: pid as u32,
    })
}

fn row_to_worker(row: &libsql::Row) -> Result<RegisteredWorker, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("registered_worker row parse: {e}"));
    let worker_name: String = row.get(0).map_err(parse)?;
    let registration_time: String = row.get(1).map_err(parse)?;
    let kwargs: String = row.get(2).map_err(parse)?;
    let fingerprint: String = row.get(3).map_err(parse)?;
    Ok(RegisteredWorker {
        worker_name,
        registration_time: parse_datetime(&registration_time),
        worker_kwargs: serde_json::from_str(&kwargs)
            .map_err(|e| DatabaseError::Serialization(format!("worker_kwargs: {e}")))?,
        worker_config_fingerprint: parse_uuid(&fingerprint),
    })
}

fn row_to_process(row: &libsql::Row) -> Result<RegisteredProcess, DatabaseError> {
    let parse =
        |e: libsql::Error| DatabaseError::Query(format!("registered_process row parse: {e}"));
    let index: i64 = row.get(0).map_err(parse)?;
    let args: String = row.get(4).map_err(parse)?;
    let fingerprint: String = row.get(5).map_err(parse)?;
    Ok(RegisteredProcess {
        process_index: index as usize,
        process_name: row.get(1).map_err(parse)?,
        full_table_name: row.get(2).map_err(parse)?,
        job_source_query: row.get::<String>(3).ok(),
        invocation_args: serde_json::from_str(&args)
            .map_err(|e| DatabaseError::Serialization(format!("invocation_args: {e}")))?,
        process_config_fingerprint: parse_uuid(&fingerprint),
    })
}

/// Upsert one error row on `conn` (a plain connection or a transaction).
async fn upsert_error_on(conn: &Connection, record: &ErrorRecord) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO {ERROR_LOG} (process, key_hash, error_timestamp, key, error_message, error_stack, host, user, pid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(process, key_hash) DO UPDATE SET
                error_timestamp = excluded.error_timestamp,
                key = excluded.key,
                error_message = excluded.error_message,
                error_stack = excluded.error_stack,
                host = excluded.host,
                user = excluded.user,
                pid = excluded.pid"
        ),
        params![
            record.process_name.clone(),
            record.key_fingerprint.clone(),
            format_ts(&record.timestamp),
            record.key.clone(),
            record.error_message.clone(),
            opt_text_owned(record.error_stack.clone()),
            record.host.clone(),
            record.user.clone(),
            i64::from(record.pid),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("upsert_error: {e}")))?;
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

const ERROR_COLUMNS: &str =
    "process, key_hash, error_timestamp, key, error_message, error_stack, host, user, pid";

const WORKER_COLUMNS: &str =
    "worker_name, registration_time, worker_kwargs, worker_config_fingerprint";

const PROCESS_COLUMNS: &str = "process_index, process_name, full_table_name, job_source_query, invocation_args, process_config_fingerprint";

#[async_trait]
impl LedgerStore for LibSqlLedger {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Activity log ────────────────────────────────────────────────

    async fn log_activity(&self, record: &ActivityRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO {WORKER_LOG} (process_timestamp, process, worker_name, host, user, pid)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                ),
                params![
                    format_ts(&record.timestamp),
                    record.process_name.clone(),
                    record.worker_name.clone(),
                    record.host.clone(),
                    record.user.clone(),
                    i64::from(record.pid),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("log_activity: {e}")))?;

        debug!(process = %record.process_name, worker = %record.worker_name, "Activity logged");
        Ok(())
    }

    async fn count_activity(&self) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query(&format!("SELECT COUNT(*) FROM {WORKER_LOG}"), ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_activity: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(count as usize)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_activity: {e}"))),
        }
    }

    async fn recent_activity(
        &self,
        backtrack_minutes: i64,
    ) -> Result<Vec<RecentActivity>, DatabaseError> {
        let now = Utc::now();
        let since = format_ts(&(now - chrono::Duration::minutes(backtrack_minutes)));
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT process, process_timestamp, pid FROM {WORKER_LOG}
                     WHERE process_timestamp >= ?1"
                ),
                params![since],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_activity: {e}")))?;

        // process -> (oldest, newest, pids)
        let mut grouped: BTreeMap<String, (DateTime<Utc>, DateTime<Utc>, HashSet<i64>)> =
            BTreeMap::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let process: String = row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("recent_activity row: {e}")))?;
                    let ts: String = row
                        .get(1)
                        .map_err(|e| DatabaseError::Query(format!("recent_activity row: {e}")))?;
                    let pid: i64 = row.get(2).unwrap_or(0);
                    let ts = parse_datetime(&ts);
                    let entry = grouped
                        .entry(process)
                        .or_insert_with(|| (ts, ts, HashSet::new()));
                    entry.0 = entry.0.min(ts);
                    entry.1 = entry.1.max(ts);
                    entry.2.insert(pid);
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("recent_activity: {e}"))),
            }
        }

        Ok(grouped
            .into_iter()
            .map(|(process_name, (oldest, newest, pids))| RecentActivity {
                process_name,
                worker_count: pids.len() as i64,
                minutes_since_oldest: (now - oldest).num_minutes(),
                minutes_since_newest: (now - newest).num_minutes(),
            })
            .collect())
    }

    async fn prune_activity(&self, cutoff_days: u32) -> Result<usize, DatabaseError> {
        self.prune_table(WORKER_LOG, "process_timestamp", cutoff_days)
            .await
    }

    // ── Error log ───────────────────────────────────────────────────

    async fn upsert_error(&self, record: &ErrorRecord) -> Result<(), DatabaseError> {
        upsert_error_on(self.conn(), record).await?;
        debug!(process = %record.process_name, key_hash = %record.key_fingerprint, "Error logged");
        Ok(())
    }

    async fn upsert_errors(&self, records: &[ErrorRecord]) -> Result<(), DatabaseError> {
        if records.is_empty() {
            return Ok(());
        }
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Transaction(format!("upsert_errors begin: {e}")))?;
        for record in records {
            upsert_error_on(&tx, record).await?;
        }
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Transaction(format!("upsert_errors commit: {e}")))?;
        Ok(())
    }

    async fn list_errors(
        &self,
        process_name: Option<&str>,
    ) -> Result<Vec<ErrorRecord>, DatabaseError> {
        let conn = self.conn();
        let mut rows = match process_name {
            Some(process) => {
                conn.query(
                    &format!(
                        "SELECT {ERROR_COLUMNS} FROM {ERROR_LOG} WHERE process = ?1 ORDER BY error_timestamp DESC"
                    ),
                    params![process],
                )
                .await
            }
            None => {
                conn.query(
                    &format!("SELECT {ERROR_COLUMNS} FROM {ERROR_LOG} ORDER BY error_timestamp DESC"),
                    (),
                )
                .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("list_errors: {e}")))?;

        let mut records = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => records.push(
                    row_to_error(&row)
                        .map_err(|e| DatabaseError::Query(format!("list_errors row parse: {e}")))?,
                ),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_errors: {e}"))),
            }
        }
        Ok(records)
    }

    async fn prune_errors(&self, cutoff_days: u32) -> Result<usize, DatabaseError> {
        self.prune_table(ERROR_LOG, "error_timestamp", cutoff_days)
            .await
    }

    // ── Registration ────────────────────────────────────────────────

    async fn registration_exists(
        &self,
        worker_name: &str,
        fingerprint: Uuid,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM registered_worker WHERE worker_name = ?1 AND worker_config_fingerprint = ?2",
                params![worker_name, fingerprint.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("registration_exists: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(count > 0)
            }
            _ => Ok(false),
        }
    }

    async fn replace_registration(
        &self,
        registration: &Registration,
    ) -> Result<(), DatabaseError> {
        let worker = &registration.worker;
        let kwargs = serde_json::to_string(&worker.worker_kwargs)
            .map_err(|e| DatabaseError::Serialization(format!("worker_kwargs: {e}")))?;

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Transaction(format!("replace_registration begin: {e}")))?;

        tx.execute(
            "DELETE FROM registered_process WHERE worker_name = ?1",
            params![worker.worker_name.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("replace_registration: {e}")))?;
        tx.execute(
            "DELETE FROM registered_worker WHERE worker_name = ?1",
            params![worker.worker_name.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("replace_registration: {e}")))?;

        tx.execute(
            &format!("INSERT INTO registered_worker ({WORKER_COLUMNS}) VALUES (?1, ?2, ?3, ?4)"),
            params![
                worker.worker_name.clone(),
                format_ts(&worker.registration_time),
                kwargs,
                worker.worker_config_fingerprint.to_string(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("replace_registration worker: {e}")))?;

        for process in &registration.processes {
            let args = serde_json::to_string(&process.invocation_args)
                .map_err(|e| DatabaseError::Serialization(format!("invocation_args: {e}")))?;
            tx.execute(
                &format!(
                    "INSERT INTO registered_process (worker_name, {PROCESS_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    worker.worker_name.clone(),
                    process.process_index as i64,
                    process.process_name.clone(),
                    process.full_table_name.clone(),
                    opt_text_owned(process.job_source_query.clone()),
                    args,
                    process.process_config_fingerprint.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_registration process: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Transaction(format!("replace_registration commit: {e}")))?;
        Ok(())
    }

    async fn get_registration(
        &self,
        worker_name: &str,
    ) -> Result<Option<Registration>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM registered_worker WHERE worker_name = ?1"),
                params![worker_name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_registration: {e}")))?;

        let worker = match rows.next().await {
            Ok(Some(row)) => row_to_worker(&row)?,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("get_registration: {e}"))),
        };

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {PROCESS_COLUMNS} FROM registered_process WHERE worker_name = ?1 ORDER BY process_index ASC"
                ),
                params![worker_name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_registration processes: {e}")))?;

        let mut processes = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => processes.push(row_to_process(&row)?),
                Ok(None) => break,
                Err(e) => {
                    return Err(DatabaseError::Query(format!(
                        "get_registration processes: {e}"
                    )));
                }
            }
        }

        Ok(Some(Registration { worker, processes }))
    }

    async fn list_registered_workers(&self) -> Result<Vec<RegisteredWorker>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM registered_worker ORDER BY worker_name ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_registered_workers: {e}")))?;

        let mut workers = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => workers.push(row_to_worker(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_registered_workers: {e}"))),
            }
        }
        Ok(workers)
    }
}
