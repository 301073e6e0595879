//! `LedgerStore` trait: the worker's own persistence.
//!
//! Covers the registration ledger (`registered_worker` / `registered_process`)
//! and the activity and error logs (`~worker_log` / `~error_log`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::DatabaseError;

/// Where a ledger record was written from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub host: String,
    pub user: String,
    pub pid: u32,
}

impl Origin {
    /// Host, login user and pid of the current process.
    pub fn current() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();
        Self {
            host,
            user,
            pid: std::process::id(),
        }
    }
}

/// One `~worker_log` row: a step was started.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRecord {
    pub timestamp: DateTime<Utc>,
    pub process_name: String,
    pub worker_name: String,
    pub host: String,
    pub user: String,
    pub pid: u32,
}

/// One `~error_log` row, unique on `(process_name, key_fingerprint)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub process_name: String,
    pub key_fingerprint: String,
    pub timestamp: DateTime<Utc>,
    /// JSON rendering of the failing key.
    pub key: String,
    pub error_message: String,
    pub error_stack: Option<String>,
    pub host: String,
    pub user: String,
    pub pid: u32,
}

/// A registered worker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredWorker {
    pub worker_name: String,
    pub registration_time: DateTime<Utc>,
    pub worker_kwargs: Value,
    pub worker_config_fingerprint: Uuid,
}

/// One step of a registered worker, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredProcess {
    pub process_index: usize,
    pub process_name: String,
    /// Empty for callable steps.
    pub full_table_name: String,
    /// Job-source snapshot for queryable steps.
    pub job_source_query: Option<String>,
    pub invocation_args: Map<String, Value>,
    pub process_config_fingerprint: Uuid,
}

/// A worker row together with its process rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub worker: RegisteredWorker,
    pub processes: Vec<RegisteredProcess>,
}

/// Per-process summary of recent `~worker_log` activity.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentActivity {
    pub process_name: String,
    /// Distinct worker pids seen in the window.
    pub worker_count: i64,
    pub minutes_since_oldest: i64,
    pub minutes_since_newest: i64,
}

/// Backend-agnostic ledger storage.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Activity log ────────────────────────────────────────────────

    /// Append one activity record.
    async fn log_activity(&self, record: &ActivityRecord) -> Result<(), DatabaseError>;

    /// Number of activity records.
    async fn count_activity(&self) -> Result<usize, DatabaseError>;

    /// Summarise activity newer than `backtrack_minutes`, per process.
    async fn recent_activity(
        &self,
        backtrack_minutes: i64,
    ) -> Result<Vec<RecentActivity>, DatabaseError>;

    /// Delete activity older than `cutoff_days`, but only once the newest
    /// record is itself older than the cutoff. Returns rows deleted.
    async fn prune_activity(&self, cutoff_days: u32) -> Result<usize, DatabaseError>;

    // ── Error log ───────────────────────────────────────────────────

    /// Insert, or overwrite the record with the same process and key.
    async fn upsert_error(&self, record: &ErrorRecord) -> Result<(), DatabaseError>;

    /// Upsert several records in one transaction.
    async fn upsert_errors(&self, records: &[ErrorRecord]) -> Result<(), DatabaseError>;

    /// Error records, newest first, optionally for one process.
    async fn list_errors(
        &self,
        process_name: Option<&str>,
    ) -> Result<Vec<ErrorRecord>, DatabaseError>;

    /// Same retention rule as [`LedgerStore::prune_activity`].
    async fn prune_errors(&self, cutoff_days: u32) -> Result<usize, DatabaseError>;

    // ── Registration ────────────────────────────────────────────────

    /// Whether `worker_name` is registered with exactly this fingerprint.
    async fn registration_exists(
        &self,
        worker_name: &str,
        fingerprint: Uuid,
    ) -> Result<bool, DatabaseError>;

    /// Atomically replace any registration of the worker with `registration`.
    async fn replace_registration(&self, registration: &Registration)
    -> Result<(), DatabaseError>;

    /// Current registration of a worker, if any.
    async fn get_registration(
        &self,
        worker_name: &str,
    ) -> Result<Option<Registration>, DatabaseError>;

    /// All registered workers, by name.
    async fn list_registered_workers(&self) -> Result<Vec<RegisteredWorker>, DatabaseError>;
}
