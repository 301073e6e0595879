//! Seams onto the external pipeline framework.
//!
//! The framework owns the per-namespace job queue and the auto-populated
//! tables; the worker only reads the queue, deletes from it, and marks
//! entries as failed. Everything here is a trait so any backend can be
//! plugged in. [`MemoryJobQueue`] is a self-contained implementation.

pub mod like;
pub mod memory;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{QueueError, StepError};

pub use like::like_match;
pub use memory::MemoryJobQueue;

/// Primary-key mapping identifying one job input.
pub type JobKey = Map<String, Value>;

/// Status of a job-queue row.
///
/// Completed jobs are not stored in the queue; success is implicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Reserved,
    Error,
    Ignore,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Reserved => "reserved",
            Self::Error => "error",
            Self::Ignore => "ignore",
        };
        write!(f, "{s}")
    }
}

/// Identity of a job-queue row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId {
    pub table_name: String,
    pub key_hash: String,
}

/// One row of a namespace's job queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntry {
    pub table_name: String,
    pub key_hash: String,
    pub key: JobKey,
    pub status: JobStatus,
    pub error_message: String,
    pub error_stack: Option<String>,
    /// When the row entered its current status.
    pub timestamp: DateTime<Utc>,
    /// Database session that holds the reservation.
    pub connection_id: u64,
    pub host: String,
    pub user: String,
    pub pid: u32,
}

impl JobEntry {
    pub fn id(&self) -> JobId {
        JobId {
            table_name: self.table_name.clone(),
            key_hash: self.key_hash.clone(),
        }
    }
}

/// Restriction applied when listing queue rows.
///
/// `error_like` is a disjunction of SQL `LIKE` patterns over the error
/// message; an empty list places no restriction on the message.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub table_name: Option<String>,
    pub error_like: Vec<String>,
}

impl JobFilter {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_table(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn with_error_like<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.error_like = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Whether `entry` satisfies this filter.
    pub fn matches(&self, entry: &JobEntry) -> bool {
        if self.status.is_some_and(|s| s != entry.status) {
            return false;
        }
        if self
            .table_name
            .as_deref()
            .is_some_and(|t| t != entry.table_name)
        {
            return false;
        }
        self.error_like.is_empty()
            || self
                .error_like
                .iter()
                .any(|p| like_match(p, &entry.error_message))
    }
}

/// The job queue of one namespace (schema).
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Namespace (database schema) this queue belongs to.
    fn namespace(&self) -> &str;

    /// List rows matching `filter`.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobEntry>, QueueError>;

    /// Delete the given rows. Returns the number removed.
    async fn delete_jobs(&self, ids: &[JobId]) -> Result<usize, QueueError>;

    /// Delete those of the given rows that still satisfy `filter` at delete
    /// time. Rows changed by another session since they were listed stay.
    async fn delete_matching(&self, ids: &[JobId], filter: &JobFilter)
    -> Result<usize, QueueError>;

    /// Move a job to error status with `message`.
    async fn mark_error(
        &self,
        table_name: &str,
        key: &JobKey,
        message: &str,
    ) -> Result<(), QueueError>;

    /// Ids of the currently open sessions other than the caller's own.
    async fn live_connections(&self) -> Result<HashSet<u64>, QueueError>;
}

/// Outcome of one populate call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PopulateOutcome {
    pub success_count: usize,
    /// Keys that failed during this call, with their error messages.
    pub errors: Vec<(JobKey, String)>,
}

impl PopulateOutcome {
    /// Jobs that reached success or error state.
    pub fn processed(&self) -> usize {
        self.success_count + self.errors.len()
    }
}

/// An idempotent, incrementally-populated table bound to a job queue.
#[async_trait]
pub trait QueryableJob: Send + Sync {
    /// Schema-qualified name, e.g. `` `lab_ephys`.`__spike_sorting` ``.
    fn full_table_name(&self) -> &str;

    /// Bare table name as it appears in the job queue.
    fn table_name(&self) -> &str;

    /// Owning schema. `None` when the table is not bound to a schema yet.
    fn schema_name(&self) -> Option<&str>;

    /// Whether the table supports incremental populate (lookup and manual
    /// tables do not).
    fn is_auto_populated(&self) -> bool;

    /// Opaque snapshot of the job-source query, used only for fingerprinting.
    fn key_source_snapshot(&self) -> String;

    /// Run the table's populate with the merged settings.
    async fn populate(&self, settings: &Map<String, Value>) -> Result<PopulateOutcome, StepError>;

    /// Whether `key` is still part of the job source.
    async fn key_source_contains(&self, key: &JobKey) -> Result<bool, QueueError>;

    /// Whether `key` already exists in the target table.
    async fn target_contains(&self, key: &JobKey) -> Result<bool, QueueError>;

    /// The job queue of this table's namespace.
    fn jobs(&self) -> Arc<dyn JobQueue>;
}
