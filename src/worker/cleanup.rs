//! Per-cycle queue cleanup and the shutdown purge of invalid jobs.

use tracing::{debug, info};

use crate::error::Result;
use crate::queue::{JobEntry, JobFilter, JobId, JobQueue, JobStatus, QueryableJob};
use crate::store::{ErrorRecord, LedgerStore};
use crate::worker::naming::{PrefixStripper, to_camel_case};
use crate::worker::reclaim::{StaleAction, handle_stale_reserved_jobs};

/// Transient infrastructure errors cleared from every queue without a trace.
pub const GENERIC_ERROR_PATTERNS: [&str; 7] = [
    "%Deadlock%",
    "%Lock wait timeout%",
    "%MaxRetryError%",
    "%KeyboardInterrupt%",
    "InternalError: (1205%",
    "%SIGTERM%",
    "%LostConnectionError%",
];

/// Counts from one namespace cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub generic_cleared: usize,
    pub autocleared: usize,
    pub stale_reclaimed: usize,
}

/// Clean one namespace's queue.
///
/// 1. Delete error rows matching [`GENERIC_ERROR_PATTERNS`].
/// 2. Copy error rows matching `autoclear_patterns` to the error log in one
///    transaction, then delete them from the queue.
/// 3. Mark stale reservations as errors.
///
/// Deletes re-apply the listing filter, so a row another worker re-reserved
/// in the meantime is left alone.
pub async fn clean_up_namespace(
    queue: &dyn JobQueue,
    ledger: &dyn LedgerStore,
    autoclear_patterns: &[String],
    stripper: &PrefixStripper,
    stale_timeout_hours: i64,
) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();

    let generic_filter =
        JobFilter::status(JobStatus::Error).with_error_like(GENERIC_ERROR_PATTERNS);
    let generic = queue.list_jobs(&generic_filter).await?;
    if !generic.is_empty() {
        let ids: Vec<JobId> = generic.iter().map(JobEntry::id).collect();
        report.generic_cleared = queue.delete_matching(&ids, &generic_filter).await?;
    }

    if !autoclear_patterns.is_empty() {
        let autoclear_filter = JobFilter::status(JobStatus::Error)
            .with_error_like(autoclear_patterns.iter().cloned());
        let matched = queue.list_jobs(&autoclear_filter).await?;
        if !matched.is_empty() {
            let records: Vec<ErrorRecord> = matched
                .iter()
                .map(|job| error_record(queue.namespace(), job, stripper))
                .collect();
            ledger.upsert_errors(&records).await?;

            let ids: Vec<JobId> = matched.iter().map(JobEntry::id).collect();
            report.autocleared = queue.delete_matching(&ids, &autoclear_filter).await?;
        }
    }

    report.stale_reclaimed =
        handle_stale_reserved_jobs(queue, stale_timeout_hours, StaleAction::Error)
            .await?
            .len();

    debug!(
        namespace = queue.namespace(),
        generic = report.generic_cleared,
        autocleared = report.autocleared,
        stale = report.stale_reclaimed,
        "Queue cleanup complete"
    );
    Ok(report)
}

/// Error-log record for a queue row of `namespace`.
fn error_record(namespace: &str, job: &JobEntry, stripper: &PrefixStripper) -> ErrorRecord {
    ErrorRecord {
        process_name: stripper.process_name(namespace, &job.table_name),
        key_fingerprint: job.key_hash.clone(),
        timestamp: job.timestamp,
        key: serde_json::Value::Object(job.key.clone()).to_string(),
        error_message: job.error_message.clone(),
        error_stack: job.error_stack.clone(),
        host: job.host.clone(),
        user: job.user.clone(),
        pid: job.pid,
    }
}

/// Remove queue rows of `job`'s table, in any status, whose key has left
/// the job source or is already present in the target table.
///
/// Scans every row of the table, so it is only run at shutdown.
pub async fn purge_invalid_jobs(queue: &dyn JobQueue, job: &dyn QueryableJob) -> Result<usize> {
    let rows = queue
        .list_jobs(&JobFilter::default().with_table(job.table_name()))
        .await?;
    if rows.is_empty() {
        return Ok(0);
    }

    let mut invalid = Vec::new();
    for row in &rows {
        if !job.key_source_contains(&row.key).await? || job.target_contains(&row.key).await? {
            invalid.push(row.id());
        }
    }

    let removed = if invalid.is_empty() {
        0
    } else {
        queue.delete_jobs(&invalid).await?
    };

    info!(
        table = %to_camel_case(job.table_name().trim_matches('`')),
        count = removed,
        "Invalid jobs removed"
    );
    Ok(removed)
}
